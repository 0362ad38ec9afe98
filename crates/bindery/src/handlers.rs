//! Reader/writer handlers produced by binding operators.

use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use crate::codegen::CompiledUnit;
use crate::declarative::{DeclarativeObject, DynamicScopeKey};
use crate::dynamic_scope::DynamicScope;
use crate::error::RuntimeError;
use crate::inversion::Inverter;
use crate::standard::{StandardInverter, StandardTracer};
use crate::tracing::Tracer;
use crate::vm::{self, Env, Value};

/// Computes the value of a bound attribute.
pub trait ReadHandler: fmt::Debug + Send + Sync {
    fn get(&self, owner: &Rc<DeclarativeObject>, name: &str) -> Result<Value, RuntimeError>;

    /// The unit this handler runs, for inspection.
    fn unit(&self) -> Option<&Arc<CompiledUnit>> {
        None
    }
}

/// Reacts to a write of a bound attribute.
pub trait WriteHandler: fmt::Debug + Send + Sync {
    fn set(&self, owner: &Rc<DeclarativeObject>, name: &str, value: Value)
    -> Result<(), RuntimeError>;

    fn unit(&self) -> Option<&Arc<CompiledUnit>> {
        None
    }
}

/// What one binding contributes to an attribute; either side may be absent.
#[derive(Debug, Clone, Default)]
pub struct HandlerPair {
    pub reader: Option<Arc<dyn ReadHandler>>,
    pub writer: Option<Arc<dyn WriteHandler>>,
}

impl HandlerPair {
    pub fn reader(reader: impl ReadHandler + 'static) -> Self {
        Self {
            reader: Some(Arc::new(reader)),
            writer: None,
        }
    }

    pub fn writer(writer: impl WriteHandler + 'static) -> Self {
        Self {
            reader: None,
            writer: Some(Arc::new(writer)),
        }
    }

    pub fn with_writer(mut self, writer: impl WriteHandler + 'static) -> Self {
        self.writer = Some(Arc::new(writer));
        self
    }
}

fn evaluate(
    unit: &Arc<CompiledUnit>,
    scope: DynamicScope,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    vm::run(unit, Env::dynamic(Rc::new(scope)), args)
}

/// Evaluates an expression unit in the owner's dynamic scope (`=`).
#[derive(Debug)]
pub struct StandardReadHandler {
    pub unit: Arc<CompiledUnit>,
    pub key: DynamicScopeKey,
}

impl ReadHandler for StandardReadHandler {
    fn get(&self, owner: &Rc<DeclarativeObject>, _name: &str) -> Result<Value, RuntimeError> {
        evaluate(&self.unit, DynamicScope::for_binding(owner, self.key)?, Vec::new())
    }

    fn unit(&self) -> Option<&Arc<CompiledUnit>> {
        Some(&self.unit)
    }
}

/// Evaluates a traced unit and subscribes the attribute to everything the
/// evaluation read (`<<`).
#[derive(Debug)]
pub struct StandardTracedReadHandler {
    pub unit: Arc<CompiledUnit>,
    pub key: DynamicScopeKey,
}

impl ReadHandler for StandardTracedReadHandler {
    fn get(&self, owner: &Rc<DeclarativeObject>, name: &str) -> Result<Value, RuntimeError> {
        let tracer = Rc::new(StandardTracer::default());
        let capability: Rc<dyn Tracer> = tracer.clone();
        let scope = DynamicScope::for_binding(owner, self.key)?.with_tracer(capability.clone());
        let value = evaluate(&self.unit, scope, vec![Value::Tracer(capability)])?;
        tracer.finalize(owner, name);
        Ok(value)
    }

    fn unit(&self) -> Option<&Arc<CompiledUnit>> {
        Some(&self.unit)
    }
}

/// Runs a statement block with the change record bound to `change` (`::`).
#[derive(Debug)]
pub struct StandardWriteHandler {
    pub unit: Arc<CompiledUnit>,
    pub key: DynamicScopeKey,
}

impl WriteHandler for StandardWriteHandler {
    fn set(
        &self,
        owner: &Rc<DeclarativeObject>,
        name: &str,
        value: Value,
    ) -> Result<(), RuntimeError> {
        let change = Value::record([
            ("type".into(), Value::str("update")),
            ("object".into(), Value::Object(owner.clone())),
            ("name".into(), Value::str(name)),
            ("value".into(), value),
        ]);
        let scope = DynamicScope::for_binding(owner, self.key)?.with_change(change);
        evaluate(&self.unit, scope, Vec::new()).map(drop)
    }

    fn unit(&self) -> Option<&Arc<CompiledUnit>> {
        Some(&self.unit)
    }
}

/// Writes the new value back through an inverted expression (`>>`).
#[derive(Debug)]
pub struct StandardInvertedWriteHandler {
    pub unit: Arc<CompiledUnit>,
    pub key: DynamicScopeKey,
}

impl WriteHandler for StandardInvertedWriteHandler {
    fn set(
        &self,
        owner: &Rc<DeclarativeObject>,
        _name: &str,
        value: Value,
    ) -> Result<(), RuntimeError> {
        let scope = Rc::new(DynamicScope::for_binding(owner, self.key)?);
        let inverter: Rc<dyn Inverter> = Rc::new(StandardInverter::new(scope.clone()));
        vm::run(&self.unit, Env::dynamic(scope), vec![Value::Inverter(inverter), value]).map(drop)
    }

    fn unit(&self) -> Option<&Arc<CompiledUnit>> {
        Some(&self.unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn handler_pairs_are_shareable_across_threads() {
        assert_send_sync::<HandlerPair>();
        assert_send_sync::<StandardTracedReadHandler>();
        assert_send_sync::<StandardInvertedWriteHandler>();
    }
}
