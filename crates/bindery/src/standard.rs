//! Tracer and inverter used by the default operators.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::bytecode::Name;
use crate::declarative::{DeclarativeObject, Observer};
use crate::dynamic_scope::DynamicScope;
use crate::error::RuntimeError;
use crate::inversion::Inverter;
use crate::tracing::Tracer;
use crate::vm::{Builtin, Value, ops};

/// Records which declarative attributes an evaluation read.
#[derive(Default)]
pub struct StandardTracer {
    reads: RefCell<Vec<(Rc<DeclarativeObject>, Name)>>,
}

impl StandardTracer {
    fn record(&self, object: &Value, attr: &str) {
        let Value::Object(object) = object else {
            return;
        };
        if !object.declares(attr) {
            return;
        }
        let mut reads = self.reads.borrow_mut();
        let seen = reads
            .iter()
            .any(|(seen, name)| Rc::ptr_eq(seen, object) && &**name == attr);
        if !seen {
            reads.push((object.clone(), attr.into()));
        }
    }

    /// `(object, attribute)` pairs read so far, in first-read order.
    pub fn reads(&self) -> Vec<(Rc<DeclarativeObject>, Name)> {
        self.reads.borrow().clone()
    }

    /// Subscribes `owner.name` to every recorded read, replacing the
    /// subscription installed by the previous evaluation.
    pub fn finalize(&self, owner: &Rc<DeclarativeObject>, name: &str) {
        let observer: Rc<dyn Observer> = Rc::new(SubscriptionObserver {
            owner: Rc::downgrade(owner),
            name: name.into(),
            alive: owner.renew_subscription(name),
        });
        let reads = self.reads.borrow();
        for (object, attr) in reads.iter() {
            object.observe(attr, observer.clone());
        }
        log::debug!(
            "{}.{name} subscribed to {} attributes",
            owner.class().name,
            reads.len()
        );
    }
}

impl Tracer for StandardTracer {
    fn dynamic_load(&self, owner: &Value, attr: &str, _value: &Value) -> Result<(), RuntimeError> {
        self.record(owner, attr);
        Ok(())
    }

    fn load_attr(&self, object: &Value, attr: &str) -> Result<(), RuntimeError> {
        self.record(object, attr);
        Ok(())
    }

    fn call(
        &self,
        func: &Value,
        args: &[Value],
        _kwargs: &[(Name, Value)],
    ) -> Result<(), RuntimeError> {
        if let (Value::Builtin(Builtin::GetAttr), [object, Value::Str(attr), ..]) = (func, args) {
            self.record(object, attr);
        }
        Ok(())
    }
}

/// Re-evaluates a subscribed attribute when one of its dependencies changes.
struct SubscriptionObserver {
    owner: Weak<DeclarativeObject>,
    name: Name,
    alive: Rc<Cell<bool>>,
}

impl Observer for SubscriptionObserver {
    fn notify(&self, _change: &Value) -> Result<(), RuntimeError> {
        if !self.alive.get() {
            return Ok(());
        }
        match self.owner.upgrade() {
            Some(owner) => {
                log::debug!("dependency of {}.{} changed", owner.class().name, self.name);
                owner.reevaluate(&self.name)
            }
            None => Ok(()),
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.get() && self.owner.strong_count() > 0
    }
}

/// Performs the write form of an inverted expression.
pub struct StandardInverter {
    scope: Rc<DynamicScope>,
}

impl StandardInverter {
    pub fn new(scope: Rc<DynamicScope>) -> Self {
        Self { scope }
    }
}

impl Inverter for StandardInverter {
    fn load_name(&self, name: &str, value: Value) -> Result<(), RuntimeError> {
        self.scope.nonlocals().set_attr(name, value)
    }

    fn load_attr(&self, object: &Value, attr: &str, value: Value) -> Result<(), RuntimeError> {
        ops::set_attribute(object, attr, value)
    }

    fn call(&self, func: &Value, args: &[Value], value: Value) -> Result<(), RuntimeError> {
        match (func, args) {
            (Value::Builtin(Builtin::GetAttr), [object, Value::Str(attr), ..]) => {
                ops::set_attribute(object, attr, value)
            }
            _ => Err(RuntimeError::inversion_refused("call")),
        }
    }

    fn subscript_load(&self, object: &Value, index: &Value, value: Value) -> Result<(), RuntimeError> {
        ops::set_item(object, index, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declarative::{ClassBuilder, Module};
    use crate::operators::CompilationContext;
    use crate::vm::namespace;
    use crate::{ErrorKind, IsaRevision};

    fn object() -> (Rc<Module>, Rc<DeclarativeObject>) {
        let context = CompilationContext::new(IsaRevision::Classic.target());
        let module = Module::new("standard");
        let class = ClassBuilder::new(&context, &module, "Model")
            .attr("value", Value::Int(0))
            .attr("items", Value::list(vec![Value::Int(1), Value::Int(2)]))
            .build();
        let object = class.instantiate();
        (module, object)
    }

    #[test]
    fn tracer_records_declared_attributes_once() {
        let (_module, object) = object();
        let tracer = StandardTracer::default();
        let target = Value::Object(object.clone());
        tracer.load_attr(&target, "value").unwrap();
        tracer.dynamic_load(&target, "value", &Value::Int(0)).unwrap();
        tracer
            .call(
                &Value::Builtin(Builtin::GetAttr),
                &[target.clone(), Value::str("items")],
                &[],
            )
            .unwrap();
        tracer.load_attr(&target, "parent").unwrap();
        tracer.load_attr(&Value::Int(1), "real").unwrap();
        let reads: Vec<String> = tracer
            .reads()
            .iter()
            .map(|(_, name)| name.to_string())
            .collect();
        assert_eq!(reads, vec!["value", "items"]);
    }

    #[test]
    fn inverter_writes_through_each_form() {
        let (_module, object) = object();
        let globals = object.globals().unwrap();
        let scope = Rc::new(DynamicScope::new(object.clone(), namespace(), globals));
        let inverter = StandardInverter::new(scope);
        let target = Value::Object(object.clone());

        inverter.load_name("value", Value::Int(1)).unwrap();
        assert_eq!(object.get_attr("value").unwrap(), Value::Int(1));
        inverter.load_attr(&target, "value", Value::Int(2)).unwrap();
        assert_eq!(object.get_attr("value").unwrap(), Value::Int(2));
        inverter
            .call(&Value::Builtin(Builtin::GetAttr), &[target, Value::str("value")], Value::Int(3))
            .unwrap();
        assert_eq!(object.get_attr("value").unwrap(), Value::Int(3));

        let items = object.get_attr("items").unwrap();
        inverter.subscript_load(&items, &Value::Int(0), Value::Int(9)).unwrap();
        assert_eq!(items.repr(), "[9, 2]");

        let refused = inverter
            .call(&Value::Builtin(Builtin::Len), &[Value::Int(1)], Value::None)
            .unwrap_err();
        assert_eq!(refused.kind, ErrorKind::InversionRefused { operation: "call" });
    }
}
