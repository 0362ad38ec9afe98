//! Methods of declarative objects.
//!
//! A [`DeclarativeFunction`] is the compiled, instance-independent form of a
//! `def` declared on a class. Reading it from an object yields a
//! [`BoundDeclarativeFunction`] whose calls resolve free names through that
//! object's dynamic scope.

use std::rc::{Rc, Weak};
use std::sync::Arc;

use crate::bytecode::Name;
use crate::codegen::CompiledUnit;
use crate::declarative::{DeclarativeObject, DynamicScopeKey};
use crate::dynamic_scope::DynamicScope;
use crate::error::{CompileError, RuntimeError};
use crate::operators::CompilationContext;
use crate::scope_rewriter::rewrite_function_body;
use crate::vm::{self, Env, Function, Value};

#[derive(Debug)]
pub struct DeclarativeFunction {
    name: Name,
    body: Arc<CompiledUnit>,
    /// Expression unit producing the positional defaults followed by the
    /// keyword-only ones.
    defaults: Arc<CompiledUnit>,
    positional_defaults: usize,
    kw_defaults: Vec<Name>,
    key: DynamicScopeKey,
}

impl DeclarativeFunction {
    pub fn compile(
        context: &CompilationContext,
        source_code: &str,
        line: u32,
    ) -> Result<Self, CompileError> {
        let definition = context.compiler().at_line(line).function_def(source_code)?;
        let body = rewrite_function_body(&definition.body, context.isa())?;
        log::debug!("compiled declarative function {}", definition.name);
        Ok(Self {
            name: definition.name,
            body,
            defaults: definition.defaults,
            positional_defaults: definition.positional_defaults as usize,
            kw_defaults: definition.kw_defaults,
            key: DynamicScopeKey::new(),
        })
    }

    pub fn name(&self) -> &Name {
        &self.name
    }

    pub fn key(&self) -> DynamicScopeKey {
        self.key
    }

    pub fn body(&self) -> &Arc<CompiledUnit> {
        &self.body
    }
}

/// A declarative function read from a specific object.
pub struct BoundDeclarativeFunction {
    function: Rc<DeclarativeFunction>,
    owner: Weak<DeclarativeObject>,
}

impl BoundDeclarativeFunction {
    pub fn new(function: Rc<DeclarativeFunction>, owner: Weak<DeclarativeObject>) -> Self {
        Self { function, owner }
    }

    pub fn name(&self) -> &Name {
        &self.function.name
    }

    pub fn call(
        &self,
        args: Vec<Value>,
        kwargs: Vec<(Name, Value)>,
    ) -> Result<Value, RuntimeError> {
        let function = &self.function;
        let owner = self.owner.upgrade().ok_or_else(|| {
            RuntimeError::missing_context(format!(
                "the object owning {}() has been dropped",
                function.name
            ))
        })?;
        let scope = DynamicScope::for_binding(&owner, function.key)?.without_super();
        let globals = scope.globals().clone();

        let mut defaults = vm::ops::collect(&vm::run(
            &function.defaults,
            Env::module(globals.clone()),
            Vec::new(),
        )?)?;
        let kw_values = defaults.split_off(function.positional_defaults.min(defaults.len()));

        Function {
            unit: function.body.clone(),
            globals,
            defaults,
            kw_defaults: function.kw_defaults.iter().cloned().zip(kw_values).collect(),
            closure: Vec::new(),
            names: None,
            scope: Some(Rc::new(scope)),
        }
        .call(args, kwargs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declarative::{ClassBuilder, Module};
    use crate::error::ErrorKind;
    use crate::{IsaRevision, vm::ops};

    fn widget(sources: &[&str]) -> (Rc<Module>, Rc<DeclarativeObject>) {
        let context = CompilationContext::new(IsaRevision::Classic.target());
        let module = Module::new("functions");
        module.set_global("offset", Value::Int(100));
        let mut builder =
            ClassBuilder::new(&context, &module, "Widget").attr("count", Value::Int(2));
        for (line, source) in sources.iter().enumerate() {
            builder = builder.function(source, line as u32 + 1).unwrap();
        }
        let object = builder.build().instantiate();
        (module, object)
    }

    fn call(
        object: &Rc<DeclarativeObject>,
        name: &str,
        args: Vec<Value>,
    ) -> Result<Value, RuntimeError> {
        let method = object.get_attr(name)?;
        vm::call(&method, args, Vec::new())
    }

    #[test]
    fn bodies_see_the_owner_and_module() {
        let (_module, object) = widget(&[
            "def scaled(factor, extra=1):\n    return count * factor + offset + extra\n",
        ]);
        assert_eq!(call(&object, "scaled", vec![Value::Int(3)]).unwrap(), Value::Int(107));
        object.set_attr("count", Value::Int(5)).unwrap();
        assert_eq!(
            call(&object, "scaled", vec![Value::Int(3), Value::Int(0)]).unwrap(),
            Value::Int(115)
        );
    }

    #[test]
    fn keyword_only_defaults_are_bound() {
        let (_module, object) = widget(&[
            "def label(*, prefix='n=', suffix=''):\n    return prefix + str(count) + suffix\n",
        ]);
        let method = object.get_attr("label").unwrap();
        let kwargs = vec![("suffix".into(), Value::str("!"))];
        let text = vm::call(&method, Vec::new(), kwargs).unwrap();
        assert_eq!(text, Value::str("n=2!"));
    }

    #[test]
    fn functions_write_through_self_and_call_each_other() {
        let (_module, object) = widget(&[
            "def bump():\n    self.count = double(count)\n",
            "def double(value):\n    return value * 2\n",
        ]);
        call(&object, "bump", Vec::new()).unwrap();
        assert_eq!(object.get_attr("count").unwrap(), Value::Int(4));
    }

    #[test]
    fn nested_lambdas_resolve_through_the_live_scope() {
        let (_module, object) = widget(&[
            "def adders():\n    return [lambda x: x + count for _ in range(2)]\n",
        ]);
        let adders = ops::collect(&call(&object, "adders", Vec::new()).unwrap()).unwrap();
        object.set_attr("count", Value::Int(10)).unwrap();
        let added = vm::call(&adders[0], vec![Value::Int(1)], Vec::new()).unwrap();
        assert_eq!(added, Value::Int(11));
    }

    #[test]
    fn super_is_refused() {
        let (_module, object) =
            widget(&["def parent_call():\n    return super().parent_call()\n"]);
        let error = call(&object, "parent_call", Vec::new()).unwrap_err();
        assert_eq!(
            error.kind,
            ErrorKind::Type("super() is not allowed in a declarative function".into())
        );
    }

    #[test]
    fn missing_context_is_reported() {
        let (module, object) = widget(&["def noop():\n    return None\n"]);
        let method = object.get_attr("noop").unwrap();
        drop(module);
        let error = vm::call(&method, Vec::new(), Vec::new()).unwrap_err();
        assert!(matches!(error.kind, ErrorKind::MissingContext(_)));

        let (_module, object) = widget(&["def noop():\n    return None\n"]);
        let method = object.get_attr("noop").unwrap();
        drop(object);
        let error = vm::call(&method, Vec::new(), Vec::new()).unwrap_err();
        assert!(matches!(error.kind, ErrorKind::MissingContext(_)));
    }
}
