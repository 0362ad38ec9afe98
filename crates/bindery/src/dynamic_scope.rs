//! Runtime name resolution for bindings and declarative functions.

use indexmap::IndexMap;
use std::cell::RefCell;
use std::rc::Rc;

use crate::bytecode::Name;
use crate::declarative::{DeclarativeObject, DynamicScopeKey};
use crate::error::RuntimeError;
use crate::tracing::Tracer;
use crate::vm::{Builtin, Namespace, Value, builtins};

/// Layered namespace a rewritten unit resolves its free names against.
///
/// Lookups try, in order: names stored during this evaluation, `super` (when
/// disabled), `self`, `change`, `nonlocals`, the binding's per-instance
/// storage, module globals, builtins, and finally the attributes of the owner
/// and its ancestors.
pub struct DynamicScope {
    owner: Rc<DeclarativeObject>,
    f_locals: Namespace,
    globals: Namespace,
    change: Option<Value>,
    tracer: Option<Rc<dyn Tracer>>,
    writes: RefCell<Option<IndexMap<Name, Value>>>,
    super_disabled: bool,
}

impl DynamicScope {
    pub fn new(owner: Rc<DeclarativeObject>, f_locals: Namespace, globals: Namespace) -> Self {
        Self {
            owner,
            f_locals,
            globals,
            change: None,
            tracer: None,
            writes: RefCell::new(None),
            super_disabled: false,
        }
    }

    /// Scope of the binding identified by `key` on `owner`.
    pub fn for_binding(
        owner: &Rc<DeclarativeObject>,
        key: DynamicScopeKey,
    ) -> Result<Self, RuntimeError> {
        let f_locals = owner.storage(key).ok_or_else(|| {
            RuntimeError::missing_context(format!(
                "{} object has no storage for scope key {key}",
                owner.class().name
            ))
        })?;
        Ok(Self::new(owner.clone(), f_locals, owner.globals()?))
    }

    pub fn with_change(mut self, change: Value) -> Self {
        self.change = Some(change);
        self
    }

    pub fn with_tracer(mut self, tracer: Rc<dyn Tracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    /// Makes `super` resolve to a callable that always fails.
    pub fn without_super(mut self) -> Self {
        self.super_disabled = true;
        self
    }

    pub fn owner(&self) -> &Rc<DeclarativeObject> {
        &self.owner
    }

    pub fn globals(&self) -> &Namespace {
        &self.globals
    }

    pub fn nonlocals(&self) -> Nonlocals {
        Nonlocals {
            owner: self.owner.clone(),
            tracer: self.tracer.clone(),
        }
    }

    pub fn get(&self, name: &str) -> Result<Value, RuntimeError> {
        if let Some(value) = self
            .writes
            .borrow()
            .as_ref()
            .and_then(|writes| writes.get(name))
        {
            return Ok(value.clone());
        }
        match (name, &self.change) {
            ("super", _) if self.super_disabled => {
                return Ok(Value::Builtin(Builtin::SuperDisallowed));
            }
            ("self", _) => return Ok(Value::Object(self.owner.clone())),
            ("change", Some(change)) => return Ok(change.clone()),
            ("nonlocals", _) => return Ok(Value::Nonlocals(Rc::new(self.nonlocals()))),
            _ => {}
        }
        if let Some(value) = self.f_locals.borrow().get(name) {
            return Ok(value.clone());
        }
        if let Some(value) = self.globals.borrow().get(name) {
            return Ok(value.clone());
        }
        if let Some(value) = builtins::lookup(name) {
            return Ok(value);
        }
        self.nonlocals()
            .resolve(name)?
            .ok_or_else(|| RuntimeError::scope_resolution(name))
    }

    pub fn set(&self, name: &str, value: Value) {
        self.writes
            .borrow_mut()
            .get_or_insert_with(IndexMap::new)
            .insert(name.into(), value);
    }

    pub fn delete(&self, name: &str) -> Result<(), RuntimeError> {
        self.writes
            .borrow_mut()
            .as_mut()
            .and_then(|writes| writes.shift_remove(name))
            .map(|_| ())
            .ok_or_else(|| RuntimeError::scope_resolution(name))
    }
}

/// Attribute view over a declarative object and its ancestors, as seen
/// through the `nonlocals` name.
pub struct Nonlocals {
    owner: Rc<DeclarativeObject>,
    tracer: Option<Rc<dyn Tracer>>,
}

impl Nonlocals {
    pub fn new(owner: Rc<DeclarativeObject>) -> Self {
        Self {
            owner,
            tracer: None,
        }
    }

    /// First object in the chain that answers `name`.
    fn resolve(&self, name: &str) -> Result<Option<Value>, RuntimeError> {
        for object in self.owner.lineage() {
            if let Some(value) = object.try_get_attr(name)? {
                if let Some(tracer) = &self.tracer {
                    tracer.dynamic_load(&Value::Object(object.clone()), name, &value)?;
                }
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    pub fn get_attr(&self, name: &str) -> Result<Value, RuntimeError> {
        self.resolve(name)?
            .ok_or_else(|| RuntimeError::attribute("nonlocals", name))
    }

    pub fn set_attr(&self, name: &str, value: Value) -> Result<(), RuntimeError> {
        match self.owner.lineage().find(|object| object.declares(name)) {
            Some(object) => object.set_attr(name, value),
            None => Err(RuntimeError::attribute("nonlocals", name)),
        }
    }

    /// `nonlocals(n)`: the same view starting `n` levels up the tree.
    pub fn call(&self, args: &[Value]) -> Result<Value, RuntimeError> {
        let [Value::Int(level)] = args else {
            return Err(RuntimeError::type_error(
                "nonlocals() takes a single integer argument",
            ));
        };
        let owner = usize::try_from(*level)
            .ok()
            .and_then(|level| self.owner.lineage().nth(level))
            .ok_or_else(|| {
                RuntimeError::value_error(format!("scope level {level} is out of range"))
            })?;
        Ok(Value::Nonlocals(Rc::new(Self {
            owner,
            tracer: self.tracer.clone(),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declarative::Module;
    use crate::error::ErrorKind;
    use crate::operators::CompilationContext;
    use crate::{ClassBuilder, IsaRevision};

    fn tree() -> (Rc<Module>, Rc<DeclarativeObject>, Rc<DeclarativeObject>) {
        let context = CompilationContext::new(IsaRevision::Compact.target());
        let module = Module::new("scopes");
        module.set_global("limit", Value::Int(10));
        let child = ClassBuilder::new(&context, &module, "Child")
            .attr("label", Value::str("child"))
            .build();
        let parent = ClassBuilder::new(&context, &module, "Parent")
            .attr("title", Value::str("parent"))
            .attr("label", Value::str("outer"))
            .child(child)
            .build();
        let root = parent.instantiate();
        let leaf = root.children()[0].clone();
        (module, root, leaf)
    }

    fn scope(owner: &Rc<DeclarativeObject>) -> DynamicScope {
        DynamicScope::new(owner.clone(), crate::vm::namespace(), owner.globals().unwrap())
    }

    #[test]
    fn lookup_order() {
        let (_module, root, leaf) = tree();
        let scope = scope(&leaf);
        assert_eq!(scope.get("label").unwrap(), Value::str("child"));
        assert_eq!(scope.get("title").unwrap(), Value::str("parent"));
        assert_eq!(scope.get("limit").unwrap(), Value::Int(10));
        assert!(matches!(scope.get("len").unwrap(), Value::Builtin(Builtin::Len)));
        assert!(scope.get("self").unwrap().is_same(&Value::Object(leaf.clone())));

        scope.f_locals.borrow_mut().insert("limit".into(), Value::Int(3));
        assert_eq!(scope.get("limit").unwrap(), Value::Int(3));
        scope.set("limit", Value::Int(4));
        assert_eq!(scope.get("limit").unwrap(), Value::Int(4));
        scope.delete("limit").unwrap();
        assert_eq!(scope.get("limit").unwrap(), Value::Int(3));

        let error = scope.get("missing").unwrap_err();
        assert_eq!(error.kind, ErrorKind::ScopeResolution { name: "missing".into() });
        assert!(scope.delete("missing").is_err());
        drop(root);
    }

    #[test]
    fn change_and_super_are_opt_in() {
        let (_module, root, _leaf) = tree();
        assert!(scope(&root).get("change").is_err());
        let notified = scope(&root).with_change(Value::Int(1));
        assert_eq!(notified.get("change").unwrap(), Value::Int(1));
        assert!(scope(&root).get("super").is_err());
        assert!(matches!(
            scope(&root).without_super().get("super").unwrap(),
            Value::Builtin(Builtin::SuperDisallowed)
        ));
    }

    #[test]
    fn nonlocals_write_to_the_declaring_ancestor() {
        let (_module, root, leaf) = tree();
        let nonlocals = Nonlocals::new(leaf.clone());
        nonlocals.set_attr("title", Value::str("renamed")).unwrap();
        assert_eq!(root.get_attr("title").unwrap(), Value::str("renamed"));
        assert!(nonlocals.set_attr("unknown", Value::None).unwrap_err().is_attribute_error());

        let Value::Nonlocals(up) = nonlocals.call(&[Value::Int(1)]).unwrap() else {
            panic!("expected a nonlocals view");
        };
        assert_eq!(up.get_attr("label").unwrap(), Value::str("outer"));
        assert!(nonlocals.call(&[Value::Int(2)]).is_err());
    }

    #[test]
    fn ancestor_reads_are_reported_to_the_tracer() {
        #[derive(Default)]
        struct Loads(RefCell<Vec<String>>);
        impl Tracer for Loads {
            fn dynamic_load(
                &self,
                owner: &Value,
                attr: &str,
                value: &Value,
            ) -> Result<(), RuntimeError> {
                let load = format!("{} {attr} {}", owner.repr(), value.repr());
                self.0.borrow_mut().push(load);
                Ok(())
            }
        }
        let (_module, _root, leaf) = tree();
        let loads = Rc::new(Loads::default());
        let scope = scope(&leaf).with_tracer(loads.clone());
        scope.get("title").unwrap();
        scope.get("limit").unwrap();
        assert_eq!(*loads.0.borrow(), vec!["<Parent object> title 'parent'".to_owned()]);
    }
}
