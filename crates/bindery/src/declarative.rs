//! Minimal declarative object model consuming compiled bindings.
//!
//! A [`DeclarativeClass`] is built once from attribute declarations, binding
//! sources and declarative functions. Every [`DeclarativeObject`] instantiated
//! from it shares the compiled handlers and owns its children; a child only
//! keeps a weak reference back to its parent.

use indexmap::IndexMap;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use ulid::Ulid;

use crate::bytecode::Name;
use crate::declarative_function::{BoundDeclarativeFunction, DeclarativeFunction};
use crate::error::{CompileError, Error, RuntimeError};
use crate::handlers::{HandlerPair, ReadHandler};
use crate::operators::CompilationContext;
use crate::vm::{self, Env, Namespace, Value, namespace};

/// Identifies one binding site; instances keep a storage namespace per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DynamicScopeKey(Ulid);

impl DynamicScopeKey {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for DynamicScopeKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DynamicScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Global namespace shared by the classes defined in one source module.
pub struct Module {
    pub name: Name,
    globals: Namespace,
}

impl Module {
    pub fn new(name: impl Into<Name>) -> Rc<Self> {
        Rc::new(Self {
            name: name.into(),
            globals: namespace(),
        })
    }

    pub fn globals(&self) -> &Namespace {
        &self.globals
    }

    pub fn set_global(&self, name: impl Into<Name>, value: Value) {
        self.globals.borrow_mut().insert(name.into(), value);
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        self.globals.borrow().get(name).cloned()
    }

    /// Runs statements in the module namespace.
    pub fn exec(&self, context: &CompilationContext, source_code: &str) -> Result<(), Error> {
        let unit = context.compiler().block(source_code, &self.name)?;
        vm::run(&unit, Env::module(self.globals.clone()), Vec::new())?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrKind {
    Attr,
    /// Write-only; every write notifies.
    Event,
    /// Read-only after construction.
    Constant,
}

struct AttrDecl {
    kind: AttrKind,
    default: Value,
}

struct Binding {
    operator: Name,
    handlers: HandlerPair,
    key: DynamicScopeKey,
}

pub struct DeclarativeClass {
    pub name: Name,
    module: Weak<Module>,
    attrs: IndexMap<Name, AttrDecl>,
    bindings: IndexMap<Name, Binding>,
    functions: IndexMap<Name, Rc<DeclarativeFunction>>,
    children: Vec<Rc<DeclarativeClass>>,
}

impl DeclarativeClass {
    pub fn attr_kind(&self, name: &str) -> Option<AttrKind> {
        self.attrs.get(name).map(|decl| decl.kind)
    }

    pub fn attr_names(&self) -> impl Iterator<Item = &Name> {
        self.attrs.keys()
    }

    /// Operator symbol bound to `name`, if any.
    pub fn binding_operator(&self, name: &str) -> Option<&str> {
        self.bindings.get(name).map(|binding| &*binding.operator)
    }

    /// Every scope key an instance needs storage for.
    pub fn scope_keys(&self) -> impl Iterator<Item = DynamicScopeKey> + '_ {
        self.bindings
            .values()
            .map(|binding| binding.key)
            .chain(self.functions.values().map(|function| function.key()))
    }

    pub fn instantiate(self: &Rc<Self>) -> Rc<DeclarativeObject> {
        let object = Rc::new_cyclic(|this| DeclarativeObject {
            this: this.clone(),
            class: self.clone(),
            parent: RefCell::new(Weak::new()),
            children: RefCell::new(Vec::new()),
            values: RefCell::new(IndexMap::new()),
            storage: self.scope_keys().map(|key| (key, namespace())).collect(),
            observers: RefCell::new(FxHashMap::default()),
            subscriptions: RefCell::new(FxHashMap::default()),
            evaluating: RefCell::new(FxHashSet::default()),
        });
        let children = self
            .children
            .iter()
            .map(|class| {
                let child = class.instantiate();
                *child.parent.borrow_mut() = Rc::downgrade(&object);
                child
            })
            .collect();
        *object.children.borrow_mut() = children;
        log::debug!("instantiated {}", self.name);
        object
    }
}

/// Incrementally defines a [`DeclarativeClass`]. Binding sources are
/// compiled as they are added, so a bad binding is reported at its own line.
pub struct ClassBuilder<'c> {
    context: &'c CompilationContext,
    class: DeclarativeClass,
}

impl<'c> ClassBuilder<'c> {
    pub fn new(
        context: &'c CompilationContext,
        module: &Rc<Module>,
        name: impl Into<Name>,
    ) -> Self {
        Self {
            context,
            class: DeclarativeClass {
                name: name.into(),
                module: Rc::downgrade(module),
                attrs: IndexMap::new(),
                bindings: IndexMap::new(),
                functions: IndexMap::new(),
                children: Vec::new(),
            },
        }
    }

    fn declare(mut self, name: impl Into<Name>, kind: AttrKind, default: Value) -> Self {
        self.class.attrs.insert(name.into(), AttrDecl { kind, default });
        self
    }

    pub fn attr(self, name: impl Into<Name>, default: Value) -> Self {
        self.declare(name, AttrKind::Attr, default)
    }

    pub fn event(self, name: impl Into<Name>) -> Self {
        self.declare(name, AttrKind::Event, Value::None)
    }

    pub fn constant(self, name: impl Into<Name>, value: Value) -> Self {
        self.declare(name, AttrKind::Constant, value)
    }

    /// Compiles `source_code` under the operator `symbol` and binds the
    /// resulting handlers to the declared attribute `attr`.
    pub fn bind(
        mut self,
        attr: &str,
        symbol: &str,
        source_code: &str,
        line: u32,
    ) -> Result<Self, CompileError> {
        let Some(kind) = self.class.attr_kind(attr) else {
            return Err(CompileError::UnsupportedConstruct(format!(
                "'{attr}' is not a declared attribute of {}",
                self.class.name
            )));
        };
        let (handlers, key) = self.context.compile_binding(symbol, source_code, attr, line)?;
        if handlers.reader.is_some() && kind == AttrKind::Event {
            return Err(CompileError::UnsupportedConstruct(format!(
                "cannot bind a reader to event '{attr}' with '{symbol}'"
            )));
        }
        if handlers.writer.is_some() && kind == AttrKind::Constant {
            return Err(CompileError::UnsupportedConstruct(format!(
                "cannot bind a writer to constant '{attr}' with '{symbol}'"
            )));
        }
        self.class.bindings.insert(
            attr.into(),
            Binding {
                operator: symbol.into(),
                handlers,
                key,
            },
        );
        Ok(self)
    }

    /// Adds a declarative function from the source of a single `def`.
    pub fn function(mut self, source_code: &str, line: u32) -> Result<Self, CompileError> {
        let function = DeclarativeFunction::compile(self.context, source_code, line)?;
        self.class
            .functions
            .insert(function.name().clone(), Rc::new(function));
        Ok(self)
    }

    pub fn child(mut self, class: Rc<DeclarativeClass>) -> Self {
        self.class.children.push(class);
        self
    }

    pub fn build(self) -> Rc<DeclarativeClass> {
        log::debug!(
            "defined {} with {} bindings",
            self.class.name,
            self.class.bindings.len()
        );
        Rc::new(self.class)
    }
}

/// Receives attribute change records.
pub trait Observer {
    fn notify(&self, change: &Value) -> Result<(), RuntimeError>;

    /// Dead observers are dropped at the next notification.
    fn is_alive(&self) -> bool {
        true
    }
}

pub struct DeclarativeObject {
    this: Weak<DeclarativeObject>,
    class: Rc<DeclarativeClass>,
    parent: RefCell<Weak<DeclarativeObject>>,
    children: RefCell<Vec<Rc<DeclarativeObject>>>,
    values: RefCell<IndexMap<Name, Value>>,
    storage: FxHashMap<DynamicScopeKey, Namespace>,
    observers: RefCell<FxHashMap<Name, Vec<Rc<dyn Observer>>>>,
    subscriptions: RefCell<FxHashMap<Name, Rc<Cell<bool>>>>,
    /// Attributes whose reader is currently running.
    evaluating: RefCell<FxHashSet<Name>>,
}

impl DeclarativeObject {
    pub fn class(&self) -> &Rc<DeclarativeClass> {
        &self.class
    }

    fn rc(&self) -> Result<Rc<Self>, RuntimeError> {
        self.this
            .upgrade()
            .ok_or_else(|| RuntimeError::missing_context("object is being dropped"))
    }

    pub fn parent(&self) -> Option<Rc<DeclarativeObject>> {
        self.parent.borrow().upgrade()
    }

    pub fn children(&self) -> Vec<Rc<DeclarativeObject>> {
        self.children.borrow().clone()
    }

    /// This object followed by its ancestors, nearest first.
    pub fn lineage(self: &Rc<Self>) -> impl Iterator<Item = Rc<DeclarativeObject>> + use<> {
        std::iter::successors(Some(self.clone()), |object| object.parent())
    }

    pub fn globals(&self) -> Result<Namespace, RuntimeError> {
        self.class
            .module
            .upgrade()
            .map(|module| module.globals.clone())
            .ok_or_else(|| {
                RuntimeError::missing_context(format!(
                    "the module defining {} has been dropped",
                    self.class.name
                ))
            })
    }

    /// Per-instance storage of the binding site `key`.
    pub fn storage(&self, key: DynamicScopeKey) -> Option<Namespace> {
        self.storage.get(&key).cloned()
    }

    /// Whether `name` is a declared attribute (and thus writable through
    /// `nonlocals`).
    pub fn declares(&self, name: &str) -> bool {
        self.class.attrs.contains_key(name)
    }

    pub fn get_attr(&self, name: &str) -> Result<Value, RuntimeError> {
        self.try_get_attr(name)?
            .ok_or_else(|| RuntimeError::attribute(self.class.name.to_string(), name))
    }

    /// `Ok(None)` when the object has no attribute `name` at all.
    pub fn try_get_attr(&self, name: &str) -> Result<Option<Value>, RuntimeError> {
        if let Some(decl) = self.class.attrs.get(name) {
            if decl.kind == AttrKind::Event {
                return Err(RuntimeError::type_error(format!(
                    "event '{name}' of {} cannot be read",
                    self.class.name
                )));
            }
            if let Some(value) = self.values.borrow().get(name) {
                return Ok(Some(value.clone()));
            }
            let reader = self
                .class
                .bindings
                .get(name)
                .and_then(|binding| binding.handlers.reader.clone());
            let value = match reader {
                Some(reader) => {
                    let value = self.evaluate(&reader, name)?;
                    self.values.borrow_mut().insert(name.into(), value.clone());
                    value
                }
                None => decl.default.clone(),
            };
            return Ok(Some(value));
        }
        if let Some(function) = self.class.functions.get(name) {
            let bound = BoundDeclarativeFunction::new(function.clone(), self.this.clone());
            return Ok(Some(Value::BoundFunction(Rc::new(bound))));
        }
        Ok(match name {
            "parent" => Some(self.parent().map_or(Value::None, Value::Object)),
            "children" => Some(Value::list(
                self.children().into_iter().map(Value::Object).collect(),
            )),
            _ => None,
        })
    }

    pub fn set_attr(&self, name: &str, value: Value) -> Result<(), RuntimeError> {
        let Some(decl) = self.class.attrs.get(name) else {
            return Err(RuntimeError::attribute(self.class.name.to_string(), name));
        };
        let this = Value::Object(self.rc()?);
        let change = match decl.kind {
            AttrKind::Constant => {
                return Err(RuntimeError::type_error(format!(
                    "constant '{name}' of {} cannot be written",
                    self.class.name
                )));
            }
            AttrKind::Event => Value::record([
                ("type".into(), Value::str("event")),
                ("object".into(), this),
                ("name".into(), Value::str(name)),
                ("value".into(), value.clone()),
            ]),
            AttrKind::Attr => {
                let old = self
                    .values
                    .borrow_mut()
                    .insert(name.into(), value.clone())
                    .unwrap_or_else(|| decl.default.clone());
                if old == value {
                    return Ok(());
                }
                Value::record([
                    ("type".into(), Value::str("update")),
                    ("object".into(), this),
                    ("name".into(), Value::str(name)),
                    ("oldvalue".into(), old),
                    ("value".into(), value.clone()),
                ])
            }
        };
        self.notify(name, &change)?;
        let writer = self
            .class
            .bindings
            .get(name)
            .and_then(|binding| binding.handlers.writer.clone());
        if let Some(writer) = writer {
            writer.set(&self.rc()?, name, value)?;
        }
        Ok(())
    }

    /// Registers `observer` for writes to `name`, dropping dead ones first
    /// so renewed subscriptions do not pile up between notifications.
    pub fn observe(&self, name: &str, observer: Rc<dyn Observer>) {
        let mut observers = self.observers.borrow_mut();
        let list = observers.entry(name.into()).or_default();
        list.retain(|observer| observer.is_alive());
        list.push(observer);
    }

    /// Observers registered for `name`, including dead ones not yet pruned.
    pub fn observer_count(&self, name: &str) -> usize {
        self.observers.borrow().get(name).map_or(0, Vec::len)
    }

    fn notify(&self, name: &str, change: &Value) -> Result<(), RuntimeError> {
        let live: Vec<Rc<dyn Observer>> = {
            let mut observers = self.observers.borrow_mut();
            let Some(list) = observers.get_mut(name) else {
                return Ok(());
            };
            list.retain(|observer| observer.is_alive());
            list.clone()
        };
        for observer in live {
            observer.notify(change)?;
        }
        Ok(())
    }

    /// Kills the previous subscription of `name` and returns the liveness
    /// flag of the next one.
    pub fn renew_subscription(&self, name: &str) -> Rc<Cell<bool>> {
        let alive = Rc::new(Cell::new(true));
        if let Some(previous) = self
            .subscriptions
            .borrow_mut()
            .insert(name.into(), alive.clone())
        {
            previous.set(false);
        }
        alive
    }

    /// Runs the reader of `name`, refusing to re-enter one that is already
    /// running on this object.
    fn evaluate(&self, reader: &Arc<dyn ReadHandler>, name: &str) -> Result<Value, RuntimeError> {
        let owner = self.rc()?;
        if !self.evaluating.borrow_mut().insert(name.into()) {
            return Err(RuntimeError::value_error(format!(
                "binding of '{name}' on {} depends on itself",
                self.class.name
            )));
        }
        let result = reader.get(&owner, name);
        self.evaluating.borrow_mut().remove(name);
        result
    }

    /// Re-runs the reader bound to `name` and assigns the result.
    pub fn reevaluate(&self, name: &str) -> Result<(), RuntimeError> {
        let reader = self
            .class
            .bindings
            .get(name)
            .and_then(|binding| binding.handlers.reader.clone());
        let Some(reader) = reader else {
            return Ok(());
        };
        let value = self.evaluate(&reader, name)?;
        log::debug!("re-evaluated {}.{name}", self.class.name);
        self.set_attr(name, value)
    }

    /// Current values of every readable attribute, bound ones included.
    pub fn snapshot(&self) -> Result<Vec<(Name, Value)>, RuntimeError> {
        self.class
            .attrs
            .iter()
            .filter(|(_, decl)| decl.kind != AttrKind::Event)
            .map(|(name, _)| Ok((name.clone(), self.get_attr(name)?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IsaRevision;
    use crate::error::ErrorKind;

    struct Counter(Cell<usize>);

    impl Observer for Counter {
        fn notify(&self, _change: &Value) -> Result<(), RuntimeError> {
            self.0.set(self.0.get() + 1);
            Ok(())
        }
    }

    fn context() -> CompilationContext {
        CompilationContext::new(IsaRevision::Compact.target())
    }

    #[test]
    fn keys_are_unique_per_binding_site() {
        let context = context();
        let module = Module::new("keys");
        let class = ClassBuilder::new(&context, &module, "Widget")
            .attr("a", Value::Int(0))
            .attr("b", Value::Int(0))
            .bind("a", "=", "1", 1)
            .unwrap()
            .bind("b", "=", "2", 2)
            .unwrap()
            .build();
        let keys: Vec<_> = class.scope_keys().collect();
        assert_eq!(keys.len(), 2);
        assert_ne!(keys[0], keys[1]);
        let object = class.instantiate();
        assert!(keys.iter().all(|key| object.storage(*key).is_some()));
        assert!(object.storage(DynamicScopeKey::new()).is_none());
    }

    #[test]
    fn writes_notify_only_on_change() {
        let context = context();
        let module = Module::new("notify");
        let class = ClassBuilder::new(&context, &module, "Widget")
            .attr("count", Value::Int(0))
            .event("clicked")
            .constant("kind", Value::str("button"))
            .build();
        let object = class.instantiate();
        let counter = Rc::new(Counter(Cell::new(0)));
        object.observe("count", counter.clone());
        object.observe("clicked", counter.clone());

        object.set_attr("count", Value::Int(1)).unwrap();
        object.set_attr("count", Value::Int(1)).unwrap();
        object.set_attr("clicked", Value::None).unwrap();
        object.set_attr("clicked", Value::None).unwrap();
        assert_eq!(counter.0.get(), 3);

        assert!(matches!(
            object.set_attr("kind", Value::None).unwrap_err().kind,
            ErrorKind::Type(_)
        ));
        assert!(object.get_attr("clicked").is_err());
        assert!(object.get_attr("missing").unwrap_err().is_attribute_error());
        assert_eq!(object.get_attr("kind").unwrap(), Value::str("button"));
    }

    #[test]
    fn bound_readers_are_cached() {
        let context = context();
        let module = Module::new("cache");
        module.set_global("base", Value::Int(40));
        let class = ClassBuilder::new(&context, &module, "Widget")
            .attr("answer", Value::None)
            .bind("answer", "=", "base + 2", 1)
            .unwrap()
            .build();
        let object = class.instantiate();
        assert_eq!(object.get_attr("answer").unwrap(), Value::Int(42));
        module.set_global("base", Value::Int(0));
        assert_eq!(object.get_attr("answer").unwrap(), Value::Int(42));
    }

    #[test]
    fn binding_checks_the_attribute() {
        let context = context();
        let module = Module::new("checks");
        let builder = || {
            ClassBuilder::new(&context, &module, "Widget")
                .event("clicked")
                .constant("kind", Value::None)
        };
        assert!(matches!(
            builder().bind("missing", "=", "1", 1),
            Err(CompileError::UnsupportedConstruct(_))
        ));
        assert!(builder().bind("clicked", "=", "1", 1).is_err());
        assert!(builder().bind("clicked", "::", "print(change)", 1).is_ok());
        assert!(builder().bind("kind", ">>", "other", 1).is_err());
        assert!(matches!(
            builder().bind("kind", "=>", "1", 1),
            Err(CompileError::UnknownOperator(_))
        ));
    }

    #[test]
    fn self_dependent_bindings_are_errors() {
        let context = context();
        let module = Module::new("cycles");
        let object = ClassBuilder::new(&context, &module, "Widget")
            .attr("x", Value::Int(0))
            .bind("x", "<<", "x + 1", 1)
            .unwrap()
            .build()
            .instantiate();
        let error = object.get_attr("x").unwrap_err();
        assert_eq!(
            error.kind,
            ErrorKind::Value("binding of 'x' on Widget depends on itself".into())
        );
        // The failed read leaves nothing behind.
        assert!(object.get_attr("x").is_err());
        object.set_attr("x", Value::Int(5)).unwrap();
        assert_eq!(object.get_attr("x").unwrap(), Value::Int(5));
    }

    #[test]
    fn mutually_dependent_bindings_are_errors() {
        let context = context();
        let module = Module::new("cycles");
        let object = ClassBuilder::new(&context, &module, "Pair")
            .attr("a", Value::Int(0))
            .attr("b", Value::Int(0))
            .bind("a", "=", "b + 1", 1)
            .unwrap()
            .bind("b", "=", "a + 1", 2)
            .unwrap()
            .build()
            .instantiate();
        let error = object.get_attr("a").unwrap_err();
        assert_eq!(
            error.kind,
            ErrorKind::Value("binding of 'a' on Pair depends on itself".into())
        );
    }

    #[test]
    fn renewed_subscriptions_do_not_accumulate() {
        let context = context();
        let module = Module::new("subscriptions");
        let object = ClassBuilder::new(&context, &module, "Sum")
            .attr("a", Value::Int(1))
            .attr("b", Value::Int(0))
            .attr("y", Value::None)
            .bind("y", "<<", "a + b", 1)
            .unwrap()
            .build()
            .instantiate();
        assert_eq!(object.get_attr("y").unwrap(), Value::Int(1));
        for n in 1..=1000 {
            object.set_attr("b", Value::Int(n)).unwrap();
        }
        assert_eq!(object.get_attr("y").unwrap(), Value::Int(1001));
        assert_eq!(object.observer_count("a"), 1);
        assert_eq!(object.observer_count("b"), 1);
        object.set_attr("a", Value::Int(2)).unwrap();
        assert_eq!(object.get_attr("y").unwrap(), Value::Int(1002));
    }

    #[test]
    fn children_point_back_without_owning() {
        let context = context();
        let module = Module::new("tree");
        let leaf = ClassBuilder::new(&context, &module, "Leaf").build();
        let root = ClassBuilder::new(&context, &module, "Root").child(leaf).build();
        let root = root.instantiate();
        let child = root.children()[0].clone();
        assert!(Rc::ptr_eq(&child.parent().unwrap(), &root));
        assert_eq!(child.lineage().count(), 2);
        drop(root);
        assert!(child.parent().is_none());
    }

    #[test]
    fn module_exec_and_dropped_modules() {
        let context = context();
        let module = Module::new("exec");
        module.exec(&context, "scale = 3\ndef triple(x):\n    return x * scale\n").unwrap();
        assert_eq!(module.global("scale"), Some(Value::Int(3)));

        let class = ClassBuilder::new(&context, &module, "Widget").build();
        let object = class.instantiate();
        drop(module);
        assert!(matches!(
            object.globals().unwrap_err().kind,
            ErrorKind::MissingContext(_)
        ));
    }
}
