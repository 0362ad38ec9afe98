use indexmap::IndexMap;
use ordered_float::OrderedFloat;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use super::builtins::Builtin;
use crate::bytecode::{Constant, Name};
use crate::codegen::CompiledUnit;
use crate::declarative::DeclarativeObject;
use crate::declarative_function::BoundDeclarativeFunction;
use crate::dynamic_scope::{DynamicScope, Nonlocals};
use crate::error::RuntimeError;
use crate::inversion::{Inverter, InverterHook};
use crate::tracing::{Tracer, TracerHook};

pub type Namespace = Rc<RefCell<IndexMap<Name, Value>>>;
/// Closure cell; empty until the owning frame first stores into it.
pub type Cell = Rc<RefCell<Option<Value>>>;
pub type Dict = Rc<RefCell<IndexMap<DictKey, Value>>>;

pub fn namespace() -> Namespace {
    Rc::new(RefCell::new(IndexMap::new()))
}

#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(OrderedFloat<f64>),
    Str(Rc<str>),
    Tuple(Rc<[Value]>),
    List(Rc<RefCell<Vec<Value>>>),
    Dict(Dict),
    /// Plain attribute bag, as created by `namespace(**kwargs)`.
    Record(Namespace),
    Function(Rc<Function>),
    Builtin(Builtin),
    Method(Rc<Method>),
    Object(Rc<DeclarativeObject>),
    BoundFunction(Rc<BoundDeclarativeFunction>),
    Nonlocals(Rc<Nonlocals>),
    Tracer(Rc<dyn Tracer>),
    Inverter(Rc<dyn Inverter>),
    Iterator(Rc<RefCell<IterState>>),
    Code(Arc<CompiledUnit>),
}

pub struct Function {
    pub unit: Arc<CompiledUnit>,
    pub globals: Namespace,
    pub defaults: Vec<Value>,
    pub kw_defaults: Vec<(Name, Value)>,
    pub closure: Vec<Cell>,
    /// Creator's name namespace, kept for units that share its frame.
    pub names: Option<Namespace>,
    /// Creator's dynamic scope, kept for dependent and frame-sharing units.
    pub scope: Option<Rc<DynamicScope>>,
}

pub enum Method {
    Tracer(Rc<dyn Tracer>, TracerHook),
    Inverter(Rc<dyn Inverter>, InverterHook),
    /// Method of a builtin container or string.
    Native { receiver: Value, name: Name },
}

pub enum IterState {
    Items { items: Rc<[Value]>, next: usize },
    List { list: Rc<RefCell<Vec<Value>>>, next: usize },
    Range { next: i64, stop: i64, step: i64 },
}

impl Iterator for IterState {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        match self {
            Self::Items { items, next } => {
                let item = items.get(*next)?.clone();
                *next += 1;
                Some(item)
            }
            Self::List { list, next } => {
                let item = list.borrow().get(*next)?.clone();
                *next += 1;
                Some(item)
            }
            Self::Range { next, stop, step } => {
                let done = if *step > 0 { *next >= *stop } else { *next <= *stop };
                if done {
                    return None;
                }
                let item = *next;
                *next = next.saturating_add(*step);
                Some(Value::Int(item))
            }
        }
    }
}

/// Hashable projection of a value, used for dictionary keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DictKey {
    None,
    Bool(bool),
    Int(i64),
    Float(OrderedFloat<f64>),
    Str(Rc<str>),
    Tuple(Rc<[DictKey]>),
}

impl DictKey {
    pub fn from_value(value: &Value) -> Result<Self, RuntimeError> {
        Ok(match value {
            Value::None => Self::None,
            Value::Bool(value) => Self::Bool(*value),
            Value::Int(value) => Self::Int(*value),
            Value::Float(value) if value.fract() == 0.0 && value.abs() < 9.0e15 => {
                Self::Int(value.into_inner() as i64)
            }
            Value::Float(value) => Self::Float(*value),
            Value::Str(value) => Self::Str(value.clone()),
            Value::Tuple(items) => Self::Tuple(
                items
                    .iter()
                    .map(Self::from_value)
                    .collect::<Result<Vec<_>, _>>()?
                    .into(),
            ),
            other => {
                return Err(RuntimeError::type_error(format!(
                    "unhashable type: '{}'",
                    other.type_name()
                )));
            }
        })
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::None => Value::None,
            Self::Bool(value) => Value::Bool(*value),
            Self::Int(value) => Value::Int(*value),
            Self::Float(value) => Value::Float(*value),
            Self::Str(value) => Value::Str(value.clone()),
            Self::Tuple(items) => Value::tuple(items.iter().map(Self::to_value).collect()),
        }
    }
}

impl Value {
    pub fn str(text: &str) -> Self {
        Self::Str(text.into())
    }

    pub fn tuple(items: Vec<Value>) -> Self {
        Self::Tuple(items.into())
    }

    pub fn list(items: Vec<Value>) -> Self {
        Self::List(Rc::new(RefCell::new(items)))
    }

    pub fn record(fields: impl IntoIterator<Item = (Name, Value)>) -> Self {
        Self::Record(Rc::new(RefCell::new(fields.into_iter().collect())))
    }

    pub fn from_constant(constant: &Constant) -> Self {
        match constant {
            Constant::None => Self::None,
            Constant::Bool(value) => Self::Bool(*value),
            Constant::Int(value) => Self::Int(*value),
            Constant::Float(value) => Self::Float(*value),
            Constant::Str(value) => Self::str(value),
            Constant::Tuple(items) => Self::tuple(items.iter().map(Self::from_constant).collect()),
            Constant::Code(unit) => Self::Code(unit.clone()),
        }
    }

    pub fn type_name(&self) -> String {
        match self {
            Self::None => "NoneType".into(),
            Self::Bool(_) => "bool".into(),
            Self::Int(_) => "int".into(),
            Self::Float(_) => "float".into(),
            Self::Str(_) => "str".into(),
            Self::Tuple(_) => "tuple".into(),
            Self::List(_) => "list".into(),
            Self::Dict(_) => "dict".into(),
            Self::Record(_) => "namespace".into(),
            Self::Function(_) => "function".into(),
            Self::Builtin(_) => "builtin_function".into(),
            Self::Method(_) => "method".into(),
            Self::Object(object) => object.class().name.to_string(),
            Self::BoundFunction(_) => "declarative_method".into(),
            Self::Nonlocals(_) => "nonlocals".into(),
            Self::Tracer(_) => "tracer".into(),
            Self::Inverter(_) => "inverter".into(),
            Self::Iterator(_) => "iterator".into(),
            Self::Code(_) => "code".into(),
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Self::None => false,
            Self::Bool(value) => *value,
            Self::Int(value) => *value != 0,
            Self::Float(value) => value.into_inner() != 0.0,
            Self::Str(value) => !value.is_empty(),
            Self::Tuple(items) => !items.is_empty(),
            Self::List(items) => !items.borrow().is_empty(),
            Self::Dict(items) => !items.borrow().is_empty(),
            _ => true,
        }
    }

    /// Numeric view used by arithmetic and comparisons; `bool` counts as int.
    pub fn as_number(&self) -> Option<Number> {
        match self {
            Self::Bool(value) => Some(Number::Int(i64::from(*value))),
            Self::Int(value) => Some(Number::Int(*value)),
            Self::Float(value) => Some(Number::Float(value.into_inner())),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(text) => Some(text),
            _ => None,
        }
    }

    /// Object identity, as tested by `is`.
    pub fn is_same(&self, other: &Value) -> bool {
        match (self, other) {
            (Self::None, Self::None) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => Rc::ptr_eq(a, b) || a == b,
            (Self::Tuple(a), Self::Tuple(b)) => Rc::ptr_eq(a, b),
            (Self::List(a), Self::List(b)) => Rc::ptr_eq(a, b),
            (Self::Dict(a), Self::Dict(b)) => Rc::ptr_eq(a, b),
            (Self::Record(a), Self::Record(b)) => Rc::ptr_eq(a, b),
            (Self::Function(a), Self::Function(b)) => Rc::ptr_eq(a, b),
            (Self::Builtin(a), Self::Builtin(b)) => a == b,
            (Self::Method(a), Self::Method(b)) => Rc::ptr_eq(a, b),
            (Self::Object(a), Self::Object(b)) => Rc::ptr_eq(a, b),
            (Self::BoundFunction(a), Self::BoundFunction(b)) => Rc::ptr_eq(a, b),
            (Self::Nonlocals(a), Self::Nonlocals(b)) => Rc::ptr_eq(a, b),
            (Self::Tracer(a), Self::Tracer(b)) => Rc::ptr_eq(a, b),
            (Self::Inverter(a), Self::Inverter(b)) => Rc::ptr_eq(a, b),
            (Self::Iterator(a), Self::Iterator(b)) => Rc::ptr_eq(a, b),
            (Self::Code(a), Self::Code(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn repr(&self) -> String {
        match self {
            Self::None => "None".into(),
            Self::Bool(true) => "True".into(),
            Self::Bool(false) => "False".into(),
            Self::Int(value) => value.to_string(),
            Self::Float(value) => format_float(value.into_inner()),
            Self::Str(text) => quote(text),
            Self::Tuple(items) if items.len() == 1 => format!("({},)", items[0].repr()),
            Self::Tuple(items) => format!("({})", join_repr(items.iter())),
            Self::List(items) => format!("[{}]", join_repr(items.borrow().iter())),
            Self::Dict(items) => {
                let pairs: Vec<String> = items
                    .borrow()
                    .iter()
                    .map(|(key, value)| format!("{}: {}", key.to_value().repr(), value.repr()))
                    .collect();
                format!("{{{}}}", pairs.join(", "))
            }
            Self::Record(fields) => {
                let pairs: Vec<String> = fields
                    .borrow()
                    .iter()
                    .map(|(name, value)| format!("{name}={}", value.repr()))
                    .collect();
                format!("namespace({})", pairs.join(", "))
            }
            Self::Function(function) => format!("<function {}>", function.unit.name),
            Self::Builtin(builtin) => format!("<built-in function {}>", builtin.name()),
            Self::Method(method) => match method.as_ref() {
                Method::Tracer(_, hook) => format!("<tracer method {}>", hook.name()),
                Method::Inverter(_, hook) => format!("<inverter method {}>", hook.name()),
                Method::Native { receiver, name } => {
                    format!("<method {name} of {}>", receiver.type_name())
                }
            },
            Self::Object(object) => format!("<{} object>", object.class().name),
            Self::BoundFunction(bound) => format!("<declarative method {}>", bound.name()),
            Self::Nonlocals(_) => "<nonlocals>".into(),
            Self::Tracer(_) => "<tracer>".into(),
            Self::Inverter(_) => "<inverter>".into(),
            Self::Iterator(_) => "<iterator>".into(),
            Self::Code(unit) => format!("<code {}>", unit.name),
        }
    }

    /// Text produced by `str(value)`.
    pub fn to_text(&self) -> String {
        match self {
            Self::Str(text) => text.to_string(),
            other => other.repr(),
        }
    }

    #[cfg(feature = "cli")]
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Self::None => Json::Null,
            Self::Bool(value) => Json::Bool(*value),
            Self::Int(value) => Json::from(*value),
            Self::Float(value) => serde_json::Number::from_f64(value.into_inner())
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Self::Str(text) => Json::String(text.to_string()),
            Self::Tuple(items) => Json::Array(items.iter().map(Self::to_json).collect()),
            Self::List(items) => Json::Array(items.borrow().iter().map(Self::to_json).collect()),
            Self::Dict(items) => Json::Object(
                items
                    .borrow()
                    .iter()
                    .map(|(key, value)| (key.to_value().to_text(), value.to_json()))
                    .collect(),
            ),
            Self::Record(fields) => Json::Object(
                fields
                    .borrow()
                    .iter()
                    .map(|(name, value)| (name.to_string(), value.to_json()))
                    .collect(),
            ),
            other => Json::String(other.repr()),
        }
    }
}

fn join_repr<'a>(items: impl Iterator<Item = &'a Value>) -> String {
    items.map(Value::repr).collect::<Vec<_>>().join(", ")
}

fn quote(text: &str) -> String {
    let delimiter = if text.contains('\'') && !text.contains('"') { '"' } else { '\'' };
    let mut quoted = String::with_capacity(text.len() + 2);
    quoted.push(delimiter);
    for c in text.chars() {
        match c {
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            '\t' => quoted.push_str("\\t"),
            c if c == delimiter => {
                quoted.push('\\');
                quoted.push(c);
            }
            c => quoted.push(c),
        }
    }
    quoted.push(delimiter);
    quoted
}

fn format_float(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e16 {
        format!("{value:.1}")
    } else {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    pub fn to_f64(self) -> f64 {
        match self {
            Self::Int(value) => value as f64,
            Self::Float(value) => value,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        if let (Some(a), Some(b)) = (self.as_number(), other.as_number()) {
            return match (a, b) {
                (Number::Int(a), Number::Int(b)) => a == b,
                (a, b) => a.to_f64() == b.to_f64(),
            };
        }
        match (self, other) {
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Tuple(a), Self::Tuple(b)) => a == b,
            (Self::List(a), Self::List(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            (Self::Dict(a), Self::Dict(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            (Self::Record(a), Self::Record(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            _ => self.is_same(other),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.repr())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_text())
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value.into())
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Str(value.into())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Str(value.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reprs_look_familiar() {
        assert_eq!(Value::from(2.0).repr(), "2.0");
        assert_eq!(Value::from("it's").to_text(), "it's");
        assert_eq!(Value::from("it's").repr(), "\"it's\"");
        assert_eq!(Value::from("a\nb").repr(), "'a\\nb'");
        assert_eq!(Value::tuple(vec![Value::Int(1)]).repr(), "(1,)");
        assert_eq!(
            Value::list(vec![Value::None, Value::from("a")]).repr(),
            "[None, 'a']"
        );
    }

    #[test]
    fn numeric_equality_crosses_types() {
        assert_eq!(Value::Int(1), Value::from(1.0));
        assert_eq!(Value::Bool(true), Value::Int(1));
        assert_ne!(Value::from("1"), Value::Int(1));
    }

    #[test]
    fn lists_are_unhashable() {
        assert!(DictKey::from_value(&Value::list(Vec::new())).is_err());
        assert_eq!(
            DictKey::from_value(&Value::from(3.0)).unwrap(),
            DictKey::Int(3)
        );
    }
}
