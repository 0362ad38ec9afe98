//! Builtin namespace: the last level of every name lookup.

use indexmap::IndexMap;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;

use super::ops;
use super::value::{DictKey, IterState, Number, Value};
use crate::bytecode::{CompareOp, Name};
use crate::error::RuntimeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    Abs,
    All,
    Any,
    Bool,
    Dict,
    Enumerate,
    Float,
    GetAttr,
    HasAttr,
    Int,
    Len,
    List,
    Max,
    Min,
    Namespace,
    Print,
    Range,
    Repr,
    Reversed,
    Round,
    SetAttr,
    Sorted,
    Str,
    Sum,
    Tuple,
    Zip,
    /// Stand-in for `super` inside declarative functions.
    SuperDisallowed,
}

const BUILTINS: &[(&str, Builtin)] = &[
    ("abs", Builtin::Abs),
    ("all", Builtin::All),
    ("any", Builtin::Any),
    ("bool", Builtin::Bool),
    ("dict", Builtin::Dict),
    ("enumerate", Builtin::Enumerate),
    ("float", Builtin::Float),
    ("getattr", Builtin::GetAttr),
    ("hasattr", Builtin::HasAttr),
    ("int", Builtin::Int),
    ("len", Builtin::Len),
    ("list", Builtin::List),
    ("max", Builtin::Max),
    ("min", Builtin::Min),
    ("namespace", Builtin::Namespace),
    ("print", Builtin::Print),
    ("range", Builtin::Range),
    ("repr", Builtin::Repr),
    ("reversed", Builtin::Reversed),
    ("round", Builtin::Round),
    ("setattr", Builtin::SetAttr),
    ("sorted", Builtin::Sorted),
    ("str", Builtin::Str),
    ("sum", Builtin::Sum),
    ("tuple", Builtin::Tuple),
    ("zip", Builtin::Zip),
];

/// Resolves `name` in the builtin namespace.
pub fn lookup(name: &str) -> Option<Value> {
    Builtin::lookup(name).map(Value::Builtin)
}

impl Builtin {
    pub fn lookup(name: &str) -> Option<Self> {
        BUILTINS
            .iter()
            .find(|(candidate, _)| *candidate == name)
            .map(|(_, builtin)| *builtin)
    }

    pub fn name(self) -> &'static str {
        if self == Self::SuperDisallowed {
            return "super";
        }
        BUILTINS
            .iter()
            .find(|(_, builtin)| *builtin == self)
            .map_or("<builtin>", |(name, _)| name)
    }

    pub fn call(self, args: Vec<Value>, kwargs: Vec<(Name, Value)>) -> Result<Value, RuntimeError> {
        let name = self.name();
        match self {
            Self::Namespace => {
                positional(name, &args, 0, 0)?;
                return Ok(Value::record(kwargs));
            }
            Self::Dict => return dict(args, kwargs),
            Self::Sorted => return sorted(args, kwargs),
            Self::SuperDisallowed => {
                return Err(RuntimeError::type_error(
                    "super() is not allowed in a declarative function",
                ));
            }
            _ => {}
        }
        if let Some((keyword, _)) = kwargs.first() {
            return Err(RuntimeError::type_error(format!(
                "{name}() got an unexpected keyword argument '{keyword}'"
            )));
        }
        match self {
            Self::GetAttr => {
                positional(name, &args, 2, 3)?;
                let attr = attr_name(name, &args[1])?;
                match ops::get_attribute(&args[0], &attr) {
                    Err(error) if error.is_attribute_error() && args.len() == 3 => {
                        Ok(args[2].clone())
                    }
                    result => result,
                }
            }
            Self::SetAttr => {
                positional(name, &args, 3, 3)?;
                let attr = attr_name(name, &args[1])?;
                ops::set_attribute(&args[0], &attr, args[2].clone())?;
                Ok(Value::None)
            }
            Self::HasAttr => {
                positional(name, &args, 2, 2)?;
                let attr = attr_name(name, &args[1])?;
                match ops::get_attribute(&args[0], &attr) {
                    Ok(_) => Ok(Value::Bool(true)),
                    Err(error) if error.is_attribute_error() => Ok(Value::Bool(false)),
                    Err(error) => Err(error),
                }
            }
            Self::Len => {
                positional(name, &args, 1, 1)?;
                len(&args[0]).map(|len| Value::Int(len as i64))
            }
            Self::Range => range(&args),
            Self::Str => {
                positional(name, &args, 0, 1)?;
                Ok(Value::from(args.first().map(Value::to_text).unwrap_or_default()))
            }
            Self::Repr => {
                positional(name, &args, 1, 1)?;
                Ok(Value::from(args[0].repr()))
            }
            Self::Bool => {
                positional(name, &args, 0, 1)?;
                Ok(Value::Bool(args.first().is_some_and(Value::is_truthy)))
            }
            Self::Int => {
                positional(name, &args, 0, 1)?;
                args.first().map_or(Ok(Value::Int(0)), to_int)
            }
            Self::Float => {
                positional(name, &args, 0, 1)?;
                args.first().map_or(Ok(Value::from(0.0)), to_float)
            }
            Self::List => {
                positional(name, &args, 0, 1)?;
                let items = args.first().map(ops::collect).transpose()?.unwrap_or_default();
                Ok(Value::list(items))
            }
            Self::Tuple => {
                positional(name, &args, 0, 1)?;
                let items = args.first().map(ops::collect).transpose()?.unwrap_or_default();
                Ok(Value::tuple(items))
            }
            Self::Min | Self::Max => extreme(self, args),
            Self::Sum => {
                positional(name, &args, 1, 2)?;
                let mut total = args.get(1).cloned().unwrap_or(Value::Int(0));
                for item in ops::collect(&args[0])? {
                    total = ops::binary(crate::bytecode::BinaryOp::Add, &total, &item)?;
                }
                Ok(total)
            }
            Self::Abs => {
                positional(name, &args, 1, 1)?;
                match args[0].as_number() {
                    Some(Number::Int(value)) => value
                        .checked_abs()
                        .map(Value::Int)
                        .ok_or_else(|| RuntimeError::value_error("integer overflow")),
                    Some(Number::Float(value)) => Ok(Value::from(value.abs())),
                    None => Err(bad_operand(name, &args[0])),
                }
            }
            Self::Round => {
                positional(name, &args, 1, 2)?;
                let Some(number) = args[0].as_number() else {
                    return Err(bad_operand(name, &args[0]));
                };
                match args.get(1).map(Value::as_number) {
                    None => match number {
                        Number::Int(value) => Ok(Value::Int(value)),
                        Number::Float(value) => Ok(Value::Int(value.round_ties_even() as i64)),
                    },
                    Some(Some(Number::Int(digits))) => {
                        let scale = 10f64.powi(digits as i32);
                        Ok(Value::from((number.to_f64() * scale).round_ties_even() / scale))
                    }
                    Some(_) => Err(RuntimeError::type_error("round() digits must be an integer")),
                }
            }
            Self::Any => {
                positional(name, &args, 1, 1)?;
                Ok(Value::Bool(ops::collect(&args[0])?.iter().any(Value::is_truthy)))
            }
            Self::All => {
                positional(name, &args, 1, 1)?;
                Ok(Value::Bool(ops::collect(&args[0])?.iter().all(Value::is_truthy)))
            }
            Self::Reversed => {
                positional(name, &args, 1, 1)?;
                let mut items = ops::collect(&args[0])?;
                items.reverse();
                Ok(iterator(items))
            }
            Self::Enumerate => {
                positional(name, &args, 1, 2)?;
                let start = match args.get(1).map(Value::as_number) {
                    None => 0,
                    Some(Some(Number::Int(start))) => start,
                    Some(_) => return Err(RuntimeError::type_error("enumerate() start must be an integer")),
                };
                let items = ops::collect(&args[0])?
                    .into_iter()
                    .zip(start..)
                    .map(|(item, index)| Value::tuple(vec![Value::Int(index), item]))
                    .collect();
                Ok(iterator(items))
            }
            Self::Zip => {
                let columns = args.iter().map(ops::collect).collect::<Result<Vec<_>, _>>()?;
                let rows = columns.iter().map(Vec::len).min().unwrap_or(0);
                let items = (0..rows)
                    .map(|row| Value::tuple(columns.iter().map(|column| column[row].clone()).collect()))
                    .collect();
                Ok(iterator(items))
            }
            Self::Print => {
                let line: Vec<String> = args.iter().map(Value::to_text).collect();
                log::info!("{}", line.join(" "));
                Ok(Value::None)
            }
            Self::Namespace | Self::Dict | Self::Sorted | Self::SuperDisallowed => Ok(Value::None),
        }
    }
}

fn positional(name: &str, args: &[Value], min: usize, max: usize) -> Result<(), RuntimeError> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            format!("exactly {min}")
        } else {
            format!("from {min} to {max}")
        };
        return Err(RuntimeError::type_error(format!(
            "{name}() takes {expected} positional arguments but {} were given",
            args.len()
        )));
    }
    Ok(())
}

fn attr_name(name: &str, value: &Value) -> Result<Rc<str>, RuntimeError> {
    match value {
        Value::Str(attr) => Ok(attr.clone()),
        other => Err(RuntimeError::type_error(format!(
            "{name}(): attribute name must be string, not '{}'",
            other.type_name()
        ))),
    }
}

fn bad_operand(name: &str, value: &Value) -> RuntimeError {
    RuntimeError::type_error(format!(
        "bad operand type for {name}(): '{}'",
        value.type_name()
    ))
}

fn iterator(items: Vec<Value>) -> Value {
    Value::Iterator(Rc::new(RefCell::new(IterState::Items {
        items: items.into(),
        next: 0,
    })))
}

fn len(value: &Value) -> Result<usize, RuntimeError> {
    match value {
        Value::Str(text) => Ok(text.chars().count()),
        Value::Tuple(items) => Ok(items.len()),
        Value::List(items) => Ok(items.borrow().len()),
        Value::Dict(items) => Ok(items.borrow().len()),
        Value::Record(fields) => Ok(fields.borrow().len()),
        other => Err(RuntimeError::type_error(format!(
            "object of type '{}' has no len()",
            other.type_name()
        ))),
    }
}

fn range(args: &[Value]) -> Result<Value, RuntimeError> {
    positional("range", args, 1, 3)?;
    let bounds = args
        .iter()
        .map(|arg| match arg.as_number() {
            Some(Number::Int(value)) => Ok(value),
            _ => Err(RuntimeError::type_error(format!(
                "'{}' object cannot be interpreted as an integer",
                arg.type_name()
            ))),
        })
        .collect::<Result<Vec<_>, _>>()?;
    let (start, stop, step) = match *bounds.as_slice() {
        [start, stop, step] => (start, stop, step),
        [start, stop] => (start, stop, 1),
        [stop] => (0, stop, 1),
        _ => return Err(RuntimeError::type_error("range expected at least 1 argument")),
    };
    if step == 0 {
        return Err(RuntimeError::value_error("range() arg 3 must not be zero"));
    }
    Ok(Value::Iterator(Rc::new(RefCell::new(IterState::Range {
        next: start,
        stop,
        step,
    }))))
}

fn to_int(value: &Value) -> Result<Value, RuntimeError> {
    match value {
        Value::Str(text) => text
            .trim()
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| {
                RuntimeError::value_error(format!(
                    "invalid literal for int() with base 10: {}",
                    value.repr()
                ))
            }),
        other => match other.as_number() {
            Some(Number::Int(value)) => Ok(Value::Int(value)),
            Some(Number::Float(value)) if value.is_finite() => Ok(Value::Int(value.trunc() as i64)),
            Some(Number::Float(_)) => Err(RuntimeError::value_error(
                "cannot convert float infinity or NaN to integer",
            )),
            None => Err(bad_operand("int", other)),
        },
    }
}

fn to_float(value: &Value) -> Result<Value, RuntimeError> {
    match value {
        Value::Str(text) => text.trim().parse::<f64>().map(Value::from).map_err(|_| {
            RuntimeError::value_error(format!(
                "could not convert string to float: {}",
                value.repr()
            ))
        }),
        other => other
            .as_number()
            .map(|number| Value::from(number.to_f64()))
            .ok_or_else(|| bad_operand("float", other)),
    }
}

fn dict(args: Vec<Value>, kwargs: Vec<(Name, Value)>) -> Result<Value, RuntimeError> {
    positional("dict", &args, 0, 1)?;
    let mut items = IndexMap::new();
    if let Some(source) = args.first() {
        match source {
            Value::Dict(source) => items.extend(source.borrow().clone()),
            other => {
                for pair in ops::collect(other)? {
                    let pair = ops::collect(&pair)?;
                    let [key, value] = pair.as_slice() else {
                        return Err(RuntimeError::value_error(
                            "dictionary update sequence element has the wrong length",
                        ));
                    };
                    items.insert(DictKey::from_value(key)?, value.clone());
                }
            }
        }
    }
    for (name, value) in kwargs {
        items.insert(DictKey::Str(Rc::from(&*name)), value);
    }
    Ok(Value::Dict(Rc::new(RefCell::new(items))))
}

fn sorted(args: Vec<Value>, kwargs: Vec<(Name, Value)>) -> Result<Value, RuntimeError> {
    positional("sorted", &args, 1, 1)?;
    let mut reverse = false;
    for (name, value) in kwargs {
        match &*name {
            "reverse" => reverse = value.is_truthy(),
            other => {
                return Err(RuntimeError::type_error(format!(
                    "sorted() got an unexpected keyword argument '{other}'"
                )));
            }
        }
    }
    let mut items = ops::collect(&args[0])?;
    let mut failure = None;
    items.sort_by(|a, b| match ops::order(CompareOp::Less, a, b) {
        Ok(ordering) => ordering,
        Err(error) => {
            failure.get_or_insert(error);
            Ordering::Equal
        }
    });
    if let Some(error) = failure {
        return Err(error);
    }
    if reverse {
        items.reverse();
    }
    Ok(Value::list(items))
}

fn extreme(builtin: Builtin, args: Vec<Value>) -> Result<Value, RuntimeError> {
    let name = builtin.name();
    let candidates = match args.as_slice() {
        [] => return Err(RuntimeError::type_error(format!("{name}() expected at least 1 argument"))),
        [iterable] => ops::collect(iterable)?,
        _ => args,
    };
    let wanted = if builtin == Builtin::Max {
        Ordering::Greater
    } else {
        Ordering::Less
    };
    let mut candidates = candidates.into_iter();
    let Some(mut best) = candidates.next() else {
        return Err(RuntimeError::value_error(format!("{name}() arg is an empty sequence")));
    };
    for candidate in candidates {
        if ops::order(CompareOp::Less, &candidate, &best)? == wanted {
            best = candidate;
        }
    }
    Ok(best)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: Vec<Value>) -> Result<Value, RuntimeError> {
        Builtin::lookup(name).unwrap().call(args, Vec::new())
    }

    #[test]
    fn getattr_falls_back_to_the_default() {
        let record = Value::record([(Name::from("x"), Value::Int(1))]);
        assert_eq!(
            call("getattr", vec![record.clone(), Value::from("x")]).unwrap(),
            Value::Int(1)
        );
        assert_eq!(
            call("getattr", vec![record.clone(), Value::from("y"), Value::None]).unwrap(),
            Value::None
        );
        assert!(call("getattr", vec![record, Value::from("y")]).is_err());
    }

    #[test]
    fn range_and_sum_agree() {
        let total = call("sum", vec![call("range", vec![Value::Int(5)]).unwrap()]).unwrap();
        assert_eq!(total, Value::Int(10));
        let backwards = call(
            "list",
            vec![call("range", vec![Value::Int(3), Value::Int(0), Value::Int(-1)]).unwrap()],
        )
        .unwrap();
        assert_eq!(backwards.repr(), "[3, 2, 1]");
    }

    #[test]
    fn sorted_supports_reverse() {
        let items = Value::list(vec![Value::Int(2), Value::Int(3), Value::Int(1)]);
        let sorted = Builtin::Sorted
            .call(vec![items], vec![(Name::from("reverse"), Value::Bool(true))])
            .unwrap();
        assert_eq!(sorted.repr(), "[3, 2, 1]");
    }

    #[test]
    fn super_is_not_a_builtin() {
        assert!(lookup("super").is_none());
        let error = Builtin::SuperDisallowed.call(Vec::new(), Vec::new()).unwrap_err();
        assert!(error.to_string().contains("super()"));
    }

    #[test]
    fn conversions_report_bad_literals() {
        assert_eq!(call("int", vec![Value::from(" 42 ")]).unwrap(), Value::Int(42));
        assert_eq!(call("int", vec![Value::from(2.9)]).unwrap(), Value::Int(2));
        assert!(call("int", vec![Value::from("x")]).is_err());
        assert_eq!(call("round", vec![Value::from(2.5)]).unwrap(), Value::Int(2));
    }
}
