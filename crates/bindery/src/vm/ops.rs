//! Value-level semantics of the arithmetic, comparison, attribute and
//! subscript instructions, shared by the interpreter and the builtins.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;

use super::value::{DictKey, IterState, Method, Number, Value};
use crate::bytecode::{BinaryOp, CompareOp, Name, UnaryOp};
use crate::error::{ErrorKind, RuntimeError};
use crate::inversion::InverterHook;
use crate::tracing::TracerHook;

fn overflow() -> RuntimeError {
    RuntimeError::value_error("integer overflow")
}

fn unsupported(op: &str, left: &Value, right: &Value) -> RuntimeError {
    RuntimeError::type_error(format!(
        "unsupported operand type(s) for {op}: '{}' and '{}'",
        left.type_name(),
        right.type_name()
    ))
}

pub fn binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, RuntimeError> {
    if let (Some(a), Some(b)) = (left.as_number(), right.as_number()) {
        return arithmetic(op, a, b);
    }
    let symbol = op.symbol();
    match (op, left, right) {
        (BinaryOp::Add, Value::Str(a), Value::Str(b)) => Ok(Value::from(format!("{a}{b}"))),
        (BinaryOp::Add, Value::Tuple(a), Value::Tuple(b)) => {
            Ok(Value::tuple(a.iter().chain(b.iter()).cloned().collect()))
        }
        (BinaryOp::Add, Value::List(a), Value::List(b)) => {
            let mut items = a.borrow().clone();
            items.extend(b.borrow().iter().cloned());
            Ok(Value::list(items))
        }
        (BinaryOp::Multiply, sequence, Value::Int(count))
        | (BinaryOp::Multiply, Value::Int(count), sequence) => repeat(sequence, *count)
            .ok_or_else(|| unsupported(symbol, left, right)),
        _ => Err(unsupported(symbol, left, right)),
    }
}

fn repeat(sequence: &Value, count: i64) -> Option<Value> {
    let count = usize::try_from(count).unwrap_or(0);
    match sequence {
        Value::Str(text) => Some(Value::from(text.repeat(count))),
        Value::Tuple(items) => Some(Value::tuple(
            items.iter().cycle().take(items.len() * count).cloned().collect(),
        )),
        Value::List(items) => {
            let items = items.borrow();
            Some(Value::list(
                items.iter().cycle().take(items.len() * count).cloned().collect(),
            ))
        }
        _ => None,
    }
}

fn arithmetic(op: BinaryOp, left: Number, right: Number) -> Result<Value, RuntimeError> {
    if let (Number::Int(a), Number::Int(b)) = (left, right) {
        return match op {
            BinaryOp::Add => a.checked_add(b).map(Value::Int).ok_or_else(overflow),
            BinaryOp::Subtract => a.checked_sub(b).map(Value::Int).ok_or_else(overflow),
            BinaryOp::Multiply => a.checked_mul(b).map(Value::Int).ok_or_else(overflow),
            BinaryOp::Divide if b == 0 => Err(ErrorKind::ZeroDivision.into()),
            BinaryOp::Divide => Ok(Value::from(a as f64 / b as f64)),
            BinaryOp::FloorDivide | BinaryOp::Modulo if b == 0 => {
                Err(ErrorKind::ZeroDivision.into())
            }
            BinaryOp::FloorDivide => {
                let quotient = a.checked_div(b).ok_or_else(overflow)?;
                let adjust = a % b != 0 && ((a < 0) != (b < 0));
                Ok(Value::Int(if adjust { quotient - 1 } else { quotient }))
            }
            BinaryOp::Modulo => {
                let remainder = a.checked_rem(b).ok_or_else(overflow)?;
                let adjust = remainder != 0 && ((remainder < 0) != (b < 0));
                Ok(Value::Int(if adjust { remainder + b } else { remainder }))
            }
            BinaryOp::Power if b >= 0 => u32::try_from(b)
                .ok()
                .and_then(|exponent| a.checked_pow(exponent))
                .map(Value::Int)
                .ok_or_else(overflow),
            BinaryOp::Power => Ok(Value::from((a as f64).powf(b as f64))),
        };
    }
    let (a, b) = (left.to_f64(), right.to_f64());
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Subtract => a - b,
        BinaryOp::Multiply => a * b,
        BinaryOp::Divide | BinaryOp::FloorDivide | BinaryOp::Modulo if b == 0.0 => {
            return Err(ErrorKind::ZeroDivision.into());
        }
        BinaryOp::Divide => a / b,
        BinaryOp::FloorDivide => (a / b).floor(),
        BinaryOp::Modulo => a - b * (a / b).floor(),
        BinaryOp::Power => a.powf(b),
    };
    Ok(Value::from(result))
}

pub fn unary(op: UnaryOp, operand: &Value) -> Result<Value, RuntimeError> {
    match (op, operand.as_number()) {
        (UnaryOp::Not, _) => Ok(Value::Bool(!operand.is_truthy())),
        (UnaryOp::Negate, Some(Number::Int(value))) => {
            value.checked_neg().map(Value::Int).ok_or_else(overflow)
        }
        (UnaryOp::Negate, Some(Number::Float(value))) => Ok(Value::from(-value)),
        (UnaryOp::Plus, Some(Number::Int(value))) => Ok(Value::Int(value)),
        (UnaryOp::Plus, Some(Number::Float(value))) => Ok(Value::from(value)),
        (op, None) => Err(RuntimeError::type_error(format!(
            "bad operand type for unary {}: '{}'",
            if op == UnaryOp::Negate { "-" } else { "+" },
            operand.type_name()
        ))),
    }
}

pub fn compare(op: CompareOp, left: &Value, right: &Value) -> Result<Value, RuntimeError> {
    let result = match op {
        CompareOp::Equal => left == right,
        CompareOp::NotEqual => left != right,
        CompareOp::Is => left.is_same(right),
        CompareOp::IsNot => !left.is_same(right),
        CompareOp::In => contains(right, left)?,
        CompareOp::NotIn => !contains(right, left)?,
        CompareOp::Less => order(op, left, right)? == Ordering::Less,
        CompareOp::LessOrEqual => order(op, left, right)? != Ordering::Greater,
        CompareOp::Greater => order(op, left, right)? == Ordering::Greater,
        CompareOp::GreaterOrEqual => order(op, left, right)? != Ordering::Less,
    };
    Ok(Value::Bool(result))
}

/// Ordering used by `<` and friends, `min`, `max` and `sorted`.
pub fn order(op: CompareOp, left: &Value, right: &Value) -> Result<Ordering, RuntimeError> {
    if let (Some(a), Some(b)) = (left.as_number(), right.as_number()) {
        return match (a, b) {
            (Number::Int(a), Number::Int(b)) => Ok(a.cmp(&b)),
            (a, b) => a
                .to_f64()
                .partial_cmp(&b.to_f64())
                .ok_or_else(|| RuntimeError::value_error("cannot order NaN")),
        };
    }
    match (left, right) {
        (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
        (Value::Tuple(a), Value::Tuple(b)) => order_sequences(op, a, b),
        (Value::List(a), Value::List(b)) => {
            let (a, b) = (a.borrow().clone(), b.borrow().clone());
            order_sequences(op, &a, &b)
        }
        _ => Err(RuntimeError::type_error(format!(
            "'{}' not supported between instances of '{}' and '{}'",
            op.symbol(),
            left.type_name(),
            right.type_name()
        ))),
    }
}

fn order_sequences(op: CompareOp, a: &[Value], b: &[Value]) -> Result<Ordering, RuntimeError> {
    for (left, right) in a.iter().zip(b) {
        if left != right {
            return order(op, left, right);
        }
    }
    Ok(a.len().cmp(&b.len()))
}

pub fn contains(container: &Value, item: &Value) -> Result<bool, RuntimeError> {
    match container {
        Value::Str(text) => match item {
            Value::Str(needle) => Ok(text.contains(&**needle)),
            other => Err(RuntimeError::type_error(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            ))),
        },
        Value::Tuple(items) => Ok(items.contains(item)),
        Value::List(items) => Ok(items.borrow().contains(item)),
        Value::Dict(items) => Ok(items.borrow().contains_key(&DictKey::from_value(item)?)),
        Value::Record(fields) => Ok(item
            .as_str()
            .is_some_and(|name| fields.borrow().contains_key(name))),
        other => Ok(collect(other)?.contains(item)),
    }
}

pub fn get_attribute(target: &Value, attr: &str) -> Result<Value, RuntimeError> {
    match target {
        Value::Object(object) => object.get_attr(attr),
        Value::Nonlocals(nonlocals) => nonlocals.get_attr(attr),
        Value::Record(fields) => fields
            .borrow()
            .get(attr)
            .cloned()
            .ok_or_else(|| RuntimeError::attribute("namespace", attr)),
        Value::Tracer(tracer) => TracerHook::from_name(attr)
            .map(|hook| Value::Method(Rc::new(Method::Tracer(tracer.clone(), hook))))
            .ok_or_else(|| RuntimeError::attribute("tracer", attr)),
        Value::Inverter(inverter) => InverterHook::from_name(attr)
            .map(|hook| Value::Method(Rc::new(Method::Inverter(inverter.clone(), hook))))
            .ok_or_else(|| RuntimeError::attribute("inverter", attr)),
        Value::Function(function) => match attr {
            "__name__" => Ok(Value::str(&function.unit.name)),
            "__doc__" => Ok(function
                .unit
                .doc
                .as_ref()
                .map_or(Value::None, |doc| Value::str(doc))),
            _ => Err(RuntimeError::attribute("function", attr)),
        },
        Value::Str(_) | Value::List(_) | Value::Dict(_) if has_native_method(target, attr) => {
            Ok(Value::Method(Rc::new(Method::Native {
                receiver: target.clone(),
                name: attr.into(),
            })))
        }
        other => Err(RuntimeError::attribute(other.type_name(), attr)),
    }
}

pub fn set_attribute(target: &Value, attr: &str, value: Value) -> Result<(), RuntimeError> {
    match target {
        Value::Object(object) => object.set_attr(attr, value),
        Value::Nonlocals(nonlocals) => nonlocals.set_attr(attr, value),
        Value::Record(fields) => {
            fields.borrow_mut().insert(attr.into(), value);
            Ok(())
        }
        other => Err(RuntimeError::attribute(other.type_name(), attr)),
    }
}

pub fn delete_attribute(target: &Value, attr: &str) -> Result<(), RuntimeError> {
    match target {
        Value::Record(fields) => fields
            .borrow_mut()
            .shift_remove(attr)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::attribute("namespace", attr)),
        other => Err(RuntimeError::attribute(other.type_name(), attr)),
    }
}

fn index(len: usize, index: &Value, what: &str) -> Result<usize, RuntimeError> {
    let Some(Number::Int(raw)) = index.as_number() else {
        return Err(RuntimeError::type_error(format!(
            "{what} indices must be integers, not {}",
            index.type_name()
        )));
    };
    let resolved = if raw < 0 { raw + len as i64 } else { raw };
    usize::try_from(resolved)
        .ok()
        .filter(|resolved| *resolved < len)
        .ok_or_else(|| RuntimeError::index_error(format!("{what} index out of range")))
}

pub fn get_item(container: &Value, key: &Value) -> Result<Value, RuntimeError> {
    match container {
        Value::Tuple(items) => Ok(items[index(items.len(), key, "tuple")?].clone()),
        Value::List(items) => {
            let items = items.borrow();
            Ok(items[index(items.len(), key, "list")?].clone())
        }
        Value::Str(text) => {
            let chars: Vec<char> = text.chars().collect();
            Ok(Value::from(chars[index(chars.len(), key, "string")?].to_string()))
        }
        Value::Dict(items) => items
            .borrow()
            .get(&DictKey::from_value(key)?)
            .cloned()
            .ok_or_else(|| RuntimeError::key_error(key.repr())),
        Value::Nonlocals(nonlocals) => match key {
            Value::Str(name) => nonlocals.get_attr(name).map_err(|error| {
                if error.is_attribute_error() {
                    RuntimeError::key_error(key.repr())
                } else {
                    error
                }
            }),
            other => Err(RuntimeError::type_error(format!(
                "nonlocals keys must be strings, not {}",
                other.type_name()
            ))),
        },
        other => Err(RuntimeError::type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

pub fn set_item(container: &Value, key: &Value, value: Value) -> Result<(), RuntimeError> {
    match container {
        Value::List(items) => {
            let mut items = items.borrow_mut();
            let slot = index(items.len(), key, "list")?;
            items[slot] = value;
            Ok(())
        }
        Value::Dict(items) => {
            items.borrow_mut().insert(DictKey::from_value(key)?, value);
            Ok(())
        }
        Value::Nonlocals(nonlocals) => match key {
            Value::Str(name) => nonlocals.set_attr(name, value),
            other => Err(RuntimeError::type_error(format!(
                "nonlocals keys must be strings, not {}",
                other.type_name()
            ))),
        },
        other => Err(RuntimeError::type_error(format!(
            "'{}' object does not support item assignment",
            other.type_name()
        ))),
    }
}

pub fn delete_item(container: &Value, key: &Value) -> Result<(), RuntimeError> {
    match container {
        Value::List(items) => {
            let mut items = items.borrow_mut();
            let slot = index(items.len(), key, "list")?;
            items.remove(slot);
            Ok(())
        }
        Value::Dict(items) => items
            .borrow_mut()
            .shift_remove(&DictKey::from_value(key)?)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::key_error(key.repr())),
        other => Err(RuntimeError::type_error(format!(
            "'{}' object does not support item deletion",
            other.type_name()
        ))),
    }
}

/// Iterator over `value`, as produced by `GET_ITER`.
pub fn iterate(value: &Value) -> Result<Value, RuntimeError> {
    let state = match value {
        Value::Iterator(_) => return Ok(value.clone()),
        Value::Tuple(items) => IterState::Items {
            items: items.clone(),
            next: 0,
        },
        Value::List(list) => IterState::List {
            list: list.clone(),
            next: 0,
        },
        Value::Str(text) => IterState::Items {
            items: text.chars().map(|c| Value::from(c.to_string())).collect(),
            next: 0,
        },
        Value::Dict(items) => IterState::Items {
            items: items.borrow().keys().map(DictKey::to_value).collect(),
            next: 0,
        },
        other => {
            return Err(RuntimeError::type_error(format!(
                "'{}' object is not iterable",
                other.type_name()
            )));
        }
    };
    Ok(Value::Iterator(Rc::new(RefCell::new(state))))
}

pub fn collect(value: &Value) -> Result<Vec<Value>, RuntimeError> {
    match value {
        Value::Tuple(items) => Ok(items.to_vec()),
        Value::List(items) => Ok(items.borrow().clone()),
        other => {
            let Value::Iterator(state) = iterate(other)? else {
                return Ok(Vec::new());
            };
            let mut items = Vec::new();
            loop {
                let next = state.borrow_mut().next();
                match next {
                    Some(item) => items.push(item),
                    None => return Ok(items),
                }
            }
        }
    }
}

fn has_native_method(receiver: &Value, name: &str) -> bool {
    let names: &[&str] = match receiver {
        Value::Str(_) => &[
            "upper", "lower", "strip", "split", "join", "startswith", "endswith", "replace",
        ],
        Value::List(_) => &["append", "extend", "insert", "pop", "index", "count"],
        Value::Dict(_) => &["get", "keys", "values", "items", "pop", "update"],
        _ => &[],
    };
    names.contains(&name)
}

fn expect_args(name: &str, args: &[Value], min: usize, max: usize) -> Result<(), RuntimeError> {
    if args.len() < min || args.len() > max {
        return Err(RuntimeError::type_error(format!(
            "{name}() takes {} arguments ({} given)",
            if min == max { min.to_string() } else { format!("{min} to {max}") },
            args.len()
        )));
    }
    Ok(())
}

fn text_arg(name: &str, value: &Value) -> Result<Rc<str>, RuntimeError> {
    match value {
        Value::Str(text) => Ok(text.clone()),
        other => Err(RuntimeError::type_error(format!(
            "{name}() argument must be str, not {}",
            other.type_name()
        ))),
    }
}

/// Calls a method of a builtin string, list or dict.
pub fn call_native(
    receiver: &Value,
    name: &Name,
    args: Vec<Value>,
    kwargs: Vec<(Name, Value)>,
) -> Result<Value, RuntimeError> {
    if let Some((keyword, _)) = kwargs.first() {
        return Err(RuntimeError::type_error(format!(
            "{name}() got an unexpected keyword argument '{keyword}'"
        )));
    }
    match (receiver, &**name) {
        (Value::Str(text), "upper") => Ok(Value::from(text.to_uppercase())),
        (Value::Str(text), "lower") => Ok(Value::from(text.to_lowercase())),
        (Value::Str(text), "strip") => Ok(Value::from(text.trim())),
        (Value::Str(text), "split") => {
            expect_args(name, &args, 0, 1)?;
            let parts: Vec<Value> = match args.first() {
                Some(separator) => {
                    let separator = text_arg("split", separator)?;
                    text.split(&*separator).map(Value::from).collect()
                }
                None => text.split_whitespace().map(Value::from).collect(),
            };
            Ok(Value::list(parts))
        }
        (Value::Str(text), "join") => {
            expect_args(name, &args, 1, 1)?;
            let parts = collect(&args[0])?
                .iter()
                .map(|part| text_arg("join", part).map(|part| part.to_string()))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::from(parts.join(&**text)))
        }
        (Value::Str(text), "startswith" | "endswith") => {
            expect_args(name, &args, 1, 1)?;
            let affix = text_arg(name, &args[0])?;
            Ok(Value::Bool(if &**name == "startswith" {
                text.starts_with(&*affix)
            } else {
                text.ends_with(&*affix)
            }))
        }
        (Value::Str(text), "replace") => {
            expect_args(name, &args, 2, 2)?;
            let (from, to) = (text_arg(name, &args[0])?, text_arg(name, &args[1])?);
            Ok(Value::from(text.replace(&*from, &to)))
        }
        (Value::List(items), "append") => {
            expect_args(name, &args, 1, 1)?;
            items.borrow_mut().extend(args);
            Ok(Value::None)
        }
        (Value::List(items), "extend") => {
            expect_args(name, &args, 1, 1)?;
            let extra = collect(&args[0])?;
            items.borrow_mut().extend(extra);
            Ok(Value::None)
        }
        (Value::List(items), "insert") => {
            expect_args(name, &args, 2, 2)?;
            let mut items = items.borrow_mut();
            let Some(Number::Int(position)) = args[0].as_number() else {
                return Err(RuntimeError::type_error("insert() index must be an integer"));
            };
            let len = items.len() as i64;
            let position = if position < 0 { (position + len).max(0) } else { position.min(len) };
            items.insert(position as usize, args[1].clone());
            Ok(Value::None)
        }
        (Value::List(items), "pop") => {
            expect_args(name, &args, 0, 1)?;
            let mut items = items.borrow_mut();
            if items.is_empty() {
                return Err(RuntimeError::index_error("pop from empty list"));
            }
            let slot = match args.first() {
                Some(position) => index(items.len(), position, "pop")?,
                None => items.len() - 1,
            };
            Ok(items.remove(slot))
        }
        (Value::List(items), "index") => {
            expect_args(name, &args, 1, 1)?;
            items
                .borrow()
                .iter()
                .position(|item| *item == args[0])
                .map(|position| Value::Int(position as i64))
                .ok_or_else(|| {
                    RuntimeError::value_error(format!("{} is not in list", args[0].repr()))
                })
        }
        (Value::List(items), "count") => {
            expect_args(name, &args, 1, 1)?;
            let count = items.borrow().iter().filter(|item| **item == args[0]).count();
            Ok(Value::Int(count as i64))
        }
        (Value::Dict(items), "get") => {
            expect_args(name, &args, 1, 2)?;
            let key = DictKey::from_value(&args[0])?;
            Ok(items
                .borrow()
                .get(&key)
                .cloned()
                .or_else(|| args.get(1).cloned())
                .unwrap_or(Value::None))
        }
        (Value::Dict(items), "keys") => Ok(Value::list(
            items.borrow().keys().map(DictKey::to_value).collect(),
        )),
        (Value::Dict(items), "values") => Ok(Value::list(items.borrow().values().cloned().collect())),
        (Value::Dict(items), "items") => Ok(Value::list(
            items
                .borrow()
                .iter()
                .map(|(key, value)| Value::tuple(vec![key.to_value(), value.clone()]))
                .collect(),
        )),
        (Value::Dict(items), "pop") => {
            expect_args(name, &args, 1, 2)?;
            let key = DictKey::from_value(&args[0])?;
            let removed = items.borrow_mut().shift_remove(&key);
            removed
                .or_else(|| args.get(1).cloned())
                .ok_or_else(|| RuntimeError::key_error(args[0].repr()))
        }
        (Value::Dict(items), "update") => {
            expect_args(name, &args, 1, 1)?;
            let Value::Dict(other) = &args[0] else {
                return Err(RuntimeError::type_error("update() argument must be a dict"));
            };
            let other = other.borrow().clone();
            items.borrow_mut().extend(other);
            Ok(Value::None)
        }
        _ => Err(RuntimeError::attribute(receiver.type_name(), name)),
    }
}
