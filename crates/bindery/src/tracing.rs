//! Dependency tracing.
//!
//! [`inject_tracing`] prefixes every attribute load, call, subscript load,
//! iteration start and return of a unit with a call into a [`Tracer`] that the
//! unit receives as its first argument. Every inserted sequence leaves the
//! stack exactly as it found it. Dynamic loads are reported by the dynamic
//! scope itself, which is the only party that knows which object answered.

use smallvec::{SmallVec, smallvec};
use std::sync::Arc;

use crate::bytecode::{Constant, Instruction, Name, Op, TargetIsa};
use crate::codegen::{CodeGenerator, CompiledUnit};
use crate::error::{CompileError, RuntimeError};
use crate::vm::Value;

/// Name of the parameter (and cell) carrying the tracer.
pub const TRACER_ARG: &str = "_[tracer]";

/// Observer of the values a traced unit touches. Every hook defaults to a no-op.
pub trait Tracer {
    /// `owner.attr` answered a dynamic-scope lookup with `value`.
    fn dynamic_load(&self, _owner: &Value, _attr: &str, _value: &Value) -> Result<(), RuntimeError> {
        Ok(())
    }

    fn load_attr(&self, _object: &Value, _attr: &str) -> Result<(), RuntimeError> {
        Ok(())
    }

    fn call(
        &self,
        _func: &Value,
        _args: &[Value],
        _kwargs: &[(Name, Value)],
    ) -> Result<(), RuntimeError> {
        Ok(())
    }

    fn subscript_load(&self, _object: &Value, _index: &Value) -> Result<(), RuntimeError> {
        Ok(())
    }

    fn iterate(&self, _object: &Value) -> Result<(), RuntimeError> {
        Ok(())
    }

    fn return_value(&self, _value: &Value) -> Result<(), RuntimeError> {
        Ok(())
    }
}

/// Tracer hooks reachable as attributes of a tracer value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracerHook {
    DynamicLoad,
    LoadAttr,
    Call,
    SubscriptLoad,
    Iterate,
    ReturnValue,
}

impl TracerHook {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "dynamic_load" => Self::DynamicLoad,
            "load_attr" => Self::LoadAttr,
            "call" => Self::Call,
            "subscript_load" => Self::SubscriptLoad,
            "iterate" => Self::Iterate,
            "return_value" => Self::ReturnValue,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::DynamicLoad => "dynamic_load",
            Self::LoadAttr => "load_attr",
            Self::Call => "call",
            Self::SubscriptLoad => "subscript_load",
            Self::Iterate => "iterate",
            Self::ReturnValue => "return_value",
        }
    }
}

/// Invokes `hook` with the arguments pushed by an instrumented unit.
pub fn dispatch(tracer: &dyn Tracer, hook: TracerHook, args: &[Value]) -> Result<(), RuntimeError> {
    let arity = match hook {
        TracerHook::DynamicLoad | TracerHook::Call => 3,
        TracerHook::LoadAttr | TracerHook::SubscriptLoad => 2,
        TracerHook::Iterate | TracerHook::ReturnValue => 1,
    };
    if args.len() != arity {
        return Err(RuntimeError::type_error(format!(
            "{}() takes {arity} arguments ({} given)",
            hook.name(),
            args.len()
        )));
    }
    match hook {
        TracerHook::DynamicLoad => tracer.dynamic_load(&args[0], &text(&args[1])?, &args[2]),
        TracerHook::LoadAttr => tracer.load_attr(&args[0], &text(&args[1])?),
        TracerHook::Call => {
            let (positional, kwargs) = split_arguments(&args[1], &args[2])?;
            tracer.call(&args[0], &positional, &kwargs)
        }
        TracerHook::SubscriptLoad => tracer.subscript_load(&args[0], &args[1]),
        TracerHook::Iterate => tracer.iterate(&args[0]),
        TracerHook::ReturnValue => tracer.return_value(&args[0]),
    }
}

fn text(value: &Value) -> Result<std::rc::Rc<str>, RuntimeError> {
    match value {
        Value::Str(text) => Ok(text.clone()),
        other => Err(RuntimeError::type_error(format!(
            "expected an attribute name, got '{}'",
            other.type_name()
        ))),
    }
}

/// Splits a packed argument tuple according to a `(positional, kwnames)` shape.
fn split_arguments(
    packed: &Value,
    shape: &Value,
) -> Result<(Vec<Value>, Vec<(Name, Value)>), RuntimeError> {
    let malformed = || RuntimeError::type_error("malformed call shape");
    let (Value::Tuple(items), Value::Tuple(shape)) = (packed, shape) else {
        return Err(malformed());
    };
    let [Value::Int(positional), Value::Tuple(names)] = &**shape else {
        return Err(malformed());
    };
    let positional = usize::try_from(*positional)
        .ok()
        .filter(|count| *count + names.len() == items.len())
        .ok_or_else(malformed)?;
    let kwargs = names
        .iter()
        .zip(&items[positional..])
        .map(|(name, value)| match name {
            Value::Str(name) => Ok((Name::from(&**name), value.clone())),
            _ => Err(malformed()),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok((items[..positional].to_vec(), kwargs))
}

/// Returns a copy of `unit` taking a tracer as its first positional argument.
/// Nested units sharing the frame receive the tracer through a closure cell.
pub fn inject_tracing(
    unit: &CompiledUnit,
    isa: &'static dyn TargetIsa,
) -> Result<Arc<CompiledUnit>, CompileError> {
    Instrumenter { isa }.instrument(unit, true)
}

struct Instrumenter {
    isa: &'static dyn TargetIsa,
}

impl Instrumenter {
    fn instrument(&self, unit: &CompiledUnit, top: bool) -> Result<Arc<CompiledUnit>, CompileError> {
        let tracer = Name::from(TRACER_ARG);
        let shares_frame = unit
            .nested_units()
            .any(|nested| !nested.creates_new_local_frame);
        let mut cg = CodeGenerator::from_unit(unit, self.isa);
        if top {
            cg.args.insert(0, tracer.clone());
            cg.positional_only_count += 1;
            if shares_frame {
                cg.cellvars.push(tracer.clone());
            }
        } else {
            cg.freevars.push(tracer.clone());
        }
        let load_tracer = if top && !shares_frame {
            Op::LoadFast(tracer.clone())
        } else {
            Op::LoadDeref(tracer.clone())
        };

        let mut capture_pending = false;
        for instruction in &unit.instructions {
            if let Some(line) = instruction.line {
                cg.set_lineno(line);
            }
            let op = match &instruction.op {
                Op::LoadConst(Constant::Code(nested)) if !nested.creates_new_local_frame => {
                    capture_pending = true;
                    Op::LoadConst(Constant::Code(self.instrument(nested, false)?))
                }
                Op::MakeFunction {
                    defaults,
                    kw_defaults,
                    captures,
                } if capture_pending => {
                    capture_pending = false;
                    let mut captures = captures.to_vec();
                    captures.push(tracer.clone());
                    Op::MakeFunction {
                        defaults: *defaults,
                        kw_defaults: kw_defaults.clone(),
                        captures: captures.into(),
                    }
                }
                other => {
                    for op in trace_sequence(other, &load_tracer) {
                        cg.emit(op);
                    }
                    other.clone()
                }
            };
            cg.code_ops.push(Instruction::new(op, instruction.line));
        }
        log::trace!("instrumented {} for tracing", unit.name);
        cg.to_unit()
    }
}

/// Net-zero sequence reporting `op` to the tracer before it executes.
fn trace_sequence(op: &Op, load_tracer: &Op) -> SmallVec<[Op; 12]> {
    let hook = |name: &str| Op::LoadAttr(name.into());
    let call = |argc| Op::Call {
        argc,
        kwnames: Vec::new().into(),
    };
    match op {
        Op::LoadAttr(attr) => smallvec![
            Op::DupTop,
            load_tracer.clone(),
            hook("load_attr"),
            Op::RotTwo,
            Op::LoadConst(Constant::Str(attr.clone())),
            call(2),
            Op::PopTop,
        ],
        Op::Call { argc, kwnames } => {
            let positional = *argc - kwnames.len() as u32;
            let shape = Constant::Tuple(
                vec![
                    Constant::Int(i64::from(positional)),
                    Constant::Tuple(kwnames.iter().cloned().map(Constant::Str).collect()),
                ]
                .into(),
            );
            // Unpacking pushes in reverse, so the arguments are repacked and
            // unpacked once more to restore their order.
            smallvec![
                Op::BuildTuple(*argc),
                Op::DupTopTwo,
                load_tracer.clone(),
                hook("call"),
                Op::RotThree,
                Op::LoadConst(shape),
                call(3),
                Op::PopTop,
                Op::UnpackSequence(*argc),
                Op::BuildTuple(*argc),
                Op::UnpackSequence(*argc),
            ]
        }
        Op::BinarySubscr => smallvec![
            Op::DupTopTwo,
            load_tracer.clone(),
            hook("subscript_load"),
            Op::RotThree,
            call(2),
            Op::PopTop,
        ],
        Op::GetIter | Op::ReturnValue => smallvec![
            Op::DupTop,
            load_tracer.clone(),
            hook(if *op == Op::GetIter { "iterate" } else { "return_value" }),
            Op::RotTwo,
            call(1),
            Op::PopTop,
        ],
        _ => SmallVec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{IsaRevision, stack};
    use crate::compiler::Compiler;
    use crate::vm::{self, Env, namespace};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Recorder {
        events: RefCell<Vec<String>>,
    }

    impl Tracer for Recorder {
        fn load_attr(&self, object: &Value, attr: &str) -> Result<(), RuntimeError> {
            self.events
                .borrow_mut()
                .push(format!("load_attr {} {attr}", object.repr()));
            Ok(())
        }

        fn call(
            &self,
            func: &Value,
            args: &[Value],
            kwargs: &[(Name, Value)],
        ) -> Result<(), RuntimeError> {
            self.events.borrow_mut().push(format!(
                "call {} {} {}",
                func.repr(),
                args.len(),
                kwargs.len()
            ));
            Ok(())
        }

        fn iterate(&self, object: &Value) -> Result<(), RuntimeError> {
            self.events.borrow_mut().push(format!("iterate {}", object.repr()));
            Ok(())
        }

        fn return_value(&self, value: &Value) -> Result<(), RuntimeError> {
            self.events.borrow_mut().push(format!("return {}", value.repr()));
            Ok(())
        }
    }

    fn traced(source: &str, revision: IsaRevision) -> Arc<CompiledUnit> {
        let unit = Compiler::new(revision.target())
            .expression(source, "binding")
            .unwrap();
        inject_tracing(&unit, revision.target()).unwrap()
    }

    #[test]
    fn tracer_becomes_the_first_argument() {
        let unit = traced("a.x + b.y", IsaRevision::Compact);
        assert_eq!(unit.arg_names, vec![Name::from(TRACER_ARG)]);
        let hooks = unit
            .instructions
            .iter()
            .filter(|instruction| instruction.op == Op::LoadAttr("load_attr".into()))
            .count();
        assert_eq!(hooks, 2);
        assert!(stack::simulate(&unit.instructions, unit.kind).is_ok());
    }

    #[test]
    fn frame_sharing_units_get_the_tracer_through_a_cell() {
        let unit = traced("[item.x for item in items]", IsaRevision::Classic);
        assert_eq!(unit.cellvars, vec![Name::from(TRACER_ARG)]);
        let comprehension = unit.nested_units().next().unwrap();
        assert_eq!(comprehension.freevars, vec![Name::from(TRACER_ARG)]);
        assert!(
            comprehension
                .instructions
                .iter()
                .any(|instruction| instruction.op == Op::LoadDeref(TRACER_ARG.into()))
        );
    }

    #[test]
    fn traced_units_report_in_execution_order() {
        for revision in [IsaRevision::Classic, IsaRevision::Compact] {
            let unit = traced("namespace(x=point.x, y=point.y)", revision);
            let globals = namespace();
            globals.borrow_mut().insert(
                "point".into(),
                Value::record([("x".into(), Value::Int(3)), ("y".into(), Value::Int(4))]),
            );
            let recorder = Rc::new(Recorder::default());
            let result = vm::run(
                &unit,
                Env::module(globals),
                vec![Value::Tracer(recorder.clone())],
            )
            .unwrap();
            assert_eq!(result.repr(), "namespace(x=3, y=4)");
            assert_eq!(
                *recorder.events.borrow(),
                vec![
                    "load_attr namespace(x=3, y=4) x".to_owned(),
                    "load_attr namespace(x=3, y=4) y".to_owned(),
                    "call <built-in function namespace> 0 2".to_owned(),
                    "return namespace(x=3, y=4)".to_owned(),
                ]
            );
        }
    }

    #[test]
    fn comprehensions_report_iteration() {
        let unit = traced("[n * 2 for n in values]", IsaRevision::Compact);
        let globals = namespace();
        globals.borrow_mut().insert(
            "values".into(),
            Value::list(vec![Value::Int(1), Value::Int(2)]),
        );
        let recorder = Rc::new(Recorder::default());
        let result = vm::run(&unit, Env::module(globals), vec![Value::Tracer(recorder.clone())])
            .unwrap();
        assert_eq!(result.repr(), "[2, 4]");
        let events = recorder.events.borrow();
        assert!(events.iter().any(|event| event.starts_with("iterate [1, 2]")));
        assert_eq!(events.last().map(String::as_str), Some("return [2, 4]"));
    }
}
