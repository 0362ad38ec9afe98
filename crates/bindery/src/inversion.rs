//! Expression inversion.
//!
//! An invertible expression is one whose last operation is a read that has a
//! natural write form: a bare name, an attribute, a subscript or a
//! `getattr(obj, name)` call. [`inject_inversion`] keeps everything leading up
//! to that read and replaces the read itself with a call into an [`Inverter`],
//! passing along the value being written.

use smallvec::{SmallVec, smallvec};
use std::sync::Arc;

use crate::bytecode::{Constant, Op, TargetIsa, stack};
use crate::codegen::{CodeGenerator, CompiledUnit};
use crate::error::{CompileError, RuntimeError};
use crate::vm::Value;

pub const INVERTER_ARG: &str = "_[inverter]";
pub const VALUE_ARG: &str = "_[value]";

/// Write forms of the invertible reads. Unimplemented forms refuse.
pub trait Inverter {
    fn load_name(&self, _name: &str, _value: Value) -> Result<(), RuntimeError> {
        Err(RuntimeError::inversion_refused("load_name"))
    }

    fn load_attr(&self, _object: &Value, _attr: &str, _value: Value) -> Result<(), RuntimeError> {
        Err(RuntimeError::inversion_refused("load_attr"))
    }

    fn call(&self, _func: &Value, _args: &[Value], _value: Value) -> Result<(), RuntimeError> {
        Err(RuntimeError::inversion_refused("call"))
    }

    fn subscript_load(
        &self,
        _object: &Value,
        _index: &Value,
        _value: Value,
    ) -> Result<(), RuntimeError> {
        Err(RuntimeError::inversion_refused("subscript_load"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InverterHook {
    LoadName,
    LoadAttr,
    Call,
    SubscriptLoad,
}

impl InverterHook {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "load_name" => Self::LoadName,
            "load_attr" => Self::LoadAttr,
            "call" => Self::Call,
            "subscript_load" => Self::SubscriptLoad,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::LoadName => "load_name",
            Self::LoadAttr => "load_attr",
            Self::Call => "call",
            Self::SubscriptLoad => "subscript_load",
        }
    }

    fn arity(self) -> usize {
        match self {
            Self::LoadName => 2,
            _ => 3,
        }
    }
}

pub fn dispatch(
    inverter: &dyn Inverter,
    hook: InverterHook,
    mut args: Vec<Value>,
) -> Result<(), RuntimeError> {
    if args.len() != hook.arity() {
        return Err(RuntimeError::type_error(format!(
            "{}() takes {} arguments ({} given)",
            hook.name(),
            hook.arity(),
            args.len()
        )));
    }
    let value = args.pop().unwrap_or(Value::None);
    match (hook, args.as_slice()) {
        (InverterHook::LoadName, [Value::Str(name)]) => inverter.load_name(name, value),
        (InverterHook::LoadAttr, [object, Value::Str(attr)]) => {
            inverter.load_attr(object, attr, value)
        }
        (InverterHook::Call, [func, Value::Tuple(call_args)]) => {
            inverter.call(func, call_args, value)
        }
        (InverterHook::SubscriptLoad, [object, index]) => {
            inverter.subscript_load(object, index, value)
        }
        _ => Err(RuntimeError::type_error(format!(
            "bad arguments for inverter {}()",
            hook.name()
        ))),
    }
}

/// Returns a unit taking `(inverter, value)` that performs the write form of
/// the last read in `unit`.
pub fn inject_inversion(
    unit: &CompiledUnit,
    isa: &'static dyn TargetIsa,
) -> Result<Arc<CompiledUnit>, CompileError> {
    let not_invertible = |op: &Op| CompileError::NotInvertible {
        instruction: op.to_string(),
    };
    let [body @ .., terminal, last] = unit.instructions.as_slice() else {
        return Err(CompileError::NotInvertible {
            instruction: "empty expression".into(),
        });
    };
    if last.op != Op::ReturnValue {
        return Err(not_invertible(&last.op));
    }

    let inverter = || Op::LoadFast(INVERTER_ARG.into());
    let value = || Op::LoadFast(VALUE_ARG.into());
    let hook = |name: &str| Op::LoadAttr(name.into());
    let call = |argc| Op::Call {
        argc,
        kwnames: Vec::new().into(),
    };
    let replacement: SmallVec<[Op; 8]> = match &terminal.op {
        Op::LoadName(name) | Op::LoadGlobal(name) | Op::LoadDynamic(name) if body.is_empty() => {
            smallvec![
                inverter(),
                hook("load_name"),
                Op::LoadConst(Constant::Str(name.clone())),
                value(),
                call(2),
            ]
        }
        Op::LoadAttr(attr) => smallvec![
            inverter(),
            hook("load_attr"),
            Op::RotTwo,
            Op::LoadConst(Constant::Str(attr.clone())),
            value(),
            call(3),
        ],
        Op::BinarySubscr => smallvec![
            inverter(),
            hook("subscript_load"),
            Op::RotThree,
            value(),
            call(3),
        ],
        Op::Call { argc, kwnames }
            if kwnames.is_empty()
                && (2..=3).contains(argc)
                && calls_getattr(unit, body.len(), *argc)? =>
        {
            smallvec![
                Op::BuildTuple(*argc),
                inverter(),
                hook("call"),
                Op::RotThree,
                value(),
                call(3),
            ]
        }
        other => return Err(not_invertible(other)),
    };

    let mut cg = CodeGenerator::from_unit(unit, isa);
    cg.args.insert(0, VALUE_ARG.into());
    cg.args.insert(0, INVERTER_ARG.into());
    cg.positional_only_count += 2;
    cg.extend(body.iter().cloned());
    if let Some(line) = terminal.line {
        cg.set_lineno(line);
    }
    for op in replacement {
        cg.emit(op);
    }
    cg.return_value();
    log::trace!("inverted {} at {}", unit.name, terminal.op);
    cg.to_unit()
}

/// The callee of the call at `index` was loaded by name as `getattr`.
fn calls_getattr(unit: &CompiledUnit, index: usize, argc: u32) -> Result<bool, CompileError> {
    let report = stack::simulate(&unit.instructions, unit.kind)
        .map_err(|error| CompileError::Malformed(error.to_string()))?;
    let Some(producer) = report.producer(index, argc as usize) else {
        return Ok(false);
    };
    Ok(matches!(
        &unit.instructions[producer].op,
        Op::LoadName(name) | Op::LoadGlobal(name) | Op::LoadDynamic(name)
            if &**name == "getattr"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{IsaRevision, Name};
    use crate::compiler::Compiler;
    use crate::error::ErrorKind;
    use crate::vm::{self, Env, namespace};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn invert(source: &str) -> Result<Arc<CompiledUnit>, CompileError> {
        let isa = IsaRevision::Classic.target();
        let unit = Compiler::new(isa).expression(source, "binding").unwrap();
        inject_inversion(&unit, isa)
    }

    #[derive(Default)]
    struct Recorder {
        writes: RefCell<Vec<String>>,
    }

    impl Inverter for Recorder {
        fn load_attr(&self, object: &Value, attr: &str, value: Value) -> Result<(), RuntimeError> {
            self.writes
                .borrow_mut()
                .push(format!("{}.{attr} = {}", object.repr(), value.repr()));
            Ok(())
        }

        fn call(&self, func: &Value, args: &[Value], value: Value) -> Result<(), RuntimeError> {
            self.writes
                .borrow_mut()
                .push(format!("{}{:?} = {}", func.repr(), args, value.repr()));
            Ok(())
        }
    }

    #[test]
    fn supported_terminals_are_inverted() {
        for source in ["x", "a.b.c", "items[0]", "getattr(obj, 'name')", "getattr(obj, key, 1)"] {
            let unit = invert(source).unwrap();
            assert_eq!(
                unit.arg_names,
                vec![Name::from(INVERTER_ARG), Name::from(VALUE_ARG)],
                "{source}"
            );
        }
    }

    #[test]
    fn other_terminals_are_rejected_by_mnemonic() {
        let cases = [
            ("f(x, y, z)", "CALL 3"),
            ("a + b", "BINARY_OP +"),
            ("getattr(obj, 'name', default=1)", "CALL 3 kw=default"),
            ("-x", "UNARY_OP Negate"),
            ("1", "LOAD_CONST 1"),
        ];
        for (source, instruction) in cases {
            assert_eq!(
                invert(source).unwrap_err(),
                CompileError::NotInvertible {
                    instruction: instruction.into()
                },
                "{source}"
            );
        }
    }

    #[test]
    fn inverted_units_route_writes_to_the_inverter() {
        let globals = namespace();
        globals.borrow_mut().insert(
            "point".into(),
            Value::record([("x".into(), Value::Int(1))]),
        );
        let recorder = Rc::new(Recorder::default());
        let inverter: Rc<dyn Inverter> = recorder.clone();

        let unit = invert("point.x").unwrap();
        vm::run(
            &unit,
            Env::module(globals.clone()),
            vec![Value::Inverter(inverter.clone()), Value::Int(5)],
        )
        .unwrap();

        let unit = invert("getattr(point, 'x')").unwrap();
        vm::run(
            &unit,
            Env::module(globals),
            vec![Value::Inverter(inverter), Value::Int(6)],
        )
        .unwrap();

        assert_eq!(
            *recorder.writes.borrow(),
            vec![
                "namespace(x=1).x = 5".to_owned(),
                "<built-in function getattr>[namespace(x=1), 'x'] = 6".to_owned(),
            ]
        );
    }

    #[test]
    fn default_inverters_refuse() {
        struct Refusing;
        impl Inverter for Refusing {}
        let unit = invert("x").unwrap();
        let error = vm::run(
            &unit,
            Env::module(namespace()),
            vec![Value::Inverter(Rc::new(Refusing)), Value::None],
        )
        .unwrap_err();
        assert_eq!(
            error.kind,
            ErrorKind::InversionRefused {
                operation: "load_name"
            }
        );
    }
}
