//! Stack machine executing lowered units.
//!
//! Both instruction set revisions run on the same frame loop; the only
//! revision-specific state is the pending keyword-name list of compact calls
//! and the block stack of classic guards.

use std::cell::{Cell as Counter, RefCell};
use std::rc::Rc;
use std::sync::Arc;

use crate::bytecode::{IsaRevision, MachineOp, Name};
use crate::codegen::CompiledUnit;
use crate::dynamic_scope::DynamicScope;
use crate::error::{ErrorKind, RuntimeError, TraceEntry};
use crate::{inversion, tracing};

pub mod builtins;
pub mod ops;
mod value;

pub use builtins::Builtin;
pub use value::{
    Cell, Dict, DictKey, Function, IterState, Method, Namespace, Number, Value, namespace,
};

const MAX_DEPTH: usize = 128;

/// Native stack a chain of nested calls may consume, measured from the
/// outermost frame. Test threads get 2 MiB, so this stays well under.
const STACK_BUDGET: usize = 512 * 1024;

thread_local! {
    static DEPTH: Counter<usize> = const { Counter::new(0) };
    static STACK_BASE: Counter<usize> = const { Counter::new(0) };
}

/// Name resolution context of a running unit.
#[derive(Clone)]
pub struct Env {
    pub globals: Namespace,
    /// Target of name-namespace ops; falls back to `globals` when absent.
    pub names: Option<Namespace>,
    pub scope: Option<Rc<DynamicScope>>,
}

impl Env {
    pub fn module(globals: Namespace) -> Self {
        Self {
            globals,
            names: None,
            scope: None,
        }
    }

    pub fn dynamic(scope: Rc<DynamicScope>) -> Self {
        Self {
            globals: scope.globals().clone(),
            names: None,
            scope: Some(scope),
        }
    }
}

/// Runs a top-level unit with positional arguments.
pub fn run(unit: &Arc<CompiledUnit>, env: Env, args: Vec<Value>) -> Result<Value, RuntimeError> {
    Function {
        unit: unit.clone(),
        globals: env.globals,
        defaults: Vec::new(),
        kw_defaults: Vec::new(),
        closure: Vec::new(),
        names: env.names,
        scope: env.scope,
    }
    .call(args, Vec::new())
}

/// Calls any callable value.
pub fn call(
    callee: &Value,
    args: Vec<Value>,
    kwargs: Vec<(Name, Value)>,
) -> Result<Value, RuntimeError> {
    match callee {
        Value::Function(function) => function.call(args, kwargs),
        Value::Builtin(builtin) => builtin.call(args, kwargs),
        Value::BoundFunction(bound) => bound.call(args, kwargs),
        Value::Nonlocals(nonlocals) if kwargs.is_empty() => nonlocals.call(&args),
        Value::Method(method) => {
            if !kwargs.is_empty() && !matches!(method.as_ref(), Method::Native { .. }) {
                return Err(RuntimeError::type_error(
                    "capability methods take no keyword arguments",
                ));
            }
            match method.as_ref() {
                Method::Tracer(tracer, hook) => {
                    tracing::dispatch(tracer.as_ref(), *hook, &args).map(|()| Value::None)
                }
                Method::Inverter(inverter, hook) => {
                    inversion::dispatch(inverter.as_ref(), *hook, args).map(|()| Value::None)
                }
                Method::Native { receiver, name } => ops::call_native(receiver, name, args, kwargs),
            }
        }
        other => Err(RuntimeError::type_error(format!(
            "'{}' object is not callable",
            other.type_name()
        ))),
    }
}

/// Address of a local in the caller's frame.
#[inline(never)]
fn stack_position() -> usize {
    let marker = 0u8;
    std::hint::black_box(&marker) as *const u8 as usize
}

/// Bounds nested calls by count and by native stack consumed, whichever
/// runs out first. Bindings reading other bindings nest native frames
/// that never pass through the count, so the byte budget is authoritative.
struct DepthGuard;

impl DepthGuard {
    fn enter() -> Result<Self, RuntimeError> {
        let position = stack_position();
        DEPTH.with(|depth| {
            let exceeded = if depth.get() == 0 {
                STACK_BASE.with(|base| base.set(position));
                false
            } else {
                depth.get() >= MAX_DEPTH
                    || STACK_BASE.with(|base| base.get().abs_diff(position) > STACK_BUDGET)
            };
            if exceeded {
                return Err(RuntimeError::value_error("maximum recursion depth exceeded"));
            }
            depth.set(depth.get() + 1);
            Ok(Self)
        })
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

impl Function {
    pub fn call(&self, args: Vec<Value>, kwargs: Vec<(Name, Value)>) -> Result<Value, RuntimeError> {
        let _depth = DepthGuard::enter()?;
        let unit = &self.unit;
        let mut fast = self.bind_arguments(args, kwargs)?;
        if self.closure.len() != unit.freevars.len() {
            return Err(RuntimeError::type_error(format!(
                "{} needs {} closure cells, got {}",
                unit.name,
                unit.freevars.len(),
                self.closure.len()
            )));
        }
        let mut cells: Vec<Cell> = unit
            .cellvars
            .iter()
            .map(|name| {
                let initial = unit
                    .arg_names
                    .iter()
                    .position(|arg| arg == name)
                    .and_then(|slot| fast[slot].take());
                Rc::new(RefCell::new(initial))
            })
            .collect();
        cells.extend(self.closure.iter().cloned());
        let env = Env {
            globals: self.globals.clone(),
            names: if unit.creates_new_local_frame {
                None
            } else {
                self.names.clone()
            },
            scope: self.scope.clone(),
        };
        Frame {
            unit,
            env,
            fast,
            cells,
            stack: Vec::with_capacity(unit.stack_size as usize),
            guards: Vec::new(),
            kwnames: None,
            caught: None,
        }
        .run()
    }

    /// Distributes call arguments over the parameter slots of the unit.
    fn bind_arguments(
        &self,
        args: Vec<Value>,
        kwargs: Vec<(Name, Value)>,
    ) -> Result<Vec<Option<Value>>, RuntimeError> {
        let unit = &self.unit;
        let name = &unit.name;
        let positional = unit.positional_count();
        let keyword_only = unit.keyword_only_count as usize;
        let mut slots: Vec<Option<Value>> = vec![None; unit.varnames.len()];

        let given = args.len();
        let mut extra = Vec::new();
        for (index, arg) in args.into_iter().enumerate() {
            if index < positional {
                slots[index] = Some(arg);
            } else if unit.has_varargs {
                extra.push(arg);
            } else {
                return Err(RuntimeError::type_error(format!(
                    "{name}() takes {positional} positional arguments but {given} were given"
                )));
            }
        }

        let first_keyword = unit.positional_only_count as usize;
        let mut extra_keywords = indexmap::IndexMap::new();
        for (keyword, value) in kwargs {
            let slot = unit.arg_names[..positional + keyword_only]
                .iter()
                .position(|arg| *arg == keyword)
                .filter(|slot| *slot >= first_keyword);
            match slot {
                Some(slot) if slots[slot].is_some() => {
                    return Err(RuntimeError::type_error(format!(
                        "{name}() got multiple values for argument '{keyword}'"
                    )));
                }
                Some(slot) => slots[slot] = Some(value),
                None if unit.has_varkwargs => {
                    extra_keywords.insert(DictKey::Str(Rc::from(&*keyword)), value);
                }
                None => {
                    return Err(RuntimeError::type_error(format!(
                        "{name}() got an unexpected keyword argument '{keyword}'"
                    )));
                }
            }
        }

        let first_default = positional.saturating_sub(self.defaults.len());
        for slot in 0..positional {
            if slots[slot].is_none() {
                if slot < first_default {
                    return Err(RuntimeError::type_error(format!(
                        "{name}() missing required argument '{}'",
                        unit.arg_names[slot]
                    )));
                }
                slots[slot] = Some(self.defaults[slot - first_default].clone());
            }
        }
        for slot in positional..positional + keyword_only {
            if slots[slot].is_none() {
                let arg = &unit.arg_names[slot];
                let default = self
                    .kw_defaults
                    .iter()
                    .find(|(name, _)| name == arg)
                    .map(|(_, value)| value.clone())
                    .ok_or_else(|| {
                        RuntimeError::type_error(format!(
                            "{name}() missing required keyword-only argument '{arg}'"
                        ))
                    })?;
                slots[slot] = Some(default);
            }
        }

        let mut next = positional + keyword_only;
        if unit.has_varargs {
            slots[next] = Some(Value::tuple(extra));
            next += 1;
        }
        if unit.has_varkwargs {
            slots[next] = Some(Value::Dict(Rc::new(RefCell::new(extra_keywords))));
        }
        Ok(slots)
    }
}

enum Flow {
    Next,
    Jump(u32),
    Return(Value),
}

struct Frame<'u> {
    unit: &'u CompiledUnit,
    env: Env,
    fast: Vec<Option<Value>>,
    cells: Vec<Cell>,
    stack: Vec<Value>,
    /// Classic guard blocks: handler index and stack depth at entry.
    guards: Vec<(u32, usize)>,
    /// Keyword names announced for the next compact call.
    kwnames: Option<Arc<[Name]>>,
    caught: Option<RuntimeError>,
}

fn underflow() -> RuntimeError {
    RuntimeError::value_error("value stack underflow")
}

impl Frame<'_> {
    fn run(mut self) -> Result<Value, RuntimeError> {
        let unit = self.unit;
        let code = &unit.code;
        let mut pc = 0usize;
        loop {
            let Some(op) = code.ops.get(pc) else {
                return Err(RuntimeError::value_error(format!(
                    "execution ran past the end of {}",
                    self.unit.name
                )));
            };
            match self.step(op) {
                Ok(Flow::Next) => pc += 1,
                Ok(Flow::Jump(target)) => pc = target as usize,
                Ok(Flow::Return(value)) => return Ok(value),
                Err(mut error) => {
                    if let Some((handler, depth)) = self.guard_for(pc) {
                        self.stack.truncate(depth);
                        error.trace.clear();
                        self.caught = Some(error);
                        pc = handler as usize;
                        continue;
                    }
                    error.trace.push(TraceEntry {
                        unit: self.unit.name.clone(),
                        line: code.lines.get(pc).copied().flatten(),
                    });
                    return Err(error);
                }
            }
        }
    }

    fn guard_for(&mut self, pc: usize) -> Option<(u32, usize)> {
        match self.unit.revision {
            IsaRevision::Classic => self.guards.pop(),
            IsaRevision::Compact => self
                .unit
                .code
                .guard_for(pc)
                .map(|guard| (guard.handler, guard.depth as usize)),
        }
    }

    fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.stack.pop().ok_or_else(underflow)
    }

    fn pop_many(&mut self, count: usize) -> Result<Vec<Value>, RuntimeError> {
        let start = self.stack.len().checked_sub(count).ok_or_else(underflow)?;
        Ok(self.stack.split_off(start))
    }

    fn top(&self) -> Result<&Value, RuntimeError> {
        self.stack.last().ok_or_else(underflow)
    }

    fn peek(&self, depth: usize) -> Result<Value, RuntimeError> {
        let index = self.stack.len().checked_sub(depth).ok_or_else(underflow)?;
        Ok(self.stack[index].clone())
    }

    fn scope(&self) -> Result<&Rc<DynamicScope>, RuntimeError> {
        self.env
            .scope
            .as_ref()
            .ok_or_else(|| RuntimeError::missing_context("no dynamic scope is active"))
    }

    fn names(&self) -> &Namespace {
        self.env.names.as_ref().unwrap_or(&self.env.globals)
    }

    fn load_global(&self, name: &Name) -> Result<Value, RuntimeError> {
        if let Some(value) = self.env.globals.borrow().get(name) {
            return Ok(value.clone());
        }
        builtins::lookup(name).ok_or_else(|| ErrorKind::Name(name.clone()).into())
    }

    fn varname(&self, slot: u32) -> Name {
        self.unit
            .varnames
            .get(slot as usize)
            .cloned()
            .unwrap_or_else(|| Name::from("?"))
    }

    fn cell(&self, slot: u32) -> Result<&Cell, RuntimeError> {
        self.cells
            .get(slot as usize)
            .ok_or_else(|| RuntimeError::value_error(format!("no closure cell {slot}")))
    }

    fn cell_name(&self, slot: u32) -> Name {
        self.unit
            .cellvars
            .iter()
            .chain(&self.unit.freevars)
            .nth(slot as usize)
            .cloned()
            .unwrap_or_else(|| Name::from("?"))
    }

    fn call(&mut self, argc: u32, kwnames: Option<Arc<[Name]>>) -> Result<Flow, RuntimeError> {
        let mut args = self.pop_many(argc as usize)?;
        let callee = self.pop()?;
        let kwargs = match kwnames {
            Some(names) if !names.is_empty() => {
                let start = args.len().checked_sub(names.len()).ok_or_else(underflow)?;
                names.iter().cloned().zip(args.split_off(start)).collect()
            }
            _ => Vec::new(),
        };
        let result = call(&callee, args, kwargs)?;
        self.stack.push(result);
        Ok(Flow::Next)
    }

    fn step(&mut self, op: &MachineOp) -> Result<Flow, RuntimeError> {
        match op {
            MachineOp::LoadConst(constant) => self.stack.push(Value::from_constant(constant)),
            MachineOp::LoadName(name) => {
                let local = self
                    .env
                    .names
                    .as_ref()
                    .and_then(|names| names.borrow().get(name).cloned());
                let value = match local {
                    Some(value) => value,
                    None => self.load_global(name)?,
                };
                self.stack.push(value);
            }
            MachineOp::StoreName(name) => {
                let value = self.pop()?;
                self.names().borrow_mut().insert(name.clone(), value);
            }
            MachineOp::DeleteName(name) => {
                if self.names().borrow_mut().shift_remove(name).is_none() {
                    return Err(ErrorKind::Name(name.clone()).into());
                }
            }
            MachineOp::LoadFast(slot) => {
                let value = self
                    .fast
                    .get(*slot as usize)
                    .cloned()
                    .flatten()
                    .ok_or_else(|| RuntimeError::from(ErrorKind::Name(self.varname(*slot))))?;
                self.stack.push(value);
            }
            MachineOp::StoreFast(slot) => {
                let value = self.pop()?;
                let slot = *slot as usize;
                if slot >= self.fast.len() {
                    self.fast.resize(slot + 1, None);
                }
                self.fast[slot] = Some(value);
            }
            MachineOp::DeleteFast(slot) => {
                let removed = self.fast.get_mut(*slot as usize).and_then(Option::take);
                if removed.is_none() {
                    return Err(ErrorKind::Name(self.varname(*slot)).into());
                }
            }
            MachineOp::LoadGlobal(name) => {
                let value = self.load_global(name)?;
                self.stack.push(value);
            }
            MachineOp::StoreGlobal(name) => {
                let value = self.pop()?;
                self.env.globals.borrow_mut().insert(name.clone(), value);
            }
            MachineOp::DeleteGlobal(name) => {
                if self.env.globals.borrow_mut().shift_remove(name).is_none() {
                    return Err(ErrorKind::Name(name.clone()).into());
                }
            }
            MachineOp::LoadDynamic(name) => {
                let value = self.scope()?.get(name)?;
                self.stack.push(value);
            }
            MachineOp::StoreDynamic(name) => {
                let value = self.pop()?;
                self.scope()?.set(name, value);
            }
            MachineOp::DeleteDynamic(name) => self.scope()?.delete(name)?,
            MachineOp::LoadDeref(slot) => {
                let value = self.cell(*slot)?.borrow().clone();
                let value = value
                    .ok_or_else(|| RuntimeError::from(ErrorKind::Name(self.cell_name(*slot))))?;
                self.stack.push(value);
            }
            MachineOp::StoreDeref(slot) => {
                let value = self.pop()?;
                *self.cell(*slot)?.borrow_mut() = Some(value);
            }
            MachineOp::LoadAttr(attr) => {
                let target = self.pop()?;
                self.stack.push(ops::get_attribute(&target, attr)?);
            }
            MachineOp::StoreAttr(attr) => {
                let target = self.pop()?;
                let value = self.pop()?;
                ops::set_attribute(&target, attr, value)?;
            }
            MachineOp::DeleteAttr(attr) => {
                let target = self.pop()?;
                ops::delete_attribute(&target, attr)?;
            }
            MachineOp::BinarySubscr => {
                let key = self.pop()?;
                let container = self.pop()?;
                self.stack.push(ops::get_item(&container, &key)?);
            }
            MachineOp::StoreSubscr => {
                let key = self.pop()?;
                let container = self.pop()?;
                let value = self.pop()?;
                ops::set_item(&container, &key, value)?;
            }
            MachineOp::DeleteSubscr => {
                let key = self.pop()?;
                let container = self.pop()?;
                ops::delete_item(&container, &key)?;
            }
            MachineOp::Binary(op) => {
                let right = self.pop()?;
                let left = self.pop()?;
                self.stack.push(ops::binary(*op, &left, &right)?);
            }
            MachineOp::Unary(op) => {
                let operand = self.pop()?;
                self.stack.push(ops::unary(*op, &operand)?);
            }
            MachineOp::Compare(op) => {
                let right = self.pop()?;
                let left = self.pop()?;
                self.stack.push(ops::compare(*op, &left, &right)?);
            }
            MachineOp::CallFunction(argc) => return self.call(*argc, None),
            MachineOp::CallFunctionKw(argc) => {
                let names = match self.pop()? {
                    Value::Tuple(names) => names
                        .iter()
                        .map(|name| match name {
                            Value::Str(name) => Ok(Name::from(&**name)),
                            other => Err(RuntimeError::type_error(format!(
                                "keyword names must be strings, not {}",
                                other.type_name()
                            ))),
                        })
                        .collect::<Result<Vec<_>, _>>()?,
                    other => {
                        return Err(RuntimeError::type_error(format!(
                            "keyword names must be a tuple, not {}",
                            other.type_name()
                        )));
                    }
                };
                return self.call(*argc, Some(names.into()));
            }
            MachineOp::KwNames(names) => self.kwnames = Some(names.clone()),
            MachineOp::Call(argc) => {
                let kwnames = self.kwnames.take();
                return self.call(*argc, kwnames);
            }
            MachineOp::BuildTuple(count) => {
                let items = self.pop_many(*count as usize)?;
                self.stack.push(Value::tuple(items));
            }
            MachineOp::BuildList(count) => {
                let items = self.pop_many(*count as usize)?;
                self.stack.push(Value::list(items));
            }
            MachineOp::BuildMap(count) => {
                let flat = self.pop_many(*count as usize * 2)?;
                let mut items = indexmap::IndexMap::new();
                for pair in flat.chunks(2) {
                    items.insert(DictKey::from_value(&pair[0])?, pair[1].clone());
                }
                self.stack.push(Value::Dict(Rc::new(RefCell::new(items))));
            }
            MachineOp::ListAppend(depth) => {
                let item = self.pop()?;
                match self.peek(*depth as usize)? {
                    Value::List(list) => list.borrow_mut().push(item),
                    other => {
                        return Err(RuntimeError::type_error(format!(
                            "cannot append to '{}'",
                            other.type_name()
                        )));
                    }
                }
            }
            MachineOp::MakeFunction {
                defaults,
                kw_defaults,
                captures,
            } => {
                let Value::Code(unit) = self.pop()? else {
                    return Err(RuntimeError::type_error("MAKE_FUNCTION expects a code object"));
                };
                let kw_values = self.pop_many(kw_defaults.len())?;
                let defaults = self.pop_many(*defaults as usize)?;
                let closure = captures
                    .iter()
                    .map(|slot| self.cell(*slot).cloned())
                    .collect::<Result<Vec<_>, _>>()?;
                let inherits = unit.dependent || !unit.creates_new_local_frame;
                let function = Function {
                    globals: self.env.globals.clone(),
                    defaults,
                    kw_defaults: kw_defaults.iter().cloned().zip(kw_values).collect(),
                    closure,
                    names: if unit.creates_new_local_frame {
                        None
                    } else {
                        Some(self.names().clone())
                    },
                    scope: if inherits { self.env.scope.clone() } else { None },
                    unit,
                };
                self.stack.push(Value::Function(Rc::new(function)));
            }
            MachineOp::ReturnValue => return Ok(Flow::Return(self.pop()?)),
            MachineOp::ReturnConst(constant) => {
                return Ok(Flow::Return(Value::from_constant(constant)));
            }
            MachineOp::PopTop => {
                self.pop()?;
            }
            MachineOp::DupTop => {
                let top = self.top()?.clone();
                self.stack.push(top);
            }
            MachineOp::DupTopTwo => {
                let second = self.peek(2)?;
                let first = self.peek(1)?;
                self.stack.push(second);
                self.stack.push(first);
            }
            MachineOp::RotTwo => {
                let len = self.stack.len();
                if len < 2 {
                    return Err(underflow());
                }
                self.stack.swap(len - 1, len - 2);
            }
            MachineOp::RotThree => {
                let top = self.pop()?;
                let len = self.stack.len();
                if len < 2 {
                    return Err(underflow());
                }
                self.stack.insert(len - 2, top);
            }
            MachineOp::Copy(depth) => {
                let value = self.peek(*depth as usize)?;
                self.stack.push(value);
            }
            MachineOp::Swap(depth) => {
                let len = self.stack.len();
                let other = len.checked_sub(*depth as usize).ok_or_else(underflow)?;
                self.stack.swap(len - 1, other);
            }
            MachineOp::UnpackSequence(count) => {
                let sequence = self.pop()?;
                let items = ops::collect(&sequence)?;
                if items.len() != *count as usize {
                    return Err(RuntimeError::value_error(format!(
                        "expected {count} values to unpack, got {}",
                        items.len()
                    )));
                }
                self.stack.extend(items.into_iter().rev());
            }
            MachineOp::GetIter => {
                let iterable = self.pop()?;
                self.stack.push(ops::iterate(&iterable)?);
            }
            MachineOp::ForIter(exit) => {
                let Value::Iterator(state) = self.top()?.clone() else {
                    return Err(RuntimeError::type_error("FOR_ITER expects an iterator"));
                };
                let next = state.borrow_mut().next();
                match next {
                    Some(item) => self.stack.push(item),
                    None => {
                        self.pop()?;
                        return Ok(Flow::Jump(*exit));
                    }
                }
            }
            MachineOp::JumpAbsolute(target)
            | MachineOp::JumpForward(target)
            | MachineOp::JumpBackward(target) => return Ok(Flow::Jump(*target)),
            MachineOp::PopJumpIfFalse(target) => {
                if !self.pop()?.is_truthy() {
                    return Ok(Flow::Jump(*target));
                }
            }
            MachineOp::PopJumpIfTrue(target) => {
                if self.pop()?.is_truthy() {
                    return Ok(Flow::Jump(*target));
                }
            }
            MachineOp::JumpIfFalseOrPop(target) => {
                if !self.top()?.is_truthy() {
                    return Ok(Flow::Jump(*target));
                }
                self.pop()?;
            }
            MachineOp::JumpIfTrueOrPop(target) => {
                if self.top()?.is_truthy() {
                    return Ok(Flow::Jump(*target));
                }
                self.pop()?;
            }
            MachineOp::SetupGuard(handler) => self.guards.push((*handler, self.stack.len())),
            MachineOp::PopGuard => {
                self.guards.pop();
            }
            MachineOp::Reraise => {
                return Err(self
                    .caught
                    .take()
                    .unwrap_or_else(|| RuntimeError::value_error("no error to re-raise")));
            }
        }
        Ok(Flow::Next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Compiler;

    fn globals(pairs: &[(&str, Value)]) -> Namespace {
        let globals = namespace();
        for (name, value) in pairs {
            globals.borrow_mut().insert((*name).into(), value.clone());
        }
        globals
    }

    fn eval(source: &str, revision: IsaRevision) -> Result<Value, RuntimeError> {
        let unit = Compiler::new(revision.target())
            .expression(source, "test")
            .unwrap();
        run(&unit, Env::module(globals(&[("n", Value::Int(4))])), Vec::new())
    }

    fn both(source: &str) -> String {
        let classic = eval(source, IsaRevision::Classic).unwrap();
        let compact = eval(source, IsaRevision::Compact).unwrap();
        assert_eq!(classic, compact, "{source}");
        classic.repr()
    }

    #[test]
    fn expressions_agree_across_revisions() {
        assert_eq!(both("n * 2 + 1"), "9");
        assert_eq!(both("n if n > 3 else -n"), "4");
        assert_eq!(both("n > 1 and n < 3 or 'fallback'"), "'fallback'");
        assert_eq!(both("[i * i for i in range(n) if i % 2]"), "[1, 9]");
        assert_eq!(both("(lambda a, b=2, *rest, k=3: (a, b, rest, k))(1, 5, 6, k=7)"), "(1, 5, (6,), 7)");
        assert_eq!(both("{'a': n, 'b': [n, n]}['b'][1]"), "4");
        assert_eq!(both("(lambda x: lambda y: x + y)(1)(2)"), "3");
        assert_eq!(both("sorted([3, 1, 2], reverse=True)"), "[3, 2, 1]");
        assert_eq!(both("[x + y for x in 'ab' for y in 'cd']"), "['ac', 'ad', 'bc', 'bd']");
    }

    #[test]
    fn blocks_run_statements_in_the_module_namespace() {
        for revision in [IsaRevision::Classic, IsaRevision::Compact] {
            let unit = Compiler::new(revision.target())
                .block(
                    "total = 0\nfor i in range(5):\n    if i == 3:\n        pass\n    else:\n        total += i\nx, y = total, -total\n",
                    "block",
                )
                .unwrap();
            let globals = globals(&[]);
            run(&unit, Env::module(globals.clone()), Vec::new()).unwrap();
            assert_eq!(globals.borrow()["total"], Value::Int(7));
            assert_eq!(globals.borrow()["y"], Value::Int(-7));
        }
    }

    #[test]
    fn errors_carry_a_trace_of_frames() {
        let unit = Compiler::new(IsaRevision::Compact.target())
            .block("def inner():\n    return 1 / 0\n\ninner()\n", "module")
            .unwrap();
        let error = run(&unit, Env::module(globals(&[])), Vec::new()).unwrap_err();
        assert_eq!(error.kind, ErrorKind::ZeroDivision);
        let units: Vec<&str> = error.trace.iter().map(|entry| &*entry.unit).collect();
        assert_eq!(units, vec!["inner", "module"]);
        assert_eq!(error.trace[0].line, Some(2));
    }

    #[test]
    fn guarded_callables_squash_inner_frames() {
        for revision in [IsaRevision::Classic, IsaRevision::Compact] {
            let unit = Compiler::new(revision.target())
                .callable("helper(x)", &["x".into()])
                .unwrap();
            let helper = Compiler::new(revision.target())
                .expression("lambda value: value.missing", "helpers")
                .unwrap();
            let module = globals(&[]);
            let helper = run(&helper, Env::module(module.clone()), Vec::new()).unwrap();
            module.borrow_mut().insert("helper".into(), helper);
            let error = run(&unit, Env::module(module), vec![Value::Int(1)]).unwrap_err();
            assert!(error.is_attribute_error());
            assert_eq!(error.trace.len(), 1, "{revision}");
            assert_eq!(&*error.trace[0].unit, "<callable>");
        }
    }

    #[test]
    fn argument_binding_reports_mistakes() {
        let cases = [
            ("(lambda a: a)()", "missing required argument 'a'"),
            ("(lambda a: a)(1, 2)", "takes 1 positional arguments but 2 were given"),
            ("(lambda a: a)(1, a=2)", "got multiple values for argument 'a'"),
            ("(lambda a: a)(b=2)", "got an unexpected keyword argument 'b'"),
            ("(lambda *, k: k)()", "missing required keyword-only argument 'k'"),
        ];
        for (source, message) in cases {
            let error = eval(source, IsaRevision::Compact).unwrap_err();
            assert!(error.to_string().contains(message), "{source}: {error}");
        }
    }

    #[test]
    fn dynamic_loads_need_a_scope() {
        let unit = Compiler::new(IsaRevision::Compact.target())
            .expression("x", "binding")
            .unwrap();
        let unit = crate::scope_rewriter::rewrite_dynamic(&unit, IsaRevision::Compact.target()).unwrap();
        let error = run(&unit, Env::module(globals(&[])), Vec::new()).unwrap_err();
        assert!(matches!(error.kind, ErrorKind::MissingContext(_)));
    }

    #[test]
    fn runaway_recursion_is_an_error() {
        let unit = Compiler::new(IsaRevision::Compact.target())
            .block("def loop(n):\n    return loop(n + 1)\n\nloop(0)\n", "module")
            .unwrap();
        let error = run(&unit, Env::module(globals(&[])), Vec::new()).unwrap_err();
        assert!(error.to_string().contains("maximum recursion depth"));
    }

    #[test]
    fn recursion_through_comprehensions_is_an_error() {
        for revision in [IsaRevision::Classic, IsaRevision::Compact] {
            let unit = Compiler::new(revision.target())
                .block(
                    "def f(n):\n    return [g for g in [f(n + 1)]]\n\nf(0)\n",
                    "module",
                )
                .unwrap();
            let error = run(&unit, Env::module(globals(&[])), Vec::new()).unwrap_err();
            assert!(error.to_string().contains("maximum recursion depth"), "{error}");
        }
    }

    #[test]
    fn depth_is_released_after_a_failed_recursion() {
        let unit = Compiler::new(IsaRevision::host().target())
            .block("def loop(n):\n    return loop(n + 1)\n\nloop(0)\n", "module")
            .unwrap();
        assert!(run(&unit, Env::module(globals(&[])), Vec::new()).is_err());
        let unit = Compiler::new(IsaRevision::host().target())
            .expression("1 + 1", "binding")
            .unwrap();
        assert_eq!(run(&unit, Env::module(globals(&[])), Vec::new()).unwrap(), Value::Int(2));
    }
}
