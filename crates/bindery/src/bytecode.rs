//! Abstract instruction vocabulary.
//!
//! Every component that builds or rewrites code works on [`Instruction`]s made of
//! these [`Op`]s. Concrete encodings only appear after a [`TargetIsa`] lowers a
//! finished stream (see [`isa`]).

use ordered_float::OrderedFloat;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::codegen::CompiledUnit;

pub mod isa;
pub use isa::{GuardRange, IsaRevision, MachineCode, MachineOp, TargetIsa};

pub mod stack;
pub use stack::{StackError, StackReport};

pub type Name = Arc<str>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Label(pub u32);

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Whether a unit yields a value (expression) or runs for its effects (statement).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum UnitKind {
    Expression,
    Statement,
}

#[derive(Debug, Clone, Serialize)]
pub enum Constant {
    None,
    Bool(bool),
    Int(i64),
    Float(OrderedFloat<f64>),
    Str(Name),
    Tuple(Arc<[Constant]>),
    Code(Arc<CompiledUnit>),
}

impl PartialEq for Constant {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Tuple(a), Self::Tuple(b)) => a == b,
            (Self::Code(a), Self::Code(b)) => {
                Arc::ptr_eq(a, b) || (a.name == b.name && a.instructions == b.instructions)
            }
            _ => false,
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Bool(true) => write!(f, "True"),
            Self::Bool(false) => write!(f, "False"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{:?}", value.into_inner()),
            Self::Str(value) => write!(f, "{value:?}"),
            Self::Tuple(items) => {
                write!(f, "(")?;
                for (index, item) in items.iter().enumerate() {
                    if index > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                if items.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
            Self::Code(unit) => write!(f, "<code {}>", unit.name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    FloorDivide,
    Modulo,
    Power,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum UnaryOp {
    Negate,
    Plus,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CompareOp {
    Equal,
    NotEqual,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
    In,
    NotIn,
    Is,
    IsNot,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Subtract => "-",
            Self::Multiply => "*",
            Self::Divide => "/",
            Self::FloorDivide => "//",
            Self::Modulo => "%",
            Self::Power => "**",
        }
    }
}

impl CompareOp {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Equal => "==",
            Self::NotEqual => "!=",
            Self::Less => "<",
            Self::LessOrEqual => "<=",
            Self::Greater => ">",
            Self::GreaterOrEqual => ">=",
            Self::In => "in",
            Self::NotIn => "not in",
            Self::Is => "is",
            Self::IsNot => "is not",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Op {
    LoadConst(Constant),

    // Name-namespace access (module level code).
    LoadName(Name),
    StoreName(Name),
    DeleteName(Name),

    // Per-call locals.
    LoadFast(Name),
    StoreFast(Name),
    DeleteFast(Name),

    LoadGlobal(Name),
    StoreGlobal(Name),
    DeleteGlobal(Name),

    // Layered dynamic scope.
    LoadDynamic(Name),
    StoreDynamic(Name),
    DeleteDynamic(Name),

    // Closure cells.
    LoadDeref(Name),
    StoreDeref(Name),

    LoadAttr(Name),
    StoreAttr(Name),
    DeleteAttr(Name),

    BinarySubscr,
    StoreSubscr,
    DeleteSubscr,

    Binary(BinaryOp),
    Unary(UnaryOp),
    Compare(CompareOp),

    /// `argc` counts positional and keyword values; the last `kwnames.len()`
    /// values are passed by keyword.
    Call {
        argc: u32,
        kwnames: Arc<[Name]>,
    },
    BuildTuple(u32),
    BuildList(u32),
    BuildMap(u32),
    /// Appends TOS to the list `n` slots below it (comprehensions).
    ListAppend(u32),
    /// Pops a code constant, `defaults` positional defaults and one value per
    /// keyword-only default, captures the named cells of the running frame.
    MakeFunction {
        defaults: u32,
        kw_defaults: Arc<[Name]>,
        captures: Arc<[Name]>,
    },

    ReturnValue,
    PopTop,
    DupTop,
    DupTopTwo,
    RotTwo,
    RotThree,
    UnpackSequence(u32),

    GetIter,
    ForIter(Label),

    Jump(Label),
    PopJumpIfFalse(Label),
    PopJumpIfTrue(Label),
    JumpIfFalseOrPop(Label),
    JumpIfTrueOrPop(Label),

    /// Guarded block markers: errors raised between `GuardBegin` and `GuardEnd`
    /// continue at the handler label with the stack unwound to the entry depth.
    GuardBegin(Label),
    GuardEnd,
    /// Re-raises the error caught by the innermost guard, with the trace squashed.
    Reraise,

    Label(Label),
}

impl Op {
    /// `(pops, pushes)` for the fall-through path.
    pub fn stack_effect(&self) -> (u32, u32) {
        match self {
            Self::LoadConst(_)
            | Self::LoadName(_)
            | Self::LoadFast(_)
            | Self::LoadGlobal(_)
            | Self::LoadDynamic(_)
            | Self::LoadDeref(_) => (0, 1),
            Self::StoreName(_)
            | Self::StoreFast(_)
            | Self::StoreGlobal(_)
            | Self::StoreDynamic(_)
            | Self::StoreDeref(_) => (1, 0),
            Self::DeleteName(_)
            | Self::DeleteFast(_)
            | Self::DeleteGlobal(_)
            | Self::DeleteDynamic(_) => (0, 0),
            Self::LoadAttr(_) => (1, 1),
            Self::StoreAttr(_) => (2, 0),
            Self::DeleteAttr(_) => (1, 0),
            Self::BinarySubscr => (2, 1),
            Self::StoreSubscr => (3, 0),
            Self::DeleteSubscr => (2, 0),
            Self::Binary(_) | Self::Compare(_) => (2, 1),
            Self::Unary(_) => (1, 1),
            Self::Call { argc, .. } => (argc + 1, 1),
            Self::BuildTuple(count) | Self::BuildList(count) => (*count, 1),
            Self::BuildMap(count) => (count * 2, 1),
            Self::ListAppend(depth) => (depth + 1, *depth),
            Self::MakeFunction {
                defaults,
                kw_defaults,
                ..
            } => (defaults + kw_defaults.len() as u32 + 1, 1),
            Self::ReturnValue => (1, 0),
            Self::PopTop => (1, 0),
            Self::DupTop => (1, 2),
            Self::DupTopTwo => (2, 4),
            Self::RotTwo => (2, 2),
            Self::RotThree => (3, 3),
            Self::UnpackSequence(count) => (1, *count),
            Self::GetIter => (1, 1),
            Self::ForIter(_) => (1, 2),
            Self::Jump(_) => (0, 0),
            Self::PopJumpIfFalse(_) | Self::PopJumpIfTrue(_) => (1, 0),
            Self::JumpIfFalseOrPop(_) | Self::JumpIfTrueOrPop(_) => (1, 0),
            Self::GuardBegin(_) | Self::GuardEnd | Self::Reraise | Self::Label(_) => (0, 0),
        }
    }

    /// Branch target and the `(pops, pushes)` applied when the branch is taken.
    pub fn branch(&self) -> Option<(Label, (u32, u32))> {
        match self {
            Self::ForIter(label) => Some((*label, (1, 0))),
            Self::Jump(label) => Some((*label, (0, 0))),
            Self::PopJumpIfFalse(label) | Self::PopJumpIfTrue(label) => Some((*label, (1, 0))),
            Self::JumpIfFalseOrPop(label) | Self::JumpIfTrueOrPop(label) => {
                Some((*label, (1, 1)))
            }
            Self::GuardBegin(label) => Some((*label, (0, 0))),
            _ => None,
        }
    }

    /// Control never falls through to the next instruction.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ReturnValue | Self::Jump(_) | Self::Reraise)
    }

    pub fn nested_unit(&self) -> Option<&Arc<CompiledUnit>> {
        match self {
            Self::LoadConst(Constant::Code(unit)) => Some(unit),
            _ => None,
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::LoadConst(constant) => write!(f, "LOAD_CONST {constant}"),
            Self::LoadName(name) => write!(f, "LOAD_NAME {name}"),
            Self::StoreName(name) => write!(f, "STORE_NAME {name}"),
            Self::DeleteName(name) => write!(f, "DELETE_NAME {name}"),
            Self::LoadFast(name) => write!(f, "LOAD_FAST {name}"),
            Self::StoreFast(name) => write!(f, "STORE_FAST {name}"),
            Self::DeleteFast(name) => write!(f, "DELETE_FAST {name}"),
            Self::LoadGlobal(name) => write!(f, "LOAD_GLOBAL {name}"),
            Self::StoreGlobal(name) => write!(f, "STORE_GLOBAL {name}"),
            Self::DeleteGlobal(name) => write!(f, "DELETE_GLOBAL {name}"),
            Self::LoadDynamic(name) => write!(f, "LOAD_DYNAMIC {name}"),
            Self::StoreDynamic(name) => write!(f, "STORE_DYNAMIC {name}"),
            Self::DeleteDynamic(name) => write!(f, "DELETE_DYNAMIC {name}"),
            Self::LoadDeref(name) => write!(f, "LOAD_DEREF {name}"),
            Self::StoreDeref(name) => write!(f, "STORE_DEREF {name}"),
            Self::LoadAttr(name) => write!(f, "LOAD_ATTR {name}"),
            Self::StoreAttr(name) => write!(f, "STORE_ATTR {name}"),
            Self::DeleteAttr(name) => write!(f, "DELETE_ATTR {name}"),
            Self::BinarySubscr => write!(f, "BINARY_SUBSCR"),
            Self::StoreSubscr => write!(f, "STORE_SUBSCR"),
            Self::DeleteSubscr => write!(f, "DELETE_SUBSCR"),
            Self::Binary(op) => write!(f, "BINARY_OP {}", op.symbol()),
            Self::Unary(op) => write!(f, "UNARY_OP {op:?}"),
            Self::Compare(op) => write!(f, "COMPARE_OP {}", op.symbol()),
            Self::Call { argc, kwnames } if kwnames.is_empty() => write!(f, "CALL {argc}"),
            Self::Call { argc, kwnames } => write!(f, "CALL {argc} kw={}", kwnames.join(",")),
            Self::BuildTuple(count) => write!(f, "BUILD_TUPLE {count}"),
            Self::BuildList(count) => write!(f, "BUILD_LIST {count}"),
            Self::BuildMap(count) => write!(f, "BUILD_MAP {count}"),
            Self::ListAppend(depth) => write!(f, "LIST_APPEND {depth}"),
            Self::MakeFunction { defaults, captures, .. } => {
                write!(f, "MAKE_FUNCTION defaults={defaults} captures=[{}]", captures.join(","))
            }
            Self::ReturnValue => write!(f, "RETURN_VALUE"),
            Self::PopTop => write!(f, "POP_TOP"),
            Self::DupTop => write!(f, "DUP_TOP"),
            Self::DupTopTwo => write!(f, "DUP_TOP_TWO"),
            Self::RotTwo => write!(f, "ROT_TWO"),
            Self::RotThree => write!(f, "ROT_THREE"),
            Self::UnpackSequence(count) => write!(f, "UNPACK_SEQUENCE {count}"),
            Self::GetIter => write!(f, "GET_ITER"),
            Self::ForIter(label) => write!(f, "FOR_ITER {label}"),
            Self::Jump(label) => write!(f, "JUMP {label}"),
            Self::PopJumpIfFalse(label) => write!(f, "POP_JUMP_IF_FALSE {label}"),
            Self::PopJumpIfTrue(label) => write!(f, "POP_JUMP_IF_TRUE {label}"),
            Self::JumpIfFalseOrPop(label) => write!(f, "JUMP_IF_FALSE_OR_POP {label}"),
            Self::JumpIfTrueOrPop(label) => write!(f, "JUMP_IF_TRUE_OR_POP {label}"),
            Self::GuardBegin(label) => write!(f, "GUARD_BEGIN {label}"),
            Self::GuardEnd => write!(f, "GUARD_END"),
            Self::Reraise => write!(f, "RERAISE"),
            Self::Label(label) => write!(f, "{label}:"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Instruction {
    pub op: Op,
    pub line: Option<u32>,
}

impl Instruction {
    pub fn new(op: Op, line: Option<u32>) -> Self {
        Self { op, line }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{line:>4}  {}", self.op),
            None => write!(f, "      {}", self.op),
        }
    }
}
