//! Target instruction set revisions.
//!
//! The builder and both instrumenters only ever emit abstract [`Op`]s. A
//! [`TargetIsa`] is picked once per [`CompilationContext`](crate::CompilationContext)
//! and turns a finished abstract stream into the concrete [`MachineOp`] encoding
//! that the interpreter executes.

use rustc_hash::FxHashMap;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use super::{BinaryOp, CompareOp, Constant, Instruction, Label, Name, Op, UnaryOp};
use crate::error::CompileError;

/// Concrete instruction encoding. Some variants exist in only one revision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum MachineOp {
    LoadConst(Constant),
    LoadName(Name),
    StoreName(Name),
    DeleteName(Name),
    LoadFast(u32),
    StoreFast(u32),
    DeleteFast(u32),
    LoadGlobal(Name),
    StoreGlobal(Name),
    DeleteGlobal(Name),
    LoadDynamic(Name),
    StoreDynamic(Name),
    DeleteDynamic(Name),
    LoadDeref(u32),
    StoreDeref(u32),
    LoadAttr(Name),
    StoreAttr(Name),
    DeleteAttr(Name),
    BinarySubscr,
    StoreSubscr,
    DeleteSubscr,
    Binary(BinaryOp),
    Unary(UnaryOp),
    Compare(CompareOp),
    // classic calls
    CallFunction(u32),
    CallFunctionKw(u32),
    // compact calls
    KwNames(Arc<[Name]>),
    Call(u32),
    BuildTuple(u32),
    BuildList(u32),
    BuildMap(u32),
    ListAppend(u32),
    MakeFunction {
        defaults: u32,
        kw_defaults: Arc<[Name]>,
        captures: Arc<[u32]>,
    },
    ReturnValue,
    ReturnConst(Constant),
    PopTop,
    DupTop,
    DupTopTwo,
    RotTwo,
    RotThree,
    Copy(u32),
    Swap(u32),
    UnpackSequence(u32),
    GetIter,
    ForIter(u32),
    JumpAbsolute(u32),
    JumpForward(u32),
    JumpBackward(u32),
    PopJumpIfFalse(u32),
    PopJumpIfTrue(u32),
    JumpIfFalseOrPop(u32),
    JumpIfTrueOrPop(u32),
    SetupGuard(u32),
    PopGuard,
    Reraise,
}

impl MachineOp {
    fn target_mut(&mut self) -> Option<&mut u32> {
        match self {
            Self::ForIter(target)
            | Self::JumpAbsolute(target)
            | Self::JumpForward(target)
            | Self::JumpBackward(target)
            | Self::PopJumpIfFalse(target)
            | Self::PopJumpIfTrue(target)
            | Self::JumpIfFalseOrPop(target)
            | Self::JumpIfTrueOrPop(target)
            | Self::SetupGuard(target) => Some(target),
            _ => None,
        }
    }
}

/// Entry of the compact revision's exception table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GuardRange {
    pub start: u32,
    pub end: u32,
    pub handler: u32,
    pub depth: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MachineCode {
    pub ops: Vec<MachineOp>,
    pub lines: Vec<Option<u32>>,
    pub guards: Vec<GuardRange>,
}

impl MachineCode {
    /// Innermost exception-table entry covering `pc`.
    pub fn guard_for(&self, pc: usize) -> Option<&GuardRange> {
        let pc = pc as u32;
        self.guards
            .iter()
            .filter(|guard| guard.start <= pc && pc < guard.end)
            .min_by_key(|guard| guard.end - guard.start)
    }
}

/// Slot numbering the lowering needs besides the instructions themselves.
pub struct Slots<'a> {
    pub varnames: &'a [Name],
    pub cells: &'a [Name],
}

impl Slots<'_> {
    fn fast(&self, name: &Name) -> Result<u32, CompileError> {
        position(self.varnames, name)
            .ok_or_else(|| CompileError::Malformed(format!("'{name}' is not a local slot")))
    }

    fn cell(&self, name: &Name) -> Result<u32, CompileError> {
        position(self.cells, name)
            .ok_or_else(|| CompileError::Malformed(format!("'{name}' is not a cell or free variable")))
    }
}

fn position(names: &[Name], name: &Name) -> Option<u32> {
    names.iter().position(|candidate| candidate == name).map(|index| index as u32)
}

/// In-progress lowering: emitted ops plus label bookkeeping.
pub struct Lowering<'a> {
    pub code: MachineCode,
    pub slots: Slots<'a>,
    line: Option<u32>,
    labels: FxHashMap<Label, u32>,
    fixups: Vec<(usize, Label)>,
    open_guards: Vec<(u32, Label, u32)>,
    guard_fixups: Vec<(usize, Label)>,
}

impl<'a> Lowering<'a> {
    fn new(slots: Slots<'a>) -> Self {
        Self {
            code: MachineCode::default(),
            slots,
            line: None,
            labels: FxHashMap::default(),
            fixups: Vec::new(),
            open_guards: Vec::new(),
            guard_fixups: Vec::new(),
        }
    }

    pub fn push(&mut self, op: MachineOp) {
        self.code.ops.push(op);
        self.code.lines.push(self.line);
    }

    /// Pushes a branching op whose target is patched once `label` is placed.
    pub fn push_branch(&mut self, op: MachineOp, label: Label) {
        self.fixups.push((self.code.ops.len(), label));
        self.push(op);
    }

    pub fn is_placed(&self, label: Label) -> bool {
        self.labels.contains_key(&label)
    }

    fn place(&mut self, label: Label) {
        self.labels.insert(label, self.code.ops.len() as u32);
    }

    pub fn open_guard(&mut self, handler: Label, depth: u32) {
        self.open_guards.push((self.code.ops.len() as u32, handler, depth));
    }

    pub fn close_guard(&mut self) -> Result<(), CompileError> {
        let (start, handler, depth) = self
            .open_guards
            .pop()
            .ok_or_else(|| CompileError::Malformed("GUARD_END without GUARD_BEGIN".into()))?;
        self.guard_fixups.push((self.code.guards.len(), handler));
        self.code.guards.push(GuardRange {
            start,
            end: self.code.ops.len() as u32,
            handler: 0,
            depth,
        });
        Ok(())
    }

    fn resolve(&self, label: Label) -> Result<u32, CompileError> {
        self.labels
            .get(&label)
            .copied()
            .ok_or_else(|| CompileError::Malformed(format!("label {label} is never placed")))
    }

    fn finish(mut self) -> Result<MachineCode, CompileError> {
        if !self.open_guards.is_empty() {
            return Err(CompileError::Malformed("unterminated guarded block".into()));
        }
        for (index, label) in std::mem::take(&mut self.fixups) {
            let target = self.resolve(label)?;
            if let Some(slot) = self.code.ops[index].target_mut() {
                *slot = target;
            }
        }
        for (index, label) in std::mem::take(&mut self.guard_fixups) {
            self.code.guards[index].handler = self.resolve(label)?;
        }
        Ok(self.code)
    }
}

/// One supported revision of the virtual machine's instruction encoding.
pub trait TargetIsa: Send + Sync + fmt::Debug {
    fn revision(&self) -> IsaRevision;

    /// Lowers the instruction at `index`. Returns how many abstract
    /// instructions were consumed (peephole folds consume more than one).
    fn lower_op(
        &self,
        instructions: &[Instruction],
        index: usize,
        depth: u32,
        lowering: &mut Lowering<'_>,
    ) -> Result<usize, CompileError>;

    /// Lowers a whole stream. `depths` holds the stack depth before each
    /// instruction as found by [`stack::simulate`](super::stack::simulate).
    fn lower(
        &self,
        instructions: &[Instruction],
        depths: &[Option<u32>],
        slots: Slots<'_>,
    ) -> Result<MachineCode, CompileError> {
        let mut lowering = Lowering::new(slots);
        let mut index = 0;
        while index < instructions.len() {
            let instruction = &instructions[index];
            lowering.line = instruction.line;
            if let Op::Label(label) = instruction.op {
                lowering.place(label);
                index += 1;
                continue;
            }
            let depth = depths.get(index).copied().flatten().unwrap_or(0);
            index += self.lower_op(instructions, index, depth, &mut lowering)?.max(1);
        }
        let code = lowering.finish()?;
        log::trace!(
            "lowered {} instructions into {} {} ops",
            instructions.len(),
            code.ops.len(),
            self.revision()
        );
        Ok(code)
    }
}

/// Lowering shared by both revisions for ops whose encoding never changed.
fn lower_common(op: &Op, lowering: &mut Lowering<'_>) -> Result<bool, CompileError> {
    let machine = match op {
        Op::LoadConst(constant) => MachineOp::LoadConst(constant.clone()),
        Op::LoadName(name) => MachineOp::LoadName(name.clone()),
        Op::StoreName(name) => MachineOp::StoreName(name.clone()),
        Op::DeleteName(name) => MachineOp::DeleteName(name.clone()),
        Op::LoadFast(name) => MachineOp::LoadFast(lowering.slots.fast(name)?),
        Op::StoreFast(name) => MachineOp::StoreFast(lowering.slots.fast(name)?),
        Op::DeleteFast(name) => MachineOp::DeleteFast(lowering.slots.fast(name)?),
        Op::LoadGlobal(name) => MachineOp::LoadGlobal(name.clone()),
        Op::StoreGlobal(name) => MachineOp::StoreGlobal(name.clone()),
        Op::DeleteGlobal(name) => MachineOp::DeleteGlobal(name.clone()),
        Op::LoadDynamic(name) => MachineOp::LoadDynamic(name.clone()),
        Op::StoreDynamic(name) => MachineOp::StoreDynamic(name.clone()),
        Op::DeleteDynamic(name) => MachineOp::DeleteDynamic(name.clone()),
        Op::LoadDeref(name) => MachineOp::LoadDeref(lowering.slots.cell(name)?),
        Op::StoreDeref(name) => MachineOp::StoreDeref(lowering.slots.cell(name)?),
        Op::LoadAttr(name) => MachineOp::LoadAttr(name.clone()),
        Op::StoreAttr(name) => MachineOp::StoreAttr(name.clone()),
        Op::DeleteAttr(name) => MachineOp::DeleteAttr(name.clone()),
        Op::BinarySubscr => MachineOp::BinarySubscr,
        Op::StoreSubscr => MachineOp::StoreSubscr,
        Op::DeleteSubscr => MachineOp::DeleteSubscr,
        Op::Binary(op) => MachineOp::Binary(*op),
        Op::Unary(op) => MachineOp::Unary(*op),
        Op::Compare(op) => MachineOp::Compare(*op),
        Op::BuildTuple(count) => MachineOp::BuildTuple(*count),
        Op::BuildList(count) => MachineOp::BuildList(*count),
        Op::BuildMap(count) => MachineOp::BuildMap(*count),
        Op::ListAppend(depth) => MachineOp::ListAppend(*depth),
        Op::MakeFunction {
            defaults,
            kw_defaults,
            captures,
        } => MachineOp::MakeFunction {
            defaults: *defaults,
            kw_defaults: kw_defaults.clone(),
            captures: captures
                .iter()
                .map(|name| lowering.slots.cell(name))
                .collect::<Result<Vec<_>, _>>()?
                .into(),
        },
        Op::ReturnValue => MachineOp::ReturnValue,
        Op::PopTop => MachineOp::PopTop,
        Op::UnpackSequence(count) => MachineOp::UnpackSequence(*count),
        Op::GetIter => MachineOp::GetIter,
        Op::Reraise => MachineOp::Reraise,
        Op::ForIter(label) => {
            lowering.push_branch(MachineOp::ForIter(0), *label);
            return Ok(true);
        }
        Op::PopJumpIfFalse(label) => {
            lowering.push_branch(MachineOp::PopJumpIfFalse(0), *label);
            return Ok(true);
        }
        Op::PopJumpIfTrue(label) => {
            lowering.push_branch(MachineOp::PopJumpIfTrue(0), *label);
            return Ok(true);
        }
        Op::JumpIfFalseOrPop(label) => {
            lowering.push_branch(MachineOp::JumpIfFalseOrPop(0), *label);
            return Ok(true);
        }
        Op::JumpIfTrueOrPop(label) => {
            lowering.push_branch(MachineOp::JumpIfTrueOrPop(0), *label);
            return Ok(true);
        }
        _ => return Ok(false),
    };
    lowering.push(machine);
    Ok(true)
}

/// Stack-rotation opcodes, argument-count calls and explicit guard instructions.
#[derive(Debug, Default)]
pub struct Classic;

impl TargetIsa for Classic {
    fn revision(&self) -> IsaRevision {
        IsaRevision::Classic
    }

    fn lower_op(
        &self,
        instructions: &[Instruction],
        index: usize,
        _depth: u32,
        lowering: &mut Lowering<'_>,
    ) -> Result<usize, CompileError> {
        let op = &instructions[index].op;
        if lower_common(op, lowering)? {
            return Ok(1);
        }
        match op {
            Op::DupTop => lowering.push(MachineOp::DupTop),
            Op::DupTopTwo => lowering.push(MachineOp::DupTopTwo),
            Op::RotTwo => lowering.push(MachineOp::RotTwo),
            Op::RotThree => lowering.push(MachineOp::RotThree),
            Op::Call { argc, kwnames } if kwnames.is_empty() => {
                lowering.push(MachineOp::CallFunction(*argc))
            }
            Op::Call { argc, kwnames } => {
                let names = kwnames.iter().cloned().map(Constant::Str).collect();
                lowering.push(MachineOp::LoadConst(Constant::Tuple(names)));
                lowering.push(MachineOp::CallFunctionKw(*argc));
            }
            Op::Jump(label) => lowering.push_branch(MachineOp::JumpAbsolute(0), *label),
            Op::GuardBegin(label) => lowering.push_branch(MachineOp::SetupGuard(0), *label),
            Op::GuardEnd => lowering.push(MachineOp::PopGuard),
            other => {
                return Err(CompileError::Malformed(format!(
                    "{other} has no classic encoding"
                )));
            }
        }
        Ok(1)
    }
}

/// Copy/swap stack ops, keyword-name prefixed calls, directional jumps,
/// constant-return folding and a zero-cost exception table.
#[derive(Debug, Default)]
pub struct Compact;

impl TargetIsa for Compact {
    fn revision(&self) -> IsaRevision {
        IsaRevision::Compact
    }

    fn lower_op(
        &self,
        instructions: &[Instruction],
        index: usize,
        depth: u32,
        lowering: &mut Lowering<'_>,
    ) -> Result<usize, CompileError> {
        let op = &instructions[index].op;
        if let Op::LoadConst(constant) = op {
            if let Some(Op::ReturnValue) = instructions.get(index + 1).map(|next| &next.op) {
                lowering.push(MachineOp::ReturnConst(constant.clone()));
                return Ok(2);
            }
        }
        if lower_common(op, lowering)? {
            return Ok(1);
        }
        match op {
            Op::DupTop => lowering.push(MachineOp::Copy(1)),
            Op::DupTopTwo => {
                lowering.push(MachineOp::Copy(2));
                lowering.push(MachineOp::Copy(2));
            }
            Op::RotTwo => lowering.push(MachineOp::Swap(2)),
            Op::RotThree => {
                lowering.push(MachineOp::Swap(3));
                lowering.push(MachineOp::Swap(2));
            }
            Op::Call { argc, kwnames } => {
                if !kwnames.is_empty() {
                    lowering.push(MachineOp::KwNames(kwnames.clone()));
                }
                lowering.push(MachineOp::Call(*argc));
            }
            Op::Jump(label) => {
                let op = if lowering.is_placed(*label) {
                    MachineOp::JumpBackward(0)
                } else {
                    MachineOp::JumpForward(0)
                };
                lowering.push_branch(op, *label);
            }
            Op::GuardBegin(label) => lowering.open_guard(*label, depth),
            Op::GuardEnd => lowering.close_guard()?,
            other => {
                return Err(CompileError::Malformed(format!(
                    "{other} has no compact encoding"
                )));
            }
        }
        Ok(1)
    }
}

static CLASSIC: Classic = Classic;
static COMPACT: Compact = Compact;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum IsaRevision {
    Classic,
    Compact,
}

impl IsaRevision {
    pub fn target(self) -> &'static dyn TargetIsa {
        match self {
            Self::Classic => &CLASSIC,
            Self::Compact => &COMPACT,
        }
    }

    /// Revision used when nothing else is configured.
    pub fn host() -> Self {
        Self::Compact
    }
}

impl Default for IsaRevision {
    fn default() -> Self {
        Self::host()
    }
}

impl fmt::Display for IsaRevision {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Classic => write!(f, "classic"),
            Self::Compact => write!(f, "compact"),
        }
    }
}

impl FromStr for IsaRevision {
    type Err = String;

    fn from_str(revision: &str) -> Result<Self, Self::Err> {
        match revision {
            "classic" => Ok(Self::Classic),
            "compact" => Ok(Self::Compact),
            other => Err(format!("unknown instruction set revision '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instr(op: Op) -> Instruction {
        Instruction::new(op, Some(1))
    }

    fn lower(revision: IsaRevision, ops: Vec<Op>) -> MachineCode {
        let instructions: Vec<_> = ops.into_iter().map(instr).collect();
        let depths = vec![Some(0); instructions.len()];
        revision
            .target()
            .lower(
                &instructions,
                &depths,
                Slots {
                    varnames: &[],
                    cells: &[],
                },
            )
            .unwrap()
    }

    #[test]
    fn rot_three_expands_to_two_swaps_on_compact() {
        let ops = vec![Op::RotThree];
        assert_eq!(lower(IsaRevision::Classic, ops.clone()).ops, vec![MachineOp::RotThree]);
        assert_eq!(
            lower(IsaRevision::Compact, ops).ops,
            vec![MachineOp::Swap(3), MachineOp::Swap(2)]
        );
    }

    #[test]
    fn constant_return_folds_only_on_compact() {
        let ops = vec![Op::LoadConst(Constant::None), Op::ReturnValue];
        assert_eq!(lower(IsaRevision::Classic, ops.clone()).ops.len(), 2);
        assert_eq!(
            lower(IsaRevision::Compact, ops).ops,
            vec![MachineOp::ReturnConst(Constant::None)]
        );
    }

    #[test]
    fn keyword_calls_differ_per_revision() {
        let call = Op::Call {
            argc: 1,
            kwnames: vec![Name::from("key")].into(),
        };
        let classic = lower(IsaRevision::Classic, vec![call.clone()]);
        assert!(matches!(classic.ops[1], MachineOp::CallFunctionKw(1)));
        let compact = lower(IsaRevision::Compact, vec![call]);
        assert!(matches!(compact.ops[0], MachineOp::KwNames(_)));
        assert!(matches!(compact.ops[1], MachineOp::Call(1)));
    }

    #[test]
    fn labels_resolve_to_instruction_indices() {
        let ops = vec![
            Op::Label(Label(0)),
            Op::LoadConst(Constant::Bool(true)),
            Op::PopJumpIfFalse(Label(1)),
            Op::Jump(Label(0)),
            Op::Label(Label(1)),
            Op::LoadConst(Constant::Int(1)),
            Op::ReturnValue,
        ];
        let classic = lower(IsaRevision::Classic, ops.clone());
        assert_eq!(classic.ops[1], MachineOp::PopJumpIfFalse(3));
        assert_eq!(classic.ops[2], MachineOp::JumpAbsolute(0));
        let compact = lower(IsaRevision::Compact, ops);
        assert_eq!(compact.ops[2], MachineOp::JumpBackward(0));
    }

    #[test]
    fn guards_become_a_table_on_compact() {
        let ops = vec![
            Op::GuardBegin(Label(0)),
            Op::LoadConst(Constant::Int(1)),
            Op::PopTop,
            Op::GuardEnd,
            Op::Jump(Label(1)),
            Op::Label(Label(0)),
            Op::Reraise,
            Op::Label(Label(1)),
            Op::LoadConst(Constant::None),
            Op::ReturnValue,
        ];
        let classic = lower(IsaRevision::Classic, ops.clone());
        assert_eq!(classic.ops[0], MachineOp::SetupGuard(5));
        assert!(classic.guards.is_empty());
        let compact = lower(IsaRevision::Compact, ops);
        assert_eq!(
            compact.guards,
            vec![GuardRange {
                start: 0,
                end: 2,
                handler: 3,
                depth: 0
            }]
        );
    }

    #[test]
    fn unplaced_label_is_malformed() {
        let instructions = vec![instr(Op::Jump(Label(7)))];
        let result = IsaRevision::Classic.target().lower(
            &instructions,
            &[Some(0)],
            Slots {
                varnames: &[],
                cells: &[],
            },
        );
        assert!(matches!(result, Err(CompileError::Malformed(_))));
    }
}
