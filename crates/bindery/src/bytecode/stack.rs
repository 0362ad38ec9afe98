//! Static stack-depth simulation over abstract instruction streams.
//!
//! Walks every reachable path of a stream, checking that no instruction pops
//! more than is available, that merging paths agree on depth, and that returns
//! happen at the depth the unit kind requires. Each stack slot also remembers
//! which instruction produced it, which the inversion pass uses to find the
//! callee of a terminal call.

use rustc_hash::FxHashMap;
use std::fmt;

use super::{Instruction, Label, Op, UnitKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackError {
    Underflow { index: usize, depth: u32, needed: u32 },
    Inconsistent { index: usize, expected: u32, found: u32 },
    ReturnDepth { index: usize, depth: u32, expected: u32 },
    FallsOffEnd,
    UnknownLabel(Label),
}

impl fmt::Display for StackError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Underflow { index, depth, needed } => write!(
                f,
                "instruction {index} needs {needed} stack values but only {depth} are available"
            ),
            Self::Inconsistent { index, expected, found } => write!(
                f,
                "paths reach instruction {index} with stack depths {expected} and {found}"
            ),
            Self::ReturnDepth { index, depth, expected } => write!(
                f,
                "return at instruction {index} sees stack depth {depth}, expected {expected}"
            ),
            Self::FallsOffEnd => write!(f, "control falls off the end of the instruction stream"),
            Self::UnknownLabel(label) => write!(f, "jump to unplaced label {label}"),
        }
    }
}

impl std::error::Error for StackError {}

/// Producer of a stack slot: the instruction index, or `None` when paths disagree.
type Slot = Option<usize>;

#[derive(Debug, Clone)]
pub struct StackReport {
    pub max_depth: u32,
    slots: Vec<Option<Vec<Slot>>>,
}

impl StackReport {
    /// Depth before each instruction; `None` for unreachable instructions.
    pub fn depths(&self) -> Vec<Option<u32>> {
        self.slots
            .iter()
            .map(|slots| slots.as_ref().map(|slots| slots.len() as u32))
            .collect()
    }

    pub fn depth_at(&self, index: usize) -> Option<u32> {
        self.slots.get(index)?.as_ref().map(|slots| slots.len() as u32)
    }

    /// Instruction that produced the value `below_top` slots under the top of
    /// the stack as seen right before `index` executes.
    pub fn producer(&self, index: usize, below_top: usize) -> Option<usize> {
        let slots = self.slots.get(index)?.as_ref()?;
        let position = slots.len().checked_sub(below_top + 1)?;
        slots[position]
    }
}

pub fn simulate(instructions: &[Instruction], kind: UnitKind) -> Result<StackReport, StackError> {
    let labels: FxHashMap<Label, usize> = instructions
        .iter()
        .enumerate()
        .filter_map(|(index, instruction)| match instruction.op {
            Op::Label(label) => Some((label, index)),
            _ => None,
        })
        .collect();
    let last_return = instructions
        .iter()
        .rposition(|instruction| instruction.op == Op::ReturnValue);

    let mut states: Vec<Option<Vec<Slot>>> = vec![None; instructions.len()];
    let mut max_depth = 0u32;
    let mut worklist: Vec<(usize, Vec<Slot>)> = vec![(0, Vec::new())];

    while let Some((index, incoming)) = worklist.pop() {
        if index >= instructions.len() {
            return Err(StackError::FallsOffEnd);
        }
        let stack = match &states[index] {
            None => incoming,
            Some(existing) => {
                if existing.len() != incoming.len() {
                    return Err(StackError::Inconsistent {
                        index,
                        expected: existing.len() as u32,
                        found: incoming.len() as u32,
                    });
                }
                let merged: Vec<Slot> = existing
                    .iter()
                    .zip(&incoming)
                    .map(|(a, b)| if a == b { *a } else { None })
                    .collect();
                if &merged == existing {
                    continue;
                }
                merged
            }
        };
        states[index] = Some(stack.clone());
        max_depth = max_depth.max(stack.len() as u32);

        let op = &instructions[index].op;
        let depth = stack.len() as u32;
        let (pops, _) = op.stack_effect();
        if depth < pops {
            return Err(StackError::Underflow {
                index,
                depth,
                needed: pops,
            });
        }

        if *op == Op::ReturnValue {
            let expected = 1;
            let ok = match kind {
                UnitKind::Expression => depth == expected,
                UnitKind::Statement if Some(index) == last_return => depth == expected,
                UnitKind::Statement => depth >= expected,
            };
            if !ok {
                return Err(StackError::ReturnDepth {
                    index,
                    depth,
                    expected,
                });
            }
        }

        if let Some((label, _)) = op.branch() {
            let target = *labels.get(&label).ok_or(StackError::UnknownLabel(label))?;
            let taken = apply_branch(op, index, &stack);
            max_depth = max_depth.max(taken.len() as u32);
            worklist.push((target, taken));
        }
        if !op.is_terminal() {
            let after = apply(op, index, stack);
            max_depth = max_depth.max(after.len() as u32);
            worklist.push((index + 1, after));
        }
    }

    Ok(StackReport {
        max_depth,
        slots: states,
    })
}

/// Fall-through effect, keeping provenance of values that are only moved.
fn apply(op: &Op, index: usize, mut stack: Vec<Slot>) -> Vec<Slot> {
    let len = stack.len();
    match op {
        Op::DupTop => stack.push(stack[len - 1]),
        Op::DupTopTwo => {
            stack.push(stack[len - 2]);
            stack.push(stack[len - 2]);
        }
        Op::RotTwo => stack.swap(len - 1, len - 2),
        Op::RotThree => {
            let top = stack.remove(len - 1);
            stack.insert(len - 3, top);
        }
        Op::ListAppend(_) => {
            stack.pop();
        }
        Op::ForIter(_) => stack.push(Some(index)),
        _ => {
            let (pops, pushes) = op.stack_effect();
            stack.truncate(len - pops as usize);
            stack.extend(std::iter::repeat_n(Some(index), pushes as usize));
        }
    }
    stack
}

fn apply_branch(op: &Op, _index: usize, stack: &[Slot]) -> Vec<Slot> {
    let mut stack = stack.to_vec();
    match op {
        Op::ForIter(_) | Op::PopJumpIfFalse(_) | Op::PopJumpIfTrue(_) => {
            stack.pop();
        }
        _ => {}
    }
    stack
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Constant;

    fn stream(ops: Vec<Op>) -> Vec<Instruction> {
        ops.into_iter().map(|op| Instruction::new(op, None)).collect()
    }

    #[test]
    fn balanced_expression() {
        let instructions = stream(vec![
            Op::LoadName("a".into()),
            Op::LoadAttr("x".into()),
            Op::LoadName("b".into()),
            Op::Binary(crate::bytecode::BinaryOp::Add),
            Op::ReturnValue,
        ]);
        let report = simulate(&instructions, UnitKind::Expression).unwrap();
        assert_eq!(report.max_depth, 2);
        assert_eq!(report.depth_at(4), Some(1));
    }

    #[test]
    fn underflow_is_reported() {
        let instructions = stream(vec![Op::PopTop, Op::ReturnValue]);
        assert!(matches!(
            simulate(&instructions, UnitKind::Expression),
            Err(StackError::Underflow { index: 0, .. })
        ));
    }

    #[test]
    fn expression_must_return_exactly_one_value() {
        let instructions = stream(vec![
            Op::LoadConst(Constant::Int(1)),
            Op::LoadConst(Constant::Int(2)),
            Op::ReturnValue,
        ]);
        assert!(matches!(
            simulate(&instructions, UnitKind::Expression),
            Err(StackError::ReturnDepth { depth: 2, .. })
        ));
    }

    #[test]
    fn loop_merges_consistently() {
        let instructions = stream(vec![
            Op::LoadName("items".into()),
            Op::GetIter,
            Op::Label(Label(0)),
            Op::ForIter(Label(1)),
            Op::StoreName("item".into()),
            Op::Jump(Label(0)),
            Op::Label(Label(1)),
            Op::LoadConst(Constant::None),
            Op::ReturnValue,
        ]);
        let report = simulate(&instructions, UnitKind::Statement).unwrap();
        assert_eq!(report.depth_at(3), Some(1));
        assert_eq!(report.depth_at(7), Some(0));
        assert_eq!(report.max_depth, 2);
    }

    #[test]
    fn producers_follow_moved_values() {
        let instructions = stream(vec![
            Op::LoadName("getattr".into()),
            Op::LoadName("obj".into()),
            Op::LoadConst(Constant::Str("x".into())),
            Op::Call {
                argc: 2,
                kwnames: Vec::new().into(),
            },
            Op::ReturnValue,
        ]);
        let report = simulate(&instructions, UnitKind::Expression).unwrap();
        assert_eq!(report.producer(3, 2), Some(0));
        assert_eq!(report.producer(3, 0), Some(2));
    }

    #[test]
    fn falling_off_the_end_is_an_error() {
        let instructions = stream(vec![Op::LoadConst(Constant::None), Op::PopTop]);
        assert_eq!(
            simulate(&instructions, UnitKind::Statement).unwrap_err(),
            StackError::FallsOffEnd
        );
    }
}
