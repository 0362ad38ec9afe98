//! Dynamic scope rewriting.
//!
//! Free names of a binding resolve through the live dynamic scope of the
//! object that owns the binding instead of a static namespace. Names declared
//! `global` keep resolving through the module globals.

use indexmap::IndexSet;
use std::sync::Arc;

use crate::bytecode::{Constant, Instruction, Name, Op, TargetIsa};
use crate::codegen::{CodeGenerator, CompiledUnit};
use crate::error::CompileError;

/// Rewrites name-namespace access of `unit` (and of nested constructs that
/// share its frame) into dynamic-scope access.
pub fn rewrite_dynamic(
    unit: &CompiledUnit,
    isa: &'static dyn TargetIsa,
) -> Result<Arc<CompiledUnit>, CompileError> {
    Rewriter {
        isa,
        nested_frames: false,
    }
    .rewrite(unit, &IndexSet::new(), false)
}

/// Like [`rewrite_dynamic`], but nested functions are rewritten as well and
/// marked dependent, so a lambda created by a binding keeps resolving free
/// names through the scope it was created in.
pub fn run_in_dynamic_scope(
    unit: &CompiledUnit,
    isa: &'static dyn TargetIsa,
) -> Result<Arc<CompiledUnit>, CompileError> {
    Rewriter {
        isa,
        nested_frames: true,
    }
    .rewrite(unit, &IndexSet::new(), false)
}

/// Rewrites the body of a declarative function: its global loads become
/// dynamic loads unless declared `global`.
pub fn rewrite_function_body(
    unit: &CompiledUnit,
    isa: &'static dyn TargetIsa,
) -> Result<Arc<CompiledUnit>, CompileError> {
    Rewriter {
        isa,
        nested_frames: true,
    }
    .rewrite(unit, &IndexSet::new(), true)
}

struct Rewriter {
    isa: &'static dyn TargetIsa,
    nested_frames: bool,
}

impl Rewriter {
    fn rewrite(
        &self,
        unit: &CompiledUnit,
        inherited: &IndexSet<Name>,
        dependent: bool,
    ) -> Result<Arc<CompiledUnit>, CompileError> {
        let mut globals = inherited.clone();
        globals.extend(unit.declared_globals.iter().cloned());

        let mut cg = CodeGenerator::from_unit(unit, self.isa);
        for instruction in &unit.instructions {
            let op = match &instruction.op {
                Op::LoadName(name) if globals.contains(name) => Op::LoadGlobal(name.clone()),
                Op::StoreName(name) if globals.contains(name) => Op::StoreGlobal(name.clone()),
                Op::DeleteName(name) if globals.contains(name) => Op::DeleteGlobal(name.clone()),
                Op::LoadName(name) => Op::LoadDynamic(name.clone()),
                Op::StoreName(name) => Op::StoreDynamic(name.clone()),
                Op::DeleteName(name) => Op::DeleteDynamic(name.clone()),
                Op::LoadGlobal(name) if !globals.contains(name) => Op::LoadDynamic(name.clone()),
                Op::LoadConst(Constant::Code(nested)) => {
                    Op::LoadConst(Constant::Code(self.nested(nested, &globals)?))
                }
                other => other.clone(),
            };
            cg.code_ops.push(Instruction::new(op, instruction.line));
        }
        if dependent {
            cg.dependent = true;
        }
        cg.to_unit()
    }

    fn nested(
        &self,
        nested: &Arc<CompiledUnit>,
        globals: &IndexSet<Name>,
    ) -> Result<Arc<CompiledUnit>, CompileError> {
        if nested.dependent {
            return Ok(nested.clone());
        }
        if !nested.creates_new_local_frame {
            return self.rewrite(nested, globals, false);
        }
        if self.nested_frames {
            return self.rewrite(nested, globals, true);
        }
        Ok(nested.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::IsaRevision;
    use crate::compiler::Compiler;

    fn isa() -> &'static dyn TargetIsa {
        IsaRevision::Compact.target()
    }

    fn ops(unit: &CompiledUnit) -> Vec<Op> {
        unit.instructions.iter().map(|instruction| instruction.op.clone()).collect()
    }

    #[test]
    fn free_names_become_dynamic() {
        let unit = Compiler::new(isa()).expression("a.x + b", "binding").unwrap();
        let rewritten = rewrite_dynamic(&unit, isa()).unwrap();
        assert_eq!(ops(&rewritten)[0], Op::LoadDynamic("a".into()));
        assert_eq!(ops(&rewritten)[2], Op::LoadDynamic("b".into()));
        assert!(rewritten.uses_dynamic_scope);
    }

    #[test]
    fn declared_globals_stay_global() {
        let unit = Compiler::new(isa())
            .block("global counter\ncounter = counter + step\n", "block")
            .unwrap();
        let rewritten = rewrite_dynamic(&unit, isa()).unwrap();
        let ops = ops(&rewritten);
        assert!(ops.contains(&Op::LoadGlobal("counter".into())));
        assert!(ops.contains(&Op::StoreGlobal("counter".into())));
        assert!(ops.contains(&Op::LoadDynamic("step".into())));
    }

    #[test]
    fn comprehensions_are_rewritten_with_their_creator() {
        let unit = Compiler::new(isa())
            .expression("[item * factor for item in items]", "binding")
            .unwrap();
        let rewritten = rewrite_dynamic(&unit, isa()).unwrap();
        let comprehension = rewritten.nested_units().next().unwrap();
        assert!(ops(comprehension).contains(&Op::LoadDynamic("factor".into())));
        assert!(ops(comprehension).contains(&Op::LoadFast("item".into())));
        assert!(!comprehension.dependent);
    }

    #[test]
    fn nested_functions_depend_on_the_live_scope() {
        let unit = Compiler::new(isa())
            .expression("lambda offset: base + offset", "binding")
            .unwrap();
        let plain = rewrite_dynamic(&unit, isa()).unwrap();
        let lambda = plain.nested_units().next().unwrap();
        assert!(ops(lambda).contains(&Op::LoadGlobal("base".into())));
        assert!(!lambda.dependent);

        let scoped = run_in_dynamic_scope(&unit, isa()).unwrap();
        let lambda = scoped.nested_units().next().unwrap();
        assert!(ops(lambda).contains(&Op::LoadDynamic("base".into())));
        assert!(ops(lambda).contains(&Op::LoadFast("offset".into())));
        assert!(lambda.dependent);
    }

    #[test]
    fn closures_are_not_rewritten_twice() {
        let definition = Compiler::new(isa())
            .function_def("def f(base):\n    return lambda: base + other\n")
            .unwrap();
        let once = rewrite_function_body(&definition.body, isa()).unwrap();
        let twice = run_in_dynamic_scope(&once, isa()).unwrap();
        let lambda = twice.nested_units().next().unwrap();
        assert!(ops(lambda).contains(&Op::LoadDeref("base".into())));
        assert!(ops(lambda).contains(&Op::LoadDynamic("other".into())));
        assert_eq!(once.instructions, twice.instructions);
        assert!(once.dependent);
    }
}
