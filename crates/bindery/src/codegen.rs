//! Instruction stream builder.
//!
//! [`CodeGenerator`] is a minimal assembler: one emit method per abstract op,
//! two composite emitters ([`CodeGenerator::guarded`] and
//! [`CodeGenerator::for_loop`]) and [`CodeGenerator::to_unit`], which validates
//! the stream and freezes it into an immutable [`CompiledUnit`].

use indexmap::IndexSet;
use serde::Serialize;
use std::sync::Arc;

use crate::bytecode::isa::Slots;
use crate::bytecode::{
    BinaryOp, CompareOp, Constant, Instruction, IsaRevision, Label, MachineCode, Name, Op,
    TargetIsa, UnaryOp, UnitKind, stack,
};
use crate::error::CompileError;

/// Immutable, shareable result of compiling one source construct.
#[derive(Debug, Serialize)]
pub struct CompiledUnit {
    pub instructions: Vec<Instruction>,
    /// Parameters in slot order: positional, keyword-only, `*args`, `**kwargs`.
    pub arg_names: Vec<Name>,
    pub positional_only_count: u32,
    pub keyword_only_count: u32,
    pub has_varargs: bool,
    pub has_varkwargs: bool,
    pub creates_new_local_frame: bool,
    /// Resolves free names through the live dynamic scope of its creator.
    pub dependent: bool,
    pub kind: UnitKind,
    pub name: Name,
    pub source_file: Name,
    pub first_line: u32,
    pub doc: Option<Name>,
    pub varnames: Vec<Name>,
    pub cellvars: Vec<Name>,
    pub freevars: Vec<Name>,
    /// Names the source explicitly declared `global`.
    pub declared_globals: Vec<Name>,
    pub uses_dynamic_scope: bool,
    pub revision: IsaRevision,
    pub stack_size: u32,
    pub code: MachineCode,
}

impl CompiledUnit {
    /// Number of parameters fillable by position.
    pub fn positional_count(&self) -> usize {
        self.arg_names.len()
            - self.keyword_only_count as usize
            - usize::from(self.has_varargs)
            - usize::from(self.has_varkwargs)
    }

    pub fn nested_units(&self) -> impl Iterator<Item = &Arc<CompiledUnit>> {
        self.instructions
            .iter()
            .filter_map(|instruction| instruction.op.nested_unit())
    }

    /// Human readable listing, nested units included.
    pub fn disassemble(&self) -> String {
        let mut listing = String::new();
        self.disassemble_into(&mut listing, 0);
        listing
    }

    fn disassemble_into(&self, listing: &mut String, indent: usize) {
        let pad = " ".repeat(indent);
        listing.push_str(&format!(
            "{pad}<{}> args=({}) new_frame={} dependent={}\n",
            self.name,
            self.arg_names.join(", "),
            self.creates_new_local_frame,
            self.dependent
        ));
        for instruction in &self.instructions {
            listing.push_str(&format!("{pad}{instruction}\n"));
        }
        for nested in self.nested_units() {
            nested.disassemble_into(listing, indent + 4);
        }
    }
}

pub struct CodeGenerator {
    pub args: Vec<Name>,
    pub positional_only_count: u32,
    pub keyword_only_count: u32,
    pub varargs: bool,
    pub varkwargs: bool,
    pub newlocals: bool,
    pub dependent: bool,
    pub kind: UnitKind,
    pub name: Name,
    pub filename: Name,
    pub first_line: u32,
    pub docstring: Option<Name>,
    pub cellvars: Vec<Name>,
    pub freevars: Vec<Name>,
    pub declared_globals: Vec<Name>,
    pub code_ops: Vec<Instruction>,
    isa: &'static dyn TargetIsa,
    next_label: u32,
    line: Option<u32>,
}

impl CodeGenerator {
    pub fn new(isa: &'static dyn TargetIsa, kind: UnitKind) -> Self {
        Self {
            args: Vec::new(),
            positional_only_count: 0,
            keyword_only_count: 0,
            varargs: false,
            varkwargs: false,
            newlocals: false,
            dependent: false,
            kind,
            name: "<expr>".into(),
            filename: "<string>".into(),
            first_line: 1,
            docstring: None,
            cellvars: Vec::new(),
            freevars: Vec::new(),
            declared_globals: Vec::new(),
            code_ops: Vec::new(),
            isa,
            next_label: 0,
            line: None,
        }
    }

    /// Builder preloaded with everything but the instructions of `unit`.
    pub fn from_unit(unit: &CompiledUnit, isa: &'static dyn TargetIsa) -> Self {
        let next_label = unit
            .instructions
            .iter()
            .filter_map(|instruction| match instruction.op {
                Op::Label(label) => Some(label.0 + 1),
                _ => None,
            })
            .max()
            .unwrap_or(0);
        Self {
            args: unit.arg_names.clone(),
            positional_only_count: unit.positional_only_count,
            keyword_only_count: unit.keyword_only_count,
            varargs: unit.has_varargs,
            varkwargs: unit.has_varkwargs,
            newlocals: unit.creates_new_local_frame,
            dependent: unit.dependent,
            kind: unit.kind,
            name: unit.name.clone(),
            filename: unit.source_file.clone(),
            first_line: unit.first_line,
            docstring: unit.doc.clone(),
            cellvars: unit.cellvars.clone(),
            freevars: unit.freevars.clone(),
            declared_globals: unit.declared_globals.clone(),
            code_ops: Vec::new(),
            isa,
            next_label,
            line: None,
        }
    }

    pub fn isa(&self) -> &'static dyn TargetIsa {
        self.isa
    }

    pub fn set_lineno(&mut self, line: u32) {
        self.line = Some(line);
    }

    pub fn new_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    pub fn emit(&mut self, op: Op) {
        self.code_ops.push(Instruction::new(op, self.line));
    }

    /// Appends already built instructions, keeping their line numbers.
    pub fn extend(&mut self, instructions: impl IntoIterator<Item = Instruction>) {
        self.code_ops.extend(instructions);
    }

    pub fn load_const(&mut self, constant: Constant) {
        self.emit(Op::LoadConst(constant));
    }

    pub fn load_name(&mut self, name: impl Into<Name>) {
        self.emit(Op::LoadName(name.into()));
    }

    pub fn store_name(&mut self, name: impl Into<Name>) {
        self.emit(Op::StoreName(name.into()));
    }

    pub fn delete_name(&mut self, name: impl Into<Name>) {
        self.emit(Op::DeleteName(name.into()));
    }

    pub fn load_fast(&mut self, name: impl Into<Name>) {
        self.emit(Op::LoadFast(name.into()));
    }

    pub fn store_fast(&mut self, name: impl Into<Name>) {
        self.emit(Op::StoreFast(name.into()));
    }

    pub fn delete_fast(&mut self, name: impl Into<Name>) {
        self.emit(Op::DeleteFast(name.into()));
    }

    pub fn load_global(&mut self, name: impl Into<Name>) {
        self.emit(Op::LoadGlobal(name.into()));
    }

    pub fn store_global(&mut self, name: impl Into<Name>) {
        self.emit(Op::StoreGlobal(name.into()));
    }

    pub fn delete_global(&mut self, name: impl Into<Name>) {
        self.emit(Op::DeleteGlobal(name.into()));
    }

    pub fn load_deref(&mut self, name: impl Into<Name>) {
        self.emit(Op::LoadDeref(name.into()));
    }

    pub fn store_deref(&mut self, name: impl Into<Name>) {
        self.emit(Op::StoreDeref(name.into()));
    }

    pub fn load_attr(&mut self, name: impl Into<Name>) {
        self.emit(Op::LoadAttr(name.into()));
    }

    pub fn store_attr(&mut self, name: impl Into<Name>) {
        self.emit(Op::StoreAttr(name.into()));
    }

    pub fn delete_attr(&mut self, name: impl Into<Name>) {
        self.emit(Op::DeleteAttr(name.into()));
    }

    pub fn binary_subscr(&mut self) {
        self.emit(Op::BinarySubscr);
    }

    pub fn store_subscr(&mut self) {
        self.emit(Op::StoreSubscr);
    }

    pub fn delete_subscr(&mut self) {
        self.emit(Op::DeleteSubscr);
    }

    pub fn binary_op(&mut self, op: BinaryOp) {
        self.emit(Op::Binary(op));
    }

    pub fn unary_op(&mut self, op: UnaryOp) {
        self.emit(Op::Unary(op));
    }

    pub fn compare_op(&mut self, op: CompareOp) {
        self.emit(Op::Compare(op));
    }

    pub fn call_function(&mut self, argc: u32) {
        self.emit(Op::Call {
            argc,
            kwnames: Vec::new().into(),
        });
    }

    pub fn call_function_kw(&mut self, argc: u32, kwnames: Vec<Name>) {
        self.emit(Op::Call {
            argc,
            kwnames: kwnames.into(),
        });
    }

    pub fn build_tuple(&mut self, count: u32) {
        self.emit(Op::BuildTuple(count));
    }

    pub fn build_list(&mut self, count: u32) {
        self.emit(Op::BuildList(count));
    }

    pub fn build_map(&mut self, count: u32) {
        self.emit(Op::BuildMap(count));
    }

    pub fn list_append(&mut self, depth: u32) {
        self.emit(Op::ListAppend(depth));
    }

    pub fn make_function(&mut self, defaults: u32, kw_defaults: Vec<Name>, captures: Vec<Name>) {
        self.emit(Op::MakeFunction {
            defaults,
            kw_defaults: kw_defaults.into(),
            captures: captures.into(),
        });
    }

    pub fn return_value(&mut self) {
        self.emit(Op::ReturnValue);
    }

    pub fn pop_top(&mut self) {
        self.emit(Op::PopTop);
    }

    pub fn dup_top(&mut self) {
        self.emit(Op::DupTop);
    }

    pub fn dup_top_two(&mut self) {
        self.emit(Op::DupTopTwo);
    }

    pub fn rot_two(&mut self) {
        self.emit(Op::RotTwo);
    }

    pub fn rot_three(&mut self) {
        self.emit(Op::RotThree);
    }

    pub fn unpack_sequence(&mut self, count: u32) {
        self.emit(Op::UnpackSequence(count));
    }

    pub fn get_iter(&mut self) {
        self.emit(Op::GetIter);
    }

    pub fn for_iter(&mut self, exit: Label) {
        self.emit(Op::ForIter(exit));
    }

    pub fn jump(&mut self, target: Label) {
        self.emit(Op::Jump(target));
    }

    pub fn pop_jump_if_false(&mut self, target: Label) {
        self.emit(Op::PopJumpIfFalse(target));
    }

    pub fn pop_jump_if_true(&mut self, target: Label) {
        self.emit(Op::PopJumpIfTrue(target));
    }

    pub fn jump_if_false_or_pop(&mut self, target: Label) {
        self.emit(Op::JumpIfFalseOrPop(target));
    }

    pub fn jump_if_true_or_pop(&mut self, target: Label) {
        self.emit(Op::JumpIfTrueOrPop(target));
    }

    pub fn label(&mut self, label: Label) {
        self.emit(Op::Label(label));
    }

    /// Emits `body` inside a guarded block. An error escaping the block is
    /// re-raised with the trace of every frame it passed through below this
    /// one dropped, so it looks like it came from the guarded code itself.
    pub fn guarded<T>(
        &mut self,
        body: impl FnOnce(&mut Self) -> Result<T, CompileError>,
    ) -> Result<T, CompileError> {
        let handler = self.new_label();
        let done = self.new_label();
        self.emit(Op::GuardBegin(handler));
        let start = self.code_ops.len();
        let value = body(self)?;
        if self.code_ops[start..]
            .iter()
            .any(|instruction| instruction.op == Op::ReturnValue)
        {
            return Err(CompileError::Malformed(
                "a guarded block cannot contain a return".into(),
            ));
        }
        self.emit(Op::GuardEnd);
        self.jump(done);
        self.label(handler);
        self.emit(Op::Reraise);
        self.label(done);
        Ok(value)
    }

    /// Emits a loop over the iterable on TOS. `body` starts with the next item
    /// on TOS and must consume it.
    pub fn for_loop<T>(
        &mut self,
        body: impl FnOnce(&mut Self) -> Result<T, CompileError>,
    ) -> Result<T, CompileError> {
        let start = self.new_label();
        let exit = self.new_label();
        self.get_iter();
        self.label(start);
        self.for_iter(exit);
        let value = body(self)?;
        self.jump(start);
        self.label(exit);
        Ok(value)
    }

    /// Converts name-namespace access into per-call locals so the unit can run
    /// as an independent call. Names in `known_locals` become parameters (in
    /// first-use order), names stored by the unit become plain locals and all
    /// remaining loads become global lookups. Returns the parameter names.
    pub fn rewrite_to_local_frame(&mut self, known_locals: &[Name]) -> Vec<Name> {
        let known: IndexSet<&Name> = known_locals.iter().collect();
        let stored: IndexSet<Name> = self
            .code_ops
            .iter()
            .filter_map(|instruction| match &instruction.op {
                Op::StoreName(name) => Some(name.clone()),
                _ => None,
            })
            .collect();
        let mut arg_names: Vec<Name> = Vec::new();
        for instruction in &mut self.code_ops {
            let rewritten = match &instruction.op {
                Op::StoreName(name) => Op::StoreFast(name.clone()),
                Op::LoadName(name) if known.contains(name) => {
                    if !arg_names.contains(name) {
                        arg_names.push(name.clone());
                    }
                    Op::LoadFast(name.clone())
                }
                Op::LoadName(name) if stored.contains(name) => Op::LoadFast(name.clone()),
                Op::LoadName(name) => Op::LoadGlobal(name.clone()),
                Op::DeleteName(name) if known.contains(name) || stored.contains(name) => {
                    Op::DeleteFast(name.clone())
                }
                Op::DeleteName(name) => Op::DeleteGlobal(name.clone()),
                _ => continue,
            };
            instruction.op = rewritten;
        }
        self.args = arg_names.clone();
        self.positional_only_count = 0;
        self.keyword_only_count = 0;
        self.varargs = false;
        self.varkwargs = false;
        self.newlocals = true;
        arg_names
    }

    /// Validates the stream, derives flags and lowers it for the target ISA.
    pub fn to_unit(self) -> Result<Arc<CompiledUnit>, CompileError> {
        let mut varnames: IndexSet<Name> = self.args.iter().cloned().collect();
        for instruction in &self.code_ops {
            if let Op::LoadFast(name) | Op::StoreFast(name) | Op::DeleteFast(name) = &instruction.op {
                varnames.insert(name.clone());
            }
        }
        let varnames: Vec<Name> = varnames.into_iter().collect();
        let cells: Vec<Name> = self.cellvars.iter().chain(&self.freevars).cloned().collect();

        let (depths, stack_size) = match stack::simulate(&self.code_ops, self.kind) {
            Ok(report) => (report.depths(), report.max_depth),
            Err(error) => {
                debug_assert!(false, "unbalanced instruction stream in {}: {error}", self.name);
                log::warn!("unbalanced instruction stream in {}: {error}", self.name);
                (vec![None; self.code_ops.len()], self.code_ops.len() as u32)
            }
        };
        let code = self.isa.lower(
            &self.code_ops,
            &depths,
            Slots {
                varnames: &varnames,
                cells: &cells,
            },
        )?;
        let uses_dynamic_scope = self.code_ops.iter().any(|instruction| {
            matches!(
                instruction.op,
                Op::LoadDynamic(_) | Op::StoreDynamic(_) | Op::DeleteDynamic(_)
            )
        });
        log::debug!(
            "built unit {} ({} instructions, stack {}, {})",
            self.name,
            self.code_ops.len(),
            stack_size,
            self.isa.revision()
        );
        Ok(Arc::new(CompiledUnit {
            instructions: self.code_ops,
            arg_names: self.args,
            positional_only_count: self.positional_only_count,
            keyword_only_count: self.keyword_only_count,
            has_varargs: self.varargs,
            has_varkwargs: self.varkwargs,
            creates_new_local_frame: self.newlocals,
            dependent: self.dependent,
            kind: self.kind,
            name: self.name,
            source_file: self.filename,
            first_line: self.first_line,
            doc: self.docstring,
            varnames,
            cellvars: self.cellvars,
            freevars: self.freevars,
            declared_globals: self.declared_globals,
            uses_dynamic_scope,
            revision: self.isa.revision(),
            stack_size,
            code,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::MachineOp;

    fn generator() -> CodeGenerator {
        CodeGenerator::new(IsaRevision::Classic.target(), UnitKind::Expression)
    }

    #[test]
    fn to_unit_lowers_and_sizes_the_stack() {
        let mut cg = generator();
        cg.set_lineno(3);
        cg.load_name("a");
        cg.load_name("b");
        cg.binary_op(BinaryOp::Add);
        cg.return_value();
        let unit = cg.to_unit().unwrap();
        assert_eq!(unit.stack_size, 2);
        assert_eq!(unit.code.ops.len(), 4);
        assert_eq!(unit.code.lines[0], Some(3));
        assert!(!unit.creates_new_local_frame);
    }

    #[test]
    fn rewrite_to_local_frame_promotes_known_and_stored_names() {
        let mut cg = CodeGenerator::new(IsaRevision::Classic.target(), UnitKind::Statement);
        cg.load_name("x");
        cg.store_name("tmp");
        cg.load_name("tmp");
        cg.load_name("y");
        cg.binary_op(BinaryOp::Add);
        cg.load_name("len");
        cg.pop_top();
        cg.pop_top();
        cg.load_const(Constant::None);
        cg.return_value();
        let args = cg.rewrite_to_local_frame(&["y".into(), "x".into()]);
        assert_eq!(args, vec![Name::from("x"), Name::from("y")]);
        let ops: Vec<_> = cg.code_ops.iter().map(|i| i.op.clone()).collect();
        assert_eq!(ops[0], Op::LoadFast("x".into()));
        assert_eq!(ops[1], Op::StoreFast("tmp".into()));
        assert_eq!(ops[2], Op::LoadFast("tmp".into()));
        assert_eq!(ops[5], Op::LoadGlobal("len".into()));
        let unit = cg.to_unit().unwrap();
        assert!(unit.creates_new_local_frame);
        assert_eq!(unit.varnames[..2], [Name::from("x"), Name::from("y")]);
        assert!(matches!(unit.code.ops[1], MachineOp::StoreFast(2)));
    }

    #[test]
    fn guarded_block_rejects_returns() {
        let mut cg = generator();
        let result = cg.guarded(|cg| {
            cg.load_const(Constant::None);
            cg.return_value();
            Ok(())
        });
        assert!(matches!(result, Err(CompileError::Malformed(_))));
    }

    #[test]
    fn for_loop_is_stack_balanced() {
        let mut cg = CodeGenerator::new(IsaRevision::Compact.target(), UnitKind::Statement);
        cg.load_name("items");
        cg.for_loop(|cg| {
            cg.store_name("item");
            Ok(())
        })
        .unwrap();
        cg.load_const(Constant::None);
        cg.return_value();
        let unit = cg.to_unit().unwrap();
        assert!(stack::simulate(&unit.instructions, unit.kind).is_ok());
        assert!(unit.code.ops.iter().any(|op| matches!(op, MachineOp::JumpBackward(_))));
    }
}
