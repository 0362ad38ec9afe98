//! Lowers parsed source into raw compiled units.
//!
//! Units produced here still use plain name-namespace access; making them
//! resolve through a dynamic scope is the job of the
//! [`scope_rewriter`](crate::scope_rewriter).

use std::sync::Arc;

mod symtable;
pub use symtable::{Access, ScopeKind, SymbolTable};

use crate::bytecode::{Constant, Name, TargetIsa, UnitKind};
use crate::codegen::{CodeGenerator, CompiledUnit};
use crate::error::CompileError;
use crate::parser::{
    self, BoolOp, Comprehension, Expr, Literal, Parameters, SExpr, SStmt, Span, Spanned, Stmt,
    Target,
};

/// A `def` compiled for later binding: the body unit plus an expression unit
/// that evaluates to the flat tuple of its default values.
#[derive(Debug, Clone)]
pub struct FunctionDefinition {
    pub name: Name,
    pub body: Arc<CompiledUnit>,
    pub defaults: Arc<CompiledUnit>,
    pub positional_defaults: u32,
    pub kw_defaults: Vec<Name>,
}

#[derive(Debug, Clone)]
pub struct Compiler {
    isa: &'static dyn TargetIsa,
    filename: Name,
    first_line: u32,
}

impl Compiler {
    pub fn new(isa: &'static dyn TargetIsa) -> Self {
        Self {
            isa,
            filename: "<string>".into(),
            first_line: 1,
        }
    }

    pub fn with_filename(mut self, filename: impl Into<Name>) -> Self {
        self.filename = filename.into();
        self
    }

    /// Line number of the first source line, for sources cut out of a file.
    pub fn at_line(mut self, line: u32) -> Self {
        self.first_line = line;
        self
    }

    pub fn isa(&self) -> &'static dyn TargetIsa {
        self.isa
    }

    pub fn expression(&self, source_code: &str, name: &str) -> Result<Arc<CompiledUnit>, CompileError> {
        let tree = parser::parse_expression(source_code)?;
        let table = SymbolTable::for_expression(&tree);
        let lines = LineIndex::new(source_code, self.first_line);
        let mut emitter = Emitter::new(self, &table, SymbolTable::ROOT, &lines);
        let mut cg = emitter.generator(UnitKind::Expression, name);
        emitter.mark(&mut cg, tree.span);
        emitter.expression(&mut cg, &tree)?;
        cg.return_value();
        cg.to_unit()
    }

    /// Statement block run for its effects, as used by notification bindings.
    pub fn block(&self, source_code: &str, name: &str) -> Result<Arc<CompiledUnit>, CompileError> {
        let statements = parser::parse_module(source_code)?;
        let table = SymbolTable::for_module(&statements);
        let lines = LineIndex::new(source_code, self.first_line);
        let mut emitter = Emitter::new(self, &table, SymbolTable::ROOT, &lines);
        let mut cg = emitter.generator(UnitKind::Statement, name);
        emitter.statements(&mut cg, &statements)?;
        cg.load_const(Constant::None);
        cg.return_value();
        cg.to_unit()
    }

    /// Compiles source holding exactly one `def`.
    pub fn function_def(&self, source_code: &str) -> Result<FunctionDefinition, CompileError> {
        let statements = parser::parse_module(source_code)?;
        let [statement] = statements.as_slice() else {
            return Err(CompileError::UnsupportedConstruct(
                "expected a single function definition".into(),
            ));
        };
        let Stmt::FunctionDef { name, params, body } = &statement.node else {
            return Err(CompileError::UnsupportedConstruct(
                "expected a function definition".into(),
            ));
        };
        let table = SymbolTable::for_module(&statements);
        let lines = LineIndex::new(source_code, self.first_line);
        let mut emitter = Emitter::new(self, &table, SymbolTable::ROOT, &lines);

        let mut cg = emitter.generator(UnitKind::Expression, &format!("<defaults of {name}>"));
        emitter.mark(&mut cg, statement.span);
        let (positional_defaults, kw_defaults) = emitter.defaults(&mut cg, params)?;
        cg.build_tuple(positional_defaults + kw_defaults.len() as u32);
        cg.return_value();
        let defaults = cg.to_unit()?;

        let body = emitter.function_unit(name, params, FunctionBody::Block(body), statement.span)?;
        Ok(FunctionDefinition {
            name: (*name).into(),
            body,
            defaults,
            positional_defaults,
            kw_defaults,
        })
    }

    /// Turns an expression with named inputs into a standalone callable unit
    /// taking those inputs as parameters. Errors raised below it are reported
    /// as coming from the expression itself.
    pub fn callable(
        &self,
        source_code: &str,
        known_locals: &[Name],
    ) -> Result<Arc<CompiledUnit>, CompileError> {
        let tree = parser::parse_expression(source_code)?;
        let table = SymbolTable::for_expression(&tree);
        let lines = LineIndex::new(source_code, self.first_line);
        let mut emitter = Emitter::new(self, &table, SymbolTable::ROOT, &lines);
        let mut cg = emitter.generator(UnitKind::Expression, "<callable>");
        emitter.mark(&mut cg, tree.span);
        cg.guarded(|cg| emitter.expression(cg, &tree))?;
        cg.return_value();
        cg.rewrite_to_local_frame(known_locals);
        cg.to_unit()
    }
}

struct LineIndex {
    starts: Vec<usize>,
    first_line: u32,
}

impl LineIndex {
    fn new(source_code: &str, first_line: u32) -> Self {
        let starts = std::iter::once(0)
            .chain(source_code.match_indices('\n').map(|(offset, _)| offset + 1))
            .collect();
        Self { starts, first_line }
    }

    fn line(&self, offset: usize) -> u32 {
        let index = self.starts.partition_point(|start| *start <= offset);
        self.first_line + index.saturating_sub(1) as u32
    }
}

enum FunctionBody<'a, 'code> {
    Lambda(&'a SExpr<'code>),
    Block(&'a [SStmt<'code>]),
}

/// Per-scope emission state. The generator itself is passed alongside so the
/// builder's composite emitters can call back into the emitter.
struct Emitter<'c> {
    compiler: &'c Compiler,
    table: &'c SymbolTable,
    scope: usize,
    children: std::slice::Iter<'c, usize>,
    lines: &'c LineIndex,
}

impl<'c> Emitter<'c> {
    fn new(compiler: &'c Compiler, table: &'c SymbolTable, scope: usize, lines: &'c LineIndex) -> Self {
        Self {
            compiler,
            table,
            scope,
            children: table.scope(scope).children.iter(),
            lines,
        }
    }

    fn generator(&self, kind: UnitKind, name: &str) -> CodeGenerator {
        let scope = self.table.scope(self.scope);
        let mut cg = CodeGenerator::new(self.compiler.isa, kind);
        cg.name = name.into();
        cg.filename = self.compiler.filename.clone();
        cg.first_line = self.compiler.first_line;
        cg.newlocals = scope.kind == ScopeKind::Function;
        cg.cellvars = scope.cells.iter().cloned().collect();
        cg.freevars = scope.frees.iter().cloned().collect();
        cg.declared_globals = scope.globals.iter().cloned().collect();
        cg
    }

    fn mark(&self, cg: &mut CodeGenerator, span: Span) {
        cg.set_lineno(self.lines.line(span.start));
    }

    fn child(&mut self) -> Result<Emitter<'c>, CompileError> {
        let scope = *self
            .children
            .next()
            .ok_or_else(|| CompileError::Malformed("scope analysis is out of step".into()))?;
        Ok(Emitter::new(self.compiler, self.table, scope, self.lines))
    }

    fn load(&self, cg: &mut CodeGenerator, name: &str) {
        match self.table.access(self.scope, name) {
            Access::Fast => cg.load_fast(name),
            Access::Deref => cg.load_deref(name),
            Access::Global => cg.load_global(name),
            Access::Name => cg.load_name(name),
        }
    }

    fn store(&self, cg: &mut CodeGenerator, name: &str) {
        match self.table.access(self.scope, name) {
            Access::Fast => cg.store_fast(name),
            Access::Deref => cg.store_deref(name),
            Access::Global => cg.store_global(name),
            Access::Name => cg.store_name(name),
        }
    }

    fn delete(&self, cg: &mut CodeGenerator, name: &str) -> Result<(), CompileError> {
        match self.table.access(self.scope, name) {
            Access::Fast => cg.delete_fast(name),
            Access::Global => cg.delete_global(name),
            Access::Name => cg.delete_name(name),
            Access::Deref => {
                return Err(CompileError::UnsupportedConstruct(format!(
                    "can't delete '{name}', it is captured by a nested scope"
                )));
            }
        }
        Ok(())
    }

    fn statements(&mut self, cg: &mut CodeGenerator, statements: &[SStmt<'_>]) -> Result<(), CompileError> {
        for statement in statements {
            self.statement(cg, statement)?;
        }
        Ok(())
    }

    fn statement(&mut self, cg: &mut CodeGenerator, statement: &SStmt<'_>) -> Result<(), CompileError> {
        self.mark(cg, statement.span);
        match &statement.node {
            Stmt::Expr(expression) => {
                self.expression(cg, expression)?;
                cg.pop_top();
            }
            Stmt::Assign { targets, value } => {
                self.expression(cg, value)?;
                for (index, target) in targets.iter().enumerate() {
                    if index + 1 < targets.len() {
                        cg.dup_top();
                    }
                    self.store_target(cg, target)?;
                }
            }
            Stmt::AugAssign { target, op, value } => match &target.node {
                Target::Name(name) => {
                    self.load(cg, name);
                    self.expression(cg, value)?;
                    cg.binary_op(*op);
                    self.store(cg, name);
                }
                Target::Attribute { value: object, attr } => {
                    self.expression(cg, object)?;
                    cg.dup_top();
                    cg.load_attr(*attr);
                    self.expression(cg, value)?;
                    cg.binary_op(*op);
                    cg.rot_two();
                    cg.store_attr(*attr);
                }
                Target::Subscript { value: object, index } => {
                    self.expression(cg, object)?;
                    self.expression(cg, index)?;
                    cg.dup_top_two();
                    cg.binary_subscr();
                    self.expression(cg, value)?;
                    cg.binary_op(*op);
                    cg.rot_three();
                    cg.store_subscr();
                }
                Target::Tuple(_) => {
                    return Err(CompileError::UnsupportedConstruct(
                        "augmented assignment to a tuple".into(),
                    ));
                }
            },
            Stmt::Delete(targets) => {
                for target in targets {
                    self.delete_target(cg, target)?;
                }
            }
            Stmt::Global(_) | Stmt::Pass => {}
            Stmt::Return(value) => {
                match value {
                    Some(value) => self.expression(cg, value)?,
                    None => cg.load_const(Constant::None),
                }
                cg.return_value();
            }
            Stmt::If { test, body, orelse } => {
                let otherwise = cg.new_label();
                let done = cg.new_label();
                self.expression(cg, test)?;
                cg.pop_jump_if_false(otherwise);
                self.statements(cg, body)?;
                cg.jump(done);
                cg.label(otherwise);
                self.statements(cg, orelse)?;
                cg.label(done);
            }
            Stmt::For {
                target,
                iter,
                body,
                orelse,
            } => {
                self.expression(cg, iter)?;
                cg.for_loop(|cg| {
                    self.store_target(cg, target)?;
                    self.statements(cg, body)
                })?;
                self.statements(cg, orelse)?;
            }
            Stmt::FunctionDef { name, params, body } => {
                let (defaults, kw_defaults) = self.defaults(cg, params)?;
                let unit = self.function_unit(name, params, FunctionBody::Block(body), statement.span)?;
                let captures = unit.freevars.clone();
                self.mark(cg, statement.span);
                cg.load_const(Constant::Code(unit));
                cg.make_function(defaults, kw_defaults, captures);
                self.store(cg, name);
            }
        }
        Ok(())
    }

    fn store_target(&mut self, cg: &mut CodeGenerator, target: &Spanned<Target<'_>>) -> Result<(), CompileError> {
        match &target.node {
            Target::Name(name) => self.store(cg, name),
            Target::Attribute { value, attr } => {
                self.expression(cg, value)?;
                cg.store_attr(*attr);
            }
            Target::Subscript { value, index } => {
                self.expression(cg, value)?;
                self.expression(cg, index)?;
                cg.store_subscr();
            }
            Target::Tuple(items) => {
                cg.unpack_sequence(items.len() as u32);
                for item in items {
                    self.store_target(cg, item)?;
                }
            }
        }
        Ok(())
    }

    fn delete_target(&mut self, cg: &mut CodeGenerator, target: &Spanned<Target<'_>>) -> Result<(), CompileError> {
        match &target.node {
            Target::Name(name) => self.delete(cg, name)?,
            Target::Attribute { value, attr } => {
                self.expression(cg, value)?;
                cg.delete_attr(*attr);
            }
            Target::Subscript { value, index } => {
                self.expression(cg, value)?;
                self.expression(cg, index)?;
                cg.delete_subscr();
            }
            Target::Tuple(items) => {
                for item in items {
                    self.delete_target(cg, item)?;
                }
            }
        }
        Ok(())
    }

    fn expression(&mut self, cg: &mut CodeGenerator, expression: &SExpr<'_>) -> Result<(), CompileError> {
        match &expression.node {
            Expr::Literal(literal) => cg.load_const(match literal {
                Literal::None => Constant::None,
                Literal::Bool(value) => Constant::Bool(*value),
                Literal::Int(value) => Constant::Int(*value),
                Literal::Float(value) => Constant::Float((*value).into()),
                Literal::Str(text) => Constant::Str(text.as_ref().into()),
            }),
            Expr::Name(name) => self.load(cg, name),
            Expr::Attribute { value, attr } => {
                self.expression(cg, value)?;
                cg.load_attr(*attr);
            }
            Expr::Call {
                func,
                args,
                keywords,
            } => {
                self.expression(cg, func)?;
                for arg in args {
                    self.expression(cg, arg)?;
                }
                for (_, value) in keywords {
                    self.expression(cg, value)?;
                }
                let argc = (args.len() + keywords.len()) as u32;
                if keywords.is_empty() {
                    cg.call_function(argc);
                } else {
                    let names = keywords.iter().map(|(name, _)| Name::from(*name)).collect();
                    cg.call_function_kw(argc, names);
                }
            }
            Expr::Subscript { value, index } => {
                self.expression(cg, value)?;
                self.expression(cg, index)?;
                cg.binary_subscr();
            }
            Expr::Tuple(items) => {
                for item in items {
                    self.expression(cg, item)?;
                }
                cg.build_tuple(items.len() as u32);
            }
            Expr::List(items) => {
                for item in items {
                    self.expression(cg, item)?;
                }
                cg.build_list(items.len() as u32);
            }
            Expr::Dict(pairs) => {
                for (key, value) in pairs {
                    self.expression(cg, key)?;
                    self.expression(cg, value)?;
                }
                cg.build_map(pairs.len() as u32);
            }
            Expr::ListComp {
                element,
                generators,
            } => self.comprehension(cg, element, generators, expression.span)?,
            Expr::Lambda { params, body } => {
                let (defaults, kw_defaults) = self.defaults(cg, params)?;
                let unit = self.function_unit("<lambda>", params, FunctionBody::Lambda(body), expression.span)?;
                let captures = unit.freevars.clone();
                cg.load_const(Constant::Code(unit));
                cg.make_function(defaults, kw_defaults, captures);
            }
            Expr::IfExp { test, body, orelse } => {
                let otherwise = cg.new_label();
                let done = cg.new_label();
                self.expression(cg, test)?;
                cg.pop_jump_if_false(otherwise);
                self.expression(cg, body)?;
                cg.jump(done);
                cg.label(otherwise);
                self.expression(cg, orelse)?;
                cg.label(done);
            }
            Expr::BoolOp { op, left, right } => {
                let done = cg.new_label();
                self.expression(cg, left)?;
                match op {
                    BoolOp::And => cg.jump_if_false_or_pop(done),
                    BoolOp::Or => cg.jump_if_true_or_pop(done),
                }
                self.expression(cg, right)?;
                cg.label(done);
            }
            Expr::BinOp { op, left, right } => {
                self.expression(cg, left)?;
                self.expression(cg, right)?;
                cg.binary_op(*op);
            }
            Expr::UnaryOp { op, operand } => {
                self.expression(cg, operand)?;
                cg.unary_op(*op);
            }
            Expr::Compare { op, left, right } => {
                self.expression(cg, left)?;
                self.expression(cg, right)?;
                cg.compare_op(*op);
            }
        }
        Ok(())
    }

    /// Pushes default values: positional ones first, then keyword-only ones.
    fn defaults(&mut self, cg: &mut CodeGenerator, params: &Parameters<'_>) -> Result<(u32, Vec<Name>), CompileError> {
        let mut positional = 0;
        for param in params.positional() {
            if let Some(default) = &param.default {
                self.expression(cg, default)?;
                positional += 1;
            }
        }
        let mut keyword = Vec::new();
        for param in &params.kwonly {
            if let Some(default) = &param.default {
                self.expression(cg, default)?;
                keyword.push(Name::from(param.name));
            }
        }
        Ok((positional, keyword))
    }

    fn function_unit(
        &mut self,
        name: &str,
        params: &Parameters<'_>,
        body: FunctionBody<'_, '_>,
        span: Span,
    ) -> Result<Arc<CompiledUnit>, CompileError> {
        let mut child = self.child()?;
        let kind = match body {
            FunctionBody::Lambda(_) => UnitKind::Expression,
            FunctionBody::Block(_) => UnitKind::Statement,
        };
        let mut cg = child.generator(kind, name);
        cg.first_line = self.lines.line(span.start);
        cg.args = params.names().map(Name::from).collect();
        cg.positional_only_count = params.posonly.len() as u32;
        cg.keyword_only_count = params.kwonly.len() as u32;
        cg.varargs = params.vararg.is_some();
        cg.varkwargs = params.kwarg.is_some();
        child.mark(&mut cg, span);
        match body {
            FunctionBody::Lambda(expression) => {
                child.expression(&mut cg, expression)?;
                cg.return_value();
            }
            FunctionBody::Block(statements) => {
                if let Some(Spanned {
                    node: Stmt::Expr(Spanned {
                        node: Expr::Literal(Literal::Str(doc)),
                        ..
                    }),
                    ..
                }) = statements.first()
                {
                    cg.docstring = Some(doc.as_ref().into());
                }
                child.statements(&mut cg, statements)?;
                cg.load_const(Constant::None);
                cg.return_value();
            }
        }
        cg.to_unit()
    }

    /// Builds the comprehension unit, then calls it with the outermost
    /// iterable evaluated in the creator.
    fn comprehension(
        &mut self,
        cg: &mut CodeGenerator,
        element: &SExpr<'_>,
        generators: &[Comprehension<'_>],
        span: Span,
    ) -> Result<(), CompileError> {
        let Some(first) = generators.first() else {
            return Err(CompileError::Malformed("comprehension without a for clause".into()));
        };
        let mut child = self.child()?;
        let mut inner = child.generator(UnitKind::Expression, "<listcomp>");
        inner.args = vec![Name::from(".0")];
        child.mark(&mut inner, span);
        inner.build_list(0);
        inner.load_fast(".0");
        child.generator_clause(&mut inner, element, generators, 0)?;
        inner.return_value();
        let unit = inner.to_unit()?;

        let captures = unit.freevars.clone();
        cg.load_const(Constant::Code(unit));
        cg.make_function(0, Vec::new(), captures);
        self.expression(cg, &first.iter)?;
        cg.call_function(1);
        Ok(())
    }

    /// Loops over the iterable on TOS; the result list sits below every
    /// active iterator.
    fn generator_clause(
        &mut self,
        cg: &mut CodeGenerator,
        element: &SExpr<'_>,
        generators: &[Comprehension<'_>],
        index: usize,
    ) -> Result<(), CompileError> {
        let generator = &generators[index];
        cg.for_loop(|cg| {
            self.store_target(cg, &generator.target)?;
            let skip = cg.new_label();
            for condition in &generator.ifs {
                self.expression(cg, condition)?;
                cg.pop_jump_if_false(skip);
            }
            match generators.get(index + 1) {
                Some(next) => {
                    self.expression(cg, &next.iter)?;
                    self.generator_clause(cg, element, generators, index + 1)?;
                }
                None => {
                    self.expression(cg, element)?;
                    cg.list_append(index as u32 + 2);
                }
            }
            cg.label(skip);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{BinaryOp, IsaRevision, Op, stack};

    fn compiler() -> Compiler {
        Compiler::new(IsaRevision::Classic.target()).with_filename("test.bind")
    }

    fn ops(unit: &CompiledUnit) -> Vec<Op> {
        unit.instructions.iter().map(|instruction| instruction.op.clone()).collect()
    }

    #[test]
    fn attribute_reads_compile_to_name_loads() {
        let unit = compiler().expression("a.x + b.y", "binding").unwrap();
        assert_eq!(
            ops(&unit),
            vec![
                Op::LoadName("a".into()),
                Op::LoadAttr("x".into()),
                Op::LoadName("b".into()),
                Op::LoadAttr("y".into()),
                Op::Binary(BinaryOp::Add),
                Op::ReturnValue,
            ]
        );
        assert_eq!(unit.kind, UnitKind::Expression);
        assert!(!unit.creates_new_local_frame);
        assert_eq!(&*unit.source_file, "test.bind");
    }

    #[test]
    fn lambda_opens_a_frame_and_reads_free_names_globally() {
        let unit = compiler().expression("lambda a, b=2: a + b + c", "binding").unwrap();
        let lambda = unit.nested_units().next().unwrap();
        assert!(lambda.creates_new_local_frame);
        assert_eq!(lambda.arg_names, vec![Name::from("a"), Name::from("b")]);
        assert!(ops(lambda).contains(&Op::LoadGlobal("c".into())));
        assert!(ops(&unit).contains(&Op::MakeFunction {
            defaults: 1,
            kw_defaults: Vec::new().into(),
            captures: Vec::new().into(),
        }));
    }

    #[test]
    fn comprehension_shares_the_creator_namespace() {
        let unit = compiler()
            .expression("[x * scale for x in items if x]", "binding")
            .unwrap();
        let comprehension = unit.nested_units().next().unwrap();
        assert!(!comprehension.creates_new_local_frame);
        let body = ops(comprehension);
        assert!(body.contains(&Op::LoadFast("x".into())));
        assert!(body.contains(&Op::LoadName("scale".into())));
        assert!(body.contains(&Op::ListAppend(2)));
        assert!(stack::simulate(&comprehension.instructions, comprehension.kind).is_ok());
    }

    #[test]
    fn closures_use_cells() {
        let definition = compiler()
            .function_def("def make(base):\n    return lambda offset: base + offset\n")
            .unwrap();
        assert_eq!(definition.body.cellvars, vec![Name::from("base")]);
        let lambda = definition.body.nested_units().next().unwrap();
        assert_eq!(lambda.freevars, vec![Name::from("base")]);
        assert!(ops(lambda).contains(&Op::LoadDeref("base".into())));
    }

    #[test]
    fn function_definition_collects_defaults() {
        let definition = compiler()
            .function_def("def f(a, b=1, *, c=2):\n    \"doc\"\n    return a\n")
            .unwrap();
        assert_eq!(&*definition.name, "f");
        assert_eq!(definition.positional_defaults, 1);
        assert_eq!(definition.kw_defaults, vec![Name::from("c")]);
        assert_eq!(definition.body.doc.as_deref(), Some("doc"));
        assert_eq!(definition.body.keyword_only_count, 1);
        assert!(matches!(
            compiler().function_def("x = 1\n"),
            Err(CompileError::UnsupportedConstruct(_))
        ));
    }

    #[test]
    fn blocks_track_lines_and_globals() {
        let unit = compiler()
            .at_line(10)
            .block("global total\ntotal = change\nlog(total)\n", "handler")
            .unwrap();
        assert_eq!(unit.declared_globals, vec![Name::from("total")]);
        let store = unit
            .instructions
            .iter()
            .find(|instruction| instruction.op == Op::StoreGlobal("total".into()))
            .unwrap();
        assert_eq!(store.line, Some(11));
        assert!(stack::simulate(&unit.instructions, UnitKind::Statement).is_ok());
    }

    #[test]
    fn augmented_subscript_assignment_is_balanced() {
        let unit = compiler().block("counts[key] += 1\nobj.total *= 2\n", "block").unwrap();
        assert!(stack::simulate(&unit.instructions, unit.kind).is_ok());
    }

    #[test]
    fn callable_promotes_known_names() {
        let unit = compiler().callable("x * y + len(z)", &["y".into(), "x".into()]).unwrap();
        assert!(unit.creates_new_local_frame);
        assert_eq!(unit.arg_names, vec![Name::from("x"), Name::from("y")]);
        assert!(ops(&unit).contains(&Op::LoadGlobal("len".into())));
        assert!(ops(&unit).contains(&Op::Reraise));
    }
}
