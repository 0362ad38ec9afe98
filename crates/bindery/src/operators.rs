//! Binding operators.
//!
//! An [`Operator`] turns the compiled source of one binding into the
//! [`HandlerPair`] installed on the bound attribute. Operators are looked up by
//! symbol in the [`OperatorMap`] on top of a [`CompilationContext`]'s stack,
//! which callers can temporarily override for a nested compilation pass.

use indexmap::IndexMap;
use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

use crate::bytecode::{IsaRevision, Name, TargetIsa};
use crate::codegen::CompiledUnit;
use crate::compiler::Compiler;
use crate::declarative::DynamicScopeKey;
use crate::error::CompileError;
use crate::handlers::{
    HandlerPair, StandardInvertedWriteHandler, StandardReadHandler, StandardTracedReadHandler,
    StandardWriteHandler,
};
use crate::inversion::inject_inversion;
use crate::scope_rewriter::run_in_dynamic_scope;
use crate::tracing::inject_tracing;

/// Whether an operator's source is a single expression or a statement block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Expression,
    Block,
}

type Compiled = Result<HandlerPair, CompileError>;
type CompileFn = dyn Fn(&Arc<CompiledUnit>, DynamicScopeKey, &CompilationContext) -> Compiled
    + Send
    + Sync;

#[derive(Clone)]
pub struct Operator {
    pub symbol: Name,
    pub source_kind: SourceKind,
    compile: Arc<CompileFn>,
}

impl Operator {
    pub fn new(
        symbol: impl Into<Name>,
        source_kind: SourceKind,
        compile: impl Fn(&Arc<CompiledUnit>, DynamicScopeKey, &CompilationContext) -> Compiled
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            source_kind,
            compile: Arc::new(compile),
        }
    }

    pub fn compile(
        &self,
        unit: &Arc<CompiledUnit>,
        key: DynamicScopeKey,
        context: &CompilationContext,
    ) -> Result<HandlerPair, CompileError> {
        (self.compile)(unit, key, context)
    }
}

impl fmt::Debug for Operator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Operator")
            .field("symbol", &self.symbol)
            .field("source_kind", &self.source_kind)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default)]
pub struct OperatorMap {
    operators: IndexMap<Name, Operator>,
}

impl OperatorMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// `=`, `::`, `<<`, `>>` and `:=`.
    pub fn defaults() -> Self {
        [
            Operator::new("=", SourceKind::Expression, op_simple),
            Operator::new("::", SourceKind::Block, op_notify),
            Operator::new("<<", SourceKind::Expression, op_subscribe),
            Operator::new(">>", SourceKind::Expression, op_update),
            Operator::new(":=", SourceKind::Expression, op_delegate),
        ]
        .into_iter()
        .collect()
    }

    pub fn insert(&mut self, operator: Operator) -> Option<Operator> {
        self.operators.insert(operator.symbol.clone(), operator)
    }

    pub fn with(mut self, operator: Operator) -> Self {
        self.insert(operator);
        self
    }

    pub fn get(&self, symbol: &str) -> Option<&Operator> {
        self.operators.get(symbol)
    }

    pub fn symbols(&self) -> impl Iterator<Item = &Name> {
        self.operators.keys()
    }

    /// `self` with `other`'s entries layered on top.
    pub fn union(&self, other: &OperatorMap) -> Self {
        let mut merged = self.clone();
        for operator in other.operators.values() {
            merged.insert(operator.clone());
        }
        merged
    }
}

impl FromIterator<Operator> for OperatorMap {
    fn from_iter<T: IntoIterator<Item = Operator>>(iter: T) -> Self {
        let mut map = Self::new();
        for operator in iter {
            map.insert(operator);
        }
        map
    }
}

fn op_simple(
    unit: &Arc<CompiledUnit>,
    key: DynamicScopeKey,
    context: &CompilationContext,
) -> Result<HandlerPair, CompileError> {
    let unit = run_in_dynamic_scope(unit, context.isa())?;
    Ok(HandlerPair::reader(StandardReadHandler { unit, key }))
}

fn op_notify(
    unit: &Arc<CompiledUnit>,
    key: DynamicScopeKey,
    context: &CompilationContext,
) -> Result<HandlerPair, CompileError> {
    let unit = run_in_dynamic_scope(unit, context.isa())?;
    Ok(HandlerPair::writer(StandardWriteHandler { unit, key }))
}

fn traced_reader(
    unit: &Arc<CompiledUnit>,
    key: DynamicScopeKey,
    isa: &'static dyn TargetIsa,
) -> Result<StandardTracedReadHandler, CompileError> {
    let scoped = run_in_dynamic_scope(unit, isa)?;
    let unit = inject_tracing(&scoped, isa)?;
    Ok(StandardTracedReadHandler { unit, key })
}

fn inverted_writer(
    unit: &Arc<CompiledUnit>,
    key: DynamicScopeKey,
    isa: &'static dyn TargetIsa,
) -> Result<StandardInvertedWriteHandler, CompileError> {
    let scoped = run_in_dynamic_scope(unit, isa)?;
    let unit = inject_inversion(&scoped, isa)?;
    Ok(StandardInvertedWriteHandler { unit, key })
}

fn op_subscribe(
    unit: &Arc<CompiledUnit>,
    key: DynamicScopeKey,
    context: &CompilationContext,
) -> Result<HandlerPair, CompileError> {
    Ok(HandlerPair::reader(traced_reader(unit, key, context.isa())?))
}

fn op_update(
    unit: &Arc<CompiledUnit>,
    key: DynamicScopeKey,
    context: &CompilationContext,
) -> Result<HandlerPair, CompileError> {
    Ok(HandlerPair::writer(inverted_writer(unit, key, context.isa())?))
}

fn op_delegate(
    unit: &Arc<CompiledUnit>,
    key: DynamicScopeKey,
    context: &CompilationContext,
) -> Result<HandlerPair, CompileError> {
    let isa = context.isa();
    Ok(HandlerPair::reader(traced_reader(unit, key, isa)?)
        .with_writer(inverted_writer(unit, key, isa)?))
}

/// Configuration threaded through the compilation of declarative classes:
/// the target instruction set, the source file name and the operator stack.
pub struct CompilationContext {
    isa: &'static dyn TargetIsa,
    filename: Name,
    operators: RefCell<Vec<OperatorMap>>,
}

impl CompilationContext {
    pub fn new(isa: &'static dyn TargetIsa) -> Self {
        Self {
            isa,
            filename: "<string>".into(),
            operators: RefCell::new(vec![OperatorMap::defaults()]),
        }
    }

    /// Context for the instruction set of the running host.
    pub fn host() -> Self {
        Self::new(IsaRevision::host().target())
    }

    pub fn with_filename(mut self, filename: impl Into<Name>) -> Self {
        self.filename = filename.into();
        self
    }

    pub fn isa(&self) -> &'static dyn TargetIsa {
        self.isa
    }

    pub fn filename(&self) -> &Name {
        &self.filename
    }

    pub fn compiler(&self) -> Compiler {
        Compiler::new(self.isa).with_filename(self.filename.clone())
    }

    /// The operator currently registered for `symbol`.
    pub fn operator(&self, symbol: &str) -> Option<Operator> {
        self.operators
            .borrow()
            .last()
            .and_then(|operators| operators.get(symbol).cloned())
    }

    /// Installs `operators` until the matching [`pop_operators`]. With
    /// `union`, they are layered over the current map instead of replacing
    /// it.
    ///
    /// [`pop_operators`]: Self::pop_operators
    pub fn push_operators(&self, operators: OperatorMap, union: bool) {
        let mut stack = self.operators.borrow_mut();
        let operators = match (union, stack.last()) {
            (true, Some(current)) => current.union(&operators),
            _ => operators,
        };
        log::debug!("pushed operators [{}]", join_symbols(&operators));
        stack.push(operators);
    }

    /// Removes the most recent override. The defaults are never popped.
    pub fn pop_operators(&self) -> Option<OperatorMap> {
        let mut stack = self.operators.borrow_mut();
        if stack.len() <= 1 {
            log::warn!("operator stack is already at its defaults");
            return None;
        }
        let popped = stack.pop();
        log::debug!("popped operators");
        popped
    }

    /// Runs `f` with `operators` installed.
    pub fn with_operators<R>(
        &self,
        operators: OperatorMap,
        union: bool,
        f: impl FnOnce(&Self) -> R,
    ) -> R {
        self.push_operators(operators, union);
        let result = f(self);
        self.pop_operators();
        result
    }

    /// Compiles one binding: `source_code` is compiled according to the
    /// operator's source kind and handed to the operator with a fresh scope
    /// key.
    pub fn compile_binding(
        &self,
        symbol: &str,
        source_code: &str,
        name: &str,
        line: u32,
    ) -> Result<(HandlerPair, DynamicScopeKey), CompileError> {
        let operator = self
            .operator(symbol)
            .ok_or_else(|| CompileError::UnknownOperator(symbol.to_owned()))?;
        let compiler = self.compiler().at_line(line);
        let unit = match operator.source_kind {
            SourceKind::Expression => compiler.expression(source_code, name)?,
            SourceKind::Block => compiler.block(source_code, name)?,
        };
        let key = DynamicScopeKey::new();
        let handlers = operator.compile(&unit, key, self)?;
        log::debug!("compiled binding {name} {symbol} at line {line} ({key})");
        Ok((handlers, key))
    }
}

impl fmt::Debug for CompilationContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CompilationContext")
            .field("isa", &self.isa.revision())
            .field("filename", &self.filename)
            .field("depth", &self.operators.borrow().len())
            .finish()
    }
}

fn join_symbols(operators: &OperatorMap) -> String {
    operators
        .symbols()
        .map(|symbol| &**symbol)
        .collect::<Vec<_>>()
        .join(" ")
}
