//! Scope analysis run before code generation.
//!
//! Every `def`, `lambda` and list comprehension opens a child scope. Child
//! scopes are recorded in the order code generation will reach them, so the
//! emitter can walk them with a plain cursor.

use indexmap::IndexSet;

use crate::bytecode::Name;
use crate::parser::{Comprehension, Expr, Parameters, SExpr, SStmt, Spanned, Stmt, Target};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Module,
    Function,
    /// Comprehension bodies run as their own unit but share the creator's
    /// namespace instead of opening a new local frame.
    Comprehension,
}

/// How a name is reached from a given scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Fast,
    Deref,
    Global,
    Name,
}

#[derive(Debug)]
pub struct Scope {
    pub kind: ScopeKind,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    pub bound: IndexSet<Name>,
    pub globals: IndexSet<Name>,
    pub used: IndexSet<Name>,
    pub cells: IndexSet<Name>,
    pub frees: IndexSet<Name>,
}

impl Scope {
    fn new(kind: ScopeKind, parent: Option<usize>) -> Self {
        Self {
            kind,
            parent,
            children: Vec::new(),
            bound: IndexSet::new(),
            globals: IndexSet::new(),
            used: IndexSet::new(),
            cells: IndexSet::new(),
            frees: IndexSet::new(),
        }
    }
}

#[derive(Debug)]
pub struct SymbolTable {
    scopes: Vec<Scope>,
}

impl SymbolTable {
    pub const ROOT: usize = 0;

    pub fn for_module(statements: &[SStmt<'_>]) -> Self {
        let mut builder = Builder::new();
        builder.statements(statements);
        builder.finish()
    }

    pub fn for_expression(expression: &SExpr<'_>) -> Self {
        let mut builder = Builder::new();
        builder.expression(expression);
        builder.finish()
    }

    pub fn scope(&self, id: usize) -> &Scope {
        &self.scopes[id]
    }

    pub fn access(&self, id: usize, name: &str) -> Access {
        let scope = &self.scopes[id];
        if scope.globals.contains(name) {
            return Access::Global;
        }
        if scope.cells.contains(name) || scope.frees.contains(name) {
            return Access::Deref;
        }
        match scope.kind {
            ScopeKind::Module => Access::Name,
            _ if scope.bound.contains(name) => Access::Fast,
            ScopeKind::Function => Access::Global,
            ScopeKind::Comprehension => match self.frame_kind(id) {
                ScopeKind::Function => Access::Global,
                _ => Access::Name,
            },
        }
    }

    /// Kind of the nearest enclosing scope that owns a real frame.
    fn frame_kind(&self, mut id: usize) -> ScopeKind {
        loop {
            let scope = &self.scopes[id];
            match (scope.kind, scope.parent) {
                (ScopeKind::Comprehension, Some(parent)) => id = parent,
                (kind, _) => return kind,
            }
        }
    }

    fn resolve_frees(&mut self) {
        for id in 0..self.scopes.len() {
            let scope = &self.scopes[id];
            let free: Vec<Name> = scope
                .used
                .iter()
                .filter(|name| !scope.bound.contains(*name) && !scope.globals.contains(*name))
                .cloned()
                .collect();
            for name in free {
                let mut chain = vec![id];
                let mut cursor = self.scopes[id].parent;
                while let Some(parent) = cursor {
                    let enclosing = &self.scopes[parent];
                    if enclosing.kind == ScopeKind::Module || enclosing.globals.contains(&name) {
                        break;
                    }
                    if enclosing.bound.contains(&name) {
                        self.scopes[parent].cells.insert(name.clone());
                        for link in &chain {
                            self.scopes[*link].frees.insert(name.clone());
                        }
                        break;
                    }
                    chain.push(parent);
                    cursor = enclosing.parent;
                }
            }
        }
    }
}

struct Builder {
    scopes: Vec<Scope>,
    current: usize,
}

impl Builder {
    fn new() -> Self {
        Self {
            scopes: vec![Scope::new(ScopeKind::Module, None)],
            current: SymbolTable::ROOT,
        }
    }

    fn finish(self) -> SymbolTable {
        let mut table = SymbolTable {
            scopes: self.scopes,
        };
        table.resolve_frees();
        table
    }

    fn open(&mut self, kind: ScopeKind) {
        let id = self.scopes.len();
        self.scopes.push(Scope::new(kind, Some(self.current)));
        self.scopes[self.current].children.push(id);
        self.current = id;
    }

    fn close(&mut self) {
        self.current = self.scopes[self.current].parent.unwrap_or(SymbolTable::ROOT);
    }

    fn bind(&mut self, name: &str) {
        self.scopes[self.current].bound.insert(name.into());
    }

    fn use_name(&mut self, name: &str) {
        self.scopes[self.current].used.insert(name.into());
    }

    fn statements(&mut self, statements: &[SStmt<'_>]) {
        for statement in statements {
            self.statement(statement);
        }
    }

    fn statement(&mut self, statement: &SStmt<'_>) {
        match &statement.node {
            Stmt::Expr(expression) => self.expression(expression),
            Stmt::Assign { targets, value } => {
                self.expression(value);
                for target in targets {
                    self.target(target);
                }
            }
            Stmt::AugAssign { target, value, .. } => {
                if let Target::Name(name) = target.node {
                    self.use_name(name);
                }
                self.target(target);
                self.expression(value);
            }
            Stmt::Delete(targets) => {
                for target in targets {
                    self.target(target);
                }
            }
            Stmt::Global(names) => {
                for name in names {
                    self.scopes[self.current].globals.insert((*name).into());
                }
            }
            Stmt::Return(value) => {
                if let Some(value) = value {
                    self.expression(value);
                }
            }
            Stmt::Pass => {}
            Stmt::If { test, body, orelse } => {
                self.expression(test);
                self.statements(body);
                self.statements(orelse);
            }
            Stmt::For {
                target,
                iter,
                body,
                orelse,
            } => {
                self.expression(iter);
                self.target(target);
                self.statements(body);
                self.statements(orelse);
            }
            Stmt::FunctionDef { name, params, body } => {
                self.defaults(params);
                self.open(ScopeKind::Function);
                self.parameters(params);
                self.statements(body);
                self.close();
                self.bind(name);
            }
        }
    }

    fn defaults(&mut self, params: &Parameters<'_>) {
        for param in params.positional().chain(&params.kwonly) {
            if let Some(default) = &param.default {
                self.expression(default);
            }
        }
    }

    fn parameters(&mut self, params: &Parameters<'_>) {
        for name in params.names() {
            self.bind(name);
        }
    }

    fn target(&mut self, target: &Spanned<Target<'_>>) {
        match &target.node {
            Target::Name(name) => self.bind(name),
            Target::Attribute { value, .. } => self.expression(value),
            Target::Subscript { value, index } => {
                self.expression(value);
                self.expression(index);
            }
            Target::Tuple(items) => {
                for item in items {
                    self.target(item);
                }
            }
        }
    }

    fn expression(&mut self, expression: &SExpr<'_>) {
        match &expression.node {
            Expr::Literal(_) => {}
            Expr::Name(name) => self.use_name(name),
            Expr::Attribute { value, .. } => self.expression(value),
            Expr::Call {
                func,
                args,
                keywords,
            } => {
                self.expression(func);
                for arg in args {
                    self.expression(arg);
                }
                for (_, value) in keywords {
                    self.expression(value);
                }
            }
            Expr::Subscript { value, index } => {
                self.expression(value);
                self.expression(index);
            }
            Expr::Tuple(items) | Expr::List(items) => {
                for item in items {
                    self.expression(item);
                }
            }
            Expr::Dict(pairs) => {
                for (key, value) in pairs {
                    self.expression(key);
                    self.expression(value);
                }
            }
            Expr::ListComp {
                element,
                generators,
            } => self.comprehension(element, generators),
            Expr::Lambda { params, body } => {
                self.defaults(params);
                self.open(ScopeKind::Function);
                self.parameters(params);
                self.expression(body);
                self.close();
            }
            Expr::IfExp { test, body, orelse } => {
                self.expression(test);
                self.expression(body);
                self.expression(orelse);
            }
            Expr::BoolOp { left, right, .. }
            | Expr::BinOp { left, right, .. }
            | Expr::Compare { left, right, .. } => {
                self.expression(left);
                self.expression(right);
            }
            Expr::UnaryOp { operand, .. } => self.expression(operand),
        }
    }

    /// The outermost iterable is evaluated by the creator, after the
    /// comprehension unit itself has been built.
    fn comprehension(&mut self, element: &SExpr<'_>, generators: &[Comprehension<'_>]) {
        self.open(ScopeKind::Comprehension);
        self.bind(".0");
        for (index, generator) in generators.iter().enumerate() {
            if index > 0 {
                self.expression(&generator.iter);
            }
            self.target(&generator.target);
            for condition in &generator.ifs {
                self.expression(condition);
            }
        }
        self.expression(element);
        self.close();
        if let Some(first) = generators.first() {
            self.expression(&first.iter);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{parse_expression, parse_module};

    #[test]
    fn closures_mark_cells_and_frees() {
        let statements =
            parse_module("def outer(a):\n    b = 1\n    return lambda: a + b + c\n").unwrap();
        let table = SymbolTable::for_module(&statements);
        let outer = table.scope(SymbolTable::ROOT).children[0];
        let inner = table.scope(outer).children[0];
        assert_eq!(table.access(outer, "a"), Access::Deref);
        assert_eq!(table.access(inner, "b"), Access::Deref);
        assert_eq!(table.access(inner, "c"), Access::Global);
        assert_eq!(table.access(SymbolTable::ROOT, "outer"), Access::Name);
    }

    #[test]
    fn comprehension_names_follow_the_creator() {
        let expression = parse_expression("[x + y for x in items]").unwrap();
        let table = SymbolTable::for_expression(&expression);
        let comprehension = table.scope(SymbolTable::ROOT).children[0];
        assert_eq!(table.access(comprehension, "x"), Access::Fast);
        assert_eq!(table.access(comprehension, "y"), Access::Name);
        assert!(table.scope(SymbolTable::ROOT).used.contains("items"));
    }

    #[test]
    fn global_declarations_win() {
        let statements = parse_module("def f():\n    global total\n    total = 1\n").unwrap();
        let table = SymbolTable::for_module(&statements);
        let function = table.scope(SymbolTable::ROOT).children[0];
        assert_eq!(table.access(function, "total"), Access::Global);
    }
}
