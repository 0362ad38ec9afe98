use std::borrow::Cow;

use super::Spanned;
use crate::bytecode::{BinaryOp, CompareOp, UnaryOp};

pub type SExpr<'code> = Spanned<Expr<'code>>;
pub type SStmt<'code> = Spanned<Stmt<'code>>;

#[derive(Debug, Clone, PartialEq)]
pub enum Literal<'code> {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Cow<'code, str>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum BoolOp {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr<'code> {
    Literal(Literal<'code>),
    Name(&'code str),
    Attribute {
        value: Box<SExpr<'code>>,
        attr: &'code str,
    },
    Call {
        func: Box<SExpr<'code>>,
        args: Vec<SExpr<'code>>,
        keywords: Vec<(&'code str, SExpr<'code>)>,
    },
    Subscript {
        value: Box<SExpr<'code>>,
        index: Box<SExpr<'code>>,
    },
    Tuple(Vec<SExpr<'code>>),
    List(Vec<SExpr<'code>>),
    Dict(Vec<(SExpr<'code>, SExpr<'code>)>),
    ListComp {
        element: Box<SExpr<'code>>,
        generators: Vec<Comprehension<'code>>,
    },
    Lambda {
        params: Parameters<'code>,
        body: Box<SExpr<'code>>,
    },
    IfExp {
        test: Box<SExpr<'code>>,
        body: Box<SExpr<'code>>,
        orelse: Box<SExpr<'code>>,
    },
    BoolOp {
        op: BoolOp,
        left: Box<SExpr<'code>>,
        right: Box<SExpr<'code>>,
    },
    BinOp {
        op: BinaryOp,
        left: Box<SExpr<'code>>,
        right: Box<SExpr<'code>>,
    },
    UnaryOp {
        op: UnaryOp,
        operand: Box<SExpr<'code>>,
    },
    Compare {
        op: CompareOp,
        left: Box<SExpr<'code>>,
        right: Box<SExpr<'code>>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Comprehension<'code> {
    pub target: Spanned<Target<'code>>,
    pub iter: SExpr<'code>,
    pub ifs: Vec<SExpr<'code>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Target<'code> {
    Name(&'code str),
    Attribute {
        value: Box<SExpr<'code>>,
        attr: &'code str,
    },
    Subscript {
        value: Box<SExpr<'code>>,
        index: Box<SExpr<'code>>,
    },
    Tuple(Vec<Spanned<Target<'code>>>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param<'code> {
    pub name: &'code str,
    pub default: Option<SExpr<'code>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Parameters<'code> {
    pub posonly: Vec<Param<'code>>,
    pub args: Vec<Param<'code>>,
    pub vararg: Option<&'code str>,
    pub kwonly: Vec<Param<'code>>,
    pub kwarg: Option<&'code str>,
}

impl<'code> Parameters<'code> {
    /// Parameter names in slot order.
    pub fn names(&self) -> impl Iterator<Item = &'code str> + '_ {
        self.posonly
            .iter()
            .chain(&self.args)
            .chain(&self.kwonly)
            .map(|param| param.name)
            .chain(self.vararg)
            .chain(self.kwarg)
    }

    pub fn positional(&self) -> impl Iterator<Item = &Param<'code>> {
        self.posonly.iter().chain(&self.args)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt<'code> {
    Expr(SExpr<'code>),
    Assign {
        targets: Vec<Spanned<Target<'code>>>,
        value: SExpr<'code>,
    },
    AugAssign {
        target: Spanned<Target<'code>>,
        op: BinaryOp,
        value: SExpr<'code>,
    },
    Delete(Vec<Spanned<Target<'code>>>),
    Global(Vec<&'code str>),
    Return(Option<SExpr<'code>>),
    Pass,
    If {
        test: SExpr<'code>,
        body: Vec<SStmt<'code>>,
        orelse: Vec<SStmt<'code>>,
    },
    For {
        target: Spanned<Target<'code>>,
        iter: SExpr<'code>,
        body: Vec<SStmt<'code>>,
        orelse: Vec<SStmt<'code>>,
    },
    FunctionDef {
        name: &'code str,
        params: Parameters<'code>,
        body: Vec<SStmt<'code>>,
    },
}
