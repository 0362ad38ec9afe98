//! Parser for binding sources.
//!
//! The same grammar serves single binding expressions, notification blocks
//! and declarative function definitions: a small indentation-sensitive
//! language of expressions, statements and `def` blocks.

use chumsky::{input::ValueInput, pratt::*, prelude::*};
use std::borrow::Cow;
use std::fmt;

mod lexer;
pub use lexer::{Token, layout, lexer};

pub mod ast;
pub use ast::*;

pub use chumsky::prelude::{Input, Parser};

use crate::bytecode::{BinaryOp, CompareOp, UnaryOp};
use crate::error::{CompileError, SyntaxError};

pub type Span = SimpleSpan;
pub type ParseError<'code, T> = Rich<'code, T, Span>;

type Extra<'tokens, 'code> = extra::Err<Rich<'tokens, Token<'code>, Span>>;

#[derive(Debug, Clone, PartialEq)]
pub struct Spanned<T> {
    pub span: Span,
    pub node: T,
}

pub fn parse_expression(source_code: &str) -> Result<SExpr<'_>, CompileError> {
    let tokens = tokenize(source_code)?;
    let input = tokens
        .as_slice()
        .map(Span::from(source_code.len()..source_code.len()), |Spanned { node, span }| {
            (node, span)
        });
    let (expression, errors) = expression()
        .then_ignore(just(Token::Newline).or_not())
        .then_ignore(end())
        .parse(input)
        .into_output_errors();
    match expression {
        Some(expression) if errors.is_empty() => Ok(expression),
        _ => Err(syntax_errors(errors)),
    }
}

pub fn parse_module(source_code: &str) -> Result<Vec<SStmt<'_>>, CompileError> {
    let tokens = tokenize(source_code)?;
    let input = tokens
        .as_slice()
        .map(Span::from(source_code.len()..source_code.len()), |Spanned { node, span }| {
            (node, span)
        });
    let (statements, errors) = module().then_ignore(end()).parse(input).into_output_errors();
    match statements {
        Some(statements) if errors.is_empty() => Ok(statements),
        _ => Err(syntax_errors(errors)),
    }
}

fn tokenize(source_code: &str) -> Result<Vec<Spanned<Token<'_>>>, CompileError> {
    let (tokens, errors) = lexer().parse(source_code).into_output_errors();
    if !errors.is_empty() {
        return Err(syntax_errors(errors));
    }
    layout(tokens.unwrap_or_default(), source_code.len()).map_err(|error| syntax_errors([error]))
}

fn syntax_errors<'a, T: fmt::Display + 'a>(
    errors: impl IntoIterator<Item = Rich<'a, T, Span>>,
) -> CompileError {
    let errors: Vec<SyntaxError> = errors
        .into_iter()
        .map(|error| SyntaxError {
            span: error.span().into_range(),
            message: error.to_string(),
            reason: error.reason().to_string(),
        })
        .collect();
    if errors.is_empty() {
        return CompileError::Syntax(vec![SyntaxError {
            span: 0..0,
            message: "unexpected end of input".into(),
            reason: "nothing to parse".into(),
        }]);
    }
    CompileError::Syntax(errors)
}

fn unescape(raw: &str) -> Cow<'_, str> {
    if !raw.contains('\\') {
        return Cow::Borrowed(raw);
    }
    let mut text = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(character) = chars.next() {
        if character != '\\' {
            text.push(character);
            continue;
        }
        match chars.next() {
            Some('n') => text.push('\n'),
            Some('t') => text.push('\t'),
            Some('r') => text.push('\r'),
            Some('0') => text.push('\0'),
            Some(other) => text.push(other),
            None => text.push('\\'),
        }
    }
    Cow::Owned(text)
}

fn spanned<T>(node: T, span: Span) -> Spanned<T> {
    Spanned { node, span }
}

fn binary<'code>(op: BinaryOp, left: SExpr<'code>, right: SExpr<'code>, span: Span) -> SExpr<'code> {
    spanned(
        Expr::BinOp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        },
        span,
    )
}

fn unary<'code>(op: UnaryOp, operand: SExpr<'code>, span: Span) -> SExpr<'code> {
    spanned(
        Expr::UnaryOp {
            op,
            operand: Box::new(operand),
        },
        span,
    )
}

fn boolean<'code>(op: BoolOp, left: SExpr<'code>, right: SExpr<'code>, span: Span) -> SExpr<'code> {
    spanned(
        Expr::BoolOp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        },
        span,
    )
}

fn compare<'code>(op: CompareOp, left: SExpr<'code>, right: SExpr<'code>, span: Span) -> SExpr<'code> {
    spanned(
        Expr::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        },
        span,
    )
}

enum Postfix<'code> {
    Attr(&'code str),
    Call(Vec<Argument<'code>>),
    Index(SExpr<'code>),
}

enum Argument<'code> {
    Positional(SExpr<'code>),
    Keyword(&'code str, SExpr<'code>),
}

enum ListTail<'code> {
    Comprehension(Vec<Comprehension<'code>>),
    Items(Vec<SExpr<'code>>),
}

#[derive(Clone)]
enum ParamItem<'code> {
    Plain(Param<'code>),
    Slash,
    Star(Option<&'code str>),
    DoubleStar(&'code str),
}

fn build_parameters(items: Vec<ParamItem<'_>>) -> Result<Parameters<'_>, String> {
    let mut parameters = Parameters::default();
    let mut seen_star = false;
    let mut seen_default = false;
    for item in items {
        if parameters.kwarg.is_some() {
            return Err("no parameters may follow '**'".into());
        }
        match item {
            ParamItem::Slash => {
                if seen_star || !parameters.posonly.is_empty() {
                    return Err("'/' must come before '*' and appear once".into());
                }
                if parameters.args.is_empty() {
                    return Err("at least one parameter must precede '/'".into());
                }
                parameters.posonly = std::mem::take(&mut parameters.args);
            }
            ParamItem::Plain(param) if seen_star => parameters.kwonly.push(param),
            ParamItem::Plain(param) => {
                if param.default.is_some() {
                    seen_default = true;
                } else if seen_default {
                    return Err(format!(
                        "parameter '{}' without a default follows a parameter with one",
                        param.name
                    ));
                }
                parameters.args.push(param);
            }
            ParamItem::Star(name) => {
                if seen_star {
                    return Err("'*' may appear only once".into());
                }
                seen_star = true;
                parameters.vararg = name;
            }
            ParamItem::DoubleStar(name) => parameters.kwarg = Some(name),
        }
    }
    let mut names: Vec<&str> = parameters.names().collect();
    names.sort_unstable();
    if let Some(pair) = names.windows(2).find(|pair| pair[0] == pair[1]) {
        return Err(format!("duplicate parameter '{}'", pair[0]));
    }
    Ok(parameters)
}

fn parameters<'tokens, 'code: 'tokens, I, P>(
    expr: P,
) -> impl Parser<'tokens, I, Parameters<'code>, Extra<'tokens, 'code>> + Clone
where
    I: ValueInput<'tokens, Token = Token<'code>, Span = Span>,
    P: Parser<'tokens, I, SExpr<'code>, Extra<'tokens, 'code>> + Clone,
{
    let ident = select! { Token::Name(name) => name };
    let item = choice((
        just(Token::DoubleStar)
            .ignore_then(ident)
            .map(ParamItem::DoubleStar),
        just(Token::Star)
            .ignore_then(ident.or_not())
            .map(ParamItem::Star),
        just(Token::Slash).to(ParamItem::Slash),
        ident
            .then(just(Token::Assign).ignore_then(expr).or_not())
            .map(|(name, default)| ParamItem::Plain(Param { name, default })),
    ));
    item.separated_by(just(Token::Comma))
        .allow_trailing()
        .collect::<Vec<_>>()
        .try_map(|items, span| build_parameters(items).map_err(|message| Rich::custom(span, message)))
}

/// Assignment targets of `for` loops and comprehensions: names and
/// parenthesized groups of names.
fn target_list<'tokens, 'code: 'tokens, I>()
-> impl Parser<'tokens, I, Spanned<Target<'code>>, Extra<'tokens, 'code>> + Clone
where
    I: ValueInput<'tokens, Token = Token<'code>, Span = Span>,
{
    let target = recursive(|target| {
        let name = select! { Token::Name(name) => Target::Name(name) };
        let group = target
            .separated_by(just(Token::Comma))
            .at_least(1)
            .allow_trailing()
            .collect::<Vec<_>>()
            .delimited_by(just(Token::ParenOpen), just(Token::ParenClose))
            .map(Target::Tuple);
        name.or(group).map_with(|node, extra| spanned(node, extra.span()))
    });
    target
        .separated_by(just(Token::Comma))
        .at_least(1)
        .collect::<Vec<_>>()
        .map_with(|items, extra| match <[_; 1]>::try_from(items) {
            Ok([single]) => single,
            Err(items) => spanned(Target::Tuple(items), extra.span()),
        })
}

fn to_target<'tokens, 'code>(
    expression: SExpr<'code>,
) -> Result<Spanned<Target<'code>>, Rich<'tokens, Token<'code>, Span>> {
    let span = expression.span;
    let target = match expression.node {
        Expr::Name(name) => Target::Name(name),
        Expr::Attribute { value, attr } => Target::Attribute { value, attr },
        Expr::Subscript { value, index } => Target::Subscript { value, index },
        Expr::Tuple(items) | Expr::List(items) => Target::Tuple(
            items
                .into_iter()
                .map(to_target)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        Expr::Literal(_) => return Err(Rich::custom(span, "can't assign to literal")),
        Expr::Call { .. } => return Err(Rich::custom(span, "can't assign to function call")),
        _ => return Err(Rich::custom(span, "can't assign to expression")),
    };
    Ok(spanned(target, span))
}

pub fn expression<'tokens, 'code: 'tokens, I>()
-> impl Parser<'tokens, I, SExpr<'code>, Extra<'tokens, 'code>> + Clone
where
    I: ValueInput<'tokens, Token = Token<'code>, Span = Span>,
{
    recursive::<I, SExpr<'code>, Extra<'tokens, 'code>, _, _>(|expr| {
        let comma = just(Token::Comma);
        let ident = select! { Token::Name(name) => name };

        let literal = select! {
            Token::Int(value) => Literal::Int(value),
            Token::Float(value) => Literal::Float(value),
            Token::Str(raw) => Literal::Str(unescape(raw)),
            Token::None => Literal::None,
            Token::True => Literal::Bool(true),
            Token::False => Literal::Bool(false),
        }
        .map(Expr::Literal);

        let parenthesized = expr
            .clone()
            .then(
                comma
                    .clone()
                    .ignore_then(expr.clone())
                    .repeated()
                    .collect::<Vec<_>>(),
            )
            .then(comma.clone().or_not())
            .or_not()
            .delimited_by(just(Token::ParenOpen), just(Token::ParenClose))
            .map(|inner| match inner {
                None => Expr::Tuple(Vec::new()),
                Some(((first, rest), None)) if rest.is_empty() => first.node,
                Some(((first, mut rest), _)) => {
                    rest.insert(0, first);
                    Expr::Tuple(rest)
                }
            });

        let comprehension = just(Token::For)
            .ignore_then(target_list())
            .then_ignore(just(Token::In))
            .then(expr.clone())
            .then(
                just(Token::If)
                    .ignore_then(expr.clone())
                    .repeated()
                    .collect::<Vec<_>>(),
            )
            .map(|((target, iter), ifs)| Comprehension { target, iter, ifs });

        let list = expr
            .clone()
            .then(choice((
                comprehension
                    .repeated()
                    .at_least(1)
                    .collect::<Vec<_>>()
                    .map(ListTail::Comprehension),
                comma
                    .clone()
                    .ignore_then(expr.clone())
                    .repeated()
                    .collect::<Vec<_>>()
                    .then_ignore(comma.clone().or_not())
                    .map(ListTail::Items),
            )))
            .or_not()
            .delimited_by(just(Token::BracketOpen), just(Token::BracketClose))
            .map(|inner| match inner {
                None => Expr::List(Vec::new()),
                Some((element, ListTail::Comprehension(generators))) => Expr::ListComp {
                    element: Box::new(element),
                    generators,
                },
                Some((first, ListTail::Items(mut rest))) => {
                    rest.insert(0, first);
                    Expr::List(rest)
                }
            });

        let dict = expr
            .clone()
            .then_ignore(just(Token::Colon))
            .then(expr.clone())
            .separated_by(comma.clone())
            .allow_trailing()
            .collect::<Vec<_>>()
            .delimited_by(just(Token::BraceOpen), just(Token::BraceClose))
            .map(Expr::Dict);

        let atom = choice((literal, ident.map(Expr::Name), parenthesized, list, dict))
            .map_with(|node, extra| spanned(node, extra.span()));

        let argument = ident
            .then_ignore(just(Token::Assign))
            .then(expr.clone())
            .map(|(name, value)| Argument::Keyword(name, value))
            .or(expr.clone().map(Argument::Positional));

        let postfix = choice((
            just(Token::Dot).ignore_then(ident).map(Postfix::Attr),
            argument
                .separated_by(comma.clone())
                .allow_trailing()
                .collect::<Vec<_>>()
                .delimited_by(just(Token::ParenOpen), just(Token::ParenClose))
                .map(Postfix::Call),
            expr.clone()
                .delimited_by(just(Token::BracketOpen), just(Token::BracketClose))
                .map(Postfix::Index),
        ))
        .map_with(|op, extra| (op, extra.span()));

        let primary = atom
            .then(postfix.repeated().collect::<Vec<_>>())
            .try_map(|(atom, ops): (SExpr<'code>, Vec<(Postfix<'code>, Span)>), _| {
                let mut value = atom;
                for (op, op_span) in ops {
                    let span = Span::from(value.span.start..op_span.end);
                    let node = match op {
                        Postfix::Attr(attr) => Expr::Attribute {
                            value: Box::new(value),
                            attr,
                        },
                        Postfix::Index(index) => Expr::Subscript {
                            value: Box::new(value),
                            index: Box::new(index),
                        },
                        Postfix::Call(arguments) => {
                            let mut args = Vec::new();
                            let mut keywords: Vec<(&'code str, SExpr<'code>)> = Vec::new();
                            for argument in arguments {
                                match argument {
                                    Argument::Positional(argument) if !keywords.is_empty() => {
                                        return Err(Rich::custom(
                                            argument.span,
                                            "positional argument follows keyword argument",
                                        ));
                                    }
                                    Argument::Positional(argument) => args.push(argument),
                                    Argument::Keyword(name, argument) => {
                                        if keywords.iter().any(|(seen, _)| *seen == name) {
                                            return Err(Rich::custom(
                                                argument.span,
                                                format!("keyword argument repeated: {name}"),
                                            ));
                                        }
                                        keywords.push((name, argument));
                                    }
                                }
                            }
                            Expr::Call {
                                func: Box::new(value),
                                args,
                                keywords,
                            }
                        }
                    };
                    value = spanned(node, span);
                }
                Ok(value)
            });

        let comparison = choice((
            just(Token::Equal).to(CompareOp::Equal),
            just(Token::NotEqual).to(CompareOp::NotEqual),
            just(Token::LessOrEqual).to(CompareOp::LessOrEqual),
            just(Token::Less).to(CompareOp::Less),
            just(Token::GreaterOrEqual).to(CompareOp::GreaterOrEqual),
            just(Token::Greater).to(CompareOp::Greater),
            just(Token::Not).then(just(Token::In)).to(CompareOp::NotIn),
            just(Token::In).to(CompareOp::In),
            just(Token::Is).then(just(Token::Not)).to(CompareOp::IsNot),
            just(Token::Is).to(CompareOp::Is),
        ));

        let operand = primary
            .pratt((
                infix(right(14), just(Token::DoubleStar), |l, _, r, extra| {
                    binary(BinaryOp::Power, l, r, extra.span())
                }),
                prefix(13, just(Token::Minus), |_, rhs, extra| {
                    unary(UnaryOp::Negate, rhs, extra.span())
                }),
                prefix(13, just(Token::Plus), |_, rhs, extra| {
                    unary(UnaryOp::Plus, rhs, extra.span())
                }),
                infix(left(12), just(Token::Star), |l, _, r, extra| {
                    binary(BinaryOp::Multiply, l, r, extra.span())
                }),
                infix(left(12), just(Token::Slash), |l, _, r, extra| {
                    binary(BinaryOp::Divide, l, r, extra.span())
                }),
                infix(left(12), just(Token::DoubleSlash), |l, _, r, extra| {
                    binary(BinaryOp::FloorDivide, l, r, extra.span())
                }),
                infix(left(12), just(Token::Percent), |l, _, r, extra| {
                    binary(BinaryOp::Modulo, l, r, extra.span())
                }),
                infix(left(10), just(Token::Plus), |l, _, r, extra| {
                    binary(BinaryOp::Add, l, r, extra.span())
                }),
                infix(left(10), just(Token::Minus), |l, _, r, extra| {
                    binary(BinaryOp::Subtract, l, r, extra.span())
                }),
                infix(left(8), comparison, |l, op, r, extra| {
                    compare(op, l, r, extra.span())
                }),
                prefix(6, just(Token::Not), |_, rhs, extra| {
                    unary(UnaryOp::Not, rhs, extra.span())
                }),
                infix(left(4), just(Token::And), |l, _, r, extra| {
                    boolean(BoolOp::And, l, r, extra.span())
                }),
                infix(left(2), just(Token::Or), |l, _, r, extra| {
                    boolean(BoolOp::Or, l, r, extra.span())
                }),
            ))
            .boxed();

        let conditional = operand
            .clone()
            .then(
                just(Token::If)
                    .ignore_then(operand.clone())
                    .then_ignore(just(Token::Else))
                    .then(expr.clone())
                    .or_not(),
            )
            .map_with(|(body, tail), extra| match tail {
                None => body,
                Some((test, orelse)) => spanned(
                    Expr::IfExp {
                        test: Box::new(test),
                        body: Box::new(body),
                        orelse: Box::new(orelse),
                    },
                    extra.span(),
                ),
            });

        let lambda = just(Token::Lambda)
            .ignore_then(parameters(expr.clone()))
            .then_ignore(just(Token::Colon))
            .then(expr.clone())
            .map_with(|(params, body), extra| {
                spanned(
                    Expr::Lambda {
                        params,
                        body: Box::new(body),
                    },
                    extra.span(),
                )
            });

        lambda.or(conditional)
    })
}

enum AssignTail<'code> {
    Augmented(BinaryOp, SExpr<'code>),
    Chain(Vec<SExpr<'code>>),
}

pub fn module<'tokens, 'code: 'tokens, I>()
-> impl Parser<'tokens, I, Vec<SStmt<'code>>, Extra<'tokens, 'code>>
where
    I: ValueInput<'tokens, Token = Token<'code>, Span = Span>,
{
    let expr = expression().boxed();
    let comma = just(Token::Comma);
    let newline = just(Token::Newline);
    let ident = select! { Token::Name(name) => name };

    let expr_list = expr
        .clone()
        .separated_by(comma.clone())
        .at_least(1)
        .allow_trailing()
        .collect::<Vec<_>>()
        .map_with(|items, extra| match <[_; 1]>::try_from(items) {
            Ok([single]) => single,
            Err(items) => spanned(Expr::Tuple(items), extra.span()),
        })
        .boxed();

    let augmented_op = choice((
        just(Token::PlusAssign).to(BinaryOp::Add),
        just(Token::MinusAssign).to(BinaryOp::Subtract),
        just(Token::StarAssign).to(BinaryOp::Multiply),
    ));

    let assignment = expr_list
        .clone()
        .then(
            choice((
                augmented_op
                    .then(expr_list.clone())
                    .map(|(op, value)| AssignTail::Augmented(op, value)),
                just(Token::Assign)
                    .ignore_then(expr_list.clone())
                    .repeated()
                    .at_least(1)
                    .collect::<Vec<_>>()
                    .map(AssignTail::Chain),
            ))
            .or_not(),
        )
        .try_map(|(first, tail), _| match tail {
            None => Ok(Stmt::Expr(first)),
            Some(AssignTail::Augmented(op, value)) => {
                let target = to_target(first)?;
                if let Target::Tuple(_) = target.node {
                    return Err(Rich::custom(
                        target.span,
                        "illegal expression for augmented assignment",
                    ));
                }
                Ok(Stmt::AugAssign { target, op, value })
            }
            Some(AssignTail::Chain(mut values)) => {
                let value = values.pop().unwrap_or_else(|| first.clone());
                let targets = std::iter::once(first)
                    .chain(values)
                    .map(to_target)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Stmt::Assign { targets, value })
            }
        });

    let deletion = just(Token::Del)
        .ignore_then(expr_list.clone())
        .try_map(|targets, _| {
            let targets = match targets.node {
                Expr::Tuple(items) => items,
                _ => vec![targets],
            };
            targets
                .into_iter()
                .map(to_target)
                .collect::<Result<Vec<_>, _>>()
                .map(Stmt::Delete)
        });

    let simple = choice((
        just(Token::Return)
            .ignore_then(expr_list.clone().or_not())
            .map(Stmt::Return),
        just(Token::Pass).to(Stmt::Pass),
        just(Token::Global)
            .ignore_then(ident.separated_by(comma.clone()).at_least(1).collect::<Vec<_>>())
            .map(Stmt::Global),
        deletion,
        assignment,
    ))
    .map_with(|node, extra| spanned(node, extra.span()));
    let simple_line = simple.then_ignore(newline.clone()).boxed();

    let statement = recursive(|statement| {
        let block = newline
            .clone()
            .ignore_then(just(Token::Indent))
            .ignore_then(statement.repeated().at_least(1).collect::<Vec<_>>())
            .then_ignore(just(Token::Dedent));
        let suite = just(Token::Colon)
            .ignore_then(block.or(simple_line.clone().map(|line| vec![line])))
            .boxed();
        let else_suite = just(Token::Else).ignore_then(suite.clone());

        let if_statement = just(Token::If)
            .ignore_then(expr.clone())
            .then(suite.clone())
            .then(
                just(Token::Elif)
                    .map_with(|_, extra| -> Span { extra.span() })
                    .then(expr.clone())
                    .then(suite.clone())
                    .repeated()
                    .collect::<Vec<_>>(),
            )
            .then(else_suite.clone().or_not())
            .map(|(((test, body), elifs), orelse)| {
                let mut orelse = orelse.unwrap_or_default();
                for ((keyword, test), body) in elifs.into_iter().rev() {
                    let end = body.last().map_or(test.span.end, |last| last.span.end);
                    orelse = vec![spanned(Stmt::If { test, body, orelse }, Span::from(keyword.start..end))];
                }
                Stmt::If { test, body, orelse }
            });

        let for_statement = just(Token::For)
            .ignore_then(target_list())
            .then_ignore(just(Token::In))
            .then(expr_list.clone())
            .then(suite.clone())
            .then(else_suite.or_not())
            .map(|(((target, iter), body), orelse)| Stmt::For {
                target,
                iter,
                body,
                orelse: orelse.unwrap_or_default(),
            });

        let function_def = just(Token::Def)
            .ignore_then(ident)
            .then(
                parameters(expr.clone())
                    .delimited_by(just(Token::ParenOpen), just(Token::ParenClose)),
            )
            .then(suite)
            .map(|((name, params), body)| Stmt::FunctionDef { name, params, body });

        choice((if_statement, for_statement, function_def))
            .map_with(|node, extra| spanned(node, extra.span()))
            .or(simple_line.clone())
    });

    statement.repeated().collect::<Vec<_>>()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expr(code: &str) -> Expr<'_> {
        parse_expression(code).unwrap().node
    }

    #[test]
    fn precedence_of_arithmetic_and_comparison() {
        let Expr::Compare { op, left, .. } = expr("a + b * c < d") else {
            panic!("expected comparison");
        };
        assert_eq!(op, CompareOp::Less);
        let Expr::BinOp { op, right, .. } = left.node else {
            panic!("expected addition");
        };
        assert_eq!(op, BinaryOp::Add);
        assert!(matches!(right.node, Expr::BinOp { op: BinaryOp::Multiply, .. }));
    }

    #[test]
    fn postfix_chain() {
        let Expr::Call { func, args, keywords } = expr("a.b[0](1, key=2)") else {
            panic!("expected call");
        };
        assert_eq!(args.len(), 1);
        assert_eq!(keywords[0].0, "key");
        assert!(matches!(func.node, Expr::Subscript { .. }));
    }

    #[test]
    fn not_in_and_is_not() {
        assert!(matches!(expr("a not in b"), Expr::Compare { op: CompareOp::NotIn, .. }));
        assert!(matches!(expr("a is not None"), Expr::Compare { op: CompareOp::IsNot, .. }));
        assert!(matches!(expr("not a"), Expr::UnaryOp { op: UnaryOp::Not, .. }));
    }

    #[test]
    fn tuples_groups_and_comprehensions() {
        assert!(matches!(expr("(a)"), Expr::Name("a")));
        assert!(matches!(expr("(a,)"), Expr::Tuple(items) if items.len() == 1));
        assert!(matches!(expr("()"), Expr::Tuple(items) if items.is_empty()));
        let Expr::ListComp { generators, .. } = expr("[x * 2 for x in xs if x if y]") else {
            panic!("expected comprehension");
        };
        assert_eq!(generators[0].ifs.len(), 2);
    }

    #[test]
    fn conditional_and_lambda() {
        assert!(matches!(expr("a if b else c"), Expr::IfExp { .. }));
        let Expr::Lambda { params, .. } = expr("lambda a, b=1, *rest, k, **kw: a") else {
            panic!("expected lambda");
        };
        assert_eq!(params.args.len(), 2);
        assert_eq!(params.vararg, Some("rest"));
        assert_eq!(params.kwonly.len(), 1);
        assert_eq!(params.kwarg, Some("kw"));
    }

    #[test]
    fn string_escapes() {
        assert_eq!(expr(r#""a\nb""#), Expr::Literal(Literal::Str("a\nb".into())));
    }

    #[test]
    fn statements_with_blocks() {
        let code = "total = 0\nfor item in items:\n    if item > 1:\n        total += item\n    elif item:\n        pass\n    else:\n        del cache[item]\nreturn total\n";
        let statements = parse_module(code).unwrap();
        assert_eq!(statements.len(), 3);
        let Stmt::For { body, .. } = &statements[1].node else {
            panic!("expected for loop");
        };
        let Stmt::If { orelse, .. } = &body[0].node else {
            panic!("expected if");
        };
        assert!(matches!(orelse[0].node, Stmt::If { .. }));
    }

    #[test]
    fn function_definition_with_markers() {
        let statements = parse_module("def f(a, /, b, *, c=2):\n    return a + b + c\n").unwrap();
        let Stmt::FunctionDef { name, params, body } = &statements[0].node else {
            panic!("expected def");
        };
        assert_eq!(*name, "f");
        assert_eq!(params.posonly.len(), 1);
        assert_eq!(params.args.len(), 1);
        assert_eq!(params.kwonly.len(), 1);
        assert_eq!(body.len(), 1);
    }

    #[test]
    fn invalid_targets_are_syntax_errors() {
        assert!(matches!(parse_module("f() = 1\n"), Err(CompileError::Syntax(_))));
        assert!(matches!(parse_module("a, b += 1\n"), Err(CompileError::Syntax(_))));
        assert!(matches!(parse_expression("f(a=1, b)"), Err(CompileError::Syntax(_))));
    }

    #[test]
    fn lexing_errors_are_reported() {
        assert!(matches!(parse_expression("a $ b"), Err(CompileError::Syntax(_))));
    }
}
