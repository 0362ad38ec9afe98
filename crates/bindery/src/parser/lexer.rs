use super::{ParseError, Span, Spanned};
use chumsky::prelude::*;
use std::borrow::Cow;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Token<'code> {
    ParenOpen,
    ParenClose,
    BracketOpen,
    BracketClose,
    BraceOpen,
    BraceClose,
    Comma,
    Colon,
    Dot,
    Assign,
    PlusAssign,
    MinusAssign,
    StarAssign,
    Equal,
    NotEqual,
    LessOrEqual,
    Less,
    GreaterOrEqual,
    Greater,
    Plus,
    Minus,
    DoubleStar,
    Star,
    DoubleSlash,
    Slash,
    Percent,
    Comment(&'code str),
    /// Line break followed by the indentation width of the next line.
    /// Replaced by `Newline`/`Indent`/`Dedent` in [`layout`].
    LineStart(usize),
    Newline,
    Indent,
    Dedent,
    Int(i64),
    Float(f64),
    /// Raw string contents between the quotes, escapes unprocessed.
    Str(&'code str),
    Name(&'code str),
    None,
    True,
    False,
    And,
    Or,
    Not,
    In,
    Is,
    If,
    Elif,
    Else,
    For,
    Lambda,
    Def,
    Return,
    Global,
    Del,
    Pass,
}

impl<'code> Token<'code> {
    pub fn into_cow_str(self) -> Cow<'code, str> {
        match self {
            Self::ParenOpen => "(".into(),
            Self::ParenClose => ")".into(),
            Self::BracketOpen => "[".into(),
            Self::BracketClose => "]".into(),
            Self::BraceOpen => "{".into(),
            Self::BraceClose => "}".into(),
            Self::Comma => ",".into(),
            Self::Colon => ":".into(),
            Self::Dot => ".".into(),
            Self::Assign => "=".into(),
            Self::PlusAssign => "+=".into(),
            Self::MinusAssign => "-=".into(),
            Self::StarAssign => "*=".into(),
            Self::Equal => "==".into(),
            Self::NotEqual => "!=".into(),
            Self::LessOrEqual => "<=".into(),
            Self::Less => "<".into(),
            Self::GreaterOrEqual => ">=".into(),
            Self::Greater => ">".into(),
            Self::Plus => "+".into(),
            Self::Minus => "-".into(),
            Self::DoubleStar => "**".into(),
            Self::Star => "*".into(),
            Self::DoubleSlash => "//".into(),
            Self::Slash => "/".into(),
            Self::Percent => "%".into(),
            Self::Comment(comment) => comment.into(),
            Self::LineStart(_) | Self::Newline => "newline".into(),
            Self::Indent => "indent".into(),
            Self::Dedent => "dedent".into(),
            Self::Int(value) => value.to_string().into(),
            Self::Float(value) => value.to_string().into(),
            Self::Str(text) => format!("'{text}'").into(),
            Self::Name(name) => name.into(),
            Self::None => "None".into(),
            Self::True => "True".into(),
            Self::False => "False".into(),
            Self::And => "and".into(),
            Self::Or => "or".into(),
            Self::Not => "not".into(),
            Self::In => "in".into(),
            Self::Is => "is".into(),
            Self::If => "if".into(),
            Self::Elif => "elif".into(),
            Self::Else => "else".into(),
            Self::For => "for".into(),
            Self::Lambda => "lambda".into(),
            Self::Def => "def".into(),
            Self::Return => "return".into(),
            Self::Global => "global".into(),
            Self::Del => "del".into(),
            Self::Pass => "pass".into(),
        }
    }
}

impl fmt::Display for Token<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.into_cow_str())
    }
}

pub fn lexer<'code>()
-> impl Parser<'code, &'code str, Vec<Spanned<Token<'code>>>, extra::Err<ParseError<'code, char>>> {
    let bracket = choice((
        just('(').to(Token::ParenOpen),
        just(')').to(Token::ParenClose),
        just('[').to(Token::BracketOpen),
        just(']').to(Token::BracketClose),
        just('{').to(Token::BraceOpen),
        just('}').to(Token::BraceClose),
    ));

    let operator = choice((
        just("**").to(Token::DoubleStar),
        just("//").to(Token::DoubleSlash),
        just("==").to(Token::Equal),
        just("!=").to(Token::NotEqual),
        just("<=").to(Token::LessOrEqual),
        just(">=").to(Token::GreaterOrEqual),
        just("+=").to(Token::PlusAssign),
        just("-=").to(Token::MinusAssign),
        just("*=").to(Token::StarAssign),
        just('<').to(Token::Less),
        just('>').to(Token::Greater),
        just('=').to(Token::Assign),
        just('+').to(Token::Plus),
        just('-').to(Token::Minus),
        just('*').to(Token::Star),
        just('/').to(Token::Slash),
        just('%').to(Token::Percent),
    ));

    let punctuation = choice((
        just(',').to(Token::Comma),
        just(':').to(Token::Colon),
        just('.').to(Token::Dot),
    ));

    let comment = just('#')
        .then(none_of("\r\n").repeated())
        .to_slice()
        .map(Token::Comment);

    let line_start = text::newline()
        .ignore_then(one_of(" \t").repeated().to_slice())
        .map(|indentation: &str| Token::LineStart(indentation.chars().count()));

    let number = text::int(10)
        .then(just('.').then(text::digits(10)).or_not())
        .to_slice()
        .try_map(|number: &str, span| {
            if number.contains('.') {
                number
                    .parse::<f64>()
                    .map(Token::Float)
                    .map_err(|error| ParseError::custom(span, format!("invalid float '{number}': {error}")))
            } else {
                number
                    .parse::<i64>()
                    .map(Token::Int)
                    .map_err(|error| ParseError::custom(span, format!("invalid integer '{number}': {error}")))
            }
        });

    let string_body = |quote: char| {
        choice((
            just('\\').then(any()).ignored(),
            none_of([quote, '\\', '\n']).ignored(),
        ))
        .repeated()
        .to_slice()
        .delimited_by(just(quote), just(quote))
    };
    let string = string_body('\'').or(string_body('"')).map(Token::Str);

    let word = text::ascii::ident().map(|word: &str| match word {
        "None" => Token::None,
        "True" => Token::True,
        "False" => Token::False,
        "and" => Token::And,
        "or" => Token::Or,
        "not" => Token::Not,
        "in" => Token::In,
        "is" => Token::Is,
        "if" => Token::If,
        "elif" => Token::Elif,
        "else" => Token::Else,
        "for" => Token::For,
        "lambda" => Token::Lambda,
        "def" => Token::Def,
        "return" => Token::Return,
        "global" => Token::Global,
        "del" => Token::Del,
        "pass" => Token::Pass,
        name => Token::Name(name),
    });

    let token = choice((
        line_start,
        comment,
        bracket,
        number,
        string,
        operator,
        punctuation,
        word,
    ));

    token
        .map_with(|token, extra| Spanned {
            node: token,
            span: extra.span(),
        })
        .padded_by(text::inline_whitespace())
        .recover_with(skip_then_retry_until(any().ignored(), end()))
        .repeated()
        .collect()
}

/// Turns raw `LineStart` tokens into `Newline`, `Indent` and `Dedent`.
///
/// Line breaks inside brackets and comments are dropped, blank lines collapse
/// and the stream always ends with a `Newline` followed by any pending
/// `Dedent`s.
pub fn layout<'code>(
    tokens: Vec<Spanned<Token<'code>>>,
    end_of_input: usize,
) -> Result<Vec<Spanned<Token<'code>>>, ParseError<'code, Token<'code>>> {
    let mut output: Vec<Spanned<Token<'code>>> = Vec::with_capacity(tokens.len() + 4);
    let mut indents = vec![0usize];
    let mut nesting = 0usize;
    let mut pending: Option<(usize, Span)> = None;

    for token in tokens {
        match token.node {
            Token::Comment(_) => continue,
            Token::LineStart(width) => {
                if nesting == 0 {
                    pending = Some((width, token.span));
                }
                continue;
            }
            _ => {}
        }
        if let Some((width, span)) = pending.take() {
            if !output.is_empty() {
                output.push(Spanned {
                    node: Token::Newline,
                    span,
                });
                let current = indents.last().copied().unwrap_or(0);
                if width > current {
                    indents.push(width);
                    output.push(Spanned {
                        node: Token::Indent,
                        span,
                    });
                } else {
                    while width < indents.last().copied().unwrap_or(0) {
                        indents.pop();
                        output.push(Spanned {
                            node: Token::Dedent,
                            span,
                        });
                    }
                    if width != indents.last().copied().unwrap_or(0) {
                        return Err(ParseError::custom(
                            span,
                            "unindent does not match any outer indentation level",
                        ));
                    }
                }
            }
        }
        match token.node {
            Token::ParenOpen | Token::BracketOpen | Token::BraceOpen => nesting += 1,
            Token::ParenClose | Token::BracketClose | Token::BraceClose => {
                nesting = nesting.saturating_sub(1)
            }
            _ => {}
        }
        output.push(token);
    }

    let end = Span::from(end_of_input..end_of_input);
    if !output.is_empty() {
        output.push(Spanned {
            node: Token::Newline,
            span: end,
        });
    }
    while indents.len() > 1 {
        indents.pop();
        output.push(Spanned {
            node: Token::Dedent,
            span: end,
        });
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chumsky::prelude::Parser;

    fn kinds(code: &str) -> Vec<Token<'_>> {
        let tokens = lexer().parse(code).into_result().unwrap();
        layout(tokens, code.len())
            .unwrap()
            .into_iter()
            .map(|token| token.node)
            .collect()
    }

    #[test]
    fn operators_prefer_longest_match() {
        assert_eq!(
            kinds("a ** b // c <= d"),
            vec![
                Token::Name("a"),
                Token::DoubleStar,
                Token::Name("b"),
                Token::DoubleSlash,
                Token::Name("c"),
                Token::LessOrEqual,
                Token::Name("d"),
                Token::Newline,
            ]
        );
    }

    #[test]
    fn keywords_and_literals() {
        assert_eq!(
            kinds("not x in 'a\\'b' or 2.5"),
            vec![
                Token::Not,
                Token::Name("x"),
                Token::In,
                Token::Str("a\\'b"),
                Token::Or,
                Token::Float(2.5),
                Token::Newline,
            ]
        );
    }

    #[test]
    fn indentation_becomes_layout_tokens() {
        let code = "if a:\n    b = 1\n\n    # note\nc\n";
        assert_eq!(
            kinds(code),
            vec![
                Token::If,
                Token::Name("a"),
                Token::Colon,
                Token::Newline,
                Token::Indent,
                Token::Name("b"),
                Token::Assign,
                Token::Int(1),
                Token::Newline,
                Token::Dedent,
                Token::Name("c"),
                Token::Newline,
            ]
        );
    }

    #[test]
    fn newlines_inside_brackets_are_ignored() {
        assert_eq!(
            kinds("f(a,\n      b)"),
            vec![
                Token::Name("f"),
                Token::ParenOpen,
                Token::Name("a"),
                Token::Comma,
                Token::Name("b"),
                Token::ParenClose,
                Token::Newline,
            ]
        );
    }

    #[test]
    fn inconsistent_dedent_is_rejected() {
        let code = "if a:\n    b\n  c\n";
        let tokens = lexer().parse(code).into_result().unwrap();
        assert!(layout(tokens, code.len()).is_err());
    }
}
