//! Error taxonomy.
//!
//! [`CompileError`]s are raised while a declarative class is being defined and
//! abort only the binding being compiled. [`RuntimeError`]s are raised while a
//! compiled unit runs and propagate unchanged to whoever triggered the read or
//! write.

use ariadne::{Config, Label, Report, ReportKind, Source};
use std::fmt;
use std::ops::Range;

use crate::bytecode::Name;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxError {
    pub span: Range<usize>,
    pub message: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    Syntax(Vec<SyntaxError>),
    /// Inversion met a terminal instruction it has no write form for.
    NotInvertible { instruction: String },
    UnsupportedConstruct(String),
    UnknownOperator(String),
    /// The instruction stream itself is inconsistent (builder misuse).
    Malformed(String),
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Syntax(errors) => {
                write!(f, "invalid syntax")?;
                if let Some(first) = errors.first() {
                    write!(f, ": {}", first.message)?;
                }
                Ok(())
            }
            Self::NotInvertible { instruction } => {
                write!(f, "expression is not invertible: can't assign to {instruction}")
            }
            Self::UnsupportedConstruct(message) => write!(f, "unsupported construct: {message}"),
            Self::UnknownOperator(symbol) => write!(f, "unknown binding operator '{symbol}'"),
            Self::Malformed(message) => write!(f, "malformed instruction stream: {message}"),
        }
    }
}

impl std::error::Error for CompileError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// An inverter was asked for a write form it does not implement.
    InversionRefused { operation: &'static str },
    /// A dynamic-scope lookup failed at every level of the chain.
    ScopeResolution { name: Name },
    /// Per-instance state needed by a declarative function is absent.
    MissingContext(String),
    Name(Name),
    Attribute { type_name: String, attr: Name },
    Type(String),
    Key(String),
    Index(String),
    Value(String),
    ZeroDivision,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InversionRefused { operation } => {
                write!(f, "InversionRefused: can't assign to expression ({operation})")
            }
            Self::ScopeResolution { name } => write!(f, "ScopeResolutionError: {name}"),
            Self::MissingContext(what) => write!(f, "MissingContextError: {what}"),
            Self::Name(name) => write!(f, "NameError: name '{name}' is not defined"),
            Self::Attribute { type_name, attr } => {
                write!(f, "AttributeError: '{type_name}' object has no attribute '{attr}'")
            }
            Self::Type(message) => write!(f, "TypeError: {message}"),
            Self::Key(message) => write!(f, "KeyError: {message}"),
            Self::Index(message) => write!(f, "IndexError: {message}"),
            Self::Value(message) => write!(f, "ValueError: {message}"),
            Self::ZeroDivision => write!(f, "ZeroDivisionError: division by zero"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    pub unit: Name,
    pub line: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeError {
    pub kind: ErrorKind,
    /// Frames the error propagated out of, innermost first.
    pub trace: Vec<TraceEntry>,
}

impl RuntimeError {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            trace: Vec::new(),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Type(message.into()))
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Value(message.into()))
    }

    pub fn key_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Key(message.into()))
    }

    pub fn index_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Index(message.into()))
    }

    pub fn attribute(type_name: impl Into<String>, attr: &str) -> Self {
        Self::new(ErrorKind::Attribute {
            type_name: type_name.into(),
            attr: attr.into(),
        })
    }

    pub fn missing_context(what: impl Into<String>) -> Self {
        Self::new(ErrorKind::MissingContext(what.into()))
    }

    pub fn scope_resolution(name: &str) -> Self {
        Self::new(ErrorKind::ScopeResolution { name: name.into() })
    }

    pub fn inversion_refused(operation: &'static str) -> Self {
        Self::new(ErrorKind::InversionRefused { operation })
    }

    pub fn is_attribute_error(&self) -> bool {
        matches!(self.kind, ErrorKind::Attribute { .. })
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        for entry in &self.trace {
            match entry.line {
                Some(line) => write!(f, "\n  in {} line {line}", entry.unit)?,
                None => write!(f, "\n  in {}", entry.unit)?,
            }
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

impl From<ErrorKind> for RuntimeError {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

/// Either phase's error, for entry points that compile and then evaluate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    Compile(CompileError),
    Runtime(RuntimeError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Compile(error) => write!(f, "{error}"),
            Self::Runtime(error) => write!(f, "{error}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<CompileError> for Error {
    fn from(error: CompileError) -> Self {
        Self::Compile(error)
    }
}

impl From<RuntimeError> for Error {
    fn from(error: RuntimeError) -> Self {
        Self::Runtime(error)
    }
}

/// Renders a compile error against its source text.
pub fn report_compile_error(error: &CompileError, filename: &str, source_code: &str) -> String {
    let mut report_bytes = Vec::new();
    let whole = 0..source_code.len();
    let reports: Vec<(String, Range<usize>, String)> = match error {
        CompileError::Syntax(errors) => errors
            .iter()
            .map(|error| (error.message.clone(), error.span.clone(), error.reason.clone()))
            .collect(),
        other => vec![(other.to_string(), whole, "while compiling this binding".to_owned())],
    };
    for (message, span, reason) in reports {
        let written = Report::build(ReportKind::Error, (filename, span.clone()))
            .with_config(Config::default().with_color(false))
            .with_message(message.clone())
            .with_label(Label::new((filename, span)).with_message(reason))
            .finish()
            .write((filename, Source::from(source_code)), &mut report_bytes);
        if written.is_err() {
            report_bytes.extend_from_slice(message.as_bytes());
            report_bytes.push(b'\n');
        }
    }
    String::from_utf8_lossy(&report_bytes).into_owned()
}
