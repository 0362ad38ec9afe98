//! Compiler core for declarative binding expressions.
//!
//! Binding sources are parsed, lowered into abstract instruction streams for a
//! small stack machine, rewritten to resolve names through a layered dynamic
//! scope, and optionally instrumented for dependency tracing or inverted into
//! write operations. The operator registry turns the result into reader/writer
//! handler pairs consumed by the declarative object model.

pub mod bytecode;
pub mod codegen;
pub mod compiler;
pub mod declarative;
pub mod declarative_function;
pub mod dynamic_scope;
pub mod error;
pub mod handlers;
pub mod inversion;
pub mod operators;
pub mod parser;
pub mod scope_rewriter;
pub mod standard;
pub mod tracing;
pub mod vm;

pub use bytecode::{Constant, Instruction, IsaRevision, Label, Name, Op, TargetIsa, UnitKind};
pub use codegen::{CodeGenerator, CompiledUnit};
pub use declarative::{ClassBuilder, DeclarativeClass, DeclarativeObject, DynamicScopeKey, Module};
pub use error::{CompileError, Error, ErrorKind, RuntimeError};
pub use handlers::{HandlerPair, ReadHandler, WriteHandler};
pub use inversion::Inverter;
pub use operators::{CompilationContext, Operator, OperatorMap, SourceKind};
pub use tracing::Tracer;
pub use vm::Value;
