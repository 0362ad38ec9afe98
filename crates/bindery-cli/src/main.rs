use anyhow::{Context, Result, anyhow};
use bindery::declarative::DeclarativeObject;
use bindery::declarative_function::DeclarativeFunction;
use bindery::error::report_compile_error;
use bindery::vm::{self, Env};
use bindery::{
    ClassBuilder, CompilationContext, CompileError, CompiledUnit, IsaRevision, Module, Name,
    SourceKind, Value,
};
use clap::{Parser as ClapParser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::rc::Rc;
use std::sync::Arc;

mod binding_file;

use binding_file::{Item, Located};

#[derive(ClapParser)]
#[command(name = "bindery")]
#[command(about = "Compile, inspect and run declarative binding expressions")]
struct Cli {
    /// Target instruction set revision
    #[arg(long, global = true, env = "BINDERY_ISA", default_value = "compact")]
    isa: IsaRevision,
    /// File name shown in reports for inline sources
    #[arg(long, global = true)]
    filename: Option<String>,
    /// Log compiler and binding activity
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile an expression under a binding operator and list its instructions
    Dis {
        /// The binding source
        source: String,
        /// Binding operator symbol
        #[arg(long, default_value = "=")]
        op: String,
        /// Print the compiled units as JSON
        #[arg(long)]
        json: bool,
    },
    /// Compile every item of a binding file and report failures
    Check {
        /// Path to the binding file
        file: PathBuf,
    },
    /// Evaluate a standalone expression
    Eval {
        /// The expression to evaluate
        expression: String,
        /// Named input, evaluated before the expression
        #[arg(long = "arg", value_name = "NAME=EXPR")]
        args: Vec<String>,
    },
    /// Instantiate the class described by a binding file and print its attributes
    Run {
        /// Path to the binding file
        file: PathBuf,
        /// Attribute assignment applied after the first snapshot
        #[arg(long = "set", value_name = "NAME=EXPR")]
        sets: Vec<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let mut context = CompilationContext::new(cli.isa.target());
    if let Some(filename) = &cli.filename {
        context = context.with_filename(filename.as_str());
    }
    let outcome = match cli.command {
        Commands::Dis { source, op, json } => disassemble(&context, &source, &op, json),
        Commands::Check { file } => check(&context, &file),
        Commands::Eval { expression, args } => evaluate(&context, &expression, &args),
        Commands::Run { file, sets } => run(&context, &file, &sets),
    };
    match outcome {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let mut builder = env_logger::Builder::from_default_env();
    if verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.init();
}

fn report(error: &CompileError, filename: &str, source: &str) -> anyhow::Error {
    anyhow!("{}", report_compile_error(error, filename, source).trim_end())
}

fn disassemble(context: &CompilationContext, source: &str, op: &str, json: bool) -> Result<ExitCode> {
    let operator = context
        .operator(op)
        .ok_or_else(|| anyhow!("unknown binding operator '{op}'"))?;
    let source = match operator.source_kind {
        SourceKind::Block if !source.ends_with('\n') => format!("{source}\n"),
        _ => source.to_owned(),
    };
    let filename = context.filename();
    let (pair, _) = match context.compile_binding(op, &source, "<binding>", 1) {
        Ok(compiled) => compiled,
        Err(error) => {
            eprintln!("{}", report(&error, filename, &source));
            return Ok(ExitCode::FAILURE);
        }
    };
    let sides: Vec<(&str, &Arc<CompiledUnit>)> = [
        ("reader", pair.reader.as_ref().and_then(|reader| reader.unit())),
        ("writer", pair.writer.as_ref().and_then(|writer| writer.unit())),
    ]
    .into_iter()
    .filter_map(|(side, unit)| Some((side, unit?)))
    .collect();

    if json {
        let mut units = serde_json::Map::new();
        for (side, unit) in sides {
            units.insert(side.to_owned(), serde_json::to_value(&**unit)?);
        }
        println!("{}", serde_json::to_string_pretty(&units)?);
    } else {
        for (side, unit) in sides {
            println!("{side} ({}):", context.isa().revision());
            print!("{}", unit.disassemble());
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn read(file: &Path) -> Result<(String, Vec<Located>)> {
    let text = fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let items = binding_file::parse(&text).with_context(|| format!("parsing {}", file.display()))?;
    Ok((text, items))
}

fn check(context: &CompilationContext, file: &Path) -> Result<ExitCode> {
    let (_, items) = read(file)?;
    let mut declared: Vec<&str> = Vec::new();
    let mut failures = 0usize;
    for Located { line, item } in &items {
        let location = format!("{}:{line}", file.display());
        let compiled = match item {
            Item::Global { name, source } | Item::Const { name, source } => {
                declared.push(name);
                context
                    .compiler()
                    .at_line(*line)
                    .expression(source, name)
                    .map(drop)
                    .map_err(|error| (error, source))
            }
            Item::Attr { name, default } => {
                declared.push(name);
                match default {
                    Some(source) => context
                        .compiler()
                        .at_line(*line)
                        .expression(source, name)
                        .map(drop)
                        .map_err(|error| (error, source)),
                    None => Ok(()),
                }
            }
            Item::Event { name } => {
                declared.push(name);
                Ok(())
            }
            Item::Binding {
                name,
                operator,
                source,
                declare,
            } => {
                if *declare {
                    declared.push(name);
                }
                if !declared.contains(&name.as_str()) {
                    eprintln!("{location}: '{name}' is bound before it is declared");
                    failures += 1;
                }
                context
                    .compile_binding(operator, source, name, *line)
                    .map(drop)
                    .map_err(|error| (error, source))
            }
            Item::Function { source } => DeclarativeFunction::compile(context, source, *line)
                .map(drop)
                .map_err(|error| (error, source)),
        };
        if let Err((error, source)) = compiled {
            eprintln!("{}", report(&error, &location, source));
            failures += 1;
        }
    }
    if failures > 0 {
        eprintln!("{failures} of {} items failed", items.len());
        return Ok(ExitCode::FAILURE);
    }
    println!("{}: {} items ok", file.display(), items.len());
    Ok(ExitCode::SUCCESS)
}

/// Evaluates `source` as an expression in the module namespace.
fn value_of(context: &CompilationContext, module: &Module, source: &str) -> Result<Value> {
    let unit = context
        .compiler()
        .expression(source, "<value>")
        .map_err(|error| report(&error, "<value>", source))?;
    Ok(vm::run(&unit, Env::module(module.globals().clone()), Vec::new())?)
}

fn assignment(text: &str) -> Result<(&str, &str)> {
    let (name, source) = text
        .split_once('=')
        .ok_or_else(|| anyhow!("expected NAME=EXPR, got '{text}'"))?;
    Ok((name.trim(), source.trim()))
}

fn evaluate(context: &CompilationContext, expression: &str, args: &[String]) -> Result<ExitCode> {
    let module = Module::new("__main__");
    let mut inputs = Vec::new();
    for arg in args {
        let (name, source) = assignment(arg)?;
        inputs.push((Name::from(name), value_of(context, &module, source)?));
    }
    let known: Vec<Name> = inputs.iter().map(|(name, _)| name.clone()).collect();
    let unit = context
        .compiler()
        .callable(expression, &known)
        .map_err(|error| report(&error, context.filename(), expression))?;
    let arguments = unit
        .arg_names
        .iter()
        .map(|parameter| {
            inputs
                .iter()
                .find(|(name, _)| name == parameter)
                .map(|(_, value)| value.clone())
                .ok_or_else(|| anyhow!("no value for input '{parameter}'"))
        })
        .collect::<Result<Vec<_>>>()?;
    let result = vm::run(&unit, Env::module(module.globals().clone()), arguments)?;
    println!("{}", result.repr());
    Ok(ExitCode::SUCCESS)
}

fn load(
    context: &CompilationContext,
    file: &Path,
    items: &[Located],
) -> Result<(Rc<Module>, Rc<DeclarativeObject>)> {
    let stem = file
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "bindings".to_owned());
    let module = Module::new(stem.as_str());
    let mut builder = ClassBuilder::new(context, &module, stem.as_str());
    for Located { line, item } in items {
        let location = format!("{}:{line}", file.display());
        builder = match item {
            Item::Global { name, source } => {
                module.set_global(name.as_str(), value_of(context, &module, source)?);
                builder
            }
            Item::Attr { name, default } => {
                let default = match default {
                    Some(source) => value_of(context, &module, source)?,
                    None => Value::None,
                };
                builder.attr(name.as_str(), default)
            }
            Item::Event { name } => builder.event(name.as_str()),
            Item::Const { name, source } => {
                builder.constant(name.as_str(), value_of(context, &module, source)?)
            }
            Item::Binding {
                name,
                operator,
                source,
                declare,
            } => {
                let builder = if *declare {
                    builder.attr(name.as_str(), Value::None)
                } else {
                    builder
                };
                builder
                    .bind(name, operator, source, *line)
                    .map_err(|error| report(&error, &location, source))?
            }
            Item::Function { source } => builder
                .function(source, *line)
                .map_err(|error| report(&error, &location, source))?,
        };
    }
    let object = builder.build().instantiate();
    Ok((module, object))
}

fn snapshot(object: &DeclarativeObject) -> Result<String> {
    let attributes: serde_json::Map<String, serde_json::Value> = object
        .snapshot()?
        .into_iter()
        .map(|(name, value)| (name.to_string(), value.to_json()))
        .collect();
    Ok(serde_json::to_string_pretty(&attributes)?)
}

fn run(context: &CompilationContext, file: &Path, sets: &[String]) -> Result<ExitCode> {
    let (_, items) = read(file)?;
    let (module, object) = load(context, file, &items)?;
    println!("{}", snapshot(&object)?);
    if sets.is_empty() {
        return Ok(ExitCode::SUCCESS);
    }
    for set in sets {
        let (name, source) = assignment(set)?;
        let value = value_of(context, &module, source)?;
        object
            .set_attr(name, value)
            .with_context(|| format!("setting {name}"))?;
    }
    println!("{}", snapshot(&object)?);
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> CompilationContext {
        CompilationContext::new(IsaRevision::Compact.target())
    }

    #[test]
    fn loads_and_updates_a_binding_file() {
        let text = "\
global step = 2
attr count = 1
attr doubled << count * step
attr label = ''
event clicked
clicked ::
    self.count += step
def describe():
    return 'count=' + str(count)
";
        let items = binding_file::parse(text).unwrap();
        let (_module, object) = load(&context(), Path::new("counter.bind"), &items).unwrap();
        assert_eq!(object.get_attr("doubled").unwrap(), Value::Int(2));
        object.set_attr("clicked", Value::None).unwrap();
        assert_eq!(object.get_attr("count").unwrap(), Value::Int(3));
        assert_eq!(object.get_attr("doubled").unwrap(), Value::Int(6));
        let describe = object.get_attr("describe").unwrap();
        assert_eq!(
            vm::call(&describe, Vec::new(), Vec::new()).unwrap(),
            Value::str("count=3")
        );
        let json = snapshot(&object).unwrap();
        assert!(json.contains("\"doubled\": 6"), "{json}");
    }

    #[test]
    fn load_reports_binding_errors_with_location() {
        let items = binding_file::parse("attr value\nvalue >> value + 1\n").unwrap();
        let error = load(&context(), Path::new("bad.bind"), &items).err().expect("load should fail");
        let message = format!("{error:#}");
        assert!(message.contains("bad.bind:2"), "{message}");
        assert!(message.contains("not invertible"), "{message}");
    }

    #[test]
    fn assignments_split_on_the_first_equals() {
        assert_eq!(assignment("x = a == b").unwrap(), ("x", "a == b"));
        assert!(assignment("nothing").is_err());
    }
}
