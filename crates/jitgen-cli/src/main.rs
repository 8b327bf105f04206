use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use jitgen::ast::{FunctionLiteral, ScopeKind};
use jitgen::machine::RelocInfo;
use jitgen::sim::{Simulator, SimulatorOptions, Value};
use jitgen::{Code, CompileOptions};

const COMPILER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "jitgen")]
#[command(about = "Single-pass JIT code generator and simulator", version = COMPILER_VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a script and print the generated code.
    Compile {
        #[arg(help = "Input script (or resolved AST with --ast-json)")]
        input: PathBuf,

        #[arg(long, help = "Input is a resolved program serialized as JSON")]
        ast_json: bool,

        #[arg(long, help = "Print code objects as JSON instead of a listing")]
        json: bool,

        #[arg(long, help = "Emit call tracing around every function body")]
        trace: bool,
    },
    /// Run a script on the simulator.
    Run {
        #[arg(help = "Input script (or resolved AST with --ast-json)")]
        input: PathBuf,

        #[arg(long, help = "Input is a resolved program serialized as JSON")]
        ast_json: bool,

        #[arg(long, help = "Global function to call after the script has run")]
        entry: Option<String>,

        #[arg(long, num_args = 0.., help = "Arguments for --entry (numbers or strings)")]
        args: Vec<String>,

        #[arg(long, help = "Print call trace lines")]
        trace: bool,

        #[arg(long, help = "Instructions executed before giving up")]
        step_limit: Option<u64>,

        #[arg(long, help = "Stack size in words")]
        stack_words: Option<usize>,

        #[arg(long, help = "Heap size in words")]
        heap_words: Option<usize>,
    },
}

/// One compiled function with its listing.
#[derive(Serialize)]
struct CodeReport<'a> {
    name: &'a str,
    instructions: usize,
    code_bytes: usize,
    relocations: &'a [RelocInfo],
    code: &'a Code,
    disassembly: Vec<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Compile {
            input,
            ast_json,
            json,
            trace,
        } => {
            let program = load_program(&input, ast_json)?;
            let options = CompileOptions::new()
                .with_trace_calls(trace)
                .with_source_name(source_name(&input));
            let codes = compile_all(&program, &options)?;
            if json {
                let reports: Vec<CodeReport<'_>> = codes
                    .iter()
                    .map(|code| CodeReport {
                        name: &code.metadata.name,
                        instructions: code.len(),
                        code_bytes: code.encode().len(),
                        relocations: &code.relocations,
                        code,
                        disassembly: code.disassemble().lines().map(str::to_string).collect(),
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else {
                for code in &codes {
                    print!("{}", code.disassemble());
                    println!(
                        "; {} instructions, {} bytes, {} relocations",
                        code.len(),
                        code.encode().len(),
                        code.relocations.len()
                    );
                    println!();
                }
            }
        }
        Commands::Run {
            input,
            ast_json,
            entry,
            args,
            trace,
            step_limit,
            stack_words,
            heap_words,
        } => {
            let program = load_program(&input, ast_json)?;
            let mut sim_options = SimulatorOptions::default();
            if let Some(limit) = step_limit {
                sim_options = sim_options.with_step_limit(limit);
            }
            if let Some(words) = stack_words {
                sim_options = sim_options.with_stack_words(words);
            }
            if let Some(words) = heap_words {
                sim_options = sim_options.with_heap_words(words);
            }
            let options = CompileOptions::new()
                .with_trace_calls(trace)
                .with_source_name(source_name(&input));

            let mut sim = Simulator::new(sim_options, options).context("Simulator setup failed")?;
            let completion = sim.run(&program);
            for line in sim.output() {
                println!("{line}");
            }
            let mut result = completion.context("Script failed")?;

            if let Some(name) = entry {
                let arguments: Vec<Value> = args.iter().map(|arg| parse_argument(arg)).collect();
                result = sim
                    .call(&name, &arguments)
                    .with_context(|| format!("Call to {name} failed"))?;
            }
            for line in sim.trace() {
                eprintln!("{line}");
            }
            println!("{result}");
            tracing::debug!(steps = sim.steps(), "finished");
        }
    }

    Ok(())
}

fn source_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.to_string_lossy(), |f| f.to_string_lossy())
        .into_owned()
}

fn load_program(path: &Path, ast_json: bool) -> Result<FunctionLiteral> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    if ast_json {
        serde_json::from_str(&contents)
            .with_context(|| format!("{}: invalid AST JSON", path.display()))
    } else {
        jitgen::frontend::parse_program(&contents, ScopeKind::Global)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }
}

/// Compiles the program and every function declared at its top level.
fn compile_all(program: &FunctionLiteral, options: &CompileOptions) -> Result<Vec<Code>> {
    let mut codes = vec![jitgen::compile(program, options).context("Compilation failed")?];
    for declaration in &program.scope.declarations {
        if let Some(function) = &declaration.function {
            let code = jitgen::compile(function, options)
                .with_context(|| format!("Compilation of {} failed", function.name))?;
            codes.push(code);
        }
    }
    Ok(codes)
}

/// Numbers become numbers; everything else is passed as a string.
fn parse_argument(arg: &str) -> Value {
    match arg {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        "null" => Value::Null,
        "undefined" => Value::Undefined,
        _ => arg
            .parse::<f64>()
            .map_or_else(|_| Value::String(arg.to_string()), Value::Number),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_argument() {
        assert_eq!(parse_argument("42"), Value::Number(42.0));
        assert_eq!(parse_argument("-1.5"), Value::Number(-1.5));
        assert_eq!(parse_argument("abc"), Value::from("abc"));
        assert_eq!(parse_argument("true"), Value::Bool(true));
        assert_eq!(parse_argument("null"), Value::Null);
    }

    #[test]
    fn test_compile_all_includes_declared_functions() {
        let program =
            jitgen::frontend::parse_program("function f() { return 1 } function g() {}", ScopeKind::Global)
                .unwrap();
        let codes = compile_all(&program, &CompileOptions::default()).unwrap();
        let names: Vec<&str> = codes.iter().map(|c| c.metadata.name.as_str()).collect();
        assert_eq!(names[1..], ["f", "g"]);
    }

    #[test]
    fn test_cli_parses_run_arguments() {
        let cli = Cli::parse_from(["jitgen", "run", "a.js", "--entry", "f", "--args", "1", "x"]);
        match cli.command {
            Commands::Run { entry, args, .. } => {
                assert_eq!(entry.as_deref(), Some("f"));
                assert_eq!(args, ["1", "x"]);
            }
            Commands::Compile { .. } => panic!("expected run"),
        }
    }
}
