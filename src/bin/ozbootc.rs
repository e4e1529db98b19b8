//! ozbootc - drive the Oz bootstrap compiler
//!
//! Compiles Oz source files into C++ that reconstructs the program
//! against the Mozart VM runtime.
//!
//! # Usage
//!
//! ```bash
//! # Compile one module
//! ozbootc -o Foo.cc -m boot-modules/ Foo.oz
//!
//! # Build the base environment from several base functors
//! ozbootc --baseenv -o base.cc -m boot-modules/ Base.oz BaseExtra.oz
//!
//! # Emit the linker output (main file first)
//! ozbootc --linker -o linked.cc -b base-decls.txt M.oz Lib.oz
//! ```
//!
//! Exit codes: 0 on success, 1 for bad arguments, 2 for parse or
//! compile errors and internal failures.

use clap::{ArgAction, Parser};
use colored::Colorize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use ozboot::assembly;
use ozboot::codegen::{CppEmitter, EmitMode, EmitOptions};
use ozboot::error::caret_snippet;
use ozboot::parser::parse_expression;
use ozboot::transform;
use ozboot::Program;

/// Compile Oz source to C++ for the Mozart VM
#[derive(Parser, Debug)]
#[command(name = "ozbootc")]
#[command(author, version, about, long_about = None)]
#[command(disable_help_flag = true)]
struct Args {
    /// Compile the base environment
    #[arg(long)]
    baseenv: bool,

    /// Emit the linker output (default mode compiles one module)
    #[arg(long)]
    linker: bool,

    /// Output C++ file
    #[arg(short, long)]
    output: PathBuf,

    /// Additional C++ header to include (repeatable, order preserved)
    #[arg(short = 'h', long = "header")]
    headers: Vec<String>,

    /// Builtin-module descriptor file or directory (repeatable)
    #[arg(short = 'm', long = "module")]
    modules: Vec<PathBuf>,

    /// Base-declarations file, one exported name per line
    #[arg(short = 'b', long = "base")]
    base: Option<PathBuf>,

    /// Conditional-compilation symbol (repeatable)
    #[arg(short = 'D', long = "define")]
    defines: Vec<String>,

    /// Input files; in linker mode the main file must be first
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Print help
    #[arg(long, action = ArgAction::Help)]
    help: Option<bool>,
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            // clap renders --help and --version through the error path
            use clap::error::ErrorKind;
            if matches!(
                err.kind(),
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion
            ) {
                let _ = err.print();
                return ExitCode::SUCCESS;
            }
            let _ = err.print();
            return ExitCode::from(1);
        }
    };

    if args.baseenv && args.linker {
        eprintln!("{}: --baseenv and --linker are mutually exclusive", "error".red().bold());
        return ExitCode::from(1);
    }

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}: {:#}", "error".red().bold(), err);
            ExitCode::from(2)
        }
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let defines: HashSet<String> = args.defines.iter().cloned().collect();
    let mut program = Program::new(args.baseenv);

    for path in &args.modules {
        program
            .builtins
            .load_path(path)
            .map_err(|e| anyhow::anyhow!("cannot load builtin modules from {:?}: {}", path, e))?;
    }

    if let Some(path) = &args.base {
        let text = fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read base declarations {:?}: {}", path, e))?;
        for line in text.lines() {
            let name = line.trim();
            if !name.is_empty() {
                program.add_base_declaration(name);
            }
        }
    }

    // Sources are kept around for the caret display
    let mut sources: HashMap<String, String> = HashMap::new();

    let mode = if args.linker {
        let main_stem = file_stem(&args.inputs[0]);
        assembly::assemble_linker(&mut program, &assembly::functor_url(&main_stem));
        EmitMode::Linker {
            functor_names: args.inputs.iter().map(|p| file_stem(p)).collect(),
        }
    } else if args.baseenv {
        let mut functors = Vec::new();
        for path in &args.inputs {
            functors.push(parse_input(path, &defines, &mut sources)?);
        }
        let Some(merged) = assembly::merge_base_functors(&mut program, functors) else {
            report_program_errors(&program, &sources);
            anyhow::bail!("base environment assembly failed");
        };
        let boot_mods = assembly::assemble_base_env(&mut program, merged);
        EmitMode::BaseEnv { boot_mods }
    } else {
        if args.inputs.len() != 1 {
            anyhow::bail!("module mode takes exactly one input file");
        }
        let path = &args.inputs[0];
        let functor = parse_input(path, &defines, &mut sources)?;
        let stem = file_stem(path);
        assembly::wrap_module(&mut program, functor, &assembly::functor_url(&stem));
        EmitMode::Module { name: stem }
    };

    transform::compile(&mut program)
        .map_err(|e| anyhow::anyhow!("internal failure: {}", e))?;

    if program.has_errors() {
        report_program_errors(&program, &sources);
        anyhow::bail!("{} error(s)", program.errors.len());
    }

    let emitter = CppEmitter::new(
        &program,
        EmitOptions {
            mode,
            headers: args.headers.clone(),
        },
    );
    let cpp = emitter
        .generate()
        .map_err(|e| anyhow::anyhow!("internal failure: {}", e))?;
    fs::write(&args.output, cpp)
        .map_err(|e| anyhow::anyhow!("cannot write {:?}: {}", args.output, e))?;
    Ok(())
}

fn parse_input(
    path: &Path,
    defines: &HashSet<String>,
    sources: &mut HashMap<String, String>,
) -> anyhow::Result<ozboot::Expression> {
    let file = path.to_string_lossy().to_string();
    let source = fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("cannot read {:?}: {}", path, e))?;
    let parsed = parse_expression(&source, &file, defines);
    sources.insert(file.clone(), source);
    parsed.map_err(|err| {
        print_located(&err.to_string(), &err.pos().to_string(), sources.get(&file), err.pos());
        anyhow::anyhow!("parse error in {}", file)
    })
}

fn report_program_errors(program: &Program, sources: &HashMap<String, String>) {
    for err in &program.errors {
        let pos = err.pos();
        print_located(
            &err.to_string(),
            &pos.to_string(),
            sources.get(&*pos.file),
            pos,
        );
    }
}

fn print_located(message: &str, location: &str, source: Option<&String>, pos: &ozboot::Pos) {
    eprintln!("{}: {}", "error".red().bold(), message.bold());
    eprintln!("  {} {}", "-->".blue(), location);
    if let Some(source) = source {
        if let Some(snippet) = caret_snippet(source, pos) {
            for line in snippet.lines() {
                eprintln!("   {}", line);
            }
        }
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}
