mod config;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::filter::EnvFilter;
use xpy_bytecode::Module;
use xpy_jit::{HostBuffer, JitCompiler, JitConfig, Type, TypeId};

#[derive(Parser)]
#[command(name = "xpy", version, about = "xpy bytecode compiler")]
struct Cli {
    /// Configuration file (default: nearest xpy.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the instructions of every function in a module
    Dis { module: PathBuf },
    /// Compile a module and report its block structure
    Check {
        module: PathBuf,
        /// Print block summaries as JSON
        #[arg(long)]
        json: bool,
    },
    /// Compile a module and call one of its functions
    Run {
        module: PathBuf,
        function: String,
        /// Integers, or `b:<text>` for a buffer argument
        #[arg(allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::load_config(cli.config.as_deref())?;

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log.filter)?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Dis { module } => disassemble(&module)?,
        Commands::Check { module, json } => check(&module, config.jit, json)?,
        Commands::Run {
            module,
            function,
            args,
        } => run(&module, config.jit, &function, &args)?,
    }

    Ok(())
}

fn load_module(path: &Path) -> Result<Module> {
    Module::load(path).with_context(|| format!("failed to load {}", path.display()))
}

fn compile(path: &Path, jit_config: JitConfig) -> Result<JitCompiler> {
    let module = load_module(path)?;
    let mut jit = JitCompiler::with_config(jit_config)?;
    jit.compile_module(&module)
        .with_context(|| format!("failed to compile {}", path.display()))?;
    Ok(jit)
}

fn disassemble(path: &Path) -> Result<()> {
    let module = load_module(path)?;
    for def in &module.functions {
        let params: Vec<String> = def.params.iter().map(ToString::to_string).collect();
        println!("def {}({}) -> {}", def.name, params.join(", "), def.returns);
        print!("{}", def.code_unit()?);
        println!();
    }
    Ok(())
}

fn check(path: &Path, jit_config: JitConfig, json: bool) -> Result<()> {
    let jit = compile(path, jit_config)?;

    if json {
        let report: serde_json::Map<String, serde_json::Value> = jit
            .functions()
            .map(|f| Ok((f.name.clone(), serde_json::to_value(&f.blocks)?)))
            .collect::<Result<_>>()?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    for function in jit.functions() {
        println!("{}: {} blocks", function.name, function.blocks.len());
        for block in &function.blocks {
            println!("  {:>4} {:?}", block.offset, block.terminator);
        }
        if let Some(ir) = &function.ir {
            println!("{ir}");
        }
    }
    Ok(())
}

/// Host-side argument; buffers must outlive the call.
enum Argument {
    Int(i64),
    Buffer(HostBuffer),
}

fn parse_argument(text: &str, expects_buffer: bool) -> Result<Argument> {
    match (text.strip_prefix("b:"), expects_buffer) {
        (Some(bytes), true) => Ok(Argument::Buffer(HostBuffer::from_bytes(bytes.as_bytes())?)),
        (None, false) => {
            let value = text
                .parse::<i64>()
                .with_context(|| format!("invalid integer argument {text:?}"))?;
            Ok(Argument::Int(value))
        }
        (Some(_), false) => bail!("argument {text:?} is a buffer, expected an integer"),
        (None, true) => bail!("argument {text:?} is not a buffer (use b:<text>)"),
    }
}

fn run(path: &Path, jit_config: JitConfig, name: &str, args: &[String]) -> Result<()> {
    let jit = compile(path, jit_config)?;
    let function = jit.artifact(name)?;
    if function.params.len() != args.len() {
        bail!(
            "{name} expects {} arguments, got {}",
            function.params.len(),
            args.len()
        );
    }

    let mut arguments = Vec::with_capacity(args.len());
    for (text, ty) in args.iter().zip(&function.params) {
        let expects_buffer = matches!(jit.types().get(*ty), Type::Buffer(_));
        arguments.push(parse_argument(text, expects_buffer)?);
    }
    let words: Vec<i64> = arguments
        .iter_mut()
        .map(|arg| match arg {
            Argument::Int(value) => *value,
            Argument::Buffer(buffer) => buffer.as_arg(),
        })
        .collect();

    debug!(function = name, args = ?words, "invoking");
    // SAFETY: every argument was checked against the parameter types above,
    // and the buffers in `arguments` stay alive until the call returns.
    let result = unsafe { jit.invoke(name, &words)? };

    if function.returns != TypeId::VOID {
        println!("{result}");
    }
    Ok(())
}
