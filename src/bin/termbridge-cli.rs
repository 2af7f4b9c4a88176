//! Termbridge CLI - run goals against a worker interpreter
//!
//! Spawns the worker, then reads one goal per line from stdin and prints its
//! bindings (or every solution, with `--solutions`).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use termbridge::engine::{Bindings, OutputSpec};
use termbridge::transport::{CodecKind, ProcessConfig};
use termbridge::{Capabilities, Engine, EngineConfig, EngineError};

#[derive(Parser)]
#[command(name = "termbridge")]
#[command(about = "Drive a worker interpreter as a synchronous goal/callback engine", long_about = None)]
struct Cli {
    /// Engine configuration file (JSON); TERMBRIDGE_* variables override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Dialect descriptor file (JSON)
    #[arg(long)]
    capabilities: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Spawn a worker and evaluate goals read from stdin
    Run {
        /// Worker executable
        program: PathBuf,

        /// Worker arguments; `{port}` is replaced by the channel port
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,

        /// Command written to the worker right after it starts (repeatable)
        #[arg(long = "startup")]
        startup_commands: Vec<String>,

        /// Structured channel codec
        #[arg(long, value_enum, default_value = "preserves")]
        codec: CodecArg,

        /// Comma-separated result variables
        #[arg(long, value_delimiter = ',')]
        vars: Vec<String>,

        /// Print every solution instead of the first
        #[arg(long)]
        solutions: bool,

        /// Milliseconds to wait for the worker to connect
        #[arg(long, default_value = "10000")]
        connect_timeout_ms: u64,
    },

    /// Print the effective engine configuration
    Config,

    /// Print the effective dialect descriptor
    Capabilities,
}

#[derive(Clone, Copy, ValueEnum)]
enum CodecArg {
    Preserves,
    JsonLines,
}

impl From<CodecArg> for CodecKind {
    fn from(arg: CodecArg) -> Self {
        match arg {
            CodecArg::Preserves => CodecKind::Preserves,
            CodecArg::JsonLines => CodecKind::JsonLines,
        }
    }
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    }
    .apply_env()?;

    let capabilities = match &cli.capabilities {
        Some(path) => Capabilities::load(path)?,
        None => Capabilities::generic(),
    };

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }

        Commands::Capabilities => {
            println!("{}", serde_json::to_string_pretty(&capabilities)?);
        }

        Commands::Run {
            program,
            args,
            startup_commands,
            codec,
            vars,
            solutions,
            connect_timeout_ms,
        } => {
            let mut process = ProcessConfig::new(program);
            process.args = args;
            process.startup_commands = startup_commands
                .into_iter()
                .map(|command| format!("{}\n", command))
                .collect();
            process.codec = codec.into();
            process.connect_timeout_ms = connect_timeout_ms;

            let engine = Engine::spawn(config, capabilities, process)
                .context("failed to start worker")?;
            let output = OutputSpec::vars(vars);
            let result = run_goals(&engine, &output, solutions);
            engine.shutdown();
            result?;
        }
    }

    Ok(())
}

fn run_goals(engine: &Engine, output: &OutputSpec, solutions: bool) -> Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout().lock();

    for line in stdin.lock().lines() {
        let line = line?;
        let goal = line.trim();
        if goal.is_empty() {
            continue;
        }

        if solutions {
            let mut count = 0usize;
            for solution in engine.solutions(goal, Vec::new(), output.clone())? {
                match solution {
                    Ok(bindings) => {
                        count += 1;
                        writeln!(stdout, "{}", render(&bindings))?;
                    }
                    Err(err) => {
                        writeln!(stdout, "error: {}", err)?;
                        break;
                    }
                }
            }
            writeln!(stdout, "{} solution(s)", count)?;
        } else {
            match engine.call(goal, Vec::new(), output.clone()) {
                Ok(Some(bindings)) => writeln!(stdout, "{}", render(&bindings))?,
                Ok(None) => writeln!(stdout, "no")?,
                Err(err @ EngineError::TransportFailure(_)) => return Err(err.into()),
                Err(err) => writeln!(stdout, "error: {}", err)?,
            }
        }
        stdout.flush()?;
    }

    Ok(())
}

fn render(bindings: &Bindings) -> String {
    if bindings.is_empty() {
        return if bindings.is_undefined() {
            "undefined".to_string()
        } else {
            "yes".to_string()
        };
    }
    bindings
        .iter()
        .map(|(name, value)| format!("{} = {}", name, value))
        .collect::<Vec<_>>()
        .join(", ")
}
