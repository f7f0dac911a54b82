//! ferrite-functions - run FUNCTION / FCALL commands from the command line
//!
//! Builds a registry with the configured engines, loads library files and
//! executes one command against it:
//!
//! ```text
//! ferrite-functions --load mylib.lua fcall double 1 k1 5
//! ```
#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{ArgAction, Parser};
use ferrite_functions::commands::execute_frames;
use ferrite_functions::config::{Config, LogFormat};
use ferrite_functions::functions::{DirtyCounter, FunctionsRegistry};
use ferrite_functions::protocol::{encode_to_bytes, Frame};
use tracing::{error, info};

/// ferrite-functions - server-side functions for Ferrite
#[derive(Parser, Debug)]
#[command(name = "ferrite-functions")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (TOML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level: trace, debug, info, warn, error (overrides config file)
    #[arg(
        short = 'l',
        long = "log-level",
        alias = "loglevel",
        value_name = "LEVEL",
        env = "FERRITE_LOG_LEVEL"
    )]
    loglevel: Option<String>,

    /// Library file to load before running the command (can be repeated)
    #[arg(long = "load", value_name = "FILE", action = ArgAction::Append)]
    load: Vec<PathBuf>,

    /// Print the reply as raw RESP instead of human-readable text
    #[arg(long = "resp", action = ArgAction::SetTrue)]
    resp: bool,

    /// Dump effective configuration to stdout and exit
    #[arg(long = "dump-config", action = ArgAction::SetTrue)]
    dump_config: bool,

    /// Command to execute, e.g. `fcall double 1 k1 5` or `function list`
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

impl Cli {
    /// Apply CLI argument overrides to the configuration
    fn apply_to_config(&self, config: &mut Config) {
        if let Some(ref level) = self.loglevel {
            config.logging.level = level.clone();
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config, String> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path).map_err(|e| e.to_string())?,
        None => Config::default(),
    };
    cli.apply_to_config(&mut config);
    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

fn init_logging(config: &Config) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    // Logs go to stderr so replies on stdout stay clean
    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().pretty().with_writer(std::io::stderr))
                .init();
        }
    }
}

/// Render a reply the way redis-cli does
fn format_reply(frame: &Frame, indent: usize) -> String {
    match frame {
        Frame::Simple(s) => String::from_utf8_lossy(s).into_owned(),
        Frame::Error(s) => format!("(error) {}", String::from_utf8_lossy(s)),
        Frame::Integer(n) => format!("(integer) {n}"),
        Frame::Bulk(Some(b)) => format!("\"{}\"", String::from_utf8_lossy(b).escape_debug()),
        Frame::Bulk(None) | Frame::Array(None) | Frame::Null => "(nil)".to_string(),
        Frame::Array(Some(items)) if items.is_empty() => "(empty array)".to_string(),
        Frame::Array(Some(items)) => {
            let width = items.len().to_string().len();
            let mut out = String::new();
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push('\n');
                    out.push_str(&" ".repeat(indent));
                }
                let prefix = format!("{:>width$}) ", i + 1);
                out.push_str(&prefix);
                out.push_str(&format_reply(item, indent + prefix.len()));
            }
            out
        }
    }
}

fn run(cli: &Cli, registry: &FunctionsRegistry) -> ExitCode {
    for path in &cli.load {
        let code = match fs::read_to_string(path) {
            Ok(code) => code,
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to read library file");
                return ExitCode::FAILURE;
            }
        };
        match registry.load(&code, true) {
            Ok(name) => info!(path = %path.display(), library = %name, "Loaded library file"),
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to load library file");
                return ExitCode::FAILURE;
            }
        }
    }

    if cli.command.is_empty() {
        return ExitCode::SUCCESS;
    }

    let frames: Vec<Frame> = cli
        .command
        .iter()
        .map(|arg| Frame::bulk(arg.clone()))
        .collect();
    let reply = execute_frames(registry, &frames);

    if cli.resp {
        let mut stdout = std::io::stdout();
        if let Err(e) = stdout.write_all(&encode_to_bytes(&reply)) {
            error!(error = %e, "Failed to write reply");
            return ExitCode::FAILURE;
        }
    } else {
        println!("{}", format_reply(&reply, 0));
    }

    if reply.is_error() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    if cli.dump_config {
        return match config.to_toml() {
            Ok(toml) => {
                print!("{toml}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Error: {e}");
                ExitCode::FAILURE
            }
        };
    }

    init_logging(&config);

    let tracker = Arc::new(DirtyCounter::new());
    let registry = match FunctionsRegistry::with_builtin_engines(config.functions.clone(), tracker)
    {
        Ok(registry) => registry,
        Err(e) => {
            error!(error = %e, "Failed to initialize function engines");
            return ExitCode::FAILURE;
        }
    };

    let code = run(&cli, &registry);
    registry.shutdown();
    code
}
