//! ChunkStore dump inspection tool.
//!
//! # Usage
//!
//! ```bash
//! # Check a dump for structural damage
//! chunkstore analyze store.dump
//!
//! # Header and heap counters as JSON
//! chunkstore -o json info store.dump
//!
//! # Ids of other nodes held in the dump
//! chunkstore ranges --migrated store.dump
//!
//! # Write a configuration file with every default spelled out
//! chunkstore init-config store.toml
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::debug;
use tracing_subscriber::EnvFilter;

mod commands;
mod formatter;

use formatter::OutputFormat;

/// Exit code of `analyze` when the dump has issues.
const EXIT_ISSUES: u8 = 2;

/// ChunkStore dump inspection tool
#[derive(Parser, Debug)]
#[command(
    name = "chunkstore",
    version,
    about = "Offline inspection of ChunkStore arena dumps",
    long_about = "Reads arena dumps written by a ChunkStore (on request or after a fatal fault)\n\
                  and checks or summarizes them without a running store."
)]
struct Args {
    /// Output format
    #[arg(short = 'o', long, value_enum, default_value = "text", global = true)]
    output: OutputFormatArg,

    /// Log filter, e.g. `debug` or `chunkstore_engine=trace`; RUST_LOG wins
    #[arg(long, default_value = "warn", env = "CHUNKSTORE_LOG", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Walk a dump and report structural issues
    Analyze {
        /// Dump file
        dump: PathBuf,
    },

    /// Show the dump header and heap counters
    Info {
        /// Dump file
        dump: PathBuf,
    },

    /// List the live id ranges held in a dump
    Ranges {
        /// Dump file
        dump: PathBuf,

        /// List ids owned by other nodes instead of local ones
        #[arg(long)]
        migrated: bool,

        /// Store configuration supplying runtime settings
        #[arg(short = 'c', long, value_name = "FILE")]
        config: Option<PathBuf>,
    },

    /// Write a store configuration file
    InitConfig {
        /// Destination path
        path: PathBuf,

        /// Use the small test geometry instead of the defaults
        #[arg(long)]
        testing: bool,
    },
}

/// Output format argument
#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormatArg {
    /// Human-readable text and tables
    Text,
    /// Pretty-printed JSON
    Json,
}

impl From<OutputFormatArg> for OutputFormat {
    fn from(arg: OutputFormatArg) -> Self {
        match arg {
            OutputFormatArg::Text => OutputFormat::Text,
            OutputFormatArg::Json => OutputFormat::Json,
        }
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ExitCode> {
    let args = Args::parse();
    init_logging(&args.log_level);
    debug!(?args, "parsed arguments");

    let format = OutputFormat::from(args.output);
    match &args.command {
        Command::Analyze { dump } => {
            let report = commands::analyze(dump)?;
            println!("{}", formatter::format_report(&report, format)?);
            if report.is_clean() {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(EXIT_ISSUES))
            }
        }
        Command::Info { dump } => {
            let info = commands::info(dump)?;
            println!("{}", formatter::format_info(&info, format)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Ranges {
            dump,
            migrated,
            config,
        } => {
            let listing = commands::ranges(dump, *migrated, config.as_deref())?;
            println!("{}", formatter::format_ranges(&listing, format)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::InitConfig { path, testing } => {
            commands::init_config(path, *testing)?;
            println!("wrote {}", path.display());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}
