// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::types::IpcMode;

/// Command-line arguments for `ipcrun`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "ipcrun",
    version,
    about = "Run an interpreter script and talk to it over pipes or a loopback socket.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Default: `ipcrun.toml` in the current directory, if it exists.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Named profile from `[profile.<name>]`.
    #[arg(long, short = 'p', value_name = "NAME")]
    pub profile: Option<String>,

    /// Interpreter executable (overrides the profile).
    #[arg(long, value_name = "PATH")]
    pub interpreter: Option<PathBuf>,

    /// Script passed as the first interpreter argument (overrides the profile).
    #[arg(long, value_name = "PATH")]
    pub script: Option<String>,

    /// Transport: `stdio` or `socket`.
    #[arg(long, value_name = "MODE", value_parser = parse_mode)]
    pub mode: Option<IpcMode>,

    /// Request payload sent as one line.
    #[arg(long, value_name = "TEXT", conflicts_with = "payload_file")]
    pub payload: Option<String>,

    /// Read the payload from a file (`-` for stdin).
    #[arg(long, value_name = "PATH")]
    pub payload_file: Option<PathBuf>,

    /// Socket mode: keep forwarding stdin lines as further messages.
    #[arg(long)]
    pub interactive: bool,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `IPCRUN_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Also write logs to a daily rolling file in this directory.
    #[arg(long, value_name = "DIR")]
    pub log_dir: Option<PathBuf>,

    /// Resolve and print the run request without starting anything.
    #[arg(long)]
    pub dry_run: bool,

    /// Extra arguments for the script.
    #[arg(last = true, value_name = "ARGS")]
    pub script_args: Vec<String>,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

fn parse_mode(s: &str) -> Result<IpcMode, String> {
    s.parse()
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
