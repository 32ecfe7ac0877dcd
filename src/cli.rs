// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

/// Command-line arguments for `flowmgr`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "flowmgr",
    version,
    about = "Schedule and run containerized data-processing steps.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the settings file (TOML).
    #[arg(long, value_name = "PATH", default_value = "flowmgr.toml")]
    pub config: String,

    /// Batch file of data objects to submit at startup.
    #[arg(long, value_name = "PATH")]
    pub batch: Option<String>,

    /// Submit as this user (owner of the created data objects).
    #[arg(long, value_name = "NAME")]
    pub user: Option<String>,

    /// Exit once every submitted data object has finished.
    #[arg(long)]
    pub once: bool,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `FLOWMGR_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Load settings, processes and the batch, print what would run, and
    /// exit without executing anything.
    #[arg(long)]
    pub dry_run: bool,
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

pub fn parse() -> CliArgs {
    CliArgs::parse()
}
