// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

/// Command-line arguments for `watchflow`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "watchflow",
    version,
    about = "Run multi-step workflows on files as they appear or change.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (YAML).
    ///
    /// Default: `watchflow.yaml` in the current working directory.
    #[arg(long, value_name = "PATH", default_value = "watchflow.yaml")]
    pub config: String,

    /// Run the startup scans for all enabled workflows, then exit without
    /// watching or executing anything.
    #[arg(long)]
    pub scan_only: bool,

    /// Load and validate the configuration, print a summary, and exit.
    #[arg(long)]
    pub dry_run: bool,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `WATCHFLOW_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,
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

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
