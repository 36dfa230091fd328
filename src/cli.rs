//! CLI argument parsing for the log replay tool

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Output format for findings
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text format (default)
    Text,
    /// JSON lines for machine parsing
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "nplusone")]
#[command(version)]
#[command(about = "Replay a recorded SQL statement log and report N+1 query patterns", long_about = None)]
pub struct Cli {
    /// Statement log to replay ('-' reads stdin)
    #[arg(value_name = "LOG")]
    pub log: PathBuf,

    /// Repetitions within one unit of work that count as N+1 (overrides config)
    #[arg(short = 't', long = "threshold", value_name = "N")]
    pub threshold: Option<usize>,

    /// TOML configuration file
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Output format (text or json)
    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// Exit with status 1 when any finding is reported
    #[arg(long = "fail-on-findings")]
    pub fail_on_findings: bool,

    /// Enable debug tracing output to stderr
    #[arg(long = "debug")]
    pub debug: bool,
}
