//! CLI command definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// CodeSwarm - multi-agent project builder
#[derive(Parser)]
#[command(
    name = "codeswarm",
    about = "Multi-agent code synthesis orchestrator",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Build a project from a natural-language request
    Build {
        /// What to build (joined into one request)
        #[arg(value_name = "REQUEST", required = true)]
        request: Vec<String>,

        /// Where the generated project is written (cleared on each run)
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Maximum concurrent worker LLM calls
        #[arg(short = 'w', long)]
        max_workers: Option<usize>,

        /// Disable the background reconciler sweep
        #[arg(long)]
        no_reconciler: bool,
    },
}
