use clap::Parser;
use std::path::PathBuf;

pub mod dispatcher;

/// runbook: a declarative task-runner runtime.
#[derive(Parser, Debug)]
#[command(author, version, about)]
#[command(trailing_var_arg = true)]
pub struct Cli {
    /// Enable diagnostic logging.
    #[arg(long, short)]
    pub verbose: bool,

    /// Treat every cached version as out of date for this run. The stored
    /// values are preserved and visible again on the next run.
    #[arg(long = "no-cache")]
    pub no_cache: bool,

    /// Annotate log lines with their source file and line.
    #[arg(long = "log-source")]
    pub log_source: bool,

    /// Path to the root manifest (defaults to ./runbook.toml).
    #[arg(long, value_name = "PATH")]
    pub manifest: Option<PathBuf>,

    /// Override the version-store directory. Supports `~` and environment
    /// variables; defaults to the per-user cache home.
    #[arg(long = "store-dir", value_name = "PATH")]
    pub store_dir: Option<String>,

    /// The command path and its flags/arguments, parsed against the
    /// registered command tree.
    #[arg()]
    pub args: Vec<String>,
}
