// src/bin/runbook.rs

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use colored::Colorize;
use runbook::{
    cli::{Cli, dispatcher},
    constants::MANIFEST_FILENAME,
    core::{
        cache::CacheStore,
        loader::{LoadChain, ModuleLoader},
        manifest::ManifestSource,
        orchestrator, paths,
    },
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

/// The main entry point. Sets up logging, loads the manifest tree, parses
/// the remaining arguments against it, and performs centralized error
/// handling.
fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    if let Err(e) = run_cli(&cli) {
        eprintln!("\n{}: {:#}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

fn init_logging(cli: &Cli) {
    let mut builder = env_logger::Builder::from_default_env();
    if cli.verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    if cli.log_source {
        builder.format(|buf, record| {
            writeln!(
                buf,
                "[{} {}:{}] {}",
                record.level(),
                record.file().unwrap_or("?"),
                record.line().unwrap_or(0),
                record.args()
            )
        });
    }
    builder.init();
}

fn run_cli(cli: &Cli) -> Result<()> {
    log::debug!("CLI args parsed: {:?}", cli);

    let manifest_path = match &cli.manifest {
        Some(path) => path.clone(),
        None => PathBuf::from(MANIFEST_FILENAME),
    };
    if !manifest_path.exists() {
        return Err(anyhow!(
            "No manifest found at '{}'. Create one or pass --manifest.",
            manifest_path.display()
        ));
    }

    let store = match &cli.store_dir {
        Some(template) => Arc::new(CacheStore::open(paths::expand_store_dir(template)?)?),
        None => Arc::new(CacheStore::open_default()?),
    };
    store.set_force_out_of_date(cli.no_cache);

    // Registration phase: execute the root manifest (and its imports)
    // through the module loader. Any registration or resolution error is
    // fatal before a single command runs.
    let loader = ModuleLoader::new(ManifestSource::new(store));
    loader
        .load(&manifest_path, &LoadChain::new())
        .with_context(|| format!("While loading '{}'", manifest_path.display()))?;
    let set = loader.into_source().into_command_set();

    // Dispatch phase: the tree is immutable from here on.
    let outcome = dispatcher::dispatch(&set, &cli.args);

    // Join background tasks queued during the run before deciding the exit
    // status, even when the action chain failed.
    orchestrator::global().wait();

    outcome
}
