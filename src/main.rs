mod analysis;
mod config;
mod engine;
mod manager;
mod matching;
mod model;
mod report;
mod sampler;
mod stats;

use crate::manager::Manager;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Agent-based simulation of sexual partnership dynamics and HIV
/// transmission in a synthetic youth population.
#[derive(Debug, Parser)]
#[command(version, about)]
struct CLI {
    /// Simulation directory holding `config.toml` and the run outputs.
    #[arg(long)]
    sim_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Initialize a new run directory and simulate to completion.
    Create,

    /// Continue an interrupted run from its latest checkpoint.
    Resume {
        /// Index of the run to resume.
        #[arg(long)]
        run_idx: usize,
    },

    /// Reduce the trajectory snapshots of every run into `results.json`.
    Analyze,

    /// Delete all run directories, keeping the configuration.
    Clean,
}

fn main() {
    env_logger::Builder::new()
        .format_timestamp_millis()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    if let Err(error) = run_cli() {
        log::error!("{error:#?}");
        std::process::exit(1);
    }
}

fn run_cli() -> Result<()> {
    let args = CLI::parse();
    log::info!("{args:#?}");

    let mgr = Manager::new(args.sim_dir).context("failed to construct mgr")?;

    match args.command {
        Command::Create => mgr.create_run()?,
        Command::Resume { run_idx } => mgr.resume_run(run_idx)?,
        Command::Analyze => mgr.analyze_sim()?,
        Command::Clean => mgr.clean_sim()?,
    }

    Ok(())
}
