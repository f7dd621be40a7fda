use crate::analysis::Analyzer;
use crate::config::Config;
use crate::engine::Engine;
use crate::report::Summary;
use anyhow::{Context, Result, bail};
use glob::glob;
use std::{
    fs::{self, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

/// Owns the simulation directory layout: a `config.toml` next to one
/// `run-XXXX` directory per run, each holding the report, summary,
/// trajectory segments, checkpoint, and analysis results of that run.
pub struct Manager {
    sim_dir: PathBuf,
    cfg: Config,
}

impl Manager {
    pub fn new<P: AsRef<Path>>(sim_dir: P) -> Result<Self> {
        let sim_dir = sim_dir.as_ref().to_path_buf();

        let cfg =
            Config::from_file(sim_dir.join("config.toml")).context("failed to construct cfg")?;
        log::info!("{cfg:#?}");

        Ok(Self { sim_dir, cfg })
    }

    /// Initialize a new run directory and simulate to completion.
    pub fn create_run(&self) -> Result<()> {
        let run_idx = self.count_run_dirs().context("failed to count run dirs")?;

        let run_dir = self.run_dir(run_idx);
        fs::create_dir_all(&run_dir).with_context(|| format!("failed to create {run_dir:?}"))?;
        log::info!("created {run_dir:?}");

        let mut engine = Engine::generate_initial_condition(self.cfg.clone())
            .context("failed to generate initial condition")?;

        self.append_summary(run_idx, &engine.summary("begin"))
            .context("failed to write begin summary")?;

        engine
            .initialize_report(self.report_file(run_idx))
            .context("failed to initialize report")?;

        // Checkpoint the initial condition, so a run interrupted before
        // its first snapshot can still be resumed.
        engine
            .save_checkpoint(self.checkpoint_file(run_idx))
            .context("failed to save checkpoint")?;

        self.advance_run(run_idx, 0, &mut engine)
    }

    /// Continue an interrupted run from its checkpoint.
    pub fn resume_run(&self, run_idx: usize) -> Result<()> {
        let file_idx = self
            .count_trajectory_files(run_idx)
            .context("failed to count trajectory files")?;

        let checkpoint_file = self.checkpoint_file(run_idx);
        let mut engine = Engine::load_checkpoint(&checkpoint_file)
            .with_context(|| format!("failed to load {checkpoint_file:?}"))?;
        if engine.cfg() != &self.cfg {
            bail!("checkpoint config differs from the current config");
        }
        log::info!("loaded {checkpoint_file:?}");

        if engine.is_complete() {
            log::info!("run {run_idx} is already complete");
            return Ok(());
        }

        self.advance_run(run_idx, file_idx, &mut engine)
    }

    fn advance_run(&self, run_idx: usize, file_idx: usize, engine: &mut Engine) -> Result<()> {
        engine
            .run_simulation(
                self.report_file(run_idx),
                self.trajectory_file(run_idx, file_idx),
                self.checkpoint_file(run_idx),
            )
            .context("failed to run simulation")?;

        if engine.is_complete() {
            self.append_summary(run_idx, &engine.summary("end"))
                .context("failed to write end summary")?;
        }

        engine
            .save_checkpoint(self.checkpoint_file(run_idx))
            .context("failed to save checkpoint")?;

        Ok(())
    }

    /// Reduce the trajectory snapshots of every run into `results.json`.
    pub fn analyze_sim(&self) -> Result<()> {
        let n_runs = self.count_run_dirs().context("failed to count run dirs")?;
        for run_idx in 0..n_runs {
            let mut analyzer = Analyzer::new();

            let n_files = self
                .count_trajectory_files(run_idx)
                .context("failed to count trajectory files")?;
            for file_idx in 0..n_files {
                analyzer
                    .add_file(self.trajectory_file(run_idx, file_idx))
                    .context("failed to add file")?;
            }

            analyzer
                .save_results(self.results_file(run_idx))
                .context("failed to save results")?;
        }

        Ok(())
    }

    /// Delete all run directories, keeping the configuration.
    pub fn clean_sim(&self) -> Result<()> {
        let n_runs = self.count_run_dirs().context("failed to count run dirs")?;
        for run_idx in 0..n_runs {
            let run_dir = self.run_dir(run_idx);
            fs::remove_dir_all(&run_dir)
                .with_context(|| format!("failed to remove {run_dir:?}"))?;
            log::info!("removed {run_dir:?}");
        }
        Ok(())
    }

    fn append_summary(&self, run_idx: usize, summary: &Summary) -> Result<()> {
        let summary_file = self.summary_file(run_idx);
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&summary_file)
            .with_context(|| format!("failed to open {summary_file:?}"))?;
        let mut writer = BufWriter::new(file);
        summary.write(&mut writer)?;
        writer.flush().context("failed to flush summary stream")?;
        Ok(())
    }

    fn count_run_dirs(&self) -> Result<usize> {
        let pattern = self.sim_dir.join("run-*");
        let pattern = pattern.to_str().context("pattern is not valid UTF-8")?;
        let count = glob(pattern)
            .context("failed to glob run dirs")?
            .filter_map(Result::ok)
            .filter(|p| p.is_dir())
            .count();
        Ok(count)
    }

    fn run_dir(&self, run_idx: usize) -> PathBuf {
        self.sim_dir.join(format!("run-{run_idx:04}"))
    }

    fn count_trajectory_files(&self, run_idx: usize) -> Result<usize> {
        let pattern = self.run_dir(run_idx).join("trajectory-*.msgpack");
        let pattern = pattern.to_str().context("pattern is not valid UTF-8")?;
        let count = glob(pattern)
            .context("failed to glob trajectory files")?
            .filter_map(Result::ok)
            .count();
        Ok(count)
    }

    fn report_file(&self, run_idx: usize) -> PathBuf {
        self.run_dir(run_idx).join("report.csv")
    }

    fn summary_file(&self, run_idx: usize) -> PathBuf {
        self.run_dir(run_idx).join("summary.csv")
    }

    fn checkpoint_file(&self, run_idx: usize) -> PathBuf {
        self.run_dir(run_idx).join("checkpoint.msgpack")
    }

    fn trajectory_file(&self, run_idx: usize, file_idx: usize) -> PathBuf {
        self.run_dir(run_idx)
            .join(format!("trajectory-{file_idx:04}.msgpack"))
    }

    fn results_file(&self, run_idx: usize) -> PathBuf {
        self.run_dir(run_idx).join("results.json")
    }
}
