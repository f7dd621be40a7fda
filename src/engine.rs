use crate::config::{Config, Formation, Transmission};
use crate::matching::Matcher;
use crate::model::{AgentId, Population, Prevalence, State};
use crate::report;
use crate::sampler::Sampler;
use anyhow::{Context, Result};
use rand::prelude::*;
use rand_chacha::ChaCha12Rng;
use rand_distr::Geometric;
use rmp_serde::{decode, encode};
use serde::{Deserialize, Serialize};
use std::{
    fs::{File, OpenOptions},
    io::{BufReader, BufWriter, Write},
    path::Path,
};

/// Simulation engine.
///
/// Holds the configuration, current state, and random number generator,
/// and provides methods to initialize, run, save, and load simulations.
///
/// All randomness is consumed from the single `rng` stream in a strict
/// sequence, so a fixed configuration seed reproduces the trajectory
/// bit for bit.
#[derive(Serialize, Deserialize)]
pub struct Engine {
    cfg: Config,
    state: State,
    rng: ChaCha12Rng,
}

impl Engine {
    /// Create a new `Engine` with the given configuration and a freshly
    /// sampled population.
    pub fn generate_initial_condition(cfg: Config) -> Result<Self> {
        let mut rng = match cfg.seed {
            Some(seed) => ChaCha12Rng::seed_from_u64(seed),
            None => ChaCha12Rng::try_from_os_rng()?,
        };

        let sampler = Sampler::new(&cfg).context("failed to construct sampler")?;
        let mut agents = Vec::with_capacity(cfg.population.n_agents);
        for id in 0..cfg.population.n_agents {
            agents.push(sampler.sample_agent(id, &mut rng));
        }

        let state = State {
            step: 0,
            population: Population::new(agents),
            baseline: None,
        };

        Ok(Self { cfg, state, rng })
    }

    pub fn cfg(&self) -> &Config {
        &self.cfg
    }

    pub fn is_complete(&self) -> bool {
        self.state.step >= self.cfg.num_iterations()
    }

    /// Write the report header and the initial (pre-simulation) row.
    pub fn initialize_report<P: AsRef<Path>>(&self, report_file: P) -> Result<()> {
        let report_file = report_file.as_ref();
        let file = File::create(report_file)
            .with_context(|| format!("failed to create {report_file:?}"))?;
        let mut writer = BufWriter::new(file);

        report::write_header(&mut writer)?;
        report::write_row(&mut writer, self.cfg.time.start_date, &self.state.population)?;
        writer.flush().context("failed to flush report stream")?;
        Ok(())
    }

    /// Run the remaining iterations, appending one report row per step
    /// and a state snapshot every `steps_per_save` steps. A checkpoint
    /// is written alongside every snapshot, so an interrupted run loses
    /// at most one snapshot interval and resumes from the last one.
    pub fn run_simulation<P: AsRef<Path>, Q: AsRef<Path>, C: AsRef<Path>>(
        &mut self,
        report_file: P,
        trajectory_file: Q,
        checkpoint_file: C,
    ) -> Result<()> {
        let num_iterations = self.cfg.num_iterations();
        if self.is_complete() {
            log::info!("run already complete after {} steps", self.state.step);
            return Ok(());
        }

        let report_file = report_file.as_ref();
        let report = OpenOptions::new()
            .append(true)
            .open(report_file)
            .with_context(|| format!("failed to open {report_file:?}"))?;
        let mut report_writer = BufWriter::new(report);

        let trajectory_file = trajectory_file.as_ref();
        let trajectory = File::create(trajectory_file)
            .with_context(|| format!("failed to create {trajectory_file:?}"))?;
        let mut trajectory_writer = BufWriter::new(trajectory);

        let checkpoint_file = checkpoint_file.as_ref();

        let matcher = self.cfg.model.matching.build();

        while self.state.step < num_iterations {
            let date = self.cfg.time.start_date + self.cfg.time.time_step * self.state.step as f64;

            self.perform_step(&*matcher).context("failed to perform step")?;
            report::write_row(&mut report_writer, date, &self.state.population)?;

            self.state.step += 1;
            if self.state.step % self.cfg.output.steps_per_save == 0 {
                encode::write(&mut trajectory_writer, &self.state)
                    .context("failed to serialize state")?;

                // Flush both streams before checkpointing, so the files
                // on disk never lag behind the checkpoint they would be
                // resumed from.
                report_writer
                    .flush()
                    .context("failed to flush report stream")?;
                trajectory_writer
                    .flush()
                    .context("failed to flush trajectory stream")?;
                self.save_checkpoint(checkpoint_file)
                    .context("failed to save checkpoint")?;

                let progress = 100.0 * self.state.step as f64 / num_iterations as f64;
                log::info!("completed {progress:06.2}%");
            }
        }

        report_writer
            .flush()
            .context("failed to flush report stream")?;
        trajectory_writer
            .flush()
            .context("failed to flush trajectory stream")?;

        Ok(())
    }

    /// Compute a population summary and advance the incidence baseline.
    pub fn summary(&mut self, label: &str) -> report::Summary {
        let summary = report::Summary::compute(label, &self.state.population, self.state.baseline);
        self.state.baseline = Some(summary.baseline());
        summary
    }

    /// Save a checkpoint of the entire engine state.
    ///
    /// Can be used to resume the simulation later.
    pub fn save_checkpoint<P: AsRef<Path>>(&self, file: P) -> Result<()> {
        let file = file.as_ref();
        let file = File::create(file).with_context(|| format!("failed to create {file:?}"))?;
        let mut writer = BufWriter::new(file);
        encode::write(&mut writer, &self).context("failed to serialize engine")?;
        Ok(())
    }

    /// Load a previously saved engine checkpoint.
    pub fn load_checkpoint<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file = file.as_ref();
        let file = File::open(file).with_context(|| format!("failed to open {file:?}"))?;
        let mut reader = BufReader::new(file);
        let engine = decode::from_read(&mut reader).context("failed to deserialize engine")?;
        Ok(engine)
    }

    /// One iteration over the whole population.
    ///
    /// Agent order is reshuffled first so that per-agent decisions never
    /// correlate with array position; prevalence is computed once before
    /// any event, so all infection events of a step see the same values.
    fn perform_step(&mut self, matcher: &dyn Matcher) -> Result<()> {
        let mut order: Vec<AgentId> = (0..self.state.population.len()).collect();
        order.shuffle(&mut self.rng);

        let prev = self.state.population.prevalence();

        for id in order {
            if !self.state.population.agent(id).alive {
                continue;
            }
            match self.cfg.model.transmission {
                Transmission::MeanField => {
                    self.simple_infection_event(id, &prev);
                }
                Transmission::PartnerBased => {
                    self.breakup_event(id)
                        .context("failed to perform breakup event")?;
                    self.formation_event(id, matcher)
                        .context("failed to perform formation event")?;
                    self.sex_event(id).context("failed to perform sex event")?;
                }
            }
            self.stage_advance_event(id);
            self.age_event(id);
        }

        Ok(())
    }

    /// Mean-field infection: risk is the product of the agent's force of
    /// infection, partner-forming trait, and opposite-sex prevalence.
    /// A `NaN` prevalence (empty opposite-sex subpopulation) makes the
    /// comparison false and the event a no-op.
    fn simple_infection_event(&mut self, id: AgentId, prev: &Prevalence) {
        let agent = self.state.population.agent(id);
        if agent.hiv_stage != 0 {
            return;
        }
        let risk = agent.traits.force_of_infection
            * agent.traits.partner_forming
            * prev.opposite(agent.sex);
        let u: f64 = self.rng.random();
        if u < risk {
            self.state.population.agent_mut(id).hiv_stage = 1;
        }
    }

    /// Dissolve one partnership with probability `stickiness / n`, so
    /// breakup is more likely the more partners an agent holds. The
    /// least sticky partner is shed first; ties go to the oldest
    /// partnership.
    fn breakup_event(&mut self, id: AgentId) -> Result<()> {
        let agent = self.state.population.agent(id);
        let n_partners = agent.partners.len();
        if n_partners == 0 {
            return Ok(());
        }

        let u: f64 = self.rng.random();
        if u >= agent.traits.stickiness / n_partners as f64 {
            return Ok(());
        }

        let mut victim = agent.partners[0];
        for &partner in &agent.partners[1..] {
            let stickiness = |p: AgentId| self.state.population.agent(p).traits.stickiness;
            if stickiness(partner) < stickiness(victim) {
                victim = partner;
            }
        }

        self.state.population.remove_partnership(id, victim)
    }

    /// Seek a new partner. The complex variant gates a first partnership
    /// on `partner_forming` and an additional one on `concurrency / n`;
    /// the simple variant uses the single `partner_forming / (n + 1)`
    /// threshold.
    fn formation_event(&mut self, id: AgentId, matcher: &dyn Matcher) -> Result<()> {
        let agent = self.state.population.agent(id);
        let n_partners = agent.partners.len();

        let threshold = match self.cfg.model.formation {
            Formation::Simple => agent.traits.partner_forming / (n_partners + 1) as f64,
            Formation::Complex => {
                if n_partners == 0 {
                    agent.traits.partner_forming
                } else {
                    agent.traits.concurrency / n_partners as f64
                }
            }
        };

        let u: f64 = self.rng.random();
        if u < threshold
            && let Some(partner) = matcher.find_partner(id, &self.state.population, &mut self.rng)
        {
            self.state.population.add_partnership(id, partner)?;
        }

        Ok(())
    }

    /// With probability `sexual_drive`, have sex with the partner at
    /// index `min(Geometric(fifs_preference), n - 1)`, biased toward the
    /// earliest-formed partnership. In a serodiscordant contact the
    /// susceptible partner seroconverts with probability equal to their
    /// own force-of-infection trait.
    fn sex_event(&mut self, id: AgentId) -> Result<()> {
        let agent = self.state.population.agent(id);
        let n_partners = agent.partners.len();
        if n_partners == 0 {
            return Ok(());
        }

        let u: f64 = self.rng.random();
        if u >= agent.traits.sexual_drive {
            return Ok(());
        }

        let fifs_dist = Geometric::new(agent.traits.fifs_preference)?;
        let idx = (fifs_dist.sample(&mut self.rng) as usize).min(n_partners - 1);
        let partner_id = agent.partners[idx];

        let partner = self.state.population.agent(partner_id);
        let susceptible = if agent.hiv_stage == 0 && partner.is_infected() {
            id
        } else if partner.hiv_stage == 0 && agent.is_infected() {
            partner_id
        } else {
            return Ok(());
        };

        let risk = self.state.population.agent(susceptible).traits.force_of_infection;
        let u: f64 = self.rng.random();
        if u < risk {
            self.state.population.agent_mut(susceptible).hiv_stage = 1;
        }

        Ok(())
    }

    /// Leave primary infection (stage 1 to 2). Stages 2 through 5 have
    /// no simulated progression; they are reachable only through the
    /// initial geometric draw.
    fn stage_advance_event(&mut self, id: AgentId) {
        if self.state.population.agent(id).hiv_stage != 1 {
            return;
        }
        let u: f64 = self.rng.random();
        if u < self.cfg.infection.leave_acute_infection {
            self.state.population.agent_mut(id).hiv_stage = 2;
        }
    }

    fn age_event(&mut self, id: AgentId) {
        self.state.population.agent_mut(id).age += self.cfg.time.time_step;
    }
}
