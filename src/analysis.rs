use crate::model::{N_STAGES, State};
use crate::stats::Accumulator;
use anyhow::{Context, Result};
use rmp_serde::decode;
use std::{
    fs::File,
    io::{BufReader, BufWriter},
    path::Path,
};

pub trait Obs {
    fn update(&mut self, state: &State) -> Result<()>;
    fn report(&self) -> serde_json::Value;
}

/// Per-sex HIV prevalence over time.
pub struct SexPrevalence {
    male: Accumulator,
    female: Accumulator,
}

impl SexPrevalence {
    pub fn new() -> Self {
        Self {
            male: Accumulator::new(),
            female: Accumulator::new(),
        }
    }
}

impl Obs for SexPrevalence {
    fn update(&mut self, state: &State) -> Result<()> {
        let prev = state.population.prevalence();
        // An empty sex subpopulation yields NaN; skip it rather than
        // poison the accumulator.
        if prev.male_prevalence().is_finite() {
            self.male.add(prev.male_prevalence());
        }
        if prev.female_prevalence().is_finite() {
            self.female.add(prev.female_prevalence());
        }
        Ok(())
    }

    fn report(&self) -> serde_json::Value {
        serde_json::json!({
            "male_prevalence": self.male.report(),
            "female_prevalence": self.female.report(),
        })
    }
}

/// Fraction of the population in each HIV stage.
pub struct StageOccupancy {
    acc_vec: Vec<Accumulator>,
}

impl StageOccupancy {
    pub fn new() -> Self {
        let mut acc_vec = Vec::new();
        acc_vec.resize_with(N_STAGES, Accumulator::new);
        Self { acc_vec }
    }
}

impl Obs for StageOccupancy {
    fn update(&mut self, state: &State) -> Result<()> {
        let n_agents = state.population.len();
        if n_agents == 0 {
            return Ok(());
        }
        let counts = state.population.stage_counts();
        for (acc, count) in self.acc_vec.iter_mut().zip(counts) {
            acc.add(count as f64 / n_agents as f64);
        }
        Ok(())
    }

    fn report(&self) -> serde_json::Value {
        let reports: Vec<_> = self.acc_vec.iter().map(|acc| acc.report()).collect();
        serde_json::json!({ "stage_occupancy": reports })
    }
}

/// Mean number of concurrent partners per alive agent.
pub struct MeanPartners {
    acc: Accumulator,
}

impl MeanPartners {
    pub fn new() -> Self {
        Self {
            acc: Accumulator::new(),
        }
    }
}

impl Obs for MeanPartners {
    fn update(&mut self, state: &State) -> Result<()> {
        if state.population.is_empty() {
            return Ok(());
        }
        let mut n_alive = 0;
        let mut n_partnerships = 0;
        for agent in state.population.iter() {
            if agent.alive {
                n_alive += 1;
                n_partnerships += agent.partners.len();
            }
        }
        if n_alive > 0 {
            self.acc.add(n_partnerships as f64 / n_alive as f64);
        }
        Ok(())
    }

    fn report(&self) -> serde_json::Value {
        serde_json::json!({ "mean_partners": self.acc.report() })
    }
}

/// Folds trajectory snapshot files through a set of observables and
/// writes the reduced results as JSON.
pub struct Analyzer {
    obs_ptr_vec: Vec<Box<dyn Obs>>,
}

impl Analyzer {
    pub fn new() -> Self {
        let mut obs_ptr_vec: Vec<Box<dyn Obs>> = Vec::new();
        obs_ptr_vec.push(Box::new(SexPrevalence::new()));
        obs_ptr_vec.push(Box::new(StageOccupancy::new()));
        obs_ptr_vec.push(Box::new(MeanPartners::new()));
        Self { obs_ptr_vec }
    }

    pub fn add_file<P: AsRef<Path>>(&mut self, file: P) -> Result<()> {
        let file = file.as_ref();
        let file = File::open(file).with_context(|| format!("failed to open {file:?}"))?;
        let mut reader = BufReader::new(file);

        loop {
            let state: State = match decode::from_read(&mut reader) {
                Ok(state) => state,
                Err(decode::Error::InvalidMarkerRead(err))
                    if err.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break;
                }
                Err(err) => return Err(err).context("failed to read state"),
            };
            for obs in &mut self.obs_ptr_vec {
                obs.update(&state).context("failed to update observable")?;
            }
        }
        Ok(())
    }

    pub fn save_results<P: AsRef<Path>>(&self, file: P) -> Result<()> {
        let file = file.as_ref();
        let file = File::create(file).with_context(|| format!("failed to create {file:?}"))?;
        let writer = BufWriter::new(file);

        let reports: Vec<_> = self.obs_ptr_vec.iter().map(|obs| obs.report()).collect();
        serde_json::to_writer_pretty(writer, &reports)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Agent, AgentId, Population, Sex, Traits};

    fn test_agent(id: AgentId, sex: Sex, hiv_stage: u8) -> Agent {
        Agent {
            id,
            sex,
            age: 18.0,
            hiv_stage,
            alive: true,
            partners: Vec::new(),
            traits: Traits {
                stickiness: 0.5,
                partner_forming: 0.5,
                concurrency: 0.5,
                sexual_drive: 0.5,
                fifs_preference: 0.5,
                force_of_infection: 0.5,
            },
        }
    }

    fn test_state() -> State {
        let mut pop = Population::new(vec![
            test_agent(0, Sex::Male, 1),
            test_agent(1, Sex::Female, 0),
            test_agent(2, Sex::Female, 0),
            test_agent(3, Sex::Male, 0),
        ]);
        pop.add_partnership(0, 1).unwrap();
        State {
            step: 0,
            population: pop,
            baseline: None,
        }
    }

    #[test]
    fn sex_prevalence_tracks_both_sexes() {
        let mut obs = SexPrevalence::new();
        obs.update(&test_state()).unwrap();
        let report = obs.report();
        assert_eq!(report["male_prevalence"]["mean"], 0.5);
        assert_eq!(report["female_prevalence"]["mean"], 0.0);
    }

    #[test]
    fn stage_occupancy_fractions_sum_to_one() {
        let mut obs = StageOccupancy::new();
        obs.update(&test_state()).unwrap();
        let report = obs.report();
        let total: f64 = report["stage_occupancy"]
            .as_array()
            .unwrap()
            .iter()
            .map(|rep| rep["mean"].as_f64().unwrap())
            .sum();
        assert!((total - 1.0).abs() < 1e-12);
    }

    #[test]
    fn mean_partners_counts_both_sides_of_a_partnership() {
        let mut obs = MeanPartners::new();
        obs.update(&test_state()).unwrap();
        let report = obs.report();
        assert_eq!(report["mean_partners"]["mean"], 0.5);
    }
}
