use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Index into the [`Population`] arena.
///
/// Partner lists hold these indices rather than references, so the
/// population remains the sole owner of every agent.
pub type AgentId = usize;

/// Number of HIV stages: 0 = uninfected, 1 = primary infection,
/// 2..=5 = CDC stages 1 through 4.
pub const N_STAGES: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sex {
    Male,
    Female,
}

impl Sex {
    pub fn opposite(self) -> Sex {
        match self {
            Sex::Male => Sex::Female,
            Sex::Female => Sex::Male,
        }
    }
}

/// Latent behavioral traits, each in [0,1], fixed at agent creation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Traits {
    /// Resistance to partnership dissolution.
    pub stickiness: f64,
    /// Propensity to seek a first partnership.
    pub partner_forming: f64,
    /// Propensity to seek an additional partnership while partnered.
    pub concurrency: f64,
    /// Propensity to have sex on a given day.
    pub sexual_drive: f64,
    /// Bias toward the earliest-formed partner ("first in, first sex").
    pub fifs_preference: f64,
    /// Per-contact susceptibility, sex-differentiated at sampling time.
    pub force_of_infection: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub sex: Sex,
    pub age: f64,
    /// Current HIV stage, in `0..N_STAGES`. Non-decreasing after creation.
    pub hiv_stage: u8,
    pub alive: bool,
    /// Current partners, oldest partnership first.
    pub partners: Vec<AgentId>,
    pub traits: Traits,
}

impl Agent {
    pub fn is_infected(&self) -> bool {
        self.hiv_stage > 0
    }
}

/// Per-sex alive and infected counts for a single timestep.
///
/// Prevalence is computed in `f64`, so an empty sex subpopulation yields
/// `NaN` rather than a crash; every downstream `u < prevalence`-style
/// comparison is then false and the step proceeds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Prevalence {
    pub males_alive: u32,
    pub males_infected: u32,
    pub females_alive: u32,
    pub females_infected: u32,
}

impl Prevalence {
    pub fn male_prevalence(&self) -> f64 {
        self.males_infected as f64 / self.males_alive as f64
    }

    pub fn female_prevalence(&self) -> f64 {
        self.females_infected as f64 / self.females_alive as f64
    }

    pub fn alive(&self) -> u32 {
        self.males_alive + self.females_alive
    }

    pub fn infected(&self) -> u32 {
        self.males_infected + self.females_infected
    }

    pub fn prevalence(&self) -> f64 {
        self.infected() as f64 / self.alive() as f64
    }

    /// Prevalence of the sex opposite to `sex`, the transmission-force
    /// input of the mean-field infection event.
    pub fn opposite(&self, sex: Sex) -> f64 {
        match sex {
            Sex::Male => self.female_prevalence(),
            Sex::Female => self.male_prevalence(),
        }
    }
}

/// The agent arena. Owns every agent; all partnership mutation goes
/// through [`Population::add_partnership`] and
/// [`Population::remove_partnership`] so that the symmetric invariant
/// (B in A.partners iff A in B.partners) holds at every observation
/// point between events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Population {
    agents: Vec<Agent>,
}

impl Population {
    pub fn new(agents: Vec<Agent>) -> Self {
        Self { agents }
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn agent(&self, id: AgentId) -> &Agent {
        &self.agents[id]
    }

    pub fn agent_mut(&mut self, id: AgentId) -> &mut Agent {
        &mut self.agents[id]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Agent> {
        self.agents.iter()
    }

    /// Record a new partnership between `a` and `b`, appended at the
    /// back of both partner lists (formation order, oldest first).
    pub fn add_partnership(&mut self, a: AgentId, b: AgentId) -> Result<()> {
        if a == b {
            bail!("agent {a} cannot partner with itself");
        }
        if self.agents[a].partners.contains(&b) {
            bail!("agents {a} and {b} are already partners");
        }
        self.agents[a].partners.push(b);
        self.agents[b].partners.push(a);
        Ok(())
    }

    /// Dissolve the partnership between `a` and `b`, removing each from
    /// the other's partner list.
    pub fn remove_partnership(&mut self, a: AgentId, b: AgentId) -> Result<()> {
        if !self.agents[a].partners.contains(&b) {
            bail!("agents {a} and {b} are not partners");
        }
        self.agents[a].partners.retain(|&id| id != b);
        self.agents[b].partners.retain(|&id| id != a);
        Ok(())
    }

    /// Count alive and infected agents by sex.
    pub fn prevalence(&self) -> Prevalence {
        let mut prev = Prevalence {
            males_alive: 0,
            males_infected: 0,
            females_alive: 0,
            females_infected: 0,
        };
        for agent in &self.agents {
            if !agent.alive {
                continue;
            }
            match agent.sex {
                Sex::Male => {
                    prev.males_alive += 1;
                    if agent.is_infected() {
                        prev.males_infected += 1;
                    }
                }
                Sex::Female => {
                    prev.females_alive += 1;
                    if agent.is_infected() {
                        prev.females_infected += 1;
                    }
                }
            }
        }
        prev
    }

    /// Count agents in each HIV stage bucket.
    pub fn stage_counts(&self) -> [u32; N_STAGES] {
        let mut counts = [0; N_STAGES];
        for agent in &self.agents {
            counts[agent.hiv_stage as usize] += 1;
        }
        counts
    }
}

/// Infected counts recorded by the last summary, the baseline against
/// which the next summary reports incidence.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct InfectedBaseline {
    pub males_infected: u32,
    pub females_infected: u32,
}

/// State of the simulation at a given step.
///
/// Written periodically to trajectory files and carried whole inside
/// engine checkpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    /// Number of completed iterations.
    pub step: usize,

    pub population: Population,

    pub baseline: Option<InfectedBaseline>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_agent(id: AgentId, sex: Sex, hiv_stage: u8) -> Agent {
        Agent {
            id,
            sex,
            age: 17.0,
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

    fn test_population() -> Population {
        Population::new(vec![
            test_agent(0, Sex::Male, 0),
            test_agent(1, Sex::Female, 1),
            test_agent(2, Sex::Female, 0),
        ])
    }

    #[test]
    fn partnerships_are_symmetric() {
        let mut pop = test_population();

        pop.add_partnership(0, 1).unwrap();
        pop.add_partnership(0, 2).unwrap();
        assert_eq!(pop.agent(0).partners, vec![1, 2]);
        assert_eq!(pop.agent(1).partners, vec![0]);
        assert_eq!(pop.agent(2).partners, vec![0]);

        pop.remove_partnership(0, 1).unwrap();
        assert_eq!(pop.agent(0).partners, vec![2]);
        assert!(pop.agent(1).partners.is_empty());
    }

    #[test]
    fn self_and_duplicate_partnerships_are_rejected() {
        let mut pop = test_population();
        assert!(pop.add_partnership(0, 0).is_err());

        pop.add_partnership(0, 1).unwrap();
        assert!(pop.add_partnership(1, 0).is_err());
        assert!(pop.remove_partnership(1, 2).is_err());
    }

    #[test]
    fn prevalence_counts_by_sex() {
        let prev = test_population().prevalence();
        assert_eq!(prev.males_alive, 1);
        assert_eq!(prev.males_infected, 0);
        assert_eq!(prev.females_alive, 2);
        assert_eq!(prev.females_infected, 1);
        assert_eq!(prev.male_prevalence(), 0.0);
        assert_eq!(prev.female_prevalence(), 0.5);
        assert_eq!(prev.prevalence(), 1.0 / 3.0);
        assert_eq!(prev.opposite(Sex::Male), 0.5);
    }

    #[test]
    fn empty_sex_prevalence_is_nan_not_a_crash() {
        let pop = Population::new(vec![test_agent(0, Sex::Female, 1)]);
        let prev = pop.prevalence();
        assert!(prev.male_prevalence().is_nan());
        assert_eq!(prev.female_prevalence(), 1.0);
    }

    #[test]
    fn stage_counts_cover_all_buckets() {
        let pop = Population::new(vec![
            test_agent(0, Sex::Male, 0),
            test_agent(1, Sex::Male, 5),
            test_agent(2, Sex::Female, 5),
        ]);
        assert_eq!(pop.stage_counts(), [1, 0, 0, 0, 0, 2]);
    }
}
