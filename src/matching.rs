use crate::config::Matching;
use crate::model::{AgentId, Population};
use rand::prelude::*;

/// Partner matching strategy used by the formation event.
///
/// Kept behind a trait so the sexual-network topology can be changed
/// without touching the event engine.
pub trait Matcher {
    /// Choose a new partner for `agent`, or `None` if no agent is
    /// eligible. Eligible partners are alive, of the opposite sex, and
    /// not already partnered with `agent`.
    fn find_partner(
        &self,
        agent: AgentId,
        population: &Population,
        rng: &mut dyn RngCore,
    ) -> Option<AgentId>;
}

impl Matching {
    pub fn build(self) -> Box<dyn Matcher> {
        match self {
            Matching::Uniform => Box::new(UniformMatcher),
        }
    }
}

/// Uniform choice among all eligible candidates.
pub struct UniformMatcher;

impl Matcher for UniformMatcher {
    fn find_partner(
        &self,
        agent: AgentId,
        population: &Population,
        rng: &mut dyn RngCore,
    ) -> Option<AgentId> {
        let wanted = population.agent(agent).sex.opposite();
        let partners = &population.agent(agent).partners;

        let eligible: Vec<AgentId> = population
            .iter()
            .filter(|cand| cand.alive && cand.sex == wanted && !partners.contains(&cand.id))
            .map(|cand| cand.id)
            .collect();

        eligible.choose(rng).copied()
    }
}
