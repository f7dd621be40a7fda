use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::{fmt::Debug, fs, ops::RangeBounds, path::Path};

/// Simulation configuration parameters.
///
/// Loaded from a TOML file and validated before use. A missing key is a
/// deserialization error and aborts before the simulation starts.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Seed for the random stream. Two runs with the same configuration
    /// and the same seed produce byte-identical reports; omit for a
    /// seed drawn from the OS.
    pub seed: Option<u64>,

    pub time: TimeConfig,
    pub population: PopulationConfig,
    pub behavior: BehaviorConfig,
    pub infection: InfectionConfig,
    pub model: ModelConfig,
    pub output: OutputConfig,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct TimeConfig {
    /// Total simulated time in years; zero means zero iterations.
    pub num_years: f64,
    /// Timestep in years.
    pub time_step: f64,
    /// Calendar date of the first report row.
    pub start_date: f64,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct PopulationConfig {
    pub n_agents: usize,
    /// Initial age is drawn from `Uniform(min_age, max_age)`.
    pub min_age: f64,
    pub max_age: f64,
    /// Geometric parameter of the initial HIV stage distribution,
    /// clamped to stage 5; also the expected uninfected fraction.
    pub prob_hiv_neg: f64,
}

/// Mean event intervals (in years) translated into per-timestep latent
/// traits by the sampler.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct BehaviorConfig {
    pub mean_time_until_partner: f64,
    pub mean_partnership_time: f64,
    pub mean_time_concurrent: f64,
    pub mean_time_sex: f64,
    pub preference_fifs: f64,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct InfectionConfig {
    pub mean_risk_het_male_sex: f64,
    pub mean_risk_het_female_sex: f64,
    /// Per-step probability of leaving primary infection (stage 1 to 2).
    pub leave_acute_infection: f64,
}

/// Which of the documented event pathways the driver runs.
#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Transmission {
    /// Population-prevalence infection event only (the original loop).
    MeanField,
    /// Breakup, formation, and partner-specific sexual contact.
    PartnerBased,
}

/// Partnership formation rule variants.
#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Formation {
    /// Single threshold `partner_forming / (n_partners + 1)`.
    Simple,
    /// `partner_forming` for a first partner, `concurrency / n_partners`
    /// for an additional one.
    Complex,
}

/// Partner matching policy.
#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Matching {
    /// Uniform choice among alive opposite-sex non-partners.
    Uniform,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub transmission: Transmission,
    pub formation: Formation,
    pub matching: Matching,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Number of steps between trajectory snapshots.
    pub steps_per_save: usize,
}

impl Config {
    /// Load a [`Config`] from a TOML file and validate all parameters.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or deserialized, or
    /// if any configuration value is out of range.
    pub fn from_file<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file = file.as_ref();
        let contents =
            fs::read_to_string(file).with_context(|| format!("failed to read {file:?}"))?;

        let config: Config = toml::from_str(&contents).context("failed to deserialize config")?;

        config.validate().context("failed to validate config")?;

        Ok(config)
    }

    /// Number of iterations of the driver loop.
    pub fn num_iterations(&self) -> usize {
        (self.time.num_years / self.time.time_step) as usize
    }

    fn validate(&self) -> Result<()> {
        check_num(self.time.num_years, 0.0..1000.0).context("invalid number of years")?;
        check_num(self.time.time_step, 1e-6..1.0).context("invalid time step")?;

        check_num(self.population.n_agents, 1..1_000_000).context("invalid number of agents")?;
        check_num(self.population.min_age, 0.0..120.0).context("invalid minimum age")?;
        check_num(self.population.max_age, 0.0..120.0).context("invalid maximum age")?;
        // Initial ages are drawn from Uniform(min_age, max_age), which
        // needs a non-empty interval.
        if self.population.max_age <= self.population.min_age {
            bail!(
                "maximum age {} does not exceed minimum age {}",
                self.population.max_age,
                self.population.min_age
            );
        }
        check_num(self.population.prob_hiv_neg, 1e-3..=1.0)
            .context("invalid uninfected probability")?;

        // The Beta derivations need strictly positive second shape
        // parameters, so mean intervals must be positive and the mean
        // probabilities strictly below 1.
        check_num(self.behavior.mean_time_until_partner, 1e-6..1000.0)
            .context("invalid mean time until partner")?;
        check_num(self.behavior.mean_partnership_time, 1e-6..1000.0)
            .context("invalid mean partnership time")?;
        check_num(self.behavior.mean_time_concurrent, 1e-6..1000.0)
            .context("invalid mean time concurrent")?;
        check_num(self.behavior.mean_time_sex, 1e-6..1000.0).context("invalid mean time sex")?;
        check_num(self.behavior.preference_fifs, 1e-3..1.0).context("invalid fifs preference")?;

        check_num(self.infection.mean_risk_het_male_sex, 1e-9..1.0)
            .context("invalid male risk per sexual contact")?;
        check_num(self.infection.mean_risk_het_female_sex, 1e-9..1.0)
            .context("invalid female risk per sexual contact")?;
        check_num(self.infection.leave_acute_infection, 0.0..=1.0)
            .context("invalid probability of leaving acute infection")?;

        check_num(self.output.steps_per_save, 1..10_000)
            .context("invalid number of steps per save")?;

        Ok(())
    }
}

fn check_num<T, R>(num: T, range: R) -> Result<()>
where
    T: PartialOrd + Debug,
    R: RangeBounds<T> + Debug,
{
    if !range.contains(&num) {
        bail!("number must be in the range {range:?}, but is {num:?}");
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn example_toml() -> String {
    String::new()
        + "seed = 23\n"
        + "\n"
        + "[time]\n"
        + "num_years = 2.0\n"
        + "time_step = 0.00273785\n"
        + "start_date = 2015.0\n"
        + "\n"
        + "[population]\n"
        + "n_agents = 10000\n"
        + "min_age = 15.0\n"
        + "max_age = 20.0\n"
        + "prob_hiv_neg = 0.9\n"
        + "\n"
        + "[behavior]\n"
        + "mean_time_until_partner = 0.25\n"
        + "mean_partnership_time = 0.25\n"
        + "mean_time_concurrent = 1.0\n"
        + "mean_time_sex = 0.00273785\n"
        + "preference_fifs = 0.5\n"
        + "\n"
        + "[infection]\n"
        + "mean_risk_het_male_sex = 0.01\n"
        + "mean_risk_het_female_sex = 0.02\n"
        + "leave_acute_infection = 0.0238095238\n"
        + "\n"
        + "[model]\n"
        + "transmission = \"mean-field\"\n"
        + "formation = \"complex\"\n"
        + "matching = \"uniform\"\n"
        + "\n"
        + "[output]\n"
        + "steps_per_save = 64\n"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn example_config_parses_and_validates() {
        let cfg: Config = toml::from_str(&example_toml()).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.seed, Some(23));
        assert_eq!(cfg.model.transmission, Transmission::MeanField);
        assert_eq!(cfg.num_iterations(), 730);
    }

    #[test]
    fn missing_key_is_fatal() {
        let toml_str = example_toml().replace("num_years = 2.0\n", "");
        assert!(toml_str.parse::<toml::Table>().is_ok());
        assert!(toml::from_str::<Config>(&toml_str).is_err());
    }

    #[test]
    fn out_of_range_parameter_is_rejected() {
        let toml_str = example_toml().replace("preference_fifs = 0.5", "preference_fifs = 1.0");
        let cfg: Config = toml::from_str(&toml_str).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn degenerate_age_range_is_rejected() {
        let toml_str = example_toml().replace("max_age = 20.0", "max_age = 15.0");
        let cfg: Config = toml::from_str(&toml_str).unwrap();
        let error = cfg.validate().unwrap_err();
        assert!(error.to_string().contains("maximum age"));
    }

    #[test]
    fn zero_years_means_zero_iterations() {
        let toml_str = example_toml().replace("num_years = 2.0", "num_years = 0.0");
        let cfg: Config = toml::from_str(&toml_str).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.num_iterations(), 0);
    }
}
