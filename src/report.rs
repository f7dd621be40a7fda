use crate::model::{InfectedBaseline, N_STAGES, Population, Sex};
use anyhow::Result;
use std::io::Write;

/// Write the column header of the per-timestep report.
pub fn write_header<W: Write>(writer: &mut W) -> Result<()> {
    writeln!(
        writer,
        "date,agents,alive,infected,prevalence,\
         males_alive,males_infected,male_prevalence,\
         females_alive,females_infected,female_prevalence,\
         hiv_neg,hiv_primary,cdc_1,cdc_2,cdc_3,cdc_4"
    )?;
    Ok(())
}

/// Write one report row for the current population.
pub fn write_row<W: Write>(writer: &mut W, date: f64, population: &Population) -> Result<()> {
    let prev = population.prevalence();
    let stages = population.stage_counts();

    write!(
        writer,
        "{date},{},{},{},{},{},{},{},{},{},{}",
        population.len(),
        prev.alive(),
        prev.infected(),
        prev.prevalence(),
        prev.males_alive,
        prev.males_infected,
        prev.male_prevalence(),
        prev.females_alive,
        prev.females_infected,
        prev.female_prevalence(),
    )?;
    for count in stages {
        write!(writer, ",{count}")?;
    }
    writeln!(writer)?;
    Ok(())
}

/// Population summary emitted at the begin and end of a run.
///
/// The second summary of a run also reports incidence: the change in
/// infected counts since the baseline, divided by subpopulation size.
#[derive(Debug)]
pub struct Summary {
    pub label: String,
    pub males: u32,
    pub females: u32,
    pub youngest: f64,
    pub oldest: f64,
    pub mean_age: f64,
    pub stage_counts: [u32; N_STAGES],
    pub males_infected: u32,
    pub females_infected: u32,
    pub incidence_baseline: Option<InfectedBaseline>,
}

impl Summary {
    pub fn compute(
        label: &str,
        population: &Population,
        incidence_baseline: Option<InfectedBaseline>,
    ) -> Self {
        let mut males = 0;
        let mut youngest = f64::INFINITY;
        let mut oldest = f64::NEG_INFINITY;
        let mut age_sum = 0.0;
        for agent in population.iter() {
            if agent.sex == Sex::Male {
                males += 1;
            }
            youngest = youngest.min(agent.age);
            oldest = oldest.max(agent.age);
            age_sum += agent.age;
        }

        let prev = population.prevalence();

        Self {
            label: label.to_string(),
            males,
            females: population.len() as u32 - males,
            youngest,
            oldest,
            mean_age: age_sum / population.len() as f64,
            stage_counts: population.stage_counts(),
            males_infected: prev.males_infected,
            females_infected: prev.females_infected,
            incidence_baseline,
        }
    }

    /// The baseline the next summary should compute incidence against.
    pub fn baseline(&self) -> InfectedBaseline {
        InfectedBaseline {
            males_infected: self.males_infected,
            females_infected: self.females_infected,
        }
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        let prefix = format!("summary,{}", self.label);
        writeln!(writer, "{prefix},males,{}", self.males)?;
        writeln!(writer, "{prefix},females,{}", self.females)?;
        writeln!(writer, "{prefix},youngest,{}", self.youngest)?;
        writeln!(writer, "{prefix},oldest,{}", self.oldest)?;
        writeln!(writer, "{prefix},mean_age,{}", self.mean_age)?;
        for (stage, count) in self.stage_counts.iter().enumerate() {
            writeln!(writer, "{prefix},hiv_{stage},{count}")?;
        }
        writeln!(
            writer,
            "{prefix},male_prevalence,{}",
            self.males_infected as f64 / self.males as f64
        )?;
        writeln!(
            writer,
            "{prefix},female_prevalence,{}",
            self.females_infected as f64 / self.females as f64
        )?;

        if let Some(base) = self.incidence_baseline {
            let new_males = self.males_infected as f64 - base.males_infected as f64;
            let new_females = self.females_infected as f64 - base.females_infected as f64;
            let n_agents = (self.males + self.females) as f64;
            writeln!(
                writer,
                "{prefix},male_incidence,{}",
                new_males / self.males as f64
            )?;
            writeln!(
                writer,
                "{prefix},female_incidence,{}",
                new_females / self.females as f64
            )?;
            writeln!(
                writer,
                "{prefix},incidence,{}",
                (new_males + new_females) / n_agents
            )?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Agent, AgentId, Sex, Traits};

    fn test_agent(id: AgentId, sex: Sex, age: f64, hiv_stage: u8) -> Agent {
        Agent {
            id,
            sex,
            age,
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
            test_agent(0, Sex::Male, 15.0, 0),
            test_agent(1, Sex::Female, 17.0, 1),
            test_agent(2, Sex::Female, 19.0, 0),
            test_agent(3, Sex::Male, 16.0, 3),
        ])
    }

    #[test]
    fn report_rows_match_the_header_width() {
        let pop = test_population();
        let mut header = Vec::new();
        let mut row = Vec::new();
        write_header(&mut header).unwrap();
        write_row(&mut row, 2015.0, &pop).unwrap();

        let header = String::from_utf8(header).unwrap();
        let row = String::from_utf8(row).unwrap();
        assert_eq!(
            header.trim().split(',').count(),
            row.trim().split(',').count()
        );
        assert!(row.starts_with("2015,4,4,2,0.5,2,1,0.5,2,1,0.5,"));
    }

    #[test]
    fn summary_reports_counts_and_ages() {
        let summary = Summary::compute("begin", &test_population(), None);
        assert_eq!(summary.males, 2);
        assert_eq!(summary.females, 2);
        assert_eq!(summary.youngest, 15.0);
        assert_eq!(summary.oldest, 19.0);
        assert_eq!(summary.mean_age, 16.75);
        assert_eq!(summary.stage_counts, [2, 1, 0, 1, 0, 0]);

        let mut out = Vec::new();
        summary.write(&mut out).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("summary,begin,males,2\n"));
        assert!(out.contains("summary,begin,hiv_3,1\n"));
        assert!(!out.contains("incidence"));
    }

    #[test]
    fn second_summary_reports_incidence_against_the_baseline() {
        let begin = Summary::compute("begin", &test_population(), None);

        let mut pop = test_population();
        pop.agent_mut(2).hiv_stage = 1;
        let end = Summary::compute("end", &pop, Some(begin.baseline()));

        let mut out = Vec::new();
        end.write(&mut out).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("summary,end,male_incidence,0\n"));
        assert!(out.contains("summary,end,female_incidence,0.5\n"));
        assert!(out.contains("summary,end,incidence,0.25\n"));
    }
}
