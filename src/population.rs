/*!

Per-agent state.

Age groups and mean interaction counts are fixed at initialization. The mutable part, each
agent's stage, onset and next-transition time, is held as one [`PopulationSnapshot`] that is
only ever replaced whole, once per tick, by the stepper.

*/

use crate::{
    context::{Context, DataPlugin},
    define_rng,
    disease::{DiseaseState, Stage},
    error::EpiError,
    log::{info, trace},
    parameters::{shared_parameters, AgeGroup, Parameters},
    random::ContextRandomExt,
    AgentId, Tick,
};
use serde::{Deserialize, Serialize};
use std::{fs::File, io, path::Path};

define_rng!(InitialInfectionRng);

/// Stage and timing for every agent at one instant, stored as parallel columns.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PopulationSnapshot {
    stages: Vec<Stage>,
    onsets: Vec<Tick>,
    next_transitions: Vec<Tick>,
}

impl PopulationSnapshot {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        PopulationSnapshot {
            stages: Vec::with_capacity(capacity),
            onsets: Vec::with_capacity(capacity),
            next_transitions: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, state: DiseaseState) {
        self.stages.push(state.stage);
        self.onsets.push(state.onset);
        self.next_transitions.push(state.next_transition);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    #[must_use]
    #[inline]
    pub fn state(&self, agent: AgentId) -> DiseaseState {
        DiseaseState {
            stage: self.stages[agent.0],
            onset: self.onsets[agent.0],
            next_transition: self.next_transitions[agent.0],
        }
    }

    #[must_use]
    #[inline]
    pub fn stage(&self, agent: AgentId) -> Stage {
        self.stages[agent.0]
    }

    #[must_use]
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    #[must_use]
    pub fn onsets(&self) -> &[Tick] {
        &self.onsets
    }

    #[must_use]
    pub fn next_transitions(&self) -> &[Tick] {
        &self.next_transitions
    }

    #[must_use]
    pub fn counts(&self) -> StageCounts {
        StageCounts::from_stages(self.stages.iter().copied())
    }
}

/// The per-agent inputs to the transmission computation, derived from a snapshot.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct AgentFeatures {
    pub age_group: AgeGroup,
    pub stage: Stage,
    pub ever_infected: bool,
    pub onset: Tick,
    pub mean_interactions: f64,
}

/// Number of agents in each stage.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StageCounts {
    pub susceptible: usize,
    pub exposed: usize,
    pub infected: usize,
    pub recovered: usize,
    pub deceased: usize,
}

impl StageCounts {
    pub fn from_stages(stages: impl IntoIterator<Item = Stage>) -> Self {
        let mut counts = StageCounts::default();
        for stage in stages {
            match stage {
                Stage::Susceptible => counts.susceptible += 1,
                Stage::Exposed => counts.exposed += 1,
                Stage::Infected => counts.infected += 1,
                Stage::Recovered => counts.recovered += 1,
                Stage::Deceased => counts.deceased += 1,
            }
        }
        counts
    }

    #[must_use]
    pub fn get(&self, stage: Stage) -> usize {
        match stage {
            Stage::Susceptible => self.susceptible,
            Stage::Exposed => self.exposed,
            Stage::Infected => self.infected,
            Stage::Recovered => self.recovered,
            Stage::Deceased => self.deceased,
        }
    }

    #[must_use]
    pub fn total(&self) -> usize {
        Stage::ALL.iter().map(|&stage| self.get(stage)).sum()
    }
}

pub(crate) struct PopulationData {
    pub(crate) age_groups: Vec<AgeGroup>,
    pub(crate) mean_interactions: Vec<f64>,
    /// `None` until the population is initialized.
    pub(crate) current: Option<PopulationSnapshot>,
    pub(crate) cumulative_deaths: u64,
    /// The last tick committed, `0` right after initialization.
    pub(crate) last_tick: Tick,
}

impl DataPlugin for PopulationData {
    const new: &'static dyn Fn() -> Self = &|| PopulationData {
        age_groups: Vec::new(),
        mean_interactions: Vec::new(),
        current: None,
        cumulative_deaths: 0,
        last_tick: 0,
    };
}

impl PopulationData {
    fn snapshot(&self) -> &PopulationSnapshot {
        self.current
            .as_ref()
            .unwrap_or_else(|| panic!("population has not been initialized"))
    }

    /// Derives the transmission inputs for every agent from `snapshot`.
    pub(crate) fn features(&self, snapshot: &PopulationSnapshot) -> Vec<AgentFeatures> {
        (0..snapshot.len())
            .map(|index| {
                let stage = snapshot.stages[index];
                AgentFeatures {
                    age_group: self.age_groups[index],
                    stage,
                    ever_infected: stage != Stage::Susceptible,
                    onset: snapshot.onsets[index],
                    mean_interactions: self.mean_interactions[index],
                }
            })
            .collect()
    }

    /// Replaces the current snapshot with the result of `tick`.
    pub(crate) fn commit(&mut self, next: PopulationSnapshot, tick: Tick, new_deaths: u64) {
        assert_eq!(next.len(), self.age_groups.len(), "committed snapshot has the wrong size");
        self.current = Some(next);
        self.cumulative_deaths += new_deaths;
        self.last_tick = tick;
    }
}

fn check_age_groups(parameters: &Parameters, age_groups: &[AgeGroup]) -> Result<(), EpiError> {
    if age_groups.len() != parameters.agent_count {
        return Err(EpiError::ConfigError(format!(
            "{} age groups supplied for {} agents",
            age_groups.len(),
            parameters.agent_count
        )));
    }
    if let Some((agent, age_group)) = age_groups
        .iter()
        .enumerate()
        .find(|(_, age_group)| age_group.index() >= parameters.age_group_count())
    {
        return Err(EpiError::ConfigError(format!(
            "agent {agent} has age group {} but susceptibility covers {} age groups",
            age_group.0,
            parameters.age_group_count()
        )));
    }
    Ok(())
}

fn check_seeded_state(parameters: &Parameters, agent: usize, state: DiseaseState) -> Result<(), EpiError> {
    let never = parameters.never();
    let earliest_onset = parameters.initial_infection_onset().min(0);
    let problem = match state.stage {
        Stage::Susceptible if state.onset != never || state.next_transition != never => {
            Some("a susceptible agent must have onset and next transition set to never")
        }
        Stage::Exposed | Stage::Infected | Stage::Recovered | Stage::Deceased
            if !(earliest_onset..=0).contains(&state.onset) =>
        {
            Some("an agent that has been infected must have an onset at or before tick 0")
        }
        Stage::Exposed | Stage::Infected if state.next_transition > never => {
            Some("next transition is after the never sentinel")
        }
        Stage::Recovered | Stage::Deceased if state.next_transition != never => {
            Some("a terminal agent must have next transition set to never")
        }
        _ => None,
    };

    match problem {
        Some(problem) => Err(EpiError::ConfigError(format!("agent {agent} in {:?}: {problem}", state.stage))),
        None => Ok(()),
    }
}

pub trait ContextPopulationExt {
    /// Creates one agent per entry of `age_groups`. Each agent starts infected with probability
    /// `initial_infection_rate`, otherwise susceptible.
    fn initialize_population(&mut self, age_groups: &[AgeGroup]) -> Result<(), EpiError>;

    /// Creates the population with explicitly given starting states, e.g. to resume from a
    /// known configuration. Onsets must lie at or before tick `0`.
    fn initialize_population_from_states(
        &mut self,
        age_groups: &[AgeGroup],
        states: &[DiseaseState],
    ) -> Result<(), EpiError>;

    fn is_population_initialized(&self) -> bool;
    fn get_population_size(&self) -> usize;

    fn get_stage(&self, agent: AgentId) -> Stage;
    fn get_onset(&self, agent: AgentId) -> Tick;
    fn get_next_transition(&self, agent: AgentId) -> Tick;
    fn get_age_group(&self, agent: AgentId) -> AgeGroup;
    fn get_mean_interactions(&self, agent: AgentId) -> f64;

    /// The stage of every agent, indexed by agent.
    fn stage_vector(&self) -> Vec<Stage>;
    fn stage_counts(&self) -> StageCounts;
    fn cumulative_deaths(&self) -> u64;

    /// A copy of the current snapshot.
    fn population_snapshot(&self) -> PopulationSnapshot;
}

impl ContextPopulationExt for Context {
    fn initialize_population(&mut self, age_groups: &[AgeGroup]) -> Result<(), EpiError> {
        let parameters = shared_parameters(self)?;
        check_age_groups(&parameters, age_groups)?;
        if self.is_population_initialized() {
            return Err(EpiError::StateError("population has already been initialized".to_string()));
        }

        trace!("initializing {} agents", age_groups.len());
        let never = parameters.never();
        let mut states = Vec::with_capacity(age_groups.len());
        for _ in age_groups {
            let infected = self.sample_bernoulli::<InitialInfectionRng>(parameters.initial_infection_rate);
            states.push(if infected {
                DiseaseState {
                    stage: Stage::Infected,
                    onset: parameters.initial_infection_onset(),
                    next_transition: parameters.infected_to_recovered_delay + 1,
                }
            } else {
                DiseaseState::susceptible(never)
            });
        }

        install_population(self, &parameters, age_groups, &states);
        Ok(())
    }

    fn initialize_population_from_states(
        &mut self,
        age_groups: &[AgeGroup],
        states: &[DiseaseState],
    ) -> Result<(), EpiError> {
        let parameters = shared_parameters(self)?;
        check_age_groups(&parameters, age_groups)?;
        if states.len() != age_groups.len() {
            return Err(EpiError::ConfigError(format!(
                "{} states supplied for {} agents",
                states.len(),
                age_groups.len()
            )));
        }
        for (agent, &state) in states.iter().enumerate() {
            check_seeded_state(&parameters, agent, state)?;
        }
        if self.is_population_initialized() {
            return Err(EpiError::StateError("population has already been initialized".to_string()));
        }

        install_population(self, &parameters, age_groups, states);
        Ok(())
    }

    fn is_population_initialized(&self) -> bool {
        self.get_data_container::<PopulationData>()
            .is_some_and(|data| data.current.is_some())
    }

    fn get_population_size(&self) -> usize {
        match self.get_data_container::<PopulationData>() {
            None => 0,
            Some(data) => data.age_groups.len(),
        }
    }

    fn get_stage(&self, agent: AgentId) -> Stage {
        population_data(self).snapshot().stage(agent)
    }

    fn get_onset(&self, agent: AgentId) -> Tick {
        population_data(self).snapshot().onsets[agent.0]
    }

    fn get_next_transition(&self, agent: AgentId) -> Tick {
        population_data(self).snapshot().next_transitions[agent.0]
    }

    fn get_age_group(&self, agent: AgentId) -> AgeGroup {
        population_data(self).age_groups[agent.0]
    }

    fn get_mean_interactions(&self, agent: AgentId) -> f64 {
        population_data(self).mean_interactions[agent.0]
    }

    fn stage_vector(&self) -> Vec<Stage> {
        population_data(self).snapshot().stages.clone()
    }

    fn stage_counts(&self) -> StageCounts {
        population_data(self).snapshot().counts()
    }

    fn cumulative_deaths(&self) -> u64 {
        self.get_data_container::<PopulationData>()
            .map_or(0, |data| data.cumulative_deaths)
    }

    fn population_snapshot(&self) -> PopulationSnapshot {
        population_data(self).snapshot().clone()
    }
}

fn install_population(context: &mut Context, parameters: &Parameters, age_groups: &[AgeGroup], states: &[DiseaseState]) {
    let mut snapshot = PopulationSnapshot::with_capacity(states.len());
    for &state in states {
        snapshot.push(state);
    }
    let counts = snapshot.counts();

    let data = context.get_data_container_mut::<PopulationData>();
    data.age_groups = age_groups.to_vec();
    data.mean_interactions = age_groups
        .iter()
        .map(|&age_group| parameters.mean_interactions.mean_interactions(age_group))
        .collect();
    data.current = Some(snapshot);
    data.cumulative_deaths = 0;
    data.last_tick = 0;

    info!(
        "population initialized: {} agents, {} infected, {} susceptible",
        counts.total(),
        counts.infected,
        counts.susceptible
    );
}

/// Panics if the population has not been initialized.
pub(crate) fn population_data(context: &Context) -> &PopulationData {
    context
        .get_data_container::<PopulationData>()
        .filter(|data| data.current.is_some())
        .unwrap_or_else(|| panic!("population has not been initialized"))
}

#[derive(Debug, Deserialize)]
struct PopulationRecord {
    age_group: AgeGroup,
}

/// Reads per-agent age groups from CSV with a header row containing an `age_group` column.
/// Agents are numbered in file order; other columns are ignored.
pub fn read_age_groups<R: io::Read>(reader: R) -> Result<Vec<AgeGroup>, EpiError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut age_groups = Vec::new();
    for result in csv_reader.deserialize() {
        let record: PopulationRecord = result?;
        age_groups.push(record.age_group);
    }
    Ok(age_groups)
}

pub fn load_age_groups_csv(path: impl AsRef<Path>) -> Result<Vec<AgeGroup>, EpiError> {
    let path = path.as_ref();
    trace!("loading age groups from {}", path.display());
    read_age_groups(File::open(path)?)
}
