use crate::{parameters::Parameters, Tick};
use serde::{Deserialize, Serialize};

/// The disease stage of an agent. Progression is strictly
/// `Susceptible -> Exposed -> Infected -> {Recovered | Deceased}`; the last two are terminal.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub enum Stage {
    Susceptible,
    Exposed,
    Infected,
    Recovered,
    Deceased,
}

impl Stage {
    pub const COUNT: usize = 5;

    pub const ALL: [Stage; Stage::COUNT] = [
        Stage::Susceptible,
        Stage::Exposed,
        Stage::Infected,
        Stage::Recovered,
        Stage::Deceased,
    ];

    /// Position of the stage in per-stage tables.
    #[must_use]
    #[inline]
    pub fn index(self) -> usize {
        match self {
            Stage::Susceptible => 0,
            Stage::Exposed => 1,
            Stage::Infected => 2,
            Stage::Recovered => 3,
            Stage::Deceased => 4,
        }
    }

    /// Agents in these stages send infection pressure to their neighbors.
    #[must_use]
    #[inline]
    pub fn is_infectious(self) -> bool {
        matches!(self, Stage::Exposed | Stage::Infected)
    }

    #[must_use]
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Recovered | Stage::Deceased)
    }
}

/// One agent's stage together with its timing bookkeeping. Times that do not apply hold the
/// run's "never" sentinel.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct DiseaseState {
    pub stage: Stage,
    pub onset: Tick,
    pub next_transition: Tick,
}

impl DiseaseState {
    #[must_use]
    pub fn susceptible(never: Tick) -> Self {
        DiseaseState {
            stage: Stage::Susceptible,
            onset: never,
            next_transition: never,
        }
    }
}

/// The stage change an agent underwent during a tick.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Transition {
    Unchanged,
    Exposed,
    Infected,
    Recovered,
    Deceased,
}

/// The timing constants the state machine needs, copied out of [`Parameters`].
#[derive(Copy, Clone, Debug)]
pub struct TransitionTimings {
    pub exposed_to_infected_delay: Tick,
    pub infected_to_recovered_delay: Tick,
    pub never: Tick,
}

impl From<&Parameters> for TransitionTimings {
    fn from(parameters: &Parameters) -> Self {
        TransitionTimings {
            exposed_to_infected_delay: parameters.exposed_to_infected_delay,
            infected_to_recovered_delay: parameters.infected_to_recovered_delay,
            never: parameters.never(),
        }
    }
}

/// Computes an agent's state for the end of `tick` from its tick-start `current` state.
///
/// `exposed_today` may only be set for agents that were susceptible at the start of the tick.
/// `mortality_draw` is called exactly once, and only when an infected agent reaches its
/// transition time; it returns `true` if the agent dies.
pub fn next_state(
    current: DiseaseState,
    tick: Tick,
    exposed_today: bool,
    timings: &TransitionTimings,
    mortality_draw: impl FnOnce() -> bool,
) -> (DiseaseState, Transition) {
    assert!(
        !exposed_today || current.stage == Stage::Susceptible,
        "agent in stage {:?} marked as exposed",
        current.stage
    );

    match current.stage {
        Stage::Susceptible if exposed_today => (
            DiseaseState {
                stage: Stage::Exposed,
                onset: tick,
                next_transition: tick + 1 + timings.exposed_to_infected_delay,
            },
            Transition::Exposed,
        ),

        Stage::Exposed if tick >= current.next_transition => (
            DiseaseState {
                stage: Stage::Infected,
                onset: current.onset,
                next_transition: tick + timings.infected_to_recovered_delay,
            },
            Transition::Infected,
        ),

        Stage::Infected if tick >= current.next_transition => {
            let (stage, transition) = if mortality_draw() {
                (Stage::Deceased, Transition::Deceased)
            } else {
                (Stage::Recovered, Transition::Recovered)
            };
            (
                DiseaseState {
                    stage,
                    onset: current.onset,
                    next_transition: timings.never,
                },
                transition,
            )
        }

        _ => (current, Transition::Unchanged),
    }
}
