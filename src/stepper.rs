/*!

The tick loop.

Each call to [`ContextStepperExt::advance_tick`] is one read phase followed by one write phase:

1. copy the tick-start snapshot;
2. derive the per-agent feature view from it;
3. aggregate hazards and draw exposures;
4. run every agent's state machine against the snapshot;
5. commit the new snapshot in one step;
6. add the tick's deaths to the cumulative count.

No agent's decision for a tick can observe another agent's result for the same tick, because
steps 3 and 4 read only the copy taken in step 1.

*/

use crate::{
    contact_graph::shared_contact_graph,
    context::Context,
    define_rng,
    disease::{next_state, Transition, TransitionTimings},
    error::EpiError,
    kernel::shared_kernel,
    log::{debug, info},
    parameters::shared_parameters,
    population::{population_data, ContextPopulationExt, PopulationData, PopulationSnapshot, StageCounts},
    random::ContextRandomExt,
    report::{record_tick, ContextReportExt},
    transmission::{aggregate_hazards, sample_exposures},
    AgentId, Tick,
};
use serde::Serialize;

define_rng!(MortalityRng);

/// What happened during one tick.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    pub tick: Tick,
    /// Stage counts after the tick was committed.
    pub counts: StageCounts,
    pub new_exposures: usize,
    pub new_infections: usize,
    pub new_recoveries: usize,
    pub new_deaths: usize,
    pub cumulative_deaths: u64,
}

pub trait ContextStepperExt {
    /// Advances the population through `tick`. Ticks must be supplied in strictly increasing
    /// order within `1..=horizon`.
    fn advance_tick(&mut self, tick: Tick) -> Result<TickSummary, EpiError>;

    /// Advances every remaining tick up to the horizon, then flushes any open reports.
    fn run_simulation(&mut self) -> Result<Vec<TickSummary>, EpiError>;

    /// The last tick committed, `0` before the first.
    fn get_current_tick(&self) -> Tick;
}

impl ContextStepperExt for Context {
    fn advance_tick(&mut self, tick: Tick) -> Result<TickSummary, EpiError> {
        let parameters = shared_parameters(self)?;
        let graph = shared_contact_graph(self)?;
        let kernel = shared_kernel(self)?;
        if !self.is_population_initialized() {
            return Err(EpiError::StateError("population has not been initialized".to_string()));
        }

        let last_tick = self.get_current_tick();
        if tick <= last_tick || tick > parameters.horizon {
            return Err(EpiError::StateError(format!(
                "tick {tick} out of order: last tick was {last_tick}, horizon is {}",
                parameters.horizon
            )));
        }

        // Read phase
        let snapshot = self.population_snapshot();
        let features = population_data(self).features(&snapshot);
        let hazards = aggregate_hazards(&graph, &kernel, &parameters, &features, tick);
        let exposed_today = sample_exposures(self, &features, &hazards);

        let timings = TransitionTimings::from(&*parameters);
        let mut next = PopulationSnapshot::with_capacity(snapshot.len());
        let mut summary = TickSummary {
            tick,
            counts: StageCounts::default(),
            new_exposures: 0,
            new_infections: 0,
            new_recoveries: 0,
            new_deaths: 0,
            cumulative_deaths: 0,
        };
        for (index, &exposed) in exposed_today.iter().enumerate() {
            let (state, transition) = next_state(snapshot.state(AgentId(index)), tick, exposed, &timings, || {
                self.sample_bernoulli::<MortalityRng>(parameters.mortality_rate)
            });
            match transition {
                Transition::Unchanged => {}
                Transition::Exposed => summary.new_exposures += 1,
                Transition::Infected => summary.new_infections += 1,
                Transition::Recovered => summary.new_recoveries += 1,
                Transition::Deceased => summary.new_deaths += 1,
            }
            next.push(state);
        }
        summary.counts = next.counts();

        // Write phase
        let data = self.get_data_container_mut::<PopulationData>();
        data.commit(next, tick, summary.new_deaths as u64);
        summary.cumulative_deaths = data.cumulative_deaths;

        debug!(
            "tick {tick}: {:?}, {} exposed, {} died",
            summary.counts, summary.new_exposures, summary.new_deaths
        );
        record_tick(self, &summary)?;
        Ok(summary)
    }

    fn run_simulation(&mut self) -> Result<Vec<TickSummary>, EpiError> {
        let horizon = shared_parameters(self)?.horizon;
        let first = self.get_current_tick() + 1;
        info!("running ticks {first} through {horizon}");

        let summaries = (first..=horizon)
            .map(|tick| self.advance_tick(tick))
            .collect::<Result<Vec<_>, _>>()?;

        self.flush_reports()?;

        if let Some(last) = summaries.last() {
            info!("run complete: {:?}, {} cumulative deaths", last.counts, last.cumulative_deaths);
        }
        Ok(summaries)
    }

    fn get_current_tick(&self) -> Tick {
        self.get_data_container::<PopulationData>()
            .map_or(0, |data| data.last_tick)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        contact_graph::{ContactGraph, ContextContactGraphExt},
        disease::{DiseaseState, Stage},
        parameters::{AgeGroup, ContextParametersExt, Parameters},
        transmission::{exposure_probability, message, ContextTransmissionExt},
        kernel::InfectiousnessKernel,
        population::AgentFeatures,
    };

    fn setup(parameters: Parameters, edges: &[(usize, usize)], seed: u64) -> Context {
        let agent_count = parameters.agent_count;
        let mut context = Context::new();
        context.init_random(seed);
        context.set_parameters(parameters).unwrap();
        context
            .set_contact_graph(ContactGraph::from_edges(agent_count, edges.iter().copied()).unwrap())
            .unwrap();
        context
    }

    /// A ring lattice where every agent touches its `k` nearest neighbors on each side.
    fn ring(agent_count: usize, k: usize) -> Vec<(usize, usize)> {
        (0..agent_count)
            .flat_map(|i| (1..=k).map(move |offset| (i, (i + offset) % agent_count)))
            .collect()
    }

    fn random_population(parameters: Parameters, edges: &[(usize, usize)], seed: u64) -> Context {
        let agent_count = parameters.agent_count;
        let mut context = setup(parameters, edges, seed);
        let age_groups: Vec<AgeGroup> = (0..agent_count).map(|i| AgeGroup((i % 8) as u8)).collect();
        context.initialize_population(&age_groups).unwrap();
        context
    }

    /// Agents 0 and 2 susceptible, agent 1 infected since tick 0, on the chain 0 - 1 - 2.
    fn three_agent_chain(parameters: Parameters) -> Context {
        let never = parameters.never();
        let mut context = setup(parameters, &[(0, 1), (1, 2)], 2024);
        context
            .initialize_population_from_states(
                &[AgeGroup(0); 3],
                &[
                    DiseaseState::susceptible(never),
                    DiseaseState { stage: Stage::Infected, onset: 0, next_transition: 6 },
                    DiseaseState::susceptible(never),
                ],
            )
            .unwrap();
        context
    }

    #[test]
    fn chain_neighbors_are_exposed_with_certain_transmission() {
        let mut parameters = Parameters::with_population(3, 20);
        // Large enough that 1 - exp(-lambda) rounds to exactly one.
        parameters.edge_weight = 1e9;
        let delay = parameters.exposed_to_infected_delay;
        let mut context = three_agent_chain(parameters);

        let summary = context.advance_tick(1).unwrap();
        assert_eq!(summary.new_exposures, 2);
        for agent in [AgentId(0), AgentId(2)] {
            assert_eq!(context.get_stage(agent), Stage::Exposed);
            assert_eq!(context.get_onset(agent), 1);
            assert_eq!(context.get_next_transition(agent), 1 + 1 + delay);
        }
        assert_eq!(context.get_stage(AgentId(1)), Stage::Infected);
        assert_eq!(context.get_onset(AgentId(1)), 0);

        // The newly exposed progress on schedule without being redrawn.
        for tick in 2..=(1 + delay) {
            assert_eq!(context.advance_tick(tick).unwrap().new_exposures, 0);
            assert_eq!(context.get_stage(AgentId(0)), Stage::Exposed);
        }
        assert_eq!(context.advance_tick(2 + delay).unwrap().new_infections, 2);
        assert_eq!(context.get_stage(AgentId(2)), Stage::Infected);
        assert_eq!(context.get_onset(AgentId(2)), 1);
    }

    #[test]
    fn chain_neighbors_stay_susceptible_without_transmission() {
        let mut parameters = Parameters::with_population(3, 20);
        parameters.edge_weight = 0.0;
        let never = parameters.never();
        let mut context = three_agent_chain(parameters);

        let summary = context.advance_tick(1).unwrap();
        assert_eq!(summary.new_exposures, 0);
        for agent in [AgentId(0), AgentId(2)] {
            assert_eq!(context.get_stage(agent), Stage::Susceptible);
            assert_eq!(context.get_onset(agent), never);
            assert_eq!(context.get_next_transition(agent), never);
        }
    }

    #[test]
    fn chain_exposure_follows_the_drawn_uniform() {
        let parameters = Parameters::with_population(3, 20);
        let kernel = InfectiousnessKernel::for_parameters(&parameters).unwrap();
        let lambda = parameters.r0 * parameters.susceptibility[0] * parameters.infectiousness[2]
            * parameters.edge_weight * kernel.weight(1) / 2.0;
        let p = exposure_probability(lambda);
        let mut context = three_agent_chain(parameters);
        assert!((context.force_of_infection(AgentId(0), 1).unwrap() - lambda).abs() < 1e-15);

        // Replay the exposure stream to learn the two draws the stepper will see.
        let mut replay = Context::new();
        replay.init_random(2024);
        let draws = [
            replay.sample_uniform::<crate::transmission::ExposureRng>(),
            replay.sample_uniform::<crate::transmission::ExposureRng>(),
        ];

        let summary = context.advance_tick(1).unwrap();
        let expected: Vec<Stage> = draws
            .iter()
            .map(|&draw| if draw < p { Stage::Exposed } else { Stage::Susceptible })
            .collect();
        assert_eq!(vec![context.get_stage(AgentId(0)), context.get_stage(AgentId(2))], expected);
        assert_eq!(summary.new_exposures, draws.iter().filter(|&&draw| draw < p).count());
    }

    #[test]
    fn chain_hazard_matches_message_formula() {
        let parameters = Parameters::with_population(3, 20);
        let kernel = InfectiousnessKernel::for_parameters(&parameters).unwrap();
        let infector = AgentFeatures {
            age_group: AgeGroup(0),
            stage: Stage::Infected,
            ever_infected: true,
            onset: 0,
            mean_interactions: 2.0,
        };
        let target = AgentFeatures {
            age_group: AgeGroup(0),
            stage: Stage::Susceptible,
            ever_infected: false,
            onset: parameters.never(),
            mean_interactions: 2.0,
        };
        let expected = 5.18 * 0.35 * 0.72 * 1.0 * kernel.weight(1) / 2.0;
        assert!((message(&parameters, &kernel, &infector, &target, 1) - expected).abs() < 1e-15);
    }

    #[test]
    fn certain_mortality_kills() {
        let mut parameters = Parameters::with_population(2, 10);
        parameters.mortality_rate = 1.0;
        let never = parameters.never();
        let mut context = setup(parameters, &[], 1);
        context
            .initialize_population_from_states(
                &[AgeGroup(3); 2],
                &[
                    DiseaseState { stage: Stage::Infected, onset: 0, next_transition: 2 },
                    DiseaseState { stage: Stage::Infected, onset: 0, next_transition: 3 },
                ],
            )
            .unwrap();

        assert_eq!(context.advance_tick(1).unwrap().new_deaths, 0);
        let summary = context.advance_tick(2).unwrap();
        assert_eq!(summary.new_deaths, 1);
        assert_eq!(context.get_stage(AgentId(0)), Stage::Deceased);
        assert_eq!(context.get_next_transition(AgentId(0)), never);
        assert_eq!(context.get_stage(AgentId(1)), Stage::Infected);

        let summary = context.advance_tick(3).unwrap();
        assert_eq!(summary.cumulative_deaths, 2);
        assert_eq!(context.cumulative_deaths(), 2);
    }

    #[test]
    fn zero_mortality_recovers() {
        let mut parameters = Parameters::with_population(1, 10);
        parameters.mortality_rate = 0.0;
        let mut context = setup(parameters, &[], 1);
        context
            .initialize_population_from_states(
                &[AgeGroup(3)],
                &[DiseaseState { stage: Stage::Infected, onset: 0, next_transition: 1 }],
            )
            .unwrap();

        let summary = context.advance_tick(1).unwrap();
        assert_eq!(summary.new_recoveries, 1);
        assert_eq!(context.get_stage(AgentId(0)), Stage::Recovered);
        assert_eq!(context.cumulative_deaths(), 0);
    }

    #[test]
    fn exposed_progress_to_infected_on_schedule() {
        let mut parameters = Parameters::with_population(1, 20);
        parameters.mortality_rate = 0.0;
        let mut context = setup(parameters, &[], 1);
        context
            .initialize_population_from_states(
                &[AgeGroup(2)],
                &[DiseaseState { stage: Stage::Exposed, onset: 0, next_transition: 3 }],
            )
            .unwrap();

        context.advance_tick(1).unwrap();
        context.advance_tick(2).unwrap();
        assert_eq!(context.get_stage(AgentId(0)), Stage::Exposed);
        assert_eq!(context.advance_tick(3).unwrap().new_infections, 1);
        assert_eq!(context.get_stage(AgentId(0)), Stage::Infected);
        assert_eq!(context.get_next_transition(AgentId(0)), 3 + 5);
        assert_eq!(context.get_onset(AgentId(0)), 0);

        for tick in 4..8 {
            context.advance_tick(tick).unwrap();
            assert_eq!(context.get_stage(AgentId(0)), Stage::Infected);
        }
        context.advance_tick(8).unwrap();
        assert_eq!(context.get_stage(AgentId(0)), Stage::Recovered);
    }

    #[test]
    fn stages_and_deaths_stay_consistent_over_a_run() {
        let mut parameters = Parameters::with_population(400, 60);
        parameters.initial_infection_rate = 0.05;
        parameters.mortality_rate = 0.3;
        let mut context = random_population(parameters, &ring(400, 3), 8);

        let mut previous = context.stage_vector();
        let mut previous_deaths = 0;
        for tick in 1..=60 {
            let summary = context.advance_tick(tick).unwrap();
            let current = context.stage_vector();
            assert_eq!(summary.counts.total(), 400);

            for (before, after) in previous.iter().zip(&current) {
                let allowed = match before {
                    Stage::Susceptible => matches!(after, Stage::Susceptible | Stage::Exposed),
                    Stage::Exposed => matches!(after, Stage::Exposed | Stage::Infected),
                    Stage::Infected => matches!(after, Stage::Infected | Stage::Recovered | Stage::Deceased),
                    _ => before.is_terminal() && after == before,
                };
                assert!(allowed, "illegal transition {before:?} -> {after:?} at tick {tick}");
            }

            assert!(summary.cumulative_deaths >= previous_deaths);
            assert_eq!(summary.cumulative_deaths, summary.counts.deceased as u64);
            previous_deaths = summary.cumulative_deaths;
            previous = current;
        }
        // With R0 above one on a connected ring the outbreak spreads beyond the seeds.
        let final_counts = context.stage_counts();
        assert!(final_counts.recovered + final_counts.deceased > 20, "{final_counts:?}");
    }

    #[test]
    fn isolated_agents_stay_susceptible() {
        let mut parameters = Parameters::with_population(60, 30);
        parameters.initial_infection_rate = 0.5;
        // Agents 40.. have no edges.
        let edges = ring(40, 2);
        let mut context = random_population(parameters, &edges, 4);
        let initially_susceptible: Vec<usize> = (40..60)
            .filter(|&i| context.get_stage(AgentId(i)) == Stage::Susceptible)
            .collect();
        assert!(!initially_susceptible.is_empty());

        context.run_simulation().unwrap();
        for i in initially_susceptible {
            assert_eq!(context.get_stage(AgentId(i)), Stage::Susceptible);
        }
    }

    #[test]
    fn no_exposure_without_transmissibility() {
        let mut zero_r0 = Parameters::with_population(200, 25);
        zero_r0.r0 = 0.0;
        zero_r0.initial_infection_rate = 0.3;

        let mut zero_susceptibility = Parameters::with_population(200, 25);
        zero_susceptibility.susceptibility = vec![0.0; 8];
        zero_susceptibility.initial_infection_rate = 0.3;

        for parameters in [zero_r0, zero_susceptibility] {
            let mut context = random_population(parameters, &ring(200, 4), 12);
            let summaries = context.run_simulation().unwrap();
            assert_eq!(summaries.len(), 25);
            assert!(summaries.iter().all(|summary| summary.new_exposures == 0));
            assert_eq!(context.stage_counts().exposed, 0);
        }
    }

    #[test]
    fn runs_are_reproducible_under_a_seed() {
        let run = |seed| {
            let mut context = random_population(Parameters::with_population(300, 40), &ring(300, 2), seed);
            let summaries = context.run_simulation().unwrap();
            (context.stage_vector(), summaries)
        };
        assert_eq!(run(31), run(31));
    }

    #[test]
    fn ticks_must_advance_within_the_horizon() {
        let mut context = random_population(Parameters::with_population(10, 5), &ring(10, 1), 1);
        assert_eq!(context.get_current_tick(), 0);
        assert!(matches!(context.advance_tick(0), Err(EpiError::StateError(_))));

        context.advance_tick(1).unwrap();
        context.advance_tick(3).unwrap();
        assert_eq!(context.get_current_tick(), 3);
        assert!(matches!(context.advance_tick(3), Err(EpiError::StateError(_))));
        assert!(matches!(context.advance_tick(6), Err(EpiError::StateError(_))));

        let remaining = context.run_simulation().unwrap();
        assert_eq!(remaining.iter().map(|s| s.tick).collect::<Vec<_>>(), vec![4, 5]);
    }

    #[test]
    fn stepping_requires_a_complete_setup() {
        let mut context = Context::new();
        context.init_random(1);
        assert!(matches!(context.advance_tick(1), Err(EpiError::StateError(_))));

        context.set_parameters(Parameters::with_population(3, 5)).unwrap();
        assert!(matches!(context.advance_tick(1), Err(EpiError::StateError(_))));

        context.set_contact_graph(ContactGraph::from_edges(3, [(0, 1)]).unwrap()).unwrap();
        assert!(matches!(context.advance_tick(1), Err(EpiError::StateError(_))));
    }
}
