/*!

Force of infection and exposure sampling.

For a susceptible agent `i` the hazard is the sum of messages from its infectious neighbors `j`:

```text
message(j -> i) = R0 * susceptibility(age_group(i)) * infectiousness(stage(j)) * edge_weight
                  * kernel(tick - onset(j)) / mean_interactions(i)
```

The aggregated hazard is read as a Poisson rate, so the probability of exposure during the tick is
`1 - exp(-lambda)`. Each susceptible agent gets one Bernoulli draw per tick from `ExposureRng`,
in ascending agent order, whether or not it has infectious neighbors.

All inputs come from the tick-start snapshot; nothing here writes population state.

*/

use crate::{
    contact_graph::{shared_contact_graph, ContactGraph},
    context::Context,
    define_rng,
    disease::Stage,
    error::EpiError,
    kernel::{shared_kernel, InfectiousnessKernel},
    parameters::{shared_parameters, Parameters},
    population::{population_data, AgentFeatures, ContextPopulationExt},
    random::ContextRandomExt,
    AgentId, Tick,
};

define_rng!(pub(crate) ExposureRng);

/// The hazard contribution of `source` to `target` at `tick`. Zero unless `source` is infectious.
#[must_use]
#[inline]
pub fn message(
    parameters: &Parameters,
    kernel: &InfectiousnessKernel,
    source: &AgentFeatures,
    target: &AgentFeatures,
    tick: Tick,
) -> f64 {
    if !source.stage.is_infectious() {
        return 0.0;
    }
    debug_assert!(source.ever_infected, "infectious agent without an onset");
    debug_assert!(target.mean_interactions > 0.0, "mean interactions must be positive");

    parameters.r0
        * parameters.susceptibility_for(target.age_group)
        * parameters.infectiousness_of(source.stage)
        * parameters.edge_weight
        * kernel.weight(tick - source.onset)
        / target.mean_interactions
}

/// The force of infection on every agent: the sum of incoming messages for susceptible agents,
/// zero for everyone else.
#[must_use]
pub fn aggregate_hazards(
    graph: &ContactGraph,
    kernel: &InfectiousnessKernel,
    parameters: &Parameters,
    features: &[AgentFeatures],
    tick: Tick,
) -> Vec<f64> {
    assert_eq!(features.len(), graph.agent_count(), "feature view does not match the contact graph");

    features
        .iter()
        .enumerate()
        .map(|(index, target)| {
            if target.stage != Stage::Susceptible {
                return 0.0;
            }
            graph
                .neighbors(AgentId(index))
                .iter()
                .map(|source| message(parameters, kernel, &features[source.0], target, tick))
                .sum()
        })
        .collect()
}

/// `1 - exp(-hazard)`, accurate for small hazards.
#[must_use]
#[inline]
pub fn exposure_probability(hazard: f64) -> f64 {
    -(-hazard).exp_m1()
}

/// Draws the exposures for one tick. Only agents susceptible in the snapshot are drawn for, and
/// only they can be marked exposed.
pub(crate) fn sample_exposures(context: &mut Context, features: &[AgentFeatures], hazards: &[f64]) -> Vec<bool> {
    features
        .iter()
        .zip(hazards)
        .map(|(agent, &hazard)| {
            agent.stage == Stage::Susceptible
                && context.sample_bernoulli::<ExposureRng>(exposure_probability(hazard))
        })
        .collect()
}

pub trait ContextTransmissionExt {
    /// The force of infection `agent` would experience at `tick` given the current snapshot.
    /// Zero for agents that are not susceptible.
    ///
    /// `tick` must be one the stepper could still advance to, after the last committed tick and
    /// no later than the horizon.
    fn force_of_infection(&mut self, agent: AgentId, tick: Tick) -> Result<f64, EpiError>;
}

impl ContextTransmissionExt for Context {
    fn force_of_infection(&mut self, agent: AgentId, tick: Tick) -> Result<f64, EpiError> {
        let parameters = shared_parameters(self)?;
        let graph = shared_contact_graph(self)?;
        let kernel = shared_kernel(self)?;
        if !self.is_population_initialized() {
            return Err(EpiError::StateError("population has not been initialized".to_string()));
        }

        let population_size = self.get_population_size();
        let data = population_data(self);
        if agent.0 >= population_size {
            return Err(EpiError::StateError(format!(
                "agent {agent} is outside a population of {population_size}"
            )));
        }
        if tick <= data.last_tick || tick > parameters.horizon {
            return Err(EpiError::StateError(format!(
                "tick {tick} is outside {}..={}",
                data.last_tick + 1,
                parameters.horizon
            )));
        }

        let features = data.features(&self.population_snapshot());
        let target = &features[agent.0];
        if target.stage != Stage::Susceptible {
            return Ok(0.0);
        }
        Ok(graph
            .neighbors(agent)
            .iter()
            .map(|source| message(&parameters, &kernel, &features[source.0], target, tick))
            .sum())
    }
}
