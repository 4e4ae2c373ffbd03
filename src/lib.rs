/*!

A discrete-time stochastic epidemic simulation over a fixed contact network.

Agents move through `Susceptible -> Exposed -> Infected -> {Recovered | Deceased}`. Exposure is
driven by a force of infection aggregated over infectious neighbors in a [`ContactGraph`],
weighted by an [`InfectiousnessKernel`] derived from a Gamma distribution. All state lives in
data plugins owned by a [`Context`]; each component exposes its API as a `Context*Ext` trait.

```rust,no_run
use contact_epi::{Context, ContextRandomExt, ContextParametersExt, ContextContactGraphExt,
                  ContextPopulationExt, ContextStepperExt, Parameters, AgeGroup};

# fn main() -> Result<(), contact_epi::EpiError> {
let mut context = Context::new();
context.init_random(42);
context.set_parameters(Parameters::from_json_file("parameters.json")?)?;
context.load_contact_graph("contact_edges.csv")?;
let age_groups = contact_epi::load_age_groups_csv("population.csv")?;
context.initialize_population(&age_groups)?;
let summaries = context.run_simulation()?;
# Ok(())
# }
```

*/

pub mod context;
pub mod contact_graph;
pub mod disease;
pub mod error;
mod hashing;
pub mod kernel;
pub mod log;
pub mod parameters;
pub mod population;
pub mod random;
pub mod report;
pub mod stepper;
pub mod transmission;

// Callers of `ContextRandomExt::sample` receive a `&mut StdRng` from this version of `rand`.
pub use rand;

// All modules import `crate::TypeId` in case we want to change the underlying type of `TypeId`.
pub(crate) use std::any::TypeId;

pub use context::{Context, DataPlugin};
pub use contact_graph::{ContactGraph, ContextContactGraphExt};
pub use disease::{DiseaseState, Stage, Transition};
pub use error::EpiError;
pub use kernel::{ContextKernelExt, InfectiousnessKernel};
pub use parameters::{AgeGroup, ContextParametersExt, GammaKernelParameters, InteractionBuckets, Parameters};
pub use population::{load_age_groups_csv, AgentFeatures, ContextPopulationExt, PopulationSnapshot, StageCounts};
pub use random::ContextRandomExt;
pub use report::ContextReportExt;
pub use stepper::{ContextStepperExt, TickSummary};
pub use transmission::ContextTransmissionExt;

#[inline(always)]
pub fn type_of<T: 'static>() -> TypeId {
    TypeId::of::<T>()
}

/// A discrete simulation time step. Signed so that onsets can be back-dated before the first tick.
pub type Tick = i64;

/// The stable index of an agent, in `0..agent_count`.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct AgentId(pub(crate) usize);

impl AgentId {
    #[must_use]
    pub fn new(index: usize) -> Self {
        AgentId(index)
    }

    #[must_use]
    #[inline(always)]
    pub fn index(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
