/*!

The immutable calibrated configuration of a run.

`Parameters` deserializes from JSON; any field left out takes its value from
[`Parameters::default()`], the reference calibration. The population size and horizon default to
zero and must be supplied, otherwise [`Parameters::validate()`] rejects the configuration.

*/

use crate::{
    context::{Context, DataPlugin},
    disease::Stage,
    error::EpiError,
    kernel::KERNEL_SAFETY_MARGIN,
    log::{info, trace},
    Tick,
};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, rc::Rc};

/// An index into the susceptibility table. Fixed for an agent's lifetime.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgeGroup(pub u8);

impl AgeGroup {
    #[must_use]
    #[inline(always)]
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// Mean daily interaction counts for the child, adult and elder age-group buckets. An age group
/// `g` is a child when `g <= child_upper_age_group`, an adult when
/// `child_upper_age_group < g <= adult_upper_age_group`, and an elder otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InteractionBuckets {
    pub child_upper_age_group: u8,
    pub adult_upper_age_group: u8,
    pub child: f64,
    pub adult: f64,
    pub elder: f64,
}

impl InteractionBuckets {
    #[must_use]
    pub fn mean_interactions(&self, age_group: AgeGroup) -> f64 {
        if age_group.0 <= self.child_upper_age_group {
            self.child
        } else if age_group.0 <= self.adult_upper_age_group {
            self.adult
        } else {
            self.elder
        }
    }
}

/// Gamma distribution parameters for the infectiousness kernel. The shape is re-derived from
/// these two values when the kernel is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GammaKernelParameters {
    pub scale: f64,
    pub rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Parameters {
    pub agent_count: usize,
    /// The last tick of the run. Ticks run `1..=horizon`.
    pub horizon: Tick,
    /// Indexed by age group.
    pub susceptibility: Vec<f64>,
    /// Indexed by stage, in the order `Susceptible, Exposed, Infected, Recovered, Deceased`.
    pub infectiousness: [f64; Stage::COUNT],
    pub r0: f64,
    pub edge_weight: f64,
    pub mean_interactions: InteractionBuckets,
    pub exposed_to_infected_delay: Tick,
    pub infected_to_recovered_delay: Tick,
    pub kernel: GammaKernelParameters,
    pub initial_infection_rate: f64,
    pub mortality_rate: f64,
}

impl Default for Parameters {
    fn default() -> Self {
        Parameters {
            agent_count: 0,
            horizon: 0,
            susceptibility: vec![0.35, 0.69, 1.03, 1.03, 1.03, 1.03, 1.27, 1.52],
            infectiousness: [0.0, 0.33, 0.72, 0.0, 0.0],
            r0: 5.18,
            edge_weight: 1.0,
            mean_interactions: InteractionBuckets {
                child_upper_age_group: 1,
                adult_upper_age_group: 6,
                child: 2.0,
                adult: 4.0,
                elder: 3.0,
            },
            exposed_to_infected_delay: 3,
            infected_to_recovered_delay: 5,
            kernel: GammaKernelParameters {
                scale: 5.15,
                rate: 2.14,
            },
            initial_infection_rate: 0.05,
            mortality_rate: 0.1,
        }
    }
}

fn ensure(condition: bool, message: impl FnOnce() -> String) -> Result<(), EpiError> {
    if condition {
        Ok(())
    } else {
        Err(EpiError::ConfigError(message()))
    }
}

fn is_non_negative(value: f64) -> bool {
    value.is_finite() && value >= 0.0
}

fn is_positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

fn is_probability(value: f64) -> bool {
    (0.0..=1.0).contains(&value)
}

impl Parameters {
    /// The reference calibration for a population of `agent_count` agents run for `horizon` ticks.
    #[must_use]
    pub fn with_population(agent_count: usize, horizon: Tick) -> Self {
        Parameters {
            agent_count,
            horizon,
            ..Parameters::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, EpiError> {
        let parameters: Parameters = serde_json::from_str(json)?;
        parameters.validate()?;
        Ok(parameters)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, EpiError> {
        let path = path.as_ref();
        trace!("loading parameters from {}", path.display());
        let json = fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Checks every value a run depends on. Anything that would later break an arithmetic
    /// invariant (zero interactions, non-positive kernel parameters) is rejected here.
    pub fn validate(&self) -> Result<(), EpiError> {
        ensure(self.agent_count > 0, || "agent_count must be positive".to_string())?;
        ensure(self.horizon > 0, || format!("horizon must be positive, got {}", self.horizon))?;

        ensure(!self.susceptibility.is_empty(), || {
            "susceptibility table must have at least one age group".to_string()
        })?;
        ensure(self.susceptibility.len() <= usize::from(u8::MAX) + 1, || {
            format!("susceptibility table has {} age groups, at most 256 are supported", self.susceptibility.len())
        })?;
        for (age_group, &value) in self.susceptibility.iter().enumerate() {
            ensure(is_non_negative(value), || {
                format!("susceptibility for age group {age_group} must be a non-negative number, got {value}")
            })?;
        }
        for stage in Stage::ALL {
            let value = self.infectiousness[stage.index()];
            ensure(is_non_negative(value), || {
                format!("infectiousness for {stage:?} must be a non-negative number, got {value}")
            })?;
        }

        ensure(is_non_negative(self.r0), || format!("r0 must be a non-negative number, got {}", self.r0))?;
        ensure(is_non_negative(self.edge_weight), || {
            format!("edge_weight must be a non-negative number, got {}", self.edge_weight)
        })?;

        let buckets = &self.mean_interactions;
        ensure(buckets.child_upper_age_group <= buckets.adult_upper_age_group, || {
            format!(
                "child_upper_age_group ({}) must not exceed adult_upper_age_group ({})",
                buckets.child_upper_age_group, buckets.adult_upper_age_group
            )
        })?;
        for (bucket, value) in [("children", buckets.child), ("adults", buckets.adult), ("elders", buckets.elder)] {
            ensure(is_positive(value), || {
                format!("mean interactions for {bucket} must be positive, got {value}")
            })?;
        }

        ensure(self.exposed_to_infected_delay >= 0, || {
            format!("exposed_to_infected_delay must be non-negative, got {}", self.exposed_to_infected_delay)
        })?;
        ensure(self.infected_to_recovered_delay >= 0, || {
            format!("infected_to_recovered_delay must be non-negative, got {}", self.infected_to_recovered_delay)
        })?;

        ensure(is_positive(self.kernel.scale), || {
            format!("kernel scale must be positive, got {}", self.kernel.scale)
        })?;
        ensure(is_positive(self.kernel.rate), || {
            format!("kernel rate must be positive, got {}", self.kernel.rate)
        })?;

        ensure(is_probability(self.initial_infection_rate), || {
            format!("initial_infection_rate must lie in [0, 1], got {}", self.initial_infection_rate)
        })?;
        ensure(is_probability(self.mortality_rate), || {
            format!("mortality_rate must lie in [0, 1], got {}", self.mortality_rate)
        })?;

        Ok(())
    }

    /// The sentinel for "never": one past the horizon, so `tick >= never` is false for every
    /// tick of the run.
    #[must_use]
    #[inline(always)]
    pub fn never(&self) -> Tick {
        self.horizon + 1
    }

    /// The onset assigned to agents infected at initialization, as though they were exposed
    /// before the run started.
    #[must_use]
    pub fn initial_infection_onset(&self) -> Tick {
        1 - self.exposed_to_infected_delay
    }

    /// Number of kernel entries needed so that every lag reachable during the run is in range,
    /// including lags measured from back-dated initial onsets.
    #[must_use]
    pub fn kernel_length(&self) -> usize {
        let max_lag = self.horizon - self.initial_infection_onset().min(0);
        usize::try_from(max_lag).unwrap_or(0) + KERNEL_SAFETY_MARGIN
    }

    /// Panics if `age_group` is outside the susceptibility table; population initialization
    /// guarantees it is not.
    #[must_use]
    #[inline]
    pub fn susceptibility_for(&self, age_group: AgeGroup) -> f64 {
        self.susceptibility[age_group.index()]
    }

    #[must_use]
    #[inline]
    pub fn infectiousness_of(&self, stage: Stage) -> f64 {
        self.infectiousness[stage.index()]
    }

    #[must_use]
    pub fn age_group_count(&self) -> usize {
        self.susceptibility.len()
    }
}

struct ParametersPlugin {
    parameters: Option<Rc<Parameters>>,
}

impl DataPlugin for ParametersPlugin {
    const new: &'static dyn Fn() -> Self = &|| ParametersPlugin { parameters: None };
}

pub trait ContextParametersExt {
    /// Validates and stores the run's parameters. They cannot be replaced afterwards.
    fn set_parameters(&mut self, parameters: Parameters) -> Result<(), EpiError>;

    fn get_parameters(&self) -> Option<&Parameters>;
}

impl ContextParametersExt for Context {
    fn set_parameters(&mut self, parameters: Parameters) -> Result<(), EpiError> {
        parameters.validate()?;
        let plugin = self.get_data_container_mut::<ParametersPlugin>();
        if plugin.parameters.is_some() {
            return Err(EpiError::StateError("parameters have already been set".to_string()));
        }
        info!(
            "parameters set: {} agents, horizon {}, r0 {}",
            parameters.agent_count, parameters.horizon, parameters.r0
        );
        plugin.parameters = Some(Rc::new(parameters));
        Ok(())
    }

    fn get_parameters(&self) -> Option<&Parameters> {
        self.get_data_container::<ParametersPlugin>()
            .and_then(|plugin| plugin.parameters.as_deref())
    }
}

/// A shared handle to the parameters, so callers can hold them while mutably borrowing the
/// context for random draws.
pub(crate) fn shared_parameters(context: &Context) -> Result<Rc<Parameters>, EpiError> {
    context
        .get_data_container::<ParametersPlugin>()
        .and_then(|plugin| plugin.parameters.clone())
        .ok_or_else(|| EpiError::StateError("parameters have not been set".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_calibration_is_valid_once_sized() {
        assert!(Parameters::default().validate().is_err());
        Parameters::with_population(100, 30).validate().unwrap();
    }

    #[test]
    fn json_overrides_only_named_fields() {
        let parameters = Parameters::from_json_str(
            r#"{
                "agent_count": 50,
                "horizon": 20,
                "r0": 2.5,
                "kernel": { "scale": 4.0, "rate": 1.5 }
            }"#,
        )
        .unwrap();

        assert_eq!(parameters.agent_count, 50);
        assert_eq!(parameters.horizon, 20);
        assert_eq!(parameters.r0, 2.5);
        assert_eq!(parameters.kernel, GammaKernelParameters { scale: 4.0, rate: 1.5 });
        assert_eq!(parameters.susceptibility, Parameters::default().susceptibility);
        assert_eq!(parameters.never(), 21);
    }

    #[test]
    fn json_rejects_unknown_fields() {
        let result = Parameters::from_json_str(r#"{ "agent_count": 5, "horizon": 3, "beta": 1.0 }"#);
        assert!(matches!(result, Err(EpiError::JsonError(_))));
    }

    #[test]
    fn json_file_round_trip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, br#"{ "agent_count": 10, "horizon": 4, "mortality_rate": 0.0 }"#).unwrap();

        let parameters = Parameters::from_json_file(file.path()).unwrap();
        assert_eq!(parameters.agent_count, 10);
        assert_eq!(parameters.mortality_rate, 0.0);
    }

    #[test]
    fn invalid_values_are_fatal() {
        let cases: Vec<(&str, Box<dyn Fn(&mut Parameters)>)> = vec![
            ("agent_count", Box::new(|p| p.agent_count = 0)),
            ("horizon", Box::new(|p| p.horizon = -1)),
            ("kernel scale", Box::new(|p| p.kernel.scale = 0.0)),
            ("kernel rate", Box::new(|p| p.kernel.rate = -2.0)),
            ("children", Box::new(|p| p.mean_interactions.child = 0.0)),
            ("child_upper_age_group", Box::new(|p| p.mean_interactions.child_upper_age_group = 7)),
            ("mortality_rate", Box::new(|p| p.mortality_rate = 1.5)),
            ("initial_infection_rate", Box::new(|p| p.initial_infection_rate = f64::NAN)),
            ("susceptibility", Box::new(|p| p.susceptibility[2] = -0.1)),
            ("r0", Box::new(|p| p.r0 = f64::INFINITY)),
            ("exposed_to_infected_delay", Box::new(|p| p.exposed_to_infected_delay = -1)),
        ];

        for (field, corrupt) in cases {
            let mut parameters = Parameters::with_population(10, 10);
            corrupt(&mut parameters);
            match parameters.validate() {
                Err(EpiError::ConfigError(message)) => {
                    assert!(message.contains(field), "{message:?} should mention {field}");
                }
                other => panic!("expected a configuration error for {field}, got {other:?}"),
            }
        }
    }

    #[test]
    fn interaction_buckets_split_on_boundaries() {
        let buckets = Parameters::default().mean_interactions;
        assert_eq!(buckets.mean_interactions(AgeGroup(0)), 2.0);
        assert_eq!(buckets.mean_interactions(AgeGroup(1)), 2.0);
        assert_eq!(buckets.mean_interactions(AgeGroup(2)), 4.0);
        assert_eq!(buckets.mean_interactions(AgeGroup(6)), 4.0);
        assert_eq!(buckets.mean_interactions(AgeGroup(7)), 3.0);
    }

    #[test]
    fn kernel_covers_back_dated_onsets() {
        let mut parameters = Parameters::with_population(10, 40);
        parameters.exposed_to_infected_delay = 25;
        // Initial infections are back-dated to tick -24, so lags reach 64.
        assert!(parameters.kernel_length() > 64);
    }

    #[test]
    fn parameters_are_set_once() {
        let mut context = Context::new();
        assert!(context.get_parameters().is_none());
        assert!(shared_parameters(&context).is_err());

        context.set_parameters(Parameters::with_population(5, 5)).unwrap();
        assert_eq!(context.get_parameters().unwrap().agent_count, 5);

        let result = context.set_parameters(Parameters::with_population(6, 5));
        assert!(matches!(result, Err(EpiError::StateError(_))));
        assert_eq!(shared_parameters(&context).unwrap().agent_count, 5);
    }

    #[test]
    fn invalid_parameters_are_not_stored() {
        let mut context = Context::new();
        assert!(context.set_parameters(Parameters::default()).is_err());
        assert!(context.get_parameters().is_none());
    }
}
