/*!

The infectiousness-over-time kernel.

The kernel discretizes a Gamma distribution into daily weights: entry `k` is the probability mass
the distribution places on `(k, k + 1]`, that is `CDF(k + 1) - CDF(k)`, and is the weight of an
infector `k` ticks after its onset. The table is computed once per run, with no randomness, and
shared read-only by every transmission computation.

The distribution is parameterized the way the calibration reports it, by `scale` and `rate`; the
Gamma rate actually used is `rate^2 / scale` and the shape is `scale / (rate^2 / scale)`.

*/

use crate::{
    context::{Context, DataPlugin},
    error::EpiError,
    log::{debug, trace},
    parameters::{shared_parameters, Parameters},
    Tick,
};
use std::rc::Rc;

/// Extra entries beyond the longest lag the run can produce.
pub const KERNEL_SAFETY_MARGIN: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct InfectiousnessKernel {
    shape: f64,
    gamma_rate: f64,
    weights: Vec<f64>,
}

impl InfectiousnessKernel {
    /// Builds a table with `length` entries. Fails if `scale` or `rate` is not a positive number.
    pub fn new(scale: f64, rate: f64, length: usize) -> Result<Self, EpiError> {
        if !(scale.is_finite() && scale > 0.0 && rate.is_finite() && rate > 0.0) {
            return Err(EpiError::ConfigError(format!(
                "kernel parameters must be positive, got scale {scale} and rate {rate}"
            )));
        }

        let gamma_rate = rate * rate / scale;
        let shape = scale / gamma_rate;

        let mut weights = Vec::with_capacity(length);
        let mut previous = 0.0;
        for t in 1..=length {
            let current = gamma::cdf(shape, gamma_rate, t as f64);
            // The CDF is monotone; clamp rounding noise in the far tail.
            weights.push((current - previous).max(0.0));
            previous = current;
        }

        trace!("built infectiousness kernel: shape {shape}, rate {gamma_rate}, {length} entries");
        Ok(InfectiousnessKernel {
            shape,
            gamma_rate,
            weights,
        })
    }

    pub fn for_parameters(parameters: &Parameters) -> Result<Self, EpiError> {
        Self::new(parameters.kernel.scale, parameters.kernel.rate, parameters.kernel_length())
    }

    /// The infectiousness weight `lag` ticks after onset.
    ///
    /// Panics if `lag` is negative or beyond the table: either means an onset was recorded
    /// after the current tick or the table was sized for a shorter run.
    #[must_use]
    #[inline]
    pub fn weight(&self, lag: Tick) -> f64 {
        let index = usize::try_from(lag)
            .unwrap_or_else(|_| panic!("negative kernel lag {lag}: onset is after the current tick"));
        assert!(
            index < self.weights.len(),
            "kernel lag {lag} beyond the table of {} entries",
            self.weights.len()
        );
        self.weights[index]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.weights.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[f64] {
        &self.weights
    }

    /// The mass covered by the table, `CDF(len)`.
    #[must_use]
    pub fn total(&self) -> f64 {
        self.weights.iter().sum()
    }

    #[must_use]
    pub fn shape(&self) -> f64 {
        self.shape
    }

    #[must_use]
    pub fn gamma_rate(&self) -> f64 {
        self.gamma_rate
    }
}

/// Gamma distribution CDF via the regularized lower incomplete gamma function.
mod gamma {
    const MAX_ITERATIONS: usize = 500;
    const EPSILON: f64 = 1e-15;
    const FLOOR: f64 = 1e-300;

    const LANCZOS_G: f64 = 7.0;
    const LANCZOS_COEFFICIENTS: [f64; 9] = [
        0.999_999_999_999_809_9,
        676.520_368_121_885_1,
        -1_259.139_216_722_402_8,
        771.323_428_777_653_1,
        -176.615_029_162_140_6,
        12.507_343_278_686_905,
        -0.138_571_095_265_720_12,
        9.984_369_578_019_572e-6,
        1.505_632_735_149_311_6e-7,
    ];

    /// `ln Γ(x)` for `x > 0`.
    pub(super) fn ln_gamma(x: f64) -> f64 {
        if x < 0.5 {
            // Reflection formula
            let pi = std::f64::consts::PI;
            (pi / (pi * x).sin()).ln() - ln_gamma(1.0 - x)
        } else {
            let x = x - 1.0;
            let t = x + LANCZOS_G + 0.5;
            let series = LANCZOS_COEFFICIENTS
                .iter()
                .enumerate()
                .skip(1)
                .fold(LANCZOS_COEFFICIENTS[0], |acc, (i, c)| acc + c / (x + i as f64));
            0.5 * (2.0 * std::f64::consts::PI).ln() + (x + 0.5) * t.ln() - t + series.ln()
        }
    }

    /// `P(a, x)`, the regularized lower incomplete gamma function.
    pub(super) fn regularized_lower(a: f64, x: f64) -> f64 {
        if x <= 0.0 {
            return 0.0;
        }
        let log_prefactor = a * x.ln() - x - ln_gamma(a);

        if x < a + 1.0 {
            // Series expansion
            let mut term = 1.0 / a;
            let mut sum = term;
            let mut denominator = a;
            for _ in 0..MAX_ITERATIONS {
                denominator += 1.0;
                term *= x / denominator;
                sum += term;
                if term.abs() < sum.abs() * EPSILON {
                    break;
                }
            }
            (sum * log_prefactor.exp()).clamp(0.0, 1.0)
        } else {
            // Continued fraction for the upper function, modified Lentz
            let mut b = x + 1.0 - a;
            let mut c = 1.0 / FLOOR;
            let mut d = 1.0 / b;
            let mut h = d;
            for i in 1..=MAX_ITERATIONS {
                let i = i as f64;
                let an = -i * (i - a);
                b += 2.0;
                d = an * d + b;
                if d.abs() < FLOOR {
                    d = FLOOR;
                }
                c = b + an / c;
                if c.abs() < FLOOR {
                    c = FLOOR;
                }
                d = 1.0 / d;
                let delta = d * c;
                h *= delta;
                if (delta - 1.0).abs() < EPSILON {
                    break;
                }
            }
            (1.0 - log_prefactor.exp() * h).clamp(0.0, 1.0)
        }
    }

    pub(super) fn cdf(shape: f64, rate: f64, x: f64) -> f64 {
        regularized_lower(shape, rate * x)
    }
}

struct KernelPlugin {
    kernel: Option<Rc<InfectiousnessKernel>>,
}

impl DataPlugin for KernelPlugin {
    const new: &'static dyn Fn() -> Self = &|| KernelPlugin { kernel: None };
}

pub trait ContextKernelExt {
    /// Builds the kernel from the context's parameters. Calling it again is a no-op.
    fn init_kernel(&mut self) -> Result<(), EpiError>;

    fn get_kernel(&self) -> Option<&InfectiousnessKernel>;
}

impl ContextKernelExt for Context {
    fn init_kernel(&mut self) -> Result<(), EpiError> {
        shared_kernel(self).map(|_| ())
    }

    fn get_kernel(&self) -> Option<&InfectiousnessKernel> {
        self.get_data_container::<KernelPlugin>()
            .and_then(|plugin| plugin.kernel.as_deref())
    }
}

/// The run's kernel, built from the parameters on first use.
pub(crate) fn shared_kernel(context: &mut Context) -> Result<Rc<InfectiousnessKernel>, EpiError> {
    if let Some(kernel) = context
        .get_data_container::<KernelPlugin>()
        .and_then(|plugin| plugin.kernel.clone())
    {
        return Ok(kernel);
    }

    let parameters = shared_parameters(context)?;
    let kernel = Rc::new(InfectiousnessKernel::for_parameters(&parameters)?);
    debug!(
        "infectiousness kernel covers {} ticks with total mass {:.6}",
        kernel.len(),
        kernel.total()
    );
    context.get_data_container_mut::<KernelPlugin>().kernel = Some(Rc::clone(&kernel));
    Ok(kernel)
}
