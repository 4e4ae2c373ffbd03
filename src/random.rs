/*!

Named, reproducible random streams.

Each stream is declared with [`define_rng!`] and is backed by its own `StdRng`, seeded with the
context's base seed offset by a stable hash of the stream's name. Streams are created lazily the
first time they are sampled, so adding a new stream never perturbs the draws of existing ones.

*/

use crate::{
    context::{Context, DataPlugin},
    hashing::hash_str,
    log::trace,
    type_of,
    TypeId,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rustc_hash::FxHashMap;
use std::any::Any;

/// Identifies a random stream. Implement it with [`define_rng!`] rather than by hand.
pub trait RngId: Any {
    #![allow(non_upper_case_globals)]
    const name: &'static str;
}

struct RngPlugin {
    base_seed: Option<u64>,
    rng_map: FxHashMap<TypeId, StdRng>,
}

impl RngPlugin {
    fn get_rng<R: RngId>(&mut self) -> &mut StdRng {
        let base_seed = self
            .base_seed
            .unwrap_or_else(|| panic!("random stream {} sampled before `init_random`", R::name));

        self.rng_map
            .entry(type_of::<R>())
            .or_insert_with(|| StdRng::seed_from_u64(base_seed.wrapping_add(hash_str(R::name))))
    }
}

impl DataPlugin for RngPlugin {
    const new: &'static dyn Fn() -> Self = &|| RngPlugin {
        base_seed: None,
        rng_map: FxHashMap::default(),
    };
}

pub trait ContextRandomExt {
    /// Sets the base seed and discards every existing stream, so that all streams are re-seeded
    /// when next sampled.
    fn init_random(&mut self, base_seed: u64);

    /// Applies `sampler` to the generator for stream `R`.
    /// Panics if `init_random` has not been called.
    fn sample<R: RngId, T>(&mut self, sampler: impl FnOnce(&mut StdRng) -> T) -> T;

    /// Draws a single uniform value in `[0, 1)` from stream `R`.
    fn sample_uniform<R: RngId>(&mut self) -> f64;

    /// Returns `true` with probability `p`. Always consumes exactly one uniform draw, including
    /// at `p == 0` and `p == 1`, so the position of every later draw in the stream does not
    /// depend on the probabilities of earlier ones.
    fn sample_bernoulli<R: RngId>(&mut self, p: f64) -> bool;
}

impl ContextRandomExt for Context {
    fn init_random(&mut self, base_seed: u64) {
        trace!("initializing random module with base seed {base_seed}");
        let rng_container = self.get_data_container_mut::<RngPlugin>();
        rng_container.base_seed = Some(base_seed);
        rng_container.rng_map.clear();
    }

    fn sample<R: RngId, T>(&mut self, sampler: impl FnOnce(&mut StdRng) -> T) -> T {
        let rng = self.get_data_container_mut::<RngPlugin>().get_rng::<R>();
        sampler(rng)
    }

    fn sample_uniform<R: RngId>(&mut self) -> f64 {
        self.sample::<R, f64>(|rng| rng.random::<f64>())
    }

    fn sample_bernoulli<R: RngId>(&mut self, p: f64) -> bool {
        debug_assert!((0.0..=1.0).contains(&p), "probability {p} outside [0, 1]");
        self.sample_uniform::<R>() < p
    }
}

/// Declares a named random stream usable with [`ContextRandomExt`].
#[macro_export]
macro_rules! define_rng {
    ($vis:vis $random_id:ident) => {
        $vis struct $random_id;

        impl $crate::random::RngId for $random_id {
            #![allow(non_upper_case_globals)]
            const name: &'static str = stringify!($random_id);
        }
    };
}
#[allow(unused_imports)]
pub use crate::define_rng;
