use rustc_hash::FxHasher;
use std::hash::Hasher;

/// A hash of `data` that is stable across runs and platforms, used to derive per-stream seeds.
pub fn hash_str(data: &str) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write(data.as_bytes());
    hasher.finish()
}
