//! Process-wide random number generator.
//!
//! The only stochastic step in the pipeline is the 50/50 split of merged
//! observations used for the CC(1/2) estimate. The generator is a PCG held
//! behind a process-wide lock and is reseedable so that correlation
//! coefficients are reproducible across runs.

use once_cell::sync::Lazy;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use std::sync::Mutex;

static RNG: Lazy<Mutex<Pcg64>> = Lazy::new(|| Mutex::new(Pcg64::seed_from_u64(0)));

/// Reseed the process generator. Call before merging when CC values must be
/// reproducible.
pub fn seed(state: u64) {
    *RNG.lock().expect("rng poisoned") = Pcg64::seed_from_u64(state);
}

/// Draw a uniform integer in `[0, bound)`.
pub(crate) fn below(bound: usize) -> usize {
    RNG.lock().expect("rng poisoned").gen_range(0..bound)
}

/// Fisher-Yates shuffle with the process generator.
pub(crate) fn shuffle<T>(items: &mut [T]) {
    let mut rng = RNG.lock().expect("rng poisoned");
    for i in (1..items.len()).rev() {
        let j = rng.gen_range(0..=i);
        items.swap(i, j);
    }
}

/// Serialises tests that seed the process generator; without it parallel
/// test threads interleave their draws.
#[cfg(test)]
pub(crate) fn test_lock() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
