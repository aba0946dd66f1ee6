//! Injectable randomness for pacing and backoff.
//!
//! Every random delay in the crate (pacing jitter, long pauses, backoff
//! jitter, block cool-offs, solver back-off) is drawn from one [`Jitter`]
//! instance so a fixed seed reproduces the exact same schedule.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;
use std::time::Duration;

/// Seedable source of random delays.
#[derive(Debug)]
pub struct Jitter {
    rng: Mutex<StdRng>,
}

impl Jitter {
    /// Deterministic source, used by tests and reproducible runs.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn from_entropy() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Uniform delay in `[min, max]`. Collapses to `min` for empty or inverted ranges.
    pub fn between(&self, min: Duration, max: Duration) -> Duration {
        if max <= min {
            return min;
        }
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let secs = rng.gen_range(min.as_secs_f64()..=max.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    /// Uniform delay in `[0, max]`.
    pub fn up_to(&self, max: Duration) -> Duration {
        self.between(Duration::ZERO, max)
    }
}

impl Default for Jitter {
    fn default() -> Self {
        Self::from_entropy()
    }
}
