//! Per-object random stream.
//!
//! Every mock object owns its own ChaCha stream. Seeding it makes noisy
//! readings and injected failures replay identically from one scan to the
//! next.

use std::f64::consts::TAU;

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Random source of one mock object.
pub struct MockRng {
    stream: Mutex<ChaCha8Rng>,
}

impl MockRng {
    /// Stream seeded with `seed`, or from OS entropy when `None`.
    pub fn new(seed: Option<u64>) -> Self {
        let stream = match seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            stream: Mutex::new(stream),
        }
    }

    /// True with probability `rate`; rates outside `[0, 1]` saturate.
    pub fn chance(&self, rate: f64) -> bool {
        match rate {
            r if r <= 0.0 || r.is_nan() => false,
            r if r >= 1.0 => true,
            r => self.stream.lock().gen_bool(r),
        }
    }

    /// Uniform sample in `[0, 1)`.
    pub fn uniform(&self) -> f64 {
        self.stream.lock().gen()
    }

    /// Uniform offset in `[-amplitude, amplitude)`.
    pub fn jitter(&self, amplitude: f64) -> f64 {
        if amplitude <= 0.0 {
            return 0.0;
        }
        self.stream.lock().gen_range(-amplitude..amplitude)
    }

    /// Counting-statistics noise around `mean` counts: a normal sample with
    /// standard deviation `sqrt(mean)`, never negative.
    pub fn counts(&self, mean: f64) -> f64 {
        if mean <= 0.0 {
            return 0.0;
        }
        let (u1, u2) = {
            let mut stream = self.stream.lock();
            (1.0 - stream.gen::<f64>(), stream.gen::<f64>())
        };
        let normal = (-2.0 * u1.ln()).sqrt() * (TAU * u2).cos();
        (mean + normal * mean.sqrt()).max(0.0)
    }
}

impl Default for MockRng {
    fn default() -> Self {
        Self::new(None)
    }
}

impl std::fmt::Debug for MockRng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MockRng")
    }
}
