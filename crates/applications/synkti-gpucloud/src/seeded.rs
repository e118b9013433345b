//! Seeded pseudo-random draws keyed on stable entity keys
//!
//! Every random decision in the simulator (delays, failure injection, metric
//! jitter, synthetic outputs) is a pure function of
//! `(seed, entity key, draw kind, sequence number)`. Nothing holds RNG state
//! between calls, so asking the same question twice gives the same answer
//! and concurrent callers need no synchronization.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use std::time::Duration;

/// What a draw is used for; keeps independent decisions uncorrelated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum Draw {
    ProvisionDelay = 1,
    ProvisionFailure = 2,
    TeardownDelay = 3,
    JobFailure = 4,
    JobFailurePoint = 5,
    JobOutputs = 6,
    FailureCode = 7,
    IpAddress = 8,
    Utilization = 9,
    Memory = 10,
    Temperature = 11,
    Power = 12,
    EntityId = 13,
}

/// Stateless seeded random source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Seeded {
    seed: u64,
}

impl Seeded {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Fresh RNG for one `(key, draw, n)` triple
    pub fn rng(&self, key: &str, draw: Draw, n: u64) -> StdRng {
        StdRng::seed_from_u64(mix(self.seed, key, draw as u64, n))
    }

    /// Uniform value in `[0, 1)`
    pub fn unit(&self, key: &str, draw: Draw) -> f64 {
        self.rng(key, draw, 0).r#gen::<f64>()
    }

    /// `true` with probability `p`
    pub fn chance(&self, key: &str, draw: Draw, p: f64) -> bool {
        if p <= 0.0 {
            return false;
        }
        if p >= 1.0 {
            return true;
        }
        self.unit(key, draw) < p
    }

    /// Uniform duration in `[min, max]`
    pub fn duration_between(&self, key: &str, draw: Draw, min: Duration, max: Duration) -> Duration {
        if max <= min {
            return min;
        }
        let span = (max - min).as_secs_f64();
        min + Duration::from_secs_f64(span * self.unit(key, draw))
    }

    /// Synthetic error code in `[1000, 9999]`
    pub fn error_code(&self, key: &str, draw: Draw) -> u32 {
        self.rng(key, draw, 0).gen_range(1000..=9999)
    }

    /// Uuid-shaped value for the `n`-th entity of a kind
    pub fn uuid(&self, key: &str, draw: Draw, n: u64) -> uuid::Uuid {
        let mut bytes = [0u8; 16];
        self.rng(key, draw, n).fill(&mut bytes[..]);
        uuid::Builder::from_random_bytes(bytes).into_uuid()
    }

    /// Gaussian jitter with standard deviation `amplitude / 2`, clamped to
    /// `[-amplitude, amplitude]`
    pub fn jitter(&self, key: &str, draw: Draw, bucket: u64, amplitude: f64) -> f64 {
        if amplitude <= 0.0 {
            return 0.0;
        }
        let mut rng = self.rng(key, draw, bucket);
        match Normal::new(0.0, amplitude / 2.0) {
            Ok(normal) => normal.sample(&mut rng).clamp(-amplitude, amplitude),
            Err(_) => 0.0,
        }
    }
}

/// FNV-1a over the key, folded with seed, draw and sequence through a
/// splitmix64 finalizer
fn mix(seed: u64, key: &str, draw: u64, n: u64) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut h = FNV_OFFSET;
    for byte in key.as_bytes() {
        h ^= u64::from(*byte);
        h = h.wrapping_mul(FNV_PRIME);
    }
    splitmix(h ^ splitmix(seed ^ splitmix(draw.wrapping_mul(0x9e37_79b9_7f4a_7c15) ^ n)))
}

fn splitmix(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}
