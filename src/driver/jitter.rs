//! Connect jitter.
//!
//! Each new socket waits a random delay before dialing so a burst of
//! requests does not hit the server at the same instant.

use std::time::Duration;

use rand::{Rng, SeedableRng, rngs::StdRng};

/// Source of per-socket dial delays.
pub trait JitterPolicy: Send {
    fn delay(&mut self) -> Duration;
}

/// Uniform delay in `[min, max]`, millisecond resolution.
#[derive(Debug)]
pub struct UniformJitter {
    min: Duration,
    max: Duration,
    rng: StdRng,
}

impl UniformJitter {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            rng: StdRng::from_os_rng(),
        }
    }

    /// Reproducible sequence for tests and benchmarks.
    pub fn seeded(min: Duration, max: Duration, seed: u64) -> Self {
        Self {
            min,
            max,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl JitterPolicy for UniformJitter {
    fn delay(&mut self) -> Duration {
        let lo = self.min.as_millis() as u64;
        let hi = self.max.as_millis() as u64;
        if hi <= lo {
            return self.min;
        }
        Duration::from_millis(self.rng.random_range(lo..=hi))
    }
}

/// "Full jitter" backoff: uniform in `[0, min(max, base * 2^n)]` where `n`
/// counts the delays drawn so far.
#[derive(Debug)]
pub struct ExponentialJitter {
    base: Duration,
    max: Duration,
    attempt: u32,
    rng: StdRng,
}

impl ExponentialJitter {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
            rng: StdRng::from_os_rng(),
        }
    }

    pub fn seeded(base: Duration, max: Duration, seed: u64) -> Self {
        Self {
            base,
            max,
            attempt: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl JitterPolicy for ExponentialJitter {
    fn delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        let cap = self.base.saturating_mul(factor).min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        let cap_ms = cap.as_millis() as u64;
        Duration::from_millis(self.rng.random_range(0..=cap_ms))
    }
}

/// Dial immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoJitter;

impl JitterPolicy for NoJitter {
    fn delay(&mut self) -> Duration {
        Duration::ZERO
    }
}
