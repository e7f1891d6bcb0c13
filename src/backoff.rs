//! Exponential backoff with jitter
//!
//! `delay = u * base_delay * 2^min(exponent, max_exponent)` with `u` drawn
//! uniformly from `[0, 1)`, or `u = 1` when jitter is off.
//!
//! The transport and the supervisor each own one `Backoff`; they are never
//! shared.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay unit multiplied by `2^exponent`
    #[serde(rename = "base_delay_ms", with = "millis")]
    pub base_delay: Duration,
    /// Cap on the exponent
    pub max_exponent: u32,
    /// Scale each delay by a uniform random factor
    #[serde(default = "default_true")]
    pub jitter: bool,
}

fn default_true() -> bool {
    true
}

impl BackoffConfig {
    /// Raw-socket reconnects: 120ms units, up to 2^7.
    pub fn transport() -> Self {
        Self {
            base_delay: Duration::from_millis(120),
            max_exponent: 7,
            jitter: true,
        }
    }

    /// Full authenticated reconnects: 1s units, up to 2^6.
    pub fn session() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_exponent: 6,
            jitter: true,
        }
    }

    /// Largest delay this config can produce.
    pub fn max_delay(&self) -> Duration {
        self.base_delay.saturating_mul(1u32 << self.max_exponent.min(31))
    }
}

/// Consecutive-failure counter.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    exponent: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            exponent: 0,
        }
    }

    pub fn exponent(&self) -> u32 {
        self.exponent
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Upper bound for the next delay.
    pub fn ceiling(&self) -> Duration {
        let shift = self.exponent.min(self.config.max_exponent).min(31);
        self.config.base_delay.saturating_mul(1u32 << shift)
    }

    /// Delay before the next attempt, at the current exponent.
    pub fn delay(&self) -> Duration {
        let ceiling = self.ceiling();
        if self.config.jitter {
            ceiling.mul_f64(rand::random::<f64>())
        } else {
            ceiling
        }
    }

    /// One more consecutive failure. Saturates at `max_exponent`.
    pub fn record_failure(&mut self) {
        if self.exponent < self.config.max_exponent {
            self.exponent += 1;
        }
    }

    pub fn reset(&mut self) {
        self.exponent = 0;
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
