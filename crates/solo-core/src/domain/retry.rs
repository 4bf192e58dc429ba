//! Retry policy: decides backoff delays.
//!
//! Used for two things: the stage failure budget (how long a collaborator
//! should wait before retrying a stage) and replication retries (pull/push
//! against an unreachable or conflicting remote).

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Base delay for the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Upper bound for a single delay.
    pub max_delay: Duration,

    /// Fraction of the delay added as random jitter (0.0 disables it).
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, multiplier: f64) -> Self {
        Self {
            base_delay,
            multiplier,
            max_delay: Duration::from_secs(300),
            jitter: 0.0,
        }
    }

    /// 2s base, doubling, capped at five minutes.
    pub fn default_v1() -> Self {
        Self::new(Duration::from_secs(2), 2.0)
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Delay before the next retry: `base_delay * multiplier^(attempts - 1)`.
    ///
    /// `attempts` is 1-indexed (the number of failures so far); 0 is treated as 1.
    ///
    /// With base_delay=2s, multiplier=2.0:
    /// - attempt 1: 2s
    /// - attempt 2: 4s
    /// - attempt 3: 8s
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// `next_delay` plus up to `jitter * delay` of random spread, so nodes
    /// that failed together do not retry in lockstep.
    pub fn next_delay_jittered(&self, attempts: u32) -> Duration {
        let delay = self.next_delay(attempts);
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = delay.as_secs_f64() * self.jitter;
        let extra = rand::thread_rng().gen_range(0.0..=spread);
        delay + Duration::from_secs_f64(extra)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::default_v1()
    }
}
