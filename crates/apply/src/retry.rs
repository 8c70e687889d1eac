use std::time::Duration;

use mdai_core::env_or;

/// Bounded retry schedule for conflict responses.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub steps: u32,
    pub base: Duration,
    pub factor: f64,
    /// Fraction of the delay added at random, `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self { Self { steps: 5, base: Duration::from_millis(10), factor: 1.0, jitter: 0.1 } }
}

impl RetryPolicy {
    /// Defaults overridden by `MDAI_PATCH_RETRY_STEPS` / `MDAI_PATCH_RETRY_BASE_MS`.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            steps: env_or("MDAI_PATCH_RETRY_STEPS", d.steps).max(1),
            base: Duration::from_millis(env_or("MDAI_PATCH_RETRY_BASE_MS", d.base.as_millis() as u64)),
            ..d
        }
    }

    /// No sleeping between attempts.
    pub fn immediate(steps: u32) -> Self { Self { steps: steps.max(1), base: Duration::ZERO, factor: 1.0, jitter: 0.0 } }

    pub fn backoff(&self) -> Backoff { Backoff { policy: self.clone(), current: self.base } }
}

#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    current: Duration,
}

impl Backoff {
    pub fn next_delay(&mut self) -> Duration {
        let d = self.current;
        self.current = self.current.mul_f64(self.policy.factor.max(1.0));
        if self.policy.jitter <= 0.0 || d.is_zero() { return d; }
        d + d.mul_f64(self.policy.jitter * rand::random::<f64>())
    }
}
