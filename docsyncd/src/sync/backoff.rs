use std::time::Duration;

use rand::Rng;

/// Delay before retrying a pairing whose last run failed.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self { base, max, jitter }
    }

    /// Delay after `failures` consecutive failed runs.
    pub fn delay_with_rng<R: Rng + ?Sized>(&self, failures: u32, rng: &mut R) -> Duration {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let exponent = failures.saturating_sub(1).min(16);
        let ceiling = base_ms.saturating_mul(1u64 << exponent).min(max_ms);
        let delay_ms = if self.jitter {
            rng.gen_range(ceiling / 2..=ceiling)
        } else {
            ceiling
        };
        Duration::from_millis(delay_ms)
    }
}

/// What made a run fail, as far as retrying is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The service asked to slow down or was briefly unavailable.
    Service,
    /// Local disk, store or an aborted transfer; owed changes are kept.
    Local,
    /// Only an operator can fix it: rejected credentials or a permanent
    /// API error.
    Operator,
}

/// Retry delays for a failing pairing.
///
/// Service failures back off with jitter so pairings sharing a library do
/// not retry in lockstep. Local failures back off without it. Operator
/// failures wait the full ceiling at once.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    service: Backoff,
    local: Backoff,
    max: Duration,
}

impl RetryPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            service: Backoff::new(base, max, true),
            local: Backoff::new(base, max, false),
            max,
        }
    }

    pub fn delay(&self, class: FailureClass, failures: u32) -> Duration {
        self.delay_with_rng(class, failures, &mut rand::thread_rng())
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, class: FailureClass, failures: u32, rng: &mut R) -> Duration {
        match class {
            FailureClass::Service => self.service.delay_with_rng(failures, rng),
            FailureClass::Local => self.local.delay_with_rng(failures, rng),
            FailureClass::Operator => self.max,
        }
    }
}
