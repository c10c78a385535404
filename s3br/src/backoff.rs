//! Per-worker backoff.
//!
//! Every worker throttles itself independently.  There is no coordination between workers, so
//! when the object store starts returning `SlowDown` each worker backs off on its own, growing its
//! wait multiplicatively on failure and shrinking it gently on success.
use crate::Config;
use rand::Rng;
use std::time::Duration;

/// Compute the wait that follows a failure, given the current wait.
///
/// The result is never less than 1 and never more than `min(max_wait, current * 4)`.  With
/// `jitter` the result is chosen uniformly from that range, so that many workers hitting the same
/// throttling condition don't all retry at the same moment.
pub fn next_wait(current: u64, max_wait: u64, jitter: bool) -> u64 {
    let ceiling = current.saturating_mul(4).min(max_wait).max(1);

    if jitter {
        rand::thread_rng().gen_range(1..=ceiling)
    } else {
        ceiling
    }
}

/// Compute the wait that follows a success.  Never less than 1, never more than `current`.
pub fn decay(current: u64) -> u64 {
    ((current as f64 * 0.8).round() as u64).max(1)
}

/// Backoff state owned by a single worker
#[derive(Clone, Debug)]
pub(crate) struct Backoff {
    wait: u64,
    max_wait: u64,
    jitter: bool,
    unit_ms: u64,
}

impl Backoff {
    pub(crate) fn new(config: &Config) -> Self {
        Self {
            wait: 1,
            max_wait: config.max_wait.max(1),
            jitter: !config.no_jitter,
            unit_ms: config.backoff_unit_ms,
        }
    }

    /// The current wait, in backoff units
    #[cfg(test)]
    pub(crate) fn wait(&self) -> u64 {
        self.wait
    }

    pub(crate) fn succeeded(&mut self) {
        self.wait = decay(self.wait);
    }

    /// Record a failure and return how long the worker should sleep before its next attempt
    pub(crate) fn failed(&mut self) -> Duration {
        self.wait = next_wait(self.wait, self.max_wait, self.jitter);

        Duration::from_millis(self.unit_ms.saturating_mul(self.wait))
    }
}
