use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;

use crate::batch::options::Backoff;

/// Outcome of consulting the [`RetryPolicy`] after an attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Nothing left to resubmit
    Complete,
    /// Resubmit the remaining items after the delay
    Retry(Duration),
    /// Attempt ceiling reached with items still pending
    Exhausted,
}

/// Decides whether unprocessed items are resubmitted and when
///
/// With jitter enabled, the delay drawn for an attempt index always differs
/// from the previous draw for that same index.
#[derive(Debug)]
pub struct RetryPolicy {
    max_attempts: usize,
    backoff: Backoff,
    last_draws: Mutex<HashMap<usize, Duration>>,
}

impl Clone for RetryPolicy {
    fn clone(&self) -> Self {
        Self::new(self.max_attempts, self.backoff.clone())
    }
}

impl RetryPolicy {
    /// Policy allowing `max_attempts` calls per chunk (first try included)
    pub fn new(max_attempts: usize, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            last_draws: Mutex::new(HashMap::new()),
        }
    }

    /// Attempt ceiling
    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Decide after `attempt` (1-based) calls with `unprocessed` items left
    pub fn decide(&self, attempt: usize, unprocessed: usize) -> RetryDecision {
        if unprocessed == 0 {
            RetryDecision::Complete
        } else if attempt >= self.max_attempts {
            RetryDecision::Exhausted
        } else {
            RetryDecision::Retry(self.delay(attempt))
        }
    }

    /// Delay before the attempt following `attempt`
    ///
    /// Equal jitter: a uniform draw from `[capped / 2, capped]` at nanosecond
    /// granularity, excluding the previous draw for the same attempt.
    pub fn delay(&self, attempt: usize) -> Duration {
        let capped = retry_delay(
            attempt.saturating_sub(1),
            self.backoff.base_delay,
            self.backoff.max_delay,
        );
        if !self.backoff.jitter {
            return capped;
        }

        let ceiling = u64::try_from(capped.as_nanos()).unwrap_or(u64::MAX);
        let floor = ceiling / 2;
        let mut last_draws = self.last_draws.lock();
        let previous = last_draws
            .get(&attempt)
            .and_then(|last| u64::try_from(last.as_nanos()).ok())
            .filter(|last| (floor..=ceiling).contains(last) && floor < ceiling);

        let nanos = match previous {
            // Draw from the range with `last` removed, then shift past it.
            Some(last) => {
                let drawn = rand::thread_rng().gen_range(floor..ceiling);
                if drawn >= last { drawn + 1 } else { drawn }
            }
            None => rand::thread_rng().gen_range(floor..=ceiling),
        };
        let delay = Duration::from_nanos(nanos);
        let _ = last_draws.insert(attempt, delay);
        delay
    }
}

/// Calculate retry delay with exponential backoff
///
/// `attempt` is 0-based; the result doubles per attempt and never exceeds `max`.
pub(crate) fn retry_delay(attempt: usize, initial: Duration, max: Duration) -> Duration {
    let factor = 2u64.checked_pow(u32::try_from(attempt).unwrap_or(u32::MAX));
    let initial_ns = u64::try_from(initial.as_nanos()).unwrap_or(u64::MAX);
    let max_ns = u64::try_from(max.as_nanos()).unwrap_or(u64::MAX);
    let delay_ns = factor
        .and_then(|f| initial_ns.checked_mul(f))
        .unwrap_or(u64::MAX);
    Duration::from_nanos(delay_ns.min(max_ns))
}
