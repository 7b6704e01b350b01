//! Bounded retry-with-deadline polling
//!
//! [`poll_until`] is the only place the harness blocks on the cluster. It:
//! - samples immediately, so a fast-converging cluster is never missed even
//!   with a tiny timeout
//! - waits on the tokio timer between samples, clamping the last wait to the
//!   deadline so there is always a sample taken at the deadline
//! - bounds each sample so the whole loop ends by `timeout + interval`
//! - stops early when the outer [`CancellationToken`] fires

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Default sampling interval for convergence assertions
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Budget for a cluster to become ready or to fail
pub const CONVERGENCE_TIMEOUT: Duration = Duration::from_secs(500);

/// Floor applied to every sampling interval
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Stand-in deadline for budgets too large to add to an instant
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Interval and budget of one bounded wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            timeout: CONVERGENCE_TIMEOUT,
        }
    }
}

impl PollPolicy {
    /// Intervals below [`MIN_POLL_INTERVAL`] are raised to it
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval: interval.max(MIN_POLL_INTERVAL),
            timeout,
        }
    }

    /// Same interval, different budget
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self { timeout, ..self }
    }
}

/// Result of a single sample
#[derive(Debug)]
pub enum Sample<T, P> {
    /// Target reached
    Done(T),
    /// Not yet; carries whatever was seen for diagnostics
    Pending(P),
}

/// Why a wait ended without reaching its target
#[derive(Debug)]
pub enum PollError<P> {
    TimedOut {
        elapsed: Duration,
        polls: u32,
        /// Last pending sample, if any sample completed
        last: Option<P>,
    },
    Cancelled {
        polls: u32,
        last: Option<P>,
    },
}

impl<P> PollError<P> {
    pub fn polls(&self) -> u32 {
        match self {
            PollError::TimedOut { polls, .. } | PollError::Cancelled { polls, .. } => *polls,
        }
    }

    pub fn into_last(self) -> Option<P> {
        match self {
            PollError::TimedOut { last, .. } | PollError::Cancelled { last, .. } => last,
        }
    }
}

/// Sample until `sample` returns [`Sample::Done`], the policy's deadline
/// passes, or `cancel` fires.
pub async fn poll_until<F, Fut, T, P>(
    policy: PollPolicy,
    cancel: &CancellationToken,
    mut sample: F,
) -> Result<T, PollError<P>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Sample<T, P>>,
{
    let interval = policy.interval.max(MIN_POLL_INTERVAL);
    let start = Instant::now();
    let deadline = deadline_after(start, policy.timeout);
    // Hard stop for a single slow sample
    let hard_deadline = deadline_after(deadline, interval);
    let mut polls = 0u32;
    let mut last = None;

    loop {
        if cancel.is_cancelled() {
            return Err(PollError::Cancelled { polls, last });
        }

        polls += 1;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PollError::Cancelled { polls, last }),
            outcome = tokio::time::timeout_at(hard_deadline, sample()) => outcome,
        };

        match outcome {
            Ok(Sample::Done(value)) => return Ok(value),
            Ok(Sample::Pending(seen)) => last = Some(seen),
            Err(_) => {
                tracing::debug!(polls, "Sample did not complete before the hard deadline");
                return Err(PollError::TimedOut {
                    elapsed: start.elapsed(),
                    polls,
                    last,
                });
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(PollError::TimedOut {
                elapsed: start.elapsed(),
                polls,
                last,
            });
        }

        let next = deadline_after(now, interval).min(deadline);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PollError::Cancelled { polls, last }),
            _ = tokio::time::sleep_until(next) => {}
        }
    }
}

/// `from + budget`, saturating at a far-future instant
fn deadline_after(from: Instant, budget: Duration) -> Instant {
    from.checked_add(budget)
        .or_else(|| from.checked_add(FAR_FUTURE))
        .unwrap_or(from)
}
