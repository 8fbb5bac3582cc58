//! Bounded predicate polling.
//!
//! Fixed interval, bounded attempt count, no backoff: the operation's
//! phase transitions have a flat latency profile and backoff only delays
//! detection. Every iteration re-checks the supervised operation's
//! liveness and escalates to a supervision failure if it exited before the
//! predicate was satisfied.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{HarnessError, HarnessResult};

/// Tristate answer from one predicate evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredicateOutcome {
    Satisfied,
    NotYet,
    /// The probe could not produce an answer this round (transient query
    /// failure); counts as an attempt.
    Unknown,
}

/// Terminal result of a bounded poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollVerdict {
    Satisfied { attempts: u32 },
    TimedOut { attempts: u32 },
}

impl PollVerdict {
    pub fn is_satisfied(&self) -> bool {
        matches!(self, Self::Satisfied { .. })
    }
}

/// Poll cadence: `max_attempts` evaluations spaced `interval` apart.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollPolicy {
    /// Total wall-clock budget of the poll.
    pub fn budget(&self) -> Duration {
        self.interval * self.max_attempts
    }
}

/// Repeatedly evaluates a named predicate until satisfied or exhausted.
pub struct StatePoller<C: Clock> {
    policy: PollPolicy,
    clock: C,
}

impl<C: Clock> StatePoller<C> {
    pub fn new(policy: PollPolicy, clock: C) -> Self {
        Self { policy, clock }
    }

    /// Poll `predicate` until it is satisfied or the attempt budget is
    /// exhausted. `liveness` is consulted after every unsatisfied
    /// evaluation: if the supervised operation has exited without the
    /// predicate coming true, the poll escalates to a supervision failure
    /// rather than running out the clock. The predicate is evaluated
    /// first so an operation that exits right after the transition is
    /// still counted as satisfied.
    pub async fn await_predicate<L, F, Fut>(
        &self,
        label: &str,
        mut liveness: L,
        mut predicate: F,
    ) -> HarnessResult<PollVerdict>
    where
        L: FnMut() -> bool,
        F: FnMut() -> Fut,
        Fut: Future<Output = HarnessResult<PredicateOutcome>>,
    {
        info!(
            "polling '{label}' (up to {} x {:?})",
            self.policy.max_attempts, self.policy.interval
        );

        for attempt in 1..=self.policy.max_attempts {
            match predicate().await? {
                PredicateOutcome::Satisfied => {
                    info!("'{label}' satisfied after {attempt} attempt(s)");
                    return Ok(PollVerdict::Satisfied { attempts: attempt });
                }
                PredicateOutcome::NotYet => {
                    debug!("'{label}' not yet satisfied (attempt {attempt})");
                }
                PredicateOutcome::Unknown => {
                    debug!("'{label}' indeterminate this round (attempt {attempt})");
                }
            }

            if !liveness() {
                return Err(HarnessError::Supervision(format!(
                    "operation exited before '{label}' was observed (attempt {attempt})"
                )));
            }

            if attempt < self.policy.max_attempts {
                self.clock.sleep(self.policy.interval).await;
            }
        }

        warn!(
            "'{label}' not observed within {:?}",
            self.policy.budget()
        );
        Ok(PollVerdict::TimedOut {
            attempts: self.policy.max_attempts,
        })
    }
}

// ── Tests ────────────────────────────────────────────────────────────────
