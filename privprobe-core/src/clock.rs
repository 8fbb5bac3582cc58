//! Injectable clock so the poller's timeout logic is testable without
//! real delays.

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Time source used by the poller and the drain loop.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;
}

impl<C: Clock> Clock for &C {
    fn now(&self) -> Instant {
        (**self).now()
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        (**self).sleep(duration)
    }
}

/// Production clock backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }
}

/// Test clock: sleeps return immediately and every requested duration is
/// recorded, so a test can assert on the exact poll cadence.
#[derive(Debug, Default)]
pub struct ManualClock {
    base: Option<Instant>,
    slept: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Some(Instant::now()),
            slept: Mutex::new(Vec::new()),
        }
    }

    /// Durations passed to `sleep`, in call order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.slept.lock().unwrap().clone()
    }

    /// Sum of all virtual time slept so far.
    pub fn total_slept(&self) -> Duration {
        self.slept.lock().unwrap().iter().sum()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let elapsed = self.total_slept();
        self.base.unwrap_or_else(Instant::now) + elapsed
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        self.slept.lock().unwrap().push(duration);
        std::future::ready(())
    }
}
