//! Single-flight gate for one-time initialization.
//!
//! The first caller runs the initializer while holding the gate. Callers that
//! arrive during that attempt wait on the same lock and then observe its
//! outcome instead of starting a second attempt. A caller that arrives after
//! a failed attempt has resolved is an explicit retry and runs again.

use crate::Result;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct Flight {
    last_failure: Option<crate::Error>,
}

/// Serializes an initializer so it runs to success at most once
#[derive(Debug, Default)]
pub struct SingleFlight {
    done: AtomicBool,
    attempts: AtomicU64,
    // Attempts that have finished, bumped under the lock before release
    settled: AtomicU64,
    flight: Mutex<Flight>,
}

impl SingleFlight {
    /// Create an unresolved gate
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an initializer has already succeeded
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Number of initializer runs started so far
    #[must_use]
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Acquire)
    }

    /// Run `init` unless it already succeeded or another caller's attempt
    /// is in flight, in which case that attempt's outcome is returned.
    ///
    /// # Errors
    ///
    /// Returns the initializer's error, or a clone of the concurrent
    /// attempt's error this caller waited on
    pub async fn run<F, Fut>(&self, init: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if self.is_done() {
            return Ok(());
        }

        let observed = self.settled.load(Ordering::Acquire);
        let mut flight = self.flight.lock().await;

        if self.is_done() {
            return Ok(());
        }
        // An attempt settled while this caller queued for the lock
        if self.settled.load(Ordering::Acquire) != observed {
            if let Some(err) = &flight.last_failure {
                return Err(err.clone());
            }
        }

        self.attempts.fetch_add(1, Ordering::AcqRel);
        let result = init().await;
        match &result {
            Ok(()) => {
                flight.last_failure = None;
                self.done.store(true, Ordering::Release);
            }
            Err(err) => flight.last_failure = Some(err.clone()),
        }
        self.settled.fetch_add(1, Ordering::AcqRel);
        result
    }
}
