//! Concurrent load generation
//!
//! A `LoadCoordinator` runs a pool of `LoadSession`s. Each session acts
//! like one browser tab on the comparison page: an initial load, then
//! manual refreshes at a fixed cadence or the page's own auto-refresh,
//! until its duration runs out or it is stopped. How a "page load" is
//! performed is behind `SessionDriver`: over HTTP against a running
//! endpoint, or in-process against an `ExperimentOrchestrator`.

pub mod coordinator;
pub mod http;
pub mod in_process;
pub mod session;

pub use coordinator::{AggregateOutcome, LoadCoordinator, LoadPlan, StopHandle};
pub use http::HttpDriverFactory;
pub use in_process::InProcessDriverFactory;
pub use session::{LoadSession, RefreshMode, SessionConfig, SessionReport};

use crate::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Lifecycle of one load session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum SessionState {
    /// Created, not yet running
    Unstarted = 0,
    /// Loop in progress
    Running = 1,
    /// Duration elapsed normally
    Completed = 2,
    /// Stopped through its cancellation flag
    Cancelled = 3,
    /// The driver reported an error
    Failed = 4,
}

impl SessionState {
    /// Whether no further transition is possible
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Unstarted,
            1 => Self::Running,
            2 => Self::Completed,
            3 => Self::Cancelled,
            _ => Self::Failed,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unstarted => "unstarted",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        })
    }
}

/// Atomic `SessionState` that only moves forward
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) const fn new() -> Self {
        Self(AtomicU8::new(SessionState::Unstarted as u8))
    }

    pub(crate) fn get(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Unstarted -> Running -> terminal, or Unstarted -> terminal directly.
    /// Returns whether the move happened.
    pub(crate) fn advance(&self, next: SessionState) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                let current = SessionState::from_u8(raw);
                let allowed = match next {
                    SessionState::Unstarted => false,
                    SessionState::Running => current == SessionState::Unstarted,
                    _ => !current.is_terminal(),
                };
                allowed.then_some(next as u8)
            })
            .is_ok()
    }
}

/// One simulated client's view of the comparison page
#[async_trait]
pub trait SessionDriver: Send {
    /// Initial page load
    async fn open(&mut self) -> Result<()>;

    /// Reload the page once
    async fn refresh(&mut self) -> Result<()>;

    /// Turn on the page's own periodic refresh
    async fn start_auto_refresh(&mut self) -> Result<()>;

    /// Turn the periodic refresh off again
    async fn stop_auto_refresh(&mut self) -> Result<()>;

    /// Release the session's resources
    async fn close(&mut self);
}

/// Creates one driver per session
pub trait DriverFactory: Send + Sync {
    /// Driver for `session_id`, optionally pinned to one query
    ///
    /// # Errors
    ///
    /// Returns `Error::Session` if the client cannot be built
    fn create(&self, session_id: &str, query: Option<&str>) -> Result<Box<dyn SessionDriver>>;
}

/// Background periodic refresh, aborted on drop
#[derive(Debug)]
pub(crate) struct AutoRefresh(JoinHandle<()>);

impl AutoRefresh {
    pub(crate) fn spawn<F, Fut>(every: Duration, mut reload: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        Self(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately; the page was just loaded
            ticker.tick().await;
            loop {
                ticker.tick().await;
                reload().await;
            }
        }))
    }
}

impl Drop for AutoRefresh {
    fn drop(&mut self) {
        self.0.abort();
    }
}
