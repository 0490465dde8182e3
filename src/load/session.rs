//! One simulated client session

use super::{SessionDriver, SessionState, StateCell};
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How a session reloads the page after the initial load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    /// Reload once every `interval`
    Manual {
        /// Cadence between reloads
        interval: Duration,
    },
    /// Let the page refresh itself
    Auto,
}

/// Timing parameters for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Total time the session runs
    pub duration: Duration,
    /// Reload strategy
    pub refresh: RefreshMode,
    /// Loop granularity; bounds how long a stop request takes to be noticed
    pub tick: Duration,
}

impl SessionConfig {
    /// Default loop granularity
    pub const DEFAULT_TICK: Duration = Duration::from_millis(500);

    /// Manual refresh every `interval` for `duration`
    #[must_use]
    pub const fn manual(duration: Duration, interval: Duration) -> Self {
        Self {
            duration,
            refresh: RefreshMode::Manual { interval },
            tick: Self::DEFAULT_TICK,
        }
    }

    /// Page-driven auto-refresh for `duration`
    #[must_use]
    pub const fn auto(duration: Duration) -> Self {
        Self {
            duration,
            refresh: RefreshMode::Auto,
            tick: Self::DEFAULT_TICK,
        }
    }

    /// Override the loop granularity
    #[must_use]
    pub const fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }
}

/// Final view of one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionReport {
    /// Session identifier
    pub id: String,
    /// Terminal state
    pub state: SessionState,
    /// Page loads performed (initial load plus manual refreshes)
    pub triggers: u64,
    /// Error that failed the session, if any
    pub error: Option<String>,
}

enum Exit {
    Completed,
    Cancelled,
}

/// A bounded-duration interaction loop with cooperative cancellation.
///
/// `stop` may be called from any task; it never interrupts a page load in
/// progress, it only prevents the next one. A page load that fails after a
/// stop was requested ends the session as cancelled.
#[derive(Debug)]
pub struct LoadSession {
    id: String,
    query: Option<String>,
    config: SessionConfig,
    state: StateCell,
    cancel: AtomicBool,
    triggers: AtomicU64,
    error: Mutex<Option<String>>,
}

impl LoadSession {
    /// Create an unstarted session
    #[must_use]
    pub fn new(id: impl Into<String>, query: Option<String>, config: SessionConfig) -> Self {
        Self {
            id: id.into(),
            query,
            config,
            state: StateCell::new(),
            cancel: AtomicBool::new(false),
            triggers: AtomicU64::new(0),
            error: Mutex::new(None),
        }
    }

    /// Session identifier
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Query this session is pinned to
    #[must_use]
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// Page loads so far
    #[must_use]
    pub fn triggers(&self) -> u64 {
        self.triggers.load(Ordering::Acquire)
    }

    /// Request cancellation; returns `false` if already requested
    pub fn stop(&self) -> bool {
        !self.cancel.swap(true, Ordering::AcqRel)
    }

    /// Whether cancellation has been requested
    #[must_use]
    pub fn is_stop_requested(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Snapshot for aggregation
    #[must_use]
    pub fn report(&self) -> SessionReport {
        SessionReport {
            id: self.id.clone(),
            state: self.state(),
            triggers: self.triggers(),
            error: self.error.lock().clone(),
        }
    }

    /// Mark the session failed without running it
    pub(crate) fn fail(&self, err: &Error) {
        if self.state.advance(SessionState::Failed) {
            *self.error.lock() = Some(err.to_string());
        }
    }

    /// Run the loop to a terminal state, then clean the driver up.
    ///
    /// A second call on the same session returns the existing report.
    pub async fn run(&self, driver: &mut dyn SessionDriver) -> SessionReport {
        if !self.state.advance(SessionState::Running) {
            return self.report();
        }
        info!(session = %self.id, "session started");

        let auto = self.config.refresh == RefreshMode::Auto;
        let outcome = self.drive(driver).await;

        if auto {
            if let Err(err) = driver.stop_auto_refresh().await {
                debug!(session = %self.id, error = %err, "could not deactivate auto-refresh");
            }
        }
        driver.close().await;

        match outcome {
            Ok(Exit::Completed) => {
                self.state.advance(SessionState::Completed);
            }
            Ok(Exit::Cancelled) => {
                self.state.advance(SessionState::Cancelled);
            }
            Err(err) if self.is_stop_requested() => {
                debug!(session = %self.id, error = %err, "page load failed after stop was requested");
                self.state.advance(SessionState::Cancelled);
            }
            Err(err) => {
                warn!(session = %self.id, error = %err, "session failed");
                self.fail(&err);
            }
        }

        let report = self.report();
        info!(session = %self.id, state = %report.state, triggers = report.triggers, "session finished");
        report
    }

    async fn drive(&self, driver: &mut dyn SessionDriver) -> Result<Exit> {
        let started = Instant::now();
        if self.is_stop_requested() {
            return Ok(Exit::Cancelled);
        }

        driver.open().await?;
        self.triggers.fetch_add(1, Ordering::AcqRel);
        debug!(session = %self.id, "loaded initial page");

        if self.config.refresh == RefreshMode::Auto {
            match driver.start_auto_refresh().await {
                Ok(()) => debug!(session = %self.id, "activated auto-refresh"),
                Err(err) => warn!(session = %self.id, error = %err, "could not activate auto-refresh"),
            }
        }

        let mut refreshes: u32 = 0;
        while started.elapsed() < self.config.duration {
            if self.is_stop_requested() {
                return Ok(Exit::Cancelled);
            }
            if let RefreshMode::Manual { interval } = self.config.refresh {
                if started.elapsed() > interval * (refreshes + 1) {
                    driver.refresh().await?;
                    refreshes += 1;
                    self.triggers.fetch_add(1, Ordering::AcqRel);
                    debug!(session = %self.id, refresh = refreshes, "manual refresh");
                }
            }
            tokio::time::sleep(self.config.tick).await;
        }
        Ok(Exit::Completed)
    }
}
