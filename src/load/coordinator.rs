//! Session pool and outcome aggregation

use super::session::{LoadSession, SessionConfig, SessionReport};
use super::{DriverFactory, SessionState};
use crate::{Error, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info};

/// What to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadPlan {
    /// Number of sessions
    pub sessions: usize,
    /// Per-session timing
    pub session: SessionConfig,
    /// Queries assigned round-robin; empty means each page picks its own
    pub queries: Vec<String>,
    /// Maximum sessions running at once; defaults to `sessions`
    pub pool_size: Option<usize>,
}

impl LoadPlan {
    /// Plan `sessions` sessions with the given timing
    #[must_use]
    pub const fn new(sessions: usize, session: SessionConfig) -> Self {
        Self {
            sessions,
            session,
            queries: Vec::new(),
            pool_size: None,
        }
    }

    /// Distribute `queries` across sessions round-robin
    #[must_use]
    pub fn with_queries(mut self, queries: Vec<String>) -> Self {
        self.queries = queries;
        self
    }

    /// Cap the number of concurrently running sessions
    #[must_use]
    pub const fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = Some(pool_size);
        self
    }

    /// Identifier of the `index`-th session (zero-based)
    #[must_use]
    pub fn session_id(index: usize) -> String {
        format!("session-{}", index + 1)
    }

    /// Query assigned to the `index`-th session
    #[must_use]
    pub fn query_for(&self, index: usize) -> Option<&str> {
        if self.queries.is_empty() {
            None
        } else {
            Some(self.queries[index % self.queries.len()].as_str())
        }
    }

    fn validate(&self) -> Result<()> {
        if self.sessions == 0 {
            return Err(Error::InvalidInput("at least one session is required".to_string()));
        }
        if self.pool_size == Some(0) {
            return Err(Error::InvalidInput("pool size must be > 0".to_string()));
        }
        if let super::RefreshMode::Manual { interval } = self.session.refresh {
            if interval.is_zero() {
                return Err(Error::InvalidInput("refresh interval must be > 0".to_string()));
            }
        }
        Ok(())
    }
}

/// Counts per terminal state plus wall-clock time
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregateOutcome {
    /// Sessions that ran their full duration
    pub completed: usize,
    /// Sessions stopped early
    pub cancelled: usize,
    /// Sessions that hit an error
    pub failed: usize,
    /// Time from launch until the last session finished
    pub elapsed: Duration,
    /// Per-session reports in session order
    pub reports: Vec<SessionReport>,
}

impl AggregateOutcome {
    /// Number of sessions
    #[must_use]
    pub fn total(&self) -> usize {
        self.reports.len()
    }

    /// Whether every session completed
    #[must_use]
    pub fn all_completed(&self) -> bool {
        self.completed == self.total()
    }

    /// Page loads across all sessions
    #[must_use]
    pub fn triggers(&self) -> u64 {
        self.reports.iter().map(|r| r.triggers).sum()
    }
}

/// Stops every session of one coordinator
#[derive(Debug, Clone)]
pub struct StopHandle {
    sessions: Arc<[Arc<LoadSession>]>,
}

impl StopHandle {
    /// Request cancellation of every session
    pub fn stop_all(&self) {
        let stopped = self.sessions.iter().filter(|s| s.stop()).count();
        info!(stopped, "stop requested for load sessions");
    }
}

/// Runs a fixed pool of sessions and waits for all of them
pub struct LoadCoordinator {
    plan: LoadPlan,
    factory: Arc<dyn DriverFactory>,
    sessions: Arc<[Arc<LoadSession>]>,
}

impl std::fmt::Debug for LoadCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadCoordinator")
            .field("plan", &self.plan)
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

impl LoadCoordinator {
    /// Create the session pool for `plan`
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` for an empty plan, a zero pool size, or
    /// a zero refresh interval
    pub fn new(plan: LoadPlan, factory: Arc<dyn DriverFactory>) -> Result<Self> {
        plan.validate()?;
        let sessions: Vec<Arc<LoadSession>> = (0..plan.sessions)
            .map(|i| {
                Arc::new(LoadSession::new(
                    LoadPlan::session_id(i),
                    plan.query_for(i).map(ToString::to_string),
                    plan.session,
                ))
            })
            .collect();

        Ok(Self {
            plan,
            factory,
            sessions: sessions.into(),
        })
    }

    /// Sessions in creation order
    #[must_use]
    pub fn sessions(&self) -> &[Arc<LoadSession>] {
        &self.sessions
    }

    /// Handle for stopping the pool from another task
    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            sessions: Arc::clone(&self.sessions),
        }
    }

    /// Launch every session and wait until all are terminal.
    ///
    /// One session's failure, or even its task panicking, never affects
    /// its siblings.
    pub async fn run(&self) -> AggregateOutcome {
        let started = Instant::now();
        let pool = Arc::new(Semaphore::new(self.plan.pool_size.unwrap_or(self.plan.sessions)));
        let mut tasks = JoinSet::new();

        info!(sessions = self.sessions.len(), "starting load sessions");
        for session in self.sessions.iter() {
            let session = Arc::clone(session);
            let factory = Arc::clone(&self.factory);
            let pool = Arc::clone(&pool);
            tasks.spawn(async move {
                let Ok(_permit) = pool.acquire_owned().await else {
                    session.fail(&Error::Session("worker pool closed".to_string()));
                    return;
                };
                match factory.create(session.id(), session.query()) {
                    Ok(mut driver) => {
                        session.run(driver.as_mut()).await;
                    }
                    Err(err) => session.fail(&err),
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "load session task aborted");
            }
        }

        let reports: Vec<SessionReport> = self
            .sessions
            .iter()
            .map(|session| {
                if !session.state().is_terminal() {
                    session.fail(&Error::Session("session task aborted".to_string()));
                }
                session.report()
            })
            .collect();

        let count = |state| reports.iter().filter(|r| r.state == state).count();
        let outcome = AggregateOutcome {
            completed: count(SessionState::Completed),
            cancelled: count(SessionState::Cancelled),
            failed: count(SessionState::Failed),
            elapsed: started.elapsed(),
            reports,
        };
        info!(
            completed = outcome.completed,
            cancelled = outcome.cancelled,
            failed = outcome.failed,
            elapsed_ms = outcome.elapsed.as_millis(),
            "load run finished"
        );
        outcome
    }
}
