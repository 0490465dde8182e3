//! Sessions that call the orchestrator directly
//!
//! Each page load is one `handle_request` with the session id as identity.
//! A failed query renders as an error page and does not end the session;
//! environment failures and shutdown do.

use super::{AutoRefresh, DriverFactory, SessionDriver};
use crate::orchestrator::ExperimentOrchestrator;
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Drives an in-process `ExperimentOrchestrator`
#[derive(Debug, Clone)]
pub struct InProcessDriverFactory {
    orchestrator: Arc<ExperimentOrchestrator>,
    auto_refresh_interval: Duration,
}

impl InProcessDriverFactory {
    /// Drive `orchestrator`
    #[must_use]
    pub const fn new(orchestrator: Arc<ExperimentOrchestrator>) -> Self {
        Self {
            orchestrator,
            auto_refresh_interval: super::HttpDriverFactory::DEFAULT_AUTO_REFRESH,
        }
    }

    /// Interval used while auto-refresh is active
    #[must_use]
    pub const fn with_auto_refresh_interval(mut self, interval: Duration) -> Self {
        self.auto_refresh_interval = interval;
        self
    }
}

impl DriverFactory for InProcessDriverFactory {
    fn create(&self, session_id: &str, query: Option<&str>) -> Result<Box<dyn SessionDriver>> {
        Ok(Box::new(InProcessDriver {
            orchestrator: Arc::clone(&self.orchestrator),
            identity: session_id.to_string(),
            query: query.map(ToString::to_string),
            auto_refresh_interval: self.auto_refresh_interval,
            auto_refresh: None,
        }))
    }
}

struct InProcessDriver {
    orchestrator: Arc<ExperimentOrchestrator>,
    identity: String,
    query: Option<String>,
    auto_refresh_interval: Duration,
    auto_refresh: Option<AutoRefresh>,
}

async fn load_page(orchestrator: &ExperimentOrchestrator, identity: &str, query: Option<&str>) -> Result<()> {
    match orchestrator.handle_request(identity, query).await {
        Ok(outcome) => {
            debug!(
                %identity,
                variant = %outcome.variant,
                elapsed_us = outcome.result.execution_time.as_micros(),
                "page rendered"
            );
            Ok(())
        }
        Err(err @ Error::Query { .. }) => {
            warn!(%identity, error = %err, "page rendered query error");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

#[async_trait]
impl SessionDriver for InProcessDriver {
    async fn open(&mut self) -> Result<()> {
        load_page(&self.orchestrator, &self.identity, self.query.as_deref()).await
    }

    async fn refresh(&mut self) -> Result<()> {
        load_page(&self.orchestrator, &self.identity, self.query.as_deref()).await
    }

    async fn start_auto_refresh(&mut self) -> Result<()> {
        if self.auto_refresh.is_some() {
            return Ok(());
        }
        let orchestrator = Arc::clone(&self.orchestrator);
        let identity = self.identity.clone();
        let query = self.query.clone();
        self.auto_refresh = Some(AutoRefresh::spawn(self.auto_refresh_interval, move || {
            let orchestrator = Arc::clone(&orchestrator);
            let identity = identity.clone();
            let query = query.clone();
            async move {
                if let Err(err) = load_page(&orchestrator, &identity, query.as_deref()).await {
                    warn!(%identity, error = %err, "auto-refresh failed");
                }
            }
        }));
        Ok(())
    }

    async fn stop_auto_refresh(&mut self) -> Result<()> {
        self.auto_refresh
            .take()
            .map(drop)
            .ok_or_else(|| Error::Session("auto-refresh is not active".to_string()))
    }

    async fn close(&mut self) {
        self.auto_refresh = None;
    }
}
