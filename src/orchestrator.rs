//! Experiment orchestration
//!
//! `ExperimentOrchestrator` is the explicit context object behind the
//! comparison endpoint. It owns both environments, the per-identity
//! history, and the selector, and exposes the three entry points the
//! request layer needs: `ensure_ready`, `handle_request`, and `shutdown`.

use crate::config::ExperimentConfig;
use crate::environment::runtime::{ContainerRuntime, PodmanRuntime};
use crate::environment::{BackendEnvironment, EnvironmentState};
use crate::history::{ExecutionRecord, HistoryStore};
use crate::query::driver::{SqlDriver, SqlxDriver};
use crate::query::{QueryDispatcher, QueryResult};
use crate::seed::DatasetSeeder;
use crate::selector::{resolve_variant, LocalSplitSelector, VariantSelector, QUERY_EXECUTION_METRIC};
use crate::{Error, Result, Variant};
use rand::seq::SliceRandom;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Everything the request layer renders for one request
#[derive(Debug, Clone, Serialize)]
pub struct RequestOutcome {
    /// Caller identity
    pub identity: String,
    /// Variant the query ran against
    pub variant: Variant,
    /// Query text actually executed
    pub query: String,
    /// Rows, columns, and timing
    pub result: QueryResult,
    /// Caller's history after this request, oldest first
    pub history: Vec<ExecutionRecord>,
}

/// Owns both environments and routes requests between them
pub struct ExperimentOrchestrator {
    config: ExperimentConfig,
    postgres: BackendEnvironment,
    mariadb: BackendEnvironment,
    seeder: DatasetSeeder,
    dispatcher: QueryDispatcher,
    selector: Arc<dyn VariantSelector>,
    history: HistoryStore,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for ExperimentOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExperimentOrchestrator")
            .field("postgres", &self.postgres)
            .field("mariadb", &self.mariadb)
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

impl ExperimentOrchestrator {
    /// Assemble an orchestrator from its collaborators
    #[must_use]
    pub fn new(
        config: ExperimentConfig,
        runtime: Arc<dyn ContainerRuntime>,
        driver: Arc<dyn SqlDriver>,
        selector: Arc<dyn VariantSelector>,
    ) -> Self {
        let environment = |variant| {
            BackendEnvironment::new(
                config.backend(variant).clone(),
                config.readiness,
                Arc::clone(&runtime),
                Arc::clone(&driver),
            )
        };
        let postgres = environment(Variant::Postgres);
        let mariadb = environment(Variant::MariaDb);

        let dispatcher = config
            .statement_timeout
            .map_or_else(QueryDispatcher::new, QueryDispatcher::with_timeout);

        Self {
            seeder: DatasetSeeder::new(config.batch_size),
            history: HistoryStore::new(config.history_capacity).with_max_identities(config.history_identities),
            dispatcher,
            postgres,
            mariadb,
            selector,
            config,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Production wiring: podman-compatible runtime, sqlx driver, local selector
    #[must_use]
    pub fn with_podman(config: ExperimentConfig) -> Self {
        let runtime = Arc::new(PodmanRuntime::new(config.container_runtime.clone()));
        Self::new(
            config,
            runtime,
            Arc::new(SqlxDriver::default()),
            Arc::new(LocalSplitSelector::default()),
        )
    }

    /// Active configuration
    #[must_use]
    pub const fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    /// Environment serving `variant`
    #[must_use]
    pub const fn environment(&self, variant: Variant) -> &BackendEnvironment {
        match variant {
            Variant::Postgres => &self.postgres,
            Variant::MariaDb => &self.mariadb,
        }
    }

    /// History for `identity`, oldest first
    #[must_use]
    pub fn history(&self, identity: &str) -> Vec<ExecutionRecord> {
        self.history.get(identity)
    }

    /// Whether `shutdown` has run
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Provision and seed both environments unless already done.
    ///
    /// Safe to call on every request and from many tasks at once; each
    /// environment is provisioned and seeded by exactly one caller. A call
    /// after a failure is an explicit retry.
    ///
    /// # Errors
    ///
    /// Returns the first `Error::Provisioning`/`Error::Seeding` among the
    /// two environments, or `Error::ShutDown` after `shutdown`
    pub async fn ensure_ready(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(Error::ShutDown);
        }
        if self.is_ready() {
            return Ok(());
        }

        // Both run to completion so neither is abandoned mid-provisioning
        let (postgres, mariadb) = tokio::join!(self.prepare(&self.postgres), self.prepare(&self.mariadb));
        postgres.and(mariadb)
    }

    /// Whether both environments are running and seeded
    #[must_use]
    pub fn is_ready(&self) -> bool {
        [&self.postgres, &self.mariadb]
            .iter()
            .all(|env| env.is_ready() && env.is_seeded())
    }

    async fn prepare(&self, environment: &BackendEnvironment) -> Result<()> {
        environment.ensure_running().await?;
        environment.ensure_seeded(&self.seeder, self.config.row_count).await
    }

    /// Run one query for `identity` on the variant the selector picks.
    ///
    /// A missing or blank `query` is replaced by a random sample query.
    /// Metric tracking failures are logged and never affect the result.
    ///
    /// # Errors
    ///
    /// Returns `Error::ShutDown` after `shutdown`, provisioning or seeding
    /// errors from the lazy `ensure_ready`, and `Error::Query` if the
    /// dispatch fails
    pub async fn handle_request(&self, identity: &str, query: Option<&str>) -> Result<RequestOutcome> {
        self.ensure_ready().await?;

        let query = query
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map_or_else(|| self.sample_query(), ToString::to_string);

        let variant = resolve_variant(
            self.selector.as_ref(),
            identity,
            &self.config.experiment_key,
            self.config.default_variant,
        )
        .await;

        let result = self
            .dispatcher
            .execute(self.environment(variant), &query)
            .await
            .map_err(|err| match err {
                Error::NotReady {
                    state: EnvironmentState::TornDown,
                    ..
                } => Error::ShutDown,
                other => other,
            })?;

        let history = self.history.append(
            identity,
            ExecutionRecord::new(variant, query.clone(), result.execution_time),
        );
        debug!(%identity, %variant, elapsed_us = result.execution_time.as_micros(), "request served");

        let metadata = HashMap::from([
            ("query".to_string(), query.clone()),
            ("database".to_string(), variant.label().to_string()),
        ]);
        if let Err(err) = self
            .selector
            .track(identity, QUERY_EXECUTION_METRIC, result.execution_time.as_secs_f64(), metadata)
            .await
        {
            warn!(%identity, error = %err, "failed to track query execution");
        }

        Ok(RequestOutcome {
            identity: identity.to_string(),
            variant,
            query,
            result,
            history,
        })
    }

    fn sample_query(&self) -> String {
        self.config
            .sample_queries
            .choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or_else(|| crate::config::SAMPLE_QUERIES[0].to_string())
    }

    /// Tear down both environments and release the selector.
    ///
    /// The first call performs the teardown and returns `true`; every later
    /// or concurrent call returns `false` immediately. Teardown failures are
    /// logged and swallowed. In-flight queries are not cancelled.
    pub async fn shutdown(&self) -> bool {
        if self
            .shut_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("shutdown already performed");
            return false;
        }

        info!("shutting down experiment");
        let (postgres, mariadb) = tokio::join!(self.postgres.teardown(), self.mariadb.teardown());
        for (variant, outcome) in [(Variant::Postgres, postgres), (Variant::MariaDb, mariadb)] {
            if let Err(err) = outcome {
                error!(%variant, error = %err, "teardown failed");
            }
        }
        self.selector.destroy().await;
        info!("experiment shut down");
        true
    }
}
