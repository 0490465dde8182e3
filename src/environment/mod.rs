//! Backend environments
//!
//! A `BackendEnvironment` owns one ephemeral database container for one
//! variant: provisioning, readiness probing, the seeded-dataset marker, and
//! teardown.
//!
//! ## Lifecycle
//!
//! ```text
//! Unprovisioned ──> Starting ──> Ready ──> TornDown
//!                      │           │
//!                      │           │ (seeding error)
//!                      v           v
//!                      └──────> Failed ──> Starting (explicit retry)
//! ```

pub mod runtime;
pub mod single_flight;

use crate::config::{BackendConfig, ReadinessPolicy};
use crate::query::driver::SqlDriver;
use crate::seed::DatasetSeeder;
use crate::{Error, Result, Variant};
use parking_lot::RwLock;
use runtime::{ContainerRuntime, ContainerStatus};
use serde::{Deserialize, Serialize};
use single_flight::SingleFlight;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Lifecycle state of an environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvironmentState {
    /// No provisioning attempted yet
    Unprovisioned,
    /// Container starting or readiness probe in progress
    Starting,
    /// Container accepted a readiness probe
    Ready,
    /// Provisioning or seeding failed; terminal until an explicit retry
    Failed,
    /// Container stopped and removed
    TornDown,
}

impl fmt::Display for EnvironmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unprovisioned => "unprovisioned",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::TornDown => "torn down",
        };
        f.write_str(name)
    }
}

/// Connection parameters for one environment
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    /// Variant (selects the wire protocol)
    pub variant: Variant,
    /// Host
    pub host: String,
    /// Port
    pub port: u16,
    /// Database name
    pub database: String,
    /// Login user
    pub user: String,
    /// Login password
    pub password: String,
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("variant", &self.variant)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// One named, ephemeral backend instance
pub struct BackendEnvironment {
    config: BackendConfig,
    descriptor: ConnectionDescriptor,
    readiness: ReadinessPolicy,
    runtime: Arc<dyn ContainerRuntime>,
    driver: Arc<dyn SqlDriver>,
    state: RwLock<EnvironmentState>,
    provision: SingleFlight,
    dataset: SingleFlight,
    // Held by provisioning and teardown so they never interleave
    lifecycle: Mutex<()>,
}

impl fmt::Debug for BackendEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendEnvironment")
            .field("variant", &self.variant())
            .field("container", &self.config.container_name)
            .field("state", &self.state())
            .field("seeded", &self.is_seeded())
            .finish_non_exhaustive()
    }
}

impl BackendEnvironment {
    /// Create an unprovisioned environment
    #[must_use]
    pub fn new(
        config: BackendConfig,
        readiness: ReadinessPolicy,
        runtime: Arc<dyn ContainerRuntime>,
        driver: Arc<dyn SqlDriver>,
    ) -> Self {
        let descriptor = config.descriptor();
        Self {
            config,
            descriptor,
            readiness,
            runtime,
            driver,
            state: RwLock::new(EnvironmentState::Unprovisioned),
            provision: SingleFlight::new(),
            dataset: SingleFlight::new(),
            lifecycle: Mutex::new(()),
        }
    }

    /// Variant served by this environment
    #[must_use]
    pub const fn variant(&self) -> Variant {
        self.config.variant
    }

    /// Container name
    #[must_use]
    pub fn container_name(&self) -> &str {
        &self.config.container_name
    }

    /// Connection parameters
    #[must_use]
    pub const fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    /// SQL driver bound to this environment
    #[must_use]
    pub fn driver(&self) -> &dyn SqlDriver {
        self.driver.as_ref()
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> EnvironmentState {
        *self.state.read()
    }

    /// Whether queries may be dispatched
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state() == EnvironmentState::Ready
    }

    /// Whether the dataset has been loaded
    #[must_use]
    pub fn is_seeded(&self) -> bool {
        self.dataset.is_done()
    }

    /// Move to `next` only from `expected`; teardown always wins
    fn transition(&self, expected: EnvironmentState, next: EnvironmentState) -> bool {
        let mut state = self.state.write();
        if *state != expected {
            return false;
        }
        debug!(variant = %self.variant(), from = %*state, to = %next, "environment transition");
        *state = next;
        true
    }

    fn set_state(&self, next: EnvironmentState) {
        let mut state = self.state.write();
        if *state != next {
            debug!(variant = %self.variant(), from = %*state, to = %next, "environment transition");
            *state = next;
        }
    }

    /// Ensure the container exists, is running, and accepts connections.
    ///
    /// Concurrent callers share a single provisioning attempt.
    ///
    /// # Errors
    ///
    /// Returns `Error::Provisioning` if the runtime fails or the readiness
    /// budget is exhausted, `Error::ShutDown` after teardown
    pub async fn ensure_running(&self) -> Result<()> {
        if self.state() == EnvironmentState::TornDown {
            return Err(Error::ShutDown);
        }
        self.provision.run(|| self.provision_once()).await
    }

    async fn provision_once(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state() == EnvironmentState::TornDown {
            return Err(Error::ShutDown);
        }

        self.set_state(EnvironmentState::Starting);
        let result = self.start_container().await;
        let result = match result {
            Ok(()) => self.wait_until_ready().await,
            Err(err) => Err(err),
        };

        match &result {
            Ok(()) => {
                self.set_state(EnvironmentState::Ready);
                info!(variant = %self.variant(), container = %self.container_name(), "environment ready");
            }
            Err(err) => {
                self.set_state(EnvironmentState::Failed);
                warn!(variant = %self.variant(), error = %err, "environment failed to provision");
            }
        }
        result
    }

    async fn start_container(&self) -> Result<()> {
        let name = self.container_name();
        let status = self
            .runtime
            .status(name)
            .await
            .map_err(|e| self.provisioning_error(e))?;

        match status {
            ContainerStatus::Running => {
                debug!(container = %name, "container already running");
                Ok(())
            }
            ContainerStatus::Stopped => {
                info!(container = %name, "starting existing container");
                self.runtime
                    .start(name)
                    .await
                    .map_err(|e| self.provisioning_error(e))
            }
            ContainerStatus::Absent => {
                info!(container = %name, image = %self.config.image, "creating container");
                self.runtime
                    .run(&self.config.container_spec())
                    .await
                    .map_err(|e| self.provisioning_error(e))
            }
        }
    }

    async fn wait_until_ready(&self) -> Result<()> {
        let attempts = self.readiness.attempts;
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.driver.ping(&self.descriptor).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(
                        variant = %self.variant(),
                        attempt,
                        attempts,
                        error = %err,
                        "waiting for database to accept connections"
                    );
                    last_error = Some(err);
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.readiness.interval).await;
            }
        }

        let reason = last_error.map_or_else(String::new, |e| format!(": {e}"));
        Err(Error::Provisioning {
            variant: self.variant(),
            reason: format!("not ready after {attempts} attempts{reason}"),
        })
    }

    fn provisioning_error(&self, err: Error) -> Error {
        Error::Provisioning {
            variant: self.variant(),
            reason: err.to_string(),
        }
    }

    /// Load the dataset once; later calls are no-ops.
    ///
    /// A failed load moves the environment to `Failed`. The next call is the
    /// explicit retry: the container is probed again (`Starting` -> `Ready`)
    /// before the dataset is reloaded.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotReady` if the container is not running,
    /// `Error::Provisioning` if the retry probe fails, `Error::Seeding` if
    /// the load fails (the marker stays unset)
    pub async fn ensure_seeded(&self, seeder: &DatasetSeeder, row_count: usize) -> Result<()> {
        self.dataset
            .run(|| async {
                match self.state() {
                    EnvironmentState::Ready => {}
                    EnvironmentState::Failed if self.provision.is_done() => self.reprobe().await?,
                    state => {
                        return Err(Error::NotReady {
                            variant: self.variant(),
                            state,
                        })
                    }
                }

                match seeder.seed(self, row_count).await {
                    Ok(report) => {
                        info!(
                            variant = %self.variant(),
                            rows = report.rows,
                            batches = report.batches,
                            elapsed_ms = report.elapsed.as_millis(),
                            "dataset seeded"
                        );
                        Ok(())
                    }
                    Err(err) => {
                        self.transition(EnvironmentState::Ready, EnvironmentState::Failed);
                        warn!(variant = %self.variant(), error = %err, "dataset failed to load");
                        Err(err)
                    }
                }
            })
            .await
    }

    async fn reprobe(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if !self.transition(EnvironmentState::Failed, EnvironmentState::Starting) {
            return match self.state() {
                EnvironmentState::TornDown => Err(Error::ShutDown),
                EnvironmentState::Ready => Ok(()),
                state => Err(Error::NotReady {
                    variant: self.variant(),
                    state,
                }),
            };
        }

        let result = self.wait_until_ready().await;
        let next = if result.is_ok() {
            EnvironmentState::Ready
        } else {
            EnvironmentState::Failed
        };
        self.transition(EnvironmentState::Starting, next);
        result
    }

    /// Stop and remove the container.
    ///
    /// Returns `true` if this call moved the environment to `TornDown`.
    /// Absent containers are not an error, and later calls are no-ops.
    ///
    /// # Errors
    ///
    /// Returns `Error::Runtime` if the runtime fails to stop or remove an
    /// existing container; the environment is still marked `TornDown`
    pub async fn teardown(&self) -> Result<bool> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state() == EnvironmentState::TornDown {
            return Ok(false);
        }
        self.set_state(EnvironmentState::TornDown);

        let name = self.container_name();
        let status = self.runtime.status(name).await?;
        if status == ContainerStatus::Running {
            info!(container = %name, "stopping container");
            self.runtime.stop(name).await?;
        }
        if status != ContainerStatus::Absent {
            info!(container = %name, "removing container");
            self.runtime.remove(name).await?;
        }
        Ok(true)
    }
}
