//! Error types for db-shootout
//!
//! Every variant carries owned context so errors can be cloned and handed to
//! every caller waiting on the same single-flight attempt.

use crate::environment::EnvironmentState;
use crate::Variant;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// db-shootout error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Environment failed to start or never became ready
    #[error("Provisioning failed for {variant}: {reason}")]
    Provisioning {
        /// Variant whose environment failed
        variant: Variant,
        /// What went wrong
        reason: String,
    },

    /// Dataset load failed; the environment is not ready for queries
    #[error("Seeding failed for {variant}: {reason}")]
    Seeding {
        /// Variant whose dataset failed to load
        variant: Variant,
        /// What went wrong
        reason: String,
    },

    /// A single query dispatch failed (local to one request)
    #[error("Query failed on {variant}: {cause}")]
    Query {
        /// Variant the query was dispatched to
        variant: Variant,
        /// Underlying driver error
        cause: String,
    },

    /// Feature-flag lookup failed (always recovered via the default variant)
    #[error("Variant selector unavailable: {0}")]
    SelectorUnavailable(String),

    /// Dispatch attempted while the environment was not `Ready`
    #[error("{variant} environment is not ready (state: {state})")]
    NotReady {
        /// Variant that was not ready
        variant: Variant,
        /// State observed at dispatch time
        state: EnvironmentState,
    },

    /// The experiment has been torn down
    #[error("Experiment has been shut down")]
    ShutDown,

    /// Container runtime command failed
    #[error("Container runtime error: {0}")]
    Runtime(String),

    /// SQL driver error (connect, execute, fetch)
    #[error("Driver error: {0}")]
    Driver(String),

    /// Load session failed
    #[error("Load session error: {0}")]
    Session(String),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    /// Whether this failure leaves the environment unusable until retried
    #[must_use]
    pub const fn is_environment_failure(&self) -> bool {
        matches!(
            self,
            Self::Provisioning { .. } | Self::Seeding { .. } | Self::NotReady { .. } | Self::ShutDown
        )
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::Driver(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::Session(err.to_string())
    }
}
