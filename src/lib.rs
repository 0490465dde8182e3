//! # db-shootout: PostgreSQL vs MariaDB Query Latency Harness
//!
//! db-shootout provisions two ephemeral database containers, seeds them with
//! identical synthetic data, routes each request to one of them through a
//! variant selector, and records how long the query took. A concurrent load
//! generator drives the comparison endpoint with many simulated client
//! sessions to validate it under concurrency.
//!
//! ## Design Principles
//!
//! - **Fairness**: both variants receive byte-for-byte identical logical rows
//! - **Idempotence**: provisioning and seeding are single-flight per environment
//! - **Isolation**: a failed query or load session never affects its siblings
//! - **First-wins teardown**: every shutdown trigger funnels into one teardown
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use db_shootout::config::ExperimentConfig;
//! use db_shootout::orchestrator::ExperimentOrchestrator;
//!
//! # async fn example() -> db_shootout::Result<()> {
//! let config = ExperimentConfig::from_env()?;
//! let orchestrator = Arc::new(ExperimentOrchestrator::with_podman(config));
//!
//! orchestrator.ensure_ready().await?;
//! let outcome = orchestrator
//!     .handle_request("user-42", Some("SELECT COUNT(*) FROM test_table"))
//!     .await?;
//! println!("{} took {:?}", outcome.variant, outcome.result.execution_time);
//!
//! orchestrator.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod config;
pub mod environment;
pub mod error;
pub mod history;
pub mod load;
pub mod orchestrator;
pub mod query;
pub mod seed;
pub mod selector;
pub mod shutdown;
pub mod simulated;

pub use error::{Error, Result};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Backend variant under comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    /// PostgreSQL (variant A)
    Postgres,
    /// MariaDB (variant B)
    #[serde(rename = "mariadb")]
    MariaDb,
}

impl Variant {
    /// Both variants, in a stable order
    pub const ALL: [Self; 2] = [Self::Postgres, Self::MariaDb];

    /// Treatment label used by the variant selector
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::MariaDb => "mariadb",
        }
    }

    /// Parse a selector treatment label, `None` for anything unrecognized
    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Some(Self::Postgres),
            "mariadb" | "mysql" => Some(Self::MariaDb),
            _ => None,
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Variant {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_label(s).ok_or_else(|| Error::InvalidInput(format!("unknown variant: {s}")))
    }
}
