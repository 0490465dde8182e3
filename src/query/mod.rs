//! Query dispatch
//!
//! Runs one query against one environment and times it. The connection is
//! opened and closed inside the call; only the execute+fetch step is timed.

pub mod driver;

use crate::environment::{BackendEnvironment, EnvironmentState};
use crate::{Error, Result, Variant};
use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::debug;

/// One result cell
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SqlValue {
    /// SQL NULL
    Null,
    /// Boolean
    Bool(bool),
    /// Signed integer
    Int(i64),
    /// Unsigned integer too large for `i64`
    UInt(u64),
    /// Floating point
    Float(f64),
    /// Exact numeric
    Decimal(Decimal),
    /// Text (also the fallback for unrecognized column types)
    Text(String),
    /// Timestamp without time zone
    Timestamp(NaiveDateTime),
    /// Calendar date
    Date(NaiveDate),
}

impl SqlValue {
    /// Integer view of numeric cells
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::UInt(v) => i64::try_from(*v).ok(),
            Self::Decimal(v) => v.to_i64(),
            _ => None,
        }
    }

    /// Floating point view of numeric cells
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::UInt(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Decimal(v) => v.to_f64(),
            _ => None,
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::UInt(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Decimal(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
            Self::Timestamp(v) => write!(f, "{}", v.format("%Y-%m-%d %H:%M:%S")),
            Self::Date(v) => write!(f, "{v}"),
        }
    }
}

/// Timed query result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    /// Time spent executing and fetching
    pub execution_time: Duration,
    /// Rows in result order
    pub rows: Vec<Vec<SqlValue>>,
    /// Column names in result order
    pub column_names: Vec<String>,
}

impl QueryResult {
    /// Number of rows returned
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// First cell of the first row, if any
    #[must_use]
    pub fn scalar(&self) -> Option<&SqlValue> {
        self.rows.first().and_then(|row| row.first())
    }
}

/// Executes queries against environments
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryDispatcher {
    statement_timeout: Option<Duration>,
}

impl QueryDispatcher {
    /// Create a dispatcher without a statement timeout
    #[must_use]
    pub const fn new() -> Self {
        Self {
            statement_timeout: None,
        }
    }

    /// Create a dispatcher that abandons queries running longer than `timeout`
    #[must_use]
    pub const fn with_timeout(timeout: Duration) -> Self {
        Self {
            statement_timeout: Some(timeout),
        }
    }

    /// Execute `sql` against `environment`.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotReady` if the environment is not `Ready`, and
    /// `Error::Query` wrapping the driver error otherwise. Never retries.
    pub async fn execute(&self, environment: &BackendEnvironment, sql: &str) -> Result<QueryResult> {
        let variant = environment.variant();
        let state = environment.state();
        if state != EnvironmentState::Ready {
            return Err(Error::NotReady { variant, state });
        }

        let mut conn = environment
            .driver()
            .connect(environment.descriptor())
            .await
            .map_err(|e| query_error(variant, &e))?;

        let started = Instant::now();
        let fetched = match self.statement_timeout {
            Some(limit) => tokio::time::timeout(limit, conn.fetch(sql))
                .await
                .unwrap_or_else(|_| Err(Error::Driver(format!("statement timed out after {limit:?}")))),
            None => conn.fetch(sql).await,
        };
        let execution_time = started.elapsed();
        conn.close().await;

        let fetched = fetched.map_err(|e| query_error(variant, &e))?;
        debug!(
            %variant,
            rows = fetched.rows.len(),
            elapsed_us = execution_time.as_micros(),
            "query executed"
        );

        Ok(QueryResult {
            execution_time,
            rows: fetched.rows,
            column_names: fetched.columns,
        })
    }
}

fn query_error(variant: Variant, err: &Error) -> Error {
    let cause = match err {
        Error::Driver(cause) => cause.clone(),
        other => other.to_string(),
    };
    Error::Query { variant, cause }
}
