//! In-memory container runtime and SQL driver
//!
//! Stand-ins for podman and the two database servers, used by the test
//! suite and by `db-shootout bench --simulate` for dry runs without a
//! container runtime. The driver understands exactly the statements the
//! seeder emits plus a handful of queries; everything else is treated as a
//! generic scan of `test_table`.

use crate::environment::runtime::{ContainerRuntime, ContainerSpec, ContainerStatus};
use crate::environment::ConnectionDescriptor;
use crate::query::driver::{FetchedRows, SqlConnection, SqlDriver};
use crate::query::SqlValue;
use crate::seed::TABLE_NAME;
use crate::{Error, Result, Variant};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Container runtime
// ============================================================================

/// Container runtime that only tracks names and states
#[derive(Debug, Default)]
pub struct MemoryRuntime {
    containers: DashMap<String, ContainerStatus>,
    runs: DashMap<String, usize>,
    removals: DashMap<String, usize>,
    fail_runs: AtomicBool,
    start_delay: Mutex<Duration>,
}

impl MemoryRuntime {
    /// Create a runtime with no containers
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every `run`/`start`, widening race windows in tests
    #[must_use]
    pub fn with_start_delay(self, delay: Duration) -> Self {
        *self.start_delay.lock() = delay;
        self
    }

    /// Pre-populate a container
    pub fn insert(&self, name: &str, status: ContainerStatus) {
        self.containers.insert(name.to_string(), status);
    }

    /// Make subsequent `run` calls fail
    pub fn fail_runs(&self, fail: bool) {
        self.fail_runs.store(fail, Ordering::SeqCst);
    }

    /// Current status of a container
    #[must_use]
    pub fn status_of(&self, name: &str) -> ContainerStatus {
        self.containers
            .get(name)
            .map_or(ContainerStatus::Absent, |s| *s.value())
    }

    /// Number of successful `run` calls for a container
    #[must_use]
    pub fn run_count(&self, name: &str) -> usize {
        self.runs.get(name).map_or(0, |n| *n.value())
    }

    /// Number of `remove` calls for a container
    #[must_use]
    pub fn remove_count(&self, name: &str) -> usize {
        self.removals.get(name).map_or(0, |n| *n.value())
    }

    async fn simulate_startup(&self) {
        let delay = *self.start_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    async fn status(&self, name: &str) -> Result<ContainerStatus> {
        Ok(self.status_of(name))
    }

    async fn run(&self, spec: &ContainerSpec) -> Result<()> {
        self.simulate_startup().await;
        if self.fail_runs.load(Ordering::SeqCst) {
            return Err(Error::Runtime(format!("failed to pull {}", spec.image)));
        }
        if self.status_of(&spec.name) != ContainerStatus::Absent {
            return Err(Error::Runtime(format!("name {} is already in use", spec.name)));
        }
        self.containers.insert(spec.name.clone(), ContainerStatus::Running);
        *self.runs.entry(spec.name.clone()).or_insert(0) += 1;
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.simulate_startup().await;
        match self.status_of(name) {
            ContainerStatus::Absent => Err(Error::Runtime(format!("no such container: {name}"))),
            _ => {
                self.containers.insert(name.to_string(), ContainerStatus::Running);
                Ok(())
            }
        }
    }

    async fn stop(&self, name: &str) -> Result<()> {
        match self.status_of(name) {
            ContainerStatus::Absent => Err(Error::Runtime(format!("no such container: {name}"))),
            _ => {
                self.containers.insert(name.to_string(), ContainerStatus::Stopped);
                Ok(())
            }
        }
    }

    async fn remove(&self, name: &str) -> Result<()> {
        if self.containers.remove(name).is_none() {
            return Err(Error::Runtime(format!("no such container: {name}")));
        }
        *self.removals.entry(name.to_string()).or_insert(0) += 1;
        Ok(())
    }
}

// ============================================================================
// SQL driver
// ============================================================================

/// A row as stored by the simulated backend
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    /// `name` column
    pub name: String,
    /// `value` column
    pub value: f64,
    /// `created_at` column, normalized to `YYYY-MM-DD HH:MM:SS`
    pub created_at: String,
}

#[derive(Debug, Default)]
struct Backend {
    table: Option<Vec<StoredRow>>,
    ping_failures: usize,
    latency: Duration,
    offline: bool,
    creates: usize,
    insert_batches: usize,
}

#[derive(Debug, Default)]
struct Shared {
    backends: Mutex<HashMap<Variant, Backend>>,
    failing: Mutex<Vec<String>>,
}

impl Shared {
    fn with_backend<T>(&self, variant: Variant, f: impl FnOnce(&mut Backend) -> T) -> T {
        let mut backends = self.backends.lock();
        f(backends.entry(variant).or_default())
    }

    fn check_failing(&self, sql: &str) -> Result<()> {
        let failing = self.failing.lock();
        match failing.iter().find(|pattern| sql.contains(pattern.as_str())) {
            Some(pattern) => Err(Error::Driver(format!("injected failure for {pattern:?}"))),
            None => Ok(()),
        }
    }

    fn check_online(&self, variant: Variant) -> Result<()> {
        if self.with_backend(variant, |b| b.offline) {
            Err(Error::Driver(format!("{variant}: server closed the connection")))
        } else {
            Ok(())
        }
    }
}

/// SQL driver backed by in-memory tables, one per variant
#[derive(Debug, Clone, Default)]
pub struct MemoryDriver {
    shared: Arc<Shared>,
}

impl MemoryDriver {
    /// Create a driver with empty backends
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` readiness probes for a variant
    pub fn fail_next_pings(&self, variant: Variant, count: usize) {
        self.shared.with_backend(variant, |b| b.ping_failures = count);
    }

    /// Add latency to every query on a variant
    pub fn set_latency(&self, variant: Variant, latency: Duration) {
        self.shared.with_backend(variant, |b| b.latency = latency);
    }

    /// Simulate the server going away (or coming back)
    pub fn set_offline(&self, variant: Variant, offline: bool) {
        self.shared.with_backend(variant, |b| b.offline = offline);
    }

    /// Fail every statement containing `pattern`
    pub fn fail_statements_containing(&self, pattern: impl Into<String>) {
        self.shared.failing.lock().push(pattern.into());
    }

    /// Remove all injected statement failures
    pub fn clear_failures(&self) {
        self.shared.failing.lock().clear();
    }

    /// Number of CREATE TABLE statements executed
    #[must_use]
    pub fn create_count(&self, variant: Variant) -> usize {
        self.shared.with_backend(variant, |b| b.creates)
    }

    /// Number of INSERT statements executed
    #[must_use]
    pub fn insert_batch_count(&self, variant: Variant) -> usize {
        self.shared.with_backend(variant, |b| b.insert_batches)
    }

    /// Snapshot of the seeded table, `None` if it does not exist
    #[must_use]
    pub fn rows(&self, variant: Variant) -> Option<Vec<StoredRow>> {
        self.shared.with_backend(variant, |b| b.table.clone())
    }
}

#[async_trait]
impl SqlDriver for MemoryDriver {
    async fn connect(&self, target: &ConnectionDescriptor) -> Result<Box<dyn SqlConnection>> {
        self.shared.check_online(target.variant)?;
        Ok(Box::new(MemoryConnection {
            shared: Arc::clone(&self.shared),
            variant: target.variant,
        }))
    }

    async fn ping(&self, target: &ConnectionDescriptor) -> Result<()> {
        self.shared.check_online(target.variant)?;
        let refused = self.shared.with_backend(target.variant, |b| {
            if b.ping_failures > 0 {
                b.ping_failures -= 1;
                true
            } else {
                false
            }
        });
        if refused {
            return Err(Error::Driver(format!("{}: connection refused", target.variant)));
        }
        Ok(())
    }
}

struct MemoryConnection {
    shared: Arc<Shared>,
    variant: Variant,
}

impl MemoryConnection {
    async fn simulate_latency(&self) -> Result<()> {
        let latency = self.shared.with_backend(self.variant, |b| b.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.shared.check_online(self.variant)
    }

    fn missing_table(&self) -> Error {
        Error::Driver(format!("{}: relation \"{TABLE_NAME}\" does not exist", self.variant))
    }
}

#[async_trait]
impl SqlConnection for MemoryConnection {
    async fn execute(&mut self, sql: &str) -> Result<u64> {
        self.shared.check_failing(sql)?;
        self.simulate_latency().await?;

        let normalized = normalize(sql);
        if normalized.starts_with("DROP TABLE") {
            self.shared.with_backend(self.variant, |b| b.table = None);
            Ok(0)
        } else if normalized.starts_with("CREATE TABLE") {
            self.shared.with_backend(self.variant, |b| {
                b.table = Some(Vec::new());
                b.creates += 1;
            });
            Ok(0)
        } else if normalized.starts_with("INSERT INTO") {
            let rows = parse_values(sql)?;
            let inserted = rows.len() as u64;
            self.shared.with_backend(self.variant, |b| match b.table.as_mut() {
                Some(table) => {
                    table.extend(rows);
                    b.insert_batches += 1;
                    Ok(inserted)
                }
                None => Err(self.missing_table()),
            })
        } else {
            Ok(0)
        }
    }

    #[allow(clippy::cast_possible_wrap)]
    async fn fetch(&mut self, sql: &str) -> Result<FetchedRows> {
        self.shared.check_failing(sql)?;
        self.simulate_latency().await?;

        let normalized = normalize(sql);
        if normalized == "SELECT 1" {
            return Ok(FetchedRows {
                columns: vec!["?column?".to_string()],
                rows: vec![vec![SqlValue::Int(1)]],
            });
        }
        if !normalized.contains(&TABLE_NAME.to_ascii_uppercase()) {
            return Err(Error::Driver(format!(
                "{}: unknown relation in query: {sql}",
                self.variant
            )));
        }

        let table = self
            .shared
            .with_backend(self.variant, |b| b.table.clone())
            .ok_or_else(|| self.missing_table())?;

        let (column, value) = match normalized.as_str() {
            "SELECT COUNT(*) FROM TEST_TABLE" => ("count", SqlValue::Int(table.len() as i64)),
            "SELECT SUM(VALUE) FROM TEST_TABLE" => {
                ("sum", SqlValue::Float(table.iter().map(|r| r.value).sum()))
            }
            _ => ("rows_scanned", SqlValue::Int(table.len() as i64)),
        };
        Ok(FetchedRows {
            columns: vec![column.to_string()],
            rows: vec![vec![value]],
        })
    }

    async fn close(self: Box<Self>) {}
}

fn normalize(sql: &str) -> String {
    sql.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches(';')
        .to_ascii_uppercase()
}

/// Parse `INSERT ... VALUES ('item0', 0, TIMESTAMP '2023-01-01 00:00:00'),(...)`
fn parse_values(sql: &str) -> Result<Vec<StoredRow>> {
    let malformed = || Error::Driver(format!("syntax error in INSERT: {sql:.80}"));
    let values = sql
        .find("VALUES")
        .map(|at| sql[at + "VALUES".len()..].trim())
        .ok_or_else(malformed)?;
    let inner = values
        .strip_prefix('(')
        .and_then(|v| v.strip_suffix(')'))
        .ok_or_else(malformed)?;

    inner
        .split("),(")
        .map(|tuple| {
            let mut fields = tuple.splitn(3, ", ");
            let name = fields.next().ok_or_else(malformed)?.trim_matches('\'');
            let value = fields
                .next()
                .and_then(|v| v.parse::<f64>().ok())
                .ok_or_else(malformed)?;
            let created_at = fields
                .next()
                .ok_or_else(malformed)?
                .trim_start_matches("TIMESTAMP ")
                .trim_matches('\'');
            Ok(StoredRow {
                name: name.to_string(),
                value,
                created_at: created_at.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;

    #[test]
    fn test_parse_values_both_dialects() {
        let pg = "INSERT INTO test_table (name, value, created_at) VALUES ('item0', 0, TIMESTAMP '2023-01-01 00:00:00'),('item1', 1.5, TIMESTAMP '2023-01-01 01:00:00')";
        let my = "INSERT INTO test_table (name, value, created_at) VALUES ('item0', 0, '2023-01-01 00:00:00'),('item1', 1.5, '2023-01-01 01:00:00')";

        let pg_rows = parse_values(pg).unwrap();
        assert_eq!(pg_rows.len(), 2);
        assert_eq!(pg_rows, parse_values(my).unwrap());
        assert_eq!(pg_rows[1].created_at, "2023-01-01 01:00:00");
    }

    #[test]
    fn test_parse_values_malformed() {
        assert!(parse_values("INSERT INTO test_table VALUES oops").is_err());
    }

    #[tokio::test]
    async fn test_runtime_lifecycle() {
        let runtime = MemoryRuntime::new();
        let spec = BackendConfig::postgres().container_spec();

        runtime.run(&spec).await.unwrap();
        assert!(runtime.run(&spec).await.is_err());
        runtime.stop(&spec.name).await.unwrap();
        assert_eq!(runtime.status_of(&spec.name), ContainerStatus::Stopped);
        runtime.remove(&spec.name).await.unwrap();
        assert!(runtime.remove(&spec.name).await.is_err());
    }

    #[tokio::test]
    async fn test_driver_requires_table() {
        let driver = MemoryDriver::new();
        let descriptor = BackendConfig::postgres().descriptor();
        let mut conn = driver.connect(&descriptor).await.unwrap();

        assert!(conn.fetch("SELECT COUNT(*) FROM test_table").await.is_err());
        conn.execute("CREATE TABLE test_table (id INT)").await.unwrap();
        let fetched = conn.fetch("select count(*) from test_table;").await.unwrap();
        assert_eq!(fetched.rows, vec![vec![SqlValue::Int(0)]]);
    }

    #[tokio::test]
    async fn test_offline_backend_refuses() {
        let driver = MemoryDriver::new();
        driver.set_offline(Variant::MariaDb, true);
        let descriptor = BackendConfig::mariadb().descriptor();

        assert!(driver.connect(&descriptor).await.is_err());
        assert!(driver.ping(&descriptor).await.is_err());
    }
}
