//! Experiment configuration
//!
//! Defaults mirror the fixed container setup the comparison was designed
//! around: `postgres:latest` on 5432 and `mariadb:latest` on 3306, both
//! hosting a `performance_test` database. Every field can be overridden
//! through builder methods or `SHOOTOUT_*` environment variables.

use crate::environment::runtime::ContainerSpec;
use crate::environment::ConnectionDescriptor;
use crate::{Error, Result, Variant};
use std::time::Duration;

/// Built-in analytic queries used when a request names none
pub const SAMPLE_QUERIES: [&str; 5] = [
    "SELECT COUNT(*), AVG(value) FROM test_table WHERE value > 100",
    "SELECT a.id, a.name, b.value FROM test_table a JOIN test_table b ON a.value < b.value WHERE a.id < 100 AND b.id < 100 LIMIT 100",
    "SELECT name, MAX(value) FROM test_table GROUP BY name LIMIT 100",
    "SELECT id, name, value FROM test_table WHERE id % 10 = 0 ORDER BY value DESC LIMIT 100",
    "SELECT EXTRACT(HOUR FROM created_at) as hour, COUNT(*), AVG(value) FROM test_table GROUP BY EXTRACT(HOUR FROM created_at) ORDER BY hour",
];

/// Default experiment key passed to the variant selector
pub const DEFAULT_EXPERIMENT_KEY: &str = "db_performance_comparison";

/// Default number of seeded rows
pub const DEFAULT_ROW_COUNT: usize = 100_000;

/// Default rows per INSERT statement
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Default rolling history capacity per identity
pub const DEFAULT_HISTORY_CAPACITY: usize = 10;

/// Default number of identities whose history is retained
pub const DEFAULT_HISTORY_IDENTITIES: usize = 10_000;

/// Readiness probe retry budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    /// Probe attempts before giving up
    pub attempts: u32,
    /// Delay between failed probes
    pub interval: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            interval: Duration::from_secs(5),
        }
    }
}

/// Fixed configuration for one backend container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    /// Variant served by this container
    pub variant: Variant,
    /// Container name (also the idempotence key for the runtime)
    pub container_name: String,
    /// Container image
    pub image: String,
    /// Host the database is reachable on
    pub host: String,
    /// Host port published for the database
    pub port: u16,
    /// Database name created at container start
    pub database: String,
    /// Login user
    pub user: String,
    /// Login password
    pub password: String,
}

impl BackendConfig {
    /// Default PostgreSQL container
    #[must_use]
    pub fn postgres() -> Self {
        Self {
            variant: Variant::Postgres,
            container_name: "postgres-test".to_string(),
            image: "postgres:latest".to_string(),
            host: "localhost".to_string(),
            port: 5432,
            database: "performance_test".to_string(),
            user: "postgres".to_string(),
            password: "postgres".to_string(),
        }
    }

    /// Default MariaDB container
    #[must_use]
    pub fn mariadb() -> Self {
        Self {
            variant: Variant::MariaDb,
            container_name: "mariadb-test".to_string(),
            image: "mariadb:latest".to_string(),
            host: "localhost".to_string(),
            port: 3306,
            database: "performance_test".to_string(),
            user: "root".to_string(),
            password: "mariadb".to_string(),
        }
    }

    /// Port the database listens on inside the container
    #[must_use]
    pub const fn container_port(&self) -> u16 {
        match self.variant {
            Variant::Postgres => 5432,
            Variant::MariaDb => 3306,
        }
    }

    /// Container creation parameters
    #[must_use]
    pub fn container_spec(&self) -> ContainerSpec {
        let env = match self.variant {
            Variant::Postgres => vec![
                ("POSTGRES_PASSWORD".to_string(), self.password.clone()),
                ("POSTGRES_DB".to_string(), self.database.clone()),
            ],
            Variant::MariaDb => vec![
                ("MYSQL_ROOT_PASSWORD".to_string(), self.password.clone()),
                ("MYSQL_DATABASE".to_string(), self.database.clone()),
            ],
        };

        ContainerSpec {
            name: self.container_name.clone(),
            image: self.image.clone(),
            env,
            host_port: self.port,
            container_port: self.container_port(),
        }
    }

    /// Connection parameters for the SQL driver
    #[must_use]
    pub fn descriptor(&self) -> ConnectionDescriptor {
        ConnectionDescriptor {
            variant: self.variant,
            host: self.host.clone(),
            port: self.port,
            database: self.database.clone(),
            user: self.user.clone(),
            password: self.password.clone(),
        }
    }

    fn apply_env(&mut self, prefix: &str, vars: &impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(name) = vars(&format!("{prefix}_CONTAINER")) {
            self.container_name = name;
        }
        if let Some(image) = vars(&format!("{prefix}_IMAGE")) {
            self.image = image;
        }
        if let Some(host) = vars(&format!("{prefix}_HOST")) {
            self.host = host;
        }
        if let Some(port) = vars(&format!("{prefix}_PORT")) {
            self.port = parse_value(&format!("{prefix}_PORT"), &port)?;
        }
        if let Some(password) = vars(&format!("{prefix}_PASSWORD")) {
            self.password = password;
        }
        if let Some(database) = vars("SHOOTOUT_DATABASE") {
            self.database = database;
        }
        Ok(())
    }
}

/// Complete experiment configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentConfig {
    /// PostgreSQL backend
    pub postgres: BackendConfig,
    /// MariaDB backend
    pub mariadb: BackendConfig,
    /// Rows seeded into each backend
    pub row_count: usize,
    /// Rows per INSERT statement
    pub batch_size: usize,
    /// Rolling history capacity per identity
    pub history_capacity: usize,
    /// Identities retained before the stalest history is dropped
    pub history_identities: usize,
    /// Readiness probe budget
    pub readiness: ReadinessPolicy,
    /// Selector experiment key
    pub experiment_key: String,
    /// Variant used when the selector is unavailable or returns an unknown label
    pub default_variant: Variant,
    /// Container runtime binary (`podman`, `docker`)
    pub container_runtime: String,
    /// Optional per-statement timeout for dispatched queries
    pub statement_timeout: Option<Duration>,
    /// Queries picked at random when a request names none
    pub sample_queries: Vec<String>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            postgres: BackendConfig::postgres(),
            mariadb: BackendConfig::mariadb(),
            row_count: DEFAULT_ROW_COUNT,
            batch_size: DEFAULT_BATCH_SIZE,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            history_identities: DEFAULT_HISTORY_IDENTITIES,
            readiness: ReadinessPolicy::default(),
            experiment_key: DEFAULT_EXPERIMENT_KEY.to_string(),
            default_variant: Variant::Postgres,
            container_runtime: "podman".to_string(),
            statement_timeout: None,
            sample_queries: SAMPLE_QUERIES.iter().map(ToString::to_string).collect(),
        }
    }
}

impl ExperimentConfig {
    /// Load configuration from the process environment.
    ///
    /// A `.env` file in the working directory is read first when present.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if a variable is set but malformed
    pub fn from_env() -> Result<Self> {
        // Missing .env is the common case
        let _ = dotenvy::dotenv();
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if a variable is set but malformed
    pub fn from_vars(vars: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        config.postgres.apply_env("SHOOTOUT_POSTGRES", &vars)?;
        config.mariadb.apply_env("SHOOTOUT_MARIADB", &vars)?;

        if let Some(rows) = vars("SHOOTOUT_ROW_COUNT") {
            config.row_count = parse_value("SHOOTOUT_ROW_COUNT", &rows)?;
        }
        if let Some(batch) = vars("SHOOTOUT_BATCH_SIZE") {
            config.batch_size = parse_value("SHOOTOUT_BATCH_SIZE", &batch)?;
        }
        if let Some(capacity) = vars("SHOOTOUT_HISTORY_CAPACITY") {
            config.history_capacity = parse_value("SHOOTOUT_HISTORY_CAPACITY", &capacity)?;
        }
        if let Some(identities) = vars("SHOOTOUT_HISTORY_IDENTITIES") {
            config.history_identities = parse_value("SHOOTOUT_HISTORY_IDENTITIES", &identities)?;
        }
        if let Some(attempts) = vars("SHOOTOUT_READINESS_ATTEMPTS") {
            config.readiness.attempts = parse_value("SHOOTOUT_READINESS_ATTEMPTS", &attempts)?;
        }
        if let Some(secs) = vars("SHOOTOUT_READINESS_INTERVAL_SECS") {
            let secs: u64 = parse_value("SHOOTOUT_READINESS_INTERVAL_SECS", &secs)?;
            config.readiness.interval = Duration::from_secs(secs);
        }
        if let Some(key) = vars("SHOOTOUT_EXPERIMENT_KEY") {
            config.experiment_key = key;
        }
        if let Some(label) = vars("SHOOTOUT_DEFAULT_VARIANT") {
            config.default_variant = label
                .parse()
                .map_err(|_| Error::Config(format!("SHOOTOUT_DEFAULT_VARIANT: unknown variant {label}")))?;
        }
        if let Some(runtime) = vars("SHOOTOUT_CONTAINER_RUNTIME") {
            config.container_runtime = runtime;
        }
        if let Some(ms) = vars("SHOOTOUT_STATEMENT_TIMEOUT_MS") {
            let ms: u64 = parse_value("SHOOTOUT_STATEMENT_TIMEOUT_MS", &ms)?;
            config.statement_timeout = Some(Duration::from_millis(ms));
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the number of seeded rows
    #[must_use]
    pub fn with_row_count(mut self, rows: usize) -> Self {
        self.row_count = rows;
        self
    }

    /// Set the INSERT batch size
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the per-identity history capacity
    #[must_use]
    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    /// Set the readiness probe budget
    #[must_use]
    pub fn with_readiness(mut self, readiness: ReadinessPolicy) -> Self {
        self.readiness = readiness;
        self
    }

    /// Set the fallback variant
    #[must_use]
    pub fn with_default_variant(mut self, variant: Variant) -> Self {
        self.default_variant = variant;
        self
    }

    /// Set the per-statement timeout
    #[must_use]
    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = Some(timeout);
        self
    }

    /// Replace the sample query list
    #[must_use]
    pub fn with_sample_queries(mut self, queries: Vec<String>) -> Self {
        self.sample_queries = queries;
        self
    }

    /// Backend configuration for a variant
    #[must_use]
    pub const fn backend(&self, variant: Variant) -> &BackendConfig {
        match variant {
            Variant::Postgres => &self.postgres,
            Variant::MariaDb => &self.mariadb,
        }
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first violated constraint
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be > 0".to_string()));
        }
        if self.history_capacity == 0 {
            return Err(Error::Config("history_capacity must be > 0".to_string()));
        }
        if self.history_identities == 0 {
            return Err(Error::Config("history_identities must be > 0".to_string()));
        }
        if self.readiness.attempts == 0 {
            return Err(Error::Config("readiness attempts must be > 0".to_string()));
        }
        if self.sample_queries.is_empty() {
            return Err(Error::Config("at least one sample query is required".to_string()));
        }
        if self.postgres.container_name == self.mariadb.container_name {
            return Err(Error::Config(format!(
                "both backends use container name {}",
                self.postgres.container_name
            )));
        }
        Ok(())
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key}: cannot parse {raw:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ExperimentConfig::default();
        assert_eq!(config.row_count, 100_000);
        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.history_capacity, 10);
        assert_eq!(config.history_identities, 10_000);
        assert_eq!(config.readiness.attempts, 5);
        assert_eq!(config.readiness.interval, Duration::from_secs(5));
        assert_eq!(config.default_variant, Variant::Postgres);
        assert_eq!(config.sample_queries.len(), SAMPLE_QUERIES.len());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_vars_overrides() {
        let config = ExperimentConfig::from_vars(lookup(&[
            ("SHOOTOUT_ROW_COUNT", "1000"),
            ("SHOOTOUT_POSTGRES_PORT", "15432"),
            ("SHOOTOUT_MARIADB_CONTAINER", "maria-ci"),
            ("SHOOTOUT_DEFAULT_VARIANT", "mariadb"),
            ("SHOOTOUT_CONTAINER_RUNTIME", "docker"),
            ("SHOOTOUT_STATEMENT_TIMEOUT_MS", "250"),
            ("SHOOTOUT_HISTORY_IDENTITIES", "64"),
        ]))
        .unwrap();

        assert_eq!(config.row_count, 1000);
        assert_eq!(config.postgres.port, 15432);
        assert_eq!(config.mariadb.container_name, "maria-ci");
        assert_eq!(config.default_variant, Variant::MariaDb);
        assert_eq!(config.container_runtime, "docker");
        assert_eq!(config.statement_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.history_identities, 64);
    }

    #[test]
    fn test_from_vars_malformed() {
        let err = ExperimentConfig::from_vars(lookup(&[("SHOOTOUT_POSTGRES_PORT", "abc")])).unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("SHOOTOUT_POSTGRES_PORT")));
    }

    #[test]
    fn test_validate_rejects_shared_container_name() {
        let mut config = ExperimentConfig::default();
        config.mariadb.container_name = config.postgres.container_name.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_container_spec_env() {
        let spec = BackendConfig::mariadb().container_spec();
        assert_eq!(spec.container_port, 3306);
        assert!(spec
            .env
            .iter()
            .any(|(k, v)| k == "MYSQL_DATABASE" && v == "performance_test"));
    }
}
