//! Variant selection
//!
//! The selector decides which backend serves an identity and receives the
//! measured latency for offline analysis. The orchestrator only depends on
//! the `VariantSelector` trait; `LocalSplitSelector` is a self-contained
//! implementation that buckets identities by hash and keeps tracked
//! metrics in memory.

use crate::{Error, Result, Variant};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Metric name reported for every successful request
pub const QUERY_EXECUTION_METRIC: &str = "query_execution";

/// Per-identity treatment lookup plus metric reporting
#[async_trait]
pub trait VariantSelector: Send + Sync {
    /// Treatment label for `identity` in experiment `experiment_key`
    async fn treatment(&self, identity: &str, experiment_key: &str) -> Result<String>;

    /// Report a metric value for `identity`
    async fn track(
        &self,
        identity: &str,
        metric: &str,
        value: f64,
        metadata: HashMap<String, String>,
    ) -> Result<()>;

    /// Release the selector; later lookups may fail
    async fn destroy(&self) {}
}

/// Resolve a variant, falling back to `default` when the selector fails or
/// returns a label outside the known set. Never fails.
pub async fn resolve_variant(
    selector: &dyn VariantSelector,
    identity: &str,
    experiment_key: &str,
    default: Variant,
) -> Variant {
    match selector.treatment(identity, experiment_key).await {
        Ok(label) => Variant::from_label(&label).unwrap_or_else(|| {
            warn!(%identity, %label, fallback = %default, "unknown treatment label");
            default
        }),
        Err(err) => {
            warn!(%identity, error = %err, fallback = %default, "variant selector unavailable");
            default
        }
    }
}

/// One metric reported through `track`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackedMetric {
    /// Identity the metric belongs to
    pub identity: String,
    /// Metric name
    pub metric: String,
    /// Metric value
    pub value: f64,
    /// Free-form properties (`query`, `database`)
    pub metadata: HashMap<String, String>,
    /// Time the metric was received
    pub timestamp: DateTime<Utc>,
}

/// Count and mean of a metric for one group
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricSummary {
    /// Samples
    pub count: usize,
    /// Arithmetic mean
    pub mean: f64,
}

/// Hash-bucketed selector with in-memory metric tracking.
///
/// An identity always lands on the same variant for a given experiment key.
#[derive(Debug)]
pub struct LocalSplitSelector {
    postgres_percent: u8,
    metrics: Mutex<Vec<TrackedMetric>>,
    destroyed: AtomicBool,
}

impl Default for LocalSplitSelector {
    fn default() -> Self {
        Self::new(50)
    }
}

impl LocalSplitSelector {
    /// Route `postgres_percent`% of identities to PostgreSQL (clamped to 100)
    #[must_use]
    pub fn new(postgres_percent: u8) -> Self {
        Self {
            postgres_percent: postgres_percent.min(100),
            metrics: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Deterministic variant for an identity
    #[must_use]
    pub fn bucket(&self, identity: &str, experiment_key: &str) -> Variant {
        let slot = fnv1a(experiment_key.bytes().chain([b':']).chain(identity.bytes())) % 100;
        if slot < u64::from(self.postgres_percent) {
            Variant::Postgres
        } else {
            Variant::MariaDb
        }
    }

    /// Every metric tracked so far, in arrival order
    #[must_use]
    pub fn tracked(&self) -> Vec<TrackedMetric> {
        self.metrics.lock().clone()
    }

    /// Count and mean of `metric`, grouped by the `database` metadata field
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn summary(&self, metric: &str) -> BTreeMap<String, MetricSummary> {
        let mut sums: BTreeMap<String, (usize, f64)> = BTreeMap::new();
        for m in self.metrics.lock().iter().filter(|m| m.metric == metric) {
            let group = m.metadata.get("database").cloned().unwrap_or_default();
            let entry = sums.entry(group).or_default();
            entry.0 += 1;
            entry.1 += m.value;
        }
        sums.into_iter()
            .map(|(group, (count, total))| {
                (
                    group,
                    MetricSummary {
                        count,
                        mean: total / count as f64,
                    },
                )
            })
            .collect()
    }

    /// Whether `destroy` has been called
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn check_alive(&self) -> Result<()> {
        if self.is_destroyed() {
            Err(Error::SelectorUnavailable("selector destroyed".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl VariantSelector for LocalSplitSelector {
    async fn treatment(&self, identity: &str, experiment_key: &str) -> Result<String> {
        self.check_alive()?;
        Ok(self.bucket(identity, experiment_key).label().to_string())
    }

    async fn track(
        &self,
        identity: &str,
        metric: &str,
        value: f64,
        metadata: HashMap<String, String>,
    ) -> Result<()> {
        self.check_alive()?;
        self.metrics.lock().push(TrackedMetric {
            identity: identity.to_string(),
            metric: metric.to_string(),
            value,
            metadata,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    async fn destroy(&self) {
        if !self.destroyed.swap(true, Ordering::SeqCst) {
            debug!("variant selector destroyed");
        }
    }
}

/// Selector that always answers with the same label, or always fails
#[derive(Debug, Clone, Default)]
pub struct FixedSelector {
    label: Option<String>,
    fail_tracking: bool,
}

impl FixedSelector {
    /// Always return `label`
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
            fail_tracking: false,
        }
    }

    /// Always report `SelectorUnavailable`
    #[must_use]
    pub fn unavailable() -> Self {
        Self::default()
    }

    /// Make `track` fail
    #[must_use]
    pub const fn with_failing_tracking(mut self) -> Self {
        self.fail_tracking = true;
        self
    }
}

#[async_trait]
impl VariantSelector for FixedSelector {
    async fn treatment(&self, _identity: &str, _experiment_key: &str) -> Result<String> {
        self.label
            .clone()
            .ok_or_else(|| Error::SelectorUnavailable("no treatment configured".to_string()))
    }

    async fn track(
        &self,
        _identity: &str,
        metric: &str,
        _value: f64,
        _metadata: HashMap<String, String>,
    ) -> Result<()> {
        if self.fail_tracking {
            return Err(Error::SelectorUnavailable(format!("cannot track {metric}")));
        }
        Ok(())
    }
}

fn fnv1a(bytes: impl Iterator<Item = u8>) -> u64 {
    bytes.fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
    })
}
