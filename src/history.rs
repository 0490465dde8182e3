//! Per-identity rolling execution history
//!
//! Each identity owns a bounded FIFO of its most recent executions. Appends
//! for one identity are serialized by the `DashMap` shard lock held through
//! the read-modify-write; different identities never contend on the same
//! entry.
//!
//! The number of identities is capped too: when a new identity arrives at
//! the cap, the identity whose latest record is oldest is dropped.

use crate::Variant;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;

/// One executed query
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionRecord {
    /// Variant the query ran against
    pub variant: Variant,
    /// Query text
    pub query: String,
    /// Measured execution time
    pub execution_time: Duration,
    /// Wall-clock time the record was created
    pub timestamp: DateTime<Utc>,
}

impl ExecutionRecord {
    /// Create a record stamped with the current time
    #[must_use]
    pub fn new(variant: Variant, query: impl Into<String>, execution_time: Duration) -> Self {
        Self {
            variant,
            query: query.into(),
            execution_time,
            timestamp: Utc::now(),
        }
    }
}

/// Bounded history per identity
#[derive(Debug)]
pub struct HistoryStore {
    capacity: usize,
    max_identities: usize,
    entries: DashMap<String, VecDeque<ExecutionRecord>>,
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_HISTORY_CAPACITY)
    }
}

impl HistoryStore {
    /// Create a store keeping at most `capacity` records per identity (minimum 1)
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            max_identities: crate::config::DEFAULT_HISTORY_IDENTITIES,
            entries: DashMap::new(),
        }
    }

    /// Keep histories for at most `max` identities (minimum 1)
    #[must_use]
    pub fn with_max_identities(mut self, max: usize) -> Self {
        self.max_identities = max.max(1);
        self
    }

    /// Maximum records kept per identity
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a record, evicting the oldest beyond capacity.
    ///
    /// Returns the identity's history after the append, oldest first.
    pub fn append(&self, identity: &str, record: ExecutionRecord) -> Vec<ExecutionRecord> {
        // No entry guard may be held here: eviction iterates every shard
        if !self.entries.contains_key(identity) && self.identities() >= self.max_identities {
            self.evict_stalest();
        }

        let mut history = self.entries.entry(identity.to_string()).or_default();
        history.push_back(record);
        while history.len() > self.capacity {
            history.pop_front();
        }
        history.iter().cloned().collect()
    }

    /// History for an identity, oldest first
    #[must_use]
    pub fn get(&self, identity: &str) -> Vec<ExecutionRecord> {
        self.entries
            .get(identity)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of identities with at least one record
    #[must_use]
    pub fn identities(&self) -> usize {
        self.entries.len()
    }

    fn evict_stalest(&self) {
        let stalest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().back().map(|r| r.timestamp))
            .map(|entry| entry.key().clone());
        if let Some(identity) = stalest {
            self.entries.remove(&identity);
            debug!(%identity, "history evicted");
        }
    }
}
