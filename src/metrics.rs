use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::store::StoreFailure;

/// Session lifecycle counters
pub struct SessionMetrics {
    started_at: DateTime<Utc>,

    sign_ins: AtomicU64,
    sign_in_failures: AtomicU64,

    /// Sign-outs keyed by reason (user, idle, refresh_failed, ...)
    sign_outs: DashMap<String, AtomicU64>,

    refreshes: AtomicU64,
    refresh_failures: AtomicU64,
    idle_expirations: AtomicU64,

    /// Swallowed store failures keyed by operation
    store_failures: DashMap<String, AtomicU64>,
}

/// Point-in-time copy of [`SessionMetrics`] for the metrics endpoint
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub started_at: DateTime<Utc>,
    pub sign_ins: u64,
    pub sign_in_failures: u64,
    pub sign_outs: BTreeMap<String, u64>,
    pub refreshes: u64,
    pub refresh_failures: u64,
    pub idle_expirations: u64,
    pub store_failures: BTreeMap<String, u64>,
}

fn bump(map: &DashMap<String, AtomicU64>, key: &str) {
    map.entry(key.to_string())
        .or_insert_with(|| AtomicU64::new(0))
        .fetch_add(1, Ordering::Relaxed);
}

fn collect(map: &DashMap<String, AtomicU64>) -> BTreeMap<String, u64> {
    map.iter()
        .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
        .collect()
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            sign_ins: AtomicU64::new(0),
            sign_in_failures: AtomicU64::new(0),
            sign_outs: DashMap::new(),
            refreshes: AtomicU64::new(0),
            refresh_failures: AtomicU64::new(0),
            idle_expirations: AtomicU64::new(0),
            store_failures: DashMap::new(),
        }
    }

    pub fn record_sign_in(&self, success: bool) {
        if success {
            self.sign_ins.fetch_add(1, Ordering::Relaxed);
        } else {
            self.sign_in_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_sign_out(&self, reason: &str) {
        bump(&self.sign_outs, reason);
    }

    pub fn record_refresh(&self, success: bool) {
        if success {
            self.refreshes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.refresh_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_idle_expiration(&self) {
        self.idle_expirations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_failure(&self, failure: &StoreFailure) {
        bump(&self.store_failures, failure.op.as_str());
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            started_at: self.started_at,
            sign_ins: self.sign_ins.load(Ordering::Relaxed),
            sign_in_failures: self.sign_in_failures.load(Ordering::Relaxed),
            sign_outs: collect(&self.sign_outs),
            refreshes: self.refreshes.load(Ordering::Relaxed),
            refresh_failures: self.refresh_failures.load(Ordering::Relaxed),
            idle_expirations: self.idle_expirations.load(Ordering::Relaxed),
            store_failures: collect(&self.store_failures),
        }
    }
}

impl Default for SessionMetrics {
    fn default() -> Self {
        Self::new()
    }
}
