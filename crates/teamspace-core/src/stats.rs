use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::models::OpKind;

/// Counters of feed and mutation activity
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    /// Operations applied to the projection, by kind
    pub operations_by_kind: HashMap<OpKind, u64>,
    /// Redelivered or stale operations that were ignored
    pub duplicates_ignored: u64,
    pub mutations_issued: u64,
    pub mutations_confirmed: u64,
    pub mutations_failed: u64,
    pub confirmation_timeouts: u64,
    /// Successful shape reopens after a disconnect
    pub reconnects: u64,
}

impl SyncStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn operations_applied(&self) -> u64 {
        self.operations_by_kind.values().sum()
    }
}

/// Thread-safe wrapper for sync stats
#[derive(Debug, Clone)]
pub struct SharedSyncStats {
    inner: Arc<RwLock<SyncStats>>,
}

impl Default for SharedSyncStats {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedSyncStats {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(SyncStats::new())),
        }
    }

    fn update(&self, f: impl FnOnce(&mut SyncStats)) {
        if let Ok(mut stats) = self.inner.write() {
            f(&mut stats);
        }
    }

    pub fn record_operation(&self, kind: OpKind) {
        self.update(|stats| *stats.operations_by_kind.entry(kind).or_insert(0) += 1);
    }

    pub fn record_duplicate(&self) {
        self.update(|stats| stats.duplicates_ignored += 1);
    }

    pub fn record_issued(&self) {
        self.update(|stats| stats.mutations_issued += 1);
    }

    pub fn record_confirmed(&self) {
        self.update(|stats| stats.mutations_confirmed += 1);
    }

    pub fn record_failed(&self) {
        self.update(|stats| stats.mutations_failed += 1);
    }

    pub fn record_timeout(&self) {
        self.update(|stats| stats.confirmation_timeouts += 1);
    }

    pub fn record_reconnect(&self) {
        self.update(|stats| stats.reconnects += 1);
    }

    pub fn snapshot(&self) -> SyncStats {
        self.inner.read().map(|s| s.clone()).unwrap_or_default()
    }
}
