use std::sync::{Mutex, PoisonError};

use serde_json::Value;

/// Latest counters and metrics handed over by the host.
///
/// Each value is replaced wholesale; flushing reads but never clears, so the
/// current value is re-sent every interval.
#[derive(Debug, Default)]
pub(crate) struct SnapshotStore {
    counters: Mutex<Option<Value>>,
    metrics: Mutex<Option<Value>>,
}

impl SnapshotStore {
    pub(crate) fn accept_counters(&self, counters: Value) {
        *self.counters.lock().unwrap_or_else(PoisonError::into_inner) = Some(counters);
    }

    pub(crate) fn accept_metrics(&self, metrics: Value) {
        *self.metrics.lock().unwrap_or_else(PoisonError::into_inner) = Some(metrics);
    }

    pub(crate) fn counters(&self) -> Option<Value> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn metrics(&self) -> Option<Value> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}
