use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{RecordKind, TelemetryRecord, TelemetrySink};
use crate::error::SinkError;

/// In-memory sink that keeps every inserted batch.
///
/// `fail_next(n)` makes the next `n` inserts fail, which is how the
/// writers' failure paths are exercised.
#[derive(Debug, Default)]
pub struct MemorySink {
    batches: Mutex<HashMap<RecordKind, Vec<Vec<TelemetryRecord>>>>,
    failures_pending: AtomicU32,
    failed_calls: AtomicU32,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: u32) {
        self.failures_pending.store(n, Ordering::SeqCst);
    }

    /// All batches accepted for `kind`, in insertion order.
    pub fn batches(&self, kind: RecordKind) -> Vec<Vec<TelemetryRecord>> {
        self.batches.lock().get(&kind).cloned().unwrap_or_default()
    }

    /// Flattened records accepted for `kind`.
    pub fn records(&self, kind: RecordKind) -> Vec<TelemetryRecord> {
        self.batches(kind).into_iter().flatten().collect()
    }

    pub fn insert_calls(&self, kind: RecordKind) -> usize {
        self.batches.lock().get(&kind).map_or(0, Vec::len)
    }

    pub fn failed_calls(&self) -> u32 {
        self.failed_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TelemetrySink for MemorySink {
    async fn insert_many(
        &self,
        kind: RecordKind,
        records: &[TelemetryRecord],
    ) -> Result<(), SinkError> {
        let should_fail = self
            .failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            self.failed_calls.fetch_add(1, Ordering::SeqCst);
            return Err(SinkError::Unavailable(format!(
                "simulated failure inserting {} {kind} records",
                records.len()
            )));
        }
        self.batches
            .lock()
            .entry(kind)
            .or_default()
            .push(records.to_vec());
        Ok(())
    }
}
