use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::timer::{PeriodicFlush, spawn_flush_timer};
use super::{RecordKind, TelemetryBuffer, TelemetryRecord, TelemetrySink, WriterStats};
use crate::config::{BatchWriterConfig, KindPolicy};

/// Per-kind buffer with its own flush serialization.
struct Lane {
    policy: KindPolicy,
    buffer: Mutex<Vec<TelemetryRecord>>,
    flush_lock: tokio::sync::Mutex<()>,
}

impl Lane {
    fn new(policy: KindPolicy) -> Self {
        Self {
            policy,
            buffer: Mutex::new(Vec::new()),
            flush_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn is_pending(&self) -> bool {
        !self.buffer.lock().is_empty()
    }
}

struct WriterInner {
    sink: Arc<dyn TelemetrySink>,
    config: BatchWriterConfig,
    lanes: HashMap<RecordKind, Lane>,
    stats: Mutex<WriterStats>,
    cancel: Mutex<Option<CancellationToken>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

/// Buffers telemetry per kind and writes it to a sink in batches.
///
/// A kind is flushed when its buffer reaches the configured batch size
/// or on each tick of the periodic timer, if it has anything buffered. A failed
/// flush is logged and the batch is dropped.
///
/// Cheaply cloneable; all clones share the same buffers.
#[derive(Clone)]
pub struct BatchWriter {
    inner: Arc<WriterInner>,
}

impl BatchWriter {
    pub fn new(sink: Arc<dyn TelemetrySink>, config: BatchWriterConfig) -> Self {
        let lanes = RecordKind::FLUSH_ORDER
            .iter()
            .map(|kind| (*kind, Lane::new(config.policy(*kind))))
            .collect();
        Self {
            inner: Arc::new(WriterInner {
                sink,
                config,
                lanes,
                stats: Mutex::new(WriterStats::default()),
                cancel: Mutex::new(None),
                timer: Mutex::new(None),
            }),
        }
    }

    /// Spawn the periodic flush timer. No-op if already running.
    pub fn start(&self) {
        let mut timer = self.inner.timer.lock();
        if timer.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let period = self.inner.config.tick_period();
        *timer = Some(spawn_flush_timer(
            Arc::downgrade(&self.inner),
            period,
            token.clone(),
        ));
        *self.inner.cancel.lock() = Some(token);
        info!(period_ms = period.as_millis(), "batch writer started");
    }

    /// Cancel the timer, wait for it, then flush every kind.
    pub async fn stop(&self) {
        if let Some(token) = self.inner.cancel.lock().take() {
            token.cancel();
        }
        let handle = self.inner.timer.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "batch flush timer ended abnormally");
            }
        }
        self.flush_all().await;
        info!("batch writer stopped");
    }

    /// Flush one kind. Returns the number of records written.
    pub async fn flush(&self, kind: RecordKind) -> usize {
        self.inner.flush(kind).await
    }

    /// Flush every kind in fixed order.
    pub async fn flush_all(&self) -> usize {
        let mut written = 0;
        for kind in RecordKind::FLUSH_ORDER {
            written += self.inner.flush(kind).await;
        }
        written
    }

    pub fn queue_sizes(&self) -> BTreeMap<RecordKind, usize> {
        self.inner
            .lanes
            .iter()
            .map(|(kind, lane)| (*kind, lane.buffer.lock().len()))
            .collect()
    }

    pub fn stats(&self) -> WriterStats {
        self.inner.stats.lock().clone()
    }

    /// Discard every buffered record without writing it.
    pub fn clear_all(&self) -> usize {
        let mut cleared = 0;
        for lane in self.inner.lanes.values() {
            let mut buffer = lane.buffer.lock();
            cleared += buffer.len();
            buffer.clear();
        }
        if cleared > 0 {
            warn!(count = cleared, "discarded buffered telemetry");
            self.inner.stats.lock().dropped_records += cleared as u64;
        }
        cleared
    }
}

impl WriterInner {
    async fn flush(&self, kind: RecordKind) -> usize {
        let Some(lane) = self.lanes.get(&kind) else {
            return 0;
        };
        let _guard = lane.flush_lock.lock().await;
        let batch = std::mem::take(&mut *lane.buffer.lock());
        if batch.is_empty() {
            return 0;
        }

        let count = batch.len();
        match self.sink.insert_many(kind, &batch).await {
            Ok(()) => {
                self.stats.lock().record_success(kind, count);
                debug!(%kind, count, "flushed telemetry batch");
                count
            }
            Err(e) => {
                let mut stats = self.stats.lock();
                stats.failed_flushes += 1;
                stats.dropped_records += count as u64;
                warn!(%kind, count, error = %e, "telemetry flush failed, batch dropped");
                0
            }
        }
    }
}

#[async_trait]
impl PeriodicFlush for WriterInner {
    async fn flush_pending(&self) {
        for kind in RecordKind::FLUSH_ORDER {
            if self.lanes.get(&kind).is_some_and(Lane::is_pending) {
                self.flush(kind).await;
            }
        }
    }
}

#[async_trait]
impl TelemetryBuffer for BatchWriter {
    async fn add(&self, record: TelemetryRecord) {
        let kind = record.kind;
        let Some(lane) = self.inner.lanes.get(&kind) else {
            return;
        };
        let reached = {
            let mut buffer = lane.buffer.lock();
            buffer.push(record);
            buffer.len() >= lane.policy.batch_size
        };
        if reached {
            self.inner.flush(kind).await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::command::Params;
    use crate::telemetry::MemorySink;

    fn record(kind: RecordKind) -> TelemetryRecord {
        TelemetryRecord::new("dev-1", kind, Params::new())
    }

    fn writer(batch_size: usize) -> (Arc<MemorySink>, BatchWriter) {
        let sink = Arc::new(MemorySink::new());
        let writer = BatchWriter::new(
            sink.clone(),
            BatchWriterConfig::new(batch_size, Duration::from_secs(5)),
        );
        (sink, writer)
    }

    #[tokio::test]
    async fn below_threshold_does_not_flush() {
        let (sink, writer) = writer(3);
        writer.add(record(RecordKind::Status)).await;
        writer.add(record(RecordKind::Status)).await;
        assert_eq!(sink.insert_calls(RecordKind::Status), 0);
        assert_eq!(writer.queue_sizes()[&RecordKind::Status], 2);
    }

    #[tokio::test]
    async fn threshold_triggers_exactly_one_flush() {
        let (sink, writer) = writer(3);
        for _ in 0..3 {
            writer.add(record(RecordKind::Heartbeat)).await;
        }
        assert_eq!(sink.insert_calls(RecordKind::Heartbeat), 1);
        assert_eq!(sink.records(RecordKind::Heartbeat).len(), 3);
        assert_eq!(writer.queue_sizes()[&RecordKind::Heartbeat], 0);
        assert_eq!(writer.stats().batch_operations, 1);
    }

    #[tokio::test]
    async fn failed_flush_drops_batch() {
        let (sink, writer) = writer(10);
        writer.add(record(RecordKind::Event)).await;
        writer.add(record(RecordKind::Event)).await;
        sink.fail_next(1);
        assert_eq!(writer.flush(RecordKind::Event).await, 0);

        let stats = writer.stats();
        assert_eq!(stats.failed_flushes, 1);
        assert_eq!(stats.dropped_records, 2);
        assert_eq!(writer.queue_sizes()[&RecordKind::Event], 0);
    }

    #[tokio::test]
    async fn clear_all_discards_everything() {
        let (sink, writer) = writer(10);
        writer.add(record(RecordKind::Usage)).await;
        writer.add(record(RecordKind::Status)).await;
        assert_eq!(writer.clear_all(), 2);
        assert!(writer.queue_sizes().values().all(|n| *n == 0));
        writer.flush_all().await;
        assert_eq!(sink.insert_calls(RecordKind::Usage), 0);
    }
}
