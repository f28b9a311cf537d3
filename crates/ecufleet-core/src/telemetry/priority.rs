use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::timer::{PeriodicFlush, spawn_flush_timer};
use super::{RecordKind, TelemetryBuffer, TelemetryRecord, TelemetrySink, WriterStats};
use crate::config::{BatchWriterConfig, KindPolicy};

/// Flush tier. Declaration order is drain order: `Critical` first.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Default,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

struct Queued {
    priority: Priority,
    seq: u64,
    attempts: u32,
    record: TelemetryRecord,
}

impl Queued {
    fn key(&self) -> (Priority, u64) {
        (self.priority, self.seq)
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// `BinaryHeap` is a max-heap; reverse so the smallest (tier, seq) pops first.
impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}

struct Lane {
    policy: KindPolicy,
    heap: Mutex<BinaryHeap<Queued>>,
    flush_lock: tokio::sync::Mutex<()>,
}

struct PriorityInner {
    sink: Arc<dyn TelemetrySink>,
    config: BatchWriterConfig,
    lanes: HashMap<RecordKind, Lane>,
    seq: Mutex<u64>,
    stats: Mutex<WriterStats>,
    cancel: Mutex<Option<CancellationToken>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

/// Batch writer whose flushes drain by tier, then arrival order.
///
/// A failed flush puts the batch back with its original tiers. Entries
/// that failed `max_flush_attempts` times are dropped.
#[derive(Clone)]
pub struct PriorityBatchWriter {
    inner: Arc<PriorityInner>,
}

impl PriorityBatchWriter {
    pub fn new(sink: Arc<dyn TelemetrySink>, config: BatchWriterConfig) -> Self {
        let lanes = RecordKind::FLUSH_ORDER
            .iter()
            .map(|kind| {
                let lane = Lane {
                    policy: config.policy(*kind),
                    heap: Mutex::new(BinaryHeap::new()),
                    flush_lock: tokio::sync::Mutex::new(()),
                };
                (*kind, lane)
            })
            .collect();
        Self {
            inner: Arc::new(PriorityInner {
                sink,
                config,
                lanes,
                seq: Mutex::new(0),
                stats: Mutex::new(WriterStats::default()),
                cancel: Mutex::new(None),
                timer: Mutex::new(None),
            }),
        }
    }

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
        info!(period_ms = period.as_millis(), "priority batch writer started");
    }

    /// Cancel the timer, wait for it, then flush every kind once.
    ///
    /// Records whose final flush fails stay buffered if they have
    /// attempts left.
    pub async fn stop(&self) {
        if let Some(token) = self.inner.cancel.lock().take() {
            token.cancel();
        }
        let handle = self.inner.timer.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "priority flush timer ended abnormally");
            }
        }
        self.flush_all().await;
        info!("priority batch writer stopped");
    }

    pub async fn add_with_priority(&self, record: TelemetryRecord, priority: Priority) {
        let kind = record.kind;
        let Some(lane) = self.inner.lanes.get(&kind) else {
            return;
        };
        let seq = {
            let mut seq = self.inner.seq.lock();
            *seq += 1;
            *seq
        };
        let reached = {
            let mut heap = lane.heap.lock();
            heap.push(Queued {
                priority,
                seq,
                attempts: 0,
                record,
            });
            heap.len() >= lane.policy.batch_size
        };
        if reached {
            self.inner.flush(kind).await;
        }
    }

    pub async fn flush(&self, kind: RecordKind) -> usize {
        self.inner.flush(kind).await
    }

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
            .map(|(kind, lane)| (*kind, lane.heap.lock().len()))
            .collect()
    }

    pub fn stats(&self) -> WriterStats {
        self.inner.stats.lock().clone()
    }

    pub fn clear_all(&self) -> usize {
        let mut cleared = 0;
        for lane in self.inner.lanes.values() {
            let mut heap = lane.heap.lock();
            cleared += heap.len();
            heap.clear();
        }
        if cleared > 0 {
            warn!(count = cleared, "discarded buffered telemetry");
            self.inner.stats.lock().dropped_records += cleared as u64;
        }
        cleared
    }
}

impl PriorityInner {
    async fn flush(&self, kind: RecordKind) -> usize {
        let Some(lane) = self.lanes.get(&kind) else {
            return 0;
        };
        let _guard = lane.flush_lock.lock().await;
        let entries: Vec<Queued> = {
            let mut heap = lane.heap.lock();
            std::iter::from_fn(|| heap.pop()).collect()
        };
        if entries.is_empty() {
            return 0;
        }

        let records: Vec<TelemetryRecord> = entries.iter().map(|q| q.record.clone()).collect();
        let count = records.len();
        match self.sink.insert_many(kind, &records).await {
            Ok(()) => {
                self.stats.lock().record_success(kind, count);
                debug!(%kind, count, "flushed prioritized telemetry batch");
                count
            }
            Err(e) => {
                self.requeue(kind, lane, entries);
                warn!(%kind, count, error = %e, "telemetry flush failed, batch requeued");
                0
            }
        }
    }

    fn requeue(&self, kind: RecordKind, lane: &Lane, entries: Vec<Queued>) {
        let max_attempts = self.config.max_flush_attempts;
        let mut requeued = 0u64;
        let mut dropped = 0u64;
        {
            let mut heap = lane.heap.lock();
            for mut entry in entries {
                entry.attempts += 1;
                if entry.attempts >= max_attempts {
                    dropped += 1;
                } else {
                    requeued += 1;
                    heap.push(entry);
                }
            }
        }
        if dropped > 0 {
            warn!(%kind, count = dropped, max_attempts, "dropping telemetry after repeated flush failures");
        }
        let mut stats = self.stats.lock();
        stats.failed_flushes += 1;
        stats.requeued_records += requeued;
        stats.dropped_records += dropped;
    }
}

#[async_trait]
impl PeriodicFlush for PriorityInner {
    async fn flush_pending(&self) {
        for kind in RecordKind::FLUSH_ORDER {
            let pending = self
                .lanes
                .get(&kind)
                .is_some_and(|lane| !lane.heap.lock().is_empty());
            if pending {
                self.flush(kind).await;
            }
        }
    }
}

#[async_trait]
impl TelemetryBuffer for PriorityBatchWriter {
    async fn add(&self, record: TelemetryRecord) {
        self.add_with_priority(record, Priority::Medium).await;
    }
}
