use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Something the periodic flush timer can drive.
#[async_trait]
pub(super) trait PeriodicFlush: Send + Sync + 'static {
    /// Flush every non-empty kind, in flush order.
    async fn flush_pending(&self);
}

/// Spawn the flush timer. The task holds only a weak reference, so a
/// writer dropped without `stop()` still ends the task on its next tick.
pub(super) fn spawn_flush_timer<W: PeriodicFlush>(
    writer: Weak<W>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let Some(writer) = writer.upgrade() else { break };
                    writer.flush_pending().await;
                }
            }
        }
        tracing::debug!("batch flush timer stopped");
    })
}
