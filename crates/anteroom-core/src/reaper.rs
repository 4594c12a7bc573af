//! Liveness reaper: evicts positions whose clients stopped heartbeating.
//!
//! Ticks on a fixed cadence, scanning each queue's liveness index for
//! scores older than `now - heartbeat_timeout` and expiring them through
//! the store's atomic expiry operation. Batches are bounded so one noisy
//! queue cannot starve the rest of a tick. Several reapers may run at once:
//! the atomic operation reports a winner per position, and only the winner
//! publishes the expiry event.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::QueueCatalog;
use crate::clock;
use crate::error::StoreResult;
use crate::events::{EventType, Events};
use crate::store::{keys, Store};

pub struct Reaper {
    store: Arc<dyn Store>,
    catalog: Arc<QueueCatalog>,
    events: Events,
    interval: Duration,
    batch: usize,
    shutdown: CancellationToken,
}

impl Reaper {
    pub fn new(
        store: Arc<dyn Store>,
        catalog: Arc<QueueCatalog>,
        events: Events,
        interval: Duration,
        batch: usize,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            catalog,
            events,
            interval,
            batch: batch.max(1),
            shutdown,
        })
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let reaper = Arc::clone(self);
        tokio::spawn(reaper.run())
    }

    async fn run(self: Arc<Self>) {
        info!(interval = ?self.interval, batch = self.batch, "reaper started");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }

            let queues = match self.catalog.list().await {
                Ok(queues) => queues,
                Err(err) => {
                    warn!(%err, "reaper queue discovery failed");
                    continue;
                }
            };
            for queue in queues {
                // Finish the batch in flight even if shutdown fires
                // mid-sweep; the loop exits at the next tick.
                match self.sweep(&queue).await {
                    Ok(0) => {}
                    Ok(expired) => debug!(queue = %queue, expired, "reaped stale positions"),
                    Err(err) => warn!(queue = %queue, %err, "sweep failed"),
                }
                if self.shutdown.is_cancelled() {
                    break;
                }
            }
            if self.shutdown.is_cancelled() {
                break;
            }
        }
        info!("reaper stopped");
    }

    /// One bounded pass over a queue's stale positions.
    pub async fn sweep(&self, queue: &str) -> StoreResult<u32> {
        let Some(desc) = self.catalog.get(queue).await? else {
            return Ok(0);
        };
        let now = clock::epoch_s();
        let cutoff = now.saturating_sub(desc.heartbeat_timeout_s);

        let stale = self
            .store
            .range_by_score(
                &keys::liveness(queue),
                f64::NEG_INFINITY,
                cutoff as f64,
                self.batch,
            )
            .await?;

        let mut expired = 0;
        for position_id in stale {
            // The atomic expiry re-checks the score; a concurrent heartbeat
            // or a second reaper instance loses cleanly here.
            if self
                .store
                .expire_position(queue, &position_id, cutoff, now)
                .await?
            {
                expired += 1;
                self.events.emit(
                    EventType::PositionExpired,
                    queue,
                    serde_json::json!({
                        "position_id": position_id,
                        "reason": "heartbeat-timeout",
                    }),
                );
            }
        }
        Ok(expired)
    }
}
