//! The queue engine: enqueue, dequeue, heartbeat, cancel, and rank lookup
//! over the shared store's atomic operations.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::catalog::QueueCatalog;
use crate::clock;
use crate::error::{EnqueueError, PositionError, StoreResult};
use crate::events::{EventType, Events};
use crate::position::{Position, PositionStatus, Priority};
use crate::queue::QueueState;
use crate::store::{EnqueueOutcome, NewPosition, Store, TouchOutcome};

/// What the gateway needs to answer an enqueue.
#[derive(Debug, Clone)]
pub struct EnqueueReceipt {
    pub position_id: String,
    /// False when the fingerprint already held a waiting position.
    pub created: bool,
    pub priority: Priority,
    /// 0-indexed count of strictly preceding positions.
    pub rank: u64,
    pub queue_length: u64,
    pub estimated_wait_s: u64,
    pub heartbeat_interval_s: u64,
    pub heartbeat_timeout_s: u64,
    /// When the position lapses if never heartbeated again.
    pub expires_at_s: u64,
}

/// Inputs to an enqueue, assembled by the gateway.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub queue_id: String,
    pub priority: Priority,
    pub fingerprint: String,
    pub ua_hash: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Outcome of a heartbeat or status poll.
#[derive(Debug, Clone, PartialEq)]
pub enum PositionView {
    Waiting {
        queue_id: String,
        rank: u64,
        queue_length: u64,
        estimated_wait_s: u64,
    },
    Admitted {
        queue_id: String,
        session_id: Option<String>,
    },
}

pub struct QueueEngine {
    store: Arc<dyn Store>,
    catalog: Arc<QueueCatalog>,
    events: Events,
    /// Publish one in N heartbeat events.
    heartbeat_sample: u64,
    touch_count: AtomicU64,
}

impl QueueEngine {
    pub fn new(
        store: Arc<dyn Store>,
        catalog: Arc<QueueCatalog>,
        events: Events,
        heartbeat_sample: u64,
    ) -> Self {
        Self {
            store,
            catalog,
            events,
            heartbeat_sample: heartbeat_sample.max(1),
            touch_count: AtomicU64::new(0),
        }
    }

    /// Advisory wait estimate: rank over admission rate, clamped at zero.
    pub fn estimate_wait_s(rank: u64, admission_rate: f64) -> u64 {
        if admission_rate <= f64::EPSILON {
            return 0;
        }
        (rank as f64 / admission_rate).ceil() as u64
    }

    pub async fn enqueue(&self, req: &EnqueueRequest) -> Result<EnqueueReceipt, EnqueueError> {
        let desc = self
            .catalog
            .get(&req.queue_id)
            .await?
            .ok_or_else(|| EnqueueError::QueueNotFound(req.queue_id.clone()))?;

        let new = NewPosition {
            queue_id: req.queue_id.clone(),
            position_id: Position::new_id(),
            priority: req.priority,
            fingerprint: req.fingerprint.clone(),
            ua_hash: req.ua_hash.clone(),
            metadata: req
                .metadata
                .as_ref()
                .map(|m| m.to_string())
                .filter(|m| m != "null"),
            now_us: clock::epoch_us(),
            now_s: clock::epoch_s(),
        };

        match self.store.enqueue_position(&new).await? {
            EnqueueOutcome::Created {
                position_id,
                rank,
                queue_length,
            } => {
                self.events.emit(
                    EventType::PositionEnqueued,
                    &req.queue_id,
                    serde_json::json!({
                        "position_id": position_id,
                        "priority": req.priority.as_u8(),
                        "rank": rank,
                        "queue_length": queue_length,
                    }),
                );
                Ok(self.receipt(&desc, position_id, true, req.priority, rank, queue_length))
            }
            EnqueueOutcome::Existing {
                position_id,
                rank,
                queue_length,
            } => {
                debug!(queue = %req.queue_id, position = %position_id, "duplicate enqueue suppressed");
                Ok(self.receipt(&desc, position_id, false, req.priority, rank, queue_length))
            }
            EnqueueOutcome::Unavailable { state } => match state {
                None => Err(EnqueueError::QueueNotFound(req.queue_id.clone())),
                Some(state) => Err(EnqueueError::QueueUnavailable {
                    queue: req.queue_id.clone(),
                    state: QueueState::parse(&state).unwrap_or(QueueState::Maintenance),
                }),
            },
            EnqueueOutcome::Full { max_size } => Err(EnqueueError::QueueFull {
                queue: req.queue_id.clone(),
                max_size,
            }),
        }
    }

    fn receipt(
        &self,
        desc: &crate::queue::QueueDescriptor,
        position_id: String,
        created: bool,
        priority: Priority,
        rank: u64,
        queue_length: u64,
    ) -> EnqueueReceipt {
        EnqueueReceipt {
            position_id,
            created,
            priority,
            rank,
            queue_length,
            estimated_wait_s: Self::estimate_wait_s(rank, desc.admission_rate),
            heartbeat_interval_s: desc.heartbeat_interval_s,
            heartbeat_timeout_s: desc.heartbeat_timeout_s,
            expires_at_s: clock::epoch_s() + desc.position_ttl_s(),
        }
    }

    /// Pop the next admissible position. Driven by the admission loops; the
    /// admission event is published there once the session exists.
    pub async fn dequeue(&self, queue_id: &str) -> StoreResult<Option<String>> {
        self.store.dequeue_position(queue_id, clock::epoch_s()).await
    }

    /// Proof-of-life. Refreshes liveness for waiting positions and reports
    /// the admitted session once admission has happened.
    pub async fn heartbeat(&self, position_id: &str) -> Result<PositionView, PositionError> {
        match self
            .store
            .touch_position(position_id, clock::epoch_s())
            .await?
        {
            TouchOutcome::Waiting { queue_id } => {
                let count = self.touch_count.fetch_add(1, Ordering::Relaxed);
                if count % self.heartbeat_sample == 0 {
                    self.events.emit(
                        EventType::PositionHeartbeat,
                        &queue_id,
                        serde_json::json!({ "position_id": position_id, "sampled": true }),
                    );
                }
                self.waiting_view(position_id).await
            }
            TouchOutcome::Admitted {
                queue_id,
                session_id,
            } => Ok(PositionView::Admitted {
                queue_id,
                session_id,
            }),
            TouchOutcome::Expired => Err(PositionError::Expired(position_id.to_string())),
            TouchOutcome::Cancelled => Err(PositionError::Cancelled(position_id.to_string())),
            TouchOutcome::Missing => Err(PositionError::NotFound(position_id.to_string())),
        }
    }

    /// Read-only status: rank and length, or the admitted session. Unlike
    /// heartbeat this refreshes nothing.
    pub async fn status(&self, position_id: &str) -> Result<PositionView, PositionError> {
        let snapshot = self
            .store
            .position_rank(position_id)
            .await?
            .ok_or_else(|| PositionError::NotFound(position_id.to_string()))?;
        match snapshot.status {
            PositionStatus::Waiting => {
                let rate = self
                    .catalog
                    .get(&snapshot.queue_id)
                    .await?
                    .map(|d| d.admission_rate)
                    .unwrap_or(crate::queue::QueueDescriptor::DEFAULT_ADMISSION_RATE);
                Ok(PositionView::Waiting {
                    queue_id: snapshot.queue_id,
                    rank: snapshot.rank,
                    queue_length: snapshot.queue_length,
                    estimated_wait_s: Self::estimate_wait_s(snapshot.rank, rate),
                })
            }
            PositionStatus::Admitted | PositionStatus::Completed => {
                let session_id = self
                    .store
                    .hash_get(&crate::store::keys::position(position_id), "session_id")
                    .await?;
                Ok(PositionView::Admitted {
                    queue_id: snapshot.queue_id,
                    session_id,
                })
            }
            PositionStatus::Expired => Err(PositionError::Expired(position_id.to_string())),
            PositionStatus::Cancelled => Err(PositionError::Cancelled(position_id.to_string())),
        }
    }

    /// Voluntary leave. Terminal: the position cannot be revived.
    pub async fn cancel(&self, position_id: &str) -> Result<(), PositionError> {
        match self.store.cancel_position(position_id).await? {
            Some(queue_id) => {
                self.events.emit(
                    EventType::PositionCancelled,
                    &queue_id,
                    serde_json::json!({ "position_id": position_id }),
                );
                Ok(())
            }
            // Not waiting any more; report which terminal state won.
            None => match self.store.position_rank(position_id).await? {
                Some(snapshot) => match snapshot.status {
                    PositionStatus::Cancelled => {
                        Err(PositionError::Cancelled(position_id.to_string()))
                    }
                    PositionStatus::Expired => {
                        Err(PositionError::Expired(position_id.to_string()))
                    }
                    _ => Err(PositionError::NotFound(position_id.to_string())),
                },
                None => Err(PositionError::NotFound(position_id.to_string())),
            },
        }
    }

    async fn waiting_view(&self, position_id: &str) -> Result<PositionView, PositionError> {
        let snapshot = self
            .store
            .position_rank(position_id)
            .await?
            .ok_or_else(|| PositionError::NotFound(position_id.to_string()))?;
        let rate = self
            .catalog
            .get(&snapshot.queue_id)
            .await?
            .map(|d| d.admission_rate)
            .unwrap_or(crate::queue::QueueDescriptor::DEFAULT_ADMISSION_RATE);
        Ok(PositionView::Waiting {
            queue_id: snapshot.queue_id,
            rank: snapshot.rank,
            queue_length: snapshot.queue_length,
            estimated_wait_s: Self::estimate_wait_s(snapshot.rank, rate),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemorySink;
    use crate::queue::QueueDescriptor;
    use crate::store::MemoryStore;

    struct Fixture {
        engine: QueueEngine,
        catalog: Arc<QueueCatalog>,
        sink: Arc<MemorySink>,
    }

    async fn fixture() -> Fixture {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let sink = MemorySink::new();
        let events = Events::new(sink.clone(), "test");
        let catalog = Arc::new(QueueCatalog::new(store.clone(), events.clone()));
        catalog
            .create(QueueDescriptor::new("launch", "https://origin.example"))
            .await
            .unwrap();
        Fixture {
            engine: QueueEngine::new(store, catalog.clone(), events, 1),
            catalog,
            sink,
        }
    }

    fn request(fingerprint: &str, priority: Priority) -> EnqueueRequest {
        EnqueueRequest {
            queue_id: "launch".to_string(),
            priority,
            fingerprint: fingerprint.to_string(),
            ua_hash: None,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn enqueue_emits_event_and_builds_receipt() {
        let fx = fixture().await;
        let receipt = fx
            .engine
            .enqueue(&request("f1", Priority::Normal))
            .await
            .unwrap();
        assert!(receipt.created);
        assert_eq!(receipt.rank, 0);
        assert_eq!(receipt.queue_length, 1);
        assert_eq!(receipt.heartbeat_interval_s, 10);
        assert_eq!(receipt.estimated_wait_s, 0);
        assert_eq!(fx.sink.count_of(EventType::PositionEnqueued), 1);
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_suppressed_without_event() {
        let fx = fixture().await;
        let first = fx
            .engine
            .enqueue(&request("same", Priority::Normal))
            .await
            .unwrap();
        let second = fx
            .engine
            .enqueue(&request("same", Priority::Normal))
            .await
            .unwrap();

        assert_eq!(second.position_id, first.position_id);
        assert!(!second.created);
        assert_eq!(second.queue_length, 1);
        assert_eq!(fx.sink.count_of(EventType::PositionEnqueued), 1);
    }

    #[tokio::test]
    async fn enqueue_unknown_queue_fails() {
        let fx = fixture().await;
        let mut req = request("f", Priority::Normal);
        req.queue_id = "ghost".to_string();
        assert!(matches!(
            fx.engine.enqueue(&req).await.unwrap_err(),
            EnqueueError::QueueNotFound(_)
        ));
    }

    #[tokio::test]
    async fn paused_queue_surfaces_unavailable() {
        let fx = fixture().await;
        fx.catalog
            .update(
                "launch",
                &crate::queue::QueuePatch {
                    status: Some(QueueState::Paused),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let err = fx
            .engine
            .enqueue(&request("f", Priority::Normal))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EnqueueError::QueueUnavailable {
                state: QueueState::Paused,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn heartbeat_reports_rank_and_estimate() {
        let fx = fixture().await;
        let first = fx
            .engine
            .enqueue(&request("f1", Priority::Normal))
            .await
            .unwrap();
        let second = fx
            .engine
            .enqueue(&request("f2", Priority::Normal))
            .await
            .unwrap();

        let view = fx.engine.heartbeat(&second.position_id).await.unwrap();
        assert_eq!(
            view,
            PositionView::Waiting {
                queue_id: "launch".to_string(),
                rank: 1,
                queue_length: 2,
                estimated_wait_s: 1,
            }
        );

        let view = fx.engine.heartbeat(&first.position_id).await.unwrap();
        let PositionView::Waiting { rank, .. } = view else {
            panic!("expected waiting view");
        };
        assert_eq!(rank, 0);
    }

    #[tokio::test]
    async fn heartbeat_after_dequeue_reports_admitted() {
        let fx = fixture().await;
        let receipt = fx
            .engine
            .enqueue(&request("f1", Priority::Normal))
            .await
            .unwrap();
        let popped = fx.engine.dequeue("launch").await.unwrap();
        assert_eq!(popped.as_deref(), Some(receipt.position_id.as_str()));

        let view = fx.engine.heartbeat(&receipt.position_id).await.unwrap();
        assert!(matches!(view, PositionView::Admitted { .. }));
    }

    #[tokio::test]
    async fn cancel_then_heartbeat_reports_cancelled() {
        let fx = fixture().await;
        let receipt = fx
            .engine
            .enqueue(&request("f1", Priority::Normal))
            .await
            .unwrap();
        fx.engine.cancel(&receipt.position_id).await.unwrap();
        assert_eq!(fx.sink.count_of(EventType::PositionCancelled), 1);

        assert!(matches!(
            fx.engine.heartbeat(&receipt.position_id).await.unwrap_err(),
            PositionError::Cancelled(_)
        ));
        // Cancelling again reports the terminal state, not success.
        assert!(matches!(
            fx.engine.cancel(&receipt.position_id).await.unwrap_err(),
            PositionError::Cancelled(_)
        ));
    }

    #[tokio::test]
    async fn unknown_position_heartbeat_is_not_found() {
        let fx = fixture().await;
        assert!(matches!(
            fx.engine.heartbeat("ghost").await.unwrap_err(),
            PositionError::NotFound(_)
        ));
    }

    #[test]
    fn wait_estimates_clamp_and_ceil() {
        assert_eq!(QueueEngine::estimate_wait_s(0, 1.0), 0);
        assert_eq!(QueueEngine::estimate_wait_s(5, 2.0), 3);
        assert_eq!(QueueEngine::estimate_wait_s(5, 0.5), 10);
        assert_eq!(QueueEngine::estimate_wait_s(5, 0.0), 0);
    }
}
