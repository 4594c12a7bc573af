//! Admission control: one token-bucket loop per known queue.
//!
//! A driver task discovers queues from the registry and spawns a loop for
//! each. Every tick the loop consumes bucket tokens, dequeues the head of
//! the waiting pool, carves out an active session, mints the admitted
//! credential, and publishes the admission events. Loops log transient
//! failures and carry on; they never take the process down.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::QueueCatalog;
use crate::credential::CredentialService;
use crate::engine::QueueEngine;
use crate::error::AdmitError;
use crate::events::{EventType, Events};
use crate::position::Position;
use crate::queue::{QueueDescriptor, QueueState};
use crate::session::ActiveSession;
use crate::sessions::SessionManager;
use crate::store::{keys, Store};

/// Registry re-scan cadence for newly created queues.
const DISCOVERY_INTERVAL: Duration = Duration::from_secs(5);
/// Tick floor: even very fast queues tick no faster than this.
const MIN_TICK: Duration = Duration::from_millis(100);
/// Re-check cadence while a queue is paused, in maintenance, or rate <= 0.
const PARKED_TICK: Duration = Duration::from_secs(1);

pub struct AdmissionController {
    store: Arc<dyn Store>,
    catalog: Arc<QueueCatalog>,
    engine: Arc<QueueEngine>,
    credentials: Arc<CredentialService>,
    sessions: Arc<SessionManager>,
    events: Events,
    shutdown: CancellationToken,
}

impl AdmissionController {
    pub fn new(
        store: Arc<dyn Store>,
        catalog: Arc<QueueCatalog>,
        engine: Arc<QueueEngine>,
        credentials: Arc<CredentialService>,
        sessions: Arc<SessionManager>,
        events: Events,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            catalog,
            engine,
            credentials,
            sessions,
            events,
            shutdown,
        })
    }

    /// Spawn the driver task. It owns the per-queue loop tasks; everything
    /// winds down when the shutdown token fires.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(controller.drive())
    }

    async fn drive(self: Arc<Self>) {
        info!("admission driver started");
        let mut known: HashSet<String> = HashSet::new();
        loop {
            match self.catalog.list().await {
                Ok(names) => {
                    for name in names {
                        if known.insert(name.clone()) {
                            let controller = Arc::clone(&self);
                            tokio::spawn(controller.queue_loop(name));
                        }
                    }
                }
                Err(err) => warn!(%err, "queue discovery failed"),
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(DISCOVERY_INTERVAL) => {}
            }
        }
        info!("admission driver stopped");
    }

    async fn queue_loop(self: Arc<Self>, queue: String) {
        info!(queue = %queue, "admission loop started");
        while !self.shutdown.is_cancelled() {
            let tick = match self.catalog.get(&queue).await {
                Ok(Some(desc)) if desc.status == QueueState::Active && desc.admission_rate > 0.0 => {
                    let tick = Self::tick_interval(desc.admission_rate);
                    // Work that overruns its tick is cancelled and skipped;
                    // the next tick retries. Admission degrades, never wedges.
                    match tokio::time::timeout(tick, self.tick(&desc)).await {
                        Ok(Ok(admitted)) if admitted > 0 => {
                            debug!(queue = %queue, admitted, "admission tick")
                        }
                        Ok(Ok(_)) => {}
                        Ok(Err(err)) => warn!(queue = %queue, %err, "admission tick failed"),
                        Err(_) => warn!(queue = %queue, "admission tick overran, skipping"),
                    }
                    tick
                }
                Ok(_) => PARKED_TICK,
                Err(err) => {
                    warn!(queue = %queue, %err, "descriptor read failed");
                    PARKED_TICK
                }
            };

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(tick) => {}
            }
        }
        info!(queue = %queue, "admission loop stopped");
    }

    /// `max(1/rate, 100 ms)`.
    fn tick_interval(rate: f64) -> Duration {
        Duration::from_secs_f64((1.0 / rate).max(MIN_TICK.as_secs_f64()))
    }

    /// Admit as many positions as the bucket and the active pool allow.
    /// The per-queue loop drives this once per tick.
    pub async fn tick(&self, desc: &QueueDescriptor) -> Result<u32, AdmitError> {
        let capacity = desc.max_active as f64;
        let mut admitted = 0u32;
        while u64::from(admitted) < desc.max_active {
            // The active-pool bound comes before the bucket so a full pool
            // doesn't bleed tokens.
            if self.sessions.active_count(&desc.name).await? >= desc.max_active {
                break;
            }
            if !self
                .store
                .try_admit(&desc.name, desc.admission_rate, capacity)
                .await?
            {
                break;
            }
            match self.engine.dequeue(&desc.name).await? {
                Some(position_id) => {
                    self.admit(desc, &position_id).await?;
                    admitted += 1;
                }
                None => {
                    // Nobody waiting: give the token back.
                    self.store.return_token(&desc.name, capacity).await?;
                    break;
                }
            }
        }
        Ok(admitted)
    }

    async fn admit(&self, desc: &QueueDescriptor, position_id: &str) -> Result<(), AdmitError> {
        let fields = self.store.hash_get_all(&keys::position(position_id)).await?;
        let Some(position) = Position::from_fields(position_id, &fields) else {
            // Metadata lapsed between dequeue and here; the slot is spent
            // but there is nobody to hand it to.
            warn!(queue = %desc.name, position = %position_id, "admitted position has no metadata");
            return Ok(());
        };

        let session_id = ActiveSession::new_id();
        let issued = self.credentials.issue_admitted(
            &session_id,
            &desc.name,
            position_id,
            &position.fingerprint,
            Duration::from_secs(desc.session_ttl_s),
        )?;
        let session = self
            .sessions
            .create(desc, position_id, session_id, issued.token)
            .await?;
        self.store
            .hash_set(
                &keys::position(position_id),
                &[("session_id", session.id.clone())],
            )
            .await?;

        self.events.emit(
            EventType::PositionAdmitted,
            &desc.name,
            serde_json::json!({
                "position_id": position_id,
                "session_id": session.id,
                "priority": position.priority.as_u8(),
            }),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::{CredentialKind, KeyRing};
    use crate::engine::EnqueueRequest;
    use crate::events::MemorySink;
    use crate::position::Priority;
    use crate::store::MemoryStore;

    struct Fixture {
        controller: Arc<AdmissionController>,
        engine: Arc<QueueEngine>,
        catalog: Arc<QueueCatalog>,
        sessions: Arc<SessionManager>,
        credentials: Arc<CredentialService>,
        sink: Arc<MemorySink>,
    }

    async fn fixture(desc: QueueDescriptor) -> Fixture {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let sink = MemorySink::new();
        let events = Events::new(sink.clone(), "test");
        let catalog = Arc::new(QueueCatalog::new(store.clone(), events.clone()));
        catalog.create(desc).await.unwrap();
        let engine = Arc::new(QueueEngine::new(
            store.clone(),
            catalog.clone(),
            events.clone(),
            u64::MAX,
        ));
        let credentials = Arc::new(CredentialService::new(
            KeyRing::generate().unwrap(),
            store.clone(),
            Duration::from_secs(1_800),
        ));
        let sessions = Arc::new(SessionManager::new(store.clone(), events.clone()));
        let controller = AdmissionController::new(
            store,
            catalog.clone(),
            engine.clone(),
            credentials.clone(),
            sessions.clone(),
            events,
            CancellationToken::new(),
        );
        Fixture {
            controller,
            engine,
            catalog,
            sessions,
            credentials,
            sink,
        }
    }

    fn enqueue(fingerprint: &str, priority: Priority) -> EnqueueRequest {
        EnqueueRequest {
            queue_id: "launch".to_string(),
            priority,
            fingerprint: fingerprint.to_string(),
            ua_hash: None,
            metadata: None,
        }
    }

    #[test]
    fn tick_interval_honours_rate_and_floor() {
        assert_eq!(
            AdmissionController::tick_interval(1.0),
            Duration::from_secs(1)
        );
        assert_eq!(
            AdmissionController::tick_interval(0.5),
            Duration::from_secs(2)
        );
        // Fast queues bottom out at the 100 ms floor.
        assert_eq!(
            AdmissionController::tick_interval(1_000.0),
            Duration::from_millis(100)
        );
    }

    #[tokio::test]
    async fn tick_admits_and_wires_a_session() {
        let fx = fixture(QueueDescriptor::new("launch", "https://origin.example")).await;
        let receipt = fx
            .engine
            .enqueue(&enqueue("f1", Priority::Normal))
            .await
            .unwrap();

        let desc = fx.catalog.get("launch").await.unwrap().unwrap();
        let admitted = fx.controller.tick(&desc).await.unwrap();
        assert_eq!(admitted, 1);

        // The position now reports admitted with a session, and the session
        // record holds a validating admitted credential.
        let view = fx.engine.heartbeat(&receipt.position_id).await.unwrap();
        let crate::engine::PositionView::Admitted {
            session_id: Some(session_id),
            ..
        } = view
        else {
            panic!("expected admitted view with session");
        };
        let session = fx.sessions.get(&session_id).await.unwrap();
        assert_eq!(session.position_id, receipt.position_id);

        let claims = fx
            .credentials
            .validate(&session.token, CredentialKind::Admitted, None, false)
            .await
            .unwrap();
        assert_eq!(claims.sub, "launch");
        assert_eq!(claims.pos.as_deref(), Some(receipt.position_id.as_str()));

        assert_eq!(fx.sink.count_of(EventType::PositionAdmitted), 1);
        assert_eq!(fx.sink.count_of(EventType::SessionStarted), 1);
    }

    #[tokio::test]
    async fn empty_queue_returns_the_token() {
        let mut desc = QueueDescriptor::new("launch", "https://origin.example");
        desc.max_active = 2;
        desc.admission_rate = 0.001; // effectively no refill during the test
        let fx = fixture(desc.clone()).await;

        let desc = fx.catalog.get("launch").await.unwrap().unwrap();
        assert_eq!(fx.controller.tick(&desc).await.unwrap(), 0);

        // Tokens were not bled by the empty ticks: two waiting clients are
        // both admitted from the bucket's full capacity.
        for f in ["f1", "f2"] {
            fx.engine.enqueue(&enqueue(f, Priority::Normal)).await.unwrap();
        }
        assert_eq!(fx.controller.tick(&desc).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn admission_order_follows_priorities() {
        let mut desc = QueueDescriptor::new("launch", "https://origin.example");
        desc.admission_rate = 100.0;
        let fx = fixture(desc).await;

        let plan = [
            (Priority::Normal, "a"),
            (Priority::Normal, "b"),
            (Priority::Vip, "c"),
            (Priority::Normal, "d"),
            (Priority::Premium, "e"),
        ];
        let mut by_id = std::collections::HashMap::new();
        for (priority, tag) in plan {
            let receipt = fx.engine.enqueue(&enqueue(tag, priority)).await.unwrap();
            by_id.insert(receipt.position_id, tag);
        }

        let desc = fx.catalog.get("launch").await.unwrap().unwrap();
        fx.controller.tick(&desc).await.unwrap();

        let order: Vec<&str> = fx
            .sink
            .snapshot()
            .into_iter()
            .filter(|e| e.event_type == EventType::PositionAdmitted)
            .map(|e| {
                let id = e.data["position_id"].as_str().unwrap().to_string();
                *by_id.get(&id).unwrap()
            })
            .collect();
        assert_eq!(order, vec!["e", "c", "a", "b", "d"]);
    }

    #[tokio::test]
    async fn active_pool_bound_stops_admission() {
        let mut desc = QueueDescriptor::new("launch", "https://origin.example");
        desc.max_active = 1;
        desc.admission_rate = 100.0;
        let fx = fixture(desc).await;

        for f in ["f1", "f2", "f3"] {
            fx.engine.enqueue(&enqueue(f, Priority::Normal)).await.unwrap();
        }

        let desc = fx.catalog.get("launch").await.unwrap().unwrap();
        assert_eq!(fx.controller.tick(&desc).await.unwrap(), 1);
        // Pool is full; further ticks admit nobody.
        assert_eq!(fx.controller.tick(&desc).await.unwrap(), 0);
        assert_eq!(fx.sessions.active_count("launch").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn bucket_bounds_a_burst() {
        let mut desc = QueueDescriptor::new("launch", "https://origin.example");
        desc.max_active = 3;
        desc.admission_rate = 0.001;
        let fx = fixture(desc).await;

        for i in 0..10 {
            fx.engine
                .enqueue(&enqueue(&format!("f{i}"), Priority::Normal))
                .await
                .unwrap();
        }

        // Capacity 3, negligible refill: exactly three admissions.
        let desc = fx.catalog.get("launch").await.unwrap().unwrap();
        let admitted = fx.controller.tick(&desc).await.unwrap();
        assert_eq!(admitted, 3);
        assert_eq!(fx.controller.tick(&desc).await.unwrap(), 0);
    }
}
