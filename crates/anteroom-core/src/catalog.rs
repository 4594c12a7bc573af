//! Queue descriptor registry and read-through cache.
//!
//! Descriptors are created once and updated rarely; every hot path reads
//! them through this cache. Local admin writes invalidate immediately; other
//! processes converge within the cache TTL or on a `queue.queue.updated`
//! event.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::info;

use crate::clock;
use crate::error::{AdminError, StoreResult};
use crate::events::{EventType, Events};
use crate::queue::{QueueDescriptor, QueuePatch, QueueState};
use crate::store::{keys, Store};

/// Freshness window for cached descriptors.
const CACHE_TTL: Duration = Duration::from_secs(5);
/// Upper bound on the queue registry scan.
const MAX_QUEUES: usize = 10_000;

/// Snapshot counters for the admin stats surface.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub queue_length: u64,
    pub waiting_by_priority: [u64; 4],
    pub live_count: u64,
    pub active_sessions: u64,
    pub bucket_tokens: Option<f64>,
}

pub struct QueueCatalog {
    store: Arc<dyn Store>,
    events: Events,
    cache: RwLock<HashMap<String, (QueueDescriptor, Instant)>>,
}

impl QueueCatalog {
    pub fn new(store: Arc<dyn Store>, events: Events) -> Self {
        Self {
            store,
            events,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Read-through descriptor lookup.
    pub async fn get(&self, name: &str) -> StoreResult<Option<QueueDescriptor>> {
        if let Ok(cache) = self.cache.read() {
            if let Some((desc, cached_at)) = cache.get(name) {
                if cached_at.elapsed() < CACHE_TTL {
                    return Ok(Some(desc.clone()));
                }
            }
        }

        let fields = self.store.hash_get_all(&keys::queue_cfg(name)).await?;
        if fields.is_empty() {
            self.invalidate(name);
            return Ok(None);
        }
        let desc = QueueDescriptor::from_fields(&fields).ok_or_else(|| {
            crate::error::StoreError::Fatal(format!("corrupt descriptor for queue {name}"))
        })?;
        if let Ok(mut cache) = self.cache.write() {
            cache.insert(name.to_string(), (desc.clone(), Instant::now()));
        }
        Ok(Some(desc))
    }

    /// Drop a cached descriptor. Called on local admin writes and on
    /// queue-admin events from other processes.
    pub fn invalidate(&self, name: &str) {
        if let Ok(mut cache) = self.cache.write() {
            cache.remove(name);
        }
    }

    /// All known queue names, oldest first.
    pub async fn list(&self) -> StoreResult<Vec<String>> {
        self.store
            .range_by_score(&keys::registry(), f64::NEG_INFINITY, f64::INFINITY, MAX_QUEUES)
            .await
    }

    /// Register a new queue. The registry add is the uniqueness gate: of two
    /// racing creates, exactly one wins.
    pub async fn create(&self, desc: QueueDescriptor) -> Result<(), AdminError> {
        validate_name(&desc.name)?;
        validate_descriptor(&desc)?;

        let added = self
            .store
            .add_ordered(&keys::registry(), &desc.name, clock::epoch_s() as f64)
            .await?;
        if !added {
            return Err(AdminError::AlreadyExists(desc.name));
        }

        self.store
            .hash_set(&keys::queue_cfg(&desc.name), &desc.to_fields())
            .await?;
        info!(queue = %desc.name, "queue created");
        self.events.emit(
            EventType::QueueCreated,
            &desc.name,
            serde_json::to_value(&desc).unwrap_or_default(),
        );
        Ok(())
    }

    /// Apply a partial update and publish the matching admin events.
    pub async fn update(
        &self,
        name: &str,
        patch: &QueuePatch,
    ) -> Result<QueueDescriptor, AdminError> {
        let mut desc = self
            .get(name)
            .await?
            .ok_or_else(|| AdminError::NotFound(name.to_string()))?;
        let previous_state = desc.status;
        patch.apply(&mut desc);
        validate_descriptor(&desc)?;

        self.store
            .hash_set(&keys::queue_cfg(name), &desc.to_fields())
            .await?;
        self.invalidate(name);

        info!(queue = %name, state = %desc.status, "queue updated");
        self.events.emit(
            EventType::QueueUpdated,
            name,
            serde_json::to_value(&desc).unwrap_or_default(),
        );
        if previous_state != desc.status {
            let transition = match desc.status {
                QueueState::Paused => EventType::QueuePaused,
                QueueState::Maintenance => EventType::QueueMaintenance,
                QueueState::Active => EventType::QueueResumed,
            };
            self.events.emit(
                transition,
                name,
                serde_json::json!({ "from": previous_state, "to": desc.status }),
            );
        }
        Ok(desc)
    }

    /// Point-in-time counters for one queue.
    pub async fn stats(&self, name: &str) -> Result<QueueStats, AdminError> {
        self.get(name)
            .await?
            .ok_or_else(|| AdminError::NotFound(name.to_string()))?;

        let mut waiting_by_priority = [0u64; 4];
        for (slot, count) in waiting_by_priority.iter_mut().enumerate() {
            *count = self
                .store
                .list_len(&keys::priority_list(name, slot as u8))
                .await?;
        }
        let bucket = self.store.hash_get_all(&keys::bucket(name)).await?;
        Ok(QueueStats {
            queue_length: self.store.length(&keys::rank(name)).await?,
            waiting_by_priority,
            live_count: self.store.length(&keys::liveness(name)).await?,
            active_sessions: self.store.length(&keys::sessions(name)).await?,
            bucket_tokens: bucket.get("tokens").and_then(|t| t.parse().ok()),
        })
    }
}

fn validate_name(name: &str) -> Result<(), AdminError> {
    if name.is_empty() || name.len() > 128 {
        return Err(AdminError::Invalid("queue name length".into()));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(AdminError::Invalid(format!(
            "queue name {name:?} contains unsupported characters"
        )));
    }
    Ok(())
}

fn validate_descriptor(desc: &QueueDescriptor) -> Result<(), AdminError> {
    if desc.target_url.is_empty() {
        return Err(AdminError::Invalid("target_url is required".into()));
    }
    if !desc.admission_rate.is_finite() || desc.admission_rate < 0.0 {
        return Err(AdminError::Invalid("admission_rate must be finite and >= 0".into()));
    }
    if desc.max_active == 0 {
        return Err(AdminError::Invalid("max_active must be positive".into()));
    }
    if desc.heartbeat_timeout_s == 0 || desc.heartbeat_interval_s == 0 {
        return Err(AdminError::Invalid("heartbeat settings must be positive".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemorySink;
    use crate::store::MemoryStore;

    fn catalog_with_sink() -> (QueueCatalog, std::sync::Arc<MemorySink>) {
        let sink = MemorySink::new();
        let events = Events::new(sink.clone(), "test");
        let catalog = QueueCatalog::new(Arc::new(MemoryStore::new()), events);
        (catalog, sink)
    }

    #[tokio::test]
    async fn create_then_get_roundtrips() {
        let (catalog, sink) = catalog_with_sink();
        let desc = QueueDescriptor::new("launch", "https://origin.example");
        catalog.create(desc.clone()).await.unwrap();

        let loaded = catalog.get("launch").await.unwrap().unwrap();
        assert_eq!(loaded, desc);
        assert_eq!(sink.count_of(EventType::QueueCreated), 1);
        assert_eq!(catalog.list().await.unwrap(), vec!["launch".to_string()]);
    }

    #[tokio::test]
    async fn duplicate_create_conflicts() {
        let (catalog, _) = catalog_with_sink();
        let desc = QueueDescriptor::new("launch", "https://origin.example");
        catalog.create(desc.clone()).await.unwrap();
        let err = catalog.create(desc).await.unwrap_err();
        assert!(matches!(err, AdminError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn invalid_names_and_rates_are_rejected() {
        let (catalog, _) = catalog_with_sink();
        let desc = QueueDescriptor::new("bad name!", "https://origin.example");
        assert!(matches!(
            catalog.create(desc).await.unwrap_err(),
            AdminError::Invalid(_)
        ));

        let mut desc = QueueDescriptor::new("ok", "https://origin.example");
        desc.admission_rate = f64::NAN;
        assert!(matches!(
            catalog.create(desc).await.unwrap_err(),
            AdminError::Invalid(_)
        ));
    }

    #[tokio::test]
    async fn pause_emits_transition_event() {
        let (catalog, sink) = catalog_with_sink();
        catalog
            .create(QueueDescriptor::new("launch", "https://origin.example"))
            .await
            .unwrap();
        sink.take();

        let patch = QueuePatch {
            status: Some(QueueState::Paused),
            ..Default::default()
        };
        let updated = catalog.update("launch", &patch).await.unwrap();
        assert_eq!(updated.status, QueueState::Paused);
        assert_eq!(sink.count_of(EventType::QueueUpdated), 1);
        assert_eq!(sink.count_of(EventType::QueuePaused), 1);

        // Resuming publishes the resume transition.
        let patch = QueuePatch {
            status: Some(QueueState::Active),
            ..Default::default()
        };
        catalog.update("launch", &patch).await.unwrap();
        assert_eq!(sink.count_of(EventType::QueueResumed), 1);
    }

    #[tokio::test]
    async fn update_unknown_queue_is_not_found() {
        let (catalog, _) = catalog_with_sink();
        let err = catalog
            .update("ghost", &QueuePatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AdminError::NotFound(_)));
    }

    #[tokio::test]
    async fn stats_reflect_empty_queue() {
        let (catalog, _) = catalog_with_sink();
        catalog
            .create(QueueDescriptor::new("launch", "https://origin.example"))
            .await
            .unwrap();
        let stats = catalog.stats("launch").await.unwrap();
        assert_eq!(stats.queue_length, 0);
        assert_eq!(stats.waiting_by_priority, [0, 0, 0, 0]);
        assert_eq!(stats.active_sessions, 0);
        assert!(stats.bucket_tokens.is_none());
    }
}
