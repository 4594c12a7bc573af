//! Active-session records: creation at admission, activity tracking, TTL
//! expiry, and administrative termination.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::clock;
use crate::error::{SessionError, StoreResult};
use crate::events::{EventType, Events};
use crate::queue::QueueDescriptor;
use crate::session::{ActiveSession, SessionStatus};
use crate::store::{keys, Store};

pub struct SessionManager {
    store: Arc<dyn Store>,
    events: Events,
}

impl SessionManager {
    pub fn new(store: Arc<dyn Store>, events: Events) -> Self {
        Self { store, events }
    }

    /// Carve out an active-session record for a freshly admitted position.
    /// The record holds the admitted credential until the client's next poll
    /// picks it up.
    pub async fn create(
        &self,
        desc: &QueueDescriptor,
        position_id: &str,
        session_id: String,
        token: String,
    ) -> StoreResult<ActiveSession> {
        let now = clock::epoch_s();
        let session = ActiveSession {
            id: session_id,
            queue_id: desc.name.clone(),
            position_id: position_id.to_string(),
            issued_at_s: now,
            expires_at_s: now + desc.session_ttl_s,
            last_activity_s: now,
            view_count: 0,
            status: SessionStatus::Active,
            token,
        };

        let key = keys::session(&session.id);
        self.store.hash_set(&key, &session.to_fields()).await?;
        self.store
            .expire(&key, Duration::from_secs(desc.session_ttl_s))
            .await?;
        self.store
            .add_ordered(
                &keys::sessions(&desc.name),
                &session.id,
                session.expires_at_s as f64,
            )
            .await?;

        self.events.emit(
            EventType::SessionStarted,
            &desc.name,
            serde_json::json!({
                "session_id": session.id,
                "position_id": position_id,
                "expires_at": session.expires_at_s,
            }),
        );
        Ok(session)
    }

    pub async fn get(&self, session_id: &str) -> Result<ActiveSession, SessionError> {
        let fields = self.store.hash_get_all(&keys::session(session_id)).await?;
        if fields.is_empty() {
            return Err(SessionError::NotFound(session_id.to_string()));
        }
        let session = ActiveSession::from_fields(session_id, &fields)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        match session.status {
            SessionStatus::Terminated => Err(SessionError::Terminated(session_id.to_string())),
            SessionStatus::Expired => Err(SessionError::Expired(session_id.to_string())),
            // The store TTL normally reaps expired records; the explicit
            // check guards against clock drift between layers.
            SessionStatus::Active if session.expires_at_s < clock::epoch_s() => {
                Err(SessionError::Expired(session_id.to_string()))
            }
            SessionStatus::Active => Ok(session),
        }
    }

    /// Record a page-view-like activity: bump the view count and refresh
    /// last-activity.
    pub async fn record_activity(&self, session_id: &str) -> Result<ActiveSession, SessionError> {
        let mut session = self.get(session_id).await?;
        let now = clock::epoch_s();
        let views = self
            .store
            .hash_increment(&keys::session(session_id), "view_count", 1)
            .await?;
        self.store
            .hash_set(
                &keys::session(session_id),
                &[("last_activity_s", now.to_string())],
            )
            .await?;
        session.view_count = views.max(0) as u64;
        session.last_activity_s = now;

        self.events.emit(
            EventType::SessionActive,
            &session.queue_id,
            serde_json::json!({ "session_id": session_id, "view_count": session.view_count }),
        );
        Ok(session)
    }

    /// Administrative force-termination.
    pub async fn terminate(
        &self,
        session_id: &str,
        reason: &str,
    ) -> Result<ActiveSession, SessionError> {
        let mut session = self.get(session_id).await?;
        self.store
            .hash_set(
                &keys::session(session_id),
                &[("status", SessionStatus::Terminated.as_str().to_string())],
            )
            .await?;
        self.store
            .remove_ordered(&keys::sessions(&session.queue_id), session_id)
            .await?;
        session.status = SessionStatus::Terminated;

        info!(session = %session_id, queue = %session.queue_id, reason, "session terminated");
        self.events.emit(
            EventType::SessionTerminated,
            &session.queue_id,
            serde_json::json!({ "session_id": session_id, "reason": reason }),
        );
        Ok(session)
    }

    /// Count of live sessions for a queue, pruning entries whose expiry has
    /// passed. Bounds admission against max-active.
    pub async fn active_count(&self, queue: &str) -> StoreResult<u64> {
        let key = keys::sessions(queue);
        self.store
            .remove_ordered_below(&key, clock::epoch_s() as f64)
            .await?;
        self.store.length(&key).await
    }
}
