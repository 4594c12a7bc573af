//! Router assembly and shared state.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::middleware;
use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};

use anteroom_core::fingerprint::Fingerprinter;
use anteroom_core::{
    CredentialService, QueueCatalog, QueueEngine, SessionManager, Store,
};

use crate::error::ApiError;
use crate::handlers::{admin, queue, session};
use crate::ratelimit;

/// Default public-surface budget per fingerprint per minute.
pub const DEFAULT_RATE_LIMIT_PER_MINUTE: i64 = 120;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub engine: Arc<QueueEngine>,
    pub catalog: Arc<QueueCatalog>,
    pub sessions: Arc<SessionManager>,
    pub credentials: Arc<CredentialService>,
    pub fingerprinter: Fingerprinter,
    /// `None` disables the admin surface entirely.
    pub admin_key: Option<String>,
    pub lenient_binding: bool,
    pub rate_limit_per_minute: i64,
}

pub fn router(state: AppState) -> Router {
    let public = Router::new()
        .route("/queues/:queue/enqueue", post(queue::enqueue))
        .route("/queues/:queue/status", get(queue::status))
        .route("/queues/:queue/heartbeat", post(queue::heartbeat))
        .route("/queues/:queue/position", delete(queue::cancel))
        .route("/sessions/:session", get(session::info))
        .route("/sessions/:session/activity", post(session::activity))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            ratelimit::enforce,
        ));

    let admin = Router::new()
        .route("/admin/queues", post(admin::create_queue))
        .route("/admin/queues/:queue", patch(admin::update_queue))
        .route("/admin/queues/:queue/stats", get(admin::queue_stats))
        .route("/admin/sessions/:session", delete(admin::terminate_session));

    Router::new()
        .nest("/api/v1", public.merge(admin))
        .route("/health", get(health))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    state.store.ping().await.map_err(|err| {
        tracing::error!(%err, "health probe failed");
        ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "internal-error",
            "store unreachable",
        )
    })?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}
