//! Administrative surface: queue CRUD, stats, session termination.
//!
//! Guarded by a shared key in `X-Admin-Key`; with no key configured the
//! whole surface answers 403.

use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;

use anteroom_core::clock;
use anteroom_core::{QueueDescriptor, QueuePatch, QueueState, QueueStats};

use crate::app::AppState;
use crate::error::ApiError;

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(ref expected) = state.admin_key else {
        return Err(ApiError::forbidden("admin surface is disabled"));
    };
    let presented = headers
        .get("x-admin-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if presented != expected {
        return Err(ApiError::forbidden("admin key mismatch"));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct CreateQueueBody {
    pub name: String,
    pub target_url: String,
    pub max_active: Option<u64>,
    pub max_size: Option<u64>,
    pub admission_rate: Option<f64>,
    pub heartbeat_interval_s: Option<u64>,
    pub heartbeat_timeout_s: Option<u64>,
    pub grace_period_s: Option<u64>,
    pub session_ttl_s: Option<u64>,
    pub status: Option<QueueState>,
}

pub async fn create_queue(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateQueueBody>,
) -> Result<(StatusCode, Json<QueueDescriptor>), ApiError> {
    require_admin(&state, &headers)?;

    let mut desc = QueueDescriptor::new(body.name, body.target_url);
    let patch = QueuePatch {
        target_url: None,
        max_active: body.max_active,
        max_size: body.max_size,
        admission_rate: body.admission_rate,
        heartbeat_interval_s: body.heartbeat_interval_s,
        heartbeat_timeout_s: body.heartbeat_timeout_s,
        grace_period_s: body.grace_period_s,
        session_ttl_s: body.session_ttl_s,
        status: body.status,
    };
    patch.apply(&mut desc);

    state.catalog.create(desc.clone()).await?;
    Ok((StatusCode::CREATED, Json(desc)))
}

pub async fn update_queue(
    State(state): State<AppState>,
    Path(queue): Path<String>,
    headers: HeaderMap,
    Json(patch): Json<QueuePatch>,
) -> Result<Json<QueueDescriptor>, ApiError> {
    require_admin(&state, &headers)?;
    let updated = state.catalog.update(&queue, &patch).await?;
    Ok(Json(updated))
}

pub async fn queue_stats(
    State(state): State<AppState>,
    Path(queue): Path<String>,
    headers: HeaderMap,
) -> Result<Json<QueueStats>, ApiError> {
    require_admin(&state, &headers)?;
    let stats = state.catalog.stats(&queue).await?;
    Ok(Json(stats))
}

pub async fn terminate_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_admin(&state, &headers)?;

    let session = state.sessions.terminate(&session_id, "admin-terminated").await?;
    // The bearer dies with the session, not just the record.
    let remaining = session.expires_at_s.saturating_sub(clock::epoch_s());
    state
        .credentials
        .revoke(
            &session_id,
            "session-terminated",
            Duration::from_secs(remaining.max(1)),
        )
        .await?;

    Ok(Json(serde_json::json!({
        "session_id": session_id,
        "status": "terminated",
    })))
}
