//! Public queue surface: enqueue, status, heartbeat, cancel.
//!
//! Internal ranks are 0-indexed; the wire reports `position = rank + 1` so
//! the head of the queue reads as position 1.

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use anteroom_core::engine::PositionView;
use anteroom_core::{Claims, CredentialKind, EnqueueRequest, Priority};

use crate::app::AppState;
use crate::error::ApiError;
use crate::extract::{Bearer, ClientIdentity};

#[derive(Debug, Default, Deserialize)]
pub struct EnqueueBody {
    #[serde(default)]
    pub priority: u8,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub token: String,
    pub position_id: String,
    /// 1-indexed wait-order; 1 is the head of the queue.
    pub position: u64,
    pub queue_length: u64,
    pub estimated_wait_seconds: u64,
    pub heartbeat_interval_seconds: u64,
    pub heartbeat_timeout_seconds: u64,
    pub expires_at: u64,
}

pub async fn enqueue(
    State(state): State<AppState>,
    Path(queue): Path<String>,
    client: ClientIdentity,
    body: Option<Json<EnqueueBody>>,
) -> Result<Json<EnqueueResponse>, ApiError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let priority = Priority::try_from(body.priority).map_err(ApiError::invalid_request)?;

    let receipt = state
        .engine
        .enqueue(&EnqueueRequest {
            queue_id: queue.clone(),
            priority,
            fingerprint: client.fingerprint.clone(),
            ua_hash: client.ua_hash.clone(),
            metadata: body.metadata,
        })
        .await?;

    let issued = state.credentials.issue_waiting(
        &receipt.position_id,
        &queue,
        receipt.priority,
        &client.fingerprint,
    )?;

    Ok(Json(EnqueueResponse {
        token: issued.token,
        position_id: receipt.position_id,
        position: receipt.rank + 1,
        queue_length: receipt.queue_length,
        estimated_wait_seconds: receipt.estimated_wait_s,
        heartbeat_interval_seconds: receipt.heartbeat_interval_s,
        heartbeat_timeout_seconds: receipt.heartbeat_timeout_s,
        expires_at: receipt.expires_at_s,
    }))
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum PositionResponse {
    Waiting {
        position: u64,
        queue_length: u64,
        estimated_wait_seconds: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    Admitted {
        session_id: String,
        session_token: String,
        redirect_url: String,
    },
}

async fn authorize(
    state: &AppState,
    queue: &str,
    bearer: &Bearer,
    client: &ClientIdentity,
) -> Result<Claims, ApiError> {
    let claims = state
        .credentials
        .validate(
            &bearer.0,
            CredentialKind::Waiting,
            Some(&client.fingerprint),
            state.lenient_binding,
        )
        .await?;
    if claims.sub != queue {
        return Err(ApiError::unauthorized("credential is for a different queue"));
    }
    Ok(claims)
}

async fn admitted_payload(
    state: &AppState,
    queue: &str,
    session_id: Option<String>,
) -> Result<PositionResponse, ApiError> {
    let session_id = session_id
        .ok_or_else(|| ApiError::internal("admitted position has no session attached"))?;
    let session = state.sessions.get(&session_id).await?;
    let redirect_url = state
        .catalog
        .get(queue)
        .await?
        .map(|d| d.target_url)
        .unwrap_or_default();
    Ok(PositionResponse::Admitted {
        session_id,
        session_token: session.token,
        redirect_url,
    })
}

pub async fn status(
    State(state): State<AppState>,
    Path(queue): Path<String>,
    client: ClientIdentity,
    bearer: Bearer,
) -> Result<Json<PositionResponse>, ApiError> {
    let claims = authorize(&state, &queue, &bearer, &client).await?;
    match state.engine.status(&claims.jti).await? {
        PositionView::Waiting {
            rank,
            queue_length,
            estimated_wait_s,
            ..
        } => Ok(Json(PositionResponse::Waiting {
            position: rank + 1,
            queue_length,
            estimated_wait_seconds: estimated_wait_s,
            token: None,
        })),
        PositionView::Admitted { session_id, .. } => {
            Ok(Json(admitted_payload(&state, &queue, session_id).await?))
        }
    }
}

pub async fn heartbeat(
    State(state): State<AppState>,
    Path(queue): Path<String>,
    client: ClientIdentity,
    bearer: Bearer,
) -> Result<Json<PositionResponse>, ApiError> {
    let claims = authorize(&state, &queue, &bearer, &client).await?;
    match state.engine.heartbeat(&claims.jti).await? {
        PositionView::Waiting {
            rank,
            queue_length,
            estimated_wait_s,
            ..
        } => {
            // Roll the credential over once it is past half its lifetime;
            // the old one stays valid until expiry.
            let token = if state.credentials.needs_refresh(&claims) {
                Some(state.credentials.refresh_waiting(&claims)?.token)
            } else {
                None
            };
            Ok(Json(PositionResponse::Waiting {
                position: rank + 1,
                queue_length,
                estimated_wait_seconds: estimated_wait_s,
                token,
            }))
        }
        PositionView::Admitted { session_id, .. } => {
            Ok(Json(admitted_payload(&state, &queue, session_id).await?))
        }
    }
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(queue): Path<String>,
    client: ClientIdentity,
    bearer: Bearer,
) -> Result<Json<serde_json::Value>, ApiError> {
    let claims = authorize(&state, &queue, &bearer, &client).await?;
    state.engine.cancel(&claims.jti).await?;
    Ok(Json(serde_json::json!({ "status": "cancelled" })))
}
