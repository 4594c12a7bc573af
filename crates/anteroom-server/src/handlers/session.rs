//! Admitted-session surface.

use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;

use anteroom_core::session::ActiveSession;
use anteroom_core::{Claims, CredentialKind};

use crate::app::AppState;
use crate::error::ApiError;
use crate::extract::{Bearer, ClientIdentity};

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub session_id: String,
    pub queue_id: String,
    pub position_id: String,
    pub issued_at: u64,
    pub expires_at: u64,
    pub last_activity: u64,
    pub view_count: u64,
    pub status: String,
}

impl From<ActiveSession> for SessionResponse {
    fn from(session: ActiveSession) -> Self {
        Self {
            session_id: session.id,
            queue_id: session.queue_id,
            position_id: session.position_id,
            issued_at: session.issued_at_s,
            expires_at: session.expires_at_s,
            last_activity: session.last_activity_s,
            view_count: session.view_count,
            status: session.status.to_string(),
        }
    }
}

async fn authorize(
    state: &AppState,
    session_id: &str,
    bearer: &Bearer,
    client: &ClientIdentity,
) -> Result<Claims, ApiError> {
    let claims = state
        .credentials
        .validate(
            &bearer.0,
            CredentialKind::Admitted,
            Some(&client.fingerprint),
            state.lenient_binding,
        )
        .await?;
    if claims.jti != session_id {
        return Err(ApiError::unauthorized(
            "credential is for a different session",
        ));
    }
    Ok(claims)
}

pub async fn info(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    client: ClientIdentity,
    bearer: Bearer,
) -> Result<Json<SessionResponse>, ApiError> {
    authorize(&state, &session_id, &bearer, &client).await?;
    let session = state.sessions.get(&session_id).await?;
    Ok(Json(session.into()))
}

pub async fn activity(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    client: ClientIdentity,
    bearer: Bearer,
) -> Result<Json<SessionResponse>, ApiError> {
    authorize(&state, &session_id, &bearer, &client).await?;
    let session = state.sessions.record_activity(&session_id).await?;
    Ok(Json(session.into()))
}
