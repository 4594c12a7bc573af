//! HTTP error responses: one body shape, one closed set of symbolic codes.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use uuid::Uuid;

use anteroom_core::error::{
    AdminError, CredentialError, EnqueueError, PositionError, SessionError, StoreError,
};

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorDetail,
    request_id: String,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

/// A transport-mapped failure. Core errors convert into these through the
/// `From` impls below; handlers mostly just use `?`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid-request", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not-found", message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, "rate-limited", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal-error", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let request_id = Uuid::now_v7().to_string();
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
                details: self.details,
            },
            request_id: request_id.clone(),
        };
        let mut response = (self.status, Json(body)).into_response();
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert("x-request-id", value);
        }
        response
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        tracing::error!(error = %err, "store failure surfaced to gateway");
        ApiError::internal("store unavailable")
    }
}

impl From<EnqueueError> for ApiError {
    fn from(err: EnqueueError) -> Self {
        match err {
            EnqueueError::QueueNotFound(queue) => {
                ApiError::not_found(format!("queue {queue} does not exist"))
            }
            EnqueueError::QueueUnavailable { queue, state } => ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "maintenance",
                format!("queue {queue} is {state}"),
            ),
            EnqueueError::QueueFull { queue, max_size } => ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "queue-full",
                format!("queue {queue} is at capacity"),
            )
            .with_details(serde_json::json!({ "max_size": max_size })),
            EnqueueError::Store(err) => err.into(),
        }
    }
}

impl From<PositionError> for ApiError {
    fn from(err: PositionError) -> Self {
        match err {
            // Metadata is gone entirely: the credential no longer refers to
            // anything. Clients saw `position-expired` during the grace
            // window; from here on it is a plain auth failure.
            PositionError::NotFound(_) => ApiError::unauthorized("unknown position"),
            PositionError::Expired(_) => ApiError::new(
                StatusCode::GONE,
                "position-expired",
                "position expired after missed heartbeats",
            ),
            PositionError::Cancelled(_) => {
                ApiError::not_found("position was cancelled")
            }
            PositionError::Store(err) => err.into(),
        }
    }
}

impl From<CredentialError> for ApiError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::Store(err) => err.into(),
            CredentialError::Signing(message) => ApiError::internal(message),
            CredentialError::BoundMismatch => {
                ApiError::unauthorized("credential is bound to a different client")
            }
            CredentialError::Revoked(reason) => {
                ApiError::unauthorized(format!("credential revoked: {reason}"))
            }
            CredentialError::Expired => ApiError::unauthorized("credential expired"),
            other => ApiError::unauthorized(other.to_string()),
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound(id) => ApiError::not_found(format!("session {id} not found")),
            SessionError::Expired(_) | SessionError::Terminated(_) => {
                ApiError::new(StatusCode::GONE, "session-expired", "session is over")
            }
            SessionError::Store(err) => err.into(),
        }
    }
}

impl From<AdminError> for ApiError {
    fn from(err: AdminError) -> Self {
        match err {
            AdminError::AlreadyExists(name) => ApiError::new(
                StatusCode::CONFLICT,
                "invalid-request",
                format!("queue {name} already exists"),
            ),
            AdminError::NotFound(name) => {
                ApiError::not_found(format!("queue {name} does not exist"))
            }
            AdminError::Invalid(message) => ApiError::invalid_request(message),
            AdminError::Store(err) => err.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_errors_map_to_spec_codes() {
        let err: ApiError = EnqueueError::QueueFull {
            queue: "q".into(),
            max_size: 10,
        }
        .into();
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.code, "queue-full");

        let err: ApiError = EnqueueError::QueueUnavailable {
            queue: "q".into(),
            state: anteroom_core::QueueState::Paused,
        }
        .into();
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.code, "maintenance");
    }

    #[test]
    fn expired_and_missing_positions_differ() {
        let expired: ApiError = PositionError::Expired("p".into()).into();
        assert_eq!(expired.status, StatusCode::GONE);
        assert_eq!(expired.code, "position-expired");

        let missing: ApiError = PositionError::NotFound("p".into()).into();
        assert_eq!(missing.status, StatusCode::UNAUTHORIZED);
        assert_eq!(missing.code, "unauthorized");
    }

    #[test]
    fn error_body_shape_is_stable() {
        let response = ApiError::invalid_request("bad body").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(response.headers().contains_key("x-request-id"));
    }
}
