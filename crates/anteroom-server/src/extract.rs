//! Request extractors: client identity and bearer credentials.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::{AUTHORIZATION, USER_AGENT};
use axum::http::request::Parts;
use axum::http::HeaderMap;

use anteroom_core::fingerprint::{hash_agent, Fingerprinter};

use crate::app::AppState;
use crate::error::ApiError;

/// Who is knocking, as far as the gateway can observe. The fingerprint is
/// the salted hash of the client address and user agent; it deduplicates
/// enqueues and binds credentials.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub fingerprint: String,
    pub ua_hash: Option<String>,
}

impl ClientIdentity {
    pub fn from_headers(headers: &HeaderMap, fingerprinter: &Fingerprinter) -> Self {
        let address = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or("unknown");
        let agent = headers
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        Self {
            fingerprint: fingerprinter.fingerprint(&[address, agent]),
            ua_hash: (!agent.is_empty()).then(|| hash_agent(agent)),
        }
    }
}

#[async_trait]
impl FromRequestParts<AppState> for ClientIdentity {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        Ok(Self::from_headers(&parts.headers, &state.fingerprinter))
    }
}

/// `Authorization: Bearer <credential>`.
pub struct Bearer(pub String);

#[async_trait]
impl FromRequestParts<AppState> for Bearer {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ApiError::unauthorized("missing bearer credential"))?;
        Ok(Bearer(token.to_string()))
    }
}
