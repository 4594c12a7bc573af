//! Per-fingerprint request throttling for the public surface.
//!
//! A fixed one-minute window counter in the store, shared by every gateway
//! instance. Every response carries the `X-RateLimit-*` headers, including
//! the 429s.

use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use anteroom_core::clock;
use anteroom_core::store::keys;

use crate::app::AppState;
use crate::error::ApiError;
use crate::extract::ClientIdentity;

/// Window size for the fixed-window counter.
const WINDOW: Duration = Duration::from_secs(60);

pub async fn enforce(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let identity = ClientIdentity::from_headers(request.headers(), &state.fingerprinter);
    let key = keys::rate_limit(&identity.fingerprint);
    let limit = state.rate_limit_per_minute;

    let count = match state.store.increment(&key, 1).await {
        Ok(count) => {
            if count == 1 {
                // First hit opens the window.
                let _ = state.store.expire(&key, WINDOW).await;
            }
            count
        }
        Err(err) => {
            // A broken limiter must not take the public surface down.
            tracing::warn!(%err, "rate limiter unavailable, letting request through");
            0
        }
    };

    let now = clock::epoch_s();
    let reset = (now / WINDOW.as_secs() + 1) * WINDOW.as_secs();
    let remaining = (limit - count).max(0);

    let mut response = if count > limit {
        ApiError::rate_limited("too many requests for this client").into_response()
    } else {
        next.run(request).await
    };

    let headers = response.headers_mut();
    headers.insert("x-ratelimit-limit", int_header(limit));
    headers.insert("x-ratelimit-remaining", int_header(remaining));
    headers.insert("x-ratelimit-reset", int_header(reset as i64));
    response
}

fn int_header(value: i64) -> HeaderValue {
    HeaderValue::from_str(&value.to_string())
        .unwrap_or_else(|_| HeaderValue::from_static("0"))
}
