//! Response shaping for governance outcomes.

use axum::http::{header, HeaderMap, HeaderName, HeaderValue};
use axum::response::{IntoResponse, Json, Response};

use crate::errors::ApiError;
use crate::security::rate_limit::RateLimitDecision;

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let retry_after = self.retry_after;
        let mut response = (status, Json(self)).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

/// Attach `X-RateLimit-*` headers describing the tightest applied scope.
pub fn apply_rate_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    if let Some(limit) = decision.limit {
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(limit));
    }
    let remaining = if decision.allowed { decision.remaining } else { Some(0) };
    if let Some(remaining) = remaining {
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(remaining));
    }
    if let Some(reset) = decision.retry_after {
        headers.insert(X_RATELIMIT_RESET, HeaderValue::from(reset.as_secs().max(1)));
    }
}
