//! Governance middleware.
//!
//! Runs [`RequestGate::admit`] in front of every governed route, renders
//! denials through the [`ErrorHandler`], and hands quota charged for a
//! request back unless the handler answers 2xx. A request dropped before the
//! handler answers releases its charge through the [`ChargeGuard`].
//!
//! [`RequestGate::admit`]: crate::gate::RequestGate::admit
//! [`ErrorHandler`]: crate::errors::ErrorHandler
//! [`ChargeGuard`]: crate::gate::ChargeGuard

use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::errors::ErrorContext;
use crate::extensions::{EventPayload, EventType, ServiceEvent};
use crate::gate::{Admission, Denial, GateRequest};
use crate::http::response::{apply_rate_limit_headers, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING};
use crate::lifecycle::Services;

/// Authenticated user id, set by the upstream auth layer.
pub const X_USER_ID: HeaderName = HeaderName::from_static("x-user-id");
/// Plan of the authenticated user.
pub const X_USER_PLAN: HeaderName = HeaderName::from_static("x-user-plan");
pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Who is calling, as seen by the governance layer.
#[derive(Debug, Clone, Default)]
pub struct Caller {
    pub client_ip: String,
    pub user_id: Option<String>,
    pub plan: Option<String>,
    pub request_id: Option<String>,
    pub method: String,
    pub endpoint: String,
}

impl Caller {
    pub fn from_request(request: &Request<Body>) -> Self {
        let headers = request.headers();
        let client_ip = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string());

        Self {
            client_ip,
            user_id: header_value(headers, &X_USER_ID),
            plan: header_value(headers, &X_USER_PLAN),
            request_id: header_value(headers, &X_REQUEST_ID),
            method: request.method().as_str().to_string(),
            endpoint: request.uri().path().to_string(),
        }
    }

    pub fn error_context(&self) -> ErrorContext {
        ErrorContext {
            user_id: self.user_id.clone(),
            request_id: self.request_id.clone(),
            trace_id: None,
            endpoint: Some(self.endpoint.clone()),
            method: Some(self.method.clone()),
            ip_address: Some(self.client_ip.clone()),
        }
    }
}

/// Trimmed, non-empty header value.
fn header_value(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

pub async fn governance_middleware(
    State(services): State<Services>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let caller = Caller::from_request(&request);
    let query = request.uri().query().map(str::to_string);
    let user_agent = header_value(request.headers(), &header::USER_AGENT);
    let referer = header_value(request.headers(), &header::REFERER);

    let gate_request = GateRequest {
        client_ip: &caller.client_ip,
        user_id: caller.user_id.as_deref(),
        plan: caller.plan.as_deref(),
        method: &caller.method,
        path: &caller.endpoint,
        query: query.as_deref(),
        user_agent: user_agent.as_deref(),
        referer: referer.as_deref(),
    };

    let admitted = match services.gate.admit(&gate_request).await {
        Ok(Admission::Allowed(admitted)) => admitted,
        Ok(Admission::Denied(denial)) => return deny(&services, &caller, denial),
        Err(e) => {
            return services
                .errors
                .handle_classified(&e, caller.error_context())
                .into_response()
        }
    };

    let guard = services.gate.guard(admitted.charge.clone());
    let rate = admitted.rate.clone();
    request.extensions_mut().insert(caller);
    request.extensions_mut().insert(admitted);

    let mut response = next.run(request).await;

    // Only a 2xx means the charged action actually went ahead.
    guard.finish(response.status().is_success()).await;
    apply_rate_limit_headers(response.headers_mut(), &rate);
    response
}

fn deny(services: &Services, caller: &Caller, denial: Denial) -> Response {
    tracing::info!(
        client = %caller.client_ip,
        user_id = ?caller.user_id,
        kind = %denial.error_type,
        reason = %denial.reason,
        path = %caller.endpoint,
        "Request denied"
    );

    if let (Some(user_id), Some((quota_type, tier))) = (&caller.user_id, denial.quota) {
        let plan = caller
            .plan
            .clone()
            .unwrap_or_else(|| services.config.quota.default_plan.clone());
        let mut event = ServiceEvent::new(
            EventType::QuotaExceeded,
            "governance_middleware",
            EventPayload::Quota {
                user_id: user_id.clone(),
                plan,
                quota_type,
                tier: tier.as_str().to_string(),
            },
        );
        if let Some(request_id) = &caller.request_id {
            event = event.with_request_id(request_id.clone());
        }
        services.emit(event);
    }

    let mut error = services
        .errors
        .handle(&denial.to_service_error(), caller.error_context());
    error.metadata.insert("reason".to_string(), denial.reason.clone());
    if let Some(scope) = denial.scope {
        error.metadata.insert("scope".to_string(), scope.to_string());
    }
    if let Some(upgrade) = &denial.upgrade_suggestion {
        error
            .metadata
            .insert("upgrade_suggestion".to_string(), upgrade.clone());
    }

    let mut response = error.into_response();
    if let Some(limit) = denial.limit {
        let headers = response.headers_mut();
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(0u64));
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caller_from_request() {
        let mut request = Request::builder()
            .method("POST")
            .uri("/v1/conversions?x=1")
            .header("x-user-id", " u1 ")
            .header("x-user-plan", "")
            .header("x-request-id", "req-1")
            .body(Body::empty())
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([203, 0, 113, 9], 5000))));

        let caller = Caller::from_request(&request);
        assert_eq!(caller.client_ip, "203.0.113.9");
        assert_eq!(caller.user_id.as_deref(), Some("u1"));
        assert_eq!(caller.plan, None);
        assert_eq!(caller.endpoint, "/v1/conversions");

        let context = caller.error_context();
        assert_eq!(context.request_id.as_deref(), Some("req-1"));
        assert_eq!(context.method.as_deref(), Some("POST"));
    }

    #[test]
    fn test_caller_without_connect_info() {
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        assert_eq!(Caller::from_request(&request).client_ip, "unknown");
    }
}
