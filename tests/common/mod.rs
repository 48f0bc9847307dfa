//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, Method, Request, StatusCode};
use axum::Router;
use chrono::{TimeZone, Utc};
use serde_json::Value;
use tower::ServiceExt;

use pixelgate::clock::{ManualClock, SharedClock};
use pixelgate::config::{GovernanceConfig, LimitRule, ScopedLimits};
use pixelgate::quota::InMemoryQuotaStore;
use pixelgate::{build_services, HttpServer, Services};

pub const SIGNING_KEY: &str = "integration-test-signing-key-0123456789";
pub const CLIENT_IP: [u8; 4] = [203, 0, 113, 9];

/// Defaults with a signing key, one global per-IP limit and no alert sinks.
pub fn test_config(per_ip: u64) -> GovernanceConfig {
    let mut config = GovernanceConfig::default();
    config.signed_urls.signing_key = SIGNING_KEY.to_string();
    config.alerting.enabled = false;
    config.rate_limit.global = ScopedLimits {
        per_ip: Some(LimitRule::new(per_ip, 60)),
        per_user: None,
    };
    config.rate_limit.endpoints = HashMap::new();
    config.rate_limit.plans = HashMap::new();
    config.retries.default.base_delay_ms = 1;
    config.retries.default.max_delay_ms = 2;
    config
}

pub struct TestApp {
    pub services: Services,
    pub router: Router,
    pub clock: ManualClock,
    pub store: Arc<InMemoryQuotaStore>,
}

pub fn app(config: GovernanceConfig) -> TestApp {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap());
    let shared: SharedClock = Arc::new(clock.clone());
    let store = Arc::new(InMemoryQuotaStore::new());
    let services = build_services(config, shared, store.clone()).expect("services should build");
    let router = HttpServer::build_router(services.clone());
    TestApp {
        services,
        router,
        clock,
        store,
    }
}

/// Request as if it arrived over TCP from [`CLIENT_IP`].
pub fn request(method: Method, uri: &str) -> axum::http::request::Builder {
    Request::builder()
        .method(method)
        .uri(uri)
        .extension(ConnectInfo(SocketAddr::from((CLIENT_IP, 40_000))))
}

pub fn json_request(method: Method, uri: &str, user: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = request(method, uri).header("content-type", "application/json");
    if let Some(user) = user {
        builder = builder.header("x-user-id", user).header("x-user-plan", "free");
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

pub async fn send(router: &Router, request: Request<Body>) -> TestResponse {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    TestResponse {
        status,
        headers,
        body,
    }
}

/// Poll `condition` until it holds or a second has passed.
pub async fn eventually<F: FnMut() -> bool>(mut condition: F) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
