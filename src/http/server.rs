//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create the Axum router with all handlers
//! - Put governance in front of every `/v1` route
//! - Wire up middleware (request ID, tracing, timeout)
//! - Serve with graceful shutdown

use std::net::SocketAddr;
use std::time::Duration;

use axum::http::StatusCode;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::http::middleware::governance_middleware;
use crate::lifecycle::{Services, Shutdown};

/// Request ID, tracing and timeout layers, outermost last.
fn with_middleware(router: Router, timeout: Duration) -> Router {
    router
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, timeout))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

/// HTTP front end of the gateway.
pub struct HttpServer {
    router: Router,
    services: Services,
}

impl HttpServer {
    pub fn new(services: Services) -> Self {
        let router = Self::build_router(services.clone());
        Self { router, services }
    }

    /// Build the Axum router with all middleware layers.
    ///
    /// `/health` is not governed, so liveness checks are never rate limited.
    pub fn build_router(services: Services) -> Router {
        let timeout = Duration::from_secs(services.config.server.request_timeout_secs);

        let governed = Router::new()
            .route("/v1/signed-urls", post(handlers::create_signed_url))
            .route("/v1/quota", get(handlers::quota_status))
            .route("/v1/recommendations", get(handlers::recommendations))
            .route("/v1/files/{*path}", get(handlers::download_file))
            .route("/v1/conversions", post(handlers::create_conversion))
            .route(
                "/v1/conversion-results/{conversion_id}",
                post(handlers::report_conversion_result),
            )
            .route("/v1/webhooks/{source}", post(handlers::receive_webhook))
            .route_layer(middleware::from_fn_with_state(
                services.clone(),
                governance_middleware,
            ));

        let router = Router::new()
            .route("/health", get(handlers::health))
            .merge(governed)
            .with_state(services);
        with_middleware(router, timeout)
    }

    /// Run the server until `shutdown` triggers, then drain in-flight requests.
    pub async fn run(self, listener: TcpListener, shutdown: Shutdown) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            protected_prefixes = ?self.services.config.routes.protected_prefixes,
            "HTTP server starting"
        );

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.wait().await })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }

    pub fn services(&self) -> &Services {
        &self.services
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_slow_handler_times_out_with_request_id() {
        let slow = Router::new().route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "done"
            }),
        );
        let router = with_middleware(slow, Duration::from_millis(20));

        let response = router
            .oneshot(Request::builder().uri("/slow").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
        assert!(response.headers().contains_key("x-request-id"));
    }
}
