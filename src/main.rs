//! pixelgate
//!
//! Governance gateway for the image-conversion API.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client Request
//!     ──────────────▶ request id / trace / timeout layers
//!                         │
//!                         ▼
//!                  governance_middleware
//!                  ┌──────────────────────────────────────────┐
//!                  │ RateLimiter ─▶ QuotaEnforcer ─▶ SignedUrl │──▶ 429 / 401 / 403
//!                  └──────────────────────────────────────────┘
//!                         │ admitted
//!                         ▼
//!                      handler ──▶ ServiceEvent ──▶ ExtensionRegistry hooks
//!                         │
//!     Client Response ◀───┘  (quota handed back unless 2xx)
//!
//!     Cross-cutting: ErrorHandler + alerting, RetryService, tracing, metrics
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use rand::Rng;
use tokio::net::TcpListener;

use pixelgate::clock::system_clock;
use pixelgate::config::{load_config, validate_config, ConfigError, GovernanceConfig};
use pixelgate::lifecycle::{build_services, wait_for_signal, Shutdown};
use pixelgate::observability::{init_logging, init_metrics};
use pixelgate::quota::InMemoryQuotaStore;
use pixelgate::HttpServer;

#[derive(Parser)]
#[command(name = "pixelgate", version, about = "Request governance gateway", long_about = None)]
struct Args {
    /// Path to the TOML configuration file. Built-in defaults when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override `server.bind_address`.
    #[arg(short, long)]
    bind: Option<String>,
}

fn random_signing_key() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => GovernanceConfig::default(),
    };

    init_logging(&config.observability)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "pixelgate starting");

    if args.config.is_none() && config.signed_urls.signing_key.is_empty() {
        config.signed_urls.signing_key = random_signing_key();
        tracing::warn!("No signing key configured, using an ephemeral key; issued URLs will not survive a restart");
    }
    if let Some(bind) = args.bind {
        config.server.bind_address = bind;
    }
    validate_config(&config).map_err(ConfigError::Validation)?;

    tracing::info!(
        config = ?args.config,
        bind_address = %config.server.bind_address,
        request_timeout_secs = config.server.request_timeout_secs,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        let addr: SocketAddr = config.observability.metrics_address.parse()?;
        init_metrics(addr)?;
        tracing::info!(address = %addr, "Metrics exporter listening");
    }

    let services = build_services(config, system_clock(), Arc::new(InMemoryQuotaStore::new()))?;

    let shutdown = Shutdown::new();
    let tasks = services.spawn_background_tasks(&shutdown);
    tokio::spawn(wait_for_signal(shutdown.clone()));

    let listener = TcpListener::bind(&services.config.server.bind_address).await?;
    HttpServer::new(services).run(listener, shutdown.clone()).await?;

    shutdown.trigger();
    for task in tasks {
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "Background task ended abnormally");
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
