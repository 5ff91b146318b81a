use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::config::TurnstileConfig;
use turnstile::http::{rate_limit_middleware, RateLimitState};
use turnstile::limit::{CounterStore, MemoryStore, RateLimiter, RedisStore};

#[derive(Parser, Debug)]
#[command(name = "turnstile", version, about = "Distributed admission control service")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Override the configured listen address
    #[arg(short, long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("Starting Turnstile Admission Control Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => TurnstileConfig::from_file(path)?,
        None => TurnstileConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    info!(listen_addr = %config.server.listen_addr, "Configuration loaded");

    let store: Arc<dyn CounterStore> = match &config.store.redis_url {
        Some(url) => Arc::new(RedisStore::connect(url, config.store.op_timeout()).await?),
        None => {
            warn!("No redis_url configured; counters are process-local");
            Arc::new(MemoryStore::new())
        }
    };

    let limiter = Arc::new(RateLimiter::new(store, config.limits.build_provider()));
    let state = RateLimitState::new(limiter, config.limits.tier_map())
        .fail_open(config.store.fail_open);

    let app = Router::new()
        .route("/", get(index))
        .route("/healthz", get(healthz))
        .layer(axum::middleware::from_fn_with_state(
            state,
            rate_limit_middleware,
        ));

    let listener = TcpListener::bind(config.server.listen_addr).await?;
    info!(addr = %config.server.listen_addr, "Listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Turnstile Admission Control Service stopped");
    Ok(())
}

async fn index() -> &'static str {
    "turnstile"
}

async fn healthz() -> &'static str {
    "ok"
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
