use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use openaperture_router::config::Config;
use openaperture_router::observability::Logger;
use openaperture_router::proxy::{engine, AppState, ProxyEngine};
use openaperture_router::routes::{RefreshClock, RouteCache, RouteRefresher, RouteServerClient};

#[derive(Parser, Debug)]
#[command(name = "openaperture-router")]
#[command(about = "HTTP reverse proxy routed from a remote control plane")]
struct Args {
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    #[arg(short, long)]
    validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load(&args.config).await?;

    if args.validate_config {
        info!("Configuration is valid");
        return Ok(());
    }

    info!("Starting OpenAperture Router");

    let cache = Arc::new(RouteCache::new());
    let clock = Arc::new(RefreshClock::new());
    let logger = Arc::new(Logger::new(&config.logging.access_log)?);

    // Route refresher: a single long-lived task; a failed iteration is
    // retried on the next tick and never takes the process down.
    let refresher = RouteRefresher::new(
        cache.clone(),
        RouteServerClient::new(&config.route_server)?,
        clock.clone(),
    );
    let refresh_interval = config.route_server.ttl();
    let refresher_task = tokio::spawn(async move {
        refresher.run(refresh_interval).await;
    });

    let state = AppState {
        engine: Arc::new(ProxyEngine::new(&config, cache, logger)?),
        clock,
    };
    let app = engine::router(state, config.server.max_connections);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(
        address = %addr,
        route_server = %config.route_server.url,
        refresh_interval_ms = config.route_server.ttl_ms,
        "Router listening"
    );

    let server_task = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_task => {
            error!("Server task exited unexpectedly: {:?}", result);
        }
    }

    refresher_task.abort();
    info!("Router shutdown complete");
    Ok(())
}
