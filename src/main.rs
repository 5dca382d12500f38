//! Server binary: configuration, wiring, and graceful shutdown.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use redline::api::middleware::{create_cors_layer, request_id_middleware};
use redline::api::rate_limit::RateLimiters;
use redline::api::routes::create_router;
use redline::api::AppContext;
use redline::auth::CredentialService;
use redline::config::ConfigLoader;
use redline::engine::RoundEngine;
use redline::fairness::Oracle;
use redline::store::Store;
use redline::ws::registry::SessionRegistry;

#[derive(Debug, Parser)]
#[command(name = "redline-server", about = "Multiplier-crash wagering game server")]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen port.
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "redline=info,tower_http=info".into()),
        )
        .init();

    let mut loader = ConfigLoader::new();
    if let Some(path) = &args.config {
        loader = loader.with_path(path);
    }
    let mut config = loader.load()?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    let config = Arc::new(config);

    let store = Arc::new(Store::open(&config.storage.path)?);
    let registry = Arc::new(SessionRegistry::new());
    let creds = Arc::new(CredentialService::new(&config.token));
    creds.spawn_reaper();

    let oracle = Oracle::new(config.game.client_seed.clone(), config.game.edge_bps)?;
    let (engine, engine_join) =
        RoundEngine::spawn(Arc::clone(&store), oracle, Arc::clone(&registry), &config)?;

    let limits = Arc::new(RateLimiters::new(&config.rate_limits));

    let ctx = AppContext {
        config: Arc::clone(&config),
        store,
        creds,
        registry,
        engine: engine.clone(),
        limits,
    };

    let app = create_router(ctx)
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(create_cors_layer(&config.server.cors_allowed_origins))
        .layer(TimeoutLayer::new(Duration::from_secs(
            config.server.request_timeout_secs,
        )))
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from((
        config.server.host.parse::<std::net::IpAddr>()?,
        config.server.port,
    ));

    info!("redline server starting");
    info!("   listen: http://{}", addr);
    info!("   database: {}", config.storage.path);
    info!("   tick: {}ms, countdown: {}s", config.game.tick_ms, config.game.countdown_secs);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("server running");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // New connections have stopped; drain the live round before exiting.
    info!("draining current round");
    engine.shutdown().await;
    if tokio::time::timeout(Duration::from_secs(120), engine_join)
        .await
        .is_err()
    {
        tracing::warn!("engine did not drain in time, exiting anyway");
    }

    info!("server stopped");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received terminate signal"),
    }
}
