use std::net::SocketAddr;
use tracing::{error, info};

use vdb_router::api::routes::create_router_with_state;
use vdb_router::config::Config;
use vdb_router::{build_state, spawn_maintenance};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&config.logging.level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_ansi(config.logging.style != "never")
        .init();

    info!("Starting server on {}", config.server_address());

    let addr: SocketAddr = config.server_address().parse()?;
    let state = build_state(config).await.map_err(|e| {
        error!("Failed to initialize services: {}", e);
        e
    })?;
    spawn_maintenance(&state);

    let app = create_router_with_state(state);

    info!("Server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
