use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mcp_hub::config::{load_catalog, Config};
use mcp_hub::handlers::router;
use mcp_hub::mcp::McpManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mcp_hub=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let config = Config::from_env()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {:#}", e))?;

    info!("Starting MCP hub");
    let manager = Arc::new(McpManager::new(config.manager_settings()));

    if config.servers_file.exists() {
        let definitions = load_catalog(&config.servers_file)?.definitions();
        info!(
            "Loaded {} MCP servers from {}",
            definitions.len(),
            config.servers_file.display()
        );
        let results = manager.connect_all(&definitions).await;
        let connected = results.iter().filter(|(_, r)| r.is_ok()).count();
        info!("Connected {}/{} MCP servers", connected, results.len());
    } else {
        warn!(
            "Server catalogue {} not found; starting with no servers",
            config.servers_file.display()
        );
    }

    // Cross-origin requests are allowed from anywhere.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = router(Arc::clone(&manager))
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.server_host, config.server_port);
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    manager.disconnect_all().await;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
