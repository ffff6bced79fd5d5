mod error;
mod routes;

use std::sync::Arc;

use gatesync_core::sync::{HttpTransport, SyncEngine};
use gatesync_core::{GateNode, NodeConfig};
use routes::{app_router, AppState};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only load .env in development; deployments inject the environment.
    #[cfg(debug_assertions)]
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("gatesync_node=info".parse()?)
                .add_directive("gatesync_core=info".parse()?),
        )
        .init();

    let config = NodeConfig::from_env()?;
    tracing::info!("Starting gatesync-node with config: {:?}", config);

    let bind_addr = config.bind_addr.clone();
    let transport = HttpTransport::new(config.peer_timeout)?;
    let node = GateNode::open(config)?;
    let engine = Arc::new(SyncEngine::new(node, transport));
    engine.bootstrap().await?;

    let (stop_tx, mut stop_rx) = watch::channel(false);
    let scheduler = tokio::spawn(Arc::clone(&engine).run(async move {
        let _ = stop_rx.changed().await;
    }));

    let router = app_router(AppState::new(engine));
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("gatesync-node listening on {}", bind_addr);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = stop_tx.send(true);
    scheduler.await?;
    tracing::info!("gatesync-node stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {error}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
