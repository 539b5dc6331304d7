//! Task logger service
//!
//! Runs the event correlator against the shared stream and serves assembled
//! task logs on `LOGGER_PORT`.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use relay_core::stream::{EventStream, FileEventStream};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use task_logger::routes;
use task_logger::state::AppState;
use task_logger::{Correlator, LoggerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "task_logger=debug,relay_core=info,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = LoggerConfig::from_env();
    tracing::info!("Writing task logs to {:?}", config.logs_dir);
    std::fs::create_dir_all(&config.logs_dir)
        .with_context(|| format!("Failed to create {:?}", config.logs_dir))?;

    let stream: Arc<dyn EventStream> = Arc::new(
        FileEventStream::open(config.stream_dir()).context("Failed to open event stream")?,
    );

    let mut correlator = Correlator::new(config.clone(), Arc::clone(&stream));
    let state = AppState::new(config.clone(), stream, correlator.metrics());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumer = tokio::spawn(async move { correlator.run(shutdown_rx).await });

    let app = Router::new()
        .merge(routes::health::router())
        .merge(routes::logs::router())
        .merge(routes::metrics::router())
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("Ops API listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Ops API server failed")?;

    tracing::info!("Shutting down correlator");
    let _ = shutdown_tx.send(true);
    match consumer.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("Correlator stopped with error: {}", e),
        Err(e) => tracing::warn!("Correlator task ended abnormally: {}", e),
    }
    tracing::info!("Task logger exited");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
