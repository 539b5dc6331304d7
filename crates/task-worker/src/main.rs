//! Task worker service
//!
//! Pulls task descriptors from the spool queue, runs the configured agent CLI
//! for each and serves a small ops API on `WORKER_PORT`.

use std::net::SocketAddr;
use std::sync::Arc;

use agent_runner::{CliRunner, RunnerConfig};
use anyhow::Context;
use axum::Router;
use relay_core::output_store::OutputStore;
use relay_core::queue::DirWorkQueue;
use relay_core::stream::{EventPublisher, FileEventStream};
use relay_core::task::FileTaskStore;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use task_worker::conversation::{ContextProvider, DashboardClient};
use task_worker::notify::SlackNotifier;
use task_worker::posting::{CommentLedger, PlatformPoster, PlatformUrls};
use task_worker::routes;
use task_worker::state::AppState;
use task_worker::{TaskWorker, WorkerConfig, WorkerDeps};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "task_worker=debug,agent_runner=info,relay_core=info,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = WorkerConfig::from_env();
    tracing::info!("Using data directory: {:?}", config.data_dir);

    let queue = DirWorkQueue::new(config.spool_dir()).context("Failed to open work queue")?;
    let stream =
        FileEventStream::open(config.stream_dir()).context("Failed to open event stream")?;
    let tasks = FileTaskStore::new(config.tasks_path())
        .await
        .context("Failed to open task store")?;

    let context: Option<Arc<dyn ContextProvider>> = config
        .dashboard_api_url
        .as_ref()
        .map(|url| Arc::new(DashboardClient::new(url.as_str())) as Arc<dyn ContextProvider>);
    if context.is_none() {
        tracing::info!("DASHBOARD_API_URL not set, webhook tasks run without conversation context");
    }

    let deps = WorkerDeps {
        queue: Arc::new(queue),
        publisher: EventPublisher::new(Arc::new(stream)),
        tasks: Arc::new(tasks),
        outputs: OutputStore::new(&config.data_dir),
        runner: Arc::new(CliRunner::new(RunnerConfig::new(config.provider))),
        context,
        poster: Arc::new(PlatformPoster::new(PlatformUrls {
            github: config.github_api_url.clone(),
            jira: config.jira_api_url.clone(),
            slack: config.slack_api_url.clone(),
        })),
        notifier: Arc::new(SlackNotifier::new(
            config.slack_api_url.clone(),
            config.slack_notification_channel.clone(),
        )),
        ledger: Arc::new(CommentLedger::default()),
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let worker = TaskWorker::new(config, deps);

    let intake = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run().await })
    };

    let app = Router::new()
        .merge(routes::health::router())
        .merge(routes::comments::router())
        .merge(routes::tasks::router())
        .with_state(AppState::new(worker.clone()))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("Ops API listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Ops API server failed")?;

    tracing::info!("Shutting down, waiting for in-flight tasks");
    worker.stop();
    if let Err(e) = intake.await {
        tracing::warn!("Intake loop ended abnormally: {}", e);
    }
    worker.wait_idle().await;
    tracing::info!("Task worker exited");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
