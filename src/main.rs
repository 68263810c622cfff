#![allow(clippy::uninlined_format_args)]

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use subkeeper_rs::config::AppConfig;
use subkeeper_rs::schedule::{create_service, default_processors, TaskBroadcaster, WebhookNotifier};
use subkeeper_rs::storage::task::sqlite::SqliteTaskStorage;
use subkeeper_rs::storage::task::TaskStorage;
use subkeeper_rs::tools::{ProcessRunner, ToolRunner};
use subkeeper_rs::utils::clock::SystemClock;
use subkeeper_rs::utils::logger;
use subkeeper_rs::AppContext;

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for ctrl-c: {}", e);
            }
            info!("Shutdown signal received");
        }
        _ = shutdown.cancelled() => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    subkeeper_rs::init_env();
    let config = AppConfig::from_env()?;
    let _guard = logger::init(config.log_dir.clone())?;

    info!("Starting subkeeper {} ({})", env!("CARGO_PKG_VERSION"), env!("GIT_HASH"));

    info!("Initializing Storage...");
    let storage: Arc<dyn TaskStorage> = Arc::new(SqliteTaskStorage::new(&config.database_url).await?);

    let runner: Arc<dyn ToolRunner> = Arc::new(ProcessRunner::new(config.tools.timeout));
    let broadcaster = Arc::new(TaskBroadcaster::new(config.broadcast_capacity));
    let processors = default_processors(
        storage.clone(),
        runner,
        &config.tools,
        config.backup_dir.clone(),
    );

    info!("Initializing Scheduler...");
    let service = Arc::new(create_service(
        storage,
        processors,
        broadcaster.clone(),
        Arc::new(SystemClock),
        config.scheduler.clone(),
        config.executor.clone(),
    ));
    service.scheduler().start();

    let shutdown = CancellationToken::new();
    let notifier = match &config.webhook_url {
        Some(url) => Some(WebhookNotifier::new(url.clone())?.spawn(&broadcaster, shutdown.clone())),
        None => None,
    };

    let ctx = Arc::new(AppContext {
        service: service.clone(),
    });
    let served = subkeeper_rs::web::start_server(ctx, config.bind, shutdown_signal(shutdown.clone())).await;

    info!("Shutting down...");
    shutdown.cancel();
    service.scheduler().shutdown().await;
    broadcaster.close();
    if let Some(handle) = notifier {
        if let Err(e) = handle.await {
            error!("Webhook notifier ended abnormally: {}", e);
        }
    }

    match served {
        Ok(()) => {
            info!("Server stopped gracefully");
            Ok(())
        }
        Err(e) => {
            error!("Server error: {}", e);
            Err(e)
        }
    }
}
