use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use downbeat_queue::{
    bootstrap, FileStore, QueueConfig, QueueManager, RetryPolicy, StateStore,
};
use downbeat_server_client::{DownloadsClient, RetrySettings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "downbeat_queue=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    tracing::info!("Starting Downbeat queue service");

    let config = QueueConfig::from_env().context("Failed to load configuration")?;
    let client = DownloadsClient::new(&config.server_url)
        .with_context(|| format!("Invalid server URL {}", config.server_url))?;

    // Retry backoff is server policy; fall back to defaults only if the
    // settings fetch itself fails
    let settings = match client.settings().await {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!(error = %e, "settings fetch failed, using default retry settings");
            RetrySettings::default()
        }
    };
    let policy = RetryPolicy::new(settings);

    let store = Arc::new(FileStore::new(config.cache_path.clone()));
    let cached = match store.load() {
        Ok(snapshot) => snapshot,
        Err(e) => {
            tracing::warn!(error = %e, "state cache unreadable, starting empty");
            Default::default()
        }
    };

    let (entries, cached) = bootstrap(&client, cached, &policy, config.bootstrap_concurrency)
        .await
        .context("Startup reconciliation failed")?;

    let (mut manager, handle) = QueueManager::new(config, client, policy, store, cached);
    manager.restore(entries);
    let manager_task = tokio::spawn(manager.run());

    // Minimal renderer: log queue events until interrupted
    let mut events = handle.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => tracing::debug!(?event, "queue event"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event feed lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    tracing::info!("Shutting down");
    handle.shutdown();
    manager_task.await.context("Manager task panicked")?;

    Ok(())
}
