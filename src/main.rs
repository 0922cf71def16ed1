//! Build Sentinel headless watcher
//!
//! Polls a version descriptor, records the last seen build in SQLite and logs every
//! update notification until interrupted.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use build_sentinel::coordinator::DebugFetchObserver;
use build_sentinel::fetch::{DescriptorSource, HttpDescriptorSource, InterceptedSource};
use build_sentinel::store::SqliteStateStore;
use build_sentinel::{registry, Config, EventBus, UpdateEvent};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize logging
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Build Sentinel");
    tracing::info!("Version URL: {}", config.version_url);
    tracing::info!("Database path: {:?}", config.db_path);

    let store = Arc::new(SqliteStateStore::open(&config.db_path).await?);

    let mut source: Arc<dyn DescriptorSource> = Arc::new(HttpDescriptorSource::new()?);
    if config.debug {
        tracing::warn!("Debug mode enabled, logging every descriptor request");
        source = Arc::new(InterceptedSource::new(
            source,
            Arc::new(DebugFetchObserver::new()),
        ));
    }

    let checker =
        registry::create_checker(config.check_config(), source, store, EventBus::default()).await?;
    let mut events = checker.subscribe();
    checker.start();

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                log_event(&event);
            }
            _ = &mut shutdown => {
                tracing::info!("Interrupted, shutting down");
                break;
            }
        }
    }

    registry::destroy_checker();
    Ok(())
}

fn log_event(event: &UpdateEvent) {
    match event {
        UpdateEvent::CheckCompleted {
            current,
            update_available,
            ..
        } => {
            let build = current.as_ref().map_or("none", |d| d.build_id.as_str());
            tracing::debug!(update_available, "Check completed, running build {}", build);
        }
        UpdateEvent::CheckFailed { error, attempt } => {
            tracing::warn!(attempt, code = error.error_code(), "Check failed: {}", error.message());
        }
        UpdateEvent::UpdateAvailable { current, latest } => {
            let from = current.as_ref().map_or("unknown", |d| d.version.as_str());
            tracing::info!(
                "New build available: {} -> {} ({}, {})",
                from,
                latest.version,
                latest.build_id,
                latest.environment.as_str()
            );
        }
        other => tracing::debug!("{}", other.name()),
    }
}
