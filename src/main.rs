//! hydra entry point

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hydra::config::Config;
use hydra::engine::{spawn_event_consumer, AcquisitionEngine, EngineConfig};
use hydra::jobs;
use hydra::jobs::search_poller::SearchPoller;
use hydra::services::metadata::MetadataClient;
use hydra::services::metadata_cache::MetadataCache;
use hydra::session::registry::SessionRegistry;
use hydra::soulseek::slskd::{spawn_event_pump, SlskdClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hydra=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting hydra");
    tracing::info!(bridge = %config.bridge_url, daemon = %config.slskd_url, "Configuration loaded");

    let slskd = Arc::new(SlskdClient::new(
        config.slskd_url.clone(),
        config.slskd_api_key.clone(),
    ));
    let metadata = Arc::new(MetadataClient::new(config.bridge_url.clone()));
    let cache = Arc::new(MetadataCache::new(
        config.metadata_cache_ttl,
        config.metadata_cache_max_entries,
    ));
    let registry = Arc::new(SessionRegistry::new(config.session_ttl));

    let engine = Arc::new(AcquisitionEngine::new(
        slskd.clone(),
        metadata.clone(),
        cache.clone(),
        registry,
        EngineConfig {
            downloads_path: config.downloads_path.clone(),
            race_mode: config.race_mode,
        },
    ));
    if config.race_mode {
        tracing::info!("Race mode enabled: all viable candidates launch at once");
    }

    // Daemon events flow through a channel into the engine.
    let (tx, rx) = mpsc::channel(256);
    let pump = spawn_event_pump(slskd, tx, config.event_poll_interval);
    let consumer = spawn_event_consumer(engine.clone(), rx);

    let scheduler = jobs::start_scheduler(engine.clone(), cache).await?;

    let poller = Arc::new(SearchPoller::new(engine, metadata));
    let poller_handle = poller.spawn(config.poll_interval);

    tracing::info!("hydra ready, waiting for searches");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    poller_handle.abort();
    pump.abort();
    consumer.abort();
    drop(scheduler);

    Ok(())
}
