//! Background job scheduling and workers

pub mod search_poller;

use std::sync::Arc;
use std::time::Instant;

use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

use crate::engine::AcquisitionEngine;
use crate::services::metadata_cache::MetadataCache;

/// Initialize and start the job scheduler
pub async fn start_scheduler(
    engine: Arc<AcquisitionEngine>,
    cache: Arc<MetadataCache>,
) -> anyhow::Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    // Engine tick - every 2 seconds; drives collection windows, cascade
    // escalation, stall detection and ceilings
    let tick_engine = engine.clone();
    let tick_job = Job::new_async("*/2 * * * * *", move |_uuid, _l| {
        let engine = tick_engine.clone();
        Box::pin(async move {
            engine.tick(Instant::now()).await;
        })
    })?;
    scheduler.add(tick_job).await?;

    // Progress sampler - every 5 seconds
    let progress_engine = engine.clone();
    let progress_job = Job::new_async("*/5 * * * * *", move |_uuid, _l| {
        let engine = progress_engine.clone();
        Box::pin(async move {
            engine.sample_progress().await;
        })
    })?;
    scheduler.add(progress_job).await?;

    // Stale-state sweep - every minute
    let sweep_engine = engine.clone();
    let sweep_job = Job::new_async("0 * * * * *", move |_uuid, _l| {
        let engine = sweep_engine.clone();
        let cache = cache.clone();
        Box::pin(async move {
            let evicted = engine.registry().sweep(Instant::now());
            let expired = cache.cleanup_expired();
            if evicted > 0 || expired > 0 {
                info!(job = "sweep", evicted, expired, "Cleaned stale state");
            }
        })
    })?;
    scheduler.add(sweep_job).await?;

    scheduler.start().await?;

    info!("Job scheduler started");
    Ok(scheduler)
}
