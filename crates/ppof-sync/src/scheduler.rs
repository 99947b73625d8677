use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::pipeline::RunPlan;

/// Plan for a scheduled run: the trailing look-back window ending `today`.
pub fn scheduled_plan(config: &SyncConfig, today: NaiveDate) -> RunPlan {
    RunPlan::lookback(today, config.schedule_lookback_days)
}

/// Scheduler with one cron job. A tick that fires while the previous run is still going is
/// skipped. The caller starts it.
pub async fn build_scheduler<F, Fut>(cron: &str, run: F) -> Result<JobScheduler>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let run = Arc::new(run);
    let running = Arc::new(Mutex::new(()));
    let job = Job::new_async(cron, move |_uuid, _l| {
        let run = Arc::clone(&run);
        let running = Arc::clone(&running);
        Box::pin(async move {
            let Ok(_guard) = running.try_lock() else {
                warn!("previous scheduled run still in progress; skipping tick");
                return;
            };
            info!("scheduled run triggered");
            run().await;
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}
