use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use ppof_store::{OpportunityStore, PgStore};
use ppof_sync::{
    build_scheduler, open_store, parse_list, recent_runs_report, scheduled_plan,
    write_run_report, DiscoveryPipeline, RunPlan, RunSummary, SyncConfig,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "ppof-cli")]
#[command(about = "Public procurement opportunity finder")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// One discovery run over a date range.
    Run(RunArgs),
    /// Apply database migrations.
    Migrate,
    /// Run on the configured cron schedule until interrupted.
    Schedule {
        #[arg(long)]
        dry_run: bool,
    },
    /// Summarize the most recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[derive(Debug, Default, Args)]
struct RunArgs {
    /// First publication date (YYYY-MM-DD or YYYYMMDD). Defaults to the look-back window.
    #[arg(long, value_parser = parse_date)]
    start_date: Option<NaiveDate>,
    /// Last publication date, inclusive. Defaults to today.
    #[arg(long, value_parser = parse_date)]
    end_date: Option<NaiveDate>,
    /// Comma-separated state codes, e.g. SP,RJ. Defaults to all.
    #[arg(long)]
    states: Option<String>,
    /// Comma-separated contracting modality codes.
    #[arg(long)]
    modalities: Option<String>,
    #[arg(long)]
    chunk_days: Option<u32>,
    /// Stop after the pre-filter and dedup gate; no item fetches, nothing persisted.
    #[arg(long)]
    discovery_only: bool,
    /// Reprocess opportunities already marked completed.
    #[arg(long)]
    force: bool,
    /// Use the in-memory store instead of Postgres.
    #[arg(long)]
    dry_run: bool,
    /// Vocabulary YAML, overriding PPOF_VOCABULARY.
    #[arg(long)]
    vocabulary: Option<PathBuf>,
}

fn parse_date(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y%m%d"))
        .map_err(|_| format!("expected YYYY-MM-DD or YYYYMMDD, got {raw:?}"))
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

fn build_plan(args: &RunArgs, config: &SyncConfig) -> Result<RunPlan> {
    let today = Utc::now().date_naive();
    let mut plan = scheduled_plan(config, args.end_date.unwrap_or(today));
    if let Some(start) = args.start_date {
        plan.date_from = start;
    }
    if let Some(states) = &args.states {
        plan.states = parse_list::<String>(states)
            .context("parsing --states")?
            .into_iter()
            .map(|s| s.to_ascii_uppercase())
            .collect();
    }
    if let Some(modalities) = &args.modalities {
        plan.modalities = parse_list(modalities).context("parsing --modalities")?;
    }
    if let Some(days) = args.chunk_days {
        plan.chunk_days = days;
    }
    plan.discovery_only = args.discovery_only;
    plan.force = args.force;
    Ok(plan)
}

/// Flips to `true` on the first Ctrl-C. One watcher per process; runs hold clones.
fn interrupt_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight work");
            let _ = tx.send(true);
        }
    });
    rx
}

/// Cancellation for one run: the shared interrupt plus this run's optional timeout.
/// Dropping it stops the timeout timer.
struct RunCancellation {
    receiver: watch::Receiver<bool>,
    deadline: Option<JoinHandle<()>>,
}

impl RunCancellation {
    fn new(interrupt: &watch::Receiver<bool>, timeout: Option<Duration>) -> Self {
        let Some(limit) = timeout else {
            return Self {
                receiver: interrupt.clone(),
                deadline: None,
            };
        };
        let (tx, receiver) = watch::channel(*interrupt.borrow());
        let mut interrupt = interrupt.clone();
        let deadline = tokio::spawn(async move {
            let interrupted = async {
                if interrupt.wait_for(|cancelled| *cancelled).await.is_err() {
                    std::future::pending::<()>().await;
                }
            };
            tokio::select! {
                _ = interrupted => {}
                _ = tokio::time::sleep(limit) => warn!("run timeout reached; finishing in-flight work"),
            }
            let _ = tx.send(true);
        });
        Self {
            receiver,
            deadline: Some(deadline),
        }
    }

    fn receiver(&self) -> watch::Receiver<bool> {
        self.receiver.clone()
    }
}

impl Drop for RunCancellation {
    fn drop(&mut self) {
        if let Some(deadline) = self.deadline.take() {
            deadline.abort();
        }
    }
}

fn print_summary(summary: &RunSummary, reports_dir: &std::path::Path) {
    println!(
        "run complete: run_id={} fetched={} candidates={} skipped_dedup={} relevant={} persisted={} skipped_error={} cancelled={} reports={}",
        summary.run_id,
        summary.fetched,
        summary.candidates,
        summary.skipped_dedup,
        summary.relevant,
        summary.persisted,
        summary.skipped_error,
        summary.cancelled,
        reports_dir.display()
    );
}

async fn run_once(mut config: SyncConfig, args: RunArgs) -> Result<()> {
    if let Some(path) = &args.vocabulary {
        config.vocabulary_path = path.clone();
    }
    let plan = build_plan(&args, &config)?;
    let store = open_store(&config, args.dry_run).await?;
    let pipeline = DiscoveryPipeline::from_config(&config, store)?;
    info!(from = %plan.date_from, to = %plan.date_to, force = plan.force, "starting run");

    let cancellation = RunCancellation::new(&interrupt_signal(), config.run_timeout);
    let summary = pipeline.run(&plan, cancellation.receiver()).await?;
    let reports_dir = write_run_report(&config.reports_dir, &summary).await?;
    print_summary(&summary, &reports_dir);
    Ok(())
}

/// One scheduled tick. Each run gets a fresh pipeline, so its rate limiter starts empty.
async fn scheduled_run(
    config: &SyncConfig,
    store: Arc<dyn OpportunityStore>,
    interrupt: &watch::Receiver<bool>,
) -> Result<()> {
    if *interrupt.borrow() {
        info!("interrupt pending; skipping scheduled run");
        return Ok(());
    }
    let pipeline = DiscoveryPipeline::from_config(config, store)?;
    let plan = scheduled_plan(config, Utc::now().date_naive());
    let cancellation = RunCancellation::new(interrupt, config.run_timeout);
    let summary = pipeline.run(&plan, cancellation.receiver()).await?;
    let reports_dir = write_run_report(&config.reports_dir, &summary).await?;
    print_summary(&summary, &reports_dir);
    Ok(())
}

async fn run_scheduled(config: SyncConfig, dry_run: bool) -> Result<()> {
    let store = open_store(&config, dry_run).await?;
    let mut interrupt = interrupt_signal();
    let job_config = Arc::new(config.clone());
    let job_interrupt = interrupt.clone();

    let mut sched = build_scheduler(&config.sync_cron, move || {
        let store = Arc::clone(&store);
        let config = Arc::clone(&job_config);
        let interrupt = job_interrupt.clone();
        async move {
            if let Err(err) = scheduled_run(&config, store, &interrupt).await {
                let message = format!("{err:#}");
                error!(error = %message, "scheduled run failed");
            }
        }
    })
    .await?;

    sched.start().await.context("starting scheduler")?;
    info!(cron = %config.sync_cron, lookback_days = config.schedule_lookback_days, "scheduler running");
    interrupt
        .wait_for(|cancelled| *cancelled)
        .await
        .context("waiting for interrupt")?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    let command = cli.command.unwrap_or(if config.scheduler_enabled {
        Commands::Schedule { dry_run: false }
    } else {
        Commands::Run(RunArgs::default())
    });

    match command {
        Commands::Run(args) => run_once(config, args).await?,
        Commands::Migrate => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL is not set")?;
            let store = PgStore::connect(url, 2).await.context("connecting to database")?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Schedule { dry_run } => run_scheduled(config, dry_run).await?,
        Commands::Report { runs } => {
            println!("{}", recent_runs_report(&config.reports_dir, runs)?);
        }
    }

    Ok(())
}
