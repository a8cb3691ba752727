//! YIELDRANK: yield-pool ingestion, risk scoring and ranking
//!
//! Entry point. Loads configuration, initialises structured logging,
//! opens the database and runs the task workers plus the ingestion
//! scheduler until Ctrl+C.
//!
//! `yieldrank rank` prints the current top pools as JSON and exits.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use yieldrank::config;
use yieldrank::engine::ingest::IngestOrchestrator;
use yieldrank::engine::recommender::{Recommender, StaticProfiles, TemplateExplainer};
use yieldrank::scoring::ranking;
use yieldrank::sources::defillama::DefiLlamaClient;
use yieldrank::sources::YieldSource;
use yieldrank::storage::sqlite::{self, SqliteRepository};
use yieldrank::storage::Repository;
use yieldrank::tasks::handler::TaskHandler;
use yieldrank::tasks::queue::{QueueSettings, SqliteTaskQueue};
use yieldrank::tasks::scheduler::Scheduler;
use yieldrank::tasks::worker::Worker;
use yieldrank::tasks::TaskQueue;
use yieldrank::types::PoolFilter;

const BANNER: &str = r#"
__   _______ _____ _     ____  ____      _    _   _ _  __
\ \ / /_ _| ____| |   |  _ \|  _ \    / \  | \ | | |/ /
 \ V / | ||  _| | |   | | | | |_) |  / _ \ |  \| | ' /
  | |  | || |___| |___| |_| |  _ <  / ___ \| |\  | . \
  |_| |___|_____|_____|____/|_| \_\/_/   \_\_| \_|_|\_\

  Yield-pool risk scoring & ranking
  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cfg = config::AppConfig::load_default()?;

    init_logging();

    // -- Storage ---------------------------------------------------------

    let db = sqlite::connect(&cfg.storage.database_url)
        .await
        .with_context(|| format!("Failed to open database {}", cfg.storage.database_url))?;
    let repo: Arc<dyn Repository> = Arc::new(SqliteRepository::new(db.clone()));

    if std::env::args().nth(1).as_deref() == Some("rank") {
        return print_ranking(repo.as_ref(), cfg.ingest.top_n).await;
    }

    println!("{BANNER}");
    info!(
        service = %cfg.service.name,
        pull_interval_secs = cfg.ingest.pull_interval_secs,
        pull_limit = cfg.ingest.pull_limit,
        workers = cfg.worker.concurrency,
        "YIELDRANK starting up"
    );

    let queue: Arc<dyn TaskQueue> = Arc::new(SqliteTaskQueue::new(
        db,
        QueueSettings {
            max_attempts: cfg.worker.max_attempts,
            backoff_base: Duration::from_secs(cfg.worker.backoff_base_secs),
            backoff_max: Duration::from_secs(cfg.worker.backoff_max_secs),
        },
    ));

    let requeued = queue
        .requeue_stale(Duration::from_secs(cfg.worker.stale_after_secs))
        .await?;
    if requeued > 0 {
        warn!(count = requeued, "Re-queued tasks left running by a previous process");
    }

    // -- Components ------------------------------------------------------

    let source: Arc<dyn YieldSource> = Arc::new(DefiLlamaClient::from_config(&cfg.source)?);

    let profiles = StaticProfiles::new(cfg.profiles.to_profile()?);
    let recommender = Recommender::new(
        repo.clone(),
        source.clone(),
        Arc::new(profiles),
        Arc::new(TemplateExplainer),
    );
    let orchestrator = IngestOrchestrator::new(repo.clone(), queue.clone());
    let handler = Arc::new(TaskHandler::new(source, repo, orchestrator, recommender));

    // -- Run -------------------------------------------------------------

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poll_interval = Duration::from_millis(cfg.worker.poll_interval_ms);

    let mut handles = Vec::with_capacity(cfg.worker.concurrency + 1);
    for id in 0..cfg.worker.concurrency {
        let worker = Worker::new(id, queue.clone(), handler.clone(), poll_interval);
        handles.push(tokio::spawn(worker.run(shutdown_rx.clone())));
    }

    let scheduler = Scheduler::new(
        queue.clone(),
        Duration::from_secs(cfg.ingest.pull_interval_secs),
        cfg.ingest.pull_limit,
        Duration::from_secs(cfg.worker.stale_after_secs),
    );
    handles.push(tokio::spawn(scheduler.run(shutdown_rx)));

    info!("Running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Shutdown signal received.");

    let _ = shutdown_tx.send(true);
    for result in futures::future::join_all(handles).await {
        if let Err(e) = result {
            warn!(error = %e, "Background task ended abnormally");
        }
    }

    let stats = queue.stats().await?;
    info!(
        pending = stats.pending,
        done = stats.done,
        failed = stats.failed,
        "YIELDRANK shut down cleanly."
    );

    Ok(())
}

/// Print the top-N persisted pools, best first.
async fn print_ranking(repo: &dyn Repository, top_n: usize) -> Result<()> {
    let pools = repo.list_pools(&PoolFilter::default()).await?;
    let top = ranking::rank_persisted(&pools, top_n);
    println!("{}", serde_json::to_string_pretty(&top)?);
    Ok(())
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("yieldrank=info"));

    let json_logging = std::env::var("YIELDRANK_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
