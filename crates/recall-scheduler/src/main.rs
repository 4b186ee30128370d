use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::info;

use recall_core::{
    clock::SystemClock,
    queue::{JobQueue, ReadyQueue},
};
use recall_duckdb::DuckDbBackend;
use recall_queue::{
    ChannelJobQueue, InMemoryReadyQueue, RedisConnector, RedisJobQueue, RedisReadyQueue,
};
use recall_scheduler::{
    config::Config,
    scheduler::{retry_with_backoff, run_poll_loop},
    Scheduler,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Structured JSON logging; RUST_LOG overrides the default level.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("recall=info".parse()?),
        )
        .json()
        .init();

    let cfg = Config::from_env().map_err(|e| anyhow::anyhow!(e))?;

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
        }
        let _ = shutdown_tx.send(true);
    });

    std::fs::create_dir_all(&cfg.data_dir)?;
    let db_path = format!("{}/recall.db", cfg.data_dir);
    let (path, memory_limit) = (db_path.as_str(), cfg.duckdb_memory_limit.as_str());
    let opened = retry_with_backoff(
        "open schedule store",
        Duration::from_secs(cfg.retry_base_seconds),
        Duration::from_secs(cfg.retry_max_seconds),
        &mut shutdown_rx,
        move || async move { DuckDbBackend::open(path, memory_limit) },
    )
    .await;
    let Some(db) = opened else {
        return Ok(());
    };

    let (index, jobs): (Arc<dyn ReadyQueue>, Arc<dyn JobQueue>) = match &cfg.redis_url {
        Some(url) => {
            let connector = RedisConnector::open(url)?;
            info!(
                schedule_key = %cfg.schedule_key,
                job_queue_key = %cfg.job_queue_key,
                "using Redis index and job queue"
            );
            (
                Arc::new(RedisReadyQueue::new(
                    Arc::clone(&connector),
                    cfg.schedule_key.clone(),
                    cfg.pop_batch_size,
                )),
                Arc::new(RedisJobQueue::new(connector, cfg.job_queue_key.clone())),
            )
        }
        None => {
            let (jobs, mut rx) = ChannelJobQueue::new(cfg.job_channel_capacity);
            tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    info!(
                        job_id = %job.job_id,
                        entry_id = %job.entry_id,
                        due_at = %job.due_at,
                        expires_at = %job.expires_at,
                        "email job ready"
                    );
                }
            });
            info!("RECALL_REDIS_URL not set, using in-process index and job channel");
            (Arc::new(InMemoryReadyQueue::new()), Arc::new(jobs))
        }
    };

    let scheduler = Arc::new(Scheduler::new(
        Arc::new(db),
        index,
        jobs,
        Arc::new(SystemClock),
        cfg,
    ));

    let handle = tokio::spawn(run_poll_loop(scheduler, shutdown_rx));
    handle.await?;
    Ok(())
}
