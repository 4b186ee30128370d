use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use recall_core::{clock::Clock, queue::JobQueue, queue::ReadyQueue, store::ScheduleStore};

use crate::config::Config;

pub mod dispatch;
pub mod sync;

pub use dispatch::TickReport;
pub use sync::SyncReport;

/// The scheduler's collaborators.
///
/// Every seam is a trait object so the binary can pick DuckDB plus Redis or
/// the in-process backends, and tests can substitute fakes.
pub struct Scheduler {
    pub store: Arc<dyn ScheduleStore>,
    pub index: Arc<dyn ReadyQueue>,
    pub jobs: Arc<dyn JobQueue>,
    pub clock: Arc<dyn Clock>,
    pub config: Arc<Config>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        index: Arc<dyn ReadyQueue>,
        jobs: Arc<dyn JobQueue>,
        clock: Arc<dyn Clock>,
        config: Config,
    ) -> Self {
        Self {
            store,
            index,
            jobs,
            clock,
            config: Arc::new(config),
        }
    }
}

/// Resolves once `true` has been published or the sender is gone.
pub async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

fn with_jitter(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.0..=0.1);
    delay + delay.mul_f64(factor)
}

/// Run `op` until it succeeds, sleeping `base`, `2 * base`, ... (capped at
/// `max`, plus up to 10% jitter) between attempts.
///
/// Returns `None` only when shutdown is requested while waiting.
pub async fn retry_with_backoff<T, F, Fut>(
    operation: &str,
    base: Duration,
    max: Duration,
    shutdown: &mut watch::Receiver<bool>,
    mut op: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut delay = base.min(max);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    info!(operation, attempt, "recovered after retry");
                }
                return Some(value);
            }
            Err(err) => {
                let wait = with_jitter(delay);
                error!(
                    operation,
                    attempt,
                    retry_in_ms = wait.as_millis() as u64,
                    error = %err,
                    "operation failed, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = shutdown_requested(shutdown) => return None,
                }
                delay = (delay * 2).min(max);
            }
        }
    }
}

/// Drive the scheduler until shutdown.
///
/// The first sync blocks (with backoff) until the store and index are both
/// reachable. After that the loop ticks every `tick_seconds`, the first tick
/// firing immediately, and re-syncs once `sync_interval` has elapsed.
pub async fn run_poll_loop(scheduler: Arc<Scheduler>, mut shutdown: watch::Receiver<bool>) {
    let cfg = Arc::clone(&scheduler.config);
    info!(
        tick_seconds = cfg.tick_seconds,
        sync_interval_seconds = cfg.sync_interval_seconds,
        "email scheduler started"
    );

    let first_sync = retry_with_backoff(
        "initial sync",
        Duration::from_secs(cfg.retry_base_seconds),
        Duration::from_secs(cfg.retry_max_seconds),
        &mut shutdown,
        || scheduler.sync(),
    )
    .await;
    let Some(report) = first_sync else {
        info!("shutdown requested before initial sync completed");
        return;
    };
    info!(
        initialized = report.initialized,
        indexed = report.indexed,
        "initial sync complete"
    );
    let mut last_sync = Instant::now();

    let mut interval = tokio::time::interval(cfg.tick_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown_requested(&mut shutdown) => break,
        }

        if last_sync.elapsed() >= cfg.sync_interval() {
            match scheduler.sync().await {
                Ok(report) => {
                    last_sync = Instant::now();
                    debug!(
                        initialized = report.initialized,
                        indexed = report.indexed,
                        skipped_claimed = report.skipped_claimed,
                        "periodic sync complete"
                    );
                }
                Err(err) => warn!(error = %err, "periodic sync failed"),
            }
        }

        match scheduler.run_tick().await {
            Ok(report) if report.due > 0 => info!(
                due = report.due,
                submitted = report.submitted,
                rescheduled = report.rescheduled,
                dropped = report.dropped,
                deferred = report.deferred,
                failed = report.failed,
                "scheduler tick"
            ),
            Ok(_) => {}
            Err(err) => error!(error = %err, "scheduler tick failed"),
        }
    }
    info!("email scheduler stopped");
}
