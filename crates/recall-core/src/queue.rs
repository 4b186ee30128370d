//! Ready-queue index and job-queue abstractions.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::schedule::ScheduleEntry;

/// Task name carried by every dispatched job.
pub const SEND_EMAIL_SERVICE_TASK: &str = "send_email_service";

/// Index score for a due instant: whole epoch seconds.
pub fn score_of(at: DateTime<Utc>) -> i64 {
    at.timestamp()
}

/// `(id, score)` pairs a full sync leaves in the index.
///
/// Inactive entries and entries without a computed due time are excluded.
pub fn index_members(entries: &[ScheduleEntry]) -> Vec<(String, i64)> {
    entries
        .iter()
        .filter(|entry| entry.is_active)
        .filter_map(|entry| entry.next_run_at.map(|at| (entry.id.clone(), score_of(at))))
        .collect()
}

/// Sorted index of entry ids keyed by due time.
///
/// `pop_due` is the cross-instance claim: an id it returns has already been
/// removed, so no other caller sharing the index can receive it.
#[async_trait]
pub trait ReadyQueue: Send + Sync + 'static {
    async fn upsert(&self, id: &str, due_at: DateTime<Utc>) -> anyhow::Result<()>;

    /// Returns `true` if the id was present.
    async fn remove(&self, id: &str) -> anyhow::Result<bool>;

    /// Atomically take every id whose score is `<= now`.
    async fn pop_due(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<String>>;

    /// Replace the whole index with the given snapshot. Returns the number of
    /// ids indexed.
    async fn sync_from_store(&self, entries: &[ScheduleEntry]) -> anyhow::Result<usize>;

    async fn count(&self) -> anyhow::Result<usize>;

    async fn score(&self, id: &str) -> anyhow::Result<Option<i64>>;
}

/// Payload handed to the external worker queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchJob {
    pub job_id: String,
    pub task: String,
    pub entry_id: String,
    pub due_at: DateTime<Utc>,
    pub submitted_at: DateTime<Utc>,
    /// Workers should discard the job after this instant.
    pub expires_at: DateTime<Utc>,
}

impl DispatchJob {
    pub fn new(
        entry_id: &str,
        due_at: DateTime<Utc>,
        submitted_at: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            task: SEND_EMAIL_SERVICE_TASK.to_string(),
            entry_id: entry_id.to_string(),
            due_at,
            submitted_at,
            expires_at: submitted_at + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Outbound job submission. At-least-once; the scheduler never waits for
/// the job itself to finish.
#[async_trait]
pub trait JobQueue: Send + Sync + 'static {
    async fn submit(&self, job: &DispatchJob) -> anyhow::Result<()>;
}
