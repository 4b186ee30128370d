use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use recall_core::{
    next_run::calculate_next_run,
    queue::DispatchJob,
    schedule::EntryStatus,
};

use super::Scheduler;

/// Counts for a single tick.
///
/// `submitted` counts jobs that reached the job queue, whatever happened to
/// the entry afterwards; `failed` may overlap with it when rescheduling a
/// submitted entry errors.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub due: usize,
    pub submitted: usize,
    pub rescheduled: usize,
    pub dropped: usize,
    /// Popped ids whose stored due time was already in the future.
    pub deferred: usize,
    pub failed: usize,
}

enum Submission {
    Submitted,
    /// Gone or inactive before anything was submitted.
    Dropped,
    /// Stale index score; re-indexed at the stored due time.
    Deferred,
    /// Submission failed; the id is back in the index at its old due time.
    Requeued,
}

impl Scheduler {
    /// Claim every due id from the index, submit one job per entry and
    /// reschedule it.
    ///
    /// Only `pop_due` failing aborts the tick. Every per-entry failure is
    /// logged and counted.
    pub async fn run_tick(&self) -> anyhow::Result<TickReport> {
        let now = self.clock.now();
        let due = self.index.pop_due(now).await?;
        let mut report = TickReport {
            due: due.len(),
            ..TickReport::default()
        };

        for id in due {
            match self.submit_entry(&id, now).await {
                Ok(Submission::Submitted) => report.submitted += 1,
                Ok(Submission::Dropped) => {
                    report.dropped += 1;
                    continue;
                }
                Ok(Submission::Deferred) => {
                    report.deferred += 1;
                    continue;
                }
                Ok(Submission::Requeued) => {
                    report.failed += 1;
                    continue;
                }
                Err(err) => {
                    error!(entry_id = %id, error = %err, "dispatch failed");
                    report.failed += 1;
                    continue;
                }
            }

            match self.reschedule_entry(&id, now).await {
                Ok(true) => report.rescheduled += 1,
                Ok(false) => report.dropped += 1,
                Err(err) => {
                    error!(entry_id = %id, error = %err, "reschedule after submission failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    async fn submit_entry(&self, id: &str, now: DateTime<Utc>) -> anyhow::Result<Submission> {
        // An unreadable store must not cost a send: fall back to submitting
        // with `now` as the due time.
        let due_at = match self.store.get(id).await {
            Ok(Some(snapshot)) if !snapshot.is_active => {
                info!(entry_id = %id, "due entry is inactive");
                return Ok(Submission::Dropped);
            }
            Ok(Some(snapshot)) => match snapshot.next_run_at {
                Some(next) if next > now => {
                    info!(entry_id = %id, next_run_at = %next, "index score is stale, deferring");
                    self.index.upsert(id, next).await?;
                    return Ok(Submission::Deferred);
                }
                Some(next) => next,
                None => now,
            },
            Ok(None) => {
                info!(entry_id = %id, "due entry no longer exists");
                return Ok(Submission::Dropped);
            }
            Err(err) => {
                warn!(entry_id = %id, error = %err, "could not load due entry, submitting anyway");
                now
            }
        };

        match self.store.mark_claimed(id, now).await {
            Ok(true) => {}
            Ok(false) => warn!(entry_id = %id, "entry vanished while claiming"),
            Err(err) => warn!(entry_id = %id, error = %err, "could not mark entry claimed"),
        }

        let job = DispatchJob::new(id, due_at, now, self.config.job_ttl());
        if let Err(err) = self.jobs.submit(&job).await {
            error!(entry_id = %id, error = %err, "job submission failed, requeueing");
            self.index.upsert(id, due_at).await?;
            return Ok(Submission::Requeued);
        }
        info!(entry_id = %id, job_id = %job.job_id, due_at = %due_at, "email job submitted");
        Ok(Submission::Submitted)
    }

    /// Move a just-submitted entry to its next occurrence. Returns `false`
    /// when the entry was deleted, deactivated or has an invalid rule, in
    /// which case it stays out of the index.
    async fn reschedule_entry(&self, id: &str, now: DateTime<Utc>) -> anyhow::Result<bool> {
        let entry = match self.store.get(id).await? {
            Some(entry) if entry.is_active => entry,
            Some(_) => {
                info!(entry_id = %id, "entry deactivated during dispatch");
                return Ok(false);
            }
            None => {
                info!(entry_id = %id, "entry deleted during dispatch");
                return Ok(false);
            }
        };
        let rule = match entry.rule(&self.config.policy) {
            Ok(rule) => rule,
            Err(err) => {
                warn!(entry_id = %id, error = %err, "invalid schedule rule, not rescheduling");
                return Ok(false);
            }
        };

        let reference = entry.next_run_at.map_or(now, |prev| prev.max(now));
        let next = calculate_next_run(&rule, reference);
        if !self
            .store
            .save_next_run(id, next, EntryStatus::Pending)
            .await?
        {
            info!(entry_id = %id, "entry deactivated before reschedule was saved");
            return Ok(false);
        }
        self.index.upsert(id, next).await?;
        Ok(true)
    }
}
