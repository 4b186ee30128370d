use chrono::{DateTime, Utc};
use tracing::{info, warn};

use recall_core::{next_run::calculate_next_run, schedule::EntryStatus};

use super::Scheduler;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    /// Entries that received their first `next_run_at` during this sync.
    pub initialized: usize,
    pub indexed: usize,
    pub skipped_invalid: usize,
    /// Entries left out because another dispatch holds a fresh claim.
    pub skipped_claimed: usize,
}

impl Scheduler {
    /// Rebuild the index from the store.
    ///
    /// Claimed entries inside the lease are left out so a dispatch in flight
    /// elsewhere is not repeated; claims older than the lease are treated as
    /// abandoned and re-indexed.
    pub async fn sync(&self) -> anyhow::Result<SyncReport> {
        let now = self.clock.now();
        let policy = &self.config.policy;
        let lease = self.config.claim_lease();
        let mut report = SyncReport {
            initialized: self.store.initialize_missing(now, policy).await?,
            ..SyncReport::default()
        };

        let mut eligible = Vec::new();
        for entry in self.store.list_active().await? {
            if let Err(err) = entry.rule(policy) {
                warn!(entry_id = %entry.id, error = %err, "skipping entry with invalid schedule");
                report.skipped_invalid += 1;
                continue;
            }
            if entry.has_fresh_claim(now, lease) {
                report.skipped_claimed += 1;
                continue;
            }
            eligible.push(entry);
        }

        report.indexed = self.index.sync_from_store(&eligible).await?;
        Ok(report)
    }

    /// Recompute an entry's due time from now and index it.
    ///
    /// Called after the entry is created or edited. Inactive or deleted
    /// entries are taken out of the index instead and `Ok(None)` is returned.
    pub async fn register_entry(&self, id: &str) -> anyhow::Result<Option<DateTime<Utc>>> {
        let entry = match self.store.get(id).await? {
            Some(entry) if entry.is_active => entry,
            _ => {
                self.index.remove(id).await?;
                return Ok(None);
            }
        };
        let rule = match entry.rule(&self.config.policy) {
            Ok(rule) => rule,
            Err(err) => {
                self.index.remove(id).await?;
                return Err(err.into());
            }
        };
        let next = calculate_next_run(&rule, self.clock.now());
        if !self
            .store
            .save_next_run(id, next, EntryStatus::Pending)
            .await?
        {
            self.index.remove(id).await?;
            return Ok(None);
        }
        self.index.upsert(id, next).await?;
        info!(entry_id = %id, next_run_at = %next, "entry registered");
        Ok(Some(next))
    }

    /// Take an entry out of the index. Returns whether it was indexed.
    pub async fn unregister_entry(&self, id: &str) -> anyhow::Result<bool> {
        let removed = self.index.remove(id).await?;
        if removed {
            info!(entry_id = %id, "entry unregistered");
        }
        Ok(removed)
    }
}
