//! Schedule store abstraction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::{
    next_run::calculate_next_run,
    schedule::{CalendarPolicy, EntryStatus, ScheduleEntry},
};

/// Source of truth for schedule entries.
///
/// The DuckDB backend implements this for the standalone scheduler; other
/// relational stores can be swapped in without touching the dispatcher. Each
/// write is a single-row update and must be atomic for concurrent readers.
#[async_trait]
pub trait ScheduleStore: Send + Sync + 'static {
    /// All entries with `is_active = true`, regardless of status.
    async fn list_active(&self) -> anyhow::Result<Vec<ScheduleEntry>>;

    /// `Ok(None)` when the entry has been deleted.
    async fn get(&self, id: &str) -> anyhow::Result<Option<ScheduleEntry>>;

    /// Mark the entry `CLAIMED` at `at`. Returns `false` if the row is gone.
    async fn mark_claimed(&self, id: &str, at: DateTime<Utc>) -> anyhow::Result<bool>;

    /// Persist a recomputed due time and status, clearing any claim.
    ///
    /// Only active rows are written. Returns `false` when the entry is gone
    /// or was deactivated, so callers know not to index it.
    async fn save_next_run(
        &self,
        id: &str,
        next_run_at: DateTime<Utc>,
        status: EntryStatus,
    ) -> anyhow::Result<bool>;

    /// Compute and persist `next_run_at` for active entries that lack one.
    ///
    /// Entries with an invalid rule are logged and left untouched. Returns
    /// the number of entries initialised.
    async fn initialize_missing(
        &self,
        now: DateTime<Utc>,
        policy: &CalendarPolicy,
    ) -> anyhow::Result<usize> {
        let mut initialized = 0usize;
        for entry in self.list_active().await? {
            if entry.next_run_at.is_some() {
                continue;
            }
            match entry.rule(policy) {
                Ok(rule) => {
                    let next = calculate_next_run(&rule, now);
                    if self
                        .save_next_run(&entry.id, next, EntryStatus::Pending)
                        .await?
                    {
                        initialized += 1;
                    }
                }
                Err(e) => {
                    warn!(entry_id = %entry.id, error = %e, "cannot initialise schedule entry");
                }
            }
        }
        Ok(initialized)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tokio::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct VecStore {
        rows: Mutex<BTreeMap<String, ScheduleEntry>>,
    }

    impl VecStore {
        async fn insert(&self, id: &str, frequency: &str, next_run_at: Option<DateTime<Utc>>) {
            self.rows.lock().await.insert(
                id.to_string(),
                ScheduleEntry {
                    id: id.to_string(),
                    name: id.to_string(),
                    is_active: true,
                    send_time: "09:00".to_string(),
                    timezone: "UTC".to_string(),
                    frequency: frequency.to_string(),
                    next_run_at,
                    status: EntryStatus::Pending,
                    claimed_at: None,
                    last_sent_at: None,
                },
            );
        }
    }

    #[async_trait]
    impl ScheduleStore for VecStore {
        async fn list_active(&self) -> anyhow::Result<Vec<ScheduleEntry>> {
            Ok(self
                .rows
                .lock()
                .await
                .values()
                .filter(|e| e.is_active)
                .cloned()
                .collect())
        }

        async fn get(&self, id: &str) -> anyhow::Result<Option<ScheduleEntry>> {
            Ok(self.rows.lock().await.get(id).cloned())
        }

        async fn mark_claimed(&self, id: &str, at: DateTime<Utc>) -> anyhow::Result<bool> {
            let mut rows = self.rows.lock().await;
            let Some(entry) = rows.get_mut(id) else {
                return Ok(false);
            };
            entry.status = EntryStatus::Claimed;
            entry.claimed_at = Some(at);
            Ok(true)
        }

        async fn save_next_run(
            &self,
            id: &str,
            next_run_at: DateTime<Utc>,
            status: EntryStatus,
        ) -> anyhow::Result<bool> {
            match self.rows.lock().await.get_mut(id) {
                Some(entry) if entry.is_active => {
                    entry.next_run_at = Some(next_run_at);
                    entry.status = status;
                    entry.claimed_at = None;
                    Ok(true)
                }
                _ => Ok(false),
            }
        }
    }

    #[tokio::test]
    async fn initialize_missing_fills_only_unscheduled_valid_entries() {
        let now: DateTime<Utc> = "2024-06-01T10:00:00Z".parse().expect("instant");
        let existing: DateTime<Utc> = "2024-06-05T09:00:00Z".parse().expect("instant");
        let store = VecStore::default();
        store.insert("svc_new", "daily", None).await;
        store.insert("svc_old", "daily", Some(existing)).await;
        store.insert("svc_bad", "fortnightly", None).await;

        let initialized = store
            .initialize_missing(now, &CalendarPolicy::default())
            .await
            .expect("initialize");
        assert_eq!(initialized, 1);

        let fresh = store.get("svc_new").await.expect("get").expect("row");
        assert_eq!(
            fresh.next_run_at,
            Some("2024-06-02T09:00:00Z".parse().expect("instant"))
        );
        assert_eq!(fresh.status, EntryStatus::Pending);

        let old = store.get("svc_old").await.expect("get").expect("row");
        assert_eq!(old.next_run_at, Some(existing));

        let bad = store.get("svc_bad").await.expect("get").expect("row");
        assert_eq!(bad.next_run_at, None);
    }
}
