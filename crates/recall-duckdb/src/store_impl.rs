use async_trait::async_trait;
use chrono::{DateTime, Utc};

use recall_core::schedule::{CalendarPolicy, EntryStatus, ScheduleEntry};
use recall_core::store::ScheduleStore;

use crate::DuckDbBackend;

#[async_trait]
impl ScheduleStore for DuckDbBackend {
    async fn list_active(&self) -> anyhow::Result<Vec<ScheduleEntry>> {
        self.list_active_entries().await
    }

    async fn get(&self, id: &str) -> anyhow::Result<Option<ScheduleEntry>> {
        self.get_entry(id).await
    }

    async fn mark_claimed(&self, id: &str, at: DateTime<Utc>) -> anyhow::Result<bool> {
        self.mark_entry_claimed(id, at).await
    }

    async fn save_next_run(
        &self,
        id: &str,
        next_run_at: DateTime<Utc>,
        status: EntryStatus,
    ) -> anyhow::Result<bool> {
        self.save_entry_next_run(id, next_run_at, status).await
    }

    async fn initialize_missing(
        &self,
        now: DateTime<Utc>,
        policy: &CalendarPolicy,
    ) -> anyhow::Result<usize> {
        self.initialize_missing_entries(now, policy).await
    }
}
