use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::{mpsc, Mutex};

use recall_core::{
    clock::{Clock, ManualClock},
    queue::{score_of, DispatchJob, JobQueue, ReadyQueue, SEND_EMAIL_SERVICE_TASK},
    schedule::{CalendarPolicy, EntryStatus, NewScheduleEntry, ScheduleEntry},
    store::ScheduleStore,
};
use recall_duckdb::DuckDbBackend;
use recall_queue::{ChannelJobQueue, InMemoryReadyQueue};
use recall_scheduler::{config::Config, Scheduler};

fn at(raw: &str) -> DateTime<Utc> {
    raw.parse().expect("instant")
}

struct Harness {
    db: Arc<DuckDbBackend>,
    index: Arc<InMemoryReadyQueue>,
    jobs: Arc<ChannelJobQueue>,
    rx: mpsc::Receiver<DispatchJob>,
    clock: Arc<ManualClock>,
    scheduler: Scheduler,
}

impl Harness {
    fn new(start: DateTime<Utc>, channel_capacity: usize) -> Self {
        let db = Arc::new(DuckDbBackend::open_in_memory().expect("db"));
        Self::over(start, channel_capacity, db.clone(), db)
    }

    /// Scheduler reading through `store`, with `db` kept for direct setup.
    fn over(
        start: DateTime<Utc>,
        channel_capacity: usize,
        db: Arc<DuckDbBackend>,
        store: Arc<dyn ScheduleStore>,
    ) -> Self {
        let index = Arc::new(InMemoryReadyQueue::new());
        let (jobs, rx) = ChannelJobQueue::new(channel_capacity);
        let jobs = Arc::new(jobs);
        let clock = Arc::new(ManualClock::new(start));
        let scheduler = Scheduler::new(
            store,
            index.clone(),
            jobs.clone(),
            clock.clone(),
            Config::default(),
        );
        Self {
            db,
            index,
            jobs,
            rx,
            clock,
            scheduler,
        }
    }

    async fn create_daily(&self, name: &str, send_time: &str) -> ScheduleEntry {
        self.db
            .create_entry(
                NewScheduleEntry {
                    name: name.to_string(),
                    send_time: send_time.to_string(),
                    timezone: "UTC".to_string(),
                    frequency: "daily".to_string(),
                    is_active: true,
                },
                self.clock.now(),
                &CalendarPolicy::default(),
            )
            .await
            .expect("create")
    }

    fn drain_jobs(&mut self) -> Vec<DispatchJob> {
        let mut out = Vec::new();
        while let Ok(job) = self.rx.try_recv() {
            out.push(job);
        }
        out
    }
}

#[tokio::test]
async fn tick_submits_one_job_per_due_entry_and_pushes_scores_forward() {
    let mut h = Harness::new(at("2024-06-01T10:00:00Z"), 16);
    for name in ["a", "b", "c"] {
        h.create_daily(name, "09:00").await;
    }
    h.create_daily("later", "18:00").await;
    h.scheduler.sync().await.expect("sync");

    let now = at("2024-06-02T09:00:30Z");
    h.clock.set(now);
    let report = h.scheduler.run_tick().await.expect("tick");
    assert_eq!(report.due, 3);
    assert_eq!(report.submitted, 3);
    assert_eq!(report.rescheduled, 3);
    assert_eq!(report.failed, 0);

    let jobs = h.drain_jobs();
    assert_eq!(jobs.len(), 3);
    for job in &jobs {
        assert_eq!(job.task, SEND_EMAIL_SERVICE_TASK);
        assert_eq!(job.due_at, at("2024-06-02T09:00:00Z"));
        assert_eq!(job.submitted_at, now);
        assert_eq!(job.expires_at, now + Duration::hours(1));

        let score = h.index.score(&job.entry_id).await.expect("score").expect("indexed");
        assert!(score > score_of(now));
        let entry = h.db.get(&job.entry_id).await.expect("get").expect("row");
        assert_eq!(entry.next_run_at, Some(at("2024-06-03T09:00:00Z")));
        assert_eq!(entry.status, EntryStatus::Pending);
        assert!(entry.claimed_at.is_none());
    }

    let again = h.scheduler.run_tick().await.expect("tick");
    assert_eq!(again.due, 0);
    assert!(h.drain_jobs().is_empty());
}

#[tokio::test]
async fn long_outage_dispatches_each_entry_once() {
    let mut h = Harness::new(at("2024-06-01T10:00:00Z"), 16);
    let entry = h.create_daily("digest", "09:00").await;
    h.scheduler.sync().await.expect("sync");

    h.clock.set(at("2024-06-10T12:00:00Z"));
    let report = h.scheduler.run_tick().await.expect("tick");
    assert_eq!(report.submitted, 1);
    assert_eq!(h.drain_jobs().len(), 1);

    let stored = h.db.get(&entry.id).await.expect("get").expect("row");
    assert_eq!(stored.next_run_at, Some(at("2024-06-11T09:00:00Z")));
    assert_eq!(h.scheduler.run_tick().await.expect("tick").due, 0);
}

#[tokio::test]
async fn failed_submission_requeues_without_rescheduling() {
    let mut h = Harness::new(at("2024-06-01T10:00:00Z"), 1);
    let entry = h.create_daily("digest", "09:00").await;
    h.scheduler.sync().await.expect("sync");

    let now = h.clock.now();
    let blocker = DispatchJob::new("svc_blocker", now, now, Duration::hours(1));
    h.jobs.submit(&blocker).await.expect("fill channel");

    h.clock.set(at("2024-06-02T09:00:10Z"));
    let report = h.scheduler.run_tick().await.expect("tick");
    assert_eq!(report.due, 1);
    assert_eq!(report.submitted, 0);
    assert_eq!(report.failed, 1);

    assert_eq!(
        h.index.score(&entry.id).await.expect("score"),
        Some(score_of(at("2024-06-02T09:00:00Z")))
    );
    let stored = h.db.get(&entry.id).await.expect("get").expect("row");
    assert_eq!(stored.next_run_at, Some(at("2024-06-02T09:00:00Z")));

    assert_eq!(h.drain_jobs().len(), 1);
    let retry = h.scheduler.run_tick().await.expect("tick");
    assert_eq!(retry.submitted, 1);
    let jobs = h.drain_jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].entry_id, entry.id);
}

#[tokio::test]
async fn deactivated_entry_is_not_dispatched_after_sync() {
    let mut h = Harness::new(at("2024-06-01T10:00:00Z"), 16);
    let entry = h.create_daily("digest", "09:00").await;
    h.scheduler.sync().await.expect("sync");
    assert_eq!(h.index.count().await.expect("count"), 1);

    h.db
        .set_active(&entry.id, false, h.clock.now(), &CalendarPolicy::default())
        .await
        .expect("deactivate");
    h.scheduler.sync().await.expect("sync");
    assert_eq!(h.index.count().await.expect("count"), 0);

    h.clock.set(at("2024-06-02T09:00:00Z"));
    let report = h.scheduler.run_tick().await.expect("tick");
    assert_eq!(report.due, 0);
    assert!(h.drain_jobs().is_empty());
}

#[tokio::test]
async fn entry_deleted_before_its_tick_is_dropped() {
    let mut h = Harness::new(at("2024-06-01T10:00:00Z"), 16);
    let entry = h.create_daily("digest", "09:00").await;
    h.scheduler.sync().await.expect("sync");
    h.db.delete_entry(&entry.id).await.expect("delete");

    h.clock.set(at("2024-06-02T09:00:00Z"));
    let report = h.scheduler.run_tick().await.expect("tick");
    assert_eq!(report.due, 1);
    assert_eq!(report.dropped, 1);
    assert_eq!(report.submitted, 0);
    assert!(h.drain_jobs().is_empty());
    assert_eq!(h.index.count().await.expect("count"), 0);
}

#[tokio::test]
async fn register_and_unregister_follow_entry_edits() {
    let h = Harness::new(at("2024-06-01T10:00:00Z"), 16);
    let entry = h.create_daily("digest", "09:00").await;

    h.clock.set(at("2024-06-03T08:00:00Z"));
    let next = h.scheduler.register_entry(&entry.id).await.expect("register");
    assert_eq!(next, Some(at("2024-06-03T09:00:00Z")));
    assert_eq!(
        h.index.score(&entry.id).await.expect("score"),
        Some(score_of(at("2024-06-03T09:00:00Z")))
    );

    assert!(h.scheduler.unregister_entry(&entry.id).await.expect("unregister"));
    assert!(!h.scheduler.unregister_entry(&entry.id).await.expect("unregister"));

    h.db
        .set_active(&entry.id, false, h.clock.now(), &CalendarPolicy::default())
        .await
        .expect("deactivate");
    h.index
        .upsert(&entry.id, at("2024-06-03T09:00:00Z"))
        .await
        .expect("upsert");
    assert_eq!(h.scheduler.register_entry(&entry.id).await.expect("register"), None);
    assert_eq!(h.index.count().await.expect("count"), 0);
    assert_eq!(h.scheduler.register_entry("svc_missing").await.expect("register"), None);
}

/// DuckDB store with switchable faults for the dispatch path.
struct FaultyStore {
    inner: Arc<DuckDbBackend>,
    fail_get: AtomicBool,
    fail_save_for: Mutex<Option<String>>,
    /// Deactivate this id right after the second read of it returns.
    deactivate_after_reload: Mutex<Option<String>>,
    reads: Mutex<HashMap<String, usize>>,
}

impl FaultyStore {
    fn new(inner: Arc<DuckDbBackend>) -> Self {
        Self {
            inner,
            fail_get: AtomicBool::new(false),
            fail_save_for: Mutex::new(None),
            deactivate_after_reload: Mutex::new(None),
            reads: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ScheduleStore for FaultyStore {
    async fn list_active(&self) -> anyhow::Result<Vec<ScheduleEntry>> {
        self.inner.list_active().await
    }

    async fn get(&self, id: &str) -> anyhow::Result<Option<ScheduleEntry>> {
        if self.fail_get.load(Ordering::SeqCst) {
            return Err(anyhow!("schedule store read timed out"));
        }
        let reads = {
            let mut reads = self.reads.lock().await;
            let count = reads.entry(id.to_string()).or_default();
            *count += 1;
            *count
        };
        let entry = self.inner.get(id).await?;
        if reads == 2 && self.deactivate_after_reload.lock().await.as_deref() == Some(id) {
            self.inner
                .set_active(id, false, at("2024-06-02T09:00:00Z"), &CalendarPolicy::default())
                .await?;
        }
        Ok(entry)
    }

    async fn mark_claimed(&self, id: &str, at: DateTime<Utc>) -> anyhow::Result<bool> {
        self.inner.mark_claimed(id, at).await
    }

    async fn save_next_run(
        &self,
        id: &str,
        next_run_at: DateTime<Utc>,
        status: EntryStatus,
    ) -> anyhow::Result<bool> {
        if self.fail_save_for.lock().await.as_deref() == Some(id) {
            return Err(anyhow!("schedule store write failed"));
        }
        self.inner.save_next_run(id, next_run_at, status).await
    }
}

fn faulty_harness(start: DateTime<Utc>) -> (Harness, Arc<FaultyStore>) {
    let db = Arc::new(DuckDbBackend::open_in_memory().expect("db"));
    let store = Arc::new(FaultyStore::new(db.clone()));
    (Harness::over(start, 16, db, store.clone()), store)
}

#[tokio::test]
async fn unreadable_entry_is_still_submitted_with_tick_time() {
    let (mut h, store) = faulty_harness(at("2024-06-01T10:00:00Z"));
    let entry = h.create_daily("digest", "09:00").await;
    h.scheduler.sync().await.expect("sync");

    store.fail_get.store(true, Ordering::SeqCst);
    let now = at("2024-06-02T09:00:30Z");
    h.clock.set(now);
    let report = h.scheduler.run_tick().await.expect("tick");
    assert_eq!(report.due, 1);
    assert_eq!(report.submitted, 1);
    assert_eq!(report.rescheduled, 0);
    assert_eq!(report.failed, 1);

    let jobs = h.drain_jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].entry_id, entry.id);
    assert_eq!(jobs[0].due_at, now);
}

#[tokio::test]
async fn stale_index_score_is_deferred_not_resent() {
    let mut h = Harness::new(at("2024-06-01T10:00:00Z"), 16);
    let entry = h.create_daily("digest", "09:00").await;
    h.scheduler.sync().await.expect("sync");
    let stale = h.db.list_active().await.expect("list");

    h.clock.set(at("2024-06-02T09:00:30Z"));
    let first = h.scheduler.run_tick().await.expect("tick");
    assert_eq!(first.submitted, 1);

    // A sync that read the store before the reschedule landed.
    h.index.sync_from_store(&stale).await.expect("stale sync");
    let second = h.scheduler.run_tick().await.expect("tick");
    assert_eq!(second.due, 1);
    assert_eq!(second.deferred, 1);
    assert_eq!(second.submitted, 0);

    assert_eq!(h.drain_jobs().len(), 1);
    assert_eq!(
        h.index.score(&entry.id).await.expect("score"),
        Some(score_of(at("2024-06-03T09:00:00Z")))
    );
}

#[tokio::test]
async fn failed_reschedule_does_not_stop_the_rest_of_the_batch() {
    let (mut h, store) = faulty_harness(at("2024-06-01T10:00:00Z"));
    let a = h.create_daily("a", "09:00").await;
    let b = h.create_daily("b", "09:00").await;
    let c = h.create_daily("c", "09:00").await;
    h.scheduler.sync().await.expect("sync");
    *store.fail_save_for.lock().await = Some(b.id.clone());

    h.clock.set(at("2024-06-02T09:00:30Z"));
    let report = h.scheduler.run_tick().await.expect("tick");
    assert_eq!(report.due, 3);
    assert_eq!(report.submitted, 3);
    assert_eq!(report.rescheduled, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(h.drain_jobs().len(), 3);

    for ok in [&a, &c] {
        assert_eq!(
            h.index.score(&ok.id).await.expect("score"),
            Some(score_of(at("2024-06-03T09:00:00Z")))
        );
    }
    assert!(h.index.score(&b.id).await.expect("score").is_none());
    let stuck = h.db.get(&b.id).await.expect("get").expect("row");
    assert_eq!(stuck.status, EntryStatus::Claimed);
    assert_eq!(stuck.next_run_at, Some(at("2024-06-02T09:00:00Z")));
}

#[tokio::test]
async fn deactivation_racing_the_reschedule_keeps_entry_out_of_index() {
    let (mut h, store) = faulty_harness(at("2024-06-01T10:00:00Z"));
    let entry = h.create_daily("digest", "09:00").await;
    h.scheduler.sync().await.expect("sync");
    *store.deactivate_after_reload.lock().await = Some(entry.id.clone());

    h.clock.set(at("2024-06-02T09:00:30Z"));
    let report = h.scheduler.run_tick().await.expect("tick");
    assert_eq!(report.submitted, 1);
    assert_eq!(report.rescheduled, 0);
    assert_eq!(report.dropped, 1);
    assert_eq!(h.drain_jobs().len(), 1);

    assert_eq!(h.index.count().await.expect("count"), 0);
    let stored = h.db.get(&entry.id).await.expect("get").expect("row");
    assert!(!stored.is_active);
    assert!(stored.next_run_at.is_none());
}
