use std::collections::{BTreeSet, HashMap};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};

use recall_core::{
    queue::{index_members, score_of, DispatchJob, JobQueue, ReadyQueue},
    schedule::ScheduleEntry,
};

#[derive(Default)]
struct IndexState {
    scores: HashMap<String, i64>,
    ordered: BTreeSet<(i64, String)>,
}

impl IndexState {
    fn insert(&mut self, id: &str, score: i64) {
        if let Some(previous) = self.scores.insert(id.to_string(), score) {
            self.ordered.remove(&(previous, id.to_string()));
        }
        self.ordered.insert((score, id.to_string()));
    }

    fn remove(&mut self, id: &str) -> bool {
        match self.scores.remove(id) {
            Some(score) => {
                self.ordered.remove(&(score, id.to_string()));
                true
            }
            None => false,
        }
    }
}

/// Process-local ready queue.
///
/// A single mutex guards both maps, so `pop_due` is atomic with respect to
/// every other operation on the same instance.
#[derive(Default)]
pub struct InMemoryReadyQueue {
    state: Mutex<IndexState>,
}

impl InMemoryReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReadyQueue for InMemoryReadyQueue {
    async fn upsert(&self, id: &str, due_at: DateTime<Utc>) -> anyhow::Result<()> {
        self.state.lock().await.insert(id, score_of(due_at));
        Ok(())
    }

    async fn remove(&self, id: &str) -> anyhow::Result<bool> {
        Ok(self.state.lock().await.remove(id))
    }

    async fn pop_due(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<String>> {
        let cutoff = score_of(now);
        let mut state = self.state.lock().await;
        let mut due = Vec::new();
        while let Some((score, _)) = state.ordered.first() {
            if *score > cutoff {
                break;
            }
            if let Some((_, id)) = state.ordered.pop_first() {
                state.scores.remove(&id);
                due.push(id);
            }
        }
        Ok(due)
    }

    async fn sync_from_store(&self, entries: &[ScheduleEntry]) -> anyhow::Result<usize> {
        let mut fresh = IndexState::default();
        for (id, score) in index_members(entries) {
            fresh.insert(&id, score);
        }
        let indexed = fresh.scores.len();
        *self.state.lock().await = fresh;
        Ok(indexed)
    }

    async fn count(&self) -> anyhow::Result<usize> {
        Ok(self.state.lock().await.scores.len())
    }

    async fn score(&self, id: &str) -> anyhow::Result<Option<i64>> {
        Ok(self.state.lock().await.scores.get(id).copied())
    }
}

/// Hands jobs to an in-process consumer over a bounded channel.
///
/// `submit` never waits: a full or closed channel is reported as a failed
/// submission so the dispatcher can put the entry back.
pub struct ChannelJobQueue {
    tx: mpsc::Sender<DispatchJob>,
}

impl ChannelJobQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<DispatchJob>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl JobQueue for ChannelJobQueue {
    async fn submit(&self, job: &DispatchJob) -> anyhow::Result<()> {
        self.tx.try_send(job.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => anyhow!("job channel full"),
            mpsc::error::TrySendError::Closed(_) => anyhow!("job channel closed"),
        })
    }
}
