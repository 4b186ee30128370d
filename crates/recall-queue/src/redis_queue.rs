use std::future::Future;
use std::sync::Arc;

use ::redis::{aio::ConnectionManager, AsyncCommands, Client, Script};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use recall_core::{
    queue::{index_members, score_of, DispatchJob, JobQueue, ReadyQueue},
    schedule::ScheduleEntry,
};

/// Take up to `ARGV[2]` members with score `<= ARGV[1]` and remove them in
/// the same script, so concurrent callers never receive the same id.
const POP_DUE_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
if #ids > 0 then
    redis.call('ZREM', KEYS[1], unpack(ids))
end
return ids
"#;

/// Lazily connected, shared Redis handle.
///
/// The first successful connect is cached; `ConnectionManager` reconnects
/// on its own after that. A failed first connect is retried on the next
/// call.
pub struct RedisConnector {
    client: Client,
    manager: OnceCell<ConnectionManager>,
}

impl RedisConnector {
    pub fn open(url: &str) -> anyhow::Result<Arc<Self>> {
        Ok(Arc::new(Self {
            client: Client::open(url)?,
            manager: OnceCell::new(),
        }))
    }

    pub async fn connection(&self) -> anyhow::Result<ConnectionManager> {
        let manager = self
            .manager
            .get_or_try_init(|| async {
                let manager = ConnectionManager::new(self.client.clone()).await?;
                info!("connected to Redis");
                Ok::<_, ::redis::RedisError>(manager)
            })
            .await?;
        Ok(manager.clone())
    }
}

/// Ready queue backed by a Redis sorted set (`member = entry id`,
/// `score = due epoch seconds`).
pub struct RedisReadyQueue {
    connector: Arc<RedisConnector>,
    key: String,
    batch_size: usize,
    pop_script: Script,
}

impl RedisReadyQueue {
    pub fn new(connector: Arc<RedisConnector>, key: impl Into<String>, batch_size: usize) -> Self {
        Self {
            connector,
            key: key.into(),
            batch_size: batch_size.max(1),
            pop_script: Script::new(POP_DUE_SCRIPT),
        }
    }
}

#[async_trait]
impl ReadyQueue for RedisReadyQueue {
    async fn upsert(&self, id: &str, due_at: DateTime<Utc>) -> anyhow::Result<()> {
        let mut conn = self.connector.connection().await?;
        let _: () = conn.zadd(&self.key, id, score_of(due_at)).await?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> anyhow::Result<bool> {
        let mut conn = self.connector.connection().await?;
        let removed: i64 = conn.zrem(&self.key, id).await?;
        Ok(removed > 0)
    }

    async fn pop_due(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<String>> {
        let conn = self.connector.connection().await?;
        let cutoff = score_of(now);
        let (script, key, batch_size) = (&self.pop_script, self.key.as_str(), self.batch_size);
        let due = drain_batches(batch_size, || {
            let mut conn = conn.clone();
            async move {
                let batch: Vec<String> = script
                    .key(key)
                    .arg(cutoff)
                    .arg(batch_size)
                    .invoke_async(&mut conn)
                    .await?;
                Ok::<_, anyhow::Error>(batch)
            }
        })
        .await?;
        debug!(key = %self.key, count = due.len(), "popped due entries");
        Ok(due)
    }

    async fn sync_from_store(&self, entries: &[ScheduleEntry]) -> anyhow::Result<usize> {
        let members: Vec<(i64, String)> = index_members(entries)
            .into_iter()
            .map(|(id, score)| (score, id))
            .collect();
        let mut conn = self.connector.connection().await?;
        let mut pipe = ::redis::pipe();
        pipe.atomic().del(&self.key).ignore();
        if !members.is_empty() {
            pipe.zadd_multiple(&self.key, &members).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(members.len())
    }

    async fn count(&self) -> anyhow::Result<usize> {
        let mut conn = self.connector.connection().await?;
        let count: usize = conn.zcard(&self.key).await?;
        Ok(count)
    }

    async fn score(&self, id: &str) -> anyhow::Result<Option<i64>> {
        let mut conn = self.connector.connection().await?;
        let score: Option<f64> = conn.zscore(&self.key, id).await?;
        Ok(score.map(|s| s as i64))
    }
}

/// Pull batches until one comes back short.
///
/// Every batch is already removed from the index when it arrives, so a
/// failure after the first batch hands back what was collected instead of
/// dropping it; only a failure before anything was popped is an error.
async fn drain_batches<F, Fut>(batch_size: usize, mut next_batch: F) -> anyhow::Result<Vec<String>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<Vec<String>>>,
{
    let mut due = Vec::new();
    loop {
        match next_batch().await {
            Ok(batch) => {
                let exhausted = batch.len() < batch_size;
                due.extend(batch);
                if exhausted {
                    return Ok(due);
                }
            }
            Err(err) if due.is_empty() => return Err(err),
            Err(err) => {
                warn!(
                    count = due.len(),
                    error = %err,
                    "pop failed mid-drain, returning ids already removed"
                );
                return Ok(due);
            }
        }
    }
}

/// Pushes JSON-encoded jobs onto a Redis list for external workers.
pub struct RedisJobQueue {
    connector: Arc<RedisConnector>,
    key: String,
}

impl RedisJobQueue {
    pub fn new(connector: Arc<RedisConnector>, key: impl Into<String>) -> Self {
        Self {
            connector,
            key: key.into(),
        }
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn submit(&self, job: &DispatchJob) -> anyhow::Result<()> {
        let payload = serde_json::to_string(job)?;
        let mut conn = self.connector.connection().await?;
        let _: () = conn.rpush(&self.key, payload).await?;
        Ok(())
    }
}
