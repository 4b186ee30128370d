use std::time::Duration;

use chrono::Weekday;

use crate::schedule::CalendarPolicy;

const CLAIM_LEASE_RANGE: (u64, u64) = (10, 86_400);
const JOB_TTL_RANGE: (u64, u64) = (60, 604_800);

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: String,
    pub duckdb_memory_limit: String,
    /// When unset the scheduler runs with an in-process index and job channel.
    pub redis_url: Option<String>,
    pub schedule_key: String,
    pub job_queue_key: String,
    pub tick_seconds: u64,
    pub sync_interval_seconds: u64,
    pub retry_base_seconds: u64,
    pub retry_max_seconds: u64,
    pub claim_lease_seconds: u64,
    pub job_ttl_seconds: u64,
    pub pop_batch_size: usize,
    pub job_channel_capacity: usize,
    pub policy: CalendarPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            duckdb_memory_limit: "1GB".to_string(),
            redis_url: None,
            schedule_key: "email_schedule".to_string(),
            job_queue_key: "email_jobs".to_string(),
            tick_seconds: 60,
            sync_interval_seconds: 300,
            retry_base_seconds: 5,
            retry_max_seconds: 60,
            claim_lease_seconds: 300,
            job_ttl_seconds: 3600,
            pop_batch_size: 500,
            job_channel_capacity: 1024,
            policy: CalendarPolicy::default(),
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let defaults = Self::default();
        let retry_base_seconds = env_u64("RECALL_RETRY_BASE_SECONDS", defaults.retry_base_seconds)
            .clamp(1, 3600);
        Ok(Self {
            data_dir: std::env::var("RECALL_DATA_DIR").unwrap_or(defaults.data_dir),
            duckdb_memory_limit: std::env::var("RECALL_DUCKDB_MEMORY")
                .unwrap_or(defaults.duckdb_memory_limit),
            redis_url: std::env::var("RECALL_REDIS_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            schedule_key: std::env::var("RECALL_SCHEDULE_KEY").unwrap_or(defaults.schedule_key),
            job_queue_key: std::env::var("RECALL_JOB_QUEUE_KEY").unwrap_or(defaults.job_queue_key),
            tick_seconds: env_u64("RECALL_TICK_SECONDS", defaults.tick_seconds).clamp(1, 3600),
            sync_interval_seconds: env_u64("RECALL_SYNC_SECONDS", defaults.sync_interval_seconds)
                .clamp(10, 86_400),
            retry_base_seconds,
            retry_max_seconds: env_u64("RECALL_RETRY_MAX_SECONDS", defaults.retry_max_seconds)
                .max(retry_base_seconds),
            claim_lease_seconds: env_u64(
                "RECALL_CLAIM_LEASE_SECONDS",
                defaults.claim_lease_seconds,
            )
            .clamp(CLAIM_LEASE_RANGE.0, CLAIM_LEASE_RANGE.1),
            job_ttl_seconds: env_u64("RECALL_JOB_TTL_SECONDS", defaults.job_ttl_seconds)
                .clamp(JOB_TTL_RANGE.0, JOB_TTL_RANGE.1),
            pop_batch_size: env_u64("RECALL_POP_BATCH_SIZE", defaults.pop_batch_size as u64)
                .clamp(1, 5_000) as usize,
            job_channel_capacity: env_u64(
                "RECALL_JOB_CHANNEL_CAPACITY",
                defaults.job_channel_capacity as u64,
            )
            .max(1) as usize,
            policy: CalendarPolicy {
                weekly_weekday: match std::env::var("RECALL_WEEKLY_WEEKDAY") {
                    Ok(raw) => raw
                        .trim()
                        .parse::<Weekday>()
                        .map_err(|_| format!("invalid RECALL_WEEKLY_WEEKDAY: {raw}"))?,
                    Err(_) => defaults.policy.weekly_weekday,
                },
                monthly_day: env_u64("RECALL_MONTHLY_DAY", u64::from(defaults.policy.monthly_day))
                    .clamp(1, 31) as u32,
            },
        })
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_seconds)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_seconds)
    }

    /// Clamped again here so a hand-built config cannot overflow chrono.
    pub fn claim_lease(&self) -> chrono::Duration {
        let secs = self
            .claim_lease_seconds
            .clamp(CLAIM_LEASE_RANGE.0, CLAIM_LEASE_RANGE.1);
        chrono::Duration::seconds(secs as i64)
    }

    pub fn job_ttl(&self) -> chrono::Duration {
        let secs = self.job_ttl_seconds.clamp(JOB_TTL_RANGE.0, JOB_TTL_RANGE.1);
        chrono::Duration::seconds(secs as i64)
    }
}
