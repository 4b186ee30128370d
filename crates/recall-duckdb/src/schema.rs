/// DuckDB initialization SQL.
///
/// Executed once at database open time via `Connection::execute_batch`.
/// All statements use `IF NOT EXISTS` so they are safe to re-run on every
/// startup.
///
/// `memory_limit` comes from `Config.duckdb_memory_limit`
/// (env `RECALL_DUCKDB_MEMORY`, default `"1GB"`). The scheduler table is
/// tiny, but DuckDB's default of 80% of system RAM is not acceptable for a
/// background process sharing a host with the API and workers.
///
/// Timestamps are stored as naive UTC `TIMESTAMP` values; see
/// [`crate::entries`] for the text format used in and out.
pub fn init_sql(memory_limit: &str) -> String {
    format!(
        r#"SET memory_limit = '{memory_limit}';
SET threads = 2;

-- ===========================================
-- EMAIL SERVICES (schedule entries)
-- ===========================================
-- status: 'PENDING' | 'CLAIMED'. CLAIMED is transient and set only while a
-- scheduler instance dispatches the entry; claimed_at ages out via the
-- claim lease.
-- last_sent_at is written by the downstream email job, never the scheduler.
CREATE TABLE IF NOT EXISTS email_services (
    id              VARCHAR PRIMARY KEY,           -- 'svc_' + 21 random alnum
    name            VARCHAR NOT NULL,
    is_active       BOOLEAN NOT NULL DEFAULT TRUE,
    send_time       VARCHAR(8) NOT NULL,           -- local 'HH:MM' or 'HH:MM:SS'
    timezone        VARCHAR(64) NOT NULL DEFAULT 'UTC',  -- IANA timezone string
    frequency       VARCHAR(16) NOT NULL,          -- 'daily' | 'weekly' | 'monthly'
    next_run_at     TIMESTAMP,                     -- NULL until first computed
    status          VARCHAR(16) NOT NULL DEFAULT 'PENDING',
    claimed_at      TIMESTAMP,
    last_sent_at    TIMESTAMP,
    created_at      TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);
"#
    )
}
