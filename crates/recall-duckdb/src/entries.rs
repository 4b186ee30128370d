use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use rand::Rng;
use recall_core::{
    next_run::calculate_next_run,
    schedule::{
        CalendarPolicy, EntryStatus, NewScheduleEntry, ScheduleEntry, ScheduleRule,
        UpdateScheduleEntry,
    },
};
use tracing::{info, warn};

use crate::DuckDbBackend;

/// Text format used to bind `TIMESTAMP` parameters (naive UTC).
const TIMESTAMP_BIND_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

const SELECT_ENTRY_COLUMNS: &str = r#"
    SELECT
        id,
        name,
        is_active,
        send_time,
        timezone,
        frequency,
        CAST(next_run_at AS VARCHAR),
        status,
        CAST(claimed_at AS VARCHAR),
        CAST(last_sent_at AS VARCHAR)
    FROM email_services
"#;

fn random_alnum(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..36);
            if idx < 10 {
                (b'0' + idx) as char
            } else {
                (b'a' + idx - 10) as char
            }
        })
        .collect()
}

fn generate_entry_id() -> String {
    format!("svc_{}", random_alnum(21))
}

pub(crate) fn to_db_timestamp(at: DateTime<Utc>) -> String {
    at.naive_utc().format(TIMESTAMP_BIND_FORMAT).to_string()
}

/// Parse DuckDB's `CAST(ts AS VARCHAR)` output, which omits the fractional
/// part when it is zero.
pub(crate) fn from_db_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S"))
        .map(|naive| naive.and_utc())
        .map_err(|e| anyhow!("invalid timestamp {raw}: {e}"))
}

fn conversion_error(column: usize, message: String) -> duckdb::Error {
    duckdb::Error::FromSqlConversionFailure(
        column,
        duckdb::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            message,
        )),
    )
}

fn optional_timestamp(
    row: &duckdb::Row<'_>,
    column: usize,
) -> Result<Option<DateTime<Utc>>, duckdb::Error> {
    let raw: Option<String> = row.get(column)?;
    raw.map(|value| {
        from_db_timestamp(&value).map_err(|e| conversion_error(column, e.to_string()))
    })
    .transpose()
}

pub(crate) fn map_entry_row(row: &duckdb::Row<'_>) -> Result<ScheduleEntry, duckdb::Error> {
    let status_raw: String = row.get(7)?;
    let status = status_raw
        .parse::<EntryStatus>()
        .map_err(|e| conversion_error(7, e))?;
    Ok(ScheduleEntry {
        id: row.get(0)?,
        name: row.get(1)?,
        is_active: row.get(2)?,
        send_time: row.get(3)?,
        timezone: row.get(4)?,
        frequency: row.get(5)?,
        next_run_at: optional_timestamp(row, 6)?,
        status,
        claimed_at: optional_timestamp(row, 8)?,
        last_sent_at: optional_timestamp(row, 9)?,
    })
}

impl DuckDbBackend {
    pub async fn list_active_entries(&self) -> Result<Vec<ScheduleEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "{SELECT_ENTRY_COLUMNS} WHERE is_active = TRUE ORDER BY id"
        ))?;
        let mut out = Vec::new();
        for row in stmt.query_map([], map_entry_row)? {
            out.push(row?);
        }
        Ok(out)
    }

    pub async fn get_entry(&self, id: &str) -> Result<Option<ScheduleEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!("{SELECT_ENTRY_COLUMNS} WHERE id = ?1"))?;
        let mut rows = stmt.query_map(duckdb::params![id], map_entry_row)?;
        Ok(rows.next().transpose()?)
    }

    /// Insert a new entry and compute its first due time from `now`.
    ///
    /// The rule is validated up front so a misconfigured entry never reaches
    /// the table.
    pub async fn create_entry(
        &self,
        req: NewScheduleEntry,
        now: DateTime<Utc>,
        policy: &CalendarPolicy,
    ) -> Result<ScheduleEntry> {
        let rule = ScheduleRule::parse(&req.frequency, &req.send_time, &req.timezone, policy)?;
        let id = generate_entry_id();
        let next_run_at = req
            .is_active
            .then(|| to_db_timestamp(calculate_next_run(&rule, now)));
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO email_services (
                id, name, is_active, send_time, timezone, frequency, next_run_at, status, created_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, CAST(?7 AS TIMESTAMP), 'PENDING', CURRENT_TIMESTAMP
            )
            "#,
            duckdb::params![
                id,
                req.name,
                req.is_active,
                req.send_time.trim(),
                req.timezone.trim(),
                req.frequency.trim().to_ascii_lowercase(),
                next_run_at,
            ],
        )?;
        drop(conn);
        info!(entry_id = %id, "schedule entry created");
        self.get_entry(&id)
            .await?
            .ok_or_else(|| anyhow!("entry not found after create"))
    }

    /// Apply a partial update.
    ///
    /// When the rule or active flag changes, the due time is recomputed from
    /// `now` (or cleared for inactive entries) and any claim is dropped.
    pub async fn update_entry(
        &self,
        id: &str,
        req: UpdateScheduleEntry,
        now: DateTime<Utc>,
        policy: &CalendarPolicy,
    ) -> Result<Option<ScheduleEntry>> {
        let Some(existing) = self.get_entry(id).await? else {
            return Ok(None);
        };
        let reschedule = req.touches_schedule();
        let name = req.name.unwrap_or(existing.name);
        let send_time = req.send_time.unwrap_or(existing.send_time);
        let timezone = req.timezone.unwrap_or(existing.timezone);
        let frequency = req
            .frequency
            .map(|f| f.trim().to_ascii_lowercase())
            .unwrap_or(existing.frequency);
        let is_active = req.is_active.unwrap_or(existing.is_active);
        let rule = ScheduleRule::parse(&frequency, &send_time, &timezone, policy)?;

        let next_run_at = if !reschedule {
            existing.next_run_at.map(to_db_timestamp)
        } else if is_active {
            Some(to_db_timestamp(calculate_next_run(&rule, now)))
        } else {
            None
        };
        let (status, claimed_at) = if reschedule {
            (EntryStatus::Pending, None)
        } else {
            (existing.status, existing.claimed_at.map(to_db_timestamp))
        };

        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            UPDATE email_services
            SET name = ?1,
                send_time = ?2,
                timezone = ?3,
                frequency = ?4,
                is_active = ?5,
                next_run_at = CAST(?6 AS TIMESTAMP),
                status = ?7,
                claimed_at = CAST(?8 AS TIMESTAMP)
            WHERE id = ?9
            "#,
            duckdb::params![
                name,
                send_time.trim(),
                timezone.trim(),
                frequency,
                is_active,
                next_run_at,
                status.as_str(),
                claimed_at,
                id,
            ],
        )?;
        drop(conn);
        self.get_entry(id).await
    }

    pub async fn set_active(
        &self,
        id: &str,
        is_active: bool,
        now: DateTime<Utc>,
        policy: &CalendarPolicy,
    ) -> Result<bool> {
        let updated = self
            .update_entry(
                id,
                UpdateScheduleEntry {
                    is_active: Some(is_active),
                    ..UpdateScheduleEntry::default()
                },
                now,
                policy,
            )
            .await?;
        Ok(updated.is_some())
    }

    pub async fn delete_entry(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let rows = conn.execute(
            "DELETE FROM email_services WHERE id = ?1",
            duckdb::params![id],
        )?;
        Ok(rows > 0)
    }

    /// Record a successful send. Called by the email job, not the scheduler.
    pub async fn record_sent(&self, id: &str, sent_at: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn.lock().await;
        let rows = conn.execute(
            "UPDATE email_services SET last_sent_at = CAST(?1 AS TIMESTAMP) WHERE id = ?2",
            duckdb::params![to_db_timestamp(sent_at), id],
        )?;
        Ok(rows > 0)
    }

    /// Overwrite the due time directly, leaving status untouched.
    ///
    /// Used for manual time changes and to force entries due in tests.
    pub async fn set_next_run_at(&self, id: &str, next_run_at: Option<DateTime<Utc>>) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE email_services SET next_run_at = CAST(?1 AS TIMESTAMP) WHERE id = ?2",
            duckdb::params![next_run_at.map(to_db_timestamp), id],
        )?;
        Ok(())
    }

    pub async fn mark_entry_claimed(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn.lock().await;
        let rows = conn.execute(
            r#"
            UPDATE email_services
            SET status = 'CLAIMED',
                claimed_at = CAST(?1 AS TIMESTAMP)
            WHERE id = ?2
            "#,
            duckdb::params![to_db_timestamp(at), id],
        )?;
        Ok(rows > 0)
    }

    /// Write a recomputed due time on an active row. Returns `false` when the
    /// row is missing or inactive.
    pub async fn save_entry_next_run(
        &self,
        id: &str,
        next_run_at: DateTime<Utc>,
        status: EntryStatus,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;
        let rows = conn.execute(
            r#"
            UPDATE email_services
            SET next_run_at = CAST(?1 AS TIMESTAMP),
                status = ?2,
                claimed_at = NULL
            WHERE id = ?3 AND is_active = TRUE
            "#,
            duckdb::params![to_db_timestamp(next_run_at), status.as_str(), id],
        )?;
        Ok(rows > 0)
    }

    /// Give every active entry without a due time its first `next_run_at`.
    ///
    /// Runs under a single connection lock; the `next_run_at IS NULL` guard on
    /// the UPDATE keeps a concurrent edit from being overwritten.
    pub async fn initialize_missing_entries(
        &self,
        now: DateTime<Utc>,
        policy: &CalendarPolicy,
    ) -> Result<usize> {
        let conn = self.conn.lock().await;
        let pending: Vec<ScheduleEntry> = {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_ENTRY_COLUMNS} WHERE is_active = TRUE AND next_run_at IS NULL"
            ))?;
            let mut out = Vec::new();
            for row in stmt.query_map([], map_entry_row)? {
                out.push(row?);
            }
            out
        };

        let mut initialized = 0usize;
        for entry in pending {
            let rule = match entry.rule(policy) {
                Ok(rule) => rule,
                Err(e) => {
                    warn!(entry_id = %entry.id, error = %e, "cannot initialise schedule entry");
                    continue;
                }
            };
            let next = calculate_next_run(&rule, now);
            initialized += conn.execute(
                r#"
                UPDATE email_services
                SET next_run_at = CAST(?1 AS TIMESTAMP),
                    status = 'PENDING',
                    claimed_at = NULL
                WHERE id = ?2 AND next_run_at IS NULL
                "#,
                duckdb::params![to_db_timestamp(next), entry.id],
            )?;
        }
        if initialized > 0 {
            info!(count = initialized, "initialised missing schedule entries");
        }
        Ok(initialized)
    }
}
