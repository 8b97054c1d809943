//! Database query functions for the `job_event_logs` and `job_events` tables.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::PgPool;

use crate::models::JobEventRow;

/// `LISTEN`/`NOTIFY` channel that carries `<job_id>:<seq>` for every append.
pub const EVENTS_CHANNEL: &str = "job_events";

/// Retention policy applied on every append.
#[derive(Debug, Clone, Copy)]
pub struct Retention {
    /// Idle expiry, measured from the latest append.
    pub ttl_secs: f64,
    /// Number of newest events kept per job.
    pub max_events: i64,
}

/// Append one event to a job's log and return the stored row.
///
/// Runs in a single transaction: an expired header is dropped first (its
/// events go with it through the cascade), then the header's `last_seq`
/// is bumped under its row lock, the event is inserted, everything older
/// than the newest `max_events` is trimmed, and a notification is queued
/// on [`EVENTS_CHANNEL`]. The notification is delivered on commit.
pub async fn append_event(
    pool: &PgPool,
    job_id: &str,
    kind: &str,
    payload: &Value,
    retention: Retention,
) -> Result<JobEventRow> {
    let mut tx = pool
        .begin()
        .await
        .context("failed to begin event append transaction")?;

    sqlx::query("DELETE FROM job_event_logs WHERE job_id = $1 AND expires_at <= now()")
        .bind(job_id)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("failed to drop expired log for job {job_id}"))?;

    let seq: i64 = sqlx::query_scalar(
        "INSERT INTO job_event_logs (job_id, last_seq, expires_at) \
         VALUES ($1, 1, now() + make_interval(secs => $2)) \
         ON CONFLICT (job_id) DO UPDATE \
         SET last_seq = job_event_logs.last_seq + 1, expires_at = EXCLUDED.expires_at \
         RETURNING last_seq",
    )
    .bind(job_id)
    .bind(retention.ttl_secs)
    .fetch_one(&mut *tx)
    .await
    .with_context(|| format!("failed to allocate event seq for job {job_id}"))?;

    let row = sqlx::query_as::<_, JobEventRow>(
        "INSERT INTO job_events (job_id, seq, kind, payload) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(job_id)
    .bind(seq)
    .bind(kind)
    .bind(payload)
    .fetch_one(&mut *tx)
    .await
    .with_context(|| format!("failed to insert event {seq} ({kind}) for job {job_id}"))?;

    sqlx::query("DELETE FROM job_events WHERE job_id = $1 AND seq <= $2")
        .bind(job_id)
        .bind(seq - retention.max_events)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("failed to trim event log for job {job_id}"))?;

    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(EVENTS_CHANNEL)
        .bind(format!("{job_id}:{seq}"))
        .execute(&mut *tx)
        .await
        .with_context(|| format!("failed to notify event {seq} for job {job_id}"))?;

    tx.commit()
        .await
        .with_context(|| format!("failed to commit event {seq} for job {job_id}"))?;

    Ok(row)
}

/// Retained events of a job's live log, oldest first. Empty when the log
/// does not exist or has expired.
pub async fn list_events(pool: &PgPool, job_id: &str) -> Result<Vec<JobEventRow>> {
    let events = sqlx::query_as::<_, JobEventRow>(
        "SELECT e.* FROM job_events e \
         JOIN job_event_logs l ON l.job_id = e.job_id \
         WHERE e.job_id = $1 AND l.expires_at > now() \
         ORDER BY e.seq ASC",
    )
    .bind(job_id)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to list events for job {job_id}"))?;

    Ok(events)
}

/// Whether the job has a live (non-expired) log.
pub async fn log_exists(pool: &PgPool, job_id: &str) -> Result<bool> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM job_event_logs WHERE job_id = $1 AND expires_at > now())",
    )
    .bind(job_id)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to check event log for job {job_id}"))?;

    Ok(exists)
}

/// Delete every expired log and its events. Returns the number of logs
/// removed.
pub async fn purge_expired_logs(pool: &PgPool) -> Result<u64> {
    let result = sqlx::query("DELETE FROM job_event_logs WHERE expires_at <= now()")
        .execute(pool)
        .await
        .context("failed to purge expired event logs")?;

    Ok(result.rows_affected())
}

/// Split a `<job_id>:<seq>` notification payload. Job IDs may themselves
/// contain colons, so the split is on the last one.
pub fn parse_notification(payload: &str) -> Option<(&str, i64)> {
    let (job_id, seq) = payload.rsplit_once(':')?;
    let seq = seq.parse().ok()?;
    Some((job_id, seq))
}
