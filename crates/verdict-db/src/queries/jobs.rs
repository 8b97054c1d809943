//! Database query functions for the `jobs` table.

use anyhow::{Context, Result, bail};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Job, JobStatus, JobSummary, JobView};

/// Parameters for inserting a new job row.
#[derive(Debug, Clone)]
pub struct NewJob<'a> {
    pub id: &'a str,
    pub text_id: Uuid,
    pub owner_id: Option<&'a str>,
    pub title: Option<&'a str>,
}

/// Insert a new `pending` job. Returns `None` if the ID is already taken.
pub async fn insert_job(pool: &PgPool, new: &NewJob<'_>) -> Result<Option<Job>> {
    let job = sqlx::query_as::<_, Job>(
        "INSERT INTO jobs (id, text_id, owner_id, title) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT (id) DO NOTHING \
         RETURNING *",
    )
    .bind(new.id)
    .bind(new.text_id)
    .bind(new.owner_id)
    .bind(new.title)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("failed to insert job {}", new.id))?;

    Ok(job)
}

/// Fetch a single job by ID.
pub async fn get_job(pool: &PgPool, id: &str) -> Result<Option<Job>> {
    let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("failed to fetch job {id}"))?;

    Ok(job)
}

/// Fetch a job together with its submitted content.
pub async fn get_job_view(pool: &PgPool, id: &str) -> Result<Option<JobView>> {
    let view = sqlx::query_as::<_, JobView>(
        "SELECT j.*, t.content \
         FROM jobs j \
         JOIN texts t ON t.id = j.text_id \
         WHERE j.id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("failed to fetch job view {id}"))?;

    Ok(view)
}

/// List jobs, most recently updated first. When `owner_id` is `Some`, only
/// that owner's jobs are returned.
pub async fn list_jobs(pool: &PgPool, owner_id: Option<&str>) -> Result<Vec<JobSummary>> {
    let jobs = sqlx::query_as::<_, JobSummary>(
        "SELECT j.id, j.title, j.status, j.created_at, j.updated_at, j.completed_at, \
                substring(t.content FROM 1 FOR 50) AS text_preview \
         FROM jobs j \
         LEFT JOIN texts t ON t.id = j.text_id \
         WHERE $1::text IS NULL OR j.owner_id = $1 \
         ORDER BY j.updated_at DESC",
    )
    .bind(owner_id)
    .fetch_all(pool)
    .await
    .context("failed to list jobs")?;

    Ok(jobs)
}

/// Transition `pending -> running`. Returns `false` when the job is missing
/// or not pending.
pub async fn mark_running(pool: &PgPool, id: &str) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE jobs SET status = 'running', updated_at = now() \
         WHERE id = $1 AND status = 'pending'",
    )
    .bind(id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to mark job {id} running"))?;

    Ok(result.rows_affected() == 1)
}

/// Move a job into a terminal status, setting its result or error and
/// `completed_at`.
///
/// The update only applies to non-terminal rows, so a second finalize of
/// the same job is a no-op. Returns whether this call performed the
/// transition.
pub async fn finalize_job(
    pool: &PgPool,
    id: &str,
    status: JobStatus,
    result: Option<&Value>,
    error: Option<&str>,
) -> Result<bool> {
    if !status.is_terminal() {
        bail!("cannot finalize job {id} with non-terminal status {status}");
    }

    let rows = sqlx::query(
        "UPDATE jobs \
         SET status = $2, result = $3, error = $4, completed_at = now(), updated_at = now() \
         WHERE id = $1 AND status NOT IN ('completed', 'failed', 'no_claims')",
    )
    .bind(id)
    .bind(status)
    .bind(result)
    .bind(error)
    .execute(pool)
    .await
    .with_context(|| format!("failed to finalize job {id} as {status}"))?;

    Ok(rows.rows_affected() == 1)
}

/// Set the public-visibility flag. Returns `false` if the job does not exist.
pub async fn set_public(pool: &PgPool, id: &str, is_public: bool) -> Result<bool> {
    let result = sqlx::query("UPDATE jobs SET is_public = $2, updated_at = now() WHERE id = $1")
        .bind(id)
        .bind(is_public)
        .execute(pool)
        .await
        .with_context(|| format!("failed to update visibility of job {id}"))?;

    Ok(result.rows_affected() == 1)
}
