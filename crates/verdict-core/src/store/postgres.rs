use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgPool;

use verdict_db::models::{Job, JobSummary, JobView};
use verdict_db::queries::{jobs, texts};

use super::{Finalization, JobStore, NewJob};

/// [`JobStore`] over the `jobs` and `texts` tables.
#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, new: &NewJob) -> Result<Option<Job>> {
        let text = texts::find_or_create_text(&self.pool, &new.content).await?;
        jobs::insert_job(
            &self.pool,
            &jobs::NewJob {
                id: &new.id,
                text_id: text.id,
                owner_id: new.owner_id.as_deref(),
                title: new.title.as_deref(),
            },
        )
        .await
    }

    async fn get(&self, id: &str) -> Result<Option<Job>> {
        jobs::get_job(&self.pool, id).await
    }

    async fn get_view(&self, id: &str) -> Result<Option<JobView>> {
        jobs::get_job_view(&self.pool, id).await
    }

    async fn mark_running(&self, id: &str) -> Result<bool> {
        jobs::mark_running(&self.pool, id).await
    }

    async fn finalize(&self, id: &str, outcome: &Finalization) -> Result<bool> {
        let result = outcome.result();
        jobs::finalize_job(
            &self.pool,
            id,
            outcome.status(),
            result.as_ref(),
            outcome.error(),
        )
        .await
    }

    async fn list(&self, owner_id: Option<&str>) -> Result<Vec<JobSummary>> {
        jobs::list_jobs(&self.pool, owner_id).await
    }

    async fn set_public(&self, id: &str, is_public: bool) -> Result<bool> {
        jobs::set_public(&self.pool, id, is_public).await
    }
}
