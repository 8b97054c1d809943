use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use verdict_db::models::{Job, JobStatus, JobSummary, JobView};
use verdict_db::queries::texts::content_hash;

use super::{Finalization, JobStore, NewJob};

const PREVIEW_CHARS: usize = 50;

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<String, JobView>,
    /// Content hash to text ID, mirroring the `texts` table's dedupe.
    texts: HashMap<String, Uuid>,
}

/// In-process [`JobStore`]. Records are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    inner: RwLock<Inner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, new: &NewJob) -> Result<Option<Job>> {
        let mut inner = self.inner.write().await;
        if inner.jobs.contains_key(&new.id) {
            return Ok(None);
        }

        let text_id = *inner
            .texts
            .entry(content_hash(&new.content))
            .or_insert_with(Uuid::new_v4);
        let now = Utc::now();
        let job = Job {
            id: new.id.clone(),
            status: JobStatus::Pending,
            result: None,
            error: None,
            text_id,
            owner_id: new.owner_id.clone(),
            title: new.title.clone(),
            is_public: false,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        inner.jobs.insert(
            new.id.clone(),
            JobView {
                job: job.clone(),
                content: new.content.clone(),
            },
        );
        Ok(Some(job))
    }

    async fn get(&self, id: &str) -> Result<Option<Job>> {
        Ok(self.inner.read().await.jobs.get(id).map(|v| v.job.clone()))
    }

    async fn get_view(&self, id: &str) -> Result<Option<JobView>> {
        Ok(self.inner.read().await.jobs.get(id).cloned())
    }

    async fn mark_running(&self, id: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        match inner.jobs.get_mut(id) {
            Some(view) if view.job.status == JobStatus::Pending => {
                view.job.status = JobStatus::Running;
                view.job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finalize(&self, id: &str, outcome: &Finalization) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let Some(view) = inner.jobs.get_mut(id) else {
            return Ok(false);
        };
        if view.job.status.is_terminal() {
            return Ok(false);
        }
        let now = Utc::now();
        view.job.status = outcome.status();
        view.job.result = outcome.result();
        view.job.error = outcome.error().map(str::to_owned);
        view.job.completed_at = Some(now);
        view.job.updated_at = now;
        Ok(true)
    }

    async fn list(&self, owner_id: Option<&str>) -> Result<Vec<JobSummary>> {
        let inner = self.inner.read().await;
        let mut summaries: Vec<JobSummary> = inner
            .jobs
            .values()
            .filter(|v| owner_id.is_none() || v.job.owner_id.as_deref() == owner_id)
            .map(|v| JobSummary {
                id: v.job.id.clone(),
                title: v.job.title.clone(),
                status: v.job.status,
                created_at: v.job.created_at,
                updated_at: v.job.updated_at,
                completed_at: v.job.completed_at,
                text_preview: Some(v.content.chars().take(PREVIEW_CHARS).collect()),
            })
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        Ok(summaries)
    }

    async fn set_public(&self, id: &str, is_public: bool) -> Result<bool> {
        let mut inner = self.inner.write().await;
        match inner.jobs.get_mut(id) {
            Some(view) => {
                view.job.is_public = is_public;
                view.job.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
