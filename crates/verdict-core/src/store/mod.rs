//! Permanent job records.
//!
//! The record outlives the event log: once a job is finalized its status,
//! result and error never change, and readers that arrive after the log
//! has expired are served from here.

mod memory;
mod postgres;

pub use memory::MemoryJobStore;
pub use postgres::PgJobStore;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};

use verdict_db::models::{Job, JobStatus, JobSummary, JobView};

/// A job to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub id: String,
    pub content: String,
    pub owner_id: Option<String>,
    pub title: Option<String>,
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Finalization {
    Completed { result: Value },
    NoClaims,
    Failed { message: String },
}

impl Finalization {
    pub fn status(&self) -> JobStatus {
        match self {
            Self::Completed { .. } => JobStatus::Completed,
            Self::NoClaims => JobStatus::NoClaims,
            Self::Failed { .. } => JobStatus::Failed,
        }
    }

    /// The value stored in the record's `result` column.
    pub fn result(&self) -> Option<Value> {
        match self {
            Self::Completed { result } => Some(result.clone()),
            Self::NoClaims => Some(json!([])),
            Self::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Failed { message } => Some(message),
            _ => None,
        }
    }
}

/// Storage for job records.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a `pending` job, storing its text. Returns `None` when the ID
    /// is already taken.
    async fn create(&self, new: &NewJob) -> Result<Option<Job>>;

    async fn get(&self, id: &str) -> Result<Option<Job>>;

    /// The job together with its content.
    async fn get_view(&self, id: &str) -> Result<Option<JobView>>;

    /// `pending -> running`. Returns whether the transition happened.
    async fn mark_running(&self, id: &str) -> Result<bool>;

    /// Move the job to its terminal status. Only the first call for a job
    /// has any effect; it returns `true`, later calls return `false`.
    async fn finalize(&self, id: &str, outcome: &Finalization) -> Result<bool>;

    /// Jobs of one owner (all jobs for `None`), most recently updated first.
    async fn list(&self, owner_id: Option<&str>) -> Result<Vec<JobSummary>>;

    /// Returns `false` when the job does not exist.
    async fn set_public(&self, id: &str, is_public: bool) -> Result<bool>;
}

// Compile-time assertion: JobStore must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn JobStore) {}
};
