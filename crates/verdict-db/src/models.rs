use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle status of a verification job.
///
/// `pending -> running -> {completed, failed, no_claims}`. The last three
/// are terminal: once a job reaches one of them its status and result never
/// change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    NoClaims,
}

impl JobStatus {
    /// All statuses a job can never leave.
    pub const TERMINAL: [JobStatus; 3] = [Self::Completed, Self::Failed, Self::NoClaims];

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::NoClaims => "no_claims",
        };
        f.write_str(s)
    }
}

impl FromStr for JobStatus {
    type Err = JobStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "no_claims" => Ok(Self::NoClaims),
            other => Err(JobStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`JobStatus`] string.
#[derive(Debug, Clone)]
pub struct JobStatusParseError(pub String);

impl fmt::Display for JobStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid job status: {:?}", self.0)
    }
}

impl std::error::Error for JobStatusParseError {}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// A deduplicated submission text.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Text {
    pub id: Uuid,
    pub hash: String,
    pub content: String,
    pub word_count: i32,
    pub created_at: DateTime<Utc>,
}

/// The permanent record of one verification job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Job {
    /// Externally supplied check ID.
    pub id: String,
    pub status: JobStatus,
    /// Final `[[sentence, [claim, ...]], ...]` payload. Set for `completed`
    /// and `no_claims` (where it is an empty array).
    pub result: Option<serde_json::Value>,
    /// Failure message. Set only for `failed`.
    pub error: Option<String>,
    pub text_id: Uuid,
    pub owner_id: Option<String>,
    pub title: Option<String>,
    pub is_public: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A job joined with the content it was submitted with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct JobView {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub job: Job,
    pub content: String,
}

/// One line of a job listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct JobSummary {
    pub id: String,
    pub title: Option<String>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// First 50 characters of the submitted text.
    pub text_preview: Option<String>,
}

/// A retained event of a live job event log.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct JobEventRow {
    pub job_id: String,
    pub seq: i64,
    pub kind: String,
    pub payload: serde_json::Value,
    pub produced_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
