//! Canonical event vocabulary shared by the relay, the log and the tail
//! reader.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use verdict_db::models::{JobEventRow, JobView};

// ---------------------------------------------------------------------------
// Event kinds
// ---------------------------------------------------------------------------

/// Kind of a job event.
///
/// `start` and `connected` are bookkeeping kinds that live in the log but
/// are never forwarded to consumers. `complete` and `error` end a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Start,
    Connected,
    Metadata,
    Sentences,
    Claims,
    Verdicts,
    NoClaims,
    Error,
    Complete,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Connected => "connected",
            Self::Metadata => "metadata",
            Self::Sentences => "sentences",
            Self::Claims => "claims",
            Self::Verdicts => "verdicts",
            Self::NoClaims => "no-claims",
            Self::Error => "error",
            Self::Complete => "complete",
        }
    }

    /// Whether this kind ends a job's stream.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }

    /// Whether consumers ever see this kind.
    pub fn is_client_relevant(self) -> bool {
        !matches!(self, Self::Start | Self::Connected)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = EventKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Self::Start),
            "connected" => Ok(Self::Connected),
            "metadata" => Ok(Self::Metadata),
            "sentences" => Ok(Self::Sentences),
            "claims" => Ok(Self::Claims),
            "verdicts" => Ok(Self::Verdicts),
            "no-claims" => Ok(Self::NoClaims),
            "error" => Ok(Self::Error),
            "complete" => Ok(Self::Complete),
            other => Err(EventKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`EventKind`] string.
#[derive(Debug, Clone)]
pub struct EventKindParseError(pub String);

impl fmt::Display for EventKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid event kind: {:?}", self.0)
    }
}

impl std::error::Error for EventKindParseError {}

// ---------------------------------------------------------------------------
// Events and cursors
// ---------------------------------------------------------------------------

/// One entry of a job's event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Position in the job's log. `0` for events synthesized from the job
    /// record, which carry no resumable position.
    pub seq: i64,
    pub kind: EventKind,
    pub payload: Value,
    pub produced_at: DateTime<Utc>,
}

impl Event {
    /// An event that did not come from the log.
    pub fn synthesized(kind: EventKind, payload: Value) -> Self {
        Self {
            seq: 0,
            kind,
            payload,
            produced_at: Utc::now(),
        }
    }

    /// Whether this event came from the log and can be resumed after.
    pub fn is_resumable(&self) -> bool {
        self.seq > 0
    }
}

impl TryFrom<JobEventRow> for Event {
    type Error = EventKindParseError;

    fn try_from(row: JobEventRow) -> Result<Self, Self::Error> {
        Ok(Self {
            seq: row.seq,
            kind: row.kind.parse()?,
            payload: row.payload,
            produced_at: row.produced_at,
        })
    }
}

/// A consumer's position in a job's stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Cursor {
    /// Before the first event.
    #[default]
    Start,
    /// After the event with this `seq`.
    After(i64),
}

impl Cursor {
    /// Parse a wire cursor (an SSE `Last-Event-ID` or `?cursor=` value).
    /// Anything that is not a positive integer means "from the start".
    pub fn parse(raw: &str) -> Self {
        match raw.trim().parse::<i64>() {
            Ok(seq) if seq > 0 => Self::After(seq),
            _ => Self::Start,
        }
    }
}

// ---------------------------------------------------------------------------
// Claims
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimStatus {
    Pending,
    Verified,
}

/// Outcome of verifying one claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationResult {
    Supported,
    Refuted,
}

/// A piece of evidence cited for a verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimSource {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_influential: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimData {
    pub text: String,
    pub status: ClaimStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<VerificationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<ClaimSource>>,
}

impl ClaimData {
    pub fn pending(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            status: ClaimStatus::Pending,
            result: None,
            reasoning: None,
            sources: None,
        }
    }
}

/// Claims grouped under the sentence they were extracted from, in
/// first-seen sentence order. Serializes as `[[sentence, [claim, ...]], ...]`.
pub type ClaimGroups = Vec<(String, Vec<ClaimData>)>;

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// `run_id` values carried by `error` events, naming where the failure
/// came from.
pub mod run_id {
    pub const AGENT_ERROR: &str = "agent-error";
    pub const SERVER_ERROR: &str = "server-error";
    pub const STORED_RESULT: &str = "stored-result";
    pub const STREAM_EXPIRED: &str = "stream-expired";
}

pub const NO_CLAIMS_MESSAGE: &str = "No factual claims found in the provided text";
pub const CONNECTION_MESSAGE: &str = "Connection established";

pub fn start_payload(job_id: &str) -> Value {
    json!({ "streamId": job_id, "timestamp": Utc::now() })
}

pub fn connected_payload(job_id: &str) -> Value {
    json!({ "message": CONNECTION_MESSAGE, "streamId": job_id })
}

/// `{user, text, title, isPublic, createdAt}` for a job.
pub fn metadata_payload(view: &JobView) -> Value {
    let user = view.job.owner_id.as_ref().map(|id| json!({ "id": id }));
    json!({
        "user": user,
        "text": view.content,
        "title": view.job.title,
        "isPublic": view.job.is_public,
        "createdAt": view.job.created_at,
    })
}

pub fn claims_payload(groups: &ClaimGroups) -> Value {
    json!({ "claims": groups })
}

pub fn no_claims_payload() -> Value {
    json!({ "message": NO_CLAIMS_MESSAGE })
}

pub fn error_payload(message: &str, run_id: &str) -> Value {
    json!({ "message": message, "run_id": run_id })
}

pub fn complete_payload() -> Value {
    json!({ "completed": true })
}
