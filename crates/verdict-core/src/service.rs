//! Check service: the operations behind the HTTP and CLI surfaces.

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use verdict_db::models::{Job, JobStatus, JobSummary, JobView};

use crate::event::{Cursor, Event, metadata_payload};
use crate::log::EventLog;
use crate::relay::{RelayOutcome, StreamRelay};
use crate::runner::AgentRunner;
use crate::store::{JobStore, NewJob};
use crate::tail::{TailConfig, TailReader};

/// A consumer's stream of events for one check.
pub type EventStream = Pin<Box<dyn Stream<Item = Event> + Send>>;

/// Longest accepted check ID, in characters.
pub const MAX_CHECK_ID_CHARS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Longest accepted submission, in characters after trimming.
    pub max_input_chars: usize,
    pub tail: TailConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_input_chars: 5000,
            tail: TailConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRequest {
    pub check_id: String,
    pub content: String,
    /// Caller identity as reported by the gateway.
    pub owner_id: Option<String>,
}

/// A job whose relay is running in the background.
#[derive(Debug)]
pub struct SubmittedJob {
    pub check_id: String,
    pub relay: JoinHandle<Option<RelayOutcome>>,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("{0}")]
    Invalid(String),
    #[error("check {0} already exists")]
    Conflict(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    #[error("check not found")]
    NotFound,
    #[error("check is not accessible")]
    Forbidden,
    #[error("check is not completed")]
    NotCompleted,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// A publicly shared check.
#[derive(Debug, Clone, Serialize)]
pub struct PublicCheck {
    pub check: JobView,
    pub metadata: Value,
}

/// Whether a finished job has results worth sharing.
fn is_shareable(status: JobStatus) -> bool {
    matches!(status, JobStatus::Completed | JobStatus::NoClaims)
}

/// Submission, streaming and record access over one log, store and runner.
#[derive(Clone)]
pub struct CheckService {
    log: Arc<dyn EventLog>,
    store: Arc<dyn JobStore>,
    relay: StreamRelay,
    tail: TailReader,
    config: ServiceConfig,
}

impl std::fmt::Debug for CheckService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckService")
            .field("relay", &self.relay)
            .field("config", &self.config)
            .finish()
    }
}

impl CheckService {
    pub fn new(
        log: Arc<dyn EventLog>,
        store: Arc<dyn JobStore>,
        runner: Arc<dyn AgentRunner>,
        config: ServiceConfig,
    ) -> Self {
        let relay = StreamRelay::new(Arc::clone(&log), Arc::clone(&store), runner);
        let tail = TailReader::new(Arc::clone(&log), Arc::clone(&store), config.tail);
        Self {
            log,
            store,
            relay,
            tail,
            config,
        }
    }

    fn validate(&self, req: &SubmitRequest) -> Result<NewJob, SubmitError> {
        let content = req.content.trim();
        if content.is_empty() {
            return Err(SubmitError::Invalid("content must not be empty".into()));
        }
        if content.chars().count() > self.config.max_input_chars {
            return Err(SubmitError::Invalid(format!(
                "content must be at most {} characters",
                self.config.max_input_chars
            )));
        }
        let check_id = req.check_id.trim();
        if check_id.is_empty() || check_id.chars().count() > MAX_CHECK_ID_CHARS {
            return Err(SubmitError::Invalid(format!(
                "checkId must be 1 to {MAX_CHECK_ID_CHARS} characters"
            )));
        }
        Ok(NewJob {
            id: check_id.to_owned(),
            content: content.to_owned(),
            owner_id: req.owner_id.clone(),
            title: None,
        })
    }

    /// Validate and record a submission, then relay it in the background.
    ///
    /// Returns once the job's log exists, so a stream opened right after
    /// this call finds it.
    pub async fn submit(&self, req: SubmitRequest) -> Result<SubmittedJob, SubmitError> {
        let new = self.validate(&req)?;

        if self.store.create(&new).await?.is_none() {
            return Err(SubmitError::Conflict(new.id));
        }
        info!(job_id = %new.id, owner_id = ?new.owner_id, "check submitted");

        let run = self.relay.start(&new).await?;
        let relay = tokio::spawn(async move {
            let job_id = run.job_id().to_owned();
            match run.finish().await {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    error!(job_id = %job_id, error = %e, "relay failed");
                    None
                }
            }
        });

        Ok(SubmittedJob {
            check_id: new.id,
            relay,
        })
    }

    /// Open a consumer stream, or `None` when the job is unknown and has no
    /// live log.
    pub async fn open_stream(
        &self,
        check_id: &str,
        cursor: Cursor,
        cancel: CancellationToken,
    ) -> anyhow::Result<Option<EventStream>> {
        let terminal = self
            .store
            .get(check_id)
            .await?
            .is_some_and(|job| job.status.is_terminal());

        if terminal || self.log.exists(check_id).await? {
            Ok(Some(Box::pin(
                self.tail.stream(check_id.to_owned(), cursor, cancel),
            )))
        } else {
            Ok(None)
        }
    }

    pub async fn status(&self, check_id: &str) -> anyhow::Result<Option<Job>> {
        self.store.get(check_id).await
    }

    pub async fn list(&self, owner_id: Option<&str>) -> anyhow::Result<Vec<JobSummary>> {
        self.store.list(owner_id).await
    }

    /// Share or unshare a finished check. Only its owner may do this; a
    /// check without an owner may be changed by anyone.
    pub async fn set_visibility(
        &self,
        check_id: &str,
        caller: Option<&str>,
        is_public: bool,
    ) -> Result<Job, AccessError> {
        let job = self.store.get(check_id).await?.ok_or(AccessError::NotFound)?;
        if job.owner_id.is_some() && job.owner_id.as_deref() != caller {
            return Err(AccessError::Forbidden);
        }
        if !is_shareable(job.status) {
            return Err(AccessError::NotCompleted);
        }
        if !self.store.set_public(check_id, is_public).await? {
            return Err(AccessError::NotFound);
        }
        info!(job_id = %check_id, is_public, "check visibility changed");
        self.store.get(check_id).await?.ok_or(AccessError::NotFound)
    }

    /// A check as shown to anyone holding its link.
    pub async fn public_view(&self, check_id: &str) -> Result<PublicCheck, AccessError> {
        let view = self
            .store
            .get_view(check_id)
            .await?
            .ok_or(AccessError::NotFound)?;
        if !view.job.is_public {
            return Err(AccessError::Forbidden);
        }
        if !is_shareable(view.job.status) {
            return Err(AccessError::NotCompleted);
        }
        let metadata = metadata_payload(&view);
        Ok(PublicCheck {
            check: view,
            metadata,
        })
    }

    /// Drop expired event logs.
    pub async fn purge_expired(&self) -> anyhow::Result<u64> {
        self.log.purge_expired().await
    }
}
