//! Stream relay: drives one job from agent start to a finalized record.
//!
//! ```text
//! Initializing -> Running -> Finalizing -> Done
//! ```
//!
//! Initializing makes sure the record exists and is `running`, then opens
//! the log with `start`, `connected` and `metadata`. Running appends every
//! normalized agent event. Finalizing writes the permanent record and the
//! single terminal event: `error` when the run failed, otherwise an
//! optional `no-claims` followed by `complete`.

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use verdict_db::models::JobStatus;

use crate::event::{
    EventKind, complete_payload, connected_payload, error_payload, metadata_payload,
    no_claims_payload, run_id,
};
use crate::log::EventLog;
use crate::normalize::{Normalized, normalize};
use crate::runner::{AgentRunner, RunRequest};
use crate::store::{Finalization, JobStore, NewJob};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Initializing,
    Running,
    Finalizing,
    Done,
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Finalizing => "finalizing",
            Self::Done => "done",
        };
        f.write_str(s)
    }
}

/// What a finished relay did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOutcome {
    /// Terminal status of the job record.
    pub status: JobStatus,
    /// Events this relay appended to the log, bookkeeping included.
    pub events_appended: usize,
}

/// How the Running phase ended.
enum RunEnd {
    /// The agent finished. Carries the claims of the first `verdicts`
    /// event, if any.
    Finished { verdicts: Option<Value> },
    /// The run failed and its `error` event is already in the log.
    Failed { message: String },
}

/// Relays jobs from an [`AgentRunner`] into an [`EventLog`] and a
/// [`JobStore`]. Cheap to clone.
#[derive(Clone)]
pub struct StreamRelay {
    log: Arc<dyn EventLog>,
    store: Arc<dyn JobStore>,
    runner: Arc<dyn AgentRunner>,
}

impl fmt::Debug for StreamRelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamRelay")
            .field("runner", &self.runner.name())
            .finish()
    }
}

impl StreamRelay {
    pub fn new(
        log: Arc<dyn EventLog>,
        store: Arc<dyn JobStore>,
        runner: Arc<dyn AgentRunner>,
    ) -> Self {
        Self { log, store, runner }
    }

    /// Run a job to completion.
    pub async fn run(&self, job: &NewJob) -> Result<RelayOutcome> {
        self.start(job).await?.finish().await
    }

    /// Perform the Initializing phase. When this returns, the job's log
    /// exists and readers can attach; [`RelayRun::finish`] does the rest.
    ///
    /// On failure the record is marked `failed` on a best-effort basis.
    pub async fn start(&self, job: &NewJob) -> Result<RelayRun> {
        let mut run = RelayRun {
            relay: self.clone(),
            job_id: job.id.clone(),
            content: job.content.clone(),
            state: RelayState::Initializing,
            events_appended: 0,
        };
        info!(job_id = %run.job_id, runner = self.runner.name(), "relay initializing");

        if let Err(e) = run.initialize(job).await {
            error!(job_id = %run.job_id, error = %e, "relay failed to initialize");
            run.fail_best_effort(&format!("{e:#}")).await;
            return Err(e);
        }
        Ok(run)
    }
}

/// A relay that has finished initializing.
#[derive(Debug)]
pub struct RelayRun {
    relay: StreamRelay,
    job_id: String,
    content: String,
    state: RelayState,
    events_appended: usize,
}

impl RelayRun {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    fn transition(&mut self, next: RelayState) {
        debug!(job_id = %self.job_id, from = %self.state, to = %next, "relay state transition");
        self.state = next;
    }

    async fn append(&mut self, kind: EventKind, payload: Value) -> Result<()> {
        let event = self
            .relay
            .log
            .append(&self.job_id, kind, payload)
            .await
            .with_context(|| format!("failed to append {kind} event for job {}", self.job_id))?;
        self.events_appended += 1;
        debug!(job_id = %self.job_id, seq = event.seq, kind = %kind, "event appended");
        Ok(())
    }

    async fn initialize(&mut self, job: &NewJob) -> Result<()> {
        let store = Arc::clone(&self.relay.store);

        if store.get(&self.job_id).await?.is_none() {
            store
                .create(job)
                .await?
                .with_context(|| format!("job {} appeared while being created", self.job_id))?;
        }
        if !store.mark_running(&self.job_id).await? {
            warn!(job_id = %self.job_id, "job was not pending when its relay started");
        }

        self.relay
            .log
            .create(&self.job_id)
            .await
            .with_context(|| format!("failed to create event log for job {}", self.job_id))?;
        self.events_appended += 1;
        self.append(EventKind::Connected, connected_payload(&self.job_id))
            .await?;

        let view = store
            .get_view(&self.job_id)
            .await?
            .with_context(|| format!("job {} vanished during initialization", self.job_id))?;
        self.append(EventKind::Metadata, metadata_payload(&view))
            .await
    }

    /// Run the Running and Finalizing phases.
    pub async fn finish(mut self) -> Result<RelayOutcome> {
        self.transition(RelayState::Running);
        let end = match self.pump().await {
            Ok(end) => end,
            Err(e) => {
                // The log itself is failing; still try to leave a terminal
                // event behind.
                let message = format!("{e:#}");
                error!(job_id = %self.job_id, error = %message, "relay failed while running");
                if let Err(e) = self
                    .append(
                        EventKind::Error,
                        error_payload(&message, run_id::SERVER_ERROR),
                    )
                    .await
                {
                    warn!(job_id = %self.job_id, error = %e, "could not record relay failure in log");
                }
                RunEnd::Failed { message }
            }
        };

        self.transition(RelayState::Finalizing);
        let status = self.finalize(end).await;

        self.transition(RelayState::Done);
        info!(
            job_id = %self.job_id,
            status = %status,
            events_appended = self.events_appended,
            "relay finished"
        );
        Ok(RelayOutcome {
            status,
            events_appended: self.events_appended,
        })
    }

    async fn pump(&mut self) -> Result<RunEnd> {
        let request = RunRequest {
            job_id: self.job_id.clone(),
            content: self.content.clone(),
        };
        let mut stream = match self.relay.runner.start(&request).await {
            Ok(stream) => stream,
            Err(e) => return self.fail(format!("{e:#}"), run_id::SERVER_ERROR).await,
        };

        let mut verdicts = None;
        while let Some(item) = stream.next().await {
            let msg = match item {
                Ok(msg) => msg,
                Err(e) => return self.fail(format!("{e:#}"), run_id::SERVER_ERROR).await,
            };
            match normalize(&msg) {
                Normalized::UpstreamError { message } => {
                    return self.fail(message, run_id::AGENT_ERROR).await;
                }
                Normalized::Events(events) => {
                    for event in events {
                        if event.kind == EventKind::Verdicts && verdicts.is_none() {
                            verdicts = event.payload.get("claims").cloned();
                        }
                        self.append(event.kind, event.payload).await?;
                    }
                }
            }
        }

        Ok(RunEnd::Finished { verdicts })
    }

    /// Append the run's terminal `error` event.
    async fn fail(&mut self, message: String, run_id: &str) -> Result<RunEnd> {
        warn!(job_id = %self.job_id, run_id, error = %message, "verification run failed");
        self.append(EventKind::Error, error_payload(&message, run_id))
            .await?;
        Ok(RunEnd::Failed { message })
    }

    async fn finalize(&mut self, end: RunEnd) -> JobStatus {
        let outcome = match end {
            RunEnd::Failed { message } => {
                let outcome = Finalization::Failed { message };
                self.write_record(&outcome).await;
                return JobStatus::Failed;
            }
            RunEnd::Finished {
                verdicts: Some(result),
            } => Finalization::Completed { result },
            RunEnd::Finished { verdicts: None } => {
                if let Err(e) = self.append(EventKind::NoClaims, no_claims_payload()).await {
                    return self.abort(e).await;
                }
                Finalization::NoClaims
            }
        };

        match self.relay.store.finalize(&self.job_id, &outcome).await {
            Ok(applied) => {
                if !applied {
                    warn!(job_id = %self.job_id, "job record was already terminal");
                }
                match self.append(EventKind::Complete, complete_payload()).await {
                    Ok(()) => outcome.status(),
                    Err(e) => {
                        error!(job_id = %self.job_id, error = %e, "failed to append complete event");
                        outcome.status()
                    }
                }
            }
            Err(e) => self.abort(e).await,
        }
    }

    /// Finalizing could not complete normally: end the stream with an
    /// error and mark the record failed if it still can be.
    async fn abort(&mut self, e: anyhow::Error) -> JobStatus {
        let message = format!("{e:#}");
        error!(job_id = %self.job_id, error = %message, "failed to finalize job");
        if let Err(e) = self
            .append(
                EventKind::Error,
                error_payload(&message, run_id::SERVER_ERROR),
            )
            .await
        {
            warn!(job_id = %self.job_id, error = %e, "could not record finalize failure in log");
        }
        self.fail_best_effort(&message).await;
        JobStatus::Failed
    }

    async fn write_record(&self, outcome: &Finalization) {
        match self.relay.store.finalize(&self.job_id, outcome).await {
            Ok(true) => {}
            Ok(false) => warn!(job_id = %self.job_id, "job record was already terminal"),
            Err(e) => error!(job_id = %self.job_id, error = %e, "failed to write job record"),
        }
    }

    async fn fail_best_effort(&self, message: &str) {
        self.write_record(&Finalization::Failed {
            message: message.to_owned(),
        })
        .await;
    }
}
