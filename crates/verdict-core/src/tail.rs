//! Tail reader: one consumer's view of one job's stream.
//!
//! A finished job is served from its permanent record. A job in flight is
//! served from its log: everything after the consumer's cursor, then new
//! events as they arrive. Polling on a fixed interval is what guarantees
//! progress; log wakeups only shorten the wait.

use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use verdict_db::models::{JobStatus, JobView};

use crate::event::{
    Cursor, Event, EventKind, complete_payload, error_payload, metadata_payload,
    no_claims_payload, run_id,
};
use crate::log::EventLog;
use crate::store::JobStore;

/// Consecutive empty polls, with the record already terminal, after which
/// the reader stops waiting for the log's terminal event and finishes the
/// stream from the record.
const SETTLE_POLLS: u32 = 3;

/// Message used when a failed record carries no error text.
const STORED_FAILURE_MESSAGE: &str = "Verification failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TailConfig {
    pub poll_interval: Duration,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Client-relevant kinds a consumer has already received.
#[derive(Debug, Clone, Copy, Default)]
struct Seen {
    metadata: bool,
    verdicts: bool,
    no_claims: bool,
}

impl Seen {
    fn note(&mut self, kind: EventKind) {
        match kind {
            EventKind::Metadata => self.metadata = true,
            EventKind::Verdicts => self.verdicts = true,
            EventKind::NoClaims => self.no_claims = true,
            _ => {}
        }
    }
}

/// The events a terminal record stands for, minus what the consumer has
/// already seen. Every event is synthesized (`seq == 0`).
fn record_events(view: &JobView, seen: Seen) -> Vec<Event> {
    let mut events = Vec::new();
    if !seen.metadata {
        events.push(Event::synthesized(EventKind::Metadata, metadata_payload(view)));
    }

    match view.job.status {
        JobStatus::Completed => {
            let result = view.job.result.clone().unwrap_or_else(|| json!([]));
            let has_claims = result.as_array().is_some_and(|a| !a.is_empty());
            if has_claims && !seen.verdicts {
                events.push(Event::synthesized(
                    EventKind::Verdicts,
                    json!({ "claims": result }),
                ));
            }
            events.push(Event::synthesized(EventKind::Complete, complete_payload()));
        }
        JobStatus::NoClaims => {
            if !seen.no_claims {
                events.push(Event::synthesized(EventKind::NoClaims, no_claims_payload()));
            }
            events.push(Event::synthesized(EventKind::Complete, complete_payload()));
        }
        JobStatus::Failed => {
            let message = view.job.error.as_deref().unwrap_or(STORED_FAILURE_MESSAGE);
            events.push(Event::synthesized(
                EventKind::Error,
                error_payload(message, run_id::STORED_RESULT),
            ));
        }
        JobStatus::Pending | JobStatus::Running => {}
    }
    events
}

/// Wait for the next wakeup. Never resolves once the channel is gone.
async fn next_wakeup(wakeups: &mut Option<broadcast::Receiver<i64>>) {
    let Some(rx) = wakeups else {
        return std::future::pending().await;
    };
    let received = rx.recv().await;
    if let Err(RecvError::Closed) = received {
        *wakeups = None;
    }
}

/// Serves consumer streams from a job store and an event log.
#[derive(Clone)]
pub struct TailReader {
    log: Arc<dyn EventLog>,
    store: Arc<dyn JobStore>,
    config: TailConfig,
}

impl std::fmt::Debug for TailReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TailReader")
            .field("config", &self.config)
            .finish()
    }
}

impl TailReader {
    pub fn new(log: Arc<dyn EventLog>, store: Arc<dyn JobStore>, config: TailConfig) -> Self {
        Self { log, store, config }
    }

    /// The stream for `job_id`, resuming after `cursor`.
    ///
    /// Yields only client-relevant events and ends right after the first
    /// `complete` or `error`, or as soon as `cancel` fires. Dropping the
    /// stream is equivalent to cancelling it.
    pub fn stream(
        &self,
        job_id: String,
        cursor: Cursor,
        cancel: CancellationToken,
    ) -> impl Stream<Item = Event> + Send + use<> {
        let log = Arc::clone(&self.log);
        let store = Arc::clone(&self.store);
        let poll_interval = self.config.poll_interval;

        async_stream::stream! {
            if let Some(view) = terminal_view(store.as_ref(), &job_id).await {
                debug!(job_id = %job_id, status = %view.job.status, "serving stream from job record");
                for event in record_events(&view, Seen::default()) {
                    yield event;
                }
                return;
            }

            let mut wakeups = Some(log.subscribe(&job_id));
            let mut cursor = cursor;
            let mut seen = Seen::default();
            let mut settled_polls = 0;

            while !cancel.is_cancelled() {
                let events = log.read_from(&job_id, cursor).await;
                let idle = events.is_empty();

                for event in events {
                    cursor = Cursor::After(event.seq);
                    if !event.kind.is_client_relevant() {
                        continue;
                    }
                    seen.note(event.kind);
                    let terminal = event.kind.is_terminal();
                    yield event;
                    if terminal {
                        return;
                    }
                }

                if idle {
                    let gone = match log.exists(&job_id).await {
                        Ok(exists) => !exists,
                        Err(e) => {
                            warn!(job_id = %job_id, error = %e, "failed to check event log; polling again");
                            false
                        }
                    };
                    if gone {
                        match terminal_view(store.as_ref(), &job_id).await {
                            Some(view) => {
                                for event in record_events(&view, seen) {
                                    yield event;
                                }
                            }
                            None => {
                                warn!(job_id = %job_id, "event log expired before the job finished");
                                yield Event::synthesized(
                                    EventKind::Error,
                                    error_payload("stream expired", run_id::STREAM_EXPIRED),
                                );
                            }
                        }
                        return;
                    }

                    match terminal_view(store.as_ref(), &job_id).await {
                        Some(view) => {
                            settled_polls += 1;
                            if settled_polls >= SETTLE_POLLS {
                                warn!(job_id = %job_id, "job finished without a terminal event in its log");
                                for event in record_events(&view, seen) {
                                    yield event;
                                }
                                return;
                            }
                        }
                        None => settled_polls = 0,
                    }
                } else {
                    settled_polls = 0;
                }

                let cancelled = tokio::select! {
                    _ = cancel.cancelled() => true,
                    _ = tokio::time::sleep(poll_interval) => false,
                    _ = next_wakeup(&mut wakeups) => false,
                };
                if cancelled {
                    break;
                }
            }
            debug!(job_id = %job_id, "stream cancelled");
        }
    }
}

/// The job's record, if it is terminal. Lookup failures count as "not
/// terminal" so the caller keeps reading the log.
async fn terminal_view(store: &dyn JobStore, job_id: &str) -> Option<JobView> {
    match store.get_view(job_id).await {
        Ok(Some(view)) if view.job.status.is_terminal() => Some(view),
        Ok(_) => None,
        Err(e) => {
            warn!(job_id, error = %e, "failed to read job record");
            None
        }
    }
}
