//! Tests for the stream relay against the in-memory log and store.
//!
//! Agents are replaced by `ScriptedRunner` or small inline runners, so
//! every test controls exactly what the "agent" says.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::broadcast;

use verdict_core::event::{Event, EventKind};
use verdict_core::log::{EventLog, LogConfig, MemoryEventLog};
use verdict_core::normalize::RawMessage;
use verdict_core::relay::StreamRelay;
use verdict_core::runner::{AgentRunner, RunRequest, RunStream, ScriptedRunner};
use verdict_core::store::{Finalization, JobStore, MemoryJobStore, NewJob};
use verdict_db::models::{Job, JobStatus, JobSummary, JobView};

// ===========================================================================
// Helpers
// ===========================================================================

fn new_job(id: &str, content: &str) -> NewJob {
    NewJob {
        id: id.to_owned(),
        content: content.to_owned(),
        owner_id: Some("user-1".to_owned()),
        title: None,
    }
}

fn sentences(list: &[&str]) -> RawMessage {
    let items: Vec<Value> = list
        .iter()
        .map(|s| json!({ "original_sentence": s }))
        .collect();
    RawMessage::new(
        "updates|extract_claims:4f1c",
        json!({ "sentence_splitter": { "contextual_sentences": items } }),
    )
}

fn extracted(claims: &[(&str, &str)]) -> RawMessage {
    let items: Vec<Value> = claims
        .iter()
        .map(|(claim, sentence)| json!({ "claim_text": claim, "original_sentence": sentence }))
        .collect();
    RawMessage::new(
        "updates",
        json!({ "extract_claims": { "extracted_claims": items } }),
    )
}

fn verified(claims: &[(&str, &str, &str)]) -> RawMessage {
    let items: Vec<Value> = claims
        .iter()
        .map(|(claim, sentence, result)| {
            json!({
                "claim_text": claim,
                "original_sentence": sentence,
                "result": result,
                "reasoning": "Checked against sources.",
                "sources": [{ "url": "https://example.org", "title": "Example" }]
            })
        })
        .collect();
    RawMessage::new(
        "updates",
        json!({ "generate_report_node": { "final_report": { "verified_claims": items } } }),
    )
}

struct Fixture {
    log: Arc<MemoryEventLog>,
    store: Arc<MemoryJobStore>,
}

impl Fixture {
    fn new() -> Self {
        Self::with_log(LogConfig::default())
    }

    fn with_log(config: LogConfig) -> Self {
        Self {
            log: Arc::new(MemoryEventLog::new(config)),
            store: Arc::new(MemoryJobStore::new()),
        }
    }

    fn relay(&self, runner: impl AgentRunner + 'static) -> StreamRelay {
        StreamRelay::new(self.log.clone(), self.store.clone(), Arc::new(runner))
    }

    async fn kinds(&self, job_id: &str) -> Vec<EventKind> {
        self.log.read(job_id).await.iter().map(|e| e.kind).collect()
    }

    async fn job(&self, job_id: &str) -> Job {
        self.store.get(job_id).await.unwrap().expect("job should exist")
    }
}

fn assert_single_trailing_terminal(events: &[Event]) {
    let terminals: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| e.kind.is_terminal())
        .map(|(i, _)| i)
        .collect();
    assert_eq!(terminals.len(), 1, "expected exactly one terminal event: {events:?}");
    assert_eq!(terminals[0], events.len() - 1, "terminal event must be last");
}

// ===========================================================================
// Outcomes
// ===========================================================================

#[tokio::test]
async fn sentences_without_claims_finish_as_no_claims() {
    let fx = Fixture::new();
    let relay = fx.relay(ScriptedRunner::new(vec![sentences(&["The sky is blue."])]));

    let outcome = relay.run(&new_job("j1", "The sky is blue.")).await.unwrap();
    assert_eq!(outcome.status, JobStatus::NoClaims);
    assert_eq!(outcome.events_appended, 6);

    assert_eq!(
        fx.kinds("j1").await,
        vec![
            EventKind::Start,
            EventKind::Connected,
            EventKind::Metadata,
            EventKind::Sentences,
            EventKind::NoClaims,
            EventKind::Complete,
        ]
    );
    let events = fx.log.read("j1").await;
    assert_eq!(events[3].payload, json!({ "claims": [["The sky is blue.", []]] }));
    assert_eq!(
        events[4].payload,
        json!({ "message": "No factual claims found in the provided text" })
    );

    let job = fx.job("j1").await;
    assert_eq!(job.status, JobStatus::NoClaims);
    assert_eq!(job.result, Some(json!([])));
    assert!(job.completed_at.is_some());
}

#[tokio::test]
async fn verdicts_finish_as_completed_with_result() {
    let fx = Fixture::new();
    let relay = fx.relay(ScriptedRunner::new(vec![
        sentences(&["Paris is in France."]),
        extracted(&[("Paris is in France.", "Paris is in France.")]),
        verified(&[("Paris is in France.", "Paris is in France.", "Supported")]),
    ]));

    let outcome = relay.run(&new_job("j2", "Paris is in France.")).await.unwrap();
    assert_eq!(outcome.status, JobStatus::Completed);

    assert_eq!(
        fx.kinds("j2").await,
        vec![
            EventKind::Start,
            EventKind::Connected,
            EventKind::Metadata,
            EventKind::Sentences,
            EventKind::Claims,
            EventKind::Verdicts,
            EventKind::Complete,
        ]
    );

    let events = fx.log.read("j2").await;
    let job = fx.job("j2").await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result.as_ref(), Some(&events[5].payload["claims"]));
    assert_eq!(
        job.result.unwrap()[0][1][0]["result"],
        json!("Supported")
    );
}

#[tokio::test]
async fn first_verdicts_event_is_the_result() {
    let fx = Fixture::new();
    let relay = fx.relay(ScriptedRunner::new(vec![
        verified(&[("first", "S.", "Supported")]),
        verified(&[("second", "S.", "Refuted")]),
    ]));

    relay.run(&new_job("j", "S.")).await.unwrap();
    let job = fx.job("j").await;
    assert_eq!(job.result.unwrap()[0][1][0]["text"], json!("first"));
}

#[tokio::test]
async fn metadata_describes_the_job() {
    let fx = Fixture::new();
    let relay = fx.relay(ScriptedRunner::default());

    relay.run(&new_job("j", "Some text.")).await.unwrap();
    let metadata = &fx.log.read("j").await[2];
    assert_eq!(metadata.kind, EventKind::Metadata);
    assert_eq!(metadata.payload["text"], json!("Some text."));
    assert_eq!(metadata.payload["user"], json!({ "id": "user-1" }));
    assert_eq!(metadata.payload["isPublic"], json!(false));
    assert!(metadata.payload["createdAt"].is_string());
}

#[tokio::test]
async fn relay_creates_missing_record() {
    let fx = Fixture::new();
    let relay = fx.relay(ScriptedRunner::default());

    assert!(fx.store.get("fresh").await.unwrap().is_none());
    relay.run(&new_job("fresh", "Text.")).await.unwrap();
    assert_eq!(fx.job("fresh").await.status, JobStatus::NoClaims);
}

#[tokio::test]
async fn relay_marks_record_running_while_in_flight() {
    let fx = Fixture::new();
    let relay = fx.relay(ScriptedRunner::default());

    let run = relay.start(&new_job("j", "Text.")).await.unwrap();
    assert_eq!(fx.job("j").await.status, JobStatus::Running);
    assert!(fx.log.exists("j").await.unwrap());

    run.finish().await.unwrap();
    assert_eq!(fx.job("j").await.status, JobStatus::NoClaims);
}

// ===========================================================================
// Failures
// ===========================================================================

#[tokio::test]
async fn upstream_error_fails_the_job() {
    let fx = Fixture::new();
    let relay = fx.relay(ScriptedRunner::new(vec![
        sentences(&["A."]),
        RawMessage::new("error", json!({ "message": "model overloaded" })),
        extracted(&[("never", "A.")]),
    ]));

    let outcome = relay.run(&new_job("j", "A.")).await.unwrap();
    assert_eq!(outcome.status, JobStatus::Failed);

    let events = fx.log.read("j").await;
    assert_single_trailing_terminal(&events);
    let last = events.last().unwrap();
    assert_eq!(last.kind, EventKind::Error);
    assert_eq!(last.payload, json!({ "message": "model overloaded", "run_id": "agent-error" }));

    let job = fx.job("j").await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("model overloaded"));
    assert_eq!(job.result, None);
}

#[tokio::test]
async fn runner_stream_error_is_a_server_error() {
    let fx = Fixture::new();
    let relay = fx.relay(
        ScriptedRunner::new(vec![sentences(&["A."])]).failing_with("agent exited with exit status: 3"),
    );

    let outcome = relay.run(&new_job("j", "A.")).await.unwrap();
    assert_eq!(outcome.status, JobStatus::Failed);

    let events = fx.log.read("j").await;
    assert_single_trailing_terminal(&events);
    assert_eq!(events.last().unwrap().payload["run_id"], json!("server-error"));
    assert_eq!(
        fx.job("j").await.error.as_deref(),
        Some("agent exited with exit status: 3")
    );
}

struct UnstartableRunner;

#[async_trait]
impl AgentRunner for UnstartableRunner {
    fn name(&self) -> &str {
        "unstartable"
    }

    async fn start(&self, _request: &RunRequest) -> Result<RunStream> {
        bail!("agent binary not found")
    }
}

#[tokio::test]
async fn runner_that_cannot_start_fails_the_job() {
    let fx = Fixture::new();
    let relay = fx.relay(UnstartableRunner);

    let outcome = relay.run(&new_job("j", "A.")).await.unwrap();
    assert_eq!(outcome.status, JobStatus::Failed);
    assert_eq!(
        fx.kinds("j").await,
        vec![
            EventKind::Start,
            EventKind::Connected,
            EventKind::Metadata,
            EventKind::Error
        ]
    );
    assert_eq!(fx.job("j").await.status, JobStatus::Failed);
}

/// A store whose `finalize` always fails.
struct FinalizeFailsStore {
    inner: MemoryJobStore,
}

#[async_trait]
impl JobStore for FinalizeFailsStore {
    async fn create(&self, new: &NewJob) -> Result<Option<Job>> {
        self.inner.create(new).await
    }
    async fn get(&self, id: &str) -> Result<Option<Job>> {
        self.inner.get(id).await
    }
    async fn get_view(&self, id: &str) -> Result<Option<JobView>> {
        self.inner.get_view(id).await
    }
    async fn mark_running(&self, id: &str) -> Result<bool> {
        self.inner.mark_running(id).await
    }
    async fn finalize(&self, _id: &str, _outcome: &Finalization) -> Result<bool> {
        bail!("database is read-only")
    }
    async fn list(&self, owner_id: Option<&str>) -> Result<Vec<JobSummary>> {
        self.inner.list(owner_id).await
    }
    async fn set_public(&self, id: &str, is_public: bool) -> Result<bool> {
        self.inner.set_public(id, is_public).await
    }
}

#[tokio::test]
async fn finalize_failure_ends_stream_with_error() {
    let log = Arc::new(MemoryEventLog::new(LogConfig::default()));
    let store = Arc::new(FinalizeFailsStore {
        inner: MemoryJobStore::new(),
    });
    let relay = StreamRelay::new(
        log.clone(),
        store,
        Arc::new(ScriptedRunner::new(vec![verified(&[("c", "S.", "Supported")])])),
    );

    let outcome = relay.run(&new_job("j", "S.")).await.unwrap();
    assert_eq!(outcome.status, JobStatus::Failed);

    let events = log.read("j").await;
    assert_single_trailing_terminal(&events);
    let last = events.last().unwrap();
    assert_eq!(last.kind, EventKind::Error);
    assert_eq!(last.payload["run_id"], json!("server-error"));
}

/// A log that rejects appends once `budget` of them have succeeded.
struct FlakyLog {
    inner: MemoryEventLog,
    budget: AtomicUsize,
}

#[async_trait]
impl EventLog for FlakyLog {
    async fn append(&self, job_id: &str, kind: EventKind, payload: Value) -> Result<Event> {
        let left = self.budget.load(Ordering::SeqCst);
        if left == 0 {
            bail!("log unavailable");
        }
        self.budget.store(left - 1, Ordering::SeqCst);
        self.inner.append(job_id, kind, payload).await
    }
    async fn read(&self, job_id: &str) -> Vec<Event> {
        self.inner.read(job_id).await
    }
    async fn exists(&self, job_id: &str) -> Result<bool> {
        self.inner.exists(job_id).await
    }
    fn subscribe(&self, job_id: &str) -> broadcast::Receiver<i64> {
        self.inner.subscribe(job_id)
    }
    async fn purge_expired(&self) -> Result<u64> {
        self.inner.purge_expired().await
    }
}

#[tokio::test]
async fn log_failure_while_running_fails_the_record() {
    let log = Arc::new(FlakyLog {
        inner: MemoryEventLog::new(LogConfig::default()),
        budget: AtomicUsize::new(4),
    });
    let store = Arc::new(MemoryJobStore::new());
    let relay = StreamRelay::new(
        log.clone(),
        store.clone(),
        Arc::new(ScriptedRunner::new(vec![sentences(&["A."]), extracted(&[("c", "A.")])])),
    );

    let outcome = relay.run(&new_job("j", "A.")).await.unwrap();
    assert_eq!(outcome.status, JobStatus::Failed);
    assert_eq!(outcome.events_appended, 4);

    let job = store.get("j").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.unwrap().contains("log unavailable"));
}

#[tokio::test]
async fn log_failure_during_initialization_is_returned() {
    let log = Arc::new(FlakyLog {
        inner: MemoryEventLog::new(LogConfig::default()),
        budget: AtomicUsize::new(1),
    });
    let store = Arc::new(MemoryJobStore::new());
    let relay = StreamRelay::new(log, store.clone(), Arc::new(ScriptedRunner::default()));

    assert!(relay.run(&new_job("j", "A.")).await.is_err());
    assert_eq!(store.get("j").await.unwrap().unwrap().status, JobStatus::Failed);
}

// ===========================================================================
// Log properties
// ===========================================================================

#[tokio::test]
async fn relayed_events_are_strictly_ordered() {
    let fx = Fixture::new();
    let mut script = vec![sentences(&["A.", "B."])];
    for i in 0..20 {
        script.push(extracted(&[(&format!("claim {i}"), "A.")]));
    }
    let relay = fx.relay(ScriptedRunner::new(script));
    relay.run(&new_job("j", "A. B.")).await.unwrap();

    let events = fx.log.read("j").await;
    assert!(events.windows(2).all(|w| w[0].seq < w[1].seq));
    assert_eq!(events.first().unwrap().seq, 1);
    assert_single_trailing_terminal(&events);
}

#[tokio::test]
async fn log_keeps_newest_thousand_events() {
    let log = MemoryEventLog::new(LogConfig::default());
    for i in 0..1500 {
        log.append("j", EventKind::Claims, json!({ "n": i })).await.unwrap();
    }

    let events = log.read("j").await;
    assert_eq!(events.len(), 1000);
    assert_eq!(events.first().unwrap().seq, 501);
    assert_eq!(events.last().unwrap().seq, 1500);
    assert!(events.windows(2).all(|w| w[1].seq == w[0].seq + 1));
    assert_eq!(events.first().unwrap().payload, json!({ "n": 500 }));
}

#[tokio::test]
async fn long_runs_still_end_with_the_terminal_event() {
    let fx = Fixture::with_log(LogConfig {
        max_events: 10,
        ..LogConfig::default()
    });
    let script: Vec<RawMessage> = (0..30)
        .map(|i| extracted(&[(&format!("claim {i}"), "A.")]))
        .collect();
    let relay = fx.relay(ScriptedRunner::new(script));
    relay.run(&new_job("j", "A.")).await.unwrap();

    let events = fx.log.read("j").await;
    assert_eq!(events.len(), 10);
    assert_eq!(events.last().unwrap().kind, EventKind::Complete);
    assert_eq!(events[events.len() - 2].kind, EventKind::NoClaims);
}
