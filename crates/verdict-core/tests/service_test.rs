//! Check service tests: submission rules, streaming and sharing.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use verdict_core::event::{Cursor, Event, EventKind};
use verdict_core::log::{LogConfig, MemoryEventLog};
use verdict_core::normalize::RawMessage;
use verdict_core::runner::{AgentRunner, ScriptedRunner};
use verdict_core::service::{
    AccessError, CheckService, EventStream, ServiceConfig, SubmitError, SubmitRequest,
};
use verdict_core::store::MemoryJobStore;
use verdict_core::tail::TailConfig;
use verdict_db::models::JobStatus;

const WAIT: Duration = Duration::from_secs(5);

fn service(runner: impl AgentRunner + 'static) -> CheckService {
    CheckService::new(
        Arc::new(MemoryEventLog::new(LogConfig::default())),
        Arc::new(MemoryJobStore::new()),
        Arc::new(runner),
        ServiceConfig {
            max_input_chars: 40,
            tail: TailConfig {
                poll_interval: Duration::from_millis(20),
            },
        },
    )
}

fn verdicts_script() -> ScriptedRunner {
    ScriptedRunner::new(vec![RawMessage::new(
        "updates",
        json!({ "generate_report_node": { "final_report": { "verified_claims": [{
            "claim_text": "Paris is in France.",
            "original_sentence": "Paris is in France.",
            "result": "Supported"
        }] } } }),
    )])
}

fn request(check_id: &str, content: &str, owner: Option<&str>) -> SubmitRequest {
    SubmitRequest {
        check_id: check_id.to_owned(),
        content: content.to_owned(),
        owner_id: owner.map(str::to_owned),
    }
}

async fn submit_and_wait(svc: &CheckService, req: SubmitRequest) -> JobStatus {
    let submitted = svc.submit(req).await.unwrap();
    tokio::time::timeout(WAIT, submitted.relay)
        .await
        .unwrap()
        .unwrap()
        .expect("relay should finish")
        .status
}

async fn drain(stream: EventStream) -> Vec<Event> {
    tokio::time::timeout(WAIT, stream.collect::<Vec<_>>())
        .await
        .expect("stream did not end")
}

// ===========================================================================
// Submission
// ===========================================================================

#[tokio::test]
async fn submit_rejects_empty_content() {
    let svc = service(ScriptedRunner::default());
    let err = svc.submit(request("c1", "   \n\t", None)).await.unwrap_err();
    assert!(matches!(err, SubmitError::Invalid(_)), "{err:?}");
    assert!(svc.status("c1").await.unwrap().is_none());
}

#[tokio::test]
async fn submit_rejects_oversized_content() {
    let svc = service(ScriptedRunner::default());
    let long = "x".repeat(41);
    let err = svc.submit(request("c1", &long, None)).await.unwrap_err();
    assert!(matches!(err, SubmitError::Invalid(_)));

    // The limit counts characters after trimming.
    let padded = format!("  {}  ", "é".repeat(40));
    svc.submit(request("c2", &padded, None)).await.unwrap();
}

#[tokio::test]
async fn submit_rejects_bad_check_ids() {
    let svc = service(ScriptedRunner::default());
    assert!(matches!(
        svc.submit(request("", "Text.", None)).await,
        Err(SubmitError::Invalid(_))
    ));
    let long_id = "i".repeat(101);
    assert!(matches!(
        svc.submit(request(&long_id, "Text.", None)).await,
        Err(SubmitError::Invalid(_))
    ));
}

#[tokio::test]
async fn submit_rejects_duplicate_check_id() {
    let svc = service(ScriptedRunner::default());
    submit_and_wait(&svc, request("dup", "Text.", None)).await;

    let err = svc.submit(request("dup", "Other.", None)).await.unwrap_err();
    assert!(matches!(err, SubmitError::Conflict(ref id) if id == "dup"));
    assert_eq!(svc.status("dup").await.unwrap().unwrap().status, JobStatus::NoClaims);
}

#[tokio::test]
async fn submitted_job_is_streamable_immediately() {
    let svc = service(verdicts_script().with_delay(Duration::from_millis(50)));
    let submitted = svc.submit(request("c1", " Paris is in France. ", None)).await.unwrap();
    assert_eq!(submitted.check_id, "c1");

    let stream = svc
        .open_stream("c1", Cursor::Start, CancellationToken::new())
        .await
        .unwrap()
        .expect("log should exist right after submit");
    let events = drain(stream).await;
    assert_eq!(events.first().unwrap().kind, EventKind::Metadata);
    assert_eq!(events.first().unwrap().payload["text"], json!("Paris is in France."));
    assert_eq!(events.last().unwrap().kind, EventKind::Complete);
    assert!(events.iter().any(|e| e.kind == EventKind::Verdicts));

    let outcome = submitted.relay.await.unwrap().unwrap();
    assert_eq!(outcome.status, JobStatus::Completed);
}

#[tokio::test]
async fn open_stream_of_unknown_check_is_none() {
    let svc = service(ScriptedRunner::default());
    let stream = svc
        .open_stream("nope", Cursor::Start, CancellationToken::new())
        .await
        .unwrap();
    assert!(stream.is_none());
}

#[tokio::test]
async fn list_filters_by_owner() {
    let svc = service(ScriptedRunner::default());
    submit_and_wait(&svc, request("mine", "My text.", Some("alice"))).await;
    submit_and_wait(&svc, request("theirs", "Their text.", Some("bob"))).await;

    let mine = svc.list(Some("alice")).await.unwrap();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].id, "mine");
    assert_eq!(svc.list(None).await.unwrap().len(), 2);
}

// ===========================================================================
// Sharing
// ===========================================================================

#[tokio::test]
async fn owner_can_share_a_finished_check() {
    let svc = service(verdicts_script());
    submit_and_wait(&svc, request("c1", "Paris is in France.", Some("alice"))).await;

    let job = svc.set_visibility("c1", Some("alice"), true).await.unwrap();
    assert!(job.is_public);

    let public = svc.public_view("c1").await.unwrap();
    assert_eq!(public.check.job.status, JobStatus::Completed);
    assert_eq!(public.metadata["isPublic"], json!(true));
    assert_eq!(public.metadata["user"], json!({ "id": "alice" }));

    svc.set_visibility("c1", Some("alice"), false).await.unwrap();
    assert!(matches!(svc.public_view("c1").await, Err(AccessError::Forbidden)));
}

#[tokio::test]
async fn only_the_owner_may_share() {
    let svc = service(verdicts_script());
    submit_and_wait(&svc, request("c1", "Paris is in France.", Some("alice"))).await;

    assert!(matches!(
        svc.set_visibility("c1", Some("mallory"), true).await,
        Err(AccessError::Forbidden)
    ));
    assert!(matches!(
        svc.set_visibility("c1", None, true).await,
        Err(AccessError::Forbidden)
    ));
}

#[tokio::test]
async fn unowned_check_may_be_shared_by_anyone() {
    let svc = service(ScriptedRunner::default());
    submit_and_wait(&svc, request("c1", "The sky is blue.", None)).await;
    let job = svc.set_visibility("c1", Some("anyone"), true).await.unwrap();
    assert!(job.is_public);
    assert_eq!(
        svc.public_view("c1").await.unwrap().check.job.status,
        JobStatus::NoClaims
    );
}

#[tokio::test]
async fn failed_checks_cannot_be_shared() {
    let svc = service(ScriptedRunner::default().failing_with("agent crashed"));
    let status = submit_and_wait(&svc, request("c1", "Text.", Some("alice"))).await;
    assert_eq!(status, JobStatus::Failed);

    assert!(matches!(
        svc.set_visibility("c1", Some("alice"), true).await,
        Err(AccessError::NotCompleted)
    ));
}

#[tokio::test]
async fn missing_checks_are_not_found() {
    let svc = service(ScriptedRunner::default());
    assert!(matches!(
        svc.set_visibility("ghost", None, true).await,
        Err(AccessError::NotFound)
    ));
    assert!(matches!(svc.public_view("ghost").await, Err(AccessError::NotFound)));
}

#[tokio::test]
async fn purge_reports_nothing_for_live_logs() {
    let svc = service(ScriptedRunner::default());
    submit_and_wait(&svc, request("c1", "Text.", None)).await;
    assert_eq!(svc.purge_expired().await.unwrap(), 0);
}
