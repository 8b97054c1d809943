//! `verdict tail <check-id>` command: follow a check's event stream.

use anyhow::{Result, bail};
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use verdict_core::event::{Cursor, Event, EventKind};

use crate::backends::Backends;
use crate::config::LogBackend;

/// Run the tail command.
pub async fn run_tail(backends: &Backends, check_id: &str, cursor: Cursor) -> Result<()> {
    if backends.log_backend() == LogBackend::Memory {
        warn!("the in-memory event log is not shared between processes; only finished checks can be tailed");
    }

    let finished = backends
        .store
        .get(check_id)
        .await?
        .is_some_and(|job| job.status.is_terminal());
    if !finished && !backends.log.exists(check_id).await? {
        bail!("check {check_id} not found");
    }

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let stream = backends
        .tail()
        .stream(check_id.to_owned(), cursor, cancel);
    print_stream(stream).await
}

/// Print events until the stream ends. Fails when the stream ended on an
/// `error` event.
pub async fn print_stream(stream: impl Stream<Item = Event>) -> Result<()> {
    let mut stream = std::pin::pin!(stream);
    let mut failure = None;
    while let Some(event) = stream.next().await {
        println!("{}", format_event(&event));
        if event.kind == EventKind::Error {
            failure = Some(payload_str(&event.payload, "message").to_owned());
        }
    }
    match failure {
        Some(message) => bail!("check failed: {message}"),
        None => Ok(()),
    }
}

fn payload_str<'a>(payload: &'a Value, key: &str) -> &'a str {
    payload[key].as_str().unwrap_or("")
}

/// One line per event: `[seq] kind: summary`, with `-` for events that
/// did not come from the log.
pub fn format_event(event: &Event) -> String {
    let seq = if event.is_resumable() {
        event.seq.to_string()
    } else {
        "-".to_string()
    };
    format!("[{seq:>4}] {}: {}", event.kind, summarize(event))
}

fn summarize(event: &Event) -> String {
    let payload = &event.payload;
    match event.kind {
        EventKind::Metadata => {
            let text = payload_str(payload, "text");
            let preview: String = text.chars().take(60).collect();
            if preview.len() < text.len() {
                format!("{preview}...")
            } else {
                preview
            }
        }
        EventKind::Sentences | EventKind::Claims | EventKind::Verdicts => {
            summarize_groups(event.kind, &payload["claims"])
        }
        EventKind::NoClaims => payload_str(payload, "message").to_owned(),
        EventKind::Error => format!(
            "{} ({})",
            payload_str(payload, "message"),
            payload_str(payload, "run_id")
        ),
        EventKind::Complete => "done".to_string(),
        EventKind::Start | EventKind::Connected => payload.to_string(),
    }
}

fn summarize_groups(kind: EventKind, groups: &Value) -> String {
    let groups = groups.as_array().map(Vec::as_slice).unwrap_or_default();
    let claims: Vec<&Value> = groups
        .iter()
        .filter_map(|g| g[1].as_array())
        .flatten()
        .collect();

    match kind {
        EventKind::Sentences => format!("{} sentence(s)", groups.len()),
        EventKind::Verdicts => {
            let supported = claims
                .iter()
                .filter(|c| c["result"] == "Supported")
                .count();
            format!(
                "{} claim(s): {supported} supported, {} refuted",
                claims.len(),
                claims.len() - supported
            )
        }
        _ => format!("{} claim(s) in {} sentence(s)", claims.len(), groups.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use serde_json::json;

    fn event(seq: i64, kind: EventKind, payload: Value) -> Event {
        Event {
            seq,
            ..Event::synthesized(kind, payload)
        }
    }

    #[test]
    fn formats_log_and_synthesized_events() {
        let logged = event(7, EventKind::NoClaims, json!({"message": "nothing"}));
        assert_eq!(format_event(&logged), "[   7] no-claims: nothing");

        let synthesized = Event::synthesized(EventKind::Complete, json!({"completed": true}));
        assert_eq!(format_event(&synthesized), "[   -] complete: done");
    }

    #[test]
    fn summarizes_verdicts() {
        let verdicts = event(
            5,
            EventKind::Verdicts,
            json!({"claims": [
                ["S1", [{"text": "a", "status": "verified", "result": "Supported"}]],
                ["S2", [
                    {"text": "b", "status": "verified", "result": "Refuted"},
                    {"text": "c", "status": "verified", "result": "Supported"}
                ]]
            ]}),
        );
        assert_eq!(
            summarize(&verdicts),
            "3 claim(s): 2 supported, 1 refuted"
        );
        let sentences = event(4, EventKind::Sentences, json!({"claims": [["S1", []], ["S2", []]]}));
        assert_eq!(summarize(&sentences), "2 sentence(s)");
    }

    #[test]
    fn long_metadata_text_is_truncated() {
        let long = "word ".repeat(40);
        let metadata = event(3, EventKind::Metadata, json!({"text": long}));
        let summary = summarize(&metadata);
        assert!(summary.ends_with("..."));
        assert_eq!(summary.chars().count(), 63);
    }

    #[tokio::test]
    async fn error_event_fails_the_stream() {
        let events = vec![
            event(3, EventKind::Metadata, json!({"text": "t"})),
            event(4, EventKind::Error, json!({"message": "boom", "run_id": "agent-error"})),
        ];
        let err = print_stream(stream::iter(events)).await.unwrap_err();
        assert_eq!(err.to_string(), "check failed: boom");

        let ok = vec![event(5, EventKind::Complete, json!({"completed": true}))];
        print_stream(stream::iter(ok)).await.unwrap();
    }
}
