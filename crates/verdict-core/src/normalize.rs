//! Maps raw agent messages onto the canonical event vocabulary.
//!
//! The agent reports progress as `{event, data}` envelopes whose `event`
//! names a workflow stage and whose `data` is keyed by the graph node that
//! produced it. Only a handful of shapes matter to consumers; everything
//! else is ignored.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::event::{
    ClaimData, ClaimGroups, ClaimSource, ClaimStatus, EventKind, VerificationResult,
    claims_payload,
};

/// Default message for an upstream failure that carries none.
pub const DEFAULT_UPSTREAM_ERROR: &str = "Agent workflow error";

/// Prefix of the sub-graph namespaced event that carries split sentences:
/// `updates|extract_claims:<task id>`.
const SENTENCE_SPLIT_PREFIX: &str = "updates|extract_claims:";

/// One message from the agent, before interpretation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    pub event: String,
    pub data: Value,
}

impl RawMessage {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

/// Why a line could not be read as a [`RawMessage`].
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("envelope is not a JSON object")]
    NotAnObject,
    #[error("envelope has no string `event` field")]
    MissingEvent,
    #[error("envelope has no `data` field")]
    MissingData,
}

/// Parse one JSONL line into an envelope.
pub fn parse_envelope(line: &str) -> Result<RawMessage, EnvelopeError> {
    let value: Value = serde_json::from_str(line)?;
    let Value::Object(mut obj) = value else {
        return Err(EnvelopeError::NotAnObject);
    };
    let event = match obj.remove("event") {
        Some(Value::String(event)) => event,
        _ => return Err(EnvelopeError::MissingEvent),
    };
    let data = obj.remove("data").ok_or(EnvelopeError::MissingData)?;
    Ok(RawMessage { event, data })
}

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

/// A recognized section of an agent message.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage<'a> {
    /// `data.sentence_splitter.contextual_sentences`
    SentenceSplit(&'a Value),
    /// `data.extract_claims.extracted_claims`
    ClaimsExtracted(&'a Value),
    /// `data.generate_report_node.final_report.verified_claims`
    ReportGenerated(&'a Value),
    UpstreamError { message: String },
    Unrecognized,
}

/// Decode the stages present in a message, in emission order.
pub fn stages(msg: &RawMessage) -> Vec<Stage<'_>> {
    if msg.event == "error" {
        let message = msg
            .data
            .get("message")
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty())
            .unwrap_or(DEFAULT_UPSTREAM_ERROR)
            .to_owned();
        return vec![Stage::UpstreamError { message }];
    }

    let mut found = Vec::new();
    if msg.event.starts_with(SENTENCE_SPLIT_PREFIX) {
        if let Some(v) = msg.data.pointer("/sentence_splitter/contextual_sentences") {
            found.push(Stage::SentenceSplit(v));
        }
    }
    if msg.event == "updates" {
        if let Some(v) = msg.data.pointer("/extract_claims/extracted_claims") {
            found.push(Stage::ClaimsExtracted(v));
        }
        if let Some(v) = msg
            .data
            .pointer("/generate_report_node/final_report/verified_claims")
        {
            found.push(Stage::ReportGenerated(v));
        }
    }

    if found.is_empty() {
        found.push(Stage::Unrecognized);
    }
    found
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEvent {
    pub kind: EventKind,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    /// Zero or more events to append, in order.
    Events(Vec<NormalizedEvent>),
    /// The agent reported a failure.
    UpstreamError { message: String },
}

/// Translate one agent message. Never fails: shapes that cannot be used
/// produce no events.
pub fn normalize(msg: &RawMessage) -> Normalized {
    let mut events = Vec::new();

    for stage in stages(msg) {
        let event = match stage {
            Stage::UpstreamError { message } => return Normalized::UpstreamError { message },
            Stage::Unrecognized => {
                debug!(event = %msg.event, "ignoring unrecognized agent message");
                None
            }
            Stage::SentenceSplit(items) => {
                grouped_event(EventKind::Sentences, sentence_groups(items))
            }
            Stage::ClaimsExtracted(items) => {
                grouped_event(EventKind::Claims, group_by_sentence(items, pending_claim))
            }
            Stage::ReportGenerated(items) => {
                grouped_event(EventKind::Verdicts, group_by_sentence(items, verified_claim))
            }
        };
        events.extend(event);
    }

    Normalized::Events(events)
}

fn grouped_event(kind: EventKind, groups: ClaimGroups) -> Option<NormalizedEvent> {
    (!groups.is_empty()).then(|| NormalizedEvent {
        kind,
        payload: claims_payload(&groups),
    })
}

fn sentence_groups(items: &Value) -> ClaimGroups {
    let mut groups: ClaimGroups = Vec::new();
    for item in items.as_array().into_iter().flatten() {
        let Some(sentence) = item.get("original_sentence").and_then(Value::as_str) else {
            continue;
        };
        if !groups.iter().any(|(s, _)| s == sentence) {
            groups.push((sentence.to_owned(), Vec::new()));
        }
    }
    groups
}

/// Group claims under their `original_sentence`, keeping first-seen
/// sentence order and arrival order within a sentence. Items `parse`
/// rejects are skipped.
fn group_by_sentence(items: &Value, parse: fn(&Value) -> Option<ClaimData>) -> ClaimGroups {
    let mut groups: ClaimGroups = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for item in items.as_array().into_iter().flatten() {
        let Some(sentence) = item.get("original_sentence").and_then(Value::as_str) else {
            continue;
        };
        let Some(claim) = parse(item) else {
            continue;
        };
        let slot = *index.entry(sentence.to_owned()).or_insert_with(|| {
            groups.push((sentence.to_owned(), Vec::new()));
            groups.len() - 1
        });
        groups[slot].1.push(claim);
    }
    groups
}

fn pending_claim(item: &Value) -> Option<ClaimData> {
    let text = item.get("claim_text").and_then(Value::as_str)?;
    Some(ClaimData::pending(text))
}

fn verified_claim(item: &Value) -> Option<ClaimData> {
    let text = item.get("claim_text").and_then(Value::as_str)?;
    let result: VerificationResult = serde_json::from_value(item.get("result")?.clone()).ok()?;
    let reasoning = item
        .get("reasoning")
        .and_then(Value::as_str)
        .map(str::to_owned);
    let sources = item
        .get("sources")
        .and_then(Value::as_array)
        .map(|sources| {
            sources
                .iter()
                .filter_map(|s| serde_json::from_value::<ClaimSource>(s.clone()).ok())
                .collect()
        })
        .unwrap_or_default();

    Some(ClaimData {
        text: text.to_owned(),
        status: ClaimStatus::Verified,
        result: Some(result),
        reasoning,
        sources: Some(sources),
    })
}
