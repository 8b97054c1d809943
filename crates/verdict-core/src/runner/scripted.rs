//! Runners that replay prepared messages instead of running an agent.

use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tracing::warn;

use super::{AgentRunner, RunRequest, RunStream};
use crate::normalize::{RawMessage, parse_envelope};

/// Replays a fixed list of messages for every run, optionally ending in a
/// failure. Useful for demos and for driving the relay in tests.
#[derive(Debug, Clone, Default)]
pub struct ScriptedRunner {
    messages: Vec<RawMessage>,
    failure: Option<String>,
    delay: Duration,
}

impl ScriptedRunner {
    pub fn new(messages: Vec<RawMessage>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    /// Load a JSONL transcript, skipping lines that are not valid envelopes.
    pub fn from_jsonl(transcript: &str) -> Self {
        let messages = transcript
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .filter_map(|line| match parse_envelope(line) {
                Ok(msg) => Some(msg),
                Err(e) => {
                    warn!(line, error = %e, "skipping malformed transcript line");
                    None
                }
            })
            .collect();
        Self::new(messages)
    }

    /// End every run with a stream error after the messages.
    pub fn failing_with(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    /// Pause before each message.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[async_trait]
impl AgentRunner for ScriptedRunner {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn start(&self, _request: &RunRequest) -> Result<RunStream> {
        let messages = self.messages.clone();
        let failure = self.failure.clone();
        let delay = self.delay;

        Ok(Box::pin(async_stream::stream! {
            for msg in messages {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                yield Ok(msg);
            }
            if let Some(message) = failure {
                yield Err(anyhow!(message));
            }
        }))
    }
}

/// A runner whose single run is fed through a channel, so a test decides
/// exactly when each message arrives and when the run ends (by dropping the
/// sender).
#[derive(Debug)]
pub struct ChannelRunner {
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Result<RawMessage>>>>,
}

impl ChannelRunner {
    pub fn new() -> (Self, mpsc::UnboundedSender<Result<RawMessage>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                receiver: Mutex::new(Some(rx)),
            },
            tx,
        )
    }
}

#[async_trait]
impl AgentRunner for ChannelRunner {
    fn name(&self) -> &str {
        "channel"
    }

    async fn start(&self, _request: &RunRequest) -> Result<RunStream> {
        let mut receiver = self
            .receiver
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!("channel runner supports a single run"))?;

        Ok(Box::pin(async_stream::stream! {
            while let Some(item) = receiver.recv().await {
                yield item;
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    fn request() -> RunRequest {
        RunRequest {
            job_id: "job-1".to_owned(),
            content: String::new(),
        }
    }

    #[tokio::test]
    async fn scripted_runner_replays_then_fails() {
        let runner = ScriptedRunner::new(vec![RawMessage::new("updates", json!({}))])
            .failing_with("agent crashed");
        let items: Vec<_> = runner.start(&request()).await.unwrap().collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert_eq!(items[1].as_ref().unwrap_err().to_string(), "agent crashed");
    }

    #[test]
    fn transcript_skips_bad_lines() {
        let runner = ScriptedRunner::from_jsonl(
            "{\"event\":\"updates\",\"data\":{}}\n\nnope\n{\"event\":\"error\",\"data\":{\"message\":\"x\"}}\n",
        );
        assert_eq!(runner.len(), 2);
    }

    #[tokio::test]
    async fn channel_runner_runs_once() {
        let (runner, tx) = ChannelRunner::new();
        let mut stream = runner.start(&request()).await.unwrap();
        tx.send(Ok(RawMessage::new("updates", json!({})))).unwrap();
        drop(tx);
        assert!(stream.next().await.unwrap().is_ok());
        assert!(stream.next().await.is_none());
        assert!(runner.start(&request()).await.is_err());
    }
}
