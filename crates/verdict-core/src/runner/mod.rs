//! The seam to the external verification agent.
//!
//! An [`AgentRunner`] starts one verification run and hands back a stream
//! of raw `{event, data}` messages. The relay normalizes and records them;
//! the runner does not interpret them.

mod command;
mod scripted;

pub use command::CommandRunner;
pub use scripted::{ChannelRunner, ScriptedRunner};

use std::pin::Pin;

use anyhow::Result;
use async_trait::async_trait;
use futures::Stream;

use crate::normalize::RawMessage;

/// What the agent is asked to verify.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub job_id: String,
    pub content: String,
}

/// Messages of one run. An `Err` item means the run broke down; the relay
/// stops reading after it.
pub type RunStream = Pin<Box<dyn Stream<Item = Result<RawMessage>> + Send>>;

/// Adapter interface for verification agents.
///
/// Object-safe so it can be shared as `Arc<dyn AgentRunner>`.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Human-readable name for logs (e.g. "command").
    fn name(&self) -> &str;

    /// Start a run. Errors here mean the agent could not be started at all.
    async fn start(&self, request: &RunRequest) -> Result<RunStream>;
}

// Compile-time assertion: AgentRunner must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn AgentRunner) {}
};
