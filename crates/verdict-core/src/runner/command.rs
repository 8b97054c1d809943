//! Runs the agent as a subprocess speaking JSONL.
//!
//! The submitted text is written to the child's stdin, which is then
//! closed. Every non-empty stdout line must be an `{event, data}` envelope;
//! lines that are not are logged and skipped. A non-zero exit or a timeout
//! ends the stream with an error.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::{AgentRunner, RunRequest, RunStream};
use crate::normalize::parse_envelope;

/// How long a child gets to exit after SIGTERM before it is killed.
const TERM_GRACE: Duration = Duration::from_secs(5);

/// [`AgentRunner`] that spawns a command per run.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl CommandRunner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: None,
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Kill runs that take longer than `timeout` in total.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// SIGTERM, then SIGKILL if the child is still around after the grace
/// period.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: pid belongs to a child we spawned and have not reaped.
            let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if ret != 0 {
                warn!(pid, "SIGTERM failed, proceeding to SIGKILL");
            }
        }
    }

    match tokio::time::timeout(TERM_GRACE, child.wait()).await {
        Ok(Ok(status)) => debug!(%status, "agent exited after SIGTERM"),
        _ => {
            debug!("agent did not exit after SIGTERM, killing");
            let _ = child.kill().await;
        }
    }
}

#[async_trait]
impl AgentRunner for CommandRunner {
    fn name(&self) -> &str {
        "command"
    }

    async fn start(&self, request: &RunRequest) -> Result<RunStream> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("VERDICT_JOB_ID", &request.job_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn agent command '{}'", self.program))?;

        info!(
            job_id = %request.job_id,
            program = %self.program,
            pid = child.id(),
            "agent started"
        );

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(request.content.as_bytes()).await {
                warn!(job_id = %request.job_id, error = %e, "failed to write content to agent stdin");
            }
            // Closing stdin tells the agent the input is complete.
            drop(stdin);
        }

        let stdout = child
            .stdout
            .take()
            .context("agent stdout was not captured")?;
        let job_id = request.job_id.clone();
        let timeout = self.timeout;

        let stream = async_stream::stream! {
            let mut child = child;
            let mut lines = BufReader::new(stdout).lines();
            let deadline = timeout.map(|t| tokio::time::Instant::now() + t);

            loop {
                let next = match deadline {
                    Some(deadline) => {
                        match tokio::time::timeout_at(deadline, lines.next_line()).await {
                            Ok(next) => next,
                            Err(_elapsed) => {
                                warn!(job_id = %job_id, "agent timed out");
                                terminate(&mut child).await;
                                yield Err(anyhow!(
                                    "agent timed out after {}s",
                                    timeout.unwrap_or_default().as_secs()
                                ));
                                return;
                            }
                        }
                    }
                    None => lines.next_line().await,
                };

                match next {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        match parse_envelope(trimmed) {
                            Ok(msg) => yield Ok(msg),
                            Err(e) => {
                                warn!(job_id = %job_id, line = trimmed, error = %e, "skipping malformed agent line");
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        terminate(&mut child).await;
                        yield Err(anyhow::Error::new(e).context("failed to read agent stdout"));
                        return;
                    }
                }
            }

            match child.wait().await {
                Ok(status) if status.success() => {
                    debug!(job_id = %job_id, "agent exited cleanly");
                }
                Ok(status) => yield Err(anyhow!("agent exited with {status}")),
                Err(e) => yield Err(anyhow::Error::new(e).context("failed to wait for agent")),
            }
        };

        Ok(Box::pin(stream))
    }
}
