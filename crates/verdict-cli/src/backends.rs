//! Wiring of the configured log, store and agent runner.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use verdict_core::log::{EventLog, MemoryEventLog, PgEventLog};
use verdict_core::runner::{AgentRunner, CommandRunner, ScriptedRunner};
use verdict_core::service::CheckService;
use verdict_core::store::{JobStore, PgJobStore};
use verdict_core::tail::TailReader;
use verdict_db::pool;

use crate::config::{LogBackend, RelaySection, VerdictConfig};

/// Process-wide storage handles. Built once, shared by every command.
pub struct Backends {
    pool: PgPool,
    pub log: Arc<dyn EventLog>,
    pub store: Arc<dyn JobStore>,
    relay: RelaySection,
    cancel: CancellationToken,
    listener: Option<JoinHandle<()>>,
}

impl Backends {
    /// Connect to the database and build the configured log backend. With
    /// the PostgreSQL log, also start the notification listener.
    pub async fn connect(config: &VerdictConfig) -> Result<Self> {
        let pool = pool::create_pool(&config.db_config).await?;
        pool::check_schema(&pool).await?;
        let cancel = CancellationToken::new();
        let log_config = config.relay.log_config();

        let (log, listener): (Arc<dyn EventLog>, _) = match config.relay.log_backend {
            LogBackend::Postgres => {
                let log = PgEventLog::new(pool.clone(), log_config);
                let listener = log.start_listener(cancel.child_token()).await?;
                (Arc::new(log), Some(listener))
            }
            LogBackend::Memory => {
                info!("using in-memory event log; streams are only visible to this process");
                (Arc::new(MemoryEventLog::new(log_config)), None)
            }
        };

        Ok(Self {
            store: Arc::new(PgJobStore::new(pool.clone())),
            pool,
            log,
            relay: config.relay.clone(),
            cancel,
            listener,
        })
    }

    pub fn log_backend(&self) -> LogBackend {
        self.relay.log_backend
    }

    pub fn service(&self, runner: Arc<dyn AgentRunner>) -> CheckService {
        CheckService::new(
            Arc::clone(&self.log),
            Arc::clone(&self.store),
            runner,
            self.relay.service_config(),
        )
    }

    pub fn tail(&self) -> TailReader {
        TailReader::new(
            Arc::clone(&self.log),
            Arc::clone(&self.store),
            self.relay.service_config().tail,
        )
    }

    /// Stop the listener and close the pool.
    pub async fn close(self) {
        self.cancel.cancel();
        if let Some(listener) = self.listener {
            if let Err(e) = listener.await {
                debug!(error = %e, "event listener task ended abnormally");
            }
        }
        self.pool.close().await;
    }
}

/// Build the agent runner: a recorded transcript when `replay` is given,
/// otherwise the configured agent command.
pub fn agent_runner(config: &VerdictConfig, replay: Option<&Path>) -> Result<Arc<dyn AgentRunner>> {
    if let Some(path) = replay {
        let transcript = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read transcript {}", path.display()))?;
        let runner = ScriptedRunner::from_jsonl(&transcript);
        if runner.is_empty() {
            bail!("transcript {} contains no agent messages", path.display());
        }
        info!(path = %path.display(), messages = runner.len(), "replaying agent transcript");
        return Ok(Arc::new(runner));
    }

    let Some(command) = config.agent.command.as_deref() else {
        bail!(
            "no agent configured; set [agent] command in {} or VERDICT_AGENT_COMMAND, or pass --replay",
            crate::config::config_path().display()
        );
    };
    let mut runner = CommandRunner::new(command).with_args(config.agent.args.iter().cloned());
    if let Some(timeout) = config.agent_timeout() {
        runner = runner.with_timeout(timeout);
    }
    Ok(Arc::new(runner))
}
