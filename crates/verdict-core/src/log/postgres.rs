use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use verdict_db::models::JobEventRow;
use verdict_db::queries::job_events::{self, EVENTS_CHANNEL, Retention};

use super::{EventLog, JobChannels, LogConfig};
use crate::event::{Event, EventKind};

/// Delay before retrying after the notification listener loses its
/// connection.
const LISTENER_RETRY_DELAY: Duration = Duration::from_secs(1);

/// [`EventLog`] stored in PostgreSQL.
///
/// Appends go through a single transaction per event and emit a
/// `NOTIFY` on commit. [`PgEventLog::start_listener`] turns those
/// notifications into wakeups on the same per-job channels the in-memory
/// backend uses, so readers in any process see appends promptly.
#[derive(Debug, Clone)]
pub struct PgEventLog {
    pool: PgPool,
    config: LogConfig,
    channels: Arc<JobChannels>,
}

impl PgEventLog {
    pub fn new(pool: PgPool, config: LogConfig) -> Self {
        Self {
            pool,
            config,
            channels: Arc::new(JobChannels::new()),
        }
    }

    fn retention(&self) -> Retention {
        Retention {
            ttl_secs: self.config.retention.as_secs_f64(),
            max_events: i64::try_from(self.config.max_events).unwrap_or(i64::MAX),
        }
    }

    /// Listen for append notifications and fan them out to subscribers
    /// until `cancel` fires.
    pub async fn start_listener(&self, cancel: CancellationToken) -> Result<JoinHandle<()>> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .context("failed to connect event listener")?;
        listener
            .listen(EVENTS_CHANNEL)
            .await
            .with_context(|| format!("failed to LISTEN on {EVENTS_CHANNEL}"))?;
        info!(channel = EVENTS_CHANNEL, "event listener started");

        let channels = Arc::clone(&self.channels);
        Ok(tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = listener.recv() => received,
                };
                match received {
                    Ok(notification) => {
                        match job_events::parse_notification(notification.payload()) {
                            Some((job_id, seq)) => channels.publish(job_id, seq),
                            None => warn!(
                                payload = notification.payload(),
                                "ignoring malformed event notification"
                            ),
                        }
                    }
                    Err(e) => {
                        // PgListener reconnects on the next recv.
                        warn!(error = %e, "event listener lost its connection");
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(LISTENER_RETRY_DELAY) => {}
                        }
                    }
                }
            }
            debug!("event listener stopped");
        }))
    }
}

fn to_event(row: JobEventRow) -> Option<Event> {
    let (job_id, seq) = (row.job_id.clone(), row.seq);
    match Event::try_from(row) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(job_id = %job_id, seq, error = %e, "skipping stored event with unknown kind");
            None
        }
    }
}

#[async_trait]
impl EventLog for PgEventLog {
    async fn append(&self, job_id: &str, kind: EventKind, payload: Value) -> Result<Event> {
        let row =
            job_events::append_event(&self.pool, job_id, kind.as_str(), &payload, self.retention())
                .await?;
        Ok(Event {
            seq: row.seq,
            kind,
            payload: row.payload,
            produced_at: row.produced_at,
        })
    }

    async fn read(&self, job_id: &str) -> Vec<Event> {
        match job_events::list_events(&self.pool, job_id).await {
            Ok(rows) => rows.into_iter().filter_map(to_event).collect(),
            Err(e) => {
                warn!(job_id, error = %e, "failed to read event log");
                Vec::new()
            }
        }
    }

    async fn exists(&self, job_id: &str) -> Result<bool> {
        job_events::log_exists(&self.pool, job_id).await
    }

    fn subscribe(&self, job_id: &str) -> broadcast::Receiver<i64> {
        self.channels.subscribe(job_id)
    }

    async fn purge_expired(&self) -> Result<u64> {
        job_events::purge_expired_logs(&self.pool).await
    }
}
