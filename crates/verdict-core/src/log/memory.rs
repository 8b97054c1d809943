use std::collections::{HashMap, VecDeque};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::{RwLock, broadcast};
use tokio::time::Instant;
use tracing::debug;

use super::{EventLog, JobChannels, LogConfig};
use crate::event::{Event, EventKind};

#[derive(Debug)]
struct JobLog {
    events: VecDeque<Event>,
    last_seq: i64,
    expires_at: Instant,
}

impl JobLog {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

/// In-process [`EventLog`]. Logs are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    config: LogConfig,
    logs: RwLock<HashMap<String, JobLog>>,
    channels: JobChannels,
}

impl MemoryEventLog {
    pub fn new(config: LogConfig) -> Self {
        Self {
            config,
            logs: RwLock::new(HashMap::new()),
            channels: JobChannels::new(),
        }
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, job_id: &str, kind: EventKind, payload: Value) -> Result<Event> {
        let now = Instant::now();
        let event = {
            let mut logs = self.logs.write().await;
            let log = logs.entry(job_id.to_owned()).or_insert_with(|| JobLog {
                events: VecDeque::new(),
                last_seq: 0,
                expires_at: now,
            });
            if log.is_expired(now) && log.last_seq > 0 {
                debug!(job_id, "replacing expired log");
                log.events.clear();
                log.last_seq = 0;
            }

            log.last_seq += 1;
            let event = Event {
                seq: log.last_seq,
                kind,
                payload,
                produced_at: Utc::now(),
            };
            log.events.push_back(event.clone());
            while log.events.len() > self.config.max_events {
                log.events.pop_front();
            }
            log.expires_at = now + self.config.retention;
            event
        };

        self.channels.publish(job_id, event.seq);
        Ok(event)
    }

    async fn read(&self, job_id: &str) -> Vec<Event> {
        let now = Instant::now();
        let logs = self.logs.read().await;
        match logs.get(job_id) {
            Some(log) if !log.is_expired(now) => log.events.iter().cloned().collect(),
            _ => Vec::new(),
        }
    }

    async fn exists(&self, job_id: &str) -> Result<bool> {
        let now = Instant::now();
        let logs = self.logs.read().await;
        Ok(logs
            .get(job_id)
            .is_some_and(|log| !log.is_expired(now) && !log.events.is_empty()))
    }

    fn subscribe(&self, job_id: &str) -> broadcast::Receiver<i64> {
        self.channels.subscribe(job_id)
    }

    async fn purge_expired(&self) -> Result<u64> {
        let now = Instant::now();
        let mut logs = self.logs.write().await;
        let before = logs.len();
        logs.retain(|_, log| !log.is_expired(now));
        Ok((before - logs.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::event::Cursor;
    use serde_json::json;

    fn seqs(events: &[Event]) -> Vec<i64> {
        events.iter().map(|e| e.seq).collect()
    }

    #[tokio::test]
    async fn create_writes_start_event() {
        let log = MemoryEventLog::new(LogConfig::default());
        let start = log.create("job-1").await.unwrap();
        assert_eq!(start.seq, 1);
        assert_eq!(start.kind, EventKind::Start);
        assert_eq!(start.payload["streamId"], "job-1");
        assert!(log.exists("job-1").await.unwrap());
        assert!(!log.exists("job-2").await.unwrap());
    }

    #[tokio::test]
    async fn append_orders_events_per_job() {
        let log = MemoryEventLog::new(LogConfig::default());
        log.create("job-1").await.unwrap();
        log.append("job-1", EventKind::Claims, json!({"n": 1})).await.unwrap();
        log.create("job-2").await.unwrap();
        log.append("job-1", EventKind::Claims, json!({"n": 2})).await.unwrap();

        assert_eq!(seqs(&log.read("job-1").await), vec![1, 2, 3]);
        assert_eq!(seqs(&log.read("job-2").await), vec![1]);
        assert_eq!(
            seqs(&log.read_from("job-1", Cursor::After(1)).await),
            vec![2, 3]
        );
    }

    #[tokio::test]
    async fn append_trims_oldest_first() {
        let log = MemoryEventLog::new(LogConfig {
            max_events: 3,
            ..LogConfig::default()
        });
        for n in 0..5 {
            log.append("job-1", EventKind::Claims, json!({ "n": n })).await.unwrap();
        }
        assert_eq!(seqs(&log.read("job-1").await), vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn expired_logs_read_empty_and_purge() {
        let log = MemoryEventLog::new(LogConfig {
            retention: Duration::ZERO,
            ..LogConfig::default()
        });
        log.create("job-1").await.unwrap();

        assert!(log.read("job-1").await.is_empty());
        assert!(!log.exists("job-1").await.unwrap());
        assert_eq!(log.purge_expired().await.unwrap(), 1);
        assert_eq!(log.purge_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn append_after_expiry_restarts_the_sequence() {
        let log = MemoryEventLog::new(LogConfig {
            retention: Duration::ZERO,
            ..LogConfig::default()
        });
        log.create("job-1").await.unwrap();
        let again = log.create("job-1").await.unwrap();
        assert_eq!(again.seq, 1);
    }

    #[tokio::test]
    async fn append_publishes_seq() {
        let log = MemoryEventLog::new(LogConfig::default());
        let mut rx = log.subscribe("job-1");
        log.create("job-1").await.unwrap();
        log.append("job-1", EventKind::Metadata, json!({})).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), 1);
        assert_eq!(rx.recv().await.unwrap(), 2);
    }
}
