//! Per-job event logs.
//!
//! A log is an append-only, ordered, size-bounded and idle-expiring
//! sequence of [`Event`]s for one job, written by that job's relay and read
//! by any number of tail readers. Every append is also published on a
//! per-job broadcast channel so readers can wake up without waiting for
//! their next poll.

mod channels;
mod memory;
mod postgres;

pub use channels::JobChannels;
pub use memory::MemoryEventLog;
pub use postgres::PgEventLog;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::event::{Cursor, Event, EventKind, start_payload};

/// Retention policy shared by all backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogConfig {
    /// How long a log lives after its latest append.
    pub retention: Duration,
    /// Number of newest events kept per job.
    pub max_events: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(24 * 60 * 60),
            max_events: 1000,
        }
    }
}

/// Storage for per-job event logs.
///
/// Exactly one writer (the job's relay) may append to a given job's log.
/// Event reads never fail: a backend that cannot read logs a warning and
/// reports no events. `exists` does fail, since "gone" is final to a reader
/// and must not be confused with "unreachable".
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Start a job's log with a `start` event and a fresh expiry.
    ///
    /// Calling this on a live log appends another `start` without clearing
    /// history; callers create each log once.
    async fn create(&self, job_id: &str) -> Result<Event> {
        self.append(job_id, EventKind::Start, start_payload(job_id))
            .await
    }

    /// Append an event, trim to the newest `max_events`, refresh the expiry
    /// and publish the new `seq`.
    async fn append(&self, job_id: &str, kind: EventKind, payload: Value) -> Result<Event>;

    /// All retained events, oldest first.
    async fn read(&self, job_id: &str) -> Vec<Event>;

    /// Retained events strictly after the cursor.
    ///
    /// A cursor that is no longer (or never was) in the retained sequence
    /// yields the whole sequence, so a reader that fell behind a trim
    /// re-receives events rather than missing any.
    async fn read_from(&self, job_id: &str, cursor: Cursor) -> Vec<Event> {
        events_after(self.read(job_id).await, cursor)
    }

    /// Whether the job has a live log.
    async fn exists(&self, job_id: &str) -> Result<bool>;

    /// Wakeups carrying the `seq` of each append to this job's log.
    fn subscribe(&self, job_id: &str) -> broadcast::Receiver<i64>;

    /// Drop every expired log. Returns how many were removed.
    async fn purge_expired(&self) -> Result<u64>;
}

// Compile-time assertion: EventLog must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn EventLog) {}
};

/// The part of `events` after the event with the cursor's `seq`, or all of
/// `events` when that event is not present.
pub fn events_after(events: Vec<Event>, cursor: Cursor) -> Vec<Event> {
    let Cursor::After(seq) = cursor else {
        return events;
    };
    match events.iter().position(|e| e.seq == seq) {
        Some(pos) => events.into_iter().skip(pos + 1).collect(),
        None => events,
    }
}
