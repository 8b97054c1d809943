use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;

/// Wakeups buffered per subscriber. A reader that lags simply polls.
const CHANNEL_CAPACITY: usize = 16;

/// Per-job broadcast channels for append notifications.
///
/// Channels are created on first subscribe and dropped once they have no
/// subscribers left.
#[derive(Debug, Default)]
pub struct JobChannels {
    senders: Mutex<HashMap<String, broadcast::Sender<i64>>>,
}

impl JobChannels {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, broadcast::Sender<i64>>> {
        self.senders.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self, job_id: &str) -> broadcast::Receiver<i64> {
        let mut senders = self.lock();
        senders.retain(|_, tx| tx.receiver_count() > 0);
        senders
            .entry(job_id.to_owned())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Notify the job's subscribers, if any.
    pub fn publish(&self, job_id: &str, seq: i64) {
        let mut senders = self.lock();
        if let Some(tx) = senders.get(job_id) {
            if tx.send(seq).is_err() {
                senders.remove(job_id);
            }
        }
    }

    /// Number of jobs with live subscribers.
    pub fn len(&self) -> usize {
        self.lock()
            .values()
            .filter(|tx| tx.receiver_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
