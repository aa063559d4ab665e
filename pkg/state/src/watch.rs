use pkg_constants::state::WATCH_CHANNEL_CAPACITY;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::sync::broadcast;

/// Type of event in the watch stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventType {
    Put,
    Delete,
}

/// A single watch event representing a state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchEvent {
    pub seq: u64,
    pub event_type: EventType,
    pub key: String,
    #[serde(default)]
    pub value: Option<Vec<u8>>,
}

/// In-memory event log that tracks all state mutations with monotonic sequence numbers.
/// Clients can subscribe to receive events as they are emitted.
#[derive(Clone)]
pub struct EventLog {
    inner: Arc<RwLock<EventLogInner>>,
    sender: broadcast::Sender<WatchEvent>,
}

struct EventLogInner {
    seq: u64,
    /// Ring buffer of recent events (capped)
    events: VecDeque<WatchEvent>,
    max_events: usize,
}

impl EventLog {
    /// Create a new event log with the given capacity for recent events.
    pub fn new(max_events: usize) -> Self {
        let (sender, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(RwLock::new(EventLogInner {
                seq: 0,
                events: VecDeque::with_capacity(max_events),
                max_events,
            })),
            sender,
        }
    }

    /// Record a new event. Called internally by StateStore on put/delete.
    pub async fn emit(&self, event_type: EventType, key: String, value: Option<Vec<u8>>) {
        let mut inner = self.inner.write().await;
        inner.seq += 1;
        let event = WatchEvent {
            seq: inner.seq,
            event_type,
            key,
            value,
        };
        if inner.events.len() >= inner.max_events {
            inner.events.pop_front();
        }
        inner.events.push_back(event.clone());
        // Broadcast to subscribers (ignore errors if no receivers)
        let _ = self.sender.send(event);
    }

    /// Get the current sequence number.
    pub async fn current_seq(&self) -> u64 {
        self.inner.read().await.seq
    }

    /// Get all events after `from_seq`.
    ///
    /// Returns `None` when the ring buffer has already dropped some of them,
    /// in which case the caller must fall back to a full relist.
    pub async fn events_since(&self, from_seq: u64) -> Option<Vec<WatchEvent>> {
        let inner = self.inner.read().await;
        if from_seq >= inner.seq {
            return Some(Vec::new());
        }
        let oldest = inner.events.front().map(|e| e.seq)?;
        if oldest > from_seq + 1 {
            return None;
        }
        Some(
            inner
                .events
                .iter()
                .filter(|e| e.seq > from_seq)
                .cloned()
                .collect(),
        )
    }

    /// Subscribe to receive new events as they are emitted.
    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ring_buffer_keeps_latest_events() {
        let log = EventLog::new(2);
        for i in 0..3 {
            log.emit(EventType::Put, format!("/registry/pods/default/p{}", i), None)
                .await;
        }
        assert_eq!(log.current_seq().await, 3);

        // seq 1 fell out of the ring, so a replay from 0 is incomplete
        assert!(log.events_since(0).await.is_none());

        let retained = log.events_since(1).await.unwrap();
        let seqs: Vec<u64> = retained.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![2, 3]);

        assert!(log.events_since(3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_log_replays_nothing() {
        let log = EventLog::new(4);
        assert_eq!(log.events_since(0).await.map(|v| v.len()), Some(0));
    }
}
