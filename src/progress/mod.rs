//! Progress Hub: fan-out of session state-change events to live observers.
//!
//! One bounded broadcast channel per session. Publishing is fire-and-forget
//! relative to the orchestration loop's forward progress: a slow or
//! disconnected subscriber only ever loses *its own* oldest buffered
//! events, and recovers full state with a fresh store `get`. Events are
//! designed to be replaceable by a state poll.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::session::{Session, SessionStatus};

/// Default per-subscriber buffer capacity.
pub const DEFAULT_BUFFER: usize = 64;

/// An immutable, sequence-numbered snapshot of a session mutation.
///
/// `seq` is the session's persisted revision at the time of the mutation,
/// so ordering is consistent across restarts and an observer can compare
/// an event against a polled record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub session_id: Uuid,
    pub seq: u64,
    pub status: SessionStatus,
    pub completed_features: usize,
    pub total_features: usize,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn snapshot(session: &Session) -> Self {
        Self {
            session_id: session.id,
            seq: session.revision,
            status: session.status,
            completed_features: session.completed_features(),
            total_features: session.total_features(),
            timestamp: Utc::now(),
        }
    }
}

/// A cancellable, lazy sequence of one session's progress events.
///
/// Ends after the session's terminal event has been delivered, or when the
/// hub retires the channel. Dropping the subscription cancels it.
pub struct Subscription {
    rx: broadcast::Receiver<ProgressEvent>,
    done: bool,
}

impl Subscription {
    /// Receive the next event, in sequence order. Returns `None` once the
    /// terminal event has been delivered or the channel is gone. A lagged
    /// subscriber silently skips the events its buffer dropped and
    /// continues from the oldest still buffered.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        if self.done {
            return None;
        }
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if event.status.is_terminal() {
                        self.done = true;
                    }
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "progress subscriber lagged, dropped oldest events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.done = true;
                    return None;
                }
            }
        }
    }
}

/// Concurrent publish/subscribe distribution of progress events.
pub struct ProgressHub {
    buffer: usize,
    channels: Mutex<HashMap<Uuid, broadcast::Sender<ProgressEvent>>>,
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

impl ProgressHub {
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Publish an event to the session's subscribers. Non-blocking,
    /// best-effort: with no subscribers the event is dropped. A terminal
    /// event retires the channel: subscribers drain what is buffered,
    /// receive the terminal event, and their subscriptions end.
    pub fn publish(&self, event: ProgressEvent) {
        let mut channels = self.channels.lock().expect("progress hub lock poisoned");
        let terminal = event.status.is_terminal();
        let session_id = event.session_id;

        let tx = channels
            .entry(session_id)
            .or_insert_with(|| broadcast::channel(self.buffer).0);
        // Ignore the error when no receivers are connected.
        let _ = tx.send(event);

        if terminal {
            channels.remove(&session_id);
        }
    }

    /// Subscribe to a session's event stream from this point on. The hub
    /// has no notion of session state: subscribing to a session that has
    /// already been retired yields a stream that only the next creation
    /// of the channel would feed, so callers should check the store for a
    /// terminal status first.
    pub fn subscribe(&self, session_id: Uuid) -> Subscription {
        let mut channels = self.channels.lock().expect("progress hub lock poisoned");
        let tx = channels
            .entry(session_id)
            .or_insert_with(|| broadcast::channel(self.buffer).0);
        Subscription {
            rx: tx.subscribe(),
            done: false,
        }
    }

    /// Number of live subscribers across all sessions. Test/inspection
    /// helper.
    pub fn subscriber_count(&self) -> usize {
        self.channels
            .lock()
            .expect("progress hub lock poisoned")
            .values()
            .map(|tx| tx.receiver_count())
            .sum()
    }
}
