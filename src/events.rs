//! Progress and completion events, and the emitter that fans them out to subscribers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::Result;
use crate::patterns::ProgressFields;

/// Point-in-time encoding progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub elapsed: Duration,
    /// Zero until the input duration has been seen.
    pub total_duration: Duration,
    pub frame: Option<u64>,
    pub fps: Option<f64>,
    pub size_kb: Option<u64>,
    pub bitrate_kbps: Option<f64>,
    pub speed: Option<f64>,
}

impl ProgressSnapshot {
    pub fn new(fields: ProgressFields, total_duration: Duration) -> Self {
        Self {
            elapsed: fields.elapsed,
            total_duration,
            frame: fields.frame,
            fps: fields.fps,
            size_kb: fields.size_kb,
            bitrate_kbps: fields.bitrate_kbps,
            speed: fields.speed,
        }
    }

    /// Fraction of the input processed, in `[0, 1]`; `None` while the total is unknown.
    pub fn ratio(&self) -> Option<f64> {
        if self.total_duration.is_zero() {
            return None;
        }
        Some((self.elapsed.as_secs_f64() / self.total_duration.as_secs_f64()).min(1.0))
    }
}

/// The child announced in its output that it finished writing.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionFact {
    pub total_duration: Duration,
    pub last_progress: Option<ProgressSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum TranscodeEvent {
    Progress(ProgressSnapshot),
    Completed(CompletionFact),
}

impl TranscodeEvent {
    pub fn total_duration(&self) -> Duration {
        match self {
            TranscodeEvent::Progress(snapshot) => snapshot.total_duration,
            TranscodeEvent::Completed(fact) => fact.total_duration,
        }
    }
}

/// Receives events from an [`EventEmitter`].
///
/// An error returned here is fatal for the invocation that produced the event.
pub trait EventSubscriber: Send + Sync {
    fn on_event(&self, event: &TranscodeEvent) -> Result<()>;
}

impl<F> EventSubscriber for F
where
    F: Fn(&TranscodeEvent) -> Result<()> + Send + Sync,
{
    fn on_event(&self, event: &TranscodeEvent) -> Result<()> {
        self(event)
    }
}

/// Forwards events into an unbounded channel. A dropped receiver is not an error.
pub struct ChannelSubscriber {
    sender: mpsc::UnboundedSender<TranscodeEvent>,
}

impl EventSubscriber for ChannelSubscriber {
    fn on_event(&self, event: &TranscodeEvent) -> Result<()> {
        if self.sender.send(event.clone()).is_err() {
            trace!("event receiver dropped");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Multi-subscriber notification list. Subscribers are notified in registration order.
#[derive(Default)]
pub struct EventEmitter {
    next_id: AtomicU64,
    subscribers: RwLock<Vec<(SubscriptionId, Arc<dyn EventSubscriber>)>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push((id, subscriber));
        id
    }

    /// Subscribe a channel and return its receiving end.
    pub fn channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<TranscodeEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.subscribe(Arc::new(ChannelSubscriber { sender }));
        (id, receiver)
    }

    /// Returns whether the subscription existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(existing, _)| *existing != id);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Notify every subscriber, stopping at the first failure.
    pub fn notify(&self, event: &TranscodeEvent) -> Result<()> {
        // Subscribers may (un)subscribe from inside the callback.
        let subscribers: Vec<Arc<dyn EventSubscriber>> = self
            .subscribers
            .read()
            .iter()
            .map(|(_, subscriber)| Arc::clone(subscriber))
            .collect();

        for subscriber in subscribers {
            subscriber.on_event(event)?;
        }
        Ok(())
    }
}
