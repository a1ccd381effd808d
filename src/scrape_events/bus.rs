//! Broadcast bus for scrape events.
//!
//! A thin wrapper over `tokio::sync::broadcast`. Publishing is best-effort:
//! events published with no subscriber are counted and dropped rather than
//! buffered, and a lagging subscriber loses the oldest events first.

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

use super::types::ScrapeEvent;

/// Errors surfaced by the event bus.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EventBusError {
    #[error("no active subscribers")]
    NoSubscribers,
}

/// Event bus shared by the scheduler, portal runs, and the refresh watcher.
#[derive(Debug)]
pub struct ScrapeEventBus {
    sender: broadcast::Sender<ScrapeEvent>,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl ScrapeEventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Subscribe to all future events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ScrapeEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all subscribers.
    ///
    /// Returns the number of subscribers the event reached, or
    /// `EventBusError::NoSubscribers` when nobody is listening (the event is
    /// dropped and counted, not an abort condition for callers).
    pub fn publish(&self, event: ScrapeEvent) -> Result<usize, EventBusError> {
        match self.sender.send(event) {
            Ok(receivers) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                Ok(receivers)
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(EventBusError::NoSubscribers)
            }
        }
    }

    /// Publish, ignoring the no-subscriber case. Most emit sites use this.
    pub fn emit(&self, event: ScrapeEvent) {
        let _ = self.publish(event);
    }

    /// Number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// True when at least one subscriber is attached.
    #[must_use]
    pub fn has_subscribers(&self) -> bool {
        self.subscriber_count() > 0
    }

    /// Events successfully published since creation.
    #[must_use]
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Events dropped for lack of subscribers since creation.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for ScrapeEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_with_no_subscribers() {
        let bus = ScrapeEventBus::new(8);
        let result = bus.publish(ScrapeEvent::log("", "hello"));
        assert_eq!(result, Err(EventBusError::NoSubscribers));
        assert_eq!(bus.dropped_count(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_and_publish() {
        let bus = ScrapeEventBus::new(8);
        let mut receiver = bus.subscribe();

        let reached = bus
            .publish(ScrapeEvent::status("HP Tenders", "starting"))
            .expect("publish should reach the subscriber");
        assert_eq!(reached, 1);

        let event = receiver.recv().await.expect("receive event");
        assert_eq!(event.portal(), "HP Tenders");
        assert_eq!(bus.published_count(), 1);
    }

    #[tokio::test]
    async fn test_emit_ignores_missing_subscribers() {
        let bus = ScrapeEventBus::default();
        bus.emit(ScrapeEvent::error("X", "boom"));
        assert_eq!(bus.dropped_count(), 1);
    }
}
