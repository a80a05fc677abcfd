use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// Per-subscriber queue depth. When a subscriber falls this far behind,
/// its oldest events are dropped.
const SUBSCRIBER_QUEUE_DEPTH: usize = 256;

/// Canonical event types emitted by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    PrinterStateChanged,
    StatusUpdated,
    PrinterOnline,
    PrinterOffline,
    PrinterError,
    PrintStarted,
    PrintPaused,
    PrintResumed,
    PrintStopped,
    JobCompleted,
    JobFailed,
    LibraryFileAdded,
    LibraryFileDeleted,
    ThumbnailCached,
    SubscriberDropped,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PrinterStateChanged => "printer_state_changed",
            EventType::StatusUpdated => "status_updated",
            EventType::PrinterOnline => "printer_online",
            EventType::PrinterOffline => "printer_offline",
            EventType::PrinterError => "printer_error",
            EventType::PrintStarted => "print_started",
            EventType::PrintPaused => "print_paused",
            EventType::PrintResumed => "print_resumed",
            EventType::PrintStopped => "print_stopped",
            EventType::JobCompleted => "job_completed",
            EventType::JobFailed => "job_failed",
            EventType::LibraryFileAdded => "library_file_added",
            EventType::LibraryFileDeleted => "library_file_deleted",
            EventType::ThumbnailCached => "thumbnail_cached",
            EventType::SubscriberDropped => "subscriber_dropped",
        }
    }
}

/// A typed record published on the bus.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(event_type: EventType, payload: serde_json::Value) -> Self {
        Self {
            event_type,
            occurred_at: Utc::now(),
            payload,
        }
    }
}

/// In-process publish/subscribe fan-out.
///
/// Publishing never waits on a consumer: each subscriber reads from a
/// bounded queue, and a subscriber that falls behind loses its oldest
/// events rather than stalling the publisher. Delivery order matches
/// publication order for any single publisher/subscriber pair.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    lagged_total: AtomicU64,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(SUBSCRIBER_QUEUE_DEPTH);
        Arc::new(Self {
            tx,
            lagged_total: AtomicU64::new(0),
        })
    }

    /// Publish an event. Infallible from the caller's perspective: with
    /// no subscribers the event is simply discarded.
    pub fn publish(&self, event_type: EventType, payload: serde_json::Value) {
        let event = Event::new(event_type, payload);
        tracing::debug!(event_type = event_type.as_str(), "publishing event");
        let _ = self.tx.send(event);
    }

    /// Subscribe to all events.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        self.subscribe_filtered(|_| true)
    }

    /// Subscribe to events matching `filter`. The returned subscription
    /// is cancelled by dropping it.
    pub fn subscribe_filtered<F>(self: &Arc<Self>, filter: F) -> Subscription
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        Subscription {
            rx: self.tx.subscribe(),
            filter: Box::new(filter),
            bus: Arc::clone(self),
            dropped_in_burst: 0,
        }
    }

    /// Total events dropped across all subscribers since startup.
    pub fn subscriber_lag(&self) -> u64 {
        self.lagged_total.load(Ordering::Relaxed)
    }

    fn record_lag(&self, count: u64) {
        self.lagged_total.fetch_add(count, Ordering::Relaxed);
    }
}

/// A cancellable stream of events for one subscriber.
pub struct Subscription {
    rx: broadcast::Receiver<Event>,
    filter: Box<dyn Fn(&Event) -> bool + Send + Sync>,
    bus: Arc<EventBus>,
    dropped_in_burst: u64,
}

impl Subscription {
    /// Receive the next matching event, or `None` once the bus shuts
    /// down. Events lost to backpressure are counted and reported as a
    /// single `subscriber_dropped` event per burst.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if self.dropped_in_burst > 0 {
                        let dropped = self.dropped_in_burst;
                        self.dropped_in_burst = 0;
                        self.bus.publish(
                            EventType::SubscriberDropped,
                            serde_json::json!({ "dropped": dropped }),
                        );
                    }
                    if (self.filter)(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(dropped = n, "event subscriber lagging, oldest events dropped");
                    self.bus.record_lag(n);
                    self.dropped_in_burst += n;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_in_publication_order() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();

        for i in 0..10 {
            bus.publish(EventType::StatusUpdated, serde_json::json!({ "seq": i }));
        }

        for i in 0..10 {
            let event = sub.recv().await.expect("event");
            assert_eq!(event.payload["seq"], i);
        }
    }

    #[tokio::test]
    async fn filter_skips_unmatched_events() {
        let bus = EventBus::new();
        let mut sub =
            bus.subscribe_filtered(|e| e.event_type == EventType::LibraryFileAdded);

        bus.publish(EventType::StatusUpdated, serde_json::json!({}));
        bus.publish(EventType::LibraryFileAdded, serde_json::json!({ "checksum": "abc" }));

        let event = sub.recv().await.expect("event");
        assert_eq!(event.event_type, EventType::LibraryFileAdded);
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest_and_counts_lag() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();

        // Overfill the subscriber queue before draining.
        for i in 0..(SUBSCRIBER_QUEUE_DEPTH + 50) {
            bus.publish(EventType::StatusUpdated, serde_json::json!({ "seq": i }));
        }

        // The first received event is not the first published one.
        let first = sub.recv().await.expect("event");
        assert!(first.payload["seq"].as_u64().unwrap() >= 50);
        assert!(bus.subscriber_lag() >= 50);
    }

    #[tokio::test]
    async fn publisher_never_blocks_without_subscribers() {
        let bus = EventBus::new();
        bus.publish(EventType::PrinterOnline, serde_json::json!({ "printer_id": "p1" }));
    }
}
