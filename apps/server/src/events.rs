use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::models::{BookingStatus, CancelReason, PricingSnapshot};

/// Common payload carried by every booking event: id, new status, staff,
/// and the immutable pricing snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct BookingFacts {
    pub booking_id: i64,
    pub staff_id: i64,
    pub client_id: i64,
    pub status: BookingStatus,
    pub starts_at: DateTime<Utc>,
    pub snapshot: PricingSnapshot,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    BookingHeld(BookingFacts),
    BookingConfirmed(BookingFacts),
    BookingRescheduled(BookingFacts),
    BookingCancelled {
        #[serde(flatten)]
        facts: BookingFacts,
        reason: CancelReason,
    },
    HoldExpired(BookingFacts),
    InvoiceIssued {
        #[serde(flatten)]
        facts: BookingFacts,
        invoice_url: String,
    },
    ReminderDue {
        booking_id: i64,
        staff_id: i64,
        client_id: i64,
        starts_at: DateTime<Utc>,
        lead_minutes: i64,
        idempotency_key: String,
    },
    CatalogInvalidated,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    /// Monotonic per-process id; envelopes published later carry larger ids.
    pub correlation_id: u64,
    pub occurred_at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: DomainEvent,
}

/// In-process typed fan-out. Publishers call `publish` strictly after their
/// transaction commits; delivery within the process is at-least-once and
/// subscribers must be idempotent. A slow subscriber that overruns the
/// channel capacity loses oldest events (it sees `Lagged`), never blocks
/// the publisher.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EventEnvelope>,
    seq: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            seq: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn publish(&self, event: DomainEvent) -> u64 {
        let correlation_id = self.seq.fetch_add(1, Ordering::SeqCst);
        let envelope = EventEnvelope {
            correlation_id,
            occurred_at: Utc::now(),
            event,
        };
        // Err means no live subscribers; events are droppable then.
        let _ = self.tx.send(envelope);
        correlation_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn correlation_ids_are_monotonic_and_delivery_ordered() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        let first = bus.publish(DomainEvent::CatalogInvalidated);
        let second = bus.publish(DomainEvent::CatalogInvalidated);
        assert!(second > first);

        let got_first = rx.recv().await.unwrap();
        let got_second = rx.recv().await.unwrap();
        assert_eq!(got_first.correlation_id, first);
        assert_eq!(got_second.correlation_id, second);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new(4);
        bus.publish(DomainEvent::CatalogInvalidated);
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let value = serde_json::to_value(DomainEvent::CatalogInvalidated).unwrap();
        assert_eq!(value["type"], "catalog_invalidated");
    }
}
