use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};

use crate::error::BookingError;
use crate::events::{DomainEvent, EventBus};
use crate::models::CancelReason;

/// How long a delivered idempotency key suppresses redelivery.
const DEDUP_WINDOW: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "kind", content = "client_id", rename_all = "snake_case")]
pub enum Audience {
    Client(i64),
    Admin,
}

/// Fire-and-forget delivery port. Implementations must treat the
/// idempotency key as a deduplication handle.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(
        &self,
        audience: Audience,
        template_id: &str,
        context: serde_json::Value,
        idempotency_key: &str,
    ) -> Result<(), BookingError>;
}

/// Posts notification payloads to a configured webhook. The delivery
/// channel behind the webhook (chat bot, mailer) is somebody else's job.
pub struct WebhookNotifier {
    url: String,
    http: reqwest::Client,
    seen: DashMap<String, Instant>,
}

impl WebhookNotifier {
    pub fn new(url: String) -> Self {
        Self {
            url,
            http: reqwest::Client::new(),
            seen: DashMap::new(),
        }
    }

    fn already_sent(&self, key: &str) -> bool {
        if self.seen.len() > 4096 {
            let now = Instant::now();
            self.seen
                .retain(|_, sent_at| now.duration_since(*sent_at) < DEDUP_WINDOW);
        }
        match self.seen.get(key) {
            Some(sent_at) => sent_at.elapsed() < DEDUP_WINDOW,
            None => false,
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(
        &self,
        audience: Audience,
        template_id: &str,
        context: serde_json::Value,
        idempotency_key: &str,
    ) -> Result<(), BookingError> {
        if self.already_sent(idempotency_key) {
            return Ok(());
        }

        let payload = serde_json::json!({
            "audience": audience,
            "template_id": template_id,
            "context": context,
            "idempotency_key": idempotency_key,
        });

        let resp = self
            .http
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|err| {
                tracing::warn!(template_id, error = %err, "notifier webhook unreachable");
                BookingError::NotifierUnavailable
            })?;

        if !resp.status().is_success() {
            tracing::warn!(template_id, status = %resp.status(), "notifier webhook rejected payload");
            return Err(BookingError::NotifierUnavailable);
        }

        self.seen
            .insert(idempotency_key.to_string(), Instant::now());
        Ok(())
    }
}

/// Used when no webhook is configured: notifications land in the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(
        &self,
        audience: Audience,
        template_id: &str,
        context: serde_json::Value,
        idempotency_key: &str,
    ) -> Result<(), BookingError> {
        tracing::info!(
            ?audience,
            template_id,
            %context,
            idempotency_key,
            "notification (log sink)"
        );
        Ok(())
    }
}

/// Bridge from the event bus to the notifier port. Runs until the bus
/// closes; lagging only costs dropped notifications, never blocks writers.
pub async fn forward_events(bus: EventBus, notifier: std::sync::Arc<dyn Notifier>) {
    let mut rx = bus.subscribe();
    loop {
        let envelope = match rx.recv().await {
            Ok(envelope) => envelope,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "notifier subscriber lagged behind the event bus");
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        };

        let (audience, template, context, key) = match &envelope.event {
            DomainEvent::BookingConfirmed(facts) => (
                Audience::Admin,
                "booking_confirmed",
                serde_json::to_value(facts).unwrap_or_default(),
                format!("confirmed-{}", facts.booking_id),
            ),
            DomainEvent::BookingCancelled { facts, reason } => {
                let audience = match reason {
                    // The client acted; tell the business.
                    CancelReason::Client => Audience::Admin,
                    // The business or the system acted; tell the client.
                    CancelReason::Admin | CancelReason::PaymentFailed | CancelReason::Expired => {
                        Audience::Client(facts.client_id)
                    }
                };
                (
                    audience,
                    "booking_cancelled",
                    serde_json::json!({
                        "booking": facts,
                        "reason": reason,
                    }),
                    format!("cancelled-{}", facts.booking_id),
                )
            }
            DomainEvent::HoldExpired(facts) => (
                Audience::Client(facts.client_id),
                "hold_expired",
                serde_json::to_value(facts).unwrap_or_default(),
                format!("hold-expired-{}", facts.booking_id),
            ),
            DomainEvent::ReminderDue {
                booking_id,
                client_id,
                starts_at,
                lead_minutes,
                idempotency_key,
                ..
            } => (
                Audience::Client(*client_id),
                "booking_reminder",
                serde_json::json!({
                    "booking_id": booking_id,
                    "starts_at": starts_at,
                    "lead_minutes": lead_minutes,
                }),
                idempotency_key.clone(),
            ),
            // Held/rescheduled/invoice events feed analytics sinks, not
            // client notifications.
            _ => continue,
        };

        if let Err(err) = notifier.send(audience, template, context, &key).await {
            tracing::warn!(template, error = %err, "notification delivery failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    struct RecordingNotifier {
        sent: Mutex<Vec<(Audience, String, String)>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(
            &self,
            audience: Audience,
            template_id: &str,
            _context: serde_json::Value,
            idempotency_key: &str,
        ) -> Result<(), BookingError> {
            self.sent
                .lock()
                .await
                .push((audience, template_id.to_string(), idempotency_key.to_string()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn reminder_events_reach_the_client() {
        let bus = EventBus::new(16);
        let notifier = Arc::new(RecordingNotifier {
            sent: Mutex::new(Vec::new()),
        });
        let forwarder = tokio::spawn(forward_events(bus.clone(), notifier.clone()));

        bus.publish(DomainEvent::ReminderDue {
            booking_id: 7,
            staff_id: 1,
            client_id: 500,
            starts_at: crate::testing::utc(2025, 6, 10, 11, 0),
            lead_minutes: 120,
            idempotency_key: "reminder-7-120".into(),
        });

        // Give the forwarder a chance to drain.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        forwarder.abort();

        let sent = notifier.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, Audience::Client(500));
        assert_eq!(sent[0].1, "booking_reminder");
        assert_eq!(sent[0].2, "reminder-7-120");
    }

    #[tokio::test]
    async fn webhook_dedup_suppresses_repeat_keys() {
        let notifier = WebhookNotifier::new("http://127.0.0.1:1/unreachable".into());
        notifier.seen.insert("key-1".into(), Instant::now());

        // A repeated key short-circuits before any HTTP work.
        assert!(notifier
            .send(Audience::Admin, "t", serde_json::json!({}), "key-1")
            .await
            .is_ok());
        // A fresh key actually attempts delivery and fails against the
        // unreachable endpoint.
        assert!(matches!(
            notifier
                .send(Audience::Admin, "t", serde_json::json!({}), "key-2")
                .await,
            Err(BookingError::NotifierUnavailable)
        ));
    }
}
