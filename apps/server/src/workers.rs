use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::booking::StateMachine;
use crate::catalog::Catalog;
use crate::error::BookingError;
use crate::events::{DomainEvent, EventBus};
use crate::models::CancelReason;
use crate::payments::{PaymentProvider, PaymentState};
use crate::policy::Actor;

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub expire_interval: std::time::Duration,
    pub remind_interval: std::time::Duration,
    pub reconcile_interval: std::time::Duration,
    /// Rows handled per tick per worker.
    pub batch_limit: i64,
    /// How long a PENDING_PAYMENT row may sit before the reconciler polls
    /// the provider for it.
    pub reconcile_grace: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            expire_interval: std::time::Duration::from_secs(30),
            remind_interval: std::time::Duration::from_secs(60),
            reconcile_interval: std::time::Duration::from_secs(120),
            batch_limit: 200,
            reconcile_grace: Duration::seconds(60),
        }
    }
}

/// Spawn the three periodic workers. Each tick is idempotent and safe to
/// run in multiple replicas: the per-booking advisory lock plus the guarded
/// status transition mean a row is moved by exactly one worker.
pub fn spawn_all(
    machine: StateMachine,
    catalog: Catalog,
    bus: EventBus,
    payments: Arc<dyn PaymentProvider>,
    settings: WorkerSettings,
) {
    let expirer = machine.clone();
    let expire_every = settings.expire_interval;
    let batch = settings.batch_limit;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(expire_every);
        loop {
            interval.tick().await;
            match expire_due_holds(&expirer, batch, Utc::now()).await {
                Ok(0) => {}
                Ok(expired) => tracing::info!(expired, "expired stale holds"),
                Err(err) => tracing::warn!(error = %err, "hold expirer tick failed"),
            }
            expirer.locks().sweep();
        }
    });

    let remind_catalog = catalog.clone();
    let remind_pool = catalog.pool().clone();
    let remind_bus = bus.clone();
    let remind_every = settings.remind_interval;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(remind_every);
        loop {
            interval.tick().await;
            let policy = match remind_catalog.policy().await {
                Ok(policy) => policy,
                Err(err) => {
                    tracing::warn!(error = %err, "reminder tick could not load policy");
                    continue;
                }
            };
            match dispatch_due_reminders(
                &remind_pool,
                &remind_bus,
                policy.reminder_lead_minutes,
                batch,
                Utc::now(),
            )
            .await
            {
                Ok(0) => {}
                Ok(sent) => tracing::info!(sent, "dispatched reminders"),
                Err(err) => tracing::warn!(error = %err, "reminder tick failed"),
            }
        }
    });

    let reconciler = machine;
    let reconcile_pool = catalog.pool().clone();
    let reconcile_every = settings.reconcile_interval;
    let grace = settings.reconcile_grace;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(reconcile_every);
        loop {
            interval.tick().await;
            match reconcile_pending_payments(
                &reconciler,
                &reconcile_pool,
                payments.as_ref(),
                grace,
                batch,
                Utc::now(),
            )
            .await
            {
                Ok(0) => {}
                Ok(settled) => tracing::info!(settled, "reconciled pending payments"),
                Err(err) => tracing::warn!(error = %err, "payment reconciler tick failed"),
            }
        }
    });
}

/// One hold-expirer tick: drive every lapsed hold to EXPIRED.
pub async fn expire_due_holds(
    machine: &StateMachine,
    batch_limit: i64,
    now: DateTime<Utc>,
) -> Result<usize, BookingError> {
    let due: Vec<i64> = sqlx::query_scalar(
        "SELECT id FROM bookings
         WHERE status IN ('reserved', 'pending_payment')
           AND hold_expires_at IS NOT NULL AND hold_expires_at <= ?
         ORDER BY hold_expires_at ASC LIMIT ?",
    )
    .bind(now)
    .bind(batch_limit)
    .fetch_all(machine.pool())
    .await?;

    let mut expired = 0;
    for booking_id in due {
        match machine
            .cancel(booking_id, Actor::Worker, CancelReason::Expired, now)
            .await
        {
            Ok(_) => expired += 1,
            // Raced with a finalize or a sibling replica; nothing to do.
            Err(BookingError::IllegalTransition) => {}
            Err(err) => {
                tracing::warn!(booking_id, error = %err, "failed to expire hold");
            }
        }
    }
    Ok(expired)
}

/// One reminder tick: emit `ReminderDue` for bookings entering the lead
/// window. The `reminder_sent` flag is flipped with a guarded update, so
/// each booking reminds at most once across replicas; the notifier dedups
/// on the idempotency key besides.
pub async fn dispatch_due_reminders(
    pool: &SqlitePool,
    bus: &EventBus,
    reminder_lead_minutes: Option<i64>,
    batch_limit: i64,
    now: DateTime<Utc>,
) -> Result<usize, BookingError> {
    let Some(lead_minutes) = reminder_lead_minutes else {
        return Ok(0);
    };

    let due: Vec<(i64, i64, i64, DateTime<Utc>)> = sqlx::query_as(
        "SELECT id, staff_id, client_id, starts_at FROM bookings
         WHERE status IN ('confirmed', 'paid') AND reminder_sent = 0
           AND starts_at > ? AND starts_at <= ?
         ORDER BY starts_at ASC LIMIT ?",
    )
    .bind(now)
    .bind(now + Duration::minutes(lead_minutes))
    .bind(batch_limit)
    .fetch_all(pool)
    .await?;

    let mut sent = 0;
    for (booking_id, staff_id, client_id, starts_at) in due {
        let claimed = sqlx::query(
            "UPDATE bookings SET reminder_sent = 1 WHERE id = ? AND reminder_sent = 0",
        )
        .bind(booking_id)
        .execute(pool)
        .await?
        .rows_affected();
        if claimed != 1 {
            continue;
        }

        bus.publish(DomainEvent::ReminderDue {
            booking_id,
            staff_id,
            client_id,
            starts_at,
            lead_minutes,
            idempotency_key: format!("reminder-{booking_id}-{lead_minutes}"),
        });
        sent += 1;
    }
    Ok(sent)
}

/// One reconciler tick: poll the provider for PENDING_PAYMENT bookings
/// older than the grace period and settle them either way.
pub async fn reconcile_pending_payments(
    machine: &StateMachine,
    pool: &SqlitePool,
    payments: &dyn PaymentProvider,
    grace: Duration,
    batch_limit: i64,
    now: DateTime<Utc>,
) -> Result<usize, BookingError> {
    let pending: Vec<(i64, String)> = sqlx::query_as(
        "SELECT id, invoice_ref FROM bookings
         WHERE status = 'pending_payment' AND invoice_ref IS NOT NULL
           AND updated_at <= ?
         ORDER BY updated_at ASC LIMIT ?",
    )
    .bind(now - grace)
    .bind(batch_limit)
    .fetch_all(pool)
    .await?;

    let mut settled = 0;
    for (booking_id, invoice_ref) in pending {
        let state = match payments.verify_payment(&invoice_ref).await {
            Ok(state) => state,
            Err(err) => {
                tracing::warn!(booking_id, error = %err, "payment verification failed");
                continue;
            }
        };
        let outcome = match state {
            PaymentState::Paid => machine.payment_verified(booking_id, now).await.map(|_| true),
            PaymentState::Failed | PaymentState::Cancelled => machine
                .cancel(booking_id, Actor::Worker, CancelReason::PaymentFailed, now)
                .await
                .map(|_| true),
            PaymentState::Pending => Ok(false),
        };
        match outcome {
            Ok(true) => settled += 1,
            Ok(false) => {}
            // Raced with the webhook or a sibling replica.
            Err(BookingError::IllegalTransition) => {}
            Err(err) => {
                tracing::warn!(booking_id, error = %err, "payment reconciliation failed");
            }
        }
    }
    Ok(settled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Policy;
    use crate::models::{BookingStatus, PaymentMethod};
    use crate::testing::{self, utc};

    #[tokio::test]
    async fn lapsed_holds_expire_and_free_the_slot() {
        let ctx = testing::context_with_policy(Policy {
            hold_ttl_minutes: 1,
            ..testing::default_policy()
        })
        .await;
        let mut rx = ctx.bus.subscribe();
        let held_at = utc(2025, 6, 9, 12, 0);

        let row = ctx
            .machine
            .hold(100, 1, utc(2025, 6, 10, 11, 0), &[1], PaymentMethod::Cash, held_at)
            .await
            .unwrap();
        // Consume the hold event.
        rx.recv().await.unwrap();

        // 90 seconds later the TTL has lapsed.
        let tick_at = held_at + Duration::seconds(90);
        assert_eq!(expire_due_holds(&ctx.machine, 200, tick_at).await.unwrap(), 1);

        let row = ctx.machine.get(row.id).await.unwrap();
        assert_eq!(row.status().unwrap(), BookingStatus::Expired);
        assert!(row.hold_expires_at.is_none());

        let envelope = rx.recv().await.unwrap();
        assert!(matches!(envelope.event, DomainEvent::HoldExpired(_)));

        // The instant is offered again.
        let slots = ctx
            .engine
            .slots(1, utc(2025, 6, 10, 0, 0).date_naive(), &[1], tick_at)
            .await
            .unwrap();
        assert!(slots.contains(&utc(2025, 6, 10, 11, 0)));

        // A second tick finds nothing.
        assert_eq!(expire_due_holds(&ctx.machine, 200, tick_at).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn finalized_bookings_survive_the_expirer() {
        let ctx = testing::context_with_policy(Policy {
            hold_ttl_minutes: 1,
            ..testing::default_policy()
        })
        .await;
        let held_at = utc(2025, 6, 9, 12, 0);
        let row = ctx
            .machine
            .hold(100, 1, utc(2025, 6, 10, 11, 0), &[1], PaymentMethod::Cash, held_at)
            .await
            .unwrap();
        ctx.machine
            .finalize(row.id, PaymentMethod::Cash, held_at)
            .await
            .unwrap();

        let tick_at = held_at + Duration::seconds(90);
        assert_eq!(expire_due_holds(&ctx.machine, 200, tick_at).await.unwrap(), 0);
        assert_eq!(
            ctx.machine.get(row.id).await.unwrap().status().unwrap(),
            BookingStatus::Confirmed
        );
    }

    #[tokio::test]
    async fn reminders_fire_once_inside_the_lead_window() {
        let ctx = testing::context().await;
        let mut rx = ctx.bus.subscribe();
        let now = utc(2025, 6, 9, 12, 0);
        let row = ctx
            .machine
            .hold(100, 1, utc(2025, 6, 10, 11, 0), &[1], PaymentMethod::Cash, now)
            .await
            .unwrap();
        ctx.machine.finalize(row.id, PaymentMethod::Cash, now).await.unwrap();
        rx.recv().await.unwrap(); // held
        rx.recv().await.unwrap(); // confirmed

        // Outside the window: nothing due.
        assert_eq!(
            dispatch_due_reminders(&ctx.pool, &ctx.bus, Some(120), 200, utc(2025, 6, 10, 8, 0))
                .await
                .unwrap(),
            0
        );
        // Inside the window (11:00 − 120 min = 09:00 ≤ 09:30).
        assert_eq!(
            dispatch_due_reminders(&ctx.pool, &ctx.bus, Some(120), 200, utc(2025, 6, 10, 9, 30))
                .await
                .unwrap(),
            1
        );
        let envelope = rx.recv().await.unwrap();
        match envelope.event {
            DomainEvent::ReminderDue {
                booking_id,
                lead_minutes,
                idempotency_key,
                ..
            } => {
                assert_eq!(booking_id, row.id);
                assert_eq!(lead_minutes, 120);
                assert_eq!(idempotency_key, format!("reminder-{}-120", row.id));
            }
            other => panic!("unexpected event {other:?}"),
        }

        // Already sent: the next tick is silent.
        assert_eq!(
            dispatch_due_reminders(&ctx.pool, &ctx.bus, Some(120), 200, utc(2025, 6, 10, 9, 31))
                .await
                .unwrap(),
            0
        );
        // Reminders disabled: nothing fires regardless.
        assert_eq!(
            dispatch_due_reminders(&ctx.pool, &ctx.bus, None, 200, utc(2025, 6, 10, 9, 30))
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn reconciler_settles_paid_and_cancelled_invoices() {
        let ctx = testing::context().await;
        let now = utc(2025, 6, 9, 12, 0);

        let paid = ctx
            .machine
            .hold(100, 1, utc(2025, 6, 10, 11, 0), &[1], PaymentMethod::Online, now)
            .await
            .unwrap();
        ctx.machine.finalize(paid.id, PaymentMethod::Online, now).await.unwrap();

        let abandoned = ctx
            .machine
            .hold(101, 1, utc(2025, 6, 10, 14, 0), &[1], PaymentMethod::Online, now)
            .await
            .unwrap();
        ctx.machine
            .finalize(abandoned.id, PaymentMethod::Online, now)
            .await
            .unwrap();

        let tick_at = now + Duration::minutes(5);

        // Provider reports success for everything outstanding.
        ctx.payments.set_verify_state(PaymentState::Paid);
        let mut rx = ctx.bus.subscribe();
        assert_eq!(
            reconcile_pending_payments(
                &ctx.machine,
                &ctx.pool,
                ctx.payments.as_ref(),
                Duration::seconds(60),
                200,
                tick_at,
            )
            .await
            .unwrap(),
            2
        );
        assert_eq!(
            ctx.machine.get(paid.id).await.unwrap().status().unwrap(),
            BookingStatus::Paid
        );
        // Exactly one BookingConfirmed per settled booking.
        let mut confirmed = 0;
        while let Ok(envelope) = rx.try_recv() {
            if matches!(envelope.event, DomainEvent::BookingConfirmed(_)) {
                confirmed += 1;
            }
        }
        assert_eq!(confirmed, 2);
    }

    #[tokio::test]
    async fn reconciler_cancels_abandoned_payment() {
        let ctx = testing::context().await;
        let now = utc(2025, 6, 9, 12, 0);
        let row = ctx
            .machine
            .hold(100, 1, utc(2025, 6, 10, 11, 0), &[1], PaymentMethod::Online, now)
            .await
            .unwrap();
        ctx.machine.finalize(row.id, PaymentMethod::Online, now).await.unwrap();

        ctx.payments.set_verify_state(PaymentState::Cancelled);
        let mut rx = ctx.bus.subscribe();
        assert_eq!(
            reconcile_pending_payments(
                &ctx.machine,
                &ctx.pool,
                ctx.payments.as_ref(),
                Duration::seconds(60),
                200,
                now + Duration::minutes(5),
            )
            .await
            .unwrap(),
            1
        );

        let row = ctx.machine.get(row.id).await.unwrap();
        assert_eq!(row.status().unwrap(), BookingStatus::Cancelled);

        let envelope = rx.recv().await.unwrap();
        match envelope.event {
            DomainEvent::BookingCancelled { reason, .. } => {
                assert_eq!(reason, CancelReason::PaymentFailed);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn reconciler_honors_the_grace_period() {
        let ctx = testing::context().await;
        let now = utc(2025, 6, 9, 12, 0);
        let row = ctx
            .machine
            .hold(100, 1, utc(2025, 6, 10, 11, 0), &[1], PaymentMethod::Online, now)
            .await
            .unwrap();
        ctx.machine.finalize(row.id, PaymentMethod::Online, now).await.unwrap();

        ctx.payments.set_verify_state(PaymentState::Paid);
        // 10 seconds in, grace is 60: too fresh to poll.
        assert_eq!(
            reconcile_pending_payments(
                &ctx.machine,
                &ctx.pool,
                ctx.payments.as_ref(),
                Duration::seconds(60),
                200,
                now + Duration::seconds(10),
            )
            .await
            .unwrap(),
            0
        );
    }
}
