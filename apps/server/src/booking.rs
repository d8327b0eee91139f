use chrono::{DateTime, Duration, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::sync::Arc;

use crate::catalog::Catalog;
use crate::error::BookingError;
use crate::events::{BookingFacts, DomainEvent, EventBus};
use crate::locks::LockManager;
use crate::models::{
    BookingRow, BookingServiceView, BookingStatus, BookingView, CancelReason, PaymentMethod,
};
use crate::payments::PaymentProvider;
use crate::policy::{self, Actor};
use crate::pricing;

/// Owns the booking lifecycle. Every mutation runs inside one transaction
/// under the advisory locks from `LockManager`; domain events are published
/// strictly after commit, at most one per write.
#[derive(Clone)]
pub struct StateMachine {
    db: SqlitePool,
    locks: LockManager,
    bus: EventBus,
    payments: Arc<dyn PaymentProvider>,
    catalog: Catalog,
    currency: String,
}

impl StateMachine {
    pub fn new(
        db: SqlitePool,
        locks: LockManager,
        bus: EventBus,
        payments: Arc<dyn PaymentProvider>,
        catalog: Catalog,
        currency: String,
    ) -> Self {
        Self {
            db,
            locks,
            bus,
            payments,
            catalog,
            currency,
        }
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    pub async fn get(&self, booking_id: i64) -> Result<BookingRow, BookingError> {
        sqlx::query_as::<_, BookingRow>("SELECT * FROM bookings WHERE id = ?")
            .bind(booking_id)
            .fetch_optional(&self.db)
            .await?
            .ok_or(BookingError::NotFound)
    }

    pub async fn find_by_invoice(
        &self,
        invoice_ref: &str,
    ) -> Result<Option<BookingRow>, BookingError> {
        Ok(
            sqlx::query_as::<_, BookingRow>("SELECT * FROM bookings WHERE invoice_ref = ?")
                .bind(invoice_ref)
                .fetch_optional(&self.db)
                .await?,
        )
    }

    /// Place a soft hold: advisory lock on every touched `(staff, hour)`
    /// bucket, overlap re-check inside the transaction, then a RESERVED row
    /// with the pricing snapshot and a TTL.
    pub async fn hold(
        &self,
        client_id: i64,
        staff_id: i64,
        start: DateTime<Utc>,
        bundle_ids: &[i64],
        method: PaymentMethod,
        now: DateTime<Utc>,
    ) -> Result<BookingRow, BookingError> {
        let services = self.catalog.bundle(bundle_ids).await?;
        self.catalog.staff_by_id(staff_id).await?;
        let schedule = self.catalog.schedule(staff_id).await?;
        for service in &services {
            if !schedule.speeds.contains_key(&service.id) {
                return Err(BookingError::NoSkillMatch);
            }
        }
        let policy = self.catalog.policy().await?;
        let snapshot = pricing::quote(
            &services,
            Some(&schedule.speeds),
            &policy,
            method,
            &self.currency,
        )?;
        let end = start + Duration::minutes(snapshot.effective_duration_min);

        let _span = self.locks.lock_span(staff_id, start, end).await;
        let mut tx = self.db.begin().await?;

        if overlap_exists(&mut tx, staff_id, start, end, 0).await? {
            return Err(BookingError::SlotUnavailable);
        }
        policy::can_start(&policy, now, start)?;

        let hold_expires_at = now + policy.hold_ttl();
        let booking_id = sqlx::query(
            "INSERT INTO bookings (
                staff_id, client_id, status, starts_at, ends_at, hold_expires_at,
                payment_method, original_minor, discount_minor, discount_percent,
                final_minor, currency, effective_duration_min, created_at, updated_at
            ) VALUES (?, ?, 'reserved', ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(staff_id)
        .bind(client_id)
        .bind(start)
        .bind(end)
        .bind(hold_expires_at)
        .bind(method.as_str())
        .bind(snapshot.original_minor)
        .bind(snapshot.discount_minor)
        .bind(snapshot.discount_percent)
        .bind(snapshot.final_minor)
        .bind(&snapshot.currency)
        .bind(snapshot.effective_duration_min)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        for (position, service) in services.iter().enumerate() {
            sqlx::query(
                "INSERT INTO booking_services (booking_id, service_id, position) VALUES (?, ?, ?)",
            )
            .bind(booking_id)
            .bind(service.id)
            .bind(position as i64)
            .execute(&mut *tx)
            .await?;
        }

        audit(&mut tx, booking_id, None, BookingStatus::Reserved, Some("hold"), now).await?;
        tx.commit().await?;

        let row = self.get(booking_id).await?;
        self.publish_facts(&row, DomainEvent::BookingHeld)?;
        tracing::info!(booking_id, staff_id, %start, "booking held");
        Ok(row)
    }

    /// Move a hold toward confirmation. Cash confirms immediately; online
    /// opens an invoice and parks the booking in PENDING_PAYMENT until the
    /// webhook or reconciler verifies it.
    pub async fn finalize(
        &self,
        booking_id: i64,
        method: PaymentMethod,
        now: DateTime<Utc>,
    ) -> Result<(BookingStatus, Option<String>), BookingError> {
        let _row_lock = self.locks.lock_booking(booking_id).await;
        let row = self.get(booking_id).await?;
        let status = row.status()?;

        if status != BookingStatus::Reserved {
            return Err(BookingError::IllegalTransition);
        }
        // The snapshot was priced for the method chosen at hold time and is
        // immutable; switching methods means a new booking.
        if row.payment_method()? != method {
            return Err(BookingError::BadInput(
                "payment method differs from the held quote".into(),
            ));
        }

        match method {
            PaymentMethod::Cash => {
                let mut tx = self.db.begin().await?;
                transition(&mut tx, booking_id, BookingStatus::Reserved, BookingStatus::Confirmed, now)
                    .await?;
                clear_hold(&mut tx, booking_id, now).await?;
                audit(
                    &mut tx,
                    booking_id,
                    Some(BookingStatus::Reserved),
                    BookingStatus::Confirmed,
                    Some("finalize_cash"),
                    now,
                )
                .await?;
                tx.commit().await?;

                let row = self.get(booking_id).await?;
                self.publish_facts(&row, DomainEvent::BookingConfirmed)?;
                tracing::info!(booking_id, "booking confirmed (cash)");
                Ok((BookingStatus::Confirmed, None))
            }
            PaymentMethod::Online => {
                // Provider call stays outside the transaction; a failure
                // leaves the booking RESERVED for the hold TTL to reap.
                let invoice = self
                    .payments
                    .create_invoice(booking_id, row.final_minor, &row.currency)
                    .await?;

                let mut tx = self.db.begin().await?;
                transition(
                    &mut tx,
                    booking_id,
                    BookingStatus::Reserved,
                    BookingStatus::PendingPayment,
                    now,
                )
                .await?;
                sqlx::query("UPDATE bookings SET invoice_ref = ?, invoice_url = ? WHERE id = ?")
                    .bind(&invoice.invoice_ref)
                    .bind(&invoice.external_url)
                    .bind(booking_id)
                    .execute(&mut *tx)
                    .await?;
                audit(
                    &mut tx,
                    booking_id,
                    Some(BookingStatus::Reserved),
                    BookingStatus::PendingPayment,
                    Some("finalize_online"),
                    now,
                )
                .await?;
                tx.commit().await?;

                let row = self.get(booking_id).await?;
                let facts = self.facts(&row)?;
                self.bus.publish(DomainEvent::InvoiceIssued {
                    facts,
                    invoice_url: invoice.external_url.clone(),
                });
                tracing::info!(booking_id, invoice_ref = %invoice.invoice_ref, "invoice issued");
                Ok((BookingStatus::PendingPayment, Some(invoice.external_url)))
            }
        }
    }

    /// Verified payment callback: PENDING_PAYMENT → PAID. Idempotent — a
    /// booking already PAID reports success without a second event.
    pub async fn payment_verified(
        &self,
        booking_id: i64,
        now: DateTime<Utc>,
    ) -> Result<BookingStatus, BookingError> {
        let _row_lock = self.locks.lock_booking(booking_id).await;
        let row = self.get(booking_id).await?;
        match row.status()? {
            BookingStatus::Paid => return Ok(BookingStatus::Paid),
            BookingStatus::PendingPayment => {}
            _ => return Err(BookingError::IllegalTransition),
        }

        let mut tx = self.db.begin().await?;
        transition(
            &mut tx,
            booking_id,
            BookingStatus::PendingPayment,
            BookingStatus::Paid,
            now,
        )
        .await?;
        clear_hold(&mut tx, booking_id, now).await?;
        audit(
            &mut tx,
            booking_id,
            Some(BookingStatus::PendingPayment),
            BookingStatus::Paid,
            Some("payment_verified"),
            now,
        )
        .await?;
        tx.commit().await?;

        let row = self.get(booking_id).await?;
        self.publish_facts(&row, DomainEvent::BookingConfirmed)?;
        tracing::info!(booking_id, "payment verified, booking paid");
        Ok(BookingStatus::Paid)
    }

    /// Move the booking to a new start. Same bundle, same staff, same
    /// footprint length; pricing and payment state are untouched and a
    /// still-held booking keeps its original expiry.
    pub async fn reschedule(
        &self,
        booking_id: i64,
        new_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<BookingRow, BookingError> {
        let _row_lock = self.locks.lock_booking(booking_id).await;
        let row = self.get(booking_id).await?;
        let status = row.status()?;
        let policy = self.catalog.policy().await?;
        policy::can_reschedule(&policy, now, status, row.starts_at, row.reschedule_count)?;

        if new_start == row.starts_at {
            // Same target: a data-level no-op, not another reschedule.
            return Ok(row);
        }
        if new_start <= now {
            return Err(BookingError::BadInput("new start must be in the future".into()));
        }

        let duration = row.ends_at - row.starts_at;
        let new_end = new_start + duration;

        let _span = self.locks.lock_span(row.staff_id, new_start, new_end).await;
        let mut tx = self.db.begin().await?;
        if overlap_exists(&mut tx, row.staff_id, new_start, new_end, booking_id).await? {
            return Err(BookingError::SlotUnavailable);
        }
        sqlx::query(
            "UPDATE bookings
             SET starts_at = ?, ends_at = ?, reschedule_count = reschedule_count + 1,
                 updated_at = ?
             WHERE id = ?",
        )
        .bind(new_start)
        .bind(new_end)
        .bind(now)
        .bind(booking_id)
        .execute(&mut *tx)
        .await?;
        audit(&mut tx, booking_id, Some(status), status, Some("reschedule"), now).await?;
        tx.commit().await?;

        let row = self.get(booking_id).await?;
        self.publish_facts(&row, DomainEvent::BookingRescheduled)?;
        tracing::info!(booking_id, %new_start, "booking rescheduled");
        Ok(row)
    }

    /// Cancel (or expire, when driven by the hold expirer) a live booking.
    pub async fn cancel(
        &self,
        booking_id: i64,
        actor: Actor,
        reason: CancelReason,
        now: DateTime<Utc>,
    ) -> Result<BookingRow, BookingError> {
        let _row_lock = self.locks.lock_booking(booking_id).await;
        let row = self.get(booking_id).await?;
        let status = row.status()?;
        let policy = self.catalog.policy().await?;
        policy::can_cancel(&policy, now, status, row.starts_at, actor)?;

        let target = if reason == CancelReason::Expired {
            BookingStatus::Expired
        } else {
            BookingStatus::Cancelled
        };
        policy::can_transition(status, target)?;

        let mut tx = self.db.begin().await?;
        transition(&mut tx, booking_id, status, target, now).await?;
        clear_hold(&mut tx, booking_id, now).await?;
        audit(&mut tx, booking_id, Some(status), target, Some(reason.as_str()), now).await?;
        tx.commit().await?;

        let row = self.get(booking_id).await?;
        let facts = self.facts(&row)?;
        if reason == CancelReason::Expired {
            self.bus.publish(DomainEvent::HoldExpired(facts));
        } else {
            self.bus.publish(DomainEvent::BookingCancelled { facts, reason });
        }
        tracing::info!(booking_id, reason = reason.as_str(), "booking cancelled");
        Ok(row)
    }

    pub async fn mark_done(
        &self,
        booking_id: i64,
        now: DateTime<Utc>,
    ) -> Result<BookingRow, BookingError> {
        self.admin_transition(booking_id, BookingStatus::Done, "mark_done", now)
            .await
    }

    pub async fn mark_no_show(
        &self,
        booking_id: i64,
        now: DateTime<Utc>,
    ) -> Result<BookingRow, BookingError> {
        self.admin_transition(booking_id, BookingStatus::NoShow, "mark_no_show", now)
            .await
    }

    /// Attach a 1..=5 rating to a DONE booking, once.
    pub async fn rate(
        &self,
        booking_id: i64,
        rating: i64,
        now: DateTime<Utc>,
    ) -> Result<BookingRow, BookingError> {
        if !(1..=5).contains(&rating) {
            return Err(BookingError::BadInput("rating must be in 1..=5".into()));
        }
        let _row_lock = self.locks.lock_booking(booking_id).await;
        let row = self.get(booking_id).await?;
        if row.status()? != BookingStatus::Done {
            return Err(BookingError::IllegalTransition);
        }
        if row.rating.is_some() {
            return Err(BookingError::AlreadyRated);
        }

        sqlx::query("UPDATE bookings SET rating = ?, updated_at = ? WHERE id = ?")
            .bind(rating)
            .bind(now)
            .bind(booking_id)
            .execute(&self.db)
            .await?;
        self.get(booking_id).await
    }

    async fn admin_transition(
        &self,
        booking_id: i64,
        target: BookingStatus,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<BookingRow, BookingError> {
        let _row_lock = self.locks.lock_booking(booking_id).await;
        let row = self.get(booking_id).await?;
        let status = row.status()?;
        policy::can_transition(status, target)?;

        let mut tx = self.db.begin().await?;
        transition(&mut tx, booking_id, status, target, now).await?;
        audit(&mut tx, booking_id, Some(status), target, Some(reason), now).await?;
        tx.commit().await?;
        self.get(booking_id).await
    }

    fn facts(&self, row: &BookingRow) -> Result<BookingFacts, BookingError> {
        Ok(BookingFacts {
            booking_id: row.id,
            staff_id: row.staff_id,
            client_id: row.client_id,
            status: row.status()?,
            starts_at: row.starts_at,
            snapshot: row.snapshot()?,
        })
    }

    fn publish_facts(
        &self,
        row: &BookingRow,
        build: fn(BookingFacts) -> DomainEvent,
    ) -> Result<(), BookingError> {
        let facts = self.facts(row)?;
        self.bus.publish(build(facts));
        Ok(())
    }
}

/// `true` when any calendar-blocking booking on `staff_id` intersects
/// `[start, end)`, other than `exclude_id` itself.
async fn overlap_exists(
    tx: &mut Transaction<'_, Sqlite>,
    staff_id: i64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    exclude_id: i64,
) -> Result<bool, BookingError> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM bookings
         WHERE staff_id = ? AND id != ?
           AND status IN ('reserved', 'pending_payment', 'confirmed', 'paid')
           AND starts_at < ? AND ends_at > ?",
    )
    .bind(staff_id)
    .bind(exclude_id)
    .bind(end)
    .bind(start)
    .fetch_one(&mut **tx)
    .await?;
    Ok(count > 0)
}

/// Guarded status flip: the WHERE clause re-checks the expected source
/// status, so a row that moved underneath us fails the transition instead
/// of being clobbered.
async fn transition(
    tx: &mut Transaction<'_, Sqlite>,
    booking_id: i64,
    from: BookingStatus,
    to: BookingStatus,
    now: DateTime<Utc>,
) -> Result<(), BookingError> {
    policy::can_transition(from, to)?;
    let affected = sqlx::query(
        "UPDATE bookings SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
    )
    .bind(to.as_str())
    .bind(now)
    .bind(booking_id)
    .bind(from.as_str())
    .execute(&mut **tx)
    .await?
    .rows_affected();
    if affected != 1 {
        return Err(BookingError::IllegalTransition);
    }
    Ok(())
}

async fn clear_hold(
    tx: &mut Transaction<'_, Sqlite>,
    booking_id: i64,
    now: DateTime<Utc>,
) -> Result<(), BookingError> {
    sqlx::query("UPDATE bookings SET hold_expires_at = NULL, updated_at = ? WHERE id = ?")
        .bind(now)
        .bind(booking_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn audit(
    tx: &mut Transaction<'_, Sqlite>,
    booking_id: i64,
    from: Option<BookingStatus>,
    to: BookingStatus,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> Result<(), BookingError> {
    sqlx::query(
        "INSERT INTO booking_events (booking_id, from_status, to_status, reason, created_at)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(booking_id)
    .bind(from.map(BookingStatus::as_str))
    .bind(to.as_str())
    .bind(reason)
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

// ── Materialized views ──

/// Listing mode for a client's bookings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListMode {
    Upcoming,
    History,
}

impl ListMode {
    pub fn parse(raw: Option<&str>) -> Result<Self, BookingError> {
        match raw {
            None | Some("upcoming") => Ok(Self::Upcoming),
            Some("history") => Ok(Self::History),
            Some(other) => Err(BookingError::BadInput(format!("unknown mode {other:?}"))),
        }
    }
}

/// Fully materialized views for a client; no lazy traversal across
/// aggregates.
pub async fn client_bookings(
    pool: &SqlitePool,
    client_id: i64,
    mode: ListMode,
    now: DateTime<Utc>,
) -> Result<Vec<BookingView>, BookingError> {
    let rows = match mode {
        ListMode::Upcoming => {
            sqlx::query_as::<_, BookingRow>(
                "SELECT * FROM bookings
                 WHERE client_id = ? AND ends_at > ?
                   AND status IN ('reserved', 'pending_payment', 'confirmed', 'paid')
                 ORDER BY starts_at ASC",
            )
            .bind(client_id)
            .bind(now)
            .fetch_all(pool)
            .await?
        }
        ListMode::History => {
            sqlx::query_as::<_, BookingRow>(
                "SELECT * FROM bookings
                 WHERE client_id = ?
                   AND (ends_at <= ? OR status IN ('done', 'no_show', 'cancelled', 'expired'))
                 ORDER BY starts_at DESC LIMIT 100",
            )
            .bind(client_id)
            .bind(now)
            .fetch_all(pool)
            .await?
        }
    };
    materialize(pool, rows).await
}

/// Admin listing for one day or an inclusive date range (UTC days).
pub async fn bookings_between(
    pool: &SqlitePool,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<BookingView>, BookingError> {
    let rows = sqlx::query_as::<_, BookingRow>(
        "SELECT * FROM bookings
         WHERE starts_at >= ? AND starts_at < ?
         ORDER BY starts_at ASC",
    )
    .bind(from)
    .bind(to)
    .fetch_all(pool)
    .await?;
    materialize(pool, rows).await
}

pub async fn view_one(pool: &SqlitePool, row: BookingRow) -> Result<BookingView, BookingError> {
    materialize(pool, vec![row])
        .await?
        .pop()
        .ok_or_else(|| BookingError::StoreUnavailable("booking view vanished".into()))
}

async fn materialize(
    pool: &SqlitePool,
    rows: Vec<BookingRow>,
) -> Result<Vec<BookingView>, BookingError> {
    let mut views = Vec::with_capacity(rows.len());
    for row in rows {
        let staff_name: String =
            sqlx::query_scalar("SELECT display_name FROM staff WHERE id = ?")
                .bind(row.staff_id)
                .fetch_optional(pool)
                .await?
                .unwrap_or_default();
        let services: Vec<(i64, String)> = sqlx::query_as(
            "SELECT s.id, s.name FROM booking_services bs
             JOIN services s ON s.id = bs.service_id
             WHERE bs.booking_id = ? ORDER BY bs.position ASC",
        )
        .bind(row.id)
        .fetch_all(pool)
        .await?;

        let snapshot = row.snapshot()?;
        views.push(BookingView {
            id: row.id,
            staff_id: row.staff_id,
            staff_name,
            services: services
                .into_iter()
                .map(|(id, name)| BookingServiceView { id, name })
                .collect(),
            status: row.status()?,
            starts_at: row.starts_at,
            ends_at: row.ends_at,
            hold_expires_at: row.hold_expires_at,
            snapshot,
            rating: row.rating,
            reschedule_count: row.reschedule_count,
        });
    }
    Ok(views)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, utc};

    #[tokio::test]
    async fn hold_then_overlapping_hold_loses() {
        let ctx = testing::context().await;
        let now = utc(2025, 6, 9, 12, 0);

        let first = ctx
            .machine
            .hold(100, 1, utc(2025, 6, 10, 11, 0), &[1], PaymentMethod::Cash, now)
            .await
            .unwrap();
        assert_eq!(first.status().unwrap(), BookingStatus::Reserved);
        assert!(first.hold_expires_at.is_some());

        // A second hold whose interval intersects the first must lose,
        // even at a different aligned start.
        let err = ctx
            .machine
            .hold(101, 1, utc(2025, 6, 10, 11, 30), &[1], PaymentMethod::Cash, now)
            .await
            .unwrap_err();
        assert!(matches!(err, BookingError::SlotUnavailable));

        // Same instant on another staff member is fine.
        ctx.machine
            .hold(101, 2, utc(2025, 6, 10, 11, 0), &[1], PaymentMethod::Cash, now)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn concurrent_holds_one_winner() {
        let ctx = testing::context().await;
        let now = utc(2025, 6, 9, 12, 0);

        let mut handles = Vec::new();
        for client in 0..6 {
            let machine = ctx.machine.clone();
            handles.push(tokio::spawn(async move {
                machine
                    .hold(client, 1, utc(2025, 6, 10, 11, 0), &[1], PaymentMethod::Cash, now)
                    .await
            }));
        }

        let mut winners = 0;
        let mut losers = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(BookingError::SlotUnavailable) => losers += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(losers, 5);

        let live: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM bookings WHERE staff_id = 1 AND status = 'reserved'",
        )
        .fetch_one(&ctx.pool)
        .await
        .unwrap();
        assert_eq!(live, 1);
    }

    #[tokio::test]
    async fn finalize_cash_confirms_and_clears_hold() {
        let ctx = testing::context().await;
        let now = utc(2025, 6, 9, 12, 0);
        let row = ctx
            .machine
            .hold(100, 1, utc(2025, 6, 10, 11, 0), &[1], PaymentMethod::Cash, now)
            .await
            .unwrap();

        let (status, invoice_url) = ctx.machine.finalize(row.id, PaymentMethod::Cash, now).await.unwrap();
        assert_eq!(status, BookingStatus::Confirmed);
        assert!(invoice_url.is_none());

        let row = ctx.machine.get(row.id).await.unwrap();
        assert_eq!(row.status().unwrap(), BookingStatus::Confirmed);
        assert!(row.hold_expires_at.is_none());

        // A second finalize is an illegal transition.
        assert!(matches!(
            ctx.machine.finalize(row.id, PaymentMethod::Cash, now).await,
            Err(BookingError::IllegalTransition)
        ));
    }

    #[tokio::test]
    async fn finalize_online_issues_invoice_and_keeps_hold() {
        let ctx = testing::context().await;
        let now = utc(2025, 6, 9, 12, 0);
        let row = ctx
            .machine
            .hold(100, 1, utc(2025, 6, 10, 11, 0), &[1], PaymentMethod::Online, now)
            .await
            .unwrap();
        // Online discount from the seeded policy: 10% of 10000.
        assert_eq!(row.discount_minor, 1000);
        assert_eq!(row.final_minor, 9000);

        let (status, invoice_url) =
            ctx.machine.finalize(row.id, PaymentMethod::Online, now).await.unwrap();
        assert_eq!(status, BookingStatus::PendingPayment);
        assert!(invoice_url.is_some());

        let row = ctx.machine.get(row.id).await.unwrap();
        assert_eq!(row.status().unwrap(), BookingStatus::PendingPayment);
        assert!(row.hold_expires_at.is_some());
        assert!(row.invoice_ref.is_some());

        // Verification completes the path and clears the hold.
        ctx.machine.payment_verified(row.id, now).await.unwrap();
        let row = ctx.machine.get(row.id).await.unwrap();
        assert_eq!(row.status().unwrap(), BookingStatus::Paid);
        assert!(row.hold_expires_at.is_none());

        // Idempotent second verification.
        assert_eq!(
            ctx.machine.payment_verified(row.id, now).await.unwrap(),
            BookingStatus::Paid
        );
    }

    #[tokio::test]
    async fn finalize_method_must_match_hold() {
        let ctx = testing::context().await;
        let now = utc(2025, 6, 9, 12, 0);
        let row = ctx
            .machine
            .hold(100, 1, utc(2025, 6, 10, 11, 0), &[1], PaymentMethod::Online, now)
            .await
            .unwrap();
        assert!(matches!(
            ctx.machine.finalize(row.id, PaymentMethod::Cash, now).await,
            Err(BookingError::BadInput(_))
        ));
    }

    #[tokio::test]
    async fn reschedule_moves_footprint_and_counts() {
        let ctx = testing::context().await;
        let now = utc(2025, 6, 9, 12, 0);
        let row = ctx
            .machine
            .hold(100, 1, utc(2025, 6, 10, 11, 0), &[1], PaymentMethod::Cash, now)
            .await
            .unwrap();
        ctx.machine.finalize(row.id, PaymentMethod::Cash, now).await.unwrap();

        let moved = ctx
            .machine
            .reschedule(row.id, utc(2025, 6, 10, 15, 0), now)
            .await
            .unwrap();
        assert_eq!(moved.starts_at, utc(2025, 6, 10, 15, 0));
        assert_eq!(moved.ends_at, utc(2025, 6, 10, 16, 0));
        assert_eq!(moved.reschedule_count, 1);
        assert_eq!(moved.status().unwrap(), BookingStatus::Confirmed);

        // Same target again: data-level no-op.
        let again = ctx
            .machine
            .reschedule(row.id, utc(2025, 6, 10, 15, 0), now)
            .await
            .unwrap();
        assert_eq!(again.reschedule_count, 1);

        // The old interval is free again for another client.
        ctx.machine
            .hold(200, 1, utc(2025, 6, 10, 11, 0), &[1], PaymentMethod::Cash, now)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reschedule_respects_occupancy_of_others() {
        let ctx = testing::context().await;
        let now = utc(2025, 6, 9, 12, 0);
        let first = ctx
            .machine
            .hold(100, 1, utc(2025, 6, 10, 11, 0), &[1], PaymentMethod::Cash, now)
            .await
            .unwrap();
        let second = ctx
            .machine
            .hold(101, 1, utc(2025, 6, 10, 14, 0), &[1], PaymentMethod::Cash, now)
            .await
            .unwrap();

        let err = ctx
            .machine
            .reschedule(second.id, utc(2025, 6, 10, 11, 30), now)
            .await
            .unwrap_err();
        assert!(matches!(err, BookingError::SlotUnavailable));
        let _ = first;
    }

    #[tokio::test]
    async fn cancel_frees_slot_and_is_terminal() {
        let ctx = testing::context().await;
        let now = utc(2025, 6, 9, 12, 0);
        let row = ctx
            .machine
            .hold(100, 1, utc(2025, 6, 10, 11, 0), &[1], PaymentMethod::Cash, now)
            .await
            .unwrap();

        let cancelled = ctx
            .machine
            .cancel(row.id, Actor::Client, CancelReason::Client, now)
            .await
            .unwrap();
        assert_eq!(cancelled.status().unwrap(), BookingStatus::Cancelled);
        assert!(cancelled.hold_expires_at.is_none());

        // Terminal: further mutations are illegal.
        assert!(matches!(
            ctx.machine
                .cancel(row.id, Actor::Client, CancelReason::Client, now)
                .await,
            Err(BookingError::IllegalTransition)
        ));
        assert!(matches!(
            ctx.machine.finalize(row.id, PaymentMethod::Cash, now).await,
            Err(BookingError::IllegalTransition)
        ));

        // And the interval is free again.
        ctx.machine
            .hold(200, 1, utc(2025, 6, 10, 11, 0), &[1], PaymentMethod::Cash, now)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn rate_requires_done_and_rejects_second_rating() {
        let ctx = testing::context().await;
        let now = utc(2025, 6, 9, 12, 0);
        let row = ctx
            .machine
            .hold(100, 1, utc(2025, 6, 10, 11, 0), &[1], PaymentMethod::Cash, now)
            .await
            .unwrap();
        ctx.machine.finalize(row.id, PaymentMethod::Cash, now).await.unwrap();

        assert!(matches!(
            ctx.machine.rate(row.id, 5, now).await,
            Err(BookingError::IllegalTransition)
        ));

        ctx.machine.mark_done(row.id, now).await.unwrap();
        let rated = ctx.machine.rate(row.id, 5, now).await.unwrap();
        assert_eq!(rated.rating, Some(5));

        assert!(matches!(
            ctx.machine.rate(row.id, 4, now).await,
            Err(BookingError::AlreadyRated)
        ));
        assert!(matches!(
            ctx.machine.rate(row.id, 9, now).await,
            Err(BookingError::BadInput(_))
        ));
    }

    #[tokio::test]
    async fn audit_trail_records_each_transition() {
        let ctx = testing::context().await;
        let now = utc(2025, 6, 9, 12, 0);
        let row = ctx
            .machine
            .hold(100, 1, utc(2025, 6, 10, 11, 0), &[1], PaymentMethod::Cash, now)
            .await
            .unwrap();
        ctx.machine.finalize(row.id, PaymentMethod::Cash, now).await.unwrap();
        ctx.machine.mark_done(row.id, now).await.unwrap();

        let trail: Vec<(Option<String>, String)> = sqlx::query_as(
            "SELECT from_status, to_status FROM booking_events WHERE booking_id = ? ORDER BY id ASC",
        )
        .bind(row.id)
        .fetch_all(&ctx.pool)
        .await
        .unwrap();
        assert_eq!(
            trail,
            vec![
                (None, "reserved".into()),
                (Some("reserved".into()), "confirmed".into()),
                (Some("confirmed".into()), "done".into()),
            ]
        );
    }
}
