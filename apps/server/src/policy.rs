use chrono::{DateTime, Utc};

use crate::config::Policy;
use crate::error::BookingError;
use crate::models::BookingStatus;

/// Who is asking for a mutation. Admins and the lifecycle workers bypass
/// the client-facing lock windows; nobody bypasses transition legality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    Client,
    Admin,
    Worker,
}

/// Lead-time and horizon gate for a proposed start.
pub fn can_start(
    policy: &Policy,
    now: DateTime<Utc>,
    start_at: DateTime<Utc>,
) -> Result<(), BookingError> {
    if start_at < now + policy.lead_time() {
        return Err(BookingError::LeadTimeBlocked);
    }
    if start_at > now + policy.future_window() {
        return Err(BookingError::BeyondHorizon);
    }
    Ok(())
}

pub fn can_reschedule(
    policy: &Policy,
    now: DateTime<Utc>,
    status: BookingStatus,
    starts_at: DateTime<Utc>,
    reschedule_count: i64,
) -> Result<(), BookingError> {
    if status.is_terminal() {
        return Err(BookingError::IllegalTransition);
    }
    if reschedule_count >= policy.reschedule_max {
        return Err(BookingError::TooManyReschedules);
    }
    if now > starts_at - policy.reschedule_lock() {
        return Err(BookingError::LockWindow);
    }
    Ok(())
}

pub fn can_cancel(
    policy: &Policy,
    now: DateTime<Utc>,
    status: BookingStatus,
    starts_at: DateTime<Utc>,
    actor: Actor,
) -> Result<(), BookingError> {
    if status.is_terminal() {
        return Err(BookingError::IllegalTransition);
    }
    if actor == Actor::Client && now > starts_at - policy.cancel_lock() {
        return Err(BookingError::LockWindow);
    }
    Ok(())
}

/// The lifecycle graph. A booking never regresses toward an earlier state;
/// terminal states admit no edges (rating DONE bookings is handled by the
/// state machine without a status change).
pub fn can_transition(from: BookingStatus, to: BookingStatus) -> Result<(), BookingError> {
    use BookingStatus::*;
    let legal = match (from, to) {
        (Reserved, Confirmed)
        | (Reserved, PendingPayment)
        | (Reserved, Cancelled)
        | (Reserved, Expired) => true,
        (PendingPayment, Paid) | (PendingPayment, Cancelled) | (PendingPayment, Expired) => true,
        (Confirmed, Done) | (Confirmed, NoShow) | (Confirmed, Cancelled) => true,
        (Paid, Done) | (Paid, NoShow) | (Paid, Cancelled) => true,
        _ => false,
    };
    if legal {
        Ok(())
    } else {
        Err(BookingError::IllegalTransition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{default_policy, utc};

    #[test]
    fn lead_time_and_horizon() {
        let policy = Policy {
            lead_time_minutes: 60,
            future_window_days: 30,
            ..default_policy()
        };
        let now = utc(2025, 6, 10, 12, 0);

        assert!(matches!(
            can_start(&policy, now, utc(2025, 6, 10, 12, 30)),
            Err(BookingError::LeadTimeBlocked)
        ));
        assert!(can_start(&policy, now, utc(2025, 6, 10, 13, 0)).is_ok());
        assert!(matches!(
            can_start(&policy, now, utc(2025, 8, 10, 12, 0)),
            Err(BookingError::BeyondHorizon)
        ));
    }

    #[test]
    fn reschedule_lock_window_and_counter() {
        let policy = Policy {
            reschedule_lock_hours: 3,
            reschedule_max: 3,
            ..default_policy()
        };
        let starts_at = utc(2025, 6, 10, 14, 0);

        // 2 h before start, lock is 3 h: blocked.
        assert!(matches!(
            can_reschedule(&policy, utc(2025, 6, 10, 12, 0), BookingStatus::Confirmed, starts_at, 0),
            Err(BookingError::LockWindow)
        ));
        // 5 h before start: allowed.
        assert!(
            can_reschedule(&policy, utc(2025, 6, 10, 9, 0), BookingStatus::Confirmed, starts_at, 0)
                .is_ok()
        );
        // Counter at the cap.
        assert!(matches!(
            can_reschedule(&policy, utc(2025, 6, 10, 9, 0), BookingStatus::Confirmed, starts_at, 3),
            Err(BookingError::TooManyReschedules)
        ));
        // Terminal bookings cannot move.
        assert!(matches!(
            can_reschedule(&policy, utc(2025, 6, 10, 9, 0), BookingStatus::Cancelled, starts_at, 0),
            Err(BookingError::IllegalTransition)
        ));
    }

    #[test]
    fn admin_bypasses_cancel_lock_clients_do_not() {
        let policy = Policy {
            cancel_lock_hours: 3,
            ..default_policy()
        };
        let starts_at = utc(2025, 6, 10, 14, 0);
        let now = utc(2025, 6, 10, 13, 0);

        assert!(matches!(
            can_cancel(&policy, now, BookingStatus::Confirmed, starts_at, Actor::Client),
            Err(BookingError::LockWindow)
        ));
        assert!(can_cancel(&policy, now, BookingStatus::Confirmed, starts_at, Actor::Admin).is_ok());
        assert!(can_cancel(&policy, now, BookingStatus::Reserved, starts_at, Actor::Worker).is_ok());
    }

    #[test]
    fn transition_graph_edges() {
        use BookingStatus::*;
        for (from, to) in [
            (Reserved, Confirmed),
            (Reserved, PendingPayment),
            (Reserved, Expired),
            (Reserved, Cancelled),
            (PendingPayment, Paid),
            (PendingPayment, Expired),
            (PendingPayment, Cancelled),
            (Confirmed, Done),
            (Confirmed, NoShow),
            (Confirmed, Cancelled),
            (Paid, Done),
            (Paid, NoShow),
            (Paid, Cancelled),
        ] {
            assert!(can_transition(from, to).is_ok(), "{from} -> {to}");
        }
    }

    #[test]
    fn transition_graph_rejects_regressions_and_terminal_exits() {
        use BookingStatus::*;
        for (from, to) in [
            (Confirmed, Reserved),
            (Paid, PendingPayment),
            (PendingPayment, Confirmed),
            (Reserved, Paid),
            (Reserved, Done),
            (Done, Confirmed),
            (Expired, Reserved),
            (Cancelled, Confirmed),
            (NoShow, Done),
        ] {
            assert!(can_transition(from, to).is_err(), "{from} -> {to}");
        }
    }
}
