//! Fixtures shared by the unit tests and the integration suite.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::availability;
use crate::booking::StateMachine;
use crate::catalog::Catalog;
use crate::config::Policy;
use crate::error::BookingError;
use crate::events::EventBus;
use crate::locks::LockManager;
use crate::payments::{Invoice, PaymentProvider, PaymentState};

pub fn utc(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, hour, minute, 0).unwrap()
}

pub fn default_policy() -> Policy {
    Policy {
        lead_time_minutes: 0,
        future_window_days: 60,
        reschedule_lock_hours: 3,
        cancel_lock_hours: 3,
        hold_ttl_minutes: 15,
        online_discount_percent: 10,
        online_enabled: true,
        reschedule_max: 3,
        slot_grid_minutes: 15,
        reminder_lead_minutes: None,
    }
}

/// Canonical catalog:
/// - service 1 "Full set": 60 min, 10000 minor, USD
/// - service 2 "Touch-up": 30 min, 5000 minor, USD
/// - service 3 "Legacy": inactive
/// - staff 1 "Alice": services 1 and 2 at speed 1.0, works 09:00–18:00 daily
/// - staff 2 "Bella": service 1 at speed 0.5, works 09:00–18:00 daily with
///   a 13:00–14:00 break
pub async fn seed_catalog(pool: &SqlitePool) {
    sqlx::query(
        "INSERT INTO services (id, name, description, duration_min, price_minor, currency, is_active, sort_order) VALUES
            (1, 'Full set', 'Complete treatment', 60, 10000, 'USD', 1, 1),
            (2, 'Touch-up', 'Maintenance visit', 30, 5000, 'USD', 1, 2),
            (3, 'Legacy', 'Retired offer', 45, 7000, 'USD', 0, 3)",
    )
    .execute(pool)
    .await
    .unwrap();

    sqlx::query(
        "INSERT INTO staff (id, display_name, is_active) VALUES
            (1, 'Alice', 1),
            (2, 'Bella', 1)",
    )
    .execute(pool)
    .await
    .unwrap();

    sqlx::query(
        "INSERT INTO staff_services (staff_id, service_id, speed) VALUES
            (1, 1, 1.0),
            (1, 2, 1.0),
            (2, 1, 0.5)",
    )
    .execute(pool)
    .await
    .unwrap();

    for staff_id in [1i64, 2] {
        for weekday in 0..7i64 {
            sqlx::query(
                "INSERT INTO working_windows (staff_id, weekday, open_min, close_min)
                 VALUES (?, ?, 540, 1080)",
            )
            .bind(staff_id)
            .bind(weekday)
            .execute(pool)
            .await
            .unwrap();
        }
    }
    for weekday in 0..7i64 {
        sqlx::query(
            "INSERT INTO breaks (staff_id, weekday, start_min, end_min) VALUES (2, ?, 780, 840)",
        )
        .bind(weekday)
        .execute(pool)
        .await
        .unwrap();
    }
}

/// Scriptable payment port double.
pub struct ScriptedPayments {
    pub fail_create: AtomicBool,
    pub verify_state: Mutex<PaymentState>,
    pub created: Mutex<Vec<i64>>,
}

impl Default for ScriptedPayments {
    fn default() -> Self {
        Self {
            fail_create: AtomicBool::new(false),
            verify_state: Mutex::new(PaymentState::Pending),
            created: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedPayments {
    pub fn set_verify_state(&self, state: PaymentState) {
        *self.verify_state.lock().unwrap() = state;
    }
}

#[async_trait]
impl PaymentProvider for ScriptedPayments {
    async fn create_invoice(
        &self,
        booking_id: i64,
        _amount_minor: i64,
        _currency: &str,
    ) -> Result<Invoice, BookingError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(BookingError::PaymentInitFailed);
        }
        self.created.lock().unwrap().push(booking_id);
        Ok(Invoice {
            invoice_ref: format!("inv-{booking_id}"),
            external_url: format!("https://pay.test/{booking_id}"),
        })
    }

    async fn verify_payment(&self, _invoice_ref: &str) -> Result<PaymentState, BookingError> {
        Ok(*self.verify_state.lock().unwrap())
    }
}

/// A fully wired core over an in-memory store.
pub struct TestContext {
    pub pool: SqlitePool,
    pub catalog: Catalog,
    pub bus: EventBus,
    pub payments: Arc<ScriptedPayments>,
    pub machine: StateMachine,
    pub engine: availability::Engine,
}

pub async fn context() -> TestContext {
    context_with_policy(default_policy()).await
}

pub async fn context_with_policy(policy: Policy) -> TestContext {
    // One connection: every handle sees the same in-memory database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    crate::db::run_migrations(&pool, &policy).await.unwrap();
    seed_catalog(&pool).await;

    let catalog = Catalog::new(pool.clone(), std::time::Duration::from_secs(60));
    let bus = EventBus::new(64);
    let payments = Arc::new(ScriptedPayments::default());
    let machine = StateMachine::new(
        pool.clone(),
        LockManager::new(),
        bus.clone(),
        payments.clone(),
        catalog.clone(),
        "USD".into(),
    );
    let engine = availability::Engine::new(catalog.clone(), chrono_tz::UTC);

    TestContext {
        pool,
        catalog,
        bus,
        payments,
        machine,
        engine,
    }
}
