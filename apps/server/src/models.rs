use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BookingError;

// ── Database models ──

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Service {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub duration_min: i64,
    pub price_minor: i64,
    pub currency: String,
    pub is_active: bool,
    pub sort_order: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Staff {
    pub id: i64,
    pub display_name: String,
    pub is_active: bool,
}

/// One `[open, close)` working interval on a weekday, minutes from local
/// midnight. Windows within a day are disjoint; breaks are subsets of
/// windows (enforced at seeding, relied upon by the availability walk).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WorkingWindow {
    pub weekday: i64,
    pub open_min: i64,
    pub close_min: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BreakWindow {
    pub weekday: i64,
    pub start_min: i64,
    pub end_min: i64,
}

/// A staff member's weekly structure plus per-service speed multipliers.
#[derive(Debug, Clone, Default)]
pub struct StaffSchedule {
    pub windows: Vec<WorkingWindow>,
    pub breaks: Vec<BreakWindow>,
    /// service id → multiplier applied to the service's base duration.
    pub speeds: std::collections::HashMap<i64, f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Reserved,
    PendingPayment,
    Confirmed,
    Paid,
    Done,
    NoShow,
    Cancelled,
    Expired,
}

impl BookingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reserved => "reserved",
            Self::PendingPayment => "pending_payment",
            Self::Confirmed => "confirmed",
            Self::Paid => "paid",
            Self::Done => "done",
            Self::NoShow => "no_show",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, BookingError> {
        match raw {
            "reserved" => Ok(Self::Reserved),
            "pending_payment" => Ok(Self::PendingPayment),
            "confirmed" => Ok(Self::Confirmed),
            "paid" => Ok(Self::Paid),
            "done" => Ok(Self::Done),
            "no_show" => Ok(Self::NoShow),
            "cancelled" => Ok(Self::Cancelled),
            "expired" => Ok(Self::Expired),
            other => Err(BookingError::StoreUnavailable(format!(
                "unknown booking status {other:?}"
            ))),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Expired | Self::Cancelled | Self::Done | Self::NoShow)
    }

    /// Statuses whose `[starts_at, ends_at)` blocks the staff member's
    /// calendar. Holds count the same as confirmed bookings.
    pub fn occupies(self) -> bool {
        matches!(
            self,
            Self::Reserved | Self::PendingPayment | Self::Confirmed | Self::Paid
        )
    }

    pub fn is_hold(self) -> bool {
        matches!(self, Self::Reserved | Self::PendingPayment)
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Online,
}

impl PaymentMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cash => "cash",
            Self::Online => "online",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, BookingError> {
        match raw {
            "cash" => Ok(Self::Cash),
            "online" => Ok(Self::Online),
            other => Err(BookingError::BadInput(format!(
                "unknown payment method {other:?}"
            ))),
        }
    }
}

/// Reason tag attached to cancellation transitions and their events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    Client,
    Admin,
    Expired,
    PaymentFailed,
}

impl CancelReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Admin => "admin",
            Self::Expired => "expired",
            Self::PaymentFailed => "payment_failed",
        }
    }
}

/// Immutable price record bound to a booking at hold time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingSnapshot {
    pub original_minor: i64,
    pub discount_minor: i64,
    pub discount_percent: i64,
    pub final_minor: i64,
    pub currency: String,
    pub payment_method: PaymentMethod,
    pub effective_duration_min: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BookingRow {
    pub id: i64,
    pub staff_id: i64,
    pub client_id: i64,
    pub status: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub hold_expires_at: Option<DateTime<Utc>>,
    pub payment_method: String,
    pub invoice_ref: Option<String>,
    pub invoice_url: Option<String>,
    pub original_minor: i64,
    pub discount_minor: i64,
    pub discount_percent: i64,
    pub final_minor: i64,
    pub currency: String,
    pub effective_duration_min: i64,
    pub rating: Option<i64>,
    pub reschedule_count: i64,
    pub reminder_sent: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BookingRow {
    pub fn status(&self) -> Result<BookingStatus, BookingError> {
        BookingStatus::parse(&self.status)
    }

    pub fn payment_method(&self) -> Result<PaymentMethod, BookingError> {
        PaymentMethod::parse(&self.payment_method)
    }

    pub fn snapshot(&self) -> Result<PricingSnapshot, BookingError> {
        Ok(PricingSnapshot {
            original_minor: self.original_minor,
            discount_minor: self.discount_minor,
            discount_percent: self.discount_percent,
            final_minor: self.final_minor,
            currency: self.currency.clone(),
            payment_method: self.payment_method()?,
            effective_duration_min: self.effective_duration_min,
        })
    }
}

// ── API request/response types ──

#[derive(Debug, Deserialize)]
pub struct StaffQuery {
    /// Comma-separated service ids; when present, only staff able to
    /// perform all of them are returned.
    pub service_ids: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AvailableDaysQuery {
    pub staff_id: Option<i64>,
    pub year: i32,
    pub month: u32,
    pub service_ids: String,
}

#[derive(Debug, Deserialize)]
pub struct SlotsQuery {
    pub staff_id: Option<i64>,
    pub date: chrono::NaiveDate,
    pub service_ids: String,
}

#[derive(Debug, Serialize)]
pub struct AvailableDaysResponse {
    pub days: Vec<u32>,
    pub timezone: String,
}

#[derive(Debug, Serialize)]
pub struct SlotsResponse {
    pub slots: Vec<SlotView>,
    pub timezone: String,
}

#[derive(Debug, Serialize)]
pub struct SlotView {
    pub start: DateTime<Utc>,
    pub staff_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct QuoteRequest {
    pub service_ids: Vec<i64>,
    pub staff_id: Option<i64>,
    pub payment_method: PaymentMethod,
}

#[derive(Debug, Deserialize)]
pub struct CheckSlotRequest {
    pub staff_id: Option<i64>,
    pub start: DateTime<Utc>,
    pub service_ids: Vec<i64>,
}

#[derive(Debug, Serialize)]
pub struct CheckSlotResponse {
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict: Option<&'static str>,
}

#[derive(Debug, Deserialize)]
pub struct HoldRequest {
    pub client_id: i64,
    pub staff_id: Option<i64>,
    pub start: DateTime<Utc>,
    pub service_ids: Vec<i64>,
    pub payment_method: PaymentMethod,
}

#[derive(Debug, Serialize)]
pub struct HoldResponse {
    pub booking_id: i64,
    pub expires_at: DateTime<Utc>,
    pub snapshot: PricingSnapshot,
}

#[derive(Debug, Deserialize)]
pub struct FinalizeRequest {
    pub payment_method: PaymentMethod,
}

#[derive(Debug, Serialize)]
pub struct FinalizeResponse {
    pub status: BookingStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RescheduleRequest {
    pub client_id: i64,
    pub new_start: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub client_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct RateRequest {
    pub client_id: i64,
    pub rating: i64,
}

#[derive(Debug, Deserialize)]
pub struct ListBookingsQuery {
    pub client_id: i64,
    /// `upcoming` (default) or `history`.
    pub mode: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AdminBookingsQuery {
    pub date: Option<chrono::NaiveDate>,
    pub from: Option<chrono::NaiveDate>,
    pub to: Option<chrono::NaiveDate>,
}

/// Fully materialized booking view for list endpoints; no lazy traversal.
#[derive(Debug, Serialize)]
pub struct BookingView {
    pub id: i64,
    pub staff_id: i64,
    pub staff_name: String,
    pub services: Vec<BookingServiceView>,
    pub status: BookingStatus,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hold_expires_at: Option<DateTime<Utc>>,
    pub snapshot: PricingSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating: Option<i64>,
    pub reschedule_count: i64,
}

#[derive(Debug, Serialize)]
pub struct BookingServiceView {
    pub id: i64,
    pub name: String,
}

// ── Payment webhook ──

#[derive(Debug, Deserialize)]
pub struct PaymentWebhookEvent {
    /// `payment.succeeded` or `payment.canceled`.
    pub event: String,
    pub object: PaymentWebhookObject,
}

#[derive(Debug, Deserialize)]
pub struct PaymentWebhookObject {
    pub id: String,
}

// ── Response envelope ──

#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub ok: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(tag: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(tag.into()),
        }
    }
}
