use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::models::ApiResponse;

/// Domain error taxonomy. Every variant maps to one stable snake_case wire
/// tag; callers branch on the tag, never on message text.
#[derive(Debug, thiserror::Error)]
pub enum BookingError {
    // ── Validation ──
    #[error("bad input: {0}")]
    BadInput(String),
    #[error("no staff member can perform every service in the bundle")]
    NoSkillMatch,
    #[error("bundle mixes currencies or does not match the configured currency")]
    MixedCurrency,
    #[error("booking not found")]
    NotFound,
    #[error("forbidden")]
    Forbidden,

    // ── Policy ──
    #[error("start is earlier than the lead-time minimum")]
    LeadTimeBlocked,
    #[error("start is beyond the future booking window")]
    BeyondHorizon,
    #[error("inside the reschedule/cancel lock window")]
    LockWindow,
    #[error("reschedule limit reached")]
    TooManyReschedules,

    // ── Concurrency ──
    #[error("the slot is no longer available")]
    SlotUnavailable,
    #[error("illegal state transition")]
    IllegalTransition,
    #[error("booking already rated")]
    AlreadyRated,

    // ── External ──
    #[error("payment provider rejected invoice creation")]
    PaymentInitFailed,
    #[error("payment verification failed")]
    PaymentVerificationFailed,
    #[error("notifier unavailable")]
    NotifierUnavailable,

    // ── Infrastructure ──
    #[error("request timed out")]
    Timeout,
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl BookingError {
    /// Stable tag carried in the `error` field of the response envelope.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::BadInput(_) => "bad_input",
            Self::NoSkillMatch => "no_skill_match",
            Self::MixedCurrency => "mixed_currency",
            Self::NotFound => "not_found",
            Self::Forbidden => "forbidden",
            Self::LeadTimeBlocked => "lead_time_blocked",
            Self::BeyondHorizon => "beyond_horizon",
            Self::LockWindow => "lock_window",
            Self::TooManyReschedules => "too_many_reschedules",
            Self::SlotUnavailable => "slot_unavailable",
            Self::IllegalTransition => "illegal_transition",
            Self::AlreadyRated => "already_rated",
            Self::PaymentInitFailed => "payment_init_failed",
            Self::PaymentVerificationFailed => "payment_verification_failed",
            Self::NotifierUnavailable => "notifier_unavailable",
            Self::Timeout => "timeout",
            Self::StoreUnavailable(_) => "store_unavailable",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadInput(_) => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NoSkillMatch
            | Self::MixedCurrency
            | Self::LeadTimeBlocked
            | Self::BeyondHorizon
            | Self::LockWindow
            | Self::TooManyReschedules => StatusCode::UNPROCESSABLE_ENTITY,
            Self::SlotUnavailable | Self::IllegalTransition | Self::AlreadyRated => {
                StatusCode::CONFLICT
            }
            Self::PaymentInitFailed
            | Self::PaymentVerificationFailed
            | Self::NotifierUnavailable => StatusCode::BAD_GATEWAY,
            Self::Timeout => StatusCode::REQUEST_TIMEOUT,
            Self::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl From<sqlx::Error> for BookingError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound,
            other => Self::StoreUnavailable(other.to_string()),
        }
    }
}

impl IntoResponse for BookingError {
    fn into_response(self) -> Response {
        if matches!(self, Self::StoreUnavailable(_)) {
            tracing::error!(error = %self, "store error surfaced to caller");
        }
        (
            self.status_code(),
            Json(ApiResponse::<()>::error(self.tag())),
        )
            .into_response()
    }
}
