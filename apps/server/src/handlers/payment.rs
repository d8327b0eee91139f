use axum::{extract::State, http::StatusCode, Json};
use chrono::Utc;
use std::sync::Arc;

use crate::{
    error::BookingError,
    models::{CancelReason, PaymentWebhookEvent},
    policy::Actor,
    AppState,
};

/// POST /api/payments/webhook — provider callbacks.
///
/// Drives the same transitions the reconciler drives; both paths are
/// idempotent, so a webhook racing a reconciler tick is harmless. Returns
/// 200 for anything we cannot act on — the provider retries on non-2xx and
/// a malformed or stale notification will not get better.
pub async fn payment_webhook(
    State(state): State<Arc<AppState>>,
    Json(event): Json<PaymentWebhookEvent>,
) -> StatusCode {
    tracing::info!(
        event = %event.event,
        invoice_ref = %event.object.id,
        "payment webhook received"
    );

    let booking = match state.machine.find_by_invoice(&event.object.id).await {
        Ok(Some(booking)) => booking,
        Ok(None) => {
            tracing::warn!(invoice_ref = %event.object.id, "webhook for unknown invoice");
            return StatusCode::OK;
        }
        Err(err) => {
            tracing::error!(error = %err, "webhook could not load booking");
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
    };

    let now = Utc::now();
    let outcome = match event.event.as_str() {
        "payment.succeeded" => state
            .machine
            .payment_verified(booking.id, now)
            .await
            .map(|_| ()),
        "payment.canceled" => state
            .machine
            .cancel(booking.id, Actor::Worker, CancelReason::PaymentFailed, now)
            .await
            .map(|_| ()),
        other => {
            tracing::info!(event = other, "ignoring webhook event");
            return StatusCode::OK;
        }
    };

    match outcome {
        Ok(()) => StatusCode::OK,
        // Already settled by the reconciler or a duplicate delivery.
        Err(BookingError::IllegalTransition) => StatusCode::OK,
        Err(err) => {
            tracing::error!(booking_id = booking.id, error = %err, "webhook transition failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
