use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::Utc;
use std::sync::Arc;

use crate::{
    booking::{self, ListMode},
    error::BookingError,
    models::*,
    policy::Actor,
    AppState,
};

/// Load a booking and make sure it belongs to the calling client. A foreign
/// booking reads as absent rather than forbidden.
async fn owned_booking(
    state: &AppState,
    booking_id: i64,
    client_id: i64,
) -> Result<BookingRow, BookingError> {
    let row = state.machine.get(booking_id).await?;
    if row.client_id != client_id {
        return Err(BookingError::NotFound);
    }
    Ok(row)
}

/// POST /api/bookings/hold — place a soft hold on a slot
pub async fn hold(
    State(state): State<Arc<AppState>>,
    Json(body): Json<HoldRequest>,
) -> Result<Json<ApiResponse<HoldResponse>>, BookingError> {
    let now = Utc::now();
    let staff_id = match body.staff_id {
        Some(staff_id) => staff_id,
        None => {
            state
                .engine
                .pick_staff(body.start, &body.service_ids, now)
                .await?
        }
    };

    let row = state
        .machine
        .hold(
            body.client_id,
            staff_id,
            body.start,
            &body.service_ids,
            body.payment_method,
            now,
        )
        .await?;

    let expires_at = row
        .hold_expires_at
        .ok_or_else(|| BookingError::StoreUnavailable("hold row without expiry".into()))?;
    let snapshot = row.snapshot()?;
    Ok(Json(ApiResponse::success(HoldResponse {
        booking_id: row.id,
        expires_at,
        snapshot,
    })))
}

/// POST /api/bookings/{id}/finalize — cash confirms, online opens an invoice
pub async fn finalize(
    State(state): State<Arc<AppState>>,
    Path(booking_id): Path<i64>,
    Json(body): Json<FinalizeRequest>,
) -> Result<Json<ApiResponse<FinalizeResponse>>, BookingError> {
    let (status, invoice_url) = state
        .machine
        .finalize(booking_id, body.payment_method, Utc::now())
        .await?;
    Ok(Json(ApiResponse::success(FinalizeResponse {
        status,
        invoice_url,
    })))
}

/// POST /api/bookings/{id}/reschedule
pub async fn reschedule(
    State(state): State<Arc<AppState>>,
    Path(booking_id): Path<i64>,
    Json(body): Json<RescheduleRequest>,
) -> Result<Json<ApiResponse<BookingView>>, BookingError> {
    owned_booking(&state, booking_id, body.client_id).await?;
    let row = state
        .machine
        .reschedule(booking_id, body.new_start, Utc::now())
        .await?;
    Ok(Json(ApiResponse::success(
        booking::view_one(&state.db, row).await?,
    )))
}

/// POST /api/bookings/{id}/cancel — client-initiated cancellation
pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(booking_id): Path<i64>,
    Json(body): Json<CancelRequest>,
) -> Result<Json<ApiResponse<BookingView>>, BookingError> {
    owned_booking(&state, booking_id, body.client_id).await?;
    let row = state
        .machine
        .cancel(booking_id, Actor::Client, CancelReason::Client, Utc::now())
        .await?;
    Ok(Json(ApiResponse::success(
        booking::view_one(&state.db, row).await?,
    )))
}

/// POST /api/bookings/{id}/rate — one-shot rating of a DONE booking
pub async fn rate(
    State(state): State<Arc<AppState>>,
    Path(booking_id): Path<i64>,
    Json(body): Json<RateRequest>,
) -> Result<Json<ApiResponse<BookingView>>, BookingError> {
    owned_booking(&state, booking_id, body.client_id).await?;
    let row = state
        .machine
        .rate(booking_id, body.rating, Utc::now())
        .await?;
    Ok(Json(ApiResponse::success(
        booking::view_one(&state.db, row).await?,
    )))
}

/// GET /api/bookings?client_id=&mode= — the caller's bookings
pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListBookingsQuery>,
) -> Result<Json<ApiResponse<Vec<BookingView>>>, BookingError> {
    let mode = ListMode::parse(query.mode.as_deref())?;
    let views = booking::client_bookings(&state.db, query.client_id, mode, Utc::now()).await?;
    Ok(Json(ApiResponse::success(views)))
}
