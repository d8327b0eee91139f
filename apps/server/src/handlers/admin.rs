use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap},
    Json,
};
use chrono::{Duration, Utc};
use std::sync::Arc;

use crate::{
    availability::local_to_utc,
    booking,
    error::BookingError,
    events::DomainEvent,
    models::*,
    policy::Actor,
    AppState,
};

/// Admin calls carry `Authorization: Bearer <ADMIN_TOKEN>`.
fn require_admin(headers: &HeaderMap, state: &AppState) -> Result<(), BookingError> {
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(BookingError::Forbidden)?;
    if presented != state.config.admin_token {
        return Err(BookingError::Forbidden);
    }
    Ok(())
}

/// GET /api/admin/bookings?date= | ?from=&to= — bookings for a
/// business-local day or inclusive date range (defaults to today)
pub async fn list_bookings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<AdminBookingsQuery>,
) -> Result<Json<ApiResponse<Vec<BookingView>>>, BookingError> {
    require_admin(&headers, &state)?;

    let tz = state.config.business_timezone;
    let (from_date, to_date) = match (query.date, query.from, query.to) {
        (Some(date), _, _) => (date, date),
        (None, Some(from), Some(to)) => (from, to),
        (None, None, None) => {
            let today = Utc::now().with_timezone(&tz).date_naive();
            (today, today)
        }
        _ => {
            return Err(BookingError::BadInput(
                "pass either date or both from and to".into(),
            ))
        }
    };
    if to_date < from_date {
        return Err(BookingError::BadInput("to precedes from".into()));
    }

    let from = local_to_utc(tz, from_date, 0);
    let to = local_to_utc(tz, to_date, 0) + Duration::days(1);
    let views = booking::bookings_between(&state.db, from, to).await?;
    Ok(Json(ApiResponse::success(views)))
}

/// POST /api/admin/bookings/{id}/cancel — bypasses the client lock window
pub async fn cancel_booking(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(booking_id): Path<i64>,
) -> Result<Json<ApiResponse<BookingView>>, BookingError> {
    require_admin(&headers, &state)?;
    let row = state
        .machine
        .cancel(booking_id, Actor::Admin, CancelReason::Admin, Utc::now())
        .await?;
    Ok(Json(ApiResponse::success(
        booking::view_one(&state.db, row).await?,
    )))
}

/// POST /api/admin/bookings/{id}/done
pub async fn mark_done(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(booking_id): Path<i64>,
) -> Result<Json<ApiResponse<BookingView>>, BookingError> {
    require_admin(&headers, &state)?;
    let row = state.machine.mark_done(booking_id, Utc::now()).await?;
    Ok(Json(ApiResponse::success(
        booking::view_one(&state.db, row).await?,
    )))
}

/// POST /api/admin/bookings/{id}/no-show
pub async fn mark_no_show(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(booking_id): Path<i64>,
) -> Result<Json<ApiResponse<BookingView>>, BookingError> {
    require_admin(&headers, &state)?;
    let row = state.machine.mark_no_show(booking_id, Utc::now()).await?;
    Ok(Json(ApiResponse::success(
        booking::view_one(&state.db, row).await?,
    )))
}

/// POST /api/admin/catalog/invalidate — drop cached catalog/policy reads
/// after out-of-band store edits
pub async fn invalidate_catalog(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<&'static str>>, BookingError> {
    require_admin(&headers, &state)?;
    state.bus.publish(DomainEvent::CatalogInvalidated);
    Ok(Json(ApiResponse::success("catalog cache invalidated")))
}
