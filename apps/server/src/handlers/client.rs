use axum::{
    extract::{Query, State},
    Json,
};
use chrono::Utc;
use std::sync::Arc;

use crate::{
    error::BookingError,
    models::*,
    pricing,
    AppState,
};

/// Parse a comma-separated id list ("1,2,3").
fn parse_ids(raw: &str) -> Result<Vec<i64>, BookingError> {
    let ids: Result<Vec<i64>, _> = raw
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::parse)
        .collect();
    let ids = ids.map_err(|_| BookingError::BadInput("service_ids must be numbers".into()))?;
    if ids.is_empty() {
        return Err(BookingError::BadInput("service_ids must not be empty".into()));
    }
    Ok(ids)
}

/// GET /api/services — the client-visible catalog
pub async fn list_services(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ApiResponse<Vec<Service>>>, BookingError> {
    let services = state.catalog.services().await?;
    Ok(Json(ApiResponse::success(services)))
}

/// GET /api/staff?service_ids=1,2 — staff, optionally filtered to those
/// able to perform the whole bundle
pub async fn list_staff(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StaffQuery>,
) -> Result<Json<ApiResponse<Vec<Staff>>>, BookingError> {
    let staff = match &query.service_ids {
        Some(raw) => state.catalog.staff_for_bundle(&parse_ids(raw)?).await?,
        None => state.catalog.staff().await?,
    };
    Ok(Json(ApiResponse::success(staff)))
}

/// GET /api/availability/days?staff_id=&year=&month=&service_ids=
pub async fn available_days(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AvailableDaysQuery>,
) -> Result<Json<ApiResponse<AvailableDaysResponse>>, BookingError> {
    let bundle = parse_ids(&query.service_ids)?;
    let now = Utc::now();
    let days = match query.staff_id {
        Some(staff_id) => {
            state
                .engine
                .available_days(staff_id, query.year, query.month, &bundle, now)
                .await?
        }
        None => {
            state
                .engine
                .available_days_any(query.year, query.month, &bundle, now)
                .await?
        }
    };
    Ok(Json(ApiResponse::success(AvailableDaysResponse {
        days: days.into_iter().collect(),
        timezone: state.engine.timezone().name().to_string(),
    })))
}

/// GET /api/availability/slots?staff_id=&date=&service_ids= — legal starts
/// for the bundle on a business-local date
pub async fn slots(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SlotsQuery>,
) -> Result<Json<ApiResponse<SlotsResponse>>, BookingError> {
    let bundle = parse_ids(&query.service_ids)?;
    let now = Utc::now();
    let slots = match query.staff_id {
        Some(staff_id) => state
            .engine
            .slots(staff_id, query.date, &bundle, now)
            .await?
            .into_iter()
            .map(|start| SlotView { start, staff_id })
            .collect(),
        None => state
            .engine
            .slots_any(query.date, &bundle, now)
            .await?
            .into_iter()
            .map(|(start, staff_id)| SlotView { start, staff_id })
            .collect(),
    };
    Ok(Json(ApiResponse::success(SlotsResponse {
        slots,
        timezone: state.engine.timezone().name().to_string(),
    })))
}

/// POST /api/quote — pricing snapshot for a bundle without holding anything
pub async fn quote(
    State(state): State<Arc<AppState>>,
    Json(body): Json<QuoteRequest>,
) -> Result<Json<ApiResponse<PricingSnapshot>>, BookingError> {
    let services = state.catalog.bundle(&body.service_ids).await?;
    let policy = state.catalog.policy().await?;

    let snapshot = match body.staff_id {
        Some(staff_id) => {
            state.catalog.staff_by_id(staff_id).await?;
            let schedule = state.catalog.schedule(staff_id).await?;
            for service in &services {
                if !schedule.speeds.contains_key(&service.id) {
                    return Err(BookingError::NoSkillMatch);
                }
            }
            pricing::quote(
                &services,
                Some(&schedule.speeds),
                &policy,
                body.payment_method,
                &state.config.currency,
            )?
        }
        None => pricing::quote(
            &services,
            None,
            &policy,
            body.payment_method,
            &state.config.currency,
        )?,
    };
    Ok(Json(ApiResponse::success(snapshot)))
}

/// POST /api/slots/check — non-binding probe for one concrete start
pub async fn check_slot(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CheckSlotRequest>,
) -> Result<Json<ApiResponse<CheckSlotResponse>>, BookingError> {
    let conflict = state
        .engine
        .check_slot(body.staff_id, body.start, &body.service_ids, Utc::now())
        .await?;
    Ok(Json(ApiResponse::success(CheckSlotResponse {
        available: conflict.is_none(),
        conflict,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_list_parsing() {
        assert_eq!(parse_ids("1,2,3").unwrap(), vec![1, 2, 3]);
        assert_eq!(parse_ids(" 4 , 5 ").unwrap(), vec![4, 5]);
        assert!(parse_ids("").is_err());
        assert!(parse_ids("1,x").is_err());
    }
}
