use std::collections::HashMap;

use crate::config::Policy;
use crate::error::BookingError;
use crate::models::{PaymentMethod, PricingSnapshot, Service};

/// Effective duration of a bundle on one staff member: per-service base
/// duration scaled by that staff member's speed multiplier, rounded to the
/// minute per service, then summed. `speeds` is `None` when quoting without
/// a staff member (base durations apply).
pub fn effective_duration_min(services: &[Service], speeds: Option<&HashMap<i64, f64>>) -> i64 {
    services
        .iter()
        .map(|service| {
            let speed = speeds
                .and_then(|map| map.get(&service.id).copied())
                .unwrap_or(1.0);
            (service.duration_min as f64 * speed).round() as i64
        })
        .sum()
}

/// Produce the pricing snapshot for a bundle. All money arithmetic is on
/// integer minor units; the discount rounds down.
pub fn quote(
    services: &[Service],
    speeds: Option<&HashMap<i64, f64>>,
    policy: &Policy,
    method: PaymentMethod,
    configured_currency: &str,
) -> Result<PricingSnapshot, BookingError> {
    if services.is_empty() {
        return Err(BookingError::BadInput("empty service bundle".into()));
    }
    if services
        .iter()
        .any(|service| service.currency != configured_currency)
    {
        return Err(BookingError::MixedCurrency);
    }

    let original_minor: i64 = services.iter().map(|service| service.price_minor).sum();

    let discount_applies =
        method == PaymentMethod::Online && policy.online_enabled && policy.online_discount_percent > 0;
    let discount_percent = if discount_applies {
        policy.online_discount_percent
    } else {
        0
    };
    let discount_minor = original_minor * discount_percent / 100;

    Ok(PricingSnapshot {
        original_minor,
        discount_minor,
        discount_percent,
        final_minor: original_minor - discount_minor,
        currency: configured_currency.to_string(),
        payment_method: method,
        effective_duration_min: effective_duration_min(services, speeds),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(id: i64, duration_min: i64, price_minor: i64, currency: &str) -> Service {
        Service {
            id,
            name: format!("svc-{id}"),
            description: String::new(),
            duration_min,
            price_minor,
            currency: currency.into(),
            is_active: true,
            sort_order: 0,
        }
    }

    fn policy(discount: i64, enabled: bool) -> Policy {
        Policy {
            online_discount_percent: discount,
            online_enabled: enabled,
            ..crate::testing::default_policy()
        }
    }

    #[test]
    fn online_discount_rounds_down_and_balances() {
        let services = [service(1, 60, 3333, "USD"), service(2, 30, 100, "USD")];
        let snapshot = quote(
            &services,
            None,
            &policy(15, true),
            PaymentMethod::Online,
            "USD",
        )
        .unwrap();

        assert_eq!(snapshot.original_minor, 3433);
        // floor(3433 * 15 / 100) = 514
        assert_eq!(snapshot.discount_minor, 514);
        assert_eq!(snapshot.final_minor, 2919);
        assert_eq!(
            snapshot.original_minor - snapshot.discount_minor,
            snapshot.final_minor
        );
    }

    #[test]
    fn cash_and_disabled_online_get_no_discount() {
        let services = [service(1, 60, 10000, "USD")];

        let cash = quote(&services, None, &policy(15, true), PaymentMethod::Cash, "USD").unwrap();
        assert_eq!(cash.discount_minor, 0);
        assert_eq!(cash.final_minor, 10000);

        let disabled =
            quote(&services, None, &policy(15, false), PaymentMethod::Online, "USD").unwrap();
        assert_eq!(disabled.discount_minor, 0);
        assert_eq!(disabled.discount_percent, 0);
    }

    #[test]
    fn foreign_currency_is_rejected() {
        let services = [service(1, 60, 10000, "USD"), service(2, 30, 500, "EUR")];
        assert!(matches!(
            quote(&services, None, &policy(0, false), PaymentMethod::Cash, "USD"),
            Err(BookingError::MixedCurrency)
        ));
    }

    #[test]
    fn speed_scales_duration_per_service() {
        let services = [service(1, 60, 0, "USD"), service(2, 45, 0, "USD")];
        let speeds: HashMap<i64, f64> = [(1, 0.5), (2, 1.5)].into_iter().collect();

        // round(60 * 0.5) + round(45 * 1.5) = 30 + 68
        assert_eq!(effective_duration_min(&services, Some(&speeds)), 98);
        assert_eq!(effective_duration_min(&services, None), 105);
    }
}
