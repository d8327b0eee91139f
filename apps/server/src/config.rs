use anyhow::Context;
use chrono_tz::Tz;
use std::time::Duration;

/// Runtime configuration gathered from the environment once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub host: String,
    pub port: String,
    /// IANA timezone the business operates in; applied only when resolving
    /// local calendar days. All stored instants are UTC.
    pub business_timezone: Tz,
    /// Single process-wide ISO-4217 currency.
    pub currency: String,
    /// Shared bearer token for admin endpoints.
    pub admin_token: String,
    pub settings_cache_ttl: Duration,
    pub request_timeout: Duration,
    pub payment_api_url: Option<String>,
    pub payment_shop_id: String,
    pub payment_secret_key: String,
    pub notifier_webhook_url: Option<String>,
    /// Defaults used to seed the `policies` row on first migration.
    pub policy_defaults: Policy,
}

/// Booking policy consulted on every write.
///
/// Persisted as the single row of the `policies` table and handed to
/// callers as a value — workers and handlers receive it via the catalog's
/// TTL cache, never via globals.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow, serde::Serialize)]
pub struct Policy {
    pub lead_time_minutes: i64,
    pub future_window_days: i64,
    pub reschedule_lock_hours: i64,
    pub cancel_lock_hours: i64,
    pub hold_ttl_minutes: i64,
    pub online_discount_percent: i64,
    pub online_enabled: bool,
    pub reschedule_max: i64,
    pub slot_grid_minutes: i64,
    pub reminder_lead_minutes: Option<i64>,
}

impl Policy {
    pub fn hold_ttl(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.hold_ttl_minutes)
    }

    pub fn lead_time(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.lead_time_minutes)
    }

    pub fn future_window(&self) -> chrono::Duration {
        chrono::Duration::days(self.future_window_days)
    }

    pub fn reschedule_lock(&self) -> chrono::Duration {
        chrono::Duration::hours(self.reschedule_lock_hours)
    }

    pub fn cancel_lock(&self) -> chrono::Duration {
        chrono::Duration::hours(self.cancel_lock_hours)
    }
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite:slotbook.db?mode=rwc".into());
        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port = std::env::var("PORT").unwrap_or_else(|_| "3000".into());

        let tz_name = std::env::var("BUSINESS_TIMEZONE").unwrap_or_else(|_| "UTC".into());
        let business_timezone: Tz = tz_name
            .parse()
            .map_err(|e| anyhow::anyhow!("BUSINESS_TIMEZONE {tz_name:?} is not a valid IANA name: {e}"))?;

        let currency = std::env::var("CURRENCY").unwrap_or_else(|_| "USD".into());
        let admin_token = std::env::var("ADMIN_TOKEN").context("ADMIN_TOKEN must be set")?;

        let online_discount_percent = env_i64("ONLINE_DISCOUNT_PERCENT", 0)?;
        anyhow::ensure!(
            (0..=100).contains(&online_discount_percent),
            "ONLINE_DISCOUNT_PERCENT must be in 0..=100"
        );

        let policy_defaults = Policy {
            lead_time_minutes: env_i64("LEAD_TIME_MINUTES", 0)?,
            future_window_days: env_i64("FUTURE_WINDOW_DAYS", 60)?,
            reschedule_lock_hours: env_i64("RESCHEDULE_LOCK_HOURS", 3)?,
            cancel_lock_hours: env_i64("CANCEL_LOCK_HOURS", 3)?,
            hold_ttl_minutes: env_i64("HOLD_TTL_MINUTES", 15)?,
            online_discount_percent,
            online_enabled: env_bool("ONLINE_ENABLED", false)?,
            reschedule_max: env_i64("RESCHEDULE_MAX", 3)?,
            slot_grid_minutes: env_i64("SLOT_GRID_MINUTES", 15)?,
            // 0 or absent disables reminders
            reminder_lead_minutes: match env_i64("REMINDER_LEAD_MINUTES", 0)? {
                0 => None,
                n => Some(n),
            },
        };

        Ok(Self {
            database_url,
            host,
            port,
            business_timezone,
            currency,
            admin_token,
            settings_cache_ttl: Duration::from_secs(env_i64("SETTINGS_CACHE_TTL_SECONDS", 60)? as u64),
            request_timeout: Duration::from_secs(env_i64("REQUEST_TIMEOUT_SECS", 30)? as u64),
            payment_api_url: std::env::var("PAYMENT_API_URL").ok().filter(|s| !s.is_empty()),
            payment_shop_id: std::env::var("PAYMENT_SHOP_ID").unwrap_or_default(),
            payment_secret_key: std::env::var("PAYMENT_SECRET_KEY").unwrap_or_default(),
            notifier_webhook_url: std::env::var("NOTIFIER_WEBHOOK_URL").ok().filter(|s| !s.is_empty()),
            policy_defaults,
        })
    }
}

fn env_i64(name: &str, default: i64) -> anyhow::Result<i64> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{name} must be a number, got {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn env_bool(name: &str, default: bool) -> anyhow::Result<bool> {
    match std::env::var(name) {
        Ok(raw) => match raw.as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            other => anyhow::bail!("{name} must be a boolean, got {other:?}"),
        },
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_durations() {
        let policy = Policy {
            lead_time_minutes: 30,
            future_window_days: 60,
            reschedule_lock_hours: 3,
            cancel_lock_hours: 2,
            hold_ttl_minutes: 15,
            online_discount_percent: 10,
            online_enabled: true,
            reschedule_max: 3,
            slot_grid_minutes: 15,
            reminder_lead_minutes: Some(120),
        };
        assert_eq!(policy.hold_ttl(), chrono::Duration::minutes(15));
        assert_eq!(policy.lead_time(), chrono::Duration::minutes(30));
        assert_eq!(policy.future_window(), chrono::Duration::days(60));
        assert_eq!(policy.cancel_lock(), chrono::Duration::hours(2));
    }
}
