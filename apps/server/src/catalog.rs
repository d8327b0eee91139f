use dashmap::DashMap;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::config::Policy;
use crate::error::BookingError;
use crate::models::{BreakWindow, Service, Staff, StaffSchedule, WorkingWindow};

/// Read-only view of services, staff, schedules and the policy row.
///
/// Reads are cached for the configured TTL and dropped early when a
/// `CatalogInvalidated` event fires. The store stays authoritative; the
/// cache only saves round-trips on the availability hot path.
#[derive(Clone)]
pub struct Catalog {
    db: SqlitePool,
    cache: Arc<CacheInner>,
}

struct CacheInner {
    ttl: Duration,
    policy: RwLock<Option<(Instant, Policy)>>,
    schedules: DashMap<i64, (Instant, Arc<StaffSchedule>)>,
}

impl Catalog {
    pub fn new(db: SqlitePool, ttl: Duration) -> Self {
        Self {
            db,
            cache: Arc::new(CacheInner {
                ttl,
                policy: RwLock::new(None),
                schedules: DashMap::new(),
            }),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    /// Drop all cached reads. Wired to `CatalogInvalidated` on the event bus.
    pub fn invalidate(&self) {
        *self.cache.policy.write().expect("policy cache poisoned") = None;
        self.cache.schedules.clear();
    }

    pub async fn policy(&self) -> Result<Policy, BookingError> {
        if let Some((at, policy)) = self.cache.policy.read().expect("policy cache poisoned").as_ref()
        {
            if at.elapsed() < self.cache.ttl {
                return Ok(policy.clone());
            }
        }

        let policy = sqlx::query_as::<_, Policy>(
            "SELECT lead_time_minutes, future_window_days, reschedule_lock_hours,
                    cancel_lock_hours, hold_ttl_minutes, online_discount_percent,
                    online_enabled, reschedule_max, slot_grid_minutes, reminder_lead_minutes
             FROM policies WHERE id = 1",
        )
        .fetch_one(&self.db)
        .await?;

        *self.cache.policy.write().expect("policy cache poisoned") =
            Some((Instant::now(), policy.clone()));
        Ok(policy)
    }

    /// Active services, visible to clients, in display order.
    pub async fn services(&self) -> Result<Vec<Service>, BookingError> {
        let services = sqlx::query_as::<_, Service>(
            "SELECT id, name, description, duration_min, price_minor, currency,
                    is_active, sort_order
             FROM services WHERE is_active = 1 ORDER BY sort_order ASC, id ASC",
        )
        .fetch_all(&self.db)
        .await?;
        Ok(services)
    }

    /// Resolve an ordered bundle of service ids. The order of the result
    /// matches the request; a missing or inactive id fails the whole bundle.
    pub async fn bundle(&self, service_ids: &[i64]) -> Result<Vec<Service>, BookingError> {
        if service_ids.is_empty() {
            return Err(BookingError::BadInput("empty service bundle".into()));
        }

        let mut services = Vec::with_capacity(service_ids.len());
        for &id in service_ids {
            let service = sqlx::query_as::<_, Service>(
                "SELECT id, name, description, duration_min, price_minor, currency,
                        is_active, sort_order
                 FROM services WHERE id = ? AND is_active = 1",
            )
            .bind(id)
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| BookingError::BadInput(format!("unknown service {id}")))?;
            services.push(service);
        }
        Ok(services)
    }

    pub async fn staff(&self) -> Result<Vec<Staff>, BookingError> {
        let staff = sqlx::query_as::<_, Staff>(
            "SELECT id, display_name, is_active FROM staff WHERE is_active = 1 ORDER BY id ASC",
        )
        .fetch_all(&self.db)
        .await?;
        Ok(staff)
    }

    pub async fn staff_by_id(&self, staff_id: i64) -> Result<Staff, BookingError> {
        sqlx::query_as::<_, Staff>(
            "SELECT id, display_name, is_active FROM staff WHERE id = ? AND is_active = 1",
        )
        .bind(staff_id)
        .fetch_optional(&self.db)
        .await?
        .ok_or(BookingError::NotFound)
    }

    /// Staff members able to perform every service in the bundle.
    pub async fn staff_for_bundle(&self, service_ids: &[i64]) -> Result<Vec<Staff>, BookingError> {
        let mut distinct: Vec<i64> = service_ids.to_vec();
        distinct.sort_unstable();
        distinct.dedup();

        let mut eligible = Vec::new();
        for staff in self.staff().await? {
            let mut can_do_all = true;
            for &service_id in &distinct {
                let linked: bool = sqlx::query_scalar(
                    "SELECT COUNT(*) > 0 FROM staff_services
                     WHERE staff_id = ? AND service_id = ?",
                )
                .bind(staff.id)
                .bind(service_id)
                .fetch_one(&self.db)
                .await?;
                if !linked {
                    can_do_all = false;
                    break;
                }
            }
            if can_do_all {
                eligible.push(staff);
            }
        }
        Ok(eligible)
    }

    /// Weekly structure + speed table for one staff member, cached.
    pub async fn schedule(&self, staff_id: i64) -> Result<Arc<StaffSchedule>, BookingError> {
        if let Some(entry) = self.cache.schedules.get(&staff_id) {
            let (at, schedule) = entry.value();
            if at.elapsed() < self.cache.ttl {
                return Ok(schedule.clone());
            }
        }

        let windows = sqlx::query_as::<_, WorkingWindow>(
            "SELECT weekday, open_min, close_min FROM working_windows
             WHERE staff_id = ? ORDER BY weekday ASC, open_min ASC",
        )
        .bind(staff_id)
        .fetch_all(&self.db)
        .await?;

        let breaks = sqlx::query_as::<_, BreakWindow>(
            "SELECT weekday, start_min, end_min FROM breaks
             WHERE staff_id = ? ORDER BY weekday ASC, start_min ASC",
        )
        .bind(staff_id)
        .fetch_all(&self.db)
        .await?;

        let speed_rows: Vec<(i64, f64)> =
            sqlx::query_as("SELECT service_id, speed FROM staff_services WHERE staff_id = ?")
                .bind(staff_id)
                .fetch_all(&self.db)
                .await?;

        let schedule = Arc::new(StaffSchedule {
            windows,
            breaks,
            speeds: speed_rows.into_iter().collect::<HashMap<_, _>>(),
        });
        self.cache
            .schedules
            .insert(staff_id, (Instant::now(), schedule.clone()));
        Ok(schedule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::db::run_migrations(&pool, &crate::testing::default_policy())
            .await
            .unwrap();
        pool
    }

    #[tokio::test]
    async fn bundle_preserves_order_and_rejects_unknown() {
        let pool = test_pool().await;
        crate::testing::seed_catalog(&pool).await;
        let catalog = Catalog::new(pool, Duration::from_secs(60));

        let bundle = catalog.bundle(&[2, 1]).await.unwrap();
        assert_eq!(bundle.iter().map(|s| s.id).collect::<Vec<_>>(), vec![2, 1]);

        assert!(matches!(
            catalog.bundle(&[99]).await,
            Err(BookingError::BadInput(_))
        ));
        assert!(matches!(
            catalog.bundle(&[]).await,
            Err(BookingError::BadInput(_))
        ));
    }

    #[tokio::test]
    async fn staff_for_bundle_requires_every_service() {
        let pool = test_pool().await;
        crate::testing::seed_catalog(&pool).await;
        let catalog = Catalog::new(pool, Duration::from_secs(60));

        // Staff 1 performs services 1 and 2; staff 2 performs only service 1.
        let both = catalog.staff_for_bundle(&[1, 2]).await.unwrap();
        assert_eq!(both.iter().map(|s| s.id).collect::<Vec<_>>(), vec![1]);

        let single = catalog.staff_for_bundle(&[1]).await.unwrap();
        assert_eq!(single.iter().map(|s| s.id).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn policy_cache_serves_within_ttl_and_invalidates() {
        let pool = test_pool().await;
        crate::testing::seed_catalog(&pool).await;
        let catalog = Catalog::new(pool.clone(), Duration::from_secs(600));

        let first = catalog.policy().await.unwrap();
        assert_eq!(first.hold_ttl_minutes, 15);

        // A write behind the cache's back is not observed until invalidation.
        sqlx::query("UPDATE policies SET hold_ttl_minutes = 99 WHERE id = 1")
            .execute(&pool)
            .await
            .unwrap();
        assert_eq!(catalog.policy().await.unwrap().hold_ttl_minutes, 15);

        catalog.invalidate();
        assert_eq!(catalog.policy().await.unwrap().hold_ttl_minutes, 99);
    }
}
