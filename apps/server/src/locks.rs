use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Seconds per advisory-lock bucket. One-hour buckets are wide enough that
/// two intervals which could overlap always share at least one touched
/// bucket; attempts on disjoint hours proceed in parallel.
const BUCKET_SECS: i64 = 3600;

/// Process-wide advisory locks for booking writes.
///
/// Two key spaces: `(staff_id, hour bucket)` serializes writers whose
/// proposed intervals could collide on one staff member, and per-booking
/// locks serialize transitions of a single row (state machine and workers).
/// Guards are RAII; holders keep them across the write transaction so the
/// lock never outlives the operation.
#[derive(Clone, Default)]
pub struct LockManager {
    slots: Arc<DashMap<i64, Arc<Mutex<()>>>>,
    bookings: Arc<DashMap<i64, Arc<Mutex<()>>>>,
}

/// Holds every bucket lock a proposed interval touches, in ascending key
/// order (consistent ordering rules out deadlock between writers).
pub struct SpanGuard {
    _guards: Vec<OwnedMutexGuard<()>>,
}

fn bucket_key(staff_id: i64, bucket: i64) -> i64 {
    // Mix the staff id into high bits; buckets occupy the low range for
    // any realistic horizon.
    staff_id
        .wrapping_mul(0x9e37_79b9_7f4a_7c15_u64 as i64)
        .wrapping_add(bucket)
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock every `(staff_id, hour)` bucket that `[start, end)` touches.
    pub async fn lock_span(
        &self,
        staff_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> SpanGuard {
        let first = start.timestamp().div_euclid(BUCKET_SECS);
        let last = (end.timestamp() - 1).max(start.timestamp()).div_euclid(BUCKET_SECS);

        let mut guards = Vec::with_capacity((last - first + 1) as usize);
        for bucket in first..=last {
            let key = bucket_key(staff_id, bucket);
            let mutex = self
                .slots
                .entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone();
            guards.push(mutex.lock_owned().await);
        }
        SpanGuard { _guards: guards }
    }

    /// Serialize transitions of a single booking row.
    pub async fn lock_booking(&self, booking_id: i64) -> OwnedMutexGuard<()> {
        let mutex = self
            .bookings
            .entry(booking_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// Drop map entries nobody holds. Called from the worker housekeeping
    /// tick; DashMap's shard locks make the strong-count check race-free
    /// against concurrent `entry` calls.
    pub fn sweep(&self) {
        self.slots.retain(|_, mutex| Arc::strong_count(mutex) > 1);
        self.bookings.retain(|_, mutex| Arc::strong_count(mutex) > 1);
    }

    #[cfg(test)]
    fn slot_entries(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn span_covers_every_touched_hour() {
        let locks = LockManager::new();
        // 10:30–12:30 touches the 10:00, 11:00 and 12:00 buckets.
        let guard = locks
            .lock_span(7, utc(2025, 6, 10, 10, 30), utc(2025, 6, 10, 12, 30))
            .await;
        assert_eq!(locks.slot_entries(), 3);
        drop(guard);

        // An interval ending exactly on the hour does not touch the next bucket.
        let guard = locks
            .lock_span(7, utc(2025, 6, 10, 10, 0), utc(2025, 6, 10, 11, 0))
            .await;
        locks.sweep();
        assert_eq!(locks.slot_entries(), 1);
        drop(guard);
    }

    #[tokio::test]
    async fn overlapping_spans_on_same_staff_serialize() {
        let locks = LockManager::new();
        let in_critical = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let in_critical = in_critical.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks
                    .lock_span(1, utc(2025, 6, 10, 11, 0), utc(2025, 6, 10, 12, 0))
                    .await;
                let now = in_critical.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                in_critical.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disjoint_staff_do_not_contend() {
        let locks = LockManager::new();
        let _a = locks
            .lock_span(1, utc(2025, 6, 10, 11, 0), utc(2025, 6, 10, 12, 0))
            .await;
        // Same hour, different staff member: must not block.
        let _b = locks
            .lock_span(2, utc(2025, 6, 10, 11, 0), utc(2025, 6, 10, 12, 0))
            .await;
    }

    #[tokio::test]
    async fn sweep_keeps_held_locks() {
        let locks = LockManager::new();
        let guard = locks.lock_booking(42).await;
        locks.sweep();
        assert_eq!(locks.bookings.len(), 1);
        drop(guard);
        locks.sweep();
        assert!(locks.bookings.is_empty());
    }
}
