use chrono::{DateTime, Datelike, Days, Duration, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use std::collections::BTreeSet;

use crate::catalog::Catalog;
use crate::config::Policy;
use crate::error::BookingError;
use crate::models::StaffSchedule;
use crate::pricing;

/// Half-open UTC interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Interval {
    pub fn overlaps(&self, other: &Interval) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// A free stretch of a working window. The window's opening instant is kept
/// as the grid anchor: candidate starts step from the opening, not from
/// wherever a booking happened to end.
#[derive(Debug, Clone, Copy)]
pub struct FreeRun {
    pub anchor: DateTime<Utc>,
    pub span: Interval,
}

/// A legal start plus the end of the free run it sits in (the "room"
/// measure used by the any-staff tie-break).
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub start: DateTime<Utc>,
    pub run_end: DateTime<Utc>,
}

/// Computes legal start times from a staff member's calendar and booking
/// footprint. Read-only: callers must re-verify at booking time.
#[derive(Clone)]
pub struct Engine {
    catalog: Catalog,
    tz: Tz,
}

impl Engine {
    pub fn new(catalog: Catalog, tz: Tz) -> Self {
        Self { catalog, tz }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Legal starts for `bundle` on `staff_id` during `date` (business-local).
    pub async fn slots(
        &self,
        staff_id: i64,
        date: NaiveDate,
        bundle_ids: &[i64],
        now: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, BookingError> {
        Ok(self
            .candidates(staff_id, date, bundle_ids, now)
            .await?
            .into_iter()
            .map(|candidate| candidate.start)
            .collect())
    }

    /// Days of the month with at least one legal start.
    pub async fn available_days(
        &self,
        staff_id: i64,
        year: i32,
        month: u32,
        bundle_ids: &[i64],
        now: DateTime<Utc>,
    ) -> Result<BTreeSet<u32>, BookingError> {
        let mut days = BTreeSet::new();
        for day in 1..=days_in_month(year, month)? {
            let date = NaiveDate::from_ymd_opt(year, month, day)
                .ok_or_else(|| BookingError::BadInput("invalid calendar day".into()))?;
            if !self.slots(staff_id, date, bundle_ids, now).await?.is_empty() {
                days.insert(day);
            }
        }
        Ok(days)
    }

    /// Any-staff mode: for each instant where at least one eligible staff
    /// member is free, pick the one with the most contiguous free room
    /// (farthest next-occupied boundary); ties go to the lowest staff id.
    pub async fn slots_any(
        &self,
        date: NaiveDate,
        bundle_ids: &[i64],
        now: DateTime<Utc>,
    ) -> Result<Vec<(DateTime<Utc>, i64)>, BookingError> {
        self.catalog.bundle(bundle_ids).await?;
        let eligible = self.catalog.staff_for_bundle(bundle_ids).await?;
        if eligible.is_empty() {
            return Err(BookingError::NoSkillMatch);
        }

        let mut best: std::collections::BTreeMap<DateTime<Utc>, (DateTime<Utc>, i64)> =
            std::collections::BTreeMap::new();
        for staff in eligible {
            for candidate in self.candidates(staff.id, date, bundle_ids, now).await? {
                best.entry(candidate.start)
                    .and_modify(|(run_end, staff_id)| {
                        // Staff are visited in ascending id order, so a
                        // strictly larger run wins and a tie keeps the
                        // earlier (lower) id.
                        if candidate.run_end > *run_end {
                            *run_end = candidate.run_end;
                            *staff_id = staff.id;
                        }
                    })
                    .or_insert((candidate.run_end, staff.id));
            }
        }
        Ok(best
            .into_iter()
            .map(|(start, (_, staff_id))| (start, staff_id))
            .collect())
    }

    pub async fn available_days_any(
        &self,
        year: i32,
        month: u32,
        bundle_ids: &[i64],
        now: DateTime<Utc>,
    ) -> Result<BTreeSet<u32>, BookingError> {
        let mut days = BTreeSet::new();
        for day in 1..=days_in_month(year, month)? {
            let date = NaiveDate::from_ymd_opt(year, month, day)
                .ok_or_else(|| BookingError::BadInput("invalid calendar day".into()))?;
            if !self.slots_any(date, bundle_ids, now).await?.is_empty() {
                days.insert(day);
            }
        }
        Ok(days)
    }

    /// Resolve the any-staff mode to a concrete staff member for `start`.
    pub async fn pick_staff(
        &self,
        start: DateTime<Utc>,
        bundle_ids: &[i64],
        now: DateTime<Utc>,
    ) -> Result<i64, BookingError> {
        let date = start.with_timezone(&self.tz).date_naive();
        self.slots_any(date, bundle_ids, now)
            .await?
            .into_iter()
            .find(|(slot, _)| *slot == start)
            .map(|(_, staff_id)| staff_id)
            .ok_or(BookingError::SlotUnavailable)
    }

    /// Non-binding availability probe for one concrete start.
    pub async fn check_slot(
        &self,
        staff_id: Option<i64>,
        start: DateTime<Utc>,
        bundle_ids: &[i64],
        now: DateTime<Utc>,
    ) -> Result<Option<&'static str>, BookingError> {
        let policy = self.catalog.policy().await?;
        if let Err(err) = crate::policy::can_start(&policy, now, start) {
            return Ok(Some(match err {
                BookingError::LeadTimeBlocked => "lead_time_blocked",
                _ => "beyond_horizon",
            }));
        }

        let date = start.with_timezone(&self.tz).date_naive();
        let staff_id = match staff_id {
            Some(id) => id,
            None => match self.pick_staff(start, bundle_ids, now).await {
                Ok(id) => id,
                Err(BookingError::SlotUnavailable) => return Ok(Some("slot_unavailable")),
                Err(other) => return Err(other),
            },
        };

        if self
            .slots(staff_id, date, bundle_ids, now)
            .await?
            .contains(&start)
        {
            return Ok(None);
        }

        // Not a legal start; distinguish a booked collision from a start
        // that never lies on this staff member's grid.
        let services = self.catalog.bundle(bundle_ids).await?;
        let schedule = self.catalog.schedule(staff_id).await?;
        let duration =
            Duration::minutes(pricing::effective_duration_min(&services, Some(&schedule.speeds)));
        let proposed = Interval {
            start,
            end: start + duration,
        };
        let occupied = self.occupied(proposed.start, proposed.end, staff_id).await?;
        if occupied.iter().any(|busy| busy.overlaps(&proposed)) {
            Ok(Some("slot_unavailable"))
        } else {
            Ok(Some("outside_schedule"))
        }
    }

    /// The full §4.2 pipeline for one staff member and local date.
    pub async fn candidates(
        &self,
        staff_id: i64,
        date: NaiveDate,
        bundle_ids: &[i64],
        now: DateTime<Utc>,
    ) -> Result<Vec<Candidate>, BookingError> {
        let services = self.catalog.bundle(bundle_ids).await?;
        self.catalog.staff_by_id(staff_id).await?;
        let schedule = self.catalog.schedule(staff_id).await?;
        for service in &services {
            if !schedule.speeds.contains_key(&service.id) {
                return Err(BookingError::NoSkillMatch);
            }
        }

        let policy = self.catalog.policy().await?;
        let duration =
            Duration::minutes(pricing::effective_duration_min(&services, Some(&schedule.speeds)));

        let day_start = local_to_utc(self.tz, date, 0);
        let day_end = local_to_utc(self.tz, date, 1440);
        let occupied = self
            .occupied(day_start - Duration::days(1), day_end + Duration::days(1), staff_id)
            .await?;

        let runs = free_runs(&schedule, self.tz, date, &occupied);
        Ok(grid_walk(
            &runs,
            duration,
            Duration::minutes(policy.slot_grid_minutes.max(1)),
            &policy,
            now,
        ))
    }

    async fn occupied(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        staff_id: i64,
    ) -> Result<Vec<Interval>, BookingError> {
        let rows: Vec<(DateTime<Utc>, DateTime<Utc>)> = sqlx::query_as(
            "SELECT starts_at, ends_at FROM bookings
             WHERE staff_id = ?
               AND status IN ('reserved', 'pending_payment', 'confirmed', 'paid')
               AND starts_at < ? AND ends_at > ?
             ORDER BY starts_at ASC",
        )
        .bind(staff_id)
        .bind(to)
        .bind(from)
        .fetch_all(self.catalog.pool())
        .await?;
        Ok(rows
            .into_iter()
            .map(|(start, end)| Interval { start, end })
            .collect())
    }
}

// ── Pure core ──

/// Working windows for the date's weekday, minus breaks, minus occupied
/// intervals. Runs keep their window's opening instant as grid anchor.
pub fn free_runs(
    schedule: &StaffSchedule,
    tz: Tz,
    date: NaiveDate,
    occupied: &[Interval],
) -> Vec<FreeRun> {
    let weekday = date.weekday().num_days_from_monday() as i64;

    let mut runs: Vec<FreeRun> = schedule
        .windows
        .iter()
        .filter(|window| window.weekday == weekday)
        .map(|window| {
            let open = local_to_utc(tz, date, window.open_min);
            let close = local_to_utc(tz, date, window.close_min);
            FreeRun {
                anchor: open,
                span: Interval {
                    start: open,
                    end: close,
                },
            }
        })
        .collect();

    let mut busy: Vec<Interval> = schedule
        .breaks
        .iter()
        .filter(|brk| brk.weekday == weekday)
        .map(|brk| Interval {
            start: local_to_utc(tz, date, brk.start_min),
            end: local_to_utc(tz, date, brk.end_min),
        })
        .chain(occupied.iter().copied())
        .collect();
    busy.sort_by_key(|interval| interval.start);

    for blocker in busy {
        runs = runs
            .into_iter()
            .flat_map(|run| split_run(run, blocker))
            .collect();
    }
    runs.sort_by_key(|run| run.span.start);
    runs
}

fn split_run(run: FreeRun, blocker: Interval) -> Vec<FreeRun> {
    if !run.span.overlaps(&blocker) {
        return vec![run];
    }
    let mut pieces = Vec::new();
    if blocker.start > run.span.start {
        pieces.push(FreeRun {
            anchor: run.anchor,
            span: Interval {
                start: run.span.start,
                end: blocker.start,
            },
        });
    }
    if blocker.end < run.span.end {
        pieces.push(FreeRun {
            anchor: run.anchor,
            span: Interval {
                start: blocker.end,
                end: run.span.end,
            },
        });
    }
    pieces
}

/// Emit every grid-aligned `t` with `[t, t+duration)` inside a free run,
/// then apply the lead-time and future-window policy filters.
pub fn grid_walk(
    runs: &[FreeRun],
    duration: Duration,
    grid: Duration,
    policy: &Policy,
    now: DateTime<Utc>,
) -> Vec<Candidate> {
    let earliest = now + policy.lead_time();
    let horizon = now + policy.future_window();

    let mut candidates = Vec::new();
    for run in runs {
        // First grid point at or after the run's start, counted from the
        // window opening.
        let offset = (run.span.start - run.anchor).num_seconds();
        let step = grid.num_seconds().max(60);
        let ticks = (offset + step - 1).div_euclid(step);
        let mut t = run.anchor + Duration::seconds(ticks * step);

        while t + duration <= run.span.end {
            if t >= earliest && t <= horizon {
                candidates.push(Candidate {
                    start: t,
                    run_end: run.span.end,
                });
            }
            t += grid;
        }
    }
    candidates.sort_by_key(|candidate| candidate.start);
    candidates
}

fn days_in_month(year: i32, month: u32) -> Result<u32, BookingError> {
    if !(1..=12).contains(&month) {
        return Err(BookingError::BadInput("month must be in 1..=12".into()));
    }
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
    .ok_or_else(|| BookingError::BadInput("invalid year/month".into()))?;
    Ok(next.pred_opt().map(|d| d.day()).unwrap_or(28))
}

/// Resolve a minute-of-day on a business-local date to UTC. Minute 1440 is
/// the next local midnight. DST gaps nudge forward to the first valid wall
/// time; ambiguous times take the earlier offset.
pub fn local_to_utc(tz: Tz, date: NaiveDate, minute_of_day: i64) -> DateTime<Utc> {
    let (date, minute) = if minute_of_day >= 1440 {
        (
            date.checked_add_days(Days::new(1)).unwrap_or(date),
            minute_of_day - 1440,
        )
    } else {
        (date, minute_of_day)
    };
    let naive = date
        .and_hms_opt((minute / 60) as u32, (minute % 60) as u32, 0)
        .unwrap_or_else(|| date.and_hms_opt(0, 0, 0).expect("midnight is valid"));

    use chrono::offset::LocalResult;
    for nudge_min in [0i64, 30, 60] {
        let probe = naive + Duration::minutes(nudge_min);
        match tz.from_local_datetime(&probe) {
            LocalResult::Single(dt) => return dt.with_timezone(&Utc),
            LocalResult::Ambiguous(earlier, _) => return earlier.with_timezone(&Utc),
            LocalResult::None => continue,
        }
    }
    // Unreachable for real timezones; fall back to treating the wall time
    // as UTC rather than panicking.
    DateTime::from_naive_utc_and_offset(naive, Utc)
}
