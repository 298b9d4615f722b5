//! Cycle scheduling: fixed instants, dense cycle numbers, missed-cycle
//! accounting. Pure state over `std::time::Instant` so it is testable
//! without a runtime; the monitor sleeps until each planned instant.

use std::time::{Duration, Instant};

use crate::config::SETTLEMENT_GRACE_SECS;
use crate::types::SamplingMode;

#[derive(Debug, Clone, Copy)]
pub struct CycleSchedule {
    pub interval: Duration,
    pub first: Instant,
    /// No cycle fires after this instant (settlement minus grace).
    pub last_allowed: Instant,
    pub planned_total: i64,
}

impl CycleSchedule {
    /// FIXED_INTERVAL(I): first cycle immediately (mid-window join), then
    /// every I seconds until settlement − grace.
    pub fn fixed_interval(now: Instant, time_remaining: Duration, interval: Duration) -> Self {
        let grace = Duration::from_secs(SETTLEMENT_GRACE_SECS);
        let last_allowed = now + time_remaining.saturating_sub(grace);
        let planned_total =
            (time_remaining.as_secs_f64() / interval.as_secs_f64()).floor().max(1.0) as i64;
        Self { interval, first: now, last_allowed, planned_total }
    }

    /// FIXED_COUNT(N): interval = remaining / N floored to at least one
    /// second; first cycle immediately.
    pub fn fixed_count(now: Instant, time_remaining: Duration, cycles: u32) -> Self {
        let grace = Duration::from_secs(SETTLEMENT_GRACE_SECS);
        let cycles = cycles.max(1);
        let interval_secs = (time_remaining.as_secs() / u64::from(cycles)).max(1);
        let interval = Duration::from_secs(interval_secs);
        let last_allowed = now + time_remaining.saturating_sub(grace);
        Self { interval, first: now, last_allowed, planned_total: i64::from(cycles) }
    }

    pub fn from_mode(
        mode: SamplingMode,
        now: Instant,
        time_remaining: Duration,
        interval: Duration,
        cycles: u32,
    ) -> Self {
        match mode {
            SamplingMode::FixedInterval => Self::fixed_interval(now, time_remaining, interval),
            SamplingMode::FixedCount => Self::fixed_count(now, time_remaining, cycles),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedCycle {
    pub number: i64,
    pub instant: Instant,
}

/// Hands out planned cycles in order. Cycle numbers are dense and never
/// shift: a cycle whose instant has passed by more than one full interval is
/// dropped and counted as missed, not coalesced into the next execution.
#[derive(Debug)]
pub struct CycleTicker {
    schedule: CycleSchedule,
    next_number: i64,
    next_instant: Instant,
    missed: i64,
}

impl CycleTicker {
    pub fn new(schedule: CycleSchedule) -> Self {
        Self {
            next_instant: schedule.first,
            schedule,
            next_number: 1,
            missed: 0,
        }
    }

    /// Next cycle to execute at or after `now`, or `None` once the schedule
    /// has run past settlement grace. The returned instant may be slightly in
    /// the past (≤ one interval): the cycle still executes, late.
    pub fn next(&mut self, now: Instant) -> Option<PlannedCycle> {
        while self.next_instant <= self.schedule.last_allowed
            && now >= self.next_instant + self.schedule.interval
        {
            self.missed += 1;
            self.next_number += 1;
            self.next_instant += self.schedule.interval;
        }

        if self.next_instant > self.schedule.last_allowed {
            return None;
        }

        let cycle = PlannedCycle { number: self.next_number, instant: self.next_instant };
        self.next_number += 1;
        self.next_instant += self.schedule.interval;
        Some(cycle)
    }

    pub fn missed(&self) -> i64 {
        self.missed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: Duration = Duration::from_secs(1);

    fn schedule_10s(now: Instant, remaining_secs: u64) -> CycleSchedule {
        CycleSchedule::fixed_interval(now, Duration::from_secs(remaining_secs), 10 * SEC)
    }

    #[test]
    fn numbers_are_dense_from_one() {
        let now = Instant::now();
        let mut ticker = CycleTicker::new(schedule_10s(now, 60));

        let c1 = ticker.next(now).unwrap();
        assert_eq!(c1.number, 1);
        assert_eq!(c1.instant, now);

        let c2 = ticker.next(c1.instant).unwrap();
        assert_eq!(c2.number, 2);
        assert_eq!(c2.instant, now + 10 * SEC);

        let c3 = ticker.next(c2.instant).unwrap();
        assert_eq!(c3.number, 3);
    }

    #[test]
    fn stops_at_settlement_grace() {
        let now = Instant::now();
        // 25s remaining, grace 2s → cycles at 0s, 10s, 20s; 30s would pass
        // the 23s cutoff.
        let mut ticker = CycleTicker::new(schedule_10s(now, 25));
        assert_eq!(ticker.next(now).unwrap().number, 1);
        assert_eq!(ticker.next(now).unwrap().number, 2);
        assert_eq!(ticker.next(now).unwrap().number, 3);
        assert!(ticker.next(now).is_none());
    }

    #[test]
    fn overdue_cycles_are_dropped_and_counted() {
        let now = Instant::now();
        let mut ticker = CycleTicker::new(schedule_10s(now, 120));

        assert_eq!(ticker.next(now).unwrap().number, 1);

        // The previous cycle took 35 s. Cycles 2 and 3 (planned +10s, +20s)
        // are more than one interval overdue; cycle 4 (+30s) is ≤ one
        // interval late and still executes.
        let late = now + 35 * SEC;
        let c = ticker.next(late).unwrap();
        assert_eq!(c.number, 4);
        assert_eq!(c.instant, now + 30 * SEC);
        assert_eq!(ticker.missed(), 2);
    }

    #[test]
    fn slightly_late_cycle_still_fires() {
        let now = Instant::now();
        let mut ticker = CycleTicker::new(schedule_10s(now, 120));
        ticker.next(now).unwrap();

        // 9 s late is within one interval: cycle 2 fires, nothing missed.
        let c = ticker.next(now + 19 * SEC).unwrap();
        assert_eq!(c.number, 2);
        assert_eq!(ticker.missed(), 0);
    }

    #[test]
    fn fixed_count_floors_interval_to_one_second() {
        let now = Instant::now();
        let s = CycleSchedule::fixed_count(now, Duration::from_secs(30), 90);
        assert_eq!(s.interval, SEC);
        assert_eq!(s.planned_total, 90);
    }

    #[test]
    fn fixed_count_divides_remaining() {
        let now = Instant::now();
        let s = CycleSchedule::fixed_count(now, Duration::from_secs(900), 90);
        assert_eq!(s.interval, 10 * SEC);
    }

    #[test]
    fn late_join_still_gets_a_cycle() {
        // Less than two intervals of runway left: the immediate first cycle
        // must still fire before the grace cutoff.
        let now = Instant::now();
        let mut ticker = CycleTicker::new(schedule_10s(now, 15));
        let c = ticker.next(now).unwrap();
        assert_eq!(c.number, 1);
        assert_eq!(c.instant, now);
    }
}
