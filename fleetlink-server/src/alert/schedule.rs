//! Time-of-day/day-of-week gating for alert rows.

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// `days` uses Mon=0..Sun=6, matching `chrono::Weekday::num_days_from_monday`.
/// An absent schedule, or one with an empty `days` set, is always active.
/// `hour_end < hour_start` schedules (overnight windows) are not supported.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub days: Vec<u8>,
    pub hour_start: u8,
    pub hour_end: u8,
}

impl Schedule {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        if self.days.is_empty() {
            return true;
        }
        let weekday = now.weekday().num_days_from_monday() as u8;
        if !self.days.contains(&weekday) {
            return false;
        }
        let hour = now.hour() as u8;
        hour >= self.hour_start && hour <= self.hour_end
    }
}

pub fn row_is_active(schedule: &Option<Schedule>, now: DateTime<Utc>) -> bool {
    match schedule {
        Some(s) => s.is_active(now),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn absent_schedule_is_always_active() {
        let now = Utc.with_ymd_and_hms(2026, 7, 26, 3, 0, 0).unwrap();
        assert!(row_is_active(&None, now));
    }

    #[test]
    fn empty_days_is_always_active() {
        let schedule = Schedule {
            days: vec![],
            hour_start: 9,
            hour_end: 17,
        };
        let now = Utc.with_ymd_and_hms(2026, 7, 26, 3, 0, 0).unwrap(); // Sunday
        assert!(schedule.is_active(now));
    }

    #[test]
    fn gates_on_weekday_and_hour_range() {
        let schedule = Schedule {
            days: vec![0, 1, 2, 3, 4], // Mon-Fri
            hour_start: 9,
            hour_end: 17,
        };
        // 2026-07-27 is a Monday.
        let in_window = Utc.with_ymd_and_hms(2026, 7, 27, 12, 0, 0).unwrap();
        let out_of_window = Utc.with_ymd_and_hms(2026, 7, 27, 20, 0, 0).unwrap();
        let wrong_day = Utc.with_ymd_and_hms(2026, 7, 26, 12, 0, 0).unwrap(); // Sunday
        assert!(schedule.is_active(in_window));
        assert!(!schedule.is_active(out_of_window));
        assert!(!schedule.is_active(wrong_day));
    }
}
