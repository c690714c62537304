//! Send-window calculator: maps a candidate instant to the next instant a
//! sequence is permitted to send.
//!
//! Pure and total: no I/O, deterministic for a given timezone database.
//! `next_permitted` is idempotent: an instant already inside the window
//! maps to itself.

use cadence_core::SequenceSettings;
use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Resolve the sequence's timezone, defaulting to UTC on absent or invalid
/// names (an invalid name is a definition-layer bug; the scheduler degrades
/// to UTC rather than stalling the enrollment).
pub fn timezone(settings: &SequenceSettings) -> Tz {
    match settings.timezone.as_deref() {
        Some(name) => name.parse().unwrap_or_else(|_| {
            tracing::warn!("⚠️ Invalid timezone '{}', falling back to UTC", name);
            chrono_tz::UTC
        }),
        None => chrono_tz::UTC,
    }
}

/// Next instant at or after `candidate` that falls on an allowed send day
/// with a local time-of-day inside `[send_window_start, send_window_end)`.
pub fn next_permitted(candidate: DateTime<Utc>, settings: &SequenceSettings) -> DateTime<Utc> {
    let tz = timezone(settings);
    let local = candidate.with_timezone(&tz);
    let open = window_open(settings);

    let mut date = local.date_naive();
    // First day keeps the candidate's time; subsequent days start at open
    let mut time = local.time();

    // Two weeks bounds the walk even for a single allowed weekday
    for _ in 0..15 {
        if settings.allows_day(date.weekday()) {
            if time < open {
                time = open;
            }
            let inside = match settings.send_window_end {
                Some(end) => time < end,
                None => true,
            };
            if inside {
                // Untouched candidate maps to itself exactly (idempotence)
                if date == local.date_naive() && time == local.time() {
                    return candidate;
                }
                return localize(tz, date.and_time(time)).with_timezone(&Utc);
            }
        }
        date = next_day(date);
        time = open;
    }
    // Unreachable with a non-empty send_days set; be total anyway
    candidate
}

/// Add `days` send days to `from` and land at the window open time:
/// business-day arithmetic for day-granular delay steps. A two-day delay
/// issued on Friday under a Mon-Fri window lands on Tuesday morning.
pub fn add_send_days(from: DateTime<Utc>, days: u32, settings: &SequenceSettings) -> DateTime<Utc> {
    let tz = timezone(settings);
    let open = window_open(settings);
    let mut date = from.with_timezone(&tz).date_naive();

    let mut remaining = days;
    while remaining > 0 {
        date = next_day(date);
        if settings.allows_day(date.weekday()) {
            remaining -= 1;
        }
    }
    let target = localize(tz, date.and_time(open)).with_timezone(&Utc);
    // Clamp in case `days == 0` left us on a disallowed day or before open
    next_permitted(target, settings)
}

/// Local time-of-day the window opens; midnight when no window is set.
fn window_open(settings: &SequenceSettings) -> NaiveTime {
    settings
        .send_window_start
        .unwrap_or(NaiveTime::MIN)
}

fn next_day(date: NaiveDate) -> NaiveDate {
    date.succ_opt().unwrap_or(date)
}

/// Resolve a local wall-clock time to an instant, tolerating DST gaps and
/// folds: ambiguous times take the earlier offset, non-existent times shift
/// forward an hour.
fn localize(tz: Tz, naive: NaiveDateTime) -> DateTime<Tz> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt,
        LocalResult::Ambiguous(earlier, _) => earlier,
        LocalResult::None => match tz.from_local_datetime(&(naive + Duration::hours(1))) {
            LocalResult::Single(dt) => dt,
            LocalResult::Ambiguous(earlier, _) => earlier,
            LocalResult::None => tz.from_utc_datetime(&naive),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Weekday;

    fn business_hours() -> SequenceSettings {
        SequenceSettings {
            send_window_start: Some(NaiveTime::from_hms_opt(9, 0, 0).unwrap()),
            send_window_end: Some(NaiveTime::from_hms_opt(17, 0, 0).unwrap()),
            send_days: Some(vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
            ]),
            ..SequenceSettings::default()
        }
    }

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_inside_window_is_identity() {
        let settings = business_hours();
        // Wednesday 2026-03-04 10:30 UTC
        let t = utc(2026, 3, 4, 10, 30);
        assert_eq!(next_permitted(t, &settings), t);
    }

    #[test]
    fn test_before_open_advances_to_open() {
        let settings = business_hours();
        // Wednesday 07:00 → Wednesday 09:00
        let t = utc(2026, 3, 4, 7, 0);
        assert_eq!(next_permitted(t, &settings), utc(2026, 3, 4, 9, 0));
    }

    #[test]
    fn test_after_close_advances_to_next_day() {
        let settings = business_hours();
        // Wednesday 17:00 (exclusive end) → Thursday 09:00
        let t = utc(2026, 3, 4, 17, 0);
        assert_eq!(next_permitted(t, &settings), utc(2026, 3, 5, 9, 0));
    }

    #[test]
    fn test_weekend_advances_to_monday() {
        let settings = business_hours();
        // Saturday 2026-03-07 11:00 → Monday 2026-03-09 09:00
        let t = utc(2026, 3, 7, 11, 0);
        assert_eq!(next_permitted(t, &settings), utc(2026, 3, 9, 9, 0));
    }

    #[test]
    fn test_friday_evening_rolls_over_weekend() {
        let settings = business_hours();
        // Friday 2026-03-06 18:00 → Monday 09:00
        let t = utc(2026, 3, 6, 18, 0);
        assert_eq!(next_permitted(t, &settings), utc(2026, 3, 9, 9, 0));
    }

    #[test]
    fn test_idempotent() {
        let settings = business_hours();
        for t in [
            utc(2026, 3, 4, 7, 0),
            utc(2026, 3, 4, 12, 0),
            utc(2026, 3, 6, 23, 59),
            utc(2026, 3, 8, 0, 0),
        ] {
            let once = next_permitted(t, &settings);
            assert_eq!(next_permitted(once, &settings), once);
        }
    }

    #[test]
    fn test_result_always_in_window() {
        let settings = business_hours();
        let mut t = utc(2026, 3, 1, 0, 0);
        for _ in 0..200 {
            let next = next_permitted(t, &settings);
            assert!(settings.allows_day(next.weekday()));
            let time = next.time();
            assert!(time >= NaiveTime::from_hms_opt(9, 0, 0).unwrap());
            assert!(time < NaiveTime::from_hms_opt(17, 0, 0).unwrap());
            t += Duration::hours(7);
        }
    }

    #[test]
    fn test_no_restrictions_is_identity() {
        let settings = SequenceSettings::default();
        let t = utc(2026, 3, 7, 3, 33); // Saturday, 03:33
        assert_eq!(next_permitted(t, &settings), t);
    }

    #[test]
    fn test_timezone_window() {
        let settings = SequenceSettings {
            timezone: Some("America/New_York".into()),
            ..business_hours()
        };
        // 12:00 UTC in winter = 07:00 New York (before open)
        // → 09:00 New York = 14:00 UTC
        let t = utc(2026, 1, 7, 12, 0); // Wednesday
        assert_eq!(next_permitted(t, &settings), utc(2026, 1, 7, 14, 0));
    }

    #[test]
    fn test_invalid_timezone_falls_back_to_utc() {
        let settings = SequenceSettings {
            timezone: Some("Mars/Olympus_Mons".into()),
            ..business_hours()
        };
        let t = utc(2026, 3, 4, 10, 30);
        assert_eq!(next_permitted(t, &settings), t);
    }

    #[test]
    fn test_add_send_days_skips_weekend() {
        let settings = business_hours();
        // Friday 2026-03-06 16:00 + 2 send days → Tuesday 2026-03-10 09:00
        let friday = utc(2026, 3, 6, 16, 0);
        assert_eq!(add_send_days(friday, 2, &settings), utc(2026, 3, 10, 9, 0));
    }

    #[test]
    fn test_add_send_days_without_restrictions() {
        let settings = SequenceSettings::default();
        // Every day allowed, no window: lands at midnight N days out
        let t = utc(2026, 3, 6, 16, 0);
        assert_eq!(add_send_days(t, 3, &settings), utc(2026, 3, 9, 0, 0));
    }
}
