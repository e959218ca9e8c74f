use chrono::{DateTime, Duration, NaiveDate, Timelike, Utc};

pub const WINDOW_MINUTES: u32 = 5;

/// The platform reports and schedules in China Standard Time.
pub const PLATFORM_UTC_OFFSET_HOURS: i64 = 8;

/// Calendar date at `now` in platform local time.
pub fn platform_date(now: DateTime<Utc>) -> NaiveDate {
  (now + Duration::hours(PLATFORM_UTC_OFFSET_HOURS)).date_naive()
}

/// Floors a timestamp to its 5-minute window: 12:07:35 -> 12:05:00.
pub fn floor5(ts: DateTime<Utc>) -> DateTime<Utc> {
  let minute = ts.minute() - ts.minute() % WINDOW_MINUTES;
  ts.with_nanosecond(0)
    .and_then(|t| t.with_second(0))
    .and_then(|t| t.with_minute(minute))
    .unwrap_or(ts)
}

pub fn current_window() -> DateTime<Utc> {
  floor5(Utc::now())
}

pub fn previous_window(now: DateTime<Utc>) -> DateTime<Utc> {
  floor5(now - Duration::minutes(WINDOW_MINUTES as i64))
}

/// The `count` most recent windows ending at the window containing `now`, newest first.
pub fn recent_windows(now: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
  let current = floor5(now);
  (0..count)
    .map(|i| current - Duration::minutes(WINDOW_MINUTES as i64 * i as i64))
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 26, h, m, s).unwrap()
  }

  #[test]
  fn floors_to_five_minute_boundary() {
    assert_eq!(floor5(at(12, 7, 35)), at(12, 5, 0));
    assert_eq!(floor5(at(12, 3, 15)), at(12, 0, 0));
    assert_eq!(floor5(at(12, 13, 59)), at(12, 10, 0));
    assert_eq!(floor5(at(23, 59, 59)), at(23, 55, 0));
  }

  #[test]
  fn floor_is_aligned_and_idempotent() {
    let base = at(0, 0, 0) + Duration::milliseconds(123);
    for step in 0..2000 {
      let ts = base + Duration::seconds(step * 37);
      let w = floor5(ts);
      assert_eq!(w.minute() % 5, 0);
      assert_eq!(w.second(), 0);
      assert_eq!(w.nanosecond(), 0);
      assert!(w <= ts);
      assert!(ts - w < Duration::minutes(5));
      assert_eq!(floor5(w), w);
    }
  }

  #[test]
  fn floor_is_monotonic() {
    let mut last = floor5(at(9, 0, 0));
    for step in 0..600 {
      let w = floor5(at(9, 0, 0) + Duration::seconds(step * 11));
      assert!(w >= last);
      last = w;
    }
  }

  #[test]
  fn previous_window_steps_back_once() {
    assert_eq!(previous_window(at(12, 7, 35)), at(12, 0, 0));
    assert_eq!(previous_window(at(0, 2, 0)), Utc.with_ymd_and_hms(2026, 1, 25, 23, 55, 0).unwrap());
  }

  #[test]
  fn recent_windows_are_newest_first() {
    let windows = recent_windows(at(12, 7, 35), 3);
    assert_eq!(windows, vec![at(12, 5, 0), at(12, 0, 0), at(11, 55, 0)]);
  }

  #[test]
  fn platform_date_turns_over_at_sixteen_utc() {
    assert_eq!(platform_date(at(15, 59, 59)), NaiveDate::from_ymd_opt(2026, 1, 26).unwrap());
    assert_eq!(platform_date(at(16, 0, 0)), NaiveDate::from_ymd_opt(2026, 1, 27).unwrap());
  }
}
