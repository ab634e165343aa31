//! U.S. equity market calendar.
//!
//! Trading hours are Monday-Friday 09:30-16:00 America/New_York; the tz
//! database handles DST so no fixed UTC offset appears anywhere. Holidays
//! follow the federal market-holiday rules (fixed dates plus nth-weekday
//! floats).

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::America::New_York;

/// First trading minute of the session.
pub fn market_open_time() -> NaiveTime {
    NaiveTime::from_hms_opt(9, 30, 0).unwrap()
}

/// First minute after the session.
pub fn market_close_time() -> NaiveTime {
    NaiveTime::from_hms_opt(16, 0, 0).unwrap()
}

fn nth_weekday_of_month(year: i32, month: u32, weekday: Weekday, nth: u32) -> NaiveDate {
    let first = NaiveDate::from_ymd_opt(year, month, 1).unwrap();
    let offset = (7 + weekday.num_days_from_monday() as i64
        - first.weekday().num_days_from_monday() as i64)
        % 7;
    first + chrono::Duration::days(offset + 7 * (nth as i64 - 1))
}

fn last_weekday_of_month(year: i32, month: u32, weekday: Weekday) -> NaiveDate {
    let first_next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1).unwrap()
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1).unwrap()
    };
    let last = first_next - chrono::Duration::days(1);
    let offset = (7 + last.weekday().num_days_from_monday() as i64
        - weekday.num_days_from_monday() as i64)
        % 7;
    last - chrono::Duration::days(offset)
}

/// U.S. market holiday test.
///
/// New Year's Day, MLK Day (3rd Mon Jan), Presidents' Day (3rd Mon Feb),
/// Memorial Day (last Mon May), Independence Day, Labor Day (1st Mon Sep),
/// Thanksgiving (4th Thu Nov), Christmas.
pub fn is_market_holiday(date: NaiveDate) -> bool {
    let year = date.year();
    date == NaiveDate::from_ymd_opt(year, 1, 1).unwrap()
        || date == nth_weekday_of_month(year, 1, Weekday::Mon, 3)
        || date == nth_weekday_of_month(year, 2, Weekday::Mon, 3)
        || date == last_weekday_of_month(year, 5, Weekday::Mon)
        || date == NaiveDate::from_ymd_opt(year, 7, 4).unwrap()
        || date == nth_weekday_of_month(year, 9, Weekday::Mon, 1)
        || date == nth_weekday_of_month(year, 11, Weekday::Thu, 4)
        || date == NaiveDate::from_ymd_opt(year, 12, 25).unwrap()
}

/// Weekday that is not a market holiday.
pub fn is_trading_day(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !is_market_holiday(date)
}

/// Whether the market is open at the given instant.
pub fn is_market_open(now: DateTime<Utc>) -> bool {
    let ny = now.with_timezone(&New_York);
    let time = ny.time();
    is_trading_day(ny.date_naive()) && time >= market_open_time() && time < market_close_time()
}

/// Seconds until the next session open at or after `now`. Zero when the
/// market is already open.
pub fn seconds_until_open(now: DateTime<Utc>) -> i64 {
    if is_market_open(now) {
        return 0;
    }
    let ny = now.with_timezone(&New_York);
    let mut date = ny.date_naive();
    if !is_trading_day(date) || ny.time() >= market_open_time() {
        date += chrono::Duration::days(1);
        while !is_trading_day(date) {
            date += chrono::Duration::days(1);
        }
    }
    let open = New_York
        .from_local_datetime(&date.and_time(market_open_time()))
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(now);
    (open - now).num_seconds().max(0)
}

/// Seconds until the current session closes. Zero when the market is
/// already closed.
pub fn seconds_until_close(now: DateTime<Utc>) -> i64 {
    if !is_market_open(now) {
        return 0;
    }
    let ny = now.with_timezone(&New_York);
    let close = New_York
        .from_local_datetime(&ny.date_naive().and_time(market_close_time()))
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(now);
    (close - now).num_seconds().max(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn fixed_holidays() {
        assert!(is_market_holiday(date(2024, 1, 1)));
        assert!(is_market_holiday(date(2024, 7, 4)));
        assert!(is_market_holiday(date(2024, 12, 25)));
        assert!(!is_market_holiday(date(2024, 7, 3)));
        assert!(!is_market_holiday(date(2024, 7, 5)));
    }

    #[test]
    fn floating_holidays_2024() {
        // MLK: 2024-01-15, Presidents: 2024-02-19, Memorial: 2024-05-27,
        // Labor: 2024-09-02, Thanksgiving: 2024-11-28.
        assert!(is_market_holiday(date(2024, 1, 15)));
        assert!(is_market_holiday(date(2024, 2, 19)));
        assert!(is_market_holiday(date(2024, 5, 27)));
        assert!(is_market_holiday(date(2024, 9, 2)));
        assert!(is_market_holiday(date(2024, 11, 28)));
        assert!(!is_market_holiday(date(2024, 11, 21)));
    }

    #[test]
    fn weekends_are_not_trading_days() {
        assert!(!is_trading_day(date(2024, 1, 6)));
        assert!(!is_trading_day(date(2024, 1, 7)));
        assert!(is_trading_day(date(2024, 1, 8)));
    }

    #[test]
    fn market_open_respects_ny_session() {
        // 2024-03-15 is a regular Friday. 14:30 UTC is 10:30 EDT (open);
        // 13:00 UTC is 09:00 EDT (pre-open); 20:30 UTC is 16:30 EDT (closed).
        let open = Utc.with_ymd_and_hms(2024, 3, 15, 14, 30, 0).unwrap();
        let pre = Utc.with_ymd_and_hms(2024, 3, 15, 13, 0, 0).unwrap();
        let post = Utc.with_ymd_and_hms(2024, 3, 15, 20, 30, 0).unwrap();
        assert!(is_market_open(open));
        assert!(!is_market_open(pre));
        assert!(!is_market_open(post));
    }

    #[test]
    fn market_open_respects_dst_shift() {
        // Same wall-clock instant in January (EST, UTC-5): 14:30 UTC is
        // 09:30 EST, exactly the open.
        let jan = Utc.with_ymd_and_hms(2024, 1, 16, 14, 30, 0).unwrap();
        assert!(is_market_open(jan));
        // In July (EDT, UTC-4) 13:30 UTC is the open.
        let jul_pre = Utc.with_ymd_and_hms(2024, 7, 16, 13, 29, 0).unwrap();
        let jul_open = Utc.with_ymd_and_hms(2024, 7, 16, 13, 30, 0).unwrap();
        assert!(!is_market_open(jul_pre));
        assert!(is_market_open(jul_open));
    }

    #[test]
    fn seconds_until_open_skips_weekend() {
        // Friday 2024-01-05 21:00 UTC (after close) -> next open is
        // Monday 2024-01-08 14:30 UTC.
        let now = Utc.with_ymd_and_hms(2024, 1, 5, 21, 0, 0).unwrap();
        let expected_open = Utc.with_ymd_and_hms(2024, 1, 8, 14, 30, 0).unwrap();
        assert_eq!(seconds_until_open(now), (expected_open - now).num_seconds());
    }

    #[test]
    fn seconds_until_close_within_session() {
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 19, 0, 0).unwrap(); // 15:00 EDT
        assert_eq!(seconds_until_close(now), 3600);
        let closed = Utc.with_ymd_and_hms(2024, 3, 15, 21, 0, 0).unwrap();
        assert_eq!(seconds_until_close(closed), 0);
    }
}
