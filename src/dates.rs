//! Client datetimes arrive as naive Europe/Paris wall-clock values and are
//! stored as UTC `YYYY-MM-DD HH:MM:SS` text.

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc, Weekday};

pub const DB_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn last_sunday(year: i32, month: u32) -> Option<NaiveDate> {
    let first_next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    let mut day = first_next.pred_opt()?;
    while day.weekday() != Weekday::Sun {
        day = day.pred_opt()?;
    }
    Some(day)
}

/// Paris offset from UTC in hours at a given UTC instant.
pub fn paris_offset_hours(utc: NaiveDateTime) -> i64 {
    let year = utc.year();
    let one_am = NaiveTime::from_hms_opt(1, 0, 0).unwrap_or(NaiveTime::MIN);
    let (Some(start), Some(end)) = (last_sunday(year, 3), last_sunday(year, 10)) else {
        return 1;
    };
    let start = start.and_time(one_am);
    let end = end.and_time(one_am);
    if utc >= start && utc < end {
        2
    } else {
        1
    }
}

/// Convert a Paris wall-clock time to UTC. Ambiguous times in the October
/// overlap resolve to summer time; skipped March times shift forward.
pub fn paris_to_utc(local: NaiveDateTime) -> NaiveDateTime {
    let summer_guess = local - Duration::hours(2);
    if paris_offset_hours(summer_guess) == 2 {
        summer_guess
    } else {
        local - Duration::hours(1)
    }
}

pub fn utc_to_paris(utc: NaiveDateTime) -> NaiveDateTime {
    utc + Duration::hours(paris_offset_hours(utc))
}

pub fn parse_naive(raw: &str) -> Option<NaiveDateTime> {
    let s = raw.trim();
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .map(|d| d.and_time(NaiveTime::MIN))
}

/// Paris-local client input to a UTC database string. Unparseable input
/// becomes the current UTC time.
pub fn normalize_client_datetime(raw: &str) -> String {
    match parse_naive(raw) {
        Some(local) => paris_to_utc(local).format(DB_FORMAT).to_string(),
        None => now_utc_string(),
    }
}

pub fn now_utc_string() -> String {
    Utc::now().naive_utc().format(DB_FORMAT).to_string()
}

/// Date part of a stored `YYYY-MM-DD...` string.
pub fn date_part(stored: &str) -> Option<NaiveDate> {
    stored.get(..10).and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
}

/// Add whole months, clamping the day to the end of the target month.
/// `None` when the result falls outside the supported calendar.
pub fn checked_add_months(date: NaiveDate, months: i64) -> Option<NaiveDate> {
    let total = i64::from(date.year())
        .checked_mul(12)?
        .checked_add(i64::from(date.month0()))?
        .checked_add(months)?;
    let year = i32::try_from(total.div_euclid(12)).ok()?;
    let month = total.rem_euclid(12) as u32 + 1;
    (28..=date.day().max(28))
        .rev()
        .find_map(|day| NaiveDate::from_ymd_opt(year, month, day.min(date.day())))
}

/// [`checked_add_months`] for small offsets; out of range keeps `date`.
pub fn add_months(date: NaiveDate, months: i32) -> NaiveDate {
    checked_add_months(date, i64::from(months)).unwrap_or(date)
}

/// Midnight of `date` in the storage format.
pub fn midnight(date: NaiveDate) -> String {
    date.and_time(NaiveTime::MIN).format(DB_FORMAT).to_string()
}
