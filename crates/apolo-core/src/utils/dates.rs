//! Time parsing helpers
//!
//! Request timestamps, balance expiry keywords and duration strings are
//! parsed here. Everything is normalised to `DateTime<Utc>`; the configured
//! timezone only matters for timestamps that carry no offset.

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, Local, Months, NaiveDate, NaiveDateTime,
    TimeZone, Utc,
};

use crate::constants::ZERO_RATING_SUBJECT_PREFIX;
use crate::error::AppError;
use crate::AppResult;

const NAIVE_LAYOUTS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y%m%d%H%M%S",
];

/// Parse a request timestamp
///
/// Accepted forms: RFC3339, `YYYY-MM-DD HH:MM:SS` (interpreted in `tz`),
/// `YYYYMMDDHHMMSS`, `YYYY-MM-DD`, unix seconds, `*now` and `+<duration>`.
///
/// # Arguments
/// * `s` - The timestamp text
/// * `tz` - `UTC`, `Local` or a fixed offset such as `+02:00`
pub fn parse_time(s: &str, tz: &str) -> AppResult<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return Err(AppError::Parser("empty time".to_string()));
    }
    if s == "*now" {
        return Ok(Utc::now());
    }
    if let Some(offset) = s.strip_prefix('+') {
        return Ok(Utc::now() + parse_duration(offset)?);
    }
    if s.bytes().all(|b| b.is_ascii_digit()) && s.len() != 14 {
        let secs: i64 = s
            .parse()
            .map_err(|_| AppError::Parser(format!("invalid unix time: {}", s)))?;
        return Utc
            .timestamp_opt(secs, 0)
            .single()
            .ok_or_else(|| AppError::Parser(format!("unix time out of range: {}", s)));
    }
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    for layout in NAIVE_LAYOUTS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, layout) {
            return localize(naive, tz);
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return localize(naive, tz);
        }
    }
    Err(AppError::Parser(format!("unsupported time format: {}", s)))
}

/// Interpret a naive timestamp in the configured timezone
pub fn localize(naive: NaiveDateTime, tz: &str) -> AppResult<DateTime<Utc>> {
    match tz.trim() {
        "" | "UTC" | "utc" | "Z" => Ok(Utc.from_utc_datetime(&naive)),
        "Local" | "local" => Local
            .from_local_datetime(&naive)
            .earliest()
            .map(|t| t.with_timezone(&Utc))
            .ok_or_else(|| AppError::Parser(format!("nonexistent local time: {}", naive))),
        offset => {
            let fixed = parse_offset(offset)?;
            fixed
                .from_local_datetime(&naive)
                .single()
                .map(|t| t.with_timezone(&Utc))
                .ok_or_else(|| AppError::Parser(format!("invalid time: {}", naive)))
        }
    }
}

fn parse_offset(s: &str) -> AppResult<FixedOffset> {
    let (sign, rest) = match s.as_bytes().first() {
        Some(b'+') => (1, &s[1..]),
        Some(b'-') => (-1, &s[1..]),
        _ => return Err(AppError::Parser(format!("unsupported timezone: {}", s))),
    };
    let (h, m) = rest.split_once(':').unwrap_or((rest, "0"));
    let hours: i32 = h
        .parse()
        .map_err(|_| AppError::Parser(format!("invalid offset: {}", s)))?;
    let minutes: i32 = m
        .parse()
        .map_err(|_| AppError::Parser(format!("invalid offset: {}", s)))?;
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .ok_or_else(|| AppError::Parser(format!("offset out of range: {}", s)))
}

/// Parse a balance expiry expression
///
/// Returns `None` for unlimited balances (`""` or `*unlimited`).
pub fn parse_date(s: &str) -> AppResult<Option<DateTime<Utc>>> {
    parse_date_at(s, Utc::now())
}

/// Same as [`parse_date`] relative to an explicit `now`
pub fn parse_date_at(s: &str, now: DateTime<Utc>) -> AppResult<Option<DateTime<Utc>>> {
    let s = s.trim();
    let expiry = match s {
        "" | "*unlimited" => return Ok(None),
        "*daily" => now + Duration::days(1),
        "*weekly" => now + Duration::days(7),
        "*monthly" => add_months(now, 1)?,
        "*yearly" => add_months(now, 12)?,
        "*month_end" => end_of_month(now)?,
        _ => {
            if let Some(offset) = s.strip_prefix('+') {
                now + parse_duration(offset)?
            } else {
                parse_time(s, "UTC")?
            }
        }
    };
    Ok(Some(expiry))
}

fn add_months(t: DateTime<Utc>, months: u32) -> AppResult<DateTime<Utc>> {
    t.checked_add_months(Months::new(months))
        .ok_or_else(|| AppError::Parser(format!("date overflow adding {} months", months)))
}

/// Last second of the month containing `t`
pub fn end_of_month(t: DateTime<Utc>) -> AppResult<DateTime<Utc>> {
    let last_day = days_in_month(t.year(), t.month());
    NaiveDate::from_ymd_opt(t.year(), t.month(), last_day)
        .and_then(|d| d.and_hms_opt(23, 59, 59))
        .map(|naive| Utc.from_utc_datetime(&naive))
        .ok_or_else(|| AppError::Parser(format!("invalid month end for {}", t)))
}

/// Parse a duration such as `1m30s`, `250ms`, `1.5h` or a bare number of seconds
pub fn parse_duration(s: &str) -> AppResult<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(Duration::zero());
    }
    let (negative, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    if let Ok(secs) = body.parse::<rust_decimal::Decimal>() {
        let d = super::decimal::secs_to_duration(secs);
        return Ok(if negative { -d } else { d });
    }

    let mut total = Duration::zero();
    let mut rest = body;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| AppError::Parser(format!("missing unit in duration: {}", s)))?;
        if num_len == 0 {
            return Err(AppError::Parser(format!("invalid duration: {}", s)));
        }
        let value: rust_decimal::Decimal = rest[..num_len]
            .parse()
            .map_err(|_| AppError::Parser(format!("invalid duration: {}", s)))?;
        rest = &rest[num_len..];
        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let secs_per_unit = match &rest[..unit_len] {
            "h" => rust_decimal::Decimal::from(3600),
            "m" => rust_decimal::Decimal::from(60),
            "s" => rust_decimal::Decimal::ONE,
            "ms" => rust_decimal::Decimal::new(1, 3),
            "us" | "µs" => rust_decimal::Decimal::new(1, 6),
            "ns" => rust_decimal::Decimal::new(1, 9),
            unit => {
                return Err(AppError::Parser(format!(
                    "unknown unit {:?} in duration: {}",
                    unit, s
                )))
            }
        };
        total = total + super::decimal::secs_to_duration(value * secs_per_unit);
        rest = &rest[unit_len..];
    }
    Ok(if negative { -total } else { total })
}

/// Duration granted per unit by a `*zero<duration>` rating subject
///
/// # Example
///
/// ```
/// use apolo_core::utils::dates::parse_zero_rating_subject;
/// use chrono::Duration;
///
/// assert_eq!(parse_zero_rating_subject("*zero1s").unwrap(), Duration::seconds(1));
/// assert!(parse_zero_rating_subject("*zero").is_err());
/// ```
pub fn parse_zero_rating_subject(subject: &str) -> AppResult<Duration> {
    let spec = subject
        .trim()
        .strip_prefix(ZERO_RATING_SUBJECT_PREFIX)
        .ok_or_else(|| AppError::Parser(format!("malformed rating subject: {}", subject)))?;
    if spec.is_empty() {
        return Err(AppError::Parser(format!(
            "malformed rating subject: {}",
            subject
        )));
    }
    let d = parse_duration(spec)?;
    if d <= Duration::zero() {
        return Err(AppError::Parser(format!(
            "non-positive zero rating period: {}",
            subject
        )));
    }
    Ok(d)
}

/// True when `subject` denotes zero-cost units
pub fn is_zero_rating_subject(subject: &str) -> bool {
    subject.starts_with(ZERO_RATING_SUBJECT_PREFIX)
}

/// Number of days in the given month
pub fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month >= 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    match (
        NaiveDate::from_ymd_opt(year, month, 1),
        NaiveDate::from_ymd_opt(next_year, next_month, 1),
    ) {
        (Some(first), Some(next)) => (next - first).num_days() as u32,
        _ => 30,
    }
}

/// Number of days in the given year
pub fn days_in_year(year: i32) -> u32 {
    if NaiveDate::from_ymd_opt(year, 2, 29).is_some() {
        366
    } else {
        365
    }
}

/// Serde helpers storing `chrono::Duration` as integer nanoseconds
pub mod duration_serde {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(d.num_nanoseconds().unwrap_or(i64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let nanos = i64::deserialize(deserializer)?;
        Ok(Duration::nanoseconds(nanos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_time_layouts() {
        let expected = Utc.with_ymd_and_hms(2013, 10, 21, 18, 34, 0).unwrap();
        assert_eq!(parse_time("2013-10-21T18:34:00Z", "UTC").unwrap(), expected);
        assert_eq!(parse_time("2013-10-21 18:34:00", "UTC").unwrap(), expected);
        assert_eq!(parse_time("20131021183400", "UTC").unwrap(), expected);
        assert_eq!(parse_time("1382380440", "UTC").unwrap(), expected);
        assert_eq!(
            parse_time("2013-10-21 20:34:00", "+02:00").unwrap(),
            expected
        );
        assert!(parse_time("yesterday", "UTC").is_err());
    }

    #[test]
    fn test_parse_date_keywords() {
        let now = Utc.with_ymd_and_hms(2024, 1, 31, 10, 0, 0).unwrap();
        assert_eq!(parse_date_at("*unlimited", now).unwrap(), None);
        assert_eq!(parse_date_at("", now).unwrap(), None);
        assert_eq!(
            parse_date_at("*daily", now).unwrap(),
            Some(now + Duration::days(1))
        );
        assert_eq!(
            parse_date_at("*monthly", now).unwrap(),
            Some(Utc.with_ymd_and_hms(2024, 2, 29, 10, 0, 0).unwrap())
        );
        assert_eq!(
            parse_date_at("*month_end", now).unwrap(),
            Some(Utc.with_ymd_and_hms(2024, 1, 31, 23, 59, 59).unwrap())
        );
        assert_eq!(
            parse_date_at("+1h", now).unwrap(),
            Some(now + Duration::hours(1))
        );
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::seconds(90));
        assert_eq!(parse_duration("10").unwrap(), Duration::seconds(10));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::milliseconds(250));
        assert_eq!(parse_duration("1.5h").unwrap(), Duration::minutes(90));
        assert_eq!(parse_duration("-2s").unwrap(), Duration::seconds(-2));
        assert_eq!(parse_duration("").unwrap(), Duration::zero());
        assert!(parse_duration("5x").is_err());
    }

    #[test]
    fn test_zero_rating_subject() {
        assert_eq!(
            parse_zero_rating_subject("*zero60s").unwrap(),
            Duration::seconds(60)
        );
        assert!(parse_zero_rating_subject("*zero").is_err());
        assert!(parse_zero_rating_subject("premium").is_err());
        assert!(is_zero_rating_subject("*zero1s"));
    }

    #[test]
    fn test_days_in() {
        assert_eq!(days_in_month(2024, 2), 29);
        assert_eq!(days_in_month(2023, 2), 28);
        assert_eq!(days_in_month(2023, 12), 31);
        assert_eq!(days_in_year(2024), 366);
        assert_eq!(days_in_year(2023), 365);
    }
}
