//! Clock helpers and the lenient date/time normalizers used when values are
//! written to typed columns.

use chrono::{Datelike, Duration, Utc};

const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// `YYYY-MM-DD HH:MM:SS`, shifted by `offset` seconds.
pub fn current_datetime(offset: i64) -> String {
    (Utc::now() + Duration::seconds(offset))
        .format(DATETIME_FORMAT)
        .to_string()
}

/// `HH:MM:SS` of the current time.
pub fn current_time() -> String {
    Utc::now().format("%H:%M:%S").to_string()
}

/// Day of week with 1 = Sunday and 7 = Saturday.
pub fn current_dow() -> u32 {
    Utc::now().weekday().num_days_from_sunday() + 1
}

/// Timestamp with four decimals, used as the log line prefix.
pub fn current_datetime_decimals() -> String {
    let now = Utc::now();
    format!(
        "{}.{:04}",
        now.format(DATETIME_FORMAT),
        now.timestamp_subsec_micros() / 100
    )
}

/// Shift a `YYYY-MM-DD HH:MM:SS` string by `seconds`; `None` if it does not parse.
pub fn add_seconds(datetime: &str, seconds: i64) -> Option<String> {
    let parsed = chrono::NaiveDateTime::parse_from_str(datetime, DATETIME_FORMAT).ok()?;
    Some((parsed + Duration::seconds(seconds)).format(DATETIME_FORMAT).to_string())
}

fn leading_int(s: &str) -> i64 {
    let s = s.trim();
    let (sign, digits) = match s.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, s.strip_prefix('+').unwrap_or(s)),
    };
    let digits: String = digits.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse::<i64>().map(|n| sign * n).unwrap_or(0)
}

fn split_parts(value: &str, count: usize) -> Vec<i64> {
    let normalized: String = value
        .chars()
        .map(|c| if matches!(c, '-' | ':' | ',' | '.' | '/') { ' ' } else { c })
        .collect();
    let mut parts: Vec<i64> = normalized.split_whitespace().map(leading_int).collect();
    parts.resize(count.max(parts.len()), 0);
    parts
}

fn days_of_month(year: i64, month: i64) -> i64 {
    match month {
        4 | 6 | 9 | 11 => 30,
        2 => {
            let leap = (year % 4 == 0 && year % 100 != 0) || year % 400 == 0;
            if leap { 29 } else { 28 }
        }
        _ => 31,
    }
}

/// Year, month and day from either `Y-M-D` or `D-M-Y` ordered parts.
fn ymd(parts: &[i64]) -> (i64, i64, i64) {
    if parts[2] > 1900 {
        let year = parts[2].clamp(0, 9999);
        let month = parts[1].clamp(0, 12);
        let day = parts[0].clamp(0, days_of_month(year, month));
        (year, month, day)
    } else {
        let year = parts[0].clamp(0, 9999);
        let month = parts[1].clamp(0, 12);
        let day = parts[2].clamp(0, days_of_month(year, month));
        (year, month, day)
    }
}

/// Normalize to `YYYY-MM-DD`, clamping out-of-range parts.
pub fn dateval(value: &str) -> String {
    let parts = split_parts(value, 3);
    let (year, month, day) = ymd(&parts);
    format!("{:04}-{:02}-{:02}", year, month, day)
}

/// Normalize to `HH:MM:SS`, clamping out-of-range parts.
pub fn timeval(value: &str) -> String {
    let parts = split_parts(value, 3);
    format!(
        "{:02}:{:02}:{:02}",
        parts[0].clamp(0, 23),
        parts[1].clamp(0, 59),
        parts[2].clamp(0, 59)
    )
}

/// Normalize to `YYYY-MM-DD HH:MM:SS`, clamping out-of-range parts.
pub fn datetimeval(value: &str) -> String {
    let parts = split_parts(value, 6);
    let (year, month, day) = ymd(&parts);
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        year,
        month,
        day,
        parts[3].clamp(0, 23),
        parts[4].clamp(0, 59),
        parts[5].clamp(0, 59)
    )
}
