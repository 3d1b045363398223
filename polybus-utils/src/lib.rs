//! Helpers shared by the polybus crates
//!
//! - human-readable durations for configuration files ("10ms", "1m30s")
//! - wall-clock millisecond timestamps carried by messages
//! - [`Counter`], the gauge behind the runtime statistics
//!
//! ```rust
//! use polybus_utils::{format_timestamp_millis, timestamp_millis, to_duration};
//!
//! assert_eq!(to_duration("1m30s").as_secs(), 90);
//! assert_eq!(to_duration("250ms").as_millis(), 250);
//! assert!(!format_timestamp_millis(timestamp_millis()).is_empty());
//! ```

#![deny(unsafe_code)]

use std::time::Duration;

use chrono::{Local, LocalResult, TimeZone, Utc};
use serde::{de, Deserialize, Deserializer};

mod counter;

pub use counter::{Counter, CounterSnapshot};

/// Milliseconds since the Unix epoch
pub type TimestampMillis = i64;

/// Serde `deserialize_with` helper for human-readable durations.
///
/// Text that does not parse to a non-zero duration is rejected, unless it is
/// an explicit zero such as `"0"` or `"0s"`.
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    match parse_duration(&text) {
        Some(d) => Ok(d),
        None => Err(de::Error::custom(format!("invalid duration, {text:?}"))),
    }
}

/// Lenient conversion, text that does not parse yields a zero duration.
///
/// Units: `ms`, `s`, `m`, `h`, `d`, `w`; a bare number means seconds.
///
/// ```
/// use polybus_utils::to_duration;
///
/// assert_eq!(to_duration("1h30m15s").as_secs(), 5415);
/// assert_eq!(to_duration("1s500ms").as_millis(), 1500);
/// assert_eq!(to_duration("3").as_secs(), 3);
/// assert!(to_duration("soon").is_zero());
/// ```
#[inline]
pub fn to_duration(text: &str) -> Duration {
    parse_duration(text).unwrap_or_default()
}

fn parse_duration(text: &str) -> Option<Duration> {
    let text = text.trim().to_ascii_lowercase();
    if text.is_empty() {
        return None;
    }
    if let Ok(secs) = text.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let mut total_ms: u64 = 0;
    let mut rest = text.as_str();
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return None;
        }
        let value: u64 = rest[..digits].parse().ok()?;
        rest = rest[digits..].trim_start();

        let unit_len = rest.find(|c: char| !c.is_ascii_alphabetic()).unwrap_or(rest.len());
        let factor = match &rest[..unit_len] {
            "ms" => 1,
            "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            "d" => 86_400_000,
            "w" => 604_800_000,
            _ => return None,
        };
        total_ms = total_ms.checked_add(value.checked_mul(factor)?)?;
        rest = rest[unit_len..].trim_start();
    }
    Some(Duration::from_millis(total_ms))
}

#[inline]
pub fn timestamp_millis() -> TimestampMillis {
    Utc::now().timestamp_millis()
}

/// Local time rendering of a millisecond timestamp, empty for non-positive input
#[inline]
pub fn format_timestamp_millis(t: TimestampMillis) -> String {
    if t <= 0 {
        return String::new();
    }
    match Local.timestamp_millis_opt(t) {
        LocalResult::Single(t) => t.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        _ => String::new(),
    }
}
