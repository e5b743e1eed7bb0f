//! Go `time.Duration` values.
//!
//! On the tenant topic a duration is a JSON integer count of nanoseconds, which is how Go's
//! `encoding/json` writes a `time.Duration`. Go-formatted strings (e.g. `48h0m0s`) are accepted
//! on input as well, since they are what operators write by hand.

use std::{fmt::Write, time::Duration};

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum ParseError {
    #[error("invalid unit: {}", EXPECTED_UNITS)]
    InvalidUnit,

    #[error("missing a unit: {}", EXPECTED_UNITS)]
    NoUnit,

    #[error("durations must not be negative")]
    Negative,

    #[error("duration is too large")]
    Overflow,

    #[error("invalid floating-point number: {}", .0)]
    NotANumber(#[from] std::num::ParseFloatError),
}

/// The longest duration Go can represent: `i64::MAX` nanoseconds, roughly 292 years.
pub const MAX: Duration = Duration::from_nanos(i64::MAX as u64);

const EXPECTED_UNITS: &str = "expected one of 'ns', 'us', '\u{00b5}s', 'ms', 's', 'm', or 'h'";

pub fn parse(mut s: &str) -> Result<Duration, ParseError> {
    fn from_units(val: f64, unit: &str) -> Result<Duration, ParseError> {
        const MINUTE: Duration = Duration::from_secs(60);
        let base = match unit {
            "ns" => Duration::from_nanos(1),
            // U+00B5 is the "micro sign" while U+03BC is "Greek letter mu"
            "us" | "\u{00b5}s" | "\u{03bc}s" => Duration::from_micros(1),
            "ms" => Duration::from_millis(1),
            "s" => Duration::from_secs(1),
            "m" => MINUTE,
            "h" => MINUTE * 60,
            _ => return Err(ParseError::InvalidUnit),
        };
        Duration::try_from_secs_f64(base.as_secs_f64() * val).map_err(|_| ParseError::Overflow)
    }

    if s.starts_with('-') && s.trim_start_matches('-') != "0" {
        return Err(ParseError::Negative);
    }
    s = s.trim_start_matches('+').trim_start_matches('-');
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    while !s.is_empty() {
        let unit_start = s
            .find(|c: char| c.is_alphabetic())
            .ok_or(ParseError::NoUnit)?;
        let (val, rest) = s.split_at(unit_start);
        let val = val.parse::<f64>()?;
        let unit = match rest.find(|c: char| !c.is_alphabetic()) {
            Some(end) => {
                let (unit, rest) = rest.split_at(end);
                s = rest;
                unit
            }
            None => {
                s = "";
                rest
            }
        };
        total = total
            .checked_add(from_units(val, unit)?)
            .filter(|total| *total <= MAX)
            .ok_or(ParseError::Overflow)?;
    }
    Ok(total)
}

/// Formats a duration the way Go's `time.Duration.String` does.
pub fn format(d: Duration) -> String {
    if d.is_zero() {
        return "0s".to_string();
    }

    let nanos = d.as_nanos();
    if nanos < 1_000 {
        return format!("{nanos}ns");
    }
    if nanos < 1_000_000 {
        return format!("{}\u{00b5}s", decimal(nanos, 1_000, 3));
    }
    if nanos < 1_000_000_000 {
        return format!("{}ms", decimal(nanos, 1_000_000, 6));
    }

    let secs = d.as_secs();
    let (hours, minutes) = (secs / 3600, (secs / 60) % 60);
    let mut out = String::new();
    if hours > 0 {
        let _ = write!(out, "{hours}h");
    }
    if hours > 0 || minutes > 0 {
        let _ = write!(out, "{minutes}m");
    }
    let secs_nanos = u128::from(secs % 60) * 1_000_000_000 + u128::from(d.subsec_nanos());
    let _ = write!(out, "{}s", decimal(secs_nanos, 1_000_000_000, 9));
    out
}

fn decimal(value: u128, unit: u128, width: usize) -> String {
    let (whole, frac) = (value / unit, value % unit);
    if frac == 0 {
        return whole.to_string();
    }
    let frac = format!("{frac:0width$}");
    format!("{whole}.{}", frac.trim_end_matches('0'))
}

/// Serde adapter for `Duration` fields encoded as Go `time.Duration`s.
///
/// Durations are written as integer nanoseconds. Either integers or Go duration strings are read.
pub mod go {
    use super::{ParseError, MAX};
    use serde::{de, ser, Deserializer, Serializer};
    use std::{fmt, time::Duration};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let nanos = i64::try_from(d.as_nanos())
            .map_err(|_| <S::Error as ser::Error>::custom(ParseError::Overflow))?;
        serializer.serialize_i64(nanos)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        deserializer.deserialize_any(GoDuration)
    }

    struct GoDuration;

    impl de::Visitor<'_> for GoDuration {
        type Value = Duration;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a number of nanoseconds or a Go duration string")
        }

        fn visit_i64<E: de::Error>(self, nanos: i64) -> Result<Duration, E> {
            u64::try_from(nanos)
                .map(Duration::from_nanos)
                .map_err(|_| E::custom(ParseError::Negative))
        }

        fn visit_u64<E: de::Error>(self, nanos: u64) -> Result<Duration, E> {
            let d = Duration::from_nanos(nanos);
            if d > MAX {
                return Err(E::custom(ParseError::Overflow));
            }
            Ok(d)
        }

        fn visit_str<E: de::Error>(self, s: &str) -> Result<Duration, E> {
            super::parse(s).map_err(E::custom)
        }
    }
}
