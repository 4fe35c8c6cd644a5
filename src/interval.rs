//! Time-interval parsing
//!
//! Descriptions carry intervals as `<number><unit>` strings with units
//! `us`, `ms`, `s`, `m` (minutes). A bare number is seconds. Units are
//! matched longest-suffix first so `250ms` is never read as seconds.
//! Daemons receive intervals as integer microseconds.
//!
//! The sample-scheduling form `"<interval>:<offset>"` is not parsed here;
//! it is handed to daemons verbatim.

use thiserror::Error;

/// Errors from interval parsing
#[derive(Error, Debug, PartialEq)]
pub enum IntervalError {
    #[error("invalid interval '{0}'")]
    InvalidInterval(String),
}

/// Microseconds per unit, longest suffix first.
const UNITS: &[(&str, f64)] = &[
    ("us", 1.0),
    ("ms", 1_000.0),
    ("s", 1_000_000.0),
    ("m", 60_000_000.0),
];

/// Parse an interval string into integer microseconds.
pub fn parse_interval(s: &str) -> Result<u64, IntervalError> {
    let trimmed = s.trim();
    let lower = trimmed.to_ascii_lowercase();

    for (suffix, factor) in UNITS {
        if let Some(number) = lower.strip_suffix(suffix) {
            let value: f64 = number
                .trim()
                .parse()
                .map_err(|_| IntervalError::InvalidInterval(s.to_string()))?;
            return Ok((value * factor) as u64);
        }
    }

    // Unitless: seconds
    let value: f64 = lower
        .parse()
        .map_err(|_| IntervalError::InvalidInterval(s.to_string()))?;
    Ok((value * 1_000_000.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seconds_with_fraction() {
        assert_eq!(parse_interval("1.5s").unwrap(), 1_500_000);
    }

    #[test]
    fn test_milliseconds() {
        assert_eq!(parse_interval("250ms").unwrap(), 250_000);
    }

    #[test]
    fn test_microseconds() {
        assert_eq!(parse_interval("400us").unwrap(), 400);
    }

    #[test]
    fn test_minutes() {
        assert_eq!(parse_interval("2m").unwrap(), 120_000_000);
    }

    #[test]
    fn test_unitless_is_seconds() {
        assert_eq!(parse_interval("2").unwrap(), 2_000_000);
    }

    #[test]
    fn test_case_insensitive() {
        assert_eq!(parse_interval("100MS").unwrap(), 100_000);
        assert_eq!(parse_interval("1S").unwrap(), 1_000_000);
    }

    #[test]
    fn test_longest_suffix_wins() {
        // "5ms" must parse as milliseconds even though it also ends in "s"
        assert_eq!(parse_interval("5ms").unwrap(), 5_000);
        assert_eq!(parse_interval("5us").unwrap(), 5);
    }

    #[test]
    fn test_invalid() {
        assert_eq!(
            parse_interval("bad"),
            Err(IntervalError::InvalidInterval("bad".to_string()))
        );
        assert!(parse_interval("ms").is_err());
        assert!(parse_interval("").is_err());
    }
}
