//! Throttle and period strings: `<integer><unit>` with unit one of `ms`, `s`, `m`, `h`, `d`
//!
//! Units are case-insensitive and may carry a trailing plural `s` (`2hs`, `10mss`).

use std::time::Duration;

use crate::error::DurationParseError;

const MILLIS_PER_UNIT: [(&str, u64); 5] = [
    ("ms", 1),
    ("s", 1_000),
    ("m", 60_000),
    ("h", 3_600_000),
    ("d", 86_400_000),
];

/// Parse a duration string such as `"500ms"`, `"5s"` or `"30m"`
pub fn parse_duration(input: &str) -> Result<Duration, DurationParseError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(DurationParseError::Empty);
    }

    let digits_end = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    if digits_end == 0 {
        return Err(DurationParseError::MissingNumber(input.to_string()));
    }

    let amount: u64 = trimmed[..digits_end]
        .parse()
        .map_err(|_| DurationParseError::Overflow(input.to_string()))?;

    let unit = trimmed[digits_end..].trim().to_ascii_lowercase();
    let millis_per_unit = unit_millis(&unit).ok_or_else(|| DurationParseError::UnknownUnit {
        input: input.to_string(),
        unit: unit.clone(),
    })?;

    amount
        .checked_mul(millis_per_unit)
        .map(Duration::from_millis)
        .ok_or_else(|| DurationParseError::Overflow(input.to_string()))
}

fn unit_millis(unit: &str) -> Option<u64> {
    let lookup = |u: &str| {
        MILLIS_PER_UNIT
            .iter()
            .find(|(name, _)| *name == u)
            .map(|(_, millis)| *millis)
    };

    lookup(unit).or_else(|| unit.strip_suffix('s').and_then(lookup))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_each_unit() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("30m").unwrap(), Duration::from_secs(30 * 60));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(2 * 3600));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86_400));
    }

    #[test]
    fn test_parse_case_plural_and_whitespace() {
        assert_eq!(parse_duration("5S").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("250MS").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("2hs").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("3ds").unwrap(), Duration::from_secs(3 * 86_400));
        assert_eq!(parse_duration(" 10 s ").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("0s").unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert_eq!(
            parse_duration("abc"),
            Err(DurationParseError::MissingNumber("abc".to_string()))
        );
        assert!(matches!(
            parse_duration("5x"),
            Err(DurationParseError::UnknownUnit { ref unit, .. }) if unit == "x"
        ));
        assert!(matches!(
            parse_duration("5"),
            Err(DurationParseError::UnknownUnit { .. })
        ));
        assert_eq!(parse_duration(""), Err(DurationParseError::Empty));
        assert!(matches!(
            parse_duration("-5s"),
            Err(DurationParseError::MissingNumber(_))
        ));
        assert!(matches!(
            parse_duration("99999999999999999999d"),
            Err(DurationParseError::Overflow(_))
        ));
    }
}
