use std::time::Duration;

pub mod flags;

/// Split `s` into a float and the factor of its unit suffix.
///
/// `units` maps suffixes to factors; the first matching suffix wins, so
/// longer suffixes that share an ending with shorter ones (`ms` vs `s`) must
/// come first. A bare number uses `default_factor`.
pub fn parse_float_and_factor_from_str(
    s: &str,
    units: &[(&str, f64)],
    default_factor: f64,
) -> Option<(f64, f64)> {
    let s = s.trim();
    for &(suffix, factor) in units {
        if let Some(number) = s.strip_suffix(suffix) {
            let number = number.trim_end();
            if number.is_empty() {
                return None;
            }
            return number.parse::<f64>().ok().map(|value| (value, factor));
        }
    }

    s.parse::<f64>().ok().map(|value| (value, default_factor))
}

/// Unit suffixes with their factor in nanoseconds.
const DURATION_UNITS: &[(&str, f64)] = &[
    ("ns", 1.0),
    ("us", 1e3),
    ("ms", 1e6),
    ("s", 1e9),
    ("m", 60e9),
    ("h", 3600e9),
];

/// Parse durations like `100us`, `5ms`, `10s` or `10m`. A bare number is milliseconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let (value, factor) = parse_float_and_factor_from_str(s, DURATION_UNITS, 1e6)?;
    let nanos = (value * factor).round();
    if !nanos.is_finite() || nanos < 0.0 || nanos > u64::MAX as f64 {
        return None;
    }
    Some(Duration::from_nanos(nanos as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations() {
        assert_eq!(parse_duration("100us"), Some(Duration::from_micros(100)));
        assert_eq!(parse_duration("5ms"), Some(Duration::from_millis(5)));
        assert_eq!(parse_duration("10s"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("10m"), Some(Duration::from_secs(600)));
        assert_eq!(parse_duration("250"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("ms"), None);
        assert_eq!(parse_duration("-1s"), None);
        assert_eq!(parse_duration("fast"), None);
    }
}
