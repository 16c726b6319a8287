//! Duration strings used by `resumeAfter` steps.
//!
//! Accepted form is `<amount> <unit>`, the space being optional:
//! `"10 minutes"`, `"500ms"`, `"1 day"`, `"2.5 hours"`.

use std::time::Duration;

use crate::error::{Error, Result};

/// Parse a human duration string.
///
/// ```
/// use std::time::Duration;
/// use flowstate::duration::parse_duration;
///
/// assert_eq!(parse_duration("10 minutes").unwrap(), Duration::from_secs(600));
/// assert!(parse_duration("ten minutes").is_err());
/// ```
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (amount, unit) = s.split_at(split);

    let amount: f64 = amount
        .parse()
        .map_err(|_| Error::InvalidDuration(input.to_string()))?;
    if !amount.is_finite() || amount < 0.0 {
        return Err(Error::InvalidDuration(input.to_string()));
    }

    let millis_per_unit = match unit.trim().to_ascii_lowercase().as_str() {
        "ms" | "millisecond" | "milliseconds" => 1.0,
        "s" | "sec" | "secs" | "second" | "seconds" => 1_000.0,
        "m" | "min" | "mins" | "minute" | "minutes" => 60_000.0,
        "h" | "hr" | "hrs" | "hour" | "hours" => 3_600_000.0,
        "d" | "day" | "days" => 86_400_000.0,
        "w" | "week" | "weeks" => 604_800_000.0,
        _ => return Err(Error::InvalidDuration(input.to_string())),
    };

    Ok(Duration::from_millis((amount * millis_per_unit).round() as u64))
}
