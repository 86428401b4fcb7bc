use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};

/// ISO-8601 UTC with a `Z` suffix, second precision. Every timestamp the
/// control plane persists goes through this.
pub fn format_utc(when: DateTime<Utc>) -> String {
    when.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

pub fn parse_utc(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|when| when.with_timezone(&Utc))
        .with_context(|| format!("invalid timestamp {value:?}"))
}

/// Age of `then` as seen from `now`; negative clock skew clamps to zero.
pub fn age(now: DateTime<Utc>, then: DateTime<Utc>) -> Duration {
    (now - then).max(Duration::zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn formats_with_z_suffix() {
        let when = Utc.with_ymd_and_hms(2025, 1, 15, 6, 0, 0).unwrap();
        assert_eq!(format_utc(when), "2025-01-15T06:00:00Z");
    }

    #[test]
    fn parse_round_trips() {
        let when = Utc.with_ymd_and_hms(2025, 1, 15, 6, 0, 0).unwrap();
        assert_eq!(parse_utc(&format_utc(when)).unwrap(), when);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_utc("PENDING_INITIALIZATION").is_err());
        assert!(parse_utc("").is_err());
    }

    #[test]
    fn age_clamps_future_timestamps() {
        let now = Utc.with_ymd_and_hms(2025, 1, 15, 6, 0, 0).unwrap();
        let future = now + Duration::hours(1);
        assert_eq!(age(now, future), Duration::zero());
        assert_eq!(age(now, now - Duration::hours(22)), Duration::hours(22));
    }
}
