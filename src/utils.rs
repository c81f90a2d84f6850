use chrono::{
    DateTime, Duration, FixedOffset, Local, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Utc,
};

/// Timezone the exchange hours are bucketed in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Zone {
    /// Whatever the process considers local time.
    Local,
    Named(chrono_tz::Tz),
}

impl Zone {
    pub fn now(&self) -> DateTime<FixedOffset> {
        match self {
            Zone::Local => Local::now().fixed_offset(),
            Zone::Named(tz) => Utc::now().with_timezone(tz).fixed_offset(),
        }
    }

    /// Wall-clock `hour:00:00` of `date` in this zone.
    pub fn at_hour(&self, date: NaiveDate, hour: u32) -> Option<DateTime<FixedOffset>> {
        let naive = date.and_hms_opt(hour, 0, 0)?;
        match self {
            Zone::Local => resolve_local(&Local, naive),
            Zone::Named(tz) => resolve_local(tz, naive),
        }
    }
}

fn resolve_local<T: TimeZone>(tz: &T, naive: NaiveDateTime) -> Option<DateTime<FixedOffset>> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt.fixed_offset()),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.fixed_offset()),
        LocalResult::None => {
            // DST gap: keep the wall clock with the offset in effect before the jump
            let before = tz
                .from_local_datetime(&(naive - Duration::hours(1)))
                .earliest()?
                .fixed_offset();
            before.offset().from_local_datetime(&naive).single()
        }
    }
}

/// Parse timezone string and validate
pub fn parse_timezone(tz_str: &str) -> Result<Zone, String> {
    tz_str
        .parse::<chrono_tz::Tz>()
        .map(Zone::Named)
        .map_err(|_| format!("Invalid timezone: {}", tz_str))
}

/// Round to specified decimal places
pub fn round_to_decimals(value: f64, decimals: u32) -> f64 {
    let multiplier = 10_f64.powi(decimals as i32);
    (value * multiplier).round() / multiplier
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_parse_timezone() {
        assert_eq!(
            parse_timezone("Europe/Warsaw"),
            Ok(Zone::Named(chrono_tz::Europe::Warsaw))
        );
        assert!(parse_timezone("Mars/Olympus").is_err());
    }

    #[test]
    fn test_at_hour_uses_zone_offset() {
        let zone = Zone::Named(chrono_tz::Europe::Warsaw);
        let summer = zone
            .at_hour(NaiveDate::from_ymd_opt(2025, 8, 8).unwrap(), 8)
            .unwrap();
        assert_eq!(summer.to_rfc3339(), "2025-08-08T08:00:00+02:00");

        let winter = zone
            .at_hour(NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(), 23)
            .unwrap();
        assert_eq!(winter.to_rfc3339(), "2025-01-15T23:00:00+01:00");
    }

    #[test]
    fn test_at_hour_inside_dst_gap() {
        // 2025-03-30 02:00 does not exist in Warsaw
        let zone = Zone::Named(chrono_tz::Europe::Warsaw);
        let dt = zone
            .at_hour(NaiveDate::from_ymd_opt(2025, 3, 30).unwrap(), 2)
            .unwrap();
        assert_eq!(dt.hour(), 2);
        assert_eq!(dt.offset().local_minus_utc(), 3600);
    }

    #[test]
    fn test_at_hour_rejects_invalid_hour() {
        let zone = Zone::Named(chrono_tz::UTC);
        assert!(zone
            .at_hour(NaiveDate::from_ymd_opt(2025, 8, 8).unwrap(), 24)
            .is_none());
    }

    #[test]
    fn test_round_to_decimals() {
        assert_eq!(round_to_decimals(12.3456, 3), 12.346);
        assert_eq!(round_to_decimals(0.123449, 5), 0.12345);
    }
}
