use chrono::{DateTime, Days, FixedOffset, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::prices::types::Field;
use crate::scheduler::PriceSnapshot;
use crate::utils::round_to_decimals;

pub const DEFAULT_NAME: &str = "TGE";
pub const VOLUME_UNIT: &str = "MWh";

const ATTRIBUTE_PRICES: &str = "prices";
const ATTRIBUTE_VOLUMES: &str = "volumes";
const ATTRIBUTE_TODAY_SUFFIX: &str = "_today";
const ATTRIBUTE_TOMORROW_SUFFIX: &str = "_tomorrow";

/// Unit rates are reported in. The exchange publishes zł/MWh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PriceUnit {
    #[default]
    #[serde(rename = "zł/MWh")]
    ZlPerMwh,
    #[serde(rename = "gr/kWh")]
    GrPerKwh,
    #[serde(rename = "zł/kWh")]
    ZlPerKwh,
}

impl PriceUnit {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "zł/MWh" | "zl/MWh" => Some(PriceUnit::ZlPerMwh),
            "gr/kWh" => Some(PriceUnit::GrPerKwh),
            "zł/kWh" | "zl/kWh" => Some(PriceUnit::ZlPerKwh),
            _ => None,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            PriceUnit::ZlPerMwh => "zł/MWh",
            PriceUnit::GrPerKwh => "gr/kWh",
            PriceUnit::ZlPerKwh => "zł/kWh",
        }
    }

    /// Convert a zł/MWh value into this unit.
    pub fn convert(&self, zl_per_mwh: f64) -> f64 {
        match self {
            PriceUnit::ZlPerMwh => zl_per_mwh,
            PriceUnit::GrPerKwh => round_to_decimals(zl_per_mwh / 10.0, 3),
            PriceUnit::ZlPerKwh => round_to_decimals(zl_per_mwh / 1000.0, 5),
        }
    }

    pub fn display_precision(&self) -> u32 {
        match self {
            PriceUnit::ZlPerMwh => 2,
            PriceUnit::GrPerKwh => 3,
            PriceUnit::ZlPerKwh => 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesPoint {
    pub time: DateTime<FixedOffset>,
    pub value: f64,
}

/// What a consumer sees for one of the four fields.
#[derive(Debug, Clone, Serialize)]
pub struct SensorReading {
    pub key: &'static str,
    pub name: String,
    pub unit: &'static str,
    pub display_precision: Option<u32>,
    pub enabled_by_default: bool,
    pub available: bool,
    /// Value for the current hour, if today's data has it.
    pub state: Option<f64>,
    pub attributes: BTreeMap<String, Vec<SeriesPoint>>,
}

fn sensor_name(field: Field) -> String {
    let label = match field {
        Field::Fixing1Rate => "Fixing 1 Rate",
        Field::Fixing1Volume => "Fixing 1 Volume",
        Field::Fixing2Rate => "Fixing 2 Rate",
        Field::Fixing2Volume => "Fixing 2 Volume",
    };
    format!("{} {}", DEFAULT_NAME, label)
}

fn attribute_name(field: Field) -> &'static str {
    if field.is_rate() {
        ATTRIBUTE_PRICES
    } else {
        ATTRIBUTE_VOLUMES
    }
}

/// Read one field from the snapshot as of `now`.
pub fn read_sensor(
    snapshot: &PriceSnapshot,
    field: Field,
    unit: PriceUnit,
    now: DateTime<FixedOffset>,
) -> SensorReading {
    let present = |value: f64| if field.is_rate() { unit.convert(value) } else { value };

    let today = now.date_naive();
    let tomorrow = today.checked_add_days(Days::new(1));

    let state = snapshot
        .derived
        .iter()
        .find(|r| r.date() == today && r.hour() == now.hour())
        .map(|r| present(field.get(r)));

    let series: Vec<SeriesPoint> = snapshot
        .derived
        .iter()
        .map(|r| SeriesPoint {
            time: r.time,
            value: present(field.get(r)),
        })
        .collect();
    let today_series = series
        .iter()
        .filter(|p| p.time.date_naive() == today)
        .cloned()
        .collect();
    let tomorrow_series = series
        .iter()
        .filter(|p| Some(p.time.date_naive()) == tomorrow)
        .cloned()
        .collect();

    let name = attribute_name(field);
    let mut attributes = BTreeMap::new();
    attributes.insert(format!("{}{}", name, ATTRIBUTE_TODAY_SUFFIX), today_series);
    attributes.insert(format!("{}{}", name, ATTRIBUTE_TOMORROW_SUFFIX), tomorrow_series);
    attributes.insert(name.to_string(), series);

    SensorReading {
        key: field.key(),
        name: sensor_name(field),
        unit: if field.is_rate() { unit.symbol() } else { VOLUME_UNIT },
        display_precision: field.is_rate().then(|| unit.display_precision()),
        enabled_by_default: field == Field::Fixing1Rate,
        available: snapshot.is_available(),
        state,
        attributes,
    }
}

pub fn read_all(
    snapshot: &PriceSnapshot,
    unit: PriceUnit,
    now: DateTime<FixedOffset>,
) -> Vec<SensorReading> {
    Field::ALL
        .iter()
        .map(|field| read_sensor(snapshot, *field, unit, now))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prices::store::PriceCache;
    use crate::prices::types::{DayDataset, HourRecord};
    use crate::template::TemplateSet;
    use crate::utils::Zone;
    use chrono::NaiveDate;

    fn zone() -> Zone {
        Zone::Named(chrono_tz::Europe::Warsaw)
    }

    fn at(rfc3339: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(rfc3339).unwrap()
    }

    fn day(y: i32, m: u32, d: u32, hours: std::ops::Range<u32>) -> DayDataset {
        let date = NaiveDate::from_ymd_opt(y, m, d).unwrap();
        let hours = hours
            .map(|h| HourRecord {
                time: zone().at_hour(date, h).unwrap(),
                fixing1_rate: 400.0 + h as f64,
                fixing1_volume: 1000.0 + h as f64,
                fixing2_rate: 123.45,
                fixing2_volume: 50.0,
            })
            .collect();
        DayDataset { date, hours }
    }

    fn snapshot() -> PriceSnapshot {
        let mut cache = PriceCache::new();
        cache.merge(day(2025, 8, 9, 0..24));
        cache.merge(day(2025, 8, 8, 0..24));
        PriceSnapshot::build(cache, &TemplateSet::default(), None, None)
    }

    #[test]
    fn test_unit_parse_and_convert() {
        assert_eq!(PriceUnit::parse("gr/kWh"), Some(PriceUnit::GrPerKwh));
        assert_eq!(PriceUnit::parse("zl/kWh"), Some(PriceUnit::ZlPerKwh));
        assert_eq!(PriceUnit::parse("EUR/MWh"), None);
        assert_eq!(PriceUnit::default(), PriceUnit::ZlPerMwh);

        assert_eq!(PriceUnit::ZlPerMwh.convert(123.45), 123.45);
        assert_eq!(PriceUnit::GrPerKwh.convert(123.45), 12.345);
        assert_eq!(PriceUnit::ZlPerKwh.convert(123.45), 0.12345);
    }

    #[test]
    fn test_current_hour_state() {
        let reading = read_sensor(
            &snapshot(),
            Field::Fixing1Rate,
            PriceUnit::ZlPerMwh,
            at("2025-08-08T13:45:00+02:00"),
        );
        assert_eq!(reading.state, Some(413.0));
        assert_eq!(reading.name, "TGE Fixing 1 Rate");
        assert_eq!(reading.unit, "zł/MWh");
        assert!(reading.enabled_by_default);
        assert!(reading.available);
    }

    #[test]
    fn test_missing_hour_is_absent() {
        let mut cache = PriceCache::new();
        cache.merge(day(2025, 8, 8, 0..12));
        let snapshot = PriceSnapshot::build(cache, &TemplateSet::default(), None, None);

        let reading = read_sensor(
            &snapshot,
            Field::Fixing2Rate,
            PriceUnit::ZlPerMwh,
            at("2025-08-08T15:00:00+02:00"),
        );
        assert_eq!(reading.state, None);
    }

    #[test]
    fn test_today_tomorrow_slices() {
        let reading = read_sensor(
            &snapshot(),
            Field::Fixing1Volume,
            PriceUnit::GrPerKwh,
            at("2025-08-08T10:00:00+02:00"),
        );

        let all = &reading.attributes["volumes"];
        let today = &reading.attributes["volumes_today"];
        let tomorrow = &reading.attributes["volumes_tomorrow"];
        assert_eq!(all.len(), 48);
        assert_eq!(today.len(), 24);
        assert_eq!(tomorrow.len(), 24);
        assert!(all.windows(2).all(|w| w[0].time < w[1].time));
        assert_eq!(today[0].time.to_rfc3339(), "2025-08-08T00:00:00+02:00");
        assert_eq!(tomorrow[0].time.to_rfc3339(), "2025-08-09T00:00:00+02:00");

        // volumes ignore the price unit
        assert_eq!(reading.unit, "MWh");
        assert_eq!(reading.state, Some(1010.0));
        assert_eq!(reading.display_precision, None);
        assert!(!reading.enabled_by_default);
    }

    #[test]
    fn test_rates_use_configured_unit() {
        let reading = read_sensor(
            &snapshot(),
            Field::Fixing2Rate,
            PriceUnit::GrPerKwh,
            at("2025-08-09T00:30:00+02:00"),
        );
        assert_eq!(reading.unit, "gr/kWh");
        assert_eq!(reading.display_precision, Some(3));
        assert_eq!(reading.state, Some(12.345));
        assert!(reading.attributes["prices"].iter().all(|p| p.value == 12.345));
        // on the 9th the 8th is neither today nor tomorrow
        assert_eq!(reading.attributes["prices_today"].len(), 24);
        assert!(reading.attributes["prices_tomorrow"].is_empty());
    }

    #[test]
    fn test_read_all_without_data() {
        let readings = read_all(
            &PriceSnapshot::default(),
            PriceUnit::ZlPerMwh,
            at("2025-08-08T10:00:00+02:00"),
        );
        assert_eq!(readings.len(), 4);
        assert!(readings.iter().all(|r| !r.available && r.state.is_none()));
        let keys: Vec<&str> = readings.iter().map(|r| r.key).collect();
        assert_eq!(
            keys,
            vec!["fixing1_rate", "fixing1_volume", "fixing2_rate", "fixing2_volume"]
        );
    }
}
