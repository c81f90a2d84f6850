use chrono::{DateTime, FixedOffset, NaiveDate, Timelike};
use serde::{Deserialize, Serialize};

/// One delivery hour as published in the RDN table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourRecord {
    pub time: DateTime<FixedOffset>,
    pub fixing1_rate: f64,
    pub fixing1_volume: f64,
    pub fixing2_rate: f64,
    pub fixing2_volume: f64,
}

impl HourRecord {
    pub fn hour(&self) -> u32 {
        self.time.hour()
    }

    pub fn date(&self) -> NaiveDate {
        self.time.date_naive()
    }

    /// Copy of this record with one field replaced.
    pub fn with_field(&self, field: Field, value: f64) -> Self {
        let mut out = self.clone();
        match field {
            Field::Fixing1Rate => out.fixing1_rate = value,
            Field::Fixing1Volume => out.fixing1_volume = value,
            Field::Fixing2Rate => out.fixing2_rate = value,
            Field::Fixing2Volume => out.fixing2_volume = value,
        }
        out
    }
}

/// All hours published for a single delivery date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DayDataset {
    pub date: NaiveDate,
    pub hours: Vec<HourRecord>,
}

impl DayDataset {
    pub fn hour(&self, hour: u32) -> Option<&HourRecord> {
        self.hours.iter().find(|h| h.hour() == hour)
    }
}

/// The four numeric columns of an hour row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Fixing1Rate,
    Fixing1Volume,
    Fixing2Rate,
    Fixing2Volume,
}

impl Field {
    pub const ALL: [Field; 4] = [
        Field::Fixing1Rate,
        Field::Fixing1Volume,
        Field::Fixing2Rate,
        Field::Fixing2Volume,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            Field::Fixing1Rate => "fixing1_rate",
            Field::Fixing1Volume => "fixing1_volume",
            Field::Fixing2Rate => "fixing2_rate",
            Field::Fixing2Volume => "fixing2_volume",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.key() == key)
    }

    pub fn get(&self, record: &HourRecord) -> f64 {
        match self {
            Field::Fixing1Rate => record.fixing1_rate,
            Field::Fixing1Volume => record.fixing1_volume,
            Field::Fixing2Rate => record.fixing2_rate,
            Field::Fixing2Volume => record.fixing2_volume,
        }
    }

    pub fn is_rate(&self) -> bool {
        matches!(self, Field::Fixing1Rate | Field::Fixing2Rate)
    }
}
