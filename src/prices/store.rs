use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use super::types::{DayDataset, HourRecord};

/// Default location of the persisted cache.
pub const DEFAULT_STATE_PATH: &str = "./data/tge_state.json";

/// Rolling window of delivery days (normally today and tomorrow).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriceCache {
    days: BTreeMap<NaiveDate, DayDataset>,
}

/// On-disk shape of the cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub cache: BTreeMap<NaiveDate, DayDataset>,
}

impl PriceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a day, replacing whatever was cached for that date.
    pub fn merge(&mut self, day: DayDataset) {
        self.days.insert(day.date, day);
    }

    /// Drop every day strictly before `today`. Returns how many were removed.
    pub fn prune(&mut self, today: NaiveDate) -> usize {
        let before = self.days.len();
        self.days.retain(|date, _| *date >= today);
        before - self.days.len()
    }

    pub fn has_stale(&self, today: NaiveDate) -> bool {
        self.days.keys().next().is_some_and(|first| *first < today)
    }

    pub fn day(&self, date: NaiveDate) -> Option<&DayDataset> {
        self.days.get(&date)
    }

    pub fn dates(&self) -> Vec<NaiveDate> {
        self.days.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }

    /// Every cached hour, ordered by timestamp.
    pub fn all_records(&self) -> Vec<&HourRecord> {
        let mut records: Vec<&HourRecord> =
            self.days.values().flat_map(|day| day.hours.iter()).collect();
        records.sort_by_key(|record| record.time);
        records
    }

    pub fn snapshot(&self) -> PersistedState {
        PersistedState {
            cache: self.days.clone(),
        }
    }

    pub fn restore(state: PersistedState) -> Self {
        Self { days: state.cache }
    }
}

/// Stores the cache snapshot as JSON so a restart does not need a refetch.
#[derive(Debug, Clone)]
pub struct StatePersistence {
    state_path: PathBuf,
}

impl StatePersistence {
    pub fn new(state_path: impl Into<PathBuf>) -> Self {
        Self {
            state_path: state_path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.state_path
    }

    /// Load the persisted cache. A missing file is not an error.
    pub fn load(&self) -> Result<Option<PersistedState>> {
        if !self.state_path.exists() {
            info!(
                "No persisted price cache at {}, starting empty",
                self.state_path.display()
            );
            return Ok(None);
        }

        let contents = fs::read_to_string(&self.state_path).with_context(|| {
            format!("Failed to read price cache from {}", self.state_path.display())
        })?;
        let state: PersistedState = serde_json::from_str(&contents).with_context(|| {
            format!("Failed to parse price cache from {}", self.state_path.display())
        })?;

        info!(
            "Restored price cache from {} ({} days)",
            self.state_path.display(),
            state.cache.len()
        );
        Ok(Some(state))
    }

    /// Write the snapshot through a temp file and rename.
    pub fn save(&self, state: &PersistedState) -> Result<()> {
        if let Some(parent) = self.state_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory {}", parent.display()))?;
            }
        }

        let json = serde_json::to_string_pretty(state).context("Failed to serialize price cache")?;
        let temp_path = self.state_path.with_extension("tmp");
        fs::write(&temp_path, &json)
            .with_context(|| format!("Failed to write temp file {}", temp_path.display()))?;
        fs::rename(&temp_path, &self.state_path).with_context(|| {
            format!("Failed to rename temp file to {}", self.state_path.display())
        })?;

        tracing::debug!(
            "Saved price cache to {} ({} days)",
            self.state_path.display(),
            state.cache.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, FixedOffset, TimeZone};
    use tempfile::tempdir;

    fn offset() -> FixedOffset {
        FixedOffset::east_opt(2 * 3600).unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn record(time: DateTime<FixedOffset>, rate: f64) -> HourRecord {
        HourRecord {
            time,
            fixing1_rate: rate,
            fixing1_volume: 1234.5,
            fixing2_rate: rate - 0.1,
            fixing2_volume: 0.1 + 0.2,
        }
    }

    fn day(date: NaiveDate, hours: &[u32]) -> DayDataset {
        let hours = hours
            .iter()
            .map(|h| {
                let time = offset()
                    .from_local_datetime(&date.and_hms_opt(*h, 0, 0).unwrap())
                    .unwrap();
                record(time, 400.0 + *h as f64 / 3.0)
            })
            .collect();
        DayDataset { date, hours }
    }

    #[test]
    fn test_merge_replaces_whole_day() {
        let mut cache = PriceCache::new();
        cache.merge(day(date(2025, 8, 8), &[0, 1, 2]));
        cache.merge(day(date(2025, 8, 8), &[5]));

        let stored = cache.day(date(2025, 8, 8)).unwrap();
        assert_eq!(stored.hours.len(), 1);
        assert_eq!(stored.hours[0].hour(), 5);
    }

    #[test]
    fn test_prune_boundary() {
        let mut cache = PriceCache::new();
        for d in [6, 7, 8, 9] {
            cache.merge(day(date(2025, 8, d), &[0]));
        }

        assert!(cache.has_stale(date(2025, 8, 8)));
        assert_eq!(cache.prune(date(2025, 8, 8)), 2);
        assert_eq!(cache.dates(), vec![date(2025, 8, 8), date(2025, 8, 9)]);
        assert!(!cache.has_stale(date(2025, 8, 8)));
        assert_eq!(cache.prune(date(2025, 8, 8)), 0);
    }

    #[test]
    fn test_prune_empty_cache() {
        let mut cache = PriceCache::new();
        assert_eq!(cache.prune(date(2025, 8, 8)), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_all_records_sorted() {
        let mut cache = PriceCache::new();
        cache.merge(day(date(2025, 8, 9), &[3, 1, 2]));
        cache.merge(day(date(2025, 8, 8), &[23, 0, 12]));

        let records = cache.all_records();
        assert_eq!(records.len(), 6);
        assert!(records.windows(2).all(|w| w[0].time <= w[1].time));
        assert_eq!(records[0].time.to_rfc3339(), "2025-08-08T00:00:00+02:00");
        assert_eq!(records[5].time - records[0].time, Duration::hours(27));
    }

    #[test]
    fn test_snapshot_shape() {
        let mut cache = PriceCache::new();
        cache.merge(day(date(2025, 8, 8), &[8]));

        let json = serde_json::to_value(cache.snapshot()).unwrap();
        let entry = &json["cache"]["2025-08-08"];
        assert_eq!(entry["date"], "2025-08-08");
        assert_eq!(entry["hours"][0]["time"], "2025-08-08T08:00:00+02:00");
        assert_eq!(entry["hours"][0]["fixing1_volume"], 1234.5);
    }

    #[test]
    fn test_snapshot_round_trip_is_stable() {
        let mut cache = PriceCache::new();
        cache.merge(day(date(2025, 8, 8), &[0, 7, 23]));
        cache.merge(day(date(2025, 8, 9), &[1]));

        let first = serde_json::to_string(&cache.snapshot()).unwrap();
        let parsed: PersistedState = serde_json::from_str(&first).unwrap();
        let restored = PriceCache::restore(parsed);
        let second = serde_json::to_string(&restored.snapshot()).unwrap();

        assert_eq!(first, second);
        assert_eq!(restored, cache);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempdir().unwrap();
        let persistence = StatePersistence::new(dir.path().join("missing.json"));
        assert!(persistence.load().unwrap().is_none());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let persistence = StatePersistence::new(dir.path().join("nested").join("state.json"));

        let mut cache = PriceCache::new();
        cache.merge(day(date(2025, 8, 8), &[8, 9]));
        persistence.save(&cache.snapshot()).unwrap();

        let loaded = persistence.load().unwrap().unwrap();
        assert_eq!(PriceCache::restore(loaded), cache);
        assert!(!persistence.path().with_extension("tmp").exists());
    }

    #[test]
    fn test_load_corrupt_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{ not json").unwrap();

        let persistence = StatePersistence::new(path);
        assert!(persistence.load().is_err());
    }
}
