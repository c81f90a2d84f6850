use chrono::{DateTime, FixedOffset, NaiveDate, Timelike};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::prices::connector::{TgeClient, TgeError};
use crate::prices::store::{PriceCache, StatePersistence};
use crate::prices::types::HourRecord;
use crate::template::TemplateSet;
use crate::utils::Zone;

/// Calendar date and hour-of-day a fetch attempt belongs to.
pub type HourBucket = (NaiveDate, u32);

pub fn hour_bucket(now: &DateTime<FixedOffset>) -> HourBucket {
    (now.date_naive(), now.hour())
}

/// Allows one fetch attempt per wall-clock hour.
///
/// The attempt is recorded before the fetch runs, so a failing source is
/// hit at most once an hour.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchGate {
    last_attempt: Option<HourBucket>,
    last_success: Option<HourBucket>,
}

impl FetchGate {
    pub fn should_update(&self, bucket: HourBucket) -> bool {
        self.last_attempt != Some(bucket)
    }

    pub fn record_attempt(&mut self, bucket: HourBucket) {
        self.last_attempt = Some(bucket);
    }

    pub fn record_success(&mut self, bucket: HourBucket) {
        self.last_success = Some(bucket);
    }

    pub fn last_success(&self) -> Option<HourBucket> {
        self.last_success
    }
}

/// Immutable view handed to readers; replaced as a whole after each cycle.
#[derive(Debug, Default)]
pub struct PriceSnapshot {
    /// Raw parsed data.
    pub cache: PriceCache,
    /// Records after templates, ordered by time.
    pub derived: Vec<HourRecord>,
    pub updated_at: Option<DateTime<FixedOffset>>,
    /// Bucket of the last fetch that produced this data.
    pub last_success: Option<HourBucket>,
}

impl PriceSnapshot {
    pub fn build(
        cache: PriceCache,
        templates: &TemplateSet,
        updated_at: Option<DateTime<FixedOffset>>,
        last_success: Option<HourBucket>,
    ) -> Self {
        let derived = cache
            .all_records()
            .into_iter()
            .map(|record| templates.derive(record))
            .collect();
        Self {
            cache,
            derived,
            updated_at,
            last_success,
        }
    }

    pub fn is_available(&self) -> bool {
        self.updated_at.is_some() || !self.cache.is_empty()
    }
}

/// Owns the fetch gate and the current snapshot.
pub struct UpdateCoordinator {
    client: TgeClient,
    templates: TemplateSet,
    persistence: Option<StatePersistence>,
    gate: Mutex<FetchGate>,
    current: RwLock<Arc<PriceSnapshot>>,
}

impl UpdateCoordinator {
    pub fn new(
        client: TgeClient,
        templates: TemplateSet,
        persistence: Option<StatePersistence>,
        cache: PriceCache,
    ) -> Self {
        let initial = PriceSnapshot::build(cache, &templates, None, None);
        Self {
            client,
            templates,
            persistence,
            gate: Mutex::new(FetchGate::default()),
            current: RwLock::new(Arc::new(initial)),
        }
    }

    /// Last published snapshot.
    pub fn snapshot(&self) -> Arc<PriceSnapshot> {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    /// Read from the published snapshot; never takes the gate.
    pub fn last_success(&self) -> Option<HourBucket> {
        self.snapshot().last_success
    }

    /// Run one update cycle if the gate allows it for `now`'s hour.
    ///
    /// Outside a fetch the previously published snapshot is returned as is,
    /// unless the date rolled over and past days must be dropped.
    pub async fn maybe_update(
        &self,
        now: DateTime<FixedOffset>,
    ) -> Result<Arc<PriceSnapshot>, TgeError> {
        let mut gate = self.gate.lock().await;
        let today = now.date_naive();
        let bucket = hour_bucket(&now);
        let current = self.snapshot();

        if !gate.should_update(bucket) {
            if !current.cache.has_stale(today) {
                return Ok(current);
            }
            let mut cache = current.cache.clone();
            let removed = cache.prune(today);
            debug!("Pruned {} past day(s) from price cache", removed);
            self.persist(&cache).await;
            let snapshot = PriceSnapshot::build(
                cache,
                &self.templates,
                current.updated_at,
                current.last_success,
            );
            return Ok(self.publish(snapshot));
        }

        gate.record_attempt(bucket);
        info!("Updating TGE data for {}", today);

        let days = match self.client.fetch_window(today).await {
            Ok(days) => days,
            Err(e) => {
                error!("TGE update failed, keeping previous data: {}", e);
                return Err(e);
            }
        };

        let mut cache = current.cache.clone();
        let fetched: Vec<NaiveDate> = days.iter().map(|d| d.date).collect();
        for day in days {
            cache.merge(day);
        }
        // after merging, so a page still announcing yesterday is dropped too
        let removed = cache.prune(today);
        if removed > 0 {
            debug!("Pruned {} past day(s) from price cache", removed);
        }
        self.persist(&cache).await;

        gate.record_success(bucket);
        let snapshot = self.publish(PriceSnapshot::build(
            cache,
            &self.templates,
            Some(now),
            gate.last_success(),
        ));
        info!(
            "TGE data updated: fetched {:?}, cached {:?}",
            fetched,
            snapshot.cache.dates()
        );
        Ok(snapshot)
    }

    fn publish(&self, snapshot: PriceSnapshot) -> Arc<PriceSnapshot> {
        let snapshot = Arc::new(snapshot);
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::clone(&snapshot);
        snapshot
    }

    /// Write the cache on the blocking pool.
    async fn persist(&self, cache: &PriceCache) {
        let Some(persistence) = self.persistence.clone() else {
            return;
        };
        let state = cache.snapshot();
        match tokio::task::spawn_blocking(move || persistence.save(&state)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to persist price cache: {:#}", e),
            Err(e) => warn!("Price cache write task failed: {}", e),
        }
    }
}

/// Poll the coordinator every `poll_interval`. Each cycle runs in its own
/// task; ticks that arrive while a cycle is still running are skipped.
pub fn spawn_scheduler(
    coordinator: Arc<UpdateCoordinator>,
    zone: Zone,
    poll_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut in_flight: Option<JoinHandle<()>> = None;

        loop {
            ticker.tick().await;
            if in_flight.as_ref().is_some_and(|task| !task.is_finished()) {
                debug!("Previous TGE update still running, skipping tick");
                continue;
            }

            let coordinator = Arc::clone(&coordinator);
            in_flight = Some(tokio::spawn(async move {
                // failures are logged by the cycle itself
                let _ = coordinator.maybe_update(zone.now()).await;
            }));
        }
    })
}
