//! In-memory table of the current observation per platform.
//!
//! Every operation takes one coarse lock over the whole table. Operations are
//! O(n) scans, which is fine at feed scale, and a single lock keeps each
//! batch or purge atomic with respect to readers.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::info;

use crate::merge::merge_observation;
use crate::model::{Observation, PlatformType, Source};

/// Inclusive lat/lon rectangle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub lat_min: f64,
    pub lat_max: f64,
    pub lon_min: f64,
    pub lon_max: f64,
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self {
            lat_min: -90.0,
            lat_max: 90.0,
            lon_min: -180.0,
            lon_max: 180.0,
        }
    }
}

impl BoundingBox {
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        (self.lat_min..=self.lat_max).contains(&lat) && (self.lon_min..=self.lon_max).contains(&lon)
    }
}

/// Returns `now - hours`, accepting fractional hours.
///
/// An age reaching past the representable range means no age limit.
pub fn age_cutoff(now: DateTime<Utc>, max_age_hours: f64) -> DateTime<Utc> {
    Duration::try_milliseconds((max_age_hours * 3_600_000.0).round() as i64)
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[derive(Debug, Default)]
pub struct StationStore {
    stations: Mutex<HashMap<String, Observation>>,
}

impl StationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Observation>> {
        // A panic elsewhere cannot leave a half-written entry: every write is a
        // single insert/retain, so the table is still consistent.
        self.stations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn count(&self) -> usize {
        self.table().len()
    }

    /// Inserts or merges every record under a single lock acquisition.
    ///
    /// Returns the table size after the batch.
    pub fn apply_batch(&self, source: Source, records: Vec<Observation>) -> usize {
        let incoming = records.len();
        let total = {
            let mut table = self.table();
            for obs in records {
                let merged = match table.remove(&obs.platform_code) {
                    Some(existing) => merge_observation(existing, obs),
                    None => obs,
                };
                table.insert(merged.platform_code.clone(), merged);
            }
            table.len()
        };
        info!(source = %source, incoming, total, "Store updated");
        total
    }

    /// Removes observations older than `max_age_hours`. Returns the number removed.
    pub fn purge(&self, max_age_hours: u32) -> usize {
        self.purge_before(age_cutoff(Utc::now(), f64::from(max_age_hours)))
    }

    /// Removes every observation whose time is strictly before `cutoff`.
    pub fn purge_before(&self, cutoff: DateTime<Utc>) -> usize {
        let purged = {
            let mut table = self.table();
            let before = table.len();
            table.retain(|_, obs| obs.time >= cutoff);
            before - table.len()
        };
        if purged > 0 {
            info!(purged, cutoff = %cutoff, "Purged stale observations");
        }
        purged
    }

    /// Returns observations inside `bbox` no older than `max_age_hours`,
    /// optionally restricted to `types`. Order is unspecified.
    pub fn query(
        &self,
        bbox: &BoundingBox,
        max_age_hours: f64,
        types: Option<&HashSet<PlatformType>>,
    ) -> Vec<Observation> {
        let cutoff = age_cutoff(Utc::now(), max_age_hours);
        self.table()
            .values()
            .filter(|obs| obs.time >= cutoff)
            .filter(|obs| bbox.contains(obs.lat, obs.lon))
            .filter(|obs| types.is_none_or(|set| set.contains(&obs.platform_type)))
            .cloned()
            .collect()
    }

    /// Timestamp of the oldest observation, or `None` when empty.
    pub fn oldest_time(&self) -> Option<DateTime<Utc>> {
        self.table().values().map(|obs| obs.time).min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ago(hours: i64) -> DateTime<Utc> {
        Utc::now() - Duration::hours(hours)
    }

    fn station(code: &str, ptype: PlatformType, time: DateTime<Utc>) -> Observation {
        Observation::new(code, ptype, 31.4, -80.9, time, Source::Osmc)
    }

    #[test]
    fn test_ndbc_replaces_older_osmc_record() {
        let store = StationStore::new();
        store.apply_batch(
            Source::Osmc,
            vec![
                station("41008", PlatformType::Buoy, ago(3)),
                station("46002", PlatformType::Buoy, ago(3)),
            ],
        );
        assert_eq!(store.count(), 2);

        let mut newer = station("41008", PlatformType::Buoy, ago(1));
        newer.source = Source::Ndbc;
        newer.air_temp = Some(20.0);
        store.apply_batch(Source::Ndbc, vec![newer]);
        assert_eq!(store.count(), 2);

        let results = store.query(&BoundingBox::default(), 6.0, None);
        let s41008 = results.iter().find(|o| o.platform_code == "41008").unwrap();
        assert_eq!(s41008.source, Source::Ndbc);
        assert_eq!(s41008.air_temp, Some(20.0));
    }

    #[test]
    fn test_older_incoming_does_not_replace() {
        let store = StationStore::new();
        store.apply_batch(Source::Ndbc, vec![station("41008", PlatformType::Buoy, ago(1))]);
        store.apply_batch(Source::Osmc, vec![station("41008", PlatformType::Ship, ago(4))]);

        let results = store.query(&BoundingBox::default(), 24.0, None);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].platform_type, PlatformType::Buoy);
    }

    #[test]
    fn test_synthetic_ship_keys_preserved() {
        let store = StationStore::new();
        store.apply_batch(
            Source::Osmc,
            vec![
                station("SHIP_-30.1_45.2_1000", PlatformType::Ship, ago(1)),
                station("SHIP_-31.0_46.0_1001", PlatformType::Ship, ago(1)),
            ],
        );
        assert_eq!(store.count(), 2);
    }

    #[test]
    fn test_purge_removes_only_stale() {
        let store = StationStore::new();
        store.apply_batch(
            Source::Osmc,
            vec![
                station("OLD", PlatformType::Buoy, ago(25)),
                station("NEW", PlatformType::Buoy, ago(1)),
            ],
        );
        assert_eq!(store.count(), 2);

        assert_eq!(store.purge(12), 1);
        assert_eq!(store.count(), 1);
        assert_eq!(store.purge(12), 0);
    }

    #[test]
    fn test_purge_before_is_strict() {
        let store = StationStore::new();
        let t = ago(2);
        store.apply_batch(Source::Osmc, vec![station("EDGE", PlatformType::Buoy, t)]);
        assert_eq!(store.purge_before(t), 0);
        assert_eq!(store.purge_before(t + Duration::seconds(1)), 1);
    }

    #[test]
    fn test_query_bbox_is_exact() {
        let store = StationStore::new();
        let mut inside = station("IN", PlatformType::Buoy, ago(1));
        inside.lon = -80.87;
        let mut outside = station("OUT", PlatformType::Buoy, ago(1));
        outside.lat = 60.0;
        outside.lon = 10.0;
        store.apply_batch(Source::Osmc, vec![inside, outside]);

        let bbox = BoundingBox {
            lat_min: 30.0,
            lat_max: 35.0,
            lon_min: -85.0,
            lon_max: -75.0,
        };
        let results = store.query(&bbox, 6.0, None);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].platform_code, "IN");
    }

    #[test]
    fn test_query_bbox_edges_are_inclusive() {
        let bbox = BoundingBox {
            lat_min: 30.0,
            lat_max: 35.0,
            lon_min: -85.0,
            lon_max: -75.0,
        };
        assert!(bbox.contains(30.0, -85.0));
        assert!(bbox.contains(35.0, -75.0));
        assert!(!bbox.contains(35.000_01, -75.0));
    }

    #[test]
    fn test_query_type_filter() {
        let store = StationStore::new();
        store.apply_batch(
            Source::Osmc,
            vec![
                station("BUOY1", PlatformType::Buoy, ago(1)),
                station("SHIP1", PlatformType::Ship, ago(1)),
            ],
        );

        let ships: HashSet<_> = [PlatformType::Ship].into();
        let results = store.query(&BoundingBox::default(), 6.0, Some(&ships));
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].platform_code, "SHIP1");

        let nothing = HashSet::new();
        assert!(store.query(&BoundingBox::default(), 6.0, Some(&nothing)).is_empty());
    }

    #[test]
    fn test_query_age_filter() {
        let store = StationStore::new();
        store.apply_batch(
            Source::Osmc,
            vec![
                station("RECENT", PlatformType::Buoy, ago(1)),
                station("STALE", PlatformType::Buoy, ago(8)),
            ],
        );
        assert_eq!(store.query(&BoundingBox::default(), 6.0, None).len(), 1);
        assert_eq!(store.query(&BoundingBox::default(), 0.5, None).len(), 0);
        assert_eq!(store.query(&BoundingBox::default(), 12.0, None).len(), 2);
    }

    #[test]
    fn test_huge_max_age_means_no_limit() {
        let store = StationStore::new();
        store.apply_batch(Source::Osmc, vec![station("OLD1", PlatformType::Drifter, ago(24 * 365 * 30))]);

        let max_age = crate::query::parse_max_age("3000000000h");
        assert_eq!(max_age, 3_000_000_000.0);
        assert_eq!(store.query(&BoundingBox::default(), max_age, None).len(), 1);
        assert_eq!(age_cutoff(Utc::now(), f64::MAX), DateTime::<Utc>::MIN_UTC);
    }

    #[test]
    fn test_oldest_time() {
        let store = StationStore::new();
        assert_eq!(store.oldest_time(), None);

        let oldest = ago(5);
        store.apply_batch(
            Source::Osmc,
            vec![
                station("A", PlatformType::Buoy, ago(1)),
                station("B", PlatformType::Buoy, oldest),
            ],
        );
        assert_eq!(store.oldest_time(), Some(oldest));
    }

    #[test]
    fn test_concurrent_readers_see_whole_batches() {
        use std::sync::Arc;

        let store = Arc::new(StationStore::new());
        let writer = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for round in 0..50 {
                    let batch = (0..20)
                        .map(|i| station(&format!("P{round}_{i}"), PlatformType::Buoy, ago(1)))
                        .collect();
                    store.apply_batch(Source::Osmc, batch);
                }
            })
        };
        for _ in 0..50 {
            assert_eq!(store.count() % 20, 0);
        }
        writer.join().unwrap();
        assert_eq!(store.count(), 1000);
    }
}
