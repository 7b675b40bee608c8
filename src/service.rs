//! Service object tying the feeds, the store and the bookkeeping together.
//!
//! Everything the scheduler, the admin triggers and the query path touch
//! lives here and is shared by `Arc<ObservationService>`.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::config::{OSMC_WATERMARK_OVERLAP_MINUTES, Settings, SettingsHandle, SettingsUpdate};
use crate::error::{FeedError, QueryError};
use crate::feeds::Feed;
use crate::geoip::GeoResolver;
use crate::history::{FetchEvent, FetchHistory, FetchStatus, RequestEvent, RequestLog};
use crate::model::Source;
use crate::query::{QueryParams, QueryResponse};
use crate::stats::StatsSnapshot;
use crate::store::StationStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchState {
    Pending,
    Ok,
    Error,
}

/// Outcome of the latest fetch of one source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceStatus {
    /// Start of the last successful fetch.
    pub last_fetch: Option<String>,
    /// Records parsed by the last successful fetch.
    pub stations: usize,
    pub status: FetchState,
}

impl Default for SourceStatus {
    fn default() -> Self {
        Self {
            last_fetch: None,
            stations: 0,
            status: FetchState::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub uptime: String,
    pub sources: BTreeMap<&'static str, SourceStatus>,
    pub total_stations: usize,
    pub oldest_observation: Option<String>,
}

/// `"{d}d {h}h"` from one day up, `"{h}h {m}m"` below.
pub fn format_uptime(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3600;
    if days > 0 {
        format!("{days}d {hours}h")
    } else {
        format!("{hours}h {}m", (secs % 3600) / 60)
    }
}

/// Picks the client address: `CF-Connecting-IP`, then the first
/// `X-Forwarded-For` entry, then the socket peer.
pub fn client_ip(cf_connecting_ip: Option<&str>, forwarded_for: Option<&str>, peer: Option<&str>) -> String {
    let non_empty = |v: Option<&str>| v.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string);
    non_empty(cf_connecting_ip)
        .or_else(|| non_empty(forwarded_for.and_then(|v| v.split(',').next())))
        .or_else(|| non_empty(peer))
        .unwrap_or_else(|| "unknown".to_string())
}

pub struct ObservationService {
    store: StationStore,
    settings: SettingsHandle,
    osmc: Arc<dyn Feed>,
    ndbc: Arc<dyn Feed>,
    /// OSMC lower time bound. Held for the whole OSMC fetch, so OSMC fetches
    /// never overlap.
    osmc_since: tokio::sync::Mutex<Option<DateTime<Utc>>>,
    sources: Mutex<HashMap<Source, SourceStatus>>,
    fetch_history: Option<FetchHistory>,
    request_log: Option<RequestLog>,
    geo: GeoResolver,
    started: Instant,
}

impl ObservationService {
    pub fn new(settings: SettingsHandle, osmc: Arc<dyn Feed>, ndbc: Arc<dyn Feed>, geo: GeoResolver) -> Self {
        Self {
            store: StationStore::new(),
            settings,
            osmc,
            ndbc,
            osmc_since: tokio::sync::Mutex::new(None),
            sources: Mutex::new(HashMap::from([
                (Source::Osmc, SourceStatus::default()),
                (Source::Ndbc, SourceStatus::default()),
            ])),
            fetch_history: None,
            request_log: None,
            geo,
            started: Instant::now(),
        }
    }

    pub fn with_event_logs(mut self, fetch_history: FetchHistory, request_log: RequestLog) -> Self {
        self.fetch_history = Some(fetch_history);
        self.request_log = Some(request_log);
        self
    }

    pub fn store(&self) -> &StationStore {
        &self.store
    }

    pub fn settings(&self) -> &SettingsHandle {
        &self.settings
    }

    pub fn fetch_history(&self) -> Option<&FetchHistory> {
        self.fetch_history.as_ref()
    }

    pub fn request_log(&self) -> Option<&RequestLog> {
        self.request_log.as_ref()
    }

    fn sources(&self) -> MutexGuard<'_, HashMap<Source, SourceStatus>> {
        self.sources.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn source_status(&self, source: Source) -> SourceStatus {
        self.sources().get(&source).cloned().unwrap_or_default()
    }

    pub async fn osmc_watermark(&self) -> Option<DateTime<Utc>> {
        *self.osmc_since.lock().await
    }

    /// Replays the request log into the request counters.
    pub fn seed_request_stats(&self) {
        if let Some(log) = &self.request_log {
            let (total, by_country) = log.load_totals();
            self.geo.stats().seed(total, by_country);
            info!(total, "Seeded request stats from log");
        }
    }

    /// Fetches one source and merges the result into the store.
    ///
    /// Errors are logged, recorded as a fetch event and reflected in the
    /// source status before being returned; the store is left untouched.
    pub async fn run_fetch(&self, source: Source) -> Result<usize, FeedError> {
        let result = match source {
            Source::Osmc => {
                let mut since = self.osmc_since.lock().await;
                let fetch_start = Utc::now();
                let result = self.osmc.fetch(*since).await;
                if result.is_ok() {
                    *since = Some(fetch_start - ChronoDuration::minutes(OSMC_WATERMARK_OVERLAP_MINUTES));
                }
                result.map(|records| (fetch_start, records))
            }
            Source::Ndbc => {
                let fetch_start = Utc::now();
                self.ndbc.fetch(None).await.map(|records| (fetch_start, records))
            }
        };

        match result {
            Ok((fetch_start, records)) => {
                let parsed = records.len();
                self.store.apply_batch(source, records);
                let ts = fetch_start.format(crate::TIME_FORMAT).to_string();
                self.sources().insert(
                    source,
                    SourceStatus {
                        last_fetch: Some(ts.clone()),
                        stations: parsed,
                        status: FetchState::Ok,
                    },
                );
                self.record_fetch(FetchEvent {
                    time: ts,
                    source,
                    status: FetchStatus::Ok,
                    stations: parsed,
                    error: String::new(),
                });
                Ok(parsed)
            }
            Err(e) => {
                error!(source = %source, error = %e, "Fetch failed");
                if let Some(status) = self.sources().get_mut(&source) {
                    status.status = FetchState::Error;
                }
                self.record_fetch(FetchEvent {
                    time: Utc::now().format(crate::TIME_FORMAT).to_string(),
                    source,
                    status: FetchStatus::Error,
                    stations: 0,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn record_fetch(&self, event: FetchEvent) {
        let Some(history) = &self.fetch_history else {
            return;
        };
        if let Err(e) = history.record(&event) {
            warn!(path = %history.path().display(), error = %e, "Failed to write fetch history");
        }
    }

    /// Purges with the configured max age. Returns the number removed.
    pub fn purge(&self) -> usize {
        self.store.purge(self.settings.get().max_obs_age_hours)
    }

    pub fn query(&self, params: &QueryParams) -> Result<QueryResponse, QueryError> {
        let bbox = params.bbox()?;
        let types = params.type_filter();
        let stations = self
            .store
            .query(&bbox, params.max_age_hours(), types.as_ref())
            .iter()
            .map(|obs| obs.to_public())
            .collect();
        Ok(QueryResponse::new(Utc::now(), stations))
    }

    /// Query entry point for the API layer: counts the hit, answers the
    /// query and appends a request event. Must run inside a tokio runtime.
    pub async fn handle_query(&self, client_ip: &str, params: &QueryParams) -> Result<QueryResponse, QueryError> {
        let started = Instant::now();
        let time = Utc::now().format(crate::TIME_FORMAT).to_string();
        let _ = self.geo.observe(client_ip);

        let result = self.query(params);
        let (count, status, error) = match &result {
            Ok(resp) => (resp.count, 200, String::new()),
            Err(e) => (0, 422, e.to_string()),
        };

        if let Some(log) = &self.request_log {
            let event = RequestEvent {
                time,
                country: self.geo.stats().country_of(client_ip).unwrap_or_default(),
                bbox: params.bbox_label(),
                max_age: params.max_age.clone(),
                types: params.types.clone(),
                count,
                duration_ms: started.elapsed().as_millis() as u64,
                status,
                error,
            };
            if let Err(e) = log.record(&event) {
                warn!(path = %log.path().display(), error = %e, "Failed to write request log");
            }
        }
        result
    }

    pub fn update_settings(&self, update: SettingsUpdate) -> anyhow::Result<Settings> {
        let settings = self.settings.update(|s| update.apply(s))?;
        info!(?settings, "Settings updated");
        Ok(settings)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.geo.stats().snapshot()
    }

    pub fn status(&self) -> StatusReport {
        let sources = self
            .sources()
            .iter()
            .map(|(source, status)| (source.as_str(), status.clone()))
            .collect();
        StatusReport {
            uptime: format_uptime(self.started.elapsed()),
            sources,
            total_stations: self.store.count(),
            oldest_observation: self
                .store
                .oldest_time()
                .map(|t| t.format(crate::TIME_FORMAT).to_string()),
        }
    }
}
