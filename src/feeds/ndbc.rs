//! NDBC `latest_obs.txt` feed (US and partner moored buoys, C-MAN stations).

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use std::sync::{PoisonError, RwLock};
use tracing::{debug, info, warn};

use super::{Feed, StationRegistry, parse_lenient, validated};
use crate::config::{NDBC_ACTIVE_STATIONS_URL, NDBC_LATEST_OBS_URL};
use crate::error::FeedError;
use crate::fetch::{HttpClient, fetch_text};
use crate::model::{Observation, Source};

const MISSING: &str = "MM";
const FEET_TO_METRES: f64 = 0.3048;
const NMI_TO_METRES: f64 = 1852.0;

/// Column layout of the data rows, detected from the first header line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    /// `STN LAT LON YYYY MM DD hh mm WDIR ...`
    Modern,
    /// `STN LAT LON DATE TIME WDIR ...` with `MM/DD/YYYY hh:mm`.
    Legacy,
}

impl Layout {
    fn detect(header: &str) -> Self {
        let cols: Vec<&str> = header.trim_start_matches('#').split_whitespace().collect();
        if cols.len() > 4 && cols[3] == "YYYY" {
            Layout::Modern
        } else {
            Layout::Legacy
        }
    }

    /// Index of WDIR, the first measurement column.
    fn data_offset(self) -> usize {
        match self {
            Layout::Modern => 8,
            Layout::Legacy => 5,
        }
    }

    /// Rows must reach DEWP; VIS and TIDE are optional trailing columns.
    fn min_columns(self) -> usize {
        self.data_offset() + 12
    }

    fn parse_time(self, parts: &[&str]) -> Option<DateTime<Utc>> {
        match self {
            Layout::Modern => {
                let int = |i: usize| parts[i].parse::<u32>().ok();
                let year = parts[3].parse::<i32>().ok()?;
                NaiveDate::from_ymd_opt(year, int(4)?, int(5)?)?
                    .and_hms_opt(int(6)?, int(7)?, 0)
                    .map(|dt| dt.and_utc())
            }
            Layout::Legacy => {
                NaiveDateTime::parse_from_str(&format!("{} {}", parts[3], parts[4]), "%m/%d/%Y %H:%M")
                    .ok()
                    .map(|dt| dt.and_utc())
            }
        }
    }
}

fn parse_row(layout: Layout, line: &str, registry: &StationRegistry) -> Option<Observation> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < layout.min_columns() {
        return None;
    }
    let code = parts[0];
    let lat = parse_lenient(parts[1], MISSING)?;
    let lon = parse_lenient(parts[2], MISSING)?;
    let time = layout.parse_time(&parts)?;

    let offset = layout.data_offset();
    let field = |i: usize| parts.get(offset + i).and_then(|v| parse_lenient(v, MISSING));

    validated(Observation {
        country: Some("US".to_string()),
        wind_dir: field(0),
        wind_spd: field(1),
        gust: field(2),
        wave_ht: field(3),
        wave_period: field(4),
        wave_avg_period: field(5),
        wave_dir: field(6),
        pressure: field(7),
        pressure_tendency: field(8),
        air_temp: field(9),
        sea_temp: field(10),
        dewpoint: field(11),
        vis: field(12).map(|v| v * NMI_TO_METRES),
        water_level: field(13).map(|v| v * FEET_TO_METRES),
        ..Observation::new(code, registry.type_of(code), lat, lon, time, Source::Ndbc)
    })
}

/// Parses NDBC `latest_obs.txt`: two header lines then whitespace-separated rows.
///
/// Platform types come from `registry`. Short rows and rows without a
/// parsable position or time are skipped.
pub fn parse_ndbc_latest_obs(text: &str, registry: &StationRegistry) -> Vec<Observation> {
    let lines: Vec<&str> = text.trim().lines().collect();
    if lines.len() < 3 {
        warn!("NDBC latest_obs has fewer than 3 lines");
        return Vec::new();
    }

    let layout = Layout::detect(lines[0]);
    debug!(?layout, "Detected NDBC layout");

    let stations: Vec<Observation> = lines[2..]
        .iter()
        .filter_map(|line| parse_row(layout, line, registry))
        .collect();

    info!(stations = stations.len(), "Parsed stations from NDBC latest_obs");
    stations
}

pub struct NdbcFeed<C> {
    client: C,
    registry: RwLock<StationRegistry>,
}

impl<C: HttpClient> NdbcFeed<C> {
    pub fn new(client: C) -> Self {
        Self::with_registry(client, StationRegistry::default())
    }

    pub fn with_registry(client: C, registry: StationRegistry) -> Self {
        Self {
            client,
            registry: RwLock::new(registry),
        }
    }

    /// Downloads `activestations.xml` and replaces the registry.
    ///
    /// On failure the previous registry is kept.
    #[tracing::instrument(skip(self))]
    pub async fn load_registry(&self) -> Result<usize, FeedError> {
        let xml = fetch_text(&self.client, NDBC_ACTIVE_STATIONS_URL).await?;
        let registry = StationRegistry::from_xml(&xml)?;
        let count = registry.len();
        *self.registry.write().unwrap_or_else(PoisonError::into_inner) = registry;
        Ok(count)
    }

    pub fn registry_len(&self) -> usize {
        self.registry.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait]
impl<C: HttpClient> Feed for NdbcFeed<C> {
    fn source(&self) -> Source {
        Source::Ndbc
    }

    #[tracing::instrument(skip(self), fields(source = "ndbc"))]
    async fn fetch(&self, _since: Option<DateTime<Utc>>) -> Result<Vec<Observation>, FeedError> {
        info!(url = NDBC_LATEST_OBS_URL, "Fetching NDBC");
        let text = fetch_text(&self.client, NDBC_LATEST_OBS_URL).await?;
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        Ok(parse_ndbc_latest_obs(&text, &registry))
    }
}
