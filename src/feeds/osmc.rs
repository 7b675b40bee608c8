//! OSMC ERDDAP tabular feed (GTS ships, buoys, drifters, coastal stations).

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use csv::{ReaderBuilder, StringRecord, Trim};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::{Feed, parse_lenient, validated};
use crate::config::{OSMC_BASE_URL, OSMC_FIELDS, OSMC_LOOKBACK_HOURS};
use crate::error::FeedError;
use crate::fetch::{HttpClient, fetch_text};
use crate::model::{Observation, PlatformType, Source};

/// Platform code OSMC uses for ships that do not identify themselves.
const ANONYMOUS_SHIP: &str = "SHIP";
const MISSING: &str = "NaN";

static PLATFORM_TYPES: &[(&str, PlatformType)] = &[
    ("VOLUNTEER OBSERVING SHIPS", PlatformType::Ship),
    ("SHIPS", PlatformType::Ship),
    ("SHIPS (GENERIC)", PlatformType::Ship),
    ("SHIP FISHING VESSEL", PlatformType::Ship),
    ("VOSCLIM", PlatformType::Ship),
    ("MOORED BUOYS", PlatformType::Buoy),
    ("WEATHER BUOYS", PlatformType::Buoy),
    ("TROPICAL MOORED BUOYS", PlatformType::Buoy),
    ("TSUNAMI WARNING STATIONS", PlatformType::Buoy),
    ("MOORED BUOYS (GENERIC)", PlatformType::Buoy),
    ("WEATHER BUOYS (GENERIC)", PlatformType::Buoy),
    ("DRIFTING BUOYS", PlatformType::Drifter),
    ("DRIFTING BUOYS (GENERIC)", PlatformType::Drifter),
    ("ICE BUOYS", PlatformType::Drifter),
    ("UNCREWED SURFACE VEHICLE", PlatformType::Drifter),
    ("TAGGED ANIMAL", PlatformType::Drifter),
    ("C-MAN WEATHER STATIONS", PlatformType::Shore),
    ("SHORE AND BOTTOM STATIONS", PlatformType::Shore),
    ("TIDE GAUGE STATIONS", PlatformType::Shore),
    ("GLOSS", PlatformType::Shore),
    ("RESEARCH", PlatformType::Other),
    ("PROFILING FLOATS AND GLIDERS", PlatformType::Other),
    ("GLIDERS", PlatformType::Other),
    ("UNKNOWN", PlatformType::Other),
    ("WEATHER OBS", PlatformType::Other),
    ("WEATHER AND OCEAN OBS", PlatformType::Other),
];

/// Maps an OSMC `platform_type` string onto the five-way taxonomy.
pub fn normalize_platform_type(raw: &str) -> PlatformType {
    let key = raw.trim().to_uppercase();
    PLATFORM_TYPES
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, t)| *t)
        .unwrap_or(PlatformType::Other)
}

/// Builds the ERDDAP request URL with a `time>=` lower bound.
///
/// Uses `since` when given, otherwise the fixed lookback window before `now`.
pub fn build_url(since: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let lower = since.unwrap_or_else(|| now - Duration::hours(OSMC_LOOKBACK_HOURS));
    format!(
        "{OSMC_BASE_URL}?{OSMC_FIELDS}&time>={}",
        lower.format(crate::TIME_FORMAT)
    )
}

/// Key for anonymous ship reports: position to one decimal plus epoch seconds.
pub fn synthetic_ship_key(lat: f64, lon: f64, time: DateTime<Utc>) -> String {
    format!("SHIP_{lat:.1}_{lon:.1}_{}", time.timestamp())
}

fn parse_time(val: &str) -> Option<DateTime<Utc>> {
    let val = val.trim();
    if val.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(val)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(val, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|dt| dt.and_utc())
        })
}

/// Column positions taken from the header row.
struct Columns(HashMap<String, usize>);

impl Columns {
    fn new(headers: &StringRecord) -> Self {
        Self(
            headers
                .iter()
                .enumerate()
                .map(|(i, name)| (name.to_string(), i))
                .collect(),
        )
    }

    fn get<'r>(&self, record: &'r StringRecord, name: &str) -> &'r str {
        self.0
            .get(name)
            .and_then(|&i| record.get(i))
            .unwrap_or("")
    }

    fn float(&self, record: &StringRecord, name: &str) -> Option<f64> {
        parse_lenient(self.get(record, name), MISSING)
    }
}

fn parse_row(cols: &Columns, record: &StringRecord) -> Option<Observation> {
    let time = parse_time(cols.get(record, "time"))?;
    let lat = cols.float(record, "latitude")?;
    let lon = cols.float(record, "longitude")?;

    let code = cols.get(record, "platform_code").trim();
    if code.is_empty() {
        return None;
    }
    let code = if code.eq_ignore_ascii_case(ANONYMOUS_SHIP) {
        synthetic_ship_key(lat, lon, time)
    } else {
        code.to_string()
    };

    // WMO FM 13 codes calm/variable as 00; OSMC ships report 0.0 when the
    // direction is unknown, so 0.0 can't be read as due north.
    let wind_dir = cols.float(record, "winddir").filter(|&d| d != 0.0);

    let country = Some(cols.get(record, "country").trim())
        .filter(|c| !c.is_empty())
        .map(str::to_string);

    let platform_type = normalize_platform_type(cols.get(record, "platform_type"));
    validated(Observation {
        country,
        sea_temp: cols.float(record, "sst"),
        air_temp: cols.float(record, "atmp"),
        pressure: cols.float(record, "slp"),
        wind_spd: cols.float(record, "windspd"),
        wind_dir,
        wave_ht: cols.float(record, "wvht"),
        water_level: cols.float(record, "waterlevel"),
        clouds: cols.float(record, "clouds"),
        dewpoint: cols.float(record, "dewpoint"),
        ..Observation::new(code, platform_type, lat, lon, time, Source::Osmc)
    })
}

/// Parses OSMC ERDDAP CSV: a column-name row, a units row, then data rows.
///
/// Rows with an unparsable time/lat/lon or an empty platform code are
/// skipped, as are records that fail validation.
pub fn parse_osmc_csv(text: &str) -> Vec<Observation> {
    let text = text.trim();
    if text.lines().count() < 3 {
        warn!("OSMC CSV has fewer than 3 lines (header+units+data)");
        return Vec::new();
    }

    let mut reader = ReaderBuilder::new()
        .flexible(true)
        .trim(Trim::All)
        .from_reader(text.as_bytes());

    let columns = match reader.headers() {
        Ok(headers) => Columns::new(headers),
        Err(e) => {
            warn!(error = %e, "OSMC CSV header unreadable");
            return Vec::new();
        }
    };

    let mut stations = Vec::new();
    // First record after the header is the units row.
    for (i, record) in reader.records().enumerate().skip(1) {
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                debug!(row = i + 2, error = %e, "Skipping unreadable OSMC row");
                continue;
            }
        };
        match parse_row(&columns, &record) {
            Some(obs) => stations.push(obs),
            None => debug!(row = i + 2, "Skipping OSMC row"),
        }
    }

    info!(stations = stations.len(), "Parsed stations from OSMC CSV");
    stations
}

pub struct OsmcFeed<C> {
    client: C,
}

impl<C: HttpClient> OsmcFeed<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<C: HttpClient> Feed for OsmcFeed<C> {
    fn source(&self) -> Source {
        Source::Osmc
    }

    #[tracing::instrument(skip(self), fields(source = "osmc"))]
    async fn fetch(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Observation>, FeedError> {
        let url = build_url(since, Utc::now());
        info!(url = %url, "Fetching OSMC");
        let text = fetch_text(&self.client, &url).await?;
        debug!(bytes = text.len(), "OSMC body received, parsing");
        Ok(parse_osmc_csv(&text))
    }
}
