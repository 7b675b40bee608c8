//! Observation record shared by both feeds, plus the normalization pass and
//! the public (API-facing) representation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Normalized platform taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformType {
    Ship,
    Buoy,
    Drifter,
    Shore,
    Other,
}

impl PlatformType {
    pub const ALL: [PlatformType; 5] = [
        PlatformType::Ship,
        PlatformType::Buoy,
        PlatformType::Drifter,
        PlatformType::Shore,
        PlatformType::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformType::Ship => "ship",
            PlatformType::Buoy => "buoy",
            PlatformType::Drifter => "drifter",
            PlatformType::Shore => "shore",
            PlatformType::Other => "other",
        }
    }
}

impl fmt::Display for PlatformType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlatformType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PlatformType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown platform type '{s}'"))
    }
}

/// Which upstream feed an observation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Osmc,
    Ndbc,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Osmc => "osmc",
            Source::Ndbc => "ndbc",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "osmc" => Ok(Source::Osmc),
            "ndbc" => Ok(Source::Ndbc),
            other => Err(format!("unknown source '{other}'")),
        }
    }
}

/// A single observation from a ship, buoy, drifter or shore station.
///
/// Units are fixed SI/metric regardless of what the feed sent: m/s, hPa, °C,
/// metres. Feed-specific conversions happen in the parsers.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    /// WMO id, call sign, or a synthesized key for anonymous reports.
    pub platform_code: String,
    pub platform_type: PlatformType,
    pub lat: f64,
    pub lon: f64,
    pub time: DateTime<Utc>,
    pub country: Option<String>,

    pub wind_dir: Option<f64>,
    pub wind_spd: Option<f64>,
    pub gust: Option<f64>,

    pub pressure: Option<f64>,
    pub pressure_tendency: Option<f64>,

    pub air_temp: Option<f64>,
    pub sea_temp: Option<f64>,
    pub dewpoint: Option<f64>,

    pub wave_ht: Option<f64>,
    pub wave_period: Option<f64>,
    pub wave_avg_period: Option<f64>,
    pub wave_dir: Option<f64>,

    pub vis: Option<f64>,
    pub water_level: Option<f64>,
    pub clouds: Option<f64>,

    pub source: Source,
}

impl Observation {
    /// Creates an observation with every optional measurement absent.
    pub fn new(
        platform_code: impl Into<String>,
        platform_type: PlatformType,
        lat: f64,
        lon: f64,
        time: DateTime<Utc>,
        source: Source,
    ) -> Self {
        Self {
            platform_code: platform_code.into(),
            platform_type,
            lat,
            lon,
            time,
            country: None,
            wind_dir: None,
            wind_spd: None,
            gust: None,
            pressure: None,
            pressure_tendency: None,
            air_temp: None,
            sea_temp: None,
            dewpoint: None,
            wave_ht: None,
            wave_period: None,
            wave_avg_period: None,
            wave_dir: None,
            vis: None,
            water_level: None,
            clouds: None,
            source,
        }
    }

    /// Normalizes the record in place.
    ///
    /// Longitude is wrapped into [-180, 180) only when it lies outside
    /// [-180, 180], so in-range values come back bit-for-bit unchanged.
    /// Measurements outside physically plausible ranges are cleared rather
    /// than rejected.
    pub fn normalize(&mut self) {
        if !(-180.0..=180.0).contains(&self.lon) {
            self.lon = wrap_longitude(self.lon);
        }

        clear_unless(&mut self.wind_dir, |v| (0.0..=360.0).contains(&v));
        clear_unless(&mut self.wind_spd, |v| v >= 0.0);
        clear_unless(&mut self.gust, |v| v >= 0.0);
        clear_unless(&mut self.pressure, |v| (800.0..=1100.0).contains(&v));
        clear_unless(&mut self.air_temp, |v| (-90.0..=60.0).contains(&v));
        clear_unless(&mut self.sea_temp, |v| (-5.0..=40.0).contains(&v));
        clear_unless(&mut self.wave_ht, |v| v >= 0.0);
        clear_unless(&mut self.vis, |v| v >= 0.0);
    }

    /// Mandatory fields present and in range. Call after [`normalize`].
    ///
    /// Optional measurements never affect the verdict.
    ///
    /// [`normalize`]: Observation::normalize
    pub fn is_valid(&self) -> bool {
        !self.platform_code.is_empty()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }

    pub fn to_public(&self) -> PublicObservation {
        PublicObservation {
            id: self.platform_code.clone(),
            platform_type: self.platform_type,
            lat: round_to(self.lat, 4),
            lon: round_to(self.lon, 4),
            time: self.time.format(crate::TIME_FORMAT).to_string(),
            country: self.country.clone(),
            wind_dir: round2(self.wind_dir),
            wind_spd: round2(self.wind_spd),
            gust: round2(self.gust),
            pressure: round2(self.pressure),
            pressure_tendency: round2(self.pressure_tendency),
            air_temp: round2(self.air_temp),
            sea_temp: round2(self.sea_temp),
            dewpoint: round2(self.dewpoint),
            wave_ht: round2(self.wave_ht),
            wave_period: round2(self.wave_period),
            wave_avg_period: round2(self.wave_avg_period),
            wave_dir: round2(self.wave_dir),
            vis: round2(self.vis),
            water_level: round2(self.water_level),
            clouds: round2(self.clouds),
        }
    }
}

/// Maps any longitude into [-180, 180).
pub fn wrap_longitude(lon: f64) -> f64 {
    let wrapped = (lon + 180.0).rem_euclid(360.0) - 180.0;
    // rem_euclid rounds up to 360.0 for inputs just below -180.
    if wrapped >= 180.0 { -180.0 } else { wrapped }
}

fn clear_unless(field: &mut Option<f64>, keep: impl Fn(f64) -> bool) {
    if field.is_some_and(|v| !keep(v)) {
        *field = None;
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

fn round2(value: Option<f64>) -> Option<f64> {
    value.map(|v| round_to(v, 2))
}

/// API-facing record. SI/metric units; absent measurements are omitted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublicObservation {
    pub id: String,
    #[serde(rename = "type")]
    pub platform_type: PlatformType,
    pub lat: f64,
    pub lon: f64,
    pub time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wind_dir: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wind_spd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gust: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pressure: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pressure_tendency: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub air_temp: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sea_temp: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dewpoint: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wave_ht: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wave_period: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wave_avg_period: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wave_dir: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vis: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub water_level: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clouds: Option<f64>,
}
