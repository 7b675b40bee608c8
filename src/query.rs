//! Query parameters as received from the API layer, and the response body.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::QueryError;
use crate::model::{PlatformType, PublicObservation};
use crate::store::BoundingBox;

pub const DEFAULT_MAX_AGE_HOURS: f64 = 6.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryParams {
    pub lat_min: f64,
    pub lat_max: f64,
    pub lon_min: f64,
    pub lon_max: f64,
    /// `"<number>(h|m)"`, e.g. `6h` or `30m`.
    pub max_age: String,
    /// `all` or a comma-separated list of platform types.
    pub types: String,
}

impl Default for QueryParams {
    fn default() -> Self {
        let bbox = BoundingBox::default();
        Self {
            lat_min: bbox.lat_min,
            lat_max: bbox.lat_max,
            lon_min: bbox.lon_min,
            lon_max: bbox.lon_max,
            max_age: "6h".to_string(),
            types: "all".to_string(),
        }
    }
}

impl QueryParams {
    /// Rejects bbox corners outside the valid coordinate ranges.
    pub fn bbox(&self) -> Result<BoundingBox, QueryError> {
        check("lat_min", self.lat_min, -90.0, 90.0)?;
        check("lat_max", self.lat_max, -90.0, 90.0)?;
        check("lon_min", self.lon_min, -180.0, 180.0)?;
        check("lon_max", self.lon_max, -180.0, 180.0)?;
        Ok(BoundingBox {
            lat_min: self.lat_min,
            lat_max: self.lat_max,
            lon_min: self.lon_min,
            lon_max: self.lon_max,
        })
    }

    pub fn max_age_hours(&self) -> f64 {
        parse_max_age(&self.max_age)
    }

    pub fn type_filter(&self) -> Option<HashSet<PlatformType>> {
        parse_types(&self.types)
    }

    /// `lat_min,lat_max,lon_min,lon_max` to one decimal, as written to the request log.
    pub fn bbox_label(&self) -> String {
        format!(
            "{:.1},{:.1},{:.1},{:.1}",
            self.lat_min, self.lat_max, self.lon_min, self.lon_max
        )
    }
}

fn check(name: &'static str, value: f64, min: f64, max: f64) -> Result<(), QueryError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(QueryError::OutOfRange {
            name,
            value,
            min,
            max,
        })
    }
}

/// Parses `"<number>(h|m)"` into hours. Anything else gives the 6 hour default.
///
/// The number is digits with an optional fractional part; whitespace may
/// separate it from the unit. Case-insensitive.
pub fn parse_max_age(raw: &str) -> f64 {
    let raw = raw.trim().to_lowercase();
    let (number, per_hour) = if let Some(n) = raw.strip_suffix('h') {
        (n, 1.0)
    } else if let Some(n) = raw.strip_suffix('m') {
        (n, 60.0)
    } else {
        return DEFAULT_MAX_AGE_HOURS;
    };
    let number = number.trim_end();
    if !is_plain_decimal(number) {
        return DEFAULT_MAX_AGE_HOURS;
    }
    number
        .parse::<f64>()
        .map(|v| v / per_hour)
        .unwrap_or(DEFAULT_MAX_AGE_HOURS)
}

/// `\d+(\.\d+)?`
fn is_plain_decimal(s: &str) -> bool {
    let (int, frac) = match s.split_once('.') {
        Some((int, frac)) => (int, Some(frac)),
        None => (s, None),
    };
    let digits = |p: &str| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit());
    digits(int) && frac.is_none_or(digits)
}

/// `None` means no filter: `all`, or a list with no non-empty tokens.
///
/// Unknown tokens are dropped, so a list of only unknown types matches nothing.
pub fn parse_types(raw: &str) -> Option<HashSet<PlatformType>> {
    if raw.trim().eq_ignore_ascii_case("all") {
        return None;
    }
    let tokens: Vec<&str> = raw.split(',').map(str::trim).filter(|t| !t.is_empty()).collect();
    if tokens.is_empty() {
        return None;
    }
    Some(tokens.into_iter().filter_map(|t| t.parse().ok()).collect())
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub generated: String,
    pub count: usize,
    pub stations: Vec<PublicObservation>,
}

impl QueryResponse {
    pub fn new(generated: DateTime<Utc>, stations: Vec<PublicObservation>) -> Self {
        Self {
            generated: generated.format(crate::TIME_FORMAT).to_string(),
            count: stations.len(),
            stations,
        }
    }
}
