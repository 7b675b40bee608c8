//! Upstream observation feeds.
//!
//! Each feed fetches raw text over an [`HttpClient`](crate::fetch::HttpClient),
//! parses it into [`Observation`]s, and normalizes/validates every record
//! before handing the batch back. Parsers are plain functions over `&str` so
//! they can be driven from files as well.

pub mod ndbc;
pub mod osmc;
pub mod registry;

pub use ndbc::{NdbcFeed, parse_ndbc_latest_obs};
pub use osmc::{OsmcFeed, parse_osmc_csv};
pub use registry::StationRegistry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::FeedError;
use crate::model::{Observation, Source};

/// A pollable observation source.
#[async_trait]
pub trait Feed: Send + Sync {
    fn source(&self) -> Source;

    /// Fetches and parses one snapshot.
    ///
    /// `since` is the lower time bound for feeds that support one; feeds
    /// that always return their latest snapshot ignore it.
    async fn fetch(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Observation>, FeedError>;
}

/// Parses a numeric field, treating empty, `missing`, NaN and garbage as absent.
pub(crate) fn parse_lenient(val: &str, missing: &str) -> Option<f64> {
    let val = val.trim();
    if val.is_empty() || val.eq_ignore_ascii_case(missing) {
        return None;
    }
    val.parse::<f64>().ok().filter(|v| !v.is_nan())
}

/// Normalizes `obs` and keeps it only if it passes the validity gate.
pub(crate) fn validated(mut obs: Observation) -> Option<Observation> {
    obs.normalize();
    if obs.is_valid() {
        Some(obs)
    } else {
        debug!(
            source = %obs.source,
            platform = %obs.platform_code,
            lat = obs.lat,
            lon = obs.lon,
            "Dropping invalid observation"
        );
        None
    }
}
