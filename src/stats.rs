//! API request counters with per-country attribution.
//!
//! Hits from an IP whose country is not yet known are buffered per IP and
//! moved into the country bucket in one step when the lookup reports back.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Mutex, MutexGuard, PoisonError};

pub const LOCAL: &str = "Local";
pub const PENDING: &str = "Pending";
pub const UNKNOWN: &str = "Unknown";
const TOP_COUNTRIES: usize = 20;

#[derive(Debug, Default)]
struct Counters {
    total: u64,
    by_country: HashMap<String, u64>,
    /// Hits from IPs whose lookup has not finished.
    buffered: HashMap<String, u64>,
    resolved: HashMap<String, String>,
    in_flight: HashSet<String>,
}

#[derive(Debug, Default)]
pub struct RequestStats {
    inner: Mutex<Counters>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    /// Top countries by hit count, ties broken by name.
    pub by_country: Vec<(String, u64)>,
}

impl StatsSnapshot {
    pub fn count_for(&self, country: &str) -> u64 {
        self.by_country
            .iter()
            .find(|(name, _)| name == country)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }
}

impl RequestStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Counts one request from `ip`.
    ///
    /// Returns `true` when the caller must start a country lookup for `ip`.
    /// At most one lookup per IP is outstanding at a time.
    pub fn record_hit(&self, ip: &str) -> bool {
        let mut c = self.counters();
        c.total += 1;

        if is_local(ip) {
            *c.by_country.entry(LOCAL.to_string()).or_default() += 1;
            return false;
        }
        if let Some(country) = c.resolved.get(ip).cloned() {
            *c.by_country.entry(country).or_default() += 1;
            return false;
        }
        *c.buffered.entry(ip.to_string()).or_default() += 1;
        c.in_flight.insert(ip.to_string())
    }

    /// Reports the lookup result for `ip`.
    ///
    /// A result for an IP that is already resolved is discarded.
    pub fn resolve(&self, ip: &str, country: &str) {
        let mut c = self.counters();
        c.in_flight.remove(ip);
        if c.resolved.contains_key(ip) {
            return;
        }
        c.resolved.insert(ip.to_string(), country.to_string());
        if let Some(hits) = c.buffered.remove(ip).filter(|&n| n > 0) {
            *c.by_country.entry(country.to_string()).or_default() += hits;
        }
    }

    /// Cached country for `ip`, `Local` for local addresses, `None` while pending.
    pub fn country_of(&self, ip: &str) -> Option<String> {
        if is_local(ip) {
            return Some(LOCAL.to_string());
        }
        self.counters().resolved.get(ip).cloned()
    }

    /// Adds historical totals, e.g. replayed from the request log at startup.
    pub fn seed(&self, total: u64, by_country: impl IntoIterator<Item = (String, u64)>) {
        let mut c = self.counters();
        c.total += total;
        for (country, n) in by_country {
            *c.by_country.entry(country).or_default() += n;
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let c = self.counters();
        let mut combined = c.by_country.clone();
        let pending: u64 = c.buffered.values().sum();
        if pending > 0 {
            *combined.entry(PENDING.to_string()).or_default() += pending;
        }

        let mut by_country: Vec<(String, u64)> = combined.into_iter().collect();
        by_country.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        by_country.truncate(TOP_COUNTRIES);

        StatsSnapshot {
            total_requests: c.total,
            by_country,
        }
    }
}

/// Loopback, private, link-local and similar non-routable addresses.
/// Strings that do not parse as an IP count as local.
pub fn is_local(ip: &str) -> bool {
    match ip.trim().parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => is_local_v4(v4),
        Ok(IpAddr::V6(v6)) => is_local_v6(v6),
        Err(_) => true,
    }
}

fn is_local_v4(ip: Ipv4Addr) -> bool {
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_documentation()
}

fn is_local_v6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_local_v4(v4);
    }
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        // fc00::/7
        || (first & 0xfe00) == 0xfc00
        // fe80::/10
        || (first & 0xffc0) == 0xfe80
}
