//! Fire-and-forget country lookups for request attribution.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::GEOIP_URL;
use crate::fetch::{HttpClient, fetch_response};
use crate::stats::{RequestStats, UNKNOWN};

/// Resolves an IP to a country code. Never fails: unresolvable IPs map to `Unknown`.
#[async_trait]
pub trait CountryLookup: Send + Sync {
    async fn lookup(&self, ip: &str) -> String;
}

#[derive(Debug, Deserialize)]
struct IpApiReply {
    status: String,
    #[serde(rename = "countryCode", default)]
    country_code: String,
}

/// ip-api.com lookup. Build the client with the short GeoIP timeout.
pub struct IpApiLookup<C> {
    client: C,
}

impl<C: HttpClient> IpApiLookup<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }

    async fn try_lookup(&self, ip: &str) -> Result<String, String> {
        let url = format!("{GEOIP_URL}/{ip}?fields=status,countryCode");
        let resp = fetch_response(&self.client, &url)
            .await
            .map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("status {}", resp.status()));
        }
        let reply: IpApiReply = resp.json().await.map_err(|e| e.to_string())?;
        if reply.status != "success" || reply.country_code.is_empty() {
            return Err(format!("lookup status '{}'", reply.status));
        }
        Ok(reply.country_code)
    }
}

#[async_trait]
impl<C: HttpClient> CountryLookup for IpApiLookup<C> {
    async fn lookup(&self, ip: &str) -> String {
        match self.try_lookup(ip).await {
            Ok(country) => {
                debug!(ip, country = %country, "GeoIP resolved");
                country
            }
            Err(e) => {
                warn!(ip, error = %e, "GeoIP lookup failed");
                UNKNOWN.to_string()
            }
        }
    }
}

/// Records hits and launches at most one lookup per unresolved IP.
#[derive(Clone)]
pub struct GeoResolver {
    stats: Arc<RequestStats>,
    lookup: Arc<dyn CountryLookup>,
}

impl GeoResolver {
    pub fn new(stats: Arc<RequestStats>, lookup: Arc<dyn CountryLookup>) -> Self {
        Self { stats, lookup }
    }

    pub fn stats(&self) -> &Arc<RequestStats> {
        &self.stats
    }

    /// Counts a hit from `ip`. Returns the spawned lookup task, if one was started.
    ///
    /// Must be called from within a tokio runtime. The caller never has to
    /// await the handle.
    pub fn observe(&self, ip: &str) -> Option<JoinHandle<()>> {
        if !self.stats.record_hit(ip) {
            return None;
        }
        let stats = Arc::clone(&self.stats);
        let lookup = Arc::clone(&self.lookup);
        let ip = ip.to_string();
        Some(tokio::spawn(async move {
            let country = lookup.lookup(&ip).await;
            stats.resolve(&ip, &country);
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{LocalClient, serve_once};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedLookup {
        country: &'static str,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CountryLookup for FixedLookup {
        async fn lookup(&self, _ip: &str) -> String {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.country.to_string()
        }
    }

    fn resolver(country: &'static str) -> (GeoResolver, Arc<FixedLookup>) {
        let lookup = Arc::new(FixedLookup {
            country,
            calls: AtomicUsize::new(0),
        });
        let resolver = GeoResolver::new(Arc::new(RequestStats::new()), lookup.clone());
        (resolver, lookup)
    }

    #[tokio::test]
    async fn test_concurrent_hits_share_one_lookup() {
        let (resolver, lookup) = resolver("DE");

        let first = resolver.observe("203.0.114.7");
        let second = resolver.observe("203.0.114.7");
        assert!(first.is_some());
        assert!(second.is_none());

        first.unwrap().await.unwrap();
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);

        let snap = resolver.stats().snapshot();
        assert_eq!(snap.count_for("DE"), 2);
        assert_eq!(snap.count_for(crate::stats::PENDING), 0);
    }

    #[tokio::test]
    async fn test_local_ip_skips_lookup() {
        let (resolver, lookup) = resolver("DE");
        assert!(resolver.observe("127.0.0.1").is_none());
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 0);
        assert_eq!(resolver.stats().snapshot().count_for(crate::stats::LOCAL), 1);
    }

    #[tokio::test]
    async fn test_lookup_success() {
        let base = serve_once("200 OK", r#"{"status":"success","countryCode":"NO"}"#).await;
        let lookup = IpApiLookup::new(LocalClient::new(&base));
        assert_eq!(lookup.lookup("203.0.114.7").await, "NO");
    }

    #[tokio::test]
    async fn test_failed_lookups_resolve_to_unknown() {
        let lookup = IpApiLookup::new(LocalClient::refusing());
        assert_eq!(lookup.lookup("203.0.114.7").await, UNKNOWN);

        let base = serve_once("503 Service Unavailable", "{}").await;
        let lookup = IpApiLookup::new(LocalClient::new(&base));
        assert_eq!(lookup.lookup("203.0.114.7").await, UNKNOWN);

        let base = serve_once("200 OK", r#"{"status":"fail","message":"reserved range"}"#).await;
        let lookup = IpApiLookup::new(LocalClient::new(&base));
        assert_eq!(lookup.lookup("203.0.114.7").await, UNKNOWN);

        let base = serve_once("200 OK", "not json").await;
        let lookup = IpApiLookup::new(LocalClient::new(&base));
        assert_eq!(lookup.lookup("203.0.114.7").await, UNKNOWN);
    }

    #[tokio::test]
    async fn test_failed_lookup_moves_buffered_hit_to_unknown() {
        let resolver = GeoResolver::new(
            Arc::new(RequestStats::new()),
            Arc::new(IpApiLookup::new(LocalClient::refusing())),
        );
        resolver.observe("203.0.114.7").unwrap().await.unwrap();

        let snap = resolver.stats().snapshot();
        assert_eq!(snap.total_requests, 1);
        assert_eq!(snap.count_for(UNKNOWN), 1);
        assert_eq!(snap.count_for(crate::stats::PENDING), 0);
    }

    #[test]
    fn test_reply_parsing() {
        let ok: IpApiReply = serde_json::from_str(r#"{"status":"success","countryCode":"NO"}"#).unwrap();
        assert_eq!(ok.country_code, "NO");
        let failed: IpApiReply = serde_json::from_str(r#"{"status":"fail"}"#).unwrap();
        assert_eq!(failed.status, "fail");
        assert!(failed.country_code.is_empty());
    }
}
