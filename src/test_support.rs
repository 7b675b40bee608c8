//! Stub feeds, lookups and HTTP transports shared by the unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::error::FeedError;
use crate::feeds::Feed;
use crate::fetch::HttpClient;
use crate::geoip::{CountryLookup, GeoResolver};
use crate::model::{Observation, PlatformType, Source};
use crate::stats::RequestStats;

pub struct StubFeed {
    source: Source,
    records: Vec<Observation>,
    pub fail: AtomicBool,
    hang: bool,
    /// `since` argument of every call, in order.
    pub calls: Mutex<Vec<Option<DateTime<Utc>>>>,
}

impl StubFeed {
    pub fn new(source: Source, records: Vec<Observation>) -> Arc<Self> {
        Arc::new(Self {
            source,
            records,
            fail: AtomicBool::new(false),
            hang: false,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn failing(source: Source) -> Arc<Self> {
        let feed = Self::new(source, Vec::new());
        feed.fail.store(true, Ordering::SeqCst);
        feed
    }

    /// A feed whose fetch never completes.
    pub fn hanging(source: Source) -> Arc<Self> {
        Arc::new(Self {
            source,
            records: Vec::new(),
            fail: AtomicBool::new(false),
            hang: true,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Feed for StubFeed {
    fn source(&self) -> Source {
        self.source
    }

    async fn fetch(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Observation>, FeedError> {
        self.calls.lock().unwrap().push(since);
        if self.hang {
            std::future::pending::<()>().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(FeedError::Status {
                url: format!("https://stub/{}", self.source),
                status: 503,
            });
        }
        Ok(self.records.clone())
    }
}

pub struct StubLookup(pub &'static str);

#[async_trait]
impl CountryLookup for StubLookup {
    async fn lookup(&self, _ip: &str) -> String {
        self.0.to_string()
    }
}

pub fn resolver(country: &'static str) -> GeoResolver {
    GeoResolver::new(Arc::new(RequestStats::new()), Arc::new(StubLookup(country)))
}

pub fn observation(code: &str, platform_type: PlatformType, lat: f64, lon: f64, source: Source) -> Observation {
    Observation::new(code, platform_type, lat, lon, Utc::now(), source)
}

/// Sends every request to `base`, keeping the original path and query.
pub struct LocalClient {
    inner: reqwest::Client,
    base: reqwest::Url,
}

impl LocalClient {
    pub fn new(base: &str) -> Self {
        Self {
            inner: reqwest::Client::new(),
            base: reqwest::Url::parse(base).unwrap(),
        }
    }

    /// Points at a closed local port, so every request fails to connect.
    pub fn refusing() -> Self {
        Self::new("http://127.0.0.1:9/")
    }
}

#[async_trait]
impl HttpClient for LocalClient {
    async fn execute(&self, mut req: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        let mut url = self.base.clone();
        url.set_path(req.url().path());
        url.set_query(req.url().query());
        *req.url_mut() = url;
        self.inner.execute(req).await
    }
}

/// Answers a single HTTP request with `status_line` and `body`; returns the base URL.
pub async fn serve_once(status_line: &'static str, body: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
        }
        let response = format!(
            "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        socket.write_all(response.as_bytes()).await.unwrap();
        socket.shutdown().await.unwrap();
    });
    format!("http://{addr}/")
}
