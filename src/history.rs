//! Append-only CSV event logs: one row per fetch attempt, one per API request.
//!
//! Files are created with a header row on first write. Pages are read back
//! newest first.

use anyhow::{Context, Result};
use csv::{ReaderBuilder, WriterBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, warn};

use crate::model::Source;

pub const PAGE_SIZE: usize = 15;
/// Request log row cap; the oldest rows are dropped past it.
pub const MAX_REQUEST_ENTRIES: usize = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchEvent {
    pub time: String,
    pub source: Source,
    pub status: FetchStatus,
    /// Records parsed by the fetch; 0 on error.
    pub stations: usize,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEvent {
    pub time: String,
    /// Country code, `Local`, or empty while the lookup is pending.
    pub country: String,
    pub bbox: String,
    pub max_age: String,
    pub types: String,
    pub count: usize,
    pub duration_ms: u64,
    /// HTTP-style status code.
    pub status: u16,
    pub error: String,
}

impl RequestEvent {
    pub fn is_ok(&self) -> bool {
        self.status < 400
    }
}

/// One page of events, newest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub events: Vec<T>,
    /// Events matching the filter across all pages.
    pub total: usize,
    pub page: usize,
}

impl<T> Page<T> {
    pub fn pages(&self) -> usize {
        self.total.div_ceil(PAGE_SIZE).max(1)
    }
}

/// 1-based; page 0 reads as page 1.
fn paginate<T>(mut events: Vec<T>, page: usize) -> Page<T> {
    events.reverse();
    let page = page.max(1);
    let total = events.len();
    let events = events
        .into_iter()
        .skip((page - 1) * PAGE_SIZE)
        .take(PAGE_SIZE)
        .collect();
    Page {
        events,
        total,
        page,
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    Ok(())
}

/// Appends `record` as a CSV row, writing the header only when the file is new.
fn append_record<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    ensure_parent(path)?;
    let file_exists = path.exists();
    debug!(path = %path.display(), file_exists, "Appending CSV record");

    let file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let mut writer = WriterBuilder::new()
        .has_headers(!file_exists)
        .from_writer(file);
    writer.serialize(record)?;
    writer.flush()?;
    Ok(())
}

/// Reads every well-formed row. A missing or unreadable file reads as empty.
fn read_records<T: DeserializeOwned>(path: &Path) -> Vec<T> {
    if !path.exists() {
        return Vec::new();
    }
    let mut reader = match ReaderBuilder::new().flexible(true).from_path(path) {
        Ok(r) => r,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to open event log");
            return Vec::new();
        }
    };
    reader
        .deserialize()
        .filter_map(|row| match row {
            Ok(record) => Some(record),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Skipping malformed event row");
                None
            }
        })
        .collect()
}

#[derive(Debug)]
pub struct FetchHistory {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FetchHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, event: &FetchEvent) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        append_record(&self.path, event)
    }

    /// Filters are optional; `None` matches everything.
    pub fn load_page(
        &self,
        page: usize,
        source: Option<Source>,
        status: Option<FetchStatus>,
    ) -> Page<FetchEvent> {
        let events = read_records::<FetchEvent>(&self.path)
            .into_iter()
            .filter(|e| source.is_none_or(|s| e.source == s))
            .filter(|e| status.is_none_or(|s| e.status == s))
            .collect();
        paginate(events, page)
    }
}

#[derive(Debug)]
pub struct RequestLog {
    path: PathBuf,
    max_entries: usize,
    write_lock: Mutex<()>,
}

impl RequestLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_capacity(path, MAX_REQUEST_ENTRIES)
    }

    pub fn with_capacity(path: impl Into<PathBuf>, max_entries: usize) -> Self {
        Self {
            path: path.into(),
            max_entries: max_entries.max(1),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `event`. Once the log holds `max_entries` rows it is rewritten
    /// with the newest `max_entries - 1` rows plus `event`.
    pub fn record(&self, event: &RequestEvent) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let existing = read_records::<RequestEvent>(&self.path);
        if existing.len() < self.max_entries {
            return append_record(&self.path, event);
        }

        let keep = &existing[existing.len() - (self.max_entries - 1)..];
        ensure_parent(&self.path)?;
        let mut writer = WriterBuilder::new()
            .from_path(&self.path)
            .with_context(|| format!("Failed to rewrite {}", self.path.display()))?;
        for row in keep.iter().chain(std::iter::once(event)) {
            writer.serialize(row)?;
        }
        writer.flush()?;
        info!(path = %self.path.display(), kept = keep.len() + 1, "Rotated request log");
        Ok(())
    }

    /// `ok` keeps statuses below 400, `error` the rest; `None` keeps all.
    pub fn load_page(&self, page: usize, ok: Option<bool>) -> Page<RequestEvent> {
        let events = read_records::<RequestEvent>(&self.path)
            .into_iter()
            .filter(|e| ok.is_none_or(|want| e.is_ok() == want))
            .collect();
        paginate(events, page)
    }

    /// Total rows and per-country counts, skipping rows with no country.
    pub fn load_totals(&self) -> (u64, HashMap<String, u64>) {
        let events = read_records::<RequestEvent>(&self.path);
        let mut by_country: HashMap<String, u64> = HashMap::new();
        for event in &events {
            if !event.country.is_empty() {
                *by_country.entry(event.country.clone()).or_default() += 1;
            }
        }
        (events.len() as u64, by_country)
    }
}
