//! Static feed configuration, process paths, and live-mutable settings.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{error, info};

pub const OSMC_BASE_URL: &str = "https://osmc.noaa.gov/erddap/tabledap/OSMC_flattened.csv";
pub const OSMC_FIELDS: &str = "platform_code,platform_type,country,latitude,longitude,time,\
sst,atmp,slp,windspd,winddir,wvht,waterlevel,clouds,dewpoint";
/// Lower time bound of the first OSMC request.
pub const OSMC_LOOKBACK_HOURS: i64 = 6;
/// Overlap subtracted from the fetch start when advancing the OSMC watermark.
pub const OSMC_WATERMARK_OVERLAP_MINUTES: i64 = 5;

pub const NDBC_LATEST_OBS_URL: &str = "https://www.ndbc.noaa.gov/data/latest_obs/latest_obs.txt";
pub const NDBC_ACTIVE_STATIONS_URL: &str = "https://www.ndbc.noaa.gov/activestations.xml";

pub const GEOIP_URL: &str = "http://ip-api.com/json";

pub const PURGE_INTERVAL: Duration = Duration::from_secs(15 * 60);
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
pub const GEOIP_TIMEOUT: Duration = Duration::from_secs(5);

pub const FETCH_INTERVAL_RANGE: (u64, u64) = (60, 86_400);
pub const MAX_AGE_HOURS_RANGE: (u32, u32) = (1, 168);

/// File locations and daemon knobs, read from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub settings_file: PathBuf,
    pub fetch_history_file: PathBuf,
    pub request_log_file: PathBuf,
    pub log_file_path: PathBuf,
    pub status_log_interval: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            settings_file: PathBuf::from("data/settings.json"),
            fetch_history_file: PathBuf::from("data/fetch_history.csv"),
            request_log_file: PathBuf::from("data/request_log.csv"),
            log_file_path: PathBuf::from("logs/marine_obs.log"),
            status_log_interval: Duration::from_secs(300),
        }
    }
}

impl AppConfig {
    /// Reads overrides from the process environment. Call after `dotenvy::dotenv()`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let path = |key: &str, default: PathBuf| lookup(key).map(PathBuf::from).unwrap_or(default);
        Self {
            settings_file: path("SETTINGS_FILE", defaults.settings_file),
            fetch_history_file: path("FETCH_HISTORY_FILE", defaults.fetch_history_file),
            request_log_file: path("REQUEST_LOG_FILE", defaults.request_log_file),
            log_file_path: path("LOG_FILE_PATH", defaults.log_file_path),
            status_log_interval: lookup("STATUS_LOG_INTERVAL_SECS")
                .and_then(|v| v.trim().parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.status_log_interval),
        }
    }
}

/// Operator-tunable settings. Persisted as JSON; every write path clamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub osmc_fetch_interval: u64,
    pub ndbc_fetch_interval: u64,
    pub max_obs_age_hours: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            osmc_fetch_interval: 900,
            ndbc_fetch_interval: 300,
            max_obs_age_hours: 12,
        }
    }
}

impl Settings {
    pub fn clamped(self) -> Self {
        let (lo, hi) = FETCH_INTERVAL_RANGE;
        let (age_lo, age_hi) = MAX_AGE_HOURS_RANGE;
        Self {
            osmc_fetch_interval: self.osmc_fetch_interval.clamp(lo, hi),
            ndbc_fetch_interval: self.ndbc_fetch_interval.clamp(lo, hi),
            max_obs_age_hours: self.max_obs_age_hours.clamp(age_lo, age_hi),
        }
    }

    pub fn osmc_interval(&self) -> Duration {
        Duration::from_secs(self.osmc_fetch_interval)
    }

    pub fn ndbc_interval(&self) -> Duration {
        Duration::from_secs(self.ndbc_fetch_interval)
    }

    /// Loads settings from `path`.
    ///
    /// A missing file yields defaults; missing keys keep their defaults. An
    /// unreadable or malformed file is logged and also yields defaults.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            info!(path = %path.display(), "No settings file, using defaults");
            return Self::default();
        }
        match Self::read(path) {
            Ok(settings) => {
                info!(path = %path.display(), ?settings, "Loaded settings");
                settings
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to load settings, using defaults");
                Self::default()
            }
        }
    }

    fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {}", path.display()))?;
        let settings: Settings =
            serde_json::from_str(&content).context("Failed to parse settings JSON")?;
        Ok(settings.clamped())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write settings file: {}", path.display()))?;
        info!(path = %path.display(), "Saved settings");
        Ok(())
    }
}

/// Partial settings change from an admin form or the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettingsUpdate {
    pub osmc_fetch_interval: Option<u64>,
    pub ndbc_fetch_interval: Option<u64>,
    pub max_obs_age_hours: Option<u32>,
}

impl SettingsUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply(&self, settings: &mut Settings) {
        if let Some(v) = self.osmc_fetch_interval {
            settings.osmc_fetch_interval = v;
        }
        if let Some(v) = self.ndbc_fetch_interval {
            settings.ndbc_fetch_interval = v;
        }
        if let Some(v) = self.max_obs_age_hours {
            settings.max_obs_age_hours = v;
        }
    }
}

/// Shared handle to the live settings. Written by admin operations, read by
/// the scheduler on every dispatch.
#[derive(Debug, Clone, Default)]
pub struct SettingsHandle {
    inner: Arc<RwLock<Settings>>,
    path: Option<PathBuf>,
}

impl SettingsHandle {
    /// In-memory settings that are never persisted.
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings.clamped())),
            path: None,
        }
    }

    /// Settings loaded from, and saved back to, `path`.
    pub fn persistent(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            inner: Arc::new(RwLock::new(Settings::load(&path))),
            path: Some(path),
        }
    }

    pub fn get(&self) -> Settings {
        *self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies `update`, clamps the result, and persists it when backed by a file.
    pub fn update(&self, update: impl FnOnce(&mut Settings)) -> Result<Settings> {
        let updated = {
            let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            let mut next = *guard;
            update(&mut next);
            *guard = next.clamped();
            *guard
        };
        if let Some(path) = &self.path {
            updated.save(path)?;
        }
        Ok(updated)
    }
}
