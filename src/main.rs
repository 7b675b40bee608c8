//! CLI entry point for the marine observation ingest service.
//!
//! `serve` runs the polling scheduler until Ctrl-C; the other subcommands
//! parse a single snapshot or inspect the persisted settings and history.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use marine_obs::config::{
    AppConfig, GEOIP_TIMEOUT, HTTP_TIMEOUT, NDBC_ACTIVE_STATIONS_URL, NDBC_LATEST_OBS_URL, Settings,
    SettingsHandle, SettingsUpdate,
};
use marine_obs::feeds::{NdbcFeed, OsmcFeed, StationRegistry, osmc, parse_ndbc_latest_obs, parse_osmc_csv};
use marine_obs::fetch::{BasicClient, fetch_text};
use marine_obs::geoip::{GeoResolver, IpApiLookup};
use marine_obs::history::{FetchHistory, FetchStatus, RequestLog};
use marine_obs::model::Source;
use marine_obs::query::QueryResponse;
use marine_obs::scheduler::Scheduler;
use marine_obs::service::ObservationService;
use marine_obs::stats::RequestStats;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "marine_obs")]
#[command(about = "Ingests ship and buoy observations from OSMC and NDBC", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll both feeds on the configured schedule until Ctrl-C
    Serve,
    /// Parse one feed snapshot and write the public records as JSON
    Ingest {
        /// Feed format: osmc or ndbc
        #[arg(short, long)]
        source: Source,

        /// Path or URL to read; defaults to the live feed endpoint
        #[arg(value_name = "FILE_OR_URL")]
        input: Option<String>,

        /// NDBC station registry XML (path or URL); defaults to the live registry
        #[arg(long)]
        registry: Option<String>,

        /// JSON file to write; stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print the persisted settings, or update them (values are clamped)
    Settings {
        #[arg(long)]
        osmc_interval: Option<u64>,

        #[arg(long)]
        ndbc_interval: Option<u64>,

        #[arg(long)]
        max_age_hours: Option<u32>,
    },
    /// Print one page of past fetch events, newest first
    History {
        #[arg(long)]
        source: Option<Source>,

        #[arg(long, value_enum)]
        status: Option<StatusFilter>,

        #[arg(short, long, default_value_t = 1)]
        page: usize,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum StatusFilter {
    Ok,
    Error,
}

impl From<StatusFilter> for FetchStatus {
    fn from(filter: StatusFilter) -> Self {
        match filter {
            StatusFilter::Ok => FetchStatus::Ok,
            StatusFilter::Error => FetchStatus::Error,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = AppConfig::from_env();

    // Logging setup: colored stderr + JSON rolling log file
    let log_dir = config
        .log_file_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("logs"));
    let log_file_name = config
        .log_file_path
        .file_name()
        .unwrap_or(OsStr::new("marine_obs.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse().expect("valid directive")));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse().expect("valid directive")));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve => serve(&config).await?,
        Commands::Ingest {
            source,
            input,
            registry,
            output,
        } => ingest(source, input, registry, output).await?,
        Commands::Settings {
            osmc_interval,
            ndbc_interval,
            max_age_hours,
        } => {
            let handle = SettingsHandle::persistent(&config.settings_file);
            let update = SettingsUpdate {
                osmc_fetch_interval: osmc_interval,
                ndbc_fetch_interval: ndbc_interval,
                max_obs_age_hours: max_age_hours,
            };
            let settings: Settings = if update.is_empty() {
                handle.get()
            } else {
                handle.update(|s| update.apply(s))?
            };
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
        Commands::History {
            source,
            status,
            page,
        } => {
            let history = FetchHistory::new(&config.fetch_history_file);
            let page = history.load_page(page, source, status.map(FetchStatus::from));
            println!("{}", serde_json::to_string_pretty(&page)?);
        }
    }

    Ok(())
}

/// Reads a local file or fetches a URL as text.
#[tracing::instrument(skip(client))]
async fn read_input(client: &BasicClient, location: &str) -> Result<String> {
    if location.starts_with("http") {
        Ok(fetch_text(client, location).await?)
    } else {
        std::fs::read_to_string(location).with_context(|| format!("Failed to read {location}"))
    }
}

async fn ingest(
    source: Source,
    input: Option<String>,
    registry: Option<String>,
    output: Option<PathBuf>,
) -> Result<()> {
    let client = BasicClient::new(HTTP_TIMEOUT)?;

    let records = match source {
        Source::Osmc => {
            let location = input.unwrap_or_else(|| osmc::build_url(None, Utc::now()));
            parse_osmc_csv(&read_input(&client, &location).await?)
        }
        Source::Ndbc => {
            let registry_location = registry.unwrap_or_else(|| NDBC_ACTIVE_STATIONS_URL.to_string());
            let registry = match read_input(&client, &registry_location).await {
                Ok(xml) => StationRegistry::from_xml(&xml)?,
                Err(e) => {
                    warn!(error = %e, "Station registry unavailable, defaulting types to buoy");
                    StationRegistry::default()
                }
            };
            let location = input.unwrap_or_else(|| NDBC_LATEST_OBS_URL.to_string());
            parse_ndbc_latest_obs(&read_input(&client, &location).await?, &registry)
        }
    };

    let response = QueryResponse::new(Utc::now(), records.iter().map(|obs| obs.to_public()).collect());
    let json = serde_json::to_string_pretty(&response)?;
    match output {
        Some(path) => {
            std::fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
            info!(path = %path.display(), stations = response.count, "Wrote observations");
        }
        None => println!("{json}"),
    }
    Ok(())
}

#[tracing::instrument(skip_all)]
async fn serve(config: &AppConfig) -> Result<()> {
    let client = BasicClient::new(HTTP_TIMEOUT)?;
    let geo_client = BasicClient::new(GEOIP_TIMEOUT)?;

    let settings = SettingsHandle::persistent(&config.settings_file);

    let ndbc = Arc::new(NdbcFeed::new(client.clone()));
    match ndbc.load_registry().await {
        Ok(count) => info!(stations = count, "NDBC registry loaded"),
        Err(e) => error!(error = %e, "Failed to load NDBC station registry"),
    }
    let osmc = Arc::new(OsmcFeed::new(client));

    let geo = GeoResolver::new(Arc::new(RequestStats::new()), Arc::new(IpApiLookup::new(geo_client)));
    let service = Arc::new(
        ObservationService::new(settings, osmc, ndbc, geo).with_event_logs(
            FetchHistory::new(&config.fetch_history_file),
            RequestLog::new(&config.request_log_file),
        ),
    );
    service.seed_request_stats();

    let ctx = CancellationToken::new();
    let scheduler = Scheduler::new(Arc::clone(&service));
    let scheduler_task = tokio::spawn({
        let ctx = ctx.clone();
        async move { scheduler.run(ctx).await }
    });

    let status_task = tokio::spawn({
        let ctx = ctx.clone();
        let service = Arc::clone(&service);
        let interval = config.status_log_interval.max(Duration::from_secs(1));
        async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => break,
                    _ = ticker.tick() => {
                        let status = service.status();
                        info!(
                            uptime = %status.uptime,
                            total_stations = status.total_stations,
                            oldest = ?status.oldest_observation,
                            sources = ?status.sources,
                            "Status"
                        );
                    }
                }
            }
        }
    });

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    info!("Shutdown requested");
    ctx.cancel();

    if let Err(e) = scheduler_task.await {
        error!(error = %e, "Scheduler task panicked");
    }
    let _ = status_task.await;
    info!("Stopped");
    Ok(())
}
