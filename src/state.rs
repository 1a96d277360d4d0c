//! Application state
//!
//! Holds all shared components and state

use crate::detection_dispatch::{DetectionDispatch, DispatchConfig};
use crate::detector::Detector;
use crate::error::{Error, Result};
use crate::quality_tier::Tier;
use crate::realtime_gateway::RealtimeGateway;
use crate::snapshot_service::{SnapshotConfig, SnapshotService};
use crate::source_registry::SourceRegistry;
use crate::stream_supervisor::{RestartPolicy, StreamSupervisor, SupervisorConfig};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    /// JSON file with `{ "sources": [...] }`
    pub sources_file: PathBuf,
    /// Root of the HLS output tree, served at `/live`
    pub hls_dir: PathBuf,
    /// Snapshot cache, served at `/snapshots`
    pub snapshot_dir: PathBuf,
    pub ffmpeg_bin: PathBuf,
    /// Detection service; unset disables detection dispatch
    pub detector_url: Option<String>,
    pub max_stream_processes: usize,
    pub output_quota_bytes: Option<u64>,
    pub startup_timeout: Duration,
    pub liveness_timeout: Duration,
    pub stop_grace: Duration,
    pub restart_enabled: bool,
    pub max_restarts: u32,
    pub restart_backoff: Duration,
    pub restart_backoff_max: Duration,
    pub hls_segment_sec: u32,
    pub hls_window: u32,
    pub detection_interval: Duration,
    pub detection_timeout: Duration,
    pub detection_queue_capacity: usize,
    pub snapshot_timeout: Duration,
    /// `source:tier` pairs kept alive without viewers
    pub pinned_streams: Vec<(String, Tier)>,
    /// Optional frontend bundle
    pub static_dir: Option<PathBuf>,
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{} has invalid value {:?}", key, raw))),
        Err(_) => Ok(default),
    }
}

fn env_path(key: &str, default: &str) -> PathBuf {
    std::env::var(key)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

/// Megabytes to bytes; values that do not fit in a u64 are rejected
fn parse_quota_mb(raw: &str) -> Result<u64> {
    raw.trim()
        .parse::<u64>()
        .ok()
        .and_then(|mb| mb.checked_mul(1024 * 1024))
        .ok_or_else(|| Error::Config(format!("HLS_QUOTA_MB has invalid value {:?}", raw)))
}

/// Parse `cam1:hd, cam2:preview`
pub fn parse_pinned(raw: &str) -> Result<Vec<(String, Tier)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (source_id, tier) = entry.split_once(':').ok_or_else(|| {
                Error::Config(format!("PINNED_STREAMS entry {:?} is not source:tier", entry))
            })?;
            Ok((source_id.trim().to_string(), tier.parse()?))
        })
        .collect()
}

impl AppConfig {
    /// Read configuration from the environment; every field has a default
    pub fn from_env() -> Result<Self> {
        let supervisor = SupervisorConfig::default();
        let dispatch = DispatchConfig::default();

        Ok(Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_or("PORT", 8080)?,
            sources_file: env_path("SOURCES_FILE", "/etc/livecam/sources.json"),
            hls_dir: env_path("HLS_DIR", "/var/lib/livecam/hls"),
            snapshot_dir: env_path("SNAPSHOT_DIR", "/var/lib/livecam/snapshots"),
            ffmpeg_bin: env_path("FFMPEG_BIN", "ffmpeg"),
            detector_url: std::env::var("DETECTOR_URL")
                .ok()
                .filter(|u| !u.trim().is_empty()),
            max_stream_processes: env_or("MAX_STREAM_PROCESSES", supervisor.max_processes)?,
            output_quota_bytes: std::env::var("HLS_QUOTA_MB")
                .ok()
                .map(|raw| parse_quota_mb(&raw))
                .transpose()?,
            startup_timeout: Duration::from_secs(env_or(
                "STARTUP_TIMEOUT_SEC",
                supervisor.startup_timeout.as_secs(),
            )?),
            liveness_timeout: Duration::from_secs(env_or(
                "LIVENESS_TIMEOUT_SEC",
                supervisor.liveness_timeout.as_secs(),
            )?),
            stop_grace: Duration::from_secs(env_or(
                "STOP_GRACE_SEC",
                supervisor.stop_grace.as_secs(),
            )?),
            restart_enabled: env_or("RESTART_ENABLED", supervisor.restart.enabled)?,
            max_restarts: env_or("MAX_RESTARTS", supervisor.restart.max_attempts)?,
            restart_backoff: Duration::from_millis(env_or(
                "RESTART_BACKOFF_MS",
                supervisor.restart.base_backoff.as_millis() as u64,
            )?),
            restart_backoff_max: Duration::from_millis(env_or(
                "RESTART_BACKOFF_MAX_MS",
                supervisor.restart.max_backoff.as_millis() as u64,
            )?),
            hls_segment_sec: env_or("HLS_SEGMENT_SEC", supervisor.segment_seconds)?,
            hls_window: env_or("HLS_WINDOW", supervisor.segment_window)?,
            detection_interval: Duration::from_secs(env_or(
                "DETECTION_INTERVAL_SEC",
                dispatch.interval.as_secs(),
            )?),
            detection_timeout: Duration::from_secs(env_or(
                "DETECTION_TIMEOUT_SEC",
                dispatch.job_timeout.as_secs(),
            )?),
            detection_queue_capacity: env_or("DETECTION_QUEUE_CAPACITY", dispatch.queue_capacity)?,
            snapshot_timeout: Duration::from_secs(env_or("SNAPSHOT_TIMEOUT_SEC", 10)?),
            pinned_streams: parse_pinned(&std::env::var("PINNED_STREAMS").unwrap_or_default())?,
            static_dir: std::env::var("STATIC_DIR").ok().map(PathBuf::from),
        })
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            output_root: self.hls_dir.clone(),
            public_base: "/live".to_string(),
            max_processes: self.max_stream_processes,
            output_quota_bytes: self.output_quota_bytes,
            startup_timeout: self.startup_timeout,
            liveness_timeout: self.liveness_timeout,
            stop_grace: self.stop_grace,
            restart: RestartPolicy {
                enabled: self.restart_enabled,
                max_attempts: self.max_restarts,
                base_backoff: self.restart_backoff,
                max_backoff: self.restart_backoff_max,
            },
            segment_seconds: self.hls_segment_sec,
            segment_window: self.hls_window,
        }
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            interval: self.detection_interval,
            job_timeout: self.detection_timeout,
            queue_capacity: self.detection_queue_capacity,
        }
    }

    pub fn snapshot_config(&self) -> SnapshotConfig {
        SnapshotConfig {
            snapshot_dir: self.snapshot_dir.clone(),
            public_base: "/snapshots".to_string(),
            ffmpeg_bin: self.ffmpeg_bin.clone(),
            capture_timeout: self.snapshot_timeout,
        }
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub sources: Arc<SourceRegistry>,
    pub supervisor: Arc<StreamSupervisor>,
    pub dispatch: Arc<DetectionDispatch>,
    /// None when no detection service is configured
    pub detector: Option<Arc<dyn Detector>>,
    pub snapshots: Arc<SnapshotService>,
    pub gateway: Arc<RealtimeGateway>,
    pub system_health: Arc<RwLock<SystemHealth>>,
    pub started_at: DateTime<Utc>,
}

/// System health metrics
#[derive(Debug, Clone, Default)]
pub struct SystemHealth {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub overloaded: bool,
    pub last_overload_at: Option<DateTime<Utc>>,
}

impl SystemHealth {
    /// Record a sample. Overload clears only after a quiet minute.
    pub fn update(&mut self, cpu: f32, memory: f32) {
        self.cpu_percent = cpu;
        self.memory_percent = memory;

        if cpu > 85.0 || memory > 90.0 {
            self.overloaded = true;
            self.last_overload_at = Some(Utc::now());
        } else if self.overloaded {
            if let Some(last) = self.last_overload_at {
                let elapsed = Utc::now() - last;
                if elapsed > chrono::Duration::seconds(60) && cpu < 60.0 && memory < 70.0 {
                    self.overloaded = false;
                }
            }
        }
    }
}
