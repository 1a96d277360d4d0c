//! StreamSupervisor types

use crate::quality_tier::Tier;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// (source_id, tier) - identity of one transcoding process
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey {
    pub source_id: String,
    pub tier: Tier,
}

impl StreamKey {
    pub fn new(source_id: impl Into<String>, tier: Tier) -> Self {
        Self {
            source_id: source_id.into(),
            tier,
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source_id, self.tier)
    }
}

/// StreamProcess lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Idle,
    Starting,
    Active,
    Error,
    Stopping,
    Stopped,
}

impl StreamState {
    /// Allowed edges of the lifecycle graph.
    ///
    /// `Active -> Error` is the steady-state liveness failure.
    pub fn can_transition_to(self, next: StreamState) -> bool {
        use StreamState::*;
        matches!(
            (self, next),
            (Idle, Starting)
                | (Starting, Active)
                | (Starting, Error)
                | (Starting, Stopping)
                | (Active, Error)
                | (Active, Stopping)
                | (Error, Starting)
                | (Error, Stopping)
                | (Stopping, Stopped)
        )
    }
}

/// Snapshot of one StreamProcess (read side)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamProcessInfo {
    pub source_id: String,
    pub tier: Tier,
    pub state: StreamState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub output_dir: PathBuf,
    pub manifest_path: PathBuf,
    pub manifest_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity_at: Option<DateTime<Utc>>,
    /// Restarts performed by the retry policy
    pub restarts: u32,
    /// Frames reported by the transcoder progress output
    pub frames: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fps: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Retries exhausted; needs operator action or a fresh subscribe
    pub terminal: bool,
}

impl StreamProcessInfo {
    pub fn key(&self) -> StreamKey {
        StreamKey::new(self.source_id.clone(), self.tier)
    }
}

/// Returned by `start`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDescriptor {
    pub source_id: String,
    pub tier: Tier,
    pub manifest_path: PathBuf,
    pub manifest_url: String,
}

/// Status carried by lifecycle events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleStatus {
    Active,
    Stopped,
    Error,
}

/// Emitted on Active / Error / Stopped transitions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub key: StreamKey,
    pub status: LifecycleStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// True when the retry policy has given up
    pub terminal: bool,
    pub at: DateTime<Utc>,
}

/// Restart policy for liveness failures
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub enabled: bool,
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RestartPolicy {
    /// Delay before restart attempt `attempt` (1-based): base * 2^(attempt-1), capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.base_backoff.saturating_mul(1u32 << shift);
        delay.min(self.max_backoff)
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Supervisor configuration
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Root of the segmented output tree
    pub output_root: PathBuf,
    /// URL prefix the output tree is served under
    pub public_base: String,
    /// Process ceiling
    pub max_processes: usize,
    /// Total bytes allowed under `output_root` before new starts are refused
    pub output_quota_bytes: Option<u64>,
    pub startup_timeout: Duration,
    pub liveness_timeout: Duration,
    pub stop_grace: Duration,
    pub restart: RestartPolicy,
    pub segment_seconds: u32,
    /// Segments kept in the rolling window
    pub segment_window: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from("/var/lib/livecam/hls"),
            public_base: "/live".to_string(),
            max_processes: 16,
            output_quota_bytes: None,
            startup_timeout: Duration::from_secs(15),
            liveness_timeout: Duration::from_secs(20),
            stop_grace: Duration::from_secs(5),
            restart: RestartPolicy::default(),
            segment_seconds: 2,
            segment_window: 6,
        }
    }
}

/// Deterministic on-disk layout for one (source, tier)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    pub dir: PathBuf,
    pub manifest: PathBuf,
    pub segment_pattern: PathBuf,
}

impl OutputLayout {
    pub fn for_key(root: &Path, key: &StreamKey) -> Self {
        let dir = root.join(&key.source_id).join(key.tier.as_str());
        Self {
            manifest: dir.join("index.m3u8"),
            segment_pattern: dir.join("segment_%05d.ts"),
            dir,
        }
    }

    /// Wipe and recreate the directory
    pub async fn reset(&self) -> std::io::Result<()> {
        self.remove().await?;
        tokio::fs::create_dir_all(&self.dir).await
    }

    /// Remove the directory (missing is fine), then the source dir if it became empty
    pub async fn remove(&self) -> std::io::Result<()> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        if let Some(parent) = self.dir.parent() {
            // fails while other tiers of the same source still have output
            let _ = tokio::fs::remove_dir(parent).await;
        }
        Ok(())
    }
}

pub(crate) fn manifest_url(public_base: &str, key: &StreamKey) -> String {
    format!(
        "{}/{}/{}/index.m3u8",
        public_base.trim_end_matches('/'),
        key.source_id,
        key.tier
    )
}
