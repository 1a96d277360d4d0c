//! SnapshotService - one-shot frame capture
//!
//! ## Responsibilities
//!
//! - Single-frame capture from a source using ffmpeg (independent of any StreamProcess)
//! - HTTP still-image fallback when the source defines `snapshot_url`
//! - Latest-image cache served to viewers
//! - One capture per source at a time

use crate::error::{Error, Result};
use crate::key_lock::KeyedLocks;
use crate::source_registry::{Source, SourceRegistry};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::process::Command;

/// Anything that can hand out a single encoded frame for a source
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn capture_frame(&self, source_id: &str) -> Result<Vec<u8>>;
}

/// How the image was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMethod {
    Ffmpeg,
    Http,
}

impl CaptureMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureMethod::Ffmpeg => "ffmpeg",
            CaptureMethod::Http => "http",
        }
    }
}

/// Captured JPEG plus how it was obtained
pub struct CaptureResult {
    pub data: Vec<u8>,
    pub method: CaptureMethod,
}

/// SnapshotService configuration
#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    pub snapshot_dir: PathBuf,
    /// URL prefix `snapshot_dir` is served under
    pub public_base: String,
    pub ffmpeg_bin: PathBuf,
    pub capture_timeout: Duration,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            snapshot_dir: PathBuf::from("/var/lib/livecam/snapshots"),
            public_base: "/snapshots".to_string(),
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            capture_timeout: Duration::from_secs(10),
        }
    }
}

/// SnapshotService instance
pub struct SnapshotService {
    client: reqwest::Client,
    sources: Arc<SourceRegistry>,
    config: SnapshotConfig,
    locks: KeyedLocks<String>,
}

impl SnapshotService {
    pub async fn new(config: SnapshotConfig, sources: Arc<SourceRegistry>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.capture_timeout)
            .build()?;

        fs::create_dir_all(&config.snapshot_dir).await?;

        Ok(Self {
            client,
            sources,
            // a caller waits at most one capture window for a capture already in flight
            locks: KeyedLocks::with_timeout(config.capture_timeout),
            config,
        })
    }

    /// Capture a frame from a registered source.
    ///
    /// Order: ffmpeg against the stream URI, then `snapshot_url` over HTTP.
    /// Every failure surfaces as `CaptureFailed`.
    pub async fn capture(&self, source_id: &str) -> Result<CaptureResult> {
        let source = self
            .sources
            .get(source_id)
            .await
            .ok_or_else(|| Error::capture_failed(source_id, "source not registered"))?;

        let _lease = self
            .locks
            .acquire(&source.source_id)
            .await
            .map_err(|e| Error::capture_failed(source_id, e.to_string()))?;

        let result = match self.capture_ffmpeg(&source).await {
            Ok(data) => CaptureResult {
                data,
                method: CaptureMethod::Ffmpeg,
            },
            Err(ffmpeg_err) => {
                let Some(url) = source.snapshot_url.as_deref() else {
                    return Err(Error::capture_failed(source_id, ffmpeg_err));
                };
                tracing::warn!(
                    source_id = %source_id,
                    error = %ffmpeg_err,
                    "Stream capture failed, trying HTTP snapshot"
                );
                let data = self.capture_http(url).await.map_err(|e| {
                    Error::capture_failed(source_id, format!("{}; http: {}", ffmpeg_err, e))
                })?;
                CaptureResult {
                    data,
                    method: CaptureMethod::Http,
                }
            }
        };

        tracing::debug!(
            source_id = %source_id,
            size = result.data.len(),
            method = result.method.as_str(),
            "Snapshot captured"
        );
        Ok(result)
    }

    /// Grab one frame with ffmpeg. The child is killed on drop, so a timeout
    /// never leaves a process behind.
    async fn capture_ffmpeg(&self, source: &Source) -> std::result::Result<Vec<u8>, String> {
        let mut cmd = Command::new(&self.config.ffmpeg_bin);
        if source.is_rtsp() {
            cmd.args(["-rtsp_transport", "tcp"]);
        }
        cmd.args([
            "-i",
            source.uri.as_str(),
            "-frames:v",
            "1",
            "-f",
            "image2pipe",
            "-vcodec",
            "mjpeg",
            "-loglevel",
            "error",
            "-y",
            "-",
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| format!("ffmpeg spawn failed: {}", e))?;

        let wait = self.config.capture_timeout;
        match tokio::time::timeout(wait, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                if !output.status.success() {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    return Err(format!("ffmpeg failed ({}): {}", output.status, stderr.trim()));
                }
                if output.stdout.is_empty() {
                    return Err("ffmpeg returned empty output".to_string());
                }
                Ok(output.stdout)
            }
            Ok(Err(e)) => Err(format!("ffmpeg execution failed: {}", e)),
            Err(_) => {
                tracing::warn!(
                    source_id = %source.source_id,
                    timeout_ms = wait.as_millis() as u64,
                    "Snapshot capture timed out, process killed"
                );
                Err(format!("timed out after {}s", wait.as_secs_f32()))
            }
        }
    }

    async fn capture_http(&self, url: &str) -> Result<Vec<u8>> {
        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(Error::Internal(format!(
                "snapshot HTTP status {}",
                resp.status()
            )));
        }
        Ok(resp.bytes().await?.to_vec())
    }

    /// Write `latest.jpg` for the source; returns the path
    pub async fn save_cache(&self, source_id: &str, data: &[u8]) -> Result<PathBuf> {
        let path = self.cache_path(source_id);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }
        fs::write(&path, data).await?;

        tracing::debug!(
            source_id = %source_id,
            path = %path.display(),
            size = data.len(),
            "Saved snapshot cache"
        );
        Ok(path)
    }

    fn cache_path(&self, source_id: &str) -> PathBuf {
        self.config.snapshot_dir.join(source_id).join("latest.jpg")
    }

    pub fn image_url(&self, source_id: &str) -> String {
        format!(
            "{}/{}/latest.jpg",
            self.config.public_base.trim_end_matches('/'),
            source_id
        )
    }

    /// `ffmpeg -version` first line
    pub async fn check_ffmpeg(bin: &std::path::Path) -> Result<String> {
        let output = Command::new(bin)
            .arg("-version")
            .output()
            .await
            .map_err(|e| Error::Internal(format!("ffmpeg not found: {}", e)))?;

        if !output.status.success() {
            return Err(Error::Internal("ffmpeg version check failed".to_string()));
        }

        let version = String::from_utf8_lossy(&output.stdout);
        Ok(version.lines().next().unwrap_or("unknown").to_string())
    }
}

#[async_trait]
impl FrameSource for SnapshotService {
    async fn capture_frame(&self, source_id: &str) -> Result<Vec<u8>> {
        self.capture(source_id).await.map(|r| r.data)
    }
}
