//! Shared fakes for unit tests: scripted transcoders, frames and detectors

use crate::detection_dispatch::{DetectionDispatch, DispatchConfig};
use crate::detector::{BoundingBox, Detection, Detector};
use crate::error::{Error, Result};
use crate::quality_tier::Tier;
use crate::realtime_gateway::RealtimeGateway;
use crate::snapshot_service::{FrameSource, SnapshotConfig, SnapshotService};
use crate::source_registry::{Source, SourceRegistry};
use crate::state::{AppConfig, AppState, SystemHealth};
use crate::stream_supervisor::{
    LaunchRequest, RestartPolicy, StreamSupervisor, SupervisorConfig, TranscoderLauncher,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::RwLock;

const HEALTHY: &str = r#"
i=0
while true; do
  i=$((i+1))
  echo "frame=$i"
  echo "progress=continue"
  : > "$OUT_DIR/segment_$i.ts" 2>/dev/null
  printf '#EXTM3U\n#EXTINF:1.0,\nsegment_%d.ts\n' "$i" > "$OUT_DIR/index.m3u8" 2>/dev/null
  rm -f "$OUT_DIR/segment_$((i-6)).ts"
  sleep 0.1
done
"#;

/// `sh -c` stand-in for ffmpeg
pub struct ScriptLauncher {
    script: &'static str,
    /// This tier never reports progress
    silent_tier: Option<Tier>,
    spawns: Arc<AtomicUsize>,
}

impl ScriptLauncher {
    fn with_script(script: &'static str) -> Self {
        Self {
            script,
            silent_tier: None,
            spawns: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Progress plus rolling segments every 100ms
    pub fn healthy() -> Self {
        Self::with_script(HEALTHY)
    }

    pub fn unreachable() -> Self {
        Self::with_script("echo 'rtsp://10.0.0.5/s1: Connection refused' >&2; exit 1")
    }

    /// Runs but never reports progress
    pub fn silent() -> Self {
        Self::with_script("exec sleep 30")
    }

    /// Healthy except for `tier`, which hangs in its startup window
    pub fn silent_on(tier: Tier) -> Self {
        Self {
            silent_tier: Some(tier),
            ..Self::healthy()
        }
    }

    /// One frame, then nothing
    pub fn stalls() -> Self {
        Self::with_script("echo frame=1; exec sleep 30")
    }

    pub fn ignores_sigterm() -> Self {
        Self::with_script(
            "trap '' TERM; while true; do echo progress=continue; sleep 0.1; done",
        )
    }

    pub fn spawn_counter(&self) -> Arc<AtomicUsize> {
        self.spawns.clone()
    }
}

impl TranscoderLauncher for ScriptLauncher {
    fn command(&self, request: &LaunchRequest<'_>) -> Command {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        let script = if self.silent_tier == Some(request.tier) {
            "exec sleep 30"
        } else {
            self.script
        };
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(script)
            .env("OUT_DIR", &request.layout.dir)
            .stdin(Stdio::null());
        cmd
    }
}

/// Hands out a fixed JPEG-ish payload for known sources
pub struct FakeFrames {
    known: Vec<String>,
}

impl FakeFrames {
    pub fn new(known: &[&str]) -> Self {
        Self {
            known: known.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[async_trait]
impl FrameSource for FakeFrames {
    async fn capture_frame(&self, source_id: &str) -> Result<Vec<u8>> {
        if self.known.iter().any(|k| k == source_id) {
            Ok(vec![0xff, 0xd8, 0xff, 0xe0, 0x00, 0x10, 0xff, 0xd9])
        } else {
            Err(Error::capture_failed(source_id, "no such source"))
        }
    }
}

enum DetectorMode {
    Instant,
    Slow(Duration),
    Failing,
}

#[derive(Default)]
struct DetectorCounts {
    calls: HashMap<String, usize>,
    in_flight: HashMap<String, usize>,
    max_in_flight: HashMap<String, usize>,
}

/// Scripted detector recording per-source concurrency
pub struct FakeDetector {
    mode: DetectorMode,
    counts: Arc<Mutex<DetectorCounts>>,
}

/// Decrements the in-flight count even when the call is cancelled by a timeout
struct InFlight {
    counts: Arc<Mutex<DetectorCounts>>,
    source_id: String,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut counts = self.counts.lock().unwrap();
        if let Some(n) = counts.in_flight.get_mut(&self.source_id) {
            *n = n.saturating_sub(1);
        }
    }
}

impl FakeDetector {
    fn with_mode(mode: DetectorMode) -> Self {
        Self {
            mode,
            counts: Arc::new(Mutex::new(DetectorCounts::default())),
        }
    }

    pub fn instant() -> Self {
        Self::with_mode(DetectorMode::Instant)
    }

    pub fn slow(delay: Duration) -> Self {
        Self::with_mode(DetectorMode::Slow(delay))
    }

    pub fn failing() -> Self {
        Self::with_mode(DetectorMode::Failing)
    }

    pub fn calls_for(&self, source_id: &str) -> usize {
        let counts = self.counts.lock().unwrap();
        counts.calls.get(source_id).copied().unwrap_or(0)
    }

    pub fn max_in_flight(&self, source_id: &str) -> usize {
        let counts = self.counts.lock().unwrap();
        counts.max_in_flight.get(source_id).copied().unwrap_or(0)
    }

    fn enter(&self, source_id: &str) -> InFlight {
        let mut counts = self.counts.lock().unwrap();
        *counts.calls.entry(source_id.to_string()).or_default() += 1;
        let now = {
            let n = counts.in_flight.entry(source_id.to_string()).or_default();
            *n += 1;
            *n
        };
        let max = counts.max_in_flight.entry(source_id.to_string()).or_default();
        *max = (*max).max(now);

        InFlight {
            counts: self.counts.clone(),
            source_id: source_id.to_string(),
        }
    }
}

#[async_trait]
impl Detector for FakeDetector {
    async fn detect(&self, source_id: &str, _frame: Vec<u8>) -> Result<Vec<Detection>> {
        let _guard = self.enter(source_id);
        match self.mode {
            DetectorMode::Instant => {}
            DetectorMode::Slow(delay) => tokio::time::sleep(delay).await,
            DetectorMode::Failing => {
                return Err(Error::DetectionCollaborator("model not loaded".to_string()))
            }
        }
        Ok(vec![Detection {
            label: format!("person@{}", source_id),
            confidence: 0.9,
            bbox: BoundingBox {
                x1: 0.1,
                y1: 0.1,
                x2: 0.5,
                y2: 0.9,
            },
        }])
    }
}

async fn registry() -> Arc<SourceRegistry> {
    let sources = SourceRegistry::with_sources(vec![
        Source::new("cam1", "rtsp://10.0.0.5/s1"),
        Source::new("cam2", "rtsp://10.0.0.6/s1"),
        Source::new("cam3", "rtsp://10.0.0.7/s1"),
    ])
    .await
    .unwrap();
    Arc::new(sources)
}

/// Supervisor over cam1..cam3 with a scripted transcoder
pub async fn supervisor_with(
    launcher: ScriptLauncher,
    config: SupervisorConfig,
) -> (Arc<StreamSupervisor>, Arc<SourceRegistry>) {
    let sources = registry().await;
    let supervisor = StreamSupervisor::new(
        config,
        sources.clone(),
        Arc::new(launcher),
        Arc::new(FakeFrames::new(&["cam1", "cam2", "cam3"])),
    );
    (Arc::new(supervisor), sources)
}

/// Fully wired gateway; keep the rig alive for the tempdir
pub struct GatewayRig {
    pub gateway: Arc<RealtimeGateway>,
    pub supervisor: Arc<StreamSupervisor>,
    pub dispatch: Arc<DetectionDispatch>,
    pub sources: Arc<SourceRegistry>,
    pub snapshots: Arc<SnapshotService>,
    pub dir: tempfile::TempDir,
}

pub async fn gateway_rig(launcher: ScriptLauncher) -> GatewayRig {
    gateway_rig_with_ceiling(launcher, 8).await
}

pub async fn gateway_rig_with_ceiling(launcher: ScriptLauncher, max_processes: usize) -> GatewayRig {
    let dir = tempfile::tempdir().unwrap();
    let config = SupervisorConfig {
        output_root: dir.path().join("hls"),
        max_processes,
        startup_timeout: Duration::from_secs(3),
        liveness_timeout: Duration::from_secs(5),
        stop_grace: Duration::from_millis(500),
        restart: RestartPolicy {
            enabled: false,
            ..RestartPolicy::default()
        },
        ..SupervisorConfig::default()
    };
    let (supervisor, sources) = supervisor_with(launcher, config).await;

    let snapshots = SnapshotService::new(
        SnapshotConfig {
            snapshot_dir: dir.path().join("snapshots"),
            public_base: "/snapshots".to_string(),
            ffmpeg_bin: PathBuf::from("echo"),
            capture_timeout: Duration::from_secs(2),
        },
        sources.clone(),
    )
    .await
    .unwrap();
    let snapshots = Arc::new(snapshots);

    let (dispatch, _results) = DetectionDispatch::new(
        DispatchConfig {
            interval: Duration::from_secs(60),
            ..DispatchConfig::default()
        },
        Arc::new(FakeFrames::new(&["cam1", "cam2", "cam3"])),
        Some(Arc::new(FakeDetector::instant()) as Arc<dyn Detector>),
    );
    let dispatch = Arc::new(dispatch);

    let gateway = Arc::new(RealtimeGateway::new(
        supervisor.clone(),
        dispatch.clone(),
        snapshots.clone(),
    ));

    GatewayRig {
        gateway,
        supervisor,
        dispatch,
        sources,
        snapshots,
        dir,
    }
}

/// Handler state over a gateway rig; keep the tempdir alive
pub async fn app_state(launcher: ScriptLauncher) -> (AppState, tempfile::TempDir) {
    let rig = gateway_rig(launcher).await;

    let mut config = AppConfig::from_env().unwrap();
    config.hls_dir = rig.dir.path().join("hls");
    config.snapshot_dir = rig.dir.path().join("snapshots");
    config.ffmpeg_bin = PathBuf::from("echo");
    config.detector_url = None;

    let state = AppState {
        config: Arc::new(config),
        sources: rig.sources,
        supervisor: rig.supervisor,
        dispatch: rig.dispatch,
        detector: None,
        snapshots: rig.snapshots,
        gateway: rig.gateway,
        system_health: Arc::new(RwLock::new(SystemHealth::default())),
        started_at: Utc::now(),
    };
    (state, rig.dir)
}
