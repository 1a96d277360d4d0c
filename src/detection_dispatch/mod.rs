//! DetectionDispatch - per-source detection cadence
//!
//! ## Responsibilities
//!
//! - Recurring tick per scheduled source (only while someone watches it)
//! - At most one job pending or in flight per source
//! - Bounded FIFO queue drained by a single worker
//! - Best-effort: failures and timeouts are logged and dropped
//!
//! ## Design
//!
//! A tick enqueues a `FrameJob` only if the source is not already in the
//! busy set. The worker removes the source from the set after the job
//! finishes, whatever the outcome, so the next tick retries. Results leave
//! through an unbounded channel consumed by the gateway.

use crate::detector::{Detection, Detector};
use crate::error::{Error, Result};
use crate::snapshot_service::FrameSource;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Dispatch configuration
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Tick period per source
    pub interval: Duration,
    /// Deadline for capture + detection of one job
    pub job_timeout: Duration,
    pub queue_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            job_timeout: Duration::from_secs(10),
            queue_capacity: 64,
        }
    }
}

/// Queued unit of work
#[derive(Debug, Clone)]
pub struct FrameJob {
    pub source_id: String,
    pub enqueued_at: DateTime<Utc>,
}

/// Produced by the worker, consumed once by the gateway
#[derive(Debug, Clone, Serialize)]
pub struct DetectionResult {
    pub source_id: String,
    pub detections: Vec<Detection>,
    pub produced_at: DateTime<Utc>,
}

/// What a tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// A job for the source is pending or in flight
    SkippedBusy,
    DroppedFull,
    Closed,
}

/// Counters exposed through the stats endpoint
#[derive(Debug, Clone, Serialize)]
pub struct DispatchStats {
    pub enabled: bool,
    pub enqueued: u64,
    pub skipped_busy: u64,
    pub dropped_full: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub scheduled: Vec<String>,
    pub busy: Vec<String>,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    skipped_busy: AtomicU64,
    dropped_full: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
}

/// Admission side shared by tick tasks and the worker
struct JobGate {
    /// Sources with a job pending or in flight
    busy: Mutex<HashSet<String>>,
    queue_tx: mpsc::Sender<FrameJob>,
    counters: Counters,
}

impl JobGate {
    async fn try_enqueue(&self, source_id: &str) -> EnqueueOutcome {
        let mut busy = self.busy.lock().await;
        if busy.contains(source_id) {
            self.counters.skipped_busy.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(source_id = %source_id, "Detection job still running, tick skipped");
            return EnqueueOutcome::SkippedBusy;
        }

        let job = FrameJob {
            source_id: source_id.to_string(),
            enqueued_at: Utc::now(),
        };
        match self.queue_tx.try_send(job) {
            Ok(()) => {
                busy.insert(source_id.to_string());
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(source_id = %source_id, "Detection job enqueued");
                EnqueueOutcome::Enqueued
            }
            Err(TrySendError::Full(_)) => {
                self.counters.dropped_full.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(source_id = %source_id, "Detection queue full, job dropped");
                EnqueueOutcome::DroppedFull
            }
            Err(TrySendError::Closed(_)) => EnqueueOutcome::Closed,
        }
    }

    async fn release(&self, source_id: &str) {
        self.busy.lock().await.remove(source_id);
    }
}

/// DetectionDispatch instance
pub struct DetectionDispatch {
    config: DispatchConfig,
    frames: Arc<dyn FrameSource>,
    /// None disables detection entirely
    detector: Option<Arc<dyn Detector>>,
    gate: Arc<JobGate>,
    queue_rx: Mutex<Option<mpsc::Receiver<FrameJob>>>,
    results_tx: mpsc::UnboundedSender<DetectionResult>,
    schedules: Mutex<HashMap<String, JoinHandle<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DetectionDispatch {
    /// Create the dispatcher and the receiver its results are delivered on
    pub fn new(
        config: DispatchConfig,
        frames: Arc<dyn FrameSource>,
        detector: Option<Arc<dyn Detector>>,
    ) -> (Self, mpsc::UnboundedReceiver<DetectionResult>) {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (results_tx, results_rx) = mpsc::unbounded_channel();

        let dispatch = Self {
            config,
            frames,
            detector,
            gate: Arc::new(JobGate {
                busy: Mutex::new(HashSet::new()),
                queue_tx,
                counters: Counters::default(),
            }),
            queue_rx: Mutex::new(Some(queue_rx)),
            results_tx,
            schedules: Mutex::new(HashMap::new()),
            worker: Mutex::new(None),
        };
        (dispatch, results_rx)
    }

    pub fn enabled(&self) -> bool {
        self.detector.is_some()
    }

    /// Spawn the worker loop
    pub async fn start(&self) {
        let Some(detector) = self.detector.clone() else {
            tracing::info!("Detection dispatch disabled (no detector configured)");
            return;
        };

        let Some(rx) = self.queue_rx.lock().await.take() else {
            tracing::warn!("Detection worker already running");
            return;
        };

        tracing::info!(
            interval_ms = self.config.interval.as_millis() as u64,
            timeout_ms = self.config.job_timeout.as_millis() as u64,
            capacity = self.config.queue_capacity,
            "Starting detection worker"
        );

        let handle = tokio::spawn(worker_loop(
            rx,
            self.gate.clone(),
            self.frames.clone(),
            detector,
            self.config.job_timeout,
            self.results_tx.clone(),
        ));
        *self.worker.lock().await = Some(handle);
    }

    /// Begin the recurring cadence for a source. Returns false if already scheduled or disabled.
    pub async fn schedule(&self, source_id: &str) -> bool {
        if !self.enabled() {
            return false;
        }

        let mut schedules = self.schedules.lock().await;
        if schedules.contains_key(source_id) {
            return false;
        }

        let gate = self.gate.clone();
        let id = source_id.to_string();
        let period = self.config.interval;
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if gate.try_enqueue(&id).await == EnqueueOutcome::Closed {
                    break;
                }
            }
        });

        schedules.insert(source_id.to_string(), handle);
        tracing::info!(source_id = %source_id, "Detection scheduled");
        true
    }

    /// Stop the cadence for a source. A job already queued still runs.
    pub async fn unschedule(&self, source_id: &str) -> bool {
        let Some(handle) = self.schedules.lock().await.remove(source_id) else {
            return false;
        };
        handle.abort();
        tracing::info!(source_id = %source_id, "Detection unscheduled");
        true
    }

    pub async fn is_scheduled(&self, source_id: &str) -> bool {
        self.schedules.lock().await.contains_key(source_id)
    }

    pub async fn stats(&self) -> DispatchStats {
        let c = &self.gate.counters;
        let mut scheduled: Vec<String> = self.schedules.lock().await.keys().cloned().collect();
        scheduled.sort();
        let mut busy: Vec<String> = self.gate.busy.lock().await.iter().cloned().collect();
        busy.sort();

        let tx = &self.gate.queue_tx;
        DispatchStats {
            enabled: self.enabled(),
            enqueued: c.enqueued.load(Ordering::Relaxed),
            skipped_busy: c.skipped_busy.load(Ordering::Relaxed),
            dropped_full: c.dropped_full.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            timed_out: c.timed_out.load(Ordering::Relaxed),
            queue_depth: tx.max_capacity() - tx.capacity(),
            queue_capacity: tx.max_capacity(),
            scheduled,
            busy,
        }
    }

    pub async fn shutdown(&self) {
        let mut schedules = self.schedules.lock().await;
        for (_, handle) in schedules.drain() {
            handle.abort();
        }
        if let Some(worker) = self.worker.lock().await.take() {
            worker.abort();
        }
        tracing::info!("Detection dispatch stopped");
    }
}

async fn worker_loop(
    mut rx: mpsc::Receiver<FrameJob>,
    gate: Arc<JobGate>,
    frames: Arc<dyn FrameSource>,
    detector: Arc<dyn Detector>,
    job_timeout: Duration,
    results_tx: mpsc::UnboundedSender<DetectionResult>,
) {
    while let Some(job) = rx.recv().await {
        let source_id = job.source_id.as_str();
        let run = async {
            let frame = frames.capture_frame(source_id).await?;
            detector.detect(source_id, frame).await
        };

        let outcome: Result<Vec<Detection>> = match tokio::time::timeout(job_timeout, run).await {
            Ok(result) => result,
            Err(_) => Err(Error::DetectionTimeout(format!(
                "{} after {}ms",
                source_id,
                job_timeout.as_millis()
            ))),
        };

        let counters = &gate.counters;
        match outcome {
            Ok(detections) => {
                counters.completed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    source_id = %source_id,
                    count = detections.len(),
                    queued_ms = (Utc::now() - job.enqueued_at).num_milliseconds(),
                    "Detection completed"
                );
                let result = DetectionResult {
                    source_id: job.source_id.clone(),
                    detections,
                    produced_at: Utc::now(),
                };
                if results_tx.send(result).is_err() {
                    tracing::debug!("Detection results receiver gone");
                }
            }
            Err(e @ Error::DetectionTimeout(_)) => {
                counters.timed_out.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(source_id = %source_id, error = %e, "Detection job timed out");
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    source_id = %source_id,
                    error_kind = e.kind(),
                    error = %e,
                    "Detection job failed"
                );
            }
        }

        gate.release(source_id).await;
    }

    tracing::info!("Detection worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeDetector, FakeFrames};

    fn config(interval_secs: u64, timeout_secs: u64, capacity: usize) -> DispatchConfig {
        DispatchConfig {
            interval: Duration::from_secs(interval_secs),
            job_timeout: Duration::from_secs(timeout_secs),
            queue_capacity: capacity,
        }
    }

    async fn dispatch_with(
        detector: Arc<FakeDetector>,
        config: DispatchConfig,
    ) -> (DetectionDispatch, mpsc::UnboundedReceiver<DetectionResult>) {
        let (dispatch, rx) = DetectionDispatch::new(
            config,
            Arc::new(FakeFrames::new(&["cam_a", "cam_b", "cam_c"])),
            Some(detector as Arc<dyn Detector>),
        );
        dispatch.start().await;
        (dispatch, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_detector_keeps_one_job_per_source() {
        let detector = Arc::new(FakeDetector::slow(Duration::from_secs(5)));
        let (dispatch, mut rx) = dispatch_with(detector.clone(), config(1, 30, 16)).await;

        dispatch.schedule("cam_a").await;
        tokio::time::sleep(Duration::from_secs(12)).await;

        assert_eq!(detector.max_in_flight("cam_a"), 1);
        let stats = dispatch.stats().await;
        assert!(stats.skipped_busy >= 6, "skipped {}", stats.skipped_busy);
        assert!(stats.queue_depth <= 1);
        assert!(stats.completed >= 2);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.source_id, "cam_a");

        dispatch.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_only_for_scheduled_sources() {
        let detector = Arc::new(FakeDetector::instant());
        let (dispatch, mut rx) = dispatch_with(detector.clone(), config(1, 5, 16)).await;

        dispatch.schedule("cam_a").await;
        tokio::time::sleep(Duration::from_millis(3500)).await;
        dispatch.shutdown().await;

        let mut count = 0;
        while let Ok(result) = rx.try_recv() {
            assert_eq!(result.source_id, "cam_a");
            assert_eq!(result.detections[0].label, "person@cam_a");
            count += 1;
        }
        assert!(count >= 3);
        assert_eq!(detector.calls_for("cam_b"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_dropped_and_retried() {
        let detector = Arc::new(FakeDetector::failing());
        let (dispatch, mut rx) = dispatch_with(detector.clone(), config(1, 5, 16)).await;

        dispatch.schedule("cam_a").await;
        tokio::time::sleep(Duration::from_millis(2500)).await;

        let stats = dispatch.stats().await;
        assert!(stats.failed >= 2);
        assert_eq!(stats.completed, 0);
        assert!(rx.try_recv().is_err());
        assert!(dispatch.is_scheduled("cam_a").await);

        dispatch.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_releases_source() {
        let detector = Arc::new(FakeDetector::slow(Duration::from_secs(60)));
        let (dispatch, _rx) = dispatch_with(detector.clone(), config(1, 2, 16)).await;

        dispatch.schedule("cam_a").await;
        tokio::time::sleep(Duration::from_millis(6500)).await;

        let stats = dispatch.stats().await;
        assert!(stats.timed_out >= 2, "timed out {}", stats.timed_out);
        assert!(detector.calls_for("cam_a") >= 2);

        dispatch.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unschedule_stops_ticks() {
        let detector = Arc::new(FakeDetector::instant());
        let (dispatch, _rx) = dispatch_with(detector.clone(), config(1, 5, 16)).await;

        assert!(dispatch.schedule("cam_a").await);
        assert!(!dispatch.schedule("cam_a").await);
        tokio::time::sleep(Duration::from_millis(2500)).await;

        assert!(dispatch.unschedule("cam_a").await);
        let calls = detector.calls_for("cam_a");
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(detector.calls_for("cam_a"), calls);
        assert!(!dispatch.unschedule("cam_a").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_drops_job() {
        let detector = Arc::new(FakeDetector::slow(Duration::from_secs(10)));
        let (dispatch, _rx) = dispatch_with(detector.clone(), config(1, 30, 1)).await;

        dispatch.schedule("cam_a").await;
        dispatch.schedule("cam_b").await;
        dispatch.schedule("cam_c").await;
        tokio::time::sleep(Duration::from_secs(3)).await;

        let stats = dispatch.stats().await;
        assert!(stats.dropped_full >= 1);
        assert!(stats.queue_depth <= 1);

        dispatch.shutdown().await;
    }

    #[tokio::test]
    async fn test_disabled_without_detector() {
        let (dispatch, _rx) = DetectionDispatch::new(
            DispatchConfig::default(),
            Arc::new(FakeFrames::new(&["cam_a"])),
            None,
        );
        dispatch.start().await;

        assert!(!dispatch.enabled());
        assert!(!dispatch.schedule("cam_a").await);
        assert!(!dispatch.stats().await.enabled);
    }
}
