//! StreamSupervisor - transcoding process lifecycle
//!
//! ## Responsibilities
//!
//! - At most one external transcoder per (source_id, tier)
//! - Startup window, liveness window, bounded restart with backoff
//! - Graceful stop (SIGTERM, grace, SIGKILL) and output cleanup
//! - Process ceiling and output quota
//! - Lifecycle events (Active / Error / Stopped)
//!
//! ## Design
//!
//! Every mutation of a key runs under that key's lease from `KeyedLocks`,
//! so start/stop/change_tier for one key are linearized while different
//! keys proceed in parallel. Each process is owned by a background task
//! (`process::ProcessTask`); the table only holds its shared info, a stop
//! signal and the join handle.

mod launcher;
mod process;
mod types;

pub use launcher::{parse_progress, FfmpegLauncher, LaunchRequest, ProgressLine, TranscoderLauncher};
pub use types::*;

use crate::error::{Error, Result};
use crate::key_lock::{KeyLease, KeyedLocks};
use crate::quality_tier::Tier;
use crate::snapshot_service::FrameSource;
use crate::source_registry::{validate_source_id, SourceRegistry};
use process::{ProcessShared, ProcessTask};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot, watch, RwLock, Semaphore};
use tokio::task::JoinHandle;

const EVENT_CAPACITY: usize = 256;

struct StreamEntry {
    shared: Arc<ProcessShared>,
    layout: OutputLayout,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// StreamSupervisor instance
pub struct StreamSupervisor {
    config: Arc<SupervisorConfig>,
    sources: Arc<SourceRegistry>,
    launcher: Arc<dyn TranscoderLauncher>,
    frames: Arc<dyn FrameSource>,
    processes: RwLock<HashMap<StreamKey, StreamEntry>>,
    key_locks: KeyedLocks<StreamKey>,
    /// Process ceiling; one permit per live process task
    slots: Arc<Semaphore>,
    events: broadcast::Sender<LifecycleEvent>,
}

impl StreamSupervisor {
    pub fn new(
        config: SupervisorConfig,
        sources: Arc<SourceRegistry>,
        launcher: Arc<dyn TranscoderLauncher>,
        frames: Arc<dyn FrameSource>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            slots: Arc::new(Semaphore::new(config.max_processes)),
            config: Arc::new(config),
            sources,
            launcher,
            frames,
            processes: RwLock::new(HashMap::new()),
            key_locks: KeyedLocks::new(),
            events,
        }
    }

    /// Lifecycle event stream
    pub fn subscribe_events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Start (or join) the process for `(source_id, tier)`
    pub async fn start(&self, source_id: &str, tier: Tier) -> Result<OutputDescriptor> {
        let key = StreamKey::new(source_id, tier);
        let _lease = self.lease(&key).await?;
        self.start_locked(&key).await
    }

    /// Stop the process for `(source_id, tier)`. No-op when nothing runs.
    pub async fn stop(&self, source_id: &str, tier: Tier) -> Result<()> {
        let key = StreamKey::new(source_id, tier);
        let _lease = self.lease(&key).await?;
        self.stop_locked(&key).await
    }

    /// Replace the `old` tier process with a `new` tier one.
    ///
    /// The new process is started before the old one is stopped. When the
    /// ceiling has no room for both, the old one is stopped first.
    pub async fn change_tier(
        &self,
        source_id: &str,
        old: Tier,
        new: Tier,
    ) -> Result<OutputDescriptor> {
        if old == new {
            return self.start(source_id, new).await;
        }

        let old_key = StreamKey::new(source_id, old);
        let new_key = StreamKey::new(source_id, new);

        // fixed order so two opposite changes cannot deadlock
        let (first, second) = if old_key < new_key {
            (&old_key, &new_key)
        } else {
            (&new_key, &old_key)
        };
        let _first = self.lease(first).await?;
        let _second = self.lease(second).await?;

        let descriptor = match self.start_locked(&new_key).await {
            Ok(descriptor) => {
                self.stop_locked(&old_key).await?;
                descriptor
            }
            Err(Error::ResourceExhausted(reason)) if self.contains(&old_key).await => {
                tracing::debug!(
                    source_id = %source_id,
                    reason = %reason,
                    "No spare slot for tier change, stopping old tier first"
                );
                self.stop_locked(&old_key).await?;
                self.start_locked(&new_key).await?
            }
            Err(e) => return Err(e),
        };

        tracing::info!(
            source_id = %source_id,
            from = %old,
            to = %new,
            "Tier changed"
        );
        Ok(descriptor)
    }

    /// One-shot frame capture; never touches a StreamProcess
    pub async fn snapshot(&self, source_id: &str) -> Result<Vec<u8>> {
        self.frames.capture_frame(source_id).await
    }

    pub async fn status(&self, source_id: &str, tier: Tier) -> Option<StreamProcessInfo> {
        let shared = {
            let processes = self.processes.read().await;
            processes
                .get(&StreamKey::new(source_id, tier))
                .map(|e| e.shared.clone())
        }?;
        Some(shared.snapshot().await)
    }

    pub async fn list(&self) -> Vec<StreamProcessInfo> {
        let shared: Vec<Arc<ProcessShared>> = {
            let processes = self.processes.read().await;
            processes.values().map(|e| e.shared.clone()).collect()
        };

        let mut list = Vec::with_capacity(shared.len());
        for s in shared {
            list.push(s.snapshot().await);
        }
        list.sort_by(|a, b| a.key().cmp(&b.key()));
        list
    }

    /// Live process tasks (holding a ceiling slot)
    pub fn running_count(&self) -> usize {
        self.config
            .max_processes
            .saturating_sub(self.slots.available_permits())
    }

    pub fn max_processes(&self) -> usize {
        self.config.max_processes
    }

    /// Stop everything (server shutdown)
    pub async fn shutdown(&self) {
        let keys: Vec<StreamKey> = self.processes.read().await.keys().cloned().collect();
        if keys.is_empty() {
            return;
        }

        tracing::info!(count = keys.len(), "Stopping all streams");
        let stops = keys.iter().map(|key| async move {
            if let Err(e) = self.stop(&key.source_id, key.tier).await {
                tracing::warn!(stream = %key, error = %e, "Stop during shutdown failed");
            }
        });
        futures::future::join_all(stops).await;
    }

    async fn lease(&self, key: &StreamKey) -> Result<KeyLease<StreamKey>> {
        self.key_locks
            .acquire(key)
            .await
            .map_err(|e| Error::Internal(format!("stream {} lock: {}", key, e)))
    }

    #[cfg(test)]
    pub(crate) fn lock_entries(&self) -> usize {
        self.key_locks.len()
    }

    async fn contains(&self, key: &StreamKey) -> bool {
        self.processes.read().await.contains_key(key)
    }

    fn descriptor(&self, key: &StreamKey) -> OutputDescriptor {
        let layout = OutputLayout::for_key(&self.config.output_root, key);
        OutputDescriptor {
            source_id: key.source_id.clone(),
            tier: key.tier,
            manifest_path: layout.manifest,
            manifest_url: manifest_url(&self.config.public_base, key),
        }
    }

    /// Caller holds the lease for `key`
    async fn start_locked(&self, key: &StreamKey) -> Result<OutputDescriptor> {
        let existing = {
            let processes = self.processes.read().await;
            processes.get(key).map(|e| e.shared.clone())
        };

        if let Some(shared) = existing {
            let info = shared.snapshot().await;
            let never_came_up =
                info.state == StreamState::Starting && info.last_activity_at.is_none();
            if !(info.terminal || info.state == StreamState::Stopped || never_came_up) {
                tracing::debug!(stream = %key, state = ?info.state, "Joining existing stream");
                return Ok(self.descriptor(key));
            }
            tracing::info!(stream = %key, state = ?info.state, "Clearing dead stream before start");
            self.stop_locked(key).await?;
        }

        let source = self
            .sources
            .get(&key.source_id)
            .await
            .ok_or_else(|| Error::unreachable(&key.source_id, "source not registered"))?;
        validate_source_id(&source.source_id)?;

        let permit = self.slots.clone().try_acquire_owned().map_err(|_| {
            tracing::warn!(
                stream = %key,
                max = self.config.max_processes,
                "Process ceiling reached"
            );
            Error::ResourceExhausted(format!(
                "process ceiling of {} reached",
                self.config.max_processes
            ))
        })?;
        self.check_quota().await?;

        let layout = OutputLayout::for_key(&self.config.output_root, key);
        layout.reset().await?;

        let shared = Arc::new(ProcessShared::new(
            key.clone(),
            &layout,
            manifest_url(&self.config.public_base, key),
            self.events.clone(),
        ));
        let (stop_tx, stop_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();

        let task = ProcessTask {
            shared: shared.clone(),
            source,
            layout: layout.clone(),
            launcher: self.launcher.clone(),
            config: self.config.clone(),
            permit,
        };
        let handle = tokio::spawn(task.run(ready_tx, stop_rx));

        tracing::info!(stream = %key, "Starting stream");

        // visible as Starting while the startup window runs
        self.processes.write().await.insert(
            key.clone(),
            StreamEntry {
                shared,
                layout: layout.clone(),
                stop_tx,
                task: handle,
            },
        );

        let failure = match ready_rx.await {
            Ok(Ok(())) => return Ok(self.descriptor(key)),
            Ok(Err(e)) => e,
            Err(_) => Error::Internal(format!("stream {} task ended before startup", key)),
        };

        let entry = self.processes.write().await.remove(key);
        if let Some(entry) = entry {
            if let Err(e) = entry.task.await {
                tracing::warn!(stream = %key, error = %e, "Stream task panicked");
            }
        }
        if let Err(e) = layout.remove().await {
            tracing::warn!(stream = %key, error = %e, "Failed to remove output directory");
        }
        Err(failure)
    }

    /// Caller holds the lease for `key`
    async fn stop_locked(&self, key: &StreamKey) -> Result<()> {
        let entry = self.processes.write().await.remove(key);
        let Some(entry) = entry else {
            tracing::debug!(stream = %key, "Stop: not running");
            return Ok(());
        };

        entry.shared.transition(StreamState::Stopping).await;
        // receiver is gone when the task already ended
        let _ = entry.stop_tx.send(true);
        if let Err(e) = entry.task.await {
            tracing::warn!(stream = %key, error = %e, "Stream task panicked");
        }

        let cleanup = entry.layout.remove().await;
        entry.shared.transition(StreamState::Stopped).await;
        cleanup?;

        tracing::info!(stream = %key, "Stream stopped");
        Ok(())
    }

    async fn check_quota(&self) -> Result<()> {
        let Some(quota) = self.config.output_quota_bytes else {
            return Ok(());
        };
        let used = dir_size(&self.config.output_root).await;
        if used >= quota {
            tracing::warn!(used = used, quota = quota, "Output quota reached");
            return Err(Error::ResourceExhausted(format!(
                "output quota reached ({} of {} bytes)",
                used, quota
            )));
        }
        Ok(())
    }
}

/// Total size of regular files below `root`
async fn dir_size(root: &Path) -> u64 {
    let mut total = 0;
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if meta.is_dir() {
                pending.push(entry.path());
            } else {
                total += meta.len();
            }
        }
    }
    total
}
