//! One supervised transcoding process: spawn, liveness, restart, teardown

use super::launcher::{parse_progress, LaunchRequest, ProgressLine, TranscoderLauncher};
use super::types::*;
use crate::error::{Error, Result};
use crate::source_registry::{redact_credentials, Source};
use chrono::Utc;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::sync::{broadcast, oneshot, watch, OwnedSemaphorePermit, RwLock};
use tokio::time::{sleep, sleep_until, timeout, Instant};

/// State shared between the supervisor table and the process task
pub(crate) struct ProcessShared {
    pub key: StreamKey,
    pub info: RwLock<StreamProcessInfo>,
    events: broadcast::Sender<LifecycleEvent>,
}

impl ProcessShared {
    pub fn new(
        key: StreamKey,
        layout: &OutputLayout,
        manifest_url: String,
        events: broadcast::Sender<LifecycleEvent>,
    ) -> Self {
        let info = StreamProcessInfo {
            source_id: key.source_id.clone(),
            tier: key.tier,
            state: StreamState::Idle,
            pid: None,
            output_dir: layout.dir.clone(),
            manifest_path: layout.manifest.clone(),
            manifest_url,
            started_at: None,
            last_activity_at: None,
            restarts: 0,
            frames: 0,
            fps: None,
            last_error: None,
            terminal: false,
        };
        Self {
            key,
            info: RwLock::new(info),
            events,
        }
    }

    pub async fn snapshot(&self) -> StreamProcessInfo {
        self.info.read().await.clone()
    }

    /// Move to `next` if the lifecycle graph allows it; emits Active/Error/Stopped events
    pub async fn transition(&self, next: StreamState) -> bool {
        self.transition_with(next, None, false).await
    }

    /// Record a failure as an Error transition
    pub async fn fail(&self, reason: String, terminal: bool) -> bool {
        self.transition_with(StreamState::Error, Some(reason), terminal)
            .await
    }

    async fn transition_with(
        &self,
        next: StreamState,
        reason: Option<String>,
        terminal: bool,
    ) -> bool {
        let mut info = self.info.write().await;
        let prev = info.state;
        if !prev.can_transition_to(next) {
            tracing::debug!(
                stream = %self.key,
                from = ?prev,
                to = ?next,
                "Ignoring lifecycle transition"
            );
            return false;
        }

        info.state = next;
        match next {
            StreamState::Error => {
                info.last_error = reason.clone();
                info.terminal = terminal;
                info.pid = None;
            }
            StreamState::Stopped => info.pid = None,
            _ => {}
        }
        let terminal = info.terminal;
        drop(info);

        let status = match next {
            StreamState::Active => Some(LifecycleStatus::Active),
            StreamState::Error => Some(LifecycleStatus::Error),
            StreamState::Stopped => Some(LifecycleStatus::Stopped),
            _ => None,
        };

        match (&status, &reason) {
            (Some(LifecycleStatus::Error), Some(reason)) => tracing::warn!(
                stream = %self.key,
                from = ?prev,
                reason = %reason,
                terminal = terminal,
                "Stream failed"
            ),
            _ => tracing::info!(stream = %self.key, from = ?prev, to = ?next, "Stream state changed"),
        }

        if let Some(status) = status {
            // no receivers is fine
            let _ = self.events.send(LifecycleEvent {
                key: self.key.clone(),
                status,
                reason,
                terminal,
                at: Utc::now(),
            });
        }
        true
    }

    async fn record_progress(&self, progress: &ProgressLine) {
        let mut info = self.info.write().await;
        info.last_activity_at = Some(Utc::now());
        match progress {
            ProgressLine::Frame(frames) => info.frames = *frames,
            ProgressLine::Fps(fps) => info.fps = Some(*fps),
            ProgressLine::Tick | ProgressLine::End => {}
        }
    }
}

/// Background task owning one transcoder child
pub(crate) struct ProcessTask {
    pub shared: Arc<ProcessShared>,
    pub source: Source,
    pub layout: OutputLayout,
    pub launcher: Arc<dyn TranscoderLauncher>,
    pub config: Arc<SupervisorConfig>,
    /// Ceiling slot, released when the task ends
    pub permit: OwnedSemaphorePermit,
}

enum Outcome {
    Stopped,
    Failed(String),
    /// The caller of `start` went away before the stream came up
    Abandoned,
}

impl ProcessTask {
    /// Run until stopped or the retry policy gives up.
    ///
    /// `ready` resolves once the first start either produced output or failed.
    /// A failed first start is reported to the caller instead of retried.
    pub async fn run(
        self,
        ready: oneshot::Sender<Result<()>>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        let key = self.shared.key.clone();
        let mut ready = Some(ready);
        let mut attempt: u32 = 0;

        loop {
            let stop_requested = *stop_rx.borrow();
            if stop_requested || !self.shared.transition(StreamState::Starting).await {
                break;
            }

            let mut active_since = None;
            let failure = match self.spawn().await {
                Ok(mut running) => {
                    let outcome = self
                        .supervise(&mut running, &mut stop_rx, &mut ready, &mut active_since)
                        .await;
                    terminate(&mut running.child, self.config.stop_grace, &key).await;
                    match outcome {
                        Outcome::Stopped => break,
                        Outcome::Failed(reason) => reason,
                        Outcome::Abandoned => {
                            tracing::warn!(stream = %key, "Start abandoned by caller, tearing down");
                            if let Err(e) = self.layout.remove().await {
                                tracing::warn!(stream = %key, error = %e, "Failed to remove output directory");
                            }
                            self.shared.transition(StreamState::Stopping).await;
                            self.shared.transition(StreamState::Stopped).await;
                            break;
                        }
                    }
                }
                Err(e) => format!("spawn failed: {}", e),
            };

            if let Some(tx) = ready.take() {
                self.shared.fail(failure.clone(), true).await;
                if let Err(e) = self.layout.remove().await {
                    tracing::warn!(stream = %key, error = %e, "Failed to remove output directory");
                }
                let _ = tx.send(Err(Error::unreachable(&key.source_id, failure)));
                return;
            }

            let policy = &self.config.restart;
            // a run that stayed up long enough starts a fresh retry budget
            if active_since.is_some_and(|t: Instant| t.elapsed() >= policy.max_backoff) {
                attempt = 0;
            }
            let exhausted = !policy.enabled || attempt >= policy.max_attempts;
            if !self.shared.fail(failure, exhausted).await {
                // stop already in progress
                break;
            }
            if exhausted {
                tracing::error!(
                    stream = %key,
                    attempts = attempt,
                    "Restart attempts exhausted, giving up"
                );
                if let Err(e) = self.layout.remove().await {
                    tracing::warn!(stream = %key, error = %e, "Failed to remove output directory");
                }
                break;
            }

            attempt += 1;
            let delay = policy.backoff(attempt);
            self.shared.info.write().await.restarts += 1;
            tracing::info!(
                stream = %key,
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                "Restarting transcoder"
            );

            tokio::select! {
                _ = sleep(delay) => {}
                _ = stop_rx.changed() => break,
            }

            if let Err(e) = self.layout.reset().await {
                tracing::warn!(stream = %key, error = %e, "Failed to reset output directory");
            }
        }

        drop(self.permit);
    }

    async fn spawn(&self) -> Result<Running> {
        let request = LaunchRequest {
            source: &self.source,
            tier: self.shared.key.tier,
            layout: &self.layout,
            segment_seconds: self.config.segment_seconds,
            segment_window: self.config.segment_window,
        };

        let mut cmd = self.launcher.command(&request);
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let pid = child.id();

        {
            let mut info = self.shared.info.write().await;
            info.pid = pid;
            info.started_at = Some(Utc::now());
            info.frames = 0;
            info.fps = None;
        }

        tracing::debug!(stream = %self.shared.key, pid = ?pid, "Transcoder spawned");

        Ok(Running {
            stdout: child.stdout.take().map(|s| BufReader::new(s).lines()),
            stderr: child.stderr.take().map(|s| BufReader::new(s).lines()),
            child,
            last_stderr: None,
            key: self.shared.key.clone(),
        })
    }

    async fn supervise(
        &self,
        running: &mut Running,
        stop_rx: &mut watch::Receiver<bool>,
        ready: &mut Option<oneshot::Sender<Result<()>>>,
        active_since: &mut Option<Instant>,
    ) -> Outcome {
        let startup = self.config.startup_timeout;
        let deadline = Instant::now() + startup;

        loop {
            tokio::select! {
                _ = stop_rx.changed() => return Outcome::Stopped,
                _ = sleep_until(deadline) => {
                    return Outcome::Failed(running.reason(format!(
                        "no output within {}s",
                        startup.as_secs_f32()
                    )));
                }
                event = running.next_event() => match event {
                    OutputEvent::Progress(progress) => {
                        self.shared.record_progress(&progress).await;
                        break;
                    }
                    OutputEvent::Other => {}
                    OutputEvent::Exited(reason) => return Outcome::Failed(reason),
                },
            }
        }

        if !self.shared.transition(StreamState::Active).await {
            return Outcome::Stopped;
        }
        *active_since = Some(Instant::now());
        if let Some(tx) = ready.take() {
            if tx.send(Ok(())).is_err() {
                return Outcome::Abandoned;
            }
        }

        let liveness = self.config.liveness_timeout;
        let mut last_activity = Instant::now();

        loop {
            tokio::select! {
                _ = stop_rx.changed() => return Outcome::Stopped,
                _ = sleep_until(last_activity + liveness) => {
                    return Outcome::Failed(running.reason(format!(
                        "no activity for {}s",
                        liveness.as_secs_f32()
                    )));
                }
                event = running.next_event() => match event {
                    OutputEvent::Progress(progress) => {
                        last_activity = Instant::now();
                        self.shared.record_progress(&progress).await;
                    }
                    OutputEvent::Other => {}
                    OutputEvent::Exited(reason) => return Outcome::Failed(reason),
                },
            }
        }
    }
}

enum OutputEvent {
    Progress(ProgressLine),
    Other,
    Exited(String),
}

struct Running {
    child: Child,
    stdout: Option<Lines<BufReader<ChildStdout>>>,
    stderr: Option<Lines<BufReader<ChildStderr>>>,
    /// Last diagnostic line, reported as the failure reason
    last_stderr: Option<String>,
    key: StreamKey,
}

impl Running {
    async fn next_event(&mut self) -> OutputEvent {
        tokio::select! {
            line = next_line(&mut self.stdout) => {
                match line.as_deref().and_then(parse_progress) {
                    Some(ProgressLine::End) | None => OutputEvent::Other,
                    Some(progress) => OutputEvent::Progress(progress),
                }
            }
            line = next_line(&mut self.stderr) => {
                if let Some(line) = line {
                    self.note_stderr(&line);
                }
                OutputEvent::Other
            }
            status = self.child.wait() => {
                let status = match status {
                    Ok(status) => status.to_string(),
                    Err(e) => e.to_string(),
                };
                self.drain_stderr().await;
                OutputEvent::Exited(self.reason(format!("transcoder exited ({})", status)))
            }
        }
    }

    fn note_stderr(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        // ffmpeg echoes the input URI in its errors
        let line = redact_credentials(line);
        tracing::debug!(stream = %self.key, "transcoder: {}", line);
        self.last_stderr = Some(line);
    }

    async fn drain_stderr(&mut self) {
        while let Ok(Some(line)) =
            timeout(Duration::from_millis(100), next_line(&mut self.stderr)).await
        {
            self.note_stderr(&line);
        }
    }

    fn reason(&self, what: String) -> String {
        match &self.last_stderr {
            Some(line) => format!("{}: {}", what, line),
            None => what,
        }
    }
}

/// Next line from an optional reader; pends forever once the reader hit EOF
async fn next_line<R: AsyncBufRead + Unpin>(lines: &mut Option<Lines<R>>) -> Option<String> {
    let result = match lines.as_mut() {
        Some(reader) => reader.next_line().await,
        None => return std::future::pending().await,
    };
    match result {
        Ok(Some(line)) => Some(line),
        _ => {
            *lines = None;
            None
        }
    }
}

/// Graceful terminate: SIGTERM, wait up to `grace`, then SIGKILL
pub(crate) async fn terminate(child: &mut Child, grace: Duration, key: &StreamKey) {
    if matches!(child.try_wait(), Ok(Some(_))) {
        return;
    }

    if send_sigterm(child) {
        match timeout(grace, child.wait()).await {
            Ok(_) => {
                tracing::debug!(stream = %key, "Transcoder exited after SIGTERM");
                return;
            }
            Err(_) => tracing::warn!(
                stream = %key,
                grace_ms = grace.as_millis() as u64,
                "Transcoder ignored SIGTERM, killing"
            ),
        }
    }

    if let Err(e) = child.kill().await {
        tracing::warn!(stream = %key, error = %e, "Failed to kill transcoder");
    }
}

#[cfg(unix)]
fn send_sigterm(child: &Child) -> bool {
    match child.id() {
        // SAFETY: kill(2) with a pid we spawned and have not yet reaped
        Some(pid) => unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 },
        None => false,
    }
}

#[cfg(not(unix))]
fn send_sigterm(_child: &Child) -> bool {
    false
}
