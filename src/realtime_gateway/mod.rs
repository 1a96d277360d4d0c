//! RealtimeGateway - viewer connections and fan-out
//!
//! ## Responsibilities
//!
//! - Connection registry (one outbound queue per connection)
//! - Interest bookkeeping: subscribe / unsubscribe / change tier / pins
//! - Starting and stopping StreamProcesses as interest appears and disappears
//! - Detection scheduling while a source has viewers
//! - Fan-out of lifecycle and detection events to interested connections only
//!
//! ## Design
//!
//! Process decisions for one `(source_id, tier)` run under that stream's
//! lease: the interest table is read while the lease is held and the stream
//! is started or stopped to match. A last unsubscribe racing a first
//! subscribe therefore always ends with a process iff someone still wants it,
//! while other tiers of the same source proceed in parallel.
//!
//! The detection cadence is reconciled afterwards under a short per-source
//! lease that is never held across a process start or stop.

mod interest;
mod messages;

pub use interest::{InterestTable, StreamInterest};
pub use messages::{ClientMessage, ErrorPayload, ServerMessage};

use crate::detection_dispatch::{DetectionDispatch, DetectionResult};
use crate::error::{Error, Result};
use crate::key_lock::{KeyLease, KeyedLocks};
use crate::quality_tier::Tier;
use crate::snapshot_service::SnapshotService;
use crate::stream_supervisor::{LifecycleEvent, OutputDescriptor, StreamKey, StreamSupervisor};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Tier used when a client does not name one
pub const DEFAULT_TIER: Tier = Tier::Thumbnail;

struct ClientConnection {
    id: Uuid,
    tx: mpsc::UnboundedSender<String>,
    /// Opted into the all-detections channel
    watch_all: bool,
}

/// RealtimeGateway instance
pub struct RealtimeGateway {
    supervisor: Arc<StreamSupervisor>,
    dispatch: Arc<DetectionDispatch>,
    snapshots: Arc<SnapshotService>,
    connections: RwLock<HashMap<Uuid, ClientConnection>>,
    interest: Mutex<InterestTable>,
    stream_locks: KeyedLocks<StreamKey>,
    cadence_locks: KeyedLocks<String>,
    connection_count: AtomicU64,
}

impl RealtimeGateway {
    pub fn new(
        supervisor: Arc<StreamSupervisor>,
        dispatch: Arc<DetectionDispatch>,
        snapshots: Arc<SnapshotService>,
    ) -> Self {
        Self {
            supervisor,
            dispatch,
            snapshots,
            connections: RwLock::new(HashMap::new()),
            interest: Mutex::new(InterestTable::new()),
            stream_locks: KeyedLocks::new(),
            cadence_locks: KeyedLocks::new(),
            connection_count: AtomicU64::new(0),
        }
    }

    /// Register a connection; the greeting is already queued on the receiver
    pub async fn register(&self) -> (Uuid, mpsc::UnboundedReceiver<String>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        self.connections.write().await.insert(
            id,
            ClientConnection {
                id,
                tx,
                watch_all: false,
            },
        );
        self.connection_count.fetch_add(1, Ordering::Relaxed);
        tracing::info!(connection_id = %id, "Client connected");

        self.send_to(&id, &ServerMessage::Connected { connection_id: id })
            .await;
        (id, rx)
    }

    /// Drop a connection and release every interest it held
    pub async fn unregister(&self, id: &Uuid) {
        if self.connections.write().await.remove(id).is_none() {
            return;
        }
        self.connection_count.fetch_sub(1, Ordering::Relaxed);

        let released = self.interest.lock().await.remove_client(*id);
        tracing::info!(
            connection_id = %id,
            released = released.len(),
            "Client disconnected"
        );

        for key in &released {
            if let Err(e) = self.release(key).await {
                tracing::warn!(stream = %key, error = %e, "Release on disconnect failed");
            }
        }
        let sources: HashSet<&str> = released.iter().map(|k| k.source_id.as_str()).collect();
        for source_id in sources {
            self.sync_detection(source_id).await;
        }
    }

    /// Subscribe `client` to a source. Subscribing at another tier than the
    /// one already held is a tier change.
    pub async fn subscribe(
        &self,
        client: Uuid,
        source_id: &str,
        tier: Option<&str>,
    ) -> Result<OutputDescriptor> {
        let tier = parse_tier(tier)?;

        let held = self.interest.lock().await.tier_of(client, source_id);
        if let Some(held) = held.filter(|held| *held != tier) {
            return self.move_tier(client, source_id, held, tier).await;
        }

        let key = StreamKey::new(source_id, tier);
        let out = {
            let _lease = self.lease(&key).await?;
            let out = self.supervisor.start(source_id, tier).await?;
            self.interest.lock().await.add(client, &key);
            out
        };
        self.sync_detection(source_id).await;

        tracing::info!(
            connection_id = %client,
            source_id = %source_id,
            tier = %tier,
            "Subscribed"
        );
        Ok(out)
    }

    /// Drop `client`'s interest in a source; returns the tier it held
    pub async fn unsubscribe(&self, client: Uuid, source_id: &str) -> Result<Option<Tier>> {
        let Some(tier) = self.interest.lock().await.remove(client, source_id) else {
            return Ok(None);
        };
        tracing::info!(connection_id = %client, source_id = %source_id, tier = %tier, "Unsubscribed");

        let released = self.release(&StreamKey::new(source_id, tier)).await;
        self.sync_detection(source_id).await;
        released?;
        Ok(Some(tier))
    }

    /// Move `client` to another tier of a source it already watches
    pub async fn change_tier(
        &self,
        client: Uuid,
        source_id: &str,
        tier: &str,
    ) -> Result<(Tier, OutputDescriptor)> {
        let new = parse_tier(Some(tier))?;

        let held = self
            .interest
            .lock()
            .await
            .tier_of(client, source_id)
            .ok_or_else(|| Error::NotFound(format!("not subscribed to {}", source_id)))?;

        if held == new {
            let _lease = self.lease(&StreamKey::new(source_id, new)).await?;
            let out = self.supervisor.start(source_id, new).await?;
            return Ok((held, out));
        }
        let out = self.move_tier(client, source_id, held, new).await?;
        Ok((held, out))
    }

    /// One-shot capture cached for viewers; returns the image URL
    pub async fn take_snapshot(&self, source_id: &str) -> Result<String> {
        let frame = self.supervisor.snapshot(source_id).await?;
        self.snapshots.save_cache(source_id, &frame).await?;
        Ok(self.snapshots.image_url(source_id))
    }

    /// Keep a stream alive without viewers
    pub async fn pin(&self, source_id: &str, tier: Option<&str>) -> Result<OutputDescriptor> {
        let tier = parse_tier(tier)?;
        let key = StreamKey::new(source_id, tier);
        let _lease = self.lease(&key).await?;

        let out = self.supervisor.start(source_id, tier).await?;
        if self.interest.lock().await.pin(&key) {
            tracing::info!(source_id = %source_id, tier = %tier, "Stream pinned");
        }
        Ok(out)
    }

    /// Remove a pin; the process stops unless a viewer still watches it.
    /// Returns whether a pin existed.
    pub async fn unpin(&self, source_id: &str, tier: Option<&str>) -> Result<bool> {
        let tier = parse_tier(tier)?;
        let key = StreamKey::new(source_id, tier);

        let was_pinned = self.interest.lock().await.unpin(&key);
        if was_pinned {
            tracing::info!(source_id = %source_id, tier = %tier, "Stream unpinned");
        }
        self.release(&key).await?;
        Ok(was_pinned)
    }

    /// `client` currently holds `old`. Both streams are leased for the move;
    /// the cadence is reconciled once they are released.
    async fn move_tier(
        &self,
        client: Uuid,
        source_id: &str,
        old: Tier,
        new: Tier,
    ) -> Result<OutputDescriptor> {
        let result = self.move_tier_leased(client, source_id, old, new).await;
        self.sync_detection(source_id).await;
        result
    }

    async fn move_tier_leased(
        &self,
        client: Uuid,
        source_id: &str,
        old: Tier,
        new: Tier,
    ) -> Result<OutputDescriptor> {
        let old_key = StreamKey::new(source_id, old);
        let new_key = StreamKey::new(source_id, new);
        let _leases = self.lease_pair(&old_key, &new_key).await?;

        let sole_owner = {
            let interest = self.interest.lock().await;
            interest.subscriber_count(&old_key) == 1 && !interest.is_pinned(&old_key)
        };

        let result = if sole_owner {
            self.supervisor.change_tier(source_id, old, new).await
        } else {
            self.supervisor.start(source_id, new).await
        };

        match result {
            Ok(out) => {
                // replaces the old tier in one step, so the source never looks unwatched
                self.interest.lock().await.add(client, &new_key);
                tracing::info!(
                    connection_id = %client,
                    source_id = %source_id,
                    from = %old,
                    to = %new,
                    "Tier changed"
                );
                // other holders of the old tier may have left meanwhile
                self.release_leased(&old_key).await?;
                Ok(out)
            }
            Err(e) => {
                // the old process may already be gone when the ceiling forced stop-first
                if self.supervisor.status(source_id, old).await.is_none() {
                    self.interest.lock().await.remove(client, source_id);
                }
                Err(e)
            }
        }
    }

    /// Stop `key` if nobody wants it any more
    async fn release(&self, key: &StreamKey) -> Result<()> {
        let _lease = self.lease(key).await?;
        self.release_leased(key).await
    }

    /// Caller holds the lease for `key`
    async fn release_leased(&self, key: &StreamKey) -> Result<()> {
        let wanted = self.interest.lock().await.stream_wanted(key);
        if !wanted {
            self.supervisor.stop(&key.source_id, key.tier).await?;
        }
        Ok(())
    }

    /// Match the detection cadence to the interest table: scheduled iff some
    /// client watches the source at any tier. Pins do not count.
    async fn sync_detection(&self, source_id: &str) {
        let _lease = match self.cadence_locks.acquire(&source_id.to_string()).await {
            Ok(lease) => lease,
            Err(e) => {
                tracing::warn!(source_id = %source_id, error = %e, "Detection cadence lock failed");
                return;
            }
        };

        let watched = self.interest.lock().await.source_watched(source_id);
        if watched {
            if self.dispatch.schedule(source_id).await {
                tracing::debug!(source_id = %source_id, "Detection cadence started for new viewer");
            }
        } else if self.dispatch.unschedule(source_id).await {
            tracing::debug!(source_id = %source_id, "No viewers left, detection stopped");
        }
    }

    async fn lease(&self, key: &StreamKey) -> Result<KeyLease<StreamKey>> {
        self.stream_locks
            .acquire(key)
            .await
            .map_err(|e| Error::Internal(format!("stream {} lock: {}", key, e)))
    }

    async fn lease_pair(
        &self,
        a: &StreamKey,
        b: &StreamKey,
    ) -> Result<(KeyLease<StreamKey>, KeyLease<StreamKey>)> {
        // fixed order so two opposite tier changes cannot deadlock
        let (first, second) = if a < b { (a, b) } else { (b, a) };
        let first = self.lease(first).await?;
        let second = self.lease(second).await?;
        Ok((first, second))
    }

    #[cfg(test)]
    fn lock_entries(&self) -> usize {
        self.stream_locks.len() + self.cadence_locks.len()
    }

    /// Handle one text frame from a connection
    pub async fn handle_client_message(&self, client: Uuid, text: &str) {
        let msg: ClientMessage = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!(connection_id = %client, error = %e, "Unparseable client message");
                let err = Error::Validation(format!("invalid message: {}", e));
                self.send_to(&client, &ServerMessage::Error(ErrorPayload::new(None, &err)))
                    .await;
                return;
            }
        };

        let reply = match msg {
            ClientMessage::StartStream { source_id, tier } => {
                match self.subscribe(client, &source_id, tier.as_deref()).await {
                    Ok(out) => ServerMessage::StreamStarted {
                        source_id,
                        tier: out.tier,
                        manifest_url: out.manifest_url,
                    },
                    Err(e) => ServerMessage::StartStreamError(ErrorPayload::new(Some(&source_id), &e)),
                }
            }
            ClientMessage::StopStream { source_id } => {
                match self.unsubscribe(client, &source_id).await {
                    Ok(Some(tier)) => ServerMessage::StreamStatus {
                        source_id,
                        tier,
                        status: crate::stream_supervisor::LifecycleStatus::Stopped,
                        reason: None,
                    },
                    Ok(None) => {
                        let err = Error::NotFound(format!("not subscribed to {}", source_id));
                        ServerMessage::StopStreamError(ErrorPayload::new(Some(&source_id), &err))
                    }
                    Err(e) => ServerMessage::StopStreamError(ErrorPayload::new(Some(&source_id), &e)),
                }
            }
            ClientMessage::ChangeQuality { source_id, tier } => {
                match self.change_tier(client, &source_id, &tier).await {
                    Ok((previous_tier, out)) => ServerMessage::QualityChanged {
                        source_id,
                        previous_tier,
                        tier: out.tier,
                        manifest_url: out.manifest_url,
                    },
                    Err(e) => {
                        ServerMessage::ChangeQualityError(ErrorPayload::new(Some(&source_id), &e))
                    }
                }
            }
            ClientMessage::RequestSnapshot { source_id } => {
                match self.take_snapshot(&source_id).await {
                    Ok(image_url) => ServerMessage::SnapshotReady {
                        source_id,
                        image_url,
                    },
                    Err(e) => ServerMessage::SnapshotError(ErrorPayload::new(Some(&source_id), &e)),
                }
            }
            ClientMessage::SubscribeAllDetections => {
                self.set_watch_all(&client, true).await;
                return;
            }
            ClientMessage::UnsubscribeAllDetections => {
                self.set_watch_all(&client, false).await;
                return;
            }
        };

        self.send_to(&client, &reply).await;
    }

    async fn set_watch_all(&self, client: &Uuid, enabled: bool) {
        if let Some(conn) = self.connections.write().await.get_mut(client) {
            conn.watch_all = enabled;
            tracing::debug!(connection_id = %client, enabled = enabled, "All-detections channel toggled");
        }
    }

    /// Deliver a detection to viewers of its source and all-detections watchers
    pub async fn publish_detection(&self, result: DetectionResult) {
        let mut recipients = self.interest.lock().await.clients_of_source(&result.source_id);

        let message = ServerMessage::Detection {
            source_id: result.source_id,
            detections: result.detections,
            produced_at: result.produced_at,
        };
        let connections = self.connections.read().await;
        recipients.extend(connections.values().filter(|c| c.watch_all).map(|c| c.id));
        self.fan_out(&connections, &recipients, &message);
    }

    /// Deliver a lifecycle event to subscribers of exactly that stream
    pub async fn publish_lifecycle(&self, event: LifecycleEvent) {
        let recipients: HashSet<Uuid> = self
            .interest
            .lock()
            .await
            .subscribers(&event.key)
            .into_iter()
            .collect();
        if recipients.is_empty() {
            return;
        }

        let message = ServerMessage::StreamStatus {
            source_id: event.key.source_id,
            tier: event.key.tier,
            status: event.status,
            reason: event.reason,
        };
        let connections = self.connections.read().await;
        self.fan_out(&connections, &recipients, &message);
    }

    fn fan_out(
        &self,
        connections: &HashMap<Uuid, ClientConnection>,
        recipients: &HashSet<Uuid>,
        message: &ServerMessage,
    ) {
        if recipients.is_empty() {
            return;
        }
        let json = match serde_json::to_string(message) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize message");
                return;
            }
        };

        tracing::debug!(
            message_type = message.type_name(),
            recipients = recipients.len(),
            "Fan-out"
        );
        for id in recipients {
            if let Some(conn) = connections.get(id) {
                if let Err(e) = conn.tx.send(json.clone()) {
                    tracing::warn!(connection_id = %conn.id, error = %e, "Failed to send message");
                }
            }
        }
    }

    async fn send_to(&self, client: &Uuid, message: &ServerMessage) {
        let connections = self.connections.read().await;
        let recipients = HashSet::from([*client]);
        self.fan_out(&connections, &recipients, message);
    }

    /// Forward supervisor lifecycle events and detection results into fan-out
    pub fn spawn_forwarders(
        self: &Arc<Self>,
        mut results: mpsc::UnboundedReceiver<DetectionResult>,
    ) -> Vec<JoinHandle<()>> {
        let gateway = self.clone();
        let mut events = self.supervisor.subscribe_events();
        let lifecycle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => gateway.publish_lifecycle(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped = skipped, "Lifecycle fan-out lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let gateway = self.clone();
        let detections = tokio::spawn(async move {
            while let Some(result) = results.recv().await {
                gateway.publish_detection(result).await;
            }
        });

        vec![lifecycle, detections]
    }

    pub fn connection_count(&self) -> u64 {
        self.connection_count.load(Ordering::Relaxed)
    }

    pub async fn interest_summary(&self) -> Vec<StreamInterest> {
        self.interest.lock().await.summary()
    }
}

fn parse_tier(tier: Option<&str>) -> Result<Tier> {
    tier.map_or(Ok(DEFAULT_TIER), |t| t.parse())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream_supervisor::{LifecycleStatus, StreamState};
    use crate::test_support::{gateway_rig, gateway_rig_with_ceiling, ScriptLauncher};
    use chrono::Utc;
    use serde_json::Value;
    use std::time::Duration;
    use tokio::time::Instant;

    fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(text) = rx.try_recv() {
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }

    fn types(messages: &[Value]) -> Vec<String> {
        messages
            .iter()
            .map(|m| m["type"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    fn detection(source_id: &str) -> DetectionResult {
        DetectionResult {
            source_id: source_id.to_string(),
            detections: Vec::new(),
            produced_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_register_sends_greeting() {
        let rig = gateway_rig(ScriptLauncher::healthy()).await;
        let (id, mut rx) = rig.gateway.register().await;

        let messages = drain(&mut rx);
        assert_eq!(types(&messages), vec!["connected"]);
        assert_eq!(messages[0]["data"]["connection_id"], id.to_string());
        assert_eq!(rig.gateway.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_shared_stream_lives_until_last_viewer_leaves() {
        let rig = gateway_rig(ScriptLauncher::healthy()).await;
        let gw = &rig.gateway;
        let (a, _rx_a) = gw.register().await;
        let (b, _rx_b) = gw.register().await;

        gw.subscribe(a, "cam1", Some("thumbnail")).await.unwrap();
        gw.subscribe(b, "cam1", Some("thumbnail")).await.unwrap();
        assert_eq!(rig.supervisor.list().await.len(), 1);
        assert!(rig.dispatch.is_scheduled("cam1").await);

        gw.unregister(&a).await;
        let info = rig.supervisor.status("cam1", Tier::Thumbnail).await.unwrap();
        assert_eq!(info.state, StreamState::Active);
        assert!(rig.dispatch.is_scheduled("cam1").await);

        gw.unregister(&b).await;
        assert!(rig.supervisor.status("cam1", Tier::Thumbnail).await.is_none());
        assert!(!rig.dispatch.is_scheduled("cam1").await);
        assert_eq!(gw.connection_count(), 0);

        rig.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_disconnect_releases_all_sources() {
        let rig = gateway_rig(ScriptLauncher::healthy()).await;
        let gw = &rig.gateway;
        let (a, _rx) = gw.register().await;

        gw.subscribe(a, "cam1", Some("preview")).await.unwrap();
        gw.subscribe(a, "cam2", Some("hd")).await.unwrap();
        assert_eq!(rig.supervisor.list().await.len(), 2);

        gw.unregister(&a).await;
        assert!(rig.supervisor.list().await.is_empty());
        assert!(gw.interest_summary().await.is_empty());
    }

    #[tokio::test]
    async fn test_change_tier_for_sole_viewer() {
        let rig = gateway_rig(ScriptLauncher::healthy()).await;
        let gw = &rig.gateway;
        let (a, _rx) = gw.register().await;

        gw.subscribe(a, "cam1", Some("thumbnail")).await.unwrap();
        assert!(rig.dispatch.is_scheduled("cam1").await);

        let (previous, out) = gw.change_tier(a, "cam1", "hd").await.unwrap();

        assert_eq!(previous, Tier::Thumbnail);
        assert_eq!(out.tier, Tier::Hd);
        assert!(rig.supervisor.status("cam1", Tier::Thumbnail).await.is_none());
        assert!(rig.supervisor.status("cam1", Tier::Hd).await.is_some());
        assert!(rig.dispatch.is_scheduled("cam1").await);

        let summary = gw.interest_summary().await;
        assert_eq!(summary.len(), 1);
        assert_eq!((summary[0].tier, summary[0].subscribers), (Tier::Hd, 1));

        rig.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_change_tier_at_ceiling_keeps_detection() {
        let rig = gateway_rig_with_ceiling(ScriptLauncher::healthy(), 1).await;
        let gw = &rig.gateway;
        let (a, _rx) = gw.register().await;

        gw.subscribe(a, "cam1", Some("thumbnail")).await.unwrap();
        assert_eq!(rig.supervisor.running_count(), 1);
        assert!(rig.dispatch.is_scheduled("cam1").await);

        // no room for both tiers, so the old one is stopped first
        let (_, out) = gw.change_tier(a, "cam1", "hd").await.unwrap();
        assert_eq!(out.tier, Tier::Hd);
        assert!(rig.supervisor.status("cam1", Tier::Thumbnail).await.is_none());
        assert_eq!(
            rig.supervisor.status("cam1", Tier::Hd).await.unwrap().state,
            StreamState::Active
        );
        assert!(rig.dispatch.is_scheduled("cam1").await);
        assert_eq!(gw.interest_summary().await[0].tier, Tier::Hd);

        rig.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_join_not_delayed_by_start_on_other_tier() {
        let rig = gateway_rig(ScriptLauncher::silent_on(Tier::Hd)).await;
        let gw = rig.gateway.clone();
        let (a, _rx_a) = gw.register().await;
        let (b, _rx_b) = gw.register().await;
        let (c, _rx_c) = gw.register().await;

        gw.subscribe(a, "cam1", Some("thumbnail")).await.unwrap();

        let hd = {
            let gw = gw.clone();
            tokio::spawn(async move { gw.subscribe(b, "cam1", Some("hd")).await })
        };
        // hd is now inside its startup window
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!hd.is_finished());

        let began = Instant::now();
        gw.subscribe(c, "cam1", Some("thumbnail")).await.unwrap();
        gw.unsubscribe(a, "cam1").await.unwrap();
        assert!(
            began.elapsed() < Duration::from_secs(1),
            "thumbnail join took {:?}",
            began.elapsed()
        );

        let err = hd.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), "SourceUnreachable");
        assert!(rig.supervisor.status("cam1", Tier::Hd).await.is_none());

        let summary = gw.interest_summary().await;
        assert_eq!(summary.len(), 1);
        assert_eq!((summary[0].tier, summary[0].subscribers), (Tier::Thumbnail, 1));
        assert!(rig.dispatch.is_scheduled("cam1").await);

        rig.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_subscribes_leave_no_lock_entries() {
        let rig = gateway_rig(ScriptLauncher::healthy()).await;
        let gw = &rig.gateway;
        let (a, _rx) = gw.register().await;

        for i in 0..1000 {
            let source_id = format!("bogus_{}", i);
            assert!(gw.subscribe(a, &source_id, None).await.is_err());
        }
        gw.unregister(&a).await;

        assert_eq!(gw.lock_entries(), 0);
        assert_eq!(rig.supervisor.lock_entries(), 0);
    }

    #[tokio::test]
    async fn test_change_tier_keeps_shared_old_tier() {
        let rig = gateway_rig(ScriptLauncher::healthy()).await;
        let gw = &rig.gateway;
        let (a, _rx_a) = gw.register().await;
        let (b, _rx_b) = gw.register().await;

        gw.subscribe(a, "cam1", None).await.unwrap();
        gw.subscribe(b, "cam1", None).await.unwrap();
        gw.change_tier(a, "cam1", "standard").await.unwrap();

        assert!(rig.supervisor.status("cam1", Tier::Thumbnail).await.is_some());
        assert!(rig.supervisor.status("cam1", Tier::Standard).await.is_some());

        gw.unregister(&b).await;
        assert!(rig.supervisor.status("cam1", Tier::Thumbnail).await.is_none());
        assert!(rig.supervisor.status("cam1", Tier::Standard).await.is_some());

        rig.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_change_tier_requires_subscription() {
        let rig = gateway_rig(ScriptLauncher::healthy()).await;
        let (a, _rx) = rig.gateway.register().await;

        let err = rig.gateway.change_tier(a, "cam1", "hd").await.unwrap_err();
        assert_eq!(err.kind(), "NotFound");
        assert!(rig.supervisor.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_subscribe_records_nothing() {
        let rig = gateway_rig(ScriptLauncher::healthy()).await;
        let gw = &rig.gateway;
        let (a, _rx) = gw.register().await;

        let err = gw.subscribe(a, "cam1", Some("ultra")).await.unwrap_err();
        assert_eq!(err.kind(), "UnknownTier");

        let err = gw.subscribe(a, "not_registered", None).await.unwrap_err();
        assert_eq!(err.kind(), "SourceUnreachable");

        assert!(gw.interest_summary().await.is_empty());
        assert!(!rig.dispatch.is_scheduled("not_registered").await);
        assert!(rig.supervisor.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_detection_isolation() {
        let rig = gateway_rig(ScriptLauncher::healthy()).await;
        let gw = &rig.gateway;
        let (x, mut rx_x) = gw.register().await;
        let (y, mut rx_y) = gw.register().await;
        let (z, mut rx_z) = gw.register().await;

        gw.subscribe(x, "cam1", None).await.unwrap();
        gw.subscribe(y, "cam2", None).await.unwrap();
        gw.handle_client_message(z, r#"{"type":"subscribe_all_detections"}"#)
            .await;
        drain(&mut rx_x);
        drain(&mut rx_y);
        drain(&mut rx_z);

        gw.publish_detection(detection("cam1")).await;

        let to_x = drain(&mut rx_x);
        assert_eq!(types(&to_x), vec!["detection"]);
        assert_eq!(to_x[0]["data"]["source_id"], "cam1");
        assert!(drain(&mut rx_y).is_empty());
        assert_eq!(types(&drain(&mut rx_z)), vec!["detection"]);

        gw.handle_client_message(z, r#"{"type":"unsubscribe_all_detections"}"#)
            .await;
        gw.publish_detection(detection("cam2")).await;
        assert!(drain(&mut rx_x).is_empty());
        assert_eq!(types(&drain(&mut rx_y)), vec!["detection"]);
        assert!(drain(&mut rx_z).is_empty());

        rig.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_lifecycle_goes_to_exact_stream_subscribers() {
        let rig = gateway_rig(ScriptLauncher::healthy()).await;
        let gw = &rig.gateway;
        let (a, mut rx_a) = gw.register().await;
        let (b, mut rx_b) = gw.register().await;

        gw.subscribe(a, "cam1", Some("thumbnail")).await.unwrap();
        gw.subscribe(b, "cam1", Some("hd")).await.unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        gw.publish_lifecycle(LifecycleEvent {
            key: StreamKey::new("cam1", Tier::Hd),
            status: LifecycleStatus::Error,
            reason: Some("no activity for 20s".to_string()),
            terminal: false,
            at: Utc::now(),
        })
        .await;

        assert!(drain(&mut rx_a).is_empty());
        let to_b = drain(&mut rx_b);
        assert_eq!(types(&to_b), vec!["stream_status"]);
        assert_eq!(to_b[0]["data"]["status"], "error");
        assert_eq!(to_b[0]["data"]["reason"], "no activity for 20s");

        rig.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_pin_survives_viewers() {
        let rig = gateway_rig(ScriptLauncher::healthy()).await;
        let gw = &rig.gateway;
        let (a, _rx) = gw.register().await;

        gw.pin("cam1", Some("preview")).await.unwrap();
        assert!(!rig.dispatch.is_scheduled("cam1").await);

        gw.subscribe(a, "cam1", Some("preview")).await.unwrap();
        gw.unsubscribe(a, "cam1").await.unwrap();
        assert!(rig.supervisor.status("cam1", Tier::Preview).await.is_some());
        assert!(!rig.dispatch.is_scheduled("cam1").await);

        assert!(gw.unpin("cam1", Some("preview")).await.unwrap());
        assert!(rig.supervisor.status("cam1", Tier::Preview).await.is_none());
        assert!(!gw.unpin("cam1", Some("preview")).await.unwrap());
    }

    #[tokio::test]
    async fn test_racing_unsubscribe_and_subscribe() {
        let rig = gateway_rig(ScriptLauncher::healthy()).await;
        let gw = rig.gateway.clone();
        let (a, _rx_a) = gw.register().await;
        let (b, _rx_b) = gw.register().await;

        gw.subscribe(a, "cam1", None).await.unwrap();

        let leave = {
            let gw = gw.clone();
            tokio::spawn(async move { gw.unsubscribe(a, "cam1").await })
        };
        let join = {
            let gw = gw.clone();
            tokio::spawn(async move { gw.subscribe(b, "cam1", None).await })
        };
        leave.await.unwrap().unwrap();
        join.await.unwrap().unwrap();

        let info = rig.supervisor.status("cam1", DEFAULT_TIER).await.unwrap();
        assert_eq!(info.state, StreamState::Active);
        let summary = gw.interest_summary().await;
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].subscribers, 1);

        gw.unregister(&b).await;
        assert!(rig.supervisor.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_client_messages_round_trip() {
        let rig = gateway_rig(ScriptLauncher::healthy()).await;
        let gw = &rig.gateway;
        let (a, mut rx) = gw.register().await;
        drain(&mut rx);

        gw.handle_client_message(
            a,
            r#"{"type":"start_stream","data":{"source_id":"cam1","tier":"preview"}}"#,
        )
        .await;
        let started = drain(&mut rx);
        assert_eq!(types(&started), vec!["stream_started"]);
        assert_eq!(
            started[0]["data"]["manifest_url"],
            "/live/cam1/preview/index.m3u8"
        );

        gw.handle_client_message(
            a,
            r#"{"type":"change_quality","data":{"source_id":"cam1","tier":"hd"}}"#,
        )
        .await;
        let changed = drain(&mut rx);
        assert_eq!(types(&changed), vec!["quality_changed"]);
        assert_eq!(changed[0]["data"]["previous_tier"], "preview");

        gw.handle_client_message(a, r#"{"type":"request_snapshot","data":{"source_id":"cam1"}}"#)
            .await;
        let snap = drain(&mut rx);
        assert_eq!(types(&snap), vec!["snapshot_ready"]);
        assert_eq!(snap[0]["data"]["image_url"], "/snapshots/cam1/latest.jpg");

        gw.handle_client_message(
            a,
            r#"{"type":"request_snapshot","data":{"source_id":"missing_source"}}"#,
        )
        .await;
        let failed = drain(&mut rx);
        assert_eq!(types(&failed), vec!["snapshot_error"]);
        assert_eq!(failed[0]["data"]["error_kind"], "CaptureFailed");

        gw.handle_client_message(a, r#"{"type":"stop_stream","data":{"source_id":"cam1"}}"#)
            .await;
        let stopped = drain(&mut rx);
        assert_eq!(types(&stopped), vec!["stream_status"]);
        assert_eq!(stopped[0]["data"]["status"], "stopped");
        assert!(rig.supervisor.list().await.is_empty());

        gw.handle_client_message(a, "not json").await;
        assert_eq!(types(&drain(&mut rx)), vec!["error"]);
    }
}
