//! Real-time channel messages
//!
//! Both directions use the `{"type": ..., "data": {...}}` envelope.

use crate::detector::Detection;
use crate::error::Error;
use crate::quality_tier::Tier;
use crate::stream_supervisor::LifecycleStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Client -> server
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum ClientMessage {
    StartStream {
        source_id: String,
        /// Defaults to thumbnail
        #[serde(default)]
        tier: Option<String>,
    },
    StopStream {
        source_id: String,
    },
    ChangeQuality {
        source_id: String,
        tier: String,
    },
    RequestSnapshot {
        source_id: String,
    },
    SubscribeAllDetections,
    UnsubscribeAllDetections,
}

/// Error payload shared by the `*_error` messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    pub error_kind: String,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(source_id: Option<&str>, err: &Error) -> Self {
        Self {
            source_id: source_id.map(str::to_string),
            error_kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// Server -> client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        connection_id: Uuid,
    },
    StreamStarted {
        source_id: String,
        tier: Tier,
        manifest_url: String,
    },
    StreamStatus {
        source_id: String,
        tier: Tier,
        status: LifecycleStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    QualityChanged {
        source_id: String,
        previous_tier: Tier,
        tier: Tier,
        manifest_url: String,
    },
    Detection {
        source_id: String,
        detections: Vec<Detection>,
        produced_at: DateTime<Utc>,
    },
    SnapshotReady {
        source_id: String,
        image_url: String,
    },
    StartStreamError(ErrorPayload),
    StopStreamError(ErrorPayload),
    ChangeQualityError(ErrorPayload),
    SnapshotError(ErrorPayload),
    /// Unparseable client message
    Error(ErrorPayload),
}

impl ServerMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            ServerMessage::Connected { .. } => "connected",
            ServerMessage::StreamStarted { .. } => "stream_started",
            ServerMessage::StreamStatus { .. } => "stream_status",
            ServerMessage::QualityChanged { .. } => "quality_changed",
            ServerMessage::Detection { .. } => "detection",
            ServerMessage::SnapshotReady { .. } => "snapshot_ready",
            ServerMessage::StartStreamError(_) => "start_stream_error",
            ServerMessage::StopStreamError(_) => "stop_stream_error",
            ServerMessage::ChangeQualityError(_) => "change_quality_error",
            ServerMessage::SnapshotError(_) => "snapshot_error",
            ServerMessage::Error(_) => "error",
        }
    }
}
