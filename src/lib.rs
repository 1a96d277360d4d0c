//! livecam-relay library
//!
//! Live camera relay: quality-tiered HLS transcoding on demand, real-time
//! fan-out to viewers, and background object detection.
//!
//! ## Architecture
//!
//! 1. SourceRegistry - source_id -> network URI
//! 2. QualityTier - tier name -> resolution / fps / bitrate
//! 3. StreamSupervisor - one external transcoder per (source, tier)
//! 4. SnapshotService - one-shot frame capture and latest-image cache
//! 5. Detector - detection collaborator adapter
//! 6. DetectionDispatch - per-source detection cadence and job queue
//! 7. RealtimeGateway - viewer connections, interest and fan-out
//! 8. WebAPI - REST control routes and the WebSocket endpoint
//!
//! ## Design Principles
//!
//! - A StreamProcess exists iff some viewer (or pin) wants it
//! - Per-key operations are linearized; different keys run in parallel
//! - Detection is best-effort and never disturbs the relay path

pub mod detection_dispatch;
pub mod detector;
pub mod error;
pub mod key_lock;
pub mod models;
pub mod quality_tier;
pub mod realtime_gateway;
pub mod snapshot_service;
pub mod source_registry;
pub mod state;
pub mod stream_supervisor;
pub mod web_api;

#[cfg(test)]
mod test_support;

pub use error::{Error, Result};
pub use state::AppState;
