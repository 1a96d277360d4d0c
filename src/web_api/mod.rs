//! WebAPI - REST API Endpoints
//!
//! ## Responsibilities
//!
//! - HTTP control routes (streams, snapshots, sources, stats)
//! - Real-time channel upgrade
//! - Response formatting

mod routes;

pub use routes::create_router;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;

use crate::models::HealthResponse;
use crate::snapshot_service::SnapshotService;
use crate::state::AppState;

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let ffmpeg = SnapshotService::check_ffmpeg(&state.config.ffmpeg_bin).await.ok();
    let detector_connected = match &state.detector {
        Some(detector) => detector.health_check().await,
        None => false,
    };

    let response = HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_sec: (chrono::Utc::now() - state.started_at).num_seconds().max(0) as u64,
        ffmpeg,
        detector_configured: state.detector.is_some(),
        detector_connected,
        sources: state.sources.count().await,
    };

    Json(response)
}
