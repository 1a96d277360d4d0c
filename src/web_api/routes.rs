//! API Routes

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};

use crate::detection_dispatch::DispatchStats;
use crate::error::Result;
use crate::models::{ApiResponse, HostStats};
use crate::quality_tier::{Tier, TierSpec};
use crate::realtime_gateway::StreamInterest;
use crate::source_registry::Source;
use crate::state::AppState;
use crate::stream_supervisor::{OutputDescriptor, StreamProcessInfo};

/// Create API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health
        .route("/healthz", get(super::health_check))
        // Streams
        .route("/streams/start", post(start_stream))
        .route("/streams/stop", post(stop_stream))
        .route("/streams/stats", get(stream_stats))
        .route("/tiers", get(list_tiers))
        // Snapshots
        .route("/snapshot", post(take_snapshot))
        // Sources
        .route("/sources", get(list_sources))
        .route("/sources", post(register_source))
        // WebSocket
        .route("/ws", get(websocket_handler))
        .with_state(state)
}

// ========================================
// Stream Handlers
// ========================================

#[derive(Debug, Deserialize)]
struct StreamRequest {
    source_id: String,
    /// Defaults to thumbnail
    #[serde(default)]
    tier: Option<String>,
}

/// Pin a stream so it runs without viewers
async fn start_stream(
    State(state): State<AppState>,
    Json(req): Json<StreamRequest>,
) -> Result<Json<ApiResponse<OutputDescriptor>>> {
    let out = state.gateway.pin(&req.source_id, req.tier.as_deref()).await?;
    Ok(Json(ApiResponse::success(out)))
}

#[derive(Debug, Serialize)]
struct StopResponse {
    source_id: String,
    tier: Tier,
    was_pinned: bool,
    /// False when viewers still hold the stream
    stopped: bool,
}

/// Remove a pin; the process only stops when no viewer holds it
async fn stop_stream(
    State(state): State<AppState>,
    Json(req): Json<StreamRequest>,
) -> Result<Json<ApiResponse<StopResponse>>> {
    let was_pinned = state.gateway.unpin(&req.source_id, req.tier.as_deref()).await?;
    let tier: Tier = match req.tier.as_deref() {
        Some(t) => t.parse()?,
        None => crate::realtime_gateway::DEFAULT_TIER,
    };
    let stopped = state.supervisor.status(&req.source_id, tier).await.is_none();

    Ok(Json(ApiResponse::success(StopResponse {
        source_id: req.source_id,
        tier,
        was_pinned,
        stopped,
    })))
}

#[derive(Debug, Serialize)]
struct StreamStats {
    running: usize,
    max_processes: usize,
    processes: Vec<StreamProcessInfo>,
    interest: Vec<StreamInterest>,
    connections: u64,
    detection: DispatchStats,
    host: HostStats,
}

async fn stream_stats(State(state): State<AppState>) -> impl IntoResponse {
    let host = {
        let health = state.system_health.read().await;
        HostStats {
            cpu_percent: health.cpu_percent,
            memory_percent: health.memory_percent,
            overloaded: health.overloaded,
        }
    };

    Json(ApiResponse::success(StreamStats {
        running: state.supervisor.running_count(),
        max_processes: state.supervisor.max_processes(),
        processes: state.supervisor.list().await,
        interest: state.gateway.interest_summary().await,
        connections: state.gateway.connection_count(),
        detection: state.dispatch.stats().await,
        host,
    }))
}

#[derive(Debug, Serialize)]
struct TierEntry {
    tier: Tier,
    #[serde(flatten)]
    spec: TierSpec,
}

async fn list_tiers() -> impl IntoResponse {
    let tiers: Vec<TierEntry> = Tier::ALL
        .iter()
        .map(|tier| TierEntry {
            tier: *tier,
            spec: tier.spec(),
        })
        .collect();
    Json(ApiResponse::success(tiers))
}

// ========================================
// Snapshot Handlers
// ========================================

#[derive(Debug, Deserialize)]
struct SnapshotRequest {
    source_id: String,
}

#[derive(Debug, Serialize)]
struct SnapshotResponse {
    source_id: String,
    image_url: String,
}

async fn take_snapshot(
    State(state): State<AppState>,
    Json(req): Json<SnapshotRequest>,
) -> Result<Json<ApiResponse<SnapshotResponse>>> {
    let image_url = state.gateway.take_snapshot(&req.source_id).await?;
    Ok(Json(ApiResponse::success(SnapshotResponse {
        source_id: req.source_id,
        image_url,
    })))
}

// ========================================
// Source Handlers
// ========================================

async fn list_sources(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(state.sources.list().await))
}

async fn register_source(
    State(state): State<AppState>,
    Json(source): Json<Source>,
) -> Result<Json<ApiResponse<Source>>> {
    let source = state.sources.register(source).await?;
    Ok(Json(ApiResponse::success(source)))
}

// ========================================
// WebSocket Handler
// ========================================

/// WebSocket upgrade handler
async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle WebSocket connection
async fn handle_websocket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    let (conn_id, mut rx) = state.gateway.register().await;

    // gateway -> socket
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg)).await.is_err() {
                break;
            }
        }
    });

    // socket -> gateway; commands run in order per connection
    let gateway = state.gateway.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            match result {
                Ok(Message::Text(text)) => gateway.handle_client_message(conn_id, &text).await,
                Ok(Message::Ping(data)) => {
                    tracing::trace!("Received ping: {:?}", data);
                }
                Ok(Message::Close(_)) => {
                    tracing::info!(connection_id = %conn_id, "WebSocket client disconnected");
                    break;
                }
                Err(e) => {
                    tracing::warn!(connection_id = %conn_id, error = %e, "WebSocket error");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => {
            // let an in-progress command finish so its interest is released below
            if let Err(e) = (&mut recv_task).await {
                tracing::warn!(connection_id = %conn_id, error = %e, "WebSocket receive task failed");
            }
        }
        _ = &mut recv_task => send_task.abort(),
    }

    state.gateway.unregister(&conn_id).await;
}
