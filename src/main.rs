//! livecam-relay
//!
//! Main entry point for the relay server.

use livecam_relay::{
    detection_dispatch::DetectionDispatch,
    detector::{Detector, HttpDetector},
    realtime_gateway::RealtimeGateway,
    snapshot_service::{FrameSource, SnapshotService},
    source_registry::SourceRegistry,
    state::{AppConfig, AppState, SystemHealth},
    stream_supervisor::{FfmpegLauncher, StreamSupervisor},
    web_api,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "livecam_relay=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting livecam-relay v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Arc::new(AppConfig::from_env()?);
    tracing::info!(
        sources_file = %config.sources_file.display(),
        hls_dir = %config.hls_dir.display(),
        snapshot_dir = %config.snapshot_dir.display(),
        detector_url = ?config.detector_url,
        max_stream_processes = config.max_stream_processes,
        "Configuration loaded"
    );

    match SnapshotService::check_ffmpeg(&config.ffmpeg_bin).await {
        Ok(version) => tracing::info!(version = %version, "ffmpeg available"),
        Err(e) => tracing::warn!(error = %e, "ffmpeg check failed, streams will not start"),
    }

    // Initialize components
    let sources = Arc::new(SourceRegistry::load_from_file(&config.sources_file).await?);

    let snapshots = Arc::new(SnapshotService::new(config.snapshot_config(), sources.clone()).await?);
    tracing::info!("SnapshotService initialized");

    tokio::fs::create_dir_all(&config.hls_dir).await?;
    let supervisor = Arc::new(StreamSupervisor::new(
        config.supervisor_config(),
        sources.clone(),
        Arc::new(FfmpegLauncher::new(&config.ffmpeg_bin)),
        snapshots.clone() as Arc<dyn FrameSource>,
    ));

    let detector: Option<Arc<dyn Detector>> = match &config.detector_url {
        Some(url) => {
            let detector = HttpDetector::new(url.clone(), config.detection_timeout)?;
            if !detector.health_check().await {
                tracing::warn!(url = %url, "Detector not reachable yet, jobs will fail until it is");
            }
            Some(Arc::new(detector) as Arc<dyn Detector>)
        }
        None => None,
    };

    let (dispatch, detection_results) = DetectionDispatch::new(
        config.dispatch_config(),
        snapshots.clone() as Arc<dyn FrameSource>,
        detector.clone(),
    );
    let dispatch = Arc::new(dispatch);
    dispatch.start().await;

    let gateway = Arc::new(RealtimeGateway::new(
        supervisor.clone(),
        dispatch.clone(),
        snapshots.clone(),
    ));
    gateway.spawn_forwarders(detection_results);
    tracing::info!("RealtimeGateway initialized");

    // Keep-alive streams
    for (source_id, tier) in &config.pinned_streams {
        match gateway.pin(source_id, Some(tier.as_str())).await {
            Ok(out) => tracing::info!(
                source_id = %source_id,
                tier = %tier,
                manifest_url = %out.manifest_url,
                "Pinned stream started"
            ),
            Err(e) => tracing::error!(
                source_id = %source_id,
                tier = %tier,
                error = %e,
                "Failed to start pinned stream"
            ),
        }
    }

    let system_health = Arc::new(RwLock::new(SystemHealth::default()));

    let state = AppState {
        config: config.clone(),
        sources,
        supervisor: supervisor.clone(),
        dispatch: dispatch.clone(),
        detector,
        snapshots,
        gateway,
        system_health,
        started_at: chrono::Utc::now(),
    };

    // Routes plus the output trees
    let mut app = web_api::create_router(state.clone())
        .nest_service("/live", ServeDir::new(&config.hls_dir))
        .nest_service("/snapshots", ServeDir::new(&config.snapshot_dir));

    if let Some(static_dir) = &config.static_dir {
        let serve_dir =
            ServeDir::new(static_dir).not_found_service(ServeFile::new(static_dir.join("index.html")));
        app = app.fallback_service(serve_dir);
        tracing::info!(static_dir = %static_dir.display(), "Static file serving enabled");
    }

    let app = app
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http());

    // Start system health monitoring
    let health_monitor = state.system_health.clone();
    tokio::spawn(async move {
        use sysinfo::System;
        let mut sys = System::new_all();
        let mut interval = tokio::time::interval(Duration::from_secs(30));

        loop {
            interval.tick().await;
            sys.refresh_cpu();
            sys.refresh_memory();

            let cpu = {
                let cpus = sys.cpus();
                if cpus.is_empty() {
                    0.0
                } else {
                    cpus.iter().map(|c| c.cpu_usage()).sum::<f32>() / cpus.len() as f32
                }
            };
            let memory = if sys.total_memory() > 0 {
                (sys.used_memory() as f32 / sys.total_memory() as f32) * 100.0
            } else {
                0.0
            };

            let mut health = health_monitor.write().await;
            health.update(cpu, memory);
            if health.overloaded {
                tracing::warn!(cpu = cpu, memory = memory, "Host overloaded");
            }
        }
    });

    // Start server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down");
    dispatch.shutdown().await;
    supervisor.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
}
