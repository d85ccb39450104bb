use anyhow::{Context, Result};
use rollcall_core::{Annotator, FacePipeline, Gallery};
use rollcall_hw::Camera;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

mod attendance;
mod config;
mod engine;
mod http;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "rollcalld starting");

    let config = config::Config::load().context("failed to load configuration")?;
    tracing::debug!(?config, "configuration loaded");

    let store = attendance::AttendanceStore::open(&config.db_path)
        .await
        .with_context(|| format!("failed to open database {}", config.db_path.display()))?;

    let model_dir = config.model_dir.clone();
    let gallery_dir = config.gallery_dir.clone();
    let detect_scale = config.detect_scale;
    let (pipeline, gallery) = tokio::task::spawn_blocking(move || -> Result<_> {
        let mut pipeline = FacePipeline::load(&model_dir, detect_scale)
            .with_context(|| format!("failed to load models from {}", model_dir.display()))?;
        tracing::info!(
            dir = %model_dir.display(),
            detect_scale = pipeline.detect_scale(),
            "face models loaded"
        );

        let (gallery, _skipped) = Gallery::load_dir(&gallery_dir, &mut pipeline)
            .context("failed to load known faces")?;
        Ok((pipeline, gallery))
    })
    .await??;

    if gallery.is_empty() {
        tracing::warn!(dir = %config.gallery_dir.display(), "no known faces enrolled; every face will be Unknown");
    } else {
        tracing::info!(identities = ?gallery.identities(), "known faces loaded");
    }

    let camera = if config.camera_enabled {
        let camera = Camera::open(&config.camera_device, config.frame_width, config.frame_height)
            .with_context(|| format!("failed to open camera {}", config.camera_device))?;
        Some(camera)
    } else {
        tracing::info!("camera disabled; live stream unavailable");
        None
    };

    let annotator = Annotator::new(config.label_font.as_deref());
    let live = engine::LiveRecognizer::new(
        pipeline,
        gallery,
        config.similarity_threshold,
        annotator,
        config.jpeg_quality,
    );
    let gallery_size = live.gallery_size();

    let (sightings_tx, sightings_rx) = mpsc::channel(32);
    let engine = engine::spawn_engine(
        live,
        camera,
        sightings_tx,
        Duration::from_millis(config.idle_poll_ms),
    )?;
    let recorder = attendance::spawn_recorder(store.clone(), sightings_rx);

    let state = Arc::new(http::AppState {
        identifier: Arc::new(engine.handle),
        store,
        frames: engine.frames,
        gallery_size,
    });
    let app = http::router(state, config.max_image_bytes);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "rollcalld ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
        })
        .await?;

    // The router owned the last engine handle; once the engine thread exits
    // the sightings channel closes and the recorder drains what is queued.
    tracing::info!("rollcalld shutting down");
    if let Err(e) = recorder.await {
        tracing::error!(error = %e, "attendance recorder failed");
    }
    Ok(())
}
