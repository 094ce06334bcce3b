use anyhow::{Context, Result};
use rollcall_core::{EmbeddingStore, InsightFaceAnalyzer, L2Matcher, SystemClock};
use rollcall_hw::V4l2Camera;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod annotate;
mod config;
mod db;
mod dbus_interface;
mod listener;
mod mjpeg;
mod photos;
mod pipeline;
mod preview;
mod recognition;
mod service;
mod session;
mod stream;
#[cfg(test)]
mod testing;

use config::Config;
use pipeline::{FramePipeline, PipelineSlot};
use service::{RollcallService, ServiceParts, ServiceSettings};
use session::{SessionKind, SessionSettings};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::from_env();
    tracing::info!(
        camera = %config.camera_device,
        width = config.camera_width,
        height = config.camera_height,
        model_dir = %config.model_dir.display(),
        db = %config.db_path.display(),
        threshold = config.recognition_threshold,
        process_every = config.process_every,
        "configuration loaded"
    );

    let clock = Arc::new(SystemClock);
    let db = Arc::new(db::Database::open(&config.db_path, clock.clone()).context("failed to open database")?);

    let store = Arc::new(EmbeddingStore::new(db.clone()));
    let known = store.load().context("failed to load enrolled embeddings")?;
    tracing::info!(known, "enrolled embeddings loaded");

    let analyzer = InsightFaceAnalyzer::load(
        &config.scrfd_model_path(),
        &config.arcface_model_path(),
        config.detection_size,
    )
    .context("failed to load face models")?;
    let camera = V4l2Camera::new(config.camera_settings());
    let pipeline = FramePipeline::new(Box::new(camera), Box::new(analyzer), config.process_every);

    let service = Arc::new(RollcallService::new(ServiceParts {
        slot: PipelineSlot::new(pipeline),
        store,
        matcher: Arc::new(L2Matcher),
        sink: db.clone(),
        clock,
        overlay: Arc::new(annotate::Overlay::load(&config.font_path)),
        settings: ServiceSettings {
            threshold: config.recognition_threshold,
            cooldown_minutes: config.attendance_cooldown_minutes,
            auto_mark: config.auto_mark,
            session: SessionSettings {
                jpeg_quality: config.jpeg_quality,
                ..SessionSettings::default()
            },
        },
    }));

    for (kind, addr) in [
        (SessionKind::Recognition, config.recognition_addr),
        (SessionKind::EnrollmentPreview, config.preview_addr),
    ] {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {kind} stream on {addr}"))?;
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            if let Err(e) = listener::serve(listener, kind, service).await {
                tracing::error!(kind = %kind, error = %e, "stream listener stopped");
            }
        });
    }

    let bus = dbus_interface::RollcallBus {
        service: Arc::clone(&service),
        db,
        photo_dir: config.photo_dir.clone(),
    };
    let builder = if config.session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _connection = builder
        .name(dbus_interface::BUS_NAME)?
        .serve_at(dbus_interface::OBJECT_PATH, bus)?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(
        recognition = %config.recognition_addr,
        preview = %config.preview_addr,
        bus = dbus_interface::BUS_NAME,
        "rollcalld ready"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    let released = tokio::task::spawn_blocking(move || service.shutdown(Duration::from_secs(2))).await?;
    if !released {
        tracing::warn!("a session did not stop in time");
    }

    Ok(())
}
