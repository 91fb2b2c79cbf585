use anyhow::{Context, Result};
use moodcam_core::FramePipeline;
use moodcam_hw::{ExclusiveDevice, SystemClock, V4lOpener};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod server;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "moodcamd starting");

    let config = config::Config::from_env();

    // Models load once, before anything is served.
    let artifacts = config.artifacts();
    let pipeline = FramePipeline::load(&artifacts).with_context(|| {
        format!(
            "failed to load model artifacts from {}",
            config.model_dir.display()
        )
    })?;

    let device = ExclusiveDevice::new(V4lOpener {
        path: config.camera_device.clone(),
        width: config.frame_width,
        height: config.frame_height,
    });

    let state = Arc::new(server::AppState {
        device,
        pipeline: Arc::new(pipeline),
        clock: Arc::new(SystemClock),
    });
    let app = server::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!(
        addr = %config.bind_addr,
        camera = %config.camera_device,
        "moodcamd ready"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    tracing::info!("moodcamd shutting down");
    Ok(())
}
