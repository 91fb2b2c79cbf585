//! HTTP surface: the annotated multipart feed plus status endpoints.

use crate::engine::{spawn_stream, StreamError, StreamGenerator, STREAM_CONTENT_TYPE};
use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use moodcam_core::FramePipeline;
use moodcam_hw::{Clock, DeviceOpener, ExclusiveDevice, SESSION_DURATION};
use serde::Serialize;
use std::sync::Arc;

/// Shared by every request handler.
pub struct AppState<O: DeviceOpener> {
    pub device: ExclusiveDevice<O>,
    pub pipeline: Arc<FramePipeline>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: &'static str,
    pub camera: String,
    pub camera_busy: bool,
    pub session_seconds: u64,
}

pub fn create_router<O>(state: Arc<AppState<O>>) -> Router
where
    O: DeviceOpener + 'static,
    O::Device: 'static,
{
    Router::new()
        .route("/video_feed_emotion", get(video_feed::<O>))
        .route("/status", get(status::<O>))
        .route("/health", get(health))
        .with_state(state)
}

/// Open a capture session and stream it as `multipart/x-mixed-replace`.
///
/// Responds 503 without a body stream when the camera is held or absent.
async fn video_feed<O>(State(state): State<Arc<AppState<O>>>) -> Response
where
    O: DeviceOpener + 'static,
    O::Device: 'static,
{
    let opener = Arc::clone(&state);
    // Opening a V4L2 device blocks.
    let opened = tokio::task::spawn_blocking(move || {
        StreamGenerator::start(
            &opener.device,
            Arc::clone(&opener.pipeline),
            Arc::clone(&opener.clock),
        )
        .and_then(spawn_stream)
    })
    .await;

    match opened {
        Ok(Ok(stream)) => {
            tracing::info!(device = %state.device.describe(), "emotion stream started");
            (
                [(header::CONTENT_TYPE, STREAM_CONTENT_TYPE)],
                Body::from_stream(stream),
            )
                .into_response()
        }
        Ok(Err(StreamError::DeviceUnavailable(e))) => {
            tracing::warn!(error = %e, "emotion stream refused");
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
        Ok(Err(e)) => {
            tracing::error!(error = %e, "emotion stream failed to start");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "stream open task panicked");
            (StatusCode::INTERNAL_SERVER_ERROR, "stream open failed").into_response()
        }
    }
}

async fn status<O: DeviceOpener>(State(state): State<Arc<AppState<O>>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        camera: state.device.describe(),
        camera_busy: state.device.is_busy(),
        session_seconds: SESSION_DURATION.as_secs(),
    })
}

async fn health() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{test_pipeline, ScriptedOpener, Shot};
    use moodcam_hw::ManualClock;
    use std::time::Duration;

    fn state(script: Vec<Shot>) -> Arc<AppState<ScriptedOpener>> {
        let clock = Arc::new(ManualClock::new());
        let opener = ScriptedOpener::new(script, clock.clone(), Duration::from_millis(10));
        Arc::new(AppState {
            device: ExclusiveDevice::new(opener),
            pipeline: test_pipeline(),
            clock,
        })
    }

    #[tokio::test]
    async fn test_feed_streams_multipart_until_session_ends() {
        let state = state(vec![Shot::Face, Shot::Plain, Shot::Fail]);
        let resp = video_feed(State(Arc::clone(&state))).await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE],
            "multipart/x-mixed-replace; boundary=frame"
        );

        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let marker = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
        let parts = body.windows(marker.len()).filter(|w| *w == marker).count();
        assert_eq!(parts, 2);
        assert!(!state.device.is_busy());
    }

    #[tokio::test]
    async fn test_feed_busy_is_503() {
        let state = state(vec![Shot::Plain; 4]);
        let held = StreamGenerator::start(&state.device, test_pipeline(), Arc::clone(&state.clock))
            .unwrap();

        let resp = video_feed(State(Arc::clone(&state))).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("device busy"));

        drop(held);
        assert!(!state.device.is_busy());
    }

    #[tokio::test]
    async fn test_status_reports_camera() {
        let state = state(Vec::new());
        let Json(status) = status(State(Arc::clone(&state))).await;
        assert_eq!(status.camera, "scripted");
        assert!(!status.camera_busy);
        assert_eq!(status.session_seconds, 5);
    }

    #[tokio::test]
    async fn test_health() {
        assert_eq!(health().await, "ok");
    }
}
