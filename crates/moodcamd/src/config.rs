use moodcam_core::annotator::DEFAULT_FONT_PATH;
use moodcam_core::ModelArtifacts;
use std::path::PathBuf;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// HTTP listen address (default: 127.0.0.1:5000).
    pub bind_addr: String,
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Requested capture resolution.
    pub frame_width: u32,
    pub frame_height: u32,
    /// Directory containing the cascade XML and emotion ONNX model.
    pub model_dir: PathBuf,
    /// TrueType font used for label text.
    pub font_path: PathBuf,
}

impl Config {
    /// Load configuration from `MOODCAM_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("MOODCAM_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| moodcam_core::default_model_dir());

        Self {
            bind_addr: std::env::var("MOODCAM_BIND_ADDR")
                .unwrap_or_else(|_| "127.0.0.1:5000".to_string()),
            camera_device: std::env::var("MOODCAM_CAMERA_DEVICE")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            frame_width: env_u32("MOODCAM_FRAME_WIDTH", 640),
            frame_height: env_u32("MOODCAM_FRAME_HEIGHT", 480),
            model_dir,
            font_path: std::env::var("MOODCAM_FONT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_FONT_PATH)),
        }
    }

    pub fn artifacts(&self) -> ModelArtifacts {
        ModelArtifacts::in_dir(&self.model_dir, self.font_path.clone())
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
