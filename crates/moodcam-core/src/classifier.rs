//! Facial emotion classifier via ONNX Runtime.
//!
//! Scores a 48x48 grayscale face crop against the five emotion classes
//! (angry, happy, neutral, sad, surprise) and returns the best one.

use crate::types::{Emotion, FaceRegion, EMOTION_CLASSES};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

// --- Named constants ---
/// Side length of the square crop the model expects.
pub const EMOTION_INPUT_SIZE: usize = 48;
const PIXEL_SCALE: f32 = 255.0;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Maps a normalized face crop to one emotion.
///
/// Implementations must be deterministic: the same crop always yields
/// the same label.
pub trait EmotionClassifier: Send + Sync {
    fn classify(&self, crop: &FaceCrop) -> Result<Emotion, ClassifierError>;
}

/// A face cut out of a grayscale frame and resampled to 48x48.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaceCrop {
    pixels: Vec<u8>,
}

impl FaceCrop {
    /// Cut `region` out of `gray` and area-resample it to the model input size.
    ///
    /// The region is clamped to the frame; returns `None` if nothing is left.
    pub fn from_region(gray: &GrayImage, region: &FaceRegion) -> Option<Self> {
        let (fw, fh) = gray.dimensions();
        let x0 = region.x.min(fw);
        let y0 = region.y.min(fh);
        let x1 = region.x.saturating_add(region.width).min(fw);
        let y1 = region.y.saturating_add(region.height).min(fh);
        let (w, h) = ((x1 - x0) as usize, (y1 - y0) as usize);
        if w == 0 || h == 0 {
            return None;
        }

        let stride = fw as usize;
        let raw = gray.as_raw();
        let mut roi = Vec::with_capacity(w * h);
        for y in y0 as usize..y1 as usize {
            let row = y * stride;
            roi.extend_from_slice(&raw[row + x0 as usize..row + x1 as usize]);
        }

        Some(Self {
            pixels: resize_area(&roi, w, h, EMOTION_INPUT_SIZE, EMOTION_INPUT_SIZE),
        })
    }

    /// Wrap an already-resampled 48x48 crop.
    pub fn from_pixels(pixels: Vec<u8>) -> Option<Self> {
        (pixels.len() == EMOTION_INPUT_SIZE * EMOTION_INPUT_SIZE).then_some(Self { pixels })
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// A crop whose pixels sum to zero carries no face information.
    pub fn is_degenerate(&self) -> bool {
        self.pixels.iter().all(|&p| p == 0)
    }

    /// NHWC `[1, 48, 48, 1]` tensor with intensities scaled to [0, 1].
    pub fn to_tensor(&self) -> Array4<f32> {
        let size = EMOTION_INPUT_SIZE;
        let mut tensor = Array4::<f32>::zeros((1, size, size, 1));
        for y in 0..size {
            for x in 0..size {
                tensor[[0, y, x, 0]] = self.pixels[y * size + x] as f32 / PIXEL_SCALE;
            }
        }
        tensor
    }
}

/// Index of the highest score; the lowest index wins ties.
pub fn argmax_first(scores: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &s) in scores.iter().enumerate() {
        if s.is_nan() {
            continue;
        }
        if best.map_or(true, |(_, b)| s > b) {
            best = Some((i, s));
        }
    }
    best.map(|(i, _)| i)
}

/// Pick the emotion from a raw score vector.
pub fn scores_to_emotion(scores: &[f32]) -> Result<Emotion, ClassifierError> {
    if scores.len() != EMOTION_CLASSES {
        return Err(ClassifierError::InferenceFailed(format!(
            "expected {EMOTION_CLASSES} class scores, got {}",
            scores.len()
        )));
    }
    argmax_first(scores)
        .and_then(Emotion::from_index)
        .ok_or_else(|| ClassifierError::InferenceFailed("no finite class score".into()))
}

/// ONNX emotion model, loaded once and shared by every session.
///
/// Inference runs under a lock, so concurrent callers are serialized.
pub struct OnnxEmotionClassifier {
    // ort needs `&mut Session` to run.
    session: Mutex<Session>,
}

impl OnnxEmotionClassifier {
    /// Load the emotion ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, ClassifierError> {
        if !Path::new(model_path).exists() {
            return Err(ClassifierError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded emotion model"
        );

        Ok(Self {
            session: Mutex::new(session),
        })
    }
}

impl EmotionClassifier for OnnxEmotionClassifier {
    fn classify(&self, crop: &FaceCrop) -> Result<Emotion, ClassifierError> {
        let input = crop.to_tensor();

        let mut session = self
            .session
            .lock()
            .map_err(|_| ClassifierError::InferenceFailed("session lock poisoned".into()))?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, scores) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ClassifierError::InferenceFailed(format!("score extraction: {e}")))?;

        scores_to_emotion(scores)
    }
}

/// Area-averaging resize: each output pixel is the coverage-weighted mean
/// of the source pixels under it.
fn resize_area(src: &[u8], width: usize, height: usize, new_w: usize, new_h: usize) -> Vec<u8> {
    let sx = width as f64 / new_w as f64;
    let sy = height as f64 / new_h as f64;
    let mut out = vec![0u8; new_w * new_h];

    for dy in 0..new_h {
        let y0 = dy as f64 * sy;
        let y1 = (dy + 1) as f64 * sy;
        let ys = y0.floor() as usize;
        let ye = (y1.ceil() as usize).min(height);

        for dx in 0..new_w {
            let x0 = dx as f64 * sx;
            let x1 = (dx + 1) as f64 * sx;
            let xs = x0.floor() as usize;
            let xe = (x1.ceil() as usize).min(width);

            let mut acc = 0.0f64;
            let mut weight = 0.0f64;
            for y in ys..ye {
                let wy = y1.min((y + 1) as f64) - y0.max(y as f64);
                if wy <= 0.0 {
                    continue;
                }
                for x in xs..xe {
                    let wx = x1.min((x + 1) as f64) - x0.max(x as f64);
                    if wx <= 0.0 {
                        continue;
                    }
                    acc += src[y * width + x] as f64 * wx * wy;
                    weight += wx * wy;
                }
            }

            out[dy * new_w + dx] = if weight > 0.0 {
                (acc / weight).round().clamp(0.0, 255.0) as u8
            } else {
                0
            };
        }
    }

    out
}
