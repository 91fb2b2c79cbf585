//! Per-frame processing: grayscale, localize, classify, annotate, encode.

use crate::annotator::{AnnotatedFrame, Annotator, AnnotatorError, Overlay};
use crate::classifier::{ClassifierError, EmotionClassifier, FaceCrop, OnnxEmotionClassifier};
use crate::detector::{DetectorError, FaceLocalizer, HaarDetector};
use crate::encoder::{encode_image, EncodeError};
use crate::types::{FaceLabel, FaceRegion, LabeledFace};
use image::{GrayImage, RgbImage};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

pub const CASCADE_FILE: &str = "haarcascade_frontalface_default.xml";
pub const EMOTION_MODEL_FILE: &str = "emotion_model.onnx";

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("encoding failed: {0}")]
    Encoding(#[from] EncodeError),
}

/// A model artifact failed to load at startup.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("face detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("emotion classifier: {0}")]
    Classifier(#[from] ClassifierError),
    #[error("label font: {0}")]
    Font(#[from] AnnotatorError),
}

/// Locations of the artifacts the pipeline needs.
#[derive(Debug, Clone)]
pub struct ModelArtifacts {
    pub cascade_path: PathBuf,
    pub classifier_path: PathBuf,
    pub font_path: PathBuf,
}

impl ModelArtifacts {
    /// Standard file names inside `model_dir`, plus an explicit font.
    pub fn in_dir(model_dir: &Path, font_path: impl Into<PathBuf>) -> Self {
        Self {
            cascade_path: model_dir.join(CASCADE_FILE),
            classifier_path: model_dir.join(EMOTION_MODEL_FILE),
            font_path: font_path.into(),
        }
    }
}

/// `$XDG_DATA_HOME/moodcam/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("moodcam/models")
}

/// One processed frame: the labels, where each was drawn, and the encoded JPEG.
#[derive(Debug, Clone)]
pub struct ProcessedFrame {
    pub faces: Vec<LabeledFace>,
    pub overlays: Vec<Overlay>,
    pub jpeg: Vec<u8>,
}

/// BT.601 luma, matching the usual RGB→gray conversion of capture stacks.
pub fn to_grayscale(rgb: &RgbImage) -> GrayImage {
    GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let [r, g, b] = rgb.get_pixel(x, y).0;
        let luma = (299 * r as u32 + 587 * g as u32 + 114 * b as u32 + 500) / 1000;
        image::Luma([luma as u8])
    })
}

/// Stateless frame processor shared by every capture session.
///
/// Holds only read-only models; no label or region survives from one
/// frame to the next.
pub struct FramePipeline {
    localizer: Arc<dyn FaceLocalizer>,
    classifier: Arc<dyn EmotionClassifier>,
    annotator: Annotator,
}

impl FramePipeline {
    pub fn new(
        localizer: Arc<dyn FaceLocalizer>,
        classifier: Arc<dyn EmotionClassifier>,
        annotator: Annotator,
    ) -> Self {
        Self {
            localizer,
            classifier,
            annotator,
        }
    }

    /// Load every artifact; any missing or malformed file is fatal.
    pub fn load(artifacts: &ModelArtifacts) -> Result<Self, LoadError> {
        let detector = HaarDetector::load(&artifacts.cascade_path.to_string_lossy())?;
        let classifier = OnnxEmotionClassifier::load(&artifacts.classifier_path.to_string_lossy())?;
        let annotator = Annotator::load(&artifacts.font_path.to_string_lossy())?;
        Ok(Self::new(Arc::new(detector), Arc::new(classifier), annotator))
    }

    /// Detect faces and label each one from its own crop.
    pub fn label_faces(&self, gray: &GrayImage) -> Vec<LabeledFace> {
        self.localizer
            .detect(gray)
            .into_iter()
            .map(|region| LabeledFace {
                region,
                label: self.label_region(gray, &region),
            })
            .collect()
    }

    fn label_region(&self, gray: &GrayImage, region: &FaceRegion) -> FaceLabel {
        let Some(crop) = FaceCrop::from_region(gray, region) else {
            return FaceLabel::Unknown;
        };
        if crop.is_degenerate() {
            tracing::debug!(?region, "blank face crop; not classified");
            return FaceLabel::Unknown;
        }
        match self.classifier.classify(&crop) {
            Ok(emotion) => FaceLabel::Emotion(emotion),
            Err(e) => {
                tracing::warn!(error = %e, ?region, "emotion classification failed");
                FaceLabel::Unknown
            }
        }
    }

    /// Full per-frame transform: the returned JPEG carries a box and label
    /// for every detected face, or the unmodified frame when there are none.
    pub fn process(&self, frame: RgbImage) -> Result<ProcessedFrame, PipelineError> {
        let gray = to_grayscale(&frame);
        let faces = self.label_faces(&gray);
        let AnnotatedFrame { image, overlays } = self.annotator.annotate(frame, &faces);
        let jpeg = encode_image(&image)?;
        Ok(ProcessedFrame {
            faces,
            overlays,
            jpeg,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Emotion;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Returns a fixed list of regions regardless of input.
    struct FixedLocalizer(Vec<FaceRegion>);

    impl FaceLocalizer for FixedLocalizer {
        fn detect(&self, _gray: &GrayImage) -> Vec<FaceRegion> {
            self.0.clone()
        }
    }

    /// Labels by mean crop brightness: dark → sad, bright → happy.
    struct BrightnessClassifier {
        calls: AtomicUsize,
    }

    impl BrightnessClassifier {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl EmotionClassifier for BrightnessClassifier {
        fn classify(&self, crop: &FaceCrop) -> Result<Emotion, ClassifierError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mean = crop.pixels().iter().map(|&p| p as u32).sum::<u32>()
                / crop.pixels().len() as u32;
            Ok(if mean > 127 {
                Emotion::Happy
            } else {
                Emotion::Sad
            })
        }
    }

    struct FailingClassifier;

    impl EmotionClassifier for FailingClassifier {
        fn classify(&self, _crop: &FaceCrop) -> Result<Emotion, ClassifierError> {
            Err(ClassifierError::InferenceFailed("boom".into()))
        }
    }

    fn pipeline(regions: Vec<FaceRegion>, classifier: Arc<dyn EmotionClassifier>) -> FramePipeline {
        FramePipeline::new(
            Arc::new(FixedLocalizer(regions)),
            classifier,
            Annotator::boxes_only(),
        )
    }

    /// Left half dark gray, right half white.
    fn split_frame() -> RgbImage {
        RgbImage::from_fn(100, 50, |x, _| {
            if x < 50 {
                image::Rgb([40, 40, 40])
            } else {
                image::Rgb([250, 250, 250])
            }
        })
    }

    #[test]
    fn test_grayscale_weights() {
        let rgb = RgbImage::from_fn(3, 1, |x, _| match x {
            0 => image::Rgb([255, 0, 0]),
            1 => image::Rgb([0, 255, 0]),
            _ => image::Rgb([0, 0, 255]),
        });
        let gray = to_grayscale(&rgb);
        assert_eq!(gray.get_pixel(0, 0).0[0], 76);
        assert_eq!(gray.get_pixel(1, 0).0[0], 150);
        assert_eq!(gray.get_pixel(2, 0).0[0], 29);
    }

    #[test]
    fn test_each_face_labelled_from_own_region() {
        let regions = vec![FaceRegion::new(0, 0, 50, 50), FaceRegion::new(50, 0, 50, 50)];
        let p = pipeline(regions.clone(), Arc::new(BrightnessClassifier::new()));
        let faces = p.label_faces(&to_grayscale(&split_frame()));

        assert_eq!(faces.len(), 2);
        assert_eq!(faces[0].region, regions[0]);
        assert_eq!(faces[0].label, FaceLabel::Emotion(Emotion::Sad));
        assert_eq!(faces[1].region, regions[1]);
        assert_eq!(faces[1].label, FaceLabel::Emotion(Emotion::Happy));
    }

    #[test]
    fn test_blank_crop_is_unknown_and_skips_classifier() {
        let classifier = Arc::new(BrightnessClassifier::new());
        let p = pipeline(vec![FaceRegion::new(0, 0, 10, 10)], classifier.clone());
        let faces = p.label_faces(&GrayImage::new(20, 20));

        assert_eq!(faces[0].label, FaceLabel::Unknown);
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_blank_crop_does_not_reuse_previous_label() {
        let p = pipeline(
            vec![FaceRegion::new(50, 0, 50, 50)],
            Arc::new(BrightnessClassifier::new()),
        );
        let first = p.label_faces(&to_grayscale(&split_frame()));
        assert_eq!(first[0].label, FaceLabel::Emotion(Emotion::Happy));

        let second = p.label_faces(&GrayImage::new(100, 50));
        assert_eq!(second[0].label, FaceLabel::Unknown);
    }

    #[test]
    fn test_classifier_failure_is_unknown() {
        let p = pipeline(vec![FaceRegion::new(0, 0, 20, 20)], Arc::new(FailingClassifier));
        let faces = p.label_faces(&to_grayscale(&split_frame()));
        assert_eq!(faces[0].label, FaceLabel::Unknown);
    }

    #[test]
    fn test_process_without_faces_encodes_frame() {
        let p = pipeline(Vec::new(), Arc::new(BrightnessClassifier::new()));
        let frame = split_frame();
        let out = p.process(frame.clone()).unwrap();

        assert!(out.faces.is_empty());
        assert!(out.overlays.is_empty());
        assert_eq!(out.jpeg, encode_image(&frame).unwrap());
    }

    #[test]
    fn test_process_with_faces_differs_from_plain() {
        let p = pipeline(
            vec![FaceRegion::new(10, 10, 20, 20)],
            Arc::new(BrightnessClassifier::new()),
        );
        let frame = split_frame();
        let out = p.process(frame.clone()).unwrap();

        assert_eq!(out.faces.len(), 1);
        assert_eq!(out.overlays.len(), 1);
        let overlay = out.overlays[0];
        assert_eq!(overlay.region, FaceRegion::new(10, 10, 20, 20));
        assert_eq!(overlay.label, out.faces[0].label);
        // Label clamped to the top edge
        assert_eq!(overlay.text_origin, (10, 0));
        assert_ne!(out.jpeg, encode_image(&frame).unwrap());
        assert_eq!(&out.jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_artifacts_in_dir() {
        let a = ModelArtifacts::in_dir(Path::new("/models"), "/fonts/f.ttf");
        assert_eq!(a.cascade_path, Path::new("/models").join(CASCADE_FILE));
        assert_eq!(a.classifier_path, Path::new("/models").join(EMOTION_MODEL_FILE));
        assert_eq!(a.font_path, Path::new("/fonts/f.ttf"));
    }

    #[test]
    fn test_load_missing_artifacts_fails() {
        let a = ModelArtifacts::in_dir(Path::new("/nonexistent"), "/nonexistent/f.ttf");
        assert!(matches!(
            FramePipeline::load(&a),
            Err(LoadError::Detector(DetectorError::ModelNotFound(_)))
        ));
    }
}
