//! moodcam-core: face localization and emotion labelling.
//!
//! A Haar cascade finds faces, an ONNX model scores each 48x48 crop
//! against five emotions, and the annotated frame is encoded as JPEG.

pub mod annotator;
pub mod cascade;
pub mod classifier;
pub mod detector;
pub mod encoder;
pub mod pipeline;
pub mod types;

pub use annotator::{Annotator, AnnotatorError, Overlay};
pub use classifier::{EmotionClassifier, FaceCrop, OnnxEmotionClassifier};
pub use detector::{FaceLocalizer, HaarDetector};
pub use encoder::{encode_jpeg, EncodeError};
pub use pipeline::{
    default_model_dir, to_grayscale, FramePipeline, LoadError, ModelArtifacts, PipelineError,
    ProcessedFrame,
};
pub use types::{Emotion, FaceLabel, FaceRegion, LabeledFace};
