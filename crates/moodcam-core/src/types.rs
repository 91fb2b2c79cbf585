use serde::{Deserialize, Serialize};
use std::fmt;

/// Rectangle around a detected face, in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl FaceRegion {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Number of emotion classes the classifier scores.
pub const EMOTION_CLASSES: usize = 5;

/// Closed set of emotions, in classifier output order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    Angry,
    Happy,
    Neutral,
    Sad,
    Surprise,
}

impl Emotion {
    pub const ALL: [Emotion; EMOTION_CLASSES] = [
        Emotion::Angry,
        Emotion::Happy,
        Emotion::Neutral,
        Emotion::Sad,
        Emotion::Surprise,
    ];

    /// Map a classifier output index to its emotion.
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Emotion::Angry => "angry",
            Emotion::Happy => "happy",
            Emotion::Neutral => "neutral",
            Emotion::Sad => "sad",
            Emotion::Surprise => "surprise",
        }
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Label drawn for one face in one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaceLabel {
    Emotion(Emotion),
    /// The crop could not be classified (blank crop, inference failure).
    Unknown,
}

impl FaceLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaceLabel::Emotion(e) => e.as_str(),
            FaceLabel::Unknown => "unknown",
        }
    }

    pub fn emotion(&self) -> Option<Emotion> {
        match self {
            FaceLabel::Emotion(e) => Some(*e),
            FaceLabel::Unknown => None,
        }
    }
}

impl fmt::Display for FaceLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A face region bound to the label computed from its own crop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabeledFace {
    pub region: FaceRegion,
    pub label: FaceLabel,
}
