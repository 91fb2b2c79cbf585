//! Burns face boxes and emotion labels into a frame.

use crate::types::{FaceLabel, FaceRegion, LabeledFace};
use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use std::path::Path;
use thiserror::Error;

pub const BOX_COLOR: Rgb<u8> = Rgb([0, 0, 255]);
pub const LABEL_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
/// Outline width in pixels.
pub const BOX_THICKNESS: u32 = 2;
/// Label glyph height in pixels.
pub const LABEL_SCALE: f32 = 24.0;
pub const DEFAULT_FONT_PATH: &str = "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf";

#[derive(Error, Debug)]
pub enum AnnotatorError {
    #[error("font file not found: {0}")]
    FontNotFound(String),
    #[error("failed to read font: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid font: {0}")]
    InvalidFont(String),
}

/// One region's overlay as drawn on the frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Overlay {
    pub region: FaceRegion,
    pub label: FaceLabel,
    /// Top-left corner of the label text.
    pub text_origin: (i32, i32),
}

/// A frame with its overlays burned in.
pub struct AnnotatedFrame {
    pub image: RgbImage,
    pub overlays: Vec<Overlay>,
}

pub struct Annotator {
    font: Option<FontArc>,
}

impl Annotator {
    pub fn new(font: FontArc) -> Self {
        Self { font: Some(font) }
    }

    /// Load a TrueType/OpenType font for label text.
    pub fn load(font_path: &str) -> Result<Self, AnnotatorError> {
        if !Path::new(font_path).exists() {
            return Err(AnnotatorError::FontNotFound(font_path.to_string()));
        }
        let data = std::fs::read(font_path)?;
        let font = FontArc::try_from_vec(data)
            .map_err(|e| AnnotatorError::InvalidFont(format!("{font_path}: {e}")))?;
        tracing::info!(path = font_path, "loaded label font");
        Ok(Self::new(font))
    }

    /// Draw boxes only; overlays are still reported with their labels.
    pub fn boxes_only() -> Self {
        Self { font: None }
    }

    /// Draw one box and one label per face, each at its own region.
    pub fn annotate(&self, mut image: RgbImage, faces: &[LabeledFace]) -> AnnotatedFrame {
        let mut overlays = Vec::with_capacity(faces.len());

        for face in faces {
            let region = face.region;
            draw_box(&mut image, &region);

            let text_origin = label_origin(&region);
            if let Some(font) = &self.font {
                draw_text_mut(
                    &mut image,
                    LABEL_COLOR,
                    text_origin.0,
                    text_origin.1,
                    PxScale::from(LABEL_SCALE),
                    font,
                    face.label.as_str(),
                );
            }

            overlays.push(Overlay {
                region,
                label: face.label,
                text_origin,
            });
        }

        AnnotatedFrame { image, overlays }
    }
}

/// Label sits on the box's top edge, starting at its left side.
pub fn label_origin(region: &FaceRegion) -> (i32, i32) {
    let y = (region.y as f32 - LABEL_SCALE).max(0.0) as i32;
    (region.x as i32, y)
}

fn draw_box(image: &mut RgbImage, region: &FaceRegion) {
    for inset in 0..BOX_THICKNESS {
        let w = region.width.saturating_sub(2 * inset);
        let h = region.height.saturating_sub(2 * inset);
        if w == 0 || h == 0 {
            break;
        }
        let rect = Rect::at((region.x + inset) as i32, (region.y + inset) as i32).of_size(w, h);
        draw_hollow_rect_mut(image, rect, BOX_COLOR);
    }
}
