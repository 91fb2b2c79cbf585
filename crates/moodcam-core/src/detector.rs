//! Multi-scale Haar cascade face localizer.
//!
//! Scans an image pyramid with a boosted cascade and merges the raw hits
//! into face regions by neighbour voting.

use crate::cascade::{Cascade, IntegralImage, WindowVerdict};
use crate::types::FaceRegion;
use image::GrayImage;
use std::path::Path;
use thiserror::Error;

// --- Detection parameters (observable behaviour, keep in sync with the cascade) ---
/// Pyramid step between scan scales.
pub const SCALE_FACTOR: f64 = 1.3;
/// Minimum number of raw hits a merged region needs beyond itself.
pub const MIN_NEIGHBORS: usize = 5;
/// Relative tolerance used to decide two hits describe the same face.
pub const GROUP_EPS: f64 = 0.2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("cascade file not found: {0}")]
    ModelNotFound(String),
    #[error("failed to read cascade: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid cascade: {0}")]
    InvalidCascade(String),
}

/// Maps a grayscale frame to face regions.
///
/// Implementations are pure functions of their input and hold only
/// read-only state, so one instance serves every session.
pub trait FaceLocalizer: Send + Sync {
    /// Return detected faces in detector order. No faces yields an empty vector.
    fn detect(&self, gray: &GrayImage) -> Vec<FaceRegion>;
}

/// Integer rectangle used while scanning and grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }
}

/// Classical Viola-Jones detector over an OpenCV Haar cascade.
pub struct HaarDetector {
    cascade: Cascade,
    scale_factor: f64,
    min_neighbors: usize,
}

impl HaarDetector {
    /// Load a cascade XML file (e.g. `haarcascade_frontalface_default.xml`).
    pub fn load(path: &str) -> Result<Self, DetectorError> {
        if !Path::new(path).exists() {
            return Err(DetectorError::ModelNotFound(path.to_string()));
        }
        let xml = std::fs::read_to_string(path)?;
        let cascade = Cascade::from_xml(&xml)?;

        tracing::info!(
            path,
            window = ?(cascade.window_width, cascade.window_height),
            stages = cascade.stages.len(),
            features = cascade.features.len(),
            "loaded Haar cascade"
        );

        Ok(Self::new(cascade))
    }

    pub fn new(cascade: Cascade) -> Self {
        Self {
            cascade,
            scale_factor: SCALE_FACTOR,
            min_neighbors: MIN_NEIGHBORS,
        }
    }

    /// Raw window hits across all pyramid levels, in original frame coordinates.
    fn scan(&self, gray: &[u8], width: usize, height: usize) -> Vec<Rect> {
        let ww = self.cascade.window_width as usize;
        let wh = self.cascade.window_height as usize;
        let mut hits = Vec::new();

        let mut factor = 1.0f64;
        loop {
            let win_w = (ww as f64 * factor).round() as usize;
            let win_h = (wh as f64 * factor).round() as usize;
            if win_w > width || win_h > height {
                break;
            }

            let scaled_w = (width as f64 / factor).round() as usize;
            let scaled_h = (height as f64 / factor).round() as usize;
            if scaled_w < ww || scaled_h < wh {
                break;
            }

            let resized;
            let level: &[u8] = if scaled_w == width && scaled_h == height {
                gray
            } else {
                resized = resize_bilinear(gray, width, height, scaled_w, scaled_h);
                &resized
            };
            let ii = IntegralImage::new(level, scaled_w, scaled_h);

            // Coarser stride at small scales, dense above 2x.
            let step = if factor > 2.0 { 1 } else { 2 };
            let max_x = scaled_w - ww + 1;
            let max_y = scaled_h - wh + 1;

            let before = hits.len();
            for y in (0..max_y).step_by(step) {
                let mut x = 0;
                while x < max_x {
                    match self.cascade.evaluate(&ii, x, y) {
                        WindowVerdict::Face => hits.push(Rect::new(
                            (x as f64 * factor).round() as i32,
                            (y as f64 * factor).round() as i32,
                            win_w as i32,
                            win_h as i32,
                        )),
                        // Rejected outright: the neighbouring window almost surely is too.
                        WindowVerdict::Rejected(0) => x += step,
                        _ => {}
                    }
                    x += step;
                }
            }
            tracing::trace!(factor, hits = hits.len() - before, "scanned pyramid level");

            factor *= self.scale_factor;
        }

        hits
    }
}

impl FaceLocalizer for HaarDetector {
    fn detect(&self, gray: &GrayImage) -> Vec<FaceRegion> {
        let (width, height) = gray.dimensions();
        if width == 0 || height == 0 {
            return Vec::new();
        }

        let hits = self.scan(gray.as_raw(), width as usize, height as usize);
        let grouped = group_rectangles(&hits, self.min_neighbors, GROUP_EPS);
        tracing::debug!(raw = hits.len(), faces = grouped.len(), "face detection");

        grouped
            .into_iter()
            .map(|r| {
                FaceRegion::new(
                    r.x.max(0) as u32,
                    r.y.max(0) as u32,
                    r.width.max(0) as u32,
                    r.height.max(0) as u32,
                )
            })
            .collect()
    }
}

/// Merge raw hits into faces by neighbour voting.
///
/// Hits are clustered with the similar-rectangle predicate; each cluster
/// becomes its average rectangle and survives only with more than
/// `group_threshold` members. A surviving cluster nested inside a stronger
/// one is dropped. Output order is cluster first-appearance order.
pub fn group_rectangles(rects: &[Rect], group_threshold: usize, eps: f64) -> Vec<Rect> {
    if group_threshold == 0 || rects.is_empty() {
        return rects.to_vec();
    }

    let (labels, classes) = partition(rects, eps);

    let mut sums = vec![[0i64; 4]; classes];
    let mut counts = vec![0usize; classes];
    for (r, &label) in rects.iter().zip(&labels) {
        let s = &mut sums[label];
        s[0] += r.x as i64;
        s[1] += r.y as i64;
        s[2] += r.width as i64;
        s[3] += r.height as i64;
        counts[label] += 1;
    }

    let averaged: Vec<Rect> = sums
        .iter()
        .zip(&counts)
        .map(|(s, &n)| {
            let k = 1.0 / n as f64;
            Rect::new(
                (s[0] as f64 * k).round() as i32,
                (s[1] as f64 * k).round() as i32,
                (s[2] as f64 * k).round() as i32,
                (s[3] as f64 * k).round() as i32,
            )
        })
        .collect();

    let mut out = Vec::new();
    for i in 0..classes {
        let n1 = counts[i];
        if n1 <= group_threshold {
            continue;
        }
        let r1 = averaged[i];

        let nested = (0..classes).any(|j| {
            let n2 = counts[j];
            if j == i || n2 <= group_threshold {
                return false;
            }
            let r2 = averaged[j];
            let dx = (r2.width as f64 * eps).round() as i32;
            let dy = (r2.height as f64 * eps).round() as i32;

            r1.x >= r2.x - dx
                && r1.y >= r2.y - dy
                && r1.x + r1.width <= r2.x + r2.width + dx
                && r1.y + r1.height <= r2.y + r2.height + dy
                && (n2 > n1.max(3) || n1 < 3)
        });

        if !nested {
            out.push(r1);
        }
    }
    out
}

fn similar(a: &Rect, b: &Rect, eps: f64) -> bool {
    let delta = eps * (a.width.min(b.width) + a.height.min(b.height)) as f64 * 0.5;
    ((a.x - b.x) as f64).abs() <= delta
        && ((a.y - b.y) as f64).abs() <= delta
        && ((a.x + a.width - b.x - b.width) as f64).abs() <= delta
        && ((a.y + a.height - b.y - b.height) as f64).abs() <= delta
}

/// Union-find clustering. Returns per-rect class labels and the class count;
/// classes are numbered by their first member.
fn partition(rects: &[Rect], eps: f64) -> (Vec<usize>, usize) {
    let n = rects.len();
    let mut parent: Vec<usize> = (0..n).collect();

    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    for i in 0..n {
        for j in 0..i {
            if similar(&rects[i], &rects[j], eps) {
                let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                if ri != rj {
                    // Keep the earlier root so class order follows first appearance.
                    let (lo, hi) = if ri < rj { (ri, rj) } else { (rj, ri) };
                    parent[hi] = lo;
                }
            }
        }
    }

    let mut class_of_root = vec![usize::MAX; n];
    let mut labels = Vec::with_capacity(n);
    let mut classes = 0;
    for i in 0..n {
        let root = find(&mut parent, i);
        if class_of_root[root] == usize::MAX {
            class_of_root[root] = classes;
            classes += 1;
        }
        labels.push(class_of_root[root]);
    }
    (labels, classes)
}

/// Bilinear resize of a grayscale buffer.
fn resize_bilinear(src: &[u8], width: usize, height: usize, new_w: usize, new_h: usize) -> Vec<u8> {
    let sx = width as f32 / new_w as f32;
    let sy = height as f32 / new_h as f32;
    let mut resized = vec![0u8; new_w * new_h];

    for y in 0..new_h {
        let src_y = (y as f32 + 0.5) * sy - 0.5;
        let y0 = (src_y.floor() as i32).clamp(0, height as i32 - 1) as usize;
        let y1 = (y0 + 1).min(height - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for x in 0..new_w {
            let src_x = (x as f32 + 0.5) * sx - 0.5;
            let x0 = (src_x.floor() as i32).clamp(0, width as i32 - 1) as usize;
            let x1 = (x0 + 1).min(width - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            let tl = src[y0 * width + x0] as f32;
            let tr = src[y0 * width + x1] as f32;
            let bl = src[y1 * width + x0] as f32;
            let br = src[y1 * width + x1] as f32;

            let val = tl * (1.0 - fx) * (1.0 - fy)
                + tr * fx * (1.0 - fy)
                + bl * (1.0 - fx) * fy
                + br * fx * fy;

            resized[y * new_w + x] = val.round().clamp(0.0, 255.0) as u8;
        }
    }

    resized
}
