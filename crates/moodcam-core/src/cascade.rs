//! Boosted Haar cascade: OpenCV XML loading and per-window evaluation.
//!
//! Supports the `opencv_storage/cascade` format with `BOOST` stages and
//! upright `HAAR` features (e.g. `haarcascade_frontalface_default.xml`).

use crate::detector::DetectorError;
use roxmltree::Node;

/// Subtracted from every stage threshold when loading, matching OpenCV.
const STAGE_THRESHOLD_EPS: f32 = 1e-5;

/// Windows whose intensity standard deviation is at or below this are
/// rejected before any stage runs.
const MIN_WINDOW_STDDEV: f64 = 10.0;

/// A weighted rectangle of a Haar feature, relative to the window origin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightedRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub weight: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HaarFeature {
    pub rects: Vec<WeightedRect>,
}

/// Internal node of a weak-classifier tree.
///
/// `left`/`right` > 0 index another node; <= 0 index leaf `-value`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TreeNode {
    pub left: i32,
    pub right: i32,
    pub feature: usize,
    pub threshold: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeakClassifier {
    pub nodes: Vec<TreeNode>,
    pub leaves: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub threshold: f32,
    pub classifiers: Vec<WeakClassifier>,
}

/// Outcome of running the cascade on one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowVerdict {
    Face,
    /// Rejected by the stage with this index.
    Rejected(usize),
    /// Too uniform to hold a face; no stage ran.
    Flat,
}

/// Integral and squared-integral images of an 8-bit grayscale buffer.
pub struct IntegralImage {
    width: usize,
    height: usize,
    sum: Vec<i64>,
    sqsum: Vec<u64>,
}

impl IntegralImage {
    pub fn new(gray: &[u8], width: usize, height: usize) -> Self {
        let stride = width + 1;
        let mut sum = vec![0i64; stride * (height + 1)];
        let mut sqsum = vec![0u64; stride * (height + 1)];

        for y in 0..height {
            let mut row_sum = 0i64;
            let mut row_sqsum = 0u64;
            for x in 0..width {
                let p = gray[y * width + x] as i64;
                row_sum += p;
                row_sqsum += (p * p) as u64;
                let idx = (y + 1) * stride + x + 1;
                sum[idx] = sum[idx - stride] + row_sum;
                sqsum[idx] = sqsum[idx - stride] + row_sqsum;
            }
        }

        Self {
            width,
            height,
            sum,
            sqsum,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Sum of pixels in `[x, x+w) × [y, y+h)`.
    pub fn rect_sum(&self, x: usize, y: usize, w: usize, h: usize) -> i64 {
        let s = self.width + 1;
        self.sum[(y + h) * s + x + w] - self.sum[y * s + x + w] - self.sum[(y + h) * s + x]
            + self.sum[y * s + x]
    }

    fn rect_sqsum(&self, x: usize, y: usize, w: usize, h: usize) -> u64 {
        let s = self.width + 1;
        (self.sqsum[(y + h) * s + x + w] + self.sqsum[y * s + x])
            - (self.sqsum[y * s + x + w] + self.sqsum[(y + h) * s + x])
    }
}

/// A loaded boosted cascade.
#[derive(Debug, Clone, PartialEq)]
pub struct Cascade {
    pub window_width: u32,
    pub window_height: u32,
    pub stages: Vec<Stage>,
    pub features: Vec<HaarFeature>,
}

impl Cascade {
    /// Parse an OpenCV cascade XML document.
    pub fn from_xml(xml: &str) -> Result<Self, DetectorError> {
        let doc = roxmltree::Document::parse(xml)
            .map_err(|e| DetectorError::InvalidCascade(format!("XML: {e}")))?;

        let root = doc
            .descendants()
            .find(|n| n.has_tag_name("cascade"))
            .ok_or_else(|| DetectorError::InvalidCascade("missing <cascade> element".into()))?;

        let stage_type = child_text(root, "stageType")?;
        if stage_type != "BOOST" {
            return Err(DetectorError::InvalidCascade(format!(
                "unsupported stage type {stage_type}"
            )));
        }
        let feature_type = child_text(root, "featureType")?;
        if feature_type != "HAAR" {
            return Err(DetectorError::InvalidCascade(format!(
                "unsupported feature type {feature_type}"
            )));
        }

        let window_width: u32 = parse(child_text(root, "width")?, "width")?;
        let window_height: u32 = parse(child_text(root, "height")?, "height")?;
        if window_width < 3 || window_height < 3 {
            return Err(DetectorError::InvalidCascade(format!(
                "window {window_width}x{window_height} too small"
            )));
        }

        let features = items(child(root, "features")?)
            .map(parse_feature)
            .collect::<Result<Vec<_>, _>>()?;

        let stages = items(child(root, "stages")?)
            .map(parse_stage)
            .collect::<Result<Vec<_>, _>>()?;

        if stages.is_empty() {
            return Err(DetectorError::InvalidCascade("cascade has no stages".into()));
        }

        // Every node must reference an existing feature and stay inside its
        // window; evaluation relies on this.
        for feature in &features {
            for r in &feature.rects {
                let fits_x = r.x.checked_add(r.width).is_some_and(|right| right <= window_width);
                let fits_y = r.y.checked_add(r.height).is_some_and(|bottom| bottom <= window_height);
                if !fits_x || !fits_y {
                    return Err(DetectorError::InvalidCascade(format!(
                        "feature rect {r:?} exceeds {window_width}x{window_height} window"
                    )));
                }
            }
        }
        for stage in &stages {
            for wc in &stage.classifiers {
                validate_tree(wc, features.len())?;
            }
        }

        let declared = child_text(root, "stageNum")
            .ok()
            .and_then(|s| s.parse::<usize>().ok());
        if let Some(n) = declared {
            if n != stages.len() {
                tracing::warn!(declared = n, found = stages.len(), "cascade stage count mismatch");
            }
        }

        Ok(Self {
            window_width,
            window_height,
            stages,
            features,
        })
    }

    /// Run every stage on the window whose top-left corner is `(x, y)`.
    pub fn evaluate(&self, ii: &IntegralImage, x: usize, y: usize) -> WindowVerdict {
        let ww = self.window_width as usize;
        let wh = self.window_height as usize;

        // Variance normalisation over the window inset by one pixel.
        let (nw, nh) = (ww - 2, wh - 2);
        let area = (nw * nh) as f64;
        let s = ii.rect_sum(x + 1, y + 1, nw, nh) as f64;
        let sq = ii.rect_sqsum(x + 1, y + 1, nw, nh) as f64;
        let nf = area * sq - s * s;
        if nf <= 0.0 {
            return WindowVerdict::Flat;
        }
        let inv_norm = 1.0 / nf.sqrt();
        // area / nf == 1 / stddev
        if area * inv_norm >= 1.0 / MIN_WINDOW_STDDEV {
            return WindowVerdict::Flat;
        }

        for (si, stage) in self.stages.iter().enumerate() {
            let mut sum = 0.0f32;
            for wc in &stage.classifiers {
                sum += self.eval_tree(wc, ii, x, y, inv_norm);
            }
            if sum < stage.threshold {
                return WindowVerdict::Rejected(si);
            }
        }
        WindowVerdict::Face
    }

    fn eval_tree(&self, wc: &WeakClassifier, ii: &IntegralImage, x: usize, y: usize, inv_norm: f64) -> f32 {
        let mut idx = 0i32;
        loop {
            let node = &wc.nodes[idx as usize];
            let value = self.feature_value(node.feature, ii, x, y) * inv_norm;
            idx = if value < node.threshold as f64 {
                node.left
            } else {
                node.right
            };
            if idx <= 0 {
                return wc.leaves[(-idx) as usize];
            }
        }
    }

    fn feature_value(&self, feature: usize, ii: &IntegralImage, x: usize, y: usize) -> f64 {
        self.features[feature]
            .rects
            .iter()
            .map(|r| {
                let s = ii.rect_sum(
                    x + r.x as usize,
                    y + r.y as usize,
                    r.width as usize,
                    r.height as usize,
                );
                r.weight as f64 * s as f64
            })
            .sum()
    }
}

fn validate_tree(wc: &WeakClassifier, feature_count: usize) -> Result<(), DetectorError> {
    if wc.nodes.is_empty() {
        return Err(DetectorError::InvalidCascade("weak classifier without nodes".into()));
    }
    for node in &wc.nodes {
        if node.feature >= feature_count {
            return Err(DetectorError::InvalidCascade(format!(
                "node references feature {} of {feature_count}",
                node.feature
            )));
        }
        for next in [node.left, node.right] {
            let ok = if next > 0 {
                // Forward references only, so evaluation always terminates.
                (next as usize) < wc.nodes.len()
            } else {
                ((-next) as usize) < wc.leaves.len()
            };
            if !ok {
                return Err(DetectorError::InvalidCascade(format!(
                    "node branch {next} out of range"
                )));
            }
        }
    }
    for (i, node) in wc.nodes.iter().enumerate() {
        for next in [node.left, node.right] {
            if next > 0 && (next as usize) <= i {
                return Err(DetectorError::InvalidCascade("cyclic weak classifier tree".into()));
            }
        }
    }
    Ok(())
}

fn parse_stage(node: Node) -> Result<Stage, DetectorError> {
    let threshold: f32 = parse(child_text(node, "stageThreshold")?, "stageThreshold")?;
    let classifiers = items(child(node, "weakClassifiers")?)
        .map(parse_weak_classifier)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Stage {
        threshold: threshold - STAGE_THRESHOLD_EPS,
        classifiers,
    })
}

fn parse_weak_classifier(node: Node) -> Result<WeakClassifier, DetectorError> {
    let raw = numbers(child_text(node, "internalNodes")?)?;
    if raw.is_empty() || raw.len() % 4 != 0 {
        return Err(DetectorError::InvalidCascade(format!(
            "internalNodes holds {} values, expected groups of 4",
            raw.len()
        )));
    }
    let nodes = raw
        .chunks_exact(4)
        .map(|c| TreeNode {
            left: c[0] as i32,
            right: c[1] as i32,
            feature: c[2] as usize,
            threshold: c[3] as f32,
        })
        .collect();

    let leaves = numbers(child_text(node, "leafValues")?)?
        .into_iter()
        .map(|v| v as f32)
        .collect();

    Ok(WeakClassifier { nodes, leaves })
}

fn parse_feature(node: Node) -> Result<HaarFeature, DetectorError> {
    if let Ok(tilted) = child_text(node, "tilted") {
        if tilted.trim() != "0" {
            return Err(DetectorError::InvalidCascade(
                "tilted Haar features are not supported".into(),
            ));
        }
    }

    let rects = items(child(node, "rects")?)
        .map(|r| {
            let v = numbers(r.text().unwrap_or(""))?;
            if v.len() != 5 || v[..4].iter().any(|&n| n < 0.0) {
                return Err(DetectorError::InvalidCascade(format!("bad feature rect {v:?}")));
            }
            Ok(WeightedRect {
                x: v[0] as u32,
                y: v[1] as u32,
                width: v[2] as u32,
                height: v[3] as u32,
                weight: v[4] as f32,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    if rects.is_empty() {
        return Err(DetectorError::InvalidCascade("feature without rects".into()));
    }
    Ok(HaarFeature { rects })
}

/// The `<_>` list items of a sequence node.
fn items<'a, 'input>(node: Node<'a, 'input>) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children().filter(|n| n.is_element())
}

fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Result<Node<'a, 'input>, DetectorError> {
    node.children()
        .find(|n| n.has_tag_name(name))
        .ok_or_else(|| DetectorError::InvalidCascade(format!("missing <{name}>")))
}

fn child_text<'a>(node: Node<'a, '_>, name: &str) -> Result<&'a str, DetectorError> {
    Ok(child(node, name)?.text().unwrap_or("").trim())
}

fn numbers(text: &str) -> Result<Vec<f64>, DetectorError> {
    text.split_whitespace().map(|t| parse(t, "number")).collect()
}

fn parse<T: std::str::FromStr>(text: &str, what: &str) -> Result<T, DetectorError> {
    text.trim()
        .parse()
        .map_err(|_| DetectorError::InvalidCascade(format!("invalid {what}: {text:?}")))
}
