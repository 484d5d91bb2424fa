//! Boosted Haar cascade classifier in the OpenCV XML storage format.
//!
//! Only the `BOOST`/`HAAR` layout with upright features is supported, which
//! covers the stock `haarcascade_frontalface_*` files. A window is evaluated
//! on integral images of an 8-bit grayscale frame with per-window variance
//! normalization.

use image::GrayImage;
use roxmltree::Node;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use thiserror::Error;

/// Subtracted from every stage threshold on load.
const STAGE_THRESHOLD_EPS: f64 = 1e-5;
/// Upper bound on rectangles per Haar feature.
const MAX_FEATURE_RECTS: usize = 3;

static SHARED: CascadeCell = CascadeCell::new();

#[derive(Error, Debug)]
pub enum CascadeError {
    #[error("cascade file not found: {0} (install OpenCV data or set FACECHECK_CASCADE_PATH)")]
    NotFound(String),
    #[error("failed to read cascade {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cascade XML: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("cascade is missing <{0}>")]
    Missing(&'static str),
    #[error("unsupported cascade {kind}: {value}")]
    Unsupported { kind: &'static str, value: String },
    #[error("malformed <{element}> value: {value:?}")]
    Malformed { element: &'static str, value: String },
    #[error("invalid cascade: {0}")]
    Invalid(String),
}

/// Summed-area tables over pixel values and squared pixel values.
///
/// Both tables are `(width + 1) × (height + 1)` with a zero first row/column.
pub struct IntegralImage {
    width: u32,
    height: u32,
    stride: usize,
    sum: Vec<u64>,
    sq_sum: Vec<u64>,
}

impl IntegralImage {
    pub fn new(gray: &GrayImage) -> Self {
        let (width, height) = gray.dimensions();
        let stride = width as usize + 1;
        let mut sum = vec![0u64; stride * (height as usize + 1)];
        let mut sq_sum = vec![0u64; sum.len()];

        for y in 0..height as usize {
            let mut row = 0u64;
            let mut row_sq = 0u64;
            for x in 0..width as usize {
                let v = gray.get_pixel(x as u32, y as u32).0[0] as u64;
                row += v;
                row_sq += v * v;
                let idx = (y + 1) * stride + x + 1;
                sum[idx] = sum[idx - stride] + row;
                sq_sum[idx] = sq_sum[idx - stride] + row_sq;
            }
        }

        Self {
            width,
            height,
            stride,
            sum,
            sq_sum,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Sum of pixels in `[x, x+w) × [y, y+h)`.
    pub fn rect_sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        Self::lookup(&self.sum, self.stride, x, y, w, h)
    }

    /// Sum of squared pixels in `[x, x+w) × [y, y+h)`.
    pub fn rect_sq_sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        Self::lookup(&self.sq_sum, self.stride, x, y, w, h)
    }

    fn lookup(table: &[u64], stride: usize, x: u32, y: u32, w: u32, h: u32) -> u64 {
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = (x0 + w as usize, y0 + h as usize);
        (table[y1 * stride + x1] + table[y0 * stride + x0])
            - (table[y0 * stride + x1] + table[y1 * stride + x0])
    }
}

#[derive(Debug, Clone, Copy)]
struct WeightedRect {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    weight: f64,
}

#[derive(Debug, Clone)]
struct HaarFeature {
    rects: Vec<WeightedRect>,
}

impl HaarFeature {
    fn value(&self, ii: &IntegralImage, wx: u32, wy: u32) -> f64 {
        self.rects
            .iter()
            .map(|r| r.weight * ii.rect_sum(wx + r.x, wy + r.y, r.width, r.height) as f64)
            .sum()
    }
}

/// Split node of a weak classifier tree. Child indices `> 0` point at another
/// node; `<= 0` select leaf `-index`.
#[derive(Debug, Clone, Copy)]
struct TreeNode {
    left: i32,
    right: i32,
    feature: usize,
    threshold: f64,
}

#[derive(Debug, Clone)]
struct WeakClassifier {
    nodes: Vec<TreeNode>,
    leaves: Vec<f64>,
}

#[derive(Debug, Clone)]
struct CascadeStage {
    threshold: f64,
    classifiers: Vec<WeakClassifier>,
}

/// A loaded, immutable cascade.
#[derive(Debug, Clone)]
pub struct HaarCascade {
    window_width: u32,
    window_height: u32,
    stages: Vec<CascadeStage>,
    features: Vec<HaarFeature>,
    source: Option<PathBuf>,
}

impl HaarCascade {
    /// Load a cascade from an OpenCV XML file.
    pub fn load(path: &Path) -> Result<Self, CascadeError> {
        if !path.exists() {
            return Err(CascadeError::NotFound(path.display().to_string()));
        }
        let xml = std::fs::read_to_string(path).map_err(|source| CascadeError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut cascade = Self::from_xml_str(&xml)?;
        cascade.source = Some(path.to_path_buf());

        tracing::info!(
            path = %path.display(),
            window = ?cascade.window_size(),
            stages = cascade.stages.len(),
            features = cascade.features.len(),
            "loaded Haar cascade"
        );
        Ok(cascade)
    }

    pub fn from_xml_str(xml: &str) -> Result<Self, CascadeError> {
        let doc = roxmltree::Document::parse(xml)?;
        let root = doc
            .descendants()
            .find(|n| n.has_tag_name("cascade"))
            .ok_or(CascadeError::Missing("cascade"))?;

        let stage_type = text(child(root, "stageType")?);
        if stage_type != "BOOST" {
            return Err(CascadeError::Unsupported {
                kind: "stage type",
                value: stage_type.to_string(),
            });
        }
        let feature_type = text(child(root, "featureType")?);
        if feature_type != "HAAR" {
            return Err(CascadeError::Unsupported {
                kind: "feature type",
                value: feature_type.to_string(),
            });
        }

        let window_width: u32 = scalar(child(root, "width")?, "width")?;
        let window_height: u32 = scalar(child(root, "height")?, "height")?;
        if window_width < 3 || window_height < 3 {
            return Err(CascadeError::Invalid(format!(
                "window {window_width}x{window_height} is too small"
            )));
        }

        let features = items(child(root, "features")?)
            .map(|n| parse_feature(n, window_width, window_height))
            .collect::<Result<Vec<_>, _>>()?;

        let stages = items(child(root, "stages")?)
            .map(|n| parse_stage(n, features.len()))
            .collect::<Result<Vec<_>, _>>()?;
        if stages.is_empty() {
            return Err(CascadeError::Invalid("cascade has no stages".into()));
        }

        Ok(Self {
            window_width,
            window_height,
            stages,
            features,
            source: None,
        })
    }

    /// Detection window `(width, height)` the cascade was trained on.
    pub fn window_size(&self) -> (u32, u32) {
        (self.window_width, self.window_height)
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Run every stage on the window whose top-left corner is `(x, y)`.
    ///
    /// The window must lie fully inside the integral image.
    pub fn evaluate(&self, ii: &IntegralImage, x: u32, y: u32) -> bool {
        debug_assert!(x + self.window_width <= ii.width() && y + self.window_height <= ii.height());

        // Normalization area is the window inset by one pixel.
        let (nw, nh) = (self.window_width - 2, self.window_height - 2);
        let area = (nw * nh) as f64;
        let s = ii.rect_sum(x + 1, y + 1, nw, nh) as f64;
        let sq = ii.rect_sq_sum(x + 1, y + 1, nw, nh) as f64;
        let variance = area * sq - s * s;
        let norm = if variance > 0.0 { variance.sqrt() } else { 1.0 };

        for stage in &self.stages {
            let mut total = 0.0;
            for weak in &stage.classifiers {
                let mut idx = 0i32;
                loop {
                    let node = &weak.nodes[idx as usize];
                    let value = self.features[node.feature].value(ii, x, y) / norm;
                    idx = if value < node.threshold { node.left } else { node.right };
                    if idx <= 0 {
                        break;
                    }
                }
                total += weak.leaves[(-idx) as usize];
            }
            if total < stage.threshold {
                return false;
            }
        }
        true
    }
}

/// Load-once holder for a cascade shared across callers.
pub struct CascadeCell {
    cell: OnceLock<Arc<HaarCascade>>,
}

impl CascadeCell {
    pub const fn new() -> Self {
        Self {
            cell: OnceLock::new(),
        }
    }

    /// Return the held cascade, loading it from `path` on first success.
    ///
    /// Once a cascade is held, `path` is not consulted again.
    pub fn get_or_load(&self, path: &Path) -> Result<Arc<HaarCascade>, CascadeError> {
        if let Some(cascade) = self.cell.get() {
            if cascade.source().is_some_and(|src| src != path) {
                tracing::warn!(
                    requested = %path.display(),
                    loaded = ?cascade.source(),
                    "cascade already loaded from a different path; reusing it"
                );
            }
            return Ok(Arc::clone(cascade));
        }
        let loaded = Arc::new(HaarCascade::load(path)?);
        Ok(Arc::clone(self.cell.get_or_init(|| loaded)))
    }

    pub fn is_loaded(&self) -> bool {
        self.cell.get().is_some()
    }
}

impl Default for CascadeCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide cascade, read-only after the first successful load.
pub fn shared_cascade(path: &Path) -> Result<Arc<HaarCascade>, CascadeError> {
    SHARED.get_or_load(path)
}

fn child<'a, 'input>(node: Node<'a, 'input>, name: &'static str) -> Result<Node<'a, 'input>, CascadeError> {
    node.children()
        .find(|n| n.has_tag_name(name))
        .ok_or(CascadeError::Missing(name))
}

fn items<'a, 'input>(node: Node<'a, 'input>) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children().filter(|n| n.has_tag_name("_"))
}

fn text<'a>(node: Node<'a, '_>) -> &'a str {
    node.text().unwrap_or("").trim()
}

fn scalar<T: FromStr>(node: Node<'_, '_>, element: &'static str) -> Result<T, CascadeError> {
    parse_token(text(node), element)
}

fn parse_token<T: FromStr>(token: &str, element: &'static str) -> Result<T, CascadeError> {
    token.parse().map_err(|_| CascadeError::Malformed {
        element,
        value: token.to_string(),
    })
}

fn parse_feature(node: Node<'_, '_>, window_width: u32, window_height: u32) -> Result<HaarFeature, CascadeError> {
    if let Some(tilted) = node.children().find(|n| n.has_tag_name("tilted")) {
        if scalar::<i32>(tilted, "tilted")? != 0 {
            return Err(CascadeError::Unsupported {
                kind: "feature",
                value: "tilted".into(),
            });
        }
    }

    let rects = items(child(node, "rects")?)
        .map(|r| {
            let tokens: Vec<&str> = text(r).split_ascii_whitespace().collect();
            let [x, y, w, h, weight] = tokens[..] else {
                return Err(CascadeError::Malformed {
                    element: "rects",
                    value: text(r).to_string(),
                });
            };
            let rect = WeightedRect {
                x: parse_token(x, "rects")?,
                y: parse_token(y, "rects")?,
                width: parse_token(w, "rects")?,
                height: parse_token(h, "rects")?,
                weight: parse_token(weight, "rects")?,
            };
            if rect.width == 0
                || rect.height == 0
                || rect.x.saturating_add(rect.width) > window_width
                || rect.y.saturating_add(rect.height) > window_height
            {
                return Err(CascadeError::Invalid(format!(
                    "feature rect {x} {y} {w} {h} exceeds the {window_width}x{window_height} window"
                )));
            }
            Ok(rect)
        })
        .collect::<Result<Vec<_>, _>>()?;

    if rects.is_empty() || rects.len() > MAX_FEATURE_RECTS {
        return Err(CascadeError::Invalid(format!(
            "feature has {} rects, expected 1 to {MAX_FEATURE_RECTS}",
            rects.len()
        )));
    }
    Ok(HaarFeature { rects })
}

fn parse_stage(node: Node<'_, '_>, feature_count: usize) -> Result<CascadeStage, CascadeError> {
    let threshold: f64 = scalar(child(node, "stageThreshold")?, "stageThreshold")?;
    let classifiers = items(child(node, "weakClassifiers")?)
        .map(|n| parse_weak_classifier(n, feature_count))
        .collect::<Result<Vec<_>, _>>()?;
    if classifiers.is_empty() {
        return Err(CascadeError::Invalid("stage has no weak classifiers".into()));
    }
    Ok(CascadeStage {
        threshold: threshold - STAGE_THRESHOLD_EPS,
        classifiers,
    })
}

fn parse_weak_classifier(node: Node<'_, '_>, feature_count: usize) -> Result<WeakClassifier, CascadeError> {
    let raw_nodes: Vec<&str> = text(child(node, "internalNodes")?)
        .split_ascii_whitespace()
        .collect();
    if raw_nodes.is_empty() || raw_nodes.len() % 4 != 0 {
        return Err(CascadeError::Malformed {
            element: "internalNodes",
            value: raw_nodes.join(" "),
        });
    }

    let nodes = raw_nodes
        .chunks_exact(4)
        .map(|q| {
            Ok(TreeNode {
                left: parse_token(q[0], "internalNodes")?,
                right: parse_token(q[1], "internalNodes")?,
                feature: parse_token(q[2], "internalNodes")?,
                threshold: parse_token(q[3], "internalNodes")?,
            })
        })
        .collect::<Result<Vec<_>, CascadeError>>()?;

    let leaves = text(child(node, "leafValues")?)
        .split_ascii_whitespace()
        .map(|t| parse_token(t, "leafValues"))
        .collect::<Result<Vec<f64>, _>>()?;

    for (i, n) in nodes.iter().enumerate() {
        if n.feature >= feature_count {
            return Err(CascadeError::Invalid(format!(
                "feature index {} out of range ({feature_count} features)",
                n.feature
            )));
        }
        for link in [n.left, n.right] {
            // Child nodes are stored after their parent.
            let in_range = if link > 0 {
                (link as usize) > i && (link as usize) < nodes.len()
            } else {
                (link.unsigned_abs() as usize) < leaves.len()
            };
            if !in_range {
                return Err(CascadeError::Invalid(format!(
                    "tree link {link} out of range ({} nodes, {} leaves)",
                    nodes.len(),
                    leaves.len()
                )));
            }
        }
    }

    Ok(WeakClassifier { nodes, leaves })
}

#[cfg(test)]
pub(crate) mod testing {
    use super::HaarCascade;
    use image::{GrayImage, Luma};

    /// One-stage cascade on a 20x20 window that fires where the lower half
    /// of the window is clearly brighter than the upper half.
    pub(crate) const EDGE_CASCADE_XML: &str = r#"<?xml version="1.0"?>
<opencv_storage>
<cascade type_id="opencv-cascade-classifier">
  <stageType>BOOST</stageType>
  <featureType>HAAR</featureType>
  <height>20</height>
  <width>20</width>
  <stageParams>
    <maxWeakCount>1</maxWeakCount></stageParams>
  <featureParams>
    <maxCatCount>0</maxCatCount></featureParams>
  <stageNum>1</stageNum>
  <stages>
    <_>
      <maxWeakCount>1</maxWeakCount>
      <stageThreshold>0.</stageThreshold>
      <weakClassifiers>
        <_>
          <internalNodes>
            0 -1 0 5.0000000000000000e-01</internalNodes>
          <leafValues>
            -1. 1.</leafValues></_></weakClassifiers></_></stages>
  <features>
    <_>
      <rects>
        <_>
          0 0 20 10 -1.</_>
        <_>
          0 10 20 10 1.</_></rects></_></features></cascade>
</opencv_storage>
"#;

    pub(crate) fn edge_cascade() -> HaarCascade {
        HaarCascade::from_xml_str(EDGE_CASCADE_XML).unwrap()
    }

    /// Dark upper rows, bright rows from `split` down.
    pub(crate) fn edge_image(width: u32, height: u32, split: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |_, y| Luma([if y < split { 0 } else { 255 }]))
    }
}
