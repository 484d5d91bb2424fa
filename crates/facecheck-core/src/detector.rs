//! Face presence detection: multi-scale cascade scan plus neighbor grouping.

use crate::cascade::{shared_cascade, CascadeError, HaarCascade, IntegralImage};
use crate::config::DetectorParams;
use crate::types::FaceRegion;
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, RgbImage};
use std::borrow::Cow;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Relative edge tolerance when merging raw hits into one region.
const GROUP_EPS: f64 = 0.2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("{0}")]
    Cascade(#[from] CascadeError),
    #[error("scale factor must be greater than 1.0, got {0}")]
    InvalidScaleFactor(f64),
}

/// Pluggable face detection backend.
pub trait FaceDetector: Send + Sync {
    /// Detect face regions in a decoded color image.
    fn detect(&self, image: &RgbImage) -> Result<Vec<FaceRegion>, DetectorError>;
}

enum CascadeSource {
    /// Process-wide cascade, resolved on first detection.
    Shared(PathBuf),
    Owned(Arc<HaarCascade>),
}

/// Sliding-window detector over a Haar cascade.
pub struct CascadeDetector {
    source: CascadeSource,
    params: DetectorParams,
}

impl CascadeDetector {
    pub fn new(cascade: Arc<HaarCascade>, params: DetectorParams) -> Self {
        Self {
            source: CascadeSource::Owned(cascade),
            params,
        }
    }

    /// Detector backed by the process-wide cascade at `path`. Nothing is read
    /// until the first call to [`FaceDetector::detect`].
    pub fn shared(path: impl Into<PathBuf>, params: DetectorParams) -> Self {
        Self {
            source: CascadeSource::Shared(path.into()),
            params,
        }
    }

    fn cascade(&self) -> Result<Arc<HaarCascade>, CascadeError> {
        match &self.source {
            CascadeSource::Shared(path) => shared_cascade(path),
            CascadeSource::Owned(cascade) => Ok(Arc::clone(cascade)),
        }
    }

    /// Every accepted window across all scales, in source coordinates.
    pub fn detect_raw(&self, gray: &GrayImage) -> Result<Vec<FaceRegion>, DetectorError> {
        let scale_factor = self.params.scale_factor;
        if !scale_factor.is_finite() || scale_factor <= 1.0 {
            return Err(DetectorError::InvalidScaleFactor(scale_factor));
        }
        let cascade = self.cascade()?;
        let (win_w, win_h) = cascade.window_size();
        let (img_w, img_h) = gray.dimensions();
        let min_size = self.params.min_face_size;

        let mut hits = Vec::new();
        let mut factor = 1.0f64;
        loop {
            let scaled_w = (img_w as f64 / factor).round() as u32;
            let scaled_h = (img_h as f64 / factor).round() as u32;
            if scaled_w <= win_w || scaled_h <= win_h {
                break;
            }
            let window_w = (win_w as f64 * factor).round() as u32;
            let window_h = (win_h as f64 * factor).round() as u32;

            if window_w >= min_size && window_h >= min_size {
                let scaled = if scaled_w == img_w && scaled_h == img_h {
                    Cow::Borrowed(gray)
                } else {
                    Cow::Owned(imageops::resize(gray, scaled_w, scaled_h, FilterType::Triangle))
                };
                let ii = IntegralImage::new(&scaled);
                let step = if factor > 2.0 { 1 } else { 2 };

                for y in (0..scaled_h - win_h).step_by(step) {
                    for x in (0..scaled_w - win_w).step_by(step) {
                        if cascade.evaluate(&ii, x, y) {
                            hits.push(FaceRegion::new(
                                (x as f64 * factor).round() as i32,
                                (y as f64 * factor).round() as i32,
                                window_w as i32,
                                window_h as i32,
                            ));
                        }
                    }
                }
            }
            factor *= scale_factor;
        }

        Ok(hits)
    }
}

impl FaceDetector for CascadeDetector {
    fn detect(&self, image: &RgbImage) -> Result<Vec<FaceRegion>, DetectorError> {
        let gray = to_luma(image);
        let raw = self.detect_raw(&gray)?;
        let raw_count = raw.len();
        let faces = group_rectangles(raw, self.params.min_neighbors);
        tracing::debug!(
            width = image.width(),
            height = image.height(),
            raw = raw_count,
            faces = faces.len(),
            "cascade scan complete"
        );
        Ok(faces)
    }
}

/// BT.601 luma, the weighting the stock cascades were trained with.
pub fn to_luma(image: &RgbImage) -> GrayImage {
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let [r, g, b] = image.get_pixel(x, y).0;
        let v = 0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32;
        Luma([v.round().min(255.0) as u8])
    })
}

fn similar(a: &FaceRegion, b: &FaceRegion, eps: f64) -> bool {
    let delta = eps * (a.width.min(b.width) + a.height.min(b.height)) as f64 * 0.5;
    (a.x - b.x).abs() as f64 <= delta
        && (a.y - b.y).abs() as f64 <= delta
        && (a.right() - b.right()).abs() as f64 <= delta
        && (a.bottom() - b.bottom()).abs() as f64 <= delta
}

/// Label rectangles by the transitive closure of [`similar`].
/// Returns per-rectangle class labels and the class count.
fn partition(rects: &[FaceRegion], eps: f64) -> (Vec<usize>, usize) {
    let mut parent: Vec<usize> = (0..rects.len()).collect();

    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    for i in 0..rects.len() {
        for j in (i + 1)..rects.len() {
            if similar(&rects[i], &rects[j], eps) {
                let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                if ri != rj {
                    parent[rj] = ri;
                }
            }
        }
    }

    let mut class_of_root = vec![usize::MAX; rects.len()];
    let mut labels = Vec::with_capacity(rects.len());
    let mut classes = 0;
    for i in 0..rects.len() {
        let root = find(&mut parent, i);
        if class_of_root[root] == usize::MAX {
            class_of_root[root] = classes;
            classes += 1;
        }
        labels.push(class_of_root[root]);
    }
    (labels, classes)
}

/// Merge raw window hits into face regions.
///
/// Hits are clustered, each cluster is averaged, and clusters with no more
/// than `min_neighbors` members are discarded. A cluster nested inside a
/// better-supported one is dropped as well. `min_neighbors == 0` returns the
/// hits untouched.
pub fn group_rectangles(rects: Vec<FaceRegion>, min_neighbors: u32) -> Vec<FaceRegion> {
    if min_neighbors == 0 || rects.is_empty() {
        return rects;
    }
    let threshold = min_neighbors as usize;
    let (labels, classes) = partition(&rects, GROUP_EPS);

    let mut sums = vec![[0i64; 4]; classes];
    let mut counts = vec![0usize; classes];
    for (r, &cls) in rects.iter().zip(&labels) {
        sums[cls][0] += r.x as i64;
        sums[cls][1] += r.y as i64;
        sums[cls][2] += r.width as i64;
        sums[cls][3] += r.height as i64;
        counts[cls] += 1;
    }

    let averaged: Vec<FaceRegion> = sums
        .iter()
        .zip(&counts)
        .map(|(s, &n)| {
            let avg = |v: i64| (v as f64 / n as f64).round() as i32;
            FaceRegion::new(avg(s[0]), avg(s[1]), avg(s[2]), avg(s[3]))
        })
        .collect();

    let mut faces = Vec::new();
    for (i, r1) in averaged.iter().enumerate() {
        let n1 = counts[i];
        if n1 <= threshold {
            continue;
        }
        let nested = averaged.iter().enumerate().any(|(j, r2)| {
            let n2 = counts[j];
            if j == i || n2 <= threshold {
                return false;
            }
            let dx = (r2.width as f64 * GROUP_EPS).round() as i32;
            let dy = (r2.height as f64 * GROUP_EPS).round() as i32;
            r1.x >= r2.x - dx
                && r1.y >= r2.y - dy
                && r1.right() <= r2.right() + dx
                && r1.bottom() <= r2.bottom() + dy
                && (n2 > n1.max(3) || n1 < 3)
        });
        if !nested {
            faces.push(*r1);
        }
    }
    faces
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cascade::testing::{edge_cascade, edge_image};
    use image::{DynamicImage, Rgb};

    fn edge_detector(params: DetectorParams) -> CascadeDetector {
        CascadeDetector::new(Arc::new(edge_cascade()), params)
    }

    fn rgb(gray: GrayImage) -> RgbImage {
        DynamicImage::ImageLuma8(gray).to_rgb8()
    }

    fn cluster(x: i32, y: i32, size: i32, count: usize) -> Vec<FaceRegion> {
        (0..count as i32)
            .map(|i| FaceRegion::new(x + i % 2, y + i % 3, size, size))
            .collect()
    }

    #[test]
    fn test_luma_weights() {
        let img = RgbImage::from_fn(3, 1, |x, _| match x {
            0 => Rgb([255, 0, 0]),
            1 => Rgb([0, 255, 0]),
            _ => Rgb([255, 255, 255]),
        });
        let gray = to_luma(&img);
        assert_eq!(gray.get_pixel(0, 0).0[0], 76);
        assert_eq!(gray.get_pixel(1, 0).0[0], 150);
        assert_eq!(gray.get_pixel(2, 0).0[0], 255);
    }

    #[test]
    fn test_detects_edge_pattern() {
        let det = edge_detector(DetectorParams::default());
        let faces = det.detect(&rgb(edge_image(64, 64, 32))).unwrap();
        assert!(!faces.is_empty());
        for f in &faces {
            assert!(f.y < 40 && f.bottom() > 24, "region {f:?} should cover the edge");
        }
    }

    #[test]
    fn test_uniform_image_has_no_faces() {
        let det = edge_detector(DetectorParams::default());
        let img = RgbImage::from_pixel(64, 64, Rgb([120, 90, 60]));
        assert!(det.detect(&img).unwrap().is_empty());
    }

    #[test]
    fn test_image_smaller_than_window() {
        let det = edge_detector(DetectorParams::default());
        assert!(det.detect(&rgb(edge_image(20, 20, 10))).unwrap().is_empty());
        assert!(det.detect(&RgbImage::new(0, 0)).unwrap().is_empty());
    }

    #[test]
    fn test_raw_hits_cover_every_scale_one_position() {
        let det = edge_detector(DetectorParams::default());
        let raw = det.detect_raw(&edge_image(64, 64, 32)).unwrap();
        // At scale 1: 22 columns x 9 rows where the edge sits 2..=18 px into the window.
        let native = raw.iter().filter(|r| r.width == 20).count();
        assert!(native >= 22 * 9, "got {native} native-scale hits");
    }

    #[test]
    fn test_zero_min_neighbors_returns_raw() {
        let params = DetectorParams {
            min_neighbors: 0,
            ..DetectorParams::default()
        };
        let det = edge_detector(params);
        let img = edge_image(64, 64, 32);
        let raw = det.detect_raw(&img).unwrap();
        assert_eq!(det.detect(&rgb(img)).unwrap(), raw);
    }

    #[test]
    fn test_min_face_size_skips_small_windows() {
        let params = DetectorParams {
            min_face_size: 200,
            ..DetectorParams::default()
        };
        let det = edge_detector(params);
        assert!(det.detect(&rgb(edge_image(64, 64, 32))).unwrap().is_empty());
    }

    #[test]
    fn test_rejects_non_increasing_scale() {
        let params = DetectorParams {
            scale_factor: 1.0,
            ..DetectorParams::default()
        };
        let err = edge_detector(params).detect(&rgb(edge_image(64, 64, 32))).unwrap_err();
        assert!(matches!(err, DetectorError::InvalidScaleFactor(_)));
    }

    #[test]
    fn test_shared_missing_cascade_is_an_error() {
        let det = CascadeDetector::shared("/nonexistent/cascade.xml", DetectorParams::default());
        let err = det.detect(&RgbImage::new(32, 32)).unwrap_err();
        assert!(matches!(err, DetectorError::Cascade(CascadeError::NotFound(_))));
    }

    #[test]
    fn test_detection_is_deterministic() {
        let det = edge_detector(DetectorParams::default());
        let img = rgb(edge_image(80, 60, 25));
        assert_eq!(det.detect(&img).unwrap(), det.detect(&img).unwrap());
    }

    #[test]
    fn test_similar_tolerance() {
        let a = FaceRegion::new(0, 0, 20, 20);
        assert!(similar(&a, &FaceRegion::new(4, 4, 20, 20), 0.2));
        assert!(!similar(&a, &FaceRegion::new(5, 0, 20, 20), 0.2));
    }

    #[test]
    fn test_group_averages_and_thresholds() {
        let mut rects = cluster(100, 100, 40, 4);
        rects.push(FaceRegion::new(300, 300, 40, 40));
        let grouped = group_rectangles(rects, 3);
        assert_eq!(grouped.len(), 1);
        let g = grouped[0];
        // x offsets 0,1,0,1 and y offsets 0,1,2,0 average and round to +1, +1.
        assert_eq!(g, FaceRegion::new(101, 101, 40, 40));
    }

    #[test]
    fn test_group_needs_more_than_min_neighbors() {
        assert!(group_rectangles(cluster(0, 0, 30, 3), 3).is_empty());
        assert_eq!(group_rectangles(cluster(0, 0, 30, 4), 3).len(), 1);
    }

    #[test]
    fn test_group_chains_transitively() {
        // Each neighbor is within tolerance of the next, not of the first.
        let rects: Vec<FaceRegion> = (0..6).map(|i| FaceRegion::new(i * 3, 0, 20, 20)).collect();
        let grouped = group_rectangles(rects, 3);
        assert_eq!(grouped.len(), 1);
    }

    #[test]
    fn test_group_drops_nested_weaker_cluster() {
        let mut rects = cluster(100, 100, 100, 10);
        rects.extend(cluster(130, 130, 30, 4));
        let grouped = group_rectangles(rects, 3);
        assert_eq!(grouped.len(), 1);
        assert_eq!(grouped[0].width, 100);
    }

    #[test]
    fn test_group_keeps_nested_stronger_cluster() {
        let mut rects = cluster(100, 100, 100, 4);
        rects.extend(cluster(130, 130, 30, 10));
        assert_eq!(group_rectangles(rects, 3).len(), 2);
    }
}
