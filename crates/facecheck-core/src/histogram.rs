//! Joint RGB color histograms and correlation scoring.

use image::RgbImage;
use ndarray::{Array3, ArrayView3};

pub const BINS_PER_CHANNEL: usize = 8;
/// `256 / BINS_PER_CHANNEL == 1 << BIN_SHIFT`
const BIN_SHIFT: u8 = 5;

/// 8×8×8 joint distribution of pixel colors.
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramDescriptor {
    bins: Array3<f32>,
}

impl HistogramDescriptor {
    /// Count every pixel into its `(r, g, b)` bin.
    pub fn from_image(image: &RgbImage) -> Self {
        let mut bins = Array3::<f32>::zeros((BINS_PER_CHANNEL, BINS_PER_CHANNEL, BINS_PER_CHANNEL));
        for pixel in image.pixels() {
            let [r, g, b] = pixel.0;
            bins[[
                (r >> BIN_SHIFT) as usize,
                (g >> BIN_SHIFT) as usize,
                (b >> BIN_SHIFT) as usize,
            ]] += 1.0;
        }
        Self { bins }
    }

    /// Scale to unit L2 norm, making descriptors comparable across image
    /// sizes. An empty histogram is left as is.
    pub fn normalized(mut self) -> Self {
        let norm = self.l2_norm();
        if norm > 0.0 {
            self.bins.mapv_inplace(|v| (v as f64 / norm) as f32);
        }
        self
    }

    pub fn bins(&self) -> ArrayView3<'_, f32> {
        self.bins.view()
    }

    pub fn total(&self) -> f64 {
        self.bins.iter().map(|&v| v as f64).sum()
    }

    pub fn l2_norm(&self) -> f64 {
        self.bins.iter().map(|&v| (v as f64).powi(2)).sum::<f64>().sqrt()
    }

    /// Pearson correlation between the two bin vectors, in [-1, 1].
    ///
    /// Degenerate input where either histogram has no variance scores 1.0.
    pub fn correlation(&self, other: &HistogramDescriptor) -> f64 {
        let n = self.bins.len() as f64;
        let (mut s1, mut s2, mut s11, mut s22, mut s12) = (0.0, 0.0, 0.0, 0.0, 0.0);
        for (&a, &b) in self.bins.iter().zip(other.bins.iter()) {
            let (a, b) = (a as f64, b as f64);
            s1 += a;
            s2 += b;
            s11 += a * a;
            s22 += b * b;
            s12 += a * b;
        }

        let num = s12 - s1 * s2 / n;
        let denom = (s11 - s1 * s1 / n) * (s22 - s2 * s2 / n);
        if denom.abs() > f64::EPSILON {
            num / denom.sqrt()
        } else {
            1.0
        }
    }
}

/// Correlation of the normalized color histograms of two images.
pub fn similarity(a: &RgbImage, b: &RgbImage) -> f64 {
    let ha = HistogramDescriptor::from_image(a).normalized();
    let hb = HistogramDescriptor::from_image(b).normalized();
    ha.correlation(&hb)
}
