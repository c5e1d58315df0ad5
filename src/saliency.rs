//! Patch-local saliency from a captured activation, or from edges when the
//! classifier captured none.

use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Axis;
use serde::Serialize;

use crate::classifier::ActivationTensor;
use crate::patch::Patch;

/// Canny hysteresis thresholds for the edge fallback.
const CANNY_LOW: f32 = 50.0;
const CANNY_HIGH: f32 = 150.0;

/// Sigma equivalent to a 15x15 Gaussian kernel.
const BLUR_SIGMA: f32 = 2.6;

/// Which branch produced a heatmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SaliencySource {
    /// Channel-mean of the captured activation.
    Activation,
    /// Blurred Canny edges of the patch.
    EdgeFallback,
}

/// A heatmap in patch coordinates.
#[derive(Debug, Clone)]
pub struct Saliency {
    /// Intensities, same size as the patch.
    pub heatmap: GrayImage,
    /// Branch that produced `heatmap`.
    pub source: SaliencySource,
}

/// Build the patch-local heatmap.
///
/// With an activation: channel mean, negatives clamped to zero, scaled so the
/// maximum is 255 (all zero if the maximum is zero), resized to the patch
/// with bilinear interpolation. Without one, or with an empty one: Canny
/// edges of the grayscale patch, Gaussian blurred.
#[must_use]
pub fn synthesize(activation: Option<&ActivationTensor>, patch: &Patch) -> Saliency {
    let (width, height) = (patch.width(), patch.height());
    if let Some(heatmap) = activation.and_then(|a| from_activation(a, width, height)) {
        return Saliency {
            heatmap,
            source: SaliencySource::Activation,
        };
    }

    tracing::warn!(width, height, "no usable activation, using edge saliency");
    Saliency {
        heatmap: from_edges(patch),
        source: SaliencySource::EdgeFallback,
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn from_activation(activation: &ActivationTensor, width: u32, height: u32) -> Option<GrayImage> {
    let (channels, rows, cols) = activation.dim();
    if channels == 0 || rows == 0 || cols == 0 {
        return None;
    }
    let rows_u32 = u32::try_from(rows).ok()?;
    let cols_u32 = u32::try_from(cols).ok()?;

    let mean = activation
        .mean_axis(Axis(0))?
        .mapv(|v| if v.is_finite() { v.max(0.0) } else { 0.0 });
    let max = mean.iter().copied().fold(0.0_f32, f32::max);

    let small = GrayImage::from_fn(cols_u32, rows_u32, |x, y| {
        let v = if max > 0.0 {
            mean[[y as usize, x as usize]] / max * 255.0
        } else {
            0.0
        };
        image::Luma([v as u8])
    });

    if (cols_u32, rows_u32) == (width, height) {
        Some(small)
    } else {
        Some(imageops::resize(&small, width, height, FilterType::Triangle))
    }
}

fn from_edges(patch: &Patch) -> GrayImage {
    let gray = imageops::grayscale(&patch.image);
    if gray.width() < 3 || gray.height() < 3 {
        return GrayImage::new(gray.width(), gray.height());
    }
    let edges = imageproc::edges::canny(&gray, CANNY_LOW, CANNY_HIGH);
    imageproc::filter::gaussian_blur_f32(&edges, BLUR_SIGMA)
}
