//! Heatmap compositing onto the full-resolution image.
//!
//! The patch-local heatmap is placed on a zeroed full-image grid at the ROI,
//! colorized with a jet color map and alpha blended with the original:
//! `overlay = w_original * original + w_heatmap * colorized`

use image::imageops::{self, FilterType};
use image::{GrayImage, Rgb, RgbImage};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::roi::{Roi, Size};

/// Tolerance on `original + heatmap == 1.0`.
const WEIGHT_SUM_TOLERANCE: f32 = 1e-3;

/// Alpha-blend weights of the overlay.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BlendWeights {
    /// Weight of the original pixels.
    pub original: f32,
    /// Weight of the colorized heatmap.
    pub heatmap: f32,
}

impl Default for BlendWeights {
    fn default() -> Self {
        Self {
            original: 0.6,
            heatmap: 0.4,
        }
    }
}

impl BlendWeights {
    /// Weights giving the heatmap `heatmap` and the original the rest.
    #[must_use]
    pub fn with_heatmap(heatmap: f32) -> Self {
        Self {
            original: 1.0 - heatmap,
            heatmap,
        }
    }

    /// Check both weights lie in `[0, 1]` and sum to one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] otherwise.
    pub fn validate(&self) -> Result<()> {
        let in_range = |w: f32| (0.0..=1.0).contains(&w);
        if !in_range(self.original)
            || !in_range(self.heatmap)
            || (self.original + self.heatmap - 1.0).abs() > WEIGHT_SUM_TOLERANCE
        {
            return Err(Error::InvalidInput(format!(
                "blend weights {} + {} must be in [0, 1] and sum to 1",
                self.original, self.heatmap
            )));
        }
        Ok(())
    }
}

/// Map an intensity onto the jet color map (dark blue through red).
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn jet(value: u8) -> Rgb<u8> {
    let v = f32::from(value) / 255.0;
    let channel = |centre: f32| {
        let c = (1.5 - (4.0 * v - centre).abs()).clamp(0.0, 1.0);
        (c * 255.0).round() as u8
    };
    Rgb([channel(3.0), channel(2.0), channel(1.0)])
}

/// Place a patch-local heatmap on a zeroed grid the size of the image.
///
/// The heatmap is first resized to the ROI if its size differs. Any part of
/// the ROI outside `size` is dropped, so nothing is ever written out of
/// bounds.
#[must_use]
pub fn place_heatmap(patch_heatmap: &GrayImage, roi: &Roi, size: Size) -> GrayImage {
    let mut grid = GrayImage::new(size.width, size.height);
    if roi.width == 0 || roi.height == 0 || roi.x >= size.width || roi.y >= size.height {
        return grid;
    }

    let resized;
    let heatmap = if patch_heatmap.dimensions() == (roi.width, roi.height) {
        patch_heatmap
    } else {
        tracing::debug!(
            from = ?patch_heatmap.dimensions(),
            to = ?(roi.width, roi.height),
            "resizing heatmap to ROI"
        );
        resized = imageops::resize(patch_heatmap, roi.width, roi.height, FilterType::Triangle);
        &resized
    };

    let x_end = roi.x.saturating_add(roi.width).min(size.width);
    let y_end = roi.y.saturating_add(roi.height).min(size.height);
    for dy in 0..(y_end - roi.y) {
        for dx in 0..(x_end - roi.x) {
            grid.put_pixel(roi.x + dx, roi.y + dy, *heatmap.get_pixel(dx, dy));
        }
    }
    grid
}

/// Apply the jet color map to every grid cell.
#[must_use]
pub fn colorize(grid: &GrayImage) -> RgbImage {
    RgbImage::from_fn(grid.width(), grid.height(), |x, y| jet(grid.get_pixel(x, y)[0]))
}

/// Weighted per-channel sum of two equally sized images, rounded and
/// saturated to `u8`.
///
/// # Panics
///
/// Panics if the images differ in size.
#[must_use]
pub fn blend(original: &RgbImage, colored: &RgbImage, weights: BlendWeights) -> RgbImage {
    assert_eq!(
        original.dimensions(),
        colored.dimensions(),
        "blend inputs must have equal size"
    );
    let mut out = original.clone();
    for (px, heat) in out.pixels_mut().zip(colored.pixels()) {
        for ch in 0..3 {
            let v = weights.original * f32::from(px[ch]) + weights.heatmap * f32::from(heat[ch]);
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            {
                px[ch] = v.round().clamp(0.0, 255.0) as u8;
            }
        }
    }
    out
}

/// Render the overlay of a patch-local heatmap at `roi` on `original`.
#[must_use]
pub fn compose(
    patch_heatmap: &GrayImage,
    roi: &Roi,
    original: &RgbImage,
    weights: BlendWeights,
) -> RgbImage {
    let grid = place_heatmap(patch_heatmap, roi, Size::of(original));
    blend(original, &colorize(&grid), weights)
}
