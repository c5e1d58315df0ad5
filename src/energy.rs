//! Energy estimation: where in the image is the high-frequency content?
//!
//! Two estimators are available:
//! 1. **Wavelet** (primary): one level of a `bior1.3` discrete wavelet
//!    transform; energy is the per-location sum over RGB of the squared
//!    diagonal detail coefficients, at roughly half resolution.
//! 2. **Gradient** (fallback): Sobel gradient magnitude of the luminance, at
//!    full resolution.
//!
//! Images smaller than the patch are upscaled before either estimator runs;
//! the scale factor is kept on the [`EnergyField`] so search coordinates can be
//! mapped back onto the source image. The upscaled copy may not exceed
//! [`DEFAULT_MAX_SEARCH_SIDE`] (or the limit set with
//! [`EnergyEstimator::with_max_side`]) on its longer side.

use image::imageops::{self, FilterType};
use image::RgbImage;
use serde::Serialize;

use crate::error::{Error, Result};

/// `bior1.3` decomposition high-pass filter.
const BIOR13_DEC_HI: [f32; 6] = [
    0.0,
    0.0,
    -std::f32::consts::FRAC_1_SQRT_2,
    std::f32::consts::FRAC_1_SQRT_2,
    0.0,
    0.0,
];

/// Longest side an upscaled search image may have by default.
pub const DEFAULT_MAX_SEARCH_SIDE: u32 = 4096;

/// Which estimator produced (or should produce) an energy field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnergyMethod {
    /// Diagonal wavelet detail energy at half resolution.
    #[default]
    Wavelet,
    /// Sobel gradient magnitude at full resolution.
    Gradient,
}

/// A grid of non-negative energy values over the search image.
#[derive(Debug, Clone)]
pub struct EnergyField {
    width: u32,
    height: u32,
    data: Vec<f32>,
    method: EnergyMethod,
    decimation: u32,
    scale: f64,
}

impl EnergyField {
    /// Wrap a row-major grid.
    ///
    /// `decimation` is the number of search-image pixels per field cell and
    /// `scale` the search-image size over the source-image size.
    ///
    /// # Panics
    ///
    /// Panics if `data.len() != width * height`.
    #[must_use]
    pub fn new(
        width: u32,
        height: u32,
        data: Vec<f32>,
        method: EnergyMethod,
        decimation: u32,
        scale: f64,
    ) -> Self {
        assert_eq!(
            data.len(),
            width as usize * height as usize,
            "energy grid must be width * height"
        );
        Self {
            width,
            height,
            data,
            method,
            decimation: decimation.max(1),
            scale,
        }
    }

    /// Field width in cells.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Field height in cells.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Row-major energy values.
    #[must_use]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Energy at `(x, y)`.
    #[must_use]
    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.data[y as usize * self.width as usize + x as usize]
    }

    /// The estimator that produced this field.
    #[must_use]
    pub fn method(&self) -> EnergyMethod {
        self.method
    }

    /// Search-image pixels per field cell (2 for wavelet, 1 for gradient).
    #[must_use]
    pub fn decimation(&self) -> u32 {
        self.decimation
    }

    /// Upscale factor applied to the source before estimation (1.0 if none).
    #[must_use]
    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Window size in field cells that covers `patch_size` source pixels.
    #[must_use]
    pub fn window_for(&self, patch_size: u32) -> u32 {
        (patch_size / self.decimation).max(1)
    }

    /// Map a field position back onto the source image.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn to_source(&self, x: u32, y: u32) -> (u32, u32) {
        let dec = f64::from(self.decimation);
        let sx = (f64::from(x) * dec / self.scale).floor() as u32;
        let sy = (f64::from(y) * dec / self.scale).floor() as u32;
        (sx, sy)
    }
}

/// Computes energy fields for ROI search.
#[derive(Debug, Clone, Copy)]
pub struct EnergyEstimator {
    method: EnergyMethod,
    patch_size: u32,
    max_side: u32,
}

impl EnergyEstimator {
    /// Estimator preferring `method`, upscaling sources smaller than
    /// `patch_size`.
    #[must_use]
    pub fn new(method: EnergyMethod, patch_size: u32) -> Self {
        Self {
            method,
            patch_size,
            max_side: DEFAULT_MAX_SEARCH_SIDE,
        }
    }

    /// Limit the longer side of the upscaled search image.
    #[must_use]
    pub fn with_max_side(mut self, max_side: u32) -> Self {
        self.max_side = max_side;
        self
    }

    /// Compute the energy field of `image`.
    ///
    /// When the wavelet estimator cannot handle the image the gradient
    /// estimator is used instead; the field records which one ran.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an empty image, or for one whose
    /// aspect ratio would make the upscaled search image longer than the
    /// side limit.
    pub fn estimate(&self, image: &RgbImage) -> Result<EnergyField> {
        let (w, h) = image.dimensions();
        if w == 0 || h == 0 {
            return Err(Error::InvalidInput(format!("empty {w}x{h} image")));
        }

        let upscaled = upscale_to_patch(image, self.patch_size, self.max_side)?;
        let (search, scale) = match &upscaled {
            Some((img, scale)) => (img, *scale),
            None => (image, 1.0),
        };

        let field = match self.method {
            EnergyMethod::Wavelet => match wavelet_energy(search, scale) {
                Some(field) => field,
                None => {
                    tracing::warn!(
                        width = search.width(),
                        height = search.height(),
                        "wavelet energy unavailable, using gradient energy"
                    );
                    gradient_energy(search, scale)
                }
            },
            EnergyMethod::Gradient => gradient_energy(search, scale),
        };

        tracing::debug!(
            method = ?field.method(),
            width = field.width(),
            height = field.height(),
            scale,
            "estimated energy"
        );
        Ok(field)
    }
}

/// Upscale so that both sides reach `patch_size`, returning the scale used.
///
/// Fails before allocating anything if the longer upscaled side would exceed
/// `max_side`.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn upscale_to_patch(
    image: &RgbImage,
    patch_size: u32,
    max_side: u32,
) -> Result<Option<(RgbImage, f64)>> {
    let (w, h) = image.dimensions();
    if w >= patch_size && h >= patch_size {
        return Ok(None);
    }
    let scale = f64::from(patch_size) / f64::from(w.min(h));
    let scaled = |side: u32| (f64::from(side) * scale).floor() + 1.0;
    let (new_w, new_h) = (scaled(w), scaled(h));
    if new_w.max(new_h) > f64::from(max_side) {
        return Err(Error::InvalidInput(format!(
            "{w}x{h} image would be upscaled to {new_w}x{new_h}, over the {max_side} pixel search limit"
        )));
    }
    let (new_w, new_h) = (new_w as u32, new_h as u32);
    tracing::debug!(w, h, new_w, new_h, scale, "upscaling small image for search");
    Ok(Some((
        imageops::resize(image, new_w, new_h, FilterType::Triangle),
        scale,
    )))
}

/// Length of one decomposition level for a signal of `n` samples.
fn dwt_len(n: usize) -> usize {
    (n + BIOR13_DEC_HI.len() - 1) / 2
}

/// Half-sample symmetric index extension, repeated for very short signals.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_possible_wrap)]
fn reflect(k: isize, n: usize) -> usize {
    let n = n as isize;
    let period = 2 * n;
    let k = k.rem_euclid(period);
    (if k >= n { period - 1 - k } else { k }) as usize
}

/// High-pass analysis step: filter then keep every second (odd) sample.
#[allow(clippy::cast_possible_wrap)]
fn highpass(input: &[f32], out: &mut [f32]) {
    let n = input.len();
    for (i, o) in out.iter_mut().enumerate() {
        let centre = 2 * i as isize + 1;
        *o = BIOR13_DEC_HI
            .iter()
            .enumerate()
            .map(|(j, &h)| h * input[reflect(centre - j as isize, n)])
            .sum();
    }
}

/// Diagonal (high/high) detail coefficients of one channel plane.
fn dwt_diagonal(plane: &[f32], width: usize, height: usize) -> (Vec<f32>, usize, usize) {
    let ow = dwt_len(width);
    let oh = dwt_len(height);

    let mut rows = vec![0.0_f32; ow * height];
    for y in 0..height {
        highpass(
            &plane[y * width..(y + 1) * width],
            &mut rows[y * ow..(y + 1) * ow],
        );
    }

    let mut out = vec![0.0_f32; ow * oh];
    let mut column = vec![0.0_f32; height];
    let mut filtered = vec![0.0_f32; oh];
    for x in 0..ow {
        for (y, c) in column.iter_mut().enumerate() {
            *c = rows[y * ow + x];
        }
        highpass(&column, &mut filtered);
        for (y, &v) in filtered.iter().enumerate() {
            out[y * ow + x] = v;
        }
    }
    (out, ow, oh)
}

/// Wavelet energy, or `None` if the decomposition cannot produce a usable
/// field for this image.
#[allow(clippy::cast_possible_truncation)]
fn wavelet_energy(image: &RgbImage, scale: f64) -> Option<EnergyField> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    if w < 2 || h < 2 {
        return None;
    }

    let mut energy: Vec<f32> = Vec::new();
    let (mut ow, mut oh) = (0, 0);
    for ch in 0..3 {
        let plane: Vec<f32> = image.pixels().map(|p| f32::from(p[ch]) / 255.0).collect();
        let (coeffs, cw, chh) = dwt_diagonal(&plane, w, h);
        if energy.is_empty() {
            energy = vec![0.0; coeffs.len()];
            (ow, oh) = (cw, chh);
        }
        for (e, c) in energy.iter_mut().zip(&coeffs) {
            *e += c * c;
        }
    }

    if energy.iter().any(|e| !e.is_finite()) {
        return None;
    }
    Some(EnergyField::new(
        ow as u32,
        oh as u32,
        energy,
        EnergyMethod::Wavelet,
        2,
        scale,
    ))
}

/// Sobel gradient-magnitude energy of the luminance.
fn gradient_energy(image: &RgbImage, scale: f64) -> EnergyField {
    let (w, h) = image.dimensions();
    let gray = luminance(image);
    let magnitude = sobel_magnitude(&gray, w as usize, h as usize);
    EnergyField::new(w, h, magnitude, EnergyMethod::Gradient, 1, scale)
}

/// Luminance of every pixel, in `[0, 1]`.
///
/// Uses `0.299*R + 0.587*G + 0.114*B`.
pub(crate) fn luminance(img: &RgbImage) -> Vec<f32> {
    img.pixels()
        .map(|px| {
            (0.299 * f32::from(px[0]) + 0.587 * f32::from(px[1]) + 0.114 * f32::from(px[2]))
                / 255.0
        })
        .collect()
}

/// Compute Sobel gradient magnitude for a 2D float array.
///
/// Uses 3x3 Sobel kernels. Border pixels are set to 0.
#[must_use]
pub fn sobel_magnitude(data: &[f32], width: usize, height: usize) -> Vec<f32> {
    let mut result = vec![0.0_f32; width * height];
    if width < 3 || height < 3 {
        return result;
    }

    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let at = |dy: usize, dx: usize| -> f32 { data[(y + dy - 1) * width + (x + dx - 1)] };

            let gx = -at(0, 0) + at(0, 2) - 2.0 * at(1, 0) + 2.0 * at(1, 2) - at(2, 0) + at(2, 2);
            let gy = -at(0, 0) - 2.0 * at(0, 1) - at(0, 2) + at(2, 0) + 2.0 * at(2, 1) + at(2, 2);

            result[y * width + x] = (gx * gx + gy * gy).sqrt();
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn striped(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            let v = if (x + y) % 2 == 0 { 230 } else { 20 };
            image::Rgb([v, v, v])
        })
    }

    #[test]
    fn reflect_is_half_sample_symmetric() {
        assert_eq!(reflect(-1, 5), 0);
        assert_eq!(reflect(-2, 5), 1);
        assert_eq!(reflect(5, 5), 4);
        assert_eq!(reflect(6, 5), 3);
        // signal shorter than the filter
        assert_eq!(reflect(-3, 2), 1);
    }

    #[test]
    fn dwt_len_matches_symmetric_mode() {
        assert_eq!(dwt_len(256), 130);
        assert_eq!(dwt_len(512), 258);
        assert_eq!(dwt_len(3), 4);
    }

    #[test]
    fn wavelet_field_is_half_resolution() {
        let img = striped(300, 260);
        let field = EnergyEstimator::new(EnergyMethod::Wavelet, 256)
            .estimate(&img)
            .unwrap();
        assert_eq!(field.method(), EnergyMethod::Wavelet);
        assert_eq!(field.decimation(), 2);
        assert_eq!((field.width(), field.height()), (152, 132));
        assert!(field.data().iter().all(|e| e.is_finite() && *e >= 0.0));
    }

    #[test]
    fn flat_image_has_zero_wavelet_energy() {
        let img = RgbImage::from_pixel(64, 64, image::Rgb([90, 120, 200]));
        let field = wavelet_energy(&img, 1.0).unwrap();
        assert!(field.data().iter().all(|e| e.abs() < 1e-6));
    }

    #[test]
    fn checkerboard_has_diagonal_energy() {
        let field = wavelet_energy(&striped(64, 64), 1.0).unwrap();
        let interior = field.get(10, 10);
        assert!(interior > 0.1, "checkerboard should be energetic, got {interior}");
    }

    #[test]
    fn single_pixel_wide_image_falls_back_to_gradient() {
        assert!(wavelet_energy(&RgbImage::new(1, 40), 1.0).is_none());
    }

    #[test]
    fn gradient_fallback_is_finite_and_full_resolution() {
        for (w, h) in [(1, 1), (2, 20), (20, 2), (256, 256), (400, 300)] {
            let img = striped(w, h);
            let field = EnergyEstimator::new(EnergyMethod::Gradient, 256)
                .estimate(&img)
                .unwrap();
            let scaled_w = if w < 256 || h < 256 {
                (f64::from(w) * 256.0 / f64::from(w.min(h))) as u32 + 1
            } else {
                w
            };
            assert_eq!(field.method(), EnergyMethod::Gradient);
            assert_eq!(field.width(), scaled_w);
            assert!(field.width() >= 256 && field.height() >= 256);
            assert!(field.data().iter().all(|e| e.is_finite() && *e >= 0.0));
        }
    }

    #[test]
    fn small_image_records_scale_and_maps_back() {
        let img = striped(128, 200);
        let field = EnergyEstimator::new(EnergyMethod::Wavelet, 256)
            .estimate(&img)
            .unwrap();
        assert!((field.scale() - 2.0).abs() < 1e-9);
        // field cell 10 -> search pixel 20 -> source pixel 10
        assert_eq!(field.to_source(10, 10), (10, 10));
        assert_eq!(field.window_for(256), 128);
    }

    #[test]
    fn extreme_aspect_ratio_is_rejected_before_upscaling() {
        let img = RgbImage::from_pixel(2, 2000, image::Rgb([10, 20, 30]));
        let err = EnergyEstimator::new(EnergyMethod::Wavelet, 256)
            .estimate(&img)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)), "{err}");

        let err = EnergyEstimator::new(EnergyMethod::Gradient, 256)
            .estimate(&RgbImage::new(4096, 1))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)), "{err}");
    }

    #[test]
    fn search_side_limit_is_configurable() {
        // 40x20 upscales to 513x257
        let img = striped(40, 20);
        let tight = EnergyEstimator::new(EnergyMethod::Gradient, 256).with_max_side(512);
        assert!(tight.estimate(&img).is_err());
        let field = EnergyEstimator::new(EnergyMethod::Gradient, 256)
            .with_max_side(513)
            .estimate(&img)
            .unwrap();
        assert_eq!((field.width(), field.height()), (513, 257));
    }

    #[test]
    fn large_images_are_not_limited() {
        let field = EnergyEstimator::new(EnergyMethod::Gradient, 16)
            .with_max_side(64)
            .estimate(&striped(300, 200))
            .unwrap();
        assert_eq!((field.width(), field.height()), (300, 200));
    }

    #[test]
    fn empty_image_is_invalid() {
        let err = EnergyEstimator::new(EnergyMethod::Wavelet, 256)
            .estimate(&RgbImage::new(0, 10))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn estimate_is_deterministic() {
        let img = striped(280, 270);
        let est = EnergyEstimator::new(EnergyMethod::Wavelet, 256);
        let a = est.estimate(&img).unwrap();
        let b = est.estimate(&img).unwrap();
        assert_eq!(a.data(), b.data());
    }

    #[test]
    fn sobel_returns_zero_for_flat_image() {
        let data = vec![0.5_f32; 10 * 10];
        let grad = sobel_magnitude(&data, 10, 10);
        for &g in &grad {
            assert!(g.abs() < 1e-6, "Flat image should have zero gradient");
        }
    }

    #[test]
    fn sobel_detects_vertical_edge() {
        let mut data = vec![0.0_f32; 10 * 10];
        for y in 0..10 {
            for x in 5..10 {
                data[y * 10 + x] = 1.0;
            }
        }
        let grad = sobel_magnitude(&data, 10, 10);
        let center_grad = grad[5 * 10 + 5];
        assert!(
            center_grad > 0.1,
            "Edge should produce non-zero gradient, got {center_grad}"
        );
    }

    #[test]
    fn sobel_tolerates_tiny_inputs() {
        assert_eq!(sobel_magnitude(&[1.0, 2.0], 2, 1), vec![0.0, 0.0]);
        assert!(sobel_magnitude(&[], 0, 0).is_empty());
    }
}
