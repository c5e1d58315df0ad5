//! Sliding-window search for the most energetic fixed-size region.

use serde::Serialize;

use crate::energy::EnergyField;
use crate::error::{Error, Result};

/// Smallest step the search window ever takes.
const MIN_STRIDE: u32 = 16;

/// Width and height of an image in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Size {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Size {
    /// Create a size.
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Size of an image buffer.
    #[must_use]
    pub fn of<I: image::GenericImageView>(image: &I) -> Self {
        let (width, height) = image.dimensions();
        Self { width, height }
    }
}

/// A region of interest in original-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Roi {
    /// Left edge.
    pub x: u32,
    /// Top edge.
    pub y: u32,
    /// Region width.
    pub width: u32,
    /// Region height.
    pub height: u32,
    /// Size of the image the coordinates refer to.
    pub source_image_size: Size,
}

impl Roi {
    /// Whether the region lies entirely inside its source image.
    #[must_use]
    pub fn fits(&self) -> bool {
        self.width > 0
            && self.height > 0
            && u64::from(self.x) + u64::from(self.width) <= u64::from(self.source_image_size.width)
            && u64::from(self.y) + u64::from(self.height)
                <= u64::from(self.source_image_size.height)
    }

    /// Move the region back inside `size`, keeping its extent when the image
    /// is large enough and shrinking it to the image otherwise.
    ///
    /// A region overflowing the bottom-right corner ends up with
    /// `x + width == size.width` and `y + height == size.height`.
    #[must_use]
    pub fn clamp_to(self, size: Size) -> Self {
        let width = self.width.min(size.width);
        let height = self.height.min(size.height);
        Self {
            x: self.x.min(size.width - width),
            y: self.y.min(size.height - height),
            width,
            height,
            source_image_size: size,
        }
    }

    /// Bounds-checked form of [`Roi::clamp_to`] against the region's own
    /// source size.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] if nothing of the region can be kept.
    pub fn clipped(self) -> Result<Self> {
        let clipped = self.clamp_to(self.source_image_size);
        if clipped.fits() {
            Ok(clipped)
        } else {
            Err(self.out_of_bounds())
        }
    }

    pub(crate) fn out_of_bounds(&self) -> Error {
        Error::OutOfBounds {
            x: self.x,
            y: self.y,
            width: self.width,
            height: self.height,
            image_width: self.source_image_size.width,
            image_height: self.source_image_size.height,
        }
    }
}

/// Step between neighbouring window positions: a quarter of the window, at
/// least [`MIN_STRIDE`].
#[must_use]
pub fn window_stride(target_size: u32) -> u32 {
    (target_size / 4).max(MIN_STRIDE)
}

/// Find the window of `target_size` with the greatest total energy.
///
/// Positions are visited in row-major order on a grid of
/// [`window_stride`] steps; the first strictly greatest sum wins. The returned
/// `(x, y)` is in the field's own coordinate space.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] if `target_size` is zero or larger than
/// either field dimension.
pub fn locate(field: &EnergyField, target_size: u32) -> Result<(u32, u32)> {
    let (w, h) = (field.width(), field.height());
    if target_size == 0 || target_size > w || target_size > h {
        return Err(Error::InvalidInput(format!(
            "target size {target_size} larger than {w}x{h} energy field"
        )));
    }

    let table = SummedArea::new(field);
    let stride = window_stride(target_size);

    let mut best = f64::NEG_INFINITY;
    let (mut best_x, mut best_y) = (0, 0);
    for y in (0..=h - target_size).step_by(stride as usize) {
        for x in (0..=w - target_size).step_by(stride as usize) {
            let energy = table.window(x, y, target_size);
            if energy > best {
                best = energy;
                best_x = x;
                best_y = y;
            }
        }
    }

    tracing::debug!(x = best_x, y = best_y, energy = best, stride, "located ROI");
    Ok((best_x, best_y))
}

/// Summed-area table so each window sum costs four lookups.
struct SummedArea {
    width: usize,
    sums: Vec<f64>,
}

impl SummedArea {
    fn new(field: &EnergyField) -> Self {
        let w = field.width() as usize;
        let h = field.height() as usize;
        let stride = w + 1;
        let mut sums = vec![0.0_f64; stride * (h + 1)];
        for y in 0..h {
            let mut row = 0.0_f64;
            for x in 0..w {
                row += f64::from(field.data()[y * w + x]);
                sums[(y + 1) * stride + x + 1] = sums[y * stride + x + 1] + row;
            }
        }
        Self { width: stride, sums }
    }

    fn window(&self, x: u32, y: u32, size: u32) -> f64 {
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = (x0 + size as usize, y0 + size as usize);
        let at = |xx: usize, yy: usize| self.sums[yy * self.width + xx];
        at(x1, y1) - at(x0, y1) - at(x1, y0) + at(x0, y0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::energy::{EnergyField, EnergyMethod};

    fn field(width: u32, height: u32, hot: &[(u32, u32)]) -> EnergyField {
        let mut data = vec![0.0_f32; (width * height) as usize];
        for &(x, y) in hot {
            data[(y * width + x) as usize] = 10.0;
        }
        EnergyField::new(width, height, data, EnergyMethod::Gradient, 1, 1.0)
    }

    #[test]
    fn stride_is_quarter_window_with_floor() {
        assert_eq!(window_stride(256), 64);
        assert_eq!(window_stride(128), 32);
        assert_eq!(window_stride(40), 16);
        assert_eq!(window_stride(8), 16);
    }

    #[test]
    fn rejects_target_larger_than_field() {
        let f = field(100, 200, &[]);
        let err = locate(&f, 128).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(locate(&f, 0).is_err());
    }

    #[test]
    fn finds_hot_region_on_grid() {
        let f = field(200, 200, &[(70, 40), (100, 60)]);
        let (x, y) = locate(&f, 64).unwrap();
        // first grid window in scan order covering both hot pixels
        assert_eq!((x, y), (48, 0));
    }

    #[test]
    fn ties_resolve_to_first_in_scan_order() {
        let f = field(128, 128, &[]);
        assert_eq!(locate(&f, 64).unwrap(), (0, 0));
    }

    #[test]
    fn window_equal_to_field_returns_origin() {
        let f = field(64, 64, &[(63, 63)]);
        assert_eq!(locate(&f, 64).unwrap(), (0, 0));
    }

    #[test]
    fn clamp_moves_overflowing_region_to_corner() {
        let size = Size::new(300, 280);
        let roi = Roi {
            x: 200,
            y: 150,
            width: 256,
            height: 256,
            source_image_size: size,
        }
        .clamp_to(size);
        assert_eq!(roi.x + roi.width, 300);
        assert_eq!(roi.y + roi.height, 280);
        assert_eq!((roi.width, roi.height), (256, 256));
        assert!(roi.fits());
    }

    #[test]
    fn clamp_shrinks_region_larger_than_image() {
        let size = Size::new(100, 300);
        let roi = Roi {
            x: 0,
            y: 10,
            width: 256,
            height: 256,
            source_image_size: size,
        }
        .clamp_to(size);
        assert_eq!((roi.x, roi.width), (0, 100));
        assert_eq!((roi.y, roi.height), (10, 256));
    }

    #[test]
    fn clipped_rejects_empty_image() {
        let roi = Roi {
            x: 0,
            y: 0,
            width: 256,
            height: 256,
            source_image_size: Size::new(0, 0),
        };
        assert!(matches!(roi.clipped(), Err(Error::OutOfBounds { .. })));
    }
}
