//! Cropping the located region out of the full-resolution image.

use image::{imageops, RgbImage};

use crate::error::Result;
use crate::roi::{Roi, Size};

/// A full-fidelity crop of the source image and the region it came from.
#[derive(Debug, Clone)]
pub struct Patch {
    /// Cropped pixels, `roi.width` x `roi.height`.
    pub image: RgbImage,
    /// The region that produced the crop, after clipping.
    pub roi: Roi,
}

impl Patch {
    /// Patch width in pixels.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    /// Patch height in pixels.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Crop `roi` out of the unscaled `original`.
///
/// A region reaching past the image edge is moved back inside it (and
/// shrunk if the image is smaller than the region), with a warning.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if no pixel of the image can be covered,
/// i.e. the image is empty or the region has no area.
pub fn extract(original: &RgbImage, roi: Roi) -> Result<Patch> {
    let size = Size::of(original);
    if roi.width == 0 || roi.height == 0 {
        return Err(roi.out_of_bounds());
    }

    let clipped = Roi {
        source_image_size: size,
        ..roi
    }
    .clipped()?;

    if clipped != roi {
        tracing::warn!(
            x = roi.x,
            y = roi.y,
            width = roi.width,
            height = roi.height,
            clipped_x = clipped.x,
            clipped_y = clipped.y,
            clipped_width = clipped.width,
            clipped_height = clipped.height,
            "ROI clipped to image bounds"
        );
    }

    let image =
        imageops::crop_imm(original, clipped.x, clipped.y, clipped.width, clipped.height)
            .to_image();
    Ok(Patch {
        image,
        roi: clipped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[allow(clippy::cast_possible_truncation)]
    fn gradient_image(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        })
    }

    fn roi(x: u32, y: u32, side: u32, size: Size) -> Roi {
        Roi {
            x,
            y,
            width: side,
            height: side,
            source_image_size: size,
        }
    }

    #[test]
    fn crop_keeps_original_pixels() {
        let img = gradient_image(512, 400);
        let patch = extract(&img, roi(100, 50, 256, Size::of(&img))).unwrap();
        assert_eq!((patch.width(), patch.height()), (256, 256));
        assert_eq!(patch.image.get_pixel(0, 0), img.get_pixel(100, 50));
        assert_eq!(patch.image.get_pixel(255, 255), img.get_pixel(355, 305));
    }

    #[test]
    fn overflowing_roi_is_clipped_to_corner() {
        let img = gradient_image(300, 280);
        let patch = extract(&img, roi(200, 200, 256, Size::of(&img))).unwrap();
        assert_eq!(patch.roi.x + patch.roi.width, 300);
        assert_eq!(patch.roi.y + patch.roi.height, 280);
        assert_eq!((patch.width(), patch.height()), (256, 256));
        assert_eq!(patch.image.get_pixel(255, 255), img.get_pixel(299, 279));
    }

    #[test]
    fn roi_larger_than_image_shrinks() {
        let img = gradient_image(120, 90);
        let patch = extract(&img, roi(0, 0, 256, Size::of(&img))).unwrap();
        assert_eq!((patch.width(), patch.height()), (120, 90));
    }

    #[test]
    fn stale_source_size_is_replaced() {
        let img = gradient_image(300, 300);
        let patch = extract(&img, roi(10, 10, 256, Size::new(1000, 1000))).unwrap();
        assert_eq!(patch.roi.source_image_size, Size::new(300, 300));
        assert_eq!(patch.roi.x + patch.roi.width, 266);
    }

    #[test]
    fn empty_image_is_out_of_bounds() {
        let img = RgbImage::new(0, 0);
        let err = extract(&img, roi(0, 0, 256, Size::new(0, 0))).unwrap_err();
        assert!(matches!(err, Error::OutOfBounds { .. }));
    }
}
