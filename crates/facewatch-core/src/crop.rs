//! Face region extraction.

use crate::frame::RasterImage;
use crate::types::BoundingBox;
use image::imageops;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CropError {
    #[error(
        "crop {width}x{height} at ({left}, {top}) exceeds image bounds {image_width}x{image_height}"
    )]
    OutOfBounds {
        left: i64,
        top: i64,
        width: i64,
        height: i64,
        image_width: u32,
        image_height: u32,
    },
}

/// Integer pixel rectangle obtained by truncating a box toward zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    /// Truncate `bbox` and check it lies entirely inside a `width`×`height` image.
    pub fn within(bbox: &BoundingBox, width: u32, height: u32) -> Result<Self, CropError> {
        let left = bbox.left.trunc() as i64;
        let top = bbox.top.trunc() as i64;
        let w = bbox.width.trunc() as i64;
        let h = bbox.height.trunc() as i64;

        let finite = [bbox.left, bbox.top, bbox.width, bbox.height]
            .iter()
            .all(|v| v.is_finite());
        let fits = |origin: i64, extent: i64, limit: u32| {
            origin >= 0 && extent > 0 && origin.checked_add(extent).is_some_and(|end| end <= limit as i64)
        };
        let inside = finite && fits(left, w, width) && fits(top, h, height);

        if !inside {
            return Err(CropError::OutOfBounds {
                left,
                top,
                width: w,
                height: h,
                image_width: width,
                image_height: height,
            });
        }

        Ok(Self {
            left: left as u32,
            top: top as u32,
            width: w as u32,
            height: h as u32,
        })
    }
}

/// Copy the region under `bbox` out of `image`.
pub fn crop(image: &RasterImage, bbox: &BoundingBox) -> Result<RasterImage, CropError> {
    let rect = PixelRect::within(bbox, image.width(), image.height())?;
    Ok(imageops::crop_imm(image, rect.left, rect.top, rect.width, rect.height).to_image())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn gradient(w: u32, h: u32) -> RasterImage {
        RasterImage::from_fn(w, h, |x, y| Rgb([x as u8, y as u8, (x + y) as u8]))
    }

    #[test]
    fn test_crop_size_and_origin() {
        let img = gradient(64, 48);
        for (l, t, w, h) in [(0.0, 0.0, 64.0, 48.0), (10.0, 5.0, 20.0, 30.0), (63.0, 47.0, 1.0, 1.0)] {
            let out = crop(&img, &BoundingBox::new(l, t, w, h)).unwrap();
            assert_eq!(out.dimensions(), (w as u32, h as u32));
            assert_eq!(out.get_pixel(0, 0), img.get_pixel(l as u32, t as u32));
        }
    }

    #[test]
    fn test_crop_truncates_toward_zero() {
        let img = gradient(32, 32);
        let out = crop(&img, &BoundingBox::new(4.9, 2.7, 10.99, 6.2)).unwrap();
        assert_eq!(out.dimensions(), (10, 6));
        assert_eq!(out.get_pixel(0, 0).0, [4, 2, 6]);
        assert_eq!(out.get_pixel(9, 5).0, [13, 7, 20]);
    }

    #[test]
    fn test_crop_small_negative_offset_truncates_to_zero() {
        let img = gradient(16, 16);
        let out = crop(&img, &BoundingBox::new(-0.5, -0.9, 4.0, 4.0)).unwrap();
        assert_eq!(out.get_pixel(0, 0), img.get_pixel(0, 0));
    }

    #[test]
    fn test_crop_out_of_bounds() {
        let img = gradient(16, 16);
        let err = crop(&img, &BoundingBox::new(10.0, 0.0, 8.0, 4.0)).unwrap_err();
        assert_eq!(
            err,
            CropError::OutOfBounds { left: 10, top: 0, width: 8, height: 4, image_width: 16, image_height: 16 }
        );
        assert!(crop(&img, &BoundingBox::new(-2.0, 0.0, 4.0, 4.0)).is_err());
        assert!(crop(&img, &BoundingBox::new(0.0, 14.0, 4.0, 4.0)).is_err());
    }

    #[test]
    fn test_crop_degenerate_box_rejected() {
        let img = gradient(16, 16);
        assert!(crop(&img, &BoundingBox::new(2.0, 2.0, 0.9, 4.0)).is_err());
        assert!(crop(&img, &BoundingBox::new(2.0, 2.0, 4.0, -3.0)).is_err());
    }

    #[test]
    fn test_crop_non_finite_rejected() {
        let img = gradient(16, 16);
        assert!(crop(&img, &BoundingBox::new(f32::NAN, 0.0, f32::NAN, 4.0)).is_err());
        // NaN origins would otherwise cast to 0 and pass.
        assert!(crop(&img, &BoundingBox::new(f32::NAN, 0.0, 4.0, 4.0)).is_err());
        assert!(crop(&img, &BoundingBox::new(0.0, f32::NAN, 4.0, 4.0)).is_err());
        assert!(crop(&img, &BoundingBox::new(f32::INFINITY, 0.0, 4.0, 4.0)).is_err());
        assert!(crop(&img, &BoundingBox::new(0.0, 0.0, 4.0, f32::NEG_INFINITY)).is_err());
    }

    #[test]
    fn test_crop_huge_coordinates_rejected() {
        let img = RasterImage::new(16, 16);
        let err = crop(&img, &BoundingBox::new(1e30, 0.0, 1e30, 4.0)).unwrap_err();
        assert!(matches!(err, CropError::OutOfBounds { image_width: 16, .. }));
        assert!(crop(&img, &BoundingBox::new(0.0, 1e30, 4.0, 1e30)).is_err());
        assert!(crop(&img, &BoundingBox::new(0.0, 0.0, 1e30, 4.0)).is_err());
    }
}
