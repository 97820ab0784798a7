//! Orientation correction for sensor rasters.

use crate::frame::RasterImage;
use image::{imageops, Rgb};
use serde::{Deserialize, Serialize};

/// How the rotation angle is derived for a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationPolicy {
    /// Rotate by the sensor mounting angle alone.
    #[default]
    SensorOnly,
    /// Rotate by `(sensor + compensation) mod 360`.
    Compensated,
}

impl RotationPolicy {
    /// Angle in degrees, in `[0, 360)`.
    pub fn angle(self, sensor_orientation: i32, rotation_compensation: i32) -> i32 {
        match self {
            Self::SensorOnly => sensor_orientation.rem_euclid(360),
            Self::Compensated => {
                (sensor_orientation.rem_euclid(360) + rotation_compensation.rem_euclid(360)).rem_euclid(360)
            }
        }
    }
}

impl std::str::FromStr for RotationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sensor" | "sensor_only" => Ok(Self::SensorOnly),
            "compensated" => Ok(Self::Compensated),
            other => Err(format!("unknown rotation policy: {other} (expected sensor_only or compensated)")),
        }
    }
}

/// Rotate clockwise by `angle_degrees`.
///
/// Quarter turns transpose pixels exactly. Any other angle is resampled
/// bilinearly onto a canvas large enough to hold the rotated image; pixels
/// not covered by the source are black.
pub fn rotate(image: RasterImage, angle_degrees: f32) -> RasterImage {
    let angle = angle_degrees.rem_euclid(360.0);

    if angle == 0.0 {
        return image;
    }
    if angle == 90.0 {
        return imageops::rotate90(&image);
    }
    if angle == 180.0 {
        return imageops::rotate180(&image);
    }
    if angle == 270.0 {
        return imageops::rotate270(&image);
    }

    rotate_bilinear(&image, angle.to_radians())
}

fn rotate_bilinear(src: &RasterImage, theta: f32) -> RasterImage {
    let (sw, sh) = src.dimensions();
    let (sin, cos) = theta.sin_cos();

    let out_w = (sw as f32 * cos.abs() + sh as f32 * sin.abs()).round().max(1.0) as u32;
    let out_h = (sw as f32 * sin.abs() + sh as f32 * cos.abs()).round().max(1.0) as u32;

    let src_cx = sw as f32 / 2.0;
    let src_cy = sh as f32 / 2.0;
    let dst_cx = out_w as f32 / 2.0;
    let dst_cy = out_h as f32 / 2.0;

    let sample = |x: i32, y: i32, c: usize| -> f32 {
        if x >= 0 && y >= 0 && (x as u32) < sw && (y as u32) < sh {
            src.get_pixel(x as u32, y as u32).0[c] as f32
        } else {
            0.0
        }
    };

    let mut out = RasterImage::new(out_w, out_h);

    for (ox, oy, pixel) in out.enumerate_pixels_mut() {
        // Inverse map the output pixel centre back into the source (y down,
        // so a clockwise turn on screen is the standard rotation matrix).
        let dx = ox as f32 + 0.5 - dst_cx;
        let dy = oy as f32 + 0.5 - dst_cy;
        let sx = cos * dx + sin * dy + src_cx - 0.5;
        let sy = -sin * dx + cos * dy + src_cy - 0.5;

        if sx <= -1.0 || sy <= -1.0 || sx >= sw as f32 || sy >= sh as f32 {
            continue;
        }

        let x0 = sx.floor() as i32;
        let y0 = sy.floor() as i32;
        let fx = sx - x0 as f32;
        let fy = sy - y0 as f32;

        let mut rgb = [0u8; 3];
        for (c, channel) in rgb.iter_mut().enumerate() {
            let val = sample(x0, y0, c) * (1.0 - fx) * (1.0 - fy)
                + sample(x0 + 1, y0, c) * fx * (1.0 - fy)
                + sample(x0, y0 + 1, c) * (1.0 - fx) * fy
                + sample(x0 + 1, y0 + 1, c) * fx * fy;
            *channel = val.round().clamp(0.0, 255.0) as u8;
        }
        *pixel = Rgb(rgb);
    }

    out
}
