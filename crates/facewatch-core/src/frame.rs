//! Raw sensor frames and their conversion to RGB rasters.

use image::RgbImage;
use thiserror::Error;

/// Decoded 3-channel RGB image, row-major.
pub type RasterImage = RgbImage;

/// Leading bytes before pixel data in a packed BGRA camera buffer.
pub const BGRA_HEADER_OFFSET: usize = 28;
const BGRA_BYTES_PER_PIXEL: usize = 4;

/// Platform pixel format codes: `kCVPixelFormatType_32BGRA` ('BGRA') and
/// Android `ImageFormat.NV21`.
const BGRA_FORMAT_CODE: u32 = u32::from_be_bytes(*b"BGRA");
const NV21_FORMAT_CODE: u32 = 17;

/// Upper clamp of the 18-bit fixed-point channel range.
const YUV_CHANNEL_MAX: i32 = 262_143;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unsupported pixel format: {0:#x}")]
    UnsupportedFormat(u32),
    #[error("frame buffer too short: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("invalid frame dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },
    #[error("unknown pixel format name: {0:?} (expected nv21, bgra, or a numeric code)")]
    UnknownFormatName(String),
}

/// Sensor pixel layout of a raw frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Packed 4 bytes/pixel B,G,R,A after a 28-byte header.
    Bgra8888,
    /// Biplanar 4:2:0: Y plane then interleaved V,U plane.
    Nv21,
    /// Any other platform format code; decoding fails.
    Other(u32),
}

impl PixelFormat {
    /// Map a platform format code to a pixel format.
    pub fn from_code(code: u32) -> Self {
        match code {
            BGRA_FORMAT_CODE => Self::Bgra8888,
            NV21_FORMAT_CODE => Self::Nv21,
            other => Self::Other(other),
        }
    }

    pub fn code(self) -> u32 {
        match self {
            Self::Bgra8888 => BGRA_FORMAT_CODE,
            Self::Nv21 => NV21_FORMAT_CODE,
            Self::Other(code) => code,
        }
    }
}

impl std::str::FromStr for PixelFormat {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bgra" | "bgra8888" => Ok(Self::Bgra8888),
            "nv21" => Ok(Self::Nv21),
            other => other
                .parse::<u32>()
                .map(Self::from_code)
                .map_err(|_| DecodeError::UnknownFormatName(s.to_string())),
        }
    }
}

/// A sensor-native frame borrowed from the caller for one decode.
#[derive(Debug, Clone, Copy)]
pub struct RawFrame<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    /// Bytes per row of the first plane (BGRA only; NV21 rows are `width`).
    pub row_stride: usize,
    pub format: PixelFormat,
}

impl<'a> RawFrame<'a> {
    /// Frame with the tightly packed row stride for its format.
    pub fn new(data: &'a [u8], width: u32, height: u32, format: PixelFormat) -> Self {
        let row_stride = match format {
            PixelFormat::Bgra8888 => width as usize * BGRA_BYTES_PER_PIXEL,
            _ => width as usize,
        };
        Self {
            data,
            width,
            height,
            row_stride,
            format,
        }
    }

    pub fn with_row_stride(mut self, row_stride: usize) -> Self {
        self.row_stride = row_stride;
        self
    }
}

/// Decode a raw frame to an RGB raster.
pub fn decode(frame: &RawFrame<'_>) -> Result<RasterImage, DecodeError> {
    if frame.width == 0 || frame.height == 0 {
        return Err(DecodeError::InvalidDimensions {
            width: frame.width,
            height: frame.height,
        });
    }

    let rgb = match frame.format {
        PixelFormat::Bgra8888 => bgra_to_rgb(frame.data, frame.width, frame.height, frame.row_stride)?,
        PixelFormat::Nv21 => nv21_to_rgb(frame.data, frame.width, frame.height)?,
        PixelFormat::Other(code) => return Err(DecodeError::UnsupportedFormat(code)),
    };

    // Both converters fill exactly width * height * 3 bytes, so this never fails.
    let actual = rgb.len();
    RgbImage::from_raw(frame.width, frame.height, rgb).ok_or(DecodeError::InvalidLength {
        expected: (frame.width as usize)
            .saturating_mul(frame.height as usize)
            .saturating_mul(3),
        actual,
    })
}

/// Strip the header, reorder B,G,R,A to R,G,B and drop alpha.
fn bgra_to_rgb(data: &[u8], width: u32, height: u32, row_stride: usize) -> Result<Vec<u8>, DecodeError> {
    let w = width as usize;
    let h = height as usize;
    let too_large = || DecodeError::InvalidLength {
        expected: usize::MAX,
        actual: data.len(),
    };
    let row_bytes = w.checked_mul(BGRA_BYTES_PER_PIXEL).ok_or_else(too_large)?;
    if row_stride < row_bytes {
        return Err(DecodeError::InvalidLength {
            expected: row_bytes,
            actual: row_stride,
        });
    }

    let expected = (h - 1)
        .checked_mul(row_stride)
        .and_then(|n| n.checked_add(BGRA_HEADER_OFFSET + row_bytes))
        .ok_or_else(too_large)?;
    if data.len() < expected {
        return Err(DecodeError::InvalidLength {
            expected,
            actual: data.len(),
        });
    }

    let mut rgb = Vec::with_capacity(w * h * 3);
    for y in 0..h {
        let start = BGRA_HEADER_OFFSET + y * row_stride;
        for px in data[start..start + row_bytes].chunks_exact(BGRA_BYTES_PER_PIXEL) {
            rgb.extend_from_slice(&[px[2], px[1], px[0]]);
        }
    }
    Ok(rgb)
}

/// Fixed-point NV21 → RGB (coefficients scaled by 1024).
///
/// Chroma is read at even columns and reused for the following odd column;
/// each chroma row serves two luma rows.
fn nv21_to_rgb(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>, DecodeError> {
    let w = width as usize;
    let h = height as usize;
    let too_large = || DecodeError::InvalidLength {
        expected: usize::MAX,
        actual: data.len(),
    };
    // Odd widths still carry a V,U pair for the last column.
    let chroma_stride = w.div_ceil(2) * 2;
    let frame_size = w.checked_mul(h).ok_or_else(too_large)?;
    let expected = h
        .div_ceil(2)
        .checked_mul(chroma_stride)
        .and_then(|n| n.checked_add(frame_size))
        .ok_or_else(too_large)?;
    if data.len() < expected {
        return Err(DecodeError::InvalidLength {
            expected,
            actual: data.len(),
        });
    }

    let mut rgb = vec![0u8; frame_size * 3];
    let mut out = 0usize;

    for j in 0..h {
        let mut uv = frame_size + (j >> 1) * chroma_stride;
        let (mut u, mut v) = (0i32, 0i32);
        let luma_row = &data[j * w..(j + 1) * w];

        for (i, &luma) in luma_row.iter().enumerate() {
            let y = (luma as i32 - 16).max(0);
            if i & 1 == 0 {
                v = data[uv] as i32 - 128;
                u = data[uv + 1] as i32 - 128;
                uv += 2;
            }

            let (r, g, b) = yuv_to_rgb18(y, u, v);
            rgb[out] = (r >> 10) as u8;
            rgb[out + 1] = (g >> 10) as u8;
            rgb[out + 2] = (b >> 10) as u8;
            out += 3;
        }
    }

    Ok(rgb)
}

/// 18-bit fixed-point channels, each clamped to `[0, 262143]`.
#[inline]
fn yuv_to_rgb18(y: i32, u: i32, v: i32) -> (i32, i32, i32) {
    let y1192 = 1192 * y;
    let r = y1192 + 1634 * v;
    let g = y1192 - 833 * v - 400 * u;
    let b = y1192 + 2066 * u;
    (
        r.clamp(0, YUV_CHANNEL_MAX),
        g.clamp(0, YUV_CHANNEL_MAX),
        b.clamp(0, YUV_CHANNEL_MAX),
    )
}
