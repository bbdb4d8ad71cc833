use bytes::Bytes;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

use crate::error::RectifyError;

/// Decoded video frame. Pixel data and metadata are immutable once built;
/// a new frame replaces an old one wholesale.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Immutable frame data - can be shared across threads without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Wall-clock instant the frame entered the pipeline, for latency tracking
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone, PartialEq)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    /// Bytes per row
    pub stride: u32,
    pub format: PixelFormat,
    pub color_space: ColorSpace,
    /// Presentation timestamp in `time_base` units
    pub pts: i64,
    pub time_base: TimeBase,
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Rgba32,
    Gray8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => 3,
            PixelFormat::Rgba32 => 4,
            PixelFormat::Gray8 => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ColorSpace {
    #[default]
    Srgb,
    Bt601,
    Bt709,
}

/// Rational time base, one tick is `num / den` seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBase {
    pub num: u32,
    pub den: u32,
}

impl TimeBase {
    pub const MICROS: TimeBase = TimeBase {
        num: 1,
        den: 1_000_000,
    };

    /// One tick per frame at the given rate
    pub fn per_frame(fps: u32) -> Self {
        Self {
            num: 1,
            den: fps.max(1),
        }
    }

    pub fn seconds(&self, ticks: i64) -> f64 {
        ticks as f64 * self.num as f64 / self.den.max(1) as f64
    }
}

impl Default for TimeBase {
    fn default() -> Self {
        Self::MICROS
    }
}

/// Kinds of media the pipeline carries. Only video reaches the core.
#[derive(Debug, Clone)]
pub enum MediaFrame {
    Video(Frame),
}

/// Width, height and pixel layout a buffer is declared with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameShape {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl Frame {
    /// Build a frame, checking that `data` covers `stride * height` bytes.
    pub fn new(meta: FrameMetadata, data: Bytes) -> Result<Self, RectifyError> {
        let min_stride = meta.width as usize * meta.format.bytes_per_pixel() as usize;
        if meta.width == 0 || meta.height == 0 {
            return Err(RectifyError::allocation(format!(
                "empty frame {}x{}",
                meta.width, meta.height
            )));
        }
        if (meta.stride as usize) < min_stride {
            return Err(RectifyError::allocation(format!(
                "stride {} shorter than a {}px row of {:?}",
                meta.stride, meta.width, meta.format
            )));
        }
        let needed = meta.stride as usize * meta.height as usize;
        if data.len() < needed {
            return Err(RectifyError::allocation(format!(
                "frame data holds {} bytes, {} needed",
                data.len(),
                needed
            )));
        }

        Ok(Self {
            data,
            meta: Arc::new(meta),
            timestamp: Instant::now(),
        })
    }

    /// Tightly packed RGB frame built from a working image, inheriting the
    /// timing metadata and pipeline entry instant of `like`.
    pub fn from_rgb_image(image: RgbImage, like: &Frame) -> Self {
        let (width, height) = image.dimensions();
        let meta = FrameMetadata {
            width,
            height,
            stride: width * 3,
            format: PixelFormat::Rgb24,
            ..(*like.meta).clone()
        };
        Self {
            data: Bytes::from(image.into_raw()),
            meta: Arc::new(meta),
            timestamp: like.timestamp,
        }
    }

    pub fn pts(&self) -> i64 {
        self.meta.pts
    }

    pub fn shape(&self) -> FrameShape {
        FrameShape {
            width: self.meta.width,
            height: self.meta.height,
            format: self.meta.format,
        }
    }

    /// Copy of the same pixels carrying the given presentation timestamp.
    pub fn with_pts(&self, pts: i64) -> Self {
        let meta = FrameMetadata {
            pts,
            ..(*self.meta).clone()
        };
        Self {
            data: self.data.clone(),
            meta: Arc::new(meta),
            timestamp: self.timestamp,
        }
    }

    /// Row `y` without stride padding, `None` if the data does not reach it
    pub fn row(&self, y: u32) -> Option<&[u8]> {
        let start = y as usize * self.meta.stride as usize;
        let len = self.meta.width as usize * self.meta.format.bytes_per_pixel() as usize;
        self.data.get(start..start.checked_add(len)?)
    }

    /// Convert into the RGB working representation used by detection and warping.
    pub fn to_rgb_image(&self) -> Result<RgbImage, RectifyError> {
        let width = self.meta.width;
        let height = self.meta.height;
        let mut rgb = Vec::with_capacity(width as usize * height as usize * 3);

        for y in 0..height {
            let row = self.row(y).ok_or_else(|| {
                RectifyError::allocation(format!(
                    "row {y} lies past the {} bytes of frame pts={}",
                    self.data.len(),
                    self.pts()
                ))
            })?;
            match self.meta.format {
                PixelFormat::Rgb24 => rgb.extend_from_slice(row),
                PixelFormat::Bgr24 => {
                    for px in row.chunks_exact(3) {
                        rgb.extend_from_slice(&[px[2], px[1], px[0]]);
                    }
                }
                PixelFormat::Rgba32 => {
                    for px in row.chunks_exact(4) {
                        rgb.extend_from_slice(&px[..3]);
                    }
                }
                PixelFormat::Gray8 => {
                    for &v in row {
                        rgb.extend_from_slice(&[v, v, v]);
                    }
                }
            }
        }

        RgbImage::from_raw(width, height, rgb)
            .ok_or_else(|| RectifyError::allocation("rgb working image size mismatch"))
    }
}
