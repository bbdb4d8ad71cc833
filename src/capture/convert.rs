//! Scaling and pixel-format conversion into a buffer's declared shape

use bytes::Bytes;
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::sync::Arc;
use tracing::debug;

use super::frame::{Frame, FrameMetadata, FrameShape, PixelFormat};
use crate::error::RectifyError;

/// Source/target pair a context was built for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ConversionKey {
    source: FrameShape,
    target: FrameShape,
}

/// Cached conversion state. Owned by exactly one writer and never shared.
#[derive(Debug)]
pub struct ConversionContext {
    key: Option<ConversionKey>,
    filter: FilterType,
    /// Packed output size for the current key
    output_len: usize,
    rebuilds: u64,
}

impl Default for ConversionContext {
    fn default() -> Self {
        Self::new(FilterType::Triangle)
    }
}

impl ConversionContext {
    pub fn new(filter: FilterType) -> Self {
        Self {
            key: None,
            filter,
            output_len: 0,
            rebuilds: 0,
        }
    }

    /// Number of times the context had to be rebuilt for a new source/target pair
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }

    /// Convert `src` into `target`, copying the timing metadata last.
    /// The packed pixels are moved into the new frame, never copied again.
    pub fn convert(&mut self, src: &Frame, target: FrameShape) -> Result<Frame, RectifyError> {
        if target.width == 0 || target.height == 0 {
            return Err(RectifyError::allocation(format!(
                "invalid conversion target {}x{}",
                target.width, target.height
            )));
        }

        let key = ConversionKey {
            source: src.shape(),
            target,
        };
        if self.key != Some(key) {
            self.output_len = target.width as usize
                * target.height as usize
                * target.format.bytes_per_pixel() as usize;
            debug!(
                "Rebuilt conversion context {:?} -> {:?}",
                key.source, key.target
            );
            self.key = Some(key);
            self.rebuilds += 1;
        }

        let mut rgb = src.to_rgb_image()?;
        if (rgb.width(), rgb.height()) != (target.width, target.height) {
            rgb = imageops::resize(&rgb, target.width, target.height, self.filter);
        }

        let len = self.output_len;
        let mut packed = Vec::new();
        packed
            .try_reserve_exact(len)
            .map_err(|e| RectifyError::allocation(format!("output of {len} bytes: {e}")))?;
        pack_rgb(&rgb, target.format, &mut packed);
        let data = Bytes::from(packed);

        let meta = FrameMetadata {
            width: target.width,
            height: target.height,
            stride: target.width * target.format.bytes_per_pixel(),
            format: target.format,
            ..(*src.meta).clone()
        };

        Ok(Frame {
            data,
            meta: Arc::new(meta),
            timestamp: src.timestamp,
        })
    }
}

fn pack_rgb(rgb: &RgbImage, format: PixelFormat, out: &mut Vec<u8>) {
    match format {
        PixelFormat::Rgb24 => out.extend_from_slice(rgb.as_raw()),
        PixelFormat::Bgr24 => {
            for px in rgb.pixels() {
                out.extend_from_slice(&[px[2], px[1], px[0]]);
            }
        }
        PixelFormat::Rgba32 => {
            for px in rgb.pixels() {
                out.extend_from_slice(&[px[0], px[1], px[2], 255]);
            }
        }
        PixelFormat::Gray8 => {
            // BT.601 luma
            for px in rgb.pixels() {
                let y = 0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32;
                out.push(y.round().clamp(0.0, 255.0) as u8);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::tests::solid;

    fn shape(width: u32, height: u32, format: PixelFormat) -> FrameShape {
        FrameShape {
            width,
            height,
            format,
        }
    }

    #[test]
    fn format_only_conversion() {
        let mut ctx = ConversionContext::default();
        let src = solid(4, 2, PixelFormat::Gray8, 9, 100);
        let out = ctx.convert(&src, shape(4, 2, PixelFormat::Rgba32)).unwrap();
        assert_eq!(out.meta.format, PixelFormat::Rgba32);
        assert_eq!(out.meta.stride, 16);
        assert_eq!(&out.data[..4], &[100, 100, 100, 255]);
        assert_eq!(out.meta.pts, 9);
        assert_eq!(out.timestamp, src.timestamp);
    }

    #[test]
    fn output_bytes_are_exactly_the_packed_frame() {
        let mut ctx = ConversionContext::default();
        let target = shape(3, 2, PixelFormat::Bgr24);
        let out = ctx
            .convert(&solid(6, 4, PixelFormat::Rgb24, 2, 10), target)
            .unwrap();
        assert_eq!(out.data.len(), 3 * 2 * 3);
        assert_eq!(ctx.output_len, out.data.len());
    }

    #[test]
    fn scaling_keeps_uniform_color() {
        let mut ctx = ConversionContext::default();
        let src = solid(8, 8, PixelFormat::Rgb24, 1, 77);
        let out = ctx.convert(&src, shape(3, 5, PixelFormat::Gray8)).unwrap();
        assert_eq!((out.meta.width, out.meta.height), (3, 5));
        assert!(out.data.iter().all(|&v| v == 77));
    }

    #[test]
    fn context_is_reused_for_same_shape() {
        let mut ctx = ConversionContext::default();
        let target = shape(2, 2, PixelFormat::Rgb24);
        for pts in 0..5 {
            ctx.convert(&solid(4, 4, PixelFormat::Bgr24, pts, 1), target)
                .unwrap();
        }
        assert_eq!(ctx.rebuilds(), 1);
        ctx.convert(&solid(6, 4, PixelFormat::Bgr24, 5, 1), target)
            .unwrap();
        assert_eq!(ctx.rebuilds(), 2);
    }

    #[test]
    fn zero_target_is_an_allocation_failure() {
        let mut ctx = ConversionContext::default();
        let src = solid(2, 2, PixelFormat::Rgb24, 0, 0);
        let err = ctx.convert(&src, shape(0, 2, PixelFormat::Rgb24));
        assert!(matches!(err, Err(RectifyError::AllocationFailure(_))));
    }
}
