//! Decoder boundary: anything that yields decoded video frames in order

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use bytes::Bytes;
use color_eyre::{eyre::eyre, eyre::WrapErr, Result};
use tracing::{info, instrument};

use crate::capture::frame::{ColorSpace, Frame, FrameMetadata, MediaFrame, PixelFormat, TimeBase};
use crate::CaptureConfig;

/// Producer of decoded frames. `Ok(None)` marks the end of the stream.
///
/// Implementations must hand out monotonically non-decreasing timestamps in a
/// fixed time base.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<Option<MediaFrame>>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn next_frame(&mut self) -> Result<Option<MediaFrame>> {
        (**self).next_frame()
    }
}

/// Numbered still images read from a directory, played back as a stream
pub struct ImageSequenceSource {
    files: Vec<PathBuf>,
    next: usize,
    time_base: TimeBase,
    /// Minimum spacing between frames, `None` to read as fast as possible
    interval: Option<Duration>,
    last_emit: Option<Instant>,
}

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

impl ImageSequenceSource {
    /// Collect the images of `config.input_dir`, sorted by file name
    pub fn new(config: &CaptureConfig) -> Result<Self> {
        info!("Opening image sequence: {}", config.input_dir.display());

        let files = list_images(&config.input_dir)?;
        if files.is_empty() {
            return Err(eyre!(
                "No images found in {}",
                config.input_dir.display()
            ));
        }
        info!("Found {} frames", files.len());

        let interval = config
            .pace
            .then(|| Duration::from_secs_f64(1.0 / config.fps.max(1) as f64));

        Ok(Self {
            files,
            next: 0,
            time_base: TimeBase::per_frame(config.fps),
            interval,
            last_emit: None,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn pace(&mut self) {
        if let (Some(interval), Some(last)) = (self.interval, self.last_emit) {
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
        self.last_emit = Some(Instant::now());
    }
}

impl FrameSource for ImageSequenceSource {
    #[instrument(skip(self), fields(index = self.next))]
    fn next_frame(&mut self) -> Result<Option<MediaFrame>> {
        let Some(path) = self.files.get(self.next) else {
            return Ok(None);
        };

        let rgb = image::open(path)
            .wrap_err_with(|| format!("Failed to decode {}", path.display()))?
            .into_rgb8();
        let (width, height) = rgb.dimensions();

        let pts = self.next as i64;
        self.next += 1;

        let meta = FrameMetadata {
            sequence: pts as u64,
            width,
            height,
            stride: width * 3,
            format: PixelFormat::Rgb24,
            color_space: ColorSpace::Srgb,
            pts,
            time_base: self.time_base,
        };
        let frame = Frame::new(meta, Bytes::from(rgb.into_raw()))?;

        self.pace();
        Ok(Some(MediaFrame::Video(frame)))
    }
}

fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let entries = std::fs::read_dir(dir)
        .wrap_err_with(|| format!("Failed to read input directory {}", dir.display()))?;

    for entry in entries {
        let path = entry?.path();
        let is_image = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if path.is_file() && is_image {
            files.push(path);
        }
    }

    files.sort();
    Ok(files)
}
