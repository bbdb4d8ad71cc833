//! Capture and output stages around the rectifier

use std::path::PathBuf;

use color_eyre::{eyre::eyre, eyre::WrapErr, Result};
use image::ImageFormat;
use tracing::{info, instrument, Span};

use super::buffer::{FrameObserver, FrameProducer, WaitOutcome};
use super::coordinator::Coordinator;
use crate::capture::convert::ConversionContext;
use crate::capture::frame::{Frame, FrameShape, MediaFrame, PixelFormat};
use crate::capture::source::FrameSource;
use crate::OutputConfig;

/// Encoder boundary: consumes every frame the output stage receives
pub trait FrameSink: Send {
    fn write_frame(&mut self, frame: &Frame) -> Result<()>;

    /// Called once after the last frame
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<K: FrameSink + ?Sized> FrameSink for Box<K> {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        (**self).write_frame(frame)
    }

    fn finish(&mut self) -> Result<()> {
        (**self).finish()
    }
}

/// Pulls frames from a source and publishes them into the raw buffer it owns
pub struct CaptureStage<S> {
    source: S,
    producer: FrameProducer,
    span: Span,
}

impl<S: FrameSource> CaptureStage<S> {
    pub fn new(source: S, producer: FrameProducer, span: Span) -> Self {
        Self {
            source,
            producer,
            span,
        }
    }

    pub fn output(&self) -> FrameObserver {
        self.producer.observer()
    }

    /// Returns the number of frames published. The raw buffer is reset when
    /// the source runs dry and closed when the stage returns.
    pub fn run(mut self, coordinator: &Coordinator) -> u64 {
        let span = self.span.clone();
        let _enter = span.enter();
        info!("Capture stage started");

        let mut published = 0u64;
        while !coordinator.is_stop_requested() {
            match self.source.next_frame() {
                Ok(Some(MediaFrame::Video(frame))) => {
                    if let Err(e) = self.producer.update(Some(frame)) {
                        coordinator.fail(
                            color_eyre::Report::new(e).wrap_err("capture stage: publishing frame"),
                        );
                        break;
                    }
                    published += 1;
                }
                Ok(None) => {
                    info!("Source exhausted after {published} frames");
                    if let Err(e) = self.producer.update(None) {
                        coordinator
                            .fail(color_eyre::Report::new(e).wrap_err("capture stage: ending stream"));
                    }
                    break;
                }
                Err(e) => {
                    coordinator.fail(e.wrap_err("capture stage: reading source"));
                    break;
                }
            }
        }

        info!(published, "Capture stage stopped");
        published
    }
}

/// Waits on the rectified buffer and hands each new frame to a sink
pub struct OutputStage<K> {
    sink: K,
    upstream: FrameObserver,
    span: Span,
}

impl<K: FrameSink> OutputStage<K> {
    pub fn new(sink: K, upstream: FrameObserver, span: Span) -> Self {
        Self {
            sink,
            upstream,
            span,
        }
    }

    /// Returns the number of frames written
    pub fn run(mut self, coordinator: &Coordinator) -> u64 {
        let span = self.span.clone();
        let _enter = span.enter();
        info!("Output stage started");

        let stop = coordinator.stop_token();
        let mut last_pts = None;
        let mut written = 0u64;

        loop {
            if stop.is_stop_requested() {
                break;
            }
            let frame = match self.upstream.wait_newer(last_pts, &stop) {
                WaitOutcome::Frame(frame) => frame,
                WaitOutcome::EndOfStream | WaitOutcome::Closed | WaitOutcome::Stopped => break,
            };
            last_pts = Some(frame.pts());

            if let Err(e) = self.sink.write_frame(&frame) {
                coordinator.fail(e.wrap_err(format!("output stage: writing pts={}", frame.pts())));
                break;
            }
            written += 1;
            metrics::histogram!("frame_latency_ms")
                .record(frame.timestamp.elapsed().as_secs_f64() * 1000.0);
        }

        if let Err(e) = self.sink.finish() {
            coordinator.fail(e.wrap_err("output stage: finishing sink"));
        }
        info!(written, "Output stage stopped");
        written
    }
}

/// Writes each frame as `frame_<pts>.png` into a directory
pub struct ImageSequenceSink {
    dir: PathBuf,
    context: ConversionContext,
}

impl ImageSequenceSink {
    pub fn new(config: &OutputConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.output_dir).wrap_err_with(|| {
            format!(
                "Failed to create output directory {}",
                config.output_dir.display()
            )
        })?;
        Ok(Self {
            dir: config.output_dir.clone(),
            context: ConversionContext::default(),
        })
    }
}

impl FrameSink for ImageSequenceSink {
    #[instrument(skip_all, fields(pts = frame.pts()))]
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let rgb_shape = FrameShape {
            format: PixelFormat::Rgb24,
            ..frame.shape()
        };
        let rgb = if frame.shape() == rgb_shape && frame.meta.stride == frame.meta.width * 3 {
            frame.clone()
        } else {
            self.context.convert(frame, rgb_shape)?
        };

        let len = rgb.meta.width as usize * rgb.meta.height as usize * 3;
        let pixels = rgb
            .data
            .get(..len)
            .ok_or_else(|| eyre!("frame pts={} holds fewer than {len} bytes", frame.pts()))?;

        let path = self.dir.join(format!("frame_{:06}.png", frame.pts()));
        image::save_buffer_with_format(
            &path,
            pixels,
            rgb.meta.width,
            rgb.meta.height,
            image::ExtendedColorType::Rgb8,
            ImageFormat::Png,
        )
        .wrap_err_with(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}
