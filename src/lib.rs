pub mod capture;
pub mod detect;
pub mod error;
pub mod geometry;
pub mod pipeline;

use std::path::{Path, PathBuf};

use capture::frame::{FrameShape, PixelFormat};
use color_eyre::{eyre::WrapErr, Result};
use serde::{Deserialize, Serialize};

pub use capture::{Frame, FrameMetadata, MediaFrame};
pub use detect::{CalibrationConfig, MarkerDetector};
pub use error::RectifyError;
pub use geometry::{HomographyEstimator, MarkerSet};
pub use pipeline::Pipeline;

/// Prefix of environment overrides, e.g. `RECTIFLOW_RECTIFY__MOTION_THRESHOLD=8`
pub const ENV_PREFIX: &str = "RECTIFLOW";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub capture: CaptureConfig,
    pub rectify: RectifyConfig,
    pub output: OutputConfig,
    pub pipeline: PipelineConfig,
    pub calibration: CalibrationConfig,
    pub detector: DetectorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub input_dir: PathBuf,
    pub fps: u32,
    /// Release frames at `fps` instead of as fast as they decode
    pub pace: bool,
    /// Shape the raw buffer converts incoming frames to; all three must be
    /// set to declare one
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub format: Option<PixelFormat>,
}

impl CaptureConfig {
    pub fn declared_shape(&self) -> Option<FrameShape> {
        Some(FrameShape {
            width: self.width?,
            height: self.height?,
            format: self.format?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RectifyConfig {
    pub output_width: u32,
    pub output_height: u32,
    /// Mean marker motion in pixels that triggers a recompute
    pub motion_threshold: f64,
    /// Treat a failed marker detection as "nothing seen" instead of a fatal error
    pub skip_detector_errors: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pin each stage thread to its own core
    pub pin_threads: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// JSON-lines file of recorded detections, one line per frame
    pub replay: Option<PathBuf>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("frames"),
            fps: 30,
            pace: true,
            width: None,
            height: None,
            format: None,
        }
    }
}

impl Default for RectifyConfig {
    fn default() -> Self {
        Self {
            output_width: 1280,
            output_height: 720,
            motion_threshold: geometry::MOTION_THRESHOLD,
            skip_detector_errors: true,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("rectified"),
        }
    }
}

impl Config {
    /// Defaults, then the optional TOML file, then `RECTIFLOW_*` environment
    /// variables (`__` separates sections).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .wrap_err("Failed to assemble configuration")?
            .try_deserialize()
            .wrap_err("Invalid configuration")
    }
}
