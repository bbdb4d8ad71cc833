//! Marker-detection boundary and the calibration it consumes

use std::io::BufRead;
use std::path::Path;

use color_eyre::{eyre::WrapErr, Result};
use image::RgbImage;
use nalgebra::Point2;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::geometry::lens::LensModel;
use crate::geometry::markers::{MarkerSet, Quad};

/// Finds the four surface fiducials in a frame.
///
/// Implementations report corner coordinates per marker id in pixel units of
/// the image they were given, as the lens imaged them, corners ordered
/// clockwise from top-left. `pts` is the presentation timestamp of the frame
/// the image came from.
pub trait MarkerDetector: Send {
    fn detect(&mut self, image: &RgbImage, pts: i64) -> Result<MarkerSet>;
}

impl<D: MarkerDetector + ?Sized> MarkerDetector for Box<D> {
    fn detect(&mut self, image: &RgbImage, pts: i64) -> Result<MarkerSet> {
        (**self).detect(image, pts)
    }
}

/// Camera and marker description, read once at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Marker dictionary the detector matches against (e.g. "DICT_4X4_50")
    pub dictionary: String,
    /// Physical side length of one marker
    pub marker_size: f64,
    /// Row-major 3x3 intrinsic matrix
    pub camera_matrix: Option<[[f64; 3]; 3]>,
    /// k1, k2, p1, p2[, k3]
    pub distortion: Option<Vec<f64>>,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            dictionary: "DICT_4X4_50".into(),
            marker_size: 0.05,
            camera_matrix: None,
            distortion: None,
        }
    }
}

impl CalibrationConfig {
    /// Lens the rectifier corrects for, if both the camera matrix and the
    /// distortion coefficients are configured
    pub fn lens_model(&self) -> Option<LensModel> {
        let (Some(k), Some(d)) = (&self.camera_matrix, &self.distortion) else {
            return None;
        };
        LensModel::from_calibration(k, d)
    }
}

/// One marker of a replay record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkerRecord {
    pub id: usize,
    pub corners: [[f64; 2]; 4],
}

/// Replays recorded detections. Line `n` (a JSON array of [`MarkerRecord`],
/// empty when nothing was found) belongs to the frame with pts `n`, so frames
/// the pipeline skips never shift later records. Frames outside the
/// recording report no markers.
#[derive(Debug)]
pub struct ReplayDetector {
    by_pts: Vec<MarkerSet>,
    warned_past_end: bool,
}

impl ReplayDetector {
    pub fn open(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .wrap_err_with(|| format!("Failed to open marker recording {}", path.display()))?;
        let detector = Self::from_reader(std::io::BufReader::new(file))?;
        info!(
            "Loaded {} recorded detection cycles from {}",
            detector.len(),
            path.display()
        );
        Ok(detector)
    }

    pub fn from_reader(reader: impl BufRead) -> Result<Self> {
        let mut by_pts = Vec::new();

        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            let mut set = MarkerSet::new();
            if !line.trim().is_empty() {
                let records: Vec<MarkerRecord> = serde_json::from_str(&line)
                    .wrap_err_with(|| format!("Bad marker record on line {}", index + 1))?;
                for record in records {
                    let corners: Quad = record.corners.map(|[x, y]| Point2::new(x, y));
                    if !set.insert(record.id, corners) {
                        debug!(id = record.id, "Ignoring marker outside the surface set");
                    }
                }
            }
            by_pts.push(set);
        }

        Ok(Self {
            by_pts,
            warned_past_end: false,
        })
    }

    /// Number of recorded frames
    pub fn len(&self) -> usize {
        self.by_pts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_pts.is_empty()
    }
}

impl MarkerDetector for ReplayDetector {
    fn detect(&mut self, _image: &RgbImage, pts: i64) -> Result<MarkerSet> {
        let recorded = usize::try_from(pts)
            .ok()
            .and_then(|index| self.by_pts.get(index));
        match recorded {
            Some(set) => Ok(*set),
            None => {
                if !self.warned_past_end {
                    info!(pts, "No recorded detections for frame, reporting none");
                    self.warned_past_end = true;
                }
                Ok(MarkerSet::new())
            }
        }
    }
}
