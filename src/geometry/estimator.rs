//! Keep-or-recompute policy for the surface transform

use image::RgbImage;
use nalgebra::Point2;
use tracing::{debug, trace, Span};

use super::aspect::{estimate_aspect_ratio, target_rect};
use super::homography::{homography_from_4pt, warp_perspective, warp_with, Homography};
use super::lens::LensModel;
use super::markers::{MarkerSet, Quad};
use crate::capture::frame::Frame;
use crate::error::RectifyError;

/// Mean corner motion, in pixels, below which detections count as stationary
pub const MOTION_THRESHOLD: f64 = 16.0;

/// Transform in use plus the detections it was derived from
#[derive(Debug, Clone, Default)]
pub struct HomographyState {
    /// `None` until a transform has been computed: frames pass through
    pub transform: Option<Homography>,
    pub previous: MarkerSet,
}

/// What one cycle did with the transform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// A new transform was derived from this cycle's markers
    Recomputed,
    /// The stored transform was kept
    Reused(ReuseReason),
    /// No transform exists yet, frames are forwarded as they are
    PassThrough,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReuseReason {
    BelowThreshold,
    Incomplete,
    Degenerate,
    Unsolvable,
}

#[derive(Debug)]
pub struct HomographyEstimator {
    state: HomographyState,
    threshold: f64,
    output_width: u32,
    output_height: u32,
    /// Corners are solved in undistorted pixels and the warp re-applies the
    /// lens when sampling the raw frame
    lens: Option<LensModel>,
    span: Span,
}

impl HomographyEstimator {
    /// Estimator producing `output_width` x `output_height` rectified images
    pub fn new(output_width: u32, output_height: u32, threshold: f64, span: Span) -> Self {
        Self {
            state: HomographyState::default(),
            threshold,
            output_width,
            output_height,
            lens: None,
            span,
        }
    }

    /// Correct for `lens` when solving and warping
    pub fn with_lens(mut self, lens: Option<LensModel>) -> Self {
        self.lens = lens;
        self
    }

    /// Raw-frame position sampled for output pixel `p`, if a transform exists
    #[cfg(test)]
    fn source_point(&self, p: Point2<f64>) -> Option<Point2<f64>> {
        let src_from_dst = self.state.transform?.inverse()?;
        Some(self.to_raw(src_from_dst.apply(p)))
    }

    fn to_raw(&self, p: Point2<f64>) -> Point2<f64> {
        match &self.lens {
            Some(lens) => lens.distort(p),
            None => p,
        }
    }

    fn undistorted(&self, quad: Quad) -> Quad {
        match &self.lens {
            Some(lens) => quad.map(|p| lens.undistort(p)),
            None => quad,
        }
    }

    pub fn state(&self) -> &HomographyState {
        &self.state
    }

    pub fn transform(&self) -> Option<&Homography> {
        self.state.transform.as_ref()
    }

    pub fn output_size(&self) -> (u32, u32) {
        (self.output_width, self.output_height)
    }

    /// Feed one cycle of detections from an `image_width` x `image_height` frame.
    pub fn update(&mut self, markers: &MarkerSet, image_width: u32, image_height: u32) -> Decision {
        let _enter = self.span.enter();

        let displacement = markers.mean_displacement(&self.state.previous);
        if displacement <= self.threshold {
            trace!(displacement, "Markers stationary");
            return self.keep(ReuseReason::BelowThreshold);
        }

        match self.recompute(markers, image_width, image_height) {
            Ok(transform) => {
                debug!(
                    displacement,
                    markers = markers.detected_count(),
                    "Recomputed surface transform"
                );
                self.state.transform = Some(transform);
                self.state.previous = *markers;
                Decision::Recomputed
            }
            Err(reason) => self.keep(reason),
        }
    }

    fn keep(&self, reason: ReuseReason) -> Decision {
        if self.state.transform.is_some() {
            Decision::Reused(reason)
        } else {
            Decision::PassThrough
        }
    }

    fn recompute(
        &self,
        markers: &MarkerSet,
        image_width: u32,
        image_height: u32,
    ) -> Result<Homography, ReuseReason> {
        let outer = markers.outer_corners().ok_or(ReuseReason::Incomplete)?;
        let outer = self.undistorted(outer);

        let aspect = estimate_aspect_ratio(&outer, image_width, image_height).map_err(|err| {
            debug!("Skipping recompute: {err}");
            if err.is_recoverable() {
                ReuseReason::Degenerate
            } else {
                ReuseReason::Unsolvable
            }
        })?;

        let target = target_rect(aspect, self.output_width, self.output_height);
        homography_from_4pt(&outer, &target).ok_or(ReuseReason::Unsolvable)
    }

    /// Rectify `working` (the RGB view of `frame`) with the stored transform.
    /// Without a transform the input frame is returned untouched.
    pub fn apply(&self, frame: &Frame, working: &RgbImage) -> Result<Frame, RectifyError> {
        let Some(transform) = &self.state.transform else {
            return Ok(frame.clone());
        };

        let (w, h) = (self.output_width, self.output_height);
        let not_invertible = || RectifyError::Fatal("stored transform is not invertible".into());
        let warped = match &self.lens {
            None => warp_perspective(working, transform, w, h).ok_or_else(not_invertible)?,
            Some(_) => {
                let src_from_dst = transform.inverse().ok_or_else(not_invertible)?;
                warp_with(working, w, h, |p| self.to_raw(src_from_dst.apply(p)))
            }
        };
        Ok(Frame::from_rgb_image(warped, frame))
    }
}
