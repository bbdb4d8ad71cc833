//! Rectification stage: raw frames in, surface-aligned frames out

use std::time::Instant;

use color_eyre::{eyre::WrapErr, Result};
use tracing::{debug, info, trace, warn, Span};

use super::buffer::{FrameObserver, FrameProducer, WaitOutcome};
use super::coordinator::Coordinator;
use crate::capture::frame::Frame;
use crate::detect::MarkerDetector;
use crate::geometry::{Decision, HomographyEstimator, LensModel, MarkerSet};
use crate::RectifyConfig;

/// Where the stage loop is. Logged on transitions for tracing stalls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    WaitFrame,
    Detect,
    Recompute,
    Reuse,
    PassThrough,
    Publish,
    Stopped,
}

/// Why the stage loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageExit {
    StopRequested,
    UpstreamEnded,
    UpstreamClosed,
    Failed,
}

/// Per-stage frame counters, logged on exit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RectifyStats {
    pub frames: u64,
    pub recomputed: u64,
    pub reused: u64,
    pub passed_through: u64,
    pub detector_errors: u64,
}

impl RectifyStats {
    fn record(&mut self, decision: Decision) {
        self.frames += 1;
        match decision {
            Decision::Recomputed => self.recomputed += 1,
            Decision::Reused(_) => self.reused += 1,
            Decision::PassThrough => self.passed_through += 1,
        }
    }
}

pub struct RectifyStage<D> {
    upstream: FrameObserver,
    downstream: FrameProducer,
    detector: D,
    estimator: HomographyEstimator,
    skip_detector_errors: bool,
    state: StageState,
    stats: RectifyStats,
    span: Span,
}

impl<D: MarkerDetector> RectifyStage<D> {
    pub fn new(
        upstream: FrameObserver,
        downstream: FrameProducer,
        detector: D,
        config: &RectifyConfig,
        span: Span,
    ) -> Self {
        let estimator = HomographyEstimator::new(
            config.output_width,
            config.output_height,
            config.motion_threshold,
            span.clone(),
        );
        Self {
            upstream,
            downstream,
            detector,
            estimator,
            skip_detector_errors: config.skip_detector_errors,
            state: StageState::WaitFrame,
            stats: RectifyStats::default(),
            span,
        }
    }

    /// Correct detected corners and the warp for `lens`
    pub fn with_lens(mut self, lens: Option<LensModel>) -> Self {
        self.estimator = self.estimator.with_lens(lens);
        self
    }

    /// Observer for the stage's output buffer
    pub fn output(&self) -> FrameObserver {
        self.downstream.observer()
    }

    pub fn state(&self) -> StageState {
        self.state
    }

    fn transition(&mut self, next: StageState) {
        if self.state != next {
            trace!(from = ?self.state, to = ?next, "Stage transition");
            self.state = next;
        }
    }

    /// Run until stopped or the upstream ends. Fatal errors are reported to
    /// `coordinator` with stage context and stop the whole pipeline.
    pub fn run(mut self, coordinator: &Coordinator) -> (StageExit, RectifyStats) {
        let span = self.span.clone();
        let _enter = span.enter();
        info!("Rectify stage started");

        let stop = coordinator.stop_token();
        let mut last_pts = None;

        let exit = loop {
            if stop.is_stop_requested() {
                break StageExit::StopRequested;
            }

            self.transition(StageState::WaitFrame);
            let frame = match self.upstream.wait_newer(last_pts, &stop) {
                WaitOutcome::Frame(frame) => frame,
                WaitOutcome::Stopped => break StageExit::StopRequested,
                WaitOutcome::EndOfStream => {
                    info!("Upstream finished, forwarding end of stream");
                    if let Err(e) = self.downstream.update(None) {
                        coordinator.fail(
                            color_eyre::Report::new(e).wrap_err("rectify stage: resetting output"),
                        );
                        break StageExit::Failed;
                    }
                    break StageExit::UpstreamEnded;
                }
                WaitOutcome::Closed => {
                    info!("Upstream producer gone");
                    break StageExit::UpstreamClosed;
                }
            };
            last_pts = Some(frame.pts());

            if let Err(e) = self.process(&frame) {
                coordinator.fail(e.wrap_err(format!("rectify stage failed on frame pts={}", frame.pts())));
                break StageExit::Failed;
            }
        };

        self.transition(StageState::Stopped);
        info!(
            ?exit,
            frames = self.stats.frames,
            recomputed = self.stats.recomputed,
            reused = self.stats.reused,
            passed_through = self.stats.passed_through,
            detector_errors = self.stats.detector_errors,
            "Rectify stage stopped"
        );
        (exit, self.stats)
    }

    /// One cycle: detect, update the transform, warp and publish.
    pub fn process(&mut self, frame: &Frame) -> Result<Decision> {
        let start = Instant::now();

        let working = frame
            .to_rgb_image()
            .wrap_err("converting frame to working image")?;

        self.transition(StageState::Detect);
        let markers = match self.detector.detect(&working, frame.pts()) {
            Ok(markers) => markers,
            Err(e) if self.skip_detector_errors => {
                warn!("Marker detection failed, keeping previous transform: {e:#}");
                self.stats.detector_errors += 1;
                MarkerSet::new()
            }
            Err(e) => return Err(e.wrap_err("marker detection")),
        };

        let decision = self
            .estimator
            .update(&markers, frame.meta.width, frame.meta.height);
        self.transition(match decision {
            Decision::Recomputed => StageState::Recompute,
            Decision::Reused(_) => StageState::Reuse,
            Decision::PassThrough => StageState::PassThrough,
        });
        if decision == Decision::Recomputed {
            metrics::counter!("rectify_recompute_total").increment(1);
        }
        debug!(pts = frame.pts(), markers = markers.detected_count(), ?decision);

        let output = self
            .estimator
            .apply(frame, &working)
            .wrap_err("warping frame")?;

        self.transition(StageState::Publish);
        self.downstream
            .update(Some(output))
            .wrap_err("publishing rectified frame")?;

        self.stats.record(decision);
        metrics::counter!("rectify_frames_total").increment(1);
        metrics::histogram!("rectify_time_us").record(start.elapsed().as_micros() as f64);
        Ok(decision)
    }
}
