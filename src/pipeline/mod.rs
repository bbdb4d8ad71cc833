//! Three-stage pipeline: capture -> rectify -> output.
//!
//! Each stage runs on its own OS thread and talks to its neighbours only
//! through [`buffer::FrameBuffer`]s. The [`coordinator::Coordinator`] owns the
//! threads, the shared stop flag and the error log.

pub mod buffer;
pub mod coordinator;
pub mod rectify;
pub mod stage;

use color_eyre::{Report, Result};
use tracing::{info, info_span, warn};

use crate::capture::source::FrameSource;
use crate::detect::MarkerDetector;
use crate::Config;
pub use buffer::{FrameObserver, FrameProducer, WaitOutcome};
pub use coordinator::{Coordinator, StopToken};
pub use rectify::{RectifyStage, RectifyStats, StageExit};
pub use stage::{CaptureStage, FrameSink, ImageSequenceSink, OutputStage};

/// Handle to a running pipeline
pub struct Pipeline {
    coordinator: Coordinator,
}

impl Pipeline {
    /// Wire the three stages and start their threads
    pub fn spawn<S, D, K>(config: &Config, source: S, detector: D, sink: K) -> Result<Self>
    where
        S: FrameSource + 'static,
        D: MarkerDetector + 'static,
        K: FrameSink + 'static,
    {
        let coordinator = Coordinator::new(info_span!("coordinator"));
        let stop = coordinator.stop_token();

        let raw = FrameProducer::new("raw", config.capture.declared_shape());
        let warped = FrameProducer::new("warped", None);
        stop.watch(raw.buffer());
        stop.watch(warped.buffer());

        let capture = CaptureStage::new(source, raw, info_span!("capture"));
        let rectify = RectifyStage::new(
            capture.output(),
            warped,
            detector,
            &config.rectify,
            info_span!("rectify"),
        )
        .with_lens(config.calibration.lens_model());
        let output = OutputStage::new(sink, rectify.output(), info_span!("output"));

        let cores = if config.pipeline.pin_threads {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };
        let pin = move |index: usize| {
            if let Some(core) = cores.get(index % cores.len().max(1)).copied() {
                if !core_affinity::set_for_current(core) {
                    warn!("Failed to pin stage thread to core {}", core.id);
                }
            }
        };

        // Consumers first so nothing published early is missed
        let started = (|| -> Result<()> {
            let worker = coordinator.clone();
            let pin_output = pin.clone();
            coordinator.spawn("output", move || {
                pin_output(2);
                output.run(&worker);
            })?;

            let worker = coordinator.clone();
            let pin_rectify = pin.clone();
            coordinator.spawn("rectify", move || {
                pin_rectify(1);
                rectify.run(&worker);
            })?;

            let worker = coordinator.clone();
            coordinator.spawn("capture", move || {
                pin(0);
                capture.run(&worker);
            })
        })();

        if let Err(e) = started {
            // Stages that never started dropped their buffers, the rest drain
            coordinator.request_stop();
            coordinator.join_all();
            return Err(e);
        }

        info!("Pipeline running");
        Ok(Self { coordinator })
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn request_stop(&self) {
        self.coordinator.request_stop();
    }

    /// Wait for every stage to finish and return the errors they reported
    pub fn join(self) -> Vec<Report> {
        self.coordinator.teardown()
    }
}
