//! Single-writer / multi-reader slot holding the latest frame of a stage.
//!
//! The producing stage owns the buffer through a [`FrameProducer`]; consumers
//! hold [`FrameObserver`]s that do not keep it alive. When the producer goes
//! away every observer sees [`WaitOutcome::Closed`] instead of blocking.

use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Instant;

use crossbeam::sync::ShardedLock;
use tracing::{debug, trace, Span};

use super::coordinator::{lock, StopToken};
use crate::capture::convert::ConversionContext;
use crate::capture::frame::{Frame, FrameShape};
use crate::error::RectifyError;

/// Notification state, guarded by the monitor mutex
#[derive(Debug, Default)]
struct Signal {
    /// PTS of the frame in the slot, `None` while uninitialized
    latest_pts: Option<i64>,
    /// Set by a reset, cleared by the next frame
    ended: bool,
    /// Producer handle dropped
    closed: bool,
}

pub struct FrameBuffer {
    name: String,
    shape: Option<FrameShape>,
    slot: ShardedLock<Option<Frame>>,
    signal: Mutex<Signal>,
    changed: Condvar,
    span: Span,
}

/// Result of waiting for the next frame
#[derive(Debug, Clone)]
pub enum WaitOutcome {
    Frame(Frame),
    /// The producer reset the buffer: its stream is over
    EndOfStream,
    /// The producer is gone
    Closed,
    Stopped,
}

impl FrameBuffer {
    fn new(name: &str, shape: Option<FrameShape>) -> Self {
        Self {
            name: name.to_owned(),
            shape,
            slot: ShardedLock::new(None),
            signal: Mutex::new(Signal::default()),
            changed: Condvar::new(),
            span: tracing::debug_span!("buffer", name),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shape frames are converted to on update, if the buffer declares one
    pub fn shape(&self) -> Option<FrameShape> {
        self.shape
    }

    /// Shared access to the current frame. Blocks only while a writer swaps
    /// the slot; any number of readers may hold it at once.
    pub fn read(&self) -> crossbeam::sync::ShardedLockReadGuard<'_, Option<Frame>> {
        self.slot
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn latest_pts(&self) -> Option<i64> {
        lock(&self.signal).latest_pts
    }

    /// Wake every waiter so it re-evaluates its predicate
    pub(crate) fn wake_all(&self) {
        // Taking the monitor lock orders this wake-up after any in-progress
        // predicate check
        let _signal = lock(&self.signal);
        self.changed.notify_all();
    }

    fn publish(&self, frame: Option<Frame>) {
        let pts = frame.as_ref().map(Frame::pts);
        {
            let mut slot = self
                .slot
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            *slot = frame;
        }
        {
            let mut signal = lock(&self.signal);
            signal.latest_pts = pts;
            signal.ended = pts.is_none();
        }
        self.changed.notify_all();
    }

    fn close(&self) {
        lock(&self.signal).closed = true;
        self.changed.notify_all();
    }

    fn wait_newer(&self, last_pts: Option<i64>, stop: &StopToken) -> WaitOutcome {
        let mut signal = lock(&self.signal);
        loop {
            if stop.is_stop_requested() {
                return WaitOutcome::Stopped;
            }
            if let Some(pts) = signal.latest_pts {
                if last_pts.map_or(true, |last| pts > last) {
                    break;
                }
            }
            if signal.ended {
                return WaitOutcome::EndOfStream;
            }
            if signal.closed {
                return WaitOutcome::Closed;
            }
            signal = self
                .changed
                .wait(signal)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        drop(signal);

        // The slot only moves forward, so whatever is there now is at least
        // as new as the timestamp that satisfied the predicate
        match self.read().as_ref() {
            Some(frame) if last_pts.map_or(true, |last| frame.pts() > last) => {
                WaitOutcome::Frame(frame.clone())
            }
            _ => WaitOutcome::EndOfStream,
        }
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("name", &self.name)
            .field("shape", &self.shape)
            .field("latest_pts", &self.latest_pts())
            .finish()
    }
}

/// Owning handle held by the stage that writes the buffer
pub struct FrameProducer {
    buffer: Arc<FrameBuffer>,
    context: ConversionContext,
}

impl FrameProducer {
    /// New buffer. With a `shape`, every update is scaled/converted into it.
    pub fn new(name: &str, shape: Option<FrameShape>) -> Self {
        Self {
            buffer: Arc::new(FrameBuffer::new(name, shape)),
            context: ConversionContext::default(),
        }
    }

    pub fn observer(&self) -> FrameObserver {
        FrameObserver {
            buffer: Arc::downgrade(&self.buffer),
        }
    }

    pub fn buffer(&self) -> &Arc<FrameBuffer> {
        &self.buffer
    }

    /// Publish `frame`, or reset the buffer to uninitialized with `None`.
    ///
    /// Conversion happens before the slot is locked; a failed conversion
    /// leaves the previous frame in place for readers.
    pub fn update(&mut self, frame: Option<Frame>) -> Result<(), RectifyError> {
        let _enter = self.buffer.span.enter();
        let start = Instant::now();

        let staged = match (frame, self.buffer.shape) {
            (None, _) => {
                debug!("Buffer reset");
                None
            }
            (Some(frame), Some(shape)) if frame.shape() != shape => {
                Some(self.context.convert(&frame, shape)?)
            }
            (Some(frame), _) => Some(frame),
        };

        if let Some(frame) = &staged {
            trace!(pts = frame.pts(), "Publishing frame");
        }
        self.buffer.publish(staged);

        metrics::histogram!("buffer_update_time_us", "buffer" => self.buffer.name.clone())
            .record(start.elapsed().as_micros() as f64);
        Ok(())
    }
}

impl Drop for FrameProducer {
    fn drop(&mut self) {
        self.buffer.close();
    }
}

/// Non-owning handle held by consumers
#[derive(Clone, Debug)]
pub struct FrameObserver {
    buffer: Weak<FrameBuffer>,
}

impl FrameObserver {
    /// Block until the buffer holds a frame newer than `last_pts`, the stop
    /// flag is raised, or the producer ends or disappears.
    pub fn wait_newer(&self, last_pts: Option<i64>, stop: &StopToken) -> WaitOutcome {
        match self.buffer.upgrade() {
            Some(buffer) => buffer.wait_newer(last_pts, stop),
            None => WaitOutcome::Closed,
        }
    }

    /// Current frame without waiting
    pub fn latest(&self) -> Result<Option<Frame>, RectifyError> {
        let buffer = self.buffer.upgrade().ok_or(RectifyError::UpstreamClosed)?;
        let frame = buffer.read().clone();
        Ok(frame)
    }

    pub fn is_closed(&self) -> bool {
        self.buffer.strong_count() == 0
    }
}
