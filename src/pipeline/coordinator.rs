//! Worker ownership, cooperative stop and error collection

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};

use color_eyre::{eyre::eyre, Report, Result};
use tracing::{debug, error, info, warn, Span};

use super::buffer::FrameBuffer;

/// Process-wide stop request shared by every worker.
///
/// Setting it wakes every watched buffer so that blocked consumers re-check
/// their wait predicate instead of sleeping until the next frame.
#[derive(Clone, Default)]
pub struct StopToken {
    inner: Arc<StopInner>,
}

#[derive(Default)]
struct StopInner {
    requested: AtomicBool,
    watched: Mutex<Vec<Weak<FrameBuffer>>>,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_stop_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Idempotent. Returns `true` for the call that actually flipped the flag.
    pub fn request_stop(&self) -> bool {
        let first = !self.inner.requested.swap(true, Ordering::SeqCst);
        for buffer in lock(&self.inner.watched).iter().filter_map(Weak::upgrade) {
            buffer.wake_all();
        }
        first
    }

    /// Wake `buffer`'s waiters when stop is requested
    pub fn watch(&self, buffer: &Arc<FrameBuffer>) {
        let mut watched = lock(&self.inner.watched);
        watched.retain(|w| w.strong_count() > 0);
        watched.push(Arc::downgrade(buffer));
    }
}

impl std::fmt::Debug for StopToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopToken")
            .field("requested", &self.is_stop_requested())
            .finish()
    }
}

/// Owns the stage threads and the log of errors they reported.
/// Clones share the same state and are handed to the workers.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    stop: StopToken,
    threads: Mutex<Vec<(String, JoinHandle<()>)>>,
    errors: Mutex<Vec<Report>>,
    span: Span,
}

impl Coordinator {
    pub fn new(span: Span) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                stop: StopToken::new(),
                threads: Mutex::new(Vec::new()),
                errors: Mutex::new(Vec::new()),
                span,
            }),
        }
    }

    pub fn stop_token(&self) -> StopToken {
        self.inner.stop.clone()
    }

    pub fn request_stop(&self) {
        if self.inner.stop.request_stop() {
            let _enter = self.inner.span.enter();
            info!("Stop requested");
        }
    }

    pub fn is_stop_requested(&self) -> bool {
        self.inner.stop.is_stop_requested()
    }

    /// Append to the error log. Does not request a stop by itself.
    pub fn report_exception(&self, err: Report) {
        let _enter = self.inner.span.enter();
        warn!("Worker reported: {err}");
        metrics::counter!("pipeline_errors_total").increment(1);
        lock(&self.inner.errors).push(err);
    }

    /// Report an unrecoverable error and stop the pipeline
    pub fn fail(&self, err: Report) {
        self.report_exception(err);
        self.request_stop();
    }

    pub fn exception_count(&self) -> usize {
        lock(&self.inner.errors).len()
    }

    pub fn add_thread(&self, name: impl Into<String>, handle: JoinHandle<()>) {
        lock(&self.inner.threads).push((name.into(), handle));
    }

    /// Spawn a named worker and register it for joining
    pub fn spawn<F>(&self, name: &str, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(f)
            .map_err(|e| eyre!("Failed to spawn {name} thread: {e}"))?;
        self.add_thread(name, handle);
        Ok(())
    }

    /// Block until every registered thread has finished.
    /// A thread that panicked is recorded in the error log.
    pub fn join_all(&self) {
        loop {
            // Take the handles out so workers are never joined under the lock
            let threads = std::mem::take(&mut *lock(&self.inner.threads));
            if threads.is_empty() {
                break;
            }
            for (name, handle) in threads {
                if handle.join().is_err() {
                    self.report_exception(eyre!("{name} thread panicked"));
                    self.request_stop();
                } else {
                    let _enter = self.inner.span.enter();
                    debug!("{name} thread joined");
                }
            }
        }
    }

    /// Join every thread, then drain the error log, writing each chain out
    /// outermost context first and root cause last.
    pub fn teardown(&self) -> Vec<Report> {
        self.join_all();

        let errors = std::mem::take(&mut *lock(&self.inner.errors));
        let _enter = self.inner.span.enter();
        for (index, report) in errors.iter().enumerate() {
            error!("Pipeline error #{}: {}", index + 1, report);
            for (depth, cause) in report.chain().enumerate().skip(1) {
                error!("  {depth}: caused by: {cause}");
            }
        }
        if errors.is_empty() {
            info!("All stages finished cleanly");
        }
        errors
    }
}

/// Lock a mutex whose data stays valid even if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
