//! Progress reporting and cooperative cancellation for loads and saves.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

/// Caller-supplied sink polled at bounded checkpoints during a load or save.
///
/// All methods have no-op defaults so an implementor only overrides what
/// it needs. Calls happen synchronously on the loading thread.
pub trait DImgLoaderObserver: Send + Sync {
    /// Progress in `0.0..=1.0`.
    fn progress_info(&self, _progress: f32) {}

    /// Polled while loading; returning false aborts the load.
    fn continue_query(&self) -> bool {
        true
    }

    /// Divisor applied to the checkpoint interval. Larger values mean
    /// more frequent callbacks.
    fn granularity(&self) -> f32 {
        1.0
    }
}

/// Observer that never cancels and ignores progress.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl DImgLoaderObserver for NoopObserver {}

/// Observer backed by an atomic flag, cancellable from another thread.
/// Records the last reported progress.
#[derive(Debug, Default, Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    progress: Arc<Mutex<Vec<f32>>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Every progress value reported so far.
    pub fn reported(&self) -> Vec<f32> {
        self.progress.lock().clone()
    }
}

impl DImgLoaderObserver for CancellationToken {
    fn progress_info(&self, progress: f32) {
        self.progress.lock().push(progress);
    }

    fn continue_query(&self) -> bool {
        !self.is_cancelled()
    }
}

/// Number of work units between two observer checkpoints.
///
/// `total` is the full amount of work (rows, strips), `slice` the fraction
/// of the overall progress bar this phase covers. Roughly twenty
/// checkpoints per full bar, scaled by the observer's granularity.
pub fn granularity(observer: Option<&dyn DImgLoaderObserver>, total: usize, slice: f32) -> usize {
    let Some(observer) = observer else {
        return total.max(1);
    };
    let per_bar = 20.0 * slice.max(f32::EPSILON);
    let divisor = observer.granularity().max(f32::EPSILON);
    ((total as f32 / per_bar / divisor) as usize).max(1)
}

/// Poll `observer` for continuation. No observer means continue.
pub(crate) fn should_continue(observer: Option<&dyn DImgLoaderObserver>) -> bool {
    observer.is_none_or(|o| o.continue_query())
}

pub(crate) fn report(observer: Option<&dyn DImgLoaderObserver>, progress: f32) {
    if let Some(o) = observer {
        o.progress_info(progress);
    }
}
