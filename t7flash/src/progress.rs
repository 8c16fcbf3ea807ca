//! Progress reporting for long-running upgrade steps.
//!
//! The pipeline reports through an explicit [`ProgressSink`] instead of
//! process-wide offset/scale state. Each long step gets a [`ScaledSink`]
//! view over a sub-range of the global 0–100 scale, and [`MonotonicSink`]
//! guarantees callers never observe the percentage move backwards.

/// Receiver for upgrade progress.
///
/// Implementations must be fast; the pipeline invokes these synchronously
/// between transport transactions.
pub trait ProgressSink {
    /// Report overall progress. `percent` is within `[0, 100]`.
    fn update(&mut self, percent: f64, done: bool);

    /// Report a human-readable stage label ("Erasing image…", ...).
    fn status(&mut self, text: &str, done: bool);
}

/// Sink that discards all reports.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn update(&mut self, _percent: f64, _done: bool) {}
    fn status(&mut self, _text: &str, _done: bool) {}
}

/// Wrapper enforcing a monotonically non-decreasing percentage.
pub struct MonotonicSink<'a> {
    inner: &'a mut dyn ProgressSink,
    last: f64,
}

impl<'a> MonotonicSink<'a> {
    /// Wrap a sink, starting from zero.
    pub fn new(inner: &'a mut dyn ProgressSink) -> Self {
        Self { inner, last: 0.0 }
    }

    /// Highest percentage reported so far.
    pub fn last(&self) -> f64 {
        self.last
    }
}

impl ProgressSink for MonotonicSink<'_> {
    fn update(&mut self, percent: f64, done: bool) {
        let clamped = percent.clamp(self.last, 100.0);
        self.last = clamped;
        self.inner.update(clamped, done);
    }

    fn status(&mut self, text: &str, done: bool) {
        self.inner.status(text, done);
    }
}

/// View of a sink scaled onto a `[lo, hi]` sub-range.
///
/// Long steps hand their internal `(done, total)` counters to
/// [`fraction`](ScaledSink::fraction) and the result is interpolated
/// linearly into the sub-range.
pub struct ScaledSink<'a, 'b> {
    inner: &'a mut MonotonicSink<'b>,
    lo: f64,
    hi: f64,
}

impl<'a, 'b> ScaledSink<'a, 'b> {
    /// Create a view over `[lo, hi]` of the global scale.
    pub fn new(inner: &'a mut MonotonicSink<'b>, lo: f64, hi: f64) -> Self {
        debug_assert!(lo <= hi);
        Self { inner, lo, hi }
    }

    /// Report `done` out of `total` units of this step's work.
    pub fn fraction(&mut self, done: usize, total: usize) {
        if total == 0 {
            return;
        }
        #[allow(clippy::cast_precision_loss)]
        let ratio = (done.min(total) as f64) / (total as f64);
        let percent = self.lo + (self.hi - self.lo) * ratio;
        self.inner.update(percent, false);
    }
}
