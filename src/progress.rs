//! Progress reporting
//!
//! Meshing can take a while; callers that want a progress bar implement
//! [`ProgressSink`] and attach it through
//! [`Settings::progress`](crate::Settings::progress).
//!
//! The core issues ticks at these points:
//! * octree build: one tick per leaf, one per collected branch, and the
//!   full subtree weight (`8 + 8² + … + 8^level`, plus one) when interval
//!   arithmetic prunes a region without subdividing it;
//! * dual walk: one tick per processed cell.
//!
//! Phase totals are announced up front via
//! [`next_phase`](ProgressSink::next_phase), so a sink can map ticks to a
//! fraction.

/// Receiver for progress updates
///
/// All methods default to no-ops, so a sink only implements what it needs.
/// Ticks arrive concurrently from every worker thread.
pub trait ProgressSink: Sync {
    /// Called once at the start of an operation, with relative weights
    /// for each upcoming phase
    fn start(&self, phase_weights: &[u32]) {
        let _ = phase_weights;
    }

    /// Called at the start of each phase with its total tick count
    fn next_phase(&self, total_ticks: u64) {
        let _ = total_ticks;
    }

    /// Called by workers as work completes
    fn tick(&self, n: u64) {
        let _ = n;
    }

    /// Called once at the end of the operation
    fn finish(&self) {}
}
