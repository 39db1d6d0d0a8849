//! The field evaluator interface
//!
//! The mesher is generic over anything implementing [`Evaluator`]; it never
//! constructs fields itself.  A reference implementation backed by a small
//! expression tree lives in [`crate::field`], and production callers are
//! expected to bring their own (a bytecode VM, a JIT, ...).
//!
//! Evaluator instances are strictly thread-local: the mesher calls
//! [`Evaluator::fork`] once per worker and never shares an instance across
//! threads.
use crate::{interval::Interval, region::Region};
use nalgebra::Vector3;
use std::sync::Arc;

/// Maximum number of points passed to a single batch evaluation
///
/// The mesher never exceeds this; evaluators may size scratch buffers
/// accordingly.
pub const MAX_BATCH: usize = 256;

/// A field value with its partial derivatives
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Grad {
    /// Value of the field at this point
    pub v: f32,
    /// Partial derivative with respect to `x`
    pub dx: f32,
    /// Partial derivative with respect to `y`
    pub dy: f32,
    /// Partial derivative with respect to `z`
    pub dz: f32,
}

impl Grad {
    /// Constructs a new gradient
    #[inline]
    pub fn new(v: f32, dx: f32, dy: f32, dz: f32) -> Self {
        Self { v, dx, dy, dz }
    }

    /// Returns the partial derivatives as a vector
    #[inline]
    pub fn deriv(&self) -> Vector3<f32> {
        Vector3::new(self.dx, self.dy, self.dz)
    }
}

/// A thread-local batch evaluator for one implicit field
///
/// `Tape` is the evaluator's (possibly region-reduced) program; it is
/// immutable and shared by reference, so refined tapes discovered at an
/// octree node flow down to that node's descendants for free.
pub trait Evaluator: Send {
    /// Evaluation program, possibly specialized to a sub-region
    type Tape: Send + Sync;

    /// Returns the tape for the full field
    fn tape(&self) -> Arc<Self::Tape>;

    /// Bounds the field over a region
    ///
    /// Returns an interval containing every value of the field inside the
    /// region, along with a reduced tape valid inside that region (or
    /// `None` if no reduction was possible).
    fn interval(
        &mut self,
        region: &Region,
        tape: &Arc<Self::Tape>,
    ) -> (Interval, Option<Arc<Self::Tape>>);

    /// Evaluates the field at up to [`MAX_BATCH`] points
    ///
    /// The returned slice is valid until the next call on this evaluator
    /// and has the same length as `points`.
    fn values(
        &mut self,
        points: &[Vector3<f32>],
        tape: &Self::Tape,
    ) -> &[f32];

    /// Evaluates the field and its gradient at up to [`MAX_BATCH`] points
    fn grads(&mut self, points: &[Vector3<f32>], tape: &Self::Tape)
        -> &[Grad];

    /// Builds an independent evaluator for use on another thread
    fn fork(&self) -> Self;
}
