//! Meshing settings and collaborator hooks
use crate::{
    error::Error, octree::node::CellClass, progress::ProgressSink,
    region::Region, types::Corner,
};
use std::sync::atomic::{AtomicBool, Ordering};

/// Which meshing algorithm to run
///
/// The public entry point dispatches on this; only
/// [`DualContouring`](Algorithm::DualContouring) is currently implemented.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Algorithm {
    DualContouring,
    Simplex,
    Hybrid,
}

/// Hook invoked when a worker has no task and the phase isn't done yet
///
/// This is the only cooperative yield point in either phase; an embedding
/// scheduler may park the thread briefly.  Implementations must return.
pub trait FreeThreadHandler: Sync {
    fn offer_wait(&self);
}

/// An auxiliary coarse classification of the field, used to short-circuit
/// interval evaluation in regions it already knows to be uniform
pub trait VolumePrefilter: Sync {
    /// Classifies a region; `Ambiguous` (or `Unknown`) means "can't say",
    /// and the builder falls back to interval evaluation
    fn check(&self, region: &Region) -> CellClass;

    /// Returns the pre-classifier restricted to the given child octant,
    /// or `None` if no finer data is available
    fn push(&self, child: Corner) -> Option<&dyn VolumePrefilter>;
}

/// Settings when building an octree and mesh
#[derive(Copy, Clone)]
pub struct Settings<'a> {
    /// Number of worker threads to spawn in each phase
    pub workers: u32,

    /// Target minimum feature size; drives the octree depth via
    /// [`Region::with_resolution`]
    pub min_feature: f32,

    /// Maximum combined error function residual allowed when collapsing
    /// eight leaves into one
    pub max_err: f32,

    /// Which meshing algorithm to run
    pub alg: Algorithm,

    /// Cooperative cancellation flag, polled by workers between tasks
    pub cancel: Option<&'a AtomicBool>,

    /// Invoked by idle workers; see [`FreeThreadHandler`]
    pub free_thread: Option<&'a dyn FreeThreadHandler>,

    /// Optional coarse pre-classifier; see [`VolumePrefilter`]
    pub vol: Option<&'a dyn VolumePrefilter>,

    /// Optional progress receiver; see [`ProgressSink`]
    pub progress: Option<&'a dyn ProgressSink>,
}

impl Default for Settings<'_> {
    fn default() -> Self {
        Settings {
            workers: 8,
            min_feature: 0.1,
            max_err: 1e-8,
            alg: Algorithm::DualContouring,
            cancel: None,
            free_thread: None,
            vol: None,
            progress: None,
        }
    }
}

impl Settings<'_> {
    /// Checks whether the caller has requested cancellation
    pub fn cancelled(&self) -> bool {
        self.cancel
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// Rejects parameter combinations that can't be meshed
    pub(crate) fn validate(&self, region: &Region) -> Result<(), Error> {
        if self.workers == 0 {
            return Err(Error::NoWorkers);
        }
        if !(self.min_feature > 0.0 && self.min_feature.is_finite()) {
            return Err(Error::BadMinFeature(self.min_feature));
        }
        if !region.is_valid() {
            return Err(Error::EmptyRegion);
        }
        Ok(())
    }
}
