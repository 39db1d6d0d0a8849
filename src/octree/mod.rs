//! Adaptive octree construction and storage
//!
//! [`Octree::build`] runs the parallel builder; the result owns every node
//! (and every worker's allocation pool) and can then be walked with
//! [`Octree::walk_dual`] to produce a [`Mesh`].
mod builder;
pub(crate) mod node;

use crate::{
    error::Error, eval::Evaluator, mesh::Mesh, region::Region,
    settings::Settings,
};
use node::{Node, NodePool};
use std::sync::Arc;

/// A completed adaptive octree over an implicit field
///
/// Interval-uniform regions are stored as single empty/filled cells;
/// surface-straddling cells of minimum feature size carry per-patch
/// vertices, and manifold subtrees below the error bound have been
/// collapsed into coarser leaves.
pub struct Octree {
    pub(crate) root: Arc<Node>,
    /// Per-worker pools, claimed after the build; these keep retired
    /// child arrays alive for as long as the octree exists
    #[allow(dead_code)]
    pub(crate) pools: Vec<NodePool>,
    pub(crate) size: u64,
}

impl Octree {
    /// Builds an octree over `region`, subdivided down to
    /// [`Settings::min_feature`]
    pub fn build<E: Evaluator>(
        eval: &E,
        region: Region,
        settings: &Settings,
    ) -> Result<Octree, Error> {
        builder::build(eval, region, settings)
    }

    /// Recursively walks the dual of the octree, building a mesh
    pub fn walk_dual(&self, settings: &Settings) -> Result<Mesh, Error> {
        crate::dual::walk(self, settings)
    }

    /// Number of cells in the octree
    pub fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn root(&self) -> &Arc<Node> {
        &self.root
    }
}

////////////////////////////////////////////////////////////////////////////////
