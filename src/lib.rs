//! Parallel isosurface meshing for implicit fields
//!
//! Given a scalar field `f: ℝ³ → ℝ` (with the shape's interior at
//! `f < 0`) and an axis-aligned region of interest, this crate produces a
//! triangle [`Mesh`] approximating the zero level set, using
//! [Manifold Dual Contouring](https://people.engr.tamu.edu/schaefer/research/dualsimp_tvcg.pdf):
//!
//! 1. A parallel, work-stealing builder constructs an adaptive
//!    [`Octree`], proving uniform regions empty or filled by interval
//!    arithmetic, sampling the surface in batches at ambiguous cells of
//!    minimum feature size, and collapsing manifold subtrees whose
//!    combined error function stays below a bound.
//! 2. A second parallel phase walks the octree's dual grid, emitting a
//!    quad (two triangles) wherever a dual edge crosses the surface.
//!
//! The resulting meshes preserve sharp features (corners and edges) and
//! are watertight for surfaces closed inside the region; they may contain
//! self-intersections, and features below the sampling resolution can be
//! missed.
//!
//! The field itself is abstract: anything implementing
//! [`Evaluator`](eval::Evaluator) can be meshed.  A small expression-tree
//! evaluator ships in [`field`] for tests and examples:
//!
//! ```
//! use isomesh::{field, Mesh, Region, Settings};
//!
//! let shape = field::sphere([0.0; 3], 0.5);
//! let settings = Settings {
//!     workers: 4,
//!     min_feature: 0.1,
//!     ..Settings::default()
//! };
//! let mesh = Mesh::render(
//!     &shape.evaluator(),
//!     Region::symmetric(1.0),
//!     &settings,
//! )?;
//! assert!(!mesh.triangles.is_empty());
//!
//! // Write it out as a binary STL, e.g. to a file:
//! // let mut f = std::fs::File::create("sphere.stl")?;
//! # let mut f = vec![];
//! mesh.write_stl(&mut f)?;
//! # Ok::<(), isomesh::Error>(())
//! ```

mod dual;
mod error;
mod gen;
mod mesh;
mod octree;
mod output;
mod progress;
mod qef;
mod region;
mod settings;
mod stack;

pub mod eval;
pub mod field;
pub mod frame;
pub mod interval;
pub mod types;

pub use error::Error;
pub use eval::{Evaluator, Grad};
pub use interval::Interval;
pub use mesh::Mesh;
pub use octree::{node::CellClass, Octree};
pub use progress::ProgressSink;
pub use qef::Qef;
pub use region::Region;
pub use settings::{
    Algorithm, FreeThreadHandler, Settings, VolumePrefilter,
};
