//! Triangle meshes and their per-thread accumulation
//!
//! During the dual walk every worker owns a [`MeshFragment`]; global vertex
//! indices come from one shared atomic counter, so fragments can be merged
//! by scattering each worker's vertices into a dense array without any
//! remapping of triangle indices.
use crate::{error::Error, eval::Evaluator, region::Region, settings::{Algorithm, Settings}};
use nalgebra::Vector3;
use std::sync::atomic::{AtomicU32, Ordering};

/// An indexed triangle mesh
///
/// `vertices[0]` is a reserved zero sentinel; triangle indices are
/// always `>= 1`.
#[derive(Default, Debug)]
pub struct Mesh {
    /// Vertex positions
    pub vertices: Vec<Vector3<f32>>,
    /// Triangles, as indices into [`vertices`](Self::vertices)
    pub triangles: Vec<Vector3<u32>>,
}

impl Mesh {
    /// Builds a new (empty) mesh
    pub fn new() -> Self {
        Self::default()
    }

    /// Meshes an implicit field over a region
    ///
    /// This is the top-level entry point: it validates the settings,
    /// builds the octree, then walks its dual grid, reporting progress to
    /// the configured sink along the way.
    pub fn render<E: Evaluator>(
        eval: &E,
        region: Region,
        settings: &Settings,
    ) -> Result<Mesh, Error> {
        match settings.alg {
            Algorithm::DualContouring => (),
            other => return Err(Error::UnsupportedAlgorithm(other)),
        }
        if let Some(p) = settings.progress {
            // One phase for the octree build, one for the dual walk
            p.start(&[1, 1]);
        }
        let out = crate::octree::Octree::build(eval, region, settings)
            .and_then(|octree| octree.walk_dual(settings));
        if let Some(p) = settings.progress {
            p.finish();
        }
        out
    }

    /// Merges per-thread fragments into a single mesh
    ///
    /// Vertex indices were allocated from one shared counter, so the dense
    /// vertex array is exactly `1 + Σ |fragment vertices|` long (slot 0 is
    /// the sentinel) and every fragment writes disjoint slots; triangles
    /// are concatenated with precomputed offsets.  Copies run in parallel,
    /// one thread per fragment.
    pub(crate) fn collect(fragments: Vec<MeshFragment>) -> Mesh {
        let vert_count =
            1 + fragments.iter().map(|f| f.verts.len()).sum::<usize>();
        let tri_count =
            fragments.iter().map(|f| f.triangles.len()).sum::<usize>();

        let mut vertices = vec![Vector3::zeros(); vert_count];
        let mut triangles = vec![Vector3::zeros(); tri_count];

        // Hand each fragment its triangle range up front
        let mut tri_slices = vec![];
        let mut rest = triangles.as_mut_slice();
        for f in &fragments {
            let (head, tail) =
                std::mem::take(&mut rest).split_at_mut(f.triangles.len());
            tri_slices.push(head);
            rest = tail;
        }

        struct VertTable(*mut Vector3<f32>, usize);
        // SAFETY: every vertex index was handed out exactly once by the
        // shared atomic counter, so writes through the table are disjoint
        unsafe impl Sync for VertTable {}
        let table = VertTable(vertices.as_mut_ptr(), vert_count);

        std::thread::scope(|s| {
            for (f, tris) in fragments.iter().zip(tri_slices) {
                let table = &table;
                s.spawn(move || {
                    tris.copy_from_slice(&f.triangles);
                    for (v, &i) in f.verts.iter().zip(&f.indices) {
                        let i = i as usize;
                        debug_assert!(i > 0 && i < table.1);
                        // SAFETY: in-bounds (asserted above) and disjoint
                        // across threads (indices are globally unique)
                        unsafe { *table.0.add(i) = *v };
                    }
                });
            }
        });

        Mesh {
            vertices,
            triangles,
        }
    }
}

/// Per-worker mesh buffers
///
/// Vertices pushed here receive globally-unique indices from the shared
/// counter (starting at 1; 0 is the sentinel slot).
pub(crate) struct MeshFragment<'a> {
    counter: &'a AtomicU32,
    pub verts: Vec<Vector3<f32>>,
    pub indices: Vec<u32>,
    pub triangles: Vec<Vector3<u32>>,
}

impl<'a> MeshFragment<'a> {
    pub fn new(counter: &'a AtomicU32) -> Self {
        MeshFragment {
            counter,
            verts: vec![],
            indices: vec![],
            triangles: vec![],
        }
    }

    /// Appends a vertex, returning its global index
    pub fn push_vertex(&mut self, v: Vector3<f32>) -> u32 {
        let i = self.counter.fetch_add(1, Ordering::Relaxed);
        self.verts.push(v);
        self.indices.push(i);
        i
    }

    /// Records a triangle by global vertex indices
    pub fn triangle(&mut self, a: u32, b: u32, c: u32) {
        self.triangles.push(Vector3::new(a, b, c));
    }
}

////////////////////////////////////////////////////////////////////////////////
