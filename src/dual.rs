//! Dual walk: triangle emission along the octree's dual grid
//!
//! The dual grid of an octree connects cell centers across shared faces,
//! edges and corners; triangles arise only at dual *edges*, where the four
//! surrounding leaf cells straddle the surface.
//!
//! This is a second parallel phase over the completed octree.  Cell tasks
//! travel through the same bounded lock-free stack as during construction,
//! but now carry bare node pointers: a branch fans out into its 8
//! children, and when the last child of a branch has been processed, the
//! finishing worker runs the face and edge procedures for that branch
//! synchronously, walking further up while it keeps completing parents.
use crate::{
    error::Error,
    frame::{Frame, XYZ, YZX, ZXY},
    gen::CELL_TO_EDGE_TO_VERT,
    mesh::{Mesh, MeshFragment},
    octree::{
        node::{Cell, CellClass, Leaf, Node},
        Octree,
    },
    settings::Settings,
    stack::TaskStack,
    types::{Corner, Edge},
};
use nalgebra::Vector3;
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc,
};

/// Capability implemented by each meshing algorithm
///
/// The recursive cell/face/edge walk is shared; algorithms differ in what
/// they emit for a dual edge (and in whether the virtual cells around the
/// root need to be visited).
pub(crate) trait Mesher {
    /// Emits geometry for four leaf cells sharing an edge
    ///
    /// The edge runs along the first axis of `F`; the cells are in the
    /// order `[0, U, U|V, V]`, a right-handed winding about `+T`.
    fn load<F: Frame>(&mut self, ts: [&Arc<Node>; 4]);

    /// Whether surfaces exiting the region should be closed by walking
    /// the root against virtual empty neighbors
    fn needs_top_edges() -> bool {
        false
    }
}

/// Looks up the given child of a node, or the node itself if it's a leaf
fn child<'a>(t: &'a Arc<Node>, c: Corner) -> &'a Arc<Node> {
    match t.children() {
        Some(children) => &children[c.index()],
        None => t,
    }
}

/// Runs the face and edge procedures for one branch node
///
/// The cell recursion itself is not done here; children were already
/// scheduled through the task stack.
pub(crate) fn work<M: Mesher>(t: &Arc<Node>, m: &mut M) {
    debug_assert!(t.is_branch());
    // Call the face procedure on every pair of touching children
    // (4 pairs per axis)
    fn faces<F: Frame, M: Mesher>(t: &Arc<Node>, m: &mut M) {
        let (a, u, v) = F::frame();
        for c in [Corner::new(0), u.into(), v.into(), u | v] {
            face::<F, M>(child(t, c), child(t, c | a), m);
        }
    }
    faces::<XYZ, M>(t, m);
    faces::<YZX, M>(t, m);
    faces::<ZXY, M>(t, m);

    // Call the edge procedure on the 6 internal edges (2 per axis)
    fn edges<F: Frame, M: Mesher>(t: &Arc<Node>, m: &mut M) {
        let (a, u, v) = F::frame();
        for i in [false, true] {
            edge::<F, M>(
                [
                    child(t, a * i),
                    child(t, (a * i) | u),
                    child(t, (a * i) | u | v),
                    child(t, (a * i) | v),
                ],
                m,
            );
        }
    }
    edges::<XYZ, M>(t, m);
    edges::<YZX, M>(t, m);
    edges::<ZXY, M>(t, m);
}

/// Handles two cells sharing a face perpendicular to `F`'s first axis
///
/// `lo` is below `hi`.  A face alone emits no triangles, so this only
/// recurses: into 4 sub-face pairs and 4 cross-edge tuples.
pub(crate) fn face<F: Frame, M: Mesher>(
    lo: &Arc<Node>,
    hi: &Arc<Node>,
    m: &mut M,
) {
    if !lo.is_branch() && !hi.is_branch() {
        return;
    }
    let (a, u, v) = F::frame();
    face::<F, M>(child(lo, a.into()), child(hi, Corner::new(0)), m);
    face::<F, M>(child(lo, a | u), child(hi, u.into()), m);
    face::<F, M>(child(lo, a | v), child(hi, v.into()), m);
    face::<F, M>(child(lo, (a | u) | v), child(hi, u | v), m);
    for i in [false, true] {
        edge::<F::Next, M>(
            [
                child(lo, (u * i) | a),
                child(lo, (u * i) | v | a),
                child(hi, (u * i) | v),
                child(hi, u * i),
            ],
            m,
        );
        edge::<<F::Next as Frame>::Next, M>(
            [
                child(lo, (v * i) | a),
                child(hi, v * i),
                child(hi, (v * i) | u),
                child(lo, (v * i) | u | a),
            ],
            m,
        );
    }
}

/// Handles four cells sharing an edge along `F`'s first axis
///
/// Cell positions are in the order `[0, U, U|V, V]`.  If any cell is a
/// branch, recurses into the two sub-edge tuples; otherwise the mesher
/// decides whether the edge crosses the surface.
pub(crate) fn edge<F: Frame, M: Mesher>(ts: [&Arc<Node>; 4], m: &mut M) {
    if ts.iter().any(|t| t.is_branch()) {
        let (a, u, v) = F::frame();
        for i in [false, true] {
            edge::<F, M>(
                [
                    child(ts[0], (a * i) | u | v),
                    child(ts[1], (a * i) | v),
                    child(ts[2], a * i),
                    child(ts[3], (a * i) | u),
                ],
                m,
            );
        }
    } else {
        m.load::<F>(ts);
    }
}

/// Walks the root against eight virtual empty cells
///
/// Only used by meshers that report [`Mesher::needs_top_edges`]; dual
/// contouring keeps surfaces open at the region boundary instead.
pub(crate) fn handle_top_edges<M: Mesher>(root: &Arc<Node>, m: &mut M) {
    let empty = Node::empty(root.region);
    for i in 0..4 {
        let mut ts = [&empty, &empty, &empty, &empty];
        ts[i] = root;
        edge::<XYZ, M>(ts, m);
        edge::<YZX, M>(ts, m);
        edge::<ZXY, M>(ts, m);
    }
    for i in 0..2 {
        let mut ts = [&empty, &empty];
        ts[i] = root;
        face::<XYZ, M>(ts[0], ts[1], m);
        face::<YZX, M>(ts[0], ts[1], m);
        face::<ZXY, M>(ts[0], ts[1], m);
    }
}

////////////////////////////////////////////////////////////////////////////////

/// The dual contouring mesher: one quad (two triangles) per sign-changing
/// dual edge
struct DcMesher<'a> {
    out: MeshFragment<'a>,
}

impl Mesher for DcMesher<'_> {
    fn load<F: Frame>(&mut self, ts: [&Arc<Node>; 4]) {
        // An empty or filled neighbor means there's no sign change here
        if ts.iter().any(|t| t.class() != CellClass::Ambiguous) {
            return;
        }
        let leafs = ts.map(|t| t.leaf().expect("ambiguous leaf without data"));

        let (axis, _u, _v) = F::frame();

        // Reorder the cyclic tuple (0, U, U|V, V) into row-major quad
        // order, which is what the winding and diagonal logic below uses:
        //     2---------3
        //     |         |
        //     |         |
        //     0---------1
        const RM: [usize; 4] = [0, 1, 3, 2];
        let leafs: [&Leaf; 4] = RM.map(|i| leafs[i]);

        // Each cell touches the shared edge through one of its own edges
        let edges = [
            Edge::new((axis.index() * 4 + 3) as u8),
            Edge::new((axis.index() * 4 + 2) as u8),
            Edge::new((axis.index() * 4 + 1) as u8),
            Edge::new((axis.index() * 4) as u8),
        ];

        // The edge may span multiple collapse levels; the least-collapsed
        // cell sees the true (finest) edge, so it's authoritative for the
        // sign change
        let deepest = (0..4).min_by_key(|&i| leafs[i].level).unwrap();
        let (start, end) = edges[deepest].corners();
        let s = leafs[deepest].mask & start.bit() != 0;
        let e = leafs[deepest].mask & end.bit() != 0;
        if s == e {
            return;
        }

        // Select each cell's vertex patch for this edge.  Collapsed cells
        // are manifold by construction and carry a single patch.
        let mut vs = [0u32; 4];
        let mut pos = [Vector3::zeros(); 4];
        for i in 0..4 {
            let patch = if leafs[i].level > 0 {
                0
            } else {
                CELL_TO_EDGE_TO_VERT[leafs[i].mask as usize]
                    [edges[i].index()]
                    .expect("leaf has no vertex for a sign-changing edge")
                    as usize
            };
            let vert = &leafs[i].verts[patch];
            vs[i] = vert.claim(&mut self.out);
            pos[i] = vert.pos;
        }

        // Flip the winding according to the polarity of the sign change,
        // keeping outward normals consistent
        if !s {
            vs.swap(1, 2);
            pos.swap(1, 2);
        }

        // Corner normals of the quad; a-b-c are right-handed within the
        // quad winding
        let norm = |a: usize, b: usize, c: usize| {
            (pos[b] - pos[a]).cross(&(pos[c] - pos[a])).normalize()
        };
        let norms =
            [norm(0, 1, 2), norm(1, 3, 0), norm(2, 0, 3), norm(3, 2, 1)];

        let mut tri = |a: usize, b: usize, c: usize| {
            // Drop degenerate triangles (a coarse cell can appear twice
            // around the same edge)
            if vs[a] != vs[b] && vs[b] != vs[c] && vs[a] != vs[c] {
                self.out.triangle(vs[a], vs[b], vs[c]);
            }
        };

        // Pick the diagonal that maximizes agreement between opposite
        // corners, which prevents folded bowtie quads
        if norms[0].dot(&norms[3]) > norms[1].dot(&norms[2]) {
            tri(0, 1, 2);
            tri(2, 1, 3);
        } else {
            tri(0, 1, 3);
            tri(0, 3, 2);
        }
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Walks the dual grid of a completed octree, producing a mesh
pub(crate) fn walk(octree: &Octree, settings: &Settings) -> Result<Mesh, Error> {
    if settings.cancelled() {
        return Err(Error::Cancelled);
    }
    if let Some(p) = settings.progress {
        p.next_phase(octree.size() + 1);
    }

    // The hand-off counters were consumed by the build (or by a previous
    // walk, which also left vertex indices claimed)
    reset(octree.root());

    let tasks = TaskStack::new(settings.workers as usize);
    let pushed = tasks.push(octree.root().clone());
    assert!(pushed.is_ok());

    let done = AtomicBool::new(false);
    let finished = AtomicBool::new(false);
    let counter = AtomicU32::new(1);

    let mut fragments = std::thread::scope(|s| {
        let handles: Vec<_> = (0..settings.workers)
            .map(|_| {
                let tasks = &tasks;
                let done = &done;
                let finished = &finished;
                let counter = &counter;
                s.spawn(move || {
                    let mut m = DcMesher {
                        out: MeshFragment::new(counter),
                    };
                    run(&mut m, tasks, done, finished, settings);
                    m.out
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Vec<_>>()
    });

    if !finished.load(Ordering::Acquire) {
        log::debug!("dual walk cancelled");
        return Err(Error::Cancelled);
    }

    if <DcMesher as Mesher>::needs_top_edges() {
        let mut m = DcMesher {
            out: MeshFragment::new(&counter),
        };
        handle_top_edges(octree.root(), &mut m);
        fragments.push(m.out);
    }

    let mesh = Mesh::collect(fragments);
    log::debug!(
        "dual walk produced {} vertices and {} triangles",
        mesh.vertices.len() - 1,
        mesh.triangles.len()
    );
    Ok(mesh)
}

/// Re-arms every branch node's hand-off counter and clears any claimed
/// vertex indices
fn reset(t: &Arc<Node>) {
    match t.cell() {
        Cell::Branch(children) => {
            t.arm_pending();
            for c in children {
                reset(c);
            }
        }
        Cell::Leaf(leaf) => {
            for v in &leaf.verts {
                v.reset();
            }
        }
        _ => (),
    }
}

/// One worker of the dual walk
fn run<M: Mesher>(
    m: &mut M,
    tasks: &TaskStack<Arc<Node>>,
    done: &AtomicBool,
    finished: &AtomicBool,
    settings: &Settings,
) {
    let mut local: Vec<Arc<Node>> = vec![];
    // Exiting for any reason must release the other workers
    let _done = crate::stack::DoneGuard(done);
    while !done.load(Ordering::Acquire) && !settings.cancelled() {
        let Some(t) = local.pop().or_else(|| tasks.pop()) else {
            if let Some(h) = settings.free_thread {
                h.offer_wait();
            }
            continue;
        };

        if let Some(children) = t.children() {
            // Recurse, pushing the cell procedure for every child
            for c in children {
                if let Err(c) = tasks.push(c.clone()) {
                    local.push(c);
                }
            }
            continue;
        }

        if let Some(p) = settings.progress {
            p.tick(1);
        }

        // Walk up; whoever finishes the last of 8 siblings runs the face
        // and edge procedures for the parent
        let mut cur = t;
        let hit_root = loop {
            let Some(parent) = cur.parent.upgrade() else {
                break true;
            };
            if parent.dec_pending() != 0 {
                break false;
            }
            work(&parent, m);
            if let Some(p) = settings.progress {
                p.tick(1);
            }
            cur = parent;
        };
        if hit_root {
            finished.store(true, Ordering::Release);
            break;
        }
    }
}

////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod test {
    use super::*;
    use crate::region::Region;

    /// Mesher that just counts the edge tuples it was offered
    struct CountingMesher {
        loads: usize,
    }
    impl Mesher for CountingMesher {
        fn load<F: Frame>(&mut self, _ts: [&Arc<Node>; 4]) {
            self.loads += 1;
        }
        fn needs_top_edges() -> bool {
            true
        }
    }

    #[test]
    fn test_top_edges_of_leaf() {
        // A single empty cell wrapped in virtual empty neighbors produces
        // 12 edge tuples (4 positions x 3 axes) and no faces
        let root = Node::empty(Region::symmetric(1.0));
        let mut m = CountingMesher { loads: 0 };
        handle_top_edges(&root, &mut m);
        assert_eq!(m.loads, 12);
    }
}
