//! Parallel octree construction
//!
//! Work items are `(node, tape, neighbor view, volume prefilter)` tuples on
//! a shared bounded [`TaskStack`]; when the shared stack is full, workers
//! keep subdivision tasks on a private stack, which preserves depth-first
//! locality.  Each task either proves its node empty/filled by interval
//! arithmetic (possibly shortening the tape for its descendants), splits it
//! into 8 children, or evaluates it as a leaf.  Finished nodes walk back up
//! through the `pending` counters; the worker that completes the last child
//! of a branch runs the collect step, merging uniform or manifold subtrees.
use crate::{
    error::Error,
    eval::Evaluator,
    gen::{CELL_TO_VERT_TO_EDGES, CORNERS_ARE_MANIFOLD},
    octree::{
        node::{Cell, CellClass, CellState, ChildArray, Leaf, LeafVert, Node, NodePool},
        Octree,
    },
    qef::Qef,
    region::Region,
    settings::{Settings, VolumePrefilter},
    stack::TaskStack,
    types::Corner,
};
use arrayvec::ArrayVec;
use nalgebra::Vector3;
use once_cell::sync::Lazy;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

/// Number of bisection steps used to locate each edge crossing
///
/// Fixed so that meshing is deterministic for a given evaluator.
const EDGE_SEARCH_DEPTH: usize = 8;

/// Progress weight of a fully-subdivided subtree at the given level
///
/// This is `8 + 8² + … + 8^level`, accumulated the same way whether the
/// subtree was actually built or pruned by interval arithmetic.
pub(crate) fn subtree_ticks(level: u8) -> u64 {
    let mut ticks = 0u64;
    for _ in 0..level {
        ticks = ticks.saturating_add(1).saturating_mul(8);
    }
    ticks
}

////////////////////////////////////////////////////////////////////////////////

/// For each (child index, corner), the siblings sharing that corner
///
/// An entry `(j, c)` means child `j`'s corner `c` is at the same position.
static SHARED_CORNERS: Lazy<[[ArrayVec<(u8, u8), 7>; 8]; 8]> =
    Lazy::new(|| {
        std::array::from_fn(|i| {
            std::array::from_fn(|c| {
                let mut out = ArrayVec::new();
                for j in 0..8usize {
                    if j == i {
                        continue;
                    }
                    // Per axis, the corner sits at i_a + c_a in {0, 1, 2}
                    // within the doubled grid; sibling j sees it at
                    // (i_a + c_a) - j_a, which must land in {0, 1}
                    let mut cj = 0u8;
                    let mut ok = true;
                    for a in 0..3 {
                        let p = ((i >> a) & 1) + ((c >> a) & 1);
                        let q = p as i32 - ((j >> a) & 1) as i32;
                        if !(0..=1).contains(&q) {
                            ok = false;
                            break;
                        }
                        cj |= (q as u8) << a;
                    }
                    if ok {
                        out.push((j as u8, cj));
                    }
                }
                out
            })
        })
    });

/// View of the siblings surrounding a task's node
///
/// Lets leaf evaluation reuse corner samples that an adjacent sibling has
/// already published, instead of re-evaluating the field there.
#[derive(Clone)]
pub(crate) struct Neighborhood {
    siblings: Option<Arc<ChildArray>>,
}

impl Neighborhood {
    /// The root has no neighbors
    pub fn root() -> Self {
        Neighborhood { siblings: None }
    }

    /// Builds the view for a child of a freshly-subdivided node
    pub fn new(children: &Arc<ChildArray>) -> Self {
        Neighborhood {
            siblings: Some(children.clone()),
        }
    }

    /// Looks up a corner sample already published by a sibling of `me`
    pub fn corner_value(&self, me: Corner, c: Corner) -> Option<f32> {
        let siblings = self.siblings.as_ref()?;
        for &(j, cj) in SHARED_CORNERS[me.index()][c.index()].iter() {
            if let Some(v) =
                siblings[j as usize].corner_value(Corner::new(cj))
            {
                return Some(v);
            }
        }
        None
    }
}

/// A chunk of work for one octree node
pub(crate) struct Task<'a, E: Evaluator> {
    pub node: Arc<Node>,
    pub tape: Arc<E::Tape>,
    pub neighbors: Neighborhood,
    pub vol: Option<&'a dyn VolumePrefilter>,
}

////////////////////////////////////////////////////////////////////////////////

/// Builds the octree for the given field
pub(crate) fn build<E: Evaluator>(
    eval: &E,
    region: Region,
    settings: &Settings,
) -> Result<Octree, Error> {
    settings.validate(&region)?;
    if settings.cancelled() {
        return Err(Error::Cancelled);
    }
    let region = region.with_resolution(settings.min_feature);
    log::debug!(
        "building octree at level {} with {} workers",
        region.level,
        settings.workers
    );
    if let Some(p) = settings.progress {
        p.next_phase(subtree_ticks(region.level) + 1);
    }

    let mut root_pool = NodePool::default();
    let root = root_pool.alloc_root(region);

    let tasks = TaskStack::new(settings.workers as usize);
    let pushed = tasks.push(Task::<E> {
        node: root.clone(),
        tape: eval.tape(),
        neighbors: Neighborhood::root(),
        vol: settings.vol,
    });
    assert!(pushed.is_ok());

    let done = AtomicBool::new(false);
    let finished = AtomicBool::new(false);
    let pools = Mutex::new(vec![root_pool]);

    std::thread::scope(|s| {
        for _ in 0..settings.workers {
            let mut w = Worker {
                eval: eval.fork(),
                pool: NodePool::default(),
                local: Vec::new(),
            };
            let tasks = &tasks;
            let done = &done;
            let finished = &finished;
            let pools = &pools;
            s.spawn(move || {
                w.run(tasks, done, finished, settings);
                // Release the pooled objects to the root
                pools.lock().unwrap().push(w.pool);
            });
        }
    });

    if !finished.load(Ordering::Acquire) {
        log::debug!("octree build cancelled");
        return Err(Error::Cancelled);
    }
    let pools = pools.into_inner().unwrap();
    // Retired subtrees stay allocated but are no longer part of the tree
    let size = pools.iter().map(NodePool::allocated).sum::<u64>()
        - 8 * pools.iter().map(NodePool::retired).sum::<u64>();
    log::debug!("built octree with {size} cells");
    Ok(Octree { root, pools, size })
}

struct Worker<'a, E: Evaluator> {
    eval: E,
    pool: NodePool,
    /// Tasks that didn't fit in the shared stack
    local: Vec<Task<'a, E>>,
}

impl<'a, E: Evaluator> Worker<'a, E> {
    fn run(
        &mut self,
        tasks: &TaskStack<Task<'a, E>>,
        done: &AtomicBool,
        finished: &AtomicBool,
        settings: &Settings,
    ) {
        // Exiting for any reason (root completed, cancellation, a panic
        // in the evaluator) must release the other workers
        let _done = crate::stack::DoneGuard(done);
        while !done.load(Ordering::Acquire) && !settings.cancelled() {
            // Prefer local tasks, to keep subtrees on this thread for as
            // long as possible
            let Some(task) = self.local.pop().or_else(|| tasks.pop()) else {
                if let Some(h) = settings.free_thread {
                    h.offer_wait();
                }
                continue;
            };
            if self.process(task, tasks, settings) {
                // We walked up past the root, so the tree is complete
                finished.store(true, Ordering::Release);
                break;
            }
        }
    }

    /// Processes one task, returning `true` if it completed the root
    fn process(
        &mut self,
        task: Task<'a, E>,
        tasks: &TaskStack<Task<'a, E>>,
        settings: &Settings,
    ) -> bool {
        let Task {
            node,
            mut tape,
            neighbors,
            vol,
        } = task;

        let can_subdivide = node.region.level > 0;
        if can_subdivide {
            // An attached volume pre-classifier may prove the region
            // uniform without an interval evaluation
            if let Some(v) = vol {
                match v.check(&node.region) {
                    CellClass::Empty => node.set_cell(CellState::Empty),
                    CellClass::Filled => node.set_cell(CellState::Filled),
                    _ => (),
                }
            }
            if matches!(node.cell(), Cell::Unknown) {
                let (bounds, refined) =
                    self.eval.interval(&node.region, &tape);
                if let Some(t) = refined {
                    tape = t;
                }
                if bounds.lower() > 0.0 {
                    node.set_cell(CellState::Empty);
                } else if bounds.upper() < 0.0 {
                    node.set_cell(CellState::Filled);
                } else {
                    self.subdivide(&node, tape, vol, tasks);
                    // All the useful work happens when the children
                    // complete and the last one collects them
                    return false;
                }
            }
        } else {
            self.eval_leaf(&node, &tape, &neighbors);
        }

        if let Some(p) = settings.progress {
            // A pruned subtree reports the cells it skipped
            p.tick(if can_subdivide {
                subtree_ticks(node.region.level) + 1
            } else {
                1
            });
        }

        // Walk up; whoever finishes the last of 8 siblings collects them
        let mut t = node;
        loop {
            let Some(parent) = t.parent.upgrade() else {
                return true;
            };
            if parent.dec_pending() != 0 {
                return false;
            }
            self.collect_children(&parent, settings);
            if let Some(p) = settings.progress {
                p.tick(1);
            }
            t = parent;
        }
    }

    /// Allocates 8 children and schedules them, spilling to the local
    /// stack when the shared one is full
    fn subdivide(
        &mut self,
        node: &Arc<Node>,
        tape: Arc<E::Tape>,
        vol: Option<&'a dyn VolumePrefilter>,
        tasks: &TaskStack<Task<'a, E>>,
    ) {
        let regions = node.region.subdivide();
        node.arm_pending();
        let children: Arc<ChildArray> = Arc::new(std::array::from_fn(|i| {
            self.pool.alloc(regions[i], node, Corner::new(i as u8))
        }));
        node.set_cell(CellState::Branch(children.clone()));
        for i in Corner::iter() {
            let task = Task {
                node: children[i.index()].clone(),
                tape: tape.clone(),
                neighbors: Neighborhood::new(&children),
                vol: vol.and_then(|v| v.push(i)),
            };
            if let Err(task) = tasks.push(task) {
                self.local.push(task);
            }
        }
    }

    /// Samples the cell corners and solves per-patch QEFs
    fn eval_leaf(
        &mut self,
        node: &Arc<Node>,
        tape: &Arc<E::Tape>,
        neighbors: &Neighborhood,
    ) {
        // Corner samples, reusing anything a sibling already published
        let mut values = [0.0f32; 8];
        let mut missing: ArrayVec<usize, 8> = ArrayVec::new();
        let mut points: ArrayVec<Vector3<f32>, 8> = ArrayVec::new();
        for c in Corner::iter() {
            match neighbors.corner_value(node.parent_index, c) {
                Some(v) => values[c.index()] = v,
                None => {
                    missing.push(c.index());
                    points.push(node.region.corner(c));
                }
            }
        }
        if !missing.is_empty() {
            let out = self.eval.values(&points, tape);
            for (&i, &v) in missing.iter().zip(out.iter()) {
                values[i] = v;
            }
        }
        for c in Corner::iter() {
            node.publish_corner(c, values[c.index()]);
        }

        // Build the mask of filled corners, which determines the cell
        // topology (patch count and active edges)
        let mask = values
            .iter()
            .enumerate()
            .filter(|(_i, &v)| v < 0.0)
            .fold(0u8, |acc, (i, _v)| acc | (1 << i));

        if mask == 0 {
            node.set_cell(CellState::Empty);
            return;
        } else if mask == 0xff {
            node.set_cell(CellState::Filled);
            return;
        }

        // Bracketed bisection along each sign-changing edge; each round
        // evaluates the midpoints of every active edge in one batch
        let patches = CELL_TO_VERT_TO_EDGES[mask as usize];
        let mut lo: ArrayVec<Vector3<f32>, 12> = ArrayVec::new();
        let mut hi: ArrayVec<Vector3<f32>, 12> = ArrayVec::new();
        for vs in patches {
            for e in vs.iter() {
                lo.push(node.region.corner(e.start())); // inside
                hi.push(node.region.corner(e.end())); // outside
            }
        }
        let n = lo.len();
        debug_assert!(n > 0);

        let mut mids: ArrayVec<Vector3<f32>, 12> = ArrayVec::new();
        for _ in 0..EDGE_SEARCH_DEPTH {
            mids.clear();
            for i in 0..n {
                mids.push((lo[i] + hi[i]) / 2.0);
            }
            let out = self.eval.values(&mids, tape);
            for i in 0..n {
                if out[i] < 0.0 {
                    lo[i] = mids[i];
                } else {
                    hi[i] = mids[i];
                }
            }
        }
        let crossings: ArrayVec<Vector3<f32>, 12> =
            (0..n).map(|i| (lo[i] + hi[i]) / 2.0).collect();
        let grads = self.eval.grads(&crossings, tape);

        // Accumulate and solve one QEF per surface patch
        let mut verts: ArrayVec<LeafVert, 4> = ArrayVec::new();
        let mut first_qef = Qef::new();
        let mut first_err = 0.0;
        let mut i = 0;
        for (patch, vs) in patches.iter().enumerate() {
            let mut qef = Qef::new();
            for _ in vs.iter() {
                let g = grads[i];
                qef.push(crossings[i], g.deriv(), g.v);
                i += 1;
            }
            let (pos, err) = qef.solve(&node.region);
            verts.push(LeafVert::new(pos));
            if patch == 0 {
                first_err = err;
                first_qef = qef;
            }
        }
        debug_assert_eq!(i, n);

        node.set_cell(CellState::Leaf(Box::new(Leaf {
            mask,
            level: 0,
            verts,
            qef: first_qef,
            err: first_err,
        })));
    }

    /// Merges a completed set of 8 children
    ///
    /// Uniformly empty or filled children collapse to an empty or filled
    /// parent.  Eight single-patch leaves collapse to a single coarse leaf
    /// when the union passes the manifold tests and the combined error
    /// function stays below `max_err`; otherwise the node stays branching.
    fn collect_children(&mut self, parent: &Arc<Node>, settings: &Settings) {
        let Some(children) = parent.children() else {
            unreachable!("collected a non-branch node");
        };

        let mut empty = 0;
        let mut filled = 0;
        let mut mergeable = true;
        let mut mask = 0u8;
        for (i, c) in children.iter().enumerate() {
            match c.cell() {
                Cell::Empty => empty += 1,
                Cell::Filled => {
                    filled += 1;
                    mask |= 1 << i;
                }
                Cell::Branch(..) => mergeable = false,
                Cell::Leaf(leaf) => {
                    // Multi-patch leaves are non-manifold and pin the
                    // surrounding topology in place
                    if leaf.verts.len() != 1 {
                        mergeable = false;
                    }
                    // The parent's corner i is child i's corner i
                    mask |= leaf.mask & (1 << i);
                }
                Cell::Unknown => unreachable!("unevaluated child"),
            }
        }

        if empty == 8 {
            let old = parent.collapse(CellState::Empty);
            self.pool.retire(old);
        } else if filled == 8 {
            let old = parent.collapse(CellState::Filled);
            self.pool.retire(old);
        } else if mergeable
            && CORNERS_ARE_MANIFOLD[mask as usize]
            && manifold_union(children, mask)
        {
            // Candidate error function for the merged cell; empty and
            // filled children only contribute their corner signs
            let mut qef = Qef::new();
            for c in children.iter() {
                if let Some(leaf) = c.leaf() {
                    qef += &leaf.qef;
                }
            }
            // The collapse error is the total residual of the child
            // vertices against the candidate
            let err: f64 = children
                .iter()
                .filter_map(|c| c.leaf())
                .map(|leaf| qef.eval(leaf.verts[0].pos))
                .sum();
            if err < settings.max_err as f64 {
                let (pos, residual) = qef.solve(&parent.region);
                let level = children
                    .iter()
                    .filter_map(|c| c.leaf())
                    .map(|leaf| leaf.level)
                    .max()
                    .unwrap_or(0)
                    + 1;
                let mut verts = ArrayVec::new();
                verts.push(LeafVert::new(pos));
                let old = parent.collapse(CellState::Leaf(Box::new(Leaf {
                    mask,
                    level,
                    verts,
                    qef,
                    err: residual,
                })));
                self.pool.retire(old);
            }
        }
    }
}

/// The three sign tests of Ju et al (2002), §4.1
///
/// The sign at the midpoint of every coarse edge, the center of every
/// coarse face and the center of the coarse cube must agree with at least
/// one of the corresponding coarse corners; otherwise the fine surface
/// would be lost by a collapse.
fn manifold_union(children: &ChildArray, mask: u8) -> bool {
    use crate::frame::{Frame, XYZ, YZX, ZXY};
    let corner_sign = |c: Corner| mask & c.bit() != 0;

    for (t, u, v) in [XYZ::frame(), YZX::frame(), ZXY::frame()] {
        // The sign in the middle of a coarse edge must agree with the
        // sign of at least one of the edge's two endpoints
        for i in 0..4 {
            let a = (u * (i & 1 != 0)) | (v * (i & 2 != 0));
            let b = a | t;
            let center = children[a.index()].corner(b);
            if [a, b].iter().all(|&q| corner_sign(q) != center) {
                return false;
            }
        }

        // The sign in the middle of a coarse face must agree with the
        // sign of at least one of the face's four corners
        for i in 0..2 {
            let a: Corner = t * (i == 0);
            let b = a | u;
            let c = a | v;
            let d = a | u | v;
            let center = children[a.index()].corner(d);
            if [a, b, c, d].iter().all(|&q| corner_sign(q) != center) {
                return false;
            }
        }
    }

    // The sign in the middle of the coarse cube must agree with at least
    // one corner sign
    let center = children[0].corner(Corner::new(7));
    Corner::iter().any(|q| corner_sign(q) == center)
}

////////////////////////////////////////////////////////////////////////////////
