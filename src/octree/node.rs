//! Octree node storage
//!
//! Nodes are shared between worker threads during both meshing phases, so
//! every mutable field is atomic:
//!
//! * `cell` packs the node's state into a tagged `AtomicU64` (small
//!   integers for unknown/empty/filled, tagged pointers for leaf data and
//!   child arrays),
//! * `pending` is the bottom-up hand-off counter,
//! * `corners` publishes evaluated corner samples for sibling reuse.
//!
//! Parents own their children through the cell slot; the child's
//! back-reference is a non-owning `Weak`.  Child arrays displaced by a
//! collapse are retired into the worker's [`NodePool`] instead of being
//! freed, so references published during the build stay valid until the
//! whole octree is dropped.
use crate::{
    mesh::MeshFragment,
    qef::Qef,
    region::Region,
    types::Corner,
};
use arrayvec::ArrayVec;
use nalgebra::Vector3;
use std::sync::{
    atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering},
    Arc, Weak,
};

/// The 8 children of a branch node, indexed by [`Corner`]
pub(crate) type ChildArray = [Arc<Node>; 8];

/// Interval classification of a node
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CellClass {
    /// Not yet evaluated
    Unknown,
    /// The field is positive everywhere inside the node
    Empty,
    /// The field is negative everywhere inside the node
    Filled,
    /// The node straddles the surface (or could not be proven otherwise)
    Ambiguous,
}

/// Owned form of a cell state, for writing into a [`Node`]
pub(crate) enum CellState {
    Empty,
    Filled,
    Leaf(Box<Leaf>),
    Branch(Arc<ChildArray>),
}

/// Borrowed view of a cell state
pub(crate) enum Cell<'a> {
    Unknown,
    Empty,
    Filled,
    Leaf(&'a Leaf),
    Branch(&'a ChildArray),
}

const LEAF_TAG: u64 = 1;
const BRANCH_TAG: u64 = 2;
const TAG_MASK: u64 = 0b11;

/// Tagged atomic storage for a cell state
///
/// `0`/`1`/`2` encode unknown/empty/filled; larger values are pointers to
/// a `Leaf` or `ChildArray` with the tag in the low two bits (both point
/// at allocations aligned to at least 4 bytes).
struct CellSlot(AtomicU64);

impl CellSlot {
    fn new() -> Self {
        CellSlot(AtomicU64::new(0))
    }

    fn encode(state: CellState) -> u64 {
        match state {
            CellState::Empty => 1,
            CellState::Filled => 2,
            CellState::Leaf(b) => {
                let p = Box::into_raw(b) as u64;
                debug_assert_eq!(p & TAG_MASK, 0);
                p | LEAF_TAG
            }
            CellState::Branch(a) => {
                let p = Arc::into_raw(a) as u64;
                debug_assert_eq!(p & TAG_MASK, 0);
                p | BRANCH_TAG
            }
        }
    }

    fn get(&self) -> Cell<'_> {
        let v = self.0.load(Ordering::Acquire);
        match v {
            0 => Cell::Unknown,
            1 => Cell::Empty,
            2 => Cell::Filled,
            // SAFETY: pointer-tagged values are only written by `set` and
            // `swap` below; leaf pointers are never replaced, and branch
            // pointers displaced by a collapse are retired into a NodePool,
            // which keeps the allocation alive for the octree's lifetime.
            _ => match v & TAG_MASK {
                LEAF_TAG => {
                    Cell::Leaf(unsafe { &*((v & !TAG_MASK) as *const Leaf) })
                }
                BRANCH_TAG => Cell::Branch(unsafe {
                    &*((v & !TAG_MASK) as *const ChildArray)
                }),
                _ => unreachable!("invalid cell encoding {v:#x}"),
            },
        }
    }

    /// Writes an initial state; the slot must be `Unknown`
    fn set(&self, state: CellState) {
        let old = self.0.swap(Self::encode(state), Ordering::AcqRel);
        debug_assert_eq!(old, 0, "cell was already populated");
    }

    /// Replaces a `Branch` state, returning the displaced child array
    fn swap(&self, state: CellState) -> Arc<ChildArray> {
        let old = self.0.swap(Self::encode(state), Ordering::AcqRel);
        assert!(
            old > TAG_MASK && old & TAG_MASK == BRANCH_TAG,
            "collapsed a non-branch cell"
        );
        // SAFETY: the tagged pointer was produced by `Arc::into_raw` in
        // `encode` and is read back exactly once (here)
        unsafe { Arc::from_raw((old & !TAG_MASK) as *const ChildArray) }
    }
}

impl Drop for CellSlot {
    fn drop(&mut self) {
        let v = *self.0.get_mut();
        // SAFETY: exclusive access; the tagged pointer (if any) was
        // produced by `encode` and has not been reclaimed elsewhere
        unsafe {
            match v & TAG_MASK {
                LEAF_TAG if v > TAG_MASK => {
                    drop(Box::from_raw((v & !TAG_MASK) as *mut Leaf))
                }
                BRANCH_TAG if v > TAG_MASK => {
                    drop(Arc::from_raw((v & !TAG_MASK) as *const ChildArray))
                }
                _ => (),
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Sentinel bit pattern for an unpublished corner sample
const CORNER_UNSET: u32 = f32::NAN.to_bits();

/// One octree cell
pub(crate) struct Node {
    pub region: Region,
    /// Non-owning back-reference; the root's parent upgrades to `None`
    pub parent: Weak<Node>,
    /// Which child of the parent this node is
    pub parent_index: Corner,
    cell: CellSlot,
    /// Bottom-up hand-off counter, armed to 7 before children are pushed;
    /// the decrementer that observes 0 owns the collect step
    pending: AtomicU8,
    /// Published corner samples (f32 bits; NaN means not yet evaluated)
    corners: [AtomicU32; 8],
}

impl Node {
    pub fn new(region: Region, parent: Weak<Node>, parent_index: Corner) -> Self {
        Node {
            region,
            parent,
            parent_index,
            cell: CellSlot::new(),
            pending: AtomicU8::new(0),
            corners: std::array::from_fn(|_| AtomicU32::new(CORNER_UNSET)),
        }
    }

    /// Builds a free-standing empty cell, used as a virtual neighbor when
    /// walking the top edges of the root
    pub fn empty(region: Region) -> Arc<Node> {
        let node = Node::new(region, Weak::new(), Corner::new(0));
        node.cell.set(CellState::Empty);
        Arc::new(node)
    }

    pub fn cell(&self) -> Cell<'_> {
        self.cell.get()
    }

    pub fn class(&self) -> CellClass {
        match self.cell.get() {
            Cell::Unknown => CellClass::Unknown,
            Cell::Empty => CellClass::Empty,
            Cell::Filled => CellClass::Filled,
            // Leaves with uniform corners are stored as Empty / Filled,
            // so a stored leaf always straddles the surface
            Cell::Leaf(..) | Cell::Branch(..) => CellClass::Ambiguous,
        }
    }

    pub fn is_branch(&self) -> bool {
        matches!(self.cell.get(), Cell::Branch(..))
    }

    pub fn children(&self) -> Option<&ChildArray> {
        match self.cell.get() {
            Cell::Branch(c) => Some(c),
            _ => None,
        }
    }

    pub fn leaf(&self) -> Option<&Leaf> {
        match self.cell.get() {
            Cell::Leaf(leaf) => Some(leaf),
            _ => None,
        }
    }

    /// Checks whether the given corner is empty (`false`) or filled (`true`)
    ///
    /// # Panics
    /// If the cell is a branch or unevaluated
    pub fn corner(&self, c: Corner) -> bool {
        match self.cell.get() {
            Cell::Leaf(leaf) => leaf.mask & c.bit() != 0,
            Cell::Empty => false,
            Cell::Filled => true,
            Cell::Branch(..) | Cell::Unknown => {
                panic!("corner sign is undefined here")
            }
        }
    }

    pub fn set_cell(&self, state: CellState) {
        self.cell.set(state);
    }

    /// Collapses a branch, returning the displaced children for retirement
    pub fn collapse(&self, state: CellState) -> Arc<ChildArray> {
        self.cell.swap(state)
    }

    /// Re-arms the hand-off counter for a bottom-up pass
    pub fn arm_pending(&self) {
        self.pending.store(7, Ordering::Relaxed);
    }

    /// Decrements the hand-off counter, returning the previous value
    ///
    /// The caller that observes 0 is the last of the 8 children to finish
    /// and owns the parent's collect step.
    pub fn dec_pending(&self) -> u8 {
        self.pending.fetch_sub(1, Ordering::AcqRel)
    }

    /// Reads a corner sample published by [`publish_corner`](Self::publish_corner)
    pub fn corner_value(&self, c: Corner) -> Option<f32> {
        let bits = self.corners[c.index()].load(Ordering::Acquire);
        if bits == CORNER_UNSET {
            None
        } else {
            Some(f32::from_bits(bits))
        }
    }

    /// Publishes a corner sample for reuse by siblings
    pub fn publish_corner(&self, c: Corner, v: f32) {
        self.corners[c.index()].store(v.to_bits(), Ordering::Release);
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Per-cell surface data, present only on non-branch, sign-changing cells
pub(crate) struct Leaf {
    /// 8-bit sign pattern of the cube corners (set bits are filled)
    pub mask: u8,
    /// Collapse level: 0 for primitive leaves, `> 0` when several levels
    /// have been merged into this cell
    pub level: u8,
    /// One vertex per surface patch; collapsed cells always have one
    pub verts: ArrayVec<LeafVert, 4>,
    /// Accumulated error function, kept for the parent's collapse decision
    pub qef: Qef,
    /// Residual of the solved vertex
    pub err: f64,
}

/// A single patch vertex with its lazily-assigned global mesh index
pub(crate) struct LeafVert {
    pub pos: Vector3<f32>,
    /// 0 until claimed during the dual walk
    index: AtomicU32,
}

/// Claim marker: a thread has won the slot and is allocating the index
const INDEX_RESERVED: u32 = u32::MAX;

impl LeafVert {
    pub fn new(pos: Vector3<f32>) -> Self {
        LeafVert {
            pos,
            index: AtomicU32::new(0),
        }
    }

    /// Returns the vertex to the unclaimed state
    pub fn reset(&self) {
        self.index.store(0, Ordering::Relaxed);
    }

    /// Returns this vertex's global mesh index, assigning it on first use
    ///
    /// The first thread to observe the unclaimed slot pushes the vertex
    /// into its own buffer and publishes the allocated index; racing
    /// threads spin briefly until the index is visible.
    pub fn claim(&self, out: &mut MeshFragment) -> u32 {
        loop {
            match self.index.load(Ordering::Acquire) {
                0 => {
                    if self
                        .index
                        .compare_exchange(
                            0,
                            INDEX_RESERVED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        let i = out.push_vertex(self.pos);
                        debug_assert!(i != 0 && i != INDEX_RESERVED);
                        self.index.store(i, Ordering::Release);
                        return i;
                    }
                }
                INDEX_RESERVED => std::hint::spin_loop(),
                i => return i,
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Per-worker allocation pool
///
/// Tracks how many nodes a worker has created (for progress accounting)
/// and retains child arrays displaced by collapses, so that shared
/// references published during the build remain valid.  Once the workers
/// join, the root claims every pool under a single mutex and holds them
/// for the lifetime of the octree.
#[derive(Default)]
pub(crate) struct NodePool {
    count: u64,
    retired: Vec<Arc<ChildArray>>,
}

impl NodePool {
    pub fn alloc(
        &mut self,
        region: Region,
        parent: &Arc<Node>,
        index: Corner,
    ) -> Arc<Node> {
        self.count += 1;
        Arc::new(Node::new(region, Arc::downgrade(parent), index))
    }

    pub fn alloc_root(&mut self, region: Region) -> Arc<Node> {
        self.count += 1;
        Arc::new(Node::new(region, Weak::new(), Corner::new(0)))
    }

    pub fn retire(&mut self, children: Arc<ChildArray>) {
        self.retired.push(children);
    }

    /// Number of nodes allocated from this pool
    pub fn allocated(&self) -> u64 {
        self.count
    }

    /// Number of child arrays retired into this pool
    ///
    /// Each one removed 8 nodes from the reachable tree (they stay
    /// allocated until the pool is dropped).  A node may be allocated in
    /// one worker's pool and retired into another's, so the counts only
    /// balance summed over all pools.
    pub fn retired(&self) -> u64 {
        self.retired.len() as u64
    }
}

////////////////////////////////////////////////////////////////////////////////
