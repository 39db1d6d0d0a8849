//! Build-time generation of the dual contouring connectivity tables
//!
//! For each of the 256 corner masks this computes
//!
//! * the cell's surface patches, each as a list of sign-change edges
//!   (directed from the inside corner to the outside corner),
//! * which patch subsumes each of the 12 cube edges, and
//! * whether the mask is a manifold corner configuration.
//!
//! Patches are the connected filled regions of the cube graph that touch
//! a sign change: two filled corners belong to the same patch when they
//! are joined by a chain of filled cube edges, so the tables fall out of
//! a union-find over the corners followed by one pass over the edges.
//!
//! The results land in `$OUT_DIR/marching_tables.rs`, which is included
//! by `src/gen.rs`.
use std::collections::BTreeSet;

/// Cube axes as corner-index bits, in right-handed order
const AXES: [usize; 3] = [1, 2, 4];

/// Right-handed successor of an axis bit (X → Y → Z → X)
fn rot(axis: usize) -> usize {
    match axis {
        1 => 2,
        2 => 4,
        4 => 1,
        _ => unreachable!("invalid axis {axis}"),
    }
}

/// Corner pair of the undirected edge `e`
///
/// Edges use the same packing as `src/types.rs`: `4 * t + 2 * v + u`,
/// with the start corner on the lower side of the varying axis `t`.
fn edge_corners(e: usize) -> (usize, usize) {
    let t = AXES[e / 4];
    let u = rot(t);
    let v = rot(u);
    let mut start = 0;
    if e % 2 != 0 {
        start |= u;
    }
    if (e % 4) / 2 != 0 {
        start |= v;
    }
    (start, start | t)
}

/// Union-find over the 8 cube corners
struct Components([usize; 8]);

impl Components {
    fn new() -> Self {
        Components(std::array::from_fn(|i| i))
    }

    fn find(&mut self, i: usize) -> usize {
        let parent = self.0[i];
        if parent == i {
            i
        } else {
            let root = self.find(parent);
            self.0[i] = root;
            root
        }
    }

    fn union(&mut self, a: usize, b: usize) {
        let (a, b) = (self.find(a), self.find(b));
        // Keep the smaller corner as the representative, so patch
        // numbering below is deterministic
        self.0[a.max(b)] = a.min(b);
    }
}

/// Whether a corner mask describes a single surface patch
///
/// Build the graph whose vertices are the 8 cube corners and whose edges
/// connect same-sign neighbors along the 12 cube edges, then iteratively
/// contract same-sign edges; the mask is manifold iff the remaining edge
/// set collapses to a single representative edge.
fn corners_are_manifold(mask: usize) -> bool {
    let filled: Vec<bool> = (0..8).map(|i| mask & (1 << i) != 0).collect();
    let mut edges: Vec<(usize, usize)> = (0..12).map(edge_corners).collect();
    loop {
        let Some(&(a, b)) =
            edges.iter().find(|&&(a, b)| filled[a] == filled[b])
        else {
            break;
        };
        edges = edges
            .into_iter()
            .map(|(p, q)| (if p == a { b } else { p }, if q == a { b } else { q }))
            .filter(|(p, q)| p != q)
            .collect();
    }
    let distinct: BTreeSet<(usize, usize)> = edges
        .into_iter()
        .map(|(a, b)| (a.min(b), a.max(b)))
        .collect();
    distinct.len() <= 1
}

/// Per-mask connectivity: patch edge lists plus the edge → patch map
fn cell_patches(
    mask: usize,
) -> (Vec<Vec<(usize, usize)>>, [Option<usize>; 12]) {
    let filled = |c: usize| mask & (1 << c) != 0;

    // Group same-sign corners along the cube edges
    let mut comps = Components::new();
    for e in 0..12 {
        let (a, b) = edge_corners(e);
        if filled(a) == filled(b) {
            comps.union(a, b);
        }
    }

    // Each filled component that touches a sign change owns one patch;
    // patches are numbered in order of first appearance along the edges
    let mut patch_of_root = [None; 8];
    let mut patches: Vec<Vec<(usize, usize)>> = vec![];
    let mut edge_map = [None; 12];
    for e in 0..12 {
        let (a, b) = edge_corners(e);
        let (inside, outside) = if filled(a) && !filled(b) {
            (a, b)
        } else if filled(b) && !filled(a) {
            (b, a)
        } else {
            continue;
        };
        let root = comps.find(inside);
        let patch = *patch_of_root[root].get_or_insert_with(|| {
            patches.push(vec![]);
            patches.len() - 1
        });
        patches[patch].push((inside, outside));
        edge_map[e] = Some(patch);
    }
    // A cube can hold at most 4 disjoint surface patches
    assert!(patches.len() <= 4);
    (patches, edge_map)
}

fn main() -> Result<(), std::io::Error> {
    // The build script stands alone; ignore other changes to the crate.
    println!("cargo:rerun-if-changed=build.rs");

    let mut out = String::new();

    out.push_str(
        "\
/// Lookup table to find edges for a particular cell configuration
///
/// Given a cell corner mask `i` (as an 8-bit value), looks up a list of
/// surface patches within that cell.  Each patch is implicitly numbered
/// based on its position in the list, and itself stores a list of
/// sign-change edges (as directed edges from inside corner to outside
/// corner).
pub const CELL_TO_VERT_TO_EDGES: [&[&[DirectedEdge]]; 256] = [
",
    );
    for mask in 0..256 {
        let (patches, _) = cell_patches(mask);
        out.push_str("    &[\n");
        for edges in &patches {
            out.push_str("        &[\n");
            for &(a, b) in edges {
                out.push_str(&format!(
                    "            DirectedEdge::new(Corner::new({a}), \
                                                   Corner::new({b})),\n"
                ));
            }
            out.push_str("        ],\n");
        }
        out.push_str("    ],\n");
    }
    out.push_str("];\n");

    out.push_str(
        "
/// Lookup table to find which patch is associated with a particular edge
///
/// Given a cell corner mask `i` (as an 8-bit value) and an edge index `e`
/// (as a packed undirected value in the range 0-12), returns the patch
/// whose vertex subsumes that edge's crossing, or `None` if the edge has
/// no sign change.
pub const CELL_TO_EDGE_TO_VERT: [[Option<u8>; 12]; 256] = [
",
    );
    for mask in 0..256 {
        let (_, edge_map) = cell_patches(mask);
        out.push_str("    [\n");
        for patch in edge_map {
            match patch {
                Some(p) => out.push_str(&format!("        Some({p}),\n")),
                None => out.push_str("        None,\n"),
            }
        }
        out.push_str("    ],\n");
    }
    out.push_str("];\n");

    out.push_str(
        "
/// Whether a corner mask describes a manifold cell
///
/// A cell may only be collapsed into its parent if its corner mask appears
/// as `true` in this table (in addition to the coarse-sample checks done
/// at collapse time).
pub const CORNERS_ARE_MANIFOLD: [bool; 256] = [
",
    );
    for mask in 0..256 {
        out.push_str(&format!("    {},\n", corners_are_manifold(mask)));
    }
    out.push_str("];\n");

    let out_dir = std::env::var_os("OUT_DIR").unwrap();
    let dest = std::path::Path::new(&out_dir).join("marching_tables.rs");
    std::fs::write(dest, out)
}
