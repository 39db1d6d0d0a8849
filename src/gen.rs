//! Tables generated by the build script
//!
//! See `build.rs` for the generation code; masks index all three tables.
use crate::types::{Corner, DirectedEdge};

include!(concat!(env!("OUT_DIR"), "/marching_tables.rs"));

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_vert_table() {
        assert!(CELL_TO_VERT_TO_EDGES[0].is_empty());
        assert!(CELL_TO_VERT_TO_EDGES[255].is_empty());
        for (mask, patches) in CELL_TO_VERT_TO_EDGES.iter().enumerate() {
            assert!(patches.len() <= 4);
            for edges in patches.iter() {
                for e in edges.iter() {
                    // Each recorded edge runs from inside to outside
                    assert!(mask & (1 << e.start().index()) != 0);
                    assert!(mask & (1 << e.end().index()) == 0);
                }
            }
        }
    }

    #[test]
    fn test_edge_table() {
        for (mask, edges) in CELL_TO_EDGE_TO_VERT.iter().enumerate() {
            let patches = &CELL_TO_VERT_TO_EDGES[mask];
            for (e, patch) in edges.iter().enumerate() {
                let e = crate::types::Edge::new(e as u8);
                let (start, end) = e.corners();
                let s = mask & (1 << start.index()) != 0;
                let t = mask & (1 << end.index()) != 0;
                if s == t {
                    // No sign change, no patch
                    assert!(patch.is_none());
                } else {
                    let p = patch.unwrap() as usize;
                    assert!(p < patches.len());
                    // The patch's edge list contains this edge
                    assert!(patches[p]
                        .iter()
                        .any(|d| d.to_undirected() == e));
                }
            }
        }
    }

    #[test]
    fn test_manifold_table() {
        // Single-corner and single-patch cases are manifold
        assert!(CORNERS_ARE_MANIFOLD[0]);
        assert!(CORNERS_ARE_MANIFOLD[255]);
        assert!(CORNERS_ARE_MANIFOLD[1]);
        assert!(CORNERS_ARE_MANIFOLD[0b11]);
        // Two diagonally-opposite corners are not
        assert!(!CORNERS_ARE_MANIFOLD[0b1000_0001]);
        // ...nor are two opposite corners of a face
        assert!(!CORNERS_ARE_MANIFOLD[0b1001]);
        // Two disconnected empty regions share one filled region; the
        // vert table assigns them a single patch, but the configuration
        // is still rejected as non-manifold
        assert!(!CORNERS_ARE_MANIFOLD[0b0111_1110]);
        assert_eq!(CELL_TO_VERT_TO_EDGES[0b0111_1110].len(), 1);

        // A manifold mask never induces more than one surface patch
        for mask in 0..256 {
            if CORNERS_ARE_MANIFOLD[mask] {
                assert!(
                    CELL_TO_VERT_TO_EDGES[mask].len() <= 1,
                    "mask {mask:08b}"
                );
            }
        }
    }
}
