//! Axis-aligned regions of interest
use crate::{
    interval::Interval,
    types::{Axis, Corner, X, Y, Z},
};
use nalgebra::Vector3;

/// An axis-aligned cuboid with an integer subdivision level
///
/// The level counts how many times the region may still be halved along
/// each axis: `level == 0` means the region is a cell of minimum feature
/// size and will not be subdivided further.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Region {
    pub lower: Vector3<f32>,
    pub upper: Vector3<f32>,
    pub level: u8,
}

impl Region {
    /// Builds a region with the given bounds and a level of 0
    ///
    /// Call [`with_resolution`](Self::with_resolution) to pick a level from
    /// a target feature size.
    pub fn new(lower: Vector3<f32>, upper: Vector3<f32>) -> Self {
        Self {
            lower,
            upper,
            level: 0,
        }
    }

    /// Builds the cube spanning `[-scale, scale]` on all axes
    pub fn symmetric(scale: f32) -> Self {
        Self::new(
            Vector3::new(-scale, -scale, -scale),
            Vector3::new(scale, scale, scale),
        )
    }

    /// Returns the length of the longest edge of the region
    pub fn max_edge(&self) -> f32 {
        (self.upper - self.lower).max()
    }

    /// Picks a subdivision level from a target minimum feature size
    ///
    /// The level is `ceil(log2(max_edge / min_feature))`, i.e. the smallest
    /// level at which cells are no larger than `min_feature`.
    pub fn with_resolution(mut self, min_feature: f32) -> Self {
        let ratio = self.max_edge() / min_feature;
        self.level = if ratio > 1.0 {
            (ratio.log2().ceil() as u32).min(u8::MAX as u32) as u8
        } else {
            0
        };
        self
    }

    /// Returns the bounds of the region along the given axis
    pub fn axis(&self, a: Axis) -> Interval {
        let i = a.index();
        Interval::new(self.lower[i], self.upper[i])
    }

    /// Returns the position of the given corner
    pub fn corner(&self, c: Corner) -> Vector3<f32> {
        Vector3::new(
            if c & X { self.upper.x } else { self.lower.x },
            if c & Y { self.upper.y } else { self.lower.y },
            if c & Z { self.upper.z } else { self.lower.z },
        )
    }

    /// Returns the center of the region
    pub fn center(&self) -> Vector3<f32> {
        (self.lower + self.upper) / 2.0
    }

    /// Subdivides the region into 8 children at `level - 1`
    ///
    /// Children are indexed by [`Corner`]; each child shares the corner of
    /// the same index with its parent.
    pub fn subdivide(&self) -> [Region; 8] {
        let mid = self.center();
        let level = self.level.saturating_sub(1);
        std::array::from_fn(|i| {
            let c = Corner::new(i as u8);
            let pick = |a: Axis| {
                let j = a.index();
                if c & a {
                    (mid[j], self.upper[j])
                } else {
                    (self.lower[j], mid[j])
                }
            };
            let (lx, ux) = pick(X);
            let (ly, uy) = pick(Y);
            let (lz, uz) = pick(Z);
            Region {
                lower: Vector3::new(lx, ly, lz),
                upper: Vector3::new(ux, uy, uz),
                level,
            }
        })
    }

    /// Clamps a position to lie within the region
    pub fn clamp(&self, p: Vector3<f32>) -> Vector3<f32> {
        Vector3::new(
            p.x.clamp(self.lower.x, self.upper.x),
            p.y.clamp(self.lower.y, self.upper.y),
            p.z.clamp(self.lower.z, self.upper.z),
        )
    }

    /// Checks whether the position is inside the region
    pub fn contains(&self, p: Vector3<f32>) -> bool {
        [X, Y, Z].iter().all(|&a| self.axis(a).contains(p[a.index()]))
    }

    /// Checks that the region has positive extent on every axis
    pub fn is_valid(&self) -> bool {
        (0..3).all(|i| {
            self.upper[i] > self.lower[i]
                && self.lower[i].is_finite()
                && self.upper[i].is_finite()
        })
    }
}

////////////////////////////////////////////////////////////////////////////////
