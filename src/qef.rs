//! Quadratic error functions for feature-preserving vertex placement
//!
//! Each surface sample contributes the plane through its position with its
//! gradient as normal; the accumulated error function is
//! `E(x) = Σ (nᵢ·(x−pᵢ))²`, and the cell vertex is the minimizer, biased
//! towards the mass point of the samples.  See "Dual Contouring of Hermite
//! Data" (Ju et al, 2002) for the construction.
//!
//! Accumulation and solving run in `f64`: collapse decisions compare
//! residuals against error bounds (`1e-8` by default) that sit below
//! single-precision noise.
use crate::region::Region;
use nalgebra::{Matrix3, Vector3, Vector4};
use ordered_float::OrderedFloat;
use std::sync::atomic::{AtomicI8, Ordering};

/// Eigenvalue cutoff used when inverting `AtA`
///
/// "Dual Contouring: The Secret Sauce" recommends 0.1 for normalized
/// gradients; with the `unnormalized-derivs` feature the cutoff is instead
/// taken relative to the largest eigenvalue, since eigenvalue magnitudes
/// then scale with the field.
const EIGENVALUE_CUTOFF: f64 = 0.1;

/// Accumulated quadratic error function for one surface patch
pub struct Qef {
    /// `AᵀA` term of the least-squares system
    ata: Matrix3<f64>,

    /// `AᵀB` term of the least-squares system
    atb: Vector3<f64>,

    /// `BᵀB` term, used when reporting residuals
    btb: f64,

    /// Mass point of samples, stored as XYZ / W so that summing works
    mass_point: Vector4<f64>,

    /// Cached rank of `AtA`; -1 when not yet computed
    rank: AtomicI8,
}

impl Default for Qef {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Qef {
    fn clone(&self) -> Self {
        Qef {
            ata: self.ata,
            atb: self.atb,
            btb: self.btb,
            mass_point: self.mass_point,
            rank: AtomicI8::new(self.rank.load(Ordering::Relaxed)),
        }
    }
}

impl std::fmt::Debug for Qef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Qef")
            .field("ata", &self.ata)
            .field("atb", &self.atb)
            .field("btb", &self.btb)
            .field("mass_point", &self.mass_point)
            .finish()
    }
}

impl std::ops::AddAssign<&Qef> for Qef {
    fn add_assign(&mut self, rhs: &Qef) {
        self.ata += rhs.ata;
        self.atb += rhs.atb;
        self.btb += rhs.btb;
        self.mass_point += rhs.mass_point;
        self.rank.store(-1, Ordering::Relaxed);
    }
}

impl Qef {
    pub fn new() -> Self {
        Qef {
            ata: Matrix3::zeros(),
            atb: Vector3::zeros(),
            btb: 0.0,
            mass_point: Vector4::zeros(),
            rank: AtomicI8::new(-1),
        }
    }

    /// Returns the accumulated mass point (XYZ / W form)
    pub fn mass_point(&self) -> Vector4<f64> {
        self.mass_point
    }

    /// Adds a surface sample to the error function
    ///
    /// `pos` is accumulated into the mass point unconditionally.  In the
    /// default (normalized) mode the gradient is normalized before use and
    /// samples with a near-zero or non-finite direction are dropped from
    /// the system.
    #[allow(unused_mut)]
    pub fn push(&mut self, pos: Vector3<f32>, deriv: Vector3<f32>, value: f32) {
        let pos = pos.cast::<f64>();
        let mut deriv = deriv.cast::<f64>();
        let mut value = value as f64;
        self.mass_point += Vector4::new(pos.x, pos.y, pos.z, 1.0);

        #[cfg(not(feature = "unnormalized-derivs"))]
        {
            let norm = deriv.norm();
            deriv /= norm;
            value /= norm;
            if norm <= 1e-12 || !deriv.iter().all(|c| c.is_finite()) {
                return;
            }
        }

        let b = deriv.dot(&pos) - value;
        self.ata += deriv * deriv.transpose();
        self.atb += deriv * b;
        self.btb += b * b;
        self.rank.store(-1, Ordering::Relaxed);
    }

    /// Evaluates the error function at the given position
    pub fn eval(&self, pos: Vector3<f32>) -> f64 {
        let pos = pos.cast::<f64>();
        ((pos.transpose() * self.ata * pos - 2.0 * pos.transpose() * self.atb)
            [0]
            + self.btb)
            .max(0.0)
    }

    fn cutoff(eigenvalues: &Vector3<f64>) -> f64 {
        if cfg!(feature = "unnormalized-derivs") {
            let highest = eigenvalues.amax();
            if highest > 1e-20 {
                highest * EIGENVALUE_CUTOFF
            } else {
                0.0
            }
        } else {
            EIGENVALUE_CUTOFF
        }
    }

    /// Returns the pseudo-rank of `AtA`
    ///
    /// Ranks 1, 2, 3 correspond to planar, edge and corner features.  The
    /// result is cached until the next sample is pushed.
    pub fn rank(&self) -> u8 {
        let cached = self.rank.load(Ordering::Relaxed);
        if cached >= 0 {
            return cached as u8;
        }
        let es = nalgebra::SymmetricEigen::new(self.ata);
        let cutoff = Self::cutoff(&es.eigenvalues);
        let rank = es
            .eigenvalues
            .iter()
            .filter(|e| e.abs() >= cutoff)
            .count() as i8;
        self.rank.store(rank, Ordering::Relaxed);
        rank as u8
    }

    /// Solves the error function, minimizing towards the mass point
    ///
    /// The solution is clamped into the given region.  Returns the vertex
    /// position and the residual at that position.
    ///
    /// Degenerate systems fall back gracefully: a rank-0 `AtA` places the
    /// vertex at the mass point, and an empty accumulator places it at the
    /// region's center.
    pub fn solve(&self, region: &Region) -> (Vector3<f32>, f64) {
        if self.mass_point.w == 0.0 {
            return (region.center(), 0.0);
        }
        let center = self.mass_point.xyz() / self.mass_point.w;
        let atb = self.atb - self.ata * center;

        let es = nalgebra::SymmetricEigen::new(self.ata);
        let cutoff = Self::cutoff(&es.eigenvalues);

        // Sort eigenvalues by descending magnitude, tracking their columns
        let mut order = [0, 1, 2];
        order.sort_by_key(|&i| {
            std::cmp::Reverse(OrderedFloat(es.eigenvalues[i].abs()))
        });

        let mut rank = 0;
        let mut pinv = Matrix3::zeros();
        for &i in &order {
            let e = es.eigenvalues[i];
            if e.abs() < cutoff {
                break;
            }
            let v = es.eigenvectors.column(i);
            pinv += v * v.transpose() / e;
            rank += 1;
        }
        self.rank.store(rank, Ordering::Relaxed);

        let sol = center + pinv * atb;
        let sol = if sol.iter().all(|c| c.is_finite()) {
            sol
        } else {
            center
        };
        let pos = region.clamp(sol.cast::<f32>());
        (pos, self.eval(pos))
    }
}

////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;

    fn region() -> Region {
        Region::symmetric(1.0)
    }

    #[test]
    fn test_planar() {
        // Three samples on the plane z = 0.25
        let mut q = Qef::new();
        let n = Vector3::new(0.0, 0.0, 1.0);
        for (x, y) in [(0.0, 0.0), (0.5, 0.0), (0.0, 0.5)] {
            q.push(Vector3::new(x, y, 0.25), n, 0.0);
        }
        assert_eq!(q.rank(), 1);
        let (pos, err) = q.solve(&region());
        assert_relative_eq!(pos.z, 0.25, epsilon = 1e-5);
        // The in-plane position is the mass point
        assert_relative_eq!(pos.x, 0.5 / 3.0, epsilon = 1e-5);
        assert_relative_eq!(pos.y, 0.5 / 3.0, epsilon = 1e-5);
        assert!(err < 1e-10);
    }

    #[test]
    fn test_corner() {
        // Three orthogonal planes meeting at (0.5, 0.25, -0.25)
        let mut q = Qef::new();
        q.push(
            Vector3::new(0.5, 0.0, 0.0),
            Vector3::new(1.0, 0.0, 0.0),
            0.0,
        );
        q.push(
            Vector3::new(0.0, 0.25, 0.0),
            Vector3::new(0.0, 1.0, 0.0),
            0.0,
        );
        q.push(
            Vector3::new(0.0, 0.0, -0.25),
            Vector3::new(0.0, 0.0, 1.0),
            0.0,
        );
        assert_eq!(q.rank(), 3);
        let (pos, err) = q.solve(&region());
        assert_relative_eq!(
            pos,
            Vector3::new(0.5, 0.25, -0.25),
            epsilon = 1e-5
        );
        assert!(err < 1e-10);
    }

    #[test]
    fn test_edge() {
        // Two planes meeting along the line x = 0.5, y = 0.5
        let mut q = Qef::new();
        q.push(
            Vector3::new(0.5, 0.0, -0.5),
            Vector3::new(1.0, 0.0, 0.0),
            0.0,
        );
        q.push(
            Vector3::new(0.0, 0.5, 0.5),
            Vector3::new(0.0, 1.0, 0.0),
            0.0,
        );
        assert_eq!(q.rank(), 2);
        let (pos, _) = q.solve(&region());
        assert_relative_eq!(pos.x, 0.5, epsilon = 1e-5);
        assert_relative_eq!(pos.y, 0.5, epsilon = 1e-5);
        // The position along the edge comes from the mass point
        assert_relative_eq!(pos.z, 0.0, epsilon = 1e-5);
    }

    #[test]
    fn test_degenerate() {
        // Samples with zero gradients are dropped from the system but
        // still contribute to the mass point
        let mut q = Qef::new();
        q.push(Vector3::new(0.5, 0.0, 0.0), Vector3::zeros(), 0.0);
        q.push(Vector3::new(0.0, 0.5, 0.0), Vector3::zeros(), 0.0);
        assert_eq!(q.rank(), 0);
        let (pos, _) = q.solve(&region());
        assert_relative_eq!(pos, Vector3::new(0.25, 0.25, 0.0));

        // An empty accumulator falls back to the region center
        let q = Qef::new();
        let (pos, err) = q.solve(&region());
        assert_eq!(pos, region().center());
        assert_eq!(err, 0.0);
    }

    #[test]
    fn test_clamp() {
        // A vertex solving outside the region is clamped into it
        let mut q = Qef::new();
        let n = Vector3::new(0.0, 0.0, 1.0);
        q.push(Vector3::new(0.0, 0.0, 1.5), n, 0.0);
        q.push(Vector3::new(0.5, 0.5, 1.5), n, 0.0);
        let (pos, _) = q.solve(&region());
        assert!(region().contains(pos));
        assert_relative_eq!(pos.z, 1.0);
    }

    #[test]
    fn test_value_offset() {
        // A sample with a nonzero field value shifts its plane along the
        // normal: n.x = v places the surface at x = v
        let mut q = Qef::new();
        q.push(
            Vector3::new(0.5, 0.0, 0.0),
            Vector3::new(1.0, 0.0, 0.0),
            0.25,
        );
        let (pos, _) = q.solve(&region());
        assert_relative_eq!(pos.x, 0.25, epsilon = 1e-5);
    }

    #[test]
    fn test_merge() {
        let mut a = Qef::new();
        a.push(
            Vector3::new(0.5, 0.0, 0.0),
            Vector3::new(1.0, 0.0, 0.0),
            0.0,
        );
        let mut b = Qef::new();
        b.push(
            Vector3::new(0.0, 0.5, 0.0),
            Vector3::new(0.0, 1.0, 0.0),
            0.0,
        );
        a += &b;
        assert_eq!(a.mass_point().w, 2.0);
        assert_eq!(a.rank(), 2);
    }
}
