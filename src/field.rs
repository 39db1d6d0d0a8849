//! A minimal expression-tree field, used as the reference [`Evaluator`]
//!
//! This is deliberately small: enough operations to express the usual CSG
//! test shapes (spheres, cuboids, unions, intersections), with interval
//! evaluation and min/max-driven tape pruning so that the octree builder's
//! tape-refinement path is exercised for real.  Production callers are
//! expected to bring their own evaluator.
use crate::{
    eval::{Evaluator, Grad, MAX_BATCH},
    interval::{Choice, Interval},
    region::Region,
    types::{X, Y, Z},
};
use nalgebra::Vector3;
use std::sync::Arc;

/// One node of a field expression
///
/// The interior of the shape is where the field is negative.
#[derive(Debug)]
pub enum Field {
    /// X coordinate of the sample position
    X,
    /// Y coordinate of the sample position
    Y,
    /// Z coordinate of the sample position
    Z,
    Const(f32),
    Add(Arc<Field>, Arc<Field>),
    Sub(Arc<Field>, Arc<Field>),
    Mul(Arc<Field>, Arc<Field>),
    Neg(Arc<Field>),
    Abs(Arc<Field>),
    Square(Arc<Field>),
    Sqrt(Arc<Field>),
    Min(Arc<Field>, Arc<Field>),
    Max(Arc<Field>, Arc<Field>),
}

impl Field {
    /// Evaluates the field at a single position
    pub fn value(&self, p: Vector3<f32>) -> f32 {
        match self {
            Field::X => p.x,
            Field::Y => p.y,
            Field::Z => p.z,
            Field::Const(c) => *c,
            Field::Add(a, b) => a.value(p) + b.value(p),
            Field::Sub(a, b) => a.value(p) - b.value(p),
            Field::Mul(a, b) => a.value(p) * b.value(p),
            Field::Neg(a) => -a.value(p),
            Field::Abs(a) => a.value(p).abs(),
            Field::Square(a) => {
                let v = a.value(p);
                v * v
            }
            Field::Sqrt(a) => a.value(p).sqrt(),
            Field::Min(a, b) => a.value(p).min(b.value(p)),
            Field::Max(a, b) => a.value(p).max(b.value(p)),
        }
    }

    /// Evaluates the field and its gradient via forward-mode differentiation
    pub fn grad(&self, p: Vector3<f32>) -> Grad {
        match self {
            Field::X => Grad::new(p.x, 1.0, 0.0, 0.0),
            Field::Y => Grad::new(p.y, 0.0, 1.0, 0.0),
            Field::Z => Grad::new(p.z, 0.0, 0.0, 1.0),
            Field::Const(c) => Grad::new(*c, 0.0, 0.0, 0.0),
            Field::Add(a, b) => {
                let (a, b) = (a.grad(p), b.grad(p));
                Grad::new(a.v + b.v, a.dx + b.dx, a.dy + b.dy, a.dz + b.dz)
            }
            Field::Sub(a, b) => {
                let (a, b) = (a.grad(p), b.grad(p));
                Grad::new(a.v - b.v, a.dx - b.dx, a.dy - b.dy, a.dz - b.dz)
            }
            Field::Mul(a, b) => {
                let (a, b) = (a.grad(p), b.grad(p));
                Grad::new(
                    a.v * b.v,
                    a.v * b.dx + b.v * a.dx,
                    a.v * b.dy + b.v * a.dy,
                    a.v * b.dz + b.v * a.dz,
                )
            }
            Field::Neg(a) => {
                let a = a.grad(p);
                Grad::new(-a.v, -a.dx, -a.dy, -a.dz)
            }
            Field::Abs(a) => {
                let a = a.grad(p);
                if a.v < 0.0 {
                    Grad::new(-a.v, -a.dx, -a.dy, -a.dz)
                } else {
                    a
                }
            }
            Field::Square(a) => {
                let a = a.grad(p);
                Grad::new(
                    a.v * a.v,
                    2.0 * a.v * a.dx,
                    2.0 * a.v * a.dy,
                    2.0 * a.v * a.dz,
                )
            }
            Field::Sqrt(a) => {
                let a = a.grad(p);
                let v = a.v.sqrt();
                Grad::new(v, a.dx / (2.0 * v), a.dy / (2.0 * v), a.dz / (2.0 * v))
            }
            Field::Min(a, b) => {
                let (a, b) = (a.grad(p), b.grad(p));
                if a.v <= b.v {
                    a
                } else {
                    b
                }
            }
            Field::Max(a, b) => {
                let (a, b) = (a.grad(p), b.grad(p));
                if a.v >= b.v {
                    a
                } else {
                    b
                }
            }
        }
    }

    /// Bounds the field over a box, rebuilding a pruned copy of the tree
    ///
    /// When a `min` or `max` resolves to one side over the whole box, the
    /// other side is dropped from the returned tree.  If nothing could be
    /// pruned, the returned tree is the input (pointer-equal).
    pub fn prune(
        self: &Arc<Self>,
        x: Interval,
        y: Interval,
        z: Interval,
    ) -> (Interval, Arc<Field>) {
        // Helper to rebuild a binary node only if a child actually changed
        fn rebuild(
            orig: &Arc<Field>,
            a: &Arc<Field>,
            b: &Arc<Field>,
            pa: Arc<Field>,
            pb: Arc<Field>,
            f: impl Fn(Arc<Field>, Arc<Field>) -> Field,
        ) -> Arc<Field> {
            if Arc::ptr_eq(a, &pa) && Arc::ptr_eq(b, &pb) {
                orig.clone()
            } else {
                Arc::new(f(pa, pb))
            }
        }
        fn rebuild1(
            orig: &Arc<Field>,
            a: &Arc<Field>,
            pa: Arc<Field>,
            f: impl Fn(Arc<Field>) -> Field,
        ) -> Arc<Field> {
            if Arc::ptr_eq(a, &pa) {
                orig.clone()
            } else {
                Arc::new(f(pa))
            }
        }

        match &**self {
            Field::X => (x, self.clone()),
            Field::Y => (y, self.clone()),
            Field::Z => (z, self.clone()),
            Field::Const(c) => ((*c).into(), self.clone()),
            Field::Add(a, b) => {
                let (ia, pa) = a.prune(x, y, z);
                let (ib, pb) = b.prune(x, y, z);
                (ia + ib, rebuild(self, a, b, pa, pb, Field::Add))
            }
            Field::Sub(a, b) => {
                let (ia, pa) = a.prune(x, y, z);
                let (ib, pb) = b.prune(x, y, z);
                (ia - ib, rebuild(self, a, b, pa, pb, Field::Sub))
            }
            Field::Mul(a, b) => {
                let (ia, pa) = a.prune(x, y, z);
                let (ib, pb) = b.prune(x, y, z);
                (ia * ib, rebuild(self, a, b, pa, pb, Field::Mul))
            }
            Field::Neg(a) => {
                let (ia, pa) = a.prune(x, y, z);
                (-ia, rebuild1(self, a, pa, Field::Neg))
            }
            Field::Abs(a) => {
                let (ia, pa) = a.prune(x, y, z);
                (ia.abs(), rebuild1(self, a, pa, Field::Abs))
            }
            Field::Square(a) => {
                let (ia, pa) = a.prune(x, y, z);
                (ia.square(), rebuild1(self, a, pa, Field::Square))
            }
            Field::Sqrt(a) => {
                let (ia, pa) = a.prune(x, y, z);
                (ia.sqrt(), rebuild1(self, a, pa, Field::Sqrt))
            }
            Field::Min(a, b) => {
                let (ia, pa) = a.prune(x, y, z);
                let (ib, pb) = b.prune(x, y, z);
                let (i, choice) = ia.min_choice(ib);
                match choice {
                    Choice::Left => (i, pa),
                    Choice::Right => (i, pb),
                    Choice::Both => {
                        (i, rebuild(self, a, b, pa, pb, Field::Min))
                    }
                }
            }
            Field::Max(a, b) => {
                let (ia, pa) = a.prune(x, y, z);
                let (ib, pb) = b.prune(x, y, z);
                let (i, choice) = ia.max_choice(ib);
                match choice {
                    Choice::Left => (i, pa),
                    Choice::Right => (i, pb),
                    Choice::Both => {
                        (i, rebuild(self, a, b, pa, pb, Field::Max))
                    }
                }
            }
        }
    }

    /// Counts the nodes in this tree
    pub fn size(&self) -> usize {
        match self {
            Field::X | Field::Y | Field::Z | Field::Const(_) => 1,
            Field::Add(a, b)
            | Field::Sub(a, b)
            | Field::Mul(a, b)
            | Field::Min(a, b)
            | Field::Max(a, b) => 1 + a.size() + b.size(),
            Field::Neg(a)
            | Field::Abs(a)
            | Field::Square(a)
            | Field::Sqrt(a) => 1 + a.size(),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////

/// A handle to a field expression, with operator overloading
///
/// ```
/// # use isomesh::field::Tree;
/// let sphere = (Tree::x().square() + Tree::y().square()
///     + Tree::z().square()).sqrt() - 0.5;
/// ```
#[derive(Clone, Debug)]
pub struct Tree(Arc<Field>);

impl Tree {
    pub fn x() -> Self {
        Tree(Arc::new(Field::X))
    }
    pub fn y() -> Self {
        Tree(Arc::new(Field::Y))
    }
    pub fn z() -> Self {
        Tree(Arc::new(Field::Z))
    }
    pub fn constant(v: f32) -> Self {
        Tree(Arc::new(Field::Const(v)))
    }
    pub fn square(&self) -> Self {
        Tree(Arc::new(Field::Square(self.0.clone())))
    }
    pub fn sqrt(&self) -> Self {
        Tree(Arc::new(Field::Sqrt(self.0.clone())))
    }
    pub fn abs(&self) -> Self {
        Tree(Arc::new(Field::Abs(self.0.clone())))
    }
    pub fn min(&self, other: Tree) -> Self {
        Tree(Arc::new(Field::Min(self.0.clone(), other.0)))
    }
    pub fn max(&self, other: Tree) -> Self {
        Tree(Arc::new(Field::Max(self.0.clone(), other.0)))
    }

    /// Returns the underlying field expression
    pub fn field(&self) -> &Arc<Field> {
        &self.0
    }

    /// Builds a batch evaluator for this field
    pub fn evaluator(&self) -> FieldEval {
        FieldEval {
            root: self.0.clone(),
            vals: Vec::with_capacity(MAX_BATCH),
            grads: Vec::with_capacity(MAX_BATCH),
        }
    }
}

macro_rules! impl_binary {
    ($trait:ident, $fn:ident, $variant:ident) => {
        impl std::ops::$trait<Tree> for Tree {
            type Output = Tree;
            fn $fn(self, rhs: Tree) -> Tree {
                Tree(Arc::new(Field::$variant(self.0, rhs.0)))
            }
        }
        impl std::ops::$trait<f32> for Tree {
            type Output = Tree;
            fn $fn(self, rhs: f32) -> Tree {
                Tree(Arc::new(Field::$variant(
                    self.0,
                    Arc::new(Field::Const(rhs)),
                )))
            }
        }
        impl std::ops::$trait<Tree> for f32 {
            type Output = Tree;
            fn $fn(self, rhs: Tree) -> Tree {
                Tree(Arc::new(Field::$variant(
                    Arc::new(Field::Const(self)),
                    rhs.0,
                )))
            }
        }
    };
}
impl_binary!(Add, add, Add);
impl_binary!(Sub, sub, Sub);
impl_binary!(Mul, mul, Mul);

impl std::ops::Neg for Tree {
    type Output = Tree;
    fn neg(self) -> Tree {
        Tree(Arc::new(Field::Neg(self.0)))
    }
}

/// A sphere centered at `center` with the given radius
pub fn sphere(center: [f32; 3], radius: f32) -> Tree {
    ((Tree::x() - center[0]).square()
        + (Tree::y() - center[1]).square()
        + (Tree::z() - center[2]).square())
    .sqrt()
        - radius
}

/// An axis-aligned cuboid spanning `[lower, upper]`
pub fn cuboid(lower: [f32; 3], upper: [f32; 3]) -> Tree {
    let planes = |t: Tree, lo: f32, hi: f32| (lo - t.clone()).max(t - hi);
    let x = planes(Tree::x(), lower[0], upper[0]);
    let y = planes(Tree::y(), lower[1], upper[1]);
    let z = planes(Tree::z(), lower[2], upper[2]);
    x.max(y).max(z)
}

////////////////////////////////////////////////////////////////////////////////

/// Reference implementation of [`Evaluator`] on top of [`Field`]
pub struct FieldEval {
    root: Arc<Field>,
    vals: Vec<f32>,
    grads: Vec<Grad>,
}

impl Evaluator for FieldEval {
    type Tape = Field;

    fn tape(&self) -> Arc<Field> {
        self.root.clone()
    }

    fn interval(
        &mut self,
        region: &Region,
        tape: &Arc<Field>,
    ) -> (Interval, Option<Arc<Field>>) {
        let (i, pruned) =
            tape.prune(region.axis(X), region.axis(Y), region.axis(Z));
        let refined = if Arc::ptr_eq(&pruned, tape) {
            None
        } else {
            Some(pruned)
        };
        (i, refined)
    }

    fn values(&mut self, points: &[Vector3<f32>], tape: &Field) -> &[f32] {
        debug_assert!(points.len() <= MAX_BATCH);
        self.vals.clear();
        self.vals.extend(points.iter().map(|&p| tape.value(p)));
        &self.vals
    }

    fn grads(&mut self, points: &[Vector3<f32>], tape: &Field) -> &[Grad] {
        debug_assert!(points.len() <= MAX_BATCH);
        self.grads.clear();
        self.grads.extend(points.iter().map(|&p| tape.grad(p)));
        &self.grads
    }

    fn fork(&self) -> Self {
        FieldEval {
            root: self.root.clone(),
            vals: Vec::with_capacity(MAX_BATCH),
            grads: Vec::with_capacity(MAX_BATCH),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
