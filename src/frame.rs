//! Right-handed frames of the cube axes
//!
//! The dual walk's face and edge procedures are written once and
//! instantiated for each axis permutation; the frame types give that
//! instantiation a name and a way to rotate (`Frame::Next`) when a face
//! procedure hands work to the edge procedures of the other two axes.
use crate::types::{Axis, X, Y, Z};

/// A right-handed permutation of the coordinate axes
///
/// Only the primary axis is stored; the other two follow from the
/// X → Y → Z → X rotation, which keeps every frame right-handed.
pub trait Frame {
    /// Next frame, i.e. a left rotation of this one
    type Next: Frame;

    /// The frame's primary axis
    const T: Axis;

    /// Returns the frame as a `(t, u, v)` axis triple
    fn frame() -> (Axis, Axis, Axis) {
        let t = Self::T;
        let u = t.next();
        (t, u, u.next())
    }
}

/// The X-Y-Z coordinate frame
#[allow(clippy::upper_case_acronyms)]
pub struct XYZ;

/// The Y-Z-X coordinate frame
#[allow(clippy::upper_case_acronyms)]
pub struct YZX;

/// The Z-X-Y coordinate frame
#[allow(clippy::upper_case_acronyms)]
pub struct ZXY;

impl Frame for XYZ {
    type Next = YZX;
    const T: Axis = X;
}

impl Frame for YZX {
    type Next = ZXY;
    const T: Axis = Y;
}

impl Frame for ZXY {
    type Next = XYZ;
    const T: Axis = Z;
}

////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_rotation() {
        assert_eq!(XYZ::frame(), (X, Y, Z));
        assert_eq!(YZX::frame(), (Y, Z, X));
        assert_eq!(ZXY::frame(), (Z, X, Y));
        // Three left rotations are the identity
        type Once = <XYZ as Frame>::Next;
        type Twice = <Once as Frame>::Next;
        type Thrice = <Twice as Frame>::Next;
        assert_eq!(Thrice::frame(), XYZ::frame());
    }
}
