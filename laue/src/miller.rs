//! Miller indices with their indexing residual.

use nalgebra::{RowVector3, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Integer Miller index `(h, k, l)` plus the residual left over when the
/// raw fractional index was rounded.
///
/// A reflection counts as *indexed* when every component of the residual is
/// below the cell's indexing tolerance.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct MillerIndex {
    hkl: [i32; 3],
    residual: [f64; 3],
}

impl MillerIndex {
    /// Construct from integer components with zero residual.
    #[must_use]
    pub const fn new(h: i32, k: i32, l: i32) -> Self {
        Self {
            hkl: [h, k, l],
            residual: [0.0; 3],
        }
    }

    /// Round a raw fractional index, keeping the rounding error.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_raw(raw: RowVector3<f64>) -> Self {
        let rounded = [raw[0].round(), raw[1].round(), raw[2].round()];
        Self {
            hkl: [rounded[0] as i32, rounded[1] as i32, rounded[2] as i32],
            residual: [raw[0] - rounded[0], raw[1] - rounded[1], raw[2] - rounded[2]],
        }
    }

    /// h component.
    #[must_use]
    pub const fn h(&self) -> i32 {
        self.hkl[0]
    }

    /// k component.
    #[must_use]
    pub const fn k(&self) -> i32 {
        self.hkl[1]
    }

    /// l component.
    #[must_use]
    pub const fn l(&self) -> i32 {
        self.hkl[2]
    }

    /// The integer triple as a row vector.
    #[must_use]
    pub fn row_vector(&self) -> RowVector3<i32> {
        RowVector3::new(self.hkl[0], self.hkl[1], self.hkl[2])
    }

    /// The integer triple as floats.
    #[must_use]
    pub fn row_vector_f64(&self) -> RowVector3<f64> {
        RowVector3::new(
            f64::from(self.hkl[0]),
            f64::from(self.hkl[1]),
            f64::from(self.hkl[2]),
        )
    }

    /// The rounding residual.
    #[must_use]
    pub fn residual(&self) -> Vector3<f64> {
        Vector3::new(self.residual[0], self.residual[1], self.residual[2])
    }

    /// Whether the raw index was integral to within `tolerance` in every
    /// component.
    #[must_use]
    pub fn indexed(&self, tolerance: f64) -> bool {
        self.residual.iter().all(|r| r.abs() < tolerance)
    }

    /// Whether this is the null index `(0, 0, 0)`.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.hkl == [0, 0, 0]
    }
}

impl PartialOrd for MillerIndex {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.hkl.cmp(&other.hkl))
    }
}

impl fmt::Display for MillerIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({} {} {})", self.hkl[0], self.hkl[1], self.hkl[2])
    }
}
