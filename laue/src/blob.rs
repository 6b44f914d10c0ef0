//! Weighted moments of a pixel blob, for centroid and covariance refits.

use nalgebra::{Matrix3, Vector3};

/// Accumulates zeroth, first, and second weighted moments of a cloud of
/// voxels, yielding the centre of mass and the covariance of the blob.
#[derive(Clone, Debug, Default)]
pub struct Blob3D {
    mass: f64,
    first: Vector3<f64>,
    second: Matrix3<f64>,
    npoints: usize,
}

impl Blob3D {
    /// Empty blob.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a voxel with the given weight.
    pub fn add_point(&mut self, px: f64, py: f64, frame: f64, weight: f64) {
        let p = Vector3::new(px, py, frame);
        self.mass += weight;
        self.first += weight * p;
        self.second += weight * p * p.transpose();
        self.npoints += 1;
    }

    /// Number of voxels accumulated.
    #[must_use]
    pub const fn npoints(&self) -> usize {
        self.npoints
    }

    /// Whether enough mass was collected for the moments to make sense.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.npoints >= 5 && self.mass > 0.0
    }

    /// Weighted centre of mass.
    #[must_use]
    pub fn center(&self) -> Vector3<f64> {
        self.first / self.mass
    }

    /// Weighted covariance of the blob.
    #[must_use]
    pub fn covariance(&self) -> Matrix3<f64> {
        let c = self.center();
        self.second / self.mass - c * c.transpose()
    }
}
