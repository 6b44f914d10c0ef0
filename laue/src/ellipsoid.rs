//! Ellipsoidal peak shapes and axis-aligned boxes.

use nalgebra::{Matrix3, Matrix4, RowVector3, Vector3};

/// Axis-aligned bounding box in detector coordinates (column, row, frame).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    /// Lower corner.
    pub lower: Vector3<f64>,
    /// Upper corner.
    pub upper: Vector3<f64>,
}

impl Aabb {
    /// Construct from two corners. Panics if the box is inverted.
    #[must_use]
    pub fn new(lower: Vector3<f64>, upper: Vector3<f64>) -> Self {
        assert!(
            (0..3).all(|i| lower[i] <= upper[i]),
            "inverted bounding box: {lower:?} > {upper:?}"
        );
        Self { lower, upper }
    }

    /// Whether the point lies inside the closed box.
    #[must_use]
    pub fn contains(&self, p: &Vector3<f64>) -> bool {
        (0..3).all(|i| self.lower[i] <= p[i] && p[i] <= self.upper[i])
    }

    /// Whether two boxes overlap.
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        (0..3).all(|i| self.lower[i] <= other.upper[i] && other.lower[i] <= self.upper[i])
    }

    /// Centre of the box.
    #[must_use]
    pub fn center(&self) -> Vector3<f64> {
        0.5 * (self.lower + self.upper)
    }
}

/// A 3D ellipsoid `{x : (x-c)^T A (x-c) <= 1}` with symmetric
/// positive-definite metric `A`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Ellipsoid {
    center: Vector3<f64>,
    metric: Matrix3<f64>,
}

impl Ellipsoid {
    /// Construct from a centre and metric. The metric is symmetrised; its
    /// eigenvalues must be strictly positive for the shape to be usable,
    /// which callers check through [`Self::is_positive_definite`].
    #[must_use]
    pub fn new(center: Vector3<f64>, metric: Matrix3<f64>) -> Self {
        let metric = 0.5 * (metric + metric.transpose());
        Self { center, metric }
    }

    /// Build a spherical shape of the given radius.
    #[must_use]
    pub fn sphere(center: Vector3<f64>, radius: f64) -> Self {
        Self::new(center, Matrix3::identity() / (radius * radius))
    }

    /// Centre of the ellipsoid.
    #[must_use]
    pub const fn center(&self) -> Vector3<f64> {
        self.center
    }

    /// Move the centre, keeping the metric.
    pub fn set_center(&mut self, center: Vector3<f64>) {
        self.center = center;
    }

    /// The inverse covariance matrix defining the shape.
    #[must_use]
    pub const fn metric(&self) -> Matrix3<f64> {
        self.metric
    }

    /// The covariance matrix of the shape. Panics if the metric is singular.
    #[must_use]
    pub fn inverse_metric(&self) -> Matrix3<f64> {
        self.metric.try_inverse().expect("singular ellipsoid metric")
    }

    /// Whether all metric eigenvalues are strictly positive.
    #[must_use]
    pub fn is_positive_definite(&self) -> bool {
        self.metric.symmetric_eigenvalues().iter().all(|&w| w > 0.0)
    }

    /// Squared Mahalanobis distance of a point from the centre.
    #[must_use]
    pub fn r2(&self, p: &Vector3<f64>) -> f64 {
        let dx = p - self.center;
        dx.dot(&(self.metric * dx))
    }

    /// Whether the point lies inside the ellipsoid.
    #[must_use]
    pub fn is_inside(&self, p: &Vector3<f64>) -> bool {
        self.r2(p) <= 1.0
    }

    /// Scale the shape by a factor along every principal axis.
    pub fn scale(&mut self, factor: f64) {
        self.metric /= factor * factor;
    }

    /// A copy scaled by the given factor.
    #[must_use]
    pub fn scaled(&self, factor: f64) -> Self {
        let mut e = *self;
        e.scale(factor);
        e
    }

    /// Tight axis-aligned bounding box of the shape scaled by `factor`.
    #[must_use]
    pub fn aabb(&self, factor: f64) -> Aabb {
        let cov = self.inverse_metric();
        let half = Vector3::new(cov[(0, 0)].sqrt(), cov[(1, 1)].sqrt(), cov[(2, 2)].sqrt());
        Aabb::new(self.center - factor * half, self.center + factor * half)
    }

    /// Homogeneous 4x4 form `Q` with interior `x^T Q x < 0`.
    fn homogeneous(&self) -> Matrix4<f64> {
        let ac = self.metric * self.center;
        let mut q = Matrix4::zeros();
        q.fixed_view_mut::<3, 3>(0, 0).copy_from(&self.metric);
        q.fixed_view_mut::<3, 1>(0, 3).copy_from(&(-ac));
        q.fixed_view_mut::<1, 3>(3, 0)
            .copy_from(&RowVector3::new(-ac[0], -ac[1], -ac[2]));
        q[(3, 3)] = self.center.dot(&ac) - 1.0;
        q
    }

    /// Whether two solid ellipsoids intersect (Alfano & Greer criterion:
    /// the pencil `A^-1 B` has two distinct negative real eigenvalues
    /// exactly when the shapes are separated).
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        let Some(inv) = self.homogeneous().try_inverse() else {
            return false;
        };
        let eigenvalues = (inv * other.homogeneous()).complex_eigenvalues();

        let mut negative: Vec<f64> = eigenvalues
            .iter()
            .filter(|w| w.im.abs() < 1e-10 && w.re < 0.0)
            .map(|w| w.re)
            .collect();
        negative.sort_by(|a, b| a.partial_cmp(b).expect("NaN eigenvalue"));
        let separated = negative.windows(2).any(|w| (w[1] - w[0]).abs() > 1e-10);
        !separated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    #[test]
    fn sphere_basics() {
        let e = Ellipsoid::sphere(Vector3::new(1.0, 2.0, 3.0), 2.0);
        assert!(e.is_positive_definite());
        assert!(e.is_inside(&Vector3::new(2.5, 2.0, 3.0)));
        assert!(!e.is_inside(&Vector3::new(3.5, 2.0, 3.0)));
        assert_approx_eq!(f64, e.r2(&Vector3::new(3.0, 2.0, 3.0)), 1.0);
    }

    #[test]
    fn scaling_scales_the_boundary() {
        let mut e = Ellipsoid::sphere(Vector3::zeros(), 1.0);
        e.scale(3.0);
        assert!(e.is_inside(&Vector3::new(2.9, 0.0, 0.0)));
        assert!(!e.is_inside(&Vector3::new(3.1, 0.0, 0.0)));
    }

    #[test]
    fn aabb_covers_the_shape() {
        let e = Ellipsoid::sphere(Vector3::new(5.0, 5.0, 5.0), 1.5);
        let bb = e.aabb(2.0);
        assert_approx_eq!(f64, bb.lower[0], 2.0);
        assert_approx_eq!(f64, bb.upper[2], 8.0);
        assert!(bb.contains(&Vector3::new(5.0, 5.0, 5.0)));
    }

    #[test]
    fn disjoint_spheres_do_not_intersect() {
        let a = Ellipsoid::sphere(Vector3::zeros(), 1.0);
        let b = Ellipsoid::sphere(Vector3::new(3.0, 0.0, 0.0), 1.0);
        assert!(!a.intersects(&b));
    }

    #[test]
    fn overlapping_spheres_intersect() {
        let a = Ellipsoid::sphere(Vector3::zeros(), 1.0);
        let b = Ellipsoid::sphere(Vector3::new(1.0, 0.0, 0.0), 1.0);
        assert!(a.intersects(&b));
        assert!(a.intersects(&a));
    }

    #[test]
    fn anisotropic_intersection() {
        // long needle along x against a sphere off to the side
        let metric = Matrix3::from_diagonal(&Vector3::new(0.01, 1.0, 1.0));
        let needle = Ellipsoid::new(Vector3::zeros(), metric);
        let near = Ellipsoid::sphere(Vector3::new(9.0, 0.0, 0.0), 1.5);
        let far = Ellipsoid::sphere(Vector3::new(0.0, 9.0, 0.0), 1.5);
        assert!(needle.intersects(&near));
        assert!(!needle.intersects(&far));
    }
}
