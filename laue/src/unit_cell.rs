//! Crystallographic unit cell: bases, reduction, constraints, indexing.

use crate::error::{Error, Result};
use crate::fit::FitParameters;
use crate::gruber::{self, NiggliCharacter};
use crate::miller::MillerIndex;
use crate::niggli;
use crate::space_group::SpaceGroup;
use nalgebra::{DMatrix, DVector, Matrix3, Rotation3, RowVector3, Vector3, Vector6};
use std::fmt;

/// Default indexing tolerance on the Miller residual.
pub const DEFAULT_INDEXING_TOLERANCE: f64 = 0.2;

/// Scalar lattice character: metric components and the derived cell
/// parameters (lengths in angstrom, angles in radians).
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CellCharacter {
    /// `a . a`
    pub big_a: f64,
    /// `b . b`
    pub big_b: f64,
    /// `c . c`
    pub big_c: f64,
    /// `b . c`
    pub big_d: f64,
    /// `a . c`
    pub big_e: f64,
    /// `a . b`
    pub big_f: f64,
    /// `|a|`
    pub a: f64,
    /// `|b|`
    pub b: f64,
    /// `|c|`
    pub c: f64,
    /// angle between b and c
    pub alpha: f64,
    /// angle between a and c
    pub beta: f64,
    /// angle between a and b
    pub gamma: f64,
}

impl CellCharacter {
    /// Derive the character from a metric tensor.
    #[must_use]
    pub fn from_metric(g: &Matrix3<f64>) -> Self {
        let big_a = g[(0, 0)];
        let big_b = g[(1, 1)];
        let big_c = g[(2, 2)];
        let big_d = g[(1, 2)];
        let big_e = g[(0, 2)];
        let big_f = g[(0, 1)];
        let a = big_a.sqrt();
        let b = big_b.sqrt();
        let c = big_c.sqrt();
        Self {
            big_a,
            big_b,
            big_c,
            big_d,
            big_e,
            big_f,
            a,
            b,
            c,
            alpha: (big_d / (b * c)).clamp(-1.0, 1.0).acos(),
            beta: (big_e / (a * c)).clamp(-1.0, 1.0).acos(),
            gamma: (big_f / (a * b)).clamp(-1.0, 1.0).acos(),
        }
    }

    /// The metric components as a vector `(A, B, C, D, E, F)`.
    #[must_use]
    pub fn metric_parameters(&self) -> Vector6<f64> {
        Vector6::new(
            self.big_a, self.big_b, self.big_c, self.big_d, self.big_e, self.big_f,
        )
    }
}

/// A crystallographic unit cell.
///
/// Stores the real-space basis `A` (columns are the cell vectors), the
/// reciprocal basis `B = A^-1` (rows are the reciprocal vectors, so that
/// `q = hkl B` and `hkl_raw = q A`), the Niggli bookkeeping from the last
/// reduction, a space group, and the parameter covariance from refinement.
#[derive(Clone, Debug)]
pub struct UnitCell {
    a_mat: Matrix3<f64>,
    b_mat: Matrix3<f64>,
    /// `A * np^-1` is the Niggli cell.
    np: Matrix3<f64>,
    niggli: NiggliCharacter,
    space_group: SpaceGroup,
    name: String,
    indexing_tolerance: f64,
    covariance: Option<DMatrix<f64>>,
}

impl UnitCell {
    /// Build from a real-space basis with the cell vectors as columns.
    ///
    /// # Errors
    ///
    /// [`Error::Numerical`] when the basis is left-handed or singular.
    pub fn from_basis(basis: Matrix3<f64>) -> Result<Self> {
        if basis.determinant() <= 0.0 {
            return Err(Error::Numerical(
                "unit cell basis must be right-handed and non-singular".into(),
            ));
        }
        let b_mat = basis
            .try_inverse()
            .ok_or_else(|| Error::Numerical("singular unit cell basis".into()))?;
        Ok(Self {
            a_mat: basis,
            b_mat,
            np: Matrix3::identity(),
            niggli: NiggliCharacter::default(),
            space_group: SpaceGroup::new("P 1").expect("P 1 is tabulated"),
            name: String::new(),
            indexing_tolerance: DEFAULT_INDEXING_TOLERANCE,
            covariance: None,
        })
    }

    /// Build from a reciprocal basis (rows are reciprocal vectors).
    ///
    /// # Errors
    ///
    /// See [`Self::from_basis`].
    pub fn from_reciprocal_basis(reciprocal: Matrix3<f64>) -> Result<Self> {
        let basis = reciprocal
            .try_inverse()
            .ok_or_else(|| Error::Numerical("singular reciprocal basis".into()))?;
        Self::from_basis(basis)
    }

    /// Build from cell parameters, `a` along x and `b` in the x-y plane.
    /// Angles in radians.
    ///
    /// # Errors
    ///
    /// See [`Self::from_basis`].
    pub fn from_parameters(
        a: f64,
        b: f64,
        c: f64,
        alpha: f64,
        beta: f64,
        gamma: f64,
    ) -> Result<Self> {
        let cx = c * beta.cos();
        let cy = c * (alpha.cos() - beta.cos() * gamma.cos()) / gamma.sin();
        let cz = (c * c - cx * cx - cy * cy).max(0.0).sqrt();
        let basis = Matrix3::new(
            a,
            b * gamma.cos(),
            cx,
            0.0,
            b * gamma.sin(),
            cy,
            0.0,
            0.0,
            cz,
        );
        Self::from_basis(basis)
    }

    /// Real-space basis, columns are the cell vectors.
    #[must_use]
    pub const fn basis(&self) -> Matrix3<f64> {
        self.a_mat
    }

    /// Reciprocal basis, rows are the reciprocal vectors.
    #[must_use]
    pub const fn reciprocal_basis(&self) -> Matrix3<f64> {
        self.b_mat
    }

    /// Replace the reciprocal basis (used by the indexer refinement).
    ///
    /// # Errors
    ///
    /// [`Error::Numerical`] on a singular matrix.
    pub fn set_reciprocal_basis(&mut self, reciprocal: Matrix3<f64>) -> Result<()> {
        let basis = reciprocal
            .try_inverse()
            .ok_or_else(|| Error::Numerical("singular reciprocal basis".into()))?;
        self.a_mat = basis;
        self.b_mat = reciprocal;
        Ok(())
    }

    /// Real-space metric tensor `A^T A`.
    #[must_use]
    pub fn metric(&self) -> Matrix3<f64> {
        self.a_mat.transpose() * self.a_mat
    }

    /// Reciprocal metric tensor `B B^T`.
    #[must_use]
    pub fn reciprocal_metric(&self) -> Matrix3<f64> {
        self.b_mat * self.b_mat.transpose()
    }

    /// Cell volume.
    #[must_use]
    pub fn volume(&self) -> f64 {
        self.a_mat.determinant()
    }

    /// Cell name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set the cell name.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// The space group of the cell.
    #[must_use]
    pub const fn space_group(&self) -> &SpaceGroup {
        &self.space_group
    }

    /// Set the space group from its symbol.
    ///
    /// # Errors
    ///
    /// [`Error::Domain`] for an unknown symbol.
    pub fn set_space_group(&mut self, symbol: &str) -> Result<()> {
        self.space_group = SpaceGroup::new(symbol)?;
        Ok(())
    }

    /// Indexing tolerance on the Miller residual.
    #[must_use]
    pub const fn indexing_tolerance(&self) -> f64 {
        self.indexing_tolerance
    }

    /// Set the indexing tolerance.
    pub fn set_indexing_tolerance(&mut self, tolerance: f64) {
        self.indexing_tolerance = tolerance;
    }

    /// The Niggli character recorded by the last [`Self::reduce`].
    #[must_use]
    pub const fn niggli_character(&self) -> &NiggliCharacter {
        &self.niggli
    }

    /// The transformation `P` with `A P^-1` the Niggli cell.
    #[must_use]
    pub const fn niggli_transformation(&self) -> Matrix3<f64> {
        self.np
    }

    /// The basis of the Niggli cell.
    #[must_use]
    pub fn niggli_basis(&self) -> Matrix3<f64> {
        self.a_mat * self.np.try_inverse().expect("unimodular Niggli transformation")
    }

    /// Scalar character of the cell.
    #[must_use]
    pub fn character(&self) -> CellCharacter {
        CellCharacter::from_metric(&self.metric())
    }

    /// Raw (fractional) Miller index of a q vector: `q A`.
    #[must_use]
    pub fn index(&self, q: &RowVector3<f64>) -> RowVector3<f64> {
        q * self.a_mat
    }

    /// Rounded Miller index of a q vector, with residual.
    #[must_use]
    pub fn miller_index(&self, q: &RowVector3<f64>) -> MillerIndex {
        MillerIndex::from_raw(self.index(q))
    }

    /// q vector of an integer reflection: `hkl B`.
    #[must_use]
    pub fn q_vector(&self, hkl: &MillerIndex) -> RowVector3<f64> {
        hkl.row_vector_f64() * self.b_mat
    }

    /// Bragg d spacing of a reflection.
    #[must_use]
    pub fn d(&self, hkl: &MillerIndex) -> f64 {
        1.0 / self.q_vector(hkl).norm()
    }

    /// Change of basis: `A <- A P`.
    pub fn transform(&mut self, p: &Matrix3<f64>) {
        self.a_mat *= p;
        self.b_mat = self.a_mat.try_inverse().expect("transformed basis stays invertible");
    }

    /// Reduce the cell: Niggli reduction followed, unless `niggli_only`,
    /// by the Gruber classification into one of the 44 lattice characters.
    /// The basis is rotated into the conventional setting when the
    /// character's transformation is unimodular; centred characters keep
    /// the Niggli basis. Returns the character number.
    ///
    /// # Errors
    ///
    /// [`Error::Numerical`] on a degenerate metric.
    pub fn reduce(
        &mut self,
        niggli_only: bool,
        niggli_tolerance: f64,
        gruber_tolerance: f64,
    ) -> Result<i32> {
        let reduction = niggli::reduce(&self.metric(), niggli_tolerance)?;
        self.transform(&reduction.transformation);
        self.np = Matrix3::identity();

        let character = gruber::classify(&self.metric(), gruber_tolerance);
        let number = character.number;
        if !niggli_only {
            if character.is_unimodular() {
                self.transform(&character.transformation);
                self.np = character.transformation;
            }
            self.niggli = character;
        }
        Ok(number)
    }

    /// Whether two cells describe the same lattice within `tolerance`:
    /// there are integer matrices `S`, `T` with `S T = 1`, `A1 ~ A0 T` and
    /// `A0 ~ A1 S` in Frobenius norm.
    #[must_use]
    pub fn equivalent(&self, other: &Self, tolerance: f64) -> bool {
        let Some(a0_inv) = self.a_mat.try_inverse() else {
            return false;
        };
        let Some(a1_inv) = other.a_mat.try_inverse() else {
            return false;
        };
        let t = (a0_inv * other.a_mat).map(f64::round);
        let s = (a1_inv * self.a_mat).map(f64::round);
        if ((s * t) - Matrix3::identity()).norm() > 1e-9 {
            return false;
        }
        (self.a_mat * t - other.a_mat).norm() < tolerance
            && (other.a_mat * s - self.a_mat).norm() < tolerance
    }

    /// Whether the cell parameters agree within a relative length
    /// tolerance and an absolute angle tolerance (radians).
    #[must_use]
    pub fn is_similar(&self, other: &Self, length_tolerance: f64, angle_tolerance: f64) -> bool {
        let c0 = self.character();
        let c1 = other.character();
        let len = |x: f64, y: f64| (x - y).abs() / x.max(y) < length_tolerance;
        let ang = |x: f64, y: f64| (x - y).abs() < angle_tolerance;
        len(c0.a, c1.a)
            && len(c0.b, c1.b)
            && len(c0.c, c1.c)
            && ang(c0.alpha, c1.alpha)
            && ang(c0.beta, c1.beta)
            && ang(c0.gamma, c1.gamma)
    }

    /// Orientation `Q` of the basis: `A = Q R` with `R` upper triangular
    /// and positive diagonal.
    #[must_use]
    pub fn orientation(&self) -> Matrix3<f64> {
        positive_qr(&self.a_mat).0
    }

    /// Orientation of the Niggli basis.
    #[must_use]
    pub fn niggli_orientation(&self) -> Matrix3<f64> {
        positive_qr(&self.niggli_basis()).0
    }

    /// Metric parameters `(A, B, C, D, E, F)` of the Niggli cell; this is
    /// the internal parameterisation used by the refiner.
    #[must_use]
    pub fn parameters(&self) -> Vector6<f64> {
        let niggli_basis = self.niggli_basis();
        CellCharacter::from_metric(&(niggli_basis.transpose() * niggli_basis)).metric_parameters()
    }

    /// Return a cell whose Niggli metric satisfies the character's linear
    /// constraints exactly, obtained by projecting the metric parameters
    /// with the constraint kernel and rebuilding through the Niggli
    /// orientation.
    ///
    /// # Errors
    ///
    /// [`Error::Numerical`] when the projected metric stops being positive
    /// definite.
    pub fn apply_niggli_constraints(&self) -> Result<Self> {
        let constraints = &self.niggli.constraints;
        if constraints.nrows() == 0 {
            return Ok(self.clone());
        }

        let mut params = FitParameters::new();
        for value in self.parameters().iter() {
            params.add(*value);
        }
        params.set_constraint(constraints)?;
        let free = params.write_free();
        params.set_free(&free);

        let snapped = Vector6::from_column_slice(params.values());
        self.from_niggli_parameters(&self.niggli_orientation(), &Vector3::zeros(), &snapped)
    }

    /// Rebuild a cell from a reference Niggli orientation `u0`, a rotation
    /// offset (Rodrigues vector), and Niggli metric parameters.
    ///
    /// # Errors
    ///
    /// [`Error::Numerical`] when the parameters do not form a positive
    /// definite metric.
    pub fn from_niggli_parameters(
        &self,
        u0: &Matrix3<f64>,
        u_offset: &Vector3<f64>,
        parameters: &Vector6<f64>,
    ) -> Result<Self> {
        let g = Matrix3::new(
            parameters[0],
            parameters[5],
            parameters[4],
            parameters[5],
            parameters[1],
            parameters[3],
            parameters[4],
            parameters[3],
            parameters[2],
        );
        let chol = nalgebra::Cholesky::new(g)
            .ok_or_else(|| Error::Numerical("cell parameters give a non-PD metric".into()))?;
        let r_upper = chol.l().transpose();

        let u = Rotation3::new(*u_offset).matrix() * u0;
        let niggli_basis = u * r_upper;
        let basis = niggli_basis * self.np;

        let mut cell = self.clone();
        cell.a_mat = basis;
        cell.b_mat = basis
            .try_inverse()
            .ok_or_else(|| Error::Numerical("rebuilt basis is singular".into()))?;
        Ok(cell)
    }

    /// Store the covariance of the six Niggli metric parameters.
    pub fn set_parameter_covariance(&mut self, covariance: DMatrix<f64>) {
        assert_eq!(covariance.nrows(), 6, "metric parameter covariance is 6x6");
        assert_eq!(covariance.ncols(), 6, "metric parameter covariance is 6x6");
        self.covariance = Some(covariance);
    }

    /// Uncertainties of `(a, b, c, alpha, beta, gamma)` propagated from
    /// the parameter covariance; zero when no covariance was stored.
    #[must_use]
    pub fn character_sigmas(&self) -> CellCharacter {
        let Some(cov) = &self.covariance else {
            return CellCharacter::default();
        };
        let ch = self.character();
        let sigma = |gradient: &DVector<f64>| -> f64 {
            (gradient.transpose() * cov * gradient)[(0, 0)].max(0.0).sqrt()
        };

        let mut out = CellCharacter::default();
        let grad_a = DVector::from_vec(vec![0.5 / ch.a, 0.0, 0.0, 0.0, 0.0, 0.0]);
        let grad_b = DVector::from_vec(vec![0.0, 0.5 / ch.b, 0.0, 0.0, 0.0, 0.0]);
        let grad_c = DVector::from_vec(vec![0.0, 0.0, 0.5 / ch.c, 0.0, 0.0, 0.0]);
        out.a = sigma(&grad_a);
        out.b = sigma(&grad_b);
        out.c = sigma(&grad_c);

        // alpha = acos(D / (b c)); the partials follow from the chain rule
        let angle_grad = |d: f64, bb: f64, cc: f64, slots: (usize, usize, usize)| {
            let b = bb.sqrt();
            let c = cc.sqrt();
            let cos = (d / (b * c)).clamp(-1.0, 1.0);
            let sin = (1.0 - cos * cos).sqrt().max(1e-12);
            let mut g = DVector::zeros(6);
            g[slots.0] = -1.0 / (b * c * sin);
            g[slots.1] = d / (2.0 * bb * b * c * sin);
            g[slots.2] = d / (2.0 * cc * c * b * sin);
            g
        };
        out.alpha = sigma(&angle_grad(ch.big_d, ch.big_b, ch.big_c, (3, 1, 2)));
        out.beta = sigma(&angle_grad(ch.big_e, ch.big_a, ch.big_c, (4, 0, 2)));
        out.gamma = sigma(&angle_grad(ch.big_f, ch.big_a, ch.big_b, (5, 0, 1)));
        out
    }

    /// All reflections with Bragg d in `[d_min, d_max]` reachable at the
    /// given wavelength.
    #[must_use]
    pub fn reflections_in_shell(&self, d_min: f64, d_max: f64, wavelength: f64) -> Vec<MillerIndex> {
        let q_max = (1.0 / d_min).min(2.0 / wavelength);
        let b_min = self
            .reciprocal_metric()
            .symmetric_eigenvalues()
            .min()
            .max(0.0)
            .sqrt();
        if b_min <= 0.0 {
            return Vec::new();
        }
        #[allow(clippy::cast_possible_truncation)]
        let hkl_max = (q_max / b_min).ceil() as i32;

        let mut out = Vec::new();
        for h in -hkl_max..=hkl_max {
            for k in -hkl_max..=hkl_max {
                for l in -hkl_max..=hkl_max {
                    if h == 0 && k == 0 && l == 0 {
                        continue;
                    }
                    let hkl = MillerIndex::new(h, k, l);
                    let q = self.q_vector(&hkl).norm();
                    if q > q_max {
                        continue;
                    }
                    let d = 1.0 / q;
                    if d >= d_min && d <= d_max {
                        out.push(hkl);
                    }
                }
            }
        }
        out
    }

    /// Theoretical number of symmetry-unique, non-extinct reflections in a
    /// resolution shell, the denominator of completeness.
    #[must_use]
    pub fn max_peaks(&self, d_min: f64, d_max: f64, wavelength: f64, friedel: bool) -> usize {
        let mut representatives: Vec<MillerIndex> = Vec::new();
        for hkl in self.reflections_in_shell(d_min, d_max, wavelength) {
            if self.space_group.is_extinct(&hkl) {
                continue;
            }
            let rep = self.space_group.representative(&hkl, friedel);
            if !representatives.contains(&rep) {
                representatives.push(rep);
            }
        }
        representatives.len()
    }
}

/// QR with the diagonal of `R` forced positive.
fn positive_qr(m: &Matrix3<f64>) -> (Matrix3<f64>, Matrix3<f64>) {
    let (mut q, mut r) = m.qr().unpack();
    for i in 0..3 {
        if r[(i, i)] < 0.0 {
            for j in 0..3 {
                q[(j, i)] = -q[(j, i)];
                r[(i, j)] = -r[(i, j)];
            }
        }
    }
    (q, r)
}

impl fmt::Display for UnitCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ch = self.character();
        write!(
            f,
            "{:10.3}{:10.3}{:10.3}{:10.3}{:10.3}{:10.3}{:>10}",
            ch.a,
            ch.b,
            ch.c,
            ch.alpha.to_degrees(),
            ch.beta.to_degrees(),
            ch.gamma.to_degrees(),
            self.niggli.bravais,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    const DEG: f64 = std::f64::consts::PI / 180.0;

    #[test]
    fn orthorhombic_character() {
        let cell = UnitCell::from_parameters(6.32, 7.22, 3.44, 90.0 * DEG, 90.0 * DEG, 90.0 * DEG)
            .unwrap();
        assert_approx_eq!(f64, cell.volume(), 6.32 * 7.22 * 3.44, epsilon = 1e-9);

        // B is the transposed inverse of A, componentwise
        let b_expected = cell.basis().transpose().try_inverse().unwrap().transpose();
        assert!((cell.reciprocal_basis() - b_expected).norm() < 1e-6);

        let ch = cell.character();
        assert_approx_eq!(f64, ch.a, 6.32, epsilon = 1e-9);
        assert_approx_eq!(f64, ch.b, 7.22, epsilon = 1e-9);
        assert_approx_eq!(f64, ch.c, 3.44, epsilon = 1e-9);
        assert_approx_eq!(f64, ch.alpha, 90.0 * DEG, epsilon = 1e-9);
    }

    #[test]
    fn indexing_roundtrip() {
        let cell =
            UnitCell::from_parameters(8.0, 9.5, 11.0, 90.0 * DEG, 104.0 * DEG, 90.0 * DEG).unwrap();
        let hkl = MillerIndex::new(2, -3, 5);
        let q = cell.q_vector(&hkl);
        let back = cell.miller_index(&q);
        assert_eq!(back, hkl);
        assert!(back.indexed(1e-9));
    }

    #[test]
    fn reduction_of_tricky_cell() {
        let mut cell = UnitCell::from_parameters(
            5.557,
            5.77,
            16.138,
            96.314 * DEG,
            90.0 * DEG,
            90.0 * DEG,
        )
        .unwrap();
        let number = cell.reduce(false, 1e-2, 1e-3).unwrap();
        assert_eq!(number, 35);
        assert_eq!(cell.niggli_character().bravais, "mP");

        let constrained = cell.apply_niggli_constraints().unwrap();
        let ch = constrained.character();
        assert_approx_eq!(f64, ch.alpha, 90.0 * DEG, epsilon = 1e-10);
        assert_approx_eq!(f64, ch.gamma, 90.0 * DEG, epsilon = 1e-10);
        assert!((ch.beta - 96.3 * DEG).abs() < 1.0 * DEG);
    }

    #[test]
    fn reduce_then_constrain_is_equivalent() {
        for (a, b, c, alpha, beta, gamma) in [
            (6.32, 7.22, 3.44, 90.0, 90.0, 90.0),
            (5.557, 5.77, 16.138, 96.314, 90.0, 90.0),
            (4.0, 4.0, 4.0, 90.0, 90.0, 90.0),
            (5.1, 5.1, 13.8, 90.0, 90.0, 120.0),
        ] {
            let cell = UnitCell::from_parameters(
                a,
                b,
                c,
                alpha * DEG,
                beta * DEG,
                gamma * DEG,
            )
            .unwrap();
            let mut reduced = cell.clone();
            reduced.reduce(false, 1e-5, 1e-5).unwrap();
            let constrained = reduced.apply_niggli_constraints().unwrap();
            assert!(
                cell.equivalent(&constrained, 1e-3),
                "round trip failed for ({a}, {b}, {c}, {alpha}, {beta}, {gamma})"
            );
        }
    }

    #[test]
    fn cubic_reduction_snaps_exactly() {
        // a cube described through a skewed basis
        let base = Matrix3::from_diagonal_element(4.2);
        let m = Matrix3::new(1.0, 1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0);
        let mut cell = UnitCell::from_basis(base * m).unwrap();
        let number = cell.reduce(false, 1e-5, 1e-5).unwrap();
        assert_eq!(number, 3);
        let snapped = cell.apply_niggli_constraints().unwrap();
        let ch = snapped.character();
        assert_approx_eq!(f64, ch.a, ch.b, epsilon = 1e-10);
        assert_approx_eq!(f64, ch.b, ch.c, epsilon = 1e-10);
        assert_approx_eq!(f64, ch.alpha, 90.0 * DEG, epsilon = 1e-10);
    }

    #[test]
    fn equivalence_detects_relabelled_basis() {
        let cell =
            UnitCell::from_parameters(6.0, 7.0, 8.0, 90.0 * DEG, 90.0 * DEG, 90.0 * DEG).unwrap();
        let mut relabelled = cell.clone();
        // unimodular change of basis
        relabelled.transform(&Matrix3::new(1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0));
        assert!(cell.equivalent(&relabelled, 1e-6));

        let other =
            UnitCell::from_parameters(6.1, 7.0, 8.0, 90.0 * DEG, 90.0 * DEG, 90.0 * DEG).unwrap();
        assert!(!cell.equivalent(&other, 1e-3));
    }

    #[test]
    fn shell_reflection_count_matches_cube() {
        let mut cell =
            UnitCell::from_parameters(5.0, 5.0, 5.0, 90.0 * DEG, 90.0 * DEG, 90.0 * DEG).unwrap();
        cell.set_space_group("P 1").unwrap();
        // reflections with d = 5.0 are the six {100}; d = 2.5 doubles the index
        let shell = cell.reflections_in_shell(3.0, 6.0, 1.0);
        assert_eq!(shell.len(), 18); // {100} (6) + {110} (12)

        // with only Friedel symmetry: 3 unique axes plus 6 unique diagonals
        let unique = cell.max_peaks(3.0, 6.0, 1.0, true);
        assert_eq!(unique, 9);
    }

    #[test]
    fn parameters_roundtrip_through_rebuild() {
        let mut cell = UnitCell::from_parameters(
            5.557,
            5.77,
            16.138,
            96.314 * DEG,
            90.0 * DEG,
            90.0 * DEG,
        )
        .unwrap();
        cell.reduce(false, 1e-2, 1e-3).unwrap();

        let u0 = cell.niggli_orientation();
        let p = cell.parameters();
        let rebuilt = cell
            .from_niggli_parameters(&u0, &Vector3::zeros(), &p)
            .unwrap();
        assert!((rebuilt.basis() - cell.basis()).norm() < 1e-9);
    }

    #[test]
    fn covariance_propagates_to_sigmas() {
        let mut cell =
            UnitCell::from_parameters(6.0, 7.0, 8.0, 90.0 * DEG, 90.0 * DEG, 90.0 * DEG).unwrap();
        let mut cov = DMatrix::zeros(6, 6);
        for i in 0..6 {
            cov[(i, i)] = 1e-4;
        }
        cell.set_parameter_covariance(cov);
        let sigmas = cell.character_sigmas();
        assert!(sigmas.a > 0.0 && sigmas.a < 1e-2);
        assert!(sigmas.alpha > 0.0);
    }
}
