//! Fit parameters with linear equality constraints.

use crate::error::{Error, Result};
use nalgebra::{DMatrix, DVector};

/// Relative threshold below which a diagonal entry of `R` counts as zero.
const RANK_EPS: f64 = 1.0e-10;

struct Kernel {
    /// Transformation from free (constrained) parameters to full parameters.
    k: DMatrix<f64>,
    /// Projection from full parameters to free parameters, `(K^T K)^-1 K^T`.
    p: DMatrix<f64>,
}

/// The parameters of a least-squares problem, optionally subject to linear
/// equality constraints `C p = 0`.
///
/// Parameters are registered one by one and addressed by the returned index.
/// When a constraint matrix is set, the solver works on the *free* vector
/// `p0` of dimension `n - rank(C)`; the full vector is recovered as
/// `p1 = K p0` where the columns of `K` span the kernel of `C`.
#[derive(Default)]
pub struct FitParameters {
    values: Vec<f64>,
    original: Vec<f64>,
    kernel: Option<Kernel>,
}

impl FitParameters {
    /// Create an empty parameter set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a parameter with its starting value. Returns the parameter
    /// index. Adding a parameter drops any constraint already set.
    pub fn add(&mut self, value: f64) -> usize {
        self.values.push(value);
        self.original.push(value);
        self.kernel = None;
        self.values.len() - 1
    }

    /// Number of registered parameters.
    #[must_use]
    pub fn nparams(&self) -> usize {
        self.values.len()
    }

    /// Number of free parameters after constraint elimination.
    #[must_use]
    pub fn nfree(&self) -> usize {
        self.kernel
            .as_ref()
            .map_or(self.values.len(), |kernel| kernel.k.ncols())
    }

    /// Current full parameter values.
    #[must_use]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Value of a single parameter.
    #[must_use]
    pub fn value(&self, index: usize) -> f64 {
        self.values[index]
    }

    /// Restore every parameter to the value it was registered with.
    pub fn reset(&mut self) {
        self.values.copy_from_slice(&self.original);
    }

    /// Kernel of the constraints, or the identity when unconstrained.
    #[must_use]
    pub fn kernel(&self) -> DMatrix<f64> {
        self.kernel.as_ref().map_or_else(
            || DMatrix::identity(self.values.len(), self.values.len()),
            |kernel| kernel.k.clone(),
        )
    }

    /// Drop the constraints.
    pub fn reset_constraints(&mut self) {
        self.kernel = None;
    }

    /// Set the constraint matrix `C` (rows are equality constraints
    /// `C p = 0`) and build the kernel through a rank-revealing
    /// column-pivoted QR: `C U = Q R`, `R = [R0 R1]` with `R0` square of
    /// full rank, `R0 K0 = -R1`, `K = U [K0; I]`.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Numerical`] when `C` has full column rank (no
    /// free parameters remain) or the triangular solve breaks down.
    pub fn set_constraint(&mut self, c: &DMatrix<f64>) -> Result<()> {
        assert_eq!(c.ncols(), self.values.len(), "constraint/parameter size mismatch");

        let n = c.ncols();
        let qr = c.clone().col_piv_qr();
        let r = qr.r();

        let scale = r[(0, 0)].abs().max(1.0);
        let rank = (0..r.nrows().min(n))
            .take_while(|&i| r[(i, i)].abs() > RANK_EPS * scale)
            .count();

        if rank == 0 {
            // all-zero constraint matrix constrains nothing
            self.kernel = None;
            return Ok(());
        }
        if rank == n {
            return Err(Error::Numerical(
                "constraint matrix has full column rank, no free parameters".into(),
            ));
        }

        let r0 = r.view((0, 0), (rank, rank)).into_owned();
        let r1 = r.view((0, rank), (rank, n - rank)).into_owned();
        let k0 = r0
            .solve_upper_triangular(&(-r1))
            .ok_or_else(|| Error::Numerical("singular R0 block in constraint QR".into()))?;

        let mut stacked = DMatrix::zeros(n, n - rank);
        stacked.view_mut((0, 0), (rank, n - rank)).copy_from(&k0);
        stacked
            .view_mut((rank, 0), (n - rank, n - rank))
            .copy_from(&DMatrix::identity(n - rank, n - rank));

        // undo the pivoting permutation: the factorization permuted the
        // columns of C, so the kernel rows have to be permuted back
        qr.p().inv_permute_rows(&mut stacked);

        self.set_kernel(stacked)
    }

    /// Install a precomputed kernel matrix (columns span the constraint
    /// kernel) and derive the projection.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Numerical`] when `K^T K` is singular.
    pub fn set_kernel(&mut self, k: DMatrix<f64>) -> Result<()> {
        assert_eq!(k.nrows(), self.values.len(), "kernel/parameter size mismatch");
        let ktk = k.transpose() * &k;
        let p = ktk
            .try_inverse()
            .ok_or_else(|| Error::Numerical("rank-deficient constraint kernel".into()))?
            * k.transpose();
        self.kernel = Some(Kernel { k, p });
        Ok(())
    }

    /// Project the current full values into the free vector.
    pub(crate) fn write_free(&self) -> DVector<f64> {
        let p1 = DVector::from_column_slice(&self.values);
        match &self.kernel {
            Some(kernel) => &kernel.p * p1,
            None => p1,
        }
    }

    /// Update the full values from a free vector.
    pub(crate) fn set_free(&mut self, p0: &DVector<f64>) {
        assert_eq!(p0.len(), self.nfree(), "free vector size mismatch");
        match &self.kernel {
            Some(kernel) => {
                let p1 = &kernel.k * p0;
                self.values.copy_from_slice(p1.as_slice());
            }
            None => self.values.copy_from_slice(p0.as_slice()),
        }
    }
}

/// Build the constraint kernel binding each group of parameter indices to a
/// common value: for every group, all listed parameters are replaced by one
/// free parameter; everything not listed stays free on its own.
///
/// This is the shape of constraint the batch refiner uses to share one
/// offset across all frames of a batch.
#[must_use]
pub fn constraint_kernel(nparams: usize, groups: &[Vec<usize>]) -> DMatrix<f64> {
    let mut is_free = vec![true; nparams];
    let mut columns: Vec<DVector<f64>> = Vec::new();

    for group in groups {
        let mut column = DVector::zeros(nparams);
        for &idx in group {
            column[idx] = 1.0;
            is_free[idx] = false;
        }
        columns.push(column);
    }

    for (idx, free) in is_free.iter().enumerate() {
        if *free {
            let mut column = DVector::zeros(nparams);
            column[idx] = 1.0;
            columns.push(column);
        }
    }

    DMatrix::from_columns(&columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    #[test]
    fn unconstrained_roundtrip() {
        let mut params = FitParameters::new();
        params.add(1.0);
        params.add(2.0);
        assert_eq!(params.nfree(), 2);

        let free = params.write_free();
        assert_approx_eq!(f64, free[1], 2.0);

        params.set_free(&DVector::from_vec(vec![3.0, 4.0]));
        assert_approx_eq!(f64, params.value(0), 3.0);
        params.reset();
        assert_approx_eq!(f64, params.value(0), 1.0);
    }

    #[test]
    fn kernel_annihilates_constraint() {
        // x0 = 10 x1, x2 free
        let mut params = FitParameters::new();
        params.add(4.0);
        params.add(0.4);
        params.add(0.5);

        let mut c = DMatrix::zeros(1, 3);
        c[(0, 0)] = 1.0;
        c[(0, 1)] = -10.0;
        params.set_constraint(&c).unwrap();

        assert_eq!(params.nfree(), 2);
        let k = params.kernel();
        let ck = c * k;
        assert!(ck.norm() < 1e-12);
    }

    #[test]
    fn projection_is_left_inverse_of_kernel() {
        let mut params = FitParameters::new();
        for value in [1.0, 2.0, 3.0, 4.0] {
            params.add(value);
        }
        let mut c = DMatrix::zeros(2, 4);
        c[(0, 0)] = 1.0;
        c[(0, 1)] = -1.0;
        c[(1, 2)] = 1.0;
        c[(1, 3)] = 1.0;
        params.set_constraint(&c).unwrap();

        // set_free followed by write_free must reproduce the free vector
        let p0 = DVector::from_vec(vec![1.5, -2.5]);
        params.set_free(&p0);
        let back = params.write_free();
        assert!((back - p0).norm() < 1e-12);

        // and the full vector satisfies the constraint exactly
        let full = DVector::from_column_slice(params.values());
        let mut c2 = DMatrix::zeros(2, 4);
        c2[(0, 0)] = 1.0;
        c2[(0, 1)] = -1.0;
        c2[(1, 2)] = 1.0;
        c2[(1, 3)] = 1.0;
        assert!((c2 * full).norm() < 1e-12);
    }

    #[test]
    fn zero_constraint_is_a_no_op() {
        let mut params = FitParameters::new();
        params.add(1.0);
        params.add(2.0);
        params.set_constraint(&DMatrix::zeros(1, 2)).unwrap();
        assert_eq!(params.nfree(), 2);
    }

    #[test]
    fn grouped_kernel_shares_one_value() {
        let kernel = constraint_kernel(4, &[vec![0, 2]]);
        assert_eq!(kernel.ncols(), 3);

        let mut params = FitParameters::new();
        for value in [1.0, 5.0, 3.0, 7.0] {
            params.add(value);
        }
        params.set_kernel(kernel).unwrap();
        let p0 = params.write_free();
        params.set_free(&p0);
        // indices 0 and 2 collapse onto their common free parameter
        assert_approx_eq!(f64, params.value(0), params.value(2));
        assert_approx_eq!(f64, params.value(1), 5.0);
        assert_approx_eq!(f64, params.value(3), 7.0);
    }
}
