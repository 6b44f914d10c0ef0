//! Levenberg-Marquardt driver over constrained fit parameters.

use crate::error::{Error, Result};
use crate::fit::FitParameters;
use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::storage::Owned;
use nalgebra::{DMatrix, DVector, Dyn};
use std::cell::RefCell;

/// Residual function: fills the residual vector from the full parameter
/// values, returning `false` on failure.
pub type ResidualFn<'a> = &'a mut dyn FnMut(&[f64], &mut DVector<f64>) -> bool;
/// Analytic Jacobian of the residuals with respect to the *full* parameter
/// vector, returning `false` on failure.
pub type JacobianFn<'a> = &'a mut dyn FnMut(&[f64], &mut DMatrix<f64>) -> bool;

/// Forward-difference step, relative to the parameter magnitude.
const FD_STEP: f64 = 1.49e-8;

/// Nonlinear least-squares minimizer.
///
/// Wraps the trust-region Levenberg-Marquardt driver: residuals are supplied
/// by a caller closure over the full parameter vector, constraints are
/// eliminated through the kernel of [`FitParameters`], and the Jacobian is
/// either analytic (chain-ruled through the kernel) or a forward difference.
pub struct Minimizer {
    xtol: f64,
    gtol: f64,
    ftol: f64,
    weights: Option<DVector<f64>>,
    num_values: usize,
    jacobian: Option<DMatrix<f64>>,
    covariance: Option<DMatrix<f64>>,
    mse: f64,
}

impl Default for Minimizer {
    fn default() -> Self {
        Self {
            xtol: 1e-7,
            gtol: 1e-7,
            ftol: 1e-7,
            weights: None,
            num_values: 0,
            jacobian: None,
            covariance: None,
            mse: 0.0,
        }
    }
}

struct State<'a, 'f> {
    params: &'a mut FitParameters,
    f: ResidualFn<'f>,
    df: Option<JacobianFn<'f>>,
    sqrt_weights: DVector<f64>,
    failed: bool,
}

impl State<'_, '_> {
    fn weighted_residuals(&mut self, num_values: usize) -> Option<DVector<f64>> {
        let mut r = DVector::zeros(num_values);
        if !(self.f)(self.params.values(), &mut r) {
            self.failed = true;
            return None;
        }
        r.component_mul_assign(&self.sqrt_weights);
        Some(r)
    }

    fn weighted_jacobian(&mut self, num_values: usize, free: &DVector<f64>) -> Option<DMatrix<f64>> {
        if self.df.is_some() {
            let kernel = self.params.kernel();
            let mut full = DMatrix::zeros(num_values, self.params.nparams());
            let df = self.df.as_mut().expect("checked above");
            if !df(self.params.values(), &mut full) {
                self.failed = true;
                return None;
            }
            let mut j = full * kernel;
            for (mut row, w) in j.row_iter_mut().zip(self.sqrt_weights.iter()) {
                row *= *w;
            }
            return Some(j);
        }

        // forward differences on the free vector
        let r0 = self.weighted_residuals(num_values)?;
        let mut j = DMatrix::zeros(num_values, free.len());
        for col in 0..free.len() {
            let step = FD_STEP * free[col].abs().max(1.0);
            let mut shifted = free.clone();
            shifted[col] += step;
            self.params.set_free(&shifted);
            let Some(r1) = self.weighted_residuals(num_values) else {
                self.params.set_free(free);
                return None;
            };
            j.set_column(col, &((r1 - &r0) / step));
        }
        self.params.set_free(free);
        Some(j)
    }
}

struct Problem<'a, 'f> {
    state: RefCell<State<'a, 'f>>,
    free: DVector<f64>,
    num_values: usize,
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for Problem<'_, '_> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, x: &DVector<f64>) {
        self.free = x.clone();
        self.state.borrow_mut().params.set_free(x);
    }

    fn params(&self) -> DVector<f64> {
        self.free.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        self.state.borrow_mut().weighted_residuals(self.num_values)
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        self.state
            .borrow_mut()
            .weighted_jacobian(self.num_values, &self.free)
    }
}

impl Minimizer {
    /// Construct with the default tolerances of `1e-7`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Relative tolerance in the parameters.
    pub fn set_xtol(&mut self, xtol: f64) {
        self.xtol = xtol;
    }

    /// Relative tolerance in the gradient.
    pub fn set_gtol(&mut self, gtol: f64) {
        self.gtol = gtol;
    }

    /// Relative tolerance in the residuals.
    pub fn set_ftol(&mut self, ftol: f64) {
        self.ftol = ftol;
    }

    /// Per-residual weights (variance weights, not standard deviations).
    pub fn set_weights(&mut self, weights: DVector<f64>) {
        self.weights = Some(weights);
    }

    /// Set the size of the residual vector. Must be called before fitting.
    pub fn initialize(&mut self, num_values: usize) {
        self.num_values = num_values;
        self.jacobian = None;
        self.covariance = None;
    }

    /// Run the fit, mutating `params` in place.
    ///
    /// # Errors
    ///
    /// [`Error::Numerical`] when the residual vector is shorter than the
    /// free parameter vector, when a residual evaluation fails, or when the
    /// driver terminates without convergence.
    pub fn fit<'a>(
        &mut self,
        params: &mut FitParameters,
        f: ResidualFn<'a>,
        df: Option<JacobianFn<'a>>,
        max_iter: usize,
    ) -> Result<()> {
        let nfree = params.nfree();
        if self.num_values < nfree {
            return Err(Error::Numerical(format!(
                "too few residuals for fit: {} values, {nfree} free parameters",
                self.num_values
            )));
        }

        let sqrt_weights = self.weights.as_ref().map_or_else(
            || DVector::from_element(self.num_values, 1.0),
            |w| {
                assert_eq!(w.len(), self.num_values, "weight vector size mismatch");
                w.map(f64::sqrt)
            },
        );

        let free = params.write_free();
        let problem = Problem {
            state: RefCell::new(State {
                params,
                f,
                df,
                sqrt_weights,
                failed: false,
            }),
            free,
            num_values: self.num_values,
        };

        let (problem, report) = LevenbergMarquardt::new()
            .with_xtol(self.xtol)
            .with_gtol(self.gtol)
            .with_ftol(self.ftol)
            .with_patience(max_iter)
            .minimize(problem);

        let free = problem.free.clone();
        let num_values = problem.num_values;
        let mut state = problem.state.into_inner();

        if state.failed || !report.termination.was_successful() {
            return Err(Error::Numerical(format!(
                "fit did not converge: {:?}",
                report.termination
            )));
        }

        // Jacobian and covariance at the solution
        let j = state
            .weighted_jacobian(num_values, &free)
            .ok_or_else(|| Error::Numerical("Jacobian evaluation failed at solution".into()))?;
        let jtj = j.transpose() * &j;
        let kernel = state.params.kernel();
        self.covariance = jtj
            .try_inverse()
            .map(|free_cov| &kernel * free_cov * kernel.transpose());

        let residuals = state
            .weighted_residuals(num_values)
            .ok_or_else(|| Error::Numerical("residual evaluation failed at solution".into()))?;
        self.mse = residuals.norm_squared() / (num_values - nfree).max(1) as f64;
        self.jacobian = Some(j * kernel.transpose());

        Ok(())
    }

    /// Variance-covariance matrix of the full parameter vector,
    /// `K (J^T W J)^-1 K^T`, available after a successful fit.
    #[must_use]
    pub fn covariance(&self) -> Option<&DMatrix<f64>> {
        self.covariance.as_ref()
    }

    /// Weighted Jacobian at the solution, mapped back to full parameters.
    #[must_use]
    pub fn jacobian(&self) -> Option<&DMatrix<f64>> {
        self.jacobian.as_ref()
    }

    /// Mean squared error at the solution.
    #[must_use]
    pub const fn mean_squared_error(&self) -> f64 {
        self.mse
    }
}
