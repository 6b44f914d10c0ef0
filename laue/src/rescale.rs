//! Per-frame intensity rescaling.

use crate::collection::PeakCollection;
use crate::error::{Error, Result};
use crate::merge::MergedPeakCollection;
use crate::progress::ProgressHandler;
use crate::space_group::SpaceGroup;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Rescaler configuration.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
#[allow(missing_docs)]
pub struct RescalerParameters {
    /// Use sum intensities (profile otherwise).
    pub sum_intensity: bool,
    /// Merge Friedel mates.
    pub friedel: bool,
    pub ftol: f64,
    pub xtol: f64,
    /// Tolerance on constraint violation.
    pub ctol: f64,
    pub max_iter: usize,
    /// Initial simplex step.
    pub init_step: f64,
    /// Maximum relative change of the scale between adjacent frames.
    pub frame_ratio: f64,
}

impl Default for RescalerParameters {
    fn default() -> Self {
        Self {
            sum_intensity: true,
            friedel: true,
            ftol: 1e-4,
            xtol: 1e-4,
            ctol: 1e-5,
            max_iter: 2000,
            init_step: 0.1,
            frame_ratio: 0.2,
        }
    }
}

/// Derivative-free Nelder-Mead simplex minimisation of `f` starting at
/// `x0`, with initial step `step`. Returns the minimiser and its value.
fn nelder_mead<F>(
    f: &mut F,
    x0: &[f64],
    step: f64,
    ftol: f64,
    xtol: f64,
    max_iter: usize,
) -> (Vec<f64>, f64)
where
    F: FnMut(&[f64]) -> f64,
{
    const ALPHA: f64 = 1.0;
    const GAMMA: f64 = 2.0;
    const RHO: f64 = 0.5;
    const SIGMA: f64 = 0.5;

    let n = x0.len();
    let mut simplex: Vec<(Vec<f64>, f64)> = Vec::with_capacity(n + 1);
    simplex.push((x0.to_vec(), f(x0)));
    for i in 0..n {
        let mut vertex = x0.to_vec();
        vertex[i] += step;
        let value = f(&vertex);
        simplex.push((vertex, value));
    }

    for _ in 0..max_iter {
        simplex.sort_by(|a, b| a.1.partial_cmp(&b.1).expect("finite objective"));
        let best = simplex[0].1;
        let worst = simplex[n].1;

        // convergence on function spread and simplex size
        let spread = (worst - best).abs();
        let size = simplex[1..]
            .iter()
            .map(|(v, _)| {
                v.iter()
                    .zip(&simplex[0].0)
                    .map(|(a, b)| (a - b).abs())
                    .fold(0.0_f64, f64::max)
            })
            .fold(0.0_f64, f64::max);
        if spread < ftol * (1.0 + best.abs()) && size < xtol {
            break;
        }

        // centroid of all but the worst
        let mut centroid = vec![0.0; n];
        for (vertex, _) in &simplex[..n] {
            for (c, v) in centroid.iter_mut().zip(vertex) {
                *c += v / n as f64;
            }
        }

        let reflect: Vec<f64> = centroid
            .iter()
            .zip(&simplex[n].0)
            .map(|(c, w)| c + ALPHA * (c - w))
            .collect();
        let f_reflect = f(&reflect);

        if f_reflect < simplex[0].1 {
            // try expanding
            let expand: Vec<f64> = centroid
                .iter()
                .zip(&reflect)
                .map(|(c, r)| c + GAMMA * (r - c))
                .collect();
            let f_expand = f(&expand);
            simplex[n] = if f_expand < f_reflect {
                (expand, f_expand)
            } else {
                (reflect, f_reflect)
            };
            continue;
        }
        if f_reflect < simplex[n - 1].1 {
            simplex[n] = (reflect, f_reflect);
            continue;
        }

        // contract towards the better side
        let contract: Vec<f64> = centroid
            .iter()
            .zip(&simplex[n].0)
            .map(|(c, w)| c + RHO * (w - c))
            .collect();
        let f_contract = f(&contract);
        if f_contract < simplex[n].1 {
            simplex[n] = (contract, f_contract);
            continue;
        }

        // shrink everything towards the best vertex
        let best_vertex = simplex[0].0.clone();
        for (vertex, value) in &mut simplex[1..] {
            for (v, b) in vertex.iter_mut().zip(&best_vertex) {
                *v = b + SIGMA * (*v - b);
            }
            *value = f(vertex);
        }
    }

    simplex.sort_by(|a, b| a.1.partial_cmp(&b.1).expect("finite objective"));
    let (x, value) = simplex.swap_remove(0);
    (x, value)
}

/// Optimises one scale factor per frame so that symmetry-equivalent
/// observations agree: the objective is the summed chi-squared of the
/// merged reflections after applying `I -> s_f I`.
///
/// The first scale is pinned to one; every further scale must stay within
/// `frame_ratio` of its predecessor. The constrained problem is solved by
/// an augmented Lagrangian around a Nelder-Mead inner loop.
pub struct Rescaler {
    group: SpaceGroup,
    parameters: RescalerParameters,
    scale_factors: Vec<f64>,
}

impl Rescaler {
    /// Prepare for a collection spanning `nframes` frames.
    #[must_use]
    pub fn new(group: SpaceGroup, parameters: RescalerParameters, nframes: usize) -> Self {
        Self {
            group,
            parameters,
            scale_factors: vec![1.0; nframes],
        }
    }

    /// The converged per-frame scales.
    #[must_use]
    pub fn scale_factors(&self) -> &[f64] {
        &self.scale_factors
    }

    fn apply_scales(collection: &mut PeakCollection, scales: &[f64]) {
        for peak in collection.peaks_mut() {
            let frame = peak.shape().center()[2].round();
            let idx = (frame.max(0.0) as usize).min(scales.len() - 1);
            peak.set_scale(scales[idx]);
        }
    }

    fn objective(&self, collection: &mut PeakCollection, scales: &[f64]) -> f64 {
        Self::apply_scales(collection, scales);
        let mut merged = MergedPeakCollection::new(
            self.group.clone(),
            self.parameters.friedel,
            self.parameters.sum_intensity,
        );
        merged.add_collection(collection);
        merged.sum_chi2()
    }

    /// Run the optimisation. Returns the minimum objective value; the
    /// peaks keep the converged scales applied.
    ///
    /// # Errors
    ///
    /// [`Error::Domain`] when the constraints cannot be satisfied within
    /// `ctol`, [`Error::Cancelled`] on cancellation.
    pub fn rescale(
        &mut self,
        collection: &mut PeakCollection,
        handler: Option<&ProgressHandler>,
    ) -> Result<f64> {
        let nframes = self.scale_factors.len();
        if nframes == 0 {
            return Err(Error::Domain("no frames to rescale".into()));
        }
        info!(nframes, "rescaling");
        let ratio = self.parameters.frame_ratio;

        // equality h0 = s0 - 1; inequalities per frame pair:
        //   s_f - (1 + r) s_{f-1} <= 0
        //  -s_f + (1 - r) s_{f-1} <= 0
        let equality = |s: &[f64]| s[0] - 1.0;
        let inequalities = |s: &[f64], out: &mut Vec<f64>| {
            out.clear();
            for f in 1..s.len() {
                out.push(s[f] - (1.0 + ratio) * s[f - 1]);
                out.push(-s[f] + (1.0 - ratio) * s[f - 1]);
            }
        };

        let mut lambda = 0.0_f64; // multiplier of the equality
        let mut mu = vec![0.0_f64; 2 * (nframes - 1)]; // inequality multipliers
        let mut penalty = 10.0_f64;

        let mut x = self.scale_factors.clone();
        let mut minimum = f64::INFINITY;
        let mut constraint_violation = f64::INFINITY;

        const OUTER_ITERATIONS: usize = 12;
        for outer in 0..OUTER_ITERATIONS {
            if let Some(handler) = handler {
                if !handler.update("rescaling", outer as f64 / OUTER_ITERATIONS as f64) {
                    return Err(Error::Cancelled);
                }
            }

            let mut scratch = Vec::new();
            let mut augmented = |s: &[f64]| -> f64 {
                let mut value = self.objective(collection, s);
                let h = equality(s);
                value += lambda * h + 0.5 * penalty * h * h;
                inequalities(s, &mut scratch);
                for (g, &m) in scratch.iter().zip(&mu) {
                    let t = (m / penalty + g).max(0.0);
                    value += 0.5 * penalty * (t * t - (m / penalty) * (m / penalty));
                }
                value
            };

            let (solution, _) = nelder_mead(
                &mut augmented,
                &x,
                self.parameters.init_step,
                self.parameters.ftol,
                self.parameters.xtol,
                self.parameters.max_iter,
            );
            x = solution;

            // multiplier updates and convergence check
            let h = equality(&x);
            lambda += penalty * h;
            let mut gs = Vec::new();
            inequalities(&x, &mut gs);
            for (m, &g) in mu.iter_mut().zip(&gs) {
                *m = (*m + penalty * g).max(0.0);
            }

            constraint_violation = h.abs().max(
                gs.iter().copied().fold(0.0_f64, |acc, g| acc.max(g.max(0.0))),
            );
            minimum = self.objective(collection, &x);
            debug!(outer, minimum, constraint_violation, "augmented Lagrangian step");
            if constraint_violation < self.parameters.ctol {
                break;
            }
            penalty *= 4.0;
        }

        if constraint_violation >= self.parameters.ctol {
            return Err(Error::Domain(format!(
                "rescaling constraints not satisfied (violation {constraint_violation:.3e})"
            )));
        }

        // fix the gauge exactly: the chain constraints are ratios, so
        // normalising by s0 preserves them; then clamp the chain so the
        // bounds hold exactly rather than within ctol
        let s0 = x[0];
        for s in &mut x {
            *s /= s0;
        }
        for f in 1..x.len() {
            let lo = (1.0 - ratio) * x[f - 1];
            let hi = (1.0 + ratio) * x[f - 1];
            x[f] = x[f].clamp(lo, hi);
        }
        minimum = self.objective(collection, &x);

        self.scale_factors = x;
        Self::apply_scales(collection, &self.scale_factors);
        info!(minimum, "rescaling converged");
        Ok(minimum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nelder_mead_minimises_a_quadratic() {
        let mut f = |x: &[f64]| (x[0] - 3.0).powi(2) + 2.0 * (x[1] + 1.0).powi(2);
        let (x, value) = nelder_mead(&mut f, &[0.0, 0.0], 0.5, 1e-12, 1e-9, 2000);
        assert!((x[0] - 3.0).abs() < 1e-4, "x = {x:?}");
        assert!((x[1] + 1.0).abs() < 1e-4, "x = {x:?}");
        assert!(value < 1e-7);
    }

    #[test]
    fn nelder_mead_handles_rosenbrock() {
        let mut f = |x: &[f64]| {
            100.0 * (x[1] - x[0] * x[0]).powi(2) + (1.0 - x[0]).powi(2)
        };
        let (x, _) = nelder_mead(&mut f, &[-1.2, 1.0], 0.5, 1e-14, 1e-10, 10_000);
        assert!((x[0] - 1.0).abs() < 1e-3, "x = {x:?}");
        assert!((x[1] - 1.0).abs() < 1e-3, "x = {x:?}");
    }
}
