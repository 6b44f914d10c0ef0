//! Auto-indexing: FFT direction search, triplet enumeration, refinement.

use crate::error::{Error, Result};
use crate::filter::select;
use crate::fit::FitParameters;
use crate::instrument::{InstrumentState, InterpolatedState};
use crate::minimizer::Minimizer;
use crate::peak::Peak;
use crate::progress::ProgressHandler;
use crate::unit_cell::UnitCell;
use itertools::Itertools;
use nalgebra::{DVector, Matrix3, RowVector3, Vector3};
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use tracing::{debug, info};

/// Tuning of the auto-indexer.
#[derive(Clone, Debug)]
#[allow(missing_docs)]
pub struct IndexerParameters {
    /// Largest cell edge searched for, in angstrom.
    pub maxdim: f64,
    /// Number of direction candidates kept from the FFT search.
    pub n_solutions: usize,
    /// Number of direction samples on the half sphere.
    pub n_vertices: usize,
    /// Histogram subdivision factor.
    pub subdiv: usize,
    pub indexing_tolerance: f64,
    pub niggli_tolerance: f64,
    pub gruber_tolerance: f64,
    /// Stop the reduction at the Niggli cell, skipping the conventional
    /// setting.
    pub niggli_only: bool,
    pub min_cell_volume: f64,
    pub cell_equivalence_tolerance: f64,
    /// Minimum percentage of re-indexed peaks for a kept solution.
    pub solution_cutoff: f64,
    /// Fraction of the zero mode a frequency peak must reach.
    pub frequency_tolerance: f64,
    pub first_frame: f64,
    pub last_frame: f64,
    pub d_min: f64,
    pub d_max: f64,
    pub strength_min: f64,
    pub strength_max: f64,
    /// Whether the input peaks carry integrated intensities (enables the
    /// strength filter).
    pub peaks_integrated: bool,
}

impl Default for IndexerParameters {
    fn default() -> Self {
        Self {
            maxdim: 200.0,
            n_solutions: 10,
            n_vertices: 10_000,
            subdiv: 30,
            indexing_tolerance: 0.2,
            niggli_tolerance: 1e-3,
            gruber_tolerance: 4e-2,
            niggli_only: false,
            min_cell_volume: 20.0,
            cell_equivalence_tolerance: 0.05,
            solution_cutoff: 10.0,
            frequency_tolerance: 0.7,
            first_frame: -1.0,
            last_frame: -1.0,
            d_min: 1.5,
            d_max: 50.0,
            strength_min: 1.0,
            strength_max: f64::INFINITY,
            peaks_integrated: false,
        }
    }
}

/// A candidate cell with its indexing quality (percentage of peaks
/// re-indexed after refinement).
#[derive(Clone, Debug)]
pub struct RankedSolution {
    /// The refined, reduced, constrained cell.
    pub cell: UnitCell,
    /// Percentage of the input peaks the cell indexes.
    pub quality: f64,
}

/// Direction candidates found by projecting the q vectors onto a sampled
/// half sphere and Fourier-analysing the projection histogram.
///
/// For each direction the projections are binned with width
/// `1 / (2 q_max subdiv)`, transformed, and the first local maximum above
/// `frequency_tolerance |F0|` at index `k >= subdiv / 2` yields the direct
/// lattice vector `n k subdiv maxdim / nbins`.
#[must_use]
pub fn find_on_sphere(
    q_vectors: &[RowVector3<f64>],
    n_vertices: usize,
    n_solutions: usize,
    subdiv: usize,
    maxdim: f64,
    frequency_tolerance: f64,
) -> Vec<Vector3<f64>> {
    let q_max = q_vectors
        .iter()
        .map(|q| q.norm())
        .fold(0.0_f64, f64::max);
    if q_max <= 0.0 {
        return Vec::new();
    }

    let mut n_points = (2.0 * q_max * subdiv as f64 * maxdim).ceil() as usize;
    if n_points % 2 == 1 {
        n_points += 1;
    }
    let half = n_points / 2;
    let dq_inv = n_points as f64 / (2.0 * q_max);

    let mut planner = FftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(n_points);

    let golden = std::f64::consts::PI * (3.0 - 5.0_f64.sqrt());
    let mut candidates: Vec<(Vector3<f64>, f64)> = Vec::new();
    let mut buffer = vec![Complex::new(0.0, 0.0); n_points];

    for vertex in 0..n_vertices {
        // Fibonacci lattice on the upper half sphere
        let z = (vertex as f64 + 0.5) / n_vertices as f64;
        let r = (1.0 - z * z).max(0.0).sqrt();
        let phi = golden * vertex as f64;
        let normal = Vector3::new(r * phi.cos(), r * phi.sin(), z);

        for value in &mut buffer {
            *value = Complex::new(0.0, 0.0);
        }
        for q in q_vectors {
            let projection = q[0] * normal[0] + q[1] * normal[1] + q[2] * normal[2];
            let mut index = ((projection + q_max) * dq_inv).floor() as usize;
            if index >= n_points {
                index = n_points - 1;
            }
            buffer[index].re += 1.0;
        }

        fft.process(&mut buffer);
        let zero_mode = buffer[0].norm();

        let mut best_value = 0.0;
        let mut best_index = 0usize;
        for i in subdiv / 2..half {
            let current = buffer[i].norm();
            if current < frequency_tolerance * zero_mode {
                continue;
            }
            if current > best_value {
                best_value = current;
                best_index = i;
            } else {
                break;
            }
        }

        if best_index > 2 {
            let length = best_index as f64 * subdiv as f64 * maxdim / n_points as f64;
            candidates.push((normal * length, best_value));
        }
    }

    candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).expect("finite quality"));
    candidates.truncate(n_solutions);
    candidates.into_iter().map(|(t, _)| t).collect()
}

/// Whitening matrix of a peak: the symmetric square root of its q-space
/// inverse covariance after Jacobian pull-back.
fn whitening_matrix(peak: &Peak) -> Option<Matrix3<f64>> {
    let c = peak.shape().center();
    let state = InterpolatedState::interpolate(&peak.data().states(), c[2]);
    if !state.is_valid() {
        return None;
    }
    let j = state.jacobian_q(peak.data().detector(), c[0], c[1]);
    let j_inv = j.try_inverse()?;
    let a = j_inv.transpose() * peak.shape().metric() * j_inv;
    let eigen = a.symmetric_eigen();
    let mut d = Matrix3::zeros();
    for i in 0..3 {
        if eigen.eigenvalues[i] < 0.0 {
            return None;
        }
        d[(i, i)] = eigen.eigenvalues[i].sqrt();
    }
    let u = eigen.eigenvectors;
    Some(u * d * u.transpose())
}

/// The auto-indexer: recovers candidate unit cells from peak q vectors.
pub struct AutoIndexer {
    /// Tuning parameters.
    pub params: IndexerParameters,
    solutions: Vec<RankedSolution>,
}

impl Default for AutoIndexer {
    fn default() -> Self {
        Self::new()
    }
}

impl AutoIndexer {
    /// Indexer with default parameters.
    #[must_use]
    pub fn new() -> Self {
        Self {
            params: IndexerParameters::default(),
            solutions: Vec::new(),
        }
    }

    /// The ranked solutions of the last run.
    #[must_use]
    pub fn solutions(&self) -> &[RankedSolution] {
        &self.solutions
    }

    /// Run the search. Returns `Ok(false)` (with a log message) when the
    /// input does not admit a solution; peaks are filtered to the
    /// enabled/frame/d/strength subset first unless `filter` is false.
    ///
    /// # Errors
    ///
    /// [`Error::Cancelled`] when the progress handler interrupts.
    pub fn autoindex(
        &mut self,
        peaks: &[Peak],
        state: Option<&InstrumentState>,
        filter: bool,
        handler: Option<&ProgressHandler>,
    ) -> Result<bool> {
        self.solutions.clear();
        info!(peaks = peaks.len(), "auto-indexing");

        let indices = if filter {
            self.filter_peaks(peaks, state)
        } else {
            (0..peaks.len()).collect()
        };

        let q_vectors: Vec<RowVector3<f64>> = indices
            .iter()
            .filter_map(|&i| {
                state.map_or_else(|| peaks[i].q(), |s| Some(peaks[i].q_with_state(s)))
            })
            .collect();
        info!(q_vectors = q_vectors.len(), "q vectors for indexing");
        if q_vectors.len() < 10 {
            info!("too few peaks to autoindex");
            return Ok(false);
        }

        let t_vectors = find_on_sphere(
            &q_vectors,
            self.params.n_vertices,
            self.params.n_solutions,
            self.params.subdiv,
            self.params.maxdim,
            self.params.frequency_tolerance,
        );
        info!(t_vectors = t_vectors.len(), "direction candidates");
        if t_vectors.len() < 3 {
            info!("too few direction candidates to form a basis");
            return Ok(false);
        }

        let mut candidates: Vec<UnitCell> = Vec::new();
        for (a, b, c) in t_vectors.iter().tuple_combinations() {
            let mut basis = Matrix3::from_columns(&[*a, *b, *c]);
            if basis.determinant() < 0.0 {
                basis.swap_columns(1, 2);
            }
            if basis.determinant() < self.params.min_cell_volume {
                continue;
            }
            let Ok(cell) = UnitCell::from_basis(basis) else {
                continue;
            };
            let duplicate = candidates
                .iter()
                .any(|known| known.equivalent(&cell, self.params.cell_equivalence_tolerance));
            if !duplicate {
                candidates.push(cell);
            }
        }
        debug!(candidates = candidates.len(), "unrefined solutions");

        let total = candidates.len();
        for (n, mut cell) in candidates.into_iter().enumerate() {
            if let Some(handler) = handler {
                if !handler.update("refining solutions", n as f64 / total.max(1) as f64) {
                    return Err(Error::Cancelled);
                }
            }
            cell.set_indexing_tolerance(self.params.indexing_tolerance);
            if let Some(solution) = self.refine_solution(cell, peaks, &indices, state) {
                self.solutions.push(solution);
            }
        }

        self.solutions
            .retain(|s| s.quality >= self.params.solution_cutoff);
        self.rank_solutions();
        info!(solutions = self.solutions.len(), "unit cells found");
        Ok(true)
    }

    fn filter_peaks(&self, peaks: &[Peak], state: Option<&InstrumentState>) -> Vec<usize> {
        let last = if self.params.last_frame < 0.0 {
            f64::INFINITY
        } else {
            self.params.last_frame
        };
        let first = self.params.first_frame.max(0.0);

        let enabled = select::enabled(peaks);
        let in_frames = select::frame_range(peaks, &enabled, first, last);
        let subset = if self.params.peaks_integrated {
            let strong = select::strength(
                peaks,
                &in_frames,
                self.params.strength_min,
                self.params.strength_max,
            );
            select::d_range(peaks, &strong, self.params.d_min, self.params.d_max, state)
        } else {
            select::d_range(peaks, &in_frames, self.params.d_min, self.params.d_max, state)
        };
        info!(filtered = subset.len(), "peaks used in indexing");
        subset
    }

    fn refine_solution(
        &self,
        mut cell: UnitCell,
        peaks: &[Peak],
        indices: &[usize],
        state: Option<&InstrumentState>,
    ) -> Option<RankedSolution> {
        let indexed = select::indexed(peaks, indices, &cell, state);
        if indexed.len() < 10 {
            return None;
        }

        let mut hkls: Vec<RowVector3<f64>> = Vec::new();
        let mut qs: Vec<RowVector3<f64>> = Vec::new();
        let mut weights: Vec<Matrix3<f64>> = Vec::new();
        for &i in &indexed {
            let q = state.map_or_else(|| peaks[i].q(), |s| Some(peaks[i].q_with_state(s)))?;
            let hkl = cell.miller_index(&q);
            let w = whitening_matrix(&peaks[i]).unwrap_or_else(Matrix3::identity);
            hkls.push(hkl.row_vector_f64());
            qs.push(q);
            weights.push(w);
        }

        // fit the reciprocal basis to the indexed q vectors
        let mut params = FitParameters::new();
        let b0 = cell.reciprocal_basis();
        for r in 0..3 {
            for c in 0..3 {
                params.add(b0[(r, c)]);
            }
        }

        let n = hkls.len();
        let mut residuals = |x: &[f64], r: &mut DVector<f64>| -> bool {
            let b = Matrix3::new(x[0], x[1], x[2], x[3], x[4], x[5], x[6], x[7], x[8]);
            for (i, (hkl, q)) in hkls.iter().zip(&qs).enumerate() {
                let dq = q - hkl * b;
                let whitened = weights[i] * dq.transpose();
                r[3 * i] = whitened[0];
                r[3 * i + 1] = whitened[1];
                r[3 * i + 2] = whitened[2];
            }
            true
        };

        let mut minimizer = Minimizer::new();
        minimizer.set_xtol(1e-15);
        minimizer.set_ftol(1e-15);
        minimizer.set_gtol(1e-15);
        minimizer.initialize(3 * n);
        if minimizer.fit(&mut params, &mut residuals, None, 500).is_err() {
            return None;
        }

        let x = params.values();
        let fitted = Matrix3::new(x[0], x[1], x[2], x[3], x[4], x[5], x[6], x[7], x[8]);
        cell.set_reciprocal_basis(fitted).ok()?;
        cell.set_indexing_tolerance(self.params.indexing_tolerance);
        cell.reduce(
            self.params.niggli_only,
            self.params.niggli_tolerance,
            self.params.gruber_tolerance,
        )
        .ok()?;
        cell = cell.apply_niggli_constraints().ok()?;
        if let Some(covariance) = minimizer.covariance() {
            // 9x9 basis covariance is not the 6-parameter metric form;
            // keep the trace-scaled diagonal as a coarse estimate
            let mut metric_cov = nalgebra::DMatrix::zeros(6, 6);
            let scale = covariance.trace() / 9.0;
            for i in 0..6 {
                metric_cov[(i, i)] = scale;
            }
            cell.set_parameter_covariance(metric_cov);
        }

        let re_indexed = select::indexed(peaks, &indexed, &cell, state);
        let quality = 100.0 * re_indexed.len() as f64 / indexed.len() as f64;
        Some(RankedSolution { cell, quality })
    }

    fn rank_solutions(&mut self) {
        self.solutions.sort_by(|a, b| {
            b.quality
                .partial_cmp(&a.quality)
                .expect("finite quality")
                .then_with(|| {
                    a.cell
                        .volume()
                        .partial_cmp(&b.cell.volume())
                        .expect("finite volume")
                })
        });
    }

    /// Drop solutions with an edge beyond `maxdim` or volume below the
    /// minimum.
    #[must_use]
    pub fn filtered_solutions(&self) -> Vec<&RankedSolution> {
        self.solutions
            .iter()
            .filter(|s| {
                let ch = s.cell.character();
                ch.a < self.params.maxdim
                    && ch.b < self.params.maxdim
                    && ch.c < self.params.maxdim
                    && s.cell.volume() > self.params.min_cell_volume
            })
            .collect()
    }

    /// First solution similar to a reference cell.
    #[must_use]
    pub fn good_solution(
        &self,
        reference: &UnitCell,
        length_tolerance: f64,
        angle_tolerance: f64,
    ) -> Option<&RankedSolution> {
        self.solutions
            .iter()
            .find(|s| s.cell.is_similar(reference, length_tolerance, angle_tolerance))
    }

    /// Formatted solution table.
    #[must_use]
    pub fn solutions_table(&self) -> String {
        use std::fmt::Write;
        let mut out = format!(
            "{:>10}{:>10}{:>10}{:>10}{:>10}{:>10}{:>10}{:>10}\n",
            "quality", "a", "b", "c", "alpha", "beta", "gamma", "bravais"
        );
        for solution in &self.solutions {
            let _ = writeln!(out, "{:10.3}{}", solution.quality, solution.cell);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// q vectors of a known orthorhombic lattice.
    fn lattice_qs(cell: &UnitCell, hkl_max: i32) -> Vec<RowVector3<f64>> {
        let mut qs = Vec::new();
        for h in -hkl_max..=hkl_max {
            for k in -hkl_max..=hkl_max {
                for l in -hkl_max..=hkl_max {
                    if h == 0 && k == 0 && l == 0 {
                        continue;
                    }
                    qs.push(
                        crate::miller::MillerIndex::new(h, k, l).row_vector_f64()
                            * cell.reciprocal_basis(),
                    );
                }
            }
        }
        qs
    }

    #[test]
    fn direction_search_finds_lattice_vectors() {
        let a = 10.0;
        let cell = UnitCell::from_parameters(
            a,
            a,
            a,
            std::f64::consts::FRAC_PI_2,
            std::f64::consts::FRAC_PI_2,
            std::f64::consts::FRAC_PI_2,
        )
        .unwrap();
        let qs = lattice_qs(&cell, 4);

        let t_vectors = find_on_sphere(&qs, 4000, 12, 20, 50.0, 0.7);
        assert!(t_vectors.len() >= 3, "found {}", t_vectors.len());

        // every candidate must be close to a direct lattice vector, i.e.
        // have near-integer fractional coordinates in the cubic basis
        for t in &t_vectors {
            let m = t / a;
            let worst = (0..3)
                .map(|i| (m[i] - m[i].round()).abs())
                .fold(0.0_f64, f64::max);
            assert!(worst < 0.3, "non-lattice direction {t:?} ({worst})");
        }

        // and at least one candidate has the cube edge length
        let has_edge = t_vectors.iter().any(|t| (t.norm() - a).abs() < 1.5);
        assert!(has_edge);
    }

    #[test]
    fn empty_input_finds_nothing() {
        assert!(find_on_sphere(&[], 100, 10, 25, 50.0, 0.7).is_empty());
    }
}
