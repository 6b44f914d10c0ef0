//! Batch refinement of the cell and the instrument states.

use crate::dataset::{events_for_q_with_states, DataSet};
use crate::error::{Error, Result};
use crate::fit::{constraint_kernel, FitParameters};
use crate::instrument::{InstrumentState, InterpolatedState};
use crate::minimizer::Minimizer;
use crate::peak::{Peak, RejectionFlag};
use crate::progress::ProgressHandler;
use crate::unit_cell::UnitCell;
use nalgebra::{DVector, Matrix3, RowVector3, Vector3, Vector6};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

const FRAME_EPS: f64 = 1e-5;
/// Residual contributions with squared norm beyond this are zeroed, so a
/// mispredicted peak cannot capsize the fit.
const RESIDUAL_CLIP: f64 = 10.0;

/// Which residual the refiner minimises.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum ResidualType {
    /// Whitened q-space mismatch.
    #[default]
    QSpace,
    /// Detector-space mismatch after ray tracing the prediction back.
    RealSpace,
}

/// Refiner configuration.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
#[allow(clippy::struct_excessive_bools, missing_docs)]
pub struct RefinerParameters {
    pub nbatches: usize,
    pub max_iter: usize,
    pub refine_ub: bool,
    pub refine_sample_position: bool,
    pub refine_sample_orientation: bool,
    pub refine_detector_offset: bool,
    pub refine_ki: bool,
    /// Assign each batch's refined cell to the peaks of the batch.
    pub use_batch_cells: bool,
    /// Write the refined cell back into the shared cell.
    pub set_unit_cell: bool,
    pub residual_type: ResidualType,
}

impl Default for RefinerParameters {
    fn default() -> Self {
        Self {
            nbatches: 10,
            max_iter: 1000,
            refine_ub: true,
            refine_sample_position: true,
            refine_sample_orientation: true,
            refine_detector_offset: false,
            refine_ki: false,
            use_batch_cells: false,
            set_unit_cell: true,
            residual_type: ResidualType::QSpace,
        }
    }
}

/// Parameter offsets of one per-frame state inside the flat vector.
#[derive(Clone, Copy, Debug, Default)]
struct StateSlots {
    sample_position: Option<usize>,
    sample_orientation: Option<usize>,
    detector_offset: Option<usize>,
    ki: Option<usize>,
}

/// One contiguous frame range refined as a unit: peaks, a deep copy of the
/// reference cell, whitening matrices, and the indices of the states it
/// touches.
pub struct RefinementBatch {
    frame_min: f64,
    frame_max: f64,
    peak_indices: Vec<usize>,
    hkls: Vec<RowVector3<f64>>,
    weights: Vec<Matrix3<f64>>,
    cell: UnitCell,
    state_indices: Vec<usize>,
    residual_type: ResidualType,
}

impl RefinementBatch {
    fn new(
        peaks: &[Peak],
        peak_indices: Vec<usize>,
        frame_range: (f64, f64),
        cell: &UnitCell,
        n_states: usize,
        residual_type: ResidualType,
    ) -> Option<Self> {
        let frame_min = frame_range.0 - FRAME_EPS;
        let frame_max = frame_range.1 + FRAME_EPS;

        let constrained = cell.apply_niggli_constraints().ok()?;

        let mut hkls = Vec::with_capacity(peak_indices.len());
        let mut weights = Vec::with_capacity(peak_indices.len());
        for &i in &peak_indices {
            let peak = &peaks[i];
            let q = peak.q()?;
            hkls.push(constrained.miller_index(&q).row_vector_f64());

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
            for k in 0..3 {
                d[(k, k)] = eigen.eigenvalues[k].max(0.0).sqrt();
            }
            weights.push(eigen.eigenvectors * d * eigen.eigenvectors.transpose());
        }

        let state_indices: Vec<usize> = (0..n_states)
            .filter(|&i| {
                let f = i as f64;
                f > frame_min && f < frame_max
            })
            .collect();
        if state_indices.is_empty() {
            return None;
        }

        Some(Self {
            frame_min,
            frame_max,
            peak_indices,
            hkls,
            weights,
            cell: constrained,
            state_indices,
            residual_type,
        })
    }

    /// Whether a frame coordinate belongs to this batch.
    #[must_use]
    pub fn contains(&self, frame: f64) -> bool {
        frame > self.frame_min && frame < self.frame_max
    }

    /// First frame of the batch.
    #[must_use]
    pub const fn frame_min(&self) -> f64 {
        self.frame_min
    }

    /// Last frame of the batch.
    #[must_use]
    pub const fn frame_max(&self) -> f64 {
        self.frame_max
    }

    /// The batch's refined cell.
    #[must_use]
    pub const fn cell(&self) -> &UnitCell {
        &self.cell
    }

    /// Peak indices (into the refiner's peak slice) of this batch.
    #[must_use]
    pub fn peak_indices(&self) -> &[usize] {
        &self.peak_indices
    }

    /// Run the constrained fit for this batch, mutating the shared
    /// instrument states of `data` and this batch's cell copy.
    ///
    /// # Errors
    ///
    /// [`Error::Numerical`] when the fit does not converge.
    #[allow(clippy::too_many_lines)]
    pub fn refine(
        &mut self,
        peaks: &[Peak],
        data: &Arc<DataSet>,
        parameters: &RefinerParameters,
    ) -> Result<()> {
        let u0 = self.cell.niggli_orientation();
        let cell_parameters = self.cell.parameters();

        let mut params = FitParameters::new();
        let mut groups: Vec<Vec<usize>> = Vec::new();

        // category 1: cell orientation offset + metric parameters
        let ub_base = parameters.refine_ub.then(|| {
            let base = params.nparams();
            for _ in 0..3 {
                params.add(0.0); // Rodrigues offset
            }
            for value in cell_parameters.iter() {
                params.add(*value);
            }
            base
        });

        // categories 2-5: per-frame state offsets, each axis shared
        // across every frame of the batch
        let mut slots = vec![StateSlots::default(); self.state_indices.len()];
        {
            let states = data.states();
            if parameters.refine_sample_position {
                let mut axis_groups = vec![Vec::new(); 3];
                for (slot, &si) in slots.iter_mut().zip(&self.state_indices) {
                    let base = params.nparams();
                    for axis in 0..3 {
                        let id = params.add(states[si].sample_position[axis]);
                        axis_groups[axis].push(id);
                    }
                    slot.sample_position = Some(base);
                }
                groups.extend(axis_groups);
            }
            if parameters.refine_sample_orientation {
                let mut axis_groups = vec![Vec::new(); 3];
                for (slot, &si) in slots.iter_mut().zip(&self.state_indices) {
                    let base = params.nparams();
                    let offset = states[si].sample_orientation_offset.coords;
                    for (axis, value) in [offset[0], offset[1], offset[2]].into_iter().enumerate() {
                        let id = params.add(value);
                        axis_groups[axis].push(id);
                    }
                    slot.sample_orientation = Some(base);
                }
                groups.extend(axis_groups);
            }
            if parameters.refine_detector_offset {
                let mut axis_groups = vec![Vec::new(); 3];
                for (slot, &si) in slots.iter_mut().zip(&self.state_indices) {
                    let base = params.nparams();
                    for axis in 0..3 {
                        let id = params.add(states[si].detector_position_offset[axis]);
                        axis_groups[axis].push(id);
                    }
                    slot.detector_offset = Some(base);
                }
                groups.extend(axis_groups);
            }
            if parameters.refine_ki {
                // the y component is functionally dependent and stays put
                let mut axis_groups = vec![Vec::new(); 2];
                for (slot, &si) in slots.iter_mut().zip(&self.state_indices) {
                    let base = params.nparams();
                    axis_groups[0].push(params.add(states[si].ni[0]));
                    axis_groups[1].push(params.add(states[si].ni[2]));
                    slot.ki = Some(base);
                }
                groups.extend(axis_groups);
            }
        }

        if params.nparams() == 0 {
            return Err(Error::Numerical("no parameters registered for refinement".into()));
        }
        if !groups.is_empty() {
            params.set_kernel(constraint_kernel(params.nparams(), &groups))?;
        }

        // residual evaluation works on a scratch copy of the full state
        // list with the batch parameters written in
        let base_states: Vec<InstrumentState> = data.states().clone();
        let state_indices = self.state_indices.clone();
        let slots_copy = slots.clone();
        let cell = self.cell.clone();
        let hkls = self.hkls.clone();
        let weights = self.weights.clone();
        let centers: Vec<Vector3<f64>> = self
            .peak_indices
            .iter()
            .map(|&i| peaks[i].shape().center())
            .collect();
        let detector = data.detector().clone();
        let residual_type = self.residual_type;

        let apply = move |x: &[f64], states: &mut [InstrumentState]| -> Option<UnitCell> {
            for (slot, &si) in slots_copy.iter().zip(&state_indices) {
                let state = &mut states[si];
                if let Some(base) = slot.sample_position {
                    state.sample_position = Vector3::new(x[base], x[base + 1], x[base + 2]);
                }
                if let Some(base) = slot.sample_orientation {
                    state.sample_orientation_offset.coords[0] = x[base];
                    state.sample_orientation_offset.coords[1] = x[base + 1];
                    state.sample_orientation_offset.coords[2] = x[base + 2];
                }
                if let Some(base) = slot.detector_offset {
                    state.detector_position_offset =
                        Vector3::new(x[base], x[base + 1], x[base + 2]);
                }
                if let Some(base) = slot.ki {
                    state.ni[0] = x[base];
                    state.ni[2] = x[base + 1];
                }
            }
            ub_base.map_or_else(|| Some(cell.clone()), |base| {
                let u_offset = Vector3::new(x[base], x[base + 1], x[base + 2]);
                let p = Vector6::from_iterator(x[base + 3..base + 9].iter().copied());
                cell.from_niggli_parameters(&u0, &u_offset, &p).ok()
            })
        };

        let n_residuals = 3 * self.peak_indices.len();
        let mut scratch = base_states.clone();
        let mut residuals = move |x: &[f64], r: &mut DVector<f64>| -> bool {
            scratch.clone_from_slice(&base_states);
            let Some(current_cell) = apply(x, &mut scratch) else {
                return false;
            };
            let ub = current_cell.reciprocal_basis();

            for (peak_idx, center) in centers.iter().enumerate() {
                let interp = InterpolatedState::interpolate(&scratch, center[2]);
                let entry = if interp.is_valid() {
                    let q_pred = hkls[peak_idx] * ub;
                    match residual_type {
                        ResidualType::QSpace => {
                            let q_obs = interp.sample_q(&detector, center[0], center[1]);
                            let dq = weights[peak_idx] * (q_pred - q_obs).transpose();
                            (dq.norm_squared() < RESIDUAL_CLIP).then_some(dq)
                        }
                        ResidualType::RealSpace => {
                            let events = events_for_q_with_states(&detector, &scratch, &q_pred);
                            events
                                .iter()
                                .map(|event| {
                                    Vector3::new(
                                        event.px - center[0],
                                        event.py - center[1],
                                        event.frame - center[2],
                                    )
                                })
                                .min_by(|a, b| {
                                    a.norm_squared()
                                        .partial_cmp(&b.norm_squared())
                                        .expect("finite residual")
                                })
                                .filter(|dx| dx.norm_squared() < RESIDUAL_CLIP)
                        }
                    }
                } else {
                    None
                };
                let dx = entry.unwrap_or_else(Vector3::zeros);
                r[3 * peak_idx] = dx[0];
                r[3 * peak_idx + 1] = dx[1];
                r[3 * peak_idx + 2] = dx[2];
            }
            true
        };

        let mut minimizer = Minimizer::new();
        minimizer.set_xtol(1e-10);
        minimizer.set_ftol(1e-10);
        minimizer.set_gtol(1e-10);
        minimizer.initialize(n_residuals);
        let outcome = minimizer.fit(&mut params, &mut residuals, None, parameters.max_iter);

        // write back on success
        if outcome.is_ok() {
            let x = params.values().to_vec();
            {
                let mut states = data.states_mut();
                for (slot, &si) in slots.iter().zip(&self.state_indices) {
                    let state = &mut states[si];
                    if let Some(base) = slot.sample_position {
                        state.sample_position = Vector3::new(x[base], x[base + 1], x[base + 2]);
                    }
                    if let Some(base) = slot.sample_orientation {
                        state.sample_orientation_offset.coords[0] = x[base];
                        state.sample_orientation_offset.coords[1] = x[base + 1];
                        state.sample_orientation_offset.coords[2] = x[base + 2];
                    }
                    if let Some(base) = slot.detector_offset {
                        state.detector_position_offset =
                            Vector3::new(x[base], x[base + 1], x[base + 2]);
                    }
                    if let Some(base) = slot.ki {
                        state.ni[0] = x[base];
                        state.ni[2] = x[base + 1];
                    }
                    state.refined = true;
                }
            }
            if let Some(base) = ub_base {
                let u_offset = Vector3::new(x[base], x[base + 1], x[base + 2]);
                let p = Vector6::from_iterator(x[base + 3..base + 9].iter().copied());
                if let Ok(mut updated) = self.cell.from_niggli_parameters(&u0, &u_offset, &p) {
                    if let Some(covariance) = minimizer.covariance() {
                        let block = covariance.view((base + 3, base + 3), (6, 6)).into_owned();
                        updated.set_parameter_covariance(block);
                    }
                    // snap the fitted metric back onto the lattice-character
                    // constraints
                    if let Ok(snapped) = updated.apply_niggli_constraints() {
                        updated = snapped;
                    }
                    self.cell = updated;
                }
            }
            debug!(
                mse = minimizer.mean_squared_error(),
                "batch refined"
            );
        }
        outcome
    }
}

/// Splits the peaks into frame-contiguous batches and refines them one by
/// one.
pub struct Refiner {
    batches: Vec<RefinementBatch>,
    cell: Arc<RwLock<UnitCell>>,
}

impl Refiner {
    /// Partition `peaks` (sorted by frame) into `nbatches` contiguous
    /// batches sharing no frame.
    ///
    /// # Errors
    ///
    /// [`Error::Domain`] when there are no usable peaks.
    pub fn new(
        peaks: &[Peak],
        cell: &Arc<RwLock<UnitCell>>,
        data: &Arc<DataSet>,
        parameters: &RefinerParameters,
    ) -> Result<Self> {
        let mut order: Vec<usize> = (0..peaks.len())
            .filter(|&i| peaks[i].enabled() && peaks[i].q().is_some())
            .collect();
        order.sort_by(|&a, &b| {
            peaks[a].shape().center()[2]
                .partial_cmp(&peaks[b].shape().center()[2])
                .expect("finite frame")
        });
        if order.is_empty() {
            return Err(Error::Domain("no peaks to refine".into()));
        }

        let reference = cell.read().expect("cell poisoned").clone();
        let batch_size = order.len() as f64 / parameters.nbatches as f64;
        let mut partitions: Vec<Vec<usize>> = Vec::new();
        let mut current: Vec<usize> = Vec::new();
        let mut batch_number = 0usize;

        for (i, &peak_idx) in order.iter().enumerate() {
            current.push(peak_idx);
            if (i as f64) + 1.1 >= (batch_number + 1) as f64 * batch_size {
                partitions.push(std::mem::take(&mut current));
                batch_number += 1;
            }
        }
        if !current.is_empty() {
            partitions.push(current);
        }

        // raw frame ranges, then split boundaries so that consecutive
        // batches share no frame
        let mut ranges: Vec<(f64, f64)> = partitions
            .iter()
            .map(|indices| {
                let mut lo = f64::INFINITY;
                let mut hi = f64::NEG_INFINITY;
                for &i in indices {
                    let f = peaks[i].shape().center()[2];
                    lo = lo.min(f.floor());
                    hi = hi.max(f.ceil());
                }
                (lo, hi)
            })
            .collect();
        for w in 1..ranges.len() {
            if ranges[w].0 <= ranges[w - 1].1 {
                let boundary = 0.5 * (ranges[w].0 + ranges[w - 1].1);
                ranges[w - 1].1 = boundary - 0.5;
                ranges[w].0 = boundary + 0.5;
            }
        }

        let mut batches = Vec::new();
        for (indices, range) in partitions.into_iter().zip(ranges) {
            if let Some(batch) = RefinementBatch::new(
                peaks,
                indices,
                range,
                &reference,
                data.nframes(),
                parameters.residual_type,
            ) {
                batches.push(batch);
            }
        }
        if batches.is_empty() {
            return Err(Error::Domain("batch construction left no batches".into()));
        }
        info!(batches = batches.len(), peaks = order.len(), "refiner ready");
        Ok(Self {
            batches,
            cell: Arc::clone(cell),
        })
    }

    /// The batches.
    #[must_use]
    pub fn batches(&self) -> &[RefinementBatch] {
        &self.batches
    }

    /// Refine every batch. Returns `Ok(false)` when any batch fails to
    /// converge (states of successful batches keep their refined values).
    ///
    /// # Errors
    ///
    /// [`Error::Cancelled`] on progress-handler cancellation.
    pub fn refine(
        &mut self,
        peaks: &mut [Peak],
        data: &Arc<DataSet>,
        parameters: &RefinerParameters,
        handler: Option<&ProgressHandler>,
    ) -> Result<bool> {
        let total = self.batches.len();
        let mut all_converged = true;
        for (n, batch) in self.batches.iter_mut().enumerate() {
            if let Some(handler) = handler {
                if !handler.update("refining batches", n as f64 / total as f64) {
                    return Err(Error::Cancelled);
                }
            }
            match batch.refine(peaks, data, parameters) {
                Ok(()) => {}
                Err(Error::Numerical(reason)) => {
                    info!(batch = n, reason, "batch did not converge");
                    all_converged = false;
                }
                Err(other) => return Err(other),
            }
        }

        if all_converged && parameters.set_unit_cell {
            if parameters.use_batch_cells {
                for batch in &self.batches {
                    let batch_cell = Arc::new(RwLock::new(batch.cell.clone()));
                    for &i in &batch.peak_indices {
                        peaks[i].set_unit_cell(&batch_cell);
                    }
                }
            } else if let Some(first) = self.batches.first() {
                *self.cell.write().expect("cell poisoned") = first.cell.clone();
            }
        }
        info!(converged = all_converged, "refinement finished");
        Ok(all_converged)
    }

    /// Recompute the centres of the predicted peaks from the refined cell
    /// and states. Returns the number updated; peaks whose prediction
    /// cannot be traced back are flagged.
    #[must_use]
    pub fn update_predictions(&self, peaks: &mut [Peak]) -> usize {
        let cell = self.cell.read().expect("cell poisoned").clone();
        let mut updated = 0;

        for peak in peaks.iter_mut() {
            if !peak.predicted() || !peak.enabled() {
                continue;
            }
            let Some(q) = peak.q() else {
                continue;
            };
            let hkl = cell.miller_index(&q);
            if !hkl.indexed(cell.indexing_tolerance()) {
                continue;
            }
            let center = peak.shape().center();
            if !self.batches.iter().any(|b| b.contains(center[2])) {
                continue;
            }

            let q_pred = cell.q_vector(&hkl);
            let events = peak.data().events_for_q(&q_pred);
            let nearest = events.into_iter().min_by(|a, b| {
                let da = (a.frame - center[2]).abs();
                let db = (b.frame - center[2]).abs();
                da.partial_cmp(&db).expect("finite frame")
            });
            match nearest {
                Some(event) => {
                    let mut shape = *peak.shape();
                    shape.set_center(Vector3::new(event.px, event.py, event.frame));
                    peak.set_shape(shape);
                    updated += 1;
                }
                None => {
                    peak.reject(RejectionFlag::PredictionUpdateFailure);
                }
            }
        }
        info!(updated, "predictions updated");
        updated
    }
}
