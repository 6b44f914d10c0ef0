//! Predicate-based peak filtering.

use crate::collection::PeakCollection;
use crate::merge::MergedPeakCollection;
use crate::octree::Octree;
use crate::peak::{Peak, RejectionFlag};
use crate::unit_cell::UnitCell;
use nalgebra::Vector3;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Which predicates a filter run applies.
#[derive(Clone, Copy, Debug, Default)]
#[allow(clippy::struct_excessive_bools, missing_docs)]
pub struct PeakFilterFlags {
    pub enabled: bool,
    pub masked: bool,
    pub has_unit_cell: bool,
    pub unit_cell: bool,
    pub indexed: bool,
    pub index_tolerance: bool,
    pub strength: bool,
    pub d_range: bool,
    pub intensity: bool,
    pub sigma: bool,
    pub gradient: bool,
    pub frame_range: bool,
    pub rejection_flag: bool,
    pub overlapping: bool,
    pub extinct: bool,
    pub significance: bool,
    pub sparse: bool,
}

/// Thresholds and ranges consumed by the predicates.
#[derive(Clone, Debug)]
#[allow(missing_docs)]
pub struct PeakFilterParameters {
    pub d_min: f64,
    pub d_max: f64,
    pub strength_min: f64,
    pub strength_max: f64,
    pub peak_end: f64,
    pub bkg_end: f64,
    pub unit_cell_tolerance: f64,
    pub unit_cell: String,
    pub significance: f64,
    pub sparse: usize,
    pub first_frame: f64,
    pub last_frame: f64,
    pub rejection_flag: RejectionFlag,
    pub intensity_min: f64,
    pub intensity_max: f64,
    pub sigma_min: f64,
    pub sigma_max: f64,
    pub gradient_min: f64,
    pub gradient_max: f64,
    pub gradient_sigma_min: f64,
    pub gradient_sigma_max: f64,
    pub sum_intensities: bool,
    pub friedel: bool,
}

impl Default for PeakFilterParameters {
    fn default() -> Self {
        Self {
            d_min: 0.0,
            d_max: 100.0,
            strength_min: 1.0,
            strength_max: f64::INFINITY,
            peak_end: 3.0,
            bkg_end: 6.0,
            unit_cell_tolerance: 0.2,
            unit_cell: String::new(),
            significance: 0.99,
            sparse: 10,
            first_frame: 0.0,
            last_frame: f64::INFINITY,
            rejection_flag: RejectionFlag::NotRejected,
            intensity_min: 0.0,
            intensity_max: f64::INFINITY,
            sigma_min: 0.0,
            sigma_max: f64::INFINITY,
            gradient_min: 0.0,
            gradient_max: f64::INFINITY,
            gradient_sigma_min: 0.0,
            gradient_sigma_max: f64::INFINITY,
            sum_intensities: true,
            friedel: true,
        }
    }
}

/// Composition of boolean predicates over a peak collection. Each enabled
/// predicate marks peaks as caught or rejected; the caught set is the
/// conjunction of all enabled predicates.
#[derive(Clone, Debug, Default)]
pub struct PeakFilter {
    /// Predicate switches.
    pub flags: PeakFilterFlags,
    /// Predicate inputs.
    pub params: PeakFilterParameters,
}

impl PeakFilter {
    /// Filter with everything switched off.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn intensity_of(&self, peak: &Peak) -> crate::intensity::Intensity {
        if self.params.sum_intensities {
            peak.corrected_sum_intensity()
        } else {
            peak.corrected_profile_intensity()
        }
    }

    /// Run every enabled predicate over the collection, marking peaks.
    /// Returns the number of caught peaks.
    pub fn filter(&self, collection: &mut PeakCollection) -> usize {
        for peak in collection.peaks_mut() {
            peak.catch(true);
            peak.reject_by_filter(false);
        }

        if self.flags.enabled {
            self.mark(collection, |_, peak| peak.enabled());
        }
        if self.flags.masked {
            self.mark(collection, |_, peak| !peak.masked());
        }
        if self.flags.has_unit_cell {
            self.mark(collection, |_, peak| peak.unit_cell().is_some());
        }
        if self.flags.unit_cell {
            self.mark(collection, |params, peak| {
                peak.unit_cell().is_some_and(|cell| {
                    cell.read().expect("cell poisoned").name() == params.unit_cell
                })
            });
        }
        if self.flags.indexed {
            self.mark(collection, |_, peak| {
                peak.unit_cell().is_some_and(|cell| {
                    let tolerance = cell.read().expect("cell poisoned").indexing_tolerance();
                    peak.hkl().indexed(tolerance)
                })
            });
        }
        if self.flags.index_tolerance {
            self.mark(collection, |params, peak| {
                peak.hkl().indexed(params.unit_cell_tolerance)
            });
        }
        if self.flags.strength {
            self.mark(collection, |params, peak| {
                let intensity = self.intensity_of(peak);
                if !intensity.is_valid() || intensity.sigma() < 1e-6 {
                    return false;
                }
                let strength = intensity.strength();
                strength >= params.strength_min && strength <= params.strength_max
            });
        }
        if self.flags.d_range {
            self.mark(collection, |params, peak| {
                peak.d()
                    .is_some_and(|d| d >= params.d_min && d <= params.d_max)
            });
        }
        if self.flags.intensity {
            self.mark(collection, |params, peak| {
                let intensity = self.intensity_of(peak);
                intensity.is_valid()
                    && intensity.value() >= params.intensity_min
                    && intensity.value() <= params.intensity_max
            });
        }
        if self.flags.sigma {
            self.mark(collection, |params, peak| {
                let intensity = self.intensity_of(peak);
                intensity.is_valid()
                    && intensity.sigma() >= params.sigma_min
                    && intensity.sigma() <= params.sigma_max
            });
        }
        if self.flags.gradient {
            self.mark(collection, |params, peak| {
                let gradient = peak.mean_bkg_gradient();
                gradient.is_valid()
                    && gradient.value() >= params.gradient_min
                    && gradient.value() <= params.gradient_max
                    && gradient.sigma() >= params.gradient_sigma_min
                    && gradient.sigma() <= params.gradient_sigma_max
            });
        }
        if self.flags.frame_range {
            self.mark(collection, |params, peak| {
                let frame = peak.shape().center()[2];
                frame >= params.first_frame && frame <= params.last_frame
            });
        }
        if self.flags.rejection_flag {
            self.mark(collection, |params, peak| {
                peak.rejection_flag() == params.rejection_flag
            });
        }
        if self.flags.overlapping {
            self.filter_overlapping(collection);
        }
        if self.flags.extinct {
            self.filter_extinct(collection);
        }
        if self.flags.significance {
            self.filter_significance(collection);
        }
        if self.flags.sparse {
            self.filter_sparse(collection);
        }

        let caught = collection.caught_indices().len();
        info!(
            caught,
            total = collection.len(),
            "peak filter finished"
        );
        caught
    }

    fn mark<F>(&self, collection: &mut PeakCollection, predicate: F)
    where
        F: Fn(&PeakFilterParameters, &Peak) -> bool,
    {
        for peak in collection.peaks_mut() {
            if predicate(&self.params, peak) {
                peak.catch(true);
            } else {
                peak.reject_by_filter(true);
            }
        }
    }

    /// Reject both members of every pair whose scaled shapes collide, via
    /// an octree over the shape bounding boxes.
    fn filter_overlapping(&self, collection: &mut PeakCollection) {
        if collection.is_empty() {
            return;
        }
        let mut lower = Vector3::from_element(f64::INFINITY);
        let mut upper = Vector3::from_element(f64::NEG_INFINITY);
        for peak in collection.peaks() {
            let c = peak.shape().center();
            for i in 0..3 {
                lower[i] = lower[i].min(c[i]);
                upper[i] = upper[i].max(c[i]);
            }
        }
        // pad so every scaled shape fits the world box
        let pad = Vector3::from_element(1.0 + self.params.bkg_end * 50.0);
        let mut tree = Octree::new(lower - pad, upper + pad, self.params.bkg_end);
        for peak in collection.peaks() {
            tree.insert(*peak.shape());
        }

        let mut n_rejected = 0;
        for (a, b) in tree.collisions(self.params.peak_end, self.params.bkg_end) {
            for idx in [a, b] {
                let peak = &mut collection.peaks_mut()[idx];
                if !peak.rejected_by_filter() {
                    peak.reject_by_filter(true);
                    n_rejected += 1;
                }
            }
        }
        info!(n_rejected, "overlapping peaks rejected");
    }

    /// Reject peaks extinct under the space group of their cell.
    fn filter_extinct(&self, collection: &mut PeakCollection) {
        let mut n_rejected = 0;
        for peak in collection.peaks_mut() {
            let Some(cell) = peak.unit_cell() else {
                peak.reject_by_filter(true);
                continue;
            };
            let extinct = cell
                .read()
                .expect("cell poisoned")
                .space_group()
                .is_extinct(peak.hkl());
            if extinct {
                peak.reject_by_filter(true);
                n_rejected += 1;
            }
        }
        info!(n_rejected, "extinct peaks rejected");
    }

    /// Reject all observations of merged reflections whose chi-squared
    /// p-value exceeds the significance threshold.
    fn filter_significance(&self, collection: &mut PeakCollection) {
        let Some(cell) = collection.unit_cell() else {
            return;
        };
        let group = cell.read().expect("cell poisoned").space_group().clone();
        let mut merged =
            MergedPeakCollection::new(group, self.params.friedel, self.params.sum_intensities);
        merged.add_collection(collection);

        let mut bad: Vec<crate::miller::MillerIndex> = Vec::new();
        for peak in merged.merged_peaks() {
            if peak.p_value() > self.params.significance {
                bad.push(*peak.index());
            }
        }

        let group = cell.read().expect("cell poisoned").space_group().clone();
        let friedel = self.params.friedel;
        let mut n_rejected = 0;
        for peak in collection.peaks_mut() {
            let representative = group.representative(peak.hkl(), friedel);
            if bad.contains(&representative) {
                peak.reject_by_filter(true);
                n_rejected += 1;
            }
        }
        info!(n_rejected, "insignificant peaks rejected");
    }

    /// Reject every peak of data sets carrying fewer peaks than the
    /// sparsity threshold.
    fn filter_sparse(&self, collection: &mut PeakCollection) {
        let mut per_dataset: HashMap<usize, usize> = HashMap::new();
        let keys: Vec<usize> = collection
            .peaks()
            .iter()
            .map(|p| Arc::as_ptr(p.data()) as usize)
            .collect();
        for &key in &keys {
            *per_dataset.entry(key).or_insert(0) += 1;
        }
        for (peak, key) in collection.peaks_mut().iter_mut().zip(keys) {
            if per_dataset[&key] <= self.params.sparse {
                peak.reject_by_filter(true);
            }
        }
    }
}

/// Free-function helpers used by the indexer: subset indices rather than
/// collection marking.
pub mod select {
    use super::{Peak, UnitCell};
    use crate::instrument::InstrumentState;

    /// Indices of the enabled peaks.
    #[must_use]
    pub fn enabled(peaks: &[Peak]) -> Vec<usize> {
        peaks
            .iter()
            .enumerate()
            .filter_map(|(i, p)| p.enabled().then_some(i))
            .collect()
    }

    /// Indices of peaks whose frame coordinate lies in the range.
    #[must_use]
    pub fn frame_range(peaks: &[Peak], indices: &[usize], first: f64, last: f64) -> Vec<usize> {
        indices
            .iter()
            .copied()
            .filter(|&i| {
                let f = peaks[i].shape().center()[2];
                f >= first && f <= last
            })
            .collect()
    }

    /// Indices with resolution inside `[d_min, d_max]`.
    #[must_use]
    pub fn d_range(
        peaks: &[Peak],
        indices: &[usize],
        d_min: f64,
        d_max: f64,
        state: Option<&InstrumentState>,
    ) -> Vec<usize> {
        indices
            .iter()
            .copied()
            .filter(|&i| {
                let q = state.map_or_else(
                    || peaks[i].q(),
                    |s| Some(peaks[i].q_with_state(s)),
                );
                q.is_some_and(|q| {
                    let d = 1.0 / q.norm();
                    d >= d_min && d <= d_max
                })
            })
            .collect()
    }

    /// Indices with corrected sum strength inside the range.
    #[must_use]
    pub fn strength(peaks: &[Peak], indices: &[usize], min: f64, max: f64) -> Vec<usize> {
        indices
            .iter()
            .copied()
            .filter(|&i| {
                let intensity = peaks[i].corrected_sum_intensity();
                if !intensity.is_valid() || intensity.sigma() < 1e-6 {
                    return false;
                }
                let s = intensity.strength();
                s >= min && s <= max
            })
            .collect()
    }

    /// Indices indexed by the given cell within its tolerance.
    #[must_use]
    pub fn indexed(
        peaks: &[Peak],
        indices: &[usize],
        cell: &UnitCell,
        state: Option<&InstrumentState>,
    ) -> Vec<usize> {
        indices
            .iter()
            .copied()
            .filter(|&i| {
                let q = state.map_or_else(
                    || peaks[i].q(),
                    |s| Some(peaks[i].q_with_state(s)),
                );
                q.is_some_and(|q| cell.miller_index(&q).indexed(cell.indexing_tolerance()))
            })
            .collect()
    }
}
