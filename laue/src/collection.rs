//! Owning table of peaks.

use crate::dataset::DataSet;
use crate::ellipsoid::Ellipsoid;
use crate::miller::MillerIndex;
use crate::peak::{Peak, RejectionFlag};
use crate::unit_cell::UnitCell;
use nalgebra::{Matrix3, Vector3};
use std::sync::{Arc, RwLock};
use tracing::info;

/// Provenance of a peak collection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PeakCollectionKind {
    /// Found by a peak search.
    Found,
    /// Predicted from a cell and instrument states.
    Predicted,
    /// Result of filtering another collection.
    Filtered,
    /// Externally supplied reference peaks.
    Reference,
}

/// An owning, named collection of peaks.
pub struct PeakCollection {
    name: String,
    kind: PeakCollectionKind,
    peaks: Vec<Peak>,
    unit_cell: Option<Arc<RwLock<UnitCell>>>,
    indexed: bool,
    integrated: bool,
    has_shape_model: bool,
}

impl PeakCollection {
    /// Empty collection.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: PeakCollectionKind) -> Self {
        Self {
            name: name.into(),
            kind,
            peaks: Vec::new(),
            unit_cell: None,
            indexed: false,
            integrated: false,
            has_shape_model: false,
        }
    }

    /// Collection name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Collection provenance.
    #[must_use]
    pub const fn kind(&self) -> PeakCollectionKind {
        self.kind
    }

    /// Add a peak.
    pub fn push(&mut self, peak: Peak) {
        self.peaks.push(peak);
    }

    /// Number of peaks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peaks.len()
    }

    /// Whether the collection is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peaks.is_empty()
    }

    /// Shared view of the peaks.
    #[must_use]
    pub fn peaks(&self) -> &[Peak] {
        &self.peaks
    }

    /// Mutable view of the peaks.
    #[must_use]
    pub fn peaks_mut(&mut self) -> &mut [Peak] {
        &mut self.peaks
    }

    /// The data set of the first peak, if any.
    #[must_use]
    pub fn data(&self) -> Option<Arc<DataSet>> {
        self.peaks.first().map(|p| Arc::clone(p.data()))
    }

    /// The collection's unit cell.
    #[must_use]
    pub fn unit_cell(&self) -> Option<Arc<RwLock<UnitCell>>> {
        self.unit_cell.clone()
    }

    /// Assign a unit cell to the collection and every peak in it.
    pub fn set_unit_cell(&mut self, cell: &Arc<RwLock<UnitCell>>) {
        self.unit_cell = Some(Arc::clone(cell));
        for peak in &mut self.peaks {
            peak.set_unit_cell(cell);
        }
    }

    /// Whether the collection has been indexed.
    #[must_use]
    pub const fn is_indexed(&self) -> bool {
        self.indexed
    }

    /// Record the indexing state.
    pub fn set_indexed(&mut self, indexed: bool) {
        self.indexed = indexed;
    }

    /// Whether the collection has been integrated.
    #[must_use]
    pub const fn is_integrated(&self) -> bool {
        self.integrated
    }

    /// Record the integration state.
    pub fn set_integrated(&mut self, integrated: bool) {
        self.integrated = integrated;
    }

    /// Whether a shape model has been built from this collection.
    #[must_use]
    pub const fn has_shape_model(&self) -> bool {
        self.has_shape_model
    }

    /// Record the shape-model state.
    pub fn set_has_shape_model(&mut self, has: bool) {
        self.has_shape_model = has;
    }

    /// Indices of the peaks caught by the last filter run.
    #[must_use]
    pub fn caught_indices(&self) -> Vec<usize> {
        self.peaks
            .iter()
            .enumerate()
            .filter_map(|(i, p)| p.caught_by_filter().then_some(i))
            .collect()
    }

    /// Clear all filter markings.
    pub fn reset_filter_marks(&mut self) {
        for peak in &mut self.peaks {
            peak.catch(false);
            peak.reject_by_filter(false);
        }
    }

    /// Compute Miller indices of every peak from its own cell.
    pub fn index_peaks(&mut self) {
        for peak in &mut self.peaks {
            peak.set_miller_indices();
        }
    }

    /// Mask every peak whose shape, scaled to its background end, collides
    /// with a detector mask of its data set. Returns the number masked.
    pub fn apply_detector_masks(&mut self) -> usize {
        let mut n_masked = 0;
        for peak in &mut self.peaks {
            let masks = peak.data().masks().to_vec();
            peak.set_masked(false);
            let shape = peak.shape().scaled(peak.bkg_end());
            let bb = shape.aabb(1.0);
            let lower = (bb.lower[0], bb.lower[1]);
            let upper = (bb.upper[0], bb.upper[1]);
            if masks.iter().any(|m| m.collides(lower, upper)) {
                peak.set_masked(true);
                n_masked += 1;
            }
        }
        info!(n_masked, collection = %self.name, "masked peaks");
        n_masked
    }

    /// Clone the caught peaks into a new collection.
    #[must_use]
    pub fn filtered(&self, name: impl Into<String>) -> Self {
        let mut out = Self::new(name, PeakCollectionKind::Filtered);
        out.unit_cell = self.unit_cell.clone();
        out.indexed = self.indexed;
        out.integrated = self.integrated;
        for peak in &self.peaks {
            if peak.caught_by_filter() {
                let mut copy = peak.clone();
                copy.catch(false);
                out.push(copy);
            }
        }
        out
    }
}

/// Parameters for peak prediction from a refined cell.
#[derive(Clone, Copy, Debug)]
pub struct PredictionParameters {
    /// Minimum d.
    pub d_min: f64,
    /// Maximum d.
    pub d_max: f64,
    /// In-plane shape radius of predicted peaks, pixels.
    pub radius: f64,
    /// Frame half-width of predicted peaks.
    pub frame_sigma: f64,
}

impl Default for PredictionParameters {
    fn default() -> Self {
        Self {
            d_min: 1.5,
            d_max: 50.0,
            radius: 2.5,
            frame_sigma: 1.0,
        }
    }
}

/// Predict the peaks of a cell on a data set: enumerate the reflections in
/// the d-range, trace each q back to detector events, and create a
/// predicted peak at every event.
#[must_use]
pub fn predict_peaks(
    data: &Arc<DataSet>,
    cell: &Arc<RwLock<UnitCell>>,
    params: &PredictionParameters,
) -> PeakCollection {
    let mut collection = PeakCollection::new("predicted", PeakCollectionKind::Predicted);
    let metric = Matrix3::from_diagonal(&Vector3::new(
        1.0 / (params.radius * params.radius),
        1.0 / (params.radius * params.radius),
        1.0 / (params.frame_sigma * params.frame_sigma),
    ));

    let (reflections, group_extinct): (Vec<MillerIndex>, Vec<bool>) = {
        let cell_ref = cell.read().expect("cell poisoned");
        let reflections =
            cell_ref.reflections_in_shell(params.d_min, params.d_max, data.wavelength());
        let extinct = reflections
            .iter()
            .map(|hkl| cell_ref.space_group().is_extinct(hkl))
            .collect();
        (reflections, extinct)
    };

    for (hkl, extinct) in reflections.into_iter().zip(group_extinct) {
        if extinct {
            continue;
        }
        let q = cell.read().expect("cell poisoned").q_vector(&hkl);
        for event in data.events_for_q(&q) {
            let center = Vector3::new(event.px, event.py, event.frame);
            let mut peak = Peak::new(Arc::clone(data), Ellipsoid::new(center, metric));
            peak.set_predicted(true);
            peak.set_unit_cell(cell);
            peak.set_hkl(hkl);
            collection.push(peak);
        }
    }

    collection.set_unit_cell(cell);
    collection.set_indexed(true);
    info!(
        n_peaks = collection.len(),
        "predicted peaks in resolution shell"
    );
    collection
}

/// Reject every peak of the collection that is extinct in the group of its
/// own cell. Returns the number rejected.
pub fn reject_extinct(collection: &mut PeakCollection) -> usize {
    let mut n = 0;
    for peak in collection.peaks_mut() {
        let Some(cell) = peak.unit_cell() else {
            continue;
        };
        let extinct = cell
            .read()
            .expect("cell poisoned")
            .space_group()
            .is_extinct(peak.hkl());
        if extinct {
            peak.reject(RejectionFlag::Extinct);
            n += 1;
        }
    }
    n
}

/// Clear leftover filter state and return peaks to a selected state,
/// preserving masks.
pub fn reselect_all(collection: &mut PeakCollection) {
    for peak in collection.peaks_mut() {
        if !peak.masked() {
            peak.set_selected(true);
        }
        peak.catch(false);
        peak.reject_by_filter(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::{Detector, InstrumentState};
    use nalgebra::UnitQuaternion;
    use ndarray::Array2;

    fn test_data() -> Arc<DataSet> {
        let detector = Detector::new(64, 64, 1.0, 1.0, 200.0);
        let frames = vec![Array2::zeros((64, 64)); 12];
        let states = (0..12)
            .map(|i| {
                let angle = f64::from(i) * 0.3_f64.to_radians();
                InstrumentState::new(
                    UnitQuaternion::from_axis_angle(&Vector3::z_axis(), angle),
                    1.5,
                )
            })
            .collect();
        Arc::new(DataSet::new("scan", detector, frames, states).unwrap())
    }

    #[test]
    fn cell_assignment_reaches_all_peaks() {
        let data = test_data();
        let mut collection = PeakCollection::new("found", PeakCollectionKind::Found);
        for i in 0..4 {
            collection.push(Peak::new(
                Arc::clone(&data),
                Ellipsoid::sphere(Vector3::new(20.0 + f64::from(i), 20.0, 5.0), 2.0),
            ));
        }
        let cell = Arc::new(RwLock::new(
            UnitCell::from_parameters(10.0, 10.0, 10.0, 1.5708, 1.5708, 1.5708).unwrap(),
        ));
        collection.set_unit_cell(&cell);
        assert!(collection.peaks().iter().all(|p| p.unit_cell().is_some()));
        assert!(collection.unit_cell().is_some());
    }

    #[test]
    fn filtered_copy_keeps_only_caught() {
        let data = test_data();
        let mut collection = PeakCollection::new("found", PeakCollectionKind::Found);
        for i in 0..3 {
            collection.push(Peak::new(
                Arc::clone(&data),
                Ellipsoid::sphere(Vector3::new(20.0, 20.0 + f64::from(i), 5.0), 2.0),
            ));
        }
        collection.peaks_mut()[0].catch(true);
        collection.peaks_mut()[2].catch(true);
        collection.peaks_mut()[2].reject_by_filter(true);

        let filtered = collection.filtered("subset");
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered.kind(), PeakCollectionKind::Filtered);
    }

    #[test]
    fn detector_masks_mask_overlapping_peaks() {
        let mut data_inner = DataSet::new(
            "scan",
            Detector::new(64, 64, 1.0, 1.0, 200.0),
            vec![Array2::zeros((64, 64)); 12],
            (0..12)
                .map(|i| {
                    let angle = f64::from(i) * 0.3_f64.to_radians();
                    InstrumentState::new(
                        UnitQuaternion::from_axis_angle(&Vector3::z_axis(), angle),
                        1.5,
                    )
                })
                .collect(),
        )
        .unwrap();
        data_inner.add_mask(crate::dataset::DetectorMask {
            lower: (0.0, 0.0),
            upper: (15.0, 15.0),
        });
        let data = Arc::new(data_inner);

        let mut collection = PeakCollection::new("found", PeakCollectionKind::Found);
        collection.push(Peak::new(
            Arc::clone(&data),
            Ellipsoid::sphere(Vector3::new(12.0, 12.0, 5.0), 1.0),
        ));
        collection.push(Peak::new(
            Arc::clone(&data),
            Ellipsoid::sphere(Vector3::new(50.0, 50.0, 5.0), 1.0),
        ));
        assert_eq!(collection.apply_detector_masks(), 1);
        assert!(collection.peaks()[0].masked());
        assert!(!collection.peaks()[1].masked());
    }

    #[test]
    fn prediction_creates_indexed_peaks() {
        let data = test_data();
        let cell = Arc::new(RwLock::new(
            UnitCell::from_parameters(8.0, 8.0, 8.0, 1.5708, 1.5708, 1.5708).unwrap(),
        ));
        let params = PredictionParameters {
            d_min: 2.0,
            d_max: 10.0,
            radius: 2.0,
            frame_sigma: 0.8,
        };
        let predicted = predict_peaks(&data, &cell, &params);
        assert_eq!(predicted.kind(), PeakCollectionKind::Predicted);
        for peak in predicted.peaks() {
            assert!(peak.predicted());
            assert!(!peak.hkl().is_null());
        }
    }
}
