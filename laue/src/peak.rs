//! The peak entity: shape, intensities, rejection state.

use crate::dataset::DataSet;
use crate::ellipsoid::Ellipsoid;
use crate::error::{Error, Result};
use crate::instrument::InstrumentState;
use crate::intensity::Intensity;
use crate::miller::MillerIndex;
use crate::region::RegionType;
use crate::unit_cell::UnitCell;
use bitflags::bitflags;
use nalgebra::RowVector3;
use std::sync::{Arc, RwLock, Weak};

/// Why a peak was excluded from further processing.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[allow(missing_docs)]
pub enum RejectionFlag {
    #[default]
    NotRejected,
    Masked,
    OutsideThreshold,
    OutsideFrames,
    OutsideDetector,
    TooFewPoints,
    NoNeighbours,
    NoUnitCell,
    NoDataSet,
    InvalidRegion,
    InterpolationFailure,
    InvalidSigma,
    InvalidBkgSigma,
    SaturatedPixel,
    OverlappingBkg,
    OverlappingPeak,
    InvalidCentroid,
    InvalidCovariance,
    InvalidShape,
    CentreOutOfBounds,
    BadIntegrationFit,
    NoShapeModel,
    NoISigmaMinimum,
    TooWide,
    BadGaussianFit,
    PredictionUpdateFailure,
    ManuallyRejected,
    OutsideIndexingTol,
    Outlier,
    Extinct,
}

impl RejectionFlag {
    /// Human-readable reason.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::NotRejected => "not rejected",
            Self::Masked => "masked by user",
            Self::OutsideThreshold => "too many or few detector counts",
            Self::OutsideFrames => "peak centre outside frame range",
            Self::OutsideDetector => "peak centre outside detector image",
            Self::TooFewPoints => "too few points to integrate",
            Self::NoNeighbours => "no neighbouring profiles to compute shape",
            Self::NoUnitCell => "no unit cell assigned",
            Self::NoDataSet => "no associated data set",
            Self::InvalidRegion => "integration region extends beyond image or frame range",
            Self::InterpolationFailure => "frame coordinate interpolation failed",
            Self::InvalidSigma => "negative, zero, or undefined sigma",
            Self::InvalidBkgSigma => "negative, zero, or undefined background sigma",
            Self::SaturatedPixel => "peak contains saturated pixels",
            Self::OverlappingBkg => "adjacent peak background region overlaps this peak",
            Self::OverlappingPeak => "adjacent peak intensity region overlaps this peak",
            Self::InvalidCentroid => "centre of mass of peak is inconsistent",
            Self::InvalidCovariance => "covariance matrix of peak is inconsistent",
            Self::InvalidShape => "shape of peak is too small or large",
            Self::CentreOutOfBounds => "peak centre moved beyond bounds of data set",
            Self::BadIntegrationFit => "correlation coefficient of fit is too low",
            Self::NoShapeModel => "no shape model found",
            Self::NoISigmaMinimum => "failed to find minimum of I/sigma",
            Self::TooWide => "peak is too wide",
            Self::BadGaussianFit => "Gaussian fit failed",
            Self::PredictionUpdateFailure => "failed to update prediction after refinement",
            Self::ManuallyRejected => "manually unselected by user",
            Self::OutsideIndexingTol => "outside indexing tolerance",
            Self::Outlier => "rejected by outlier detection",
            Self::Extinct => "systematically extinct in the space group",
        }
    }
}

/// Which integrator produced a result.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IntegratorKind {
    /// Plain pixel sums with mean background.
    PixelSum,
    /// 3D Gaussian fit.
    Gaussian,
    /// 1D radial profile fitting.
    Profile1D,
    /// Mean-shape profile fitting.
    ShapeProfile,
}

bitflags! {
    /// Peak status bits.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct PeakFlags: u8 {
        /// The peak survives selection.
        const SELECTED = 1;
        /// The peak is covered by a detector mask.
        const MASKED = 1 << 1;
        /// The peak was predicted rather than found.
        const PREDICTED = 1 << 2;
        /// The last filter run caught this peak.
        const CAUGHT = 1 << 3;
        /// The last filter run rejected this peak.
        const REJECTED_BY_FILTER = 1 << 4;
    }
}

/// A Bragg peak on the detector.
///
/// The shape lives in detector coordinates (column, row, frame). Sum- and
/// profile-integrated intensities are stored raw; corrections (scale,
/// Lorentz, transmission, rotation step) are applied on read. A peak never
/// owns its unit cell; the reference is weak and must be promoted before
/// use.
#[derive(Clone, Debug)]
pub struct Peak {
    shape: Ellipsoid,
    data: Arc<DataSet>,
    unit_cell: Weak<RwLock<UnitCell>>,
    sum_intensity: Intensity,
    profile_intensity: Intensity,
    sum_background: Intensity,
    profile_background: Intensity,
    mean_bkg_gradient: Intensity,
    rocking_curve: Vec<Intensity>,
    hkl: MillerIndex,
    peak_end: f64,
    bkg_begin: f64,
    bkg_end: f64,
    region_type: RegionType,
    scale: f64,
    transmission: f64,
    rejection_flag: RejectionFlag,
    sum_integration_flag: RejectionFlag,
    profile_integration_flag: RejectionFlag,
    flags: PeakFlags,
}

impl Peak {
    /// Create a peak belonging to a data set, with the given detector
    /// shape. A centre outside the data volume immediately rejects the
    /// peak with `OutsideFrames`.
    #[must_use]
    pub fn new(data: Arc<DataSet>, shape: Ellipsoid) -> Self {
        let mut peak = Self {
            shape,
            data,
            unit_cell: Weak::new(),
            sum_intensity: Intensity::default(),
            profile_intensity: Intensity::default(),
            sum_background: Intensity::default(),
            profile_background: Intensity::default(),
            mean_bkg_gradient: Intensity::default(),
            rocking_curve: Vec::new(),
            hkl: MillerIndex::default(),
            peak_end: 3.0,
            bkg_begin: 3.0,
            bkg_end: 6.0,
            region_type: RegionType::VariableEllipsoid,
            scale: 1.0,
            transmission: 1.0,
            rejection_flag: RejectionFlag::NotRejected,
            sum_integration_flag: RejectionFlag::NotRejected,
            profile_integration_flag: RejectionFlag::NotRejected,
            flags: PeakFlags::SELECTED,
        };
        peak.check_bounds();
        peak
    }

    fn check_bounds(&mut self) {
        let c = self.shape.center();
        #[allow(clippy::cast_precision_loss)]
        let inside = c[0] >= 0.0
            && c[0] <= self.data.ncols() as f64 - 1.0
            && c[1] >= 0.0
            && c[1] <= self.data.nrows() as f64 - 1.0
            && c[2] >= 0.0
            && c[2] <= self.data.nframes() as f64 - 1.0;
        if !inside {
            self.reject(RejectionFlag::OutsideFrames);
        }
    }

    /// The data set this peak belongs to.
    #[must_use]
    pub fn data(&self) -> &Arc<DataSet> {
        &self.data
    }

    /// Detector-space shape.
    #[must_use]
    pub const fn shape(&self) -> &Ellipsoid {
        &self.shape
    }

    /// Replace the shape, re-checking the data bounds.
    pub fn set_shape(&mut self, shape: Ellipsoid) {
        self.shape = shape;
        self.check_bounds();
    }

    /// Assign the unit cell (held weakly).
    pub fn set_unit_cell(&mut self, cell: &Arc<RwLock<UnitCell>>) {
        self.unit_cell = Arc::downgrade(cell);
    }

    /// Promote the unit-cell reference; `None` when the cell is gone or
    /// was never assigned.
    #[must_use]
    pub fn unit_cell(&self) -> Option<Arc<RwLock<UnitCell>>> {
        self.unit_cell.upgrade()
    }

    /// Scattering vector at the peak centre, `None` on interpolation
    /// failure.
    #[must_use]
    pub fn q(&self) -> Option<RowVector3<f64>> {
        let c = self.shape.center();
        let state = self.data.interpolated_state(c[2]);
        state
            .is_valid()
            .then(|| state.sample_q(self.data.detector(), c[0], c[1]))
    }

    /// Scattering vector computed against an explicit state, for
    /// single-frame work where interpolation is unwanted.
    #[must_use]
    pub fn q_with_state(&self, state: &InstrumentState) -> RowVector3<f64> {
        let c = self.shape.center();
        state.sample_q(self.data.detector(), c[0], c[1])
    }

    /// Resolution (d spacing) of the peak, `None` on interpolation
    /// failure.
    #[must_use]
    pub fn d(&self) -> Option<f64> {
        self.q().map(|q| 1.0 / q.norm())
    }

    /// The peak shape mapped to q space through the Jacobian of the
    /// detector-to-q transformation.
    ///
    /// # Errors
    ///
    /// [`Error::Domain`] when the interpolated state is invalid or the
    /// Jacobian is singular.
    pub fn q_shape(&self) -> Result<Ellipsoid> {
        let c = self.shape.center();
        let state = self.data.interpolated_state(c[2]);
        if !state.is_valid() {
            return Err(Error::Domain("interpolation failure at peak centre".into()));
        }
        let q0 = state.sample_q(self.data.detector(), c[0], c[1]);
        let j = state.jacobian_q(self.data.detector(), c[0], c[1]);
        let j_inv = j
            .try_inverse()
            .ok_or_else(|| Error::Numerical("singular detector-to-q Jacobian".into()))?;
        let metric = j_inv.transpose() * self.shape.metric() * j_inv;
        Ok(Ellipsoid::new(
            nalgebra::Vector3::new(q0[0], q0[1], q0[2]),
            metric,
        ))
    }

    /// Compute and store the Miller index from the assigned cell. Without
    /// a valid q the peak is rejected with `InterpolationFailure`.
    pub fn set_miller_indices(&mut self) {
        let Some(cell) = self.unit_cell() else {
            return;
        };
        if let Some(q) = self.q() {
            self.hkl = cell.read().expect("cell poisoned").miller_index(&q);
        } else {
            self.hkl = MillerIndex::default();
            self.reject(RejectionFlag::InterpolationFailure);
        }
    }

    /// Set the Miller index directly (importer use only).
    pub fn set_hkl(&mut self, hkl: MillerIndex) {
        self.hkl = hkl;
    }

    /// The stored Miller index.
    #[must_use]
    pub const fn hkl(&self) -> &MillerIndex {
        &self.hkl
    }

    /// Raw pixel-sum intensity.
    #[must_use]
    pub const fn sum_intensity(&self) -> Intensity {
        self.sum_intensity
    }

    /// Raw profile intensity.
    #[must_use]
    pub const fn profile_intensity(&self) -> Intensity {
        self.profile_intensity
    }

    /// Pixel-sum background.
    #[must_use]
    pub const fn sum_background(&self) -> Intensity {
        self.sum_background
    }

    /// Profile background.
    #[must_use]
    pub const fn profile_background(&self) -> Intensity {
        self.profile_background
    }

    /// Mean background gradient.
    #[must_use]
    pub const fn mean_bkg_gradient(&self) -> Intensity {
        self.mean_bkg_gradient
    }

    /// Rocking curve from the last integration.
    #[must_use]
    pub fn rocking_curve(&self) -> &[Intensity] {
        &self.rocking_curve
    }

    /// Apply scale, Lorentz, transmission, and rotation-step corrections
    /// to a raw intensity. Invalid when the state cannot be interpolated.
    #[must_use]
    pub fn corrected_intensity(&self, raw: Intensity) -> Intensity {
        let c = self.shape.center();
        let state = self.data.interpolated_state(c[2]);
        if !state.is_valid() || state.step <= 0.0 {
            return Intensity::default();
        }
        let lorentz = state.lorentz_factor(self.data.detector(), c[0], c[1]);
        raw * (self.scale / (lorentz * self.transmission * state.step))
    }

    /// Corrected pixel-sum intensity.
    #[must_use]
    pub fn corrected_sum_intensity(&self) -> Intensity {
        self.corrected_intensity(self.sum_intensity)
    }

    /// Corrected profile intensity.
    #[must_use]
    pub fn corrected_profile_intensity(&self) -> Intensity {
        self.corrected_intensity(self.profile_intensity)
    }

    /// Shape scale at the peak boundary.
    #[must_use]
    pub const fn peak_end(&self) -> f64 {
        self.peak_end
    }

    /// Shape scale at the start of the background shell.
    #[must_use]
    pub const fn bkg_begin(&self) -> f64 {
        self.bkg_begin
    }

    /// Shape scale at the end of the background shell.
    #[must_use]
    pub const fn bkg_end(&self) -> f64 {
        self.bkg_end
    }

    /// Region type used for the last integration.
    #[must_use]
    pub const fn region_type(&self) -> RegionType {
        self.region_type
    }

    /// Per-peak scale factor.
    #[must_use]
    pub const fn scale(&self) -> f64 {
        self.scale
    }

    /// Set the per-peak scale factor.
    pub fn set_scale(&mut self, scale: f64) {
        self.scale = scale;
    }

    /// Transmission factor.
    #[must_use]
    pub const fn transmission(&self) -> f64 {
        self.transmission
    }

    /// Set the transmission factor.
    pub fn set_transmission(&mut self, transmission: f64) {
        self.transmission = transmission;
    }

    /// Whether the peak takes part in processing: selected and not masked.
    #[must_use]
    pub const fn enabled(&self) -> bool {
        self.flags.contains(PeakFlags::SELECTED) && !self.flags.contains(PeakFlags::MASKED)
    }

    /// Deselect with a reason. `NotRejected` clears nothing.
    pub fn reject(&mut self, flag: RejectionFlag) {
        self.flags.remove(PeakFlags::SELECTED);
        if self.rejection_flag == RejectionFlag::NotRejected {
            self.rejection_flag = flag;
        }
    }

    /// Re-select the peak, clearing the pre-integration flag.
    pub fn set_selected(&mut self, selected: bool) {
        if selected {
            self.flags.insert(PeakFlags::SELECTED);
            self.rejection_flag = RejectionFlag::NotRejected;
        } else {
            self.flags.remove(PeakFlags::SELECTED);
        }
    }

    /// Mark or unmark as masked.
    pub fn set_masked(&mut self, masked: bool) {
        self.flags.set(PeakFlags::MASKED, masked);
        if masked {
            self.rejection_flag = RejectionFlag::Masked;
        } else if self.rejection_flag == RejectionFlag::Masked {
            self.rejection_flag = RejectionFlag::NotRejected;
        }
    }

    /// Whether the peak is masked.
    #[must_use]
    pub const fn masked(&self) -> bool {
        self.flags.contains(PeakFlags::MASKED)
    }

    /// Mark as predicted or found.
    pub fn set_predicted(&mut self, predicted: bool) {
        self.flags.set(PeakFlags::PREDICTED, predicted);
    }

    /// Whether the peak was predicted.
    #[must_use]
    pub const fn predicted(&self) -> bool {
        self.flags.contains(PeakFlags::PREDICTED)
    }

    /// Filter marking: caught.
    pub fn catch(&mut self, caught: bool) {
        self.flags.set(PeakFlags::CAUGHT, caught);
    }

    /// Filter marking: rejected.
    pub fn reject_by_filter(&mut self, rejected: bool) {
        self.flags.set(PeakFlags::REJECTED_BY_FILTER, rejected);
    }

    /// Whether the last filter caught this peak (a filter rejection
    /// overrides).
    #[must_use]
    pub const fn caught_by_filter(&self) -> bool {
        !self.flags.contains(PeakFlags::REJECTED_BY_FILTER)
            && self.flags.contains(PeakFlags::CAUGHT)
    }

    /// Whether the last filter rejected this peak.
    #[must_use]
    pub const fn rejected_by_filter(&self) -> bool {
        self.flags.contains(PeakFlags::REJECTED_BY_FILTER)
    }

    /// Set the pre-integration rejection flag.
    pub fn set_rejection_flag(&mut self, flag: RejectionFlag, overwrite: bool) {
        if overwrite || self.rejection_flag == RejectionFlag::NotRejected {
            self.rejection_flag = flag;
        }
    }

    /// Set the flag slot of the given integrator family.
    pub fn set_integration_flag(&mut self, flag: RejectionFlag, integrator: IntegratorKind) {
        match integrator {
            IntegratorKind::PixelSum | IntegratorKind::Gaussian => {
                self.sum_integration_flag = flag;
            }
            IntegratorKind::Profile1D | IntegratorKind::ShapeProfile => {
                self.profile_integration_flag = flag;
            }
        }
    }

    /// The effective flag: first non-clean slot in the order
    /// pre-integration, sum, profile.
    #[must_use]
    pub fn rejection_flag(&self) -> RejectionFlag {
        for flag in [
            self.rejection_flag,
            self.sum_integration_flag,
            self.profile_integration_flag,
        ] {
            if flag != RejectionFlag::NotRejected {
                return flag;
            }
        }
        RejectionFlag::NotRejected
    }

    /// The pre-integration flag alone.
    #[must_use]
    pub const fn pre_integration_flag(&self) -> RejectionFlag {
        self.rejection_flag
    }

    /// Sum-integration flag, falling back to the pre-integration flag.
    #[must_use]
    pub fn sum_rejection_flag(&self) -> RejectionFlag {
        if self.rejection_flag == RejectionFlag::NotRejected {
            self.sum_integration_flag
        } else {
            self.rejection_flag
        }
    }

    /// Profile-integration flag, falling back to the pre-integration flag.
    #[must_use]
    pub fn profile_rejection_flag(&self) -> RejectionFlag {
        if self.rejection_flag == RejectionFlag::NotRejected {
            self.profile_integration_flag
        } else {
            self.rejection_flag
        }
    }

    /// Whether any slot carries the given flag.
    #[must_use]
    pub fn is_rejected_for(&self, flag: RejectionFlag) -> bool {
        self.rejection_flag == flag
            || self.sum_integration_flag == flag
            || self.profile_integration_flag == flag
    }

    /// Human-readable rejection reason.
    #[must_use]
    pub fn rejection_string(&self) -> &'static str {
        self.rejection_flag().description()
    }

    /// Clear the result slot of an integrator family before re-running.
    pub fn reset_integration(&mut self, integrator: IntegratorKind) {
        match integrator {
            IntegratorKind::PixelSum | IntegratorKind::Gaussian => {
                self.sum_integration_flag = RejectionFlag::NotRejected;
                self.sum_intensity = Intensity::default();
                self.sum_background = Intensity::default();
            }
            IntegratorKind::Profile1D | IntegratorKind::ShapeProfile => {
                self.profile_integration_flag = RejectionFlag::NotRejected;
                self.profile_intensity = Intensity::default();
                self.profile_background = Intensity::default();
            }
        }
    }

    /// Bulk setter used when a peak is restored from a project file: all
    /// integration results and flags at once, bypassing the usual checks.
    #[allow(clippy::too_many_arguments)]
    pub fn set_manually(
        &mut self,
        sum_intensity: Intensity,
        profile_intensity: Intensity,
        peak_end: f64,
        bkg_begin: f64,
        bkg_end: f64,
        region_type: RegionType,
        scale: f64,
        transmission: f64,
        sum_background: Intensity,
        profile_background: Intensity,
        rejection: RejectionFlag,
        sum_integration: RejectionFlag,
        profile_integration: RejectionFlag,
        bkg_gradient: Intensity,
    ) {
        self.sum_intensity = sum_intensity;
        self.profile_intensity = profile_intensity;
        self.peak_end = peak_end;
        self.bkg_begin = bkg_begin;
        self.bkg_end = bkg_end;
        self.region_type = region_type;
        self.scale = scale;
        self.transmission = transmission;
        self.sum_background = sum_background;
        self.profile_background = profile_background;
        self.rejection_flag = rejection;
        self.sum_integration_flag = sum_integration;
        self.profile_integration_flag = profile_integration;
        self.mean_bkg_gradient = bkg_gradient;
    }

    /// Store an integration outcome: intensities, backgrounds, rocking
    /// curve, bounds. An invalid sigma rejects the peak on the spot.
    #[allow(clippy::too_many_arguments)]
    pub fn update_integration(
        &mut self,
        kind: IntegratorKind,
        intensity: Intensity,
        background: Intensity,
        bkg_gradient: Intensity,
        rocking_curve: Vec<Intensity>,
        peak_end: f64,
        bkg_begin: f64,
        bkg_end: f64,
        region_type: RegionType,
    ) {
        const SIGMA_EPS: f64 = 1.0e-8;

        match kind {
            IntegratorKind::PixelSum | IntegratorKind::Gaussian => {
                self.sum_intensity = intensity;
                self.sum_background = background;
            }
            IntegratorKind::Profile1D | IntegratorKind::ShapeProfile => {
                self.profile_intensity = intensity;
                self.profile_background = background;
            }
        }
        self.mean_bkg_gradient = bkg_gradient;
        if !rocking_curve.is_empty() {
            self.rocking_curve = rocking_curve;
        }
        self.peak_end = peak_end;
        self.bkg_begin = bkg_begin;
        self.bkg_end = bkg_end;
        self.region_type = region_type;

        if intensity.sigma() < SIGMA_EPS {
            self.set_selected(false);
            self.set_integration_flag(RejectionFlag::InvalidSigma, kind);
        }
        if background.is_valid() && background.sigma() < SIGMA_EPS {
            self.set_selected(false);
            self.set_integration_flag(RejectionFlag::InvalidBkgSigma, kind);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::DataSet;
    use crate::instrument::Detector;
    use nalgebra::{UnitQuaternion, Vector3};
    use ndarray::Array2;

    fn test_data(nframes: usize) -> Arc<DataSet> {
        let detector = Detector::new(64, 64, 1.0, 1.0, 200.0);
        let frames = vec![Array2::zeros((64, 64)); nframes];
        let states = (0..nframes)
            .map(|i| {
                #[allow(clippy::cast_precision_loss)]
                let angle = (i as f64) * 0.3_f64.to_radians();
                InstrumentState::new(
                    UnitQuaternion::from_axis_angle(&Vector3::z_axis(), angle),
                    1.5,
                )
            })
            .collect();
        Arc::new(DataSet::new("scan", detector, frames, states).unwrap())
    }

    fn centred_peak(data: &Arc<DataSet>) -> Peak {
        Peak::new(
            Arc::clone(data),
            Ellipsoid::sphere(Vector3::new(30.0, 30.0, 5.0), 2.0),
        )
    }

    #[test]
    fn out_of_bounds_centre_is_rejected() {
        let data = test_data(10);
        let peak = Peak::new(
            Arc::clone(&data),
            Ellipsoid::sphere(Vector3::new(30.0, 30.0, 40.0), 2.0),
        );
        assert!(!peak.enabled());
        assert_eq!(peak.rejection_flag(), RejectionFlag::OutsideFrames);
    }

    #[test]
    fn flag_precedence() {
        let data = test_data(10);
        let mut peak = centred_peak(&data);
        assert_eq!(peak.rejection_flag(), RejectionFlag::NotRejected);

        peak.set_integration_flag(RejectionFlag::BadGaussianFit, IntegratorKind::Gaussian);
        peak.set_integration_flag(RejectionFlag::NoShapeModel, IntegratorKind::Profile1D);
        assert_eq!(peak.rejection_flag(), RejectionFlag::BadGaussianFit);

        peak.reject(RejectionFlag::OutsideIndexingTol);
        assert_eq!(peak.rejection_flag(), RejectionFlag::OutsideIndexingTol);
        assert!(peak.is_rejected_for(RejectionFlag::NoShapeModel));
    }

    #[test]
    fn masking_toggles_flag() {
        let data = test_data(10);
        let mut peak = centred_peak(&data);
        peak.set_masked(true);
        assert!(!peak.enabled());
        assert_eq!(peak.rejection_flag(), RejectionFlag::Masked);
        peak.set_masked(false);
        assert_eq!(peak.rejection_flag(), RejectionFlag::NotRejected);
    }

    #[test]
    fn weak_cell_reference_expires() {
        let data = test_data(10);
        let mut peak = centred_peak(&data);
        {
            let cell = Arc::new(RwLock::new(
                UnitCell::from_parameters(5.0, 5.0, 5.0, 1.57, 1.57, 1.57).unwrap(),
            ));
            peak.set_unit_cell(&cell);
            assert!(peak.unit_cell().is_some());
        }
        assert!(peak.unit_cell().is_none());
    }

    #[test]
    fn corrected_intensity_applies_all_factors() {
        let data = test_data(10);
        let mut peak = centred_peak(&data);
        peak.set_scale(2.0);
        peak.set_transmission(0.5);
        let raw = Intensity::new(100.0, 100.0);
        let corrected = peak.corrected_intensity(raw);
        assert!(corrected.is_valid());

        let c = peak.shape().center();
        let state = data.interpolated_state(c[2]);
        let lorentz = state.lorentz_factor(data.detector(), c[0], c[1]);
        let factor = 2.0 / (lorentz * 0.5 * state.step);
        assert!((corrected.value() - 100.0 * factor).abs() < 1e-9);
        assert!((corrected.variance() - 100.0 * factor * factor).abs() < 1e-6);
    }

    #[test]
    fn q_shape_roundtrip() {
        let data = test_data(20);
        let peak = centred_peak(&data);
        let q_shape = peak.q_shape().unwrap();

        // pulling the q-space metric back to detector space must recover
        // the original within the linearisation error
        let c = peak.shape().center();
        let state = data.interpolated_state(c[2]);
        let j = state.jacobian_q(data.detector(), c[0], c[1]);
        let back = j.transpose() * q_shape.metric() * j;
        assert!((back - peak.shape().metric()).norm() < 2e-2);
    }
}
