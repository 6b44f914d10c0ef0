//! Detector geometry and per-frame instrument states.

use nalgebra::{Matrix3, Quaternion, RowVector3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// Flat-panel detector. The incident beam travels along `+y`, `z` points
/// up, and the panel sits perpendicular to the beam at `distance` from the
/// sample origin. Pixel `(col, row) = (0, 0)` is the lower-left corner.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Detector {
    ncols: usize,
    nrows: usize,
    pixel_width: f64,
    pixel_height: f64,
    distance: f64,
    baseline: f64,
    gain: f64,
}

impl Detector {
    /// Construct a panel with the given shape (pixels), pixel size, and
    /// sample-to-detector distance (consistent length units).
    #[must_use]
    pub fn new(ncols: usize, nrows: usize, pixel_width: f64, pixel_height: f64, distance: f64) -> Self {
        Self {
            ncols,
            nrows,
            pixel_width,
            pixel_height,
            distance,
            baseline: 0.0,
            gain: 1.0,
        }
    }

    /// Number of pixel columns.
    #[must_use]
    pub const fn ncols(&self) -> usize {
        self.ncols
    }

    /// Number of pixel rows.
    #[must_use]
    pub const fn nrows(&self) -> usize {
        self.nrows
    }

    /// Detector baseline (counts added by the electronics).
    #[must_use]
    pub const fn baseline(&self) -> f64 {
        self.baseline
    }

    /// Detector gain (counts per event).
    #[must_use]
    pub const fn gain(&self) -> f64 {
        self.gain
    }

    /// Set baseline and gain.
    pub fn set_calibration(&mut self, baseline: f64, gain: f64) {
        assert!(gain > 0.0, "detector gain must be positive");
        self.baseline = baseline;
        self.gain = gain;
    }

    /// Lab-frame position of a (fractional) pixel centre.
    #[must_use]
    pub fn pixel_position(&self, px: f64, py: f64) -> Vector3<f64> {
        #[allow(clippy::cast_precision_loss)]
        let x = (px - 0.5 * (self.ncols as f64 - 1.0)) * self.pixel_width;
        #[allow(clippy::cast_precision_loss)]
        let z = (py - 0.5 * (self.nrows as f64 - 1.0)) * self.pixel_height;
        Vector3::new(x, self.distance, z)
    }

    /// Inverse of [`Self::pixel_position`]: pixel coordinates of the point
    /// where a ray from `origin` along `direction` pierces the panel, or
    /// `None` when the ray runs away from it or misses the active area.
    #[must_use]
    pub fn intersect(&self, origin: &Vector3<f64>, direction: &Vector3<f64>) -> Option<(f64, f64)> {
        if direction[1].abs() < 1e-12 {
            return None;
        }
        let t = (self.distance - origin[1]) / direction[1];
        if t <= 0.0 {
            return None;
        }
        let hit = origin + t * direction;
        #[allow(clippy::cast_precision_loss)]
        let px = hit[0] / self.pixel_width + 0.5 * (self.ncols as f64 - 1.0);
        #[allow(clippy::cast_precision_loss)]
        let py = hit[2] / self.pixel_height + 0.5 * (self.nrows as f64 - 1.0);
        #[allow(clippy::cast_precision_loss)]
        let inside = px >= 0.0
            && px <= self.ncols as f64 - 1.0
            && py >= 0.0
            && py <= self.nrows as f64 - 1.0;
        inside.then_some((px, py))
    }
}

/// Per-frame instrument state: sample position and orientation, detector
/// offset, incident beam direction, wavelength.
///
/// The orientation offset quaternion starts at identity; the refiner
/// adjusts its imaginary components only, the real part stays pinned.
#[derive(Clone, Debug)]
pub struct InstrumentState {
    /// Sample position in the lab frame.
    pub sample_position: Vector3<f64>,
    /// Sample orientation from the goniometer.
    pub sample_orientation: UnitQuaternion<f64>,
    /// Refined orientation offset (imaginary parts refined, not kept
    /// normalised; normalisation happens on use).
    pub sample_orientation_offset: Quaternion<f64>,
    /// Refined detector position offset.
    pub detector_position_offset: Vector3<f64>,
    /// Incident beam direction; normalised on use.
    pub ni: Vector3<f64>,
    /// Incident wavelength.
    pub wavelength: f64,
    /// Whether the refiner has updated this state.
    pub refined: bool,
}

impl InstrumentState {
    /// State with an untouched goniometer orientation.
    #[must_use]
    pub fn new(sample_orientation: UnitQuaternion<f64>, wavelength: f64) -> Self {
        Self {
            sample_position: Vector3::zeros(),
            sample_orientation,
            sample_orientation_offset: Quaternion::new(1.0, 0.0, 0.0, 0.0),
            detector_position_offset: Vector3::zeros(),
            ni: Vector3::new(0.0, 1.0, 0.0),
            wavelength,
            refined: false,
        }
    }

    /// Full sample orientation: offset composed with the goniometer
    /// orientation, normalised.
    #[must_use]
    pub fn sample_orientation_matrix(&self) -> Matrix3<f64> {
        let composed = UnitQuaternion::from_quaternion(
            self.sample_orientation_offset * self.sample_orientation.quaternion(),
        );
        *composed.to_rotation_matrix().matrix()
    }

    /// Incident wavevector `n_i / lambda` in the lab frame.
    #[must_use]
    pub fn ki(&self) -> Vector3<f64> {
        self.ni.normalize() / self.wavelength
    }

    /// Scattering vector of a detector pixel, rotated into the sample
    /// frame.
    #[must_use]
    pub fn sample_q(&self, detector: &Detector, px: f64, py: f64) -> RowVector3<f64> {
        let q_lab = self.kf(detector, px, py) - self.ki();
        let q_sample = self.sample_orientation_matrix().transpose() * q_lab;
        RowVector3::new(q_sample[0], q_sample[1], q_sample[2])
    }

    /// Outgoing wavevector towards a detector pixel.
    #[must_use]
    pub fn kf(&self, detector: &Detector, px: f64, py: f64) -> Vector3<f64> {
        let p = detector.pixel_position(px, py) + self.detector_position_offset;
        (p - self.sample_position).normalize() / self.wavelength
    }
}

/// State interpolated at a fractional frame coordinate, with the rotation
/// axis (sample frame) and step size needed for analytic derivatives.
#[derive(Clone, Debug)]
pub struct InterpolatedState {
    /// The interpolated per-frame state.
    pub state: InstrumentState,
    /// Axis of crystal rotation in the sample frame.
    pub axis: Vector3<f64>,
    /// Step between the bracketing frames, in radians.
    pub step: f64,
    valid: bool,
}

impl InterpolatedState {
    /// Interpolate between the bracketing integer frames. An out-of-range
    /// frame coordinate (or fewer than two states) yields an invalid
    /// state; consumers must check [`Self::is_valid`].
    #[must_use]
    pub fn interpolate(states: &[InstrumentState], frame: f64) -> Self {
        #[allow(clippy::cast_precision_loss)]
        let max_frame = states.len() as f64 - 1.0;
        if states.len() < 2 || !frame.is_finite() || frame < 0.0 || frame > max_frame {
            return Self {
                state: InstrumentState::new(UnitQuaternion::identity(), 1.0),
                axis: Vector3::zeros(),
                step: 0.0,
                valid: false,
            };
        }

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let idx = (frame.floor() as usize).min(states.len() - 2);
        #[allow(clippy::cast_precision_loss)]
        let t = frame - idx as f64;
        let s1 = &states[idx];
        let s2 = &states[idx + 1];

        let orientation = s1
            .sample_orientation
            .try_slerp(&s2.sample_orientation, t, 1e-9)
            .unwrap_or(s1.sample_orientation);
        let offset = s1.sample_orientation_offset.lerp(&s2.sample_orientation_offset, t);

        let state = InstrumentState {
            sample_position: s1.sample_position.lerp(&s2.sample_position, t),
            sample_orientation: orientation,
            sample_orientation_offset: offset,
            detector_position_offset: s1
                .detector_position_offset
                .lerp(&s2.detector_position_offset, t),
            ni: s1.ni.lerp(&s2.ni, t),
            wavelength: s1.wavelength + t * (s2.wavelength - s1.wavelength),
            refined: s1.refined && s2.refined,
        };

        // relative rotation between the bracketing states, in the sample
        // frame
        let u1 = s1.sample_orientation_matrix();
        let u2 = s2.sample_orientation_matrix();
        let relative = nalgebra::Rotation3::from_matrix_unchecked(u1.transpose() * u2);
        let (axis, step) = relative.axis_angle().map_or_else(
            || (Vector3::zeros(), 0.0),
            |(axis, angle)| (axis.into_inner(), angle),
        );

        Self {
            state,
            axis,
            step,
            valid: true,
        }
    }

    /// Whether the interpolation succeeded.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.valid
    }

    /// Scattering vector of a detector pixel in the sample frame.
    #[must_use]
    pub fn sample_q(&self, detector: &Detector, px: f64, py: f64) -> RowVector3<f64> {
        self.state.sample_q(detector, px, py)
    }

    /// Jacobian of the map `(px, py, frame) -> q_sample`.
    #[must_use]
    pub fn jacobian_q(&self, detector: &Detector, px: f64, py: f64) -> Matrix3<f64> {
        let state = &self.state;
        let p = detector.pixel_position(px, py) + state.detector_position_offset;
        let dir = p - state.sample_position;
        let norm = dir.norm();
        let unit = dir / norm;

        // d kf / d p = (1 - u u^T) / (lambda |dir|)
        let dkf_dp = (Matrix3::identity() - unit * unit.transpose()) / (state.wavelength * norm);
        let ut = state.sample_orientation_matrix().transpose();

        let col_x = ut * dkf_dp * Vector3::new(detector_pixel_step(detector).0, 0.0, 0.0);
        let col_y = ut * dkf_dp * Vector3::new(0.0, 0.0, detector_pixel_step(detector).1);

        let q = self.sample_q(detector, px, py);
        let q_sample = Vector3::new(q[0], q[1], q[2]);
        let col_f = self.step * q_sample.cross(&self.axis);

        Matrix3::from_columns(&[col_x, col_y, col_f])
    }

    /// Lorentz factor `1 / (sin |gamma| cos nu)` at a detector pixel.
    #[must_use]
    pub fn lorentz_factor(&self, detector: &Detector, px: f64, py: f64) -> f64 {
        let kf = self.state.kf(detector, px, py);
        let gamma = kf[0].atan2(kf[1]);
        let nu = (kf[2] / kf.norm()).asin();
        1.0 / (gamma.abs().sin() * nu.cos())
    }
}

const fn detector_pixel_step(detector: &Detector) -> (f64, f64) {
    (detector.pixel_width, detector.pixel_height)
}
