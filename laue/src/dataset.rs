//! In-memory detector data: frame stack, states, masks.

use crate::error::{Error, Result};
use crate::instrument::{Detector, InstrumentState, InterpolatedState};
use nalgebra::{RowVector3, Vector3};
use ndarray::Array2;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A point in detector coordinates: fractional pixel column, row, frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DetectorEvent {
    /// Pixel column.
    pub px: f64,
    /// Pixel row.
    pub py: f64,
    /// Frame coordinate.
    pub frame: f64,
}

/// Rectangular detector mask, active on every frame.
#[derive(Clone, Copy, Debug)]
pub struct DetectorMask {
    /// Lower corner (column, row).
    pub lower: (f64, f64),
    /// Upper corner (column, row).
    pub upper: (f64, f64),
}

impl DetectorMask {
    /// Whether a pixel lies inside the mask.
    #[must_use]
    pub fn contains(&self, px: f64, py: f64) -> bool {
        px >= self.lower.0 && px <= self.upper.0 && py >= self.lower.1 && py <= self.upper.1
    }

    /// Whether the mask overlaps the detector-plane bounding box
    /// `[lower, upper]` of a peak shape.
    #[must_use]
    pub fn collides(&self, lower: (f64, f64), upper: (f64, f64)) -> bool {
        self.lower.0 <= upper.0
            && lower.0 <= self.upper.0
            && self.lower.1 <= upper.1
            && lower.1 <= self.upper.1
    }
}

/// A stack of detector images recorded during one rotation scan, together
/// with the per-frame instrument states.
///
/// Loading image files is an external concern; callers construct the set
/// from frames already in memory. Frames are indexed `[row, column]`.
#[derive(Debug)]
pub struct DataSet {
    name: String,
    detector: Detector,
    frames: Vec<Array2<f64>>,
    states: RwLock<Vec<InstrumentState>>,
    masks: Vec<DetectorMask>,
    wavelength: f64,
}

impl DataSet {
    /// Assemble a data set.
    ///
    /// # Errors
    ///
    /// [`Error::Domain`] when the frame stack and state list disagree or a
    /// frame does not match the detector shape.
    pub fn new(
        name: impl Into<String>,
        detector: Detector,
        frames: Vec<Array2<f64>>,
        states: Vec<InstrumentState>,
    ) -> Result<Self> {
        if frames.len() != states.len() {
            return Err(Error::Domain(format!(
                "{} frames but {} instrument states",
                frames.len(),
                states.len()
            )));
        }
        if states.is_empty() {
            return Err(Error::Domain("empty data set".into()));
        }
        for frame in &frames {
            if frame.nrows() != detector.nrows() || frame.ncols() != detector.ncols() {
                return Err(Error::Domain(format!(
                    "frame shape {:?} does not match detector {}x{}",
                    frame.dim(),
                    detector.nrows(),
                    detector.ncols()
                )));
            }
        }
        let wavelength = states[0].wavelength;
        Ok(Self {
            name: name.into(),
            detector,
            frames,
            states: RwLock::new(states),
            masks: Vec::new(),
            wavelength,
        })
    }

    /// Data set name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The detector the frames were recorded on.
    #[must_use]
    pub const fn detector(&self) -> &Detector {
        &self.detector
    }

    /// Number of frames.
    #[must_use]
    pub fn nframes(&self) -> usize {
        self.frames.len()
    }

    /// Detector columns.
    #[must_use]
    pub const fn ncols(&self) -> usize {
        self.detector().ncols()
    }

    /// Detector rows.
    #[must_use]
    pub const fn nrows(&self) -> usize {
        self.detector().nrows()
    }

    /// Incident wavelength.
    #[must_use]
    pub const fn wavelength(&self) -> f64 {
        self.wavelength
    }

    /// Raw counts of one frame.
    #[must_use]
    pub fn frame(&self, idx: usize) -> &Array2<f64> {
        &self.frames[idx]
    }

    /// Frame corrected for detector baseline and gain.
    #[must_use]
    pub fn transformed_frame(&self, idx: usize) -> Array2<f64> {
        let baseline = self.detector.baseline();
        let gain = self.detector.gain();
        self.frames[idx].mapv(|c| (c - baseline) / gain)
    }

    /// Magnitude of the image gradient of a frame (central differences).
    #[must_use]
    pub fn gradient_frame(&self, idx: usize) -> Array2<f64> {
        let frame = self.transformed_frame(idx);
        let (nrows, ncols) = frame.dim();
        let mut out = Array2::zeros((nrows, ncols));
        for r in 1..nrows.saturating_sub(1) {
            for c in 1..ncols.saturating_sub(1) {
                let gx = 0.5 * (frame[(r, c + 1)] - frame[(r, c - 1)]);
                let gy = 0.5 * (frame[(r + 1, c)] - frame[(r - 1, c)]);
                out[(r, c)] = gx.hypot(gy);
            }
        }
        out
    }

    /// Read access to the instrument states.
    ///
    /// # Panics
    ///
    /// When the state lock is poisoned.
    #[must_use]
    pub fn states(&self) -> RwLockReadGuard<'_, Vec<InstrumentState>> {
        self.states.read().expect("instrument states poisoned")
    }

    /// Exclusive access to the instrument states (the refiner mutates them
    /// in place).
    ///
    /// # Panics
    ///
    /// When the state lock is poisoned.
    #[must_use]
    pub fn states_mut(&self) -> RwLockWriteGuard<'_, Vec<InstrumentState>> {
        self.states.write().expect("instrument states poisoned")
    }

    /// Interpolated state at a fractional frame coordinate.
    #[must_use]
    pub fn interpolated_state(&self, frame: f64) -> InterpolatedState {
        InterpolatedState::interpolate(&self.states(), frame)
    }

    /// Scattering vector of a detector event, or `None` on interpolation
    /// failure.
    #[must_use]
    pub fn compute_q(&self, event: &DetectorEvent) -> Option<RowVector3<f64>> {
        let state = self.interpolated_state(event.frame);
        state
            .is_valid()
            .then(|| state.sample_q(&self.detector, event.px, event.py))
    }

    /// Invert the forward model: all detector events at which the given
    /// sample-space q vector satisfies the Bragg condition during the
    /// scan.
    #[must_use]
    pub fn events_for_q(&self, q: &RowVector3<f64>) -> Vec<DetectorEvent> {
        events_for_q_with_states(&self.detector, &self.states(), q)
    }

    /// Masks applied to this data set.
    #[must_use]
    pub fn masks(&self) -> &[DetectorMask] {
        &self.masks
    }

    /// Add a detector mask.
    pub fn add_mask(&mut self, mask: DetectorMask) {
        self.masks.push(mask);
    }
}

/// Bragg-condition inversion against an explicit state list: scans the
/// integer frame intervals for a sign change of the Ewald residual,
/// bisects to locate the crossing frame, then traces the outgoing ray
/// onto the panel.
#[must_use]
pub fn events_for_q_with_states(
    detector: &Detector,
    states: &[InstrumentState],
    q: &RowVector3<f64>,
) -> Vec<DetectorEvent> {
    let q_sample = Vector3::new(q[0], q[1], q[2]);
    let nframes = states.len();
    let mut events = Vec::new();
    if nframes < 2 {
        return events;
    }

    let residual = |frame: f64| -> Option<f64> {
        let interp = InterpolatedState::interpolate(states, frame);
        if !interp.is_valid() {
            return None;
        }
        let q_lab = interp.state.sample_orientation_matrix() * q_sample;
        let ki = interp.state.ki();
        Some(q_lab.norm_squared() + 2.0 * q_lab.dot(&ki))
    };

    for i in 0..nframes - 1 {
        let (f0, f1) = (i as f64, (i + 1) as f64);
        let (Some(r0), Some(r1)) = (residual(f0), residual(f1)) else {
            continue;
        };
        if r0 == 0.0 && i > 0 {
            continue; // counted as the right edge of the previous interval
        }
        if r0 * r1 > 0.0 {
            continue;
        }

        // bisect the crossing
        let (mut lo, mut hi, mut rlo) = (f0, f1, r0);
        for _ in 0..60 {
            let mid = 0.5 * (lo + hi);
            let Some(rm) = residual(mid) else { break };
            if rlo * rm <= 0.0 {
                hi = mid;
            } else {
                lo = mid;
                rlo = rm;
            }
        }
        let frame = 0.5 * (lo + hi);

        let interp = InterpolatedState::interpolate(states, frame);
        if !interp.is_valid() {
            continue;
        }
        let q_lab = interp.state.sample_orientation_matrix() * q_sample;
        let kf = q_lab + interp.state.ki();
        let origin = interp.state.sample_position - interp.state.detector_position_offset;
        if let Some((px, py)) = detector.intersect(&origin, &kf) {
            events.push(DetectorEvent { px, py, frame });
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::UnitQuaternion;

    fn test_set(nframes: usize) -> DataSet {
        let detector = Detector::new(64, 64, 1.0, 1.0, 200.0);
        let frames = vec![Array2::zeros((64, 64)); nframes];
        let states = (0..nframes)
            .map(|i| {
                #[allow(clippy::cast_precision_loss)]
                let angle = (i as f64) * 0.4_f64.to_radians();
                InstrumentState::new(
                    UnitQuaternion::from_axis_angle(&Vector3::z_axis(), angle),
                    1.5,
                )
            })
            .collect();
        DataSet::new("scan", detector, frames, states).unwrap()
    }

    #[test]
    fn mismatched_states_are_rejected() {
        let detector = Detector::new(8, 8, 1.0, 1.0, 100.0);
        let frames = vec![Array2::zeros((8, 8)); 3];
        let states = vec![InstrumentState::new(UnitQuaternion::identity(), 1.0); 2];
        assert!(DataSet::new("bad", detector, frames, states).is_err());
    }

    #[test]
    fn q_roundtrip_through_event_search() {
        let data = test_set(60);
        // take the q of a real detector event in the middle of the scan
        let event = DetectorEvent {
            px: 40.0,
            py: 30.0,
            frame: 25.0,
        };
        let q = data.compute_q(&event).unwrap();

        let events = data.events_for_q(&q);
        let hit = events
            .iter()
            .find(|e| (e.frame - event.frame).abs() < 0.5)
            .expect("original event recovered");
        assert!((hit.px - event.px).abs() < 1e-3);
        assert!((hit.py - event.py).abs() < 1e-3);
    }

    #[test]
    fn gradient_of_flat_frame_is_zero() {
        let data = test_set(3);
        let grad = data.gradient_frame(1);
        assert!(grad.iter().all(|&g| g == 0.0));
    }

    #[test]
    fn mask_collision() {
        let mask = DetectorMask {
            lower: (10.0, 10.0),
            upper: (20.0, 20.0),
        };
        assert!(mask.contains(15.0, 12.0));
        assert!(mask.collides((18.0, 18.0), (25.0, 25.0)));
        assert!(!mask.collides((21.0, 21.0), (30.0, 30.0)));
    }
}
