//! Voxel classification around a peak: peak zone, background shell.

use crate::dataset::DetectorEvent;
use crate::ellipsoid::{Aabb, Ellipsoid};
use crate::error::{Error, Result};
use crate::peak::Peak;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// How the integration bounds are interpreted.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum RegionType {
    /// Bounds are multiples of the peak's own ellipsoid (sigma units).
    #[default]
    VariableEllipsoid,
    /// Bounds are absolute pixel radii around the centre.
    FixedEllipsoid,
}

/// Classification of one voxel relative to a peak.
#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
pub enum EventType {
    /// Neither peak nor background.
    #[default]
    Excluded = 0,
    /// Background shell.
    Background = 1,
    /// Peak zone.
    Peak = 2,
    /// Claimed by a neighbouring peak.
    Forbidden = 3,
}

/// Events and counts collected for one peak during the frame sweep.
#[derive(Clone, Debug, Default)]
pub struct PeakData {
    /// Voxel coordinates.
    pub events: Vec<DetectorEvent>,
    /// Counts at each voxel.
    pub counts: Vec<f64>,
    /// Image-gradient magnitude at each voxel (empty when not requested).
    pub gradients: Vec<f64>,
}

impl PeakData {
    fn clear(&mut self) {
        self.events.clear();
        self.counts.clear();
        self.gradients.clear();
    }
}

/// The integration region of a peak: its ellipsoid scaled to the peak
/// radius plus a background shell, classified voxel by voxel.
pub struct IntegrationRegion {
    base: Ellipsoid,
    peak_end: f64,
    bkg_begin: f64,
    bkg_end: f64,
    bounding_box: Aabb,
    data: PeakData,
}

impl IntegrationRegion {
    /// Build the region for a peak.
    ///
    /// # Errors
    ///
    /// [`Error::Numerical`] when the peak shape is not positive definite
    /// or the bounds are not increasing.
    pub fn new(
        peak: &Peak,
        peak_end: f64,
        bkg_begin: f64,
        bkg_end: f64,
        region_type: RegionType,
    ) -> Result<Self> {
        if !(peak_end > 0.0 && bkg_begin >= peak_end && bkg_end > bkg_begin) {
            return Err(Error::Numerical(format!(
                "inconsistent region bounds ({peak_end}, {bkg_begin}, {bkg_end})"
            )));
        }
        let base = match region_type {
            RegionType::VariableEllipsoid => *peak.shape(),
            RegionType::FixedEllipsoid => Ellipsoid::sphere(peak.shape().center(), 1.0),
        };
        if !base.is_positive_definite() {
            return Err(Error::Numerical("peak shape is not positive definite".into()));
        }
        let bounding_box = base.aabb(bkg_end);
        Ok(Self {
            base,
            peak_end,
            bkg_begin,
            bkg_end,
            data: PeakData::default(),
            bounding_box,
        })
    }

    /// Peak-boundary scale.
    #[must_use]
    pub const fn peak_end(&self) -> f64 {
        self.peak_end
    }

    /// Bounding box of the full region (background included).
    #[must_use]
    pub const fn bounding_box(&self) -> &Aabb {
        &self.bounding_box
    }

    /// Bounding box of the peak zone alone.
    #[must_use]
    pub fn peak_bounding_box(&self) -> Aabb {
        self.base.aabb(self.peak_end)
    }

    /// Classify a voxel.
    #[must_use]
    pub fn classify(&self, event: &DetectorEvent) -> EventType {
        let p = nalgebra::Vector3::new(event.px, event.py, event.frame);
        let r2 = self.base.r2(&p);
        if r2 <= self.peak_end * self.peak_end {
            EventType::Peak
        } else if r2 > self.bkg_begin * self.bkg_begin && r2 <= self.bkg_end * self.bkg_end {
            EventType::Background
        } else {
            EventType::Excluded
        }
    }

    /// Write this region's footprint on a frame into the shared class
    /// mask, keeping the strongest class per pixel.
    pub fn update_mask(&self, mask: &mut Array2<u8>, frame_idx: usize) {
        #[allow(clippy::cast_precision_loss)]
        let frame = frame_idx as f64;
        if frame < self.bounding_box.lower[2] || frame > self.bounding_box.upper[2] {
            return;
        }
        let (nrows, ncols) = mask.dim();
        let (c0, c1, r0, r1) = self.pixel_range(nrows, ncols);
        for py in r0..=r1 {
            for px in c0..=c1 {
                #[allow(clippy::cast_precision_loss)]
                let event = DetectorEvent {
                    px: px as f64,
                    py: py as f64,
                    frame,
                };
                let class = self.classify(&event) as u8;
                if class > mask[(py, px)] {
                    mask[(py, px)] = class;
                }
            }
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn pixel_range(&self, nrows: usize, ncols: usize) -> (usize, usize, usize, usize) {
        let clamp = |v: f64, hi: usize| -> usize {
            (v.max(0.0) as usize).min(hi.saturating_sub(1))
        };
        (
            clamp(self.bounding_box.lower[0].floor(), ncols),
            clamp(self.bounding_box.upper[0].ceil(), ncols),
            clamp(self.bounding_box.lower[1].floor(), nrows),
            clamp(self.bounding_box.upper[1].ceil(), nrows),
        )
    }

    /// Collect this peak's events from one frame. Background pixels that
    /// the shared mask assigns to a neighbouring peak's zone are dropped
    /// (forbidden). Returns `true` once the whole region has been swept.
    pub fn advance_frame(
        &mut self,
        image: &Array2<f64>,
        gradient: Option<&Array2<f64>>,
        mask: &Array2<u8>,
        frame_idx: usize,
    ) -> bool {
        #[allow(clippy::cast_precision_loss)]
        let frame = frame_idx as f64;
        if frame < self.bounding_box.lower[2] {
            return false;
        }
        if frame > self.bounding_box.upper[2] {
            return true;
        }

        let (nrows, ncols) = image.dim();
        let (c0, c1, r0, r1) = self.pixel_range(nrows, ncols);
        for py in r0..=r1 {
            for px in c0..=c1 {
                #[allow(clippy::cast_precision_loss)]
                let event = DetectorEvent {
                    px: px as f64,
                    py: py as f64,
                    frame,
                };
                let class = self.classify(&event);
                let keep = match class {
                    EventType::Peak => true,
                    EventType::Background => mask[(py, px)] < EventType::Peak as u8,
                    EventType::Excluded | EventType::Forbidden => false,
                };
                if !keep {
                    continue;
                }
                self.data.events.push(event);
                self.data.counts.push(image[(py, px)]);
                if let Some(grad) = gradient {
                    self.data.gradients.push(grad[(py, px)]);
                }
            }
        }
        frame >= self.bounding_box.upper[2].floor()
    }

    /// The events collected so far.
    #[must_use]
    pub const fn data(&self) -> &PeakData {
        &self.data
    }

    /// Drop the collected events.
    pub fn reset(&mut self) {
        self.data.clear();
    }
}
