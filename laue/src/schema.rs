//! Project-file schema: the field names and record shapes an external
//! saver/loader must preserve.
//!
//! The core does no container I/O itself; an HDF5 (or other) collaborator
//! serialises these records under the listed keys and hands them back on
//! load.

use crate::miller::MillerIndex;
use crate::peak::RejectionFlag;
use serde::{Deserialize, Serialize};

/// Dataset group keys.
pub mod keys {
    /// Incident wavelength, scalar.
    pub const WAVELENGTH: &str = "wavelength";
    /// Number of frames, scalar.
    pub const FRAME_COUNT: &str = "frame_count";
    /// Detector shape `(nrows, ncols)`.
    pub const DETECTOR_SHAPE: &str = "detector_shape";
    /// Image bit depth.
    pub const BIT_DEPTH: &str = "bit_depth";
    /// Number of detector masks.
    pub const MASK_COUNT: &str = "n_masks";
    /// Instrument-state table.
    pub const INSTRUMENT_STATES: &str = "instrument_states";
    /// Peak-collection group prefix.
    pub const PEAK_COLLECTIONS: &str = "peak_collections";
    /// Unit-cell group prefix.
    pub const UNIT_CELLS: &str = "unit_cells";
    /// Shape-model group prefix.
    pub const SHAPE_MODELS: &str = "shape_models";
}

/// Per-frame instrument state record.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct InstrumentStateRecord {
    /// Sample position (lab frame).
    pub sample_position: [f64; 3],
    /// Goniometer orientation quaternion `(w, x, y, z)`.
    pub sample_orientation: [f64; 4],
    /// Refined orientation offset quaternion `(w, x, y, z)`.
    pub sample_orientation_offset: [f64; 4],
    /// Refined detector position offset.
    pub detector_position_offset: [f64; 3],
    /// Incident beam direction.
    pub ni: [f64; 3],
    /// Incident wavelength.
    pub wavelength: f64,
    /// Whether the refiner updated this state.
    pub refined: bool,
}

/// One peak row of a stored collection.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PeakRecord {
    /// Miller index.
    pub hkl: MillerIndex,
    /// Shape centre `(col, row, frame)`.
    pub center: [f64; 3],
    /// Shape metric, row major.
    pub metric: [f64; 9],
    /// Sum intensity and variance.
    pub sum_intensity: [f64; 2],
    /// Profile intensity and variance.
    pub profile_intensity: [f64; 2],
    /// Sum background and variance.
    pub sum_background: [f64; 2],
    /// Profile background and variance.
    pub profile_background: [f64; 2],
    /// Integration bounds `(peak_end, bkg_begin, bkg_end)`.
    pub bounds: [f64; 3],
    /// Per-peak scale factor.
    pub scale: f64,
    /// Transmission factor.
    pub transmission: f64,
    /// Pre-integration rejection.
    pub rejection: RejectionFlagRecord,
    /// Sum-integration rejection.
    pub sum_rejection: RejectionFlagRecord,
    /// Profile-integration rejection.
    pub profile_rejection: RejectionFlagRecord,
    /// Selected / masked / predicted bits.
    pub status: u8,
}

/// Stored form of a rejection flag (stable numeric code).
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RejectionFlagRecord(pub u8);

impl From<RejectionFlag> for RejectionFlagRecord {
    fn from(flag: RejectionFlag) -> Self {
        Self(flag as u8)
    }
}

/// Stored unit cell.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct UnitCellRecord {
    /// Cell name.
    pub name: String,
    /// Direct basis, row major, columns are the cell vectors.
    pub basis: [f64; 9],
    /// Space-group symbol.
    pub space_group: String,
    /// Niggli character number.
    pub niggli_number: i32,
    /// Bravais symbol.
    pub bravais: String,
    /// Indexing tolerance.
    pub indexing_tolerance: f64,
    /// Metric-parameter covariance, row major 6x6, all zero when absent.
    pub covariance: Vec<f64>,
}

/// Stored peak collection.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PeakCollectionRecord {
    /// Collection name.
    pub name: String,
    /// Provenance: found, predicted, filtered, reference.
    pub kind: String,
    /// Name of the associated unit cell, empty when none.
    pub unit_cell: String,
    /// Bookkeeping bits.
    pub indexed: bool,
    /// Whether the collection carries integrated intensities.
    pub integrated: bool,
    /// The peak rows.
    pub peaks: Vec<PeakRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_record_roundtrips() {
        let record = InstrumentStateRecord {
            sample_position: [0.0, 0.1, 0.2],
            sample_orientation: [1.0, 0.0, 0.0, 0.0],
            sample_orientation_offset: [1.0, 0.0, 0.0, 0.0],
            detector_position_offset: [0.0; 3],
            ni: [0.0, 1.0, 0.0],
            wavelength: 1.5,
            refined: false,
        };
        let json = serde_json::to_string(&record).unwrap();
        let back: InstrumentStateRecord = serde_json::from_str(&json).unwrap();
        assert!((back.wavelength - 1.5).abs() < f64::EPSILON);
        assert_eq!(back.sample_position, record.sample_position);
    }

    #[test]
    fn rejection_flags_have_stable_codes() {
        assert_eq!(RejectionFlagRecord::from(RejectionFlag::NotRejected).0, 0);
        assert_eq!(RejectionFlagRecord::from(RejectionFlag::Masked).0, 1);
        let json = serde_json::to_string(&RejectionFlagRecord(7)).unwrap();
        let back: RejectionFlagRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.0, 7);
    }
}
