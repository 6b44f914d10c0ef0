//! CCP4 MTZ container writer.
//!
//! Writes the binary layout directly: the `MTZ ` stamp, the reflection
//! records as little-endian 32-bit floats, and the 80-character ASCII
//! header records. Merged output carries `H K L I SIGI`; unmerged output
//! adds `M/ISYM` and `BATCH` columns plus the batch enumeration records.

use crate::dataset::DataSet;
use crate::error::Result;
use crate::merge::MergedPeakCollection;
use crate::unit_cell::UnitCell;
use byteorder::{LittleEndian, WriteBytesExt};
use std::io::Write;
use std::sync::{Arc, RwLock};
use tracing::info;

/// Machine stamp for little-endian IEEE floats and integers.
const MACHINE_STAMP: [u8; 4] = [0x44, 0x41, 0x00, 0x00];
/// The reflection data start at word 21 (byte 80), as in the CCP4
/// library.
const DATA_START_WORD: u32 = 21;

fn header_record<W: Write>(sink: &mut W, text: &str) -> std::io::Result<()> {
    let mut record = [b' '; 80];
    let bytes = text.as_bytes();
    assert!(bytes.len() <= 80, "header record too long: {text}");
    record[..bytes.len()].copy_from_slice(bytes);
    sink.write_all(&record)
}

struct Column {
    label: &'static str,
    kind: char,
    min: f32,
    max: f32,
}

/// Write the merged set as an MTZ file.
///
/// # Errors
///
/// I/O errors from the sink.
pub fn write_mtz<W: Write>(
    sink: &mut W,
    merged: &MergedPeakCollection,
    data: &Arc<DataSet>,
    cell: &Arc<RwLock<UnitCell>>,
    merged_output: bool,
) -> Result<()> {
    // assemble the reflection table first
    let mut rows: Vec<Vec<f32>> = Vec::new();
    if merged_output {
        for peak in merged.merged_peaks() {
            let hkl = peak.index();
            let intensity = peak.intensity();
            rows.push(vec![
                hkl.h() as f32,
                hkl.k() as f32,
                hkl.l() as f32,
                intensity.value() as f32,
                intensity.sigma() as f32,
            ]);
        }
    } else {
        for peak in merged.merged_peaks() {
            for observation in peak.observations() {
                let hkl = observation.hkl;
                rows.push(vec![
                    hkl.h() as f32,
                    hkl.k() as f32,
                    hkl.l() as f32,
                    1.0, // M/ISYM: full reflection, first symmetry operation
                    observation.frame.round() as f32 + 1.0,
                    observation.intensity.value() as f32,
                    observation.intensity.sigma() as f32,
                ]);
            }
        }
    }

    let columns: Vec<Column> = if merged_output {
        vec![
            Column { label: "H", kind: 'H', min: 0.0, max: 0.0 },
            Column { label: "K", kind: 'H', min: 0.0, max: 0.0 },
            Column { label: "L", kind: 'H', min: 0.0, max: 0.0 },
            Column { label: "I", kind: 'J', min: 0.0, max: 0.0 },
            Column { label: "SIGI", kind: 'Q', min: 0.0, max: 0.0 },
        ]
    } else {
        vec![
            Column { label: "H", kind: 'H', min: 0.0, max: 0.0 },
            Column { label: "K", kind: 'H', min: 0.0, max: 0.0 },
            Column { label: "L", kind: 'H', min: 0.0, max: 0.0 },
            Column { label: "M/ISYM", kind: 'Y', min: 0.0, max: 0.0 },
            Column { label: "BATCH", kind: 'B', min: 0.0, max: 0.0 },
            Column { label: "I", kind: 'J', min: 0.0, max: 0.0 },
            Column { label: "SIGI", kind: 'Q', min: 0.0, max: 0.0 },
        ]
    };

    // per-column ranges
    let mut columns = columns;
    for (c, column) in columns.iter_mut().enumerate() {
        let mut min = f32::INFINITY;
        let mut max = f32::NEG_INFINITY;
        for row in &rows {
            min = min.min(row[c]);
            max = max.max(row[c]);
        }
        if rows.is_empty() {
            min = 0.0;
            max = 0.0;
        }
        column.min = min;
        column.max = max;
    }

    let ncol = columns.len() as u32;
    let nrefl = rows.len() as u32;
    let n_batches = if merged_output { 0 } else { data.nframes() };
    let header_position = DATA_START_WORD + nrefl * ncol;

    // record 1: stamp, header location, machine stamp
    sink.write_all(b"MTZ ").map_err(anyhow::Error::from)?;
    sink.write_u32::<LittleEndian>(header_position)
        .map_err(anyhow::Error::from)?;
    sink.write_all(&MACHINE_STAMP).map_err(anyhow::Error::from)?;
    // pad to the data start
    let pad = vec![0u8; (DATA_START_WORD as usize - 1) * 4 - 12];
    sink.write_all(&pad).map_err(anyhow::Error::from)?;

    for row in &rows {
        for value in row {
            sink.write_f32::<LittleEndian>(*value)
                .map_err(anyhow::Error::from)?;
        }
    }

    // header records
    let (character, group_symbol, group_order, centrosymmetric) = {
        let cell = cell.read().expect("cell poisoned");
        (
            cell.character(),
            cell.space_group().symbol().to_string(),
            cell.space_group().order(),
            cell.space_group().is_centrosymmetric(),
        )
    };
    let (d_min, d_max) = (merged.d_min().max(1e-6), merged.d_max().min(1e6));
    let reso_min = (1.0 / d_max).powi(2);
    let reso_max = (1.0 / d_min).powi(2);
    let lattice = group_symbol.chars().next().unwrap_or('P');

    let mut write = |text: String| -> std::io::Result<()> { header_record(sink, &text) };
    write("VERS MTZ:V1.1".to_string()).map_err(anyhow::Error::from)?;
    write("TITLE Reflections from the laue reduction core".to_string())
        .map_err(anyhow::Error::from)?;
    write(format!("NCOL {ncol:8} {nrefl:12} {n_batches:8}")).map_err(anyhow::Error::from)?;
    write(format!(
        "CELL {:9.4}{:9.4}{:9.4}{:9.4}{:9.4}{:9.4}",
        character.a,
        character.b,
        character.c,
        character.alpha.to_degrees(),
        character.beta.to_degrees(),
        character.gamma.to_degrees(),
    ))
    .map_err(anyhow::Error::from)?;
    write("SORT    1   2   3   0   0".to_string()).map_err(anyhow::Error::from)?;
    let nsymp = if centrosymmetric {
        group_order / 2
    } else {
        group_order
    };
    write(format!(
        "SYMINF {group_order:3} {nsymp:2} {lattice} {:5} '{group_symbol}'",
        0
    ))
    .map_err(anyhow::Error::from)?;
    write(format!("RESO {reso_min:<11.6} {reso_max:<11.6}")).map_err(anyhow::Error::from)?;
    write("VALM NAN".to_string()).map_err(anyhow::Error::from)?;
    for column in &columns {
        write(format!(
            "COLUMN {:<30} {} {:17.4} {:17.4} {:4}",
            column.label, column.kind, column.min, column.max, 1
        ))
        .map_err(anyhow::Error::from)?;
    }
    write("NDIF        1".to_string()).map_err(anyhow::Error::from)?;
    write(format!("PROJECT       1 {}", data.name())).map_err(anyhow::Error::from)?;
    write(format!("CRYSTAL       1 {}", data.name())).map_err(anyhow::Error::from)?;
    write(format!("DATASET       1 {}", data.name())).map_err(anyhow::Error::from)?;
    write(format!(
        "DCELL         1 {:10.4}{:10.4}{:10.4}{:10.4}{:10.4}{:10.4}",
        character.a,
        character.b,
        character.c,
        character.alpha.to_degrees(),
        character.beta.to_degrees(),
        character.gamma.to_degrees(),
    ))
    .map_err(anyhow::Error::from)?;
    write(format!("DWAVEL        1 {:10.5}", data.wavelength())).map_err(anyhow::Error::from)?;
    if n_batches > 0 {
        // enumerate the batches in runs of twelve per record
        let numbers: Vec<usize> = (1..=n_batches).collect();
        for chunk in numbers.chunks(12) {
            let mut line = String::from("BATCH ");
            for n in chunk {
                line.push_str(&format!("{n:6}"));
            }
            write(line).map_err(anyhow::Error::from)?;
        }
    }
    write("END".to_string()).map_err(anyhow::Error::from)?;
    write("MTZENDOFHEADERS".to_string()).map_err(anyhow::Error::from)?;

    info!(nrefl, ncol, "MTZ written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::{Detector, InstrumentState};
    use crate::intensity::Intensity;
    use crate::merge::{MergedPeak, Observation};
    use crate::miller::MillerIndex;
    use crate::space_group::SpaceGroup;
    use nalgebra::{UnitQuaternion, Vector3};
    use ndarray::Array2;

    fn test_data() -> Arc<DataSet> {
        let detector = Detector::new(16, 16, 1.0, 1.0, 100.0);
        let frames = vec![Array2::zeros((16, 16)); 4];
        let states = (0..4)
            .map(|i| {
                let angle = f64::from(i) * 0.2_f64.to_radians();
                InstrumentState::new(
                    UnitQuaternion::from_axis_angle(&Vector3::z_axis(), angle),
                    1.2,
                )
            })
            .collect();
        Arc::new(DataSet::new("mtz-test", detector, frames, states).unwrap())
    }

    fn test_merged() -> MergedPeakCollection {
        let mut merged = MergedPeakCollection::new(SpaceGroup::new("P 1").unwrap(), true, true);
        let mut peak = MergedPeak::new(MillerIndex::new(1, 2, 3));
        peak.add(Observation {
            hkl: MillerIndex::new(1, 2, 3),
            intensity: Intensity::new(42.0, 4.0),
            frame: 1.2,
            d: 3.0,
        });
        merged.insert_for_tests(peak);
        merged
    }

    fn test_cell() -> Arc<RwLock<UnitCell>> {
        Arc::new(RwLock::new(
            UnitCell::from_parameters(
                10.0,
                11.0,
                12.0,
                std::f64::consts::FRAC_PI_2,
                std::f64::consts::FRAC_PI_2,
                std::f64::consts::FRAC_PI_2,
            )
            .unwrap(),
        ))
    }

    #[test]
    fn stamp_and_header_position() {
        let merged = test_merged();
        let mut out = Vec::new();
        write_mtz(&mut out, &merged, &test_data(), &test_cell(), true).unwrap();

        assert_eq!(&out[0..4], b"MTZ ");
        let header_word = u32::from_le_bytes(out[4..8].try_into().unwrap());
        // one reflection of five columns after the 20 leading words
        assert_eq!(header_word, 21 + 5);
        // the reflection data begin at byte 80
        let h = f32::from_le_bytes(out[80..84].try_into().unwrap());
        assert!((h - 1.0).abs() < f32::EPSILON);
        let intensity = f32::from_le_bytes(out[92..96].try_into().unwrap());
        assert!((intensity - 42.0).abs() < 1e-6);
    }

    #[test]
    fn header_records_are_80_bytes() {
        let merged = test_merged();
        let mut out = Vec::new();
        write_mtz(&mut out, &merged, &test_data(), &test_cell(), true).unwrap();

        let header_start = (21 - 1) * 4 + 5 * 4;
        let header = &out[header_start..];
        assert_eq!(header.len() % 80, 0);
        let text = String::from_utf8_lossy(header);
        assert!(text.starts_with("VERS MTZ:V1.1"));
        assert!(text.contains("NCOL"));
        assert!(text.contains("CELL"));
        assert!(text.contains("COLUMN H"));
        assert!(text.contains("MTZENDOFHEADERS"));
    }

    #[test]
    fn unmerged_output_has_batch_column() {
        let merged = test_merged();
        let mut out = Vec::new();
        write_mtz(&mut out, &merged, &test_data(), &test_cell(), false).unwrap();
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("M/ISYM"));
        assert!(text.contains("BATCH"));
    }
}
