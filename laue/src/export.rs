//! Text reflection-file exporters: ShelX, FullProf, SCA.

use crate::dataset::DataSet;
use crate::error::Result;
use crate::merge::{MergedPeakCollection, Observation};
use crate::miller::MillerIndex;
use crate::mtz;
use crate::unit_cell::UnitCell;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::info;

/// Supported reflection-file formats.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExportFormat {
    /// CCP4 binary MTZ.
    Mtz,
    /// SCA, as read by Phenix.
    Phenix,
    /// ShelX HKL.
    ShelX,
    /// FullProf HKL.
    FullProf,
}

/// Unmerged rows: every observation with its representative, sorted by
/// descending resolution.
fn unmerged_rows(merged: &MergedPeakCollection) -> Vec<(MillerIndex, Observation)> {
    let mut rows: Vec<(MillerIndex, Observation)> = merged
        .merged_peaks()
        .flat_map(|peak| {
            peak.observations()
                .iter()
                .map(|o| (*peak.index(), *o))
                .collect::<Vec<_>>()
        })
        .collect();
    rows.sort_by(|a, b| b.1.d.partial_cmp(&a.1.d).expect("finite d"));
    rows
}

/// Merged rows sorted by descending resolution (d of the first
/// observation).
fn merged_rows(merged: &MergedPeakCollection) -> Vec<(MillerIndex, f64, f64)> {
    let mut rows: Vec<(f64, (MillerIndex, f64, f64))> = merged
        .merged_peaks()
        .map(|peak| {
            let intensity = peak.intensity();
            (
                peak.d(),
                (*peak.index(), intensity.value(), intensity.sigma()),
            )
        })
        .collect();
    rows.sort_by(|a, b| b.0.partial_cmp(&a.0).expect("finite d"));
    rows.into_iter().map(|(_, row)| row).collect()
}

/// Write ShelX fixed-width reflection lines
/// (`%4d%4d%4d%14.4f%14.4f%5d`, unit scale field).
///
/// # Errors
///
/// I/O errors from the sink.
pub fn write_shelx<W: Write>(
    sink: &mut W,
    merged: &MergedPeakCollection,
    merged_output: bool,
) -> Result<()> {
    let write_row = |sink: &mut W, hkl: &MillerIndex, value: f64, sigma: f64| {
        writeln!(
            sink,
            "{:4}{:4}{:4}{:14.4}{:14.4}{:5}",
            hkl.h(),
            hkl.k(),
            hkl.l(),
            value,
            sigma,
            1
        )
    };

    if merged_output {
        for (hkl, value, sigma) in merged_rows(merged) {
            write_row(sink, &hkl, value, sigma).map_err(anyhow::Error::from)?;
        }
    } else {
        for (_, observation) in unmerged_rows(merged) {
            write_row(
                sink,
                &observation.hkl,
                observation.intensity.value(),
                observation.intensity.sigma(),
            )
            .map_err(anyhow::Error::from)?;
        }
    }
    Ok(())
}

/// Write a FullProf reflection file: title, format line, wavelength, then
/// the same fixed-width rows as ShelX.
///
/// # Errors
///
/// I/O errors from the sink.
pub fn write_fullprof<W: Write>(
    sink: &mut W,
    merged: &MergedPeakCollection,
    data: &Arc<DataSet>,
    merged_output: bool,
) -> Result<()> {
    writeln!(sink, "TITLE Reflections exported for FullProf").map_err(anyhow::Error::from)?;
    writeln!(sink, "(3i4,2F14.4,i5,4f8.2)").map_err(anyhow::Error::from)?;
    writeln!(sink, "{:8.3} 0 0", data.wavelength()).map_err(anyhow::Error::from)?;
    write_shelx(sink, merged, merged_output)
}

fn sca_intensity(value: f64) -> String {
    if value.abs() > 99_999.0 {
        format!("{value:7.1e}")
    } else {
        format!("{value:7.1}")
    }
}

/// Write an SCA reflection file: `    1`, a blank line, the cell with the
/// lower-cased, whitespace-stripped space-group symbol, then the rows
/// (unmerged rows carry both the original and the representative index).
///
/// # Errors
///
/// I/O errors from the sink.
pub fn write_sca<W: Write>(
    sink: &mut W,
    merged: &MergedPeakCollection,
    cell: &Arc<RwLock<UnitCell>>,
    merged_output: bool,
    scale: f64,
) -> Result<()> {
    let (character, symbol) = {
        let cell = cell.read().expect("cell poisoned");
        let symbol: String = cell
            .space_group()
            .symbol()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_lowercase();
        (cell.character(), symbol)
    };

    writeln!(sink, "    1\n").map_err(anyhow::Error::from)?;
    writeln!(
        sink,
        "{:10.3}{:10.3}{:10.3}{:10.3}{:10.3}{:10.3} {symbol}",
        character.a,
        character.b,
        character.c,
        character.alpha.to_degrees(),
        character.beta.to_degrees(),
        character.gamma.to_degrees(),
    )
    .map_err(anyhow::Error::from)?;

    if merged_output {
        for (hkl, value, sigma) in merged_rows(merged) {
            writeln!(
                sink,
                "{:4}{:4}{:4} {} {}",
                hkl.h(),
                hkl.k(),
                hkl.l(),
                sca_intensity(value * scale),
                sca_intensity(sigma * scale),
            )
            .map_err(anyhow::Error::from)?;
        }
    } else {
        for (representative, observation) in unmerged_rows(merged) {
            writeln!(
                sink,
                "{:4}{:4}{:4}{:4}{:4}{:4} {} {}",
                observation.hkl.h(),
                observation.hkl.k(),
                observation.hkl.l(),
                representative.h(),
                representative.k(),
                representative.l(),
                sca_intensity(observation.intensity.value() * scale),
                sca_intensity(observation.intensity.sigma() * scale),
            )
            .map_err(anyhow::Error::from)?;
        }
    }
    Ok(())
}

/// Export to a file, dispatching on the format.
///
/// # Errors
///
/// I/O errors, or any format-specific failure.
#[allow(clippy::too_many_arguments)]
pub fn export_peaks(
    format: ExportFormat,
    path: &Path,
    merged: &MergedPeakCollection,
    data: &Arc<DataSet>,
    cell: &Arc<RwLock<UnitCell>>,
    merged_output: bool,
    scale: f64,
) -> Result<()> {
    info!(?format, path = %path.display(), merged_output, "exporting reflections");
    let file = File::create(path).map_err(anyhow::Error::from)?;
    let mut sink = BufWriter::new(file);
    match format {
        ExportFormat::ShelX => write_shelx(&mut sink, merged, merged_output),
        ExportFormat::FullProf => write_fullprof(&mut sink, merged, data, merged_output),
        ExportFormat::Phenix => write_sca(&mut sink, merged, cell, merged_output, scale),
        ExportFormat::Mtz => mtz::write_mtz(&mut sink, merged, data, cell, merged_output),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intensity::Intensity;
    use crate::merge::MergedPeak;
    use crate::space_group::SpaceGroup;

    fn test_merged() -> MergedPeakCollection {
        let mut merged = MergedPeakCollection::new(SpaceGroup::new("P 1").unwrap(), true, true);
        // assemble two reflections directly
        let mut a = MergedPeak::new(MillerIndex::new(1, 0, 0));
        a.add(Observation {
            hkl: MillerIndex::new(1, 0, 0),
            intensity: Intensity::new(120.5, 16.0),
            frame: 1.0,
            d: 8.0,
        });
        a.add(Observation {
            hkl: MillerIndex::new(-1, 0, 0),
            intensity: Intensity::new(118.3, 16.0),
            frame: 4.0,
            d: 8.0,
        });
        let mut b = MergedPeak::new(MillerIndex::new(2, 1, 0));
        b.add(Observation {
            hkl: MillerIndex::new(2, 1, 0),
            intensity: Intensity::new(5.0e6, 1.0e6),
            frame: 2.0,
            d: 3.5,
        });
        merged.insert_for_tests(a);
        merged.insert_for_tests(b);
        merged
    }

    #[test]
    fn shelx_rows_are_fixed_width() {
        let merged = test_merged();
        let mut out = Vec::new();
        write_shelx(&mut out, &merged, true).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        // d-descending: (1 0 0) with d = 8 comes first
        assert_eq!(&lines[0][..12], "   1   0   0");
        assert_eq!(lines[0].len(), 4 * 3 + 14 * 2 + 5);
        assert!(lines[0].contains("119.4000"));
        assert!(lines[0].ends_with("    1"));
    }

    #[test]
    fn shelx_unmerged_writes_every_observation() {
        let merged = test_merged();
        let mut out = Vec::new();
        write_shelx(&mut out, &merged, false).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), 3);
        assert!(text.contains("  -1   0   0"));
    }

    #[test]
    fn fullprof_header() {
        let merged = test_merged();
        let data = test_data();
        let mut out = Vec::new();
        write_fullprof(&mut out, &merged, &data, true).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with("TITLE"));
        assert_eq!(lines[1], "(3i4,2F14.4,i5,4f8.2)");
        assert!(lines[2].contains("1.500"));
    }

    #[test]
    fn sca_header_and_symbol() {
        let merged = test_merged();
        let cell = Arc::new(RwLock::new(
            UnitCell::from_parameters(
                6.0,
                7.0,
                8.0,
                std::f64::consts::FRAC_PI_2,
                std::f64::consts::FRAC_PI_2,
                std::f64::consts::FRAC_PI_2,
            )
            .unwrap(),
        ));
        cell.write()
            .unwrap()
            .set_space_group("P 21 21 21")
            .unwrap();

        let mut out = Vec::new();
        write_sca(&mut out, &merged, &cell, false, 1.0).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "    1");
        assert_eq!(lines[1], "");
        assert!(lines[2].contains("p212121"));
        assert!(lines[2].contains("90.000"));
        // unmerged rows carry original and representative hkl
        assert!(lines[3].starts_with("   1   0   0   1   0   0"));
    }

    fn test_data() -> Arc<DataSet> {
        use crate::instrument::{Detector, InstrumentState};
        use nalgebra::{UnitQuaternion, Vector3};
        use ndarray::Array2;
        let detector = Detector::new(16, 16, 1.0, 1.0, 100.0);
        let frames = vec![Array2::zeros((16, 16)); 6];
        let states = (0..6)
            .map(|i| {
                let angle = f64::from(i) * 0.2_f64.to_radians();
                InstrumentState::new(
                    UnitQuaternion::from_axis_angle(&Vector3::z_axis(), angle),
                    1.5,
                )
            })
            .collect();
        Arc::new(DataSet::new("mini", detector, frames, states).unwrap())
    }
}
