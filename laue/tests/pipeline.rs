//! End-to-end reduction of a synthetic rotation scan: predict peaks from a
//! known cell, paint them onto frames, integrate, index, refine, merge,
//! rescale, and export.

use laue::collection::{predict_peaks, PredictionParameters};
use laue::dataset::DataSet;
use laue::export;
use laue::indexer::AutoIndexer;
use laue::instrument::{Detector, InstrumentState};
use laue::integrate::{integrate, IntegrationParameters, Integrator};
use laue::merge::MergedPeakCollection;
use laue::peak::Peak;
use laue::pixel_sum::PixelSumIntegrator;
use laue::refiner::{Refiner, RefinerParameters};
use laue::region::RegionType;
use laue::rescale::{Rescaler, RescalerParameters};
use laue::statistics::{DataQuality, DataResolution};
use laue::unit_cell::UnitCell;
use nalgebra::{Rotation3, UnitQuaternion, Vector3};
use ndarray::Array2;
use std::sync::{Arc, RwLock};

const NFRAMES: usize = 60;
const NPIX: usize = 128;
const WAVELENGTH: f64 = 1.0;
const BACKGROUND: f64 = 20.0;
const D_MIN: f64 = 2.4;
const D_MAX: f64 = 11.0;
const FRAC_PI_2: f64 = std::f64::consts::FRAC_PI_2;

/// True integrated intensity of a reflection; symmetric under the
/// orthorhombic group and Friedel inversion, so every member of an orbit
/// shares one value.
fn true_intensity(h: i32, k: i32, l: i32) -> f64 {
    1.0e5 * (4.0 + 0.6 * f64::from(h * h) + 0.35 * f64::from(k * k) + 0.2 * f64::from(l * l))
}

fn reference_cell() -> UnitCell {
    let mut cell =
        UnitCell::from_parameters(9.0, 11.0, 13.0, FRAC_PI_2, FRAC_PI_2, FRAC_PI_2).unwrap();
    // tilt the crystal away from the laboratory axes
    let rotation = Rotation3::new(Vector3::new(0.15, -0.1, 0.2));
    let basis = rotation.matrix() * cell.basis();
    cell = UnitCell::from_basis(basis).unwrap();
    cell.set_space_group("P 2 2 2").unwrap();
    cell.set_indexing_tolerance(0.15);
    cell
}

fn scan_states() -> Vec<InstrumentState> {
    (0..NFRAMES)
        .map(|i| {
            let angle = i as f64 * 0.5_f64.to_radians();
            InstrumentState::new(
                UnitQuaternion::from_axis_angle(&Vector3::z_axis(), angle),
                WAVELENGTH,
            )
        })
        .collect()
}

fn empty_data() -> DataSet {
    let detector = Detector::new(NPIX, NPIX, 2.0, 2.0, 220.0);
    let frames = vec![Array2::from_elem((NPIX, NPIX), BACKGROUND); NFRAMES];
    DataSet::new("synthetic-scan", detector, frames, scan_states()).unwrap()
}

/// Paint every predicted peak as a Gaussian spot. The painted counts are
/// `I_true * L * step` so that the Lorentz and rotation-step corrections
/// recover `I_true` on integration, exactly as for measured data.
fn painted_data(reference: &Arc<DataSet>, peaks: &[Peak]) -> Arc<DataSet> {
    let mut frames = vec![Array2::from_elem((NPIX, NPIX), BACKGROUND); NFRAMES];
    let sigma_xy = 1.6_f64;
    let sigma_f = 0.9_f64;

    for peak in peaks {
        let c = peak.shape().center();
        let state = reference.interpolated_state(c[2]);
        if !state.is_valid() {
            continue;
        }
        let lorentz = state.lorentz_factor(reference.detector(), c[0], c[1]);
        let hkl = peak.hkl();
        let counts = true_intensity(hkl.h(), hkl.k(), hkl.l()) * lorentz * state.step;
        let amplitude =
            counts / ((2.0 * std::f64::consts::PI).powf(1.5) * sigma_xy * sigma_xy * sigma_f);

        let f0 = (c[2] - 4.0 * sigma_f).floor().max(0.0) as usize;
        let f1 = ((c[2] + 4.0 * sigma_f).ceil() as usize).min(NFRAMES - 1);
        let x0 = (c[0] - 6.5).floor().max(0.0) as usize;
        let x1 = ((c[0] + 6.5).ceil() as usize).min(NPIX - 1);
        let y0 = (c[1] - 6.5).floor().max(0.0) as usize;
        let y1 = ((c[1] + 6.5).ceil() as usize).min(NPIX - 1);

        for f in f0..=f1 {
            for y in y0..=y1 {
                for x in x0..=x1 {
                    let dx = x as f64 - c[0];
                    let dy = y as f64 - c[1];
                    let df = f as f64 - c[2];
                    let arg = dx * dx / (2.0 * sigma_xy * sigma_xy)
                        + dy * dy / (2.0 * sigma_xy * sigma_xy)
                        + df * df / (2.0 * sigma_f * sigma_f);
                    frames[f][(y, x)] += amplitude * (-arg).exp();
                }
            }
        }
    }

    let detector = Detector::new(NPIX, NPIX, 2.0, 2.0, 220.0);
    Arc::new(DataSet::new("synthetic-scan", detector, frames, scan_states()).unwrap())
}

struct Reduced {
    data: Arc<DataSet>,
    cell: Arc<RwLock<UnitCell>>,
    peaks: Vec<Peak>,
}

/// Shared pipeline front end: predict, paint, re-home the peaks onto the
/// painted data, integrate.
fn reduce() -> Reduced {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let data = Arc::new(empty_data());
    let cell = Arc::new(RwLock::new(reference_cell()));

    let prediction = PredictionParameters {
        d_min: D_MIN,
        d_max: D_MAX,
        radius: 2.8,
        frame_sigma: 1.4,
    };
    let predicted = predict_peaks(&data, &cell, &prediction);
    assert!(
        predicted.len() >= 30,
        "too few predicted peaks: {}",
        predicted.len()
    );

    let painted = painted_data(&data, predicted.peaks());
    let mut peaks: Vec<Peak> = predicted
        .peaks()
        .iter()
        .map(|p| {
            let mut clone = Peak::new(Arc::clone(&painted), *p.shape());
            clone.set_predicted(true);
            clone.set_unit_cell(&cell);
            clone.set_hkl(*p.hkl());
            clone
        })
        .collect();

    let params = IntegrationParameters {
        peak_end: 3.0,
        bkg_begin: 3.5,
        bkg_end: 5.0,
        fit_center: false,
        fit_cov: false,
        region_type: RegionType::VariableEllipsoid,
    };
    let mut integrator = Integrator::from(PixelSumIntegrator::new(false, false));
    let n = integrate(&mut integrator, &mut peaks, None, &painted, &params, None).unwrap();
    assert!(n >= 20, "integrated only {n} peaks");

    Reduced {
        data: painted,
        cell,
        peaks,
    }
}

fn merged_set(reduced: &Reduced, friedel: bool) -> MergedPeakCollection {
    let group = reduced.cell.read().unwrap().space_group().clone();
    let mut merged = MergedPeakCollection::new(group, friedel, true);
    merged.set_max_peaks(&reduced.data, &reduced.cell, D_MIN, D_MAX);
    for peak in &reduced.peaks {
        merged.add_peak(peak);
    }
    merged
}

#[test]
fn integration_recovers_true_intensities() {
    let reduced = reduce();
    let mut checked = 0;
    for peak in &reduced.peaks {
        if !peak.enabled() {
            continue;
        }
        let hkl = peak.hkl();
        let expected = true_intensity(hkl.h(), hkl.k(), hkl.l());
        let corrected = peak.corrected_sum_intensity();
        assert!(corrected.is_valid());
        let got = corrected.value();
        // tails beyond the integration radius lose a few percent
        assert!(
            (got - expected).abs() / expected < 0.2,
            "{hkl}: got {got}, expected {expected}"
        );
        checked += 1;
    }
    assert!(checked >= 15, "only {checked} peaks checked");
}

#[test]
fn merging_is_idempotent_and_consistent() {
    laue::random::seed(17);
    let reduced = reduce();
    let merged = merged_set(&reduced, true);

    assert!(merged.n_unique() >= 10, "unique {}", merged.n_unique());
    assert!(merged.redundancy() >= 1.0);

    // merging the same peaks again doubles every redundancy but keeps the
    // unique set
    let mut twice = merged_set(&reduced, true);
    for peak in &reduced.peaks {
        twice.add_peak(peak);
    }
    assert_eq!(twice.n_unique(), merged.n_unique());
    assert_eq!(twice.total_size(), 2 * merged.total_size());

    // equivalents carry one true intensity each: small R factors
    let quality = DataQuality::compute(&merged);
    assert!(
        quality.r_factors.r_merge < 0.05,
        "Rmerge {}",
        quality.r_factors.r_merge
    );
    assert!(quality.r_factors.r_meas >= quality.r_factors.r_merge);
    assert!(quality.r_factors.r_pim <= quality.r_factors.r_meas);
    assert!(
        quality.completeness > 0.2,
        "completeness {}",
        quality.completeness
    );
    if quality.cc.n_peaks >= 5 {
        assert!(quality.cc.cc_half > 0.9, "CC1/2 {}", quality.cc.cc_half);
        assert!(quality.cc.cc_star >= quality.cc.cc_half - 1e-9);
    }

    // the merged set is ordered by representative index
    let reps: Vec<_> = merged.merged_peaks().map(|p| *p.index()).collect();
    let mut sorted = reps.clone();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    assert_eq!(reps, sorted);
}

#[test]
fn shell_statistics_cover_the_resolution_range() {
    laue::random::seed(5);
    let reduced = reduce();
    let mut collection = laue::collection::PeakCollection::new(
        "reduced",
        laue::collection::PeakCollectionKind::Predicted,
    );
    for peak in &reduced.peaks {
        collection.push(peak.clone());
    }
    collection.set_unit_cell(&reduced.cell);

    let group = reduced.cell.read().unwrap().space_group().clone();
    let resolution = DataResolution::compute(
        &[&collection],
        &reduced.data,
        &reduced.cell,
        &group,
        true,
        true,
        D_MIN,
        D_MAX,
        4,
    );
    assert_eq!(resolution.shells.len(), 4);
    // reported low d to high d
    for pair in resolution.shells.windows(2) {
        assert!(pair[0].d_min <= pair[1].d_min);
    }
    let observed: usize = resolution.shells.iter().map(|s| s.quality.n_observed).sum();
    assert!(observed > 0);
    assert!(!resolution.summary().is_empty());
}

#[test]
fn autoindexing_recovers_the_cell() {
    let reduced = reduce();
    let mut indexer = AutoIndexer::new();
    indexer.params.maxdim = 30.0;
    indexer.params.n_vertices = 3000;
    indexer.params.subdiv = 12;
    indexer.params.n_solutions = 8;
    indexer.params.d_min = D_MIN;
    indexer.params.d_max = D_MAX;
    indexer.params.indexing_tolerance = 0.25;
    indexer.params.min_cell_volume = 100.0;
    indexer.params.solution_cutoff = 50.0;

    let ok = indexer.autoindex(&reduced.peaks, None, true, None).unwrap();
    assert!(ok, "indexing failed outright");
    assert!(
        !indexer.solutions().is_empty(),
        "no solutions survived the cutoff"
    );

    let reference =
        UnitCell::from_parameters(9.0, 11.0, 13.0, FRAC_PI_2, FRAC_PI_2, FRAC_PI_2).unwrap();
    let hit = indexer.good_solution(&reference, 0.05, 0.05);
    assert!(
        hit.is_some(),
        "true cell not among:\n{}",
        indexer.solutions_table()
    );
    assert!(hit.unwrap().quality > 80.0);
}

#[test]
fn refinement_keeps_the_cell_and_marks_states() {
    let reduced = reduce();
    let parameters = RefinerParameters {
        nbatches: 6,
        max_iter: 200,
        refine_ub: true,
        refine_sample_position: true,
        refine_sample_orientation: true,
        refine_detector_offset: false,
        refine_ki: false,
        use_batch_cells: false,
        set_unit_cell: true,
        residual_type: laue::refiner::ResidualType::QSpace,
    };

    let mut peaks = reduced.peaks.clone();
    let mut refiner = Refiner::new(&peaks, &reduced.cell, &reduced.data, &parameters).unwrap();
    assert!(refiner.batches().len() >= 2);

    let converged = refiner
        .refine(&mut peaks, &reduced.data, &parameters, None)
        .unwrap();
    assert!(converged, "refinement did not converge");

    // the data were generated from the cell itself: it must not move
    let reference = reference_cell();
    let refined = reduced.cell.read().unwrap().clone();
    assert!(
        refined.is_similar(&reference, 0.02, 0.02),
        "cell drifted: {refined}"
    );

    {
        let states = reduced.data.states();
        assert!(states.iter().any(|s| s.refined));
    }

    let updated = refiner.update_predictions(&mut peaks);
    assert!(updated > 0);
}

#[test]
fn rescaling_fixes_the_gauge() {
    laue::random::seed(23);
    let reduced = reduce();
    let mut collection = laue::collection::PeakCollection::new(
        "to-rescale",
        laue::collection::PeakCollectionKind::Predicted,
    );
    for peak in &reduced.peaks {
        collection.push(peak.clone());
    }
    collection.set_unit_cell(&reduced.cell);

    let group = reduced.cell.read().unwrap().space_group().clone();
    let parameters = RescalerParameters {
        max_iter: 400,
        frame_ratio: 0.2,
        ctol: 1e-3,
        ..RescalerParameters::default()
    };
    let mut rescaler = Rescaler::new(group, parameters, NFRAMES);
    let minimum = rescaler.rescale(&mut collection, None).unwrap();
    assert!(minimum.is_finite());

    let scales = rescaler.scale_factors();
    assert!((scales[0] - 1.0).abs() < 1e-6, "s0 = {}", scales[0]);
    for f in 1..scales.len() {
        assert!(
            scales[f] <= 1.2 * scales[f - 1] + 1e-9 && scales[f] >= 0.8 * scales[f - 1] - 1e-9,
            "chain constraint broken at frame {f}"
        );
    }
}

#[test]
fn exporters_write_consistent_tables() {
    laue::random::seed(31);
    let reduced = reduce();
    let merged = merged_set(&reduced, true);

    let mut shelx = Vec::new();
    export::write_shelx(&mut shelx, &merged, true).unwrap();
    let text = String::from_utf8(shelx).unwrap();
    assert_eq!(text.lines().count(), merged.n_unique());
    for line in text.lines() {
        assert_eq!(line.len(), 45);
        assert!(line.ends_with("    1"));
    }

    let mut fullprof = Vec::new();
    export::write_fullprof(&mut fullprof, &merged, &reduced.data, false).unwrap();
    let text = String::from_utf8(fullprof).unwrap();
    assert!(text.starts_with("TITLE"));
    assert_eq!(text.lines().count(), 3 + merged.total_size());

    let mut sca = Vec::new();
    export::write_sca(&mut sca, &merged, &reduced.cell, true, 1.0).unwrap();
    let text = String::from_utf8(sca).unwrap();
    assert!(text.starts_with("    1\n\n"));
    assert!(text.contains("p222"));

    let mut mtz = Vec::new();
    laue::mtz::write_mtz(&mut mtz, &merged, &reduced.data, &reduced.cell, true).unwrap();
    assert_eq!(&mtz[0..4], b"MTZ ");
    let text_part = String::from_utf8_lossy(&mtz);
    assert!(text_part.contains("MTZENDOFHEADERS"));

    // and the path-based front end
    let path = std::env::temp_dir().join("laue-pipeline-test.hkl");
    export::export_peaks(
        export::ExportFormat::ShelX,
        &path,
        &merged,
        &reduced.data,
        &reduced.cell,
        true,
        1.0,
    )
    .unwrap();
    assert!(path.exists());
    let _ = std::fs::remove_file(path);
}
