//! Quality statistics: R factors, correlation coefficients, shells.

use crate::collection::PeakCollection;
use crate::dataset::DataSet;
use crate::merge::{MergedPeak, MergedPeakCollection};
use crate::space_group::SpaceGroup;
use crate::unit_cell::UnitCell;
use std::fmt::Write;
use std::sync::{Arc, RwLock};
use tracing::info;

const SQRT_2_OVER_PI: f64 = 0.7978845608028654;

/// Merging R factors with their expected (noise-floor) counterparts.
#[derive(Clone, Copy, Debug, Default)]
pub struct RFactor {
    /// `R_merge`
    pub r_merge: f64,
    /// `R_meas` (redundancy-corrected)
    pub r_meas: f64,
    /// `R_pim` (precision-indicating)
    pub r_pim: f64,
    /// Expected `R_merge` from the counting errors.
    pub expected_r_merge: f64,
    /// Expected `R_meas`.
    pub expected_r_meas: f64,
    /// Expected `R_pim`.
    pub expected_r_pim: f64,
}

impl RFactor {
    /// Compute all R factors of a merged set. Reflections without
    /// redundancy are skipped.
    #[must_use]
    pub fn compute(merged: &MergedPeakCollection) -> Self {
        let mut out = Self::default();
        let mut i_total = 0.0;

        for peak in merged.merged_peaks() {
            let n = peak.redundancy();
            if n < 2 {
                continue;
            }
            let nf = n as f64;
            let i_ave = peak.intensity().value();
            let f_meas = (nf / (nf - 1.0)).sqrt();
            let f_pim = (1.0 / (nf - 1.0)).sqrt();

            i_total += i_ave.abs() * nf;

            for observation in peak.observations() {
                let diff = (observation.intensity.value() - i_ave).abs();
                out.r_merge += diff;
                out.r_meas += f_meas * diff;
                out.r_pim += f_pim * diff;

                let sigma = observation.intensity.sigma();
                out.expected_r_merge += sigma;
                out.expected_r_meas += sigma * f_meas;
                out.expected_r_pim += sigma * f_pim;
            }
        }

        if i_total < 1e-8 {
            return Self::default();
        }
        out.r_merge /= i_total;
        out.r_meas /= i_total;
        out.r_pim /= i_total;
        out.expected_r_merge *= SQRT_2_OVER_PI / i_total;
        out.expected_r_meas *= SQRT_2_OVER_PI / i_total;
        out.expected_r_pim *= SQRT_2_OVER_PI / i_total;
        out
    }
}

/// The half-set correlation coefficient and its extrapolation.
#[derive(Clone, Copy, Debug, Default)]
pub struct CorrelationCoefficient {
    /// Pearson correlation of random half-set averages.
    pub cc_half: f64,
    /// `CC* = sqrt(2 CC_half / (1 + CC_half))`.
    pub cc_star: f64,
    /// Number of reflections entering the estimate.
    pub n_peaks: usize,
}

impl CorrelationCoefficient {
    /// Compute from a merged set: every reflection with redundancy two or
    /// more is split in half at random (process RNG; seed it for
    /// reproducibility).
    #[must_use]
    pub fn compute(merged: &MergedPeakCollection) -> Self {
        let peaks: Vec<&MergedPeak> = merged.merged_peaks().collect();
        Self::compute_from(&peaks)
    }

    /// Compute from an explicit list of merged peaks.
    #[must_use]
    pub fn compute_from(peaks: &[&MergedPeak]) -> Self {
        let mut xx = 0.0;
        let mut xy = 0.0;
        let mut yy = 0.0;
        let mut x = 0.0;
        let mut y = 0.0;
        let mut n = 0usize;

        for peak in peaks {
            if peak.redundancy() < 2 {
                continue;
            }
            let (a, b) = peak.split();
            if a.redundancy() == 0 || b.redundancy() == 0 {
                continue;
            }
            let i1 = a.intensity().value();
            let i2 = b.intensity().value();
            xx += i1 * i1;
            xy += i1 * i2;
            yy += i2 * i2;
            x += i1;
            y += i2;
            n += 1;
        }

        if n == 0 {
            return Self::default();
        }
        let nf = n as f64;
        let numerator = xy - x * y / nf;
        let var_x = xx - x * x / nf;
        let var_y = yy - y * y / nf;
        let cc_half = numerator / (var_x * var_y).sqrt();
        Self {
            cc_half,
            cc_star: (2.0 * cc_half / (1.0 + cc_half)).max(0.0).sqrt(),
            n_peaks: n,
        }
    }
}

/// Overall quality metrics of a merged set.
#[derive(Clone, Copy, Debug, Default)]
pub struct DataQuality {
    /// Total merged observations.
    pub n_observed: usize,
    /// Symmetry-unique reflections.
    pub n_unique: usize,
    /// Mean redundancy.
    pub redundancy: f64,
    /// Fraction of the theoretically reachable unique reflections.
    pub completeness: f64,
    /// R factors.
    pub r_factors: RFactor,
    /// Half-set correlation.
    pub cc: CorrelationCoefficient,
    /// Whether pixel-sum intensities were used.
    pub sum_statistics: bool,
}

impl DataQuality {
    /// Compute the overall metrics of a merged set.
    #[must_use]
    pub fn compute(merged: &MergedPeakCollection) -> Self {
        let n_unique = merged.n_unique();
        let completeness = if merged.max_peaks() == 0 {
            0.0
        } else {
            n_unique as f64 / merged.max_peaks() as f64
        };
        Self {
            n_observed: merged.total_size(),
            n_unique,
            redundancy: merged.redundancy(),
            completeness,
            r_factors: RFactor::compute(merged),
            cc: CorrelationCoefficient::compute(merged),
            sum_statistics: merged.sum_intensity(),
        }
    }

    /// One fixed-width report row.
    #[must_use]
    pub fn report_row(&self) -> String {
        format!(
            "{:8.4}{:8.4}{:8.4}{:8.4}{:8.4}{:8.4}{:8.4}{:8.4}{:8.4}",
            self.r_factors.r_meas,
            self.r_factors.expected_r_meas,
            self.r_factors.r_merge,
            self.r_factors.expected_r_merge,
            self.r_factors.r_pim,
            self.r_factors.expected_r_pim,
            self.cc.cc_half,
            self.cc.cc_star,
            self.completeness,
        )
    }
}

/// Quality of one resolution shell.
#[derive(Clone, Copy, Debug)]
pub struct ShellQuality {
    /// Lower d bound of the shell.
    pub d_min: f64,
    /// Upper d bound of the shell.
    pub d_max: f64,
    /// Metrics inside the shell.
    pub quality: DataQuality,
}

/// Per-shell quality across a resolution range.
#[derive(Clone, Debug, Default)]
pub struct DataResolution {
    /// Shells, reported from low d to high d.
    pub shells: Vec<ShellQuality>,
}

impl DataResolution {
    /// Shell edges partitioning `[d_min, d_max]` into `n_shells` of equal
    /// reciprocal-space volume; returned in ascending d.
    #[must_use]
    pub fn shell_edges(d_min: f64, d_max: f64, n_shells: usize) -> Vec<(f64, f64)> {
        let q3_max = (1.0 / d_min).powi(3);
        let q3_min = (1.0 / d_max).powi(3);
        let dq3 = (q3_max - q3_min) / n_shells as f64;
        (0..n_shells)
            .map(|i| {
                // shell i counts down from the highest q (lowest d)
                let hi_q3 = q3_max - i as f64 * dq3;
                let lo_q3 = hi_q3 - dq3;
                (1.0 / hi_q3.cbrt(), 1.0 / lo_q3.cbrt())
            })
            .collect()
    }

    /// Merge the collections shell by shell and compute the per-shell
    /// metrics. Both the sum and the profile variant of this report are
    /// produced by calling twice with `sum_intensity` toggled.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn compute(
        collections: &[&PeakCollection],
        data: &Arc<DataSet>,
        cell: &Arc<RwLock<UnitCell>>,
        group: &SpaceGroup,
        friedel: bool,
        sum_intensity: bool,
        d_min: f64,
        d_max: f64,
        n_shells: usize,
    ) -> Self {
        let mut out = Self::default();
        for (shell_d_min, shell_d_max) in Self::shell_edges(d_min, d_max, n_shells) {
            let mut merged = MergedPeakCollection::new(group.clone(), friedel, sum_intensity);
            merged.set_max_peaks(data, cell, shell_d_min, shell_d_max);
            for collection in collections {
                merged.add_collection(collection);
            }
            out.shells.push(ShellQuality {
                d_min: shell_d_min,
                d_max: shell_d_max,
                quality: DataQuality::compute(&merged),
            });
        }
        info!(shells = out.shells.len(), "computed shell statistics");
        out
    }

    /// Formatted per-shell summary.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut out = String::from(
            "    dmin    dmax    Rmea   eRmea    Rmer   eRmer    Rpim   eRpim  CChalf  CCstar  Compl.\n",
        );
        for shell in &self.shells {
            let _ = writeln!(
                out,
                "{:8.4}{:8.4}{}",
                shell.d_min,
                shell.d_max,
                shell.quality.report_row()
            );
        }
        out
    }
}
