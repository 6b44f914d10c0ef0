//! Radial peak profiles, the shape model, and profile-fitting integration.

use crate::integrate::{mean_background, ComputeResult, PeakIntegrator};
use crate::intensity::Intensity;
use crate::peak::{IntegratorKind, Peak, RejectionFlag};
use crate::pixel_sum::PixelSumIntegrator;
use crate::region::{EventType, IntegrationRegion};
use nalgebra::Vector3;

/// A 1D peak profile: counts binned by the squared Mahalanobis distance
/// from the peak centre, in shells of equal volume.
///
/// Bin `i` accumulates everything with `r^2 <= e_{i+1}` where the
/// endpoints are `e_i = (i dr^3)^(2/3)`, so the stored counts are
/// cumulative and the last bin holds the whole region.
#[derive(Clone, Debug)]
pub struct Profile1D {
    counts: Vec<f64>,
    npoints: Vec<usize>,
    endpoints: Vec<f64>,
    mean_background: Intensity,
}

impl Profile1D {
    /// Construct with the background estimate, the maximum radius in
    /// sigma units, and the number of shells.
    #[must_use]
    pub fn new(mean_background: Intensity, sigma_max: f64, num: usize) -> Self {
        let dr3 = sigma_max.powi(3) / num as f64;
        let endpoints = (0..=num).map(|i| (i as f64 * dr3).powf(2.0 / 3.0)).collect();
        Self {
            counts: vec![0.0; num],
            npoints: vec![0; num],
            endpoints,
            mean_background,
        }
    }

    /// Add one voxel: `r2` is the squared Mahalanobis distance, `count`
    /// the uncorrected total count.
    pub fn add_point(&mut self, r2: f64, count: f64) {
        let Some(&last) = self.endpoints.last() else {
            return;
        };
        if r2 < 0.0 || r2 > last {
            return;
        }
        for i in 0..self.counts.len() {
            if r2 <= self.endpoints[i + 1] {
                self.counts[i] += count;
                self.npoints[i] += 1;
            }
        }
    }

    /// Cumulative counts per shell.
    #[must_use]
    pub fn counts(&self) -> &[f64] {
        &self.counts
    }

    /// Cumulative number of voxels per shell.
    #[must_use]
    pub fn npoints(&self) -> &[usize] {
        &self.npoints
    }

    /// Normalised profile `p_i = I_i / I_max` with the full error
    /// propagation, including the covariance between a shell and the
    /// outermost shell which shares its background term.
    #[must_use]
    pub fn profile(&self) -> Vec<Intensity> {
        let mean_bkg = self.mean_background.value();
        let var_bkg = self.mean_background.variance();

        let nmax = *self.npoints.last().expect("at least one shell") as f64;
        let cmax = *self.counts.last().expect("at least one shell");
        let i_max = cmax - nmax * mean_bkg;
        let var_max = cmax + nmax * nmax * var_bkg;
        let i3 = i_max * i_max * i_max;
        let i4 = i3 * i_max;

        self.counts
            .iter()
            .zip(&self.npoints)
            .map(|(&c, &np)| {
                let n = np as f64;
                let i = c - n * mean_bkg;
                let i_var = c + n * n * var_bkg;

                let p = i / i_max;
                let mut p_var = i_var / (i_max * i_max);
                p_var += i * i * var_max / i4;
                // the shared background term correlates I and I_max
                let cov = c + n * nmax * var_bkg;
                p_var -= 2.0 * i / i3 * cov;

                Intensity::new(p, p_var)
            })
            .collect()
    }

    /// Zero the accumulators, keeping the binning.
    pub fn reset(&mut self) {
        self.counts.iter_mut().for_each(|c| *c = 0.0);
        self.npoints.iter_mut().for_each(|n| *n = 0);
    }
}

/// Mean of many normalised peak profiles, used by the profile-fitting
/// integrator for weak peaks.
#[derive(Clone, Debug, Default)]
pub struct ShapeModel {
    sums: Vec<Intensity>,
    nprofiles: usize,
    sigma_max: f64,
}

impl ShapeModel {
    /// Empty model; `sigma_max` is recorded from the first profile added.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulate one normalised profile.
    pub fn add_profile(&mut self, profile: &[Intensity], sigma_max: f64) {
        if self.sums.is_empty() {
            self.sums = profile.to_vec();
            self.sigma_max = sigma_max;
        } else {
            assert_eq!(self.sums.len(), profile.len(), "profile binning mismatch");
            for (sum, p) in self.sums.iter_mut().zip(profile) {
                *sum += *p;
            }
        }
        self.nprofiles += 1;
    }

    /// Number of accumulated profiles.
    #[must_use]
    pub const fn nprofiles(&self) -> usize {
        self.nprofiles
    }

    /// Maximum radius of the binning, in sigma units.
    #[must_use]
    pub const fn sigma_max(&self) -> f64 {
        self.sigma_max
    }

    /// The averaged profile, empty when nothing was accumulated.
    #[must_use]
    pub fn mean_profile(&self) -> Vec<Intensity> {
        if self.nprofiles == 0 {
            return Vec::new();
        }
        let inv = 1.0 / self.nprofiles as f64;
        self.sums.iter().map(|sum| *sum * inv).collect()
    }
}

/// Builds the shape model: pixel-sum integration plus accumulation of the
/// normalised radial profile of every strong peak.
pub struct ShapeIntegrator {
    pixel_sum: PixelSumIntegrator,
    model: ShapeModel,
    sigma_max: f64,
    nbins: usize,
}

impl ShapeIntegrator {
    /// Accumulate profiles with the given binning.
    #[must_use]
    pub fn new(sigma_max: f64, nbins: usize) -> Self {
        Self {
            pixel_sum: PixelSumIntegrator::new(false, false),
            model: ShapeModel::new(),
            sigma_max,
            nbins,
        }
    }

    /// Take the accumulated model.
    #[must_use]
    pub fn into_model(self) -> ShapeModel {
        self.model
    }
}

impl PeakIntegrator for ShapeIntegrator {
    fn compute(
        &mut self,
        peak: &Peak,
        shape_model: Option<&ShapeModel>,
        region: &IntegrationRegion,
    ) -> ComputeResult {
        if peak.unit_cell().is_none() {
            return ComputeResult::failure(self.kind(), RejectionFlag::NoUnitCell);
        }
        let result = self.pixel_sum.compute(peak, shape_model, region);
        if result.flag != RejectionFlag::NotRejected {
            return ComputeResult {
                kind: self.kind(),
                ..result
            };
        }

        let mut profile = Profile1D::new(result.background, self.sigma_max, self.nbins);
        let data = region.data();
        for (event, &count) in data.events.iter().zip(&data.counts) {
            let p = Vector3::new(event.px, event.py, event.frame);
            profile.add_point(peak.shape().r2(&p), count);
        }
        self.model.add_profile(&profile.profile(), self.sigma_max);

        ComputeResult {
            kind: self.kind(),
            ..result
        }
    }

    fn kind(&self) -> IntegratorKind {
        IntegratorKind::ShapeProfile
    }
}

/// Scales the shape-model mean profile to the observed shell counts by a
/// one-parameter least squares, giving an intensity estimate that is less
/// noisy than the plain pixel sum for weak peaks.
#[derive(Clone, Debug)]
pub struct Profile1DIntegrator {
    nbins: usize,
}

impl Profile1DIntegrator {
    /// Fit with the given number of shells (must match the model).
    #[must_use]
    pub const fn new(nbins: usize) -> Self {
        Self { nbins }
    }
}

impl Default for Profile1DIntegrator {
    fn default() -> Self {
        Self::new(10)
    }
}

impl PeakIntegrator for Profile1DIntegrator {
    fn compute(
        &mut self,
        peak: &Peak,
        shape_model: Option<&ShapeModel>,
        region: &IntegrationRegion,
    ) -> ComputeResult {
        let kind = self.kind();
        let Some(model) = shape_model else {
            return ComputeResult::failure(kind, RejectionFlag::NoShapeModel);
        };
        let mean = model.mean_profile();
        if mean.is_empty() || mean.len() != self.nbins {
            return ComputeResult::failure(kind, RejectionFlag::NoShapeModel);
        }

        let (background, bkg_gradient) = match mean_background(region) {
            Ok(pair) => pair,
            Err(flag) => return ComputeResult::failure(kind, flag),
        };

        let mut profile = Profile1D::new(background, model.sigma_max(), self.nbins);
        let data = region.data();
        for (event, &count) in data.events.iter().zip(&data.counts) {
            if region.classify(event) == EventType::Forbidden {
                continue;
            }
            let p = Vector3::new(event.px, event.py, event.frame);
            profile.add_point(peak.shape().r2(&p), count);
        }

        // one-parameter weighted least squares: observed_i ~ I * p_i
        let mean_bkg = background.value();
        let var_bkg = background.variance();
        let mut numerator = 0.0;
        let mut denominator = 0.0;
        for ((&c, &np), p) in profile
            .counts()
            .iter()
            .zip(profile.npoints())
            .zip(&mean)
        {
            let n = np as f64;
            let observed = c - n * mean_bkg;
            let variance = (c + n * n * var_bkg).max(1e-12);
            numerator += p.value() * observed / variance;
            denominator += p.value() * p.value() / variance;
        }
        if denominator <= 0.0 {
            return ComputeResult::failure(kind, RejectionFlag::BadIntegrationFit);
        }

        let value = numerator / denominator;
        let variance = 1.0 / denominator;
        let intensity = Intensity::new(value, variance);
        if !intensity.is_valid() || intensity.sigma() <= 0.0 {
            return ComputeResult::failure(kind, RejectionFlag::InvalidSigma);
        }

        ComputeResult {
            kind,
            intensity,
            background,
            bkg_gradient,
            rocking_curve: Vec::new(),
            shape: None,
            flag: RejectionFlag::NotRejected,
        }
    }

    fn kind(&self) -> IntegratorKind {
        IntegratorKind::Profile1D
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    #[test]
    fn equal_volume_endpoints() {
        let profile = Profile1D::new(Intensity::new(0.0, 0.0), 4.0, 8);
        // e_i = (i dr^3)^(2/3): shells enclose equal volumes in r^3
        let dr3 = 4.0_f64.powi(3) / 8.0;
        for (i, r2) in [(1, dr3.powf(2.0 / 3.0)), (8, 16.0)] {
            let endpoints = (0..=8)
                .map(|j| (j as f64 * dr3).powf(2.0 / 3.0))
                .collect::<Vec<_>>();
            assert_approx_eq!(f64, endpoints[i], r2, epsilon = 1e-12);
        }
    }

    #[test]
    fn cumulative_binning() {
        let mut profile = Profile1D::new(Intensity::new(0.0, 0.0), 2.0, 4);
        profile.add_point(0.0, 5.0);
        profile.add_point(3.9, 7.0); // near the outer edge (e_4 = 4)
        profile.add_point(10.0, 100.0); // outside, dropped

        let counts = profile.counts();
        assert_approx_eq!(f64, counts[0], 5.0);
        assert_approx_eq!(f64, counts[3], 12.0);
        assert_eq!(profile.npoints()[3], 2);
    }

    #[test]
    fn background_free_profile_normalises_to_one() {
        let mut profile = Profile1D::new(Intensity::new(0.0, 0.0), 2.0, 4);
        for (r2, c) in [(0.1, 8.0), (1.2, 4.0), (2.5, 2.0), (3.8, 1.0)] {
            profile.add_point(r2, c);
        }
        let p = profile.profile();
        assert_approx_eq!(f64, p.last().unwrap().value(), 1.0, epsilon = 1e-12);
        assert!(p[0].value() < 1.0);
    }

    #[test]
    fn shape_model_averages_profiles() {
        let mut model = ShapeModel::new();
        let a = vec![Intensity::new(0.2, 0.01), Intensity::new(1.0, 0.01)];
        let b = vec![Intensity::new(0.4, 0.01), Intensity::new(1.0, 0.01)];
        model.add_profile(&a, 4.0);
        model.add_profile(&b, 4.0);
        let mean = model.mean_profile();
        assert_eq!(model.nprofiles(), 2);
        assert_approx_eq!(f64, mean[0].value(), 0.3, epsilon = 1e-12);
        assert_approx_eq!(f64, mean[1].value(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn profile_fit_recovers_scale() {
        // a model profile and observations that are exactly 50x the model
        let mut model = ShapeModel::new();
        let shells = [0.1_f64, 0.35, 0.6, 0.85, 1.0];
        let profile: Vec<Intensity> = shells.iter().map(|&p| Intensity::new(p, 1e-6)).collect();
        model.add_profile(&profile, 4.0);
        let mean = model.mean_profile();

        let observed: Vec<f64> = shells.iter().map(|&p| 50.0 * p).collect();
        let mut numerator = 0.0;
        let mut denominator = 0.0;
        for (p, o) in mean.iter().zip(&observed) {
            numerator += p.value() * o;
            denominator += p.value() * p.value();
        }
        assert_approx_eq!(f64, numerator / denominator, 50.0, epsilon = 1e-9);
    }
}
