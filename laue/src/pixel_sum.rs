//! Pixel-sum integration with mean-background subtraction.

use crate::blob::Blob3D;
use crate::ellipsoid::Ellipsoid;
use crate::integrate::{mean_background, ComputeResult, PeakIntegrator};
use crate::intensity::Intensity;
use crate::peak::{IntegratorKind, Peak, RejectionFlag};
use crate::profile::ShapeModel;
use crate::region::{EventType, IntegrationRegion};

/// Background-corrected pixel sums over the peak zone, with an optional
/// centre/covariance refit from the strong pixels.
#[derive(Clone, Copy, Debug)]
pub struct PixelSumIntegrator {
    /// Refit the centre from the strong-pixel blob.
    pub fit_center: bool,
    /// Refit the covariance from the strong-pixel blob.
    pub fit_cov: bool,
}

impl PixelSumIntegrator {
    /// Construct with the given refit options.
    #[must_use]
    pub const fn new(fit_center: bool, fit_cov: bool) -> Self {
        Self {
            fit_center,
            fit_cov,
        }
    }
}

impl PeakIntegrator for PixelSumIntegrator {
    fn compute(
        &mut self,
        peak: &Peak,
        _shape_model: Option<&ShapeModel>,
        region: &IntegrationRegion,
    ) -> ComputeResult {
        let kind = self.kind();
        let (background, bkg_gradient) = match mean_background(region) {
            Ok(pair) => pair,
            Err(flag) => return ComputeResult::failure(kind, flag),
        };

        let data = region.data();
        let mean_bkg = background.value();
        let std_bkg = background.sigma();
        // pixel sigma assuming Poisson counts
        let sigma = mean_bkg.max(0.0).sqrt();

        let mut sum_peak = 0.0;
        let mut npeak = 0usize;
        let mut blob = Blob3D::new();
        let mut f_min = f64::INFINITY;
        let mut f_max = f64::NEG_INFINITY;

        for (event, &count) in data.events.iter().zip(&data.counts) {
            f_min = f_min.min(event.frame);
            f_max = f_max.max(event.frame);
            if region.classify(event) != EventType::Peak {
                continue;
            }
            sum_peak += count;
            npeak += 1;
            if count > mean_bkg + sigma {
                blob.add_point(event.px, event.py, event.frame, count - mean_bkg);
            }
        }
        if npeak == 0 {
            return ComputeResult::failure(kind, RejectionFlag::TooFewPoints);
        }

        #[allow(clippy::cast_precision_loss)]
        let np = npeak as f64;
        sum_peak -= np * mean_bkg;
        let intensity = Intensity::new(
            sum_peak,
            sum_peak + np * mean_bkg + np * np * std_bkg * std_bkg,
        );

        // centre / covariance refit
        let center = if self.fit_center {
            if !blob.is_valid() {
                return ComputeResult::failure(kind, RejectionFlag::InvalidCentroid);
            }
            blob.center()
        } else {
            peak.shape().center()
        };
        let covariance = if self.fit_cov {
            if !blob.is_valid() {
                return ComputeResult::failure(kind, RejectionFlag::InvalidCentroid);
            }
            blob.covariance()
        } else {
            peak.shape().inverse_metric()
        };

        if !center.norm().is_finite() {
            return ComputeResult::failure(kind, RejectionFlag::InvalidCentroid);
        }
        if !peak.shape().is_inside(&center) {
            return ComputeResult::failure(kind, RejectionFlag::InvalidCentroid);
        }

        let a0 = peak.shape().metric();
        let Some(a1) = covariance.try_inverse() else {
            return ComputeResult::failure(kind, RejectionFlag::InvalidCovariance);
        };
        if (a1 - a0).norm() / a0.norm() >= 2.0 {
            return ComputeResult::failure(kind, RejectionFlag::InvalidCovariance);
        }
        let eigenvalues = covariance.symmetric_eigenvalues();
        if eigenvalues.min() < 0.1 || eigenvalues.max() > 100.0 {
            return ComputeResult::failure(kind, RejectionFlag::InvalidShape);
        }

        let shape = (self.fit_center || self.fit_cov).then(|| Ellipsoid::new(center, a1));

        // rocking curve: background-corrected intensity per frame
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let nframes = (f_max - f_min) as usize + 1;
        let mut counts_per_frame = vec![0.0; nframes];
        let mut peak_points_per_frame = vec![0.0; nframes];
        for (event, &count) in data.events.iter().zip(&data.counts) {
            if region.classify(event) != EventType::Peak {
                continue;
            }
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let bin = (event.frame - f_min) as usize;
            counts_per_frame[bin] += count;
            peak_points_per_frame[bin] += 1.0;
        }
        let rocking_curve = counts_per_frame
            .iter()
            .zip(&peak_points_per_frame)
            .map(|(&c, &n)| {
                let corrected = c - n * mean_bkg;
                Intensity::new(corrected, corrected.abs())
            })
            .collect();

        ComputeResult {
            kind,
            intensity,
            background,
            bkg_gradient,
            rocking_curve,
            shape,
            flag: RejectionFlag::NotRejected,
        }
    }

    fn kind(&self) -> IntegratorKind {
        IntegratorKind::PixelSum
    }
}
