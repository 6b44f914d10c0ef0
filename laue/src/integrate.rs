//! Frame-driven peak integration.

use crate::dataset::DataSet;
use crate::ellipsoid::Ellipsoid;
use crate::error::{Error, Result};
use crate::gaussian::GaussianIntegrator;
use crate::intensity::Intensity;
use crate::peak::{IntegratorKind, Peak, RejectionFlag};
use crate::pixel_sum::PixelSumIntegrator;
use crate::profile::{Profile1DIntegrator, ShapeIntegrator, ShapeModel};
use crate::progress::ProgressHandler;
use crate::region::{EventType, IntegrationRegion, RegionType};
use enum_dispatch::enum_dispatch;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Options shared by all integrators.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct IntegrationParameters {
    /// Peak-zone boundary (sigma multiples or pixels, see `region_type`).
    pub peak_end: f64,
    /// Inner boundary of the background shell.
    pub bkg_begin: f64,
    /// Outer boundary of the background shell.
    pub bkg_end: f64,
    /// Refit the peak centre from the strong pixels.
    pub fit_center: bool,
    /// Refit the peak covariance from the strong pixels.
    pub fit_cov: bool,
    /// Interpretation of the boundaries.
    pub region_type: RegionType,
}

impl Default for IntegrationParameters {
    fn default() -> Self {
        Self {
            peak_end: 3.0,
            bkg_begin: 3.0,
            bkg_end: 6.0,
            fit_center: true,
            fit_cov: true,
            region_type: RegionType::VariableEllipsoid,
        }
    }
}

/// Outcome of integrating one peak.
#[derive(Clone, Debug)]
pub struct ComputeResult {
    /// Which integrator produced the result.
    pub kind: IntegratorKind,
    /// Background-corrected intensity.
    pub intensity: Intensity,
    /// Mean local background (the sigma is that of the estimate).
    pub background: Intensity,
    /// Mean background gradient.
    pub bkg_gradient: Intensity,
    /// Per-frame intensity across the peak.
    pub rocking_curve: Vec<Intensity>,
    /// Updated shape, when the integrator refits it.
    pub shape: Option<Ellipsoid>,
    /// `NotRejected` on success, the failure reason otherwise.
    pub flag: RejectionFlag,
}

impl ComputeResult {
    /// A failed result carrying only the rejection reason.
    #[must_use]
    pub fn failure(kind: IntegratorKind, flag: RejectionFlag) -> Self {
        Self {
            kind,
            intensity: Intensity::default(),
            background: Intensity::default(),
            bkg_gradient: Intensity::default(),
            rocking_curve: Vec::new(),
            shape: None,
            flag,
        }
    }
}

/// Integration entry point implemented by every integrator variant.
#[enum_dispatch]
pub trait PeakIntegrator {
    /// Integrate one peak from its collected region data.
    fn compute(
        &mut self,
        peak: &Peak,
        shape_model: Option<&ShapeModel>,
        region: &IntegrationRegion,
    ) -> ComputeResult;

    /// Which result slot this integrator fills.
    fn kind(&self) -> IntegratorKind;
}

/// The closed set of integrators.
#[enum_dispatch(PeakIntegrator)]
pub enum Integrator {
    /// Pixel sums over the peak zone.
    PixelSumIntegrator,
    /// 3D Gaussian fit.
    GaussianIntegrator,
    /// Profile fit against the shape-model mean profile.
    Profile1DIntegrator,
    /// Pixel sums plus shape-model accumulation.
    ShapeIntegrator,
}

/// Iterated mean background with 3-sigma outlier rejection, and the mean
/// background gradient when gradients were collected.
///
/// The returned sigma is that of the background *estimate*: `mean / n` for
/// Poisson counts.
pub(crate) fn mean_background(
    region: &IntegrationRegion,
) -> std::result::Result<(Intensity, Intensity), RejectionFlag> {
    let data = region.data();
    if data.events.len() < 20 {
        debug!("too few data points for background estimate");
        return Err(RejectionFlag::TooFewPoints);
    }

    let mut mean = 0.0;
    let mut sigma = 0.0;
    let mut nbkg = 0usize;
    for iteration in 0..20 {
        let mut sum = 0.0;
        let mut sum2 = 0.0;
        nbkg = 0;
        for (event, &count) in data.events.iter().zip(&data.counts) {
            if region.classify(event) != EventType::Background {
                continue;
            }
            if iteration > 0 && (count - mean).abs() > 3.0 * sigma {
                continue;
            }
            sum += count;
            sum2 += count * count;
            nbkg += 1;
        }
        if nbkg < 2 {
            return Err(RejectionFlag::TooFewPoints);
        }
        let old_mean = mean;
        #[allow(clippy::cast_precision_loss)]
        let n = nbkg as f64;
        mean = sum / n;
        sigma = ((sum2 - n * mean * mean) / (n - 1.0)).max(0.0).sqrt();
        if iteration > 0 && ((old_mean - mean) / mean).abs() < 1e-9 {
            break;
        }
    }

    #[allow(clippy::cast_precision_loss)]
    let background = Intensity::new(mean, mean / nbkg as f64);

    let gradient = if data.gradients.is_empty() {
        Intensity::default()
    } else {
        let mut sum = 0.0;
        let mut sum2 = 0.0;
        let mut n = 0usize;
        for (event, &g) in data.events.iter().zip(&data.gradients) {
            if region.classify(event) == EventType::Background {
                sum += g;
                sum2 += g * g;
                n += 1;
            }
        }
        if n > 1 {
            #[allow(clippy::cast_precision_loss)]
            let nf = n as f64;
            let mean_g = sum / nf;
            Intensity::new(mean_g, ((sum2 - nf * mean_g * mean_g) / (nf - 1.0)).max(0.0) / nf)
        } else {
            Intensity::default()
        }
    };

    Ok((background, gradient))
}

/// Integrate every enabled peak of `peaks` that belongs to `data`,
/// sweeping the frames once and feeding each peak to the integrator as
/// soon as its region is fully read.
///
/// Returns the number of successfully integrated peaks.
///
/// # Errors
///
/// [`Error::Cancelled`] when the progress handler requests cancellation;
/// per-peak failures are recorded on the peaks, never returned.
pub fn integrate(
    integrator: &mut Integrator,
    peaks: &mut [Peak],
    shape_model: Option<&ShapeModel>,
    data: &Arc<DataSet>,
    params: &IntegrationParameters,
    handler: Option<&ProgressHandler>,
) -> Result<usize> {
    let kind = integrator.kind();
    info!(
        peaks = peaks.len(),
        frames = data.nframes(),
        "integrating peaks"
    );

    // build the regions, rejecting peaks whose region leaves the data
    let mut regions: Vec<Option<IntegrationRegion>> = Vec::with_capacity(peaks.len());
    for peak in peaks.iter_mut() {
        if !Arc::ptr_eq(peak.data(), data) || !peak.enabled() {
            regions.push(None);
            continue;
        }
        peak.reset_integration(kind);
        match IntegrationRegion::new(
            peak,
            params.peak_end,
            params.bkg_begin,
            params.bkg_end,
            params.region_type,
        ) {
            Ok(region) => {
                let bb = region.bounding_box();
                #[allow(clippy::cast_precision_loss)]
                let inside = bb.lower[0] >= 0.0
                    && bb.lower[1] >= 0.0
                    && bb.lower[2] >= 0.0
                    && bb.upper[0] < data.ncols() as f64
                    && bb.upper[1] < data.nrows() as f64
                    && bb.upper[2] < data.nframes() as f64;
                if inside {
                    regions.push(Some(region));
                } else {
                    peak.set_selected(false);
                    peak.set_integration_flag(RejectionFlag::InvalidRegion, kind);
                    regions.push(None);
                }
            }
            Err(_) => {
                peak.set_selected(false);
                peak.set_integration_flag(RejectionFlag::InvalidShape, kind);
                regions.push(None);
            }
        }
    }

    let mut integrated = vec![false; peaks.len()];
    let mut n_success = 0usize;

    for frame_idx in 0..data.nframes() {
        let image = data.transformed_frame(frame_idx);
        let gradient = data.gradient_frame(frame_idx);

        let mut mask: Array2<u8> = Array2::zeros((data.nrows(), data.ncols()));
        for region in regions.iter().flatten() {
            region.update_mask(&mut mask, frame_idx);
        }

        for (idx, peak) in peaks.iter_mut().enumerate() {
            let Some(region) = regions[idx].as_mut() else {
                continue;
            };
            let mut done = region.advance_frame(&image, Some(&gradient), &mask, frame_idx);
            done |= frame_idx == data.nframes() - 1;
            if !done || integrated[idx] {
                continue;
            }

            let result = integrator.compute(peak, shape_model, region);
            if result.flag == RejectionFlag::NotRejected {
                if let Some(shape) = result.shape {
                    peak.set_shape(shape);
                }
                peak.update_integration(
                    result.kind,
                    result.intensity,
                    result.background,
                    result.bkg_gradient,
                    result.rocking_curve,
                    params.peak_end,
                    params.bkg_begin,
                    params.bkg_end,
                    params.region_type,
                );
                n_success += 1;
            } else {
                peak.set_selected(false);
                peak.set_integration_flag(result.flag, result.kind);
            }
            region.reset();
            integrated[idx] = true;
        }

        if let Some(handler) = handler {
            #[allow(clippy::cast_precision_loss)]
            let fraction = (frame_idx + 1) as f64 / data.nframes() as f64;
            if !handler.update("integrating", fraction) {
                return Err(Error::Cancelled);
            }
        }
    }

    info!(integrated = n_success, "integration finished");
    Ok(n_success)
}
