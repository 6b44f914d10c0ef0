//! 3D Gaussian peak-model integration.

use crate::ellipsoid::Ellipsoid;
use crate::fit::FitParameters;
use crate::integrate::{ComputeResult, PeakIntegrator};
use crate::intensity::Intensity;
use crate::minimizer::Minimizer;
use crate::peak::{IntegratorKind, Peak, RejectionFlag};
use crate::profile::ShapeModel;
use crate::region::IntegrationRegion;
use nalgebra::{DVector, Matrix3, Vector3};

/// Minimum Pearson correlation between model and data for an accepted fit.
const MIN_PEARSON: f64 = 0.75;

/// Fits `M(x) = B + I exp(-1/2 (x-x0)^T A (x-x0))` to the region counts,
/// with `A = L L^T` parameterised by the six free entries of the Cholesky
/// factor so that the fitted metric stays symmetric.
#[derive(Clone, Copy, Debug)]
pub struct GaussianIntegrator {
    /// Refit the centre.
    pub fit_center: bool,
    /// Refit the metric.
    pub fit_cov: bool,
}

impl Default for GaussianIntegrator {
    fn default() -> Self {
        Self {
            fit_center: true,
            fit_cov: true,
        }
    }
}

/// Parameter layout: `[B, I, x0 (3), a (6)]` with the optional blocks
/// present only when refined.
struct Layout {
    fit_center: bool,
    fit_cov: bool,
    x0: Vector3<f64>,
    a: [f64; 6],
}

impl Layout {
    fn center(&self, x: &[f64]) -> Vector3<f64> {
        if self.fit_center {
            Vector3::new(x[2], x[3], x[4])
        } else {
            self.x0
        }
    }

    fn cholesky(&self, x: &[f64]) -> [f64; 6] {
        if self.fit_cov {
            let base = if self.fit_center { 5 } else { 2 };
            [
                x[base],
                x[base + 1],
                x[base + 2],
                x[base + 3],
                x[base + 4],
                x[base + 5],
            ]
        } else {
            self.a
        }
    }
}

fn from_cholesky(a: &[f64; 6]) -> Matrix3<f64> {
    let l = Matrix3::new(
        a[0], 0.0, 0.0, //
        a[3], a[1], 0.0, //
        a[4], a[5], a[2],
    );
    l * l.transpose()
}

#[allow(clippy::cast_precision_loss)]
fn residuals_and_pearson(
    b: f64,
    i: f64,
    x0: &Vector3<f64>,
    metric: &Matrix3<f64>,
    x: &[Vector3<f64>],
    counts: &[f64],
    r: Option<&mut DVector<f64>>,
) -> f64 {
    let n = x.len() as f64;
    let mut u = 0.0;
    let mut v = 0.0;
    let mut uu = 0.0;
    let mut vv = 0.0;
    let mut uv = 0.0;
    let mut out = r;

    for (idx, (point, &observed)) in x.iter().zip(counts).enumerate() {
        let dx = point - x0;
        let predicted = b + i * (-0.5 * dx.dot(&(metric * dx))).exp();
        if let Some(r) = out.as_deref_mut() {
            r[idx] = predicted - observed;
        }
        u += predicted;
        uu += predicted * predicted;
        v += observed;
        vv += observed * observed;
        uv += predicted * observed;
    }

    u /= n;
    v /= n;
    uu -= n * u * u;
    vv -= n * v * v;
    uv -= n * u * v;
    uv / (uu * vv).sqrt()
}

impl PeakIntegrator for GaussianIntegrator {
    fn compute(
        &mut self,
        peak: &Peak,
        _shape_model: Option<&ShapeModel>,
        region: &IntegrationRegion,
    ) -> ComputeResult {
        let kind = self.kind();
        let data = region.data();
        let n = data.events.len();
        if n < 20 {
            return ComputeResult::failure(kind, RejectionFlag::TooFewPoints);
        }

        let points: Vec<Vector3<f64>> = data
            .events
            .iter()
            .map(|event| Vector3::new(event.px, event.py, event.frame))
            .collect();
        let weights =
            DVector::from_iterator(n, data.counts.iter().map(|&c| if c > 0.0 { 1.0 / c } else { 0.0 }));

        let shape = peak.shape();
        let Some(l) = nalgebra::Cholesky::new(shape.metric()) else {
            return ComputeResult::failure(kind, RejectionFlag::InvalidShape);
        };
        let l = l.l();
        let a0 = [
            l[(0, 0)],
            l[(1, 1)],
            l[(2, 2)],
            l[(1, 0)],
            l[(2, 0)],
            l[(2, 1)],
        ];
        let x0 = shape.center();

        let layout = Layout {
            fit_center: self.fit_center,
            fit_cov: self.fit_cov,
            x0,
            a: a0,
        };

        let mut params = FitParameters::new();
        params.add(0.0); // background
        params.add(peak.sum_intensity().value().max(1.0)); // amplitude
        if self.fit_center {
            for i in 0..3 {
                params.add(x0[i]);
            }
        }
        if self.fit_cov {
            for value in a0 {
                params.add(value);
            }
        }

        let counts = data.counts.clone();
        let points_f = points.clone();
        let layout_ref = &layout;
        let mut residual_fn = move |x: &[f64], r: &mut DVector<f64>| -> bool {
            let metric = from_cholesky(&layout_ref.cholesky(x));
            residuals_and_pearson(
                x[0],
                x[1],
                &layout_ref.center(x),
                &metric,
                &points_f,
                &counts,
                Some(r),
            );
            true
        };

        let mut minimizer = Minimizer::new();
        minimizer.initialize(n);
        minimizer.set_weights(weights);
        if minimizer.fit(&mut params, &mut residual_fn, None, 100).is_err() {
            return ComputeResult::failure(kind, RejectionFlag::BadGaussianFit);
        }

        let solution = params.values().to_vec();
        let b = solution[0];
        let i = solution[1];
        let center = layout.center(&solution);
        let metric = from_cholesky(&layout.cholesky(&solution));

        // centre must stay on the detector and within the scan
        #[allow(clippy::cast_precision_loss)]
        let inside = center[0] >= 0.0
            && center[0] < peak.data().ncols() as f64
            && center[1] >= 0.0
            && center[1] < peak.data().nrows() as f64
            && center[2] >= 0.0
            && center[2] < peak.data().nframes() as f64;
        if !inside {
            return ComputeResult::failure(kind, RejectionFlag::CentreOutOfBounds);
        }

        if metric.symmetric_eigenvalues().min() <= 0.0 {
            return ComputeResult::failure(kind, RejectionFlag::InvalidCovariance);
        }

        let pearson = residuals_and_pearson(b, i, &center, &metric, &points, &data.counts, None);
        // a NaN correlation (flat model or flat data) fails as well
        if !(pearson > MIN_PEARSON) {
            return ComputeResult::failure(kind, RejectionFlag::BadIntegrationFit);
        }

        let Some(covariance) = minimizer.covariance() else {
            return ComputeResult::failure(kind, RejectionFlag::BadGaussianFit);
        };
        let intensity = Intensity::new(i, covariance[(1, 1)]);
        let background = Intensity::new(b, covariance[(0, 0)]);

        ComputeResult {
            kind,
            intensity,
            background,
            bkg_gradient: Intensity::default(),
            rocking_curve: Vec::new(),
            shape: Some(Ellipsoid::new(center, metric)),
            flag: RejectionFlag::NotRejected,
        }
    }

    fn kind(&self) -> IntegratorKind {
        IntegratorKind::Gaussian
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::DataSet;
    use crate::instrument::{Detector, InstrumentState};
    use crate::integrate::{integrate, IntegrationParameters, Integrator};
    use crate::region::RegionType;
    use nalgebra::UnitQuaternion;
    use ndarray::Array2;
    use std::sync::Arc;

    fn gaussian_data(amplitude: f64, background: f64) -> Arc<DataSet> {
        let n = 40;
        let nframes = 14;
        let detector = Detector::new(n, n, 1.0, 1.0, 180.0);
        let mut frames = Vec::new();
        for f in 0..nframes {
            let mut image = Array2::from_elem((n, n), background);
            for r in 0..n {
                for c in 0..n {
                    #[allow(clippy::cast_precision_loss)]
                    let (x, y, z) = (c as f64, r as f64, f as f64);
                    let d2 = (x - 20.0).powi(2) / 1.8
                        + (y - 18.0).powi(2) / 2.2
                        + (z - 7.0).powi(2) / 1.2;
                    image[(r, c)] += amplitude * (-0.5 * d2).exp();
                }
            }
            frames.push(image);
        }
        let states = (0..nframes)
            .map(|i| {
                #[allow(clippy::cast_precision_loss)]
                let angle = (i as f64) * 0.2_f64.to_radians();
                InstrumentState::new(
                    UnitQuaternion::from_axis_angle(&nalgebra::Vector3::z_axis(), angle),
                    1.2,
                )
            })
            .collect();
        Arc::new(DataSet::new("gaussian", detector, frames, states).unwrap())
    }

    #[test]
    fn fits_amplitude_and_background() {
        let data = gaussian_data(250.0, 5.0);
        let shape = Ellipsoid::new(
            nalgebra::Vector3::new(20.3, 17.8, 7.2),
            Matrix3::from_diagonal(&nalgebra::Vector3::new(1.0 / 1.8, 1.0 / 2.2, 1.0 / 1.2)),
        );
        let mut peaks = vec![Peak::new(Arc::clone(&data), shape)];

        let params = IntegrationParameters {
            peak_end: 3.0,
            bkg_begin: 3.5,
            bkg_end: 5.0,
            fit_center: true,
            fit_cov: true,
            region_type: RegionType::VariableEllipsoid,
        };
        let mut integrator = Integrator::from(GaussianIntegrator::default());
        let n = integrate(&mut integrator, &mut peaks, None, &data, &params, None).unwrap();
        assert_eq!(n, 1, "flag {:?}", peaks[0].rejection_flag());

        let peak = &peaks[0];
        assert!((peak.sum_intensity().value() - 250.0).abs() < 5.0);
        assert!((peak.sum_background().value() - 5.0).abs() < 0.5);
        // the fitted centre replaced the starting guess
        let c = peak.shape().center();
        assert!((c - nalgebra::Vector3::new(20.0, 18.0, 7.0)).norm() < 0.1);
    }

    #[test]
    fn pure_noisefree_background_fails_pearson() {
        let data = gaussian_data(0.0, 5.0);
        let shape = Ellipsoid::sphere(nalgebra::Vector3::new(20.0, 18.0, 7.0), 1.5);
        let mut peaks = vec![Peak::new(Arc::clone(&data), shape)];
        let params = IntegrationParameters::default();
        let mut integrator = Integrator::from(GaussianIntegrator::default());
        integrate(&mut integrator, &mut peaks, None, &data, &params, None).unwrap();
        assert!(!peaks[0].enabled());
    }
}
