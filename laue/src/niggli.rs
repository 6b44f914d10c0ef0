//! Niggli cell reduction (Krivy-Gruber algorithm).

use crate::error::{Error, Result};
use nalgebra::Matrix3;

const MAX_STEPS: usize = 1000;

/// Result of a Niggli reduction: the reduced metric and the change of
/// basis `P` such that `basis * P` has metric [`Self::metric`].
#[derive(Clone, Debug)]
pub struct NiggliReduction {
    /// Metric tensor of the reduced cell.
    pub metric: Matrix3<f64>,
    /// Transformation from the input basis to the reduced basis.
    pub transformation: Matrix3<f64>,
}

fn sign(x: f64) -> f64 {
    if x < 0.0 {
        -1.0
    } else {
        1.0
    }
}

/// Reduce the metric tensor `g` to its Niggli form.
///
/// Works on the parameters `(A, B, C, xi, eta, zeta) =
/// (g00, g11, g22, 2 g12, 2 g02, 2 g01)` and iterates the eight
/// Krivy-Gruber conditions until none applies.
///
/// # Errors
///
/// [`Error::Numerical`] when the metric is degenerate or the iteration
/// fails to settle.
pub fn reduce(g: &Matrix3<f64>, tolerance: f64) -> Result<NiggliReduction> {
    let mut g = 0.5 * (g + g.transpose());
    if g.determinant() <= 0.0 {
        return Err(Error::Numerical("degenerate metric in Niggli reduction".into()));
    }

    let mut p = Matrix3::identity();
    let eps = tolerance * (g[(0, 0)] + g[(1, 1)] + g[(2, 2)]) / 3.0;

    let mut apply = |g: &mut Matrix3<f64>, p: &mut Matrix3<f64>, m: Matrix3<f64>| {
        *g = m.transpose() * *g * m;
        *p *= m;
    };

    for _ in 0..MAX_STEPS {
        let a = g[(0, 0)];
        let b = g[(1, 1)];
        let c = g[(2, 2)];
        let xi = 2.0 * g[(1, 2)];
        let eta = 2.0 * g[(0, 2)];
        let zeta = 2.0 * g[(0, 1)];

        // step 1: order a <= b
        if a > b + eps || ((a - b).abs() < eps && xi.abs() > eta.abs() + eps) {
            let m = Matrix3::new(0.0, -1.0, 0.0, -1.0, 0.0, 0.0, 0.0, 0.0, -1.0);
            apply(&mut g, &mut p, m);
            continue;
        }
        // step 2: order b <= c
        if b > c + eps || ((b - c).abs() < eps && eta.abs() > zeta.abs() + eps) {
            let m = Matrix3::new(-1.0, 0.0, 0.0, 0.0, 0.0, -1.0, 0.0, -1.0, 0.0);
            apply(&mut g, &mut p, m);
            continue;
        }

        if xi * eta * zeta > 0.0 {
            // step 3: all angle parameters positive
            let (i, j, k) = (sign(eta) * sign(zeta), sign(eta), sign(zeta));
            let needs_flip = xi < -eps || eta < -eps || zeta < -eps;
            if needs_flip {
                let m = Matrix3::new(i, 0.0, 0.0, 0.0, j, 0.0, 0.0, 0.0, k);
                apply(&mut g, &mut p, m);
                continue;
            }
        } else {
            // step 4: all angle parameters non-positive
            let mut i = 1.0;
            let mut j = if zeta.abs() > eps { -sign(zeta) } else { 1.0 };
            let mut k = if eta.abs() > eps {
                -sign(eta)
            } else if xi.abs() > eps {
                -sign(xi) * j
            } else {
                1.0
            };
            if xi.abs() > eps && (j * k - -sign(xi)).abs() > 0.5 {
                if eta.abs() <= eps {
                    k = -k;
                } else if zeta.abs() <= eps {
                    j = -j;
                } else {
                    i = -i;
                }
            }
            let needs_flip = xi > eps || eta > eps || zeta > eps;
            if needs_flip {
                let m = Matrix3::new(i, 0.0, 0.0, 0.0, j, 0.0, 0.0, 0.0, k);
                apply(&mut g, &mut p, m);
                continue;
            }
        }

        // step 5
        if xi.abs() > b + eps
            || ((xi - b).abs() < eps && 2.0 * eta < zeta - eps)
            || ((xi + b).abs() < eps && zeta < -eps)
        {
            let m = Matrix3::new(1.0, 0.0, 0.0, 0.0, 1.0, -sign(xi), 0.0, 0.0, 1.0);
            apply(&mut g, &mut p, m);
            continue;
        }
        // step 6
        if eta.abs() > a + eps
            || ((eta - a).abs() < eps && 2.0 * xi < zeta - eps)
            || ((eta + a).abs() < eps && zeta < -eps)
        {
            let m = Matrix3::new(1.0, 0.0, -sign(eta), 0.0, 1.0, 0.0, 0.0, 0.0, 1.0);
            apply(&mut g, &mut p, m);
            continue;
        }
        // step 7
        if zeta.abs() > a + eps
            || ((zeta - a).abs() < eps && 2.0 * xi < eta - eps)
            || ((zeta + a).abs() < eps && eta < -eps)
        {
            let m = Matrix3::new(1.0, -sign(zeta), 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0);
            apply(&mut g, &mut p, m);
            continue;
        }
        // step 8
        let sum = xi + eta + zeta + a + b;
        if sum < -eps || (sum.abs() < eps && 2.0 * (a + eta) + zeta > eps) {
            let m = Matrix3::new(1.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0);
            apply(&mut g, &mut p, m);
            continue;
        }

        return Ok(NiggliReduction {
            metric: g,
            transformation: p,
        });
    }

    Err(Error::Numerical("Niggli reduction did not settle".into()))
}
