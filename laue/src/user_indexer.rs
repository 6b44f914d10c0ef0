//! Indexing against user-supplied provisional cell parameters.

use crate::miller::MillerIndex;
use crate::unit_cell::UnitCell;
use itertools::Itertools;
use nalgebra::{Matrix3, RowVector3};
use tracing::info;

/// Parameters of the user-defined indexer.
#[derive(Clone, Debug)]
#[allow(missing_docs)]
pub struct UserIndexerParameters {
    /// Provisional cell edges, angstrom.
    pub a: f64,
    pub b: f64,
    pub c: f64,
    /// Provisional cell angles, radians.
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
    pub wavelength: f64,
    /// Relative tolerance on q-vector lengths when matching.
    pub distance_tolerance: f64,
    /// Absolute tolerance on pairwise angles, radians.
    pub angular_tolerance: f64,
    /// Minimum fraction of all q vectors a solution must index.
    pub indexing_threshold: f64,
    pub indexing_tolerance: f64,
    pub d_min: f64,
    pub d_max: f64,
    /// Cap on the number of observed q vectors combined into triplets.
    pub max_q_vectors: usize,
}

impl Default for UserIndexerParameters {
    fn default() -> Self {
        Self {
            a: 10.0,
            b: 10.0,
            c: 10.0,
            alpha: std::f64::consts::FRAC_PI_2,
            beta: std::f64::consts::FRAC_PI_2,
            gamma: std::f64::consts::FRAC_PI_2,
            wavelength: 1.5,
            distance_tolerance: 0.02,
            angular_tolerance: 0.017,
            indexing_threshold: 0.8,
            indexing_tolerance: 0.2,
            d_min: 1.5,
            d_max: 50.0,
            max_q_vectors: 20,
        }
    }
}

/// A solution of the user-defined indexer.
#[derive(Clone, Debug)]
pub struct UserIndexedSolution {
    /// The oriented cell.
    pub cell: UnitCell,
    /// Fraction of the observed q vectors the cell indexes.
    pub fraction_indexed: f64,
}

/// Match observed q-vector triplets against the reflections predicted by
/// provisional cell parameters.
///
/// Predicted q vectors in the allowed d-shell are matched to observed ones
/// by length within `distance_tolerance`; triplets whose three pairwise
/// angles agree within `angular_tolerance` yield an orientation through
/// `BU = H^-1 Q`, kept when right-handed and when the resulting cell
/// indexes at least `indexing_threshold` of all observed q vectors.
#[must_use]
pub fn index_with_cell(
    q_vectors: &[RowVector3<f64>],
    params: &UserIndexerParameters,
) -> Vec<UserIndexedSolution> {
    let Ok(provisional) = UnitCell::from_parameters(
        params.a,
        params.b,
        params.c,
        params.alpha,
        params.beta,
        params.gamma,
    ) else {
        return Vec::new();
    };

    let reflections = provisional.reflections_in_shell(params.d_min, params.d_max, params.wavelength);
    if reflections.is_empty() || q_vectors.len() < 3 {
        return Vec::new();
    }
    let predicted: Vec<(MillerIndex, f64)> = reflections
        .iter()
        .map(|hkl| (*hkl, provisional.q_vector(hkl).norm()))
        .collect();
    info!(
        predicted = predicted.len(),
        observed = q_vectors.len(),
        "matching q triplets against provisional cell"
    );

    // strongest-first cap on the combinatorics
    let mut observed: Vec<RowVector3<f64>> = q_vectors.to_vec();
    observed.truncate(params.max_q_vectors);

    // per-observation candidate reflections, matched by |q|
    let candidates: Vec<Vec<usize>> = observed
        .iter()
        .map(|q| {
            let norm = q.norm();
            predicted
                .iter()
                .enumerate()
                .filter_map(|(idx, (_, len))| {
                    ((len - norm).abs() / norm < params.distance_tolerance).then_some(idx)
                })
                .collect()
        })
        .collect();

    let angle = |u: &RowVector3<f64>, v: &RowVector3<f64>| -> f64 {
        (u.dot(v) / (u.norm() * v.norm())).clamp(-1.0, 1.0).acos()
    };

    let mut solutions: Vec<UserIndexedSolution> = Vec::new();

    for combo in (0..observed.len()).combinations(3) {
        let (i, j, k) = (combo[0], combo[1], combo[2]);
        let q_matrix = Matrix3::from_rows(&[observed[i], observed[j], observed[k]]);
        if q_matrix.determinant().abs() < 1e-9 {
            continue;
        }
        let angles_obs = [
            angle(&observed[i], &observed[j]),
            angle(&observed[i], &observed[k]),
            angle(&observed[j], &observed[k]),
        ];

        for &ci in &candidates[i] {
            for &cj in &candidates[j] {
                if cj == ci {
                    continue;
                }
                for &ck in &candidates[k] {
                    if ck == ci || ck == cj {
                        continue;
                    }
                    let hi = provisional.q_vector(&predicted[ci].0);
                    let hj = provisional.q_vector(&predicted[cj].0);
                    let hk = provisional.q_vector(&predicted[ck].0);
                    let angles_pred =
                        [angle(&hi, &hj), angle(&hi, &hk), angle(&hj, &hk)];
                    if angles_obs
                        .iter()
                        .zip(&angles_pred)
                        .any(|(o, p)| (o - p).abs() > params.angular_tolerance)
                    {
                        continue;
                    }

                    // orientation from BU = H^-1 Q
                    let h_matrix = Matrix3::from_rows(&[
                        predicted[ci].0.row_vector_f64(),
                        predicted[cj].0.row_vector_f64(),
                        predicted[ck].0.row_vector_f64(),
                    ]);
                    let Some(h_inv) = h_matrix.try_inverse() else {
                        continue;
                    };
                    let bu = h_inv * q_matrix;
                    if bu.determinant() <= 0.0 {
                        continue;
                    }
                    let Ok(mut cell) = UnitCell::from_reciprocal_basis(bu) else {
                        continue;
                    };
                    cell.set_indexing_tolerance(params.indexing_tolerance);

                    let indexed = q_vectors
                        .iter()
                        .filter(|q| cell.miller_index(q).indexed(params.indexing_tolerance))
                        .count();
                    let fraction = indexed as f64 / q_vectors.len() as f64;
                    if fraction < params.indexing_threshold {
                        continue;
                    }

                    let duplicate = solutions
                        .iter()
                        .any(|known| known.cell.equivalent(&cell, 0.1));
                    if !duplicate {
                        solutions.push(UserIndexedSolution {
                            cell,
                            fraction_indexed: fraction,
                        });
                    }
                }
            }
        }
    }

    solutions.sort_by(|a, b| {
        b.fraction_indexed
            .partial_cmp(&a.fraction_indexed)
            .expect("finite fraction")
    });
    info!(solutions = solutions.len(), "user-defined indexing finished");
    solutions
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Rotation3;
    use nalgebra::Vector3;

    #[test]
    fn recovers_a_rotated_orthorhombic_cell() {
        let true_cell = UnitCell::from_parameters(
            7.0,
            9.0,
            12.0,
            std::f64::consts::FRAC_PI_2,
            std::f64::consts::FRAC_PI_2,
            std::f64::consts::FRAC_PI_2,
        )
        .unwrap();
        let rotation = Rotation3::new(Vector3::new(0.3, -0.2, 0.45));

        // observed q vectors: rotated lattice reflections
        let mut qs: Vec<RowVector3<f64>> = Vec::new();
        for h in -2..=2_i32 {
            for k in -2..=2_i32 {
                for l in -2..=2_i32 {
                    if h == 0 && k == 0 && l == 0 {
                        continue;
                    }
                    let q = MillerIndex::new(h, k, l).row_vector_f64()
                        * true_cell.reciprocal_basis()
                        * rotation.matrix().transpose();
                    qs.push(q);
                }
            }
        }

        let params = UserIndexerParameters {
            a: 7.0,
            b: 9.0,
            c: 12.0,
            d_min: 2.0,
            d_max: 20.0,
            indexing_threshold: 0.9,
            max_q_vectors: 8,
            ..UserIndexerParameters::default()
        };
        let solutions = index_with_cell(&qs, &params);
        assert!(!solutions.is_empty());
        let best = &solutions[0];
        assert!(best.fraction_indexed > 0.9);

        // the recovered cell has the right parameters (orientation aside)
        let ch = best.cell.character();
        let mut edges = [ch.a, ch.b, ch.c];
        edges.sort_by(|x, y| x.partial_cmp(y).expect("finite"));
        assert!((edges[0] - 7.0).abs() < 0.1);
        assert!((edges[1] - 9.0).abs() < 0.1);
        assert!((edges[2] - 12.0).abs() < 0.1);
    }

    #[test]
    fn no_match_for_wrong_cell() {
        let true_cell = UnitCell::from_parameters(
            7.0,
            9.0,
            12.0,
            std::f64::consts::FRAC_PI_2,
            std::f64::consts::FRAC_PI_2,
            std::f64::consts::FRAC_PI_2,
        )
        .unwrap();
        let qs: Vec<RowVector3<f64>> = (1..=6)
            .map(|h| MillerIndex::new(h, 0, 0).row_vector_f64() * true_cell.reciprocal_basis())
            .collect();

        let params = UserIndexerParameters {
            a: 23.0,
            b: 31.0,
            c: 37.0,
            d_min: 10.0,
            d_max: 40.0,
            ..UserIndexerParameters::default()
        };
        let solutions = index_with_cell(&qs, &params);
        assert!(solutions.is_empty());
    }
}
