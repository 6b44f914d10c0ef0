//! Classification of Niggli-reduced metrics into the 44 lattice characters.

use nalgebra::{DMatrix, Matrix3};

/// One of the 44 lattice characters of a Niggli-reduced cell.
///
/// Carries the character number, the Bravais symbol, the linear constraints
/// on the Niggli metric parameters `(A, B, C, D, E, F) =
/// (g00, g11, g22, g12, g02, g01)`, and the transformation from the Niggli
/// basis towards the conventional setting.
#[derive(Clone, Debug)]
pub struct NiggliCharacter {
    /// Character number 1..44 per the standard tables.
    pub number: i32,
    /// Type I (all angle parameters positive) or type II.
    pub type_one: bool,
    /// Bravais symbol such as `mP` or `cF`.
    pub bravais: &'static str,
    /// Rows of linear constraints `C p = 0` on the Niggli metric
    /// parameters.
    pub constraints: DMatrix<f64>,
    /// Transformation towards the conventional cell. Unimodular for
    /// primitive lattices; determinant 2, 3, or 4 for centred ones, in
    /// which case the basis is left in its Niggli setting.
    pub transformation: Matrix3<f64>,
}

impl Default for NiggliCharacter {
    fn default() -> Self {
        Self {
            number: 31,
            type_one: true,
            bravais: "aP",
            constraints: DMatrix::zeros(0, 6),
            transformation: Matrix3::identity(),
        }
    }
}

impl NiggliCharacter {
    /// Bravais letter (first character of the symbol).
    #[must_use]
    pub fn bravais_letter(&self) -> char {
        self.bravais.chars().next().expect("two-letter symbol")
    }

    /// Whether the conventional transformation keeps the lattice primitive
    /// (unimodular change of basis).
    #[must_use]
    pub fn is_unimodular(&self) -> bool {
        (self.transformation.determinant().abs() - 1.0).abs() < 1e-9
    }
}

// Constraint rows on (A, B, C, D, E, F).
const AB: [f64; 6] = [1.0, -1.0, 0.0, 0.0, 0.0, 0.0];
const BC: [f64; 6] = [0.0, 1.0, -1.0, 0.0, 0.0, 0.0];
const D0: [f64; 6] = [0.0, 0.0, 0.0, 1.0, 0.0, 0.0];
const E0: [f64; 6] = [0.0, 0.0, 0.0, 0.0, 1.0, 0.0];
const F0: [f64; 6] = [0.0, 0.0, 0.0, 0.0, 0.0, 1.0];
const D_HALF_A: [f64; 6] = [-0.5, 0.0, 0.0, 1.0, 0.0, 0.0];
const E_HALF_A: [f64; 6] = [-0.5, 0.0, 0.0, 0.0, 1.0, 0.0];
const F_HALF_A: [f64; 6] = [-0.5, 0.0, 0.0, 0.0, 0.0, 1.0];
const D_QUARTER_A: [f64; 6] = [-0.25, 0.0, 0.0, 1.0, 0.0, 0.0];
const D_THIRD_A_NEG: [f64; 6] = [1.0 / 3.0, 0.0, 0.0, 1.0, 0.0, 0.0];
const E_THIRD_A_NEG: [f64; 6] = [1.0 / 3.0, 0.0, 0.0, 0.0, 1.0, 0.0];
const F_THIRD_A_NEG: [f64; 6] = [1.0 / 3.0, 0.0, 0.0, 0.0, 0.0, 1.0];
const D_HALF_A_NEG: [f64; 6] = [0.5, 0.0, 0.0, 1.0, 0.0, 0.0];
const E_HALF_A_NEG: [f64; 6] = [0.5, 0.0, 0.0, 0.0, 1.0, 0.0];
const F_HALF_A_NEG: [f64; 6] = [0.5, 0.0, 0.0, 0.0, 0.0, 1.0];
const D_HALF_B: [f64; 6] = [0.0, -0.5, 0.0, 1.0, 0.0, 0.0];
const D_HALF_B_NEG: [f64; 6] = [0.0, 0.5, 0.0, 1.0, 0.0, 0.0];
const DE: [f64; 6] = [0.0, 0.0, 0.0, 1.0, -1.0, 0.0];
const EF: [f64; 6] = [0.0, 0.0, 0.0, 0.0, 1.0, -1.0];
const F_2D: [f64; 6] = [0.0, 0.0, 0.0, -2.0, 0.0, 1.0];
const E_2D: [f64; 6] = [0.0, 0.0, 0.0, -2.0, 1.0, 0.0];
const F_2E: [f64; 6] = [0.0, 0.0, 0.0, 0.0, -2.0, 1.0];
// 2(D + E + F) = -(A + B), the type-II boundary condition
const SUM_AB: [f64; 6] = [1.0, 1.0, 0.0, 2.0, 2.0, 2.0];
// 2D + F = -B, the extra condition of character 43
const B_2DF: [f64; 6] = [0.0, 1.0, 0.0, 2.0, 0.0, 1.0];

struct Case {
    number: i32,
    type_one: bool,
    bravais: &'static str,
    conditions: &'static [[f64; 6]],
    transformation: [i32; 9],
}

// The decision tables, most specific case first within each metric class.
// The transformation rows follow the International Tables conventions; a
// determinant of 2, 3, or 4 marks a centred conventional cell.

const CASES_ABC: &[Case] = &[
    Case { number: 1, type_one: true, bravais: "cF", conditions: &[D_HALF_A, E_HALF_A, F_HALF_A], transformation: [1, -1, 1, 1, 1, -1, -1, 1, 1] },
    Case { number: 2, type_one: true, bravais: "hR", conditions: &[DE, EF], transformation: [1, -1, 0, -1, 0, 1, -1, -1, -1] },
    Case { number: 3, type_one: false, bravais: "cP", conditions: &[D0, E0, F0], transformation: [1, 0, 0, 0, 1, 0, 0, 0, 1] },
    Case { number: 5, type_one: false, bravais: "cI", conditions: &[D_THIRD_A_NEG, E_THIRD_A_NEG, F_THIRD_A_NEG], transformation: [1, 0, 1, 1, 1, 0, 0, 1, 1] },
    Case { number: 4, type_one: false, bravais: "hR", conditions: &[DE, EF], transformation: [1, -1, 0, -1, 0, 1, -1, -1, -1] },
    Case { number: 6, type_one: false, bravais: "tI", conditions: &[SUM_AB, DE], transformation: [0, 1, 1, 1, 0, 1, 1, 1, 0] },
    Case { number: 7, type_one: false, bravais: "tI", conditions: &[SUM_AB, EF], transformation: [1, 0, 1, 1, 1, 0, 0, 1, 1] },
    Case { number: 8, type_one: false, bravais: "oI", conditions: &[SUM_AB], transformation: [-1, -1, 0, -1, 0, -1, 0, -1, -1] },
];

const CASES_AB: &[Case] = &[
    Case { number: 9, type_one: true, bravais: "hR", conditions: &[D_HALF_A, E_HALF_A, F_HALF_A], transformation: [1, 0, 0, -1, 1, 0, -1, -1, 3] },
    Case { number: 10, type_one: true, bravais: "mC", conditions: &[DE], transformation: [1, 1, 0, 1, -1, 0, 0, 0, -1] },
    Case { number: 11, type_one: false, bravais: "tP", conditions: &[D0, E0, F0], transformation: [1, 0, 0, 0, 1, 0, 0, 0, 1] },
    Case { number: 12, type_one: false, bravais: "hP", conditions: &[D0, E0, F_HALF_A_NEG], transformation: [1, 0, 0, 0, 1, 0, 0, 0, 1] },
    Case { number: 15, type_one: false, bravais: "tI", conditions: &[D_HALF_A_NEG, E_HALF_A_NEG, F0], transformation: [1, 0, 0, 0, 1, 0, 1, 1, 2] },
    Case { number: 13, type_one: false, bravais: "oC", conditions: &[D0, E0], transformation: [1, 1, 0, -1, 1, 0, 0, 0, 1] },
    Case { number: 16, type_one: false, bravais: "oF", conditions: &[SUM_AB, DE], transformation: [-1, -1, 0, 1, -1, 0, 1, 1, 2] },
    Case { number: 14, type_one: false, bravais: "mC", conditions: &[DE], transformation: [1, 1, 0, -1, 1, 0, 0, 0, 1] },
    Case { number: 17, type_one: false, bravais: "mC", conditions: &[SUM_AB], transformation: [1, -1, 0, 1, 1, 0, -1, 0, -1] },
];

const CASES_BC: &[Case] = &[
    Case { number: 18, type_one: true, bravais: "tI", conditions: &[D_QUARTER_A, E_HALF_A, F_HALF_A], transformation: [0, -1, 1, 1, -1, -1, 1, 0, 0] },
    Case { number: 19, type_one: true, bravais: "oI", conditions: &[E_HALF_A, F_HALF_A], transformation: [-1, 0, 0, 0, -1, 1, -1, 1, 1] },
    Case { number: 20, type_one: true, bravais: "mC", conditions: &[EF], transformation: [0, 1, 1, 0, 1, -1, -1, 0, 0] },
    Case { number: 21, type_one: false, bravais: "tP", conditions: &[D0, E0, F0], transformation: [0, 1, 0, 0, 0, 1, 1, 0, 0] },
    Case { number: 22, type_one: false, bravais: "hP", conditions: &[D_HALF_B_NEG, E0, F0], transformation: [0, 1, 0, 0, 0, 1, 1, 0, 0] },
    Case { number: 24, type_one: false, bravais: "hR", conditions: &[SUM_AB, E_THIRD_A_NEG, F_THIRD_A_NEG], transformation: [1, 2, 1, 0, -1, 1, 1, 0, 0] },
    Case { number: 23, type_one: false, bravais: "oC", conditions: &[E0, F0], transformation: [0, 1, 1, 0, -1, 1, 1, 0, 0] },
    Case { number: 25, type_one: false, bravais: "mC", conditions: &[EF], transformation: [0, 1, 1, 0, -1, 1, 1, 0, 0] },
];

const CASES_NONE: &[Case] = &[
    Case { number: 26, type_one: true, bravais: "oF", conditions: &[D_QUARTER_A, E_HALF_A, F_HALF_A], transformation: [1, 0, 0, -1, 2, 0, -1, 0, 2] },
    Case { number: 27, type_one: true, bravais: "mC", conditions: &[E_HALF_A, F_HALF_A], transformation: [-1, 2, 0, -1, 0, 0, 0, -1, 1] },
    Case { number: 28, type_one: true, bravais: "mC", conditions: &[E_HALF_A, F_2D], transformation: [-1, 0, 0, -1, 0, 2, 0, 1, 0] },
    Case { number: 29, type_one: true, bravais: "mC", conditions: &[E_2D, F_HALF_A], transformation: [1, 0, 0, 1, -2, 0, 0, 0, -1] },
    Case { number: 30, type_one: true, bravais: "mC", conditions: &[D_HALF_B, F_2E], transformation: [0, 1, 0, 0, 1, -2, -1, 0, 0] },
    Case { number: 31, type_one: true, bravais: "aP", conditions: &[], transformation: [1, 0, 0, 0, 1, 0, 0, 0, 1] },
    Case { number: 32, type_one: false, bravais: "oP", conditions: &[D0, E0, F0], transformation: [1, 0, 0, 0, 1, 0, 0, 0, 1] },
    Case { number: 40, type_one: false, bravais: "oC", conditions: &[D_HALF_B_NEG, E0, F0], transformation: [0, -1, 0, 0, 1, 2, -1, 0, 0] },
    Case { number: 36, type_one: false, bravais: "oC", conditions: &[D0, E_HALF_A_NEG, F0], transformation: [1, 0, 0, -1, 0, -2, 0, 1, 0] },
    Case { number: 38, type_one: false, bravais: "oC", conditions: &[D0, E0, F_HALF_A_NEG], transformation: [-1, 0, 0, 1, 2, 0, 0, 0, -1] },
    Case { number: 42, type_one: false, bravais: "oI", conditions: &[D_HALF_B_NEG, E_HALF_A_NEG, F0], transformation: [-1, 0, 0, 0, -1, 0, 1, 1, 2] },
    Case { number: 33, type_one: false, bravais: "mP", conditions: &[D0, F0], transformation: [1, 0, 0, 0, 1, 0, 0, 0, 1] },
    Case { number: 35, type_one: false, bravais: "mP", conditions: &[E0, F0], transformation: [0, -1, 0, -1, 0, 0, 0, 0, -1] },
    Case { number: 34, type_one: false, bravais: "mP", conditions: &[D0, E0], transformation: [-1, 0, 0, 0, 0, -1, 0, -1, 0] },
    Case { number: 37, type_one: false, bravais: "mC", conditions: &[E_HALF_A_NEG, F0], transformation: [1, 0, 2, 1, 0, 0, 0, 1, 0] },
    Case { number: 39, type_one: false, bravais: "mC", conditions: &[E0, F_HALF_A_NEG], transformation: [-1, -2, 0, -1, 0, 0, 0, 0, -1] },
    Case { number: 41, type_one: false, bravais: "mC", conditions: &[D_HALF_B_NEG, F0], transformation: [0, -1, -2, 0, -1, 0, -1, 0, 0] },
    Case { number: 43, type_one: false, bravais: "mI", conditions: &[SUM_AB, B_2DF], transformation: [-1, 0, 0, -1, -1, -2, 0, -1, 0] },
    Case { number: 44, type_one: false, bravais: "aP", conditions: &[], transformation: [1, 0, 0, 0, 1, 0, 0, 0, 1] },
];

fn satisfied(p: &[f64; 6], conditions: &[[f64; 6]], eps: f64) -> bool {
    conditions.iter().all(|row| {
        let value: f64 = row.iter().zip(p.iter()).map(|(c, x)| c * x).sum();
        value.abs() < eps
    })
}

fn build(case: &Case, class_rows: &[[f64; 6]]) -> NiggliCharacter {
    let rows = class_rows.len() + case.conditions.len();
    let mut constraints = DMatrix::zeros(rows, 6);
    for (i, row) in class_rows.iter().chain(case.conditions.iter()).enumerate() {
        for (j, value) in row.iter().enumerate() {
            constraints[(i, j)] = *value;
        }
    }
    let t = &case.transformation;
    NiggliCharacter {
        number: case.number,
        type_one: case.type_one,
        bravais: case.bravais,
        constraints,
        transformation: Matrix3::new(
            f64::from(t[0]),
            f64::from(t[1]),
            f64::from(t[2]),
            f64::from(t[3]),
            f64::from(t[4]),
            f64::from(t[5]),
            f64::from(t[6]),
            f64::from(t[7]),
            f64::from(t[8]),
        ),
    }
}

/// Classify a Niggli-reduced metric tensor.
///
/// The metric must already be reduced (see [`crate::niggli::reduce`]); the
/// decision walks the character table of the matching metric class and
/// returns the first case whose conditions hold within `tolerance`
/// (relative to the mean squared cell edge). The fall-through is the
/// triclinic character 31 or 44.
#[must_use]
pub fn classify(g: &Matrix3<f64>, tolerance: f64) -> NiggliCharacter {
    let p = [
        g[(0, 0)],
        g[(1, 1)],
        g[(2, 2)],
        g[(1, 2)],
        g[(0, 2)],
        g[(0, 1)],
    ];
    let eps = tolerance * (p[0] + p[1] + p[2]) / 3.0;

    let type_one = p[3] > 0.0 && p[4] > 0.0 && p[5] > 0.0;
    let a_eq_b = (p[0] - p[1]).abs() < eps;
    let b_eq_c = (p[1] - p[2]).abs() < eps;

    static ROWS_ABC: &[[f64; 6]] = &[AB, BC];
    static ROWS_AB: &[[f64; 6]] = &[AB];
    static ROWS_BC: &[[f64; 6]] = &[BC];
    static ROWS_NONE: &[[f64; 6]] = &[];

    let classes: &[(&[Case], &[[f64; 6]])] = if a_eq_b && b_eq_c {
        &[
            (CASES_ABC, ROWS_ABC),
            (CASES_AB, ROWS_AB),
            (CASES_BC, ROWS_BC),
            (CASES_NONE, ROWS_NONE),
        ]
    } else if a_eq_b {
        &[(CASES_AB, ROWS_AB), (CASES_NONE, ROWS_NONE)]
    } else if b_eq_c {
        &[(CASES_BC, ROWS_BC), (CASES_NONE, ROWS_NONE)]
    } else {
        &[(CASES_NONE, ROWS_NONE)]
    };

    for (class, class_rows) in classes {
        for case in *class {
            if case.type_one == type_one && satisfied(&p, case.conditions, eps) {
                return build(case, class_rows);
            }
        }
    }

    // unreachable in practice: characters 31/44 have no conditions
    NiggliCharacter::default()
}
