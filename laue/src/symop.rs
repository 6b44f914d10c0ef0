//! Affine symmetry operations in Jones faithful notation.

use crate::error::{Error, Result};
use nalgebra::{Matrix3, RowVector3, Vector3};

const TRANSLATION_EPS: f64 = 1e-6;

/// An affine symmetry operation `x -> R x + t` with an integer rotation part
/// and a fractional translation part (kept in `[0, 1)`).
#[derive(Clone, Copy, Debug)]
pub struct SymOp {
    rotation: Matrix3<i32>,
    translation: Vector3<f64>,
}

fn wrap_unit(x: f64) -> f64 {
    let r = x.rem_euclid(1.0);
    // values within eps of 1 wrap to 0 so that comparison is stable
    if (1.0 - r).abs() < TRANSLATION_EPS {
        0.0
    } else {
        r
    }
}

impl SymOp {
    /// The identity operation.
    #[must_use]
    pub fn identity() -> Self {
        Self {
            rotation: Matrix3::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Build from rotation and translation parts.
    #[must_use]
    pub fn new(rotation: Matrix3<i32>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation: translation.map(wrap_unit),
        }
    }

    /// Parse a Jones faithful symbol such as `-x,y+1/2,-z+1/2`.
    ///
    /// # Errors
    ///
    /// [`Error::Domain`] on malformed input.
    pub fn parse(symbol: &str) -> Result<Self> {
        let components: Vec<&str> = symbol.split(',').collect();
        if components.len() != 3 {
            return Err(Error::Domain(format!("malformed symmetry operation '{symbol}'")));
        }

        let mut rotation = Matrix3::zeros();
        let mut translation = Vector3::zeros();

        for (row, component) in components.iter().enumerate() {
            let text: String = component.chars().filter(|c| !c.is_whitespace()).collect();
            let mut chars = text.chars().peekable();
            let mut sign = 1i32;
            let mut seen_any = false;

            while let Some(&c) = chars.peek() {
                match c {
                    '+' => {
                        sign = 1;
                        chars.next();
                    }
                    '-' => {
                        sign = -1;
                        chars.next();
                    }
                    'x' | 'y' | 'z' => {
                        let axis = match c {
                            'x' => 0,
                            'y' => 1,
                            _ => 2,
                        };
                        rotation[(row, axis)] += sign;
                        sign = 1;
                        seen_any = true;
                        chars.next();
                    }
                    c if c.is_ascii_digit() => {
                        let mut num = String::new();
                        while let Some(&d) = chars.peek() {
                            if d.is_ascii_digit() {
                                num.push(d);
                                chars.next();
                            } else {
                                break;
                            }
                        }
                        let numerator: f64 = num
                            .parse()
                            .map_err(|_| Error::Domain(format!("bad numeral in '{symbol}'")))?;
                        let value = if chars.peek() == Some(&'/') {
                            chars.next();
                            let mut den = String::new();
                            while let Some(&d) = chars.peek() {
                                if d.is_ascii_digit() {
                                    den.push(d);
                                    chars.next();
                                } else {
                                    break;
                                }
                            }
                            let denominator: f64 = den
                                .parse()
                                .map_err(|_| Error::Domain(format!("bad fraction in '{symbol}'")))?;
                            numerator / denominator
                        } else {
                            numerator
                        };
                        translation[row] += f64::from(sign) * value;
                        sign = 1;
                        seen_any = true;
                    }
                    _ => {
                        return Err(Error::Domain(format!(
                            "unexpected character '{c}' in '{symbol}'"
                        )));
                    }
                }
            }
            if !seen_any {
                return Err(Error::Domain(format!("empty component in '{symbol}'")));
            }
        }

        Ok(Self::new(rotation, translation))
    }

    /// Integer rotation part.
    #[must_use]
    pub const fn rotation(&self) -> Matrix3<i32> {
        self.rotation
    }

    /// Rotation part as floats.
    #[must_use]
    pub fn rotation_f64(&self) -> Matrix3<f64> {
        self.rotation.map(f64::from)
    }

    /// Fractional translation part.
    #[must_use]
    pub const fn translation(&self) -> Vector3<f64> {
        self.translation
    }

    /// Compose two operations: `(self * other)(x) = self(other(x))`.
    #[must_use]
    pub fn compose(&self, other: &Self) -> Self {
        let rotation = self.rotation * other.rotation;
        let translation = self.rotation_f64() * other.translation + self.translation;
        Self::new(rotation, translation)
    }

    /// Order of the rotation axis, signed: `1..6` for proper rotations,
    /// `-1` for the inversion, `-2` for a mirror, `-3`, `-4`, `-6` for
    /// rotoinversions.
    #[must_use]
    pub fn axis_order(&self) -> i32 {
        let m = &self.rotation;
        let det = m[(0, 0)] * (m[(1, 1)] * m[(2, 2)] - m[(1, 2)] * m[(2, 1)])
            - m[(0, 1)] * (m[(1, 0)] * m[(2, 2)] - m[(1, 2)] * m[(2, 0)])
            + m[(0, 2)] * (m[(1, 0)] * m[(2, 1)] - m[(1, 1)] * m[(2, 0)]);
        let trace = self.rotation.trace();
        match (det, trace) {
            (1, 3) => 1,
            (1, -1) => 2,
            (1, 0) => 3,
            (1, 1) => 4,
            (1, 2) => 6,
            (-1, -3) => -1,
            (-1, 1) => -2,
            (-1, 0) => -3,
            (-1, -1) => -4,
            (-1, -2) => -6,
            _ => unreachable!("not a crystallographic rotation: {:?}", self.rotation),
        }
    }

    /// Whether this is a pure (nonzero) lattice translation.
    #[must_use]
    pub fn is_pure_translation(&self) -> bool {
        self.rotation == Matrix3::identity() && self.translation.norm() > TRANSLATION_EPS
    }

    /// Whether the translation part is nonzero.
    #[must_use]
    pub fn has_translation(&self) -> bool {
        self.translation.norm() > TRANSLATION_EPS
    }

    /// Apply the rotation part to a Miller index row vector: `h R`.
    #[must_use]
    pub fn apply_hkl(&self, hkl: &RowVector3<i32>) -> RowVector3<i32> {
        hkl * self.rotation
    }
}

impl PartialEq for SymOp {
    fn eq(&self, other: &Self) -> bool {
        self.rotation == other.rotation
            && (0..3).all(|i| {
                let d = (self.translation[i] - other.translation[i]).abs();
                d < TRANSLATION_EPS || (1.0 - d).abs() < TRANSLATION_EPS
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_identity_and_inversion() {
        let id = SymOp::parse("x,y,z").unwrap();
        assert_eq!(id, SymOp::identity());
        assert_eq!(id.axis_order(), 1);

        let inv = SymOp::parse("-x,-y,-z").unwrap();
        assert_eq!(inv.axis_order(), -1);
        assert_eq!(inv.compose(&inv), SymOp::identity());
    }

    #[test]
    fn parse_screw_axis() {
        let op = SymOp::parse("-x,y+1/2,-z+1/2").unwrap();
        assert_eq!(op.axis_order(), 2);
        assert!((op.translation()[1] - 0.5).abs() < 1e-12);
        // applying twice yields the identity modulo a lattice vector
        let twice = op.compose(&op);
        assert_eq!(twice, SymOp::identity());
    }

    #[test]
    fn parse_hexagonal_rotation() {
        let op = SymOp::parse("x-y,x,z").unwrap();
        assert_eq!(op.axis_order(), 6);
        let op3 = SymOp::parse("-y,x-y,z").unwrap();
        assert_eq!(op3.axis_order(), 3);
    }

    #[test]
    fn leading_fraction_and_sign() {
        let op = SymOp::parse("1/2+x,-y,z-1/2").unwrap();
        assert!((op.translation()[0] - 0.5).abs() < 1e-12);
        assert!((op.translation()[2] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn hkl_transforms_by_row_action() {
        let op = SymOp::parse("y,x,-z").unwrap();
        let h = RowVector3::new(1, 2, 3);
        assert_eq!(op.apply_hkl(&h), RowVector3::new(2, 1, -3));
        // two-fold about [110]
        assert_eq!(op.axis_order(), 2);
        // diagonal mirror keeps the handedness flip
        assert_eq!(SymOp::parse("y,x,z").unwrap().axis_order(), -2);
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert!(SymOp::parse("x,y").is_err());
        assert!(SymOp::parse("x,y,w").is_err());
        assert!(SymOp::parse("x,,z").is_err());
    }
}
