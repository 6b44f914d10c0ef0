//! Intensity with propagated variance.

use std::ops::{Add, AddAssign, Div, Mul, MulAssign, Sub};

const EPS: f64 = 1.0e-8;

/// An intensity together with the variance of its estimate.
///
/// The default value is *invalid*; a value becomes invalid as well when it
/// is constructed from a NaN or a negative variance, so that downstream
/// consumers can diagnose the failure instead of silently propagating junk.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Intensity {
    value: f64,
    variance: f64,
    valid: bool,
}

impl Intensity {
    /// Construct from a value and its variance.
    #[must_use]
    pub fn new(value: f64, variance: f64) -> Self {
        let valid = !(value.is_nan() || variance.is_nan() || variance < 0.0);
        Self { value, variance, valid }
    }

    /// The intensity value.
    #[must_use]
    pub const fn value(&self) -> f64 {
        self.value
    }

    /// The standard deviation of the intensity.
    #[must_use]
    pub fn sigma(&self) -> f64 {
        self.variance.sqrt()
    }

    /// The variance of the intensity.
    #[must_use]
    pub const fn variance(&self) -> f64 {
        self.variance
    }

    /// The strength I/sigma, zero for an all-zero intensity.
    #[must_use]
    pub fn strength(&self) -> f64 {
        if self.value.abs() < EPS && self.variance.abs() < EPS {
            return 0.0;
        }
        self.value / self.sigma()
    }

    /// Whether the intensity carries a usable value (checks for
    /// interpolation and propagation failures).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.valid
    }
}

impl Add for Intensity {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self::new(self.value + other.value, self.variance + other.variance)
    }
}

impl AddAssign for Intensity {
    fn add_assign(&mut self, other: Self) {
        *self = *self + other;
    }
}

impl Sub for Intensity {
    type Output = Self;

    fn sub(self, other: Self) -> Self {
        Self::new(self.value - other.value, self.variance + other.variance)
    }
}

impl Mul<f64> for Intensity {
    type Output = Self;

    fn mul(self, scale: f64) -> Self {
        Self::new(scale * self.value, scale * scale * self.variance)
    }
}

impl MulAssign<f64> for Intensity {
    fn mul_assign(&mut self, scale: f64) {
        *self = *self * scale;
    }
}

impl Div<f64> for Intensity {
    type Output = Self;

    fn div(self, denominator: f64) -> Self {
        self * (1.0 / denominator)
    }
}

impl Div for Intensity {
    type Output = Self;

    /// Divide two intensities, propagating both errors.
    fn div(self, other: Self) -> Self {
        let d = 1.0 / other.value;
        Self::new(self.value * d, d * d * (self.variance + self.value * other.variance))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    #[test]
    fn default_is_invalid() {
        assert!(!Intensity::default().is_valid());
        assert!(Intensity::new(1.0, 1.0).is_valid());
        assert!(!Intensity::new(f64::NAN, 1.0).is_valid());
        assert!(!Intensity::new(1.0, -1.0).is_valid());
    }

    #[test]
    fn linear_algebra() {
        let a = Intensity::new(3.0, 4.0);
        let b = Intensity::new(1.0, 5.0);

        let sum = a + b;
        assert_approx_eq!(f64, sum.value(), 4.0);
        assert_approx_eq!(f64, sum.variance(), 9.0);

        let diff = a - b;
        assert_approx_eq!(f64, diff.value(), 2.0);
        assert_approx_eq!(f64, diff.variance(), 9.0);

        let scaled = a * 2.0;
        assert_approx_eq!(f64, scaled.value(), 6.0);
        assert_approx_eq!(f64, scaled.variance(), 16.0);

        let mut acc = a;
        acc += b;
        assert_approx_eq!(f64, acc.value(), 4.0);
    }

    #[test]
    fn strength_of_zero_is_zero() {
        assert_approx_eq!(f64, Intensity::new(0.0, 0.0).strength(), 0.0);
        assert_approx_eq!(f64, Intensity::new(8.0, 4.0).strength(), 4.0);
    }
}
