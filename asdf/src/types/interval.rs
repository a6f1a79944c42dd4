use crate::eval::Choice;
use std::f32::consts::{FRAC_PI_2, PI, TAU};

/// Stores a range, with conservative calculations to guarantee that it always
/// contains the actual value.
///
/// Math functions with a restricted domain (`sqrt`, `asin`, `acos`) clamp
/// their input to that domain instead of producing `NaN`, matching the
/// behavior of scalar evaluation.
///
/// # Warning
/// This implementation does not set rounding modes, so it may not be _perfect_.
#[derive(Copy, Clone, PartialEq)]
#[repr(C)]
pub struct Interval {
    lower: f32,
    upper: f32,
}

impl std::fmt::Debug for Interval {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> Result<(), std::fmt::Error> {
        f.debug_tuple("")
            .field(&self.lower)
            .field(&self.upper)
            .finish()
    }
}

impl Interval {
    /// The interval containing every value
    pub const EVERYTHING: Self = Self {
        lower: f32::NEG_INFINITY,
        upper: f32::INFINITY,
    };

    /// Builds a new interval
    ///
    /// There are two kinds of valid interval:
    /// - `[lower, upper]` where `lower <= upper`
    /// - `[NaN, NaN]`
    ///
    /// # Panics
    /// Panics if the resulting interval would be invalid
    #[inline]
    pub fn new(lower: f32, upper: f32) -> Self {
        assert!(
            upper >= lower || (lower.is_nan() && upper.is_nan()),
            "invalid interval [{lower}, {upper}]"
        );
        Self { lower, upper }
    }

    /// Builds the smallest interval containing all of the given values
    ///
    /// `NaN` values are ignored; if every value is `NaN`, the result covers
    /// everything.
    pub fn hull<I: IntoIterator<Item = f32>>(vs: I) -> Self {
        let mut lower = f32::INFINITY;
        let mut upper = f32::NEG_INFINITY;
        for v in vs {
            lower = lower.min(v);
            upper = upper.max(v);
        }
        if lower > upper {
            Self::EVERYTHING
        } else {
            Self { lower, upper }
        }
    }

    /// Returns the lower bound of the interval
    #[inline]
    pub fn lower(&self) -> f32 {
        self.lower
    }
    /// Returns the upper bound of the interval
    #[inline]
    pub fn upper(&self) -> f32 {
        self.upper
    }
    /// Checks whether the given value is contained in the interval
    #[inline]
    pub fn contains(&self, v: f32) -> bool {
        v >= self.lower && v <= self.upper
    }
    /// Returns `true` if either bound of the interval is `NaN`
    pub fn has_nan(&self) -> bool {
        self.lower.is_nan() || self.upper.is_nan()
    }
    /// Calculates the absolute value of the interval
    pub fn abs(self) -> Self {
        if self.lower < 0.0 {
            if self.upper > 0.0 {
                Interval::new(0.0, self.upper.max(-self.lower))
            } else {
                Interval::new(-self.upper, -self.lower)
            }
        } else {
            self
        }
    }
    /// Squares the interval
    ///
    /// Note that this has tighter bounds than multiplication, because we know
    /// that both sides of the multiplication are the same value.
    pub fn square(self) -> Self {
        self.powi(2)
    }

    /// Raises the interval to an integer power
    ///
    /// Even exponents fold negative inputs onto the positive axis (so the
    /// lower bound is never below zero); odd exponents are monotonic and keep
    /// the sign of each bound.
    pub fn powi(self, n: i32) -> Self {
        if self.has_nan() {
            return f32::NAN.into();
        }
        let m = n.unsigned_abs();
        if m == 0 {
            return Interval::new(1.0, 1.0);
        }
        // Only |i32::MIN| is out of range for powi, and it's even
        let p = |v: f32| match i32::try_from(m) {
            Ok(m) => v.powi(m),
            Err(_) => v.abs().powf(m as f32),
        };
        let out = if m % 2 == 0 {
            if self.upper < 0.0 {
                Interval::new(p(self.upper), p(self.lower))
            } else if self.lower > 0.0 {
                Interval::new(p(self.lower), p(self.upper))
            } else {
                Interval::new(0.0, p(self.lower.abs().max(self.upper.abs())))
            }
        } else {
            Interval::new(p(self.lower), p(self.upper))
        };
        if n < 0 { out.recip() } else { out }
    }

    /// Raises the interval to a (possibly non-integer) interval power
    ///
    /// If the exponent is a single integer value, this defers to
    /// [`powi`](Self::powi). Otherwise, non-integer exponents see a base
    /// clamped to be non-negative, and integer exponents inside the range
    /// see the full base (matching scalar evaluation).
    pub fn pow(self, rhs: Interval) -> Self {
        if self.has_nan() || rhs.has_nan() {
            return f32::NAN.into();
        }
        if rhs.lower == rhs.upper && rhs.lower.fract() == 0.0 {
            return self.powi(rhs.lower as i32);
        }
        let base = Interval::new(self.lower.max(0.0), self.upper.max(0.0));
        // x^y is monotonic along each axis (in a direction determined by the
        // other axis), so the extrema lie at the corners.
        let mut out = Self::hull(
            [base.lower, base.upper]
                .into_iter()
                .flat_map(|b| [rhs.lower, rhs.upper].map(|e| b.powf(e))),
        );
        if self.lower < 0.0 {
            let (lo, hi) = (rhs.lower.ceil(), rhs.upper.floor());
            if hi - lo > 16.0 {
                return Self::EVERYTHING;
            }
            let mut n = lo;
            while n <= hi {
                let p = self.powi(n as i32);
                out = Self::hull([out.lower, out.upper, p.lower, p.upper]);
                n += 1.0;
            }
        }
        out
    }

    /// Computes the sine of the interval
    pub fn sin(self) -> Self {
        (self - FRAC_PI_2.into()).cos()
    }

    /// Computes the cosine of the interval
    pub fn cos(self) -> Self {
        if self.has_nan() {
            return f32::NAN.into();
        }
        if self.width() >= TAU || !self.width().is_finite() {
            return Interval::new(-1.0, 1.0);
        }
        // Shift so that the lower bound is in [0, 2π)
        let shift = (self.lower / TAU).floor() * TAU;
        let lo = self.lower - shift;
        let hi = self.upper - shift;
        let mut out = Self::hull([lo.cos(), hi.cos()]);
        // cos reaches -1 at π (and 3π) and +1 at 2π
        if (lo..=hi).contains(&PI) || (lo..=hi).contains(&(3.0 * PI)) {
            out.lower = -1.0;
        }
        if (lo..=hi).contains(&TAU) {
            out.upper = 1.0;
        }
        out
    }

    /// Computes the tangent of the interval
    ///
    /// Returns an unbounded interval if the input spans an asymptote
    pub fn tan(self) -> Self {
        if self.has_nan() {
            return f32::NAN.into();
        }
        if self.width() >= PI {
            return Self::EVERYTHING;
        }
        let lower = self.lower.tan();
        let upper = self.upper.tan();
        if upper >= lower {
            Interval::new(lower, upper)
        } else {
            Self::EVERYTHING
        }
    }

    /// Computes the arcsine of the interval
    ///
    /// The input is clamped to the `[-1, 1]` domain
    pub fn asin(self) -> Self {
        let c = self.clamp_unit();
        Interval::new(c.lower.asin(), c.upper.asin())
    }

    /// Computes the arccosine of the interval
    ///
    /// The input is clamped to the `[-1, 1]` domain
    pub fn acos(self) -> Self {
        let c = self.clamp_unit();
        Interval::new(c.upper.acos(), c.lower.acos())
    }

    fn clamp_unit(self) -> Self {
        Interval {
            lower: self.lower.clamp(-1.0, 1.0),
            upper: self.upper.clamp(-1.0, 1.0),
        }
    }

    /// Computes the arctangent of the interval
    pub fn atan(self) -> Self {
        Interval::new(self.lower.atan(), self.upper.atan())
    }

    /// Computes the four-quadrant arctangent of `self / x`
    ///
    /// Returns `[-π, π]` if the region touches the origin or crosses the
    /// branch cut along the negative X axis.
    pub fn atan2(self, x: Interval) -> Self {
        if self.has_nan() || x.has_nan() {
            return f32::NAN.into();
        }
        let y = self;
        if x.lower <= 0.0 && y.lower <= 0.0 && y.upper >= 0.0 {
            return Interval::new(-PI, PI);
        }
        // The box is convex and doesn't contain the origin, so the extreme
        // angles are found at its corners.
        Self::hull(
            [y.lower, y.upper]
                .into_iter()
                .flat_map(|y| [x.lower, x.upper].map(|x| y.atan2(x))),
        )
    }

    /// Computes the exponent function applied to the interval
    pub fn exp(self) -> Self {
        Interval::new(self.lower.exp(), self.upper.exp())
    }

    /// Calculates the square root of the interval
    ///
    /// Negative values are clamped to 0 before taking the root.
    pub fn sqrt(self) -> Self {
        if self.has_nan() {
            f32::NAN.into()
        } else if self.upper < 0.0 {
            Interval::new(0.0, 0.0)
        } else {
            Interval::new(self.lower.max(0.0).sqrt(), self.upper.sqrt())
        }
    }

    /// Calculates the reciprocal of the interval
    ///
    /// If the interval includes 0, returns an unbounded interval
    pub fn recip(self) -> Self {
        if self.has_nan() {
            f32::NAN.into()
        } else if self.lower > 0.0 || self.upper < 0.0 {
            Interval::new(1.0 / self.upper, 1.0 / self.lower)
        } else {
            Self::EVERYTHING
        }
    }

    /// Calculates the minimum of two intervals
    ///
    /// Returns both the result and a [`Choice`] indicating whether one side is
    /// always less than the other.
    ///
    /// If either side is `NAN`, returns the `NAN` interval and `Choice::Both`.
    pub fn min_choice(self, rhs: Self) -> (Self, Choice) {
        if self.has_nan() || rhs.has_nan() {
            return (f32::NAN.into(), Choice::Both);
        }
        let choice = if self.upper < rhs.lower {
            Choice::Left
        } else if rhs.upper < self.lower {
            Choice::Right
        } else {
            Choice::Both
        };
        (
            Interval::new(self.lower.min(rhs.lower), self.upper.min(rhs.upper)),
            choice,
        )
    }

    /// Calculates the maximum of two intervals
    ///
    /// Returns both the result and a [`Choice`] indicating whether one side is
    /// always greater than the other.
    ///
    /// If either side is `NAN`, returns the `NAN` interval and `Choice::Both`.
    pub fn max_choice(self, rhs: Self) -> (Self, Choice) {
        if self.has_nan() || rhs.has_nan() {
            return (f32::NAN.into(), Choice::Both);
        }
        let choice = if self.lower > rhs.upper {
            Choice::Left
        } else if rhs.lower > self.upper {
            Choice::Right
        } else {
            Choice::Both
        };
        (
            Interval::new(self.lower.max(rhs.lower), self.upper.max(rhs.upper)),
            choice,
        )
    }

    /// Returns the midpoint of the interval
    pub fn midpoint(self) -> f32 {
        (self.lower + self.upper) / 2.0
    }

    /// Splits the interval at the midpoint
    ///
    /// ```
    /// # use asdf::types::Interval;
    /// let a = Interval::new(0.0, 1.0);
    /// let (lo, hi) = a.split();
    /// assert_eq!(lo, Interval::new(0.0, 0.5));
    /// assert_eq!(hi, Interval::new(0.5, 1.0));
    /// ```
    pub fn split(self) -> (Self, Self) {
        self.split_at(self.midpoint())
    }

    /// Splits the interval at the given position
    pub fn split_at(self, pos: f32) -> (Self, Self) {
        (Interval::new(self.lower, pos), Interval::new(pos, self.upper))
    }

    /// Returns the smallest interval containing both inputs
    pub fn union(self, other: Self) -> Self {
        Interval::new(self.lower.min(other.lower), self.upper.max(other.upper))
    }

    /// Checks whether two intervals overlap
    ///
    /// Intervals with a non-zero width must share a region of non-zero width;
    /// if either interval is degenerate (zero width), touching is sufficient.
    pub fn overlaps(self, other: Self) -> bool {
        if self.width() == 0.0 || other.width() == 0.0 {
            self.lower <= other.upper && other.lower <= self.upper
        } else {
            self.lower < other.upper && other.lower < self.upper
        }
    }

    /// Linear interpolation from `lower` to `upper`
    ///
    /// ```
    /// # use asdf::types::Interval;
    /// let a = Interval::new(0.0, 2.0);
    /// assert_eq!(a.lerp(0.5), 1.0);
    /// assert_eq!(a.lerp(0.75), 1.5);
    /// assert_eq!(a.lerp(2.0), 4.0);
    /// ```
    pub fn lerp(self, frac: f32) -> f32 {
        self.lower * (1.0 - frac) + self.upper * frac
    }

    /// Inverse of [`lerp`](Self::lerp), returning 0 for degenerate intervals
    pub fn frac(self, v: f32) -> f32 {
        let w = self.width();
        if w == 0.0 { 0.0 } else { (v - self.lower) / w }
    }

    /// Calculates the width of the interval
    ///
    /// ```
    /// # use asdf::types::Interval;
    /// let a = Interval::new(2.0, 3.0);
    /// assert_eq!(a.width(), 1.0);
    /// let b = Interval::new(2.0, 5.0);
    /// assert_eq!(b.width(), 3.0);
    /// ```
    pub fn width(self) -> f32 {
        self.upper - self.lower
    }

    /// Checks that the two values are roughly equal, panicking otherwise
    #[cfg(test)]
    pub(crate) fn compare_eq(&self, other: Self) {
        let d = (self.lower - other.lower)
            .abs()
            .max((self.upper - other.upper).abs());
        if d >= 1e-6 {
            panic!("lhs != rhs ({self:?} != {other:?})");
        }
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.lower, self.upper)
    }
}

impl From<[f32; 2]> for Interval {
    fn from(i: [f32; 2]) -> Interval {
        Interval::new(i[0], i[1])
    }
}

impl From<f32> for Interval {
    fn from(f: f32) -> Self {
        Interval::new(f, f)
    }
}

impl std::ops::Add<Interval> for Interval {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Interval::new(self.lower + rhs.lower, self.upper + rhs.upper)
    }
}

impl std::ops::Mul<Interval> for Interval {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self {
        if self.has_nan() || rhs.has_nan() {
            return f32::NAN.into();
        }
        let mut out = [0.0; 4];
        let mut k = 0;
        for i in [self.lower, self.upper] {
            for j in [rhs.lower, rhs.upper] {
                out[k] = i * j;
                k += 1;
            }
        }
        // 0 * inf produces NaN, which `hull` skips; zero is a valid product
        // in that case, so include it explicitly.
        if out.iter().any(|v| v.is_nan()) {
            return Self::hull(out.into_iter().chain([0.0]));
        }
        Self::hull(out)
    }
}

impl std::ops::Mul<f32> for Interval {
    type Output = Self;
    fn mul(self, rhs: f32) -> Self {
        if self.has_nan() || rhs.is_nan() {
            f32::NAN.into()
        } else if rhs < 0.0 {
            Interval::new(self.upper * rhs, self.lower * rhs)
        } else {
            Interval::new(self.lower * rhs, self.upper * rhs)
        }
    }
}

impl std::ops::Div<Interval> for Interval {
    type Output = Self;
    fn div(self, rhs: Self) -> Self {
        if self.has_nan() || rhs.has_nan() {
            return f32::NAN.into();
        }
        if rhs.lower > 0.0 || rhs.upper < 0.0 {
            let mut out = [0.0; 4];
            let mut k = 0;
            for i in [self.lower, self.upper] {
                for j in [rhs.lower, rhs.upper] {
                    out[k] = i / j;
                    k += 1;
                }
            }
            Self::hull(out)
        } else {
            Self::EVERYTHING
        }
    }
}

impl std::ops::Sub<Interval> for Interval {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Interval::new(self.lower - rhs.upper, self.upper - rhs.lower)
    }
}

impl std::ops::Neg for Interval {
    type Output = Self;
    fn neg(self) -> Self {
        Interval::new(-self.upper, -self.lower)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_min_choice() {
        let a = Interval::new(0.0, 1.0);
        let b = Interval::new(0.5, 1.5);
        let (v, c) = a.min_choice(b);
        assert_eq!(v, [0.0, 1.0].into());
        assert_eq!(c, Choice::Both);

        let b = Interval::new(2.0, 3.0);
        let (v, c) = a.min_choice(b);
        assert_eq!(v, [0.0, 1.0].into());
        assert_eq!(c, Choice::Left);

        let (v, c) = a.max_choice(b);
        assert_eq!(v, [2.0, 3.0].into());
        assert_eq!(c, Choice::Right);
    }

    #[test]
    fn test_sqrt_clamps() {
        assert_eq!(Interval::new(-4.0, 4.0).sqrt(), [0.0, 2.0].into());
        assert_eq!(Interval::new(-4.0, -1.0).sqrt(), [0.0, 0.0].into());
    }

    #[test]
    fn test_asin_acos_clamp() {
        let a = Interval::new(-2.0, 0.0).asin();
        a.compare_eq(Interval::new(-FRAC_PI_2, 0.0));
        let a = Interval::new(0.0, 3.0).acos();
        a.compare_eq(Interval::new(0.0, FRAC_PI_2));
    }

    #[test]
    fn test_powi_sign() {
        let a = Interval::new(-2.0, 1.0);
        assert_eq!(a.powi(2), [0.0, 4.0].into());
        assert_eq!(a.powi(3), [-8.0, 1.0].into());
        assert_eq!(a.pow(2.0f32.into()), [0.0, 4.0].into());
        assert_eq!(Interval::new(-3.0, -2.0).powi(2), [4.0, 9.0].into());
    }

    #[test]
    fn test_cos_range() {
        let a = Interval::new(0.0, 0.5).cos();
        a.compare_eq(Interval::new(0.5f32.cos(), 1.0));
        let a = Interval::new(3.0, 3.5).cos();
        assert_eq!(a.lower(), -1.0);
        let a = Interval::new(-1.0, 1.0).cos();
        assert_eq!(a.upper(), 1.0);
        let a = Interval::new(0.0, 10.0).sin();
        assert_eq!(a, [-1.0, 1.0].into());
    }

    #[test]
    fn test_powi_extreme_exponent() {
        let a = Interval::new(2.0, 4.0);
        assert_eq!(a.powi(-2), [1.0 / 16.0, 0.25].into());
        let b = a.powi(i32::MIN);
        assert!(!b.has_nan());
        assert_eq!(b, [0.0, 0.0].into());
        let b = Interval::new(-4.0, -2.0).powi(i32::MIN);
        assert_eq!(b, [0.0, 0.0].into());
    }

    #[test]
    fn test_pow_negative_base() {
        // (-2)^1 and (-2)^3 are reached through integer exponents
        let a = Interval::new(-2.0, 1.0).pow(Interval::new(0.5, 3.5));
        assert!(a.contains(-2.0), "{a}");
        assert!(a.contains(-8.0), "{a}");
        assert!(a.contains(4.0), "{a}");

        // No integers in the exponent, so the base is clamped
        let a = Interval::new(-2.0, 1.0).pow(Interval::new(0.25, 0.75));
        assert_eq!(a.lower(), 0.0);
        assert_eq!(a.upper(), 1.0);

        let a = Interval::new(-2.0, 1.0).pow(Interval::new(0.5, 100.0));
        assert_eq!(a, Interval::EVERYTHING);
    }

    #[test]
    fn test_atan2_cut() {
        let a = Interval::new(-1.0, 1.0).atan2(Interval::new(-2.0, -1.0));
        assert_eq!(a, [-PI, PI].into());
        let a = Interval::new(1.0, 2.0).atan2(Interval::new(1.0, 2.0));
        assert!(a.contains(1.0f32.atan2(1.0)));
        assert!(a.upper() < FRAC_PI_2);
    }

    #[test]
    fn test_div_through_zero() {
        let a = Interval::new(1.0, 2.0) / Interval::new(-1.0, 1.0);
        assert_eq!(a, Interval::EVERYTHING);
    }
}
