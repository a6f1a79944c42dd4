/// A point in space with associated partial derivatives.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
#[repr(C)]
pub struct Grad {
    /// Value of the distance field at this point
    pub v: f32,
    /// Partial derivative with respect to `x`
    pub dx: f32,
    /// Partial derivative with respect to `y`
    pub dy: f32,
    /// Partial derivative with respect to `z`
    pub dz: f32,
}

impl std::fmt::Display for Grad {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {}, {})", self.v, self.dx, self.dy, self.dz)
    }
}

impl Grad {
    /// Constructs a new gradient
    pub fn new(v: f32, dx: f32, dy: f32, dz: f32) -> Self {
        Self { v, dx, dy, dz }
    }

    /// Builds a constant value, with all partial derivatives set to zero
    pub fn constant(v: f32) -> Self {
        Self::new(v, 0.0, 0.0, 0.0)
    }

    /// Looks up a gradient by index (0 = x, 1 = y, 2 = z)
    ///
    /// # Panics
    /// If the index is not in the 0-2 range
    pub fn d(&self, i: usize) -> f32 {
        match i {
            0 => self.dx,
            1 => self.dy,
            2 => self.dz,
            _ => panic!("invalid index {i}"),
        }
    }

    /// Returns the partial derivatives as a vector
    pub fn xyz(&self) -> nalgebra::Vector3<f32> {
        nalgebra::Vector3::new(self.dx, self.dy, self.dz)
    }

    /// Returns a normalized RGB color, or `None` if the gradient is 0
    pub fn to_rgb(&self) -> Option<[u8; 3]> {
        let s = (self.dx.powi(2) + self.dy.powi(2) + self.dz.powi(2)).sqrt();
        if s != 0.0 && s.is_finite() {
            let scale = u8::MAX as f32 / s;
            Some([
                (self.dx.abs() * scale) as u8,
                (self.dy.abs() * scale) as u8,
                (self.dz.abs() * scale) as u8,
            ])
        } else {
            None
        }
    }

    /// Applies the chain rule, given `f(v)` and `f'(v)`
    fn chain(self, v: f32, d: f32) -> Self {
        Grad {
            v,
            dx: self.dx * d,
            dy: self.dy * d,
            dz: self.dz * d,
        }
    }

    /// Absolute value
    pub fn abs(self) -> Self {
        if self.v < 0.0 { -self } else { self }
    }

    /// Square
    pub fn square(self) -> Self {
        self.chain(self.v * self.v, 2.0 * self.v)
    }

    /// Square root
    ///
    /// Negative values are clamped to zero, with a zero derivative
    pub fn sqrt(self) -> Self {
        if self.v <= 0.0 {
            Grad::constant(0.0)
        } else {
            let v = self.v.sqrt();
            self.chain(v, 1.0 / (2.0 * v))
        }
    }

    /// Sine
    pub fn sin(self) -> Self {
        self.chain(self.v.sin(), self.v.cos())
    }
    /// Cosine
    pub fn cos(self) -> Self {
        self.chain(self.v.cos(), -self.v.sin())
    }
    /// Tangent
    pub fn tan(self) -> Self {
        self.chain(self.v.tan(), 1.0 / self.v.cos().powi(2))
    }
    /// Arcsin
    ///
    /// Inputs outside of `[-1, 1]` are clamped, with a zero derivative
    pub fn asin(self) -> Self {
        if self.v.abs() >= 1.0 {
            Grad::constant(self.v.clamp(-1.0, 1.0).asin())
        } else {
            let r = (1.0 - self.v.powi(2)).sqrt();
            self.chain(self.v.asin(), 1.0 / r)
        }
    }
    /// Arccos
    ///
    /// Inputs outside of `[-1, 1]` are clamped, with a zero derivative
    pub fn acos(self) -> Self {
        if self.v.abs() >= 1.0 {
            Grad::constant(self.v.clamp(-1.0, 1.0).acos())
        } else {
            let r = (1.0 - self.v.powi(2)).sqrt();
            self.chain(self.v.acos(), -1.0 / r)
        }
    }
    /// Arctangent
    pub fn atan(self) -> Self {
        self.chain(self.v.atan(), 1.0 / (self.v.powi(2) + 1.0))
    }
    /// Four-quadrant arctangent of `self / x`
    pub fn atan2(self, x: Self) -> Self {
        let y = self;
        let d = x.v.powi(2) + y.v.powi(2);
        if d == 0.0 {
            return Grad::constant(0.0);
        }
        Grad {
            v: y.v.atan2(x.v),
            dx: (x.v * y.dx - y.v * x.dx) / d,
            dy: (x.v * y.dy - y.v * x.dy) / d,
            dz: (x.v * y.dz - y.v * x.dz) / d,
        }
    }
    /// Exponential function
    pub fn exp(self) -> Self {
        let v = self.v.exp();
        self.chain(v, v)
    }

    /// Raises to a power
    ///
    /// If the exponent is integral, this uses `powi` and keeps the sign of
    /// the base; otherwise, the base is clamped to be non-negative.
    pub fn pow(self, rhs: Self) -> Self {
        if rhs.v.fract() == 0.0 {
            let n = rhs.v as i32;
            if n == 0 {
                return Grad::constant(1.0);
            }
            return self.chain(self.v.powi(n), n as f32 * self.v.powi(n - 1));
        }
        let base = self.v.max(0.0);
        let v = base.powf(rhs.v);
        if base == 0.0 {
            return Grad::constant(v);
        }
        // d(a^b) = b a^(b-1) da + a^b ln(a) db
        let da = rhs.v * base.powf(rhs.v - 1.0);
        let db = v * base.ln();
        Grad {
            v,
            dx: da * self.dx + db * rhs.dx,
            dy: da * self.dy + db * rhs.dy,
            dz: da * self.dz + db * rhs.dz,
        }
    }

    /// Reciprocal
    pub fn recip(self) -> Self {
        self.chain(1.0 / self.v, -1.0 / self.v.powi(2))
    }

    /// Minimum of two values
    pub fn min(self, rhs: Self) -> Self {
        if self.v < rhs.v { self } else { rhs }
    }

    /// Maximum of two values
    pub fn max(self, rhs: Self) -> Self {
        if self.v > rhs.v { self } else { rhs }
    }
}

impl From<f32> for Grad {
    fn from(v: f32) -> Self {
        Grad::constant(v)
    }
}

impl From<Grad> for nalgebra::Vector4<f32> {
    fn from(g: Grad) -> Self {
        nalgebra::Vector4::new(g.dx, g.dy, g.dz, g.v)
    }
}

impl std::ops::Add<Grad> for Grad {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Grad {
            v: self.v + rhs.v,
            dx: self.dx + rhs.dx,
            dy: self.dy + rhs.dy,
            dz: self.dz + rhs.dz,
        }
    }
}

impl std::ops::Mul<Grad> for Grad {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self {
        Self {
            v: self.v * rhs.v,
            dx: self.v * rhs.dx + rhs.v * self.dx,
            dy: self.v * rhs.dy + rhs.v * self.dy,
            dz: self.v * rhs.dz + rhs.v * self.dz,
        }
    }
}

impl std::ops::Div<Grad> for Grad {
    type Output = Self;
    fn div(self, rhs: Self) -> Self {
        let d = rhs.v.powi(2);
        Self {
            v: self.v / rhs.v,
            dx: (rhs.v * self.dx - self.v * rhs.dx) / d,
            dy: (rhs.v * self.dy - self.v * rhs.dy) / d,
            dz: (rhs.v * self.dz - self.v * rhs.dz) / d,
        }
    }
}

impl std::ops::Sub<Grad> for Grad {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self {
            v: self.v - rhs.v,
            dx: self.dx - rhs.dx,
            dy: self.dy - rhs.dy,
            dz: self.dz - rhs.dz,
        }
    }
}

impl std::ops::Neg for Grad {
    type Output = Self;
    fn neg(self) -> Self {
        Self {
            v: -self.v,
            dx: -self.dx,
            dy: -self.dy,
            dz: -self.dz,
        }
    }
}
