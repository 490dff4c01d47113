use crate::error::Result;
use crate::traits::{DelaySystem, JacobianProduct, Past};
use num_traits::{Float, FromPrimitive, Num, NumCast, One, ToPrimitive, Zero};
use std::ops::{
    Add, AddAssign, Div, DivAssign, Mul, MulAssign, Neg, Rem, RemAssign, Sub, SubAssign,
};

/// Dual number for forward-mode differentiation along a tangent direction.
/// value: point of evaluation
/// tangent: directional derivative carried along
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Dual {
    pub value: f64,
    pub tangent: f64,
}

impl Dual {
    pub fn new(value: f64, tangent: f64) -> Self {
        Self { value, tangent }
    }

    pub fn constant(value: f64) -> Self {
        Self::new(value, 0.0)
    }

    /// Applies a scalar function with known derivative `slope` at `value`.
    fn chain(self, value: f64, slope: f64) -> Self {
        Self::new(value, slope * self.tangent)
    }
}

impl Zero for Dual {
    fn zero() -> Self {
        Self::constant(0.0)
    }
    fn is_zero(&self) -> bool {
        self.value == 0.0 && self.tangent == 0.0
    }
}

impl One for Dual {
    fn one() -> Self {
        Self::constant(1.0)
    }
}

impl Add for Dual {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.value + rhs.value, self.tangent + rhs.tangent)
    }
}

impl Sub for Dual {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.value - rhs.value, self.tangent - rhs.tangent)
    }
}

impl Mul for Dual {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self {
        Self::new(
            self.value * rhs.value,
            self.value * rhs.tangent + self.tangent * rhs.value,
        )
    }
}

impl Div for Dual {
    type Output = Self;
    fn div(self, rhs: Self) -> Self {
        Self::new(
            self.value / rhs.value,
            (self.tangent * rhs.value - self.value * rhs.tangent) / (rhs.value * rhs.value),
        )
    }
}

impl Neg for Dual {
    type Output = Self;
    fn neg(self) -> Self {
        Self::new(-self.value, -self.tangent)
    }
}

impl Rem for Dual {
    type Output = Self;
    fn rem(self, rhs: Self) -> Self {
        // a % b = a - trunc(a / b) b, with trunc locally constant.
        let quotient = (self.value / rhs.value).trunc();
        Self::new(
            self.value % rhs.value,
            self.tangent - quotient * rhs.tangent,
        )
    }
}

macro_rules! assign_via_binary {
    ($($trait:ident :: $method:ident => $op:tt),* $(,)?) => {
        $(
            impl $trait for Dual {
                fn $method(&mut self, rhs: Self) {
                    *self = *self $op rhs;
                }
            }
        )*
    };
}

assign_via_binary!(
    AddAssign::add_assign => +,
    SubAssign::sub_assign => -,
    MulAssign::mul_assign => *,
    DivAssign::div_assign => /,
    RemAssign::rem_assign => %,
);

impl Num for Dual {
    type FromStrRadixErr = <f64 as Num>::FromStrRadixErr;
    fn from_str_radix(text: &str, radix: u32) -> std::result::Result<Self, Self::FromStrRadixErr> {
        f64::from_str_radix(text, radix).map(Self::constant)
    }
}

impl ToPrimitive for Dual {
    fn to_i64(&self) -> Option<i64> {
        self.value.to_i64()
    }
    fn to_u64(&self) -> Option<u64> {
        self.value.to_u64()
    }
    fn to_f64(&self) -> Option<f64> {
        Some(self.value)
    }
}

impl FromPrimitive for Dual {
    fn from_i64(n: i64) -> Option<Self> {
        Some(Self::constant(n as f64))
    }
    fn from_u64(n: u64) -> Option<Self> {
        Some(Self::constant(n as f64))
    }
    fn from_f64(n: f64) -> Option<Self> {
        Some(Self::constant(n))
    }
}

impl NumCast for Dual {
    fn from<T: ToPrimitive>(n: T) -> Option<Self> {
        n.to_f64().map(Self::constant)
    }
}

impl Float for Dual {
    fn nan() -> Self {
        Self::constant(f64::NAN)
    }
    fn infinity() -> Self {
        Self::constant(f64::INFINITY)
    }
    fn neg_infinity() -> Self {
        Self::constant(f64::NEG_INFINITY)
    }
    fn neg_zero() -> Self {
        Self::new(-0.0, 0.0)
    }
    fn min_value() -> Self {
        Self::constant(f64::MIN)
    }
    fn min_positive_value() -> Self {
        Self::constant(f64::MIN_POSITIVE)
    }
    fn max_value() -> Self {
        Self::constant(f64::MAX)
    }
    fn is_nan(self) -> bool {
        self.value.is_nan()
    }
    fn is_infinite(self) -> bool {
        self.value.is_infinite()
    }
    fn is_finite(self) -> bool {
        self.value.is_finite()
    }
    fn is_normal(self) -> bool {
        self.value.is_normal()
    }
    fn classify(self) -> std::num::FpCategory {
        self.value.classify()
    }

    // Piecewise constant functions.
    fn floor(self) -> Self {
        Self::constant(self.value.floor())
    }
    fn ceil(self) -> Self {
        Self::constant(self.value.ceil())
    }
    fn round(self) -> Self {
        Self::constant(self.value.round())
    }
    fn trunc(self) -> Self {
        Self::constant(self.value.trunc())
    }
    fn signum(self) -> Self {
        Self::constant(self.value.signum())
    }

    fn fract(self) -> Self {
        Self::new(self.value.fract(), self.tangent)
    }
    fn abs(self) -> Self {
        if self.value >= 0.0 {
            self
        } else {
            -self
        }
    }
    fn is_sign_positive(self) -> bool {
        self.value.is_sign_positive()
    }
    fn is_sign_negative(self) -> bool {
        self.value.is_sign_negative()
    }
    fn mul_add(self, a: Self, b: Self) -> Self {
        self * a + b
    }
    fn recip(self) -> Self {
        self.chain(self.value.recip(), -1.0 / (self.value * self.value))
    }
    fn powi(self, n: i32) -> Self {
        if n == 0 {
            return Self::one();
        }
        self.chain(self.value.powi(n), n as f64 * self.value.powi(n - 1))
    }
    fn powf(self, n: Self) -> Self {
        let power = self.value.powf(n.value);
        let exponent_part = if n.tangent == 0.0 {
            0.0
        } else {
            power * self.value.ln() * n.tangent
        };
        let base_part = if self.tangent == 0.0 {
            0.0
        } else {
            n.value * self.value.powf(n.value - 1.0) * self.tangent
        };
        Self::new(power, base_part + exponent_part)
    }
    fn sqrt(self) -> Self {
        let root = self.value.sqrt();
        self.chain(root, 0.5 / root)
    }
    fn cbrt(self) -> Self {
        let root = self.value.cbrt();
        self.chain(root, 1.0 / (3.0 * root * root))
    }
    fn exp(self) -> Self {
        let e = self.value.exp();
        self.chain(e, e)
    }
    fn exp2(self) -> Self {
        let e = self.value.exp2();
        self.chain(e, e * std::f64::consts::LN_2)
    }
    fn exp_m1(self) -> Self {
        self.chain(self.value.exp_m1(), self.value.exp())
    }
    fn ln(self) -> Self {
        self.chain(self.value.ln(), 1.0 / self.value)
    }
    fn ln_1p(self) -> Self {
        self.chain(self.value.ln_1p(), 1.0 / (1.0 + self.value))
    }
    fn log(self, base: Self) -> Self {
        self.ln() / base.ln()
    }
    fn log2(self) -> Self {
        self.chain(self.value.log2(), 1.0 / (self.value * std::f64::consts::LN_2))
    }
    fn log10(self) -> Self {
        self.chain(
            self.value.log10(),
            1.0 / (self.value * std::f64::consts::LN_10),
        )
    }
    fn max(self, other: Self) -> Self {
        if self.value >= other.value {
            self
        } else {
            other
        }
    }
    fn min(self, other: Self) -> Self {
        if self.value <= other.value {
            self
        } else {
            other
        }
    }
    #[allow(deprecated)]
    fn abs_sub(self, other: Self) -> Self {
        if self.value > other.value {
            self - other
        } else {
            Self::zero()
        }
    }
    fn hypot(self, other: Self) -> Self {
        let length = self.value.hypot(other.value);
        if length == 0.0 {
            return Self::zero();
        }
        Self::new(
            length,
            (self.value * self.tangent + other.value * other.tangent) / length,
        )
    }
    fn sin(self) -> Self {
        self.chain(self.value.sin(), self.value.cos())
    }
    fn cos(self) -> Self {
        self.chain(self.value.cos(), -self.value.sin())
    }
    fn tan(self) -> Self {
        let t = self.value.tan();
        self.chain(t, 1.0 + t * t)
    }
    fn asin(self) -> Self {
        self.chain(self.value.asin(), 1.0 / (1.0 - self.value * self.value).sqrt())
    }
    fn acos(self) -> Self {
        self.chain(
            self.value.acos(),
            -1.0 / (1.0 - self.value * self.value).sqrt(),
        )
    }
    fn atan(self) -> Self {
        self.chain(self.value.atan(), 1.0 / (1.0 + self.value * self.value))
    }
    fn atan2(self, other: Self) -> Self {
        let denom = self.value * self.value + other.value * other.value;
        Self::new(
            self.value.atan2(other.value),
            (other.value * self.tangent - self.value * other.tangent) / denom,
        )
    }
    fn sin_cos(self) -> (Self, Self) {
        (self.sin(), self.cos())
    }
    fn sinh(self) -> Self {
        self.chain(self.value.sinh(), self.value.cosh())
    }
    fn cosh(self) -> Self {
        self.chain(self.value.cosh(), self.value.sinh())
    }
    fn tanh(self) -> Self {
        let t = self.value.tanh();
        self.chain(t, 1.0 - t * t)
    }
    fn asinh(self) -> Self {
        self.chain(
            self.value.asinh(),
            1.0 / (self.value * self.value + 1.0).sqrt(),
        )
    }
    fn acosh(self) -> Self {
        self.chain(
            self.value.acosh(),
            1.0 / (self.value * self.value - 1.0).sqrt(),
        )
    }
    fn atanh(self) -> Self {
        self.chain(self.value.atanh(), 1.0 / (1.0 - self.value * self.value))
    }
    fn integer_decode(self) -> (u64, i16, i8) {
        self.value.integer_decode()
    }
}

// --- Jacobian-vector products from dual evaluation ---

/// Pairs the history of the trajectory with the history of a tangent
/// direction, so delayed lookups return dual numbers.
struct DualPast<'a> {
    past: &'a dyn Past<f64>,
    tangent_past: &'a dyn Past<f64>,
}

impl Past<Dual> for DualPast<'_> {
    fn state(&self, delay: f64, component: usize) -> Result<Dual> {
        Ok(Dual::new(
            self.past.state(delay, component)?,
            self.tangent_past.state(delay, component)?,
        ))
    }

    fn derivative(&self, delay: f64, component: usize) -> Result<Dual> {
        Ok(Dual::new(
            self.past.derivative(delay, component)?,
            self.tangent_past.derivative(delay, component)?,
        ))
    }
}

/// Derives the Jacobian-vector product of a system from its dual-number
/// implementation. The `f64` implementation is used for the flow itself.
#[derive(Debug, Clone)]
pub struct AutoDiff<S>(pub S);

impl<S> DelaySystem<f64> for AutoDiff<S>
where
    S: DelaySystem<f64>,
{
    fn dimension(&self) -> usize {
        self.0.dimension()
    }

    fn delays(&self) -> Vec<f64> {
        self.0.delays()
    }

    fn apply(&self, t: f64, y: &[f64], past: &dyn Past<f64>, out: &mut [f64]) -> Result<()> {
        self.0.apply(t, y, past, out)
    }
}

impl<S> JacobianProduct for AutoDiff<S>
where
    S: DelaySystem<Dual>,
{
    fn jacobian_product(
        &self,
        t: f64,
        y: &[f64],
        v: &[f64],
        past: &dyn Past<f64>,
        tangent_past: &dyn Past<f64>,
        out: &mut [f64],
    ) -> Result<()> {
        let dual_y: Vec<Dual> = y
            .iter()
            .zip(v)
            .map(|(&value, &tangent)| Dual::new(value, tangent))
            .collect();
        let mut dual_out = vec![Dual::zero(); out.len()];
        let dual_past = DualPast { past, tangent_past };
        self.0.apply(t, &dual_y, &dual_past, &mut dual_out)?;
        for (slot, dual) in out.iter_mut().zip(&dual_out) {
            *slot = dual.tangent;
        }
        Ok(())
    }
}

// --- Tangent System Wrapper ---

/// Shifts component indices, exposing one block of an augmented history.
struct OffsetPast<'a> {
    inner: &'a dyn Past<f64>,
    offset: usize,
}

impl Past<f64> for OffsetPast<'_> {
    fn state(&self, delay: f64, component: usize) -> Result<f64> {
        self.inner.state(delay, self.offset + component)
    }

    fn derivative(&self, delay: f64, component: usize) -> Result<f64> {
        self.inner.derivative(delay, self.offset + component)
    }
}

/// Augmented system `[y, v_1, ..., v_m]` with `dv_k/dt = J v_k`.
///
/// The main state occupies the first `n` components, separation function
/// `k` the block `n (k + 1) .. n (k + 2)`.
pub struct TangentSystem<S> {
    pub inner: S,
    pub dimension: usize,
    pub separations: usize,
}

impl<S> TangentSystem<S>
where
    S: DelaySystem<f64>,
{
    pub fn new(inner: S, separations: usize) -> Self {
        let dimension = inner.dimension();
        Self {
            inner,
            dimension,
            separations,
        }
    }

    /// Component range of separation function `k`.
    pub fn block(&self, k: usize) -> std::ops::Range<usize> {
        let start = self.dimension * (k + 1);
        start..start + self.dimension
    }
}

impl<S> DelaySystem<f64> for TangentSystem<S>
where
    S: DelaySystem<f64> + JacobianProduct,
{
    fn dimension(&self) -> usize {
        self.dimension * (self.separations + 1)
    }

    fn delays(&self) -> Vec<f64> {
        self.inner.delays()
    }

    fn apply(&self, t: f64, x: &[f64], past: &dyn Past<f64>, out: &mut [f64]) -> Result<()> {
        let n = self.dimension;
        let (main_out, tangent_out) = out.split_at_mut(n);
        // Main components come first, so the augmented past serves them as is.
        self.inner.apply(t, &x[..n], past, main_out)?;

        for (k, block_out) in tangent_out.chunks_mut(n).enumerate() {
            let range = self.block(k);
            let tangent_past = OffsetPast {
                inner: past,
                offset: range.start,
            };
            self.inner
                .jacobian_product(t, &x[..n], &x[range], past, &tangent_past, block_out)?;
        }
        Ok(())
    }
}
