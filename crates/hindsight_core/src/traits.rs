use crate::error::Result;
use num_traits::{Float, FromPrimitive};
use std::fmt::Debug;

/// A trait for types that can be used as scalars in delay systems.
/// Implemented by `f64` and by the `Dual` number used for tangent dynamics.
pub trait Scalar: Float + FromPrimitive + Debug + 'static {}

impl<T: Float + FromPrimitive + Debug + 'static> Scalar for T {}

/// Access to the past of the trajectory, relative to the evaluation time.
///
/// `delay` is measured backwards from the time the derivative is evaluated at,
/// so `state(tau, i)` is `y_i(t - tau)`.
pub trait Past<T> {
    fn state(&self, delay: f64, component: usize) -> Result<T>;
    fn derivative(&self, delay: f64, component: usize) -> Result<T>;
}

/// Right-hand side of a delay differential equation.
pub trait DelaySystem<T: Scalar> {
    /// Returns the dimension of the state space.
    fn dimension(&self) -> usize;

    /// Delays the right-hand side may request. State- or time-dependent
    /// delays should report their bounds here.
    fn delays(&self) -> Vec<f64>;

    /// Evaluates the derivative.
    /// t: current time
    /// y: current state
    /// past: resolves delayed states and derivatives
    /// out: buffer to write dy/dt
    fn apply(&self, t: f64, y: &[T], past: &dyn Past<T>, out: &mut [T]) -> Result<()>;
}

/// Linearized right-hand side, used to evolve separation functions.
pub trait JacobianProduct {
    /// Writes `J(t) v` into `out`, where the Jacobian is taken with respect to
    /// the current and all delayed states, and `tangent_past` resolves the
    /// delayed values of `v`.
    fn jacobian_product(
        &self,
        t: f64,
        y: &[f64],
        v: &[f64],
        past: &dyn Past<f64>,
        tangent_past: &dyn Past<f64>,
        out: &mut [f64],
    ) -> Result<()>;
}

/// Shortest strictly positive delay, if any.
pub fn shortest_delay(delays: &[f64]) -> Option<f64> {
    delays
        .iter()
        .copied()
        .filter(|d| *d > 0.0)
        .min_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
}

/// Largest delay, zero for an empty list.
pub fn longest_delay(delays: &[f64]) -> f64 {
    delays.iter().copied().fold(0.0, f64::max)
}
