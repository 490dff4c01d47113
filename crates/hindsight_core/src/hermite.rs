//! Piecewise cubic Hermite reconstruction between anchors.
//!
//! Each component between two anchors is the cubic matching both endpoint
//! values and derivatives. With `s = (t - t0) / h` it reads
//!
//! ```text
//! p(s) = c0 + c1 s + c2 s^2 + c3 s^3
//! c0 = y0
//! c1 = h dy0
//! c2 = 3 (y1 - y0) - h (2 dy0 + dy1)
//! c3 = 2 (y0 - y1) + h (dy0 + dy1)
//! ```
//!
//! Outside `[t0, t1]` the same cubic is evaluated, which is how the newest
//! pair of anchors is extrapolated.

use crate::anchors::{Anchor, Bracket, BracketKind};

/// Monomial form of one component of a Hermite piece.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cubic {
    t0: f64,
    h: f64,
    coeffs: [f64; 4],
}

impl Cubic {
    pub fn between(left: &Anchor, right: &Anchor, component: usize) -> Self {
        let h = right.t - left.t;
        let y0 = left.state[component];
        let y1 = right.state[component];
        let dy0 = left.derivative[component];
        let dy1 = right.derivative[component];
        Self {
            t0: left.t,
            h,
            coeffs: [
                y0,
                h * dy0,
                3.0 * (y1 - y0) - h * (2.0 * dy0 + dy1),
                2.0 * (y0 - y1) + h * (dy0 + dy1),
            ],
        }
    }

    fn local(&self, t: f64) -> f64 {
        (t - self.t0) / self.h
    }

    pub fn value(&self, t: f64) -> f64 {
        let s = self.local(t);
        let [c0, c1, c2, c3] = self.coeffs;
        c0 + s * (c1 + s * (c2 + s * c3))
    }

    /// Time derivative of the cubic.
    pub fn slope(&self, t: f64) -> f64 {
        let s = self.local(t);
        let [_, c1, c2, c3] = self.coeffs;
        (c1 + s * (2.0 * c2 + s * 3.0 * c3)) / self.h
    }

    /// Exact integral of `self(t) * other(t)` over `[from, to]`.
    /// Both cubics must describe the same anchor pair.
    pub fn product_integral(&self, other: &Cubic, from: f64, to: f64) -> f64 {
        let mut product = [0.0; 7];
        for (i, a) in self.coeffs.iter().enumerate() {
            for (j, b) in other.coeffs.iter().enumerate() {
                product[i + j] += a * b;
            }
        }
        let s_from = self.local(from);
        let s_to = self.local(to);
        let mut integral = 0.0;
        let (mut p_from, mut p_to) = (s_from, s_to);
        for (k, d) in product.iter().enumerate() {
            integral += d * (p_to - p_from) / (k + 1) as f64;
            p_from *= s_from;
            p_to *= s_to;
        }
        integral * self.h
    }
}

/// State and derivative of one component at `t`.
pub fn component_at(bracket: &Bracket<'_>, t: f64, component: usize) -> (f64, f64) {
    if bracket.kind == BracketKind::Exact {
        return (
            bracket.left.state[component],
            bracket.left.derivative[component],
        );
    }
    let cubic = Cubic::between(bracket.left, bracket.right, component);
    (cubic.value(t), cubic.slope(t))
}

/// Full state and derivative vectors at `t`.
pub fn evaluate(bracket: &Bracket<'_>, t: f64) -> (Vec<f64>, Vec<f64>) {
    let dim = bracket.left.dimension();
    let mut state = Vec::with_capacity(dim);
    let mut derivative = Vec::with_capacity(dim);
    for i in 0..dim {
        let (value, slope) = component_at(bracket, t, i);
        state.push(value);
        derivative.push(slope);
    }
    (state, derivative)
}

/// Integral over `[from, to]` of `sum_c g_c(t) h_c(t)` where `g` and `h` are
/// the `len` components starting at `first` and `second` respectively.
pub fn block_product_integral(
    left: &Anchor,
    right: &Anchor,
    first: usize,
    second: usize,
    len: usize,
    from: f64,
    to: f64,
) -> f64 {
    (0..len)
        .map(|c| {
            let g = Cubic::between(left, right, first + c);
            let h = Cubic::between(left, right, second + c);
            g.product_integral(&h, from, to)
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::{block_product_integral, component_at, evaluate, Cubic};
    use crate::anchors::{Anchor, AnchorStore};
    use approx::assert_abs_diff_eq;

    fn pair() -> (Anchor, Anchor) {
        (
            Anchor::new(0.5, vec![1.0, -2.0], vec![0.3, 4.0]),
            Anchor::new(2.0, vec![-0.7, 1.5], vec![2.0, -1.0]),
        )
    }

    #[test]
    fn reproduces_endpoint_values_and_derivatives() {
        let (left, right) = pair();
        for c in 0..2 {
            let cubic = Cubic::between(&left, &right, c);
            assert_abs_diff_eq!(cubic.value(left.t), left.state[c], epsilon = 1e-12);
            assert_abs_diff_eq!(cubic.value(right.t), right.state[c], epsilon = 1e-12);
            assert_abs_diff_eq!(cubic.slope(left.t), left.derivative[c], epsilon = 1e-12);
            assert_abs_diff_eq!(cubic.slope(right.t), right.derivative[c], epsilon = 1e-12);
        }
    }

    #[test]
    fn reproduces_cubic_polynomials_exactly() {
        // p(t) = t^3 - 2t + 1, p'(t) = 3t^2 - 2
        let p = |t: f64| t * t * t - 2.0 * t + 1.0;
        let dp = |t: f64| 3.0 * t * t - 2.0;
        let left = Anchor::new(-1.0, vec![p(-1.0)], vec![dp(-1.0)]);
        let right = Anchor::new(2.0, vec![p(2.0)], vec![dp(2.0)]);
        let cubic = Cubic::between(&left, &right, 0);
        for &t in &[-1.0, -0.3, 0.0, 1.1, 2.0, 2.5] {
            assert_abs_diff_eq!(cubic.value(t), p(t), epsilon = 1e-10);
            assert_abs_diff_eq!(cubic.slope(t), dp(t), epsilon = 1e-10);
        }
    }

    #[test]
    fn exact_bracket_returns_stored_values() {
        let mut store = AnchorStore::new();
        let (left, right) = pair();
        store.append(left.clone()).unwrap();
        store.append(right).unwrap();
        let bracket = store.bracket(left.t).unwrap();
        assert_eq!(component_at(&bracket, left.t, 1), (-2.0, 4.0));
        let (state, derivative) = evaluate(&bracket, left.t);
        assert_eq!(state, left.state);
        assert_eq!(derivative, left.derivative);
    }

    #[test]
    fn product_integral_matches_quadrature() {
        let (left, right) = pair();
        let g = Cubic::between(&left, &right, 0);
        let h = Cubic::between(&left, &right, 1);
        let (from, to) = (0.8, 1.7);
        let samples = 20_000;
        let width = (to - from) / samples as f64;
        let midpoint: f64 = (0..samples)
            .map(|k| {
                let t = from + (k as f64 + 0.5) * width;
                g.value(t) * h.value(t) * width
            })
            .sum();
        assert_abs_diff_eq!(g.product_integral(&h, from, to), midpoint, epsilon = 1e-7);
    }

    #[test]
    fn block_product_sums_components() {
        let (left, right) = pair();
        let whole = block_product_integral(&left, &right, 0, 0, 2, left.t, right.t);
        let parts: f64 = (0..2)
            .map(|c| {
                let cubic = Cubic::between(&left, &right, c);
                cubic.product_integral(&cubic, left.t, right.t)
            })
            .sum();
        assert_abs_diff_eq!(whole, parts, epsilon = 1e-12);
        assert!(whole > 0.0);
    }
}
