use crate::anchors::{Anchor, AnchorStore};
use crate::error::{DdeError, Result};
use crate::resolver::{DelayResolver, PassRecord};
use crate::traits::DelaySystem;
use std::cell::RefCell;

/// Outcome of one pass of a trial step. Discarded unless accepted.
#[derive(Debug, Clone)]
pub struct TrialStep {
    pub t0: f64,
    pub step: f64,
    pub state: Vec<f64>,
    pub derivative: Vec<f64>,
    /// Difference between the third- and second-order solutions.
    pub error: Vec<f64>,
    pub record: PassRecord,
}

impl TrialStep {
    pub fn end_time(&self) -> f64 {
        self.t0 + self.step
    }

    pub fn end_anchor(&self) -> Anchor {
        Anchor::new(self.end_time(), self.state.clone(), self.derivative.clone())
    }

    /// Max-norm of the error relative to `atol + rtol * |y|`.
    /// Values up to 1 are within tolerance.
    pub fn scaled_error(&self, atol: f64, rtol: f64) -> f64 {
        self.error
            .iter()
            .zip(&self.state)
            .map(|(e, y)| {
                let tolerance = atol + rtol * y.abs();
                if tolerance > 0.0 {
                    e.abs() / tolerance
                } else if *e == 0.0 {
                    0.0
                } else {
                    f64::INFINITY
                }
            })
            .fold(0.0_f64, |worst, ratio| {
                if ratio.is_nan() {
                    f64::INFINITY
                } else {
                    worst.max(ratio)
                }
            })
    }
}

/// Bogacki-Shampine 3(2) pair with first-same-as-last stages.
///
/// The first stage is the derivative stored on the newest anchor and the last
/// stage is the derivative at the new point, which becomes the derivative of
/// the next anchor.
pub struct BogackiShampine {
    k2: Vec<f64>,
    k3: Vec<f64>,
    tmp: Vec<f64>,
}

impl BogackiShampine {
    /// Exponent `1 / (q + 1)` applied to the error ratio, `q = 2` being the
    /// order of the embedded estimate.
    pub const ERROR_EXPONENT: f64 = 1.0 / 3.0;

    pub fn new(dim: usize) -> Self {
        Self {
            k2: vec![0.0; dim],
            k3: vec![0.0; dim],
            tmp: vec![0.0; dim],
        }
    }

    /// Computes one pass of a step of size `step` from the newest anchor.
    /// `provisional` is the end point of the previous pass, if any.
    pub fn trial<S>(
        &mut self,
        system: &S,
        store: &AnchorStore,
        step: f64,
        provisional: Option<&Anchor>,
    ) -> Result<TrialStep>
    where
        S: DelaySystem<f64> + ?Sized,
    {
        if store.len() < 2 {
            return Err(DdeError::InsufficientHistory(format!(
                "at least two anchors are required, {} available.",
                store.len()
            )));
        }
        let base = store.last().ok_or_else(|| {
            DdeError::InsufficientHistory("no anchor to step from.".into())
        })?;
        let dim = base.dimension();
        if self.tmp.len() != dim {
            *self = Self::new(dim);
        }

        let t0 = base.t;
        let y = &base.state;
        let k1 = &base.derivative;
        let h = step;
        let record = RefCell::new(PassRecord::default());

        // k2 = f(t + h/2, y + h/2 k1)
        for i in 0..dim {
            self.tmp[i] = y[i] + 0.5 * h * k1[i];
        }
        DelayResolver::new(store, provisional, t0 + 0.5 * h, &record)
            .evaluate(system, &self.tmp, &mut self.k2)?;

        // k3 = f(t + 3h/4, y + 3h/4 k2)
        for i in 0..dim {
            self.tmp[i] = y[i] + 0.75 * h * self.k2[i];
        }
        DelayResolver::new(store, provisional, t0 + 0.75 * h, &record)
            .evaluate(system, &self.tmp, &mut self.k3)?;

        // y_new = y + h/9 (2 k1 + 3 k2 + 4 k3)
        let mut state = vec![0.0; dim];
        for i in 0..dim {
            state[i] = y[i] + h / 9.0 * (2.0 * k1[i] + 3.0 * self.k2[i] + 4.0 * self.k3[i]);
        }

        // k4 = f(t + h, y_new)
        let mut derivative = vec![0.0; dim];
        DelayResolver::new(store, provisional, t0 + h, &record)
            .evaluate(system, &state, &mut derivative)?;

        // y_new - y_low = h/72 (-5 k1 + 6 k2 + 8 k3 - 9 k4)
        let error = (0..dim)
            .map(|i| {
                h / 72.0
                    * (-5.0 * k1[i] + 6.0 * self.k2[i] + 8.0 * self.k3[i] - 9.0 * derivative[i])
            })
            .collect();

        Ok(TrialStep {
            t0,
            step,
            state,
            derivative,
            error,
            record: record.into_inner(),
        })
    }
}
