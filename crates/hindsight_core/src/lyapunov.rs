//! Lyapunov exponents of delay differential equations.
//!
//! Separation functions are integrated alongside the trajectory as an
//! augmented system (see [`TangentSystem`]) and re-orthonormalized after
//! every accepted step. The inner product of two separation functions is
//!
//! ```text
//! <g, h> = sum_i integral_{t - tau_max}^{t} g_i(s) h_i(s) ds
//! ```
//!
//! over their Hermite interpolants.

use crate::anchors::AnchorStore;
use crate::autodiff::TangentSystem;
use crate::config::IntegratorSettings;
use crate::error::{DdeError, Result};
use crate::hermite::block_product_integral;
use crate::integrator::{DdeIntegrator, IntegrationStats};
use crate::traits::{DelaySystem, JacobianProduct};
use nalgebra::{Cholesky, DMatrix};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Norms removed by one orthonormalization, i.e. the diagonal of `R` in
/// `G = R^T R`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Orthonormalization {
    pub norms: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LyapunovStep {
    pub t: f64,
    pub state: Vec<f64>,
    pub step: f64,
    pub passes: usize,
    /// `ln(R_kk) / step` for every separation function.
    pub local_exponents: Vec<f64>,
}

/// Result of [`LyapunovEngine::integrate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LyapunovSample {
    pub state: Vec<f64>,
    /// Time-weighted mean of the local exponents since the previous sample.
    pub exponents: Vec<f64>,
    /// Integration time the mean extends over.
    pub weight: f64,
}

/// Rewrites the separation components of every anchor in `store` so the
/// separation functions become orthonormal over `[t - window, t]`.
///
/// Anchors hold `dimension` main components followed by `separations`
/// blocks of `dimension` components each. With `window == 0` the inner
/// product is the Euclidean one of the newest tangent vectors.
pub fn orthonormalize(
    store: &mut AnchorStore,
    dimension: usize,
    separations: usize,
    window: f64,
) -> Result<Orthonormalization> {
    let gram = gram_matrix(store, dimension, separations, window)?;
    let cholesky = Cholesky::new(gram).ok_or_else(|| {
        DdeError::Degenerate("separation functions are linearly dependent.".into())
    })?;
    let r = cholesky.l().transpose();
    let norms: Vec<f64> = r.diagonal().iter().copied().collect();
    if let Some(bad) = norms.iter().find(|norm| !(norm.is_finite() && **norm > 0.0)) {
        return Err(DdeError::Degenerate(format!(
            "separation function has norm {bad}."
        )));
    }
    let r_inv = r.try_inverse().ok_or_else(|| {
        DdeError::Degenerate("triangular factor of the Gram matrix is singular.".into())
    })?;

    let mut old = vec![0.0; separations];
    for anchor in store.anchors_mut() {
        for values in [&mut anchor.state, &mut anchor.derivative] {
            for c in 0..dimension {
                for (j, slot) in old.iter_mut().enumerate() {
                    *slot = values[dimension * (j + 1) + c];
                }
                for k in 0..separations {
                    values[dimension * (k + 1) + c] =
                        (0..=k).map(|j| old[j] * r_inv[(j, k)]).sum();
                }
            }
        }
    }
    Ok(Orthonormalization { norms })
}

fn gram_matrix(
    store: &AnchorStore,
    dimension: usize,
    separations: usize,
    window: f64,
) -> Result<DMatrix<f64>> {
    let (Some(oldest), Some(newest)) = (store.first(), store.last()) else {
        return Err(DdeError::InsufficientHistory(
            "no anchors to orthonormalize.".into(),
        ));
    };
    if newest.dimension() != dimension * (separations + 1) {
        return Err(DdeError::InvalidConfiguration(format!(
            "anchors have {} components, expected {}.",
            newest.dimension(),
            dimension * (separations + 1)
        )));
    }

    let mut gram = DMatrix::zeros(separations, separations);
    let from = (newest.t - window).max(oldest.t);
    if window <= 0.0 || from >= newest.t {
        for j in 0..separations {
            for k in 0..=j {
                let product: f64 = (0..dimension)
                    .map(|c| {
                        newest.state[dimension * (j + 1) + c] * newest.state[dimension * (k + 1) + c]
                    })
                    .sum();
                gram[(j, k)] = product;
                gram[(k, j)] = product;
            }
        }
        return Ok(gram);
    }

    let anchors: Vec<_> = store.iter().collect();
    for pair in anchors.windows(2) {
        let (left, right) = (pair[0], pair[1]);
        if right.t <= from {
            continue;
        }
        let lower = left.t.max(from);
        for j in 0..separations {
            for k in 0..=j {
                let product = block_product_integral(
                    left,
                    right,
                    dimension * (j + 1),
                    dimension * (k + 1),
                    dimension,
                    lower,
                    right.t,
                );
                gram[(j, k)] += product;
                if j != k {
                    gram[(k, j)] += product;
                }
            }
        }
    }
    Ok(gram)
}

/// Integrates a system together with `separations` separation functions and
/// reports local Lyapunov exponents.
pub struct LyapunovEngine<S> {
    integrator: DdeIntegrator<TangentSystem<S>>,
    dimension: usize,
    separations: usize,
    rng: StdRng,
    orthonormalized: bool,
    weighted_sums: Vec<f64>,
    weight: f64,
}

impl<S> LyapunovEngine<S>
where
    S: DelaySystem<f64> + JacobianProduct,
{
    pub fn new(system: S, separations: usize, settings: IntegratorSettings) -> Result<Self> {
        if separations == 0 {
            return Err(DdeError::InvalidConfiguration(
                "at least one separation function is required.".into(),
            ));
        }
        let rng = match settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(1)),
            None => StdRng::from_entropy(),
        };
        let tangent = TangentSystem::new(system, separations);
        let dimension = tangent.dimension;
        let integrator = DdeIntegrator::new(tangent, settings)?;
        Ok(Self {
            integrator,
            dimension,
            separations,
            rng,
            orthonormalized: false,
            weighted_sums: vec![0.0; separations],
            weight: 0.0,
        })
    }

    pub fn integrator(&self) -> &DdeIntegrator<TangentSystem<S>> {
        &self.integrator
    }

    pub fn stats(&self) -> IntegrationStats {
        self.integrator.stats()
    }

    pub fn t(&self) -> Option<f64> {
        self.integrator.t()
    }

    /// Main components of the newest anchor.
    pub fn state(&self) -> Option<&[f64]> {
        self.integrator
            .state()
            .map(|state| &state[..self.dimension])
    }

    /// Adds a past point with random separation components.
    pub fn add_past_point(&mut self, t: f64, state: &[f64], derivative: &[f64]) -> Result<()> {
        let state = self.augment(state)?;
        let derivative = self.augment(derivative)?;
        self.orthonormalized = false;
        self.integrator.add_past_point(t, &state, &derivative)
    }

    /// Constant past for the main components, random separation functions.
    pub fn constant_past(&mut self, state: &[f64], time: f64) -> Result<()> {
        let span = if self.integrator.max_delay() > 0.0 {
            self.integrator.max_delay()
        } else {
            self.integrator.settings().first_step
        };
        let zeros = vec![0.0; state.len()];
        self.add_past_point(time - span, state, &zeros)?;
        self.add_past_point(time, state, &zeros)
    }

    /// Performs one adaptive step and re-orthonormalizes the separation
    /// functions.
    pub fn step(&mut self) -> Result<LyapunovStep> {
        self.ensure_orthonormal()?;
        let accepted = self.integrator.step()?;
        let orthonormalization = self.orthonormalize()?;
        let local_exponents: Vec<f64> = orthonormalization
            .norms
            .iter()
            .map(|norm| norm.ln() / accepted.step)
            .collect();
        for (sum, exponent) in self.weighted_sums.iter_mut().zip(&local_exponents) {
            *sum += exponent * accepted.step;
        }
        self.weight += accepted.step;
        trace!(t = accepted.t, ?local_exponents, "local Lyapunov exponents");
        Ok(LyapunovStep {
            t: accepted.t,
            state: accepted.state[..self.dimension].to_vec(),
            step: accepted.step,
            passes: accepted.passes,
            local_exponents,
        })
    }

    /// Integrates until `target` is covered. Returns the interpolated state
    /// at `target` and the mean exponents since the previous call.
    pub fn integrate(&mut self, target: f64) -> Result<LyapunovSample> {
        loop {
            let t = self.integrator.t().ok_or_else(|| {
                DdeError::InsufficientHistory("history is empty.".into())
            })?;
            if t >= target {
                break;
            }
            self.step()?;
        }
        let (state, _) = self.integrator.dense_output(target)?;
        let exponents = if self.weight > 0.0 {
            self.weighted_sums.iter().map(|sum| sum / self.weight).collect()
        } else {
            vec![0.0; self.separations]
        };
        let weight = self.weight;
        self.weighted_sums.iter_mut().for_each(|sum| *sum = 0.0);
        self.weight = 0.0;
        Ok(LyapunovSample {
            state: state[..self.dimension].to_vec(),
            exponents,
            weight,
        })
    }

    fn augment(&mut self, main: &[f64]) -> Result<Vec<f64>> {
        if main.len() != self.dimension {
            return Err(DdeError::InvalidConfiguration(format!(
                "dimension mismatch. Expected {}, got {}.",
                self.dimension,
                main.len()
            )));
        }
        let mut augmented = main.to_vec();
        augmented.extend((0..self.dimension * self.separations).map(|_| self.rng.gen_range(-1.0..1.0)));
        Ok(augmented)
    }

    fn ensure_orthonormal(&mut self) -> Result<()> {
        if !self.orthonormalized {
            self.orthonormalize()?;
            self.orthonormalized = true;
        }
        Ok(())
    }

    fn orthonormalize(&mut self) -> Result<Orthonormalization> {
        let window = self.integrator.max_delay();
        orthonormalize(
            self.integrator.anchors_mut(),
            self.dimension,
            self.separations,
            window,
        )
    }
}
