use crate::lyapunov::LyapunovEngine;
use crate::traits::{DelaySystem, JacobianProduct};
use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing::debug;

/// Lyapunov exponents averaged over a sampled run.
#[derive(Debug, Clone, Serialize)]
pub struct LyapunovSummary {
    /// Time-weighted means, in the order of the separation functions.
    pub exponents: Vec<f64>,
    /// Standard errors of the per-sample means; zero with fewer than two
    /// samples.
    pub standard_errors: Vec<f64>,
    pub samples: usize,
    /// Integration time the means extend over.
    pub duration: f64,
    pub kaplan_yorke: f64,
}

/// Integrates `engine` for `transient` without recording, then for
/// `duration` in samples of length `sampling`, and averages the exponents.
///
/// The engine's past must already be set up.
pub fn lyapunov_spectrum<S>(
    engine: &mut LyapunovEngine<S>,
    transient: f64,
    duration: f64,
    sampling: f64,
) -> Result<LyapunovSummary>
where
    S: DelaySystem<f64> + JacobianProduct,
{
    if !(transient.is_finite() && transient >= 0.0) {
        bail!("Transient duration must be finite and non-negative.");
    }
    if !(duration.is_finite() && duration > 0.0) {
        bail!("Duration must be finite and positive.");
    }
    if !(sampling.is_finite() && sampling > 0.0) {
        bail!("Sampling interval must be finite and positive.");
    }
    let start = engine
        .t()
        .context("Set up the past before computing Lyapunov exponents.")?;

    let settled = start + transient;
    engine
        .integrate(settled)
        .with_context(|| format!("Integration failed during the transient up to t={settled}."))?;

    let count = (duration / sampling).ceil().max(1.0) as usize;
    let mut samples: Vec<Vec<f64>> = Vec::with_capacity(count);
    let mut weighted = Vec::new();
    let mut total_weight = 0.0;
    for i in 1..=count {
        let target = settled + duration * i as f64 / count as f64;
        let sample = engine
            .integrate(target)
            .with_context(|| format!("Integration failed while sampling up to t={target}."))?;
        if sample.weight <= 0.0 {
            continue;
        }
        if weighted.is_empty() {
            weighted = vec![0.0; sample.exponents.len()];
        }
        for (sum, exponent) in weighted.iter_mut().zip(&sample.exponents) {
            *sum += exponent * sample.weight;
        }
        total_weight += sample.weight;
        samples.push(sample.exponents);
    }
    if total_weight <= 0.0 {
        bail!("No integration steps were taken; cannot normalize exponents.");
    }

    let exponents: Vec<f64> = weighted.iter().map(|sum| sum / total_weight).collect();
    let standard_errors = standard_errors(&samples, exponents.len());
    debug!(?exponents, samples = samples.len(), "Lyapunov spectrum");
    Ok(LyapunovSummary {
        kaplan_yorke: kaplan_yorke(&exponents),
        exponents,
        standard_errors,
        samples: samples.len(),
        duration: total_weight,
    })
}

fn standard_errors(samples: &[Vec<f64>], len: usize) -> Vec<f64> {
    let n = samples.len();
    if n < 2 {
        return vec![0.0; len];
    }
    (0..len)
        .map(|k| {
            let mean = samples.iter().map(|s| s[k]).sum::<f64>() / n as f64;
            let variance = samples
                .iter()
                .map(|s| (s[k] - mean).powi(2))
                .sum::<f64>()
                / (n - 1) as f64;
            (variance / n as f64).sqrt()
        })
        .collect()
}

/// Kaplan-Yorke dimension `j + S_j / |lambda_{j+1}|` of a Lyapunov spectrum
/// given in any order, `j` being the largest count of leading exponents with
/// a non-negative sum `S_j`.
pub fn kaplan_yorke(exponents: &[f64]) -> f64 {
    let mut descending = exponents.to_vec();
    descending.sort_by(|a, b| b.total_cmp(a));

    let mut volume_rate = 0.0;
    let mut expanding = 0;
    while expanding < descending.len() && volume_rate + descending[expanding] >= 0.0 {
        volume_rate += descending[expanding];
        expanding += 1;
    }
    match descending.get(expanding) {
        Some(next) if next.abs() > f64::EPSILON => expanding as f64 + volume_rate / next.abs(),
        _ => expanding as f64,
    }
}
