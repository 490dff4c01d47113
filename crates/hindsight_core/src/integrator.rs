//! Driver owning the history and step-size state of one integration.

use crate::anchors::{Anchor, AnchorStore};
use crate::config::IntegratorSettings;
use crate::controller::{StepController, StepReport};
use crate::discontinuities::DiscontinuityScheduler;
use crate::error::{DdeError, Result};
use crate::hermite;
use crate::resolver::{DelayResolver, PassRecord};
use crate::traits::{longest_delay, shortest_delay, DelaySystem};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use tracing::{debug, trace};

pub use crate::controller::IntegrationStats;

/// Summary of an accepted and committed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptedStep {
    pub t: f64,
    pub state: Vec<f64>,
    pub step: f64,
    /// Passes of the within-step iteration; 1 when no delay reached into
    /// the step.
    pub passes: usize,
    pub scaled_error: f64,
    pub landed_on_discontinuity: bool,
}

/// Adaptive integrator for a delay differential equation.
///
/// Set up the past with [`add_past_point`](Self::add_past_point),
/// [`constant_past`](Self::constant_past) or
/// [`past_from_function`](Self::past_from_function), then advance with
/// [`step`](Self::step) or [`integrate`](Self::integrate).
pub struct DdeIntegrator<S> {
    system: S,
    store: AnchorStore,
    controller: StepController,
    delays: Vec<f64>,
    max_delay: f64,
    dimension: usize,
}

impl<S> DdeIntegrator<S>
where
    S: DelaySystem<f64>,
{
    pub fn new(system: S, settings: IntegratorSettings) -> Result<Self> {
        settings.validate()?;
        let dimension = system.dimension();
        if dimension == 0 {
            return Err(DdeError::InvalidConfiguration(
                "system must have positive dimension.".into(),
            ));
        }
        let delays = system.delays();
        if let Some(bad) = delays.iter().find(|d| !(d.is_finite() && **d >= 0.0)) {
            return Err(DdeError::InvalidConfiguration(format!(
                "delays must be finite and non-negative (got {bad})."
            )));
        }
        let max_delay = settings.max_delay.unwrap_or_else(|| longest_delay(&delays));
        let controller = StepController::new(settings, dimension, shortest_delay(&delays));
        Ok(Self {
            system,
            store: AnchorStore::new(),
            controller,
            delays,
            max_delay,
            dimension,
        })
    }

    pub fn system(&self) -> &S {
        &self.system
    }

    pub fn settings(&self) -> &IntegratorSettings {
        self.controller.settings()
    }

    pub fn anchors(&self) -> &AnchorStore {
        &self.store
    }

    pub(crate) fn anchors_mut(&mut self) -> &mut AnchorStore {
        &mut self.store
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn max_delay(&self) -> f64 {
        self.max_delay
    }

    /// Time of the newest anchor.
    pub fn t(&self) -> Option<f64> {
        self.store.last().map(|anchor| anchor.t)
    }

    /// State at the newest anchor.
    pub fn state(&self) -> Option<&[f64]> {
        self.store.last().map(|anchor| anchor.state.as_slice())
    }

    /// Step size the next attempt starts from.
    pub fn step_size(&self) -> f64 {
        self.controller.size().step()
    }

    pub fn set_step_size(&mut self, step: f64) {
        self.controller.set_step(step);
    }

    pub fn stats(&self) -> IntegrationStats {
        self.controller.stats()
    }

    pub fn scheduler(&self) -> Option<&DiscontinuityScheduler> {
        self.controller.scheduler()
    }

    pub fn add_past_point(&mut self, t: f64, state: &[f64], derivative: &[f64]) -> Result<()> {
        self.check_dimension(state.len())?;
        self.check_dimension(derivative.len())?;
        self.store
            .append(Anchor::new(t, state.to_vec(), derivative.to_vec()))
    }

    /// Adds a constant past ending at `time`. The two anchors span the
    /// largest delay, or the first step if there is no delay.
    pub fn constant_past(&mut self, state: &[f64], time: f64) -> Result<()> {
        let span = if self.max_delay > 0.0 {
            self.max_delay
        } else {
            self.settings().first_step
        };
        let zeros = vec![0.0; state.len()];
        self.add_past_point(time - span, state, &zeros)?;
        self.add_past_point(time, state, &zeros)
    }

    /// Samples `function` at `times` for the past. `function` returns the
    /// state and its derivative.
    pub fn past_from_function<F>(&mut self, mut function: F, times: &[f64]) -> Result<()>
    where
        F: FnMut(f64) -> (Vec<f64>, Vec<f64>),
    {
        let mut sorted = times.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        for t in sorted {
            let (state, derivative) = function(t);
            self.add_past_point(t, &state, &derivative)?;
        }
        Ok(())
    }

    /// Empties the history. Discontinuities are predicted anew from the
    /// next past that is set up.
    pub fn purge_past(&mut self) {
        self.store.clear();
        self.controller.set_scheduler(None);
    }

    /// State and derivative reconstructed at `t` from the retained history.
    pub fn dense_output(&self, t: f64) -> Result<(Vec<f64>, Vec<f64>)> {
        let newest = self.newest()?;
        if t > newest.t {
            return Err(DdeError::InsufficientHistory(format!(
                "t={t} lies after the newest anchor at t={}.",
                newest.t
            )));
        }
        Ok(hermite::evaluate(&self.store.bracket(t)?, t))
    }

    /// Performs one adaptive step and commits it.
    pub fn step(&mut self) -> Result<AcceptedStep> {
        self.ensure_scheduler()?;
        let report = self.controller.advance(&self.system, &self.store)?;
        self.commit(report)
    }

    /// Integrates until the history covers `target` and returns the state
    /// there.
    pub fn integrate(&mut self, target: f64) -> Result<Vec<f64>> {
        while self.newest()?.t < target {
            self.step()?;
        }
        let (state, _) = self.dense_output(target)?;
        Ok(state)
    }

    /// Integrates to `target` with equal steps no longer than `step` and
    /// without error control.
    pub fn integrate_blindly(&mut self, target: f64, step: f64) -> Result<Vec<f64>> {
        if !(step.is_finite() && step > 0.0) {
            return Err(DdeError::InvalidConfiguration(format!(
                "blind step size must be finite and positive (got {step})."
            )));
        }
        let t = self.newest()?.t;
        if target <= t {
            let (state, _) = self.dense_output(target)?;
            return Ok(state);
        }
        let count = ((target - t) / step).ceil().max(1.0) as usize;
        let step = (target - t) / count as f64;
        for _ in 0..count {
            let report = self
                .controller
                .advance_blindly(&self.system, &self.store, step)?;
            self.commit(report)?;
        }
        self.state()
            .map(<[f64]>::to_vec)
            .ok_or_else(|| DdeError::InsufficientHistory("history is empty.".into()))
    }

    /// Re-evaluates the derivative at the newest anchor. The previous
    /// derivative is kept on a copy of the anchor placed `shift_ratio` of the
    /// last anchor gap earlier, so the history becomes smooth at the newest
    /// anchor without changing any state.
    pub fn adjust_diff(&mut self, shift_ratio: f64) -> Result<()> {
        if !(shift_ratio > 0.0 && shift_ratio < 1.0) {
            return Err(DdeError::InvalidConfiguration(format!(
                "shift_ratio must lie in (0, 1) (got {shift_ratio})."
            )));
        }
        self.newest()?;
        let newest = self
            .store
            .pop_last()
            .ok_or_else(|| DdeError::InsufficientHistory("history is empty.".into()))?;
        let gap = match self.store.last() {
            Some(previous) => newest.t - previous.t,
            None => 0.0,
        };
        let shifted = Anchor::new(
            newest.t - shift_ratio * gap,
            newest.state.clone(),
            newest.derivative.clone(),
        );
        self.store.append(shifted)?;

        let record = RefCell::new(PassRecord::default());
        let mut derivative = vec![0.0; self.dimension];
        let evaluated = DelayResolver::new(&self.store, Some(&newest), newest.t, &record)
            .evaluate(&self.system, &newest.state, &mut derivative);
        if let Err(error) = evaluated {
            self.store.pop_last();
            self.store.append(newest)?;
            return Err(error);
        }
        debug!(t = newest.t, gap, "adjusted derivative at newest anchor");
        self.store
            .append(Anchor::new(newest.t, newest.state, derivative))
    }

    /// Discards the history after `t` and ends it with the reconstructed
    /// anchor at `t`.
    pub fn truncate(&mut self, t: f64) -> Result<()> {
        let (state, derivative) = self.dense_output(t)?;
        self.store.truncate_after(t);
        if self.t().map_or(true, |newest| newest < t) {
            self.store.append(Anchor::new(t, state, derivative))?;
        }
        Ok(())
    }

    fn commit(&mut self, report: StepReport) -> Result<AcceptedStep> {
        let accepted = AcceptedStep {
            t: report.anchor.t,
            state: report.anchor.state.clone(),
            step: report.step,
            passes: report.passes,
            scaled_error: report.scaled_error,
            landed_on_discontinuity: report.landed_on_discontinuity,
        };
        self.store.append(report.anchor)?;
        let pruned = self.store.prune(accepted.t - self.max_delay);
        trace!(
            t = accepted.t,
            step = accepted.step,
            passes = accepted.passes,
            pruned,
            "step accepted"
        );
        Ok(accepted)
    }

    fn ensure_scheduler(&mut self) -> Result<()> {
        let settings = self.controller.settings();
        if !settings.step_on_discontinuities || self.controller.scheduler().is_some() {
            return Ok(());
        }
        let start = self.newest()?.t;
        let scheduler = DiscontinuityScheduler::new(
            start,
            &self.delays,
            settings.discontinuity_order,
            settings.discontinuity_min_distance,
        );
        debug!(
            start,
            count = scheduler.times().len(),
            "predicted derivative discontinuities"
        );
        self.controller.set_scheduler(Some(scheduler));
        Ok(())
    }

    fn newest(&self) -> Result<&Anchor> {
        if self.store.len() < 2 {
            return Err(DdeError::InsufficientHistory(format!(
                "at least two anchors are required, {} available.",
                self.store.len()
            )));
        }
        self.store
            .last()
            .ok_or_else(|| DdeError::InsufficientHistory("history is empty.".into()))
    }

    fn check_dimension(&self, len: usize) -> Result<()> {
        if len != self.dimension {
            return Err(DdeError::InvalidConfiguration(format!(
                "dimension mismatch. Expected {}, got {}.",
                self.dimension, len
            )));
        }
        Ok(())
    }
}
