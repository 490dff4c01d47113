//! Resolution of delayed arguments during derivative evaluation.
//!
//! Lookups at or before the newest committed anchor are plain Hermite
//! interpolations. Lookups after it reach into the step currently being
//! computed: without a provisional end point they extrapolate the two newest
//! anchors, with one they interpolate between the newest anchor and the
//! provisional end point. The fixed-point loop over such passes lives in the
//! step controller; this module only records what each pass saw.

use crate::anchors::{Anchor, AnchorStore, Bracket, BracketKind};
use crate::error::{DdeError, Result};
use crate::hermite::component_at;
use crate::traits::{DelaySystem, Past};
use std::cell::RefCell;

/// Lookups that reached into the current step during one pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassRecord {
    /// Shortest delay whose lookup fell after the newest anchor.
    pub shortest_within_step: Option<f64>,
    /// Values returned by those lookups, in request order.
    pub within_step_values: Vec<f64>,
    pub evaluations: usize,
}

impl PassRecord {
    pub fn reached_into_step(&self) -> bool {
        self.shortest_within_step.is_some()
    }

    fn note(&mut self, delay: f64, value: f64) {
        self.shortest_within_step = Some(match self.shortest_within_step {
            Some(shortest) => shortest.min(delay),
            None => delay,
        });
        self.within_step_values.push(value);
    }

    /// Whether two passes saw the same within-step values up to
    /// `atol + rtol * |value|` per entry.
    pub fn agrees_with(&self, other: &PassRecord, atol: f64, rtol: f64) -> bool {
        self.within_step_values.len() == other.within_step_values.len()
            && self
                .within_step_values
                .iter()
                .zip(&other.within_step_values)
                .all(|(old, new)| (new - old).abs() <= atol + rtol * new.abs())
    }
}

/// `Past` implementation for one derivative evaluation at time `t`.
pub struct DelayResolver<'a> {
    store: &'a AnchorStore,
    provisional: Option<&'a Anchor>,
    t: f64,
    record: &'a RefCell<PassRecord>,
}

impl<'a> DelayResolver<'a> {
    pub fn new(
        store: &'a AnchorStore,
        provisional: Option<&'a Anchor>,
        t: f64,
        record: &'a RefCell<PassRecord>,
    ) -> Self {
        Self {
            store,
            provisional,
            t,
            record,
        }
    }

    /// Evaluates `system` at `(t, y)` with delayed arguments resolved
    /// through this resolver.
    pub fn evaluate<S>(&self, system: &S, y: &[f64], out: &mut [f64]) -> Result<()>
    where
        S: DelaySystem<f64> + ?Sized,
    {
        self.record.borrow_mut().evaluations += 1;
        system.apply(self.t, y, self, out)?;
        if let Some(idx) = out.iter().position(|v| !v.is_finite()) {
            return Err(DdeError::Degenerate(format!(
                "derivative component {idx} is not finite at t={}.",
                self.t
            )));
        }
        Ok(())
    }

    fn lookup(&self, delay: f64, component: usize) -> Result<(f64, f64, bool)> {
        if !(delay.is_finite() && delay >= 0.0) {
            return Err(DdeError::InvalidConfiguration(format!(
                "delays must be finite and non-negative (got {delay})."
            )));
        }
        let newest = self.store.last().ok_or_else(|| {
            DdeError::InsufficientHistory("no anchors to resolve delays from.".into())
        })?;
        if component >= newest.dimension() {
            return Err(DdeError::InvalidConfiguration(format!(
                "component {component} requested from a {}-dimensional history.",
                newest.dimension()
            )));
        }

        let query = self.t - delay;
        if query <= newest.t {
            let (value, slope) = component_at(&self.store.bracket(query)?, query, component);
            return Ok((value, slope, false));
        }

        let (value, slope) = match self.provisional {
            Some(end) => {
                let bracket = if query == end.t {
                    Bracket {
                        left: end,
                        right: end,
                        kind: BracketKind::Exact,
                    }
                } else {
                    Bracket {
                        left: newest,
                        right: end,
                        kind: if query < end.t {
                            BracketKind::Interpolation
                        } else {
                            BracketKind::Extrapolation
                        },
                    }
                };
                component_at(&bracket, query, component)
            }
            None => component_at(&self.store.bracket(query)?, query, component),
        };
        Ok((value, slope, true))
    }

    fn resolve(&self, delay: f64, component: usize, slope_wanted: bool) -> Result<f64> {
        let (value, slope, within_step) = self.lookup(delay, component)?;
        let resolved = if slope_wanted { slope } else { value };
        if within_step {
            self.record.borrow_mut().note(delay, resolved);
        }
        Ok(resolved)
    }
}

impl Past<f64> for DelayResolver<'_> {
    fn state(&self, delay: f64, component: usize) -> Result<f64> {
        self.resolve(delay, component, false)
    }

    fn derivative(&self, delay: f64, component: usize) -> Result<f64> {
        self.resolve(delay, component, true)
    }
}
