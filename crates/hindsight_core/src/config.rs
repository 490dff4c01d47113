use crate::error::{DdeError, Result};
use serde::{Deserialize, Serialize};

/// Settings controlling adaptive DDE integration.
///
/// All fields have defaults, so partial documents deserialize cleanly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IntegratorSettings {
    pub atol: f64,
    pub rtol: f64,
    pub first_step: f64,
    pub min_step: f64,
    pub max_step: f64,
    pub safety_factor: f64,
    pub min_factor: f64,
    pub max_factor: f64,
    /// Scaled error below which the step size may grow.
    pub increase_threshold: f64,
    pub pws_atol: f64,
    pub pws_rtol: f64,
    pub pws_max_iterations: usize,
    pub pws_factor: f64,
    /// Pass count up to which an iteration counts as cheap for step growth.
    pub pws_iteration_threshold: usize,
    pub pws_base_increase_chance: f64,
    pub pws_fuzzy_increase: bool,
    /// Overrides the largest delay reported by the system.
    pub max_delay: Option<f64>,
    pub step_on_discontinuities: bool,
    pub discontinuity_order: usize,
    pub discontinuity_min_distance: f64,
    pub seed: Option<u64>,
}

impl Default for IntegratorSettings {
    fn default() -> Self {
        Self {
            atol: 1e-10,
            rtol: 1e-5,
            first_step: 1.0,
            min_step: 1e-10,
            max_step: 10.0,
            safety_factor: 0.9,
            min_factor: 0.2,
            max_factor: 5.0,
            increase_threshold: 0.5,
            pws_atol: 0.0,
            pws_rtol: 1e-5,
            pws_max_iterations: 10,
            pws_factor: 3.0,
            pws_iteration_threshold: 2,
            pws_base_increase_chance: 0.1,
            pws_fuzzy_increase: false,
            max_delay: None,
            step_on_discontinuities: false,
            discontinuity_order: 2,
            discontinuity_min_distance: 1e-5,
            seed: None,
        }
    }
}

impl IntegratorSettings {
    pub fn validate(&self) -> Result<()> {
        non_negative("atol", self.atol)?;
        non_negative("rtol", self.rtol)?;
        if self.atol == 0.0 && self.rtol == 0.0 {
            return Err(invalid("atol and rtol cannot both be zero."));
        }
        positive("min_step", self.min_step)?;
        positive("first_step", self.first_step)?;
        positive("max_step", self.max_step)?;
        if self.min_step > self.max_step {
            return Err(invalid(format!(
                "min_step ({}) exceeds max_step ({}).",
                self.min_step, self.max_step
            )));
        }
        if !(self.safety_factor > 0.0 && self.safety_factor <= 1.0) {
            return Err(invalid("safety_factor must lie in (0, 1]."));
        }
        if !(self.min_factor > 0.0 && self.min_factor < 1.0) {
            return Err(invalid("min_factor must lie in (0, 1)."));
        }
        if !(self.max_factor.is_finite() && self.max_factor > 1.0) {
            return Err(invalid("max_factor must be finite and greater than 1."));
        }
        positive("increase_threshold", self.increase_threshold)?;
        non_negative("pws_atol", self.pws_atol)?;
        non_negative("pws_rtol", self.pws_rtol)?;
        if self.pws_max_iterations == 0 {
            return Err(invalid("pws_max_iterations must be at least 1."));
        }
        if !(self.pws_factor.is_finite() && self.pws_factor > 1.0) {
            return Err(invalid("pws_factor must be finite and greater than 1."));
        }
        if !(0.0..=1.0).contains(&self.pws_base_increase_chance) {
            return Err(invalid("pws_base_increase_chance must lie in [0, 1]."));
        }
        if let Some(max_delay) = self.max_delay {
            non_negative("max_delay", max_delay)?;
        }
        if self.step_on_discontinuities && self.discontinuity_order == 0 {
            return Err(invalid("discontinuity_order must be at least 1."));
        }
        non_negative("discontinuity_min_distance", self.discontinuity_min_distance)?;
        Ok(())
    }

    /// Clamps a step size into `[min_step, max_step]`.
    pub fn clamp_step(&self, step: f64) -> f64 {
        step.max(self.min_step).min(self.max_step)
    }
}

fn invalid(message: impl Into<String>) -> DdeError {
    DdeError::InvalidConfiguration(message.into())
}

fn positive(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(invalid(format!("{name} must be finite and positive (got {value}).")))
    }
}

fn non_negative(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(invalid(format!("{name} must be finite and non-negative (got {value}).")))
    }
}
