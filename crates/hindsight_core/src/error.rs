//! Error types for DDE integration.
//!
//! Step rejections and within-step non-convergence are normally recovered by
//! the step controller; they only surface here once the step size would drop
//! below `min_step`.

/// Errors raised by the integration core.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DdeError {
    /// Fewer than two anchors, or a lookup reaching before the oldest anchor.
    #[error("insufficient history: {0}")]
    InsufficientHistory(String),

    /// The delay-within-step iteration did not converge and the step size
    /// cannot be reduced any further.
    #[error(
        "delay-within-step iteration did not converge at t={t} (step={step:.3e}, passes={passes})"
    )]
    NonConvergence { t: f64, step: f64, passes: usize },

    /// The local error estimate stayed above tolerance down to `min_step`.
    #[error("step rejected at t={t} (step={step:.3e}, scaled error={error:.3e})")]
    StepRejected { t: f64, step: f64, error: f64 },

    /// Settings, past points, dimensions or delays are malformed.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Numerical breakdown: non-finite evaluator output or linearly
    /// dependent separation functions.
    #[error("numerical breakdown: {0}")]
    Degenerate(String),
}

impl DdeError {
    /// Whether the step controller may recover from this error by shrinking
    /// the step size.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DdeError::NonConvergence { .. } | DdeError::StepRejected { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, DdeError>;
