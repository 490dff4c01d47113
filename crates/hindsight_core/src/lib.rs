pub mod analysis;
pub mod anchors;
pub mod autodiff;
pub mod config;
pub mod controller;
pub mod discontinuities;
pub mod error;
pub mod hermite;
pub mod integrator;
pub mod lyapunov;
pub mod resolver;
pub mod solvers;
/// The `hindsight_core` crate integrates delay differential equations with an
/// adaptive embedded Runge-Kutta method. The past of the trajectory is kept as
/// anchors and reconstructed by cubic Hermite interpolation.
///
/// Key components:
/// - **Traits**: `Scalar` (numeric type abstraction), `DelaySystem` (right-hand sides), `Past` (delayed lookups).
/// - **Anchors & Hermite**: History storage and its piecewise cubic reconstruction.
/// - **Solvers & Controller**: Bogacki-Shampine trial steps, error control and delay-within-step iteration.
/// - **Integrator**: Past setup, stepping, dense output and history editing.
/// - **Autodiff & Lyapunov**: Dual numbers, `TangentSystem` and Lyapunov exponents over function segments.
pub mod traits;

pub use config::IntegratorSettings;
pub use error::{DdeError, Result};
pub use integrator::{AcceptedStep, DdeIntegrator};
