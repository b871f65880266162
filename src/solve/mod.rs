//! Nonlinear and time-stepping solvers driving an [`EquationModel`](crate::model::EquationModel).
pub mod nonlinear;
pub mod time;

pub use nonlinear::*;
pub use time::*;
