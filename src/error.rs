//! The error type shared by all components of the crate.
use std::fmt;
use thiserror::Error;

pub type Result<T, E = SystemError> = std::result::Result<T, E>;

/// Diagnostics for a single attempt at solving one time step.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptDiagnostics {
    pub algorithm: String,
    pub iterations: usize,
    pub residual_norm: f64,
    pub reason: String,
}

impl fmt::Display for AttemptDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} stopped after {} iterations with residual norm {:e}: {}",
            self.algorithm, self.iterations, self.residual_norm, self.reason
        )
    }
}

fn list_attempts(attempts: &[AttemptDiagnostics]) -> String {
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum SystemError {
    /// A build step was called out of order or with invalid input.
    #[error("precondition violated: {0}")]
    Precondition(String),
    /// Processes disagree about structural input such as dof types or adof ownership.
    #[error("parallel inconsistency: {0}")]
    ParallelInconsistency(String),
    #[error("time step {step} did not converge after {} attempts ({})", .attempts.len(), list_attempts(.attempts))]
    NotConverged {
        step: usize,
        attempts: Vec<AttemptDiagnostics>,
    },
    #[error("equation kernel failed: {0:#}")]
    Kernel(eyre::Report),
    #[error("linear solve failed: {0}")]
    LinearSolve(String),
    #[error("communication failed: {0}")]
    Communication(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint encoding failed: {0}")]
    Encoding(#[from] bincode::Error),
    #[error("invalid settings: {0}")]
    Settings(#[from] serde_json::Error),
}

impl SystemError {
    /// Whether the owning nonlinear iteration may recover from this error by retrying
    /// with another algorithm.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Kernel(_) | Self::LinearSolve(_))
    }

    pub(crate) fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }
}
