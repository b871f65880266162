//! Sparse linear operators, Krylov solvers and a geometric multigrid preconditioner.
//!
//! Everything here works on process-local data. Distributed systems are gathered before they
//! reach this crate.

pub mod bicgstab;
pub mod cg;
pub mod multigrid;
pub mod operator;

pub use nalgebra_sparse::{CooMatrix, CsrMatrix};
pub use operator::{IdentityOperator, JacobiPreconditioner, LinearOperator, OperatorError};
