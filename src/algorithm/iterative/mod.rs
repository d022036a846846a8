//! Iterative solvers for linear systems and eigenvalue estimators
//!
//! # Linear solvers
//!
//! - **CG** - Conjugate Gradient for symmetric positive definite systems
//! - **BiCGSTAB** - Bi-Conjugate Gradient Stabilized for non-symmetric systems
//! - **GMRES(m)** - Generalized Minimal Residual with restarts
//!
//! # Eigenvalue estimators
//!
//! - **Power iteration** - dominant eigenvalue and eigenvector
//! - **Lanczos** - extreme eigenvalues of symmetric operators
//!
//! # Architecture
//!
//! Solvers are composite operations: every step is an expression built from
//! products, dot products and elementwise updates, lowered by the dispatcher
//! onto the operator's context. The same code runs on every backend.
//!
//! All solvers share one state machine:
//! `Initialized -> Iterating -> {Converged, MaxIterationsExceeded, Cancelled}`,
//! with a non-finite residual aborting as `NumericalDivergence`.

mod bicgstab;
mod cg;
mod eigen;
mod gmres;
mod helpers;
mod types;

pub use bicgstab::bicgstab;
pub use cg::cg;
pub use eigen::{lanczos, power_iteration};
pub use gmres::gmres;
pub use helpers::{givens_rotation, solve_upper_triangular, tridiagonal_eigenvalues};
pub use types::{
    BiCgStabOptions, CancellationToken, CgOptions, EigenOptions, GmresOptions, GmresResult,
    LanczosResult, PowerIterationResult, SolveResult, SolverControl, SolverStatus,
};
