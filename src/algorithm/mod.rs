//! Solvers built on the expression graph
//!
//! Nothing in here talks to a backend directly except the triangular solve,
//! which launches its dedicated kernel. The iterative methods compose
//! expressions and let the dispatcher lower them, so they run unchanged on
//! every context.

pub mod iterative;
pub mod triangular;

pub use iterative::{
    BiCgStabOptions, CancellationToken, CgOptions, EigenOptions, GmresOptions, GmresResult,
    LanczosResult, PowerIterationResult, SolveResult, SolverControl, SolverStatus, bicgstab, cg,
    gmres, lanczos, power_iteration,
};
pub use triangular::solve_triangular;
