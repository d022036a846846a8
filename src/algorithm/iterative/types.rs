//! Options and result types for the iterative solvers and eigen estimators

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::config::SolverDefaults;
use crate::container::Vector;

// ============================================================================
// Termination
// ============================================================================

/// Terminal state of a solver run
///
/// Divergence is not a status: a non-finite residual aborts the solve with
/// [`crate::error::Error::NumericalDivergence`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverStatus {
    /// `||r|| <= max(tol * ||b||, atol)` (or the estimate stabilised)
    Converged,
    /// Iteration budget spent; the result carries the best iterate
    MaxIterationsExceeded,
    /// Cancellation token or timeout observed between iterations
    Cancelled,
}

impl SolverStatus {
    /// Returns true for [`SolverStatus::Converged`]
    #[inline]
    pub fn is_converged(&self) -> bool {
        matches!(self, SolverStatus::Converged)
    }
}

impl fmt::Display for SolverStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolverStatus::Converged => write!(f, "converged"),
            SolverStatus::MaxIterationsExceeded => write!(f, "max iterations exceeded"),
            SolverStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Shared flag a caller sets to stop a running solver
///
/// Solvers poll the token between iterations only.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    /// A token that has not been cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Cancellation and wall-clock limits shared by every solver
#[derive(Debug, Clone, Default)]
pub struct SolverControl {
    /// Stop when this token is cancelled
    pub cancel: Option<CancellationToken>,
    /// Stop once this much time has passed since the solve started
    pub timeout: Option<Duration>,
}

impl SolverControl {
    pub(crate) fn start(&self) -> Watchdog<'_> {
        Watchdog {
            control: self,
            started: Instant::now(),
        }
    }
}

/// Running view of a [`SolverControl`]
pub(crate) struct Watchdog<'a> {
    control: &'a SolverControl,
    started: Instant,
}

impl Watchdog<'_> {
    pub(crate) fn should_stop(&self) -> bool {
        if let Some(token) = &self.control.cancel {
            if token.is_cancelled() {
                return true;
            }
        }
        match self.control.timeout {
            Some(limit) => self.started.elapsed() >= limit,
            None => false,
        }
    }
}

// ============================================================================
// Linear solvers
// ============================================================================

/// Configuration options for the CG solver
#[derive(Debug, Clone)]
pub struct CgOptions {
    /// Maximum number of iterations (default: 1000)
    pub max_iter: usize,
    /// Relative tolerance on `||r|| / ||b||` (default: 1e-8)
    pub rtol: f64,
    /// Absolute tolerance on `||r||` (default: 0)
    pub atol: f64,
    /// Record the residual norm of every iteration (default: false)
    pub track_residual_history: bool,
    /// Cancellation and timeout
    pub control: SolverControl,
}

impl Default for CgOptions {
    fn default() -> Self {
        Self::from(&SolverDefaults::default())
    }
}

impl From<&SolverDefaults> for CgOptions {
    fn from(defaults: &SolverDefaults) -> Self {
        Self {
            max_iter: defaults.max_iterations,
            rtol: defaults.tolerance,
            atol: 0.0,
            track_residual_history: defaults.record_history,
            control: SolverControl::default(),
        }
    }
}

/// Configuration options for the BiCGSTAB solver
#[derive(Debug, Clone)]
pub struct BiCgStabOptions {
    /// Maximum number of iterations (default: 1000)
    pub max_iter: usize,
    /// Relative tolerance (default: 1e-8)
    pub rtol: f64,
    /// Absolute tolerance (default: 0)
    pub atol: f64,
    /// Record the residual norm of every iteration (default: false)
    pub track_residual_history: bool,
    /// Cancellation and timeout
    pub control: SolverControl,
}

impl Default for BiCgStabOptions {
    fn default() -> Self {
        Self::from(&SolverDefaults::default())
    }
}

impl From<&SolverDefaults> for BiCgStabOptions {
    fn from(defaults: &SolverDefaults) -> Self {
        Self {
            max_iter: defaults.max_iterations,
            rtol: defaults.tolerance,
            atol: 0.0,
            track_residual_history: defaults.record_history,
            control: SolverControl::default(),
        }
    }
}

/// Configuration options for the GMRES solver
#[derive(Debug, Clone)]
pub struct GmresOptions {
    /// Maximum number of iterations, counted across restarts (default: 1000)
    pub max_iter: usize,
    /// Restart parameter m: Krylov basis size before restart (default: 30)
    pub restart: usize,
    /// Relative tolerance (default: 1e-8)
    pub rtol: f64,
    /// Absolute tolerance (default: 0)
    pub atol: f64,
    /// Record the residual norm of every iteration (default: false)
    pub track_residual_history: bool,
    /// Cancellation and timeout
    pub control: SolverControl,
}

impl Default for GmresOptions {
    fn default() -> Self {
        Self::from(&SolverDefaults::default())
    }
}

impl From<&SolverDefaults> for GmresOptions {
    fn from(defaults: &SolverDefaults) -> Self {
        Self {
            max_iter: defaults.max_iterations,
            restart: defaults.gmres_restart,
            rtol: defaults.tolerance,
            atol: 0.0,
            track_residual_history: defaults.record_history,
            control: SolverControl::default(),
        }
    }
}

/// Result of a linear solve
#[derive(Debug, Clone)]
pub struct SolveResult {
    /// Solution vector x such that Ax ≈ b (the best iterate when not converged)
    pub solution: Vector,
    /// Why the solver stopped
    pub status: SolverStatus,
    /// Shorthand for `status == Converged`
    pub converged: bool,
    /// Number of iterations performed
    pub iterations: usize,
    /// Residual norm `||b - Ax||` of `solution`
    pub residual_norm: f64,
    /// `residual_norm / ||b||` (equal to `residual_norm` when `b == 0`)
    pub relative_residual: f64,
    /// Residual norm per iteration (empty unless tracking was requested)
    pub history: Vec<f64>,
}

impl SolveResult {
    pub(crate) fn finish(
        solution: Vector,
        status: SolverStatus,
        iterations: usize,
        residual_norm: f64,
        b_norm: f64,
        history: Vec<f64>,
    ) -> Self {
        let relative_residual = if b_norm > 0.0 {
            residual_norm / b_norm
        } else {
            residual_norm
        };
        Self {
            solution,
            status,
            converged: status.is_converged(),
            iterations,
            residual_norm,
            relative_residual,
            history,
        }
    }
}

/// Result of a GMRES solve
#[derive(Debug, Clone)]
pub struct GmresResult {
    /// Solution and convergence record
    pub result: SolveResult,
    /// Number of restarts taken
    pub restarts: usize,
    /// Krylov basis size in use at every iteration
    ///
    /// Grows `1, 2, ..., m` within a cycle and drops back to 1 after each
    /// restart.
    pub basis_sizes: Vec<usize>,
}

// ============================================================================
// Eigenvalue estimators
// ============================================================================

/// Options for power iteration and Lanczos
#[derive(Debug, Clone)]
pub struct EigenOptions {
    /// Maximum number of iterations (default: 1000)
    pub max_iter: usize,
    /// Relative change of the estimate treated as stable (default: 1e-8)
    pub tol: f64,
    /// Record the estimate of every iteration (default: false)
    pub track_history: bool,
    /// Cancellation and timeout
    pub control: SolverControl,
}

impl Default for EigenOptions {
    fn default() -> Self {
        Self::from(&SolverDefaults::default())
    }
}

impl From<&SolverDefaults> for EigenOptions {
    fn from(defaults: &SolverDefaults) -> Self {
        Self {
            max_iter: defaults.max_iterations,
            tol: defaults.eigen_tolerance,
            track_history: defaults.record_history,
            control: SolverControl::default(),
        }
    }
}

/// Result of power iteration
#[derive(Debug, Clone)]
pub struct PowerIterationResult {
    /// Estimate of the eigenvalue of largest magnitude
    pub eigenvalue: f64,
    /// Unit eigenvector estimate
    pub eigenvector: Vector,
    /// Why the iteration stopped
    pub status: SolverStatus,
    /// Shorthand for `status == Converged`
    pub converged: bool,
    /// Number of iterations performed
    pub iterations: usize,
    /// Eigenvalue estimate per iteration (empty unless tracking was requested)
    pub history: Vec<f64>,
}

/// Result of the Lanczos estimator
#[derive(Debug, Clone)]
pub struct LanczosResult {
    /// Smallest Ritz value
    pub min_eigenvalue: f64,
    /// Largest Ritz value
    pub max_eigenvalue: f64,
    /// All Ritz values of the final tridiagonal matrix, ascending
    pub ritz_values: Vec<f64>,
    /// Why the iteration stopped
    pub status: SolverStatus,
    /// Shorthand for `status == Converged`
    pub converged: bool,
    /// Lanczos steps taken (the Krylov dimension)
    pub iterations: usize,
    /// Largest Ritz value per iteration (empty unless tracking was requested)
    pub history: Vec<f64>,
}
