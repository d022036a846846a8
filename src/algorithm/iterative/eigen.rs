//! Eigenvalue estimators: power iteration and Lanczos
//!
//! Both converge on stabilisation of the estimate: the relative change
//! between consecutive iterations drops to `options.tol`.

use log::debug;

use super::helpers::{
    check_finite, enqueue_vector, host_vector, prepare_operator, read_dot, read_norm,
    relative_change, tridiagonal_eigenvalues, validate_operator,
};
use super::types::{EigenOptions, LanczosResult, PowerIterationResult, SolverStatus};
use crate::container::Vector;
use crate::error::{Error, Result};
use crate::expr::Expr;

/// Deterministic start vector with a component along every eigenvector of
/// typical test operators
fn start_vector(a: &Expr, n: usize) -> Result<Vector> {
    let data: Vec<f64> = (0..n).map(|i| 1.0 + (i as f64 + 1.0) / (n as f64 + 1.0)).collect();
    let norm = data.iter().map(|v| v * v).sum::<f64>().sqrt();
    let data: Vec<f64> = data.iter().map(|v| v / norm).collect();
    host_vector(a.context(), &data, a.dtype())
}

fn seed(op: &'static str, a: &Expr, n: usize, x0: Option<&Vector>) -> Result<Vector> {
    let Some(x0) = x0 else {
        return start_vector(a, n);
    };
    if x0.len() != n {
        return Err(Error::shape_mismatch(op, &[n], &[x0.len()]));
    }
    if x0.dtype() != a.dtype() {
        return Err(Error::dtype_mismatch(op, a.dtype(), x0.dtype()));
    }
    let norm = read_norm(x0)?;
    if !(norm > 0.0 && norm.is_finite()) {
        return Err(Error::InvalidArgument {
            arg: "x0",
            reason: format!("start vector norm is {norm}"),
        });
    }
    enqueue_vector(&Expr::from(x0).scale(1.0 / norm)?)
}

/// Dominant eigenvalue (largest magnitude) and its eigenvector
///
/// Algorithm:
/// ```text
/// v = x0 / ||x0||
/// for iter = 1, 2, ...:
///     w = A*v
///     lambda = <v, w>           (Rayleigh quotient, ||v|| = 1)
///     v = w / ||w||
///     if |lambda - lambda_prev| <= tol * |lambda|: return
/// ```
pub fn power_iteration(
    a: impl Into<Expr>,
    x0: Option<&Vector>,
    options: &EigenOptions,
) -> Result<PowerIterationResult> {
    let a = a.into();
    let n = validate_operator("power_iteration", &a)?;
    if n == 0 {
        return Err(Error::InvalidArgument {
            arg: "a",
            reason: "operator is empty".into(),
        });
    }
    let a = prepare_operator(a)?;
    let watchdog = options.control.start();

    let mut v = seed("power_iteration", &a, n, x0)?;
    let mut lambda = f64::NAN;
    let mut history = Vec::new();

    let finish = |status: SolverStatus, iterations, eigenvalue, eigenvector, history| {
        PowerIterationResult {
            eigenvalue,
            eigenvector,
            status,
            converged: status.is_converged(),
            iterations,
            history,
        }
    };

    for iter in 0..options.max_iter {
        if watchdog.should_stop() {
            return Ok(finish(SolverStatus::Cancelled, iter, lambda, v, history));
        }

        // w = A*v, lambda = <v, w>
        let w = enqueue_vector(&a.mat_vec(&v)?)?;
        let estimate = read_dot(&v, &w)?;
        let w_norm = read_norm(&w)?;
        check_finite("power_iteration", iter + 1, "eigenvalue estimate", estimate)?;
        check_finite("power_iteration", iter + 1, "||A v||", w_norm)?;
        if options.track_history {
            history.push(estimate);
        }

        // A v = 0: v spans the null space
        if w_norm == 0.0 {
            return Ok(finish(SolverStatus::Converged, iter + 1, 0.0, v, history));
        }
        v = enqueue_vector(&Expr::from(&w).scale(1.0 / w_norm)?)?;

        let stable = lambda.is_finite() && relative_change(lambda, estimate) <= options.tol;
        lambda = estimate;
        if stable {
            debug!("power iteration converged in {} iterations (lambda = {lambda})", iter + 1);
            return Ok(finish(SolverStatus::Converged, iter + 1, lambda, v, history));
        }
    }

    debug!("power iteration stopped after {} iterations", options.max_iter);
    Ok(finish(
        SolverStatus::MaxIterationsExceeded,
        options.max_iter,
        lambda,
        v,
        history,
    ))
}

/// Extreme eigenvalues of a symmetric operator by Lanczos iteration
///
/// Each new Lanczos vector is fully reorthogonalised against the stored
/// basis, so Ritz values do not duplicate. The Krylov dimension is bounded
/// by `n`; reaching it (or an invariant subspace) makes the Ritz values
/// exact and counts as convergence.
///
/// Algorithm:
/// ```text
/// q_0 = x0 / ||x0||, beta_0 = 0
/// for j = 0, 1, ...:
///     w = A*q_j - beta_j*q_{j-1}
///     alpha_j = <q_j, w>
///     w = w - alpha_j*q_j, then w = w - <w, q_i>*q_i for all i <= j
///     beta_{j+1} = ||w||
///     Ritz values = eig(tridiag(beta, alpha, beta))
///     stop when min and max Ritz values are stable
///     q_{j+1} = w / beta_{j+1}
/// ```
pub fn lanczos(
    a: impl Into<Expr>,
    x0: Option<&Vector>,
    options: &EigenOptions,
) -> Result<LanczosResult> {
    let a = a.into();
    let n = validate_operator("lanczos", &a)?;
    if n == 0 {
        return Err(Error::InvalidArgument {
            arg: "a",
            reason: "operator is empty".into(),
        });
    }
    let a = prepare_operator(a)?;
    let watchdog = options.control.start();

    let mut basis: Vec<Vector> = vec![seed("lanczos", &a, n, x0)?];
    let mut alphas: Vec<f64> = Vec::new();
    let mut betas: Vec<f64> = Vec::new();
    let mut ritz: Vec<f64> = Vec::new();
    let mut history = Vec::new();
    let limit = options.max_iter.min(n);

    let finish = |status: SolverStatus, ritz: Vec<f64>, history| LanczosResult {
        min_eigenvalue: ritz.first().copied().unwrap_or(f64::NAN),
        max_eigenvalue: ritz.last().copied().unwrap_or(f64::NAN),
        iterations: ritz.len(),
        ritz_values: ritz,
        status,
        converged: status.is_converged(),
        history,
    };

    for j in 0..limit {
        if watchdog.should_stop() {
            return Ok(finish(SolverStatus::Cancelled, ritz, history));
        }

        // w = A*q_j - beta_j*q_{j-1}
        let q = &basis[j];
        let mut w = Expr::from(&a).mat_vec(q)?;
        if j > 0 {
            w = w.sub(Expr::from(&basis[j - 1]).scale(betas[j - 1])?)?;
        }
        let mut w = enqueue_vector(&w)?;

        let alpha = read_dot(q, &w)?;
        check_finite("lanczos", j + 1, "alpha", alpha)?;
        alphas.push(alpha);

        // Full reorthogonalisation (covers the alpha_j*q_j term)
        for q_i in &basis {
            let h = read_dot(&w, q_i)?;
            w = enqueue_vector(&Expr::from(&w).sub(Expr::from(q_i).scale(h)?)?)?;
        }
        let beta = read_norm(&w)?;
        check_finite("lanczos", j + 1, "beta", beta)?;

        let previous = std::mem::replace(&mut ritz, tridiagonal_eigenvalues(&alphas, &betas));
        let lo = ritz[0];
        let hi = ritz[ritz.len() - 1];
        if options.track_history {
            history.push(hi);
        }

        let stable = previous.len() > 1
            && relative_change(previous[0], lo) <= options.tol
            && relative_change(previous[previous.len() - 1], hi) <= options.tol;
        let scale = lo.abs().max(hi.abs()).max(f64::MIN_POSITIVE);
        let invariant = beta <= f64::EPSILON * scale * (n as f64);
        if stable || invariant || j + 1 == n {
            debug!("lanczos converged after {} steps: [{lo}, {hi}]", j + 1);
            return Ok(finish(SolverStatus::Converged, ritz, history));
        }

        betas.push(beta);
        basis.push(enqueue_vector(&Expr::from(&w).scale(1.0 / beta)?)?);
    }

    debug!("lanczos stopped after {limit} steps");
    Ok(finish(SolverStatus::MaxIterationsExceeded, ritz, history))
}
