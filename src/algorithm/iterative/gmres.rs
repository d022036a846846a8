//! Restarted GMRES(m)
//!
//! Arnoldi iteration with modified Gram-Schmidt and Givens rotations. Basis
//! vectors live on the device; the Hessenberg matrix and the rotated
//! least-squares right-hand side are small and kept on the host.

use log::debug;

use super::helpers::{
    check_finite, enqueue_vector, givens_rotation, initial_guess, linear_combination,
    prepare_operator, read_dot, read_norm, residual, solve_upper_triangular, threshold,
    validate_system,
};
use super::types::{GmresOptions, GmresResult, SolveResult, SolverStatus};
use crate::container::Vector;
use crate::error::{Error, Result};
use crate::expr::Expr;

/// Solve `A x = b` with GMRES restarted every `options.restart` iterations
///
/// `options.max_iter` counts Arnoldi steps across all cycles. When a cycle
/// fills its basis without converging, the iterate is updated and the next
/// cycle starts from a fresh basis seeded by the new residual.
///
/// Algorithm (one cycle):
/// ```text
/// r = b - A*x, beta = ||r||, v0 = r / beta, g = beta*e1
/// for j = 0 .. m-1:
///     w = A*v_j
///     for i = 0 .. j:               (modified Gram-Schmidt)
///         h_ij = <w, v_i>, w = w - h_ij*v_i
///     h_{j+1,j} = ||w||
///     apply previous rotations to column j, then a new one zeroing h_{j+1,j}
///     |g_{j+1}| is the residual norm; stop if small
///     v_{j+1} = w / h_{j+1,j}
/// solve R y = g, x = x + V*y
/// ```
pub fn gmres(
    a: impl Into<Expr>,
    b: &Vector,
    x0: Option<&Vector>,
    options: &GmresOptions,
) -> Result<GmresResult> {
    if options.restart == 0 {
        return Err(Error::InvalidArgument {
            arg: "restart",
            reason: "restart length must be at least 1".into(),
        });
    }
    let a = a.into();
    let n = validate_system("gmres", &a, b, x0)?;
    let a = prepare_operator(a)?;
    let context = b.context();
    let watchdog = options.control.start();

    let mut x = initial_guess(context, n, b.dtype(), x0)?;
    let mut history = Vec::new();
    let mut basis_sizes = Vec::new();
    let mut restarts = 0;

    let b_norm = read_norm(b)?;
    check_finite("gmres", 0, "||b||", b_norm)?;
    if b_norm == 0.0 {
        let zero = Vector::zeros(context, n, b.dtype())?;
        return Ok(GmresResult {
            result: SolveResult::finish(zero, SolverStatus::Converged, 0, 0.0, 0.0, history),
            restarts,
            basis_sizes,
        });
    }
    let tol = threshold(options.rtol, options.atol, b_norm);
    // A Krylov space never needs more than n vectors
    let m = options.restart.min(n.max(1));

    let mut total = 0;
    let mut best = (f64::INFINITY, x.clone());

    let status = loop {
        // r = b - A*x, beta = ||r||
        let r = residual(&a, b, &x)?;
        let beta = read_norm(&r)?;
        check_finite("gmres", total, "residual norm", beta)?;
        if beta < best.0 {
            best = (beta, x.clone());
        }
        if beta <= tol {
            break SolverStatus::Converged;
        }
        if total >= options.max_iter {
            break SolverStatus::MaxIterationsExceeded;
        }
        if watchdog.should_stop() {
            break SolverStatus::Cancelled;
        }

        let mut basis: Vec<Vector> = vec![enqueue_vector(&Expr::from(&r).scale(1.0 / beta)?)?];
        // Column j of the rotated Hessenberg matrix R
        let mut columns: Vec<Vec<f64>> = Vec::with_capacity(m);
        let mut cs: Vec<f64> = Vec::with_capacity(m);
        let mut sn: Vec<f64> = Vec::with_capacity(m);
        let mut g: Vec<f64> = vec![beta];
        let mut cycle_converged = false;

        while columns.len() < m && total < options.max_iter {
            if watchdog.should_stop() {
                break;
            }
            let j = columns.len();
            basis_sizes.push(basis.len());
            total += 1;

            // w = A*v_j
            let mut w = enqueue_vector(&a.mat_vec(&basis[j])?)?;

            // Modified Gram-Schmidt against v_0 .. v_j
            let mut h_col: Vec<f64> = Vec::with_capacity(j + 2);
            for v_i in &basis {
                let h_ij = read_dot(&w, v_i)?;
                w = enqueue_vector(&Expr::from(&w).sub(Expr::from(v_i).scale(h_ij)?)?)?;
                h_col.push(h_ij);
            }
            let h_next = read_norm(&w)?;
            check_finite("gmres", total, "Arnoldi norm", h_next)?;
            h_col.push(h_next);

            // Apply the previous rotations to the new column
            for i in 0..j {
                let temp = cs[i] * h_col[i] + sn[i] * h_col[i + 1];
                h_col[i + 1] = -sn[i] * h_col[i] + cs[i] * h_col[i + 1];
                h_col[i] = temp;
            }
            let (c, s, rr) = givens_rotation(h_col[j], h_col[j + 1]);
            cs.push(c);
            sn.push(s);
            h_col[j] = rr;
            h_col[j + 1] = 0.0;
            g.push(-s * g[j]);
            g[j] *= c;
            h_col.truncate(j + 1);
            columns.push(h_col);

            let res_norm = g[j + 1].abs();
            check_finite("gmres", total, "residual estimate", res_norm)?;
            if options.track_residual_history {
                history.push(res_norm);
            }

            // Lucky breakdown: the Krylov space is invariant and holds the solution
            if res_norm <= tol || h_next <= f64::EPSILON * beta {
                cycle_converged = true;
                break;
            }
            if columns.len() < m {
                basis.push(enqueue_vector(&Expr::from(&w).scale(1.0 / h_next)?)?);
            }
        }

        // x = x + V*y
        if !columns.is_empty() {
            let k = columns.len();
            let y = solve_upper_triangular(&columns, &g[..k]);
            if let Some(update) = linear_combination(&basis[..k], &y)? {
                x = enqueue_vector(&Expr::from(&x).add(update)?)?;
            }
        }

        if !cycle_converged && total < options.max_iter && !watchdog.should_stop() {
            restarts += 1;
            debug!("gmres restart {restarts} after {total} iterations");
        }
    };

    // The residual is recomputed from the iterate rather than trusting the
    // rotated estimate
    let (solution, final_norm) = match status {
        SolverStatus::Converged => {
            let norm = read_norm(&residual(&a, b, &x)?)?;
            (x, norm)
        }
        _ => {
            let (norm, solution) = best;
            (solution, norm)
        }
    };
    let iterations = match status {
        SolverStatus::MaxIterationsExceeded => options.max_iter,
        _ => total,
    };
    debug!("gmres {status} after {iterations} iterations, {restarts} restarts (||r|| = {final_norm:e})");

    Ok(GmresResult {
        result: SolveResult::finish(solution, status, iterations, final_norm, b_norm, history),
        restarts,
        basis_sizes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{DenseLayout, DenseMatrix};
    use crate::runtime::Context;

    fn system(ctx: &Context) -> (DenseMatrix, Vector) {
        #[rustfmt::skip]
        let data = [
            3.0, 1.0, 0.0, 0.0,
            1.0, 4.0, 1.0, 0.0,
            0.0, 2.0, 5.0, 1.0,
            0.0, 0.0, 1.0, 3.0,
        ];
        let a = DenseMatrix::from_slice(ctx, &data, 4, 4, DenseLayout::RowMajor).unwrap();
        let b = Vector::from_slice(ctx, &[4.0, 6.0, 8.0, 4.0]).unwrap();
        (a, b)
    }

    #[test]
    fn test_gmres_full_basis() {
        let ctx = Context::host();
        let (a, b) = system(&ctx);
        let out = gmres(&a, &b, None, &GmresOptions::default()).unwrap();
        assert!(out.result.converged);
        assert_eq!(out.restarts, 0);
        for xi in out.result.solution.to_vec::<f64>().unwrap() {
            assert!((xi - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_gmres_restart_resets_basis() {
        let ctx = Context::host();
        let (a, b) = system(&ctx);
        let options = GmresOptions {
            restart: 2,
            rtol: 1e-10,
            ..GmresOptions::default()
        };
        let out = gmres(&a, &b, None, &options).unwrap();
        assert!(out.result.converged);
        assert!(out.restarts >= 1);
        assert_eq!(&out.basis_sizes[..3], &[1, 2, 1]);
    }

    #[test]
    fn test_gmres_rejects_zero_restart() {
        let ctx = Context::host();
        let (a, b) = system(&ctx);
        let options = GmresOptions {
            restart: 0,
            ..GmresOptions::default()
        };
        assert!(matches!(
            gmres(&a, &b, None, &options),
            Err(Error::InvalidArgument { .. })
        ));
    }
}
