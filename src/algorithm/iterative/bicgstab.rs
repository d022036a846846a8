//! BiCGSTAB for general nonsymmetric systems

use log::debug;

use super::helpers::{
    check_finite, enqueue_scalar, enqueue_vector, initial_guess, prepare_operator, read_norm,
    residual, threshold, validate_system,
};
use super::types::{BiCgStabOptions, SolveResult, SolverStatus};
use crate::container::Vector;
use crate::error::Result;
use crate::expr::Expr;

/// Solve `A x = b` with unpreconditioned BiCGSTAB (van der Vorst)
///
/// Step lengths `alpha` and `omega` stay on the device. The host reads two
/// norms per iteration: `||s||` at the half step and `||r||` at the end.
/// A breakdown (`<r_hat, r> = 0` or `<t, t> = 0`) turns the next iterate
/// non-finite and is reported as `NumericalDivergence`.
///
/// Algorithm:
/// ```text
/// r = b - A*x, r_hat = r, p = r, rho = <r_hat, r>
/// for iter = 1, 2, ...:
///     v = A*p
///     alpha = rho / <r_hat, v>
///     s = r - alpha*v
///     if ||s|| <= tol: x = x + alpha*p; return
///     t = A*s
///     omega = <t, s> / <t, t>
///     x = x + alpha*p + omega*s
///     r = s - omega*t
///     if ||r|| <= tol: return
///     rho_new = <r_hat, r>
///     beta = (rho_new / rho) * (alpha / omega)
///     p = r + beta*(p - omega*v)
///     rho = rho_new
/// ```
pub fn bicgstab(
    a: impl Into<Expr>,
    b: &Vector,
    x0: Option<&Vector>,
    options: &BiCgStabOptions,
) -> Result<SolveResult> {
    let a = a.into();
    let n = validate_system("bicgstab", &a, b, x0)?;
    let a = prepare_operator(a)?;
    let context = b.context();
    let watchdog = options.control.start();

    let mut x = initial_guess(context, n, b.dtype(), x0)?;
    let mut history = Vec::new();

    let b_norm = read_norm(b)?;
    check_finite("bicgstab", 0, "||b||", b_norm)?;
    if b_norm == 0.0 {
        let zero = Vector::zeros(context, n, b.dtype())?;
        return Ok(SolveResult::finish(zero, SolverStatus::Converged, 0, 0.0, 0.0, history));
    }
    let tol = threshold(options.rtol, options.atol, b_norm);

    let mut r = residual(&a, b, &x)?;
    let res_norm = read_norm(&r)?;
    check_finite("bicgstab", 0, "residual norm", res_norm)?;
    if res_norm <= tol {
        return Ok(SolveResult::finish(x, SolverStatus::Converged, 0, res_norm, b_norm, history));
    }

    // Shadow residual, fixed for the whole solve
    let r_hat = r.clone();
    let mut p = r.clone();
    let mut rho = enqueue_scalar(&Expr::from(&r_hat).dot(&r)?)?;
    let mut best = (res_norm, x.clone());

    for iter in 0..options.max_iter {
        if watchdog.should_stop() {
            debug!("bicgstab cancelled after {iter} iterations");
            let (norm, solution) = best;
            return Ok(SolveResult::finish(
                solution,
                SolverStatus::Cancelled,
                iter,
                norm,
                b_norm,
                history,
            ));
        }

        // v = A*p, alpha = rho / <r_hat, v>
        let v = enqueue_vector(&a.mat_vec(&p)?)?;
        let rv = Expr::from(&r_hat).dot(&v)?;
        let alpha = enqueue_scalar(&Expr::from(&rho).elementwise_div(rv)?)?;

        // s = r - alpha*v
        let s = enqueue_vector(&Expr::from(&r).sub(Expr::from(&v).scale_by(&alpha)?)?)?;
        let s_norm = read_norm(&s)?;
        check_finite("bicgstab", iter + 1, "||s||", s_norm)?;
        if s_norm <= tol {
            x = enqueue_vector(&Expr::from(&x).add(Expr::from(&p).scale_by(&alpha)?)?)?;
            if options.track_residual_history {
                history.push(s_norm);
            }
            debug!("bicgstab converged at half step {} (||s|| = {s_norm:e})", iter + 1);
            return Ok(SolveResult::finish(
                x,
                SolverStatus::Converged,
                iter + 1,
                s_norm,
                b_norm,
                history,
            ));
        }

        // t = A*s, omega = <t, s> / <t, t>
        let t = enqueue_vector(&a.mat_vec(&s)?)?;
        let ts = Expr::from(&t).dot(&s)?;
        let tt = Expr::from(&t).dot(&t)?;
        let omega = enqueue_scalar(&ts.elementwise_div(tt)?)?;

        // x = x + alpha*p + omega*s
        let step = Expr::from(&p)
            .scale_by(&alpha)?
            .add(Expr::from(&s).scale_by(&omega)?)?;
        x = enqueue_vector(&Expr::from(&x).add(step)?)?;

        // r = s - omega*t
        r = enqueue_vector(&Expr::from(&s).sub(Expr::from(&t).scale_by(&omega)?)?)?;
        let res_norm = read_norm(&r)?;
        check_finite("bicgstab", iter + 1, "residual norm", res_norm)?;
        if options.track_residual_history {
            history.push(res_norm);
        }
        if res_norm < best.0 {
            best = (res_norm, x.clone());
        }
        if res_norm <= tol {
            debug!("bicgstab converged in {} iterations (||r|| = {res_norm:e})", iter + 1);
            return Ok(SolveResult::finish(
                x,
                SolverStatus::Converged,
                iter + 1,
                res_norm,
                b_norm,
                history,
            ));
        }

        // beta = (rho_new / rho) * (alpha / omega)
        let rho_new = enqueue_scalar(&Expr::from(&r_hat).dot(&r)?)?;
        let beta = Expr::from(&rho_new)
            .elementwise_div(&rho)?
            .elementwise_mul(Expr::from(&alpha).elementwise_div(&omega)?)?;

        // p = r + beta*(p - omega*v)
        let correction = Expr::from(&p).sub(Expr::from(&v).scale_by(&omega)?)?;
        p = enqueue_vector(&Expr::from(&r).add(correction.scale_by(beta)?)?)?;
        rho = rho_new;
    }

    let (_, solution) = best;
    let final_norm = read_norm(&residual(&a, b, &solution)?)?;
    debug!(
        "bicgstab stopped after {} iterations without converging (||r|| = {final_norm:e})",
        options.max_iter
    );
    Ok(SolveResult::finish(
        solution,
        SolverStatus::MaxIterationsExceeded,
        options.max_iter,
        final_norm,
        b_norm,
        history,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{DenseLayout, DenseMatrix};
    use crate::runtime::Context;

    #[test]
    fn test_bicgstab_nonsymmetric() {
        let ctx = Context::host();
        #[rustfmt::skip]
        let data = [
            4.0, -1.0, 0.0,
            2.0,  5.0, 1.0,
            0.0, -2.0, 3.0,
        ];
        let a = DenseMatrix::from_slice(&ctx, &data, 3, 3, DenseLayout::RowMajor).unwrap();
        let b = Vector::from_slice(&ctx, &[3.0, 8.0, 1.0]).unwrap();
        let result = bicgstab(&a, &b, None, &BiCgStabOptions::default()).unwrap();
        assert!(result.converged);

        let x = result.solution.to_vec::<f64>().unwrap();
        for (xi, exact) in x.iter().zip([1.0, 1.0, 1.0]) {
            assert!((xi - exact).abs() < 1e-6, "{xi} vs {exact}");
        }
    }

    #[test]
    fn test_bicgstab_starts_at_solution() {
        let ctx = Context::host();
        let a = DenseMatrix::identity(&ctx, 2, crate::dtype::DType::F64, DenseLayout::RowMajor)
            .unwrap();
        let b = Vector::from_slice(&ctx, &[2.0, -1.0]).unwrap();
        let result = bicgstab(&a, &b, Some(&b), &BiCgStabOptions::default()).unwrap();
        assert_eq!(result.iterations, 0);
        assert!(result.converged);
    }
}
