//! Conjugate Gradient for symmetric positive definite systems

use log::debug;

use super::helpers::{
    check_finite, enqueue_scalar, enqueue_vector, initial_guess, prepare_operator, read_norm,
    residual, threshold, validate_system,
};
use super::types::{CgOptions, SolveResult, SolverStatus};
use crate::container::Vector;
use crate::error::Result;
use crate::expr::Expr;

/// Solve `A x = b` with unpreconditioned CG (Hestenes-Stiefel)
///
/// `a` is any square dense or sparse matrix expression; computed operators
/// are materialised once. Step lengths stay on the device as scalars, so the
/// only value read back per iteration is `<r, r>`.
///
/// Algorithm:
/// ```text
/// x = x0, r = b - A*x, p = r, rr = <r,r>
/// for iter = 1, 2, ...:
///     Ap = A*p
///     alpha = rr / <p, Ap>
///     x = x + alpha*p
///     r = r - alpha*Ap
///     rr_new = <r,r>
///     if sqrt(rr_new) <= max(rtol*||b||, atol): return
///     p = r + (rr_new / rr)*p
///     rr = rr_new
/// ```
pub fn cg(
    a: impl Into<Expr>,
    b: &Vector,
    x0: Option<&Vector>,
    options: &CgOptions,
) -> Result<SolveResult> {
    let a = a.into();
    let n = validate_system("cg", &a, b, x0)?;
    let a = prepare_operator(a)?;
    let context = b.context();
    let watchdog = options.control.start();

    let mut x = initial_guess(context, n, b.dtype(), x0)?;
    let mut history = Vec::new();

    let b_norm = read_norm(b)?;
    check_finite("cg", 0, "||b||", b_norm)?;
    if b_norm == 0.0 {
        let zero = Vector::zeros(context, n, b.dtype())?;
        return Ok(SolveResult::finish(zero, SolverStatus::Converged, 0, 0.0, 0.0, history));
    }
    let tol = threshold(options.rtol, options.atol, b_norm);

    // r = b - A*x, p = r
    let mut r = residual(&a, b, &x)?;
    let mut p = r.clone();
    let mut rr = enqueue_scalar(&Expr::from(&r).dot(&r)?)?;
    let mut res_norm = rr.to_f64()?.sqrt();
    check_finite("cg", 0, "residual norm", res_norm)?;

    let mut best = (res_norm, x.clone());

    if res_norm <= tol {
        return Ok(SolveResult::finish(x, SolverStatus::Converged, 0, res_norm, b_norm, history));
    }

    for iter in 0..options.max_iter {
        if watchdog.should_stop() {
            debug!("cg cancelled after {iter} iterations");
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

        // Ap = A*p
        let ap = enqueue_vector(&a.mat_vec(&p)?)?;

        // alpha = rr / <p, Ap>
        let p_ap = enqueue_scalar(&Expr::from(&p).dot(&ap)?)?;
        let alpha = enqueue_scalar(&Expr::from(&rr).elementwise_div(&p_ap)?)?;

        // x = x + alpha*p
        x = enqueue_vector(&Expr::from(&x).add(Expr::from(&p).scale_by(&alpha)?)?)?;

        // r = r - alpha*Ap
        r = enqueue_vector(&Expr::from(&r).sub(Expr::from(&ap).scale_by(&alpha)?)?)?;

        let rr_new = enqueue_scalar(&Expr::from(&r).dot(&r)?)?;
        res_norm = rr_new.to_f64()?.sqrt();
        check_finite("cg", iter + 1, "residual norm", res_norm)?;
        if options.track_residual_history {
            history.push(res_norm);
        }
        if res_norm < best.0 {
            best = (res_norm, x.clone());
        }

        if res_norm <= tol {
            debug!("cg converged in {} iterations (||r|| = {res_norm:e})", iter + 1);
            return Ok(SolveResult::finish(
                x,
                SolverStatus::Converged,
                iter + 1,
                res_norm,
                b_norm,
                history,
            ));
        }

        // p = r + beta*p, beta = rr_new / rr
        let beta = Expr::from(&rr_new).elementwise_div(&rr)?;
        p = enqueue_vector(&Expr::from(&r).add(Expr::from(&p).scale_by(beta)?)?)?;
        rr = rr_new;
    }

    let (_, solution) = best;
    let final_norm = read_norm(&residual(&a, b, &solution)?)?;
    debug!(
        "cg stopped after {} iterations without converging (||r|| = {final_norm:e})",
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
    use crate::dtype::DType;
    use crate::runtime::Context;

    fn spd(ctx: &Context) -> DenseMatrix {
        #[rustfmt::skip]
        let data = [
            4.0, 1.0, 0.0,
            1.0, 3.0, 1.0,
            0.0, 1.0, 2.0,
        ];
        DenseMatrix::from_slice(ctx, &data, 3, 3, DenseLayout::RowMajor).unwrap()
    }

    #[test]
    fn test_cg_small_spd() {
        let ctx = Context::host();
        let a = spd(&ctx);
        let b = Vector::from_slice(&ctx, &[1.0, 2.0, 3.0]).unwrap();
        let result = cg(&a, &b, None, &CgOptions::default()).unwrap();
        assert!(result.converged);
        assert!(result.iterations <= 6);

        let r = residual(&Expr::from(&a), &b, &result.solution).unwrap();
        assert!(read_norm(&r).unwrap() < 1e-7);
    }

    #[test]
    fn test_cg_zero_rhs() {
        let ctx = Context::host();
        let a = spd(&ctx);
        let b = Vector::zeros(&ctx, 3, DType::F64).unwrap();
        let result = cg(&a, &b, None, &CgOptions::default()).unwrap();
        assert_eq!(result.status, SolverStatus::Converged);
        assert_eq!(result.iterations, 0);
        assert_eq!(result.solution.to_vec::<f64>().unwrap(), vec![0.0; 3]);
    }

    #[test]
    fn test_cg_rejects_integer_system() {
        let ctx = Context::host();
        let a = DenseMatrix::from_slice(&ctx, &[1i32, 0, 0, 1], 2, 2, DenseLayout::RowMajor).unwrap();
        let b = Vector::from_slice(&ctx, &[1i32, 1]).unwrap();
        assert!(cg(&a, &b, None, &CgOptions::default()).is_err());
    }
}
