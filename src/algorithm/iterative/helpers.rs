//! Shared helpers for the iterative solvers
//!
//! Device-side helpers build and enqueue expressions; the host-side helpers
//! work on the small dense problems (Hessenberg least squares, tridiagonal
//! eigenvalues) that Krylov methods reduce to.

use crate::container::Vector;
use crate::dispatch_dtype;
use crate::dtype::{DType, Element};
use crate::error::{Error, Result};
use crate::expr::{Expr, ExprShape};
use crate::runtime::Context;

/// Check `A x = b` dimensions and dtypes; returns `n`
pub(crate) fn validate_system(
    op: &'static str,
    a: &Expr,
    b: &Vector,
    x0: Option<&Vector>,
) -> Result<usize> {
    let n = validate_operator(op, a)?;
    if b.len() != n {
        return Err(Error::shape_mismatch(op, &[n], &[b.len()]));
    }
    if a.dtype() != b.dtype() {
        return Err(Error::dtype_mismatch(op, a.dtype(), b.dtype()));
    }
    if b.context() != a.context() {
        return Err(Error::CrossContextOperation {
            op,
            lhs: a.context().id(),
            rhs: b.context().id(),
        });
    }
    if let Some(x0) = x0 {
        if x0.len() != n {
            return Err(Error::shape_mismatch(op, &[n], &[x0.len()]));
        }
        if x0.dtype() != b.dtype() {
            return Err(Error::dtype_mismatch(op, b.dtype(), x0.dtype()));
        }
        if x0.context() != b.context() {
            return Err(Error::CrossContextOperation {
                op,
                lhs: b.context().id(),
                rhs: x0.context().id(),
            });
        }
    }
    Ok(n)
}

/// Check that `a` is a square float operator; returns `n`
pub(crate) fn validate_operator(op: &'static str, a: &Expr) -> Result<usize> {
    let n = match a.shape() {
        ExprShape::Matrix(r, c) if r == c => r,
        other => {
            let (r, _) = other.dims();
            return Err(Error::shape_mismatch(op, &[r, r], &other.extents()));
        }
    };
    if !a.dtype().is_float() {
        return Err(Error::unsupported_dtype(a.dtype(), op));
    }
    Ok(n)
}

/// Materialise a computed operator once so iterations only pay for products
pub(crate) fn prepare_operator(a: Expr) -> Result<Expr> {
    if a.as_container().is_some() || a.is_view() {
        return Ok(a);
    }
    let container = a.context().evaluate(&a)?;
    Ok(Expr::from(container))
}

/// Starting iterate: a copy-free clone of `x0` or zeros
pub(crate) fn initial_guess(
    context: &Context,
    n: usize,
    dtype: DType,
    x0: Option<&Vector>,
) -> Result<Vector> {
    match x0 {
        Some(x0) => Ok(x0.clone()),
        None => Vector::zeros(context, n, dtype),
    }
}

/// Enqueue a vector expression
pub(crate) fn enqueue_vector(expr: &Expr) -> Result<Vector> {
    expr.context().enqueue(expr)?.into_vector()
}

/// Enqueue a scalar expression; the value stays on the device
pub(crate) fn enqueue_scalar(expr: &Expr) -> Result<crate::container::Scalar> {
    expr.context().enqueue(expr)?.into_scalar()
}

/// `r = b - A x`
pub(crate) fn residual(a: &Expr, b: &Vector, x: &Vector) -> Result<Vector> {
    let ax = a.mat_vec(x)?;
    enqueue_vector(&Expr::from(b).sub(ax)?)
}

/// `||v||_2`, read back to the host
pub(crate) fn read_norm(v: &Vector) -> Result<f64> {
    enqueue_scalar(&Expr::from(v).norm_2()?)?.to_f64()
}

/// `<u, v>`, read back to the host
pub(crate) fn read_dot(u: &Vector, v: &Vector) -> Result<f64> {
    enqueue_scalar(&Expr::from(u).dot(v)?)?.to_f64()
}

/// `sum_j coeffs[j] * basis[j]` as one expression (the dispatcher splits it
/// across kernels when it exceeds the fusion budget)
pub(crate) fn linear_combination(basis: &[Vector], coeffs: &[f64]) -> Result<Option<Expr>> {
    let mut acc: Option<Expr> = None;
    for (v, &c) in basis.iter().zip(coeffs) {
        if c == 0.0 {
            continue;
        }
        let term = Expr::from(v).scale(c)?;
        acc = Some(match acc {
            Some(sum) => sum.add(term)?,
            None => term,
        });
    }
    Ok(acc)
}

/// Upload `data` as a vector of `dtype`
pub(crate) fn host_vector(context: &Context, data: &[f64], dtype: DType) -> Result<Vector> {
    dispatch_dtype!(dtype, T => {
        let values: Vec<T> = data.iter().map(|&v| T::from_f64(v)).collect();
        Vector::from_slice(context, &values)
    })
}

/// Fail with `NumericalDivergence` when `value` is NaN or infinite
pub(crate) fn check_finite(
    solver: &'static str,
    iterations: usize,
    what: &str,
    value: f64,
) -> Result<()> {
    if value.is_finite() {
        return Ok(());
    }
    Err(Error::NumericalDivergence {
        solver,
        iterations,
        reason: format!("{what} is {value}"),
    })
}

/// Convergence threshold `max(rtol * ||b||, atol)`
#[inline]
pub(crate) fn threshold(rtol: f64, atol: f64, b_norm: f64) -> f64 {
    (rtol * b_norm).max(atol)
}

/// `|new - old| / |new|`, falling back to the absolute change near zero
#[inline]
pub(crate) fn relative_change(old: f64, new: f64) -> f64 {
    let diff = (new - old).abs();
    if new.abs() > f64::MIN_POSITIVE {
        diff / new.abs()
    } else {
        diff
    }
}

/// Compute Givens rotation coefficients
///
/// Given a and b, computes (c, s, r) such that:
/// [c  s] [a] = [r]
/// [-s c] [b] = [0]
///
/// where c^2 + s^2 = 1 and r = sqrt(a^2 + b^2) >= 0
#[inline]
pub fn givens_rotation(a: f64, b: f64) -> (f64, f64, f64) {
    if b == 0.0 {
        if a >= 0.0 { (1.0, 0.0, a) } else { (-1.0, 0.0, -a) }
    } else if a == 0.0 {
        (0.0, b.signum(), b.abs())
    } else {
        let r = a.hypot(b);
        (a / r, b / r, r)
    }
}

/// Solve upper triangular system R @ y = g via back substitution
///
/// `columns[j]` holds column j of R. Zero pivots leave the component at 0.
pub fn solve_upper_triangular(columns: &[Vec<f64>], g: &[f64]) -> Vec<f64> {
    let m = g.len();
    let mut y = vec![0.0; m];

    for i in (0..m).rev() {
        let mut sum = g[i];
        for j in (i + 1)..m {
            sum -= columns[j][i] * y[j];
        }
        if columns[i][i] != 0.0 {
            y[i] = sum / columns[i][i];
        }
    }

    y
}

/// Number of eigenvalues of the symmetric tridiagonal `(diag, off)` below `x`
fn sturm_count(diag: &[f64], off: &[f64], x: f64) -> usize {
    let mut count = 0;
    let mut q = 1.0;
    for i in 0..diag.len() {
        let coupling = if i == 0 { 0.0 } else { off[i - 1] * off[i - 1] };
        q = diag[i] - x - if i == 0 { 0.0 } else { coupling / q };
        if q == 0.0 {
            q = -f64::EPSILON * (diag[i].abs() + coupling.sqrt() + f64::MIN_POSITIVE);
        }
        if q < 0.0 {
            count += 1;
        }
    }
    count
}

/// All eigenvalues of a symmetric tridiagonal matrix, ascending
///
/// `diag` has length k and `off` length k-1. Each eigenvalue is isolated by
/// bisection on the Sturm sequence count inside the Gershgorin interval.
pub fn tridiagonal_eigenvalues(diag: &[f64], off: &[f64]) -> Vec<f64> {
    let k = diag.len();
    if k == 0 {
        return Vec::new();
    }
    let mut lo = f64::INFINITY;
    let mut hi = f64::NEG_INFINITY;
    for i in 0..k {
        let left = if i > 0 { off[i - 1].abs() } else { 0.0 };
        let right = if i + 1 < k { off[i].abs() } else { 0.0 };
        lo = lo.min(diag[i] - left - right);
        hi = hi.max(diag[i] + left + right);
    }
    let pad = f64::EPSILON * lo.abs().max(hi.abs()).max(1.0);
    lo -= pad;
    hi += pad;

    (0..k)
        .map(|index| {
            let (mut a, mut b) = (lo, hi);
            for _ in 0..200 {
                let mid = 0.5 * (a + b);
                if mid <= a || mid >= b {
                    break;
                }
                if sturm_count(diag, off, mid) > index {
                    b = mid;
                } else {
                    a = mid;
                }
            }
            0.5 * (a + b)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_givens_rotation() {
        let (c, s, r) = givens_rotation(3.0, 4.0);
        assert!((c * c + s * s - 1.0).abs() < 1e-12);
        assert!((r - 5.0).abs() < 1e-12);
        assert!((-s * 3.0 + c * 4.0).abs() < 1e-12, "zeroes out b");

        let (c, s, r) = givens_rotation(-5.0, 0.0);
        assert_eq!((c, s, r), (-1.0, 0.0, 5.0));

        let (c, s, r) = givens_rotation(0.0, -3.0);
        assert_eq!((c, s, r), (0.0, -1.0, 3.0));
    }

    #[test]
    fn test_solve_upper_triangular() {
        // R = [[2, 1], [0, 3]], g = [3, 6]
        let columns = vec![vec![2.0, 0.0], vec![1.0, 3.0]];
        let y = solve_upper_triangular(&columns, &[3.0, 6.0]);
        assert!((y[0] - 0.5).abs() < 1e-12);
        assert!((y[1] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_tridiagonal_eigenvalues() {
        // tridiag(-1, 2, -1) of size 4: 2 - 2 cos(j pi / 5)
        let diag = [2.0; 4];
        let off = [-1.0; 3];
        let eig = tridiagonal_eigenvalues(&diag, &off);
        for (j, lambda) in eig.iter().enumerate() {
            let exact = 2.0 - 2.0 * ((j + 1) as f64 * std::f64::consts::PI / 5.0).cos();
            assert!((lambda - exact).abs() < 1e-10, "{lambda} vs {exact}");
        }
    }

    #[test]
    fn test_tridiagonal_eigenvalues_decoupled() {
        let eig = tridiagonal_eigenvalues(&[3.0, -1.0, 2.0], &[0.0, 0.0]);
        assert!((eig[0] + 1.0).abs() < 1e-12);
        assert!((eig[1] - 2.0).abs() < 1e-12);
        assert!((eig[2] - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_relative_change() {
        assert!((relative_change(1.0, 2.0) - 0.5).abs() < 1e-15);
        assert_eq!(relative_change(0.0, 0.0), 0.0);
    }
}
