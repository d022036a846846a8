//! Dense triangular solves
//!
//! Forward substitution for lower triangular systems and back substitution
//! for upper triangular ones, with one or many right-hand sides. The solve is
//! a single kernel; right-hand side columns are independent.

use log::trace;

use crate::container::{Container, DenseMatrix};
use crate::error::{Error, Result};
use crate::expr::{Expr, ExprShape};
use crate::runtime::kernel::{KernelArgs, KernelOp, KernelSignature, Triangle};

/// A pivot is unusable when it is zero, subnormal or non-finite
fn check_diagonal(a: &DenseMatrix) -> Result<()> {
    let n = a.rows();
    let diagonal = a.diagonal()?.to_host()?;
    let data = diagonal.data();
    let tiny = a.dtype().min_positive();
    for index in 0..n {
        let value = data
            .get_f64(index)
            .ok_or_else(|| Error::Internal("diagonal shorter than the matrix".into()))?;
        if !value.is_finite() || value.abs() < tiny {
            return Err(Error::SingularSystem { index, value });
        }
    }
    Ok(())
}

/// Solve `A X = B` where `A` is triangular
///
/// `b` is a vector of length `n` or an `n x k` dense matrix expression; the
/// result has the same shape. Only the selected triangle of `a` is read.
/// With `unit_diagonal` the diagonal is taken to be all ones and never read.
///
/// # Errors
///
/// - `ShapeMismatch` if `a` is not square or `b` does not have `n` rows
/// - `SingularSystem` if a diagonal entry is zero, subnormal or non-finite
pub fn solve_triangular(
    a: &DenseMatrix,
    b: impl Into<Expr>,
    triangle: Triangle,
    unit_diagonal: bool,
) -> Result<Container> {
    let b = b.into();
    let n = a.rows();
    if a.cols() != n {
        return Err(Error::shape_mismatch("solve_triangular", &[n, n], &[n, a.cols()]));
    }
    let rhs_cols = match b.shape() {
        ExprShape::Vector(len) if len == n => 1,
        ExprShape::Matrix(rows, cols) if rows == n => cols,
        other => return Err(Error::shape_mismatch("solve_triangular", &[n], &other.extents())),
    };
    b.check_dense("solve_triangular")?;
    if a.context() != b.context() {
        return Err(Error::CrossContextOperation {
            op: "solve_triangular",
            lhs: a.context().id(),
            rhs: b.context().id(),
        });
    }
    if a.dtype() != b.dtype() {
        return Err(Error::dtype_mismatch("solve_triangular", a.dtype(), b.dtype()));
    }
    if !a.dtype().is_float() {
        return Err(Error::unsupported_dtype(a.dtype(), "solve_triangular"));
    }
    if !unit_diagonal {
        check_diagonal(a)?;
    }

    // X starts as a private copy of B and is solved in place
    let context = a.context();
    let x = context.evaluate(&b)?;
    let (x_buffer, x_view, _) = x
        .dense_parts()
        .ok_or_else(|| Error::Internal("triangular right-hand side is not dense".into()))?;

    let mut dims = vec![n as u64, rhs_cols as u64];
    dims.extend(a.view().dims());
    dims.extend(x_view.dims());
    let args = KernelArgs::new()
        .input(a.buffer())
        .output(x_buffer)
        .dims(&dims);
    let signature = KernelSignature::new(
        KernelOp::TriangularSolve {
            triangle,
            unit_diagonal,
        },
        a.dtype(),
    );
    let kernel = context.compile_or_fetch(&signature)?;
    trace!("solve_triangular {triangle:?} n={n} nrhs={rhs_cols}");
    context.launch(&kernel, args)?.wait()?;
    Ok(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{DenseLayout, Vector};
    use crate::runtime::Context;

    #[test]
    fn test_lower_vector() {
        let ctx = Context::host();
        #[rustfmt::skip]
        let l = [
            2.0, 0.0, 0.0,
            1.0, 1.0, 0.0,
            3.0, 2.0, 4.0,
        ];
        let a = DenseMatrix::from_slice(&ctx, &l, 3, 3, DenseLayout::RowMajor).unwrap();
        let b = Vector::from_slice(&ctx, &[2.0, 3.0, 15.0]).unwrap();
        let x = solve_triangular(&a, &b, Triangle::Lower, false)
            .unwrap()
            .into_vector()
            .unwrap();
        // x = [1, 2, (15 - 3 - 4) / 4]
        assert_eq!(x.to_vec::<f64>().unwrap(), vec![1.0, 2.0, 2.0]);
        // b is untouched
        assert_eq!(b.to_vec::<f64>().unwrap(), vec![2.0, 3.0, 15.0]);
    }

    #[test]
    fn test_unit_upper_ignores_diagonal() {
        let ctx = Context::host();
        let u = [9.0, 2.0, 0.0, 9.0];
        let a = DenseMatrix::from_slice(&ctx, &u, 2, 2, DenseLayout::ColMajor).unwrap();
        // column-major: a = [[9, 0], [2, 9]], upper part above diagonal is 0
        let b = Vector::from_slice(&ctx, &[1.0, 1.0]).unwrap();
        let x = solve_triangular(&a, &b, Triangle::Upper, true).unwrap();
        assert_eq!(x.into_vector().unwrap().to_vec::<f64>().unwrap(), vec![1.0, 1.0]);
    }

    #[test]
    fn test_singular_diagonal() {
        let ctx = Context::host();
        let a = DenseMatrix::from_slice(&ctx, &[1.0, 0.0, 5.0, 0.0], 2, 2, DenseLayout::RowMajor)
            .unwrap();
        let b = Vector::from_slice(&ctx, &[1.0, 1.0]).unwrap();
        assert!(matches!(
            solve_triangular(&a, &b, Triangle::Lower, false),
            Err(Error::SingularSystem { index: 1, .. })
        ));
    }

    #[test]
    fn test_widely_scaled_diagonal_solves() {
        let ctx = Context::host();
        let a = DenseMatrix::from_slice(&ctx, &[1e8f32, 0.0, 0.0, 1.0], 2, 2, DenseLayout::RowMajor)
            .unwrap();
        let b = Vector::from_slice(&ctx, &[1e8f32, 1.0]).unwrap();
        let x = solve_triangular(&a, &b, Triangle::Lower, false).unwrap();
        assert_eq!(x.into_vector().unwrap().to_vec::<f32>().unwrap(), vec![1.0, 1.0]);
    }

    #[test]
    fn test_shape_mismatch() {
        let ctx = Context::host();
        let a = DenseMatrix::zeros(&ctx, 3, 3, crate::dtype::DType::F64, DenseLayout::RowMajor)
            .unwrap();
        let b = Vector::from_slice(&ctx, &[1.0, 1.0]).unwrap();
        assert!(matches!(
            solve_triangular(&a, &b, Triangle::Upper, false),
            Err(Error::ShapeMismatch { .. })
        ));
    }
}
