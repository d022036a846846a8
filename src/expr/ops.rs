//! Expression builders
//!
//! Every builder validates its operands and returns a new node; nothing is
//! allocated or submitted.

use std::ops::Range;

use super::{Expr, ExprShape, NodeKind};
use crate::container::Span;
use crate::error::{Error, Result};
use crate::runtime::kernel::{BinaryOp, ReduceOp, UnaryOp};

impl Expr {
    // ========================================================================
    // Elementwise
    // ========================================================================

    fn unary(&self, op: UnaryOp) -> Result<Expr> {
        self.check_dense(op.name())?;
        if op.requires_float() && !self.dtype().is_float() {
            return Err(Error::unsupported_dtype(self.dtype(), op.name()));
        }
        Ok(Expr::from_node(
            NodeKind::Unary(op, self.clone()),
            self.shape(),
            self.dtype(),
            self.context().clone(),
        ))
    }

    fn binary(&self, op: BinaryOp, rhs: Expr) -> Result<Expr> {
        let name = op.name();
        self.check_context(name, &rhs)?;
        self.check_dense(name)?;
        rhs.check_dense(name)?;
        self.check_dtype(name, &rhs)?;
        if op.requires_float() && !self.dtype().is_float() {
            return Err(Error::unsupported_dtype(self.dtype(), name));
        }
        let shape = self.shape().broadcast(&rhs.shape()).ok_or_else(|| {
            Error::shape_mismatch(name, &self.shape().extents(), &rhs.shape().extents())
        })?;
        Ok(Expr::from_node(
            NodeKind::Binary(op, self.clone(), rhs),
            shape,
            self.dtype(),
            self.context().clone(),
        ))
    }

    fn host_constant(&self, value: f64) -> Expr {
        Expr::constant(self.context(), value, self.dtype())
    }

    /// `self + rhs`
    pub fn add(&self, rhs: impl Into<Expr>) -> Result<Expr> {
        self.binary(BinaryOp::Add, rhs.into())
    }

    /// `self - rhs`
    pub fn sub(&self, rhs: impl Into<Expr>) -> Result<Expr> {
        self.binary(BinaryOp::Sub, rhs.into())
    }

    /// Elementwise product
    pub fn elementwise_mul(&self, rhs: impl Into<Expr>) -> Result<Expr> {
        self.binary(BinaryOp::Mul, rhs.into())
    }

    /// Elementwise quotient (integer division by zero yields 0)
    pub fn elementwise_div(&self, rhs: impl Into<Expr>) -> Result<Expr> {
        self.binary(BinaryOp::Div, rhs.into())
    }

    /// Elementwise `self ^ rhs` (float dtypes only)
    pub fn pow(&self, rhs: impl Into<Expr>) -> Result<Expr> {
        self.binary(BinaryOp::Pow, rhs.into())
    }

    /// Elementwise maximum
    pub fn elementwise_max(&self, rhs: impl Into<Expr>) -> Result<Expr> {
        self.binary(BinaryOp::Max, rhs.into())
    }

    /// Elementwise minimum
    pub fn elementwise_min(&self, rhs: impl Into<Expr>) -> Result<Expr> {
        self.binary(BinaryOp::Min, rhs.into())
    }

    /// Multiply by a host scalar
    ///
    /// The factor becomes a kernel parameter, so different factors reuse the
    /// same compiled kernel.
    pub fn scale(&self, factor: f64) -> Result<Expr> {
        let c = self.host_constant(factor);
        self.binary(BinaryOp::Mul, c)
    }

    /// Multiply by a device scalar (any scalar-shaped expression)
    pub fn scale_by(&self, factor: impl Into<Expr>) -> Result<Expr> {
        let factor = factor.into();
        if !factor.shape().is_scalar() {
            return Err(Error::shape_mismatch("scale_by", &[], &factor.shape().extents()));
        }
        self.binary(BinaryOp::Mul, factor)
    }

    /// Add a host scalar to every element
    pub fn add_scalar(&self, value: f64) -> Result<Expr> {
        let c = self.host_constant(value);
        self.binary(BinaryOp::Add, c)
    }

    /// `-x`
    pub fn neg(&self) -> Result<Expr> {
        self.unary(UnaryOp::Neg)
    }

    /// `|x|`
    pub fn abs(&self) -> Result<Expr> {
        self.unary(UnaryOp::Abs)
    }

    /// `sqrt(x)`
    pub fn sqrt(&self) -> Result<Expr> {
        self.unary(UnaryOp::Sqrt)
    }

    /// `e^x`
    pub fn exp(&self) -> Result<Expr> {
        self.unary(UnaryOp::Exp)
    }

    /// `ln(x)`
    pub fn log(&self) -> Result<Expr> {
        self.unary(UnaryOp::Log)
    }

    /// `sin(x)`
    pub fn sin(&self) -> Result<Expr> {
        self.unary(UnaryOp::Sin)
    }

    /// `cos(x)`
    pub fn cos(&self) -> Result<Expr> {
        self.unary(UnaryOp::Cos)
    }

    /// `tanh(x)`
    pub fn tanh(&self) -> Result<Expr> {
        self.unary(UnaryOp::Tanh)
    }

    /// `x * x`
    pub fn square(&self) -> Result<Expr> {
        self.unary(UnaryOp::Square)
    }

    // ========================================================================
    // Products
    // ========================================================================

    /// Matrix-vector product `self * x`
    ///
    /// `self` must be a (dense or sparse) matrix of shape `m x n` and `x` a
    /// vector of length `n`.
    pub fn mat_vec(&self, x: impl Into<Expr>) -> Result<Expr> {
        let x = x.into();
        self.check_context("mat_vec", &x)?;
        x.check_dense("mat_vec")?;
        self.check_dtype("mat_vec", &x)?;
        let (rows, cols) = match self.shape() {
            ExprShape::Matrix(r, c) => (r, c),
            other => return Err(Error::shape_mismatch("mat_vec", &[0, 0], &other.extents())),
        };
        match x.shape() {
            ExprShape::Vector(n) if n == cols => {}
            other => return Err(Error::shape_mismatch("mat_vec", &[cols], &other.extents())),
        }
        Ok(Expr::from_node(
            NodeKind::MatVec(self.clone(), x),
            ExprShape::Vector(rows),
            self.dtype(),
            self.context().clone(),
        ))
    }

    /// Matrix product `self * rhs`
    pub fn mat_mul(&self, rhs: impl Into<Expr>) -> Result<Expr> {
        let rhs = rhs.into();
        self.check_context("mat_mul", &rhs)?;
        self.check_dense("mat_mul")?;
        rhs.check_dense("mat_mul")?;
        self.check_dtype("mat_mul", &rhs)?;
        let (m, k, k2, n) = match (self.shape(), rhs.shape()) {
            (ExprShape::Matrix(m, k), ExprShape::Matrix(k2, n)) => (m, k, k2, n),
            (a, b) => return Err(Error::shape_mismatch("mat_mul", &a.extents(), &b.extents())),
        };
        if k != k2 {
            return Err(Error::shape_mismatch("mat_mul", &[m, k], &[k2, n]));
        }
        Ok(Expr::from_node(
            NodeKind::MatMul(self.clone(), rhs),
            ExprShape::Matrix(m, n),
            self.dtype(),
            self.context().clone(),
        ))
    }

    // ========================================================================
    // Views
    // ========================================================================

    /// Transpose; vectors and scalars are returned unchanged
    pub fn transpose(&self) -> Result<Expr> {
        self.check_dense("transpose")?;
        match self.shape() {
            ExprShape::Matrix(r, c) => {
                // transposing twice cancels out
                if let NodeKind::Transpose(inner) = self.kind() {
                    return Ok(inner.clone());
                }
                Ok(Expr::from_node(
                    NodeKind::Transpose(self.clone()),
                    ExprShape::Matrix(c, r),
                    self.dtype(),
                    self.context().clone(),
                ))
            }
            _ => Ok(self.clone()),
        }
    }

    /// Strided sub-matrix
    pub fn slice(&self, rows: Span, cols: Span) -> Result<Expr> {
        self.check_dense("slice")?;
        let (r, c) = match self.shape() {
            ExprShape::Matrix(r, c) => (r, c),
            other => return Err(Error::shape_mismatch("slice", &[0, 0], &other.extents())),
        };
        rows.validate(r)?;
        cols.validate(c)?;
        Ok(Expr::from_node(
            NodeKind::Slice {
                source: self.clone(),
                rows,
                cols,
            },
            ExprShape::Matrix(rows.len, cols.len),
            self.dtype(),
            self.context().clone(),
        ))
    }

    /// Unit-stride sub-matrix
    pub fn range(&self, rows: Range<usize>, cols: Range<usize>) -> Result<Expr> {
        self.slice(Span::range(rows), Span::range(cols))
    }

    /// Strided sub-vector
    pub fn slice_vector(&self, span: Span) -> Result<Expr> {
        let n = match self.shape() {
            ExprShape::Vector(n) => n,
            other => return Err(Error::shape_mismatch("slice_vector", &[0], &other.extents())),
        };
        span.validate(n)?;
        Ok(Expr::from_node(
            NodeKind::Slice {
                source: self.clone(),
                rows: span,
                cols: Span::full(1),
            },
            ExprShape::Vector(span.len),
            self.dtype(),
            self.context().clone(),
        ))
    }

    // ========================================================================
    // Reductions
    // ========================================================================

    fn reduce(&self, op: ReduceOp) -> Result<Expr> {
        self.check_dense(op.name())?;
        Ok(Expr::from_node(
            NodeKind::Reduce(op, self.clone()),
            ExprShape::Scalar,
            self.dtype(),
            self.context().clone(),
        ))
    }

    /// Sum of all elements (0 when empty)
    pub fn sum(&self) -> Result<Expr> {
        self.reduce(ReduceOp::Sum)
    }

    /// Largest element (the dtype's lowest value when empty)
    pub fn max(&self) -> Result<Expr> {
        self.reduce(ReduceOp::Max)
    }

    /// Smallest element (the dtype's highest value when empty)
    pub fn min(&self) -> Result<Expr> {
        self.reduce(ReduceOp::Min)
    }

    /// Inner product of two vectors (or Frobenius product of matrices)
    pub fn dot(&self, rhs: impl Into<Expr>) -> Result<Expr> {
        let rhs = rhs.into();
        if self.shape() != rhs.shape() {
            return Err(Error::shape_mismatch("dot", &self.shape().extents(), &rhs.shape().extents()));
        }
        self.elementwise_mul(rhs)?.sum()
    }

    /// `sum |x|`
    pub fn norm_1(&self) -> Result<Expr> {
        self.abs()?.sum()
    }

    /// `sqrt(sum x^2)` (float dtypes only)
    pub fn norm_2(&self) -> Result<Expr> {
        if !self.dtype().is_float() {
            return Err(Error::unsupported_dtype(self.dtype(), "norm_2"));
        }
        self.square()?.sum()?.sqrt()
    }

    /// `max |x|` (0 when empty)
    pub fn norm_inf(&self) -> Result<Expr> {
        self.check_dense("norm_inf")?;
        if self.shape().is_empty() {
            return Ok(self.host_constant(0.0));
        }
        self.abs()?.max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{DenseLayout, DenseMatrix, Vector};
    use crate::dtype::DType;
    use crate::runtime::Context;

    #[test]
    fn test_shape_inference() {
        let ctx = Context::host();
        let a = DenseMatrix::zeros(&ctx, 3, 4, DType::F64, DenseLayout::RowMajor).unwrap();
        let x = Vector::zeros(&ctx, 4, DType::F64).unwrap();
        let e = Expr::from(&a).mat_vec(&x).unwrap();
        assert_eq!(e.shape(), ExprShape::Vector(3));
        let t = Expr::from(&a).transpose().unwrap();
        assert_eq!(t.shape(), ExprShape::Matrix(4, 3));
        assert_eq!(t.mat_mul(&a).unwrap().shape(), ExprShape::Matrix(4, 4));
        assert_eq!(Expr::from(&x).norm_2().unwrap().shape(), ExprShape::Scalar);
        assert_eq!(
            Expr::from(&a).range(1..3, 0..4).unwrap().shape(),
            ExprShape::Matrix(2, 4)
        );
    }

    #[test]
    fn test_construction_errors_have_no_side_effects() {
        let ctx = Context::host();
        let a = DenseMatrix::zeros(&ctx, 3, 4, DType::F64, DenseLayout::RowMajor).unwrap();
        let x = Vector::zeros(&ctx, 5, DType::F64).unwrap();
        let before = ctx.stats();
        let err = Expr::from(&a).mat_vec(&x).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
        assert_eq!(ctx.stats(), before);
    }

    #[test]
    fn test_dtype_and_context_checks() {
        let ctx = Context::host();
        let other = Context::host();
        let a = Vector::zeros(&ctx, 3, DType::F64).unwrap();
        let b = Vector::zeros(&ctx, 3, DType::F32).unwrap();
        let c = Vector::zeros(&other, 3, DType::F64).unwrap();
        assert!(matches!(
            Expr::from(&a).add(&b),
            Err(Error::DTypeMismatch { .. })
        ));
        assert!(matches!(
            Expr::from(&a).add(&c),
            Err(Error::CrossContextOperation { .. })
        ));
    }

    #[test]
    fn test_float_only_ops_rejected_for_integers() {
        let ctx = Context::host();
        let v = Vector::zeros(&ctx, 3, DType::I32).unwrap();
        assert!(matches!(
            Expr::from(&v).sqrt(),
            Err(Error::UnsupportedDType { .. })
        ));
        assert!(Expr::from(&v).abs().is_ok());
    }

    #[test]
    fn test_double_transpose_is_identity_node() {
        let ctx = Context::host();
        let a = DenseMatrix::zeros(&ctx, 2, 3, DType::F32, DenseLayout::ColMajor).unwrap();
        let e = Expr::from(&a);
        let tt = e.transpose().unwrap().transpose().unwrap();
        assert_eq!(tt.id(), e.id());
    }
}
