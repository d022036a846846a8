//! Containers: typed, shaped views over device buffers
//!
//! ```text
//! Container
//! ├── Scalar       one device value
//! ├── Vector       strided 1D view
//! ├── DenseMatrix  strided 2D view, row- or column-major storage
//! └── SparseMatrix CSR / COO / ELL / HYB index + value buffers
//! ```
//!
//! Construction from host data copies synchronously; `to_host` waits for
//! pending writes. Shape metadata is always checked against the buffer length
//! when a view is created.

mod dense;
mod host;
mod scalar;
mod vector;
mod view;

pub use dense::DenseMatrix;
pub use host::{HostArray, HostData, HostView, IntoHostData};
pub use scalar::Scalar;
pub use vector::Vector;
pub use view::{DenseLayout, Span, View2D};

use crate::dtype::{DType, Element};
use crate::error::{Error, Result};
use crate::expr::{Expr, ExprShape};
use crate::runtime::{Buffer, Context};
use crate::sparse::SparseMatrix;

/// Any container kind
#[derive(Clone, Debug)]
pub enum Container {
    /// Device scalar
    Scalar(Scalar),
    /// Dense vector
    Vector(Vector),
    /// Dense matrix
    Matrix(DenseMatrix),
    /// Sparse matrix
    Sparse(SparseMatrix),
}

impl Container {
    /// Element dtype
    pub fn dtype(&self) -> DType {
        match self {
            Self::Scalar(s) => s.dtype(),
            Self::Vector(v) => v.dtype(),
            Self::Matrix(m) => m.dtype(),
            Self::Sparse(s) => s.dtype(),
        }
    }

    /// Owning context
    pub fn context(&self) -> &Context {
        match self {
            Self::Scalar(s) => s.context(),
            Self::Vector(v) => v.context(),
            Self::Matrix(m) => m.context(),
            Self::Sparse(s) => s.context(),
        }
    }

    /// Logical shape
    pub fn shape(&self) -> ExprShape {
        match self {
            Self::Scalar(_) => ExprShape::Scalar,
            Self::Vector(v) => ExprShape::Vector(v.len()),
            Self::Matrix(m) => ExprShape::Matrix(m.rows(), m.cols()),
            Self::Sparse(s) => ExprShape::Matrix(s.rows(), s.cols()),
        }
    }

    /// Kind name for diagnostics
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Scalar(_) => "scalar",
            Self::Vector(_) => "vector",
            Self::Matrix(_) => "dense matrix",
            Self::Sparse(_) => "sparse matrix",
        }
    }

    /// Dense buffer and view, if this is a dense container
    pub(crate) fn dense_parts(&self) -> Option<(&Buffer, View2D, Option<DenseLayout>)> {
        match self {
            Self::Scalar(s) => Some((s.buffer(), s.view(), None)),
            Self::Vector(v) => Some((v.buffer(), v.view(), None)),
            Self::Matrix(m) => Some((m.buffer(), m.view(), Some(m.layout()))),
            Self::Sparse(_) => None,
        }
    }

    /// Copy a dense container to the host
    pub fn to_host(&self) -> Result<HostArray> {
        match self {
            Self::Scalar(s) => s.to_host(),
            Self::Vector(v) => v.to_host(),
            Self::Matrix(m) => m.to_host(),
            Self::Sparse(_) => Err(Error::unsupported(
                "to_host",
                "sparse matrices export through SparseMatrix::to_host",
            )),
        }
    }

    /// Borrow as a scalar
    pub fn as_scalar(&self) -> Option<&Scalar> {
        match self {
            Self::Scalar(s) => Some(s),
            _ => None,
        }
    }

    /// Borrow as a vector
    pub fn as_vector(&self) -> Option<&Vector> {
        match self {
            Self::Vector(v) => Some(v),
            _ => None,
        }
    }

    /// Borrow as a dense matrix
    pub fn as_matrix(&self) -> Option<&DenseMatrix> {
        match self {
            Self::Matrix(m) => Some(m),
            _ => None,
        }
    }

    /// Borrow as a sparse matrix
    pub fn as_sparse(&self) -> Option<&SparseMatrix> {
        match self {
            Self::Sparse(s) => Some(s),
            _ => None,
        }
    }

    /// Unwrap a scalar result
    pub fn into_scalar(self) -> Result<Scalar> {
        match self {
            Self::Scalar(s) => Ok(s),
            other => Err(Error::unsupported("into_scalar", format!("container is a {}", other.kind_name()))),
        }
    }

    /// Unwrap a vector result
    pub fn into_vector(self) -> Result<Vector> {
        match self {
            Self::Vector(v) => Ok(v),
            other => Err(Error::unsupported("into_vector", format!("container is a {}", other.kind_name()))),
        }
    }

    /// Unwrap a dense matrix result
    pub fn into_matrix(self) -> Result<DenseMatrix> {
        match self {
            Self::Matrix(m) => Ok(m),
            other => Err(Error::unsupported("into_matrix", format!("container is a {}", other.kind_name()))),
        }
    }

    /// Largest absolute elementwise difference `max |self - other|`
    ///
    /// Computed on the device as `norm_inf(self - other)`; both containers
    /// must share shape, dtype and context.
    pub fn max_abs_diff(&self, other: &Container) -> Result<f64> {
        let diff = Expr::from(self).sub(other)?.norm_inf()?;
        self.context().evaluate(&diff)?.into_scalar()?.to_f64()
    }
}

impl From<Scalar> for Container {
    fn from(s: Scalar) -> Self {
        Self::Scalar(s)
    }
}

impl From<Vector> for Container {
    fn from(v: Vector) -> Self {
        Self::Vector(v)
    }
}

impl From<DenseMatrix> for Container {
    fn from(m: DenseMatrix) -> Self {
        Self::Matrix(m)
    }
}

impl From<SparseMatrix> for Container {
    fn from(s: SparseMatrix) -> Self {
        Self::Sparse(s)
    }
}

/// Copy the elements addressed by `view` to the host in `layout` order
pub(crate) fn gather<T: Element>(buffer: &Buffer, view: &View2D, layout: DenseLayout) -> Result<Vec<T>> {
    if view.is_empty() {
        return Ok(Vec::new());
    }
    view.check_fits(buffer.len())?;
    if view.is_contiguous(layout) {
        return buffer.read_range::<T>(view.offset, view.len());
    }
    let start = view.offset;
    let raw = buffer.read_range::<T>(start, view.required_len() - start)?;
    let at = |r: usize, c: usize| raw[view.index(r, c) - start];
    let mut out = Vec::with_capacity(view.len());
    match layout {
        DenseLayout::RowMajor => {
            for r in 0..view.rows {
                for c in 0..view.cols {
                    out.push(at(r, c));
                }
            }
        }
        DenseLayout::ColMajor => {
            for c in 0..view.cols {
                for r in 0..view.rows {
                    out.push(at(r, c));
                }
            }
        }
    }
    Ok(out)
}
