//! Dense matrices in row- or column-major storage

use std::ops::Range;

use super::host::{HostArray, HostData, HostView};
use super::{Container, DenseLayout, Span, Vector, View2D, gather};
use crate::dispatch_dtype;
use crate::dtype::{DType, Element};
use crate::error::{Error, Result};
use crate::expr::Expr;
use crate::runtime::{Buffer, Context};

/// A dense matrix, or a strided window into one
///
/// `layout` records the storage order of the underlying allocation. Views
/// produced by `range`, `slice`, `row`, `column` and `diagonal` share the
/// buffer; `transposed` swaps the strides and flips the layout tag.
#[derive(Clone, Debug)]
pub struct DenseMatrix {
    buffer: Buffer,
    view: View2D,
    layout: DenseLayout,
}

impl DenseMatrix {
    /// Upload `rows x cols` elements stored contiguously in `layout` order
    pub fn from_slice<T: Element>(
        context: &Context,
        data: &[T],
        rows: usize,
        cols: usize,
        layout: DenseLayout,
    ) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(Error::shape_mismatch("matrix_from_slice", &[rows, cols], &[data.len()]));
        }
        let buffer = Buffer::from_slice(context, data)?;
        Ok(Self {
            buffer,
            view: View2D::contiguous(rows, cols, layout),
            layout,
        })
    }

    /// Pack a strided host matrix into a fresh buffer with `layout`
    pub fn from_view<T: Element>(
        context: &Context,
        view: &HostView<'_, T>,
        layout: DenseLayout,
    ) -> Result<Self> {
        let packed = view.pack(layout);
        Self::from_slice(context, &packed, view.rows(), view.cols(), layout)
    }

    /// Upload a 2-dimensional host array, keeping its layout
    pub fn from_host(context: &Context, array: &HostArray) -> Result<Self> {
        let (rows, cols) = match array.shape() {
            [r, c] => (*r, *c),
            other => return Err(Error::shape_mismatch("matrix_from_host", &[0, 0], other)),
        };
        let layout = array.layout();
        match array.data() {
            HostData::F64(v) => Self::from_slice(context, v.as_slice(), rows, cols, layout),
            HostData::F32(v) => Self::from_slice(context, v.as_slice(), rows, cols, layout),
            HostData::I64(v) => Self::from_slice(context, v.as_slice(), rows, cols, layout),
            HostData::I32(v) => Self::from_slice(context, v.as_slice(), rows, cols, layout),
        }
    }

    /// A zero matrix
    pub fn zeros(
        context: &Context,
        rows: usize,
        cols: usize,
        dtype: DType,
        layout: DenseLayout,
    ) -> Result<Self> {
        Ok(Self {
            buffer: Buffer::new(context, rows * cols, dtype)?,
            view: View2D::contiguous(rows, cols, layout),
            layout,
        })
    }

    /// The `n x n` identity
    pub fn identity(context: &Context, n: usize, dtype: DType, layout: DenseLayout) -> Result<Self> {
        dispatch_dtype!(dtype, T => {
            let mut data = vec![T::zero(); n * n];
            for i in 0..n {
                data[i * n + i] = T::from_f64(1.0);
            }
            Self::from_slice(context, &data, n, n, layout)
        })
    }

    /// View an existing buffer through an explicit 2D view
    pub fn from_buffer(buffer: Buffer, view: View2D, layout: DenseLayout) -> Result<Self> {
        view.check_fits(buffer.len())?;
        Ok(Self {
            buffer,
            view,
            layout,
        })
    }

    /// Number of rows
    pub fn rows(&self) -> usize {
        self.view.rows
    }

    /// Number of columns
    pub fn cols(&self) -> usize {
        self.view.cols
    }

    /// `(rows, cols)`
    pub fn shape(&self) -> (usize, usize) {
        (self.view.rows, self.view.cols)
    }

    /// Storage order of the underlying allocation
    pub fn layout(&self) -> DenseLayout {
        self.layout
    }

    /// Element dtype
    pub fn dtype(&self) -> DType {
        self.buffer.dtype()
    }

    /// Owning context
    pub fn context(&self) -> &Context {
        self.buffer.context()
    }

    /// Underlying buffer
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    /// Offset and strides of this view
    pub fn view(&self) -> View2D {
        self.view
    }

    /// Whether the view is a contiguous block in its layout order
    pub fn is_contiguous(&self) -> bool {
        self.view.is_contiguous(self.layout)
    }

    // ========================================================================
    // Views
    // ========================================================================

    /// Zero-copy sub-matrix over unit-stride row and column ranges
    pub fn range(&self, rows: Range<usize>, cols: Range<usize>) -> Result<DenseMatrix> {
        self.slice(Span::range(rows), Span::range(cols))
    }

    /// Zero-copy strided sub-matrix
    pub fn slice(&self, rows: Span, cols: Span) -> Result<DenseMatrix> {
        Ok(Self {
            buffer: self.buffer.clone(),
            view: self.view.select(rows, cols)?,
            layout: self.layout,
        })
    }

    /// Zero-copy transpose
    pub fn transposed(&self) -> DenseMatrix {
        Self {
            buffer: self.buffer.clone(),
            view: self.view.transposed(),
            layout: self.layout.transposed(),
        }
    }

    /// Row `i` as a vector view
    pub fn row(&self, i: usize) -> Result<Vector> {
        if i >= self.rows() {
            return Err(Error::IndexOutOfBounds {
                index: i,
                size: self.rows(),
            });
        }
        Vector::from_buffer(
            self.buffer.clone(),
            self.view.index(i, 0),
            self.cols(),
            self.view.col_stride.max(1),
        )
    }

    /// Column `j` as a vector view
    pub fn column(&self, j: usize) -> Result<Vector> {
        if j >= self.cols() {
            return Err(Error::IndexOutOfBounds {
                index: j,
                size: self.cols(),
            });
        }
        Vector::from_buffer(
            self.buffer.clone(),
            self.view.index(0, j),
            self.rows(),
            self.view.row_stride.max(1),
        )
    }

    /// Main diagonal as a vector view
    pub fn diagonal(&self) -> Result<Vector> {
        let len = self.rows().min(self.cols());
        Vector::from_buffer(
            self.buffer.clone(),
            self.view.offset,
            len,
            (self.view.row_stride + self.view.col_stride).max(1),
        )
    }

    // ========================================================================
    // Host transfer and conversion
    // ========================================================================

    /// Copy the elements to the host in `layout` order
    pub fn to_vec<T: Element>(&self, layout: DenseLayout) -> Result<Vec<T>> {
        gather::<T>(&self.buffer, &self.view, layout)
    }

    /// Copy to the host, packed in this matrix's layout
    pub fn to_host(&self) -> Result<HostArray> {
        dispatch_dtype!(self.dtype(), T => {
            HostArray::new(self.to_vec::<T>(self.layout)?, &[self.rows(), self.cols()], self.layout)
        })
    }

    /// Copy into a fresh matrix stored in `layout`
    pub fn to_layout(&self, layout: DenseLayout) -> Result<DenseMatrix> {
        let target = Self::zeros(self.context(), self.rows(), self.cols(), self.dtype(), layout)?;
        self.context()
            .assign(&Container::Matrix(target.clone()), &Expr::from(self))?;
        Ok(target)
    }
}
