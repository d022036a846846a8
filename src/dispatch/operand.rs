//! Dense kernel operands: a buffer plus the 2D view a kernel addresses

use crate::container::{Container, DenseLayout, DenseMatrix, Scalar, Span, Vector, View2D};
use crate::dtype::DType;
use crate::error::Result;
use crate::expr::ExprShape;
use crate::runtime::{Buffer, Context};

#[derive(Clone, Debug)]
pub(crate) struct Operand {
    pub(crate) buffer: Buffer,
    pub(crate) view: View2D,
    /// Storage order tag carried to matrix results
    pub(crate) layout: DenseLayout,
}

impl Operand {
    pub(crate) fn from_container(container: &Container) -> Option<Self> {
        container.dense_parts().map(|(buffer, view, layout)| Self {
            buffer: buffer.clone(),
            view,
            layout: layout.unwrap_or_default(),
        })
    }

    /// Fresh contiguous result of `shape`
    pub(crate) fn allocate(
        context: &Context,
        shape: ExprShape,
        dtype: DType,
        layout: DenseLayout,
    ) -> Result<Self> {
        let view = match shape {
            ExprShape::Scalar => View2D::scalar(0),
            ExprShape::Vector(n) => View2D::vector(0, n, 1),
            ExprShape::Matrix(r, c) => View2D::contiguous(r, c, layout),
        };
        Ok(Self {
            buffer: Buffer::new(context, shape.len().max(1), dtype)?,
            view,
            layout,
        })
    }

    /// Deduplication key inside one kernel
    pub(crate) fn key(&self) -> (u64, View2D) {
        (self.buffer.id(), self.view)
    }

    pub(crate) fn transposed(&self) -> Self {
        Self {
            buffer: self.buffer.clone(),
            view: self.view.transposed(),
            layout: self.layout.transposed(),
        }
    }

    pub(crate) fn select(&self, rows: Span, cols: Span) -> Result<Self> {
        Ok(Self {
            buffer: self.buffer.clone(),
            view: self.view.select(rows, cols)?,
            layout: self.layout,
        })
    }

    /// Element triple `(offset, row_stride, col_stride)` for kernel dims
    pub(crate) fn dims(&self) -> [u64; 3] {
        self.view.dims()
    }

    /// Vector pair `(offset, increment)` for kernel dims
    pub(crate) fn vector_dims(&self) -> [u64; 2] {
        [self.view.offset as u64, self.view.row_stride as u64]
    }

    pub(crate) fn layout_of_view(&self) -> DenseLayout {
        if self.view.cols <= 1 || self.view.col_stride == 1 {
            DenseLayout::RowMajor
        } else {
            DenseLayout::ColMajor
        }
    }

    pub(crate) fn into_container(self, shape: ExprShape) -> Result<Container> {
        Ok(match shape {
            ExprShape::Scalar => Container::Scalar(Scalar::from_buffer(self.buffer, self.view.offset)?),
            ExprShape::Vector(n) => Container::Vector(Vector::from_buffer(
                self.buffer,
                self.view.offset,
                n,
                self.view.row_stride.max(1),
            )?),
            ExprShape::Matrix(..) => {
                Container::Matrix(DenseMatrix::from_buffer(self.buffer, self.view, self.layout)?)
            }
        })
    }
}
