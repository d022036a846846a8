//! Strided 2D views over buffers

use serde::{Deserialize, Serialize};
use std::ops::Range;

use crate::error::{Error, Result};

/// Storage order of a dense matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenseLayout {
    /// Rows are contiguous (C order)
    #[default]
    RowMajor,
    /// Columns are contiguous (Fortran order)
    ColMajor,
}

impl DenseLayout {
    /// The other layout
    pub fn transposed(self) -> Self {
        match self {
            Self::RowMajor => Self::ColMajor,
            Self::ColMajor => Self::RowMajor,
        }
    }
}

/// A strided index range: `start, start + step, ..., start + (len - 1) * step`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Span {
    /// First index
    pub start: usize,
    /// Distance between consecutive indices (at least 1)
    pub step: usize,
    /// Number of indices
    pub len: usize,
}

impl Span {
    /// Create a strided span
    pub fn new(start: usize, step: usize, len: usize) -> Self {
        Self { start, step, len }
    }

    /// Unit-stride span covering `range`
    pub fn range(range: Range<usize>) -> Self {
        Self {
            start: range.start,
            step: 1,
            len: range.end.saturating_sub(range.start),
        }
    }

    /// Span covering `0..len`
    pub fn full(len: usize) -> Self {
        Self::new(0, 1, len)
    }

    /// Check the span against a dimension of size `size`
    pub fn validate(&self, size: usize) -> Result<()> {
        if self.step == 0 {
            return Err(Error::InvalidArgument {
                arg: "step",
                reason: "slice step must be at least 1".into(),
            });
        }
        if self.len == 0 {
            if self.start > size {
                return Err(Error::IndexOutOfBounds {
                    index: self.start,
                    size,
                });
            }
            return Ok(());
        }
        let last = self.start + (self.len - 1) * self.step;
        if last >= size {
            return Err(Error::IndexOutOfBounds { index: last, size });
        }
        Ok(())
    }
}

impl From<Range<usize>> for Span {
    fn from(range: Range<usize>) -> Self {
        Self::range(range)
    }
}

/// Element offset, extent and strides of a 2D view (all in elements)
///
/// Vectors are `len x 1` views with a zero column stride; scalars are `1 x 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct View2D {
    /// First element
    pub offset: usize,
    /// Number of rows
    pub rows: usize,
    /// Number of columns
    pub cols: usize,
    /// Elements between consecutive rows
    pub row_stride: usize,
    /// Elements between consecutive columns
    pub col_stride: usize,
}

impl View2D {
    /// Contiguous view of a fresh `rows x cols` allocation
    pub fn contiguous(rows: usize, cols: usize, layout: DenseLayout) -> Self {
        let (row_stride, col_stride) = match layout {
            DenseLayout::RowMajor => (cols, 1),
            DenseLayout::ColMajor => (1, rows),
        };
        Self {
            offset: 0,
            rows,
            cols,
            row_stride,
            col_stride,
        }
    }

    /// Vector view: `len` elements, `stride` apart
    pub fn vector(offset: usize, len: usize, stride: usize) -> Self {
        Self {
            offset,
            rows: len,
            cols: 1,
            row_stride: stride,
            col_stride: 0,
        }
    }

    /// Single element at `offset`
    pub fn scalar(offset: usize) -> Self {
        Self {
            offset,
            rows: 1,
            cols: 1,
            row_stride: 0,
            col_stride: 0,
        }
    }

    /// Number of addressed elements
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    /// Whether the view addresses no elements
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element index of `(r, c)`
    #[inline]
    pub fn index(&self, r: usize, c: usize) -> usize {
        self.offset + r * self.row_stride + c * self.col_stride
    }

    /// Minimum buffer length (in elements) the view needs
    pub fn required_len(&self) -> usize {
        if self.is_empty() {
            self.offset
        } else {
            self.index(self.rows - 1, self.cols - 1) + 1
        }
    }

    /// Check the view fits a buffer of `len` elements
    pub fn check_fits(&self, len: usize) -> Result<()> {
        let need = self.required_len();
        if need > len {
            return Err(Error::IndexOutOfBounds {
                index: need - 1,
                size: len,
            });
        }
        Ok(())
    }

    /// Swap rows and columns (zero-copy transpose)
    pub fn transposed(&self) -> Self {
        Self {
            offset: self.offset,
            rows: self.cols,
            cols: self.rows,
            row_stride: self.col_stride,
            col_stride: self.row_stride,
        }
    }

    /// Sub-view selecting `rows` and `cols` spans of this view
    pub fn select(&self, rows: Span, cols: Span) -> Result<Self> {
        rows.validate(self.rows)?;
        cols.validate(self.cols)?;
        Ok(Self {
            offset: self.offset + rows.start * self.row_stride + cols.start * self.col_stride,
            rows: rows.len,
            cols: cols.len,
            row_stride: self.row_stride * rows.step,
            col_stride: self.col_stride * cols.step,
        })
    }

    /// Contiguous in `layout` order starting at `offset`
    pub fn is_contiguous(&self, layout: DenseLayout) -> bool {
        match layout {
            DenseLayout::RowMajor => {
                (self.cols <= 1 || self.col_stride == 1)
                    && (self.rows <= 1 || self.row_stride == self.cols)
            }
            DenseLayout::ColMajor => {
                (self.rows <= 1 || self.row_stride == 1)
                    && (self.cols <= 1 || self.col_stride == self.rows)
            }
        }
    }

    /// Kernel dims triple `(offset, row_stride, col_stride)`
    pub(crate) fn dims(&self) -> [u64; 3] {
        [
            self.offset as u64,
            self.row_stride as u64,
            self.col_stride as u64,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contiguous_views() {
        let rm = View2D::contiguous(3, 4, DenseLayout::RowMajor);
        assert_eq!(rm.index(1, 2), 6);
        assert_eq!(rm.required_len(), 12);
        assert!(rm.is_contiguous(DenseLayout::RowMajor));
        assert!(!rm.is_contiguous(DenseLayout::ColMajor));

        let cm = View2D::contiguous(3, 4, DenseLayout::ColMajor);
        assert_eq!(cm.index(1, 2), 7);
        assert!(cm.is_contiguous(DenseLayout::ColMajor));
        assert!(rm.transposed().is_contiguous(DenseLayout::ColMajor));
    }

    #[test]
    fn test_select() {
        let base = View2D::contiguous(4, 5, DenseLayout::RowMajor);
        let sub = base.select(Span::range(1..3), Span::new(0, 2, 3)).unwrap();
        assert_eq!((sub.rows, sub.cols), (2, 3));
        assert_eq!(sub.index(0, 0), 5);
        assert_eq!(sub.index(1, 2), 14);
        assert!(sub.check_fits(20).is_ok());

        assert!(base.select(Span::range(2..5), Span::full(5)).is_err());
        assert!(base.select(Span::new(0, 0, 2), Span::full(5)).is_err());
    }

    #[test]
    fn test_span_validate() {
        assert!(Span::new(1, 3, 3).validate(8).is_ok());
        assert!(Span::new(1, 3, 3).validate(7).is_err());
        assert!(Span::range(3..3).validate(3).is_ok());
    }
}
