//! Host-side data exchange types

use crate::dtype::{DType, Element};
use crate::error::{Error, Result};

use super::DenseLayout;

/// Typed host data, one variant per dtype
#[derive(Debug, Clone, PartialEq)]
pub enum HostData {
    /// 64-bit floats
    F64(Vec<f64>),
    /// 32-bit floats
    F32(Vec<f32>),
    /// 64-bit ints
    I64(Vec<i64>),
    /// 32-bit ints
    I32(Vec<i32>),
}

/// Conversion between typed vectors and [`HostData`]
pub trait IntoHostData: Element {
    /// Wrap a vector
    fn into_host_data(data: Vec<Self>) -> HostData;
    /// Borrow the vector if the variant matches
    fn from_host_data(data: &HostData) -> Option<&[Self]>;
}

macro_rules! impl_host_data {
    ($ty:ty, $variant:ident) => {
        impl IntoHostData for $ty {
            fn into_host_data(data: Vec<Self>) -> HostData {
                HostData::$variant(data)
            }

            fn from_host_data(data: &HostData) -> Option<&[Self]> {
                match data {
                    HostData::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

impl_host_data!(f64, F64);
impl_host_data!(f32, F32);
impl_host_data!(i64, I64);
impl_host_data!(i32, I32);

impl HostData {
    /// Element dtype
    pub fn dtype(&self) -> DType {
        match self {
            Self::F64(_) => DType::F64,
            Self::F32(_) => DType::F32,
            Self::I64(_) => DType::I64,
            Self::I32(_) => DType::I32,
        }
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        match self {
            Self::F64(v) => v.len(),
            Self::F32(v) => v.len(),
            Self::I64(v) => v.len(),
            Self::I32(v) => v.len(),
        }
    }

    /// Whether there are no elements
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element `i` converted to f64
    pub fn get_f64(&self, i: usize) -> Option<f64> {
        match self {
            Self::F64(v) => v.get(i).copied(),
            Self::F32(v) => v.get(i).map(|&x| x as f64),
            Self::I64(v) => v.get(i).map(|&x| x as f64),
            Self::I32(v) => v.get(i).map(|&x| x as f64),
        }
    }
}

/// Dense host array returned by `to_host`: data, shape and storage order
///
/// Shapes are `[]` for scalars, `[n]` for vectors and `[rows, cols]` for
/// matrices.
#[derive(Debug, Clone, PartialEq)]
pub struct HostArray {
    data: HostData,
    shape: Vec<usize>,
    layout: DenseLayout,
}

impl HostArray {
    /// Build from typed data, checking the element count
    pub fn new<T: IntoHostData>(data: Vec<T>, shape: &[usize], layout: DenseLayout) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(Error::shape_mismatch("host_array", &[expected], &[data.len()]));
        }
        Ok(Self {
            data: T::into_host_data(data),
            shape: shape.to_vec(),
            layout,
        })
    }

    /// Element dtype
    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    /// Shape
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Storage order of the data
    pub fn layout(&self) -> DenseLayout {
        self.layout
    }

    /// Raw typed data
    pub fn data(&self) -> &HostData {
        &self.data
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether there are no elements
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Borrow the data as `&[T]` in storage order
    pub fn as_slice<T: IntoHostData>(&self) -> Result<&[T]> {
        T::from_host_data(&self.data)
            .ok_or_else(|| Error::dtype_mismatch("host_array", self.dtype(), T::DTYPE))
    }

    /// Copy the data into a row-major vector of `T`
    pub fn to_row_major<T: IntoHostData>(&self) -> Result<Vec<T>> {
        let data = self.as_slice::<T>()?;
        match (self.layout, self.shape.as_slice()) {
            (DenseLayout::ColMajor, &[rows, cols]) => {
                let mut out = Vec::with_capacity(rows * cols);
                for r in 0..rows {
                    for c in 0..cols {
                        out.push(data[c * rows + r]);
                    }
                }
                Ok(out)
            }
            _ => Ok(data.to_vec()),
        }
    }

    /// Element at `(row, col)` as f64 (vectors use `col == 0`)
    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        let index = match self.shape.as_slice() {
            [] => 0,
            [n] => {
                if row >= *n || col != 0 {
                    return None;
                }
                row
            }
            [rows, cols] => {
                if row >= *rows || col >= *cols {
                    return None;
                }
                match self.layout {
                    DenseLayout::RowMajor => row * cols + col,
                    DenseLayout::ColMajor => col * rows + row,
                }
            }
            _ => return None,
        };
        self.data.get_f64(index)
    }

    /// Largest absolute elementwise difference to another array of equal shape
    pub fn max_abs_diff(&self, other: &HostArray) -> Result<f64> {
        if self.shape != other.shape {
            return Err(Error::shape_mismatch("max_abs_diff", &self.shape, &other.shape));
        }
        let (rows, cols) = match self.shape.as_slice() {
            [] => (1, 1),
            [n] => (*n, 1),
            [r, c] => (*r, *c),
            _ => return Err(Error::Internal("host arrays have at most 2 dimensions".into())),
        };
        let mut max = 0.0f64;
        for r in 0..rows {
            for c in 0..cols {
                let (a, b) = match (self.get(r, c), other.get(r, c)) {
                    (Some(a), Some(b)) => (a, b),
                    _ => return Err(Error::IndexOutOfBounds { index: r, size: rows }),
                };
                let diff = (a - b).abs();
                if diff.is_nan() {
                    return Ok(f64::NAN);
                }
                max = max.max(diff);
            }
        }
        Ok(max)
    }
}

/// Borrowed strided host matrix used as construction input
///
/// Element `(r, c)` lives at `data[offset + r * row_stride + c * col_stride]`,
/// which covers row-major, column-major and sliced inputs.
#[derive(Debug, Clone, Copy)]
pub struct HostView<'a, T> {
    data: &'a [T],
    rows: usize,
    cols: usize,
    row_stride: usize,
    col_stride: usize,
    offset: usize,
}

impl<'a, T: Element> HostView<'a, T> {
    /// Describe a strided matrix, checking it fits `data`
    pub fn new(
        data: &'a [T],
        rows: usize,
        cols: usize,
        row_stride: usize,
        col_stride: usize,
        offset: usize,
    ) -> Result<Self> {
        let view = Self {
            data,
            rows,
            cols,
            row_stride,
            col_stride,
            offset,
        };
        if rows > 0 && cols > 0 {
            let last = offset + (rows - 1) * row_stride + (cols - 1) * col_stride;
            if last >= data.len() {
                return Err(Error::IndexOutOfBounds {
                    index: last,
                    size: data.len(),
                });
            }
        }
        Ok(view)
    }

    /// Contiguous matrix in the given layout
    pub fn contiguous(data: &'a [T], rows: usize, cols: usize, layout: DenseLayout) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(Error::shape_mismatch("host_view", &[rows, cols], &[data.len()]));
        }
        let (rs, cs) = match layout {
            DenseLayout::RowMajor => (cols, 1),
            DenseLayout::ColMajor => (1, rows),
        };
        Self::new(data, rows, cols, rs, cs, 0)
    }

    /// Rows
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Columns
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Element at `(r, c)`
    #[inline]
    pub fn get(&self, r: usize, c: usize) -> T {
        self.data[self.offset + r * self.row_stride + c * self.col_stride]
    }

    /// Pack into a contiguous vector in `layout` order
    pub fn pack(&self, layout: DenseLayout) -> Vec<T> {
        let mut out = Vec::with_capacity(self.rows * self.cols);
        match layout {
            DenseLayout::RowMajor => {
                for r in 0..self.rows {
                    for c in 0..self.cols {
                        out.push(self.get(r, c));
                    }
                }
            }
            DenseLayout::ColMajor => {
                for c in 0..self.cols {
                    for r in 0..self.rows {
                        out.push(self.get(r, c));
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_array_access() {
        let a = HostArray::new(vec![1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3], DenseLayout::ColMajor)
            .unwrap();
        // Column-major: columns are [1,2], [3,4], [5,6]
        assert_eq!(a.get(0, 1), Some(3.0));
        assert_eq!(a.get(1, 2), Some(6.0));
        assert_eq!(a.to_row_major::<f64>().unwrap(), vec![1.0, 3.0, 5.0, 2.0, 4.0, 6.0]);
        assert!(a.as_slice::<f32>().is_err());
        assert!(HostArray::new(vec![1i32, 2], &[3], DenseLayout::RowMajor).is_err());
    }

    #[test]
    fn test_host_view_pack() {
        // 2x2 sub-block of a 3x3 row-major matrix starting at (1, 1)
        let data: Vec<f32> = (0..9).map(|x| x as f32).collect();
        let view = HostView::new(&data, 2, 2, 3, 1, 4).unwrap();
        assert_eq!(view.pack(DenseLayout::RowMajor), vec![4.0, 5.0, 7.0, 8.0]);
        assert_eq!(view.pack(DenseLayout::ColMajor), vec![4.0, 7.0, 5.0, 8.0]);
        assert!(HostView::new(&data, 3, 3, 3, 1, 1).is_err());
    }

    #[test]
    fn test_max_abs_diff() {
        let a = HostArray::new(vec![1.0f64, 2.0], &[2], DenseLayout::RowMajor).unwrap();
        let b = HostArray::new(vec![1.5f64, 1.0], &[2], DenseLayout::RowMajor).unwrap();
        assert_eq!(a.max_abs_diff(&b).unwrap(), 1.0);
    }
}
