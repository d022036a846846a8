//! Device-resident vectors and strided vector views

use std::ops::Range;

use super::host::{HostArray, HostData};
use super::{DenseLayout, Span, View2D, gather};
use crate::dispatch_dtype;
use crate::dtype::{DType, Element};
use crate::error::{Error, Result};
use crate::runtime::{Buffer, Context};

/// A dense vector, possibly a strided view over a larger buffer
///
/// `range` and `slice` produce zero-copy views that share the buffer; writes
/// through `assign` on a view change the parent.
#[derive(Clone, Debug)]
pub struct Vector {
    buffer: Buffer,
    offset: usize,
    len: usize,
    stride: usize,
}

impl Vector {
    /// Upload a host slice into a fresh buffer
    pub fn from_slice<T: Element>(context: &Context, data: &[T]) -> Result<Self> {
        let buffer = Buffer::from_slice(context, data)?;
        Ok(Self {
            buffer,
            offset: 0,
            len: data.len(),
            stride: 1,
        })
    }

    /// Upload a 1-dimensional host array
    pub fn from_host(context: &Context, array: &HostArray) -> Result<Self> {
        let len = match array.shape() {
            [n] => *n,
            other => return Err(Error::shape_mismatch("vector_from_host", &[array.len()], other)),
        };
        let vector = match array.data() {
            HostData::F64(v) => Self::from_slice(context, v.as_slice()),
            HostData::F32(v) => Self::from_slice(context, v.as_slice()),
            HostData::I64(v) => Self::from_slice(context, v.as_slice()),
            HostData::I32(v) => Self::from_slice(context, v.as_slice()),
        }?;
        debug_assert_eq!(vector.len, len);
        Ok(vector)
    }

    /// A zero vector
    pub fn zeros(context: &Context, len: usize, dtype: DType) -> Result<Self> {
        Ok(Self {
            buffer: Buffer::new(context, len, dtype)?,
            offset: 0,
            len,
            stride: 1,
        })
    }

    /// A vector with every element set to `value`
    pub fn full<T: Element>(context: &Context, len: usize, value: T) -> Result<Self> {
        Self::from_slice(context, &vec![value; len])
    }

    /// View `len` elements of `buffer`, `stride` apart, starting at `offset`
    pub fn from_buffer(buffer: Buffer, offset: usize, len: usize, stride: usize) -> Result<Self> {
        View2D::vector(offset, len, stride).check_fits(buffer.len())?;
        Ok(Self {
            buffer,
            offset,
            len,
            stride,
        })
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the vector is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
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

    /// Element offset of the first entry
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Distance between consecutive entries
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Whether the entries are adjacent in memory
    pub fn is_contiguous(&self) -> bool {
        self.stride == 1 || self.len <= 1
    }

    pub(crate) fn view(&self) -> View2D {
        View2D::vector(self.offset, self.len, self.stride)
    }

    /// Zero-copy view of the entries in `range`
    pub fn range(&self, range: Range<usize>) -> Result<Vector> {
        self.select(Span::range(range))
    }

    /// Zero-copy view of `len` entries starting at `start`, `step` apart
    pub fn slice(&self, start: usize, step: usize, len: usize) -> Result<Vector> {
        self.select(Span::new(start, step, len))
    }

    fn select(&self, span: Span) -> Result<Vector> {
        span.validate(self.len)?;
        Ok(Self {
            buffer: self.buffer.clone(),
            offset: self.offset + span.start * self.stride,
            len: span.len,
            stride: if span.len <= 1 { 1 } else { self.stride * span.step },
        })
    }

    /// Copy the entries to the host
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        gather::<T>(&self.buffer, &self.view(), DenseLayout::RowMajor)
    }

    /// Copy to the host as a 1-dimensional array
    pub fn to_host(&self) -> Result<HostArray> {
        dispatch_dtype!(self.dtype(), T => {
            HostArray::new(self.to_vec::<T>()?, &[self.len], DenseLayout::RowMajor)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_roundtrip() {
        let ctx = Context::host();
        let v = Vector::from_slice(&ctx, &[1.0f32, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(v.len(), 4);
        assert_eq!(v.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
        let host = v.to_host().unwrap();
        assert_eq!(host.shape(), &[4]);
        let back = Vector::from_host(&ctx, &host).unwrap();
        assert_eq!(back.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_vector_range_and_slice() {
        let ctx = Context::host();
        let data: Vec<i64> = (0..10).collect();
        let v = Vector::from_slice(&ctx, &data).unwrap();

        let r = v.range(2..6).unwrap();
        assert_eq!(r.to_vec::<i64>().unwrap(), vec![2, 3, 4, 5]);

        let s = v.slice(1, 3, 3).unwrap();
        assert_eq!(s.to_vec::<i64>().unwrap(), vec![1, 4, 7]);

        // Slice of a slice composes strides
        let ss = s.slice(1, 1, 2).unwrap();
        assert_eq!(ss.to_vec::<i64>().unwrap(), vec![4, 7]);
        assert!(ss.buffer().same_buffer(v.buffer()));

        assert!(v.range(8..11).is_err());
        assert!(v.slice(0, 4, 4).is_err());
    }

    #[test]
    fn test_vector_zeros_and_full() {
        let ctx = Context::host();
        let z = Vector::zeros(&ctx, 3, DType::F64).unwrap();
        assert_eq!(z.to_vec::<f64>().unwrap(), vec![0.0; 3]);
        let f = Vector::full(&ctx, 2, 7i32).unwrap();
        assert_eq!(f.to_vec::<i32>().unwrap(), vec![7, 7]);
    }
}
