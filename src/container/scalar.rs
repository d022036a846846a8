//! Device-resident scalar

use super::host::HostArray;
use super::{DenseLayout, View2D};
use crate::dispatch_dtype;
use crate::dtype::{DType, Element};
use crate::error::{Error, Result};
use crate::runtime::{Buffer, Context};

/// A single device-resident value
///
/// Device scalars stay on the device between kernels: solvers compute step
/// lengths as `Scalar`s and feed them straight into the next expression,
/// where they broadcast inside the fused kernel. Host `f64` constants, by
/// contrast, travel as kernel parameters.
#[derive(Clone, Debug)]
pub struct Scalar {
    buffer: Buffer,
    offset: usize,
}

impl Scalar {
    /// Upload a value into a fresh one-element buffer
    pub fn new<T: Element>(context: &Context, value: T) -> Result<Self> {
        let buffer = Buffer::from_slice(context, &[value])?;
        Ok(Self { buffer, offset: 0 })
    }

    /// A zero scalar of the given dtype
    pub fn zeros(context: &Context, dtype: DType) -> Result<Self> {
        let buffer = Buffer::new(context, 1, dtype)?;
        Ok(Self { buffer, offset: 0 })
    }

    /// View element `offset` of an existing buffer as a scalar
    pub fn from_buffer(buffer: Buffer, offset: usize) -> Result<Self> {
        if offset >= buffer.len() {
            return Err(Error::IndexOutOfBounds {
                index: offset,
                size: buffer.len(),
            });
        }
        Ok(Self { buffer, offset })
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

    /// Element offset into the buffer
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub(crate) fn view(&self) -> View2D {
        View2D::scalar(self.offset)
    }

    /// Read the value, waiting for pending writes
    pub fn value<T: Element>(&self) -> Result<T> {
        let values = self.buffer.read_range::<T>(self.offset, 1)?;
        values
            .into_iter()
            .next()
            .ok_or_else(|| Error::Internal("empty scalar read".into()))
    }

    /// Read the value converted to f64
    pub fn to_f64(&self) -> Result<f64> {
        dispatch_dtype!(self.dtype(), T => { Ok(self.value::<T>()?.to_f64()) })
    }

    /// Overwrite the value (host to device, synchronous)
    pub fn set<T: Element>(&self, value: T) -> Result<()> {
        if T::DTYPE != self.dtype() {
            return Err(Error::dtype_mismatch("scalar_set", self.dtype(), T::DTYPE));
        }
        let elem = self.dtype().size_in_bytes();
        self.buffer
            .write_bytes(self.offset * elem, bytemuck::bytes_of(&value))
    }

    /// Copy to the host as a 0-dimensional array
    pub fn to_host(&self) -> Result<HostArray> {
        dispatch_dtype!(self.dtype(), T => {
            HostArray::new(vec![self.value::<T>()?], &[], DenseLayout::RowMajor)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_roundtrip() {
        let ctx = Context::host();
        let s = Scalar::new(&ctx, 2.5f64).unwrap();
        assert_eq!(s.value::<f64>().unwrap(), 2.5);
        s.set(4.0f64).unwrap();
        assert_eq!(s.to_f64().unwrap(), 4.0);
        assert!(s.set(1i32).is_err());
        assert_eq!(s.to_host().unwrap().shape(), &[] as &[usize]);
    }

    #[test]
    fn test_scalar_from_buffer() {
        let ctx = Context::host();
        let buf = Buffer::from_slice(&ctx, &[1i32, 2, 3]).unwrap();
        let s = Scalar::from_buffer(buf.clone(), 2).unwrap();
        assert_eq!(s.value::<i32>().unwrap(), 3);
        assert!(Scalar::from_buffer(buf, 3).is_err());
    }
}
