//! Host memory: 8-byte aligned byte storage behind a reader/writer lock

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::fmt;

use crate::dtype::Element;
use crate::error::{Error, Result};

/// Host-resident buffer memory
///
/// Backed by `u64` words so every supported element type can be viewed in
/// place with `bytemuck`. Kernels take the read lock on inputs and the write
/// lock on outputs for the duration of one submission.
pub struct HostMemory {
    words: RwLock<Vec<u64>>,
    byte_len: usize,
}

impl HostMemory {
    /// Allocate `byte_len` zeroed bytes
    pub fn new(byte_len: usize) -> Result<Self> {
        let word_len = byte_len.div_ceil(8);
        let mut words = Vec::new();
        words
            .try_reserve_exact(word_len)
            .map_err(|_| Error::OutOfDeviceMemory {
                requested: byte_len,
                available: 0,
            })?;
        words.resize(word_len, 0u64);
        Ok(Self {
            words: RwLock::new(words),
            byte_len,
        })
    }

    /// Size in bytes
    pub fn byte_len(&self) -> usize {
        self.byte_len
    }

    /// Copy `data` into the memory at `byte_offset`
    pub fn write(&self, byte_offset: usize, data: &[u8]) -> Result<()> {
        let end = self.check_range(byte_offset, data.len())?;
        let mut words = self.words.write();
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(words.as_mut_slice());
        bytes[byte_offset..end].copy_from_slice(data);
        Ok(())
    }

    /// Copy memory at `byte_offset` into `out`
    pub fn read(&self, byte_offset: usize, out: &mut [u8]) -> Result<()> {
        let end = self.check_range(byte_offset, out.len())?;
        let words = self.words.read();
        let bytes: &[u8] = bytemuck::cast_slice(words.as_slice());
        out.copy_from_slice(&bytes[byte_offset..end]);
        Ok(())
    }

    fn check_range(&self, byte_offset: usize, len: usize) -> Result<usize> {
        let end = byte_offset + len;
        if end > self.byte_len {
            return Err(Error::IndexOutOfBounds {
                index: end,
                size: self.byte_len,
            });
        }
        Ok(end)
    }

    pub(crate) fn lock_read(&self) -> RwLockReadGuard<'_, Vec<u64>> {
        self.words.read()
    }

    pub(crate) fn lock_write(&self) -> RwLockWriteGuard<'_, Vec<u64>> {
        self.words.write()
    }
}

/// View locked words as `len` elements of `T`
pub(crate) fn typed<T: Element>(words: &[u64], len: usize) -> &[T] {
    &bytemuck::cast_slice::<u64, T>(words)[..len]
}

/// Mutable view of locked words as `len` elements of `T`
pub(crate) fn typed_mut<T: Element>(words: &mut [u64], len: usize) -> &mut [T] {
    &mut bytemuck::cast_slice_mut::<u64, T>(words)[..len]
}

impl fmt::Debug for HostMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostMemory")
            .field("byte_len", &self.byte_len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_memory_read_write() {
        let mem = HostMemory::new(12).unwrap();
        mem.write(4, bytemuck::cast_slice(&[7.5f32, -1.0])).unwrap();
        let mut out = [0f32; 3];
        mem.read(0, bytemuck::cast_slice_mut(&mut out)).unwrap();
        assert_eq!(out, [0.0, 7.5, -1.0]);
        assert!(mem.write(8, &[0u8; 8]).is_err());
    }

    #[test]
    fn test_typed_views() {
        let mem = HostMemory::new(16).unwrap();
        {
            let mut words = mem.lock_write();
            let values = typed_mut::<i32>(&mut words, 4);
            values.copy_from_slice(&[1, 2, 3, 4]);
        }
        let words = mem.lock_read();
        assert_eq!(typed::<i32>(&words, 3), &[1, 2, 3]);
    }
}
