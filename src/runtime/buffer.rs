//! Buffer: device memory with reference-counted sharing and hazard tracking

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{Context, DeviceMemory, Event};
use crate::dtype::{DType, Element};
use crate::error::{Error, Result};

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Typed device memory owned by one [`Context`]
///
/// Buffers are shared by every container view over them; cloning is a
/// reference-count increment. The memory is released when the last clone is
/// dropped. A buffer keeps its context alive, never the other way round.
///
/// Each buffer records the event of its last write and the events of reads
/// issued since, which is how the dispatcher orders submissions:
/// a read waits for the last write, a write waits for the last write and
/// every outstanding read.
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<BufferInner>,
}

struct BufferInner {
    id: u64,
    len: usize,
    dtype: DType,
    memory: DeviceMemory,
    context: Context,
    hazards: Mutex<Hazards>,
}

#[derive(Default)]
struct Hazards {
    last_write: Option<Event>,
    reads: Vec<Event>,
}

impl Buffer {
    /// Allocate a zero-initialised buffer of `len` elements
    pub fn new(context: &Context, len: usize, dtype: DType) -> Result<Self> {
        context.allocate(len * dtype.size_in_bytes(), dtype)
    }

    /// Allocate a buffer and fill it from a host slice
    pub fn from_slice<T: Element>(context: &Context, data: &[T]) -> Result<Self> {
        let buffer = Self::new(context, data.len(), T::DTYPE)?;
        buffer.write_bytes(0, bytemuck::cast_slice(data))?;
        Ok(buffer)
    }

    pub(crate) fn from_parts(
        context: Context,
        memory: DeviceMemory,
        len: usize,
        dtype: DType,
    ) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
                len,
                dtype,
                memory,
                context,
                hazards: Mutex::new(Hazards::default()),
            }),
        }
    }

    /// Unique buffer id
    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Number of elements
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len
    }

    /// Check if the buffer holds no elements
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// Element type
    #[inline]
    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    /// Size in bytes
    #[inline]
    pub fn byte_len(&self) -> usize {
        self.inner.len * self.inner.dtype.size_in_bytes()
    }

    /// Owning context
    #[inline]
    pub fn context(&self) -> &Context {
        &self.inner.context
    }

    #[inline]
    pub(crate) fn memory(&self) -> &DeviceMemory {
        &self.inner.memory
    }

    /// Number of live handles to this buffer
    #[inline]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Whether two handles refer to the same memory
    #[inline]
    pub fn same_buffer(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ========================================================================
    // Hazard tracking
    // ========================================================================

    /// Event a new reader must wait for
    pub(crate) fn read_dependency(&self) -> Option<Event> {
        self.inner.hazards.lock().last_write.clone()
    }

    /// Events a new writer must wait for
    pub(crate) fn write_dependencies(&self) -> Vec<Event> {
        let mut hazards = self.inner.hazards.lock();
        hazards.reads.retain(|e| !e.is_complete());
        let mut deps: Vec<Event> = hazards.last_write.iter().cloned().collect();
        deps.extend(hazards.reads.iter().cloned());
        deps
    }

    /// Record a submission that reads this buffer
    pub(crate) fn record_read(&self, event: &Event) {
        let mut hazards = self.inner.hazards.lock();
        hazards.reads.retain(|e| !e.is_complete());
        hazards.reads.push(event.clone());
    }

    /// Record a submission that writes this buffer
    ///
    /// The new write already depends on every earlier read, so those are
    /// dropped from the tracking state.
    pub(crate) fn record_write(&self, event: &Event) {
        let mut hazards = self.inner.hazards.lock();
        hazards.reads.clear();
        hazards.last_write = Some(event.clone());
    }

    /// Block until every pending operation on this buffer has finished
    pub fn wait_idle(&self) -> Result<()> {
        self.write_dependencies().iter().try_for_each(Event::wait)
    }

    /// Block until the last pending write has finished
    pub fn wait_written(&self) -> Result<()> {
        match self.read_dependency() {
            Some(event) => event.wait(),
            None => Ok(()),
        }
    }

    // ========================================================================
    // Host transfers
    // ========================================================================

    /// Synchronously overwrite bytes starting at `byte_offset`
    pub fn write_bytes(&self, byte_offset: usize, data: &[u8]) -> Result<()> {
        if byte_offset + data.len() > self.byte_len() {
            return Err(Error::IndexOutOfBounds {
                index: byte_offset + data.len(),
                size: self.byte_len(),
            });
        }
        self.wait_idle()?;
        self.context().backend().write(self.memory(), byte_offset, data)
    }

    /// Synchronously copy `len` elements starting at element `start` to the host
    pub fn read_range<T: Element>(&self, start: usize, len: usize) -> Result<Vec<T>> {
        if T::DTYPE != self.dtype() {
            return Err(Error::dtype_mismatch("buffer_read", self.dtype(), T::DTYPE));
        }
        if start + len > self.len() {
            return Err(Error::IndexOutOfBounds {
                index: start + len,
                size: self.len(),
            });
        }
        self.wait_written()?;
        let mut out = vec![T::zero(); len];
        let elem = self.dtype().size_in_bytes();
        self.context()
            .backend()
            .read(self.memory(), start * elem, bytemuck::cast_slice_mut(&mut out))?;
        Ok(out)
    }

    /// Synchronously copy the whole buffer to the host
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        self.read_range(0, self.len())
    }

    /// Copy this buffer into a fresh buffer owned by `target`
    ///
    /// The only sanctioned way to move data between contexts.
    pub fn transfer_to(&self, target: &Context) -> Result<Buffer> {
        self.wait_written()?;
        let mut bytes = vec![0u8; self.byte_len()];
        self.context().backend().read(self.memory(), 0, &mut bytes)?;
        let copy = target.allocate(self.byte_len(), self.dtype())?;
        copy.write_bytes(0, &bytes)?;
        Ok(copy)
    }
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        self.context.release(self.len * self.dtype.size_in_bytes());
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.inner.id)
            .field("len", &self.inner.len)
            .field("dtype", &self.inner.dtype)
            .field("context", &self.inner.context.id())
            .finish()
    }
}
