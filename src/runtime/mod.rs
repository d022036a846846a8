//! Execution runtime: contexts, buffers, kernels and backends
//!
//! # Architecture
//!
//! ```text
//! Context (one device, reference counted)
//! ├── ExecutionBackend (Host | Wgpu | Cuda, chosen once at acquisition)
//! ├── KernelCache (signature -> compiled kernel, per context)
//! ├── memory accounting (optional per-context limit)
//! └── Buffer (typed memory + hazard tracking, holds its Context)
//! ```
//!
//! Backends are trait objects behind the context so the rest of the crate is
//! written once against [`ExecutionBackend`]. Device memory is a closed enum
//! ([`DeviceMemory`]) with one variant per compiled-in backend.

mod buffer;
mod codegen;
mod context;
mod event;
pub mod host;
pub mod kernel;

#[cfg(feature = "cuda")]
pub mod cuda;

#[cfg(feature = "wgpu")]
pub mod wgpu;

pub use buffer::Buffer;
pub use context::{Context, ContextOptions, ContextStats};
pub use event::Event;
pub use kernel::{
    BinaryOp, Instr, Kernel, KernelArgs, KernelCache, KernelOp, KernelSignature, Program,
    ReduceOp, Triangle, UnaryOp,
};

#[cfg(any(feature = "wgpu", feature = "cuda"))]
pub(crate) use event::EventDriver;

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::dtype::DType;
use crate::error::Result;

// ============================================================================
// Backend identity and selection
// ============================================================================

/// The concrete backend a context runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Host CPU worker lanes
    Host,
    /// WebGPU compute (WGSL shaders)
    Wgpu,
    /// CUDA stream (NVRTC kernels)
    Cuda,
}

impl BackendKind {
    /// Backend name
    pub fn name(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Wgpu => "wgpu",
            Self::Cuda => "cuda",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which kind of device a selector asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// First available GPU, else the host
    #[default]
    Any,
    /// Any GPU backend (CUDA first, then WebGPU)
    Gpu,
    /// WebGPU adapter
    Wgpu,
    /// CUDA device
    Cuda,
    /// Host CPU
    Host,
}

/// Device selection criteria for [`Context::acquire`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSelector {
    /// Requested device kind
    pub kind: DeviceKind,
    /// Device ordinal within the kind
    pub index: usize,
    /// Fall back to a host context when nothing matches
    pub allow_host_fallback: bool,
}

impl DeviceSelector {
    /// Select a device kind with ordinal 0 and no fallback
    pub fn new(kind: DeviceKind) -> Self {
        Self {
            kind,
            index: 0,
            allow_host_fallback: false,
        }
    }

    /// Select the host backend
    pub fn host() -> Self {
        Self::new(DeviceKind::Host)
    }

    /// Select any GPU, falling back to the host
    pub fn gpu_or_host() -> Self {
        Self::new(DeviceKind::Gpu).with_host_fallback(true)
    }

    /// Set the device ordinal
    pub fn with_index(mut self, index: usize) -> Self {
        self.index = index;
        self
    }

    /// Allow or forbid host fallback
    pub fn with_host_fallback(mut self, allow: bool) -> Self {
        self.allow_host_fallback = allow;
        self
    }
}

impl Default for DeviceSelector {
    fn default() -> Self {
        Self::new(DeviceKind::Any)
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.kind, self.index)?;
        if self.allow_host_fallback {
            f.write_str(" (host fallback)")?;
        }
        Ok(())
    }
}

// ============================================================================
// Device memory
// ============================================================================

/// Backend-owned memory behind a [`Buffer`]
///
/// Freed when dropped; buffers drop it when their last handle goes away.
#[derive(Debug)]
pub enum DeviceMemory {
    /// Host memory
    Host(host::HostMemory),
    /// WebGPU storage buffer
    #[cfg(feature = "wgpu")]
    Wgpu(wgpu::WgpuMemory),
    /// CUDA device allocation
    #[cfg(feature = "cuda")]
    Cuda(cuda::CudaMemory),
}

impl DeviceMemory {
    /// Backend that owns this memory
    pub fn backend_kind(&self) -> BackendKind {
        match self {
            Self::Host(_) => BackendKind::Host,
            #[cfg(feature = "wgpu")]
            Self::Wgpu(_) => BackendKind::Wgpu,
            #[cfg(feature = "cuda")]
            Self::Cuda(_) => BackendKind::Cuda,
        }
    }
}

// ============================================================================
// Backend trait
// ============================================================================

/// A compute device that allocates memory, compiles kernels and runs them
///
/// Implementations must be thread-safe: the dispatcher may submit from any
/// thread. `submit` is asynchronous; the returned event completes once the
/// kernel has run (or failed). Dependencies are events from earlier
/// submissions on the same context.
pub trait ExecutionBackend: Send + Sync + fmt::Debug {
    /// Backend kind
    fn kind(&self) -> BackendKind;

    /// Human-readable device name
    fn device_name(&self) -> String;

    /// Whether a dtype can be stored and computed on this device
    fn supports_dtype(&self, dtype: DType) -> bool;

    /// Whether elementwise programs may be fused into one kernel
    fn supports_fusion(&self) -> bool {
        true
    }

    /// Maximum number of buffers one fused kernel may read
    fn max_kernel_inputs(&self) -> usize;

    /// Allocate `byte_len` bytes of zero-initialised memory
    fn allocate(&self, byte_len: usize) -> Result<DeviceMemory>;

    /// Synchronously copy host bytes into device memory
    fn write(&self, memory: &DeviceMemory, byte_offset: usize, data: &[u8]) -> Result<()>;

    /// Synchronously copy device memory into host bytes
    fn read(&self, memory: &DeviceMemory, byte_offset: usize, out: &mut [u8]) -> Result<()>;

    /// Compile a kernel for a signature into a backend payload
    fn compile(&self, signature: &KernelSignature) -> Result<Arc<dyn Any + Send + Sync>>;

    /// Submit a compiled kernel for asynchronous execution
    fn submit(&self, kernel: &Kernel, args: KernelArgs, dependencies: Vec<Event>) -> Result<Event>;

    /// Block until all submitted work has finished
    fn synchronize(&self) -> Result<()>;
}
