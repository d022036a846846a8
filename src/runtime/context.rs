//! Execution context: one device, its allocator, kernel cache and queue

use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::host::HostBackend;
use super::kernel::{Kernel, KernelArgs, KernelCache, KernelSignature};
use super::{BackendKind, Buffer, DeviceKind, DeviceSelector, Event, ExecutionBackend};
use crate::config::EngineConfig;
use crate::dtype::DType;
use crate::error::{Error, Result};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Tunables fixed at context creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextOptions {
    /// Fuse elementwise subgraphs into single kernels
    pub fusion: bool,
    /// Cap on buffers read by one fused kernel (backend limit applies too)
    pub max_fused_inputs: Option<usize>,
    /// Per-context allocation limit in bytes
    pub memory_limit: Option<usize>,
    /// Number of host worker lanes (host backend only)
    pub host_lanes: Option<usize>,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            fusion: true,
            max_fused_inputs: None,
            memory_limit: None,
            host_lanes: None,
        }
    }
}

impl ContextOptions {
    /// Enable or disable elementwise fusion
    pub fn with_fusion(mut self, fusion: bool) -> Self {
        self.fusion = fusion;
        self
    }

    /// Limit total live allocations to `bytes`
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    /// Set the number of host worker lanes
    pub fn with_host_lanes(mut self, lanes: usize) -> Self {
        self.host_lanes = Some(lanes);
        self
    }

    /// Cap the number of inputs of a fused kernel
    pub fn with_max_fused_inputs(mut self, inputs: usize) -> Self {
        self.max_fused_inputs = Some(inputs);
        self
    }
}

/// Counters describing the work a context has done
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContextStats {
    /// Buffers allocated
    pub allocations: u64,
    /// Bytes held by live buffers
    pub bytes_in_use: usize,
    /// High-water mark of `bytes_in_use`
    pub peak_bytes: usize,
    /// Kernels compiled (cache misses)
    pub compilations: u64,
    /// Kernel cache hits
    pub cache_hits: u64,
    /// Kernel submissions
    pub submissions: u64,
}

#[derive(Default)]
struct MemoryUsage {
    in_use: usize,
    peak: usize,
}

#[derive(Default)]
struct Queue {
    outstanding: Vec<Event>,
    fence: Option<Event>,
}

struct ContextInner {
    id: u64,
    backend: Box<dyn ExecutionBackend>,
    options: ContextOptions,
    cache: KernelCache,
    memory: Mutex<MemoryUsage>,
    queue: Mutex<Queue>,
    allocations: AtomicU64,
    compilations: AtomicU64,
    cache_hits: AtomicU64,
    submissions: AtomicU64,
}

/// Handle to a compute device
///
/// Cheap to clone. Every buffer and compiled kernel belongs to exactly one
/// context; operations mixing contexts fail with `CrossContextOperation`.
/// The context is torn down when the last handle (including the ones held
/// by buffers) is dropped.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    fn with_backend(backend: Box<dyn ExecutionBackend>, options: ContextOptions) -> Self {
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        info!(
            "context {} created on {} backend ({})",
            id,
            backend.kind(),
            backend.device_name()
        );
        Self {
            inner: Arc::new(ContextInner {
                id,
                backend,
                options,
                cache: KernelCache::new(),
                memory: Mutex::new(MemoryUsage::default()),
                queue: Mutex::new(Queue::default()),
                allocations: AtomicU64::new(0),
                compilations: AtomicU64::new(0),
                cache_hits: AtomicU64::new(0),
                submissions: AtomicU64::new(0),
            }),
        }
    }

    /// Host context with default options
    pub fn host() -> Self {
        Self::host_with(ContextOptions::default())
    }

    /// Host context with explicit options
    pub fn host_with(options: ContextOptions) -> Self {
        let backend = HostBackend::new(options.host_lanes);
        Self::with_backend(Box::new(backend), options)
    }

    /// Acquire a context for the first device matching `selector`
    ///
    /// Fails with `NoDeviceFound` when nothing matches, unless the selector
    /// allows host fallback.
    pub fn acquire(selector: &DeviceSelector) -> Result<Self> {
        Self::acquire_with(selector, ContextOptions::default())
    }

    /// Acquire a context with explicit options
    pub fn acquire_with(selector: &DeviceSelector, options: ContextOptions) -> Result<Self> {
        let candidates: &[BackendKind] = match selector.kind {
            DeviceKind::Any => &[BackendKind::Cuda, BackendKind::Wgpu, BackendKind::Host],
            DeviceKind::Gpu => &[BackendKind::Cuda, BackendKind::Wgpu],
            DeviceKind::Cuda => &[BackendKind::Cuda],
            DeviceKind::Wgpu => &[BackendKind::Wgpu],
            DeviceKind::Host => &[BackendKind::Host],
        };

        for &kind in candidates {
            match open_backend(kind, selector.index, &options) {
                Ok(backend) => return Ok(Self::with_backend(backend, options)),
                Err(e) => debug!("{} backend unavailable: {}", kind, e),
            }
        }

        if selector.allow_host_fallback {
            warn!("no device matches {}, falling back to host", selector);
            return Ok(Self::host_with(options));
        }
        Err(Error::NoDeviceFound {
            selector: selector.to_string(),
        })
    }

    /// Build a context from the backend and dispatcher sections of a config
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        Self::acquire_with(&config.backend.selector(), config.context_options())
    }

    // ========================================================================
    // Identity
    // ========================================================================

    /// Unique context id
    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Backend this context runs on
    pub fn backend_kind(&self) -> BackendKind {
        self.inner.backend.kind()
    }

    /// Device name reported by the backend
    pub fn device_name(&self) -> String {
        self.inner.backend.device_name()
    }

    /// Options the context was created with
    pub fn options(&self) -> &ContextOptions {
        &self.inner.options
    }

    /// Whether the dispatcher should fuse elementwise subgraphs
    pub fn fusion_enabled(&self) -> bool {
        self.inner.options.fusion && self.inner.backend.supports_fusion()
    }

    /// Maximum number of inputs for one fused kernel
    pub fn max_kernel_inputs(&self) -> usize {
        let backend = self.inner.backend.max_kernel_inputs();
        match self.inner.options.max_fused_inputs {
            Some(cap) => cap.max(2).min(backend),
            None => backend,
        }
    }

    /// Whether a dtype is supported by the backend
    pub fn supports_dtype(&self, dtype: DType) -> bool {
        self.inner.backend.supports_dtype(dtype)
    }

    pub(crate) fn backend(&self) -> &dyn ExecutionBackend {
        self.inner.backend.as_ref()
    }

    /// Work counters
    pub fn stats(&self) -> ContextStats {
        let memory = self.inner.memory.lock();
        ContextStats {
            allocations: self.inner.allocations.load(Ordering::Relaxed),
            bytes_in_use: memory.in_use,
            peak_bytes: memory.peak,
            compilations: self.inner.compilations.load(Ordering::Relaxed),
            cache_hits: self.inner.cache_hits.load(Ordering::Relaxed),
            submissions: self.inner.submissions.load(Ordering::Relaxed),
        }
    }

    // ========================================================================
    // Memory
    // ========================================================================

    /// Allocate a zero-initialised buffer of `byte_len` bytes
    pub fn allocate(&self, byte_len: usize, dtype: DType) -> Result<Buffer> {
        if !self.supports_dtype(dtype) {
            return Err(Error::unsupported_dtype(dtype, "allocate"));
        }
        if byte_len % dtype.size_in_bytes() != 0 {
            return Err(Error::InvalidArgument {
                arg: "byte_len",
                reason: format!("{} is not a multiple of the {} element size", byte_len, dtype),
            });
        }

        {
            let mut memory = self.inner.memory.lock();
            if let Some(limit) = self.inner.options.memory_limit {
                let available = limit.saturating_sub(memory.in_use);
                if byte_len > available {
                    return Err(Error::OutOfDeviceMemory {
                        requested: byte_len,
                        available,
                    });
                }
            }
            memory.in_use += byte_len;
            memory.peak = memory.peak.max(memory.in_use);
        }

        let device_memory = match self.inner.backend.allocate(byte_len) {
            Ok(m) => m,
            Err(e) => {
                self.release(byte_len);
                return Err(e);
            }
        };
        self.inner.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(Buffer::from_parts(
            self.clone(),
            device_memory,
            byte_len / dtype.size_in_bytes(),
            dtype,
        ))
    }

    pub(crate) fn release(&self, byte_len: usize) {
        let mut memory = self.inner.memory.lock();
        memory.in_use = memory.in_use.saturating_sub(byte_len);
    }

    // ========================================================================
    // Kernels
    // ========================================================================

    /// Fetch the kernel for `signature`, compiling it on first use
    pub fn compile_or_fetch(&self, signature: &KernelSignature) -> Result<Kernel> {
        if !self.supports_dtype(signature.dtype) {
            return Err(Error::unsupported_dtype(signature.dtype, signature.op.name()));
        }
        signature.validate()?;
        let (kernel, compiled) = self.inner.cache.get_or_compile(signature, || {
            debug!("context {}: compiling {}", self.inner.id, signature);
            let payload = self.inner.backend.compile(signature)?;
            Ok(Kernel::new(signature.clone(), payload, self.inner.id))
        })?;
        if compiled {
            self.inner.compilations.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
        Ok(kernel)
    }

    /// Number of kernels in the cache
    pub fn cached_kernels(&self) -> usize {
        self.inner.cache.len()
    }

    /// Submit a kernel after the given dependencies, without hazard tracking
    pub fn submit(&self, kernel: &Kernel, args: KernelArgs, dependencies: &[Event]) -> Result<Event> {
        if kernel.context_id() != self.inner.id {
            return Err(Error::CrossContextOperation {
                op: "submit",
                lhs: self.inner.id,
                rhs: kernel.context_id(),
            });
        }
        for buffer in args.inputs.iter().chain(args.outputs.iter()) {
            if buffer.context().id() != self.inner.id {
                return Err(Error::CrossContextOperation {
                    op: "submit",
                    lhs: self.inner.id,
                    rhs: buffer.context().id(),
                });
            }
        }

        let mut deps = dependencies.to_vec();
        {
            let mut queue = self.inner.queue.lock();
            if let Some(fence) = &queue.fence {
                if fence.is_complete() {
                    queue.fence = None;
                } else {
                    deps.push(fence.clone());
                }
            }
        }

        trace!(
            "context {}: submit {} ({} inputs, {} deps)",
            self.inner.id,
            kernel.signature(),
            args.inputs.len(),
            deps.len()
        );
        let event = self.inner.backend.submit(kernel, args, deps)?;
        self.inner.submissions.fetch_add(1, Ordering::Relaxed);

        let mut queue = self.inner.queue.lock();
        queue.outstanding.retain(|e| !e.is_complete());
        queue.outstanding.push(event.clone());
        Ok(event)
    }

    /// Submit a kernel ordered by the hazard state of its buffers
    ///
    /// Inputs wait for their last write; outputs wait for their last write
    /// and all outstanding reads. The new event is recorded on every buffer.
    pub fn launch(&self, kernel: &Kernel, args: KernelArgs) -> Result<Event> {
        let mut deps = Vec::new();
        for input in &args.inputs {
            if let Some(event) = input.read_dependency() {
                deps.push(event);
            }
        }
        for output in &args.outputs {
            deps.extend(output.write_dependencies());
        }
        deps.dedup_by(|a, b| a.ptr_eq(b));

        let inputs = args.inputs.clone();
        let outputs = args.outputs.clone();
        let event = self.submit(kernel, args, &deps)?;
        for input in &inputs {
            input.record_read(&event);
        }
        for output in &outputs {
            output.record_write(&event);
        }
        Ok(event)
    }

    /// Insert a barrier: later submissions start after everything issued so far
    pub fn barrier(&self) -> Event {
        let mut queue = self.inner.queue.lock();
        queue.outstanding.retain(|e| !e.is_complete());
        let mut events = queue.outstanding.clone();
        if let Some(fence) = queue.fence.take() {
            events.push(fence);
        }
        let fence = Event::join(events);
        queue.fence = Some(fence.clone());
        fence
    }

    /// Block until every submission on this context has finished
    pub fn synchronize(&self) -> Result<()> {
        let pending = {
            let mut queue = self.inner.queue.lock();
            std::mem::take(&mut queue.outstanding)
        };
        let waited = pending.iter().try_for_each(Event::wait);
        let synced = self.inner.backend.synchronize();
        waited.and(synced)
    }
}

fn open_backend(
    kind: BackendKind,
    index: usize,
    options: &ContextOptions,
) -> Result<Box<dyn ExecutionBackend>> {
    match kind {
        BackendKind::Host => {
            if index != 0 {
                return Err(Error::backend("host", format!("no host device {}", index)));
            }
            Ok(Box::new(HostBackend::new(options.host_lanes)))
        }
        #[cfg(feature = "wgpu")]
        BackendKind::Wgpu => Ok(Box::new(super::wgpu::WgpuBackend::new(index)?)),
        #[cfg(not(feature = "wgpu"))]
        BackendKind::Wgpu => Err(Error::backend("wgpu", "support not compiled in")),
        #[cfg(feature = "cuda")]
        BackendKind::Cuda => Ok(Box::new(super::cuda::CudaBackend::new(index)?)),
        #[cfg(not(feature = "cuda"))]
        BackendKind::Cuda => Err(Error::backend("cuda", "support not compiled in")),
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Context {}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("backend", &self.inner.backend.kind())
            .field("device", &self.inner.backend.device_name())
            .finish()
    }
}
