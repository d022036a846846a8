//! Host execution backend
//!
//! Memory is ordinary process memory; kernels are interpreted fused
//! programs and hand-written loops (see [`kernels`]). Submissions run on a
//! fixed pool of worker lanes, so independent submissions overlap while
//! dependent ones start only after their dependencies completed.

mod kernels;
mod memory;
mod program;
mod queue;

pub use memory::HostMemory;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use self::queue::{WorkerLanes, default_lanes};
use super::kernel::{Kernel, KernelArgs, KernelSignature};
use super::{BackendKind, DeviceMemory, Event, ExecutionBackend};
use crate::dtype::DType;
use crate::error::{Error, Result};

/// Compiled payload of a host kernel
#[derive(Debug)]
pub(crate) struct HostKernel;

/// Backend running on host worker threads
pub struct HostBackend {
    lanes: WorkerLanes,
}

impl HostBackend {
    /// Create a backend with `lanes` worker threads (default: up to 4)
    pub fn new(lanes: Option<usize>) -> Self {
        Self {
            lanes: WorkerLanes::new(lanes.unwrap_or_else(default_lanes)),
        }
    }

    /// Number of worker lanes
    pub fn lanes(&self) -> usize {
        self.lanes.len()
    }
}

fn host_memory<'a>(memory: &'a DeviceMemory) -> Result<&'a HostMemory> {
    match memory {
        DeviceMemory::Host(m) => Ok(m),
        #[allow(unreachable_patterns)]
        other => Err(Error::backend(
            "host",
            format!("cannot access {} memory", other.backend_kind()),
        )),
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "kernel panicked".to_string()
    }
}

impl ExecutionBackend for HostBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Host
    }

    fn device_name(&self) -> String {
        format!("host ({} lanes)", self.lanes.len())
    }

    fn supports_dtype(&self, _dtype: DType) -> bool {
        true
    }

    fn max_kernel_inputs(&self) -> usize {
        16
    }

    fn allocate(&self, byte_len: usize) -> Result<DeviceMemory> {
        Ok(DeviceMemory::Host(HostMemory::new(byte_len)?))
    }

    fn write(&self, memory: &DeviceMemory, byte_offset: usize, data: &[u8]) -> Result<()> {
        host_memory(memory)?.write(byte_offset, data)
    }

    fn read(&self, memory: &DeviceMemory, byte_offset: usize, out: &mut [u8]) -> Result<()> {
        host_memory(memory)?.read(byte_offset, out)
    }

    fn compile(&self, _signature: &KernelSignature) -> Result<Arc<dyn Any + Send + Sync>> {
        Ok(Arc::new(HostKernel))
    }

    fn submit(&self, kernel: &Kernel, args: KernelArgs, dependencies: Vec<Event>) -> Result<Event> {
        if kernel.compiled::<HostKernel>().is_none() {
            return Err(Error::backend("host", "kernel was not compiled by the host backend"));
        }
        let event = Event::pending();
        let signal = event.clone();
        let kernel = kernel.clone();
        self.lanes.dispatch(Box::new(move || {
            let result = dependencies.iter().try_for_each(Event::wait).and_then(|()| {
                panic::catch_unwind(AssertUnwindSafe(|| kernels::run(kernel.signature(), &args)))
                    .unwrap_or_else(|payload| Err(Error::Internal(panic_message(payload))))
            });
            // Release buffers before waking waiters
            drop(args);
            signal.signal(result);
        }));
        Ok(event)
    }

    fn synchronize(&self) -> Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for HostBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBackend")
            .field("lanes", &self.lanes.len())
            .finish()
    }
}
