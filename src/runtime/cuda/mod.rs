//! CUDA execution backend
//!
//! One context and one stream per backend. Kernels are CUDA C generated per
//! signature (see `runtime::codegen`) and compiled at runtime with NVRTC.
//! Allocation, copies and launches are all ordered on the stream, so
//! dependencies on earlier submissions are satisfied by construction.
//! Completion is tracked with CUDA events recorded after each launch.

use cudarc::driver::PushKernelArg;
use cudarc::driver::safe::{CudaContext, CudaEvent, CudaFunction, CudaStream, LaunchConfig};
use cudarc::driver::sys::{self, CUresult};
use log::{debug, info, trace};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

use super::codegen::{self, GROUP_SIZE, input_slots, uses_params};
use super::kernel::{Kernel, KernelArgs, KernelSignature};
use super::{BackendKind, DeviceMemory, Event, EventDriver, ExecutionBackend};
use crate::dtype::DType;
use crate::error::{Error, Result};

fn check(result: CUresult, what: &str) -> Result<()> {
    if result == CUresult::CUDA_SUCCESS {
        Ok(())
    } else {
        Err(Error::backend("cuda", format!("{what} failed: {result:?}")))
    }
}

fn driver_error(what: &str, error: impl fmt::Debug) -> Error {
    Error::backend("cuda", format!("{what} failed: {error:?}"))
}

/// Whether a CUDA context is current on this thread (false during teardown)
fn context_is_current() -> bool {
    let mut ctx: sys::CUcontext = std::ptr::null_mut();
    let result = unsafe { sys::cuCtxGetCurrent(&mut ctx) };
    result == CUresult::CUDA_SUCCESS && !ctx.is_null()
}

/// Device allocation ordered on the backend stream
pub struct CudaMemory {
    ptr: u64,
    byte_len: usize,
    context: Arc<CudaContext>,
    stream: Arc<CudaStream>,
}

impl CudaMemory {
    /// Size in bytes
    pub fn byte_len(&self) -> usize {
        self.byte_len
    }
}

impl Drop for CudaMemory {
    fn drop(&mut self) {
        if self.ptr == 0 || self.context.bind_to_thread().is_err() || !context_is_current() {
            return;
        }
        let result = unsafe { sys::cuMemFreeAsync(self.ptr, self.stream.cu_stream()) };
        if result != CUresult::CUDA_SUCCESS {
            log::warn!("cuMemFreeAsync failed for 0x{:x}: {:?}", self.ptr, result);
        }
    }
}

impl fmt::Debug for CudaMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CudaMemory")
            .field("ptr", &format_args!("0x{:x}", self.ptr))
            .field("byte_len", &self.byte_len)
            .finish()
    }
}

fn cuda_memory(memory: &DeviceMemory) -> Result<&CudaMemory> {
    match memory {
        DeviceMemory::Cuda(m) => Ok(m),
        #[allow(unreachable_patterns)]
        other => Err(Error::backend(
            "cuda",
            format!("cannot access {} memory", other.backend_kind()),
        )),
    }
}

/// Compiled payload of a CUDA kernel
struct CudaKernel {
    function: CudaFunction,
    inputs: usize,
    params: bool,
}

/// Completion of work recorded on the stream
struct StreamDriver {
    event: CudaEvent,
}

impl EventDriver for StreamDriver {
    fn drive(&self) -> Result<()> {
        self.event
            .synchronize()
            .map_err(|e| driver_error("event synchronize", e))
    }

    fn poll(&self) -> bool {
        self.event.is_complete()
    }
}

/// Backend running NVRTC kernels on one CUDA device
pub struct CudaBackend {
    index: usize,
    name: String,
    context: Arc<CudaContext>,
    stream: Arc<CudaStream>,
}

impl CudaBackend {
    /// Open CUDA device `index` with a fresh stream
    ///
    /// # Errors
    ///
    /// `NoDeviceFound` if the driver is missing or reports fewer devices.
    pub fn new(index: usize) -> Result<Self> {
        let count = CudaContext::device_count().map_err(|e| Error::NoDeviceFound {
            selector: format!("cuda:{index} (driver unavailable: {e:?})"),
        })?;
        if index >= count.max(0) as usize {
            return Err(Error::NoDeviceFound {
                selector: format!("cuda:{index} ({count} devices)"),
            });
        }
        let context = CudaContext::new(index).map_err(|e| driver_error("context creation", e))?;
        context
            .bind_to_thread()
            .map_err(|e| driver_error("context bind", e))?;
        let stream = context
            .new_stream()
            .map_err(|e| driver_error("stream creation", e))?;
        let name = context
            .name()
            .unwrap_or_else(|_| format!("CUDA device {index}"));
        info!("opened cuda device {index}: {name}");
        Ok(Self {
            index,
            name,
            context,
            stream,
        })
    }

    fn bind(&self) -> Result<()> {
        self.context
            .bind_to_thread()
            .map_err(|e| driver_error("context bind", e))
    }

    fn raw_alloc(&self, byte_len: usize) -> Result<CudaMemory> {
        self.bind()?;
        let mut ptr: u64 = 0;
        if byte_len > 0 {
            let result = unsafe { sys::cuMemAllocAsync(&mut ptr, byte_len, self.stream.cu_stream()) };
            if result == CUresult::CUDA_ERROR_OUT_OF_MEMORY {
                let (mut free, mut total) = (0usize, 0usize);
                let _ = unsafe { sys::cuMemGetInfo_v2(&mut free, &mut total) };
                return Err(Error::OutOfDeviceMemory {
                    requested: byte_len,
                    available: free,
                });
            }
            check(result, "cuMemAllocAsync")?;
        }
        Ok(CudaMemory {
            ptr,
            byte_len,
            context: self.context.clone(),
            stream: self.stream.clone(),
        })
    }

    /// Temporary device copy of host bytes, freed in stream order on drop
    fn upload(&self, bytes: &[u8]) -> Result<CudaMemory> {
        let memory = self.raw_alloc(bytes.len())?;
        if !bytes.is_empty() {
            let result = unsafe {
                sys::cuMemcpyHtoDAsync_v2(
                    memory.ptr,
                    bytes.as_ptr() as *const std::ffi::c_void,
                    bytes.len(),
                    self.stream.cu_stream(),
                )
            };
            check(result, "cuMemcpyHtoDAsync")?;
        }
        Ok(memory)
    }

    fn sync_stream(&self) -> Result<()> {
        self.stream
            .synchronize()
            .map_err(|e| driver_error("stream synchronize", e))
    }
}

impl ExecutionBackend for CudaBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Cuda
    }

    fn device_name(&self) -> String {
        format!("{} (cuda:{})", self.name, self.index)
    }

    fn supports_dtype(&self, _dtype: DType) -> bool {
        true
    }

    fn max_kernel_inputs(&self) -> usize {
        16
    }

    fn allocate(&self, byte_len: usize) -> Result<DeviceMemory> {
        let memory = self.raw_alloc(byte_len)?;
        if byte_len > 0 {
            let result =
                unsafe { sys::cuMemsetD8Async(memory.ptr, 0, byte_len, self.stream.cu_stream()) };
            check(result, "cuMemsetD8Async")?;
        }
        Ok(DeviceMemory::Cuda(memory))
    }

    fn write(&self, memory: &DeviceMemory, byte_offset: usize, data: &[u8]) -> Result<()> {
        let memory = cuda_memory(memory)?;
        if data.is_empty() {
            return Ok(());
        }
        self.bind()?;
        let result = unsafe {
            sys::cuMemcpyHtoDAsync_v2(
                memory.ptr + byte_offset as u64,
                data.as_ptr() as *const std::ffi::c_void,
                data.len(),
                self.stream.cu_stream(),
            )
        };
        check(result, "cuMemcpyHtoDAsync")?;
        self.sync_stream()
    }

    fn read(&self, memory: &DeviceMemory, byte_offset: usize, out: &mut [u8]) -> Result<()> {
        let memory = cuda_memory(memory)?;
        if out.is_empty() {
            return Ok(());
        }
        self.bind()?;
        let result = unsafe {
            sys::cuMemcpyDtoHAsync_v2(
                out.as_mut_ptr() as *mut std::ffi::c_void,
                memory.ptr + byte_offset as u64,
                out.len(),
                self.stream.cu_stream(),
            )
        };
        check(result, "cuMemcpyDtoHAsync")?;
        self.sync_stream()
    }

    fn compile(&self, signature: &KernelSignature) -> Result<Arc<dyn Any + Send + Sync>> {
        let source = codegen::cuda_source(signature)?;
        let ptx = cudarc::nvrtc::compile_ptx(&source)
            .map_err(|e| Error::backend("cuda", format!("NVRTC failed for {signature}: {e:?}")))?;
        let module = self
            .context
            .load_module(ptx)
            .map_err(|e| driver_error("module load", e))?;
        let function = module
            .load_function(codegen::CUDA_ENTRY_POINT)
            .map_err(|e| driver_error("kernel lookup", e))?;
        debug!("compiled cuda kernel {signature}");
        Ok(Arc::new(CudaKernel {
            function,
            inputs: input_slots(&signature.op).len(),
            params: uses_params(&signature.op),
        }))
    }

    fn submit(&self, kernel: &Kernel, args: KernelArgs, dependencies: Vec<Event>) -> Result<Event> {
        let compiled = kernel
            .compiled::<CudaKernel>()
            .ok_or_else(|| Error::backend("cuda", "kernel was not compiled by the cuda backend"))?;
        let signature = kernel.signature();

        // One stream: unfinished dependencies were enqueued earlier
        for dependency in &dependencies {
            if dependency.is_complete() {
                if let Err(error) = dependency.wait() {
                    return Ok(Event::failed(error));
                }
            }
        }

        if args.inputs.len() != compiled.inputs || args.outputs.len() != 1 {
            return Err(Error::Internal(format!(
                "kernel {signature} expects {} inputs/1 output, got {}/{}",
                compiled.inputs,
                args.inputs.len(),
                args.outputs.len()
            )));
        }
        let groups = codegen::work_size(&signature.op, &args)?.groups();
        if groups == 0 {
            return Ok(Event::completed());
        }
        let grid = u32::try_from(groups).map_err(|_| Error::UnsupportedOperation {
            op: "cuda kernel",
            reason: format!("{groups} blocks exceed the grid limit"),
        })?;

        self.bind()?;
        let dims = self.upload(bytemuck::cast_slice(&args.dims))?;
        let params = if compiled.params {
            let mut values = args.params.clone();
            if values.is_empty() {
                values.push(0.0);
            }
            Some(self.upload(bytemuck::cast_slice(&values))?)
        } else {
            None
        };

        let mut pointers: Vec<u64> = Vec::with_capacity(args.inputs.len() + 3);
        for buffer in args.inputs.iter().chain(&args.outputs) {
            pointers.push(cuda_memory(buffer.memory())?.ptr);
        }
        pointers.push(dims.ptr);
        if let Some(params) = &params {
            pointers.push(params.ptr);
        }

        let config = LaunchConfig {
            grid_dim: (grid, 1, 1),
            block_dim: (GROUP_SIZE, 1, 1),
            shared_mem_bytes: 0,
        };
        let mut builder = self.stream.launch_builder(&compiled.function);
        for pointer in &pointers {
            builder.arg(pointer);
        }
        unsafe { builder.launch(config) }
            .map_err(|e| driver_error(&format!("launch of {signature}"), e))?;
        trace!("cuda launch {signature}: {grid} blocks");

        let event = self
            .stream
            .record_event(None)
            .map_err(|e| driver_error("event record", e))?;
        // dims and params are freed in stream order after the launch
        drop((dims, params));
        Ok(Event::driven(Box::new(StreamDriver { event })))
    }

    fn synchronize(&self) -> Result<()> {
        self.bind()?;
        self.sync_stream()
    }
}

impl fmt::Debug for CudaBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CudaBackend")
            .field("index", &self.index)
            .field("name", &self.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_device() {
        assert!(matches!(
            CudaBackend::new(usize::MAX),
            Err(Error::NoDeviceFound { .. })
        ));
    }

    #[test]
    fn test_round_trip_memory() {
        let Ok(backend) = CudaBackend::new(0) else {
            return;
        };
        let memory = backend.allocate(16).unwrap();
        backend.write(&memory, 4, &[1, 2, 3, 4]).unwrap();
        let mut out = [9u8; 16];
        backend.read(&memory, 0, &mut out).unwrap();
        assert_eq!(out, [0, 0, 0, 0, 1, 2, 3, 4, 0, 0, 0, 0, 0, 0, 0, 0]);
    }
}
