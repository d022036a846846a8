//! WebGPU execution backend
//!
//! Kernels are WGSL generated per signature (see `runtime::codegen`) and run
//! on the device's single queue. The queue executes submissions in order,
//! so dependencies on earlier submissions of the same context are satisfied
//! by construction; only already-failed dependencies are checked. Events are
//! driven: waiting polls the device until the submission has finished.
//!
//! WGSL has no 64-bit types, so this backend stores and computes `f32` and
//! `i32` only.

mod pipeline;

use log::{debug, info, trace};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use self::pipeline::WgpuKernel;
use super::codegen::{self, GROUP_SIZE};
use super::kernel::{Kernel, KernelArgs, KernelOp, KernelSignature, ReduceOp};
use super::{BackendKind, Buffer, DeviceMemory, Event, EventDriver, ExecutionBackend};
use crate::dtype::DType;
use crate::error::{Error, Result};

/// How long a blocking device poll may take before it is reported as a failure
const POLL_TIMEOUT: Duration = Duration::from_secs(60);

/// Maximum workgroups along one dispatch dimension
const MAX_GROUPS_PER_DIM: usize = 65535;

/// Storage buffer owned by a WebGPU device
pub struct WgpuMemory {
    buffer: wgpu::Buffer,
    byte_len: usize,
}

impl WgpuMemory {
    /// Requested size in bytes (the GPU buffer is padded to 4 bytes)
    pub fn byte_len(&self) -> usize {
        self.byte_len
    }
}

impl fmt::Debug for WgpuMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WgpuMemory")
            .field("byte_len", &self.byte_len)
            .finish()
    }
}

fn wgpu_memory(memory: &DeviceMemory) -> Result<&WgpuMemory> {
    match memory {
        DeviceMemory::Wgpu(m) => Ok(m),
        #[allow(unreachable_patterns)]
        other => Err(Error::backend(
            "wgpu",
            format!("cannot access {} memory", other.backend_kind()),
        )),
    }
}

fn buffer_memory(buffer: &Buffer) -> Result<&wgpu::Buffer> {
    Ok(&wgpu_memory(buffer.memory())?.buffer)
}

/// Round a byte count up to the copy alignment (4 bytes)
fn aligned(len: usize) -> usize {
    len.next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT as usize)
}

/// Completion of one queue submission
struct SubmissionDriver {
    device: Arc<wgpu::Device>,
    index: wgpu::SubmissionIndex,
    done: Arc<AtomicBool>,
}

impl EventDriver for SubmissionDriver {
    fn drive(&self) -> Result<()> {
        if self.done.load(Ordering::Acquire) {
            return Ok(());
        }
        self.device
            .poll(wgpu::PollType::Wait {
                submission_index: Some(self.index.clone()),
                timeout: Some(POLL_TIMEOUT),
            })
            .map(|_| ())
            .map_err(|e| Error::backend("wgpu", format!("device poll failed: {e}")))
    }

    fn poll(&self) -> bool {
        if self.done.load(Ordering::Acquire) {
            return true;
        }
        let _ = self.device.poll(wgpu::PollType::Poll);
        self.done.load(Ordering::Acquire)
    }
}

/// Backend running WGSL compute shaders on one WebGPU adapter
pub struct WgpuBackend {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    info: wgpu::AdapterInfo,
    limits: wgpu::Limits,
}

impl WgpuBackend {
    /// Open the adapter with ordinal `index`
    ///
    /// # Errors
    ///
    /// `NoDeviceFound` if fewer than `index + 1` adapters exist, `Backend`
    /// if the device request fails.
    pub fn new(index: usize) -> Result<Self> {
        pollster::block_on(Self::request(index))
    }

    async fn request(index: usize) -> Result<Self> {
        let instance = wgpu::Instance::default();
        let mut adapters = instance.enumerate_adapters(wgpu::Backends::all()).await;
        if index >= adapters.len() {
            return Err(Error::NoDeviceFound {
                selector: format!("wgpu:{index} ({} adapters)", adapters.len()),
            });
        }
        let adapter = adapters.swap_remove(index);
        let info = adapter.get_info();

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("hetla WebGPU device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::Performance,
                trace: wgpu::Trace::Off,
                experimental_features: wgpu::ExperimentalFeatures::default(),
            })
            .await
            .map_err(|e| Error::backend("wgpu", format!("device request failed: {e:?}")))?;
        let limits = device.limits();

        info!("opened wgpu device {} ({:?})", info.name, info.backend);
        Ok(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
            info,
            limits,
        })
    }

    /// Largest buffer this device can bind as storage
    fn max_binding(&self) -> usize {
        (self.limits.max_storage_buffer_binding_size as u64).min(self.limits.max_buffer_size) as usize
    }

    fn storage_buffer(&self, label: &str, size: usize) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: aligned(size).max(4) as u64,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        })
    }

    /// Small read-only argument buffer filled from host words
    fn argument_buffer(&self, label: &str, words: &[u32]) -> wgpu::Buffer {
        let data: &[u32] = if words.is_empty() { &[0] } else { words };
        let buffer = self.storage_buffer(label, data.len() * 4);
        self.queue.write_buffer(&buffer, 0, bytemuck::cast_slice(data));
        buffer
    }

    fn wait_for(&self, index: wgpu::SubmissionIndex) -> Result<()> {
        self.device
            .poll(wgpu::PollType::Wait {
                submission_index: Some(index),
                timeout: Some(POLL_TIMEOUT),
            })
            .map(|_| ())
            .map_err(|e| Error::backend("wgpu", format!("device poll failed: {e}")))
    }
}

/// Dims as 32-bit words; WGSL indexes with `u32`
fn dims_words(args: &KernelArgs) -> Result<Vec<u32>> {
    args.dims
        .iter()
        .map(|&d| {
            u32::try_from(d).map_err(|_| Error::UnsupportedOperation {
                op: "wgpu kernel",
                reason: format!("extent or offset {d} exceeds 32-bit indexing"),
            })
        })
        .collect()
}

/// Params as f32 words; reductions append their identity
fn params_words(signature: &KernelSignature, args: &KernelArgs) -> Vec<u32> {
    let mut params: Vec<f32> = args.params.iter().map(|&p| p as f32).collect();
    if let KernelOp::Reduce { program, op } = &signature.op {
        params.resize(program.param_count(), 0.0);
        params.push(match op {
            ReduceOp::Sum => 0.0,
            ReduceOp::Max => f32::NEG_INFINITY,
            ReduceOp::Min => f32::INFINITY,
        });
    }
    params.iter().map(|p| p.to_bits()).collect()
}

impl ExecutionBackend for WgpuBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Wgpu
    }

    fn device_name(&self) -> String {
        format!("{} ({:?})", self.info.name, self.info.backend)
    }

    fn supports_dtype(&self, dtype: DType) -> bool {
        matches!(dtype, DType::F32 | DType::I32)
    }

    fn max_kernel_inputs(&self) -> usize {
        // out0, dims and params take three storage bindings
        (self.limits.max_storage_buffers_per_shader_stage as usize)
            .saturating_sub(3)
            .max(2)
    }

    fn allocate(&self, byte_len: usize) -> Result<DeviceMemory> {
        let available = self.max_binding();
        if aligned(byte_len) > available {
            return Err(Error::OutOfDeviceMemory {
                requested: byte_len,
                available,
            });
        }
        // New buffers are zero-initialised by WebGPU
        let buffer = self.storage_buffer("hetla_buffer", byte_len);
        Ok(DeviceMemory::Wgpu(WgpuMemory { buffer, byte_len }))
    }

    fn write(&self, memory: &DeviceMemory, byte_offset: usize, data: &[u8]) -> Result<()> {
        let memory = wgpu_memory(memory)?;
        if data.is_empty() {
            return Ok(());
        }
        if byte_offset % 4 != 0 || data.len() % 4 != 0 {
            return Err(Error::backend(
                "wgpu",
                format!("unaligned write of {} bytes at offset {byte_offset}", data.len()),
            ));
        }
        self.queue
            .write_buffer(&memory.buffer, byte_offset as u64, data);
        let index = self.queue.submit(std::iter::empty());
        self.wait_for(index)
    }

    fn read(&self, memory: &DeviceMemory, byte_offset: usize, out: &mut [u8]) -> Result<()> {
        let memory = wgpu_memory(memory)?;
        if out.is_empty() {
            return Ok(());
        }
        let start = byte_offset - byte_offset % 4;
        let size = aligned(byte_offset + out.len()) - start;

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("hetla_staging"),
            size: size as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("hetla_read"),
            });
        encoder.copy_buffer_to_buffer(&memory.buffer, start as u64, &staging, 0, size as u64);
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.synchronize()?;
        receiver
            .recv()
            .map_err(|_| Error::backend("wgpu", "map_async callback was not invoked"))?
            .map_err(|e| Error::backend("wgpu", format!("map_async failed: {e}")))?;
        {
            let data = slice.get_mapped_range();
            let skip = byte_offset - start;
            out.copy_from_slice(&data[skip..skip + out.len()]);
        }
        staging.unmap();
        Ok(())
    }

    fn compile(&self, signature: &KernelSignature) -> Result<Arc<dyn Any + Send + Sync>> {
        let kernel = pipeline::build(&self.device, signature)?;
        debug!("compiled wgpu kernel {signature}");
        Ok(Arc::new(kernel))
    }

    fn submit(&self, kernel: &Kernel, args: KernelArgs, dependencies: Vec<Event>) -> Result<Event> {
        let compiled = kernel
            .compiled::<WgpuKernel>()
            .ok_or_else(|| Error::backend("wgpu", "kernel was not compiled by the wgpu backend"))?;
        let signature = kernel.signature();

        // In-order queue: unfinished dependencies were submitted earlier
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
        let (x, y) = (groups.min(MAX_GROUPS_PER_DIM), groups.div_ceil(MAX_GROUPS_PER_DIM));
        if y > MAX_GROUPS_PER_DIM {
            return Err(Error::UnsupportedOperation {
                op: "wgpu kernel",
                reason: format!("{groups} workgroups of {GROUP_SIZE} exceed the dispatch limit"),
            });
        }

        let dims = self.argument_buffer("hetla_dims", &dims_words(&args)?);
        let params = compiled
            .params
            .then(|| self.argument_buffer("hetla_params", &params_words(signature, &args)));
        let mut buffers: Vec<&wgpu::Buffer> = Vec::with_capacity(args.inputs.len() + 3);
        for buffer in args.inputs.iter().chain(&args.outputs) {
            buffers.push(buffer_memory(buffer)?);
        }
        buffers.push(&dims);
        buffers.extend(params.as_ref());
        let bind_group = pipeline::bind_group(&self.device, compiled, &buffers);

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(signature.op.name()),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(signature.op.name()),
                timestamp_writes: None,
            });
            pass.set_pipeline(&compiled.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(x as u32, y as u32, 1);
        }
        let index = self.queue.submit(std::iter::once(encoder.finish()));
        trace!("wgpu submit {signature}: {x}x{y} workgroups");

        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        self.queue.on_submitted_work_done(move || flag.store(true, Ordering::Release));
        Ok(Event::driven(Box::new(SubmissionDriver {
            device: self.device.clone(),
            index,
            done,
        })))
    }

    fn synchronize(&self) -> Result<()> {
        self.device
            .poll(wgpu::PollType::Wait {
                submission_index: None,
                timeout: Some(POLL_TIMEOUT),
            })
            .map(|_| ())
            .map_err(|e| Error::backend("wgpu", format!("device poll failed: {e}")))
    }
}

impl fmt::Debug for WgpuBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WgpuBackend")
            .field("adapter", &self.info.name)
            .field("backend", &self.info.backend)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::kernel::{Instr, Program};

    #[test]
    fn test_reduce_params_carry_identity() {
        let sig = KernelSignature::new(
            KernelOp::Reduce {
                program: Program::identity(),
                op: ReduceOp::Max,
            },
            DType::F32,
        );
        let words = params_words(&sig, &KernelArgs::new());
        assert_eq!(words, vec![f32::NEG_INFINITY.to_bits()]);
    }

    #[test]
    fn test_elementwise_params_are_f32() {
        let mut program = Program::new();
        program.push(Instr::Input(0));
        program.push(Instr::Param(0));
        program.push(Instr::Binary(crate::runtime::kernel::BinaryOp::Mul));
        let sig = KernelSignature::new(KernelOp::Elementwise { program }, DType::F32);
        let args = KernelArgs::new().params(&[2.5]);
        assert_eq!(params_words(&sig, &args), vec![2.5f32.to_bits()]);
    }

    #[test]
    fn test_dims_overflow_is_reported() {
        let args = KernelArgs::new().dims(&[1, u64::from(u32::MAX) + 1]);
        assert!(matches!(
            dims_words(&args),
            Err(Error::UnsupportedOperation { .. })
        ));
        assert_eq!(aligned(5), 8);
    }

    #[test]
    fn test_open_first_adapter() {
        // Machines without a WebGPU adapter skip
        let Ok(backend) = WgpuBackend::new(0) else {
            return;
        };
        assert!(backend.supports_dtype(DType::F32));
        assert!(!backend.supports_dtype(DType::F64));
        assert!(backend.max_kernel_inputs() >= 2);
    }
}
