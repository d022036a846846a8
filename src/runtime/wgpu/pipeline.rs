//! Compute pipelines for generated WGSL kernels
//!
//! One [`WgpuKernel`] per signature. Every binding is a storage buffer (no
//! uniforms), so dims and params face no uniform alignment rules.

use std::panic::{self, AssertUnwindSafe};

use crate::error::{Error, Result};
use crate::runtime::codegen::{self, input_slots, uses_params};
use crate::runtime::host::panic_message;
use crate::runtime::kernel::KernelSignature;

/// Compiled payload of a WebGPU kernel
pub(crate) struct WgpuKernel {
    pub(crate) pipeline: wgpu::ComputePipeline,
    pub(crate) layout: wgpu::BindGroupLayout,
    /// Number of input bindings before `out0`
    pub(crate) inputs: usize,
    /// Whether a params binding follows `dims`
    pub(crate) params: bool,
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Generate, validate and build the pipeline for a signature
pub(crate) fn build(device: &wgpu::Device, signature: &KernelSignature) -> Result<WgpuKernel> {
    let source = codegen::wgsl_source(signature)?;
    let inputs = input_slots(&signature.op).len();
    let params = uses_params(&signature.op);
    let label = signature.to_string();

    // Storage buffers: inputs, out0, dims and optionally params
    let mut entries: Vec<wgpu::BindGroupLayoutEntry> =
        (0..inputs as u32).map(|i| storage_entry(i, true)).collect();
    entries.push(storage_entry(inputs as u32, false));
    entries.push(storage_entry(inputs as u32 + 1, true));
    if params {
        entries.push(storage_entry(inputs as u32 + 2, true));
    }

    // WebGPU reports validation failures through the uncaptured error
    // handler, which panics by default
    let built = panic::catch_unwind(AssertUnwindSafe(|| {
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(&label),
            source: wgpu::ShaderSource::Wgsl(source.as_str().into()),
        });
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(&label),
            entries: &entries,
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(&label),
            bind_group_layouts: &[&layout],
            immediate_size: 0,
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(&label),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: Some(codegen::WGSL_ENTRY_POINT),
            compilation_options: Default::default(),
            cache: None,
        });
        (pipeline, layout)
    }));

    let (pipeline, layout) = built.map_err(|payload| {
        Error::backend(
            "wgpu",
            format!("failed to build kernel {label}: {}", panic_message(payload)),
        )
    })?;
    Ok(WgpuKernel {
        pipeline,
        layout,
        inputs,
        params,
    })
}

/// Bind group over `buffers` in binding order
pub(crate) fn bind_group(
    device: &wgpu::Device,
    kernel: &WgpuKernel,
    buffers: &[&wgpu::Buffer],
) -> wgpu::BindGroup {
    let entries: Vec<wgpu::BindGroupEntry> = buffers
        .iter()
        .enumerate()
        .map(|(i, buffer)| wgpu::BindGroupEntry {
            binding: i as u32,
            resource: buffer.as_entire_binding(),
        })
        .collect();
    device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("hetla_bind_group"),
        layout: &kernel.layout,
        entries: &entries,
    })
}
