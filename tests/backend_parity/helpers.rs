//! Backend locks and host-vs-device comparison for the parity tests

use hetla::dtype::{DType, Element};
use hetla::runtime::Context;
#[cfg(any(feature = "wgpu", feature = "cuda"))]
use std::sync::{Mutex, OnceLock};

#[cfg(feature = "cuda")]
use crate::common::create_cuda_context;
#[cfg(feature = "wgpu")]
use crate::common::create_wgpu_context;

#[cfg(feature = "cuda")]
static CUDA_BACKEND_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
#[cfg(feature = "wgpu")]
static WGPU_BACKEND_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

/// `(rtol, atol)` for comparing a GPU result against the host one
fn parity_tolerance(dtype: DType) -> (f64, f64) {
    match dtype {
        DType::F32 => (1e-5, 1e-6),
        DType::F64 => (1e-12, 1e-14),
        DType::I32 | DType::I64 => (0.0, 0.0),
    }
}

/// Element-wise comparison of a host result (`want`) with a backend result
pub fn assert_parity<T: Element>(want: &[T], got: &[T], label: &str) {
    assert_eq!(want.len(), got.len(), "{label}: {} host vs {} device elements", want.len(), got.len());
    let (rtol, atol) = parity_tolerance(T::DTYPE);
    for (i, (w, g)) in want.iter().zip(got).enumerate() {
        let (w, g) = (w.to_f64(), g.to_f64());
        let tol = atol + rtol * w.abs();
        assert!((w - g).abs() <= tol, "{label}[{i}]: host {w} vs device {g} (tol {tol})");
    }
}

#[cfg(feature = "cuda")]
pub fn with_cuda_backend<F>(mut f: F)
where
    F: FnMut(Context),
{
    let _guard = CUDA_BACKEND_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    match create_cuda_context() {
        Some(ctx) => f(ctx),
        None => eprintln!("skipping CUDA parity: no device"),
    }
}

#[cfg(feature = "wgpu")]
pub fn with_wgpu_backend<F>(mut f: F)
where
    F: FnMut(Context),
{
    let _guard = WGPU_BACKEND_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    match create_wgpu_context() {
        Some(ctx) => f(ctx),
        None => eprintln!("skipping WebGPU parity: no adapter"),
    }
}

/// Run `f` on every GPU context that supports `dtype`, labelled by backend
#[allow(unused_mut, unused_variables)]
pub fn with_gpu_backends<F>(dtype: DType, mut f: F)
where
    F: FnMut(Context, &str),
{
    #[cfg(feature = "cuda")]
    with_cuda_backend(|ctx| {
        if ctx.supports_dtype(dtype) {
            f(ctx, "cuda");
        }
    });
    #[cfg(feature = "wgpu")]
    with_wgpu_backend(|ctx| {
        if ctx.supports_dtype(dtype) {
            f(ctx, "wgpu");
        }
    });
}
