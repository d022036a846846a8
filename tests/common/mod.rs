//! Common test utilities
#![allow(dead_code)]

use hetla::container::{DenseLayout, DenseMatrix, Vector};
use hetla::runtime::{Context, ContextOptions, DeviceKind, DeviceSelector};
use hetla::sparse::{CsrHost, SparseFormat, SparseMatrix};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Route `log` output through the test harness (`RUST_LOG=hetla=debug`)
pub fn init_logging() {
    let _ = env_logger::Builder::from_default_env().is_test(true).try_init();
}

/// Create a host context for testing
pub fn create_host_context() -> Context {
    init_logging();
    Context::host()
}

/// Host context with fusion switched off
pub fn create_unfused_context() -> Context {
    Context::host_with(ContextOptions::default().with_fusion(false))
}

/// Create a CUDA context, returning None if no CUDA device is present
#[cfg(feature = "cuda")]
pub fn create_cuda_context() -> Option<Context> {
    Context::acquire(&DeviceSelector::new(DeviceKind::Cuda)).ok()
}

/// Create a WebGPU context, returning None if no adapter is present
#[cfg(feature = "wgpu")]
pub fn create_wgpu_context() -> Option<Context> {
    Context::acquire(&DeviceSelector::new(DeviceKind::Wgpu)).ok()
}

/// Any GPU context, if one can be acquired
pub fn create_gpu_context() -> Option<Context> {
    Context::acquire(&DeviceSelector::new(DeviceKind::Gpu)).ok()
}

/// Assert two f64 slices are close within tolerance
///
/// Uses the formula: |a - b| <= atol + rtol * |b|
pub fn assert_allclose_f64(a: &[f64], b: &[f64], rtol: f64, atol: f64, msg: &str) {
    assert_eq!(a.len(), b.len(), "{}: length mismatch", msg);
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        let diff = (x - y).abs();
        let tol = atol + rtol * y.abs();
        assert!(
            diff <= tol,
            "{}: element {} differs: {} vs {} (diff={}, tol={})",
            msg,
            i,
            x,
            y,
            diff,
            tol
        );
    }
}

/// Assert two f32 slices are close within tolerance
pub fn assert_allclose_f32(a: &[f32], b: &[f32], rtol: f32, atol: f32, msg: &str) {
    assert_eq!(a.len(), b.len(), "{}: length mismatch", msg);
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        let diff = (x - y).abs();
        let tol = atol + rtol * y.abs();
        assert!(
            diff <= tol,
            "{}: element {} differs: {} vs {} (diff={}, tol={})",
            msg,
            i,
            x,
            y,
            diff,
            tol
        );
    }
}

/// Seeded generator so failures reproduce
pub fn rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Uniform values in `[-1, 1)`
pub fn random_vec(rng: &mut StdRng, len: usize) -> Vec<f64> {
    (0..len).map(|_| rng.random_range(-1.0..1.0)).collect()
}

/// Row-major 1D Laplacian: diag=2, off-diag=-1 (SPD)
pub fn laplacian_1d(n: usize) -> Vec<f64> {
    let mut a = vec![0.0; n * n];
    for i in 0..n {
        a[i * n + i] = 2.0;
        if i > 0 {
            a[i * n + i - 1] = -1.0;
        }
        if i + 1 < n {
            a[i * n + i + 1] = -1.0;
        }
    }
    a
}

/// Row-major random SPD matrix `M^T M + n I`
pub fn random_spd(rng: &mut StdRng, n: usize) -> Vec<f64> {
    let m = random_vec(rng, n * n);
    let mut a = vec![0.0; n * n];
    for i in 0..n {
        for j in 0..n {
            let mut s = 0.0;
            for k in 0..n {
                s += m[k * n + i] * m[k * n + j];
            }
            a[i * n + j] = s;
        }
        a[i * n + i] += n as f64;
    }
    a
}

/// Row-major convection-diffusion matrix: tridiagonal with asymmetric
/// off-diagonals, diagonally dominant
pub fn convection_diffusion(n: usize) -> Vec<f64> {
    let mut a = vec![0.0; n * n];
    for i in 0..n {
        a[i * n + i] = 4.0;
        if i > 0 {
            a[i * n + i - 1] = -1.5;
        }
        if i + 1 < n {
            a[i * n + i + 1] = -0.5;
        }
    }
    a
}

/// Dense row-major product `A x` on the host
pub fn host_mat_vec(a: &[f64], x: &[f64], rows: usize, cols: usize) -> Vec<f64> {
    (0..rows)
        .map(|i| (0..cols).map(|j| a[i * cols + j] * x[j]).sum())
        .collect()
}

/// Upload a row-major matrix as a dense container
pub fn dense(ctx: &Context, a: &[f64], rows: usize, cols: usize) -> DenseMatrix {
    DenseMatrix::from_slice(ctx, a, rows, cols, DenseLayout::RowMajor).unwrap()
}

/// Upload a row-major matrix as a sparse container in `format`
pub fn sparse(ctx: &Context, a: &[f64], rows: usize, cols: usize, format: SparseFormat) -> SparseMatrix {
    SparseMatrix::from_dense(ctx, a, rows, cols, format).unwrap()
}

/// Host CSR of a row-major matrix
pub fn csr_host(a: &[f64], rows: usize, cols: usize) -> CsrHost<f64> {
    CsrHost::from_dense(rows, cols, a).unwrap()
}

/// Upload a vector
pub fn vector(ctx: &Context, data: &[f64]) -> Vector {
    Vector::from_slice(ctx, data).unwrap()
}

/// `||A x - b||_2 / ||b||_2` on the host
pub fn relative_residual(a: &[f64], x: &[f64], b: &[f64]) -> f64 {
    let n = b.len();
    let ax = host_mat_vec(a, x, n, n);
    let r: f64 = ax.iter().zip(b).map(|(p, q)| (p - q) * (p - q)).sum::<f64>().sqrt();
    let bn: f64 = b.iter().map(|v| v * v).sum::<f64>().sqrt();
    r / bn
}
