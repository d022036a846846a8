// Backend parity tests for solvers
//
// Solvers are compositions of expressions, so a GPU context must reach the
// same solution as the host within the working precision.

use hetla::algorithm::{CgOptions, EigenOptions, GmresOptions, cg, gmres, lanczos, solve_triangular};
use hetla::container::{DenseLayout, DenseMatrix, Vector};
use hetla::dtype::DType;
use hetla::runtime::{Context, Triangle};
use hetla::sparse::{SparseFormat, SparseMatrix};

use crate::backend_parity::helpers::{assert_parity, with_gpu_backends};
use crate::common::{convection_diffusion, create_host_context, laplacian_1d};

fn to_f32(v: &[f64]) -> Vec<f32> {
    v.iter().map(|&x| x as f32).collect()
}

fn cg_solution(ctx: &Context, n: usize) -> Vec<f32> {
    let a = SparseMatrix::from_dense(ctx, &to_f32(&laplacian_1d(n)), n, n, SparseFormat::Csr).unwrap();
    let b = Vector::from_slice(ctx, &vec![1.0f32; n]).unwrap();
    let options = CgOptions {
        rtol: 1e-4,
        ..Default::default()
    };
    let result = cg(&a, &b, None, &options).unwrap();
    assert!(result.converged, "cg on {:?}: {}", ctx.backend_kind(), result.status);
    result.solution.to_vec::<f32>().unwrap()
}

#[test]
fn test_cg_parity() {
    let n = 24;
    let host = cg_solution(&create_host_context(), n);
    with_gpu_backends(DType::F32, |ctx, backend| {
        let gpu = cg_solution(&ctx, n);
        // solution entries are O(n^2); compare relative to the largest
        let scale = host.iter().fold(0.0f32, |m, v| m.max(v.abs()));
        let h: Vec<f32> = host.iter().map(|v| v / scale).collect();
        let g: Vec<f32> = gpu.iter().map(|v| v / scale).collect();
        for (i, (x, y)) in h.iter().zip(&g).enumerate() {
            assert!((x - y).abs() < 1e-3, "cg_{backend}[{i}]: {x} vs {y}");
        }
    });
}

#[test]
fn test_gmres_parity() {
    let n = 30;
    let run = |ctx: &Context| {
        let a = DenseMatrix::from_slice(ctx, &to_f32(&convection_diffusion(n)), n, n, DenseLayout::RowMajor)
            .unwrap();
        let b = Vector::from_slice(ctx, &vec![1.0f32; n]).unwrap();
        let options = GmresOptions {
            restart: 10,
            rtol: 1e-6,
            ..Default::default()
        };
        let out = gmres(&a, &b, None, &options).unwrap();
        assert!(out.result.converged);
        out.result.solution.to_vec::<f32>().unwrap()
    };
    let host = run(&create_host_context());
    with_gpu_backends(DType::F32, |ctx, backend| {
        let gpu = run(&ctx);
        for (i, (x, y)) in host.iter().zip(&gpu).enumerate() {
            assert!((x - y).abs() < 1e-4 * (1.0 + x.abs()), "gmres_{backend}[{i}]: {x} vs {y}");
        }
    });
}

#[test]
fn test_triangular_parity() {
    let n = 16;
    let mut l = vec![0.0f32; n * n];
    for i in 0..n {
        for j in 0..=i {
            l[i * n + j] = if i == j { 2.0 + i as f32 * 0.1 } else { 0.3 / (1 + i - j) as f32 };
        }
    }
    let rhs: Vec<f32> = (0..n * 2).map(|k| (k % 5) as f32 - 2.0).collect();
    let run = |ctx: &Context| {
        let a = DenseMatrix::from_slice(ctx, &l, n, n, DenseLayout::RowMajor).unwrap();
        let b = DenseMatrix::from_slice(ctx, &rhs, n, 2, DenseLayout::ColMajor).unwrap();
        solve_triangular(&a, &b, Triangle::Lower, false)
            .unwrap()
            .into_matrix()
            .unwrap()
            .to_vec::<f32>(DenseLayout::ColMajor)
            .unwrap()
    };
    let host = run(&create_host_context());
    with_gpu_backends(DType::F32, |ctx, backend| {
        assert_parity(&host, &run(&ctx), &format!("triangular_{backend}"));
    });
}

#[test]
fn test_lanczos_parity() {
    let n = 20;
    let run = |ctx: &Context| {
        let a = SparseMatrix::from_dense(ctx, &to_f32(&laplacian_1d(n)), n, n, SparseFormat::Ell).unwrap();
        let options = EigenOptions {
            tol: 1e-5,
            ..Default::default()
        };
        let result = lanczos(&a, None, &options).unwrap();
        (result.min_eigenvalue, result.max_eigenvalue)
    };
    let (hmin, hmax) = run(&create_host_context());
    with_gpu_backends(DType::F32, |ctx, backend| {
        let (gmin, gmax) = run(&ctx);
        assert!((hmin - gmin).abs() < 1e-3, "lanczos_min_{backend}: {hmin} vs {gmin}");
        assert!((hmax - gmax).abs() < 1e-3, "lanczos_max_{backend}: {hmax} vs {gmax}");
    });
}
