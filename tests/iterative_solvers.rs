//! Integration tests for iterative solvers and eigenvalue estimators

mod common;

use std::time::Duration;

use common::{
    convection_diffusion, create_host_context, dense, laplacian_1d, random_spd, random_vec,
    relative_residual, rng, sparse, vector,
};
use hetla::algorithm::{
    BiCgStabOptions, CancellationToken, CgOptions, EigenOptions, GmresOptions, SolverControl,
    SolverStatus, bicgstab, cg, gmres, lanczos, power_iteration,
};
use hetla::dtype::DType;
use hetla::error::Error;
use hetla::sparse::SparseFormat;

fn ones(n: usize) -> Vec<f64> {
    vec![1.0; n]
}

#[test]
fn test_cg_laplacian_every_format() {
    let ctx = create_host_context();
    let n = 32;
    let a = laplacian_1d(n);
    let b = vector(&ctx, &ones(n));

    for format in [SparseFormat::Csr, SparseFormat::Coo, SparseFormat::Ell, SparseFormat::Hyb] {
        let s = sparse(&ctx, &a, n, n, format);
        let result = cg(&s, &b, None, &CgOptions::default()).unwrap();
        assert!(result.converged, "{format}: {}", result.status);
        // Exact arithmetic needs n iterations on the 1D Laplacian
        assert!(result.iterations <= n + 2, "{format}: {} iterations", result.iterations);
        let x = result.solution.to_vec::<f64>().unwrap();
        assert!(relative_residual(&a, &x, &ones(n)) < 1e-7, "{format}");
    }
}

#[test]
fn test_cg_random_spd_dense() {
    let mut r = rng(21);
    let ctx = create_host_context();
    let n = 40;
    let a = random_spd(&mut r, n);
    let rhs = random_vec(&mut r, n);
    let result = cg(&dense(&ctx, &a, n, n), &vector(&ctx, &rhs), None, &CgOptions::default()).unwrap();
    assert_eq!(result.status, SolverStatus::Converged);
    assert!(result.relative_residual <= 1e-8);
    let x = result.solution.to_vec::<f64>().unwrap();
    assert!(relative_residual(&a, &x, &rhs) < 1e-7);
}

#[test]
fn test_cg_budget_reports_max_iterations() {
    let ctx = create_host_context();
    let n = 64;
    let a = sparse(&ctx, &laplacian_1d(n), n, n, SparseFormat::Csr);
    let b = vector(&ctx, &ones(n));
    let options = CgOptions {
        max_iter: 10,
        track_residual_history: true,
        ..Default::default()
    };
    let result = cg(&a, &b, None, &options).unwrap();
    assert_eq!(result.status, SolverStatus::MaxIterationsExceeded);
    assert!(!result.converged);
    assert_eq!(result.iterations, 10);
    assert_eq!(result.history.len(), 10);
    assert!(result.residual_norm.is_finite());
}

#[test]
fn test_cg_warm_start_at_solution() {
    let ctx = create_host_context();
    let n = 8;
    let a = laplacian_1d(n);
    let x_true: Vec<f64> = (0..n).map(|i| i as f64).collect();
    let rhs = common::host_mat_vec(&a, &x_true, n, n);
    let result = cg(
        &dense(&ctx, &a, n, n),
        &vector(&ctx, &rhs),
        Some(&vector(&ctx, &x_true)),
        &CgOptions::default(),
    )
    .unwrap();
    assert!(result.converged);
    assert_eq!(result.iterations, 0);
}

#[test]
fn test_bicgstab_nonsymmetric() {
    let ctx = create_host_context();
    let n = 50;
    let a = convection_diffusion(n);
    let rhs: Vec<f64> = (0..n).map(|i| (i as f64 * 0.3).sin()).collect();
    for format in [SparseFormat::Csr, SparseFormat::Ell] {
        let s = sparse(&ctx, &a, n, n, format);
        let result = bicgstab(&s, &vector(&ctx, &rhs), None, &BiCgStabOptions::default()).unwrap();
        assert!(result.converged, "{format}");
        let x = result.solution.to_vec::<f64>().unwrap();
        assert!(relative_residual(&a, &x, &rhs) < 1e-7, "{format}");
    }
}

#[test]
fn test_gmres_restarted_converges() {
    let ctx = create_host_context();
    let n = 60;
    let a = convection_diffusion(n);
    let rhs = ones(n);
    let options = GmresOptions {
        restart: 5,
        ..Default::default()
    };
    let out = gmres(&sparse(&ctx, &a, n, n, SparseFormat::Hyb), &vector(&ctx, &rhs), None, &options)
        .unwrap();
    assert!(out.result.converged);
    assert!(out.basis_sizes.iter().all(|&k| (1..=5).contains(&k)));
    let x = out.result.solution.to_vec::<f64>().unwrap();
    assert!(relative_residual(&a, &x, &rhs) < 1e-7);
}

#[test]
fn test_gmres_restart_resets_krylov_basis() {
    let ctx = create_host_context();
    let n = 40;
    let a = sparse(&ctx, &laplacian_1d(n), n, n, SparseFormat::Csr);
    let b = vector(&ctx, &ones(n));
    let options = GmresOptions {
        restart: 4,
        max_iter: 12,
        ..Default::default()
    };
    let out = gmres(&a, &b, None, &options).unwrap();
    assert_eq!(out.result.status, SolverStatus::MaxIterationsExceeded);
    assert_eq!(out.result.iterations, 12);
    assert_eq!(out.basis_sizes, vec![1, 2, 3, 4, 1, 2, 3, 4, 1, 2, 3, 4]);
    assert!(out.restarts >= 2);
}

#[test]
fn test_gmres_basis_bounded_by_dimension() {
    let ctx = create_host_context();
    let n = 5;
    let a = dense(&ctx, &convection_diffusion(n), n, n);
    let b = vector(&ctx, &ones(n));
    let out = gmres(&a, &b, None, &GmresOptions::default()).unwrap();
    assert!(out.result.converged);
    assert!(out.basis_sizes.iter().all(|&k| k <= n));
}

#[test]
fn test_cancelled_before_first_iteration() {
    let ctx = create_host_context();
    let n = 16;
    let a = sparse(&ctx, &laplacian_1d(n), n, n, SparseFormat::Csr);
    let b = vector(&ctx, &ones(n));
    let token = CancellationToken::new();
    token.cancel();
    let control = SolverControl {
        cancel: Some(token),
        timeout: None,
    };

    let result = cg(&a, &b, None, &CgOptions { control: control.clone(), ..Default::default() }).unwrap();
    assert_eq!(result.status, SolverStatus::Cancelled);
    assert_eq!(result.iterations, 0);

    let result = bicgstab(&a, &b, None, &BiCgStabOptions { control: control.clone(), ..Default::default() })
        .unwrap();
    assert_eq!(result.status, SolverStatus::Cancelled);

    let out = gmres(&a, &b, None, &GmresOptions { control, ..Default::default() }).unwrap();
    assert_eq!(out.result.status, SolverStatus::Cancelled);
}

#[test]
fn test_zero_timeout_cancels() {
    let ctx = create_host_context();
    let n = 16;
    let a = sparse(&ctx, &laplacian_1d(n), n, n, SparseFormat::Csr);
    let b = vector(&ctx, &ones(n));
    let options = CgOptions {
        control: SolverControl {
            cancel: None,
            timeout: Some(Duration::ZERO),
        },
        ..Default::default()
    };
    assert_eq!(cg(&a, &b, None, &options).unwrap().status, SolverStatus::Cancelled);
}

#[test]
fn test_non_finite_rhs_diverges() {
    let ctx = create_host_context();
    let n = 4;
    let a = dense(&ctx, &laplacian_1d(n), n, n);
    let b = vector(&ctx, &[1.0, f64::NAN, 0.0, 1.0]);
    assert!(matches!(
        cg(&a, &b, None, &CgOptions::default()),
        Err(Error::NumericalDivergence { .. })
    ));
}

#[test]
fn test_solver_input_validation() {
    let ctx = create_host_context();
    let a = dense(&ctx, &[1.0; 6], 2, 3);
    let b = vector(&ctx, &[1.0, 1.0]);
    assert!(matches!(
        cg(&a, &b, None, &CgOptions::default()),
        Err(Error::ShapeMismatch { .. })
    ));

    let sq = dense(&ctx, &[2.0, 0.0, 0.0, 2.0], 2, 2);
    let bf32 = hetla::container::Vector::from_slice(&ctx, &[1.0f32, 1.0]).unwrap();
    assert!(cg(&sq, &bf32, None, &CgOptions::default()).is_err());

    let zero_restart = GmresOptions {
        restart: 0,
        ..Default::default()
    };
    assert!(matches!(
        gmres(&sq, &b, None, &zero_restart),
        Err(Error::InvalidArgument { .. })
    ));
}

#[test]
fn test_f32_system_converges_to_f32_precision() {
    let ctx = create_host_context();
    let n = 12;
    let a: Vec<f32> = laplacian_1d(n).iter().map(|&v| v as f32).collect();
    let a = hetla::container::DenseMatrix::from_slice(&ctx, &a, n, n, hetla::container::DenseLayout::RowMajor)
        .unwrap();
    let b = hetla::container::Vector::from_slice(&ctx, &vec![1.0f32; n]).unwrap();
    let options = CgOptions {
        rtol: 1e-4,
        ..Default::default()
    };
    let result = cg(&a, &b, None, &options).unwrap();
    assert!(result.converged);
    assert_eq!(result.solution.dtype(), DType::F32);
}

#[test]
fn test_power_iteration_dominant_eigenvalue() {
    let ctx = create_host_context();
    let n = 20;
    let a = sparse(&ctx, &laplacian_1d(n), n, n, SparseFormat::Csr);
    let x0 = vector(&ctx, &(0..n).map(|i| 1.0 + 0.1 * i as f64).collect::<Vec<_>>());
    let options = EigenOptions {
        max_iter: 5000,
        tol: 1e-10,
        ..Default::default()
    };
    let result = power_iteration(&a, Some(&x0), &options).unwrap();
    let expected = 2.0 - 2.0 * (n as f64 * std::f64::consts::PI / (n as f64 + 1.0)).cos();
    assert!(result.converged);
    assert!((result.eigenvalue - expected).abs() < 1e-4, "{} vs {}", result.eigenvalue, expected);

    let v = result.eigenvector.to_vec::<f64>().unwrap();
    let norm: f64 = v.iter().map(|x| x * x).sum::<f64>().sqrt();
    assert!((norm - 1.0).abs() < 1e-10);
}

#[test]
fn test_power_iteration_default_start() {
    let ctx = create_host_context();
    let n = 12;
    let a = sparse(&ctx, &laplacian_1d(n), n, n, SparseFormat::Csr);
    let options = EigenOptions {
        max_iter: 5000,
        tol: 1e-10,
        ..Default::default()
    };
    let result = power_iteration(&a, None, &options).unwrap();
    let expected = 2.0 - 2.0 * (n as f64 * std::f64::consts::PI / (n as f64 + 1.0)).cos();
    assert!(result.converged);
    assert!((result.eigenvalue - expected).abs() < 1e-4, "{} vs {}", result.eigenvalue, expected);
}

#[test]
fn test_power_iteration_start_without_dominant_component() {
    let ctx = create_host_context();
    let n = 20;
    let a = sparse(&ctx, &laplacian_1d(n), n, n, SparseFormat::Csr);
    let h = n as f64 + 1.0;
    let pi = std::f64::consts::PI;
    // x0 is the eigenvector of the smallest eigenvalue, so A x0 stays in its span
    let x0 = vector(&ctx, &(0..n).map(|i| ((i + 1) as f64 * pi / h).sin()).collect::<Vec<_>>());
    let result = power_iteration(&a, Some(&x0), &EigenOptions::default()).unwrap();
    let smallest = 2.0 - 2.0 * (pi / h).cos();
    let dominant = 2.0 - 2.0 * (n as f64 * pi / h).cos();
    assert!(result.converged);
    assert!(result.iterations <= 3);
    assert!((result.eigenvalue - smallest).abs() < 1e-10, "{}", result.eigenvalue);
    assert!((result.eigenvalue - dominant).abs() > 1.0);
}

#[test]
fn test_lanczos_extreme_eigenvalues() {
    let ctx = create_host_context();
    let n = 30;
    let a = sparse(&ctx, &laplacian_1d(n), n, n, SparseFormat::Ell);
    let x0 = vector(&ctx, &(0..n).map(|i| 1.0 + 0.1 * i as f64).collect::<Vec<_>>());
    let result = lanczos(&a, Some(&x0), &EigenOptions::default()).unwrap();

    let pi = std::f64::consts::PI;
    let h = n as f64 + 1.0;
    let min = 2.0 - 2.0 * (pi / h).cos();
    let max = 2.0 - 2.0 * (n as f64 * pi / h).cos();
    assert!(result.converged);
    assert!(result.iterations <= n);
    assert!((result.min_eigenvalue - min).abs() < 1e-6, "{} vs {min}", result.min_eigenvalue);
    assert!((result.max_eigenvalue - max).abs() < 1e-6, "{} vs {max}", result.max_eigenvalue);
    assert!(result.ritz_values.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn test_eigen_rejects_empty_operator() {
    let ctx = create_host_context();
    let a = hetla::container::DenseMatrix::zeros(&ctx, 0, 0, DType::F64, hetla::container::DenseLayout::RowMajor)
        .unwrap();
    assert!(matches!(
        power_iteration(&a, None, &EigenOptions::default()),
        Err(Error::InvalidArgument { .. })
    ));
}
