//! Integration tests for triangular solves

mod common;

use common::{assert_allclose_f64, create_host_context, random_vec, rng};
use hetla::algorithm::solve_triangular;
use hetla::container::{Container, DenseLayout, DenseMatrix, Vector};
use hetla::error::Error;
use hetla::expr::Expr;
use hetla::runtime::Triangle;

/// Row-major well-conditioned triangle
fn triangle(n: usize, upper: bool, seed: u64) -> Vec<f64> {
    let mut r = rng(seed);
    let noise = random_vec(&mut r, n * n);
    let mut a = vec![0.0; n * n];
    for i in 0..n {
        for j in 0..n {
            let keep = if upper { j >= i } else { j <= i };
            if keep {
                a[i * n + j] = noise[i * n + j] * 0.5;
            }
        }
        a[i * n + i] = 2.0 + noise[i * n + i].abs();
    }
    a
}

/// Row-major `A X` for `n x k` row-major X
fn host_mat_mul(a: &[f64], x: &[f64], n: usize, k: usize) -> Vec<f64> {
    let mut out = vec![0.0; n * k];
    for i in 0..n {
        for c in 0..k {
            out[i * k + c] = (0..n).map(|p| a[i * n + p] * x[p * k + c]).sum();
        }
    }
    out
}

#[test]
fn test_lower_and_upper_recover_solution() {
    let ctx = create_host_context();
    let n = 24;
    for (upper, tri) in [(false, Triangle::Lower), (true, Triangle::Upper)] {
        let a = triangle(n, upper, 1 + upper as u64);
        let x_true: Vec<f64> = (0..n).map(|i| (i as f64 * 0.7).cos()).collect();
        let b = common::host_mat_vec(&a, &x_true, n, n);

        for layout in [DenseLayout::RowMajor, DenseLayout::ColMajor] {
            let m = DenseMatrix::from_slice(&ctx, &a, n, n, DenseLayout::RowMajor)
                .unwrap()
                .to_layout(layout)
                .unwrap();
            let x = solve_triangular(&m, &Vector::from_slice(&ctx, &b).unwrap(), tri, false)
                .unwrap()
                .into_vector()
                .unwrap();
            assert_allclose_f64(&x.to_vec::<f64>().unwrap(), &x_true, 1e-10, 1e-12, "triangular");
        }
    }
}

#[test]
fn test_multiple_right_hand_sides() {
    let ctx = create_host_context();
    let (n, k) = (10, 3);
    let a = triangle(n, false, 9);
    let mut r = rng(4);
    let x_true = random_vec(&mut r, n * k);
    let b = host_mat_mul(&a, &x_true, n, k);

    let m = DenseMatrix::from_slice(&ctx, &a, n, n, DenseLayout::RowMajor).unwrap();
    let rhs = DenseMatrix::from_slice(&ctx, &b, n, k, DenseLayout::RowMajor)
        .unwrap()
        .to_layout(DenseLayout::ColMajor)
        .unwrap();
    let x = solve_triangular(&m, &rhs, Triangle::Lower, false)
        .unwrap()
        .into_matrix()
        .unwrap();
    assert_eq!(x.shape(), (n, k));
    assert_allclose_f64(&x.to_vec::<f64>(DenseLayout::RowMajor).unwrap(), &x_true, 1e-10, 1e-12, "multi rhs");
}

#[test]
fn test_transposed_view_solves_the_other_triangle() {
    let ctx = create_host_context();
    let n = 8;
    let l = triangle(n, false, 33);
    let b: Vec<f64> = (0..n).map(|i| i as f64 + 1.0).collect();

    // L^T is upper triangular
    let mut lt = vec![0.0; n * n];
    for i in 0..n {
        for j in 0..n {
            lt[i * n + j] = l[j * n + i];
        }
    }
    let view = DenseMatrix::from_slice(&ctx, &l, n, n, DenseLayout::RowMajor)
        .unwrap()
        .transposed();
    let direct = DenseMatrix::from_slice(&ctx, &lt, n, n, DenseLayout::RowMajor).unwrap();
    let rhs = Vector::from_slice(&ctx, &b).unwrap();

    let via_view = solve_triangular(&view, &rhs, Triangle::Upper, false).unwrap();
    let via_copy = solve_triangular(&direct, &rhs, Triangle::Upper, false).unwrap();
    assert!(via_view.max_abs_diff(&via_copy).unwrap() < 1e-14);
}

#[test]
fn test_expression_right_hand_side() {
    let ctx = create_host_context();
    let a = DenseMatrix::from_slice(&ctx, &[2.0, 0.0, 1.0, 4.0], 2, 2, DenseLayout::RowMajor).unwrap();
    let b = Vector::from_slice(&ctx, &[1.0, 2.5]).unwrap();
    // solve L x = 2b
    let x = solve_triangular(&a, Expr::from(&b).scale(2.0).unwrap(), Triangle::Lower, false)
        .unwrap();
    match x {
        Container::Vector(v) => assert_eq!(v.to_vec::<f64>().unwrap(), vec![1.0, 1.0]),
        other => panic!("expected a vector, got {}", other.kind_name()),
    }
}

#[test]
fn test_subnormal_pivot_is_reported() {
    let ctx = create_host_context();
    let a = DenseMatrix::from_slice(&ctx, &[1.0, 0.0, 0.0, 1e-310], 2, 2, DenseLayout::RowMajor).unwrap();
    let b = Vector::from_slice(&ctx, &[1.0, 1.0]).unwrap();
    assert!(matches!(
        solve_triangular(&a, &b, Triangle::Upper, false),
        Err(Error::SingularSystem { index: 1, .. })
    ));
    // unit diagonal never reads the diagonal
    assert!(solve_triangular(&a, &b, Triangle::Upper, true).is_ok());
}

#[test]
fn test_widely_scaled_pivots_are_accepted() {
    let ctx = create_host_context();
    let n = 6;
    let mut a = vec![0.0; n * n];
    for i in 0..n {
        a[i * n + i] = 10f64.powi(3 * i as i32 - 6);
        if i > 0 {
            a[i * n + i - 1] = 1.0;
        }
    }
    let x_true: Vec<f64> = (0..n).map(|i| i as f64 + 1.0).collect();
    let rhs = common::host_mat_vec(&a, &x_true, n, n);
    let m = DenseMatrix::from_slice(&ctx, &a, n, n, DenseLayout::RowMajor).unwrap();
    let b = Vector::from_slice(&ctx, &rhs).unwrap();
    let x = solve_triangular(&m, &b, Triangle::Lower, false)
        .unwrap()
        .into_vector()
        .unwrap()
        .to_vec::<f64>()
        .unwrap();
    for (got, want) in x.iter().zip(&x_true) {
        assert!((got - want).abs() <= 1e-6 * want.abs(), "{got} vs {want}");
    }
}

#[test]
fn test_integer_triangle_rejected() {
    let ctx = create_host_context();
    let a = DenseMatrix::from_slice(&ctx, &[1i64, 0, 0, 1], 2, 2, DenseLayout::RowMajor).unwrap();
    let b = Vector::from_slice(&ctx, &[1i64, 1]).unwrap();
    assert!(matches!(
        solve_triangular(&a, &b, Triangle::Lower, false),
        Err(Error::UnsupportedDType { .. })
    ));
}
