// Backend parity tests for sparse matrix-vector products
//
// Every format is checked on every GPU context, including empty rows and
// rows long enough to spill out of the HYB ELL part.

use hetla::dtype::DType;
use hetla::expr::Expr;
use hetla::runtime::Context;
use hetla::sparse::{SparseFormat, SparseMatrix};

use crate::backend_parity::helpers::{assert_parity, with_gpu_backends};
use crate::common::{create_host_context, rng};
use rand::Rng;

const FORMATS: [SparseFormat; 4] = [
    SparseFormat::Csr,
    SparseFormat::Coo,
    SparseFormat::Ell,
    SparseFormat::Hyb,
];

/// Row-major matrix where every fifth row is empty and every seventh is dense
fn pattern(rows: usize, cols: usize, seed: u64) -> Vec<f64> {
    let mut r = rng(seed);
    let mut a = vec![0.0; rows * cols];
    for i in 0..rows {
        let fill = if i % 5 == 0 {
            0.0
        } else if i % 7 == 0 {
            0.9
        } else {
            0.05
        };
        for j in 0..cols {
            if r.random::<f64>() < fill {
                a[i * cols + j] = r.random_range(-1.0..1.0);
            }
        }
    }
    a
}

fn spmv_f64(ctx: &Context, a: &[f64], x: &[f64], rows: usize, cols: usize, format: SparseFormat) -> Vec<f64> {
    let s = SparseMatrix::from_dense(ctx, a, rows, cols, format).unwrap();
    let vx = hetla::container::Vector::from_slice(ctx, x).unwrap();
    ctx.evaluate(&Expr::from(&s).mat_vec(&vx).unwrap())
        .unwrap()
        .into_vector()
        .unwrap()
        .to_vec::<f64>()
        .unwrap()
}

fn spmv_f32(ctx: &Context, a: &[f32], x: &[f32], rows: usize, cols: usize, format: SparseFormat) -> Vec<f32> {
    let s = SparseMatrix::from_dense(ctx, a, rows, cols, format).unwrap();
    let vx = hetla::container::Vector::from_slice(ctx, x).unwrap();
    ctx.evaluate(&Expr::from(&s).mat_vec(&vx).unwrap())
        .unwrap()
        .into_vector()
        .unwrap()
        .to_vec::<f32>()
        .unwrap()
}

#[test]
fn test_spmv_parity_f32() {
    let (rows, cols) = (300, 120);
    let a: Vec<f32> = pattern(rows, cols, 41).iter().map(|&v| v as f32).collect();
    let x: Vec<f32> = (0..cols).map(|j| ((j % 9) as f32 - 4.0) * 0.25).collect();
    let host = create_host_context();

    for format in FORMATS {
        let expected = spmv_f32(&host, &a, &x, rows, cols, format);
        with_gpu_backends(DType::F32, |ctx, backend| {
            let got = spmv_f32(&ctx, &a, &x, rows, cols, format);
            assert_parity(&expected, &got, &format!("spmv_{format}_{backend}"));
        });
    }
}

#[test]
fn test_spmv_parity_f64() {
    let (rows, cols) = (97, 64);
    let a = pattern(rows, cols, 42);
    let x: Vec<f64> = (0..cols).map(|j| (j as f64 * 0.1).sin()).collect();
    let host = create_host_context();

    for format in FORMATS {
        let expected = spmv_f64(&host, &a, &x, rows, cols, format);
        with_gpu_backends(DType::F64, |ctx, backend| {
            let got = spmv_f64(&ctx, &a, &x, rows, cols, format);
            assert_parity(&expected, &got, &format!("spmv_{format}_{backend}"));
        });
    }
}
