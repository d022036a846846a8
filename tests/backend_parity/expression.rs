// Backend parity tests for expression evaluation
//
// Fused elementwise kernels, reductions and dense products must match the
// host backend on every GPU context.

use hetla::container::{DenseLayout, DenseMatrix, Vector};
use hetla::dtype::DType;
use hetla::expr::Expr;
use hetla::runtime::Context;

use crate::backend_parity::helpers::{assert_parity, with_gpu_backends};
use crate::common::{create_host_context, rng};
use rand::Rng;

fn data_f32(seed: u64, len: usize, lo: f32, hi: f32) -> Vec<f32> {
    let mut r = rng(seed);
    (0..len).map(|_| r.random_range(lo..hi)).collect()
}

fn fused_chain(ctx: &Context, a: &[f32], b: &[f32]) -> Vec<f32> {
    let va = Vector::from_slice(ctx, a).unwrap();
    let vb = Vector::from_slice(ctx, b).unwrap();
    // tanh(a * b + 0.5) - sqrt(|a|) / (1 + b^2)
    let lhs = Expr::from(&va)
        .elementwise_mul(&vb)
        .unwrap()
        .add_scalar(0.5)
        .unwrap()
        .tanh()
        .unwrap();
    let rhs = Expr::from(&va)
        .abs()
        .unwrap()
        .sqrt()
        .unwrap()
        .elementwise_div(Expr::from(&vb).square().unwrap().add_scalar(1.0).unwrap())
        .unwrap();
    ctx.evaluate(&lhs.sub(rhs).unwrap())
        .unwrap()
        .into_vector()
        .unwrap()
        .to_vec::<f32>()
        .unwrap()
}

#[test]
fn test_fused_elementwise_parity() {
    // spans several work groups and a partial trailing group
    let a = data_f32(1, 70_001, -2.0, 2.0);
    let b = data_f32(2, 70_001, -2.0, 2.0);
    let host = fused_chain(&create_host_context(), &a, &b);

    with_gpu_backends(DType::F32, |ctx, backend| {
        let gpu = fused_chain(&ctx, &a, &b);
        assert_parity(&host, &gpu, &format!("fused_chain_{backend}"));
    });
}

fn reductions(ctx: &Context, data: &[f32]) -> Vec<f32> {
    let v = Vector::from_slice(ctx, data).unwrap();
    let e = Expr::from(&v);
    [e.sum(), e.max(), e.min(), e.norm_2(), e.norm_inf(), e.dot(&v)]
        .into_iter()
        .map(|r| {
            ctx.evaluate(&r.unwrap())
                .unwrap()
                .into_scalar()
                .unwrap()
                .value::<f32>()
                .unwrap()
        })
        .collect()
}

#[test]
fn test_reduction_parity() {
    for (seed, len) in [(3, 1), (4, 255), (5, 256), (6, 100_000)] {
        let data = data_f32(seed, len, 0.0, 1.0);
        let host = reductions(&create_host_context(), &data);
        with_gpu_backends(DType::F32, |ctx, backend| {
            let gpu = reductions(&ctx, &data);
            assert_parity(&host, &gpu, &format!("reduce_{len}_{backend}"));
        });
    }
}

#[test]
fn test_reduction_of_negative_values() {
    // max of all-negative data exercises the reduce identity
    let data = data_f32(8, 1000, -5.0, -1.0);
    let host = reductions(&create_host_context(), &data);
    with_gpu_backends(DType::F32, |ctx, backend| {
        let gpu = reductions(&ctx, &data);
        assert_parity(&host[1..3], &gpu[1..3], &format!("reduce_negative_{backend}"));
    });
}

fn products(ctx: &Context, a: &[f64], b: &[f64], x: &[f64], layout: DenseLayout) -> (Vec<f64>, Vec<f64>) {
    let (m, k, n) = (17, 13, 11);
    let da = DenseMatrix::from_slice(ctx, a, m, k, DenseLayout::RowMajor)
        .unwrap()
        .to_layout(layout)
        .unwrap();
    let db = DenseMatrix::from_slice(ctx, b, k, n, DenseLayout::RowMajor).unwrap();
    let vx = Vector::from_slice(ctx, x).unwrap();
    let ax = ctx
        .evaluate(&Expr::from(&da).mat_vec(&vx).unwrap())
        .unwrap()
        .into_vector()
        .unwrap()
        .to_vec::<f64>()
        .unwrap();
    let ab = ctx
        .evaluate(&Expr::from(&da).mat_mul(&db).unwrap())
        .unwrap()
        .into_matrix()
        .unwrap()
        .to_vec::<f64>(DenseLayout::RowMajor)
        .unwrap();
    (ax, ab)
}

#[test]
fn test_dense_products_parity_f64() {
    let mut r = rng(9);
    let a: Vec<f64> = (0..17 * 13).map(|_| r.random_range(-1.0..1.0)).collect();
    let b: Vec<f64> = (0..13 * 11).map(|_| r.random_range(-1.0..1.0)).collect();
    let x: Vec<f64> = (0..13).map(|_| r.random_range(-1.0..1.0)).collect();
    let host = create_host_context();

    for layout in [DenseLayout::RowMajor, DenseLayout::ColMajor] {
        let (hax, hab) = products(&host, &a, &b, &x, layout);
        with_gpu_backends(DType::F64, |ctx, backend| {
            let (gax, gab) = products(&ctx, &a, &b, &x, layout);
            assert_parity(&hax, &gax, &format!("mat_vec_{layout:?}_{backend}"));
            assert_parity(&hab, &gab, &format!("mat_mul_{layout:?}_{backend}"));
        });
    }
}

#[test]
fn test_strided_view_parity() {
    let data = data_f32(10, 12 * 10, -1.0, 1.0);
    let run = |ctx: &Context| {
        let m = DenseMatrix::from_slice(ctx, &data, 12, 10, DenseLayout::RowMajor).unwrap();
        let view = m.range(2..9, 1..8).unwrap().transposed();
        ctx.evaluate(&Expr::from(&view).scale(3.0).unwrap().exp().unwrap())
            .unwrap()
            .into_matrix()
            .unwrap()
            .to_vec::<f32>(DenseLayout::RowMajor)
            .unwrap()
    };
    let host = run(&create_host_context());
    with_gpu_backends(DType::F32, |ctx, backend| {
        assert_parity(&host, &run(&ctx), &format!("strided_view_{backend}"));
    });
}

#[test]
fn test_integer_parity() {
    let a: Vec<i32> = vec![7, -7, 5, i32::MAX, 0, -1];
    let b: Vec<i32> = vec![2, 2, 0, 1, 3, -1];
    let run = |ctx: &Context| {
        let va = Vector::from_slice(ctx, &a).unwrap();
        let vb = Vector::from_slice(ctx, &b).unwrap();
        let e = Expr::from(&va)
            .elementwise_div(&vb)
            .unwrap()
            .add(Expr::from(&va).elementwise_mul(&vb).unwrap())
            .unwrap();
        ctx.evaluate(&e)
            .unwrap()
            .into_vector()
            .unwrap()
            .to_vec::<i32>()
            .unwrap()
    };
    let host = run(&create_host_context());
    with_gpu_backends(DType::I32, |ctx, backend| {
        assert_parity(&host, &run(&ctx), &format!("int_ops_{backend}"));
    });
}
