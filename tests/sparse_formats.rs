//! Integration tests for sparse containers
//!
//! Every format must give the same product as the dense matrix it was
//! built from, including empty rows and HYB overflow.

mod common;

use common::{assert_allclose_f64, create_host_context, csr_host, dense, host_mat_vec, rng, vector};
use hetla::container::DenseLayout;
use hetla::error::Error;
use hetla::expr::Expr;
use hetla::sparse::{CooHost, CsrHost, EllHost, SparseFormat, SparseMatrix};
use rand::Rng;

const FORMATS: [SparseFormat; 4] = [
    SparseFormat::Csr,
    SparseFormat::Coo,
    SparseFormat::Ell,
    SparseFormat::Hyb,
];

/// Random matrix with ~15% fill, a few dense rows and some empty ones
fn irregular(rows: usize, cols: usize, seed: u64) -> Vec<f64> {
    let mut r = rng(seed);
    let mut a = vec![0.0; rows * cols];
    for i in 0..rows {
        let fill = match i % 7 {
            0 => 0.0,
            3 => 0.8,
            _ => 0.15,
        };
        for j in 0..cols {
            if r.random::<f64>() < fill {
                a[i * cols + j] = r.random_range(-2.0..2.0);
            }
        }
    }
    a
}

#[test]
fn test_spmv_agrees_across_formats() {
    let ctx = create_host_context();
    let (m, n) = (41, 29);
    let a = irregular(m, n, 17);
    let x: Vec<f64> = (0..n).map(|j| 1.0 + j as f64 * 0.25).collect();
    let expected = host_mat_vec(&a, &x, m, n);
    let vx = vector(&ctx, &x);

    for format in FORMATS {
        let s = SparseMatrix::from_dense(&ctx, &a, m, n, format).unwrap();
        assert_eq!(s.format(), format);
        assert_eq!(s.shape(), (m, n));
        let y = ctx
            .evaluate(&Expr::from(&s).mat_vec(&vx).unwrap())
            .unwrap()
            .into_vector()
            .unwrap();
        assert_allclose_f64(&y.to_vec::<f64>().unwrap(), &expected, 1e-12, 1e-14, format.name());
    }
}

#[test]
fn test_hyb_overflow_goes_to_csr_part() {
    let ctx = create_host_context();
    #[rustfmt::skip]
    let a = [
        1.0, 2.0, 3.0, 4.0,
        0.0, 5.0, 0.0, 0.0,
        0.0, 0.0, 0.0, 0.0,
        6.0, 0.0, 0.0, 7.0,
    ];
    let hyb = csr_host(&a, 4, 4).to_hyb(1).unwrap();
    assert_eq!(hyb.ell.width, 1);
    assert_eq!(hyb.csr.nnz(), 4);

    let s = SparseMatrix::from_hyb(&ctx, &hyb).unwrap();
    assert_eq!(s.nnz(), 7);
    let x = vector(&ctx, &[1.0, 1.0, 1.0, 1.0]);
    let y = ctx
        .evaluate(&Expr::from(&s).mat_vec(&x).unwrap())
        .unwrap()
        .into_vector()
        .unwrap();
    assert_eq!(y.to_vec::<f64>().unwrap(), vec![10.0, 5.0, 0.0, 13.0]);
}

#[test]
fn test_sparse_to_dense_round_trip() {
    let ctx = create_host_context();
    let (m, n) = (9, 12);
    let a = irregular(m, n, 99);
    for format in FORMATS {
        let s = SparseMatrix::from_dense(&ctx, &a, m, n, format).unwrap();
        let d = s.to_dense(DenseLayout::ColMajor).unwrap();
        assert_eq!(d.to_vec::<f64>(DenseLayout::RowMajor).unwrap(), a, "{}", format);
        let back = s.to_host::<f64>().unwrap();
        assert_eq!(back.format(), format);
        assert_eq!(back.to_dense(), a.to_vec());
    }
}

#[test]
fn test_sparse_product_feeds_fused_expression() {
    let ctx = create_host_context();
    let n = 6;
    let a = common::laplacian_1d(n);
    let s = SparseMatrix::from_dense(&ctx, &a, n, n, SparseFormat::Csr).unwrap();
    let d = dense(&ctx, &a, n, n);
    let x = vector(&ctx, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

    // ||A x - A x||_2 == 0 with one operand sparse, the other dense
    let diff = Expr::from(&s)
        .mat_vec(&x)
        .unwrap()
        .sub(Expr::from(&d).mat_vec(&x).unwrap())
        .unwrap()
        .norm_2()
        .unwrap();
    let norm = ctx.evaluate(&diff).unwrap().into_scalar().unwrap().to_f64().unwrap();
    assert_eq!(norm, 0.0);
}

#[test]
fn test_unsorted_coo_is_accepted() {
    let ctx = create_host_context();
    let coo = CooHost {
        rows: 3,
        cols: 3,
        row_indices: vec![2, 0, 1, 0],
        col_indices: vec![1, 2, 0, 0],
        values: vec![4.0, 2.0, 3.0, 1.0],
    };
    let s = SparseMatrix::from_coo(&ctx, &coo).unwrap();
    let x = vector(&ctx, &[1.0, 10.0, 100.0]);
    let y = ctx
        .evaluate(&Expr::from(&s).mat_vec(&x).unwrap())
        .unwrap()
        .into_vector()
        .unwrap();
    assert_eq!(y.to_vec::<f64>().unwrap(), vec![201.0, 3.0, 40.0]);
}

#[test]
fn test_invalid_structures_are_rejected() {
    let ctx = create_host_context();

    let bad_ptrs = CsrHost {
        rows: 2,
        cols: 2,
        row_ptrs: vec![0, 2, 1],
        col_indices: vec![0, 1],
        values: vec![1.0, 2.0],
    };
    assert!(matches!(
        SparseMatrix::from_csr(&ctx, &bad_ptrs),
        Err(Error::InvalidSparseStructure { .. })
    ));

    let bad_col = CsrHost {
        rows: 1,
        cols: 2,
        row_ptrs: vec![0, 1],
        col_indices: vec![5],
        values: vec![1.0],
    };
    assert!(matches!(
        SparseMatrix::from_csr(&ctx, &bad_col),
        Err(Error::InvalidSparseStructure { .. })
    ));

    let bad_ell = EllHost {
        rows: 2,
        cols: 2,
        width: 2,
        col_indices: vec![0, 1, 1],
        values: vec![1.0, 2.0, 3.0],
    };
    assert!(matches!(
        SparseMatrix::from_ell(&ctx, &bad_ell),
        Err(Error::InvalidSparseStructure { .. })
    ));
}

#[test]
fn test_sparse_only_multiplies() {
    let ctx = create_host_context();
    let s = SparseMatrix::from_dense(&ctx, &[1.0, 0.0, 0.0, 1.0], 2, 2, SparseFormat::Csr).unwrap();
    let err = Expr::from(&s).scale(2.0).and_then(|e| ctx.evaluate(&e).map(|_| ()));
    assert!(matches!(err, Err(Error::UnsupportedOperation { .. })));
}
