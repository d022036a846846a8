//! Structural validation of host sparse data before upload

use super::host::{CooHost, CsrHost, EllHost, HybHost};
use crate::error::{Error, Result};

const DEVICE_INDEX_MAX: i64 = i32::MAX as i64;

fn check_dims(format: &'static str, rows: usize, cols: usize) -> Result<()> {
    if rows as u64 > DEVICE_INDEX_MAX as u64 || cols as u64 > DEVICE_INDEX_MAX as u64 {
        return Err(Error::invalid_sparse(
            format,
            format!("shape {}x{} exceeds the 32-bit device index range", rows, cols),
        ));
    }
    Ok(())
}

fn check_column(format: &'static str, position: usize, col: i64, cols: usize) -> Result<()> {
    if col < 0 || col as u64 >= cols as u64 {
        return Err(Error::invalid_sparse(
            format,
            format!(
                "column index {} at position {} is outside 0..{}",
                col, position, cols
            ),
        ));
    }
    Ok(())
}

/// Row pointers: `rows + 1` entries, start at 0, non-decreasing, end at nnz
pub fn validate_csr<T>(m: &CsrHost<T>) -> Result<()> {
    const F: &str = "CSR";
    check_dims(F, m.rows, m.cols)?;
    if m.row_ptrs.len() != m.rows + 1 {
        return Err(Error::invalid_sparse(
            F,
            format!("expected {} row pointers, got {}", m.rows + 1, m.row_ptrs.len()),
        ));
    }
    if m.col_indices.len() != m.values.len() {
        return Err(Error::invalid_sparse(
            F,
            format!(
                "{} column indices but {} values",
                m.col_indices.len(),
                m.values.len()
            ),
        ));
    }
    if m.values.len() as u64 > DEVICE_INDEX_MAX as u64 {
        return Err(Error::invalid_sparse(F, "nnz exceeds the 32-bit device index range"));
    }
    if m.row_ptrs[0] != 0 {
        return Err(Error::invalid_sparse(
            F,
            format!("first row pointer must be 0, got {}", m.row_ptrs[0]),
        ));
    }
    for (r, w) in m.row_ptrs.windows(2).enumerate() {
        if w[1] < w[0] {
            return Err(Error::invalid_sparse(
                F,
                format!("row pointer decreases at row {} ({} -> {})", r, w[0], w[1]),
            ));
        }
    }
    let last = m.row_ptrs[m.rows];
    if last != m.values.len() as i64 {
        return Err(Error::invalid_sparse(
            F,
            format!("last row pointer {} does not match nnz {}", last, m.values.len()),
        ));
    }
    for (k, &c) in m.col_indices.iter().enumerate() {
        check_column(F, k, c, m.cols)?;
    }
    Ok(())
}

/// Equal-length triples with in-range row and column indices
pub fn validate_coo<T>(m: &CooHost<T>) -> Result<()> {
    const F: &str = "COO";
    check_dims(F, m.rows, m.cols)?;
    if m.row_indices.len() != m.values.len() || m.col_indices.len() != m.values.len() {
        return Err(Error::invalid_sparse(
            F,
            format!(
                "index arrays have lengths {}/{} but there are {} values",
                m.row_indices.len(),
                m.col_indices.len(),
                m.values.len()
            ),
        ));
    }
    if m.values.len() as u64 > DEVICE_INDEX_MAX as u64 {
        return Err(Error::invalid_sparse(F, "nnz exceeds the 32-bit device index range"));
    }
    for (k, &r) in m.row_indices.iter().enumerate() {
        if r < 0 || r as u64 >= m.rows as u64 {
            return Err(Error::invalid_sparse(
                F,
                format!("row index {} at position {} is outside 0..{}", r, k, m.rows),
            ));
        }
    }
    for (k, &c) in m.col_indices.iter().enumerate() {
        check_column(F, k, c, m.cols)?;
    }
    Ok(())
}

/// `rows * width` slots; each is an in-range column or `-1` padding with a zero value
pub fn validate_ell<T: crate::dtype::Element>(m: &EllHost<T>) -> Result<()> {
    const F: &str = "ELL";
    check_dims(F, m.rows, m.cols)?;
    if m.width as u64 > DEVICE_INDEX_MAX as u64 {
        return Err(Error::invalid_sparse(
            F,
            format!("width {} exceeds the 32-bit device index range", m.width),
        ));
    }
    let slots = m.rows.checked_mul(m.width).ok_or_else(|| {
        Error::invalid_sparse(F, format!("{} rows x width {} overflows", m.rows, m.width))
    })?;
    if m.col_indices.len() != slots || m.values.len() != slots {
        return Err(Error::invalid_sparse(
            F,
            format!(
                "expected {} slots ({} rows x width {}), got {} indices and {} values",
                slots,
                m.rows,
                m.width,
                m.col_indices.len(),
                m.values.len()
            ),
        ));
    }
    for (k, (&c, v)) in m.col_indices.iter().zip(&m.values).enumerate() {
        if c == -1 {
            if v.to_f64() != 0.0 {
                return Err(Error::invalid_sparse(
                    F,
                    format!("padding slot {} holds a non-zero value", k),
                ));
            }
            continue;
        }
        check_column(F, k, c, m.cols)?;
    }
    Ok(())
}

/// Both parts valid and of the same shape
pub fn validate_hyb<T: crate::dtype::Element>(m: &HybHost<T>) -> Result<()> {
    validate_ell(&m.ell).map_err(|e| rename(e, "HYB"))?;
    validate_csr(&m.csr).map_err(|e| rename(e, "HYB"))?;
    if m.ell.rows != m.csr.rows || m.ell.cols != m.csr.cols {
        return Err(Error::invalid_sparse(
            "HYB",
            format!(
                "ELL part is {}x{} but CSR part is {}x{}",
                m.ell.rows, m.ell.cols, m.csr.rows, m.csr.cols
            ),
        ));
    }
    Ok(())
}

fn rename(error: Error, format: &'static str) -> Error {
    match error {
        Error::InvalidSparseStructure { format: part, reason } => Error::InvalidSparseStructure {
            format,
            reason: format!("{} part: {}", part, reason),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn csr() -> CsrHost<f64> {
        CsrHost {
            rows: 2,
            cols: 3,
            row_ptrs: vec![0, 1, 3],
            col_indices: vec![2, 0, 1],
            values: vec![1.0, 2.0, 3.0],
        }
    }

    #[test]
    fn test_valid_csr() {
        assert!(validate_csr(&csr()).is_ok());
    }

    #[test]
    fn test_csr_column_out_of_range() {
        let mut m = csr();
        m.col_indices[1] = 3;
        let err = validate_csr(&m).unwrap_err();
        assert!(matches!(err, Error::InvalidSparseStructure { format: "CSR", .. }));
    }

    #[test]
    fn test_csr_decreasing_row_pointer() {
        let mut m = csr();
        m.row_ptrs = vec![0, 2, 1];
        assert!(validate_csr(&m).is_err());
        let mut m = csr();
        m.row_ptrs = vec![0, 1];
        assert!(validate_csr(&m).is_err());
    }

    #[test]
    fn test_coo_checks() {
        let m = CooHost {
            rows: 2,
            cols: 2,
            row_indices: vec![0, 2],
            col_indices: vec![0, 1],
            values: vec![1.0f32, 2.0],
        };
        assert!(validate_coo(&m).is_err());
    }

    #[test]
    fn test_ell_padding() {
        let mut m = EllHost {
            rows: 2,
            cols: 2,
            width: 2,
            col_indices: vec![0, -1, 1, 0],
            values: vec![1.0f64, 0.0, 2.0, 3.0],
        };
        assert!(validate_ell(&m).is_ok());
        m.values[1] = 5.0;
        assert!(validate_ell(&m).is_err());
        m.values[1] = 0.0;
        m.col_indices[1] = -2;
        assert!(validate_ell(&m).is_err());
    }

    #[test]
    fn test_ell_huge_width_rejected() {
        let m = EllHost {
            rows: 2,
            cols: 2,
            width: 1usize << 62,
            col_indices: Vec::new(),
            values: Vec::<f64>::new(),
        };
        let err = validate_ell(&m).unwrap_err();
        assert!(matches!(err, Error::InvalidSparseStructure { format: "ELL", .. }));

        let m = EllHost {
            rows: usize::MAX / 2,
            cols: 2,
            width: 4,
            col_indices: Vec::new(),
            values: Vec::<f64>::new(),
        };
        assert!(validate_ell(&m).is_err());
    }

    #[test]
    fn test_hyb_reports_part() {
        let ell = EllHost {
            rows: 2,
            cols: 2,
            width: 1,
            col_indices: vec![0, 1],
            values: vec![1.0f64, 2.0],
        };
        let mut part = CsrHost {
            rows: 2,
            cols: 2,
            row_ptrs: vec![0, 0, 1],
            col_indices: vec![5],
            values: vec![1.0],
        };
        let err = validate_hyb(&HybHost {
            ell: ell.clone(),
            csr: part.clone(),
        })
        .unwrap_err();
        match err {
            Error::InvalidSparseStructure { format, reason } => {
                assert_eq!(format, "HYB");
                assert!(reason.starts_with("CSR part"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        part.col_indices[0] = 0;
        assert!(validate_hyb(&HybHost { ell, csr: part }).is_ok());
    }
}
