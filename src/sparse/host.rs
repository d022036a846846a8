//! Host-side sparse triples and format conversions
//!
//! Indices are `i64` on the host. They are validated and narrowed to `i32`
//! when uploaded.

use crate::dtype::Element;
use crate::error::{Error, Result};

use super::SparseFormat;
use super::validate::{validate_coo, validate_csr};

/// Compressed-row host data
#[derive(Debug, Clone, PartialEq)]
pub struct CsrHost<T> {
    /// Number of rows
    pub rows: usize,
    /// Number of columns
    pub cols: usize,
    /// `rows + 1` offsets into `col_indices` / `values`
    pub row_ptrs: Vec<i64>,
    /// Column of each stored entry
    pub col_indices: Vec<i64>,
    /// Value of each stored entry
    pub values: Vec<T>,
}

/// Coordinate host data
#[derive(Debug, Clone, PartialEq)]
pub struct CooHost<T> {
    /// Number of rows
    pub rows: usize,
    /// Number of columns
    pub cols: usize,
    /// Row of each entry
    pub row_indices: Vec<i64>,
    /// Column of each entry
    pub col_indices: Vec<i64>,
    /// Value of each entry
    pub values: Vec<T>,
}

/// ELLPACK host data, row-major `rows x width` slot arrays
#[derive(Debug, Clone, PartialEq)]
pub struct EllHost<T> {
    /// Number of rows
    pub rows: usize,
    /// Number of columns
    pub cols: usize,
    /// Slots per row
    pub width: usize,
    /// Column per slot (`row * width + slot`), `-1` for padding
    pub col_indices: Vec<i64>,
    /// Value per slot, zero for padding
    pub values: Vec<T>,
}

/// Hybrid host data: regular ELL part plus CSR overflow
#[derive(Debug, Clone, PartialEq)]
pub struct HybHost<T> {
    /// ELL part
    pub ell: EllHost<T>,
    /// CSR overflow part (same shape)
    pub csr: CsrHost<T>,
}

/// Any host sparse layout
#[derive(Debug, Clone, PartialEq)]
pub enum SparseHost<T> {
    /// CSR triple
    Csr(CsrHost<T>),
    /// COO triple
    Coo(CooHost<T>),
    /// ELL slots
    Ell(EllHost<T>),
    /// HYB pair
    Hyb(HybHost<T>),
}

impl<T: Element> SparseHost<T> {
    /// Layout of this data
    pub fn format(&self) -> SparseFormat {
        match self {
            Self::Csr(_) => SparseFormat::Csr,
            Self::Coo(_) => SparseFormat::Coo,
            Self::Ell(_) => SparseFormat::Ell,
            Self::Hyb(_) => SparseFormat::Hyb,
        }
    }

    /// `(rows, cols)`
    pub fn shape(&self) -> (usize, usize) {
        match self {
            Self::Csr(m) => (m.rows, m.cols),
            Self::Coo(m) => (m.rows, m.cols),
            Self::Ell(m) => (m.rows, m.cols),
            Self::Hyb(m) => (m.ell.rows, m.ell.cols),
        }
    }

    /// Densify into a row-major vector (duplicates are summed)
    pub fn to_dense(&self) -> Vec<T> {
        match self {
            Self::Csr(m) => m.to_dense(),
            Self::Coo(m) => m.to_dense(),
            Self::Ell(m) => m.to_dense(),
            Self::Hyb(m) => {
                let mut dense = m.ell.to_dense();
                for (d, o) in dense.iter_mut().zip(m.csr.to_dense()) {
                    *d = T::from_f64(d.to_f64() + o.to_f64());
                }
                dense
            }
        }
    }
}

fn accumulate<T: Element>(dense: &mut [T], index: usize, value: T) {
    dense[index] = T::from_f64(dense[index].to_f64() + value.to_f64());
}

impl<T: Element> CsrHost<T> {
    /// Build from a row-major dense matrix, dropping exact zeros
    pub fn from_dense(rows: usize, cols: usize, data: &[T]) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(Error::shape_mismatch("csr_from_dense", &[rows, cols], &[data.len()]));
        }
        let mut row_ptrs = Vec::with_capacity(rows + 1);
        let mut col_indices = Vec::new();
        let mut values = Vec::new();
        row_ptrs.push(0);
        for r in 0..rows {
            for c in 0..cols {
                let v = data[r * cols + c];
                if v.to_f64() != 0.0 {
                    col_indices.push(c as i64);
                    values.push(v);
                }
            }
            row_ptrs.push(values.len() as i64);
        }
        Ok(Self {
            rows,
            cols,
            row_ptrs,
            col_indices,
            values,
        })
    }

    /// Number of stored entries
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Entries of row `r` as `(col, value)` pairs
    ///
    /// # Panics
    ///
    /// If `r >= rows` or the row pointers are out of range for the arrays.
    pub fn row(&self, r: usize) -> impl Iterator<Item = (i64, T)> + '_ {
        let start = self.row_ptrs[r] as usize;
        let end = self.row_ptrs[r + 1] as usize;
        self.col_indices[start..end]
            .iter()
            .copied()
            .zip(self.values[start..end].iter().copied())
    }

    /// Densify into a row-major vector
    pub fn to_dense(&self) -> Vec<T> {
        let mut dense = vec![T::zero(); self.rows * self.cols];
        for r in 0..self.rows {
            for (c, v) in self.row(r) {
                accumulate(&mut dense, r * self.cols + c as usize, v);
            }
        }
        dense
    }

    /// Convert to coordinate triples (row-sorted)
    pub fn to_coo(&self) -> Result<CooHost<T>> {
        validate_csr(self)?;
        let mut row_indices = Vec::with_capacity(self.nnz());
        for r in 0..self.rows {
            let count = (self.row_ptrs[r + 1] - self.row_ptrs[r]) as usize;
            row_indices.extend(std::iter::repeat_n(r as i64, count));
        }
        Ok(CooHost {
            rows: self.rows,
            cols: self.cols,
            row_indices,
            col_indices: self.col_indices.clone(),
            values: self.values.clone(),
        })
    }

    /// Longest row
    pub fn max_row_len(&self) -> usize {
        self.row_ptrs
            .windows(2)
            .map(|w| (w[1] - w[0]) as usize)
            .max()
            .unwrap_or(0)
    }

    /// Convert to ELL with width equal to the longest row
    pub fn to_ell(&self) -> Result<EllHost<T>> {
        validate_csr(self)?;
        Ok(self.split(self.max_row_len())?.0)
    }

    /// Convert to HYB: `width` slots per row in ELL, the rest in CSR
    pub fn to_hyb(&self, width: usize) -> Result<HybHost<T>> {
        validate_csr(self)?;
        let (ell, csr) = self.split(width)?;
        Ok(HybHost { ell, csr })
    }

    /// First `width` entries of each row into ELL slots, the overflow into CSR
    ///
    /// `self` must already be validated.
    fn split(&self, width: usize) -> Result<(EllHost<T>, CsrHost<T>)> {
        let slots = self
            .rows
            .checked_mul(width)
            .filter(|&n| n <= i32::MAX as usize)
            .ok_or_else(|| {
                Error::invalid_sparse(
                    "ELL",
                    format!("{} rows x width {} exceeds the 32-bit device index range", self.rows, width),
                )
            })?;
        let mut ell_cols = vec![-1i64; slots];
        let mut ell_vals = vec![T::zero(); slots];
        let mut row_ptrs = Vec::with_capacity(self.rows + 1);
        let mut col_indices = Vec::new();
        let mut values = Vec::new();
        row_ptrs.push(0);
        for r in 0..self.rows {
            for (k, (c, v)) in self.row(r).enumerate() {
                if k < width {
                    ell_cols[r * width + k] = c;
                    ell_vals[r * width + k] = v;
                } else {
                    col_indices.push(c);
                    values.push(v);
                }
            }
            row_ptrs.push(values.len() as i64);
        }
        Ok((
            EllHost {
                rows: self.rows,
                cols: self.cols,
                width,
                col_indices: ell_cols,
                values: ell_vals,
            },
            CsrHost {
                rows: self.rows,
                cols: self.cols,
                row_ptrs,
                col_indices,
                values,
            },
        ))
    }
}

impl<T: Element> CooHost<T> {
    /// Number of stored entries
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Densify into a row-major vector
    pub fn to_dense(&self) -> Vec<T> {
        let mut dense = vec![T::zero(); self.rows * self.cols];
        for ((&r, &c), &v) in self
            .row_indices
            .iter()
            .zip(&self.col_indices)
            .zip(&self.values)
        {
            accumulate(&mut dense, r as usize * self.cols + c as usize, v);
        }
        dense
    }

    /// Convert to CSR (stable within each row)
    pub fn to_csr(&self) -> Result<CsrHost<T>> {
        validate_coo(self)?;
        let perm = row_sorted_permutation(&self.row_indices);
        let mut row_ptrs = vec![0i64; self.rows + 1];
        for &r in &self.row_indices {
            row_ptrs[r as usize + 1] += 1;
        }
        for r in 0..self.rows {
            row_ptrs[r + 1] += row_ptrs[r];
        }
        Ok(CsrHost {
            rows: self.rows,
            cols: self.cols,
            row_ptrs,
            col_indices: perm.iter().map(|&k| self.col_indices[k]).collect(),
            values: perm.iter().map(|&k| self.values[k]).collect(),
        })
    }
}

impl<T: Element> EllHost<T> {
    /// Number of non-padding slots
    pub fn nnz(&self) -> usize {
        self.col_indices.iter().filter(|&&c| c >= 0).count()
    }

    /// Densify into a row-major vector
    pub fn to_dense(&self) -> Vec<T> {
        let mut dense = vec![T::zero(); self.rows * self.cols];
        for r in 0..self.rows {
            for k in 0..self.width {
                let c = self.col_indices[r * self.width + k];
                if c >= 0 {
                    accumulate(&mut dense, r * self.cols + c as usize, self.values[r * self.width + k]);
                }
            }
        }
        dense
    }
}

/// Stable row-sorted order of coordinate entries
pub(crate) fn row_sorted_permutation(row_indices: &[i64]) -> Vec<usize> {
    let mut perm: Vec<usize> = (0..row_indices.len()).collect();
    perm.sort_by_key(|&k| row_indices[k]);
    perm
}
