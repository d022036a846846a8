//! Device-resident sparse matrices

use super::host::{CooHost, CsrHost, EllHost, HybHost, SparseHost, row_sorted_permutation};
use super::validate::{validate_coo, validate_csr, validate_ell, validate_hyb};
use super::SparseFormat;
use crate::container::{DenseLayout, DenseMatrix};
use crate::dtype::{DType, Element};
use crate::error::{Error, Result};
use crate::runtime::{Buffer, Context};

#[derive(Clone, Debug)]
pub(crate) struct CsrBuffers {
    pub(crate) row_ptrs: Buffer,
    pub(crate) col_indices: Buffer,
    pub(crate) values: Buffer,
}

#[derive(Clone, Debug)]
pub(crate) struct CooBuffers {
    pub(crate) row_indices: Buffer,
    pub(crate) col_indices: Buffer,
    pub(crate) values: Buffer,
    /// `rows + 1` offsets into `perm`
    pub(crate) group_ptrs: Buffer,
    /// Entry positions in row-sorted order
    pub(crate) perm: Buffer,
}

/// ELL slots stored column-major on the device: slot `k` of row `r` lives at
/// `k * rows + r`
#[derive(Clone, Debug)]
pub(crate) struct EllBuffers {
    pub(crate) width: usize,
    pub(crate) col_indices: Buffer,
    pub(crate) values: Buffer,
}

#[derive(Clone, Debug)]
pub(crate) enum SparseStorage {
    Csr(CsrBuffers),
    Coo(CooBuffers),
    Ell(EllBuffers),
    Hyb { ell: EllBuffers, csr: CsrBuffers },
}

/// A sparse matrix in one of the [`SparseFormat`] layouts
///
/// Index arrays are validated on construction and stored as `I32` buffers.
/// The matrix is immutable once uploaded; clones share the buffers.
#[derive(Clone, Debug)]
pub struct SparseMatrix {
    rows: usize,
    cols: usize,
    nnz: usize,
    dtype: DType,
    context: Context,
    storage: SparseStorage,
}

fn upload_indices(context: &Context, indices: &[i64]) -> Result<Buffer> {
    let narrowed = indices
        .iter()
        .map(|&i| {
            i32::try_from(i).map_err(|_| {
                Error::invalid_sparse("index", format!("{} does not fit a 32-bit index", i))
            })
        })
        .collect::<Result<Vec<i32>>>()?;
    Buffer::from_slice(context, &narrowed)
}

fn download_indices(buffer: &Buffer) -> Result<Vec<i64>> {
    Ok(buffer.to_vec::<i32>()?.into_iter().map(i64::from).collect())
}

fn upload_csr<T: Element>(context: &Context, m: &CsrHost<T>) -> Result<CsrBuffers> {
    Ok(CsrBuffers {
        row_ptrs: upload_indices(context, &m.row_ptrs)?,
        col_indices: upload_indices(context, &m.col_indices)?,
        values: Buffer::from_slice(context, &m.values)?,
    })
}

fn upload_ell<T: Element>(context: &Context, m: &EllHost<T>) -> Result<EllBuffers> {
    let slots = m
        .rows
        .checked_mul(m.width)
        .ok_or_else(|| Error::invalid_sparse("ELL", "slot count overflows"))?;
    let mut cols = vec![-1i64; slots];
    let mut values = vec![T::zero(); slots];
    for r in 0..m.rows {
        for k in 0..m.width {
            cols[k * m.rows + r] = m.col_indices[r * m.width + k];
            values[k * m.rows + r] = m.values[r * m.width + k];
        }
    }
    Ok(EllBuffers {
        width: m.width,
        col_indices: upload_indices(context, &cols)?,
        values: Buffer::from_slice(context, &values)?,
    })
}

fn download_csr<T: Element>(rows: usize, cols: usize, b: &CsrBuffers) -> Result<CsrHost<T>> {
    Ok(CsrHost {
        rows,
        cols,
        row_ptrs: download_indices(&b.row_ptrs)?,
        col_indices: download_indices(&b.col_indices)?,
        values: b.values.to_vec::<T>()?,
    })
}

fn download_ell<T: Element>(rows: usize, cols: usize, b: &EllBuffers) -> Result<EllHost<T>> {
    let width = b.width;
    let dev_cols = download_indices(&b.col_indices)?;
    let dev_vals = b.values.to_vec::<T>()?;
    let mut col_indices = vec![-1i64; rows * width];
    let mut values = vec![T::zero(); rows * width];
    for r in 0..rows {
        for k in 0..width {
            col_indices[r * width + k] = dev_cols[k * rows + r];
            values[r * width + k] = dev_vals[k * rows + r];
        }
    }
    Ok(EllHost {
        rows,
        cols,
        width,
        col_indices,
        values,
    })
}

impl SparseMatrix {
    /// Upload a compressed-row matrix
    pub fn from_csr<T: Element>(context: &Context, m: &CsrHost<T>) -> Result<Self> {
        validate_csr(m)?;
        Ok(Self {
            rows: m.rows,
            cols: m.cols,
            nnz: m.nnz(),
            dtype: T::DTYPE,
            context: context.clone(),
            storage: SparseStorage::Csr(upload_csr(context, m)?),
        })
    }

    /// Upload coordinate triples, building the row-sorted SpMV permutation
    pub fn from_coo<T: Element>(context: &Context, m: &CooHost<T>) -> Result<Self> {
        validate_coo(m)?;
        let perm = row_sorted_permutation(&m.row_indices);
        let mut group_ptrs = vec![0i64; m.rows + 1];
        for &r in &m.row_indices {
            group_ptrs[r as usize + 1] += 1;
        }
        for r in 0..m.rows {
            group_ptrs[r + 1] += group_ptrs[r];
        }
        let perm: Vec<i64> = perm.into_iter().map(|k| k as i64).collect();
        let storage = SparseStorage::Coo(CooBuffers {
            row_indices: upload_indices(context, &m.row_indices)?,
            col_indices: upload_indices(context, &m.col_indices)?,
            values: Buffer::from_slice(context, &m.values)?,
            group_ptrs: upload_indices(context, &group_ptrs)?,
            perm: upload_indices(context, &perm)?,
        });
        Ok(Self {
            rows: m.rows,
            cols: m.cols,
            nnz: m.nnz(),
            dtype: T::DTYPE,
            context: context.clone(),
            storage,
        })
    }

    /// Upload ELL slots (row-major on the host, `-1` marks padding)
    pub fn from_ell<T: Element>(context: &Context, m: &EllHost<T>) -> Result<Self> {
        validate_ell(m)?;
        Ok(Self {
            rows: m.rows,
            cols: m.cols,
            nnz: m.nnz(),
            dtype: T::DTYPE,
            context: context.clone(),
            storage: SparseStorage::Ell(upload_ell(context, m)?),
        })
    }

    /// Upload an ELL + CSR hybrid
    pub fn from_hyb<T: Element>(context: &Context, m: &HybHost<T>) -> Result<Self> {
        validate_hyb(m)?;
        Ok(Self {
            rows: m.ell.rows,
            cols: m.ell.cols,
            nnz: m.ell.nnz() + m.csr.nnz(),
            dtype: T::DTYPE,
            context: context.clone(),
            storage: SparseStorage::Hyb {
                ell: upload_ell(context, &m.ell)?,
                csr: upload_csr(context, &m.csr)?,
            },
        })
    }

    /// Upload any host layout
    pub fn from_host<T: Element>(context: &Context, m: &SparseHost<T>) -> Result<Self> {
        match m {
            SparseHost::Csr(m) => Self::from_csr(context, m),
            SparseHost::Coo(m) => Self::from_coo(context, m),
            SparseHost::Ell(m) => Self::from_ell(context, m),
            SparseHost::Hyb(m) => Self::from_hyb(context, m),
        }
    }

    /// Upload a row-major dense matrix in `format`, dropping exact zeros
    ///
    /// HYB keeps the mean row length (rounded up) in its ELL part.
    pub fn from_dense<T: Element>(
        context: &Context,
        data: &[T],
        rows: usize,
        cols: usize,
        format: SparseFormat,
    ) -> Result<Self> {
        let csr = CsrHost::from_dense(rows, cols, data)?;
        match format {
            SparseFormat::Csr => Self::from_csr(context, &csr),
            SparseFormat::Coo => Self::from_coo(context, &csr.to_coo()?),
            SparseFormat::Ell => Self::from_ell(context, &csr.to_ell()?),
            SparseFormat::Hyb => {
                let width = if rows == 0 { 0 } else { csr.nnz().div_ceil(rows) };
                Self::from_hyb(context, &csr.to_hyb(width)?)
            }
        }
    }

    /// Number of rows
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// `(rows, cols)`
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Number of stored (non-padding) entries
    pub fn nnz(&self) -> usize {
        self.nnz
    }

    /// Value dtype
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Owning context
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Storage layout
    pub fn format(&self) -> SparseFormat {
        match &self.storage {
            SparseStorage::Csr(_) => SparseFormat::Csr,
            SparseStorage::Coo(_) => SparseFormat::Coo,
            SparseStorage::Ell(_) => SparseFormat::Ell,
            SparseStorage::Hyb { .. } => SparseFormat::Hyb,
        }
    }

    /// ELL width (0 for CSR and COO)
    pub fn ell_width(&self) -> usize {
        match &self.storage {
            SparseStorage::Ell(e) | SparseStorage::Hyb { ell: e, .. } => e.width,
            _ => 0,
        }
    }

    /// SpMV input buffers in kernel order, excluding `x`
    pub(crate) fn spmv_inputs(&self) -> Vec<Buffer> {
        match &self.storage {
            SparseStorage::Csr(c) => vec![c.row_ptrs.clone(), c.col_indices.clone(), c.values.clone()],
            SparseStorage::Coo(c) => vec![
                c.group_ptrs.clone(),
                c.perm.clone(),
                c.col_indices.clone(),
                c.values.clone(),
            ],
            SparseStorage::Ell(e) => vec![e.col_indices.clone(), e.values.clone()],
            SparseStorage::Hyb { ell, csr } => vec![
                ell.col_indices.clone(),
                ell.values.clone(),
                csr.row_ptrs.clone(),
                csr.col_indices.clone(),
                csr.values.clone(),
            ],
        }
    }

    /// Download in the original layout
    pub fn to_host<T: Element>(&self) -> Result<SparseHost<T>> {
        if T::DTYPE != self.dtype {
            return Err(Error::dtype_mismatch("sparse_to_host", self.dtype, T::DTYPE));
        }
        let (rows, cols) = (self.rows, self.cols);
        Ok(match &self.storage {
            SparseStorage::Csr(b) => SparseHost::Csr(download_csr(rows, cols, b)?),
            SparseStorage::Coo(b) => SparseHost::Coo(CooHost {
                rows,
                cols,
                row_indices: download_indices(&b.row_indices)?,
                col_indices: download_indices(&b.col_indices)?,
                values: b.values.to_vec::<T>()?,
            }),
            SparseStorage::Ell(b) => SparseHost::Ell(download_ell(rows, cols, b)?),
            SparseStorage::Hyb { ell, csr } => SparseHost::Hyb(HybHost {
                ell: download_ell(rows, cols, ell)?,
                csr: download_csr(rows, cols, csr)?,
            }),
        })
    }

    /// Densify into a fresh matrix on the same context
    pub fn to_dense(&self, layout: DenseLayout) -> Result<DenseMatrix> {
        crate::dispatch_dtype!(self.dtype, T => {
            let dense = self.to_host::<T>()?.to_dense();
            let rm = DenseMatrix::from_slice(&self.context, &dense, self.rows, self.cols, DenseLayout::RowMajor)?;
            match layout {
                DenseLayout::RowMajor => Ok(rm),
                DenseLayout::ColMajor => rm.to_layout(layout),
            }
        })
    }
}
