//! Sparse matrices
//!
//! Four storage layouts share one [`SparseMatrix`] type:
//!
//! - **CSR**: row pointers, column indices, values
//! - **COO**: row/column/value triples in caller order
//! - **ELL**: fixed-width padded rows, column-major on the device
//! - **HYB**: an ELL part holding the regular prefix of each row plus a CSR
//!   overflow part
//!
//! Host data ([`SparseHost`]) is validated before anything is allocated, so a
//! malformed structure fails with `InvalidSparseStructure` and leaves the
//! context untouched.

mod format;
mod host;
mod matrix;
mod validate;

pub use format::SparseFormat;
pub use host::{CooHost, CsrHost, EllHost, HybHost, SparseHost};
pub use matrix::SparseMatrix;
pub use validate::{validate_coo, validate_csr, validate_ell, validate_hyb};
