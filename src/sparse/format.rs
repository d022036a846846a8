//! Sparse format definitions

/// Sparse matrix storage format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SparseFormat {
    /// Compressed Sparse Row (CSR)
    ///
    /// Row pointers + column indices + values.
    /// Storage: O(2 * nnz + nrows + 1)
    Csr,

    /// Coordinate format (COO)
    ///
    /// Explicit (row, col, value) triplets in caller order. SpMV goes through
    /// an auxiliary row-sorted permutation built at construction.
    /// Storage: O(4 * nnz + nrows + 1) on the device
    Coo,

    /// ELLPACK (ELL)
    ///
    /// Every row padded to the same width; padding slots carry column `-1`.
    /// Storage: O(2 * nrows * width)
    Ell,

    /// Hybrid ELL + CSR (HYB)
    ///
    /// The first `width` entries of each row in ELL, the overflow in CSR.
    Hyb,
}

impl SparseFormat {
    /// Returns the format name as a string
    pub fn name(&self) -> &'static str {
        match self {
            SparseFormat::Csr => "CSR",
            SparseFormat::Coo => "COO",
            SparseFormat::Ell => "ELL",
            SparseFormat::Hyb => "HYB",
        }
    }

    /// All formats
    pub const ALL: [SparseFormat; 4] = [Self::Csr, Self::Coo, Self::Ell, Self::Hyb];
}

impl std::fmt::Display for SparseFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}
