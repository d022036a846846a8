//! Error types for hetla

use crate::dtype::DType;
use thiserror::Error;

/// Result type alias using hetla's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in hetla operations
///
/// Structural errors (`ShapeMismatch`, `DTypeMismatch`, `CrossContextOperation`,
/// `UnsupportedOperation`) are raised while an expression is being built, before
/// any device work is scheduled. Resource errors come from context and container
/// construction. Numerical errors come from solvers.
///
/// `Error` is `Clone` so that a failure inside an asynchronous submission can be
/// stored in its completion event and handed to every waiter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Operand shapes are not dimensionally consistent
    #[error("Shape mismatch in '{op}': expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        /// Operation that rejected the shapes
        op: &'static str,
        /// Expected shape
        expected: Vec<usize>,
        /// Actual shape
        got: Vec<usize>,
    },

    /// DType mismatch between operands
    #[error("DType mismatch in '{op}': {lhs} vs {rhs}")]
    DTypeMismatch {
        /// Operation that rejected the dtypes
        op: &'static str,
        /// Left-hand side dtype
        lhs: DType,
        /// Right-hand side dtype
        rhs: DType,
    },

    /// Operands live on different execution contexts
    #[error("Cross-context operation in '{op}': context {lhs} vs context {rhs}")]
    CrossContextOperation {
        /// Operation that mixed contexts
        op: &'static str,
        /// Context id of the first operand
        lhs: u64,
        /// Context id of the offending operand
        rhs: u64,
    },

    /// No device matches the selector
    #[error("No device found for selector: {selector}")]
    NoDeviceFound {
        /// Human-readable selector description
        selector: String,
    },

    /// Device memory exhausted
    #[error("Out of device memory: failed to allocate {requested} bytes ({available} available)")]
    OutOfDeviceMemory {
        /// Requested size in bytes
        requested: usize,
        /// Bytes still available under the context limit, if known
        available: usize,
    },

    /// Sparse index arrays violate the layout's invariants
    #[error("Invalid {format} structure: {reason}")]
    InvalidSparseStructure {
        /// Sparse format name
        format: &'static str,
        /// What was violated
        reason: String,
    },

    /// Triangular system with a numerically zero pivot
    #[error("Singular system: diagonal element {index} is {value:e}")]
    SingularSystem {
        /// Row of the zero diagonal entry
        index: usize,
        /// The offending diagonal value
        value: f64,
    },

    /// Residual (or estimate) became NaN or infinite
    #[error("Numerical divergence in {solver} after {iterations} iterations: {reason}")]
    NumericalDivergence {
        /// Solver name
        solver: &'static str,
        /// Iterations completed before divergence was detected
        iterations: usize,
        /// Description of the divergence
        reason: String,
    },

    /// Unsupported dtype for an operation
    #[error("Unsupported dtype {dtype} for operation '{op}'")]
    UnsupportedDType {
        /// The unsupported dtype
        dtype: DType,
        /// The operation name
        op: &'static str,
    },

    /// Operation not defined for the given operand kinds
    #[error("Unsupported operation '{op}': {reason}")]
    UnsupportedOperation {
        /// The operation name
        op: &'static str,
        /// Why it is not supported
        reason: String,
    },

    /// Index out of bounds
    #[error("Index {index} out of bounds for dimension of size {size}")]
    IndexOutOfBounds {
        /// The invalid index
        index: usize,
        /// Size of the dimension
        size: usize,
    },

    /// Invalid argument provided to an operation
    #[error("Invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// The argument name
        arg: &'static str,
        /// Reason for invalidity
        reason: String,
    },

    /// Invalid or unreadable configuration
    #[error("Invalid configuration '{key}': {reason}")]
    Config {
        /// Configuration key (or file path)
        key: String,
        /// Reason for rejection
        reason: String,
    },

    /// Backend-specific error
    #[error("Backend error ({backend}): {reason}")]
    Backend {
        /// Backend name
        backend: &'static str,
        /// Description of the failure
        reason: String,
    },

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a shape mismatch error
    pub fn shape_mismatch(op: &'static str, expected: &[usize], got: &[usize]) -> Self {
        Self::ShapeMismatch {
            op,
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }

    /// Create a dtype mismatch error
    pub fn dtype_mismatch(op: &'static str, lhs: DType, rhs: DType) -> Self {
        Self::DTypeMismatch { op, lhs, rhs }
    }

    /// Create an unsupported dtype error
    pub fn unsupported_dtype(dtype: DType, op: &'static str) -> Self {
        Self::UnsupportedDType { dtype, op }
    }

    /// Create an unsupported operation error
    pub fn unsupported(op: &'static str, reason: impl Into<String>) -> Self {
        Self::UnsupportedOperation {
            op,
            reason: reason.into(),
        }
    }

    /// Create an invalid sparse structure error
    pub fn invalid_sparse(format: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidSparseStructure {
            format,
            reason: reason.into(),
        }
    }

    /// Create a backend error
    pub fn backend(backend: &'static str, reason: impl Into<String>) -> Self {
        Self::Backend {
            backend,
            reason: reason.into(),
        }
    }

    /// Returns true for errors raised while building expressions or containers
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::ShapeMismatch { .. }
                | Self::DTypeMismatch { .. }
                | Self::CrossContextOperation { .. }
                | Self::UnsupportedOperation { .. }
                | Self::UnsupportedDType { .. }
        )
    }

    /// Returns true for solver-side numerical failures
    pub fn is_numerical(&self) -> bool {
        matches!(
            self,
            Self::SingularSystem { .. } | Self::NumericalDivergence { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::shape_mismatch("mat_vec", &[4], &[5]);
        let msg = err.to_string();
        assert!(msg.contains("mat_vec"));
        assert!(msg.contains("[4]"));
        assert!(err.is_structural());
    }

    #[test]
    fn test_error_categories() {
        let singular = Error::SingularSystem {
            index: 2,
            value: 0.0,
        };
        assert!(singular.is_numerical());
        assert!(!singular.is_structural());

        let oom = Error::OutOfDeviceMemory {
            requested: 1024,
            available: 16,
        };
        assert!(!oom.is_numerical());
        assert!(oom.to_string().contains("1024"));
    }
}
