//! Logical shapes of expression results

use std::fmt;

/// Logical shape of a container or expression result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExprShape {
    /// A single value
    Scalar,
    /// A vector of `n` elements
    Vector(usize),
    /// A `rows x cols` matrix
    Matrix(usize, usize),
}

impl ExprShape {
    /// `(rows, cols)` extent of the kernel index space
    ///
    /// Vectors are columns (`n x 1`), scalars are `1 x 1`.
    pub fn dims(&self) -> (usize, usize) {
        match *self {
            Self::Scalar => (1, 1),
            Self::Vector(n) => (n, 1),
            Self::Matrix(r, c) => (r, c),
        }
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        let (r, c) = self.dims();
        r * c
    }

    /// Whether the shape holds no elements
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether this is the scalar shape
    pub fn is_scalar(&self) -> bool {
        matches!(self, Self::Scalar)
    }

    /// Shape as a list of extents
    pub fn extents(&self) -> Vec<usize> {
        match *self {
            Self::Scalar => vec![],
            Self::Vector(n) => vec![n],
            Self::Matrix(r, c) => vec![r, c],
        }
    }

    /// Shape of the elementwise combination of `self` and `other`
    ///
    /// Equal shapes combine; a scalar broadcasts against anything.
    pub fn broadcast(&self, other: &ExprShape) -> Option<ExprShape> {
        match (self, other) {
            (a, b) if a == b => Some(*a),
            (Self::Scalar, b) => Some(*b),
            (a, Self::Scalar) => Some(*a),
            _ => None,
        }
    }
}

impl fmt::Display for ExprShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar => write!(f, "scalar"),
            Self::Vector(n) => write!(f, "vector[{}]", n),
            Self::Matrix(r, c) => write!(f, "matrix[{}x{}]", r, c),
        }
    }
}
