//! Data type system for hetla containers
//!
//! Containers carry their element type at runtime as a [`DType`] tag. The
//! [`Element`] trait maps the supported Rust types onto those tags.

mod element;

pub use element::Element;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Data types supported by hetla buffers
///
/// # Discriminant Values
///
/// The discriminants are stable and match the numeric families used by the
/// kernel signature hash: signed ints in 10-19, floats in 0-9.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum DType {
    /// 64-bit floating point
    F64 = 0,
    /// 32-bit floating point
    F32 = 1,
    /// 64-bit signed integer
    I64 = 10,
    /// 32-bit signed integer
    I32 = 11,
}

impl DType {
    /// Size of one element in bytes
    #[inline]
    pub const fn size_in_bytes(self) -> usize {
        match self {
            Self::F64 | Self::I64 => 8,
            Self::F32 | Self::I32 => 4,
        }
    }

    /// Returns true if this is a floating point type
    #[inline]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::F64 | Self::F32)
    }

    /// Returns true if this is an integer type
    #[inline]
    pub const fn is_int(self) -> bool {
        matches!(self, Self::I64 | Self::I32)
    }

    /// Short name used in kernel names and diagnostics
    pub const fn name(self) -> &'static str {
        match self {
            Self::F64 => "f64",
            Self::F32 => "f32",
            Self::I64 => "i64",
            Self::I32 => "i32",
        }
    }

    /// Smallest positive normal value for float types, zero for integers
    pub fn min_positive(self) -> f64 {
        match self {
            Self::F64 => f64::MIN_POSITIVE,
            Self::F32 => f32::MIN_POSITIVE as f64,
            Self::I64 | Self::I32 => 0.0,
        }
    }

    /// All supported dtypes
    pub const ALL: [DType; 4] = [Self::F64, Self::F32, Self::I64, Self::I32];
}

/// Macro for runtime dtype dispatch to typed code.
///
/// Binds `$T` to the Rust element type of `$dtype`. The second form also
/// binds `$A` to the accumulator type used by host kernels (`f64` for float
/// dtypes, `i64` for integer dtypes).
///
/// ```ignore
/// dispatch_dtype!(buffer.dtype(), T => { buffer.to_vec::<T>()?.len() })
/// ```
#[macro_export]
macro_rules! dispatch_dtype {
    ($dtype:expr, $T:ident => $body:block) => {
        match $dtype {
            $crate::dtype::DType::F64 => {
                type $T = f64;
                $body
            }
            $crate::dtype::DType::F32 => {
                type $T = f32;
                $body
            }
            $crate::dtype::DType::I64 => {
                type $T = i64;
                $body
            }
            $crate::dtype::DType::I32 => {
                type $T = i32;
                $body
            }
        }
    };
    ($dtype:expr, $T:ident, $A:ident => $body:block) => {
        match $dtype {
            $crate::dtype::DType::F64 => {
                type $T = f64;
                type $A = f64;
                $body
            }
            $crate::dtype::DType::F32 => {
                type $T = f32;
                type $A = f64;
                $body
            }
            $crate::dtype::DType::I64 => {
                type $T = i64;
                type $A = i64;
                $body
            }
            $crate::dtype::DType::I32 => {
                type $T = i32;
                type $A = i64;
                $body
            }
        }
    };
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
