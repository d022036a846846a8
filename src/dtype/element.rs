//! Element trait for mapping Rust types to DType

use super::DType;
use bytemuck::{Pod, Zeroable};
use std::fmt::Debug;

/// Trait for types that can be stored in a buffer
///
/// Connects Rust's type system to hetla's runtime dtype tags. Implemented for
/// `f64`, `f32`, `i64` and `i32`.
///
/// # Bounds
/// - `Pod + Zeroable` - safe byte-level transmutation (bytemuck)
/// - `PartialOrd` - comparisons in reductions
pub trait Element:
    Copy + Clone + Send + Sync + Pod + Zeroable + PartialOrd + Debug + 'static
{
    /// The corresponding DType for this Rust type
    const DTYPE: DType;

    /// Convert to f64 for generic numeric operations
    fn to_f64(self) -> f64;

    /// Convert from f64 to this type (truncating for integers)
    fn from_f64(v: f64) -> Self;

    /// Convert to i64 (truncating for floats)
    fn to_i64(self) -> i64;

    /// Convert from i64 to this type
    fn from_i64(v: i64) -> Self;

    /// Zero value
    fn zero() -> Self;
}

macro_rules! impl_float_element {
    ($ty:ty, $dtype:expr) => {
        impl Element for $ty {
            const DTYPE: DType = $dtype;

            #[inline]
            fn to_f64(self) -> f64 {
                self as f64
            }

            #[inline]
            fn from_f64(v: f64) -> Self {
                v as $ty
            }

            #[inline]
            fn to_i64(self) -> i64 {
                self as i64
            }

            #[inline]
            fn from_i64(v: i64) -> Self {
                v as $ty
            }

            #[inline]
            fn zero() -> Self {
                0.0
            }
        }
    };
}

macro_rules! impl_int_element {
    ($ty:ty, $dtype:expr) => {
        impl Element for $ty {
            const DTYPE: DType = $dtype;

            #[inline]
            fn to_f64(self) -> f64 {
                self as f64
            }

            #[inline]
            fn from_f64(v: f64) -> Self {
                v as $ty
            }

            #[inline]
            fn to_i64(self) -> i64 {
                self as i64
            }

            #[inline]
            fn from_i64(v: i64) -> Self {
                v as $ty
            }

            #[inline]
            fn zero() -> Self {
                0
            }
        }
    };
}

impl_float_element!(f64, DType::F64);
impl_float_element!(f32, DType::F32);
impl_int_element!(i64, DType::I64);
impl_int_element!(i32, DType::I32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_dtypes() {
        assert_eq!(<f64 as Element>::DTYPE, DType::F64);
        assert_eq!(<f32 as Element>::DTYPE, DType::F32);
        assert_eq!(<i64 as Element>::DTYPE, DType::I64);
        assert_eq!(<i32 as Element>::DTYPE, DType::I32);
    }

    #[test]
    fn test_element_conversions() {
        assert_eq!(f32::from_f64(1.5), 1.5f32);
        assert_eq!(i32::from_f64(2.9), 2);
        assert_eq!((-7i64).to_f64(), -7.0);
        assert_eq!(3.75f64.to_i64(), 3);
    }
}
