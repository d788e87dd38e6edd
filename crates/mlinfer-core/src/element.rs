//! Element traits tying Rust scalar types to [`Tensor`] variants.
//!
//! Generic kernels are written against [`NumericElement`] and convert to and
//! from the type-erased [`Tensor`] through [`TensorElement::wrap`] and
//! [`TensorElement::view`].

use std::fmt::Debug;

use ndarray::ArrayD;

use crate::tensor::Tensor;
use crate::types::DataType;

/// A scalar type that has a [`Tensor`] variant.
pub trait TensorElement: Clone + Debug + PartialEq + Send + Sync + 'static {
    /// Element type tag.
    const DTYPE: DataType;

    /// Wrap an array into the matching tensor variant.
    fn wrap(array: ArrayD<Self>) -> Tensor;

    /// Borrow the array when the tensor holds this element type.
    fn view(tensor: &Tensor) -> Option<&ArrayD<Self>>;
}

/// A scalar type with arithmetic, used by numeric kernels.
pub trait NumericElement: TensorElement + Copy + PartialOrd + Default {
    /// Additive identity.
    fn zero() -> Self;
    /// Multiplicative identity.
    fn one() -> Self;
    /// Lossy conversion from `f64`.
    fn from_f64(value: f64) -> Self;
    /// Lossy conversion to `f64`.
    fn to_f64(self) -> f64;
    /// Addition (wrapping for integers).
    fn add(self, rhs: Self) -> Self;
    /// Subtraction (wrapping for integers).
    fn sub(self, rhs: Self) -> Self;
    /// Multiplication (wrapping for integers).
    fn mul(self, rhs: Self) -> Self;
    /// Division; `None` on integer division by zero.
    fn checked_div(self, rhs: Self) -> Option<Self>;
    /// Exponentiation.
    fn pow(self, exponent: Self) -> Self;
    /// Absolute value.
    fn abs(self) -> Self;
    /// Sign as -1, 0 or 1.
    fn signum(self) -> Self;
    /// NaN test; always false for integers.
    fn is_nan(self) -> bool;
}

macro_rules! tensor_element {
    ($ty:ty, $variant:ident, $dtype:expr) => {
        impl TensorElement for $ty {
            const DTYPE: DataType = $dtype;

            fn wrap(array: ArrayD<Self>) -> Tensor {
                Tensor::$variant(array)
            }

            fn view(tensor: &Tensor) -> Option<&ArrayD<Self>> {
                match tensor {
                    Tensor::$variant(array) => Some(array),
                    _ => None,
                }
            }
        }
    };
}

tensor_element!(f32, F32, DataType::F32);
tensor_element!(f64, F64, DataType::F64);
tensor_element!(i32, I32, DataType::I32);
tensor_element!(i64, I64, DataType::I64);
tensor_element!(bool, Bool, DataType::Bool);
tensor_element!(String, String, DataType::String);

macro_rules! float_element {
    ($ty:ty) => {
        impl NumericElement for $ty {
            fn zero() -> Self {
                0.0
            }
            fn one() -> Self {
                1.0
            }
            fn from_f64(value: f64) -> Self {
                value as $ty
            }
            fn to_f64(self) -> f64 {
                self as f64
            }
            fn add(self, rhs: Self) -> Self {
                self + rhs
            }
            fn sub(self, rhs: Self) -> Self {
                self - rhs
            }
            fn mul(self, rhs: Self) -> Self {
                self * rhs
            }
            fn checked_div(self, rhs: Self) -> Option<Self> {
                Some(self / rhs)
            }
            fn pow(self, exponent: Self) -> Self {
                self.powf(exponent)
            }
            fn abs(self) -> Self {
                <$ty>::abs(self)
            }
            fn signum(self) -> Self {
                if self > 0.0 {
                    1.0
                } else if self < 0.0 {
                    -1.0
                } else {
                    self
                }
            }
            fn is_nan(self) -> bool {
                <$ty>::is_nan(self)
            }
        }
    };
}

macro_rules! int_element {
    ($ty:ty) => {
        impl NumericElement for $ty {
            fn zero() -> Self {
                0
            }
            fn one() -> Self {
                1
            }
            fn from_f64(value: f64) -> Self {
                value as $ty
            }
            fn to_f64(self) -> f64 {
                self as f64
            }
            fn add(self, rhs: Self) -> Self {
                self.wrapping_add(rhs)
            }
            fn sub(self, rhs: Self) -> Self {
                self.wrapping_sub(rhs)
            }
            fn mul(self, rhs: Self) -> Self {
                self.wrapping_mul(rhs)
            }
            fn checked_div(self, rhs: Self) -> Option<Self> {
                self.checked_div(rhs)
            }
            fn pow(self, exponent: Self) -> Self {
                match u32::try_from(exponent) {
                    Ok(e) => self.wrapping_pow(e),
                    // Negative exponents truncate towards zero.
                    Err(_) => match self {
                        1 => 1,
                        -1 if exponent % 2 == 0 => 1,
                        -1 => -1,
                        _ => 0,
                    },
                }
            }
            fn abs(self) -> Self {
                self.wrapping_abs()
            }
            fn signum(self) -> Self {
                <$ty>::signum(self)
            }
            fn is_nan(self) -> bool {
                false
            }
        }
    };
}

float_element!(f32);
float_element!(f64);
int_element!(i32);
int_element!(i64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_division_by_zero_is_checked() {
        assert_eq!(NumericElement::checked_div(7i64, 2), Some(3));
        assert_eq!(NumericElement::checked_div(7i64, 0), None);
        assert!(NumericElement::checked_div(1.0f32, 0.0)
            .unwrap()
            .is_infinite());
    }

    #[test]
    fn test_integer_pow_negative_exponent() {
        assert_eq!(NumericElement::pow(2i64, 3), 8);
        assert_eq!(NumericElement::pow(2i64, -1), 0);
        assert_eq!(NumericElement::pow(-1i32, -3), -1);
    }

    #[test]
    fn test_wrap_and_view() {
        let tensor = f64::wrap(ArrayD::from_elem(ndarray::IxDyn(&[2]), 1.5));
        assert_eq!(tensor.dtype(), DataType::F64);
        assert!(f64::view(&tensor).is_some());
        assert!(f32::view(&tensor).is_none());
    }
}
