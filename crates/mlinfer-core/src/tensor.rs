//! Dense, row-major tensors backed by `ndarray`.
//!
//! A [`Tensor`] is a type-erased n-dimensional array. Each variant owns an
//! `ArrayD` of the corresponding element type; generic code reaches the typed
//! array through [`TensorElement`](crate::element::TensorElement) or the
//! `with_*_type!` macros.

use ndarray::{Array, ArrayD, Axis, IxDyn};

use crate::element::TensorElement;
use crate::error::{CoreError, Result};
use crate::types::DataType;

/// Dispatch on a [`DataType`], binding the matching Rust element type.
///
/// ```
/// use mlinfer_core::{with_element_type, DataType, Tensor};
///
/// let empty = with_element_type!(DataType::I64, T => Tensor::empty::<T>(&[0, 3]))?;
/// assert_eq!(empty.dtype(), DataType::I64);
/// # Ok::<(), mlinfer_core::CoreError>(())
/// ```
#[macro_export]
macro_rules! with_element_type {
    ($dtype:expr, $t:ident => $body:expr) => {
        match $dtype {
            $crate::DataType::F32 => {
                type $t = f32;
                $body
            }
            $crate::DataType::F64 => {
                type $t = f64;
                $body
            }
            $crate::DataType::I32 => {
                type $t = i32;
                $body
            }
            $crate::DataType::I64 => {
                type $t = i64;
                $body
            }
            $crate::DataType::Bool => {
                type $t = bool;
                $body
            }
            $crate::DataType::String => {
                type $t = String;
                $body
            }
        }
    };
}

/// Dispatch on a numeric [`DataType`]; other types take the fallback arm.
#[macro_export]
macro_rules! with_numeric_type {
    ($dtype:expr, $t:ident => $body:expr, _ => $fallback:expr) => {
        match $dtype {
            $crate::DataType::F32 => {
                type $t = f32;
                $body
            }
            $crate::DataType::F64 => {
                type $t = f64;
                $body
            }
            $crate::DataType::I32 => {
                type $t = i32;
                $body
            }
            $crate::DataType::I64 => {
                type $t = i64;
                $body
            }
            _ => $fallback,
        }
    };
}

macro_rules! map_array {
    ($tensor:expr, $array:ident => $body:expr) => {
        match $tensor {
            Tensor::F32($array) => Tensor::F32($body),
            Tensor::F64($array) => Tensor::F64($body),
            Tensor::I32($array) => Tensor::I32($body),
            Tensor::I64($array) => Tensor::I64($body),
            Tensor::Bool($array) => Tensor::Bool($body),
            Tensor::String($array) => Tensor::String($body),
        }
    };
}

macro_rules! cast_numeric {
    ($tensor:expr, $target:ty, $to:expr) => {
        match $tensor {
            Tensor::F32(a) => a.mapv(|v| v as $target),
            Tensor::F64(a) => a.mapv(|v| v as $target),
            Tensor::I32(a) => a.mapv(|v| v as $target),
            Tensor::I64(a) => a.mapv(|v| v as $target),
            Tensor::Bool(a) => a.mapv(|v| u8::from(v) as $target),
            Tensor::String(a) => parse_strings::<$target>(a, $to)?,
        }
    };
}

/// A dense tensor of one of the supported element types.
#[derive(Debug, Clone, PartialEq)]
pub enum Tensor {
    /// `float` elements.
    F32(ArrayD<f32>),
    /// `double` elements.
    F64(ArrayD<f64>),
    /// `int32` elements.
    I32(ArrayD<i32>),
    /// `int64` elements.
    I64(ArrayD<i64>),
    /// `bool` elements.
    Bool(ArrayD<bool>),
    /// `string` elements.
    String(ArrayD<String>),
}

impl Tensor {
    /// Build a tensor from a flat row-major buffer.
    ///
    /// # Example
    /// ```rust
    /// use mlinfer_core::{DataType, Tensor};
    ///
    /// let tensor = Tensor::from_vec(vec![2, 2], vec![1.0f32, 2.0, 3.0, 4.0])?;
    /// assert_eq!(tensor.shape(), &[2, 2]);
    /// assert_eq!(tensor.dtype(), DataType::F32);
    /// # Ok::<(), mlinfer_core::CoreError>(())
    /// ```
    pub fn from_vec<T: TensorElement>(shape: Vec<usize>, data: Vec<T>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(CoreError::ShapeMismatch(format!(
                "shape {:?} needs {} elements, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(T::wrap(Array::from_shape_vec(IxDyn(&shape), data)?))
    }

    /// Wrap an existing array.
    pub fn from_array<T: TensorElement>(array: ArrayD<T>) -> Self {
        T::wrap(array)
    }

    /// A zero-dimensional tensor.
    pub fn scalar<T: TensorElement>(value: T) -> Self {
        T::wrap(ArrayD::from_elem(IxDyn(&[]), value))
    }

    /// A tensor with zero elements and the given shape.
    pub fn empty<T: TensorElement>(shape: &[usize]) -> Result<Self> {
        if shape.iter().product::<usize>() != 0 {
            return Err(CoreError::InvalidArgument(format!(
                "shape {shape:?} is not empty"
            )));
        }
        Self::from_vec::<T>(shape.to_vec(), Vec::new())
    }

    /// Element type.
    pub fn dtype(&self) -> DataType {
        match self {
            Tensor::F32(_) => DataType::F32,
            Tensor::F64(_) => DataType::F64,
            Tensor::I32(_) => DataType::I32,
            Tensor::I64(_) => DataType::I64,
            Tensor::Bool(_) => DataType::Bool,
            Tensor::String(_) => DataType::String,
        }
    }

    /// Dimensions.
    pub fn shape(&self) -> &[usize] {
        match self {
            Tensor::F32(a) => a.shape(),
            Tensor::F64(a) => a.shape(),
            Tensor::I32(a) => a.shape(),
            Tensor::I64(a) => a.shape(),
            Tensor::Bool(a) => a.shape(),
            Tensor::String(a) => a.shape(),
        }
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        self.shape().len()
    }

    /// Total number of elements.
    pub fn len(&self) -> usize {
        self.shape().iter().product()
    }

    /// Whether the tensor has no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrow the typed array, failing on an element type mismatch.
    pub fn view<T: TensorElement>(&self) -> Result<&ArrayD<T>> {
        T::view(self).ok_or_else(|| CoreError::TypeMismatch {
            expected: T::DTYPE.to_string(),
            actual: self.dtype().to_string(),
        })
    }

    /// Convert every element to another type.
    ///
    /// Numeric conversions follow `as` semantics, booleans map to 0/1 and
    /// back via `!= 0`, strings are parsed or formatted.
    pub fn cast(&self, to: DataType) -> Result<Tensor> {
        if self.dtype() == to {
            return Ok(self.clone());
        }
        let cast = match to {
            DataType::F32 => Tensor::F32(cast_numeric!(self, f32, to)),
            DataType::F64 => Tensor::F64(cast_numeric!(self, f64, to)),
            DataType::I32 => Tensor::I32(cast_numeric!(self, i32, to)),
            DataType::I64 => Tensor::I64(cast_numeric!(self, i64, to)),
            DataType::Bool => Tensor::Bool(match self {
                Tensor::F32(a) => a.mapv(|v| v != 0.0),
                Tensor::F64(a) => a.mapv(|v| v != 0.0),
                Tensor::I32(a) => a.mapv(|v| v != 0),
                Tensor::I64(a) => a.mapv(|v| v != 0),
                Tensor::Bool(a) => a.clone(),
                Tensor::String(a) => parse_strings::<bool>(a, to)?,
            }),
            DataType::String => Tensor::String(match self {
                Tensor::F32(a) => a.map(|v| v.to_string()),
                Tensor::F64(a) => a.map(|v| v.to_string()),
                Tensor::I32(a) => a.map(|v| v.to_string()),
                Tensor::I64(a) => a.map(|v| v.to_string()),
                Tensor::Bool(a) => a.map(|v| v.to_string()),
                Tensor::String(a) => a.clone(),
            }),
        };
        Ok(cast)
    }

    /// Elements as `f64`, for numeric and boolean tensors.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        match self.cast(DataType::F64)? {
            Tensor::F64(a) => Ok(a.iter().copied().collect()),
            other => Err(CoreError::TypeMismatch {
                expected: DataType::F64.to_string(),
                actual: other.dtype().to_string(),
            }),
        }
    }

    /// Elements of an integer tensor as `i64`.
    pub fn to_i64_vec(&self) -> Result<Vec<i64>> {
        match self {
            Tensor::I64(a) => Ok(a.iter().copied().collect()),
            Tensor::I32(a) => Ok(a.iter().map(|&v| i64::from(v)).collect()),
            other => Err(CoreError::TypeMismatch {
                expected: "int32 or int64".to_string(),
                actual: other.dtype().to_string(),
            }),
        }
    }

    /// Same elements, new shape.
    pub fn reshape(&self, shape: &[usize]) -> Result<Tensor> {
        if shape.iter().product::<usize>() != self.len() {
            return Err(CoreError::ShapeMismatch(format!(
                "cannot reshape {:?} ({} elements) to {:?}",
                self.shape(),
                self.len(),
                shape
            )));
        }
        Ok(map_array!(self, a => Array::from_shape_vec(
            IxDyn(shape),
            a.iter().cloned().collect()
        )?))
    }

    /// Slice `index` along the leading axis, dropping that axis.
    pub fn index_axis0(&self, index: usize) -> Result<Tensor> {
        let len = *self.shape().first().ok_or_else(|| {
            CoreError::InvalidArgument("cannot index a scalar tensor".to_string())
        })?;
        if index >= len {
            return Err(CoreError::InvalidArgument(format!(
                "index {index} out of range for leading axis of length {len}"
            )));
        }
        Ok(map_array!(self, a => a.index_axis(Axis(0), index).to_owned()))
    }

    /// Stack equally shaped tensors along a new leading axis.
    pub fn stack(tensors: &[Tensor]) -> Result<Tensor> {
        let first = tensors.first().ok_or_else(|| {
            CoreError::InvalidArgument("cannot stack an empty list".to_string())
        })?;
        with_element_type!(first.dtype(), T => stack_typed::<T>(tensors))
    }

    /// Join tensors along an existing axis.
    pub fn concat(tensors: &[Tensor], axis: usize) -> Result<Tensor> {
        let first = tensors.first().ok_or_else(|| {
            CoreError::InvalidArgument("cannot concatenate an empty list".to_string())
        })?;
        if axis >= first.ndim() {
            return Err(CoreError::InvalidArgument(format!(
                "axis {axis} out of range for rank {}",
                first.ndim()
            )));
        }
        with_element_type!(first.dtype(), T => concat_typed::<T>(tensors, axis))
    }

    /// Permute axes; `None` reverses them.
    pub fn transpose(&self, perm: Option<&[usize]>) -> Result<Tensor> {
        let rank = self.ndim();
        let perm: Vec<usize> = match perm {
            Some(p) => p.to_vec(),
            None => (0..rank).rev().collect(),
        };
        let mut seen = vec![false; rank];
        let invalid = perm.len() != rank
            || perm
                .iter()
                .any(|&p| p >= rank || std::mem::replace(&mut seen[p], true));
        if invalid {
            return Err(CoreError::InvalidArgument(format!(
                "invalid permutation {perm:?} for rank {rank}"
            )));
        }
        Ok(map_array!(self, a => a
            .view()
            .permuted_axes(perm.as_slice())
            .as_standard_layout()
            .into_owned()))
    }

    /// Repeat the tensor to `shape` under numpy broadcasting rules.
    pub fn broadcast_to(&self, shape: &[usize]) -> Result<Tensor> {
        let fail = || {
            CoreError::ShapeMismatch(format!(
                "cannot broadcast {:?} to {:?}",
                self.shape(),
                shape
            ))
        };
        Ok(map_array!(self, a => a.broadcast(IxDyn(shape)).ok_or_else(fail)?.to_owned()))
    }

    /// Pick `indices` along `axis`.
    pub fn select(&self, axis: usize, indices: &[usize]) -> Result<Tensor> {
        if axis >= self.ndim() {
            return Err(CoreError::InvalidArgument(format!(
                "axis {axis} out of range for rank {}",
                self.ndim()
            )));
        }
        let len = self.shape()[axis];
        if let Some(bad) = indices.iter().find(|&&i| i >= len) {
            return Err(CoreError::InvalidArgument(format!(
                "index {bad} out of range for axis {axis} of length {len}"
            )));
        }
        Ok(map_array!(self, a => a.select(Axis(axis), indices)))
    }

    /// Compute the broadcast shape of two shapes.
    pub fn broadcast_shape(shape1: &[usize], shape2: &[usize]) -> Result<Vec<usize>> {
        let max_len = shape1.len().max(shape2.len());
        let mut padded1 = vec![1; max_len - shape1.len()];
        let mut padded2 = vec![1; max_len - shape2.len()];
        padded1.extend_from_slice(shape1);
        padded2.extend_from_slice(shape2);

        let mut result = Vec::with_capacity(max_len);
        for (d1, d2) in padded1.iter().zip(padded2.iter()) {
            match (*d1, *d2) {
                (1, d) | (d, 1) => result.push(d),
                (d1, d2) if d1 == d2 => result.push(d1),
                (d1, d2) => {
                    return Err(CoreError::ShapeMismatch(format!(
                        "cannot broadcast shapes {shape1:?} and {shape2:?}: dimension {d1} vs {d2}"
                    )));
                }
            }
        }
        Ok(result)
    }
}

fn stack_typed<T: TensorElement>(tensors: &[Tensor]) -> Result<Tensor> {
    let views = tensors
        .iter()
        .map(|t| t.view::<T>().map(|a| a.view()))
        .collect::<Result<Vec<_>>>()?;
    Ok(T::wrap(ndarray::stack(Axis(0), &views)?))
}

fn concat_typed<T: TensorElement>(tensors: &[Tensor], axis: usize) -> Result<Tensor> {
    let views = tensors
        .iter()
        .map(|t| t.view::<T>().map(|a| a.view()))
        .collect::<Result<Vec<_>>>()?;
    Ok(T::wrap(ndarray::concatenate(Axis(axis), &views)?))
}

fn parse_strings<T: std::str::FromStr>(array: &ArrayD<String>, to: DataType) -> Result<ArrayD<T>> {
    let values = array
        .iter()
        .map(|s| {
            s.trim().parse::<T>().map_err(|_| CoreError::CastError {
                from: DataType::String,
                to,
                reason: format!("cannot parse '{s}'"),
            })
        })
        .collect::<Result<Vec<T>>>()?;
    Ok(Array::from_shape_vec(IxDyn(array.shape()), values)?)
}

impl<T: TensorElement> From<ArrayD<T>> for Tensor {
    fn from(array: ArrayD<T>) -> Self {
        T::wrap(array)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vec_checks_length() {
        assert!(Tensor::from_vec(vec![2, 3], vec![0.0f32; 6]).is_ok());
        assert!(matches!(
            Tensor::from_vec(vec![2, 3], vec![0.0f32; 5]),
            Err(CoreError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_cast_numeric_and_bool() {
        let t = Tensor::from_vec(vec![3], vec![0.0f32, 1.5, -2.7]).unwrap();
        let as_int = t.cast(DataType::I64).unwrap();
        assert_eq!(as_int.to_i64_vec().unwrap(), vec![0, 1, -2]);

        let as_bool = t.cast(DataType::Bool).unwrap();
        assert_eq!(
            as_bool.view::<bool>().unwrap().iter().copied().collect::<Vec<_>>(),
            vec![false, true, true]
        );
    }

    #[test]
    fn test_cast_string_roundtrip_failure() {
        let t = Tensor::from_vec(vec![2], vec!["1.5".to_string(), "x".to_string()]).unwrap();
        assert!(matches!(
            t.cast(DataType::F64),
            Err(CoreError::CastError { .. })
        ));
    }

    #[test]
    fn test_index_and_stack() {
        let t = Tensor::from_vec(vec![3, 2], vec![1i64, 2, 3, 4, 5, 6]).unwrap();
        let row = t.index_axis0(1).unwrap();
        assert_eq!(row.shape(), &[2]);
        assert_eq!(row.to_i64_vec().unwrap(), vec![3, 4]);

        let rows: Vec<Tensor> = (0..3).map(|i| t.index_axis0(i).unwrap()).collect();
        assert_eq!(Tensor::stack(&rows).unwrap(), t);
        assert!(t.index_axis0(3).is_err());
    }

    #[test]
    fn test_transpose_and_reshape() {
        let t = Tensor::from_vec(vec![2, 3], vec![1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let tt = t.transpose(None).unwrap();
        assert_eq!(tt.shape(), &[3, 2]);
        assert_eq!(tt.to_f64_vec().unwrap(), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);

        let flat = tt.reshape(&[6]).unwrap();
        assert_eq!(flat.to_f64_vec().unwrap(), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        assert!(t.transpose(Some(&[0, 0])).is_err());
    }

    #[test]
    fn test_broadcast_shape() {
        assert_eq!(Tensor::broadcast_shape(&[2, 1], &[3]).unwrap(), vec![2, 3]);
        assert_eq!(Tensor::broadcast_shape(&[], &[4]).unwrap(), vec![4]);
        assert!(Tensor::broadcast_shape(&[2], &[3]).is_err());
    }

    #[test]
    fn test_select_and_concat() {
        let t = Tensor::from_vec(vec![2, 3], vec![1i32, 2, 3, 4, 5, 6]).unwrap();
        let picked = t.select(1, &[2, 0]).unwrap();
        assert_eq!(picked.to_i64_vec().unwrap(), vec![3, 1, 6, 4]);

        let joined = Tensor::concat(&[t.clone(), t], 0).unwrap();
        assert_eq!(joined.shape(), &[4, 3]);
    }
}
