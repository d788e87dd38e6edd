//! Runtime values stored in the executor's value table.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{CoreError, Result};
use crate::tensor::Tensor;
use crate::types::{DataType, ValueType};

/// A value flowing between nodes: a tensor, a sequence, or a map.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Dense tensor.
    Tensor(Tensor),
    /// Ragged sequence of values.
    Sequence(Vec<Value>),
    /// String-keyed map of scores, as produced by `ZipMap`.
    Map(BTreeMap<String, f64>),
}

impl Value {
    /// Borrow the tensor, failing for sequences and maps.
    pub fn as_tensor(&self) -> Result<&Tensor> {
        match self {
            Value::Tensor(t) => Ok(t),
            other => Err(CoreError::TypeMismatch {
                expected: "tensor".to_string(),
                actual: other.value_type().to_string(),
            }),
        }
    }

    /// Take the tensor, failing for sequences and maps.
    pub fn into_tensor(self) -> Result<Tensor> {
        match self {
            Value::Tensor(t) => Ok(t),
            other => Err(CoreError::TypeMismatch {
                expected: "tensor".to_string(),
                actual: other.value_type().to_string(),
            }),
        }
    }

    /// Runtime type. Empty sequences report a float tensor element type.
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Tensor(t) => ValueType::Tensor(t.dtype()),
            Value::Sequence(items) => ValueType::Sequence(Box::new(
                items
                    .first()
                    .map(Value::value_type)
                    .unwrap_or(ValueType::Tensor(DataType::F32)),
            )),
            Value::Map(_) => ValueType::Map {
                key: DataType::String,
                value: Box::new(ValueType::Tensor(DataType::F64)),
            },
        }
    }
}

impl From<Tensor> for Value {
    fn from(tensor: Tensor) -> Self {
        Value::Tensor(tensor)
    }
}

impl fmt::Display for Value {
    /// Compact description used in trace logs: type and shape, not data.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Tensor(t) => write!(f, "tensor({})[{:?}]", t.dtype(), t.shape()),
            Value::Sequence(items) => write!(f, "seq[{}]", items.len()),
            Value::Map(entries) => write!(f, "map[{}]", entries.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_as_tensor_rejects_sequences() {
        let seq = Value::Sequence(vec![]);
        assert!(seq.as_tensor().is_err());
        assert_eq!(
            seq.value_type(),
            ValueType::Sequence(Box::new(ValueType::Tensor(DataType::F32)))
        );
    }

    #[test]
    fn test_display_shows_shape() {
        let v = Value::from(Tensor::from_vec(vec![1, 2], vec![1i64, 2]).unwrap());
        assert_eq!(v.to_string(), "tensor(int64)[[1, 2]]");
    }
}
