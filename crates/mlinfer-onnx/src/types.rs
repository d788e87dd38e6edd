use mlinfer_core::{DataType, Dim, ValueType};

use crate::error::{OnnxError, Result};
use crate::onnx_proto::{tensor_shape_proto, type_proto, TypeProto};

/// Maps ONNX data type codes to interpreter data types.
pub struct DataTypeMapper;

impl DataTypeMapper {
    /// Convert a `TensorProto.DataType` code. `context` names the value in
    /// the error.
    pub fn from_onnx(onnx_type: i32, context: &str) -> Result<DataType> {
        match onnx_type {
            1 => Ok(DataType::F32),    // FLOAT
            6 => Ok(DataType::I32),    // INT32
            7 => Ok(DataType::I64),    // INT64
            8 => Ok(DataType::String), // STRING
            9 => Ok(DataType::Bool),   // BOOL
            11 => Ok(DataType::F64),   // DOUBLE
            _ => Err(OnnxError::UnsupportedDataType {
                data_type: onnx_type,
                context: context.to_string(),
            }),
        }
    }

    /// The `TensorProto.DataType` code of an interpreter type.
    pub fn to_onnx(data_type: DataType) -> i32 {
        match data_type {
            DataType::F32 => 1,
            DataType::I32 => 6,
            DataType::I64 => 7,
            DataType::String => 8,
            DataType::Bool => 9,
            DataType::F64 => 11,
        }
    }
}

/// Convert a `TypeProto`. Returns `None` when the producer left the type
/// undefined.
pub fn value_type_from_proto(type_proto: &TypeProto, context: &str) -> Result<Option<ValueType>> {
    let value_type = match &type_proto.value {
        None => None,
        Some(type_proto::Value::TensorType(t)) if t.elem_type == 0 => None,
        Some(type_proto::Value::TensorType(t)) => Some(ValueType::Tensor(
            DataTypeMapper::from_onnx(t.elem_type, context)?,
        )),
        Some(type_proto::Value::SequenceType(seq)) => match &seq.elem_type {
            Some(inner) => value_type_from_proto(inner, context)?
                .map(|inner| ValueType::Sequence(Box::new(inner))),
            None => None,
        },
        Some(type_proto::Value::MapType(map)) => {
            let key = DataTypeMapper::from_onnx(map.key_type, context)?;
            let value = match &map.value_type {
                Some(inner) => value_type_from_proto(inner, context)?,
                None => None,
            };
            value.map(|value| ValueType::Map {
                key,
                value: Box::new(value),
            })
        }
    };
    Ok(value_type)
}

/// Declared shape of a tensor type, if the producer recorded one.
pub fn shape_from_type_proto(type_proto: &TypeProto) -> Option<Vec<Dim>> {
    let Some(type_proto::Value::TensorType(tensor)) = &type_proto.value else {
        return None;
    };
    let shape = tensor.shape.as_ref()?;
    Some(
        shape
            .dim
            .iter()
            .map(|d| match &d.value {
                Some(tensor_shape_proto::dimension::Value::DimValue(v)) if *v >= 0 => {
                    Dim::Fixed(*v as usize)
                }
                Some(tensor_shape_proto::dimension::Value::DimParam(p)) => {
                    Dim::Symbolic(p.clone())
                }
                _ => Dim::Unknown,
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onnx_proto::TensorShapeProto;

    fn tensor(elem_type: i32) -> TypeProto {
        TypeProto {
            denotation: String::new(),
            value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                elem_type,
                shape: None,
            })),
        }
    }

    #[test]
    fn test_data_type_mapping() {
        for dtype in [
            DataType::F32,
            DataType::F64,
            DataType::I32,
            DataType::I64,
            DataType::Bool,
            DataType::String,
        ] {
            assert_eq!(
                DataTypeMapper::from_onnx(DataTypeMapper::to_onnx(dtype), "x").unwrap(),
                dtype
            );
        }
        assert!(matches!(
            DataTypeMapper::from_onnx(10, "half"),
            Err(OnnxError::UnsupportedDataType { data_type: 10, .. })
        ));
    }

    #[test]
    fn test_sequence_of_maps() {
        let proto = TypeProto {
            denotation: String::new(),
            value: Some(type_proto::Value::SequenceType(type_proto::Sequence {
                elem_type: Some(Box::new(TypeProto {
                    denotation: String::new(),
                    value: Some(type_proto::Value::MapType(type_proto::Map {
                        key_type: 7,
                        value_type: Some(Box::new(tensor(1))),
                    })),
                })),
            })),
        };
        let value_type = value_type_from_proto(&proto, "probs").unwrap().unwrap();
        assert_eq!(value_type.to_string(), "seq(map(int64,tensor(float)))");
    }

    #[test]
    fn test_undefined_elem_type() {
        assert_eq!(value_type_from_proto(&tensor(0), "x").unwrap(), None);
    }

    #[test]
    fn test_shape_dims() {
        let proto = TypeProto {
            denotation: String::new(),
            value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                elem_type: 1,
                shape: Some(TensorShapeProto {
                    dim: vec![
                        tensor_shape_proto::Dimension {
                            denotation: String::new(),
                            value: Some(tensor_shape_proto::dimension::Value::DimParam(
                                "N".to_string(),
                            )),
                        },
                        tensor_shape_proto::Dimension {
                            denotation: String::new(),
                            value: Some(tensor_shape_proto::dimension::Value::DimValue(4)),
                        },
                        tensor_shape_proto::Dimension::default(),
                    ],
                }),
            })),
        };
        assert_eq!(
            shape_from_type_proto(&proto),
            Some(vec![
                Dim::Symbolic("N".to_string()),
                Dim::Fixed(4),
                Dim::Unknown
            ])
        );
    }
}
