use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use mlinfer_core::{
    canonical_domain, AttributeValue, DataType, GraphNode, ModelGraph, Tensor, ValueInfo,
};
use prost::Message;
use tracing::{debug, info, warn};

use crate::error::{OnnxError, Result};
use crate::onnx_proto::{
    attribute_proto::AttributeType, tensor_proto::DataLocation, AttributeProto, GraphProto,
    ModelProto, TensorProto, ValueInfoProto,
};
use crate::types::{shape_from_type_proto, value_type_from_proto, DataTypeMapper};

/// Minimum supported ONNX IR version
const MIN_IR_VERSION: i64 = 3;

/// Recommended ONNX opset version for the default domain
const RECOMMENDED_OPSET_VERSION: i64 = 13;

/// Loads ONNX models and converts them to the interpreter's graph model
pub struct ModelLoader;

impl ModelLoader {
    /// Load an ONNX model from a file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<LoadedModel> {
        info!("Loading ONNX model from: {:?}", path.as_ref());
        let bytes = fs::read(path)?;
        Self::load_from_bytes(&bytes)
    }

    /// Load an ONNX model from bytes
    pub fn load_from_bytes(bytes: &[u8]) -> Result<LoadedModel> {
        let model_proto = ModelProto::decode(bytes)?;
        Self::convert_model(model_proto)
    }

    /// Convert a decoded `ModelProto`
    pub fn convert_model(model_proto: ModelProto) -> Result<LoadedModel> {
        let ir_version = model_proto.ir_version;
        if ir_version < MIN_IR_VERSION {
            return Err(OnnxError::UnsupportedIrVersion {
                version: ir_version,
                min_version: MIN_IR_VERSION,
            });
        }
        info!("ONNX model IR version: {}", ir_version);

        let mut opset_imports = BTreeMap::new();
        for opset in &model_proto.opset_import {
            let domain = canonical_domain(&opset.domain).to_string();
            if domain.is_empty() && opset.version < RECOMMENDED_OPSET_VERSION {
                warn!(
                    "ONNX opset version {} is older than recommended {}",
                    opset.version, RECOMMENDED_OPSET_VERSION
                );
            }
            debug!("Opset import: '{}' v{}", domain, opset.version);
            opset_imports.insert(domain, opset.version);
        }

        let graph_proto = model_proto
            .graph
            .ok_or_else(|| OnnxError::ParseError("Model has no graph".to_string()))?;

        let graph = Self::convert_graph(&graph_proto, &opset_imports)?;

        let metadata = model_proto
            .metadata_props
            .into_iter()
            .map(|entry| (entry.key, entry.value))
            .collect();

        Ok(LoadedModel {
            graph,
            producer_name: (!model_proto.producer_name.is_empty())
                .then_some(model_proto.producer_name),
            producer_version: (!model_proto.producer_version.is_empty())
                .then_some(model_proto.producer_version),
            ir_version,
            model_version: model_proto.model_version,
            metadata,
        })
    }

    /// Convert a `GraphProto`, recursing into graph-valued attributes.
    ///
    /// Nested graphs inherit the model's opset imports.
    pub fn convert_graph(
        graph_proto: &GraphProto,
        opset_imports: &BTreeMap<String, i64>,
    ) -> Result<ModelGraph> {
        info!("Converting ONNX graph: {}", graph_proto.name);

        let mut graph = ModelGraph::new();
        graph.name = (!graph_proto.name.is_empty()).then(|| graph_proto.name.clone());
        graph.opset_imports = opset_imports.clone();

        for init in &graph_proto.initializer {
            debug!("Loading initializer: {}", init.name);
            let tensor = tensor_from_proto(init)?;
            graph.initializers.insert(init.name.clone(), tensor);
        }

        for input in &graph_proto.input {
            // Older exporters list initializers among the inputs.
            if graph.initializers.contains_key(&input.name) {
                continue;
            }
            let info = Self::value_info_from_proto(input)?;
            debug!("Input: {} with type {:?}", info.name, info.value_type);
            graph.inputs.push(info);
        }

        for output in &graph_proto.output {
            let info = Self::value_info_from_proto(output)?;
            debug!("Output: {} with type {:?}", info.name, info.value_type);
            graph.outputs.push(info);
        }

        for value_info in &graph_proto.value_info {
            graph.value_info.push(Self::value_info_from_proto(value_info)?);
        }

        for node_proto in &graph_proto.node {
            let domain = canonical_domain(&node_proto.domain).to_string();
            debug!(
                "Processing node: {} ({}:{})",
                node_proto.name, domain, node_proto.op_type
            );

            let mut attributes = HashMap::new();
            for attr in &node_proto.attribute {
                let value = Self::convert_attribute(attr, opset_imports)?;
                attributes.insert(attr.name.clone(), value);
            }

            graph.add_node(GraphNode {
                id: 0,
                since_version: opset_imports.get(&domain).copied(),
                op_type: node_proto.op_type.clone(),
                domain,
                inputs: node_proto.input.clone(),
                outputs: node_proto.output.clone(),
                attributes,
                name: (!node_proto.name.is_empty()).then(|| node_proto.name.clone()),
            });
        }

        Ok(graph)
    }

    fn value_info_from_proto(proto: &ValueInfoProto) -> Result<ValueInfo> {
        let mut info = ValueInfo::new(proto.name.clone());
        if let Some(type_proto) = &proto.r#type {
            info.value_type = value_type_from_proto(type_proto, &proto.name)?;
            info.shape = shape_from_type_proto(type_proto);
        }
        Ok(info)
    }

    /// Convert an `AttributeProto`.
    fn convert_attribute(
        attr: &AttributeProto,
        opset_imports: &BTreeMap<String, i64>,
    ) -> Result<AttributeValue> {
        let attr_type = match AttributeType::try_from(attr.r#type) {
            Ok(AttributeType::Undefined) | Err(_) => Self::infer_attribute_type(attr),
            Ok(known) => known,
        };

        match attr_type {
            AttributeType::Float => Ok(AttributeValue::Float(f64::from(attr.f))),
            AttributeType::Int => Ok(AttributeValue::Int(attr.i)),
            AttributeType::String => Ok(AttributeValue::String(attr.s.clone())),
            AttributeType::Tensor => {
                let t = attr.t.as_ref().ok_or_else(|| OnnxError::InvalidAttribute {
                    name: attr.name.clone(),
                    reason: "Tensor attribute has no value".to_string(),
                })?;
                Ok(AttributeValue::Tensor(tensor_from_proto(t)?))
            }
            AttributeType::Graph => {
                let g = attr.g.as_ref().ok_or_else(|| OnnxError::InvalidAttribute {
                    name: attr.name.clone(),
                    reason: "Graph attribute has no value".to_string(),
                })?;
                Ok(AttributeValue::Graph(Arc::new(Self::convert_graph(
                    g,
                    opset_imports,
                )?)))
            }
            AttributeType::Floats => Ok(AttributeValue::Floats(
                attr.floats.iter().map(|&f| f64::from(f)).collect(),
            )),
            AttributeType::Ints => Ok(AttributeValue::Ints(attr.ints.clone())),
            AttributeType::Strings => Ok(AttributeValue::Strings(attr.strings.clone())),
            other => Err(OnnxError::InvalidAttribute {
                name: attr.name.clone(),
                reason: format!("unsupported attribute type {other:?}"),
            }),
        }
    }

    /// Guess the kind of an attribute whose type tag is missing, from the
    /// populated field.
    fn infer_attribute_type(attr: &AttributeProto) -> AttributeType {
        if attr.g.is_some() {
            AttributeType::Graph
        } else if attr.t.is_some() {
            AttributeType::Tensor
        } else if !attr.floats.is_empty() {
            AttributeType::Floats
        } else if !attr.ints.is_empty() {
            AttributeType::Ints
        } else if !attr.strings.is_empty() {
            AttributeType::Strings
        } else if !attr.s.is_empty() {
            AttributeType::String
        } else if attr.f != 0.0 {
            AttributeType::Float
        } else {
            AttributeType::Int
        }
    }
}

/// Convert an ONNX `TensorProto` to a tensor.
pub fn tensor_from_proto(tensor_proto: &TensorProto) -> Result<Tensor> {
    let name = tensor_proto.name.as_str();
    if tensor_proto.data_location == DataLocation::External as i32 {
        return Err(OnnxError::InvalidTensor {
            name: name.to_string(),
            reason: "external data is not supported".to_string(),
        });
    }

    let data_type = DataTypeMapper::from_onnx(tensor_proto.data_type, name)?;
    let shape = tensor_proto
        .dims
        .iter()
        .map(|&d| {
            usize::try_from(d).map_err(|_| OnnxError::InvalidTensor {
                name: name.to_string(),
                reason: format!("negative dimension {d}"),
            })
        })
        .collect::<Result<Vec<usize>>>()?;

    let tensor = if !tensor_proto.raw_data.is_empty() {
        tensor_from_raw_data(name, &tensor_proto.raw_data, shape, data_type)?
    } else {
        tensor_from_typed_data(tensor_proto, shape, data_type)?
    };
    Ok(tensor)
}

fn decode_le<const N: usize, T>(
    name: &str,
    raw_data: &[u8],
    convert: impl Fn([u8; N]) -> T,
) -> Result<Vec<T>> {
    if raw_data.len() % N != 0 {
        return Err(OnnxError::InvalidTensor {
            name: name.to_string(),
            reason: format!(
                "raw_data length {} is not a multiple of {}",
                raw_data.len(),
                N
            ),
        });
    }
    Ok(raw_data
        .chunks_exact(N)
        .map(|chunk| {
            let mut bytes = [0u8; N];
            bytes.copy_from_slice(chunk);
            convert(bytes)
        })
        .collect())
}

/// Create tensor from the packed little-endian `raw_data` field
fn tensor_from_raw_data(
    name: &str,
    raw_data: &[u8],
    shape: Vec<usize>,
    data_type: DataType,
) -> Result<Tensor> {
    let tensor = match data_type {
        DataType::F32 => Tensor::from_vec(shape, decode_le(name, raw_data, f32::from_le_bytes)?)?,
        DataType::F64 => Tensor::from_vec(shape, decode_le(name, raw_data, f64::from_le_bytes)?)?,
        DataType::I32 => Tensor::from_vec(shape, decode_le(name, raw_data, i32::from_le_bytes)?)?,
        DataType::I64 => Tensor::from_vec(shape, decode_le(name, raw_data, i64::from_le_bytes)?)?,
        DataType::Bool => {
            Tensor::from_vec(shape, raw_data.iter().map(|&b| b != 0).collect::<Vec<_>>())?
        }
        DataType::String => {
            return Err(OnnxError::InvalidTensor {
                name: name.to_string(),
                reason: "string tensors cannot use raw_data".to_string(),
            })
        }
    };

    debug!(
        "Decoded tensor from raw_data: shape={:?}, type={}, bytes={}",
        tensor.shape(),
        data_type,
        raw_data.len()
    );
    Ok(tensor)
}

/// Create tensor from the typed repeated fields
fn tensor_from_typed_data(
    tensor_proto: &TensorProto,
    shape: Vec<usize>,
    data_type: DataType,
) -> Result<Tensor> {
    let tensor = match data_type {
        DataType::F32 => Tensor::from_vec(shape, tensor_proto.float_data.clone())?,
        DataType::F64 => Tensor::from_vec(shape, tensor_proto.double_data.clone())?,
        DataType::I32 => Tensor::from_vec(shape, tensor_proto.int32_data.clone())?,
        DataType::I64 => Tensor::from_vec(shape, tensor_proto.int64_data.clone())?,
        // Booleans travel in int32_data.
        DataType::Bool => Tensor::from_vec(
            shape,
            tensor_proto
                .int32_data
                .iter()
                .map(|&v| v != 0)
                .collect::<Vec<_>>(),
        )?,
        DataType::String => Tensor::from_vec(
            shape,
            tensor_proto
                .string_data
                .iter()
                .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                .collect::<Vec<_>>(),
        )?,
    };
    Ok(tensor)
}

/// A loaded ONNX model converted to the interpreter representation
#[derive(Debug, Clone)]
pub struct LoadedModel {
    /// The main graph, with initializers and declared types.
    pub graph: ModelGraph,
    /// Tool that wrote the file.
    pub producer_name: Option<String>,
    /// Version of that tool.
    pub producer_version: Option<String>,
    /// IR version of the file.
    pub ir_version: i64,
    /// Model version set by the producer.
    pub model_version: i64,
    /// Free-form `metadata_props`.
    pub metadata: HashMap<String, String>,
}

impl LoadedModel {
    /// Get the model graph
    pub fn graph(&self) -> &ModelGraph {
        &self.graph
    }

    /// Take the model graph
    pub fn into_graph(self) -> ModelGraph {
        self.graph
    }

    /// Declared inputs, initializers excluded
    pub fn inputs(&self) -> &[ValueInfo] {
        &self.graph.inputs
    }

    /// Declared outputs
    pub fn outputs(&self) -> &[ValueInfo] {
        &self.graph.outputs
    }

    /// Initializer tensors (weights, constants)
    pub fn initializers(&self) -> &BTreeMap<String, Tensor> {
        &self.graph.initializers
    }
}
