//! Fundamental data structures shared by the loader and the runtime.
//!
//! The graph model mirrors the ONNX interchange format closely enough that the
//! loader is a direct translation, while staying independent of protobuf.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::tensor::Tensor;

/// Index of a node inside its [`ModelGraph`].
pub type NodeId = usize;

/// The default operator domain. `"ai.onnx"` is an alias for it.
pub const DEFAULT_DOMAIN: &str = "";

/// Domain of the classical machine-learning operators.
pub const ML_DOMAIN: &str = "ai.onnx.ml";

/// Domain of operators specific to this interpreter.
pub const MLINFER_DOMAIN: &str = "mlinfer";

/// Canonical spelling of an operator domain.
pub fn canonical_domain(domain: &str) -> &str {
    match domain {
        "ai.onnx" => DEFAULT_DOMAIN,
        other => other,
    }
}

/// Element types a tensor can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// 32-bit IEEE float.
    F32,
    /// 64-bit IEEE float.
    F64,
    /// 32-bit signed integer.
    I32,
    /// 64-bit signed integer.
    I64,
    /// Boolean.
    Bool,
    /// UTF-8 string.
    String,
}

impl DataType {
    /// Whether this is a floating point type.
    pub fn is_float(self) -> bool {
        matches!(self, DataType::F32 | DataType::F64)
    }

    /// Whether arithmetic is defined for this type.
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            DataType::F32 | DataType::F64 | DataType::I32 | DataType::I64
        )
    }

    /// The ONNX spelling of the type.
    pub fn name(self) -> &'static str {
        match self {
            DataType::F32 => "float",
            DataType::F64 => "double",
            DataType::I32 => "int32",
            DataType::I64 => "int64",
            DataType::Bool => "bool",
            DataType::String => "string",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Static type of a value flowing through the graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueType {
    /// Dense tensor with the given element type.
    Tensor(DataType),
    /// Sequence of values of the inner type.
    Sequence(Box<ValueType>),
    /// Map from a scalar key type to values of the inner type.
    Map {
        /// Key element type.
        key: DataType,
        /// Value type.
        value: Box<ValueType>,
    },
}

impl ValueType {
    /// Element type when this is a tensor.
    pub fn tensor_elem(&self) -> Option<DataType> {
        match self {
            ValueType::Tensor(dtype) => Some(*dtype),
            _ => None,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Tensor(dtype) => write!(f, "tensor({dtype})"),
            ValueType::Sequence(inner) => write!(f, "seq({inner})"),
            ValueType::Map { key, value } => write!(f, "map({key},{value})"),
        }
    }
}

/// One dimension of a declared shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Dim {
    /// Known size.
    Fixed(usize),
    /// Named symbolic size, e.g. `"batch"`.
    Symbolic(String),
    /// Unspecified.
    Unknown,
}

/// Name plus optional static type of a graph value.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueInfo {
    /// Value name.
    pub name: String,
    /// Declared type, when the graph carries one.
    pub value_type: Option<ValueType>,
    /// Declared shape, when the graph carries one.
    pub shape: Option<Vec<Dim>>,
}

impl ValueInfo {
    /// An untyped value.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value_type: None,
            shape: None,
        }
    }

    /// A tensor value with a known element type.
    pub fn tensor(name: impl Into<String>, dtype: DataType) -> Self {
        Self {
            name: name.into(),
            value_type: Some(ValueType::Tensor(dtype)),
            shape: None,
        }
    }

    /// Attach a declared shape.
    pub fn with_shape(mut self, shape: Vec<Dim>) -> Self {
        self.shape = Some(shape);
        self
    }

    /// Attach a declared type.
    pub fn with_type(mut self, value_type: ValueType) -> Self {
        self.value_type = Some(value_type);
        self
    }
}

/// Kind tag of an [`AttributeValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeKind {
    /// Scalar integer.
    Int,
    /// Scalar float.
    Float,
    /// Byte string.
    String,
    /// Dense tensor.
    Tensor,
    /// Nested graph.
    Graph,
    /// List of integers.
    Ints,
    /// List of floats.
    Floats,
    /// List of byte strings.
    Strings,
}

impl fmt::Display for AttributeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttributeKind::Int => "int",
            AttributeKind::Float => "float",
            AttributeKind::String => "string",
            AttributeKind::Tensor => "tensor",
            AttributeKind::Graph => "graph",
            AttributeKind::Ints => "ints",
            AttributeKind::Floats => "floats",
            AttributeKind::Strings => "strings",
        };
        f.write_str(name)
    }
}

/// Raw node attribute as stored in the graph file.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    /// Scalar integer.
    Int(i64),
    /// Scalar float, widened from the file's `float`.
    Float(f64),
    /// Byte string.
    String(Vec<u8>),
    /// Dense tensor.
    Tensor(Tensor),
    /// Nested graph (control-flow bodies).
    Graph(Arc<ModelGraph>),
    /// List of integers.
    Ints(Vec<i64>),
    /// List of floats.
    Floats(Vec<f64>),
    /// List of byte strings.
    Strings(Vec<Vec<u8>>),
}

impl AttributeValue {
    /// The kind tag of this attribute.
    pub fn kind(&self) -> AttributeKind {
        match self {
            AttributeValue::Int(_) => AttributeKind::Int,
            AttributeValue::Float(_) => AttributeKind::Float,
            AttributeValue::String(_) => AttributeKind::String,
            AttributeValue::Tensor(_) => AttributeKind::Tensor,
            AttributeValue::Graph(_) => AttributeKind::Graph,
            AttributeValue::Ints(_) => AttributeKind::Ints,
            AttributeValue::Floats(_) => AttributeKind::Floats,
            AttributeValue::Strings(_) => AttributeKind::Strings,
        }
    }

    /// Text attribute from a `&str`.
    pub fn text(value: &str) -> Self {
        AttributeValue::String(value.as_bytes().to_vec())
    }

    /// String-list attribute from `&str` items.
    pub fn texts<S: AsRef<str>>(values: &[S]) -> Self {
        AttributeValue::Strings(
            values
                .iter()
                .map(|v| v.as_ref().as_bytes().to_vec())
                .collect(),
        )
    }
}

/// One operator invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphNode {
    /// Position in the owning graph.
    pub id: NodeId,
    /// Operator name, e.g. `"Add"`.
    pub op_type: String,
    /// Operator domain; empty for the default domain.
    pub domain: String,
    /// Opset version imported for the node's domain.
    pub since_version: Option<i64>,
    /// Ordered input value names; empty names mark omitted optional inputs.
    pub inputs: Vec<String>,
    /// Ordered output value names.
    pub outputs: Vec<String>,
    /// Attributes by name.
    pub attributes: HashMap<String, AttributeValue>,
    /// Human readable name.
    pub name: Option<String>,
}

impl GraphNode {
    /// A node of the given operator type in the default domain.
    pub fn new(op_type: impl Into<String>) -> Self {
        Self {
            id: 0,
            op_type: op_type.into(),
            domain: String::new(),
            since_version: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            attributes: HashMap::new(),
            name: None,
        }
    }

    /// Set the domain.
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    /// Set the node name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the input names.
    pub fn with_inputs<S: AsRef<str>>(mut self, inputs: &[S]) -> Self {
        self.inputs = inputs.iter().map(|s| s.as_ref().to_string()).collect();
        self
    }

    /// Set the output names.
    pub fn with_outputs<S: AsRef<str>>(mut self, outputs: &[S]) -> Self {
        self.outputs = outputs.iter().map(|s| s.as_ref().to_string()).collect();
        self
    }

    /// Add one attribute.
    pub fn with_attribute(mut self, name: impl Into<String>, value: AttributeValue) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    /// Name used in logs and errors: the node name, or `op_type#id`.
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => format!("{}#{}", self.op_type, self.id),
        }
    }
}

/// A static dataflow graph.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelGraph {
    /// Optional graph name.
    pub name: Option<String>,
    /// Nodes in file order.
    pub nodes: Vec<GraphNode>,
    /// Declared inputs (initializers excluded).
    pub inputs: Vec<ValueInfo>,
    /// Declared outputs.
    pub outputs: Vec<ValueInfo>,
    /// Named constant tensors.
    pub initializers: BTreeMap<String, Tensor>,
    /// Explicit typing of intermediate values.
    pub value_info: Vec<ValueInfo>,
    /// Imported opset version per domain.
    pub opset_imports: BTreeMap<String, i64>,
}
