//! Schema-driven attribute binding.
//!
//! Each kernel declares an [`AttributeSchema`]: the attributes it reads, the
//! kind it expects for each, and a default. [`AttributeSchema::bind`] checks
//! a node's raw attributes against the schema, coerces compatible kinds and
//! fills in defaults, producing [`BoundAttributes`] with typed getters.

use std::collections::HashMap;
use std::sync::Arc;

use mlinfer_core::{AttributeKind, AttributeValue, DataType, GraphNode, ModelGraph, Tensor};
use tracing::debug;

use crate::error::{Error, Result};

/// Declaration of a single attribute.
#[derive(Debug, Clone)]
pub struct AttrSpec {
    /// Attribute name.
    pub name: String,
    /// Kind the kernel reads.
    pub kind: AttributeKind,
    /// Value used when the node does not carry the attribute.
    pub default: Option<AttributeValue>,
    /// Whether a missing attribute is an error.
    pub required: bool,
}

/// Ordered attribute declarations of one kernel.
#[derive(Debug, Clone, Default)]
pub struct AttributeSchema {
    specs: Vec<AttrSpec>,
}

impl AttributeSchema {
    /// An empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, name: &str, kind: AttributeKind, default: Option<AttributeValue>) -> Self {
        self.specs.push(AttrSpec {
            name: name.to_string(),
            kind,
            default,
            required: false,
        });
        self
    }

    /// Integer attribute with a default.
    pub fn int(self, name: &str, default: i64) -> Self {
        self.push(name, AttributeKind::Int, Some(AttributeValue::Int(default)))
    }

    /// Float attribute with a default.
    pub fn float(self, name: &str, default: f64) -> Self {
        self.push(name, AttributeKind::Float, Some(AttributeValue::Float(default)))
    }

    /// Text attribute with a default.
    pub fn string(self, name: &str, default: &str) -> Self {
        self.push(
            name,
            AttributeKind::String,
            Some(AttributeValue::text(default)),
        )
    }

    /// Integer list with a default.
    pub fn ints(self, name: &str, default: &[i64]) -> Self {
        self.push(
            name,
            AttributeKind::Ints,
            Some(AttributeValue::Ints(default.to_vec())),
        )
    }

    /// Float list with a default.
    pub fn floats(self, name: &str, default: &[f64]) -> Self {
        self.push(
            name,
            AttributeKind::Floats,
            Some(AttributeValue::Floats(default.to_vec())),
        )
    }

    /// Text list with a default.
    pub fn strings(self, name: &str, default: &[&str]) -> Self {
        self.push(
            name,
            AttributeKind::Strings,
            Some(AttributeValue::texts(default)),
        )
    }

    /// Tensor attribute; the default's element type drives list coercion.
    pub fn tensor(self, name: &str, default: Tensor) -> Self {
        self.push(
            name,
            AttributeKind::Tensor,
            Some(AttributeValue::Tensor(default)),
        )
    }

    /// Attribute of `kind` with no default that must be present.
    pub fn required(mut self, name: &str, kind: AttributeKind) -> Self {
        self.specs.push(AttrSpec {
            name: name.to_string(),
            kind,
            default: None,
            required: true,
        });
        self
    }

    /// Attribute of `kind` with no default that may be absent.
    pub fn optional(self, name: &str, kind: AttributeKind) -> Self {
        self.push(name, kind, None)
    }

    /// Declared attributes.
    pub fn specs(&self) -> &[AttrSpec] {
        &self.specs
    }

    /// Validate and coerce `node`'s attributes.
    pub fn bind(&self, node: &GraphNode) -> Result<BoundAttributes> {
        let mut values = HashMap::with_capacity(self.specs.len());
        for spec in &self.specs {
            match node.attributes.get(&spec.name) {
                Some(raw) => {
                    let coerced = coerce(raw, spec).ok_or_else(|| Error::AttributeTypeError {
                        node: node.display_name(),
                        op_type: node.op_type.clone(),
                        attribute: spec.name.clone(),
                        expected: spec.kind,
                        found: raw.kind(),
                    })?;
                    values.insert(spec.name.clone(), coerced);
                }
                None if spec.required => {
                    return Err(Error::MissingAttribute {
                        node: node.display_name(),
                        op_type: node.op_type.clone(),
                        attribute: spec.name.clone(),
                    });
                }
                None => {
                    if let Some(default) = &spec.default {
                        values.insert(spec.name.clone(), default.clone());
                    }
                }
            }
        }

        for (name, value) in &node.attributes {
            if !values.contains_key(name) {
                debug!(
                    "Keeping undeclared attribute '{}' on node '{}' ({})",
                    name,
                    node.display_name(),
                    node.op_type
                );
                values.insert(name.clone(), value.clone());
            }
        }

        Ok(BoundAttributes { values })
    }
}

fn coerce(raw: &AttributeValue, spec: &AttrSpec) -> Option<AttributeValue> {
    use AttributeValue as A;

    if raw.kind() == spec.kind {
        return Some(raw.clone());
    }
    let coerced = match (spec.kind, raw) {
        (AttributeKind::Float, A::Int(v)) => A::Float(*v as f64),
        (AttributeKind::Floats, A::Ints(v)) => A::Floats(v.iter().map(|&x| x as f64).collect()),
        (AttributeKind::Floats, A::Float(v)) => A::Floats(vec![*v]),
        (AttributeKind::Floats, A::Int(v)) => A::Floats(vec![*v as f64]),
        (AttributeKind::Ints, A::Int(v)) => A::Ints(vec![*v]),
        (AttributeKind::Strings, A::String(v)) => A::Strings(vec![v.clone()]),
        (AttributeKind::Floats, A::Tensor(t)) if t.ndim() <= 1 && t.dtype().is_numeric() => {
            A::Floats(t.to_f64_vec().ok()?)
        }
        (AttributeKind::Ints, A::Tensor(t))
            if t.ndim() <= 1 && matches!(t.dtype(), DataType::I32 | DataType::I64) =>
        {
            A::Ints(t.to_i64_vec().ok()?)
        }
        (AttributeKind::Tensor, A::Floats(v)) => A::Tensor(list_tensor(
            Tensor::from_vec(vec![v.len()], v.clone()).ok()?,
            spec,
            DataType::F32,
        )?),
        (AttributeKind::Tensor, A::Ints(v)) => A::Tensor(list_tensor(
            Tensor::from_vec(vec![v.len()], v.clone()).ok()?,
            spec,
            DataType::I64,
        )?),
        (AttributeKind::Tensor, A::Float(v)) => {
            A::Tensor(list_tensor(Tensor::scalar(*v), spec, DataType::F32)?)
        }
        (AttributeKind::Tensor, A::Int(v)) => {
            A::Tensor(list_tensor(Tensor::scalar(*v), spec, DataType::I64)?)
        }
        _ => return None,
    };
    Some(coerced)
}

/// Cast a list-shaped tensor to the element type of the schema entry's default.
fn list_tensor(values: Tensor, spec: &AttrSpec, fallback: DataType) -> Option<Tensor> {
    let target = match &spec.default {
        Some(AttributeValue::Tensor(default)) => default.dtype(),
        _ => fallback,
    };
    values.cast(target).ok()
}

/// Attributes of one node after binding.
#[derive(Debug, Clone, Default)]
pub struct BoundAttributes {
    values: HashMap<String, AttributeValue>,
}

impl BoundAttributes {
    /// Raw bound value.
    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.values.get(name)
    }

    /// Whether a value is bound under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Integer value.
    pub fn int(&self, name: &str) -> Option<i64> {
        match self.get(name)? {
            AttributeValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Float value.
    pub fn float(&self, name: &str) -> Option<f64> {
        match self.get(name)? {
            AttributeValue::Float(v) => Some(*v),
            AttributeValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Text value, decoded lossily from bytes.
    pub fn string(&self, name: &str) -> Option<String> {
        match self.get(name)? {
            AttributeValue::String(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
            _ => None,
        }
    }

    /// Integer list.
    pub fn ints(&self, name: &str) -> Option<&[i64]> {
        match self.get(name)? {
            AttributeValue::Ints(v) => Some(v),
            _ => None,
        }
    }

    /// Float list.
    pub fn floats(&self, name: &str) -> Option<&[f64]> {
        match self.get(name)? {
            AttributeValue::Floats(v) => Some(v),
            _ => None,
        }
    }

    /// Text list, decoded lossily from bytes.
    pub fn strings(&self, name: &str) -> Option<Vec<String>> {
        match self.get(name)? {
            AttributeValue::Strings(items) => Some(
                items
                    .iter()
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .collect(),
            ),
            _ => None,
        }
    }

    /// Tensor value.
    pub fn tensor(&self, name: &str) -> Option<&Tensor> {
        match self.get(name)? {
            AttributeValue::Tensor(t) => Some(t),
            _ => None,
        }
    }

    /// Nested graph.
    pub fn graph(&self, name: &str) -> Option<Arc<ModelGraph>> {
        match self.get(name)? {
            AttributeValue::Graph(g) => Some(Arc::clone(g)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_with(name: &str, value: AttributeValue) -> GraphNode {
        GraphNode::new("Test")
            .with_name("n")
            .with_attribute(name, value)
    }

    #[test]
    fn test_defaults_fill_missing() {
        let schema = AttributeSchema::new()
            .int("axis", -1)
            .float("alpha", 1.0)
            .string("mode", "NONE")
            .strings("labels", &["a", "b"]);
        let bound = schema.bind(&GraphNode::new("Test")).unwrap();
        assert_eq!(bound.int("axis"), Some(-1));
        assert_eq!(bound.float("alpha"), Some(1.0));
        assert_eq!(bound.string("mode").as_deref(), Some("NONE"));
        assert_eq!(bound.strings("labels").unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_int_coerces_to_float() {
        let schema = AttributeSchema::new().float("alpha", 1.0);
        let bound = schema
            .bind(&node_with("alpha", AttributeValue::Int(3)))
            .unwrap();
        assert_eq!(bound.float("alpha"), Some(3.0));
    }

    #[test]
    fn test_floats_coerce_to_tensor_of_default_type() {
        let schema =
            AttributeSchema::new().tensor("weights", Tensor::empty::<f64>(&[0]).unwrap());
        let bound = schema
            .bind(&node_with("weights", AttributeValue::Floats(vec![0.5, 1.5])))
            .unwrap();
        let t = bound.tensor("weights").unwrap();
        assert_eq!(t.dtype(), DataType::F64);
        assert_eq!(t.to_f64_vec().unwrap(), vec![0.5, 1.5]);
    }

    #[test]
    fn test_tensor_coerces_to_ints() {
        let schema = AttributeSchema::new().ints("perm", &[]);
        let t = Tensor::from_vec(vec![2], vec![1i64, 0]).unwrap();
        let bound = schema
            .bind(&node_with("perm", AttributeValue::Tensor(t)))
            .unwrap();
        assert_eq!(bound.ints("perm"), Some(&[1i64, 0][..]));
    }

    #[test]
    fn test_graph_where_tensor_expected_is_type_error() {
        let schema = AttributeSchema::new().tensor("value", Tensor::scalar(0.0f32));
        let err = schema
            .bind(&node_with(
                "value",
                AttributeValue::Graph(Arc::new(ModelGraph::default())),
            ))
            .unwrap_err();
        match err {
            Error::AttributeTypeError {
                node,
                attribute,
                expected,
                found,
                ..
            } => {
                assert_eq!(node, "n");
                assert_eq!(attribute, "value");
                assert_eq!(expected, AttributeKind::Tensor);
                assert_eq!(found, AttributeKind::Graph);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_required_attribute() {
        let schema = AttributeSchema::new().required("to", AttributeKind::Int);
        let err = schema.bind(&GraphNode::new("Cast")).unwrap_err();
        assert!(matches!(err, Error::MissingAttribute { ref attribute, .. } if attribute == "to"));
    }

    #[test]
    fn test_undeclared_attributes_are_kept() {
        let bound = AttributeSchema::new()
            .bind(&node_with("extra", AttributeValue::Int(7)))
            .unwrap();
        assert_eq!(bound.int("extra"), Some(7));
    }
}
