//! Static type resolution for values the graph does not type explicitly.
//!
//! Rules are tried in order; the first one that applies to a node decides
//! the types of all of its outputs. Types stated by the graph (inputs,
//! outputs, `value_info`, initializers) are never overridden.

use std::collections::HashMap;

use mlinfer_core::{
    AttributeKind, AttributeValue, DataType, GraphNode, ModelGraph, NodeId, ValueType,
};
use mlinfer_onnx::DataTypeMapper;
use tracing::trace;

use crate::error::{Error, Result};

/// What a rule sees of a node.
struct RuleInput<'a> {
    node: &'a GraphNode,
    inputs: Vec<ValueType>,
    outputs: usize,
    dtype: DataType,
}

impl RuleInput<'_> {
    fn ambient(&self) -> ValueType {
        ValueType::Tensor(self.dtype)
    }

    fn first_input(&self) -> ValueType {
        self.inputs.first().cloned().unwrap_or_else(|| self.ambient())
    }

    fn all(&self, value_type: ValueType) -> Vec<ValueType> {
        vec![value_type; self.outputs]
    }

    fn label_type(&self) -> DataType {
        if self.node.attributes.contains_key("classlabels_strings") {
            DataType::String
        } else {
            DataType::I64
        }
    }
}

type Rule = fn(&RuleInput<'_>) -> Option<Result<Vec<ValueType>>>;

const RULES: &[(&str, Rule)] = &[
    ("zipmap", zipmap),
    ("classifier", classifier),
    ("boolean", boolean),
    ("int64 index", int64_index),
    ("cast", cast),
    ("topk", topk),
    ("array feature extractor", array_feature_extractor),
    ("constant of shape", constant_of_shape),
    ("shape preserving", shape_preserving),
    ("scan", scan),
    ("passthrough", passthrough),
];

fn zipmap(input: &RuleInput<'_>) -> Option<Result<Vec<ValueType>>> {
    (input.node.op_type == "ZipMap").then(|| {
        Ok(input.all(ValueType::Sequence(Box::new(ValueType::Map {
            key: DataType::String,
            value: Box::new(ValueType::Tensor(DataType::F64)),
        }))))
    })
}

fn classifier(input: &RuleInput<'_>) -> Option<Result<Vec<ValueType>>> {
    input.node.op_type.contains("Classifier").then(|| {
        Ok((0..input.outputs)
            .map(|i| match i {
                0 => ValueType::Tensor(input.label_type()),
                _ => input.ambient(),
            })
            .collect())
    })
}

fn boolean(input: &RuleInput<'_>) -> Option<Result<Vec<ValueType>>> {
    matches!(input.node.op_type.as_str(), "Greater" | "Less" | "Equal" | "Not")
        .then(|| Ok(input.all(ValueType::Tensor(DataType::Bool))))
}

fn int64_index(input: &RuleInput<'_>) -> Option<Result<Vec<ValueType>>> {
    matches!(input.node.op_type.as_str(), "Shape" | "ArgMax" | "ArgMin")
        .then(|| Ok(input.all(ValueType::Tensor(DataType::I64))))
}

fn cast(input: &RuleInput<'_>) -> Option<Result<Vec<ValueType>>> {
    if input.node.op_type != "Cast" {
        return None;
    }
    let target = match input.node.attributes.get("to") {
        Some(AttributeValue::Int(to)) => {
            let context = format!("Cast node '{}'", input.node.display_name());
            // Out-of-range codes are reported as unsupported.
            let code = i32::try_from(*to).unwrap_or(-1);
            DataTypeMapper::from_onnx(code, &context).map_err(Error::from)
        }
        Some(other) => Err(Error::AttributeTypeError {
            node: input.node.display_name(),
            op_type: input.node.op_type.clone(),
            attribute: "to".to_string(),
            expected: AttributeKind::Int,
            found: other.kind(),
        }),
        None => Err(Error::MissingAttribute {
            node: input.node.display_name(),
            op_type: input.node.op_type.clone(),
            attribute: "to".to_string(),
        }),
    };
    Some(target.map(|dtype| input.all(ValueType::Tensor(dtype))))
}

fn topk(input: &RuleInput<'_>) -> Option<Result<Vec<ValueType>>> {
    (input.node.op_type == "TopK").then(|| {
        Ok((0..input.outputs)
            .map(|i| match i {
                0 => input.first_input(),
                _ => ValueType::Tensor(DataType::I64),
            })
            .collect())
    })
}

fn array_feature_extractor(input: &RuleInput<'_>) -> Option<Result<Vec<ValueType>>> {
    (input.node.op_type == "ArrayFeatureExtractor").then(|| Ok(input.all(input.first_input())))
}

fn constant_of_shape(input: &RuleInput<'_>) -> Option<Result<Vec<ValueType>>> {
    (input.node.op_type == "ConstantOfShape").then(|| Ok(input.all(input.ambient())))
}

fn shape_preserving(input: &RuleInput<'_>) -> Option<Result<Vec<ValueType>>> {
    matches!(input.node.op_type.as_str(), "Reshape" | "Transpose")
        .then(|| Ok(input.all(input.first_input())))
}

fn scan(input: &RuleInput<'_>) -> Option<Result<Vec<ValueType>>> {
    if input.node.op_type != "Scan" {
        return None;
    }
    if input.outputs != input.inputs.len() {
        return Some(Err(Error::dimension(format!(
            "Scan node '{}' has {} inputs but {} outputs",
            input.node.display_name(),
            input.inputs.len(),
            input.outputs
        ))));
    }
    Some(Ok(input.inputs.clone()))
}

fn passthrough(input: &RuleInput<'_>) -> Option<Result<Vec<ValueType>>> {
    (input.inputs.len() == 1 && input.outputs == 1).then(|| Ok(vec![input.first_input()]))
}

/// Infer the types of `output_names` produced by `node`.
///
/// `input_types` is positional with `node.inputs`; unknown entries default
/// to a tensor of the ambient `dtype`. Empty output names are skipped.
pub fn infer_output_types(
    node: &GraphNode,
    input_types: &[Option<ValueType>],
    output_names: &[String],
    dtype: DataType,
) -> Result<Vec<(String, ValueType)>> {
    let inputs = node
        .inputs
        .iter()
        .enumerate()
        .filter(|(_, name)| !name.is_empty())
        .map(|(i, _)| {
            input_types
                .get(i)
                .cloned()
                .flatten()
                .unwrap_or(ValueType::Tensor(dtype))
        })
        .collect();
    let input = RuleInput {
        node,
        inputs,
        outputs: output_names.len(),
        dtype,
    };

    let (rule, types) = RULES
        .iter()
        .find_map(|(rule, apply)| apply(&input).map(|types| (*rule, types)))
        .unwrap_or(("default", Ok(input.all(input.ambient()))));
    let types = types?;
    trace!(
        "Typed outputs of '{}' ({}) with the {} rule",
        node.display_name(),
        node.op_type,
        rule
    );

    Ok(output_names
        .iter()
        .zip(types)
        .filter(|(name, _)| !name.is_empty())
        .map(|(name, value_type)| (name.clone(), value_type))
        .collect())
}

/// Types of every value in `graph`, visiting nodes in `order`.
pub fn resolve_graph_types(
    graph: &ModelGraph,
    order: &[NodeId],
    dtype: DataType,
) -> Result<HashMap<String, ValueType>> {
    let mut types = graph.explicit_types();
    for &id in order {
        let node = &graph.nodes[id];
        let explicit = node
            .outputs
            .iter()
            .filter(|name| !name.is_empty())
            .all(|name| types.contains_key(name));
        if explicit {
            continue;
        }
        let input_types: Vec<Option<ValueType>> = node
            .inputs
            .iter()
            .map(|name| types.get(name).cloned())
            .collect();
        for (name, value_type) in infer_output_types(node, &input_types, &node.outputs, dtype)? {
            types.entry(name).or_insert(value_type);
        }
    }
    Ok(types)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlinfer_core::{GraphBuilder, ValueInfo};

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn infer(node: &GraphNode, inputs: &[Option<ValueType>]) -> Vec<ValueType> {
        infer_output_types(node, inputs, &node.outputs, DataType::F32)
            .unwrap()
            .into_iter()
            .map(|(_, t)| t)
            .collect()
    }

    #[test]
    fn test_cast_uses_target_type() {
        let node = GraphNode::new("Cast")
            .with_inputs(&["x"])
            .with_outputs(&["y"])
            .with_attribute("to", AttributeValue::Int(7));
        assert_eq!(
            infer(&node, &[Some(ValueType::Tensor(DataType::F32))]),
            vec![ValueType::Tensor(DataType::I64)]
        );
    }

    #[test]
    fn test_comparison_is_bool() {
        let node = GraphNode::new("Greater")
            .with_inputs(&["a", "b"])
            .with_outputs(&["c"]);
        assert_eq!(infer(&node, &[None, None]), vec![ValueType::Tensor(DataType::Bool)]);
    }

    #[test]
    fn test_classifier_labels_and_scores() {
        let node = GraphNode::new("TreeEnsembleClassifier")
            .with_inputs(&["x"])
            .with_outputs(&["label", "scores"])
            .with_attribute("classlabels_strings", AttributeValue::texts(&["a", "b"]));
        let types = infer_output_types(&node, &[None], &node.outputs, DataType::F64).unwrap();
        assert_eq!(types[0], ("label".to_string(), ValueType::Tensor(DataType::String)));
        assert_eq!(types[1], ("scores".to_string(), ValueType::Tensor(DataType::F64)));
    }

    #[test]
    fn test_zipmap_keys_are_strings_for_integer_labels() {
        let node = GraphNode::new("ZipMap")
            .with_inputs(&["scores"])
            .with_outputs(&["probabilities"])
            .with_attribute("classlabels_int64s", AttributeValue::Ints(vec![10, 2]));
        assert_eq!(
            infer(&node, &[Some(ValueType::Tensor(DataType::F32))]),
            vec![ValueType::Sequence(Box::new(ValueType::Map {
                key: DataType::String,
                value: Box::new(ValueType::Tensor(DataType::F64)),
            }))]
        );
    }

    #[test]
    fn test_topk_and_passthrough() {
        let topk = GraphNode::new("TopK")
            .with_inputs(&["x", "k"])
            .with_outputs(&["values", "indices"]);
        assert_eq!(
            infer(&topk, &[Some(ValueType::Tensor(DataType::I32)), None]),
            vec![
                ValueType::Tensor(DataType::I32),
                ValueType::Tensor(DataType::I64)
            ]
        );

        let relu = GraphNode::new("Relu").with_inputs(&["x"]).with_outputs(&["y"]);
        assert_eq!(
            infer(&relu, &[Some(ValueType::Tensor(DataType::F64))]),
            vec![ValueType::Tensor(DataType::F64)]
        );
    }

    #[test]
    fn test_default_is_ambient_float() {
        let node = GraphNode::new("Add")
            .with_inputs(&["a", "b"])
            .with_outputs(&["c"]);
        let types =
            infer_output_types(&node, &[None, None], &names(&["c"]), DataType::F64).unwrap();
        assert_eq!(types, vec![("c".to_string(), ValueType::Tensor(DataType::F64))]);
    }

    #[test]
    fn test_scan_needs_matching_counts() {
        let node = GraphNode::new("Scan")
            .with_inputs(&["s", "xs"])
            .with_outputs(&["s_final", "ys", "extra"]);
        let err = infer_output_types(&node, &[None, None], &node.outputs, DataType::F32)
            .unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch(_)));

        let node = GraphNode::new("Scan")
            .with_inputs(&["s", "xs"])
            .with_outputs(&["s_final", "ys"]);
        assert_eq!(
            infer(&node, &[Some(ValueType::Tensor(DataType::I64)), None]),
            vec![
                ValueType::Tensor(DataType::I64),
                ValueType::Tensor(DataType::F32)
            ]
        );
    }

    #[test]
    fn test_explicit_types_win() {
        let mut builder = GraphBuilder::new();
        builder
            .input(ValueInfo::tensor("x", DataType::F32))
            .output(ValueInfo::tensor("y", DataType::F64));
        let id = builder.add_op("Cast", &["x"], &["mid"]);
        builder.add_attribute(id, "to", AttributeValue::Int(7));
        builder.add_op("Relu", &["mid"], &["y"]);
        let graph = builder.build().unwrap();
        let order = graph.topological_sort().unwrap();

        let types = resolve_graph_types(&graph, &order, DataType::F32).unwrap();
        assert_eq!(types["mid"], ValueType::Tensor(DataType::I64));
        assert_eq!(types["y"], ValueType::Tensor(DataType::F64));
    }
}
