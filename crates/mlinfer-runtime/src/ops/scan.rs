// Scan: run a body graph once per slice of the scanned inputs

use std::collections::HashMap;

use mlinfer_core::{with_element_type, AttributeKind, DataType, Tensor, Value, ValueType};
use tracing::debug;

use super::OpKernel;
use crate::attributes::{AttributeSchema, BoundAttributes};
use crate::error::{Error, Result};
use crate::executor::{Executor, LoadedGraph};
use crate::registry::{Arity, KernelContext, KernelDescriptor, KernelRegistry};

const DIRECTION_ATTRIBUTES: [&str; 4] = [
    "scan_input_axes",
    "scan_input_directions",
    "scan_output_axes",
    "scan_output_directions",
];

pub(super) fn register(registry: &mut KernelRegistry) {
    let mut schema = AttributeSchema::new().required("num_scan_inputs", AttributeKind::Int);
    for name in DIRECTION_ATTRIBUTES {
        schema = schema.ints(name, &[]);
    }
    registry.register(
        KernelDescriptor::new(
            "Scan",
            "",
            Arity::Fixed {
                inputs: (1, usize::MAX),
                outputs: (1, usize::MAX),
            },
            |ctx, attrs| Ok(Box::new(ScanKernel::new(ctx, &attrs)?)),
        )
        .with_schema(schema),
    );
}

/// Loop over the leading axis of the scanned inputs.
///
/// Inputs are `N` loop-carried states followed by `M` scanned tensors. The
/// body receives the states and one slice of each scanned tensor; its first
/// `N` outputs become the next states and the rest are collected per
/// iteration and stacked along a new leading axis.
pub struct ScanKernel {
    node_name: String,
    body: Executor,
    num_state: usize,
    body_inputs: Vec<String>,
    body_outputs: Vec<String>,
    scan_output_types: Vec<DataType>,
}

impl ScanKernel {
    /// Validate the attributes and plan the body in the outer environment.
    pub fn new(ctx: &KernelContext<'_>, attrs: &BoundAttributes) -> Result<Self> {
        let node_name = ctx.node.display_name();
        let body_error = |reason: String| Error::ScanBody {
            node: node_name.clone(),
            reason,
        };

        let graph = attrs
            .graph("body")
            .ok_or_else(|| body_error("the 'body' attribute is missing or not a graph".to_string()))?;
        let num_scan_inputs = attrs
            .int("num_scan_inputs")
            .ok_or_else(|| ctx.missing_attribute("num_scan_inputs"))?;
        for name in DIRECTION_ATTRIBUTES {
            if attrs.ints(name).unwrap_or_default().iter().any(|&v| v != 0) {
                return Err(ctx.unsupported(format!("{name} other than 0 is not supported")));
            }
        }

        let inputs = ctx.node.inputs.iter().filter(|name| !name.is_empty()).count();
        let num_scan_inputs = usize::try_from(num_scan_inputs)
            .ok()
            .filter(|&m| m >= 1 && m <= inputs)
            .ok_or_else(|| {
                ctx.unsupported(format!(
                    "num_scan_inputs={num_scan_inputs} with {inputs} inputs"
                ))
            })?;
        let num_state = inputs - num_scan_inputs;

        if graph.inputs.len() != inputs {
            return Err(body_error(format!(
                "body declares {} inputs but the node has {num_state} states and {num_scan_inputs} scanned inputs",
                graph.inputs.len()
            )));
        }
        if graph.outputs.len() < num_state {
            return Err(body_error(format!(
                "body declares {} outputs for {num_state} states",
                graph.outputs.len()
            )));
        }
        if ctx.node.outputs.len() != graph.outputs.len() {
            return Err(body_error(format!(
                "body declares {} outputs but the node has {}",
                graph.outputs.len(),
                ctx.node.outputs.len()
            )));
        }

        let scan_output_types = graph.outputs[num_state..]
            .iter()
            .map(|info| {
                info.value_type
                    .as_ref()
                    .and_then(ValueType::tensor_elem)
                    .unwrap_or(DataType::F32)
            })
            .collect();
        let body_inputs = graph.inputs.iter().map(|info| info.name.clone()).collect();
        let body_outputs = graph.outputs.iter().map(|info| info.name.clone()).collect();

        let body = LoadedGraph::from_shared(graph)
            .plan(ctx.env)
            .map_err(|err| body_error(format!("cannot plan body: {err}")))?;
        debug!(
            "Planned Scan body of '{}' with {} states and {} scanned inputs",
            node_name, num_state, num_scan_inputs
        );

        Ok(Self {
            node_name,
            body,
            num_state,
            body_inputs,
            body_outputs,
            scan_output_types,
        })
    }

    /// The planned body.
    pub fn body(&self) -> &Executor {
        &self.body
    }

    /// Number of loop-carried states.
    pub fn num_state(&self) -> usize {
        self.num_state
    }

    fn body_output(&self, produced: &HashMap<String, Value>, name: &str) -> Result<Value> {
        produced.get(name).cloned().ok_or_else(|| Error::MissingValue {
            name: name.to_string(),
            consumer: format!("Scan node '{}'", self.node_name),
        })
    }
}

impl OpKernel for ScanKernel {
    fn op_type(&self) -> &str {
        "Scan"
    }

    fn execute(&self, inputs: &[&Value]) -> Result<Vec<Value>> {
        if inputs.len() != self.body_inputs.len() {
            return Err(Error::dimension(format!(
                "Scan body takes {} inputs, got {}",
                self.body_inputs.len(),
                inputs.len()
            )));
        }
        let (states, scanned) = inputs.split_at(self.num_state);
        let scanned = scanned
            .iter()
            .map(|value| value.as_tensor())
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let length = scanned
            .first()
            .and_then(|t| t.shape().first().copied())
            .ok_or_else(|| Error::dimension("Scan inputs need a leading iteration axis"))?;
        if let Some(t) = scanned.iter().find(|t| t.shape().first() != Some(&length)) {
            return Err(Error::dimension(format!(
                "Scan inputs disagree on the iteration count: {length} vs {:?}",
                t.shape()
            )));
        }

        let mut state: Vec<Value> = states.iter().map(|&v| v.clone()).collect();
        let mut collected: Vec<Vec<Tensor>> =
            vec![Vec::with_capacity(length); self.scan_output_types.len()];
        for i in 0..length {
            let mut feed = Vec::with_capacity(self.body_inputs.len());
            for (name, value) in self.body_inputs.iter().zip(state.drain(..)) {
                feed.push((name.clone(), value));
            }
            for (name, tensor) in self.body_inputs[self.num_state..].iter().zip(&scanned) {
                feed.push((name.clone(), Value::Tensor(tensor.index_axis0(i)?)));
            }

            let produced = self.body.run(feed, None)?;
            let (state_names, scan_names) = self.body_outputs.split_at(self.num_state);
            for name in state_names {
                state.push(self.body_output(&produced, name)?);
            }
            for (slot, name) in collected.iter_mut().zip(scan_names) {
                slot.push(self.body_output(&produced, name)?.into_tensor()?);
            }
        }
        debug!("Scan '{}' ran {} iterations", self.node_name, length);

        let mut outputs = state;
        for (slices, &dtype) in collected.iter().zip(&self.scan_output_types) {
            let stacked = if slices.is_empty() {
                with_element_type!(dtype, T => Tensor::empty::<T>(&[0])?)
            } else {
                Tensor::stack(slices)?
            };
            outputs.push(Value::Tensor(stacked));
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use mlinfer_core::{AttributeValue, GraphBuilder, GraphNode, ModelGraph, ValueInfo};

    use crate::executor::RuntimeEnv;
    use crate::providers::Provider;
    use crate::session::SessionOptions;

    /// `s_out = s + x`, also emitted as the scan output `y`.
    fn accumulate_body() -> ModelGraph {
        let mut builder = GraphBuilder::new();
        builder
            .input(ValueInfo::tensor("s", DataType::F32))
            .input(ValueInfo::tensor("x", DataType::F32))
            .output(ValueInfo::tensor("s_out", DataType::F32))
            .output(ValueInfo::tensor("y", DataType::F32));
        builder.add_op("Add", &["s", "x"], &["s_out"]);
        builder.add_op("Identity", &["s_out"], &["y"]);
        builder.build().unwrap()
    }

    fn scan_node(body: ModelGraph) -> GraphNode {
        GraphNode::new("Scan")
            .with_name("loop")
            .with_inputs(&["s0", "xs"])
            .with_outputs(&["s_final", "ys"])
            .with_attribute("num_scan_inputs", AttributeValue::Int(1))
            .with_attribute("body", AttributeValue::Graph(Arc::new(body)))
    }

    fn build(node: &GraphNode) -> Result<Box<dyn OpKernel>> {
        let registry = Arc::new(KernelRegistry::with_builtin());
        let env = RuntimeEnv::new(Arc::clone(&registry), SessionOptions::new());
        registry.resolve(&KernelContext::new(node, &env), Provider::Cpu)
    }

    #[test]
    fn test_running_sum() {
        let kernel = build(&scan_node(accumulate_body())).unwrap();
        let s0 = Value::from(Tensor::from_vec(vec![1], vec![0.0f32]).unwrap());
        let xs = Value::from(Tensor::from_vec(vec![3, 1], vec![1.0f32, 2.0, 3.0]).unwrap());

        let out = kernel.execute(&[&s0, &xs]).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_tensor().unwrap().to_f64_vec().unwrap(), vec![6.0]);
        let ys = out[1].as_tensor().unwrap();
        assert_eq!(ys.shape(), &[3, 1]);
        assert_eq!(ys.to_f64_vec().unwrap(), vec![1.0, 3.0, 6.0]);
    }

    #[test]
    fn test_zero_iterations() {
        let kernel = build(&scan_node(accumulate_body())).unwrap();
        let s0 = Value::from(Tensor::from_vec(vec![1], vec![5.0f32]).unwrap());
        let xs = Value::from(Tensor::empty::<f32>(&[0, 1]).unwrap());

        let out = kernel.execute(&[&s0, &xs]).unwrap();
        assert_eq!(out[0], s0);
        let ys = out[1].as_tensor().unwrap();
        assert_eq!(ys.shape(), &[0]);
        assert_eq!(ys.dtype(), DataType::F32);
    }

    #[test]
    fn test_mismatched_iteration_counts() {
        let mut body = accumulate_body();
        body.inputs.push(ValueInfo::tensor("z", DataType::F32));
        let node = scan_node(body)
            .with_inputs(&["s0", "xs", "zs"])
            .with_attribute("num_scan_inputs", AttributeValue::Int(2));
        let kernel = build(&node).unwrap();

        let s0 = Value::from(Tensor::from_vec(vec![1], vec![0.0f32]).unwrap());
        let xs = Value::from(Tensor::from_vec(vec![2], vec![1.0f32, 2.0]).unwrap());
        let zs = Value::from(Tensor::from_vec(vec![3], vec![1.0f32, 2.0, 3.0]).unwrap());
        let err = kernel.execute(&[&s0, &xs, &zs]).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch(_)));
    }

    #[test]
    fn test_body_interface_is_checked() {
        let node = scan_node(accumulate_body()).with_inputs(&["xs"]);
        let err = build(&node).err().unwrap();
        assert!(matches!(err, Error::ScanBody { .. }));

        let missing = GraphNode::new("Scan")
            .with_inputs(&["s0", "xs"])
            .with_outputs(&["s_final", "ys"])
            .with_attribute("num_scan_inputs", AttributeValue::Int(1));
        assert!(matches!(build(&missing).err().unwrap(), Error::ScanBody { .. }));
    }

    #[test]
    fn test_node_outputs_must_match_body_outputs() {
        let node = scan_node(accumulate_body()).with_outputs(&["s_final"]);
        match build(&node).err().unwrap() {
            Error::ScanBody { node, reason } => {
                assert_eq!(node, "loop");
                assert!(reason.contains("2 outputs"), "{reason}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_reverse_direction_is_unsupported() {
        let node = scan_node(accumulate_body())
            .with_attribute("scan_input_directions", AttributeValue::Ints(vec![1]));
        let err = build(&node).err().unwrap();
        assert!(matches!(err, Error::UnsupportedConfiguration { .. }));
    }
}
