use std::collections::HashMap;
use std::sync::Arc;

use mlinfer_core::{GraphNode, ModelGraph, Value, ValueInfo};
use tracing::debug;

use super::{EngineHandle, ExternalEngine};
use crate::error::{Error, Result};
use crate::ops::OpKernel;

/// Kernel that forwards one node to an [`ExternalEngine`].
///
/// The node is wrapped in a single-node graph and loaded into the engine
/// once, when the kernel is built.
pub struct DelegatedKernel {
    engine: Arc<dyn ExternalEngine>,
    handle: EngineHandle,
    op_type: String,
    inputs: Vec<String>,
    outputs: Vec<String>,
}

impl DelegatedKernel {
    /// Load `node` into `engine`.
    pub fn new(node: &GraphNode, engine: Arc<dyn ExternalEngine>) -> Result<Self> {
        let inputs: Vec<String> = node
            .inputs
            .iter()
            .filter(|name| !name.is_empty())
            .cloned()
            .collect();

        let mut graph = ModelGraph::new();
        graph.name = Some(node.display_name());
        let mut declared: Vec<&String> = Vec::new();
        for name in &inputs {
            if !declared.contains(&name) {
                declared.push(name);
                graph.inputs.push(ValueInfo::new(name.clone()));
            }
        }
        graph.outputs = node
            .outputs
            .iter()
            .filter(|name| !name.is_empty())
            .map(|name| ValueInfo::new(name.clone()))
            .collect();
        graph.add_node(node.clone());

        let handle = engine
            .load(&graph)
            .map_err(|err| Error::UnsupportedConfiguration {
                node: node.display_name(),
                op_type: node.op_type.clone(),
                reason: format!("engine '{}' could not load the node: {err:#}", engine.name()),
            })?;
        debug!(
            "Delegated node '{}' ({}) to engine '{}'",
            node.display_name(),
            node.op_type,
            engine.name()
        );

        Ok(Self {
            engine,
            handle,
            op_type: node.op_type.clone(),
            inputs,
            outputs: node.outputs.clone(),
        })
    }
}

impl OpKernel for DelegatedKernel {
    fn op_type(&self) -> &str {
        &self.op_type
    }

    fn execute(&self, inputs: &[&Value]) -> Result<Vec<Value>> {
        if inputs.len() != self.inputs.len() {
            return Err(Error::dimension(format!(
                "delegated {} expects {} inputs, got {}",
                self.op_type,
                self.inputs.len(),
                inputs.len()
            )));
        }
        let feed: HashMap<String, Value> = self
            .inputs
            .iter()
            .cloned()
            .zip(inputs.iter().map(|v| (*v).clone()))
            .collect();

        let mut produced = self.engine.execute(self.handle, feed)?;
        self.outputs
            .iter()
            .map(|name| {
                if name.is_empty() {
                    // Placeholder for an omitted optional output; never stored.
                    return Ok(Value::Sequence(Vec::new()));
                }
                produced.remove(name).ok_or_else(|| Error::MissingValue {
                    name: name.clone(),
                    consumer: format!("engine '{}'", self.engine.name()),
                })
            })
            .collect()
    }
}

impl Drop for DelegatedKernel {
    fn drop(&mut self) {
        self.engine.release(self.handle);
    }
}
