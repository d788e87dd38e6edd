//! Graph executor.
//!
//! A [`LoadedGraph`] is planned into an [`Executor`]: nodes are put in a
//! stable topological order, value types are resolved and one kernel is
//! built per node. Each [`Executor::run`] owns a fresh value table, so a
//! planned executor can be shared by concurrent runs.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use mlinfer_core::{ModelGraph, NodeId, Value, ValueType};
use mlinfer_onnx::ModelLoader;
use tracing::{debug, debug_span, info, info_span};

use crate::error::{Error, Result};
use crate::ops::OpKernel;
use crate::providers::{ExternalEngine, Provider, ReferenceEngine};
use crate::registry::{KernelContext, KernelRegistry};
use crate::session::SessionOptions;
use crate::shape_inference::resolve_graph_types;

/// What planning needs besides the graph.
#[derive(Clone)]
pub struct RuntimeEnv {
    /// Kernel registry.
    pub registry: Arc<KernelRegistry>,
    /// Provider selection, dtype and verbosity.
    pub options: SessionOptions,
    /// Engine used by delegated nodes.
    pub engine: Option<Arc<dyn ExternalEngine>>,
}

impl RuntimeEnv {
    /// Environment without an external engine.
    pub fn new(registry: Arc<KernelRegistry>, options: SessionOptions) -> Self {
        Self {
            registry,
            options,
            engine: None,
        }
    }

    /// Use `engine` for delegated nodes.
    pub fn with_engine(mut self, engine: Arc<dyn ExternalEngine>) -> Self {
        self.engine = Some(engine);
        self
    }
}

/// A graph that has been parsed but not planned.
#[derive(Debug, Clone)]
pub struct LoadedGraph {
    graph: Arc<ModelGraph>,
}

impl LoadedGraph {
    /// Wrap a parsed graph.
    pub fn new(graph: ModelGraph) -> Self {
        Self {
            graph: Arc::new(graph),
        }
    }

    /// Wrap a graph shared with other owners, such as a `Scan` body.
    pub fn from_shared(graph: Arc<ModelGraph>) -> Self {
        Self { graph }
    }

    /// Decode ONNX protobuf bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(Self::new(ModelLoader::load_from_bytes(bytes)?.into_graph()))
    }

    /// Read and decode an ONNX file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::new(ModelLoader::load_from_file(path)?.into_graph()))
    }

    /// The parsed graph.
    pub fn graph(&self) -> &ModelGraph {
        &self.graph
    }

    /// Order the nodes, resolve types and build every kernel.
    pub fn plan(&self, env: &RuntimeEnv) -> Result<Executor> {
        let graph = &self.graph;
        let span = info_span!(
            "plan",
            graph = graph.name.as_deref().unwrap_or("<graph>"),
            nodes = graph.node_count()
        );
        let _enter = span.enter();

        let order = graph.topological_sort()?;
        let producers = graph.producers();
        for output in &graph.outputs {
            if !producers.contains_key(output.name.as_str()) && !graph.is_external_value(&output.name)
            {
                return Err(Error::MissingValue {
                    name: output.name.clone(),
                    consumer: "graph outputs".to_string(),
                });
            }
        }

        let dtype = env.options.dtype();
        let static_types = resolve_graph_types(graph, &order, dtype)?;

        let needs_engine = env.engine.is_none()
            && graph
                .nodes
                .iter()
                .any(|node| env.options.provider_for(node) == Provider::Delegated);
        let env = if needs_engine {
            let engine = ReferenceEngine::new(Arc::clone(&env.registry), dtype);
            env.clone().with_engine(Arc::new(engine))
        } else {
            env.clone()
        };

        let mut steps = Vec::with_capacity(order.len());
        for &id in &order {
            let node = &graph.nodes[id];
            let provider = env.options.provider_for(node);
            let kernel = env
                .registry
                .resolve(&KernelContext::new(node, &env), provider)?;
            steps.push(Step {
                node: id,
                provider,
                kernel,
            });
        }

        let constants = graph
            .initializers
            .iter()
            .map(|(name, tensor)| (name.clone(), Value::Tensor(tensor.clone())))
            .collect();

        info!(
            "Planned {} nodes ({} constants, {} typed values)",
            steps.len(),
            graph.initializers.len(),
            static_types.len()
        );

        Ok(Executor {
            graph: Arc::clone(graph),
            steps,
            static_types,
            constants,
            verbose: env.options.verbose(),
        })
    }
}

struct Step {
    node: NodeId,
    provider: Provider,
    kernel: Box<dyn OpKernel>,
}

/// A planned graph, ready to run.
pub struct Executor {
    graph: Arc<ModelGraph>,
    steps: Vec<Step>,
    static_types: HashMap<String, ValueType>,
    constants: HashMap<String, Value>,
    verbose: bool,
}

impl Executor {
    /// The planned graph.
    pub fn graph(&self) -> &ModelGraph {
        &self.graph
    }

    /// Declared graph inputs.
    pub fn input_names(&self) -> Vec<&str> {
        self.graph.input_names()
    }

    /// Declared graph outputs.
    pub fn output_names(&self) -> Vec<&str> {
        self.graph.output_names()
    }

    /// Resolved static type of every value.
    pub fn static_types(&self) -> &HashMap<String, ValueType> {
        &self.static_types
    }

    /// Resolved static type of `name`.
    pub fn static_type(&self, name: &str) -> Option<&ValueType> {
        self.static_types.get(name)
    }

    /// Node ids in execution order.
    pub fn execution_order(&self) -> Vec<NodeId> {
        self.steps.iter().map(|step| step.node).collect()
    }

    /// Provider chosen for each node, in execution order.
    pub fn providers(&self) -> Vec<(NodeId, Provider)> {
        self.steps
            .iter()
            .map(|step| (step.node, step.provider))
            .collect()
    }

    /// Evaluate the graph.
    ///
    /// With `requested` set only the nodes those names depend on run, and
    /// exactly those names are returned. Otherwise every declared output
    /// is returned.
    pub fn run<I, K, V>(&self, inputs: I, requested: Option<&[&str]>) -> Result<HashMap<String, Value>>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let span = info_span!(
            "run",
            graph = self.graph.name.as_deref().unwrap_or("<graph>")
        );
        let _enter = span.enter();

        let mut values: HashMap<String, Value> = HashMap::new();
        for (name, value) in inputs {
            let name = name.into();
            if self.graph.inputs.iter().any(|info| info.name == name) {
                values.insert(name, value.into());
            } else {
                debug!("Ignoring input '{}' that the graph does not declare", name);
            }
        }
        for info in &self.graph.inputs {
            if !values.contains_key(&info.name) && !self.constants.contains_key(&info.name) {
                return Err(Error::MissingValue {
                    name: info.name.clone(),
                    consumer: "graph inputs".to_string(),
                });
            }
        }

        let (targets, closure): (Vec<&str>, Option<BTreeSet<NodeId>>) = match requested {
            Some(names) => (names.to_vec(), Some(self.graph.dependency_closure(names)?)),
            None => (self.graph.output_names(), None),
        };

        for step in &self.steps {
            if closure.as_ref().is_some_and(|c| !c.contains(&step.node)) {
                continue;
            }
            self.run_step(step, &mut values)?;
        }

        let mut outputs = HashMap::with_capacity(targets.len());
        for name in targets {
            let value = match values.remove(name) {
                Some(value) => value,
                None => outputs
                    .get(name)
                    .or_else(|| self.constants.get(name))
                    .cloned()
                    .ok_or_else(|| Error::MissingValue {
                        name: name.to_string(),
                        consumer: "requested outputs".to_string(),
                    })?,
            };
            outputs.insert(name.to_string(), value);
        }
        debug!("Run completed with {} outputs", outputs.len());
        Ok(outputs)
    }

    fn run_step(&self, step: &Step, values: &mut HashMap<String, Value>) -> Result<()> {
        let node = &self.graph.nodes[step.node];
        let span = debug_span!("node", name = %node.display_name(), op = %node.op_type);
        let _enter = span.enter();

        let started = Instant::now();
        let (produced, input_summary) = {
            let mut args: Vec<&Value> = Vec::with_capacity(node.inputs.len());
            for name in node.inputs.iter().filter(|name| !name.is_empty()) {
                let value = values
                    .get(name)
                    .or_else(|| self.constants.get(name))
                    .ok_or_else(|| Error::MissingValue {
                        name: name.clone(),
                        consumer: format!("'{}'", node.display_name()),
                    })?;
                args.push(value);
            }
            let summary = self.verbose.then(|| describe(args.iter().copied()));
            let produced = step
                .kernel
                .execute(&args)
                .map_err(|source| Error::KernelExecutionError {
                    node_name: node.display_name(),
                    op_type: node.op_type.clone(),
                    source: Box::new(source),
                })?;
            (produced, summary)
        };

        if let Some(inputs) = input_summary {
            info!(
                "{} ({}) via {}: [{}] -> [{}] in {:?}",
                node.display_name(),
                node.op_type,
                step.provider,
                inputs,
                describe(produced.iter()),
                started.elapsed()
            );
        }

        for (name, value) in node.outputs.iter().zip(produced) {
            if !name.is_empty() {
                values.insert(name.clone(), value);
            }
        }
        Ok(())
    }
}

fn describe<'a>(values: impl Iterator<Item = &'a Value>) -> String {
    values
        .map(|value| value.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
