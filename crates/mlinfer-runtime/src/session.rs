use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use mlinfer_core::{CoreError, DataType, GraphNode, ModelGraph, Value, ValueType};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::executor::{Executor, LoadedGraph, RuntimeEnv};
use crate::providers::{ExternalEngine, Provider, ReferenceEngine};
use crate::registry::{KernelRegistry, OperatorKey};

/// Options for configuring an inference session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    provider: Provider,
    node_providers: BTreeMap<String, Provider>,
    dtype: DataType,
    verbose: bool,
}

impl SessionOptions {
    /// Create new session options with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default execution provider
    pub fn with_provider(mut self, provider: Provider) -> Self {
        self.provider = provider;
        self
    }

    /// Override the provider of the node called `node_name`
    pub fn with_node_provider(mut self, node_name: impl Into<String>, provider: Provider) -> Self {
        self.node_providers.insert(node_name.into(), provider);
        self
    }

    /// Set the ambient floating point type (float or double)
    pub fn with_dtype(mut self, dtype: DataType) -> Self {
        self.dtype = dtype;
        self
    }

    /// Log every node's shapes and timing at INFO
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Get the default provider
    pub fn provider(&self) -> Provider {
        self.provider
    }

    /// Get the per-node provider overrides
    pub fn node_providers(&self) -> &BTreeMap<String, Provider> {
        &self.node_providers
    }

    /// Get the ambient floating point type
    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    /// Whether verbose node logging is on
    pub fn verbose(&self) -> bool {
        self.verbose
    }

    /// Provider used for `node`: its override if any, else the default.
    pub fn provider_for(&self, node: &GraphNode) -> Provider {
        node.name
            .as_ref()
            .and_then(|name| self.node_providers.get(name))
            .copied()
            .unwrap_or(self.provider)
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            provider: Provider::Cpu,
            node_providers: BTreeMap::new(),
            dtype: DataType::F32,
            verbose: false,
        }
    }
}

/// Builder for creating inference sessions
pub struct SessionBuilder {
    graph: LoadedGraph,
    options: SessionOptions,
    registry: Option<Arc<KernelRegistry>>,
    engine: Option<Arc<dyn ExternalEngine>>,
}

impl SessionBuilder {
    /// Create a new session builder for a parsed graph
    pub fn new(graph: ModelGraph) -> Self {
        Self::from_loaded(LoadedGraph::new(graph))
    }

    /// Create a new session builder for a loaded graph
    pub fn from_loaded(graph: LoadedGraph) -> Self {
        Self {
            graph,
            options: SessionOptions::default(),
            registry: None,
            engine: None,
        }
    }

    /// Decode ONNX protobuf bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(Self::from_loaded(LoadedGraph::from_bytes(bytes)?))
    }

    /// Read and decode an ONNX file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::from_loaded(LoadedGraph::from_file(path)?))
    }

    /// Set session options
    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    /// Resolve kernels from a custom registry instead of the built-in one
    pub fn with_registry(mut self, registry: Arc<KernelRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Forward delegated nodes to `engine`
    pub fn with_engine(mut self, engine: Arc<dyn ExternalEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Build the inference session
    pub fn build(self) -> Result<Session> {
        info!("Building session with options: {:?}", self.options);

        let dtype = self.options.dtype();
        if !dtype.is_float() {
            return Err(Error::Core(CoreError::InvalidArgument(format!(
                "computation dtype must be float or double, got {dtype}"
            ))));
        }

        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(KernelRegistry::with_builtin()));
        let engine = match self.engine {
            Some(engine) => engine,
            None => Arc::new(ReferenceEngine::new(Arc::clone(&registry), dtype)),
        };
        info!(
            "Using provider '{}' with engine '{}' ({} node overrides)",
            self.options.provider(),
            engine.name(),
            self.options.node_providers().len()
        );

        let env = RuntimeEnv::new(registry, self.options).with_engine(engine);
        let executor = self.graph.plan(&env)?;
        Ok(Session { executor, env })
    }
}

/// A planned graph together with the environment it was planned in.
///
/// `Session` is `Send + Sync`; concurrent calls to [`Session::run`] do not
/// share any state.
pub struct Session {
    executor: Executor,
    env: RuntimeEnv,
}

impl Session {
    /// Plan `graph` with default options
    pub fn new(graph: ModelGraph) -> Result<Self> {
        SessionBuilder::new(graph).build()
    }

    /// Plan `graph` with `options`
    pub fn with_options(graph: ModelGraph, options: SessionOptions) -> Result<Self> {
        SessionBuilder::new(graph).with_options(options).build()
    }

    /// Decode ONNX bytes and plan them with `options`
    pub fn from_bytes(bytes: &[u8], options: SessionOptions) -> Result<Self> {
        SessionBuilder::from_bytes(bytes)?.with_options(options).build()
    }

    /// Read an ONNX file and plan it with `options`
    pub fn from_file<P: AsRef<Path>>(path: P, options: SessionOptions) -> Result<Self> {
        SessionBuilder::from_file(path)?.with_options(options).build()
    }

    /// Run inference synchronously
    ///
    /// # Example
    /// ```
    /// use mlinfer_core::{DataType, GraphBuilder, Tensor, ValueInfo};
    /// use mlinfer_runtime::Session;
    ///
    /// let mut builder = GraphBuilder::new();
    /// builder
    ///     .input(ValueInfo::tensor("x", DataType::F32))
    ///     .output(ValueInfo::tensor("y", DataType::F32));
    /// builder.add_op("Relu", &["x"], &["y"]);
    /// let session = Session::new(builder.build()?)?;
    ///
    /// let x = Tensor::from_vec(vec![3], vec![-1.0f32, 0.0, 2.0])?;
    /// let outputs = session.run([("x", x)], None)?;
    /// assert_eq!(outputs["y"].as_tensor()?.to_f64_vec()?, vec![0.0, 0.0, 2.0]);
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn run<I, K, V>(&self, inputs: I, requested: Option<&[&str]>) -> Result<HashMap<String, Value>>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        self.executor.run(inputs, requested)
    }

    /// Run inference on a batch of inputs, one run per entry
    pub fn run_batch(
        &self,
        batch: Vec<HashMap<String, Value>>,
    ) -> Result<Vec<HashMap<String, Value>>> {
        debug!("Running batch of {} input sets", batch.len());
        batch
            .into_iter()
            .map(|inputs| self.executor.run(inputs, None))
            .collect()
    }

    /// Declared graph inputs
    pub fn input_names(&self) -> Vec<&str> {
        self.executor.input_names()
    }

    /// Declared graph outputs
    pub fn output_names(&self) -> Vec<&str> {
        self.executor.output_names()
    }

    /// Resolved static type of every value
    pub fn static_types(&self) -> &HashMap<String, ValueType> {
        self.executor.static_types()
    }

    /// Get session options
    pub fn options(&self) -> &SessionOptions {
        &self.env.options
    }

    /// The planned executor
    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Operators resolvable under `provider` in this session
    pub fn supported_operators(&self, provider: Provider) -> Vec<OperatorKey> {
        self.env
            .registry
            .supported_operators(provider, self.env.engine.as_deref())
    }
}
