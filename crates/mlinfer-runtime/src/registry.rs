//! Operator kernel registry.
//!
//! Kernels are registered as [`KernelDescriptor`]s keyed by canonical domain
//! and operator name. Resolving a node checks the descriptor's arity, binds
//! the node's attributes against its schema and calls its constructor, or
//! wraps the node in a [`DelegatedKernel`] for the delegated provider.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use mlinfer_core::{canonical_domain, DataType, GraphNode};
use tracing::{debug, info, warn};

use crate::attributes::{AttributeSchema, BoundAttributes};
use crate::error::{Error, Result};
use crate::executor::RuntimeEnv;
use crate::ops::{self, OpKernel};
use crate::providers::{DelegatedKernel, ExternalEngine, Provider};

/// Number of inputs and outputs a kernel accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    /// One input, one output.
    Unary,
    /// Two inputs, one output.
    Binary,
    /// At least `min` inputs, one output.
    Variadic {
        /// Minimum number of inputs.
        min: usize,
    },
    /// Inclusive input and output ranges.
    Fixed {
        /// Minimum and maximum inputs.
        inputs: (usize, usize),
        /// Minimum and maximum outputs.
        outputs: (usize, usize),
    },
}

impl Arity {
    fn ranges(self) -> ((usize, usize), (usize, usize)) {
        match self {
            Arity::Unary => ((1, 1), (1, 1)),
            Arity::Binary => ((2, 2), (1, 1)),
            Arity::Variadic { min } => ((min, usize::MAX), (1, 1)),
            Arity::Fixed { inputs, outputs } => (inputs, outputs),
        }
    }

    /// Check a node's inputs and outputs against this arity.
    ///
    /// Empty names count towards the positional maximum but not towards the
    /// minimum, since they mark omitted optional slots.
    pub fn check(self, node: &GraphNode) -> std::result::Result<(), String> {
        let ((in_min, in_max), (out_min, out_max)) = self.ranges();
        let present = |names: &[String]| names.iter().filter(|n| !n.is_empty()).count();

        let inputs = present(&node.inputs);
        if inputs < in_min || node.inputs.len() > in_max {
            return Err(format!(
                "expects {} inputs, got {}",
                describe_range(in_min, in_max),
                inputs
            ));
        }
        let outputs = present(&node.outputs);
        if outputs < out_min || node.outputs.len() > out_max {
            return Err(format!(
                "expects {} outputs, got {}",
                describe_range(out_min, out_max),
                outputs
            ));
        }
        Ok(())
    }
}

fn describe_range(min: usize, max: usize) -> String {
    if min == max {
        min.to_string()
    } else if max == usize::MAX {
        format!("at least {min}")
    } else {
        format!("{min} to {max}")
    }
}

/// Everything a kernel constructor may look at.
pub struct KernelContext<'a> {
    /// The node being resolved.
    pub node: &'a GraphNode,
    /// Registry, options and engine of the executor being planned.
    pub env: &'a RuntimeEnv,
}

impl<'a> KernelContext<'a> {
    /// Context for `node` under `env`.
    pub fn new(node: &'a GraphNode, env: &'a RuntimeEnv) -> Self {
        Self { node, env }
    }

    /// Ambient floating point type.
    pub fn dtype(&self) -> DataType {
        self.env.options.dtype()
    }

    /// An [`Error::UnsupportedConfiguration`] for this node.
    pub fn unsupported(&self, reason: impl Into<String>) -> Error {
        Error::UnsupportedConfiguration {
            node: self.node.display_name(),
            op_type: self.node.op_type.clone(),
            reason: reason.into(),
        }
    }

    /// An [`Error::MissingAttribute`] for this node.
    pub fn missing_attribute(&self, attribute: &str) -> Error {
        Error::MissingAttribute {
            node: self.node.display_name(),
            op_type: self.node.op_type.clone(),
            attribute: attribute.to_string(),
        }
    }
}

/// Kernel constructor stored in a descriptor.
pub type KernelBuilder =
    Arc<dyn Fn(&KernelContext<'_>, BoundAttributes) -> Result<Box<dyn OpKernel>> + Send + Sync>;

/// Registration record of one operator.
#[derive(Clone)]
pub struct KernelDescriptor {
    /// Operator name.
    pub op_type: String,
    /// Canonical domain.
    pub domain: String,
    /// Declared attributes.
    pub schema: AttributeSchema,
    /// Accepted input and output counts.
    pub arity: Arity,
    /// Constructor.
    pub build: KernelBuilder,
}

impl KernelDescriptor {
    /// Descriptor with an empty schema.
    pub fn new<F>(op_type: &str, domain: &str, arity: Arity, build: F) -> Self
    where
        F: Fn(&KernelContext<'_>, BoundAttributes) -> Result<Box<dyn OpKernel>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            op_type: op_type.to_string(),
            domain: canonical_domain(domain).to_string(),
            schema: AttributeSchema::new(),
            arity,
            build: Arc::new(build),
        }
    }

    /// Replace the attribute schema.
    pub fn with_schema(mut self, schema: AttributeSchema) -> Self {
        self.schema = schema;
        self
    }
}

impl fmt::Debug for KernelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelDescriptor")
            .field("op_type", &self.op_type)
            .field("domain", &self.domain)
            .field("arity", &self.arity)
            .finish_non_exhaustive()
    }
}

/// Registry key: canonical domain and operator name.
pub type OperatorKey = (String, String);

/// Registry of kernel descriptors.
#[derive(Debug, Default)]
pub struct KernelRegistry {
    kernels: HashMap<OperatorKey, KernelDescriptor>,
}

impl KernelRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in kernel.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        ops::register_builtin(&mut registry);
        info!("Registered {} built-in kernels", registry.len());
        registry
    }

    /// Add a descriptor, replacing any previous one with the same key.
    pub fn register(&mut self, descriptor: KernelDescriptor) {
        let key = (descriptor.domain.clone(), descriptor.op_type.clone());
        if let Some(previous) = self.kernels.insert(key, descriptor) {
            warn!(
                "Replaced kernel for '{}' in domain '{}'",
                previous.op_type, previous.domain
            );
        }
    }

    /// Descriptor for `op_type` in `domain`.
    pub fn get(&self, op_type: &str, domain: &str) -> Option<&KernelDescriptor> {
        self.kernels
            .get(&(canonical_domain(domain).to_string(), op_type.to_string()))
    }

    /// Whether a kernel is registered for `op_type` in `domain`.
    pub fn is_supported(&self, op_type: &str, domain: &str) -> bool {
        self.get(op_type, domain).is_some()
    }

    /// Number of registered kernels.
    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    /// Whether no kernel is registered.
    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    /// Sorted keys resolvable under `provider`.
    ///
    /// For the delegated provider the keys are filtered by what `engine`
    /// reports as supported.
    pub fn supported_operators(
        &self,
        provider: Provider,
        engine: Option<&dyn ExternalEngine>,
    ) -> Vec<OperatorKey> {
        let mut keys: Vec<OperatorKey> = self
            .kernels
            .keys()
            .filter(|(domain, op)| match (provider, engine) {
                (Provider::Delegated, Some(engine)) => engine.supports(op, domain),
                _ => true,
            })
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Build the kernel for `ctx.node` under `provider`.
    pub fn resolve(&self, ctx: &KernelContext<'_>, provider: Provider) -> Result<Box<dyn OpKernel>> {
        let node = ctx.node;
        let domain = canonical_domain(&node.domain);
        let unknown = || Error::UnknownOperator {
            op_type: node.op_type.clone(),
            domain: domain.to_string(),
            provider: provider.to_string(),
        };

        match provider {
            Provider::Cpu => {
                let descriptor = self.get(&node.op_type, domain).ok_or_else(unknown)?;
                descriptor
                    .arity
                    .check(node)
                    .map_err(|reason| ctx.unsupported(reason))?;
                let attributes = descriptor.schema.bind(node)?;
                debug!(
                    "Resolved '{}' ({}) to the cpu kernel",
                    node.display_name(),
                    node.op_type
                );
                (descriptor.build)(ctx, attributes)
            }
            Provider::Delegated => {
                let engine = ctx
                    .env
                    .engine
                    .as_ref()
                    .ok_or_else(|| Error::UnsupportedProvider(provider.to_string()))?;
                if !engine.supports(&node.op_type, domain) {
                    return Err(unknown());
                }
                if let Some(descriptor) = self.get(&node.op_type, domain) {
                    descriptor
                        .arity
                        .check(node)
                        .map_err(|reason| ctx.unsupported(reason))?;
                    descriptor.schema.bind(node)?;
                }
                Ok(Box::new(DelegatedKernel::new(node, Arc::clone(engine))?))
            }
        }
    }
}
