use mlinfer_core::{AttributeKind, CoreError};
use mlinfer_onnx::OnnxError;
use thiserror::Error;

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while resolving kernels, planning or running a graph.
#[derive(Error, Debug)]
pub enum Error {
    /// No kernel is registered for the operator under the chosen provider.
    #[error("Unknown operator '{op_type}' in domain '{domain}' for provider '{provider}'")]
    UnknownOperator {
        /// Operator name.
        op_type: String,
        /// Canonical domain.
        domain: String,
        /// Provider that was asked.
        provider: String,
    },

    /// The provider name is not recognised.
    #[error("Unsupported provider '{0}'")]
    UnsupportedProvider(String),

    /// A present attribute cannot be coerced to the declared kind.
    #[error(
        "Attribute '{attribute}' of node '{node}' ({op_type}) must be {expected}, found {found}"
    )]
    AttributeTypeError {
        /// Node name.
        node: String,
        /// Operator type.
        op_type: String,
        /// Attribute name.
        attribute: String,
        /// Kind the schema declares.
        expected: AttributeKind,
        /// Kind stored in the graph.
        found: AttributeKind,
    },

    /// A required attribute is absent.
    #[error("Node '{node}' ({op_type}) is missing required attribute '{attribute}'")]
    MissingAttribute {
        /// Node name.
        node: String,
        /// Operator type.
        op_type: String,
        /// Attribute name.
        attribute: String,
    },

    /// Attribute values the kernel does not implement.
    #[error("Unsupported configuration for node '{node}' ({op_type}): {reason}")]
    UnsupportedConfiguration {
        /// Node name.
        node: String,
        /// Operator type.
        op_type: String,
        /// What is unsupported.
        reason: String,
    },

    /// A `Scan` body is missing, malformed or incompatible with the node.
    #[error("Invalid Scan body for node '{node}': {reason}")]
    ScanBody {
        /// Node name.
        node: String,
        /// What is wrong with the body.
        reason: String,
    },

    /// The graph has no topological order.
    #[error("Graph contains a cycle through nodes {nodes:?}")]
    CyclicGraphError {
        /// Nodes that could not be scheduled.
        nodes: Vec<String>,
    },

    /// A value name is not defined where it is needed.
    #[error("Missing value '{name}' needed by {consumer}")]
    MissingValue {
        /// The undefined name.
        name: String,
        /// Who needed it: a node, or the caller for graph inputs and outputs.
        consumer: String,
    },

    /// Input shapes or counts do not fit the operation.
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// A kernel failed during a run.
    #[error("Node '{node_name}' ({op_type}) failed: {source}")]
    KernelExecutionError {
        /// Node name.
        node_name: String,
        /// Operator type.
        op_type: String,
        /// Underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// Tensor-level failure.
    #[error(transparent)]
    Core(CoreError),

    /// Model decoding failure.
    #[error(transparent)]
    Onnx(#[from] OnnxError),

    /// Failure reported by an external engine.
    #[error(transparent)]
    External(#[from] anyhow::Error),
}

impl Error {
    /// Build a [`Error::DimensionMismatch`].
    pub fn dimension(message: impl Into<String>) -> Self {
        Error::DimensionMismatch(message.into())
    }

    /// The innermost error, looking through nested kernel failures.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::KernelExecutionError { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

impl From<CoreError> for Error {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::CyclicGraph { nodes } => Error::CyclicGraphError { nodes },
            CoreError::UndefinedValue { node, name } => Error::MissingValue {
                name,
                consumer: format!("'{node}'"),
            },
            other => Error::Core(other),
        }
    }
}
