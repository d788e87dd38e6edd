use thiserror::Error;

use crate::types::DataType;

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by tensors, values and graph planning.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    /// Two shapes could not be combined.
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// An operation received an element type it does not handle.
    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        /// What the operation accepts.
        expected: String,
        /// What it received.
        actual: String,
    },

    /// A conversion between element types failed.
    #[error("Cannot cast {from} to {to}: {reason}")]
    CastError {
        /// Source element type.
        from: DataType,
        /// Target element type.
        to: DataType,
        /// Why the conversion failed.
        reason: String,
    },

    /// An argument was out of range or otherwise invalid.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The graph has no topological order.
    #[error("Graph contains a cycle through nodes {nodes:?}")]
    CyclicGraph {
        /// Nodes that could not be scheduled.
        nodes: Vec<String>,
    },

    /// A node consumes a name nothing defines.
    #[error("Node '{node}' consumes undefined value '{name}'")]
    UndefinedValue {
        /// The consuming node.
        node: String,
        /// The missing value name.
        name: String,
    },
}

impl From<ndarray::ShapeError> for CoreError {
    fn from(err: ndarray::ShapeError) -> Self {
        CoreError::ShapeMismatch(err.to_string())
    }
}
