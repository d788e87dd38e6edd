//! mlinfer core data model
//!
//! This crate provides the foundational pieces shared by the loader and the
//! runtime: type-erased tensors over `ndarray`, runtime values, the graph
//! model with its attribute union, and graph ordering utilities.
//!
//! ## Architecture
//!
//! - **Types**: data types, value types, attributes, nodes and graphs
//! - **Tensor**: n-dimensional arrays of the supported element types
//! - **Value**: tensors, sequences and maps as stored by the executor
//! - **Graph**: validation, stable topological ordering, dependency closures
//! - **Logging**: `tracing-subscriber` setup
//!
//! ## Example
//!
//! ```rust
//! use mlinfer_core::{DataType, GraphBuilder, ValueInfo};
//!
//! let mut builder = GraphBuilder::new();
//! builder
//!     .input(ValueInfo::tensor("x", DataType::F32))
//!     .output(ValueInfo::tensor("y", DataType::F32));
//! builder.add_op("Relu", &["x"], &["y"]);
//! let graph = builder.build()?;
//! assert_eq!(graph.topological_sort()?, vec![0]);
//! # Ok::<(), mlinfer_core::CoreError>(())
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

/// Element traits linking Rust scalars to tensor variants
pub mod element;
/// Error types for core operations
pub mod error;
pub mod graph;
pub mod logging;
pub mod tensor;
pub mod types;
pub mod value;

pub use element::{NumericElement, TensorElement};
pub use error::{CoreError, Result};
pub use graph::{GraphBuilder, GraphStatistics};
pub use tensor::Tensor;
pub use types::{
    canonical_domain, AttributeKind, AttributeValue, DataType, Dim, GraphNode, ModelGraph, NodeId,
    ValueInfo, ValueType, DEFAULT_DOMAIN, ML_DOMAIN, MLINFER_DOMAIN,
};
pub use value::Value;
