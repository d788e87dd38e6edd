//! mlinfer runtime
//!
//! Plans an ONNX graph once and runs it many times on the CPU:
//!
//! - **Registry**: kernel descriptors keyed by domain and operator, with
//!   arity checks and schema-driven attribute binding
//! - **Shape inference**: an ordered rule table that assigns a static type
//!   to every value the graph leaves untyped
//! - **Executor**: stable topological order, one kernel per node, a fresh
//!   value table per run, optional subset-of-outputs requests
//! - **Providers**: built-in CPU kernels or delegation of single nodes to an
//!   [`ExternalEngine`]
//! - **Kernels**: element-wise math, shape ops, reductions, `Scan`, and the
//!   ONNX-ML linear and tree-ensemble models
//!
//! ## Example
//!
//! ```rust
//! use mlinfer_core::{DataType, GraphBuilder, Tensor, ValueInfo};
//! use mlinfer_runtime::{Session, SessionOptions};
//!
//! let mut builder = GraphBuilder::new();
//! builder
//!     .input(ValueInfo::tensor("x", DataType::F64))
//!     .output(ValueInfo::tensor("y", DataType::F64));
//! builder.add_op("Sqrt", &["x"], &["y"]);
//!
//! let options = SessionOptions::new().with_dtype(DataType::F64);
//! let session = Session::with_options(builder.build()?, options)?;
//! let x = Tensor::from_vec(vec![2], vec![4.0f64, 9.0])?;
//! let outputs = session.run([("x", x)], None)?;
//! assert_eq!(outputs["y"].as_tensor()?.to_f64_vec()?, vec![2.0, 3.0]);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod attributes;
/// Runtime error taxonomy
pub mod error;
pub mod executor;
/// Operator kernels
pub mod ops;
pub mod providers;
pub mod registry;
/// Sessions and their options
pub mod session;
pub mod shape_inference;

pub use attributes::{AttributeSchema, BoundAttributes};
pub use error::{Error, Result};
pub use executor::{Executor, LoadedGraph, RuntimeEnv};
pub use ops::{OpKernel, ScanKernel};
pub use providers::{DelegatedKernel, EngineHandle, ExternalEngine, Provider, ReferenceEngine};
pub use registry::{Arity, KernelContext, KernelDescriptor, KernelRegistry, OperatorKey};
pub use session::{Session, SessionBuilder, SessionOptions};
pub use shape_inference::{infer_output_types, resolve_graph_types};

// Re-export commonly used types
pub use mlinfer_core::{DataType, ModelGraph, Tensor, Value, ValueType};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{Provider, Session, SessionBuilder, SessionOptions, Tensor, Value};
    pub use mlinfer_core::DataType;
}
