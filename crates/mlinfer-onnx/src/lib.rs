//! ONNX model loading for mlinfer.
//!
//! Decodes `ModelProto` protobuf bytes with `prost` and converts them into
//! the [`mlinfer_core::ModelGraph`] model: initializers become tensors,
//! declared inputs/outputs/`value_info` keep their types, graph attributes
//! (control-flow bodies) are converted recursively, and every node records
//! the opset version imported for its domain.
//!
//! ```no_run
//! use mlinfer_onnx::ModelLoader;
//!
//! let model = ModelLoader::load_from_file("model.onnx")?;
//! println!("{} nodes", model.graph().node_count());
//! # Ok::<(), mlinfer_onnx::OnnxError>(())
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

/// Error types for model loading
pub mod error;
/// Model loader
pub mod loader;
pub mod onnx_proto;
/// ONNX type conversions
pub mod types;

pub use error::{OnnxError, Result};
pub use loader::{tensor_from_proto, LoadedModel, ModelLoader};
pub use types::DataTypeMapper;
