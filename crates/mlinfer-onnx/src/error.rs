use mlinfer_core::CoreError;
use thiserror::Error;

/// Result type for model loading.
pub type Result<T> = std::result::Result<T, OnnxError>;

/// Errors raised while decoding a model file.
#[derive(Error, Debug)]
pub enum OnnxError {
    /// The bytes are not a valid protobuf `ModelProto`.
    #[error("Failed to decode model protobuf: {0}")]
    Decode(#[from] prost::DecodeError),

    /// The model is structurally unusable.
    #[error("Parse error: {0}")]
    ParseError(String),

    /// The model was written for an IR version older than we read.
    #[error("Unsupported IR version {version} (minimum {min_version})")]
    UnsupportedIrVersion {
        /// Version found in the file.
        version: i64,
        /// Oldest version accepted.
        min_version: i64,
    },

    /// An element type the interpreter has no tensor variant for.
    #[error("Unsupported data type {data_type} in '{context}'")]
    UnsupportedDataType {
        /// ONNX `TensorProto.DataType` code.
        data_type: i32,
        /// Value or attribute name carrying the type.
        context: String,
    },

    /// An attribute could not be converted.
    #[error("Invalid attribute '{name}': {reason}")]
    InvalidAttribute {
        /// Attribute name.
        name: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Tensor payload inconsistent with its header.
    #[error("Invalid tensor '{name}': {reason}")]
    InvalidTensor {
        /// Tensor name.
        name: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Reading the model file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Tensor construction failed.
    #[error(transparent)]
    Core(#[from] CoreError),
}
