//! Error types for the BERT fusion optimizer

use std::io;
use thiserror::Error;

use crate::config::ConfigError;

/// Result type for optimizer operations
pub type Result<T> = std::result::Result<T, OptimizerError>;

/// Errors that can occur while loading, optimizing or writing a model
#[derive(Debug, Error)]
pub enum OptimizerError {
    /// The input is not a well-formed ONNX model. Raised before any mutation.
    #[error("Malformed model: {0}")]
    Format(#[from] FormatError),

    #[error(transparent)]
    Fusion(#[from] FusionError),

    #[error("Graph error: {0}")]
    Graph(String),

    #[error("Evaluation failed: {0}")]
    Evaluation(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Reasons a serialized model is rejected by the loader
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("Protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("model has no graph")]
    MissingGraph,

    #[error("model has no default-domain opset import")]
    MissingOpset,

    #[error("unsupported opset version {0} (supported: 7..=21)")]
    UnsupportedOpset(i64),

    #[error("node '{0}' has no op type")]
    MissingOpType(String),

    #[error("tensor '{tensor}' is produced by more than one node ('{first}' and '{second}')")]
    DuplicateProducer {
        tensor: String,
        first: String,
        second: String,
    },

    #[error("node '{node}' reads unknown tensor '{tensor}'")]
    DanglingInput { node: String, tensor: String },

    #[error("graph output '{0}' is not produced by any node, input or initializer")]
    DanglingOutput(String),

    #[error("graph contains a cycle")]
    Cycle,
}

/// Per-span fusion outcome other than success
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FusionError {
    /// The span does not satisfy the fusion's structural or value checks.
    #[error("pattern did not match")]
    NoMatch,

    /// Outputs leave the span from more than one node, or an input cannot be
    /// resolved outside the span.
    #[error("ambiguous wiring: {0}")]
    AmbiguousWiring(String),

    /// A required attribute or shape cannot be determined.
    #[error("under-specified: {0}")]
    UnderSpecified(String),

    /// Discovered hyperparameter disagrees with the declared one.
    #[error("{parameter} mismatch: declared {declared}, discovered {discovered}")]
    HyperparameterMismatch {
        parameter: String,
        declared: i64,
        discovered: i64,
    },
}

impl FusionError {
    /// Fatal errors abort the remainder of the current fusion pass.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FusionError::HyperparameterMismatch { .. })
    }

    /// Short label used in reports
    pub fn label(&self) -> &'static str {
        match self {
            FusionError::NoMatch => "no-match",
            FusionError::AmbiguousWiring(_) => "ambiguous-wiring",
            FusionError::UnderSpecified(_) => "under-specified",
            FusionError::HyperparameterMismatch { .. } => "hyperparameter-mismatch",
        }
    }
}

impl From<serde_json::Error> for OptimizerError {
    fn from(err: serde_json::Error) -> Self {
        OptimizerError::Io(io::Error::new(io::ErrorKind::InvalidData, err))
    }
}
