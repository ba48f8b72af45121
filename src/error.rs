//! Error types for graph rewriting and quantization

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed graph edit. The graph is left untouched.
    #[error("structural error: {0}")]
    Structural(String),

    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("node {node}: unsupported shape: {reason}")]
    UnsupportedShape { node: String, reason: String },

    /// Every applicable quantization handler rejected the node.
    #[error("node {node}: no quantization handler accepted the current constraints")]
    QuantizationRejected { node: String },

    #[error("node {node}: missing calibration statistics")]
    MissingStatistics { node: String },

    #[error("weight scaling has failed to converge after {cycles} cycles")]
    Convergence { cycles: usize },

    #[error("equalization threshold must be a non-negative number, got {threshold}")]
    InvalidThreshold { threshold: f64 },

    /// A state the resolver should have prevented.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("unknown matcher or match group: {0}")]
    UnknownMatcher(String),

    #[error("configuration error: {0}")]
    Config(#[from] serde_json::Error),
}

impl Error {
    pub fn structural(msg: impl Into<String>) -> Self {
        Error::Structural(msg.into())
    }

    pub fn unsupported(node: &str, reason: impl Into<String>) -> Self {
        Error::UnsupportedShape { node: node.to_string(), reason: reason.into() }
    }
}
