//! Error types for function encoders.

use thiserror::Error;

/// Result type for function encoder operations.
pub type EncoderResult<T> = Result<T, EncoderError>;

/// Errors that can occur while building, evaluating or training an encoder.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EncoderError {
    /// Tensor operation failed
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// A shape, rank or range precondition was violated by the caller
    #[error("precondition violated: {0}")]
    Precondition(String),

    /// The instantiated parameter count disagrees with the closed-form count
    #[error("configuration mismatch in {component}: built {actual} parameters, expected {expected}")]
    ConfigurationMismatch {
        /// Which sub-network disagreed (`basis`, `average`, `encoder` or `total`)
        component: String,
        /// Parameters actually allocated
        actual: usize,
        /// Parameters predicted by the oracle
        expected: usize,
    },

    /// Singular system or non-finite loss
    #[error("numerical failure: {0}")]
    Numerical(String),

    /// Saved state does not match the encoder it is loaded into
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl EncoderError {
    /// Create a precondition error
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    /// Create a numerical failure error
    pub fn numerical(msg: impl Into<String>) -> Self {
        Self::Numerical(msg.into())
    }

    /// Create a checkpoint error
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Create a parameter-count mismatch error
    pub fn configuration_mismatch(
        component: impl Into<String>,
        actual: usize,
        expected: usize,
    ) -> Self {
        Self::ConfigurationMismatch {
            component: component.into(),
            actual,
            expected,
        }
    }
}
