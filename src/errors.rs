use thiserror::Error;

pub type Result<T> = std::result::Result<T, RandNLAError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RandNLAError {
    /// Operand shapes do not line up for the requested operation.
    #[error("{operation}: expected a {}x{} operand, found {}x{}", expected.0, expected.1, found.0, found.1)]
    DimensionMismatch {
        operation: &'static str,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("invalid dimensions: {0}")]
    InvalidDimensions(String),

    /// No implementation exists for this layout/orientation combination.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("random stream exhausted: cannot reserve {size} samples starting at {base}")]
    ExhaustedRandomStream { base: u64, size: usize },

    #[error("index {index} out of range for {size} samples")]
    OutOfRange { index: usize, size: usize },

    #[error("{operation} failed: {message}")]
    CommunicationFailure {
        operation: &'static str,
        message: String,
    },

    #[error("numerical instability: {0}")]
    NumericalInstability(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl RandNLAError {
    pub(crate) fn mismatch(
        operation: &'static str,
        expected: (usize, usize),
        found: (usize, usize),
    ) -> Self {
        RandNLAError::DimensionMismatch {
            operation,
            expected,
            found,
        }
    }

    pub(crate) fn communication(operation: &'static str, message: impl Into<String>) -> Self {
        RandNLAError::CommunicationFailure {
            operation,
            message: message.into(),
        }
    }
}
