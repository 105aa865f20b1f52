use thiserror::Error;

/// Force plate pipeline error types
#[derive(Error, Debug)]
pub enum PlateError {
    #[error("Shape mismatch: expected {expected} channels, got {got}")]
    ShapeMismatch { expected: usize, got: usize },

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Analysis failed: {0}")]
    AnalysisFailure(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for pipeline operations
pub type PlateResult<T> = Result<T, PlateError>;
