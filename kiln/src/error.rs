//! Error types for kiln

use thiserror::Error;

/// Result type alias using kiln's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for kiln operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Truncated read: needed {needed} bytes at offset {offset}, {remaining} remain")]
    Truncated {
        offset: usize,
        needed: usize,
        remaining: usize,
    },

    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Invalid shape: {0}")]
    InvalidShape(String),

    #[error("Dtype mismatch: expected {expected}, got {got}")]
    DtypeMismatch { expected: String, got: String },

    #[error("Unsupported dtype: {0}")]
    UnsupportedDtype(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Weight not found: {0}")]
    WeightNotFound(String),

    #[error("No backend supports {0}")]
    NoBackend(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Allocation failed: {0}")]
    Alloc(String),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

// ---------------------------------------------------------------------------
// Optional From impls for cudarc error types (enabled by `cuda` feature)
// ---------------------------------------------------------------------------

#[cfg(feature = "cuda")]
impl From<cudarc::driver::DriverError> for Error {
    fn from(e: cudarc::driver::DriverError) -> Self {
        Self::Backend(e.to_string())
    }
}
