//! Error types for the hint repository.

/// Errors returned by [`HintRepository`](crate::HintRepository) operations.
#[derive(Debug, thiserror::Error)]
pub enum HintError {
    /// Fjall database error.
    #[error("fjall error: {0}")]
    Fjall(#[from] fjall::Error),

    /// I/O error (e.g. from Fjall guard operations).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serde(#[from] postcard::Error),
}
