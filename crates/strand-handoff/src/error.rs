//! Error types for hint replay.

/// Errors surfaced while draining hints to a recovered node.
#[derive(Debug, thiserror::Error)]
pub enum HandoffError {
    /// Local pointer database failure.
    #[error("metadata error: {0}")]
    Meta(#[from] strand_meta::MetaError),

    /// Hint repository failure.
    #[error("hint repository error: {0}")]
    Hints(#[from] strand_hints::HintError),

    /// Local payload storage failure.
    #[error("store error: {0}")]
    Store(#[from] strand_store::StoreError),

    /// Forwarding the owed segment to the recovered node failed.
    #[error("replay transfer failed: {0}")]
    Transfer(#[from] strand_coordinator::CoordinatorError),
}
