//! Error types for coordinated operations.

use strand_types::ResultCode;

/// Errors surfaced by the fan-out coordinators.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    /// This coordinator is already driving an operation.
    #[error("operation already in progress")]
    AlreadyInProgress,

    /// The completion policy was not satisfied before the deadline.
    #[error("operation timed out")]
    Timeout,

    /// Enough per-segment failures accumulated that the policy can no
    /// longer be satisfied.
    #[error("quorum unreachable: needed {needed}, {failed} of {total} destinations failed")]
    QuorumUnreachable {
        /// Successes the policy required.
        needed: usize,
        /// Destinations that failed.
        failed: usize,
        /// Destinations contacted.
        total: usize,
    },

    /// A destination processed the request and rejected it.
    #[error("rejected by remote: {code}{}", .message.as_deref().map(|m| format!(" ({m})")).unwrap_or_default())]
    Rejected {
        /// The remote's result code.
        code: ResultCode,
        /// The remote's error message, when it sent one.
        message: Option<String>,
    },

    /// A segment has no reachable destination at all.
    #[error("no destination available for segment {segment}")]
    NoDestination {
        /// The segment number that could not be placed.
        segment: u8,
    },

    /// Fewer than `k` destinations agree on a stat record.
    #[error("stat records disagree below agreement level {needed}")]
    StatDisagreement {
        /// Matching records the policy required.
        needed: usize,
    },

    /// The request carries a different number of segments than the
    /// destination set has slots.
    #[error("expected {expected} segments, got {actual}")]
    SegmentCountMismatch {
        /// Configured destination count.
        expected: usize,
        /// Segments in the request.
        actual: usize,
    },

    /// Retrieved segment bytes do not match the advertised checksum.
    #[error("segment checksum mismatch on retrieve")]
    ChecksumMismatch,

    /// Transport failure talking to a destination.
    #[error("network error: {0}")]
    Net(#[from] strand_net::NetError),

    /// The remote answered with a message kind that does not fit the
    /// request.
    #[error("unexpected reply kind: {0}")]
    UnexpectedReply(&'static str),
}

impl CoordinatorError {
    /// Build a rejection from a reply's result code and message.
    pub fn rejected(code: ResultCode, message: Option<String>) -> Self {
        Self::Rejected { code, message }
    }
}
