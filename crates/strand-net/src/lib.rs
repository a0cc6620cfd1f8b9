//! Network protocol on iroh QUIC.
//!
//! This crate implements the storage network layer on top of [iroh] QUIC
//! connections:
//!
//! - [`Message`] — the wire protocol (postcard-serialized).
//! - [`QuicBus`] — manages an iroh [`Endpoint`], connection pooling, an
//!   exchange-name address book, and request/reply plumbing.
//!
//! [`Endpoint`]: iroh::Endpoint

mod error;
mod message;
mod transport;

pub use error::NetError;
pub use message::{Message, ProcessStatusKind, RetrieveMeta};
pub use transport::QuicBus;

/// Trait abstracting the network bus operations used by coordinators and
/// the handoff drain.
///
/// This allows substituting an in-process loopback bus in tests (avoiding
/// the need for real iroh QUIC endpoints and network access).
#[async_trait::async_trait]
pub trait Bus: Send + Sync {
    /// Send a request to a node and wait for its reply.
    async fn request(
        &self,
        dest: &strand_types::NodeRef,
        msg: Message,
    ) -> Result<Message, NetError>;

    /// Announce a message to every known node, best effort.
    async fn broadcast(&self, msg: Message) -> Result<(), NetError>;
}

/// ALPN protocol identifier.
pub const STRAND_ALPN: &[u8] = b"strand/0";
