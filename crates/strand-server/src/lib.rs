//! Per-node request handling.
//!
//! [`NodeServer`] is the transport-independent message handler of one
//! storage node: streaming archive/retrieve sessions, metadata
//! operations, hint recording, and liveness announcements. The daemon
//! wires it behind the QUIC bus; tests call
//! [`NodeServer::handle`] directly through a loopback bus.

mod server;
mod session;

pub use server::{NodeServer, LIST_MATCH_LIMIT};
pub use session::SessionTable;
