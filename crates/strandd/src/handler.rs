//! Incoming protocol handler for the Strand daemon.
//!
//! Implements iroh's [`ProtocolHandler`] trait to handle incoming QUIC
//! connections dispatched by the iroh [`Router`]. Requests on bi-streams
//! are answered in place by the node server; status broadcasts arrive on
//! uni-streams and double as address-book updates.
//!
//! [`ProtocolHandler`]: iroh::protocol::ProtocolHandler
//! [`Router`]: iroh::protocol::Router

use std::fmt;
use std::sync::Arc;

use iroh::EndpointAddr;
use iroh::endpoint::Connection;
use iroh::protocol::AcceptError;
use strand_net::{Message, QuicBus};
use strand_server::NodeServer;
use tracing::debug;

/// Handles incoming Strand protocol connections.
pub struct StrandProtocol {
    server: Arc<NodeServer>,
    bus: Arc<QuicBus>,
}

impl fmt::Debug for StrandProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrandProtocol").finish_non_exhaustive()
    }
}

impl StrandProtocol {
    pub fn new(server: Arc<NodeServer>, bus: Arc<QuicBus>) -> Self {
        Self { server, bus }
    }
}

impl iroh::protocol::ProtocolHandler for StrandProtocol {
    async fn accept(&self, conn: Connection) -> Result<(), AcceptError> {
        let remote_id = conn.remote_id();
        debug!(remote = %remote_id.fmt_short(), "incoming connection");

        // Status broadcasts arrive on uni-streams. A startup announcement
        // teaches us the sender's address for future dialing.
        let conn_uni = conn.clone();
        let server_uni = self.server.clone();
        let bus_uni = self.bus.clone();
        tokio::spawn(async move {
            QuicBus::handle_uni_streams(conn_uni, move |msg| {
                let server = server_uni.clone();
                let bus = bus_uni.clone();
                async move {
                    if let Message::ProcessStatus { exchange, .. } = &msg {
                        bus.register_exchange(exchange, EndpointAddr::new(remote_id))
                            .await;
                    }
                    server.handle(msg).await;
                }
            })
            .await;
        });

        // Requests arrive on bi-streams and are answered in place.
        let server_bi = self.server.clone();
        tokio::spawn(async move {
            QuicBus::handle_bi_streams(conn, move |msg| {
                let server = server_bi.clone();
                async move { server.handle(msg).await }
            })
            .await;
        });

        Ok(())
    }
}
