//! Network transport built on iroh QUIC.
//!
//! [`QuicBus`] wraps an iroh [`Endpoint`] and provides:
//! - Connection pooling (reuse connections to the same peer).
//! - Request/reply over bi-directional streams with length-prefixed
//!   postcard encoding.
//! - Broadcast over uni-directional streams to every registered peer.

use std::collections::HashMap;
use std::sync::Arc;

use iroh::endpoint::{Connection, RecvStream, SendStream};
use iroh::{Endpoint, EndpointAddr, SecretKey};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::STRAND_ALPN;
use crate::error::NetError;
use crate::message::Message;

/// Maximum message size: 16 MB. Stream slices are at most 120 KiB, but
/// single-message archives of small files can carry the whole payload.
const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Network bus for inter-node communication.
///
/// Manages an iroh QUIC endpoint, a connection pool to peer nodes, and an
/// address book mapping exchange names to endpoint addresses. All
/// higher-level components address peers by exchange name only.
pub struct QuicBus {
    endpoint: Endpoint,
    /// Cached connections to remote peers, keyed by their iroh endpoint ID.
    ///
    /// Uses `Mutex` (not `RwLock`) to prevent a TOCTOU race where concurrent
    /// callers all see "no cached connection", each establish a separate QUIC
    /// connection to the same peer, and overwrite each other in the cache.
    /// Dropped connections send `CONNECTION_CLOSE`, aborting in-flight data.
    connections: Arc<Mutex<HashMap<iroh::EndpointId, Connection>>>,
    /// Exchange name to endpoint address, learned from configuration and
    /// from `ProcessStatus` announcements.
    addresses: Arc<Mutex<HashMap<String, EndpointAddr>>>,
    alpn: Vec<u8>,
}

impl QuicBus {
    /// Create a new bus with the default ALPN (`strand/0`).
    ///
    /// Use [`iroh::RelayMode::Disabled`] for tests that don't need relay servers.
    pub async fn bind(secret_key: SecretKey, relay_mode: iroh::RelayMode) -> Result<Self, NetError> {
        let endpoint = Endpoint::builder()
            .secret_key(secret_key)
            .alpns(vec![STRAND_ALPN.to_vec()])
            .relay_mode(relay_mode)
            .bind()
            .await
            .map_err(|e| NetError::Endpoint(e.to_string()))?;

        Ok(Self::from_endpoint(endpoint))
    }

    /// Create a bus wrapping an existing iroh endpoint.
    ///
    /// Use this when the endpoint is shared with an iroh
    /// [`Router`](iroh::protocol::Router) and the bus is only used for
    /// *outgoing* connections.
    pub fn from_endpoint(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            connections: Arc::new(Mutex::new(HashMap::new())),
            addresses: Arc::new(Mutex::new(HashMap::new())),
            alpn: STRAND_ALPN.to_vec(),
        }
    }

    /// Return a reference to the underlying iroh endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Return the [`EndpointAddr`] of this bus (ID + addresses).
    pub fn addr(&self) -> EndpointAddr {
        self.endpoint.addr()
    }

    /// Return this endpoint's public identity.
    pub fn endpoint_id(&self) -> iroh::EndpointId {
        self.endpoint.id()
    }

    // -------------------------------------------------------------------
    // Address book
    // -------------------------------------------------------------------

    /// Register (or refresh) the endpoint address for an exchange name.
    pub async fn register_exchange(&self, exchange: &str, addr: EndpointAddr) {
        let mut book = self.addresses.lock().await;
        book.insert(exchange.to_string(), addr);
    }

    /// Look up the endpoint address for an exchange name.
    pub async fn resolve(&self, exchange: &str) -> Result<EndpointAddr, NetError> {
        let book = self.addresses.lock().await;
        book.get(exchange)
            .cloned()
            .ok_or_else(|| NetError::UnknownExchange(exchange.to_string()))
    }

    /// Exchange names currently in the address book.
    pub async fn known_exchanges(&self) -> Vec<String> {
        let book = self.addresses.lock().await;
        book.keys().cloned().collect()
    }

    // -------------------------------------------------------------------
    // Connection management
    // -------------------------------------------------------------------

    /// Get or establish a QUIC connection to a remote peer.
    ///
    /// Holds the connection cache lock for the entire duration to prevent
    /// the TOCTOU race where concurrent callers each create a connection
    /// to the same peer, overwriting each other.
    async fn get_connection(&self, addr: EndpointAddr) -> Result<Connection, NetError> {
        let remote_id = addr.id;
        let mut cache = self.connections.lock().await;

        if let Some(conn) = cache.get(&remote_id) {
            if conn.close_reason().is_none() {
                return Ok(conn.clone());
            }
        }

        debug!(remote = %remote_id.fmt_short(), "connecting to peer");
        let conn = self
            .endpoint
            .connect(addr, &self.alpn)
            .await
            .map_err(|e| NetError::Connect(e.to_string()))?;

        cache.insert(remote_id, conn.clone());
        Ok(conn)
    }

    /// Remove a cached connection (e.g. after detecting it's dead).
    pub async fn remove_connection(&self, id: &iroh::EndpointId) {
        let mut cache = self.connections.lock().await;
        cache.remove(id);
    }

    // -------------------------------------------------------------------
    // Request / reply
    // -------------------------------------------------------------------

    /// Send a request to the named exchange and wait for its reply.
    ///
    /// Opens a bi-directional stream on a (pooled) connection, sends the
    /// postcard-encoded request, and reads exactly one reply. A dead
    /// connection is evicted from the pool before the error propagates.
    pub async fn request_exchange(&self, exchange: &str, msg: &Message) -> Result<Message, NetError> {
        let addr = self.resolve(exchange).await?;
        let remote_id = addr.id;
        let conn = self.get_connection(addr).await?;

        let result = Self::request_on_connection(&conn, msg).await;
        if result.is_err() {
            self.remove_connection(&remote_id).await;
        }
        result
    }

    /// Perform one request/reply exchange on an established connection.
    pub async fn request_on_connection(conn: &Connection, msg: &Message) -> Result<Message, NetError> {
        let (mut send, mut recv) = conn
            .open_bi()
            .await
            .map_err(|e| NetError::StreamOpen(e.to_string()))?;

        Self::send_on_stream(&mut send, msg).await?;
        Self::recv_message(&mut recv).await
    }

    // -------------------------------------------------------------------
    // Broadcast
    // -------------------------------------------------------------------

    /// Send a message to every exchange in the address book, best effort.
    ///
    /// Opens a uni-directional stream per peer. Unreachable peers are
    /// logged and skipped; liveness tracking handles them separately.
    pub async fn broadcast_all(&self, msg: &Message) {
        let book: Vec<(String, EndpointAddr)> = {
            let addrs = self.addresses.lock().await;
            addrs.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        for (exchange, addr) in book {
            let remote_id = addr.id;
            match self.get_connection(addr).await {
                Ok(conn) => {
                    if let Err(e) = Self::send_message(&conn, msg).await {
                        warn!(%exchange, "broadcast send failed: {e}");
                        self.remove_connection(&remote_id).await;
                    }
                }
                Err(e) => {
                    debug!(%exchange, "broadcast connect failed: {e}");
                }
            }
        }
    }

    // -------------------------------------------------------------------
    // Low-level message send/receive
    // -------------------------------------------------------------------

    /// Send a message over a new uni-directional stream on the given connection.
    ///
    /// The message is length-prefixed (4-byte big-endian) then postcard-encoded.
    pub async fn send_message(conn: &Connection, message: &Message) -> Result<(), NetError> {
        let mut send = conn
            .open_uni()
            .await
            .map_err(|e| NetError::StreamOpen(e.to_string()))?;
        Self::send_on_stream(&mut send, message).await
    }

    /// Send a message on an already-open send stream.
    pub async fn send_on_stream(send: &mut SendStream, message: &Message) -> Result<(), NetError> {
        let payload =
            postcard::to_allocvec(message).map_err(|e| NetError::Serialization(e.to_string()))?;
        send.write_all(&(payload.len() as u32).to_be_bytes())
            .await?;
        send.write_all(&payload).await?;
        send.finish()?;
        Ok(())
    }

    /// Receive a message from a receive stream.
    ///
    /// Reads a 4-byte big-endian length prefix, then reads that many bytes
    /// and deserializes with postcard.
    pub async fn recv_message(recv: &mut RecvStream) -> Result<Message, NetError> {
        let mut len_buf = [0u8; 4];
        recv.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;

        if len > MAX_MESSAGE_SIZE {
            return Err(NetError::Serialization(format!(
                "message too large: {len} bytes (max {MAX_MESSAGE_SIZE})"
            )));
        }

        let payload = recv.read_to_end(len).await?;
        let message: Message =
            postcard::from_bytes(&payload).map_err(|e| NetError::Serialization(e.to_string()))?;

        Ok(message)
    }

    // -------------------------------------------------------------------
    // Incoming message handling
    // -------------------------------------------------------------------

    /// Accept a single incoming connection and return it.
    ///
    /// Returns `None` if the endpoint is shutting down.
    pub async fn accept(&self) -> Option<Connection> {
        let incoming = self.endpoint.accept().await?;
        match incoming.await {
            Ok(conn) => Some(conn),
            Err(e) => {
                warn!("failed to accept connection: {e}");
                None
            }
        }
    }

    /// Accept incoming uni-directional streams on a connection and dispatch
    /// messages to the provided handler. Used for announcements that carry
    /// no reply.
    ///
    /// Runs until the connection is closed.
    pub async fn handle_uni_streams<F, Fut>(conn: Connection, handler: F)
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        loop {
            match conn.accept_uni().await {
                Ok(mut recv) => match Self::recv_message(&mut recv).await {
                    Ok(msg) => handler(msg).await,
                    Err(e) => {
                        warn!("failed to decode message: {e}");
                    }
                },
                Err(e) => {
                    debug!("connection closed: {e}");
                    break;
                }
            }
        }
    }

    /// Handle incoming bidirectional streams (request/reply).
    ///
    /// For each incoming bi stream, reads a request and calls the handler,
    /// which must produce a reply. The reply is sent back on the same stream.
    pub async fn handle_bi_streams<F, Fut>(conn: Connection, handler: F)
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Option<Message>> + Send,
    {
        loop {
            match conn.accept_bi().await {
                Ok((mut send, mut recv)) => match Self::recv_message(&mut recv).await {
                    Ok(request) => {
                        if let Some(response) = handler(request).await {
                            if let Err(e) = Self::send_on_stream(&mut send, &response).await {
                                warn!("failed to send response: {e}");
                            }
                        }
                    }
                    Err(e) => {
                        warn!("failed to decode bi-stream request: {e}");
                    }
                },
                Err(e) => {
                    debug!("connection closed (bi): {e}");
                    break;
                }
            }
        }
    }

    /// Gracefully close the bus.
    pub async fn close(&self) {
        self.endpoint.close().await;
    }
}

#[async_trait::async_trait]
impl crate::Bus for QuicBus {
    async fn request(
        &self,
        dest: &strand_types::NodeRef,
        msg: Message,
    ) -> Result<Message, NetError> {
        self.request_exchange(&dest.exchange, &msg).await
    }

    async fn broadcast(&self, msg: Message) -> Result<(), NetError> {
        self.broadcast_all(&msg).await;
        Ok(())
    }
}
