//! Transport abstraction for Overlink connections
//!
//! The coordinator and agent speak [`ControlMessage`]s over multiplexed
//! bidirectional streams. This crate defines the contract those streams must
//! satisfy so the session router and agent runtime stay independent of the
//! concrete carrier: production uses QUIC (`overlink-transport-quic`), tests
//! use the in-process [`mem`] transport.
//!
//! Required carrier properties:
//! - encrypted and server-authenticated (TLS 1.3 for real deployments)
//! - many independent bidirectional streams per connection, no cross-stream
//!   head-of-line blocking
//! - per-stream ordered, reliable message delivery

use async_trait::async_trait;
use overlink_proto::ControlMessage;
use std::fmt::Debug;
use std::net::SocketAddr;
use thiserror::Error;

pub mod mem;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Timeout")]
    Timeout,

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// A bidirectional message stream over a transport connection.
///
/// One RPC or one long-lived streaming call occupies exactly one stream.
#[async_trait]
pub trait TransportStream: Send + Sync + Debug {
    /// Send a control message on this stream
    async fn send_message(&mut self, message: &ControlMessage) -> TransportResult<()>;

    /// Receive a control message from this stream
    ///
    /// Returns `None` if the stream has been closed gracefully by the peer.
    async fn recv_message(&mut self) -> TransportResult<Option<ControlMessage>>;

    /// Close the sending side of the stream
    async fn finish(&mut self) -> TransportResult<()>;

    /// Stream id, unique within its connection
    fn stream_id(&self) -> u64;

    fn is_closed(&self) -> bool;
}

/// A transport connection that multiplexes independent streams.
#[async_trait]
pub trait TransportConnection: Send + Sync + Debug {
    type Stream: TransportStream;

    /// Open a new bidirectional stream
    async fn open_stream(&self) -> TransportResult<Self::Stream>;

    /// Accept an incoming bidirectional stream
    ///
    /// Returns `None` when the connection is closed and no more streams will
    /// arrive.
    async fn accept_stream(&self) -> TransportResult<Option<Self::Stream>>;

    /// Close the connection gracefully
    async fn close(&self, error_code: u32, reason: &str);

    fn is_closed(&self) -> bool;

    /// Remote peer address (recorded for audit)
    fn remote_address(&self) -> SocketAddr;

    /// Stable identifier for this connection, for logging and session rows
    fn connection_id(&self) -> String;
}

/// Server side: accepts incoming transport connections.
#[async_trait]
pub trait TransportListener: Send + Sync + Debug {
    type Connection: TransportConnection;

    /// Accept an incoming connection, returning it with the peer address
    async fn accept(&self) -> TransportResult<(Self::Connection, SocketAddr)>;

    fn local_addr(&self) -> TransportResult<SocketAddr>;

    /// Stop accepting new connections
    async fn close(&self);
}

/// Client side: establishes outgoing transport connections.
#[async_trait]
pub trait TransportConnector: Send + Sync + Debug {
    type Connection: TransportConnection;

    /// Connect to a remote coordinator
    ///
    /// `server_name` is the name the server certificate is validated
    /// against; carriers without TLS ignore it.
    async fn connect(
        &self,
        addr: SocketAddr,
        server_name: &str,
    ) -> TransportResult<Self::Connection>;
}
