//! QUIC implementation of the Overlink transport contract
//!
//! One UDP socket on the coordinator, TLS 1.3 integrated into the
//! handshake, independent bidirectional streams without cross-stream
//! head-of-line blocking. Control messages are framed with
//! [`overlink_proto::ControlCodec`] on each stream.

mod config;
mod connection;
mod listener;
pub mod selfsigned;
mod stream;

pub use config::QuicConfig;
pub use connection::QuicConnection;
pub use listener::{QuicConnector, QuicListener};
pub use stream::QuicStream;
