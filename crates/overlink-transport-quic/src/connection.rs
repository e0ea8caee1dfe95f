//! QUIC connection implementation

use async_trait::async_trait;
use overlink_transport::{TransportConnection, TransportError, TransportResult};
use quinn::Connection;
use std::net::SocketAddr;
use tracing::{debug, error, trace};

use crate::stream::QuicStream;

/// QUIC connection wrapper
#[derive(Debug, Clone)]
pub struct QuicConnection {
    inner: Connection,
    connection_id: String,
}

impl QuicConnection {
    pub fn new(connection: Connection) -> Self {
        let connection_id = format!("quic-{}", connection.stable_id());

        Self {
            inner: connection,
            connection_id,
        }
    }
}

#[async_trait]
impl TransportConnection for QuicConnection {
    type Stream = QuicStream;

    async fn open_stream(&self) -> TransportResult<Self::Stream> {
        let (send, recv) = self
            .inner
            .open_bi()
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        trace!("Opened bidirectional stream: {}", send.id().index());

        Ok(QuicStream::new(send, recv))
    }

    async fn accept_stream(&self) -> TransportResult<Option<Self::Stream>> {
        match self.inner.accept_bi().await {
            Ok((send, recv)) => {
                trace!("Accepted bidirectional stream: {}", send.id().index());
                Ok(Some(QuicStream::new(send, recv)))
            }
            Err(quinn::ConnectionError::ApplicationClosed(_))
            | Err(quinn::ConnectionError::ConnectionClosed(_))
            | Err(quinn::ConnectionError::LocallyClosed)
            | Err(quinn::ConnectionError::TimedOut)
            | Err(quinn::ConnectionError::Reset) => {
                debug!("Connection {} closed", self.connection_id);
                Ok(None)
            }
            Err(e) => {
                error!("Error accepting stream: {}", e);
                // Remaining variants all mean the connection is unusable
                Ok(None)
            }
        }
    }

    async fn close(&self, error_code: u32, reason: &str) {
        self.inner
            .close(quinn::VarInt::from_u32(error_code), reason.as_bytes());

        debug!(
            "QUIC connection {} closed: {} (code: {})",
            self.connection_id, reason, error_code
        );
    }

    fn is_closed(&self) -> bool {
        self.inner.close_reason().is_some()
    }

    fn remote_address(&self) -> SocketAddr {
        self.inner.remote_address()
    }

    fn connection_id(&self) -> String {
        self.connection_id.clone()
    }
}
