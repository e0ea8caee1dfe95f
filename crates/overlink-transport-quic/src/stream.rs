//! QUIC stream implementation

use async_trait::async_trait;
use bytes::BytesMut;
use overlink_proto::{ControlCodec, ControlMessage};
use overlink_transport::{TransportError, TransportResult, TransportStream};
use quinn::{RecvStream, SendStream};
use tracing::trace;

/// QUIC bidirectional stream carrying framed control messages
#[derive(Debug)]
pub struct QuicStream {
    send: SendStream,
    recv: RecvStream,
    stream_id: u64,
    closed: bool,
    // Accumulates received chunks until a full frame can be decoded
    recv_buffer: BytesMut,
}

impl QuicStream {
    pub fn new(send: SendStream, recv: RecvStream) -> Self {
        let stream_id = send.id().index();
        Self {
            send,
            recv,
            stream_id,
            closed: false,
            recv_buffer: BytesMut::with_capacity(8192),
        }
    }
}

#[async_trait]
impl TransportStream for QuicStream {
    async fn send_message(&mut self, message: &ControlMessage) -> TransportResult<()> {
        if self.closed {
            return Err(TransportError::StreamClosed);
        }

        let encoded = ControlCodec::encode(message)
            .map_err(|e| TransportError::ProtocolError(e.to_string()))?;

        self.send
            .write_all(&encoded)
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        trace!("Sent message on stream {}", self.stream_id);

        Ok(())
    }

    async fn recv_message(&mut self) -> TransportResult<Option<ControlMessage>> {
        if self.closed {
            return Ok(None);
        }

        loop {
            match ControlCodec::decode(&mut self.recv_buffer)
                .map_err(|e| TransportError::ProtocolError(e.to_string()))?
            {
                Some(msg) => {
                    trace!("Received message on stream {}", self.stream_id);
                    return Ok(Some(msg));
                }
                None => {
                    // Need more data
                    match self.recv.read_chunk(8192, true).await {
                        Ok(Some(chunk)) => {
                            self.recv_buffer.extend_from_slice(&chunk.bytes);
                        }
                        Ok(None) => {
                            self.closed = true;
                            if self.recv_buffer.is_empty() {
                                return Ok(None);
                            }
                            return Err(TransportError::ProtocolError(
                                "Incomplete message in buffer".to_string(),
                            ));
                        }
                        Err(e) => {
                            self.closed = true;
                            return Err(TransportError::ConnectionError(e.to_string()));
                        }
                    }
                }
            }
        }
    }

    async fn finish(&mut self) -> TransportResult<()> {
        if self.closed {
            return Ok(());
        }

        self.send
            .finish()
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        self.closed = true;

        Ok(())
    }

    fn stream_id(&self) -> u64 {
        self.stream_id
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}
