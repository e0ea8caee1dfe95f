//! In-process transport
//!
//! Message-level implementation of the transport contract over tokio
//! channels: every stream is a pair of bounded channels, every connection a
//! pair of stream-handoff channels. Semantics match the QUIC carrier where
//! it matters to callers — independent ordered streams, graceful close on
//! either side — which makes this the substrate for router and agent
//! integration tests.

use crate::{
    TransportConnection, TransportConnector, TransportError, TransportListener, TransportResult,
    TransportStream,
};
use async_trait::async_trait;
use overlink_proto::ControlMessage;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

const STREAM_DEPTH: usize = 64;
const ACCEPT_DEPTH: usize = 16;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// One direction of a stream handoff: the remote half delivered to the peer.
type StreamHandoff = mpsc::Sender<MemStream>;

/// In-process bidirectional message stream
#[derive(Debug)]
pub struct MemStream {
    tx: Option<mpsc::Sender<ControlMessage>>,
    rx: mpsc::Receiver<ControlMessage>,
    stream_id: u64,
}

impl MemStream {
    /// Create a connected pair of stream halves.
    pub fn pair() -> (MemStream, MemStream) {
        let stream_id = NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed);
        let (a_tx, a_rx) = mpsc::channel(STREAM_DEPTH);
        let (b_tx, b_rx) = mpsc::channel(STREAM_DEPTH);

        (
            MemStream {
                tx: Some(a_tx),
                rx: b_rx,
                stream_id,
            },
            MemStream {
                tx: Some(b_tx),
                rx: a_rx,
                stream_id,
            },
        )
    }
}

#[async_trait]
impl TransportStream for MemStream {
    async fn send_message(&mut self, message: &ControlMessage) -> TransportResult<()> {
        let tx = self.tx.as_ref().ok_or(TransportError::StreamClosed)?;
        tx.send(message.clone())
            .await
            .map_err(|_| TransportError::StreamClosed)
    }

    async fn recv_message(&mut self) -> TransportResult<Option<ControlMessage>> {
        Ok(self.rx.recv().await)
    }

    async fn finish(&mut self) -> TransportResult<()> {
        self.tx = None;
        Ok(())
    }

    fn stream_id(&self) -> u64 {
        self.stream_id
    }

    fn is_closed(&self) -> bool {
        self.tx.is_none()
    }
}

/// In-process transport connection
#[derive(Debug)]
pub struct MemConnection {
    /// Delivers our opened streams to the peer's accept loop
    opener: Mutex<Option<StreamHandoff>>,
    /// Streams the peer opened towards us
    incoming: Mutex<mpsc::Receiver<MemStream>>,
    /// Shared between both halves so close is visible to the peer
    closed: Arc<AtomicBool>,
    remote: SocketAddr,
    connection_id: String,
}

impl MemConnection {
    /// Create a connected pair of connection halves.
    pub fn pair(client_addr: SocketAddr, server_addr: SocketAddr) -> (MemConnection, MemConnection) {
        static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);
        let id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);

        let (a_open, b_incoming) = mpsc::channel(ACCEPT_DEPTH);
        let (b_open, a_incoming) = mpsc::channel(ACCEPT_DEPTH);
        let closed = Arc::new(AtomicBool::new(false));

        let client = MemConnection {
            opener: Mutex::new(Some(a_open)),
            incoming: Mutex::new(a_incoming),
            closed: closed.clone(),
            remote: server_addr,
            connection_id: format!("mem-{}-client", id),
        };
        let server = MemConnection {
            opener: Mutex::new(Some(b_open)),
            incoming: Mutex::new(b_incoming),
            closed,
            remote: client_addr,
            connection_id: format!("mem-{}-server", id),
        };

        (client, server)
    }
}

#[async_trait]
impl TransportConnection for MemConnection {
    type Stream = MemStream;

    async fn open_stream(&self) -> TransportResult<Self::Stream> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionError(
                "connection closed".to_string(),
            ));
        }

        let (local, remote) = MemStream::pair();

        let opener = self.opener.lock().await;
        let tx = opener.as_ref().ok_or_else(|| {
            TransportError::ConnectionError("connection closed".to_string())
        })?;
        tx.send(remote)
            .await
            .map_err(|_| TransportError::ConnectionError("peer gone".to_string()))?;

        Ok(local)
    }

    async fn accept_stream(&self) -> TransportResult<Option<Self::Stream>> {
        let mut incoming = self.incoming.lock().await;
        Ok(incoming.recv().await)
    }

    async fn close(&self, _error_code: u32, _reason: &str) {
        self.closed.store(true, Ordering::SeqCst);
        // Dropping the opener ends the peer's accept loop
        self.opener.lock().await.take();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn remote_address(&self) -> SocketAddr {
        self.remote
    }

    fn connection_id(&self) -> String {
        self.connection_id.clone()
    }
}

/// In-process listener half of [`mem_link`]
#[derive(Debug)]
pub struct MemListener {
    incoming: Mutex<mpsc::Receiver<(MemConnection, SocketAddr)>>,
    local: SocketAddr,
}

#[async_trait]
impl TransportListener for MemListener {
    type Connection = MemConnection;

    async fn accept(&self) -> TransportResult<(Self::Connection, SocketAddr)> {
        let mut incoming = self.incoming.lock().await;
        incoming.recv().await.ok_or_else(|| {
            TransportError::ConnectionError("listener closed".to_string())
        })
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.local)
    }

    async fn close(&self) {
        self.incoming.lock().await.close();
    }
}

/// In-process connector half of [`mem_link`]
#[derive(Debug, Clone)]
pub struct MemConnector {
    listener_tx: mpsc::Sender<(MemConnection, SocketAddr)>,
    local: SocketAddr,
}

#[async_trait]
impl TransportConnector for MemConnector {
    type Connection = MemConnection;

    async fn connect(
        &self,
        addr: SocketAddr,
        _server_name: &str,
    ) -> TransportResult<Self::Connection> {
        let (client_half, server_half) = MemConnection::pair(self.local, addr);

        self.listener_tx
            .send((server_half, self.local))
            .await
            .map_err(|_| TransportError::ConnectionError("listener gone".to_string()))?;

        Ok(client_half)
    }
}

/// Create a connected listener/connector pair sharing an in-process link.
pub fn mem_link() -> (MemListener, MemConnector) {
    let (tx, rx) = mpsc::channel(ACCEPT_DEPTH);
    let listener_addr: SocketAddr = "127.0.0.1:4433".parse().unwrap();
    let connector_addr: SocketAddr = "127.0.0.1:51000".parse().unwrap();

    (
        MemListener {
            incoming: Mutex::new(rx),
            local: listener_addr,
        },
        MemConnector {
            listener_tx: tx,
            local: connector_addr,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_pair_round_trip() {
        let (mut a, mut b) = MemStream::pair();

        let msg = ControlMessage::Disconnect {
            reason: "bye".to_string(),
        };
        a.send_message(&msg).await.unwrap();

        let received = b.recv_message().await.unwrap();
        assert_eq!(received, Some(msg));
    }

    #[tokio::test]
    async fn test_stream_finish_closes_peer_receive() {
        let (mut a, mut b) = MemStream::pair();
        a.finish().await.unwrap();

        assert!(a.is_closed());
        assert_eq!(b.recv_message().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_connect_and_open_stream() {
        let (listener, connector) = mem_link();

        let server = tokio::spawn(async move {
            let (conn, _peer) = listener.accept().await.unwrap();
            let mut stream = conn.accept_stream().await.unwrap().unwrap();
            stream.recv_message().await.unwrap()
        });

        let addr = "127.0.0.1:4433".parse().unwrap();
        let conn = connector.connect(addr, "localhost").await.unwrap();
        let mut stream = conn.open_stream().await.unwrap();
        stream
            .send_message(&ControlMessage::GetRoutes {
                agent_id: "a-1".to_string(),
            })
            .await
            .unwrap();

        let received = server.await.unwrap();
        assert_eq!(
            received,
            Some(ControlMessage::GetRoutes {
                agent_id: "a-1".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_close_ends_peer_accept_loop() {
        let (listener, connector) = mem_link();

        let addr = "127.0.0.1:4433".parse().unwrap();
        let conn = connector.connect(addr, "localhost").await.unwrap();
        let (server_conn, _) = listener.accept().await.unwrap();

        conn.close(0, "done").await;

        assert!(conn.is_closed());
        assert!(server_conn.is_closed());
        assert!(server_conn.accept_stream().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_streams_are_independent() {
        let (listener, connector) = mem_link();

        let addr = "127.0.0.1:4433".parse().unwrap();
        let conn = connector.connect(addr, "localhost").await.unwrap();
        let (server_conn, _) = listener.accept().await.unwrap();

        let mut s1 = conn.open_stream().await.unwrap();
        let mut s2 = conn.open_stream().await.unwrap();
        assert_ne!(s1.stream_id(), s2.stream_id());

        let mut r1 = server_conn.accept_stream().await.unwrap().unwrap();
        let mut r2 = server_conn.accept_stream().await.unwrap().unwrap();

        // Send on the second stream first; the first stream is unaffected
        s2.send_message(&ControlMessage::Disconnect {
            reason: "2".to_string(),
        })
        .await
        .unwrap();
        s1.send_message(&ControlMessage::Disconnect {
            reason: "1".to_string(),
        })
        .await
        .unwrap();

        assert_eq!(
            r2.recv_message().await.unwrap(),
            Some(ControlMessage::Disconnect {
                reason: "2".to_string()
            })
        );
        assert_eq!(
            r1.recv_message().await.unwrap(),
            Some(ControlMessage::Disconnect {
                reason: "1".to_string()
            })
        );
    }
}
