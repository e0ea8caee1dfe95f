//! QUIC listener and connector implementations

use async_trait::async_trait;
use overlink_transport::{
    TransportConnector, TransportError, TransportListener, TransportResult,
};
use quinn::Endpoint;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::config::QuicConfig;
use crate::connection::QuicConnection;

/// QUIC listener for accepting incoming agent connections
#[derive(Debug)]
pub struct QuicListener {
    endpoint: Endpoint,
}

impl QuicListener {
    pub fn new(bind_addr: SocketAddr, config: Arc<QuicConfig>) -> TransportResult<Self> {
        config.validate()?;

        let server_config = config.build_server_config()?;

        let endpoint =
            Endpoint::server(server_config, bind_addr).map_err(TransportError::IoError)?;

        let local_addr = endpoint.local_addr().map_err(TransportError::IoError)?;

        info!("QUIC listener bound to {}", local_addr);

        Ok(Self { endpoint })
    }
}

#[async_trait]
impl TransportListener for QuicListener {
    type Connection = QuicConnection;

    async fn accept(&self) -> TransportResult<(Self::Connection, SocketAddr)> {
        loop {
            match self.endpoint.accept().await {
                Some(connecting) => {
                    let remote = connecting.remote_address();

                    debug!("Incoming QUIC connection from {}", remote);

                    match connecting.await {
                        Ok(connection) => {
                            info!("QUIC connection established from {}", remote);
                            return Ok((QuicConnection::new(connection), remote));
                        }
                        Err(e) => {
                            // Handshake failure is the peer's problem
                            error!("Failed to establish QUIC connection from {}: {}", remote, e);
                            continue;
                        }
                    }
                }
                None => {
                    return Err(TransportError::ConnectionError(
                        "QUIC endpoint closed".to_string(),
                    ));
                }
            }
        }
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.endpoint.local_addr().map_err(TransportError::IoError)
    }

    async fn close(&self) {
        self.endpoint.close(0u32.into(), b"Listener closed");
        info!("QUIC listener closed");
    }
}

/// QUIC connector for dialing the coordinator
#[derive(Debug)]
pub struct QuicConnector {
    endpoint: Endpoint,
}

impl QuicConnector {
    pub fn new(config: Arc<QuicConfig>) -> TransportResult<Self> {
        config.validate()?;

        let client_config = config.build_client_config()?;

        let bind: SocketAddr = "0.0.0.0:0"
            .parse()
            .map_err(|_| TransportError::ConfigurationError("bad bind address".to_string()))?;
        let mut endpoint = Endpoint::client(bind).map_err(TransportError::IoError)?;

        endpoint.set_default_client_config(client_config);

        debug!("QUIC connector created");

        Ok(Self { endpoint })
    }
}

#[async_trait]
impl TransportConnector for QuicConnector {
    type Connection = QuicConnection;

    async fn connect(
        &self,
        addr: SocketAddr,
        server_name: &str,
    ) -> TransportResult<Self::Connection> {
        debug!("Connecting to coordinator: {} ({})", server_name, addr);

        let connecting = self
            .endpoint
            .connect(addr, server_name)
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        let connection = connecting
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        info!("Connected to coordinator {} ({})", server_name, addr);

        Ok(QuicConnection::new(connection))
    }
}
