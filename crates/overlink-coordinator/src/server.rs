//! Coordinator server: wires config, store, pool and router to the QUIC
//! listener and drives the accept loop.

use crate::config::CoordinatorConfig;
use crate::pool::AddressPool;
use crate::router::{RouterSettings, SessionRouter};
use crate::sweeper::run_liveness_sweeper;
use anyhow::{Context, Result};
use overlink_db::Repository;
use overlink_transport::TransportListener;
use overlink_transport_quic::{QuicConfig, QuicListener};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub struct Coordinator {
    config: CoordinatorConfig,
    router: Arc<SessionRouter>,
    cancel: CancellationToken,
}

impl Coordinator {
    /// Connect the store, rebuild the address pool and assemble the router.
    pub async fn new(config: CoordinatorConfig) -> Result<Self> {
        let mut options = sea_orm::ConnectOptions::new(config.database.url());
        options
            .max_connections(config.database.max_open_conns)
            .min_connections(config.database.max_idle_conns)
            .max_lifetime(Duration::from_secs(config.database.conn_max_lifetime));

        let db = sea_orm::Database::connect(options)
            .await
            .context("Failed to connect to database")?;
        overlink_db::migrate(&db)
            .await
            .context("Failed to run migrations")?;
        let repo = Repository::new(db);

        let pool = Arc::new(
            AddressPool::new(&config.network.overlay_cidr)
                .context("Failed to build address pool")?,
        );

        let gateway_ip = if config.network.gateway_ip.is_empty() {
            pool.gateway()
        } else {
            config
                .network
                .gateway_ip
                .parse()
                .context("Invalid gateway IP")?
        };

        let settings = RouterSettings {
            gateway_ip,
            overlay_prefix: pool.prefix_len(),
            mtu: config.network.mtu,
            keepalive_interval_secs: config.network.keepalive_interval,
            keepalive_timeout_secs: config.network.keepalive_timeout,
        };

        let router = Arc::new(SessionRouter::new(repo, pool, settings));
        router
            .rebuild_pool()
            .await
            .context("Failed to rebuild address pool")?;

        Ok(Self {
            config,
            router,
            cancel: CancellationToken::new(),
        })
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the accept loop until cancelled.
    pub async fn run(self) -> Result<()> {
        let listen: SocketAddr = self
            .config
            .listen
            .parse()
            .context("Invalid listen address")?;

        let quic_config = Arc::new(
            QuicConfig::server_default(&self.config.cert_file, &self.config.key_file)
                .with_keep_alive(Duration::from_secs(
                    self.config.network.keepalive_interval as u64,
                )),
        );
        let listener =
            QuicListener::new(listen, quic_config).context("Failed to bind QUIC listener")?;

        info!(
            %listen,
            overlay = %self.config.network.overlay_cidr,
            "Coordinator listening"
        );

        let sweeper = tokio::spawn(run_liveness_sweeper(
            self.router.clone(),
            self.cancel.clone(),
        ));

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((connection, peer)) => {
                            let router = self.router.clone();
                            tokio::spawn(async move {
                                router.handle_connection(Arc::new(connection), peer).await;
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Listener failed");
                            break;
                        }
                    }
                }
                _ = self.cancel.cancelled() => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }

        listener.close().await;
        self.cancel.cancel();
        let _ = sweeper.await;

        Ok(())
    }
}
