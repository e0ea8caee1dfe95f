//! Agent runtime
//!
//! Drives the connection state machine: dial the coordinator, register,
//! bring up the virtual interface, install client routes, then shuttle
//! packets between the interface and the relay stream until something
//! breaks. Transport failures rebuild the session (the interface stays
//! up); device failures are fatal and tear everything down.

use crate::config::{AgentConfig, AgentMode};
use crate::netdev::{InterfaceProvider, RouteInstaller, VirtualInterface};
use crate::reconnect::{ReconnectConfig, ReconnectManager};
use crate::stats::TrafficCounters;
use overlink_proto::{
    AgentMetadata, ControlMessage, RejectReason, RouteAction, RouteRule, ServerSettings,
    PROTOCOL_VERSION,
};
use overlink_transport::{
    TransportConnection, TransportConnector, TransportError, TransportResult, TransportStream,
};
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Hard ceiling on a single registration round-trip.
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

/// Ceiling on a GetRoutes round-trip.
const ROUTES_TIMEOUT: Duration = Duration::from_secs(10);

/// Frames buffered between the main loop and the relay stream pump.
const RELAY_QUEUE_DEPTH: usize = 64;

/// Read-buffer slack over the negotiated MTU.
const BUFFER_MARGIN: usize = 64;

/// Default interface name; the host may rename it out of band.
const INTERFACE_NAME: &str = "tun0";

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Address resolution failed: {0}")]
    AddressResolution(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Device error: {0}")]
    Netdev(#[from] crate::netdev::NetdevError),

    #[error("Registration rejected: {message}")]
    Rejected {
        reason: Option<RejectReason>,
        message: String,
    },

    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl AgentError {
    /// Whether retrying with backoff cannot help.
    pub fn is_fatal(&self) -> bool {
        match self {
            AgentError::Config(_) | AgentError::Netdev(_) => true,
            AgentError::Rejected { reason, .. } => {
                reason.map_or(false, |reason| reason.is_fatal())
            }
            _ => false,
        }
    }
}

/// Why a connected session ended.
enum SessionEnd {
    /// Shutdown was requested; stop the runtime
    Shutdown,
    /// The session broke; redial and re-register
    Rebuild,
}

/// The agent runtime. Generic over the transport connector and the device
/// layer so tests can run it entirely in process.
pub struct AgentRuntime<C, P, R>
where
    C: TransportConnector,
    P: InterfaceProvider,
    R: RouteInstaller,
{
    config: AgentConfig,
    agent_id: String,
    connector: C,
    provider: P,
    routes: R,
    counters: Arc<TrafficCounters>,
    cancel: CancellationToken,
    interface: Option<P::Iface>,
    routes_installed: bool,
}

impl<C, P, R> AgentRuntime<C, P, R>
where
    C: TransportConnector,
    P: InterfaceProvider,
    R: RouteInstaller,
    <C::Connection as TransportConnection>::Stream: 'static,
{
    pub fn new(config: AgentConfig, connector: C, provider: P, routes: R) -> Self {
        let agent_id = config.effective_agent_id();
        Self {
            config,
            agent_id,
            connector,
            provider,
            routes,
            counters: Arc::new(TrafficCounters::new()),
            cancel: CancellationToken::new(),
            interface: None,
            routes_installed: false,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn counters(&self) -> Arc<TrafficCounters> {
        self.counters.clone()
    }

    /// Token that stops the runtime; safe to clone into signal handlers.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run until shutdown or a fatal error. Transient failures are retried
    /// indefinitely with capped, jittered backoff.
    pub async fn run(&mut self) -> Result<(), AgentError> {
        info!(agent_id = %self.agent_id, mode = ?self.config.mode, "Starting agent");

        let mut reconnect = ReconnectManager::new(ReconnectConfig::default());

        let result = loop {
            if self.cancel.is_cancelled() {
                break Ok(());
            }

            match self.run_session(&mut reconnect).await {
                Ok(SessionEnd::Shutdown) => break Ok(()),
                Ok(SessionEnd::Rebuild) => {
                    info!(agent_id = %self.agent_id, "Session lost, rebuilding");
                }
                Err(e) if e.is_fatal() => {
                    error!(agent_id = %self.agent_id, error = %e, "Fatal error");
                    break Err(e);
                }
                Err(e) => {
                    warn!(agent_id = %self.agent_id, error = %e, "Session attempt failed");
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break Ok(()),
                wait = reconnect.wait() => {
                    if let Err(e) = wait {
                        break Err(AgentError::RegistrationFailed(e.to_string()));
                    }
                }
            }
        };

        self.teardown().await;

        info!(agent_id = %self.agent_id, "Agent stopped");
        result
    }

    /// One full dial → register → relay cycle.
    async fn run_session(
        &mut self,
        reconnect: &mut ReconnectManager,
    ) -> Result<SessionEnd, AgentError> {
        let (addr, server_name) = self.resolve_server().await?;

        info!(agent_id = %self.agent_id, server = %self.config.server, "Dialing coordinator");
        let connection = self.connector.connect(addr, &server_name).await?;

        let (session_id, assigned_ip, settings) = match self.register(&connection).await {
            Ok(accepted) => accepted,
            Err(e) => {
                connection.close(0, "registration failed").await;
                return Err(e);
            }
        };
        reconnect.reset();

        self.ensure_interface(assigned_ip, &settings).await?;

        if self.config.mode == AgentMode::Client && !self.routes_installed {
            self.apply_routes(&connection).await?;
            self.routes_installed = true;
        }

        let heartbeat = connection.open_stream().await?;

        let mut relay = connection.open_stream().await?;
        relay
            .send_message(&ControlMessage::Packet {
                session_id: session_id.clone(),
                source_agent_id: self.agent_id.clone(),
                destination_agent_id: None,
                payload: Vec::new(),
            })
            .await?;

        let end = self.relay_session(&session_id, &settings, heartbeat, relay).await;

        connection.close(0, "session over").await;
        end
    }

    async fn resolve_server(&self) -> Result<(SocketAddr, String), AgentError> {
        let server = &self.config.server;
        let host = server
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(server)
            .to_string();

        let addr = tokio::net::lookup_host(server)
            .await
            .map_err(|e| {
                AgentError::AddressResolution(format!("failed to resolve {}: {}", server, e))
            })?
            .next()
            .ok_or_else(|| {
                AgentError::AddressResolution(format!("no addresses found for {}", server))
            })?;

        Ok((addr, host))
    }

    async fn register(
        &self,
        connection: &C::Connection,
    ) -> Result<(String, Ipv4Addr, ServerSettings), AgentError> {
        info!(agent_id = %self.agent_id, "Registering with coordinator");

        let mut stream = connection.open_stream().await?;

        let hostname = {
            let prefix: String = self.agent_id.chars().take(8).collect();
            format!("agent-{}", prefix)
        };
        stream
            .send_message(&ControlMessage::Register {
                agent_id: self.agent_id.clone(),
                api_key: self.config.user_key.clone(),
                kind: self.config.mode.kind(),
                protocol_version: PROTOCOL_VERSION.to_string(),
                bandwidth_kbps: self.config.bandwidth,
                metadata: AgentMetadata {
                    hostname,
                    ..AgentMetadata::default()
                },
            })
            .await?;

        let reply = tokio::time::timeout(REGISTER_TIMEOUT, stream.recv_message())
            .await
            .map_err(|_| AgentError::RegistrationFailed("registration timed out".to_string()))??;

        match reply {
            Some(ControlMessage::RegisterAck {
                accepted: true,
                session_id,
                assigned_ip,
                settings: Some(settings),
                ..
            }) => {
                let ip: Ipv4Addr = assigned_ip.parse().map_err(|_| {
                    AgentError::RegistrationFailed(format!(
                        "unusable assigned ip '{}'",
                        assigned_ip
                    ))
                })?;
                info!(agent_id = %self.agent_id, %session_id, %ip, "Registration successful");
                Ok((session_id, ip, settings))
            }
            Some(ControlMessage::RegisterAck {
                accepted: false,
                reject,
                error_message,
                ..
            }) => Err(AgentError::Rejected {
                reason: reject,
                message: error_message.unwrap_or_else(|| "rejected".to_string()),
            }),
            Some(ControlMessage::RegisterAck { .. }) => Err(AgentError::Protocol(
                "registration accepted without server settings".to_string(),
            )),
            Some(other) => Err(AgentError::Protocol(format!(
                "unexpected registration response: {:?}",
                other
            ))),
            None => Err(AgentError::RegistrationFailed(
                "stream closed during registration".to_string(),
            )),
        }
    }

    /// Create and configure the interface on first registration; later
    /// sessions reuse it untouched.
    async fn ensure_interface(
        &mut self,
        ip: Ipv4Addr,
        settings: &ServerSettings,
    ) -> Result<(), AgentError> {
        if self.interface.is_some() {
            return Ok(());
        }

        let iface = self.provider.open(INTERFACE_NAME, settings.mtu).await?;
        iface.set_ip(ip, settings.overlay_prefix).await?;
        iface.set_mtu(settings.mtu).await?;
        iface.up().await?;

        info!(
            interface = iface.name(),
            %ip,
            prefix = settings.overlay_prefix,
            mtu = settings.mtu,
            "Virtual interface up"
        );

        self.interface = Some(iface);
        Ok(())
    }

    /// Install client routes from the configured rule list merged with the
    /// coordinator's, ascending priority.
    async fn apply_routes(&self, connection: &C::Connection) -> Result<(), AgentError> {
        let mut rules: Vec<RouteRule> = self
            .config
            .rules
            .iter()
            .filter_map(|rule| {
                rule.action().map(|action| RouteRule {
                    rule_id: 0,
                    action,
                    destination: rule.destination.clone(),
                    gateway_id: rule.gateway.clone(),
                    priority: rule.priority,
                    enabled: true,
                })
            })
            .collect();

        match self.fetch_routes(connection).await {
            Ok(server_rules) => rules.extend(server_rules),
            Err(e) => {
                warn!(error = %e, "Could not fetch coordinator routes, using configured rules only")
            }
        }

        rules.retain(|rule| rule.enabled);
        rules.sort_by_key(|rule| rule.priority);

        let interface_name = self
            .interface
            .as_ref()
            .map(|iface| iface.name().to_string());

        let mut seen = HashSet::new();
        for rule in rules {
            if !seen.insert(rule.destination.clone()) {
                continue;
            }

            match rule.action {
                RouteAction::Forward => {
                    self.routes
                        .add_route(&rule.destination, None, interface_name.as_deref())
                        .await?;
                    info!(destination = %rule.destination, "Route installed");
                }
                RouteAction::Direct => {
                    debug!(destination = %rule.destination, "Direct rule, host routing applies");
                }
                RouteAction::Deny => {
                    warn!(destination = %rule.destination, "Deny rule configured but not enforced");
                }
            }
        }

        Ok(())
    }

    async fn fetch_routes(
        &self,
        connection: &C::Connection,
    ) -> Result<Vec<RouteRule>, AgentError> {
        let mut stream = connection.open_stream().await?;
        stream
            .send_message(&ControlMessage::GetRoutes {
                agent_id: self.agent_id.clone(),
            })
            .await?;

        let reply = tokio::time::timeout(ROUTES_TIMEOUT, stream.recv_message())
            .await
            .map_err(|_| AgentError::Protocol("route fetch timed out".to_string()))??;

        match reply {
            Some(ControlMessage::Routes { rules }) => Ok(rules),
            Some(other) => Err(AgentError::Protocol(format!(
                "unexpected routes response: {:?}",
                other
            ))),
            None => Err(AgentError::Protocol(
                "stream closed during route fetch".to_string(),
            )),
        }
    }

    /// Shuttle packets and heartbeats until the session ends.
    async fn relay_session(
        &self,
        session_id: &str,
        settings: &ServerSettings,
        mut heartbeat: <C::Connection as TransportConnection>::Stream,
        relay: <C::Connection as TransportConnection>::Stream,
    ) -> Result<SessionEnd, AgentError> {
        let iface = self
            .interface
            .as_ref()
            .ok_or_else(|| AgentError::Config("virtual interface missing".to_string()))?;

        let (uplink_tx, uplink_rx) = mpsc::channel(RELAY_QUEUE_DEPTH);
        let (downlink_tx, mut downlink_rx) = mpsc::channel(RELAY_QUEUE_DEPTH);
        let pump_cancel = self.cancel.child_token();
        let pump = tokio::spawn(relay_pump(relay, uplink_rx, downlink_tx, pump_cancel.clone()));

        let heartbeat_interval = Duration::from_secs(settings.keepalive_interval_secs.max(1) as u64);
        let heartbeat_limit = Duration::from_secs(settings.keepalive_timeout_secs.max(1) as u64);
        let mut ticker = tokio::time::interval(heartbeat_interval);
        ticker.tick().await; // first tick completes immediately

        let mut buf = vec![0u8; settings.mtu as usize + BUFFER_MARGIN];

        enum Event {
            Stop,
            HeartbeatTick,
            Uplink(Result<usize, crate::netdev::NetdevError>),
            Downlink(Option<ControlMessage>),
        }

        let end = loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => Event::Stop,
                _ = ticker.tick() => Event::HeartbeatTick,
                read = iface.read_packet(&mut buf) => Event::Uplink(read),
                frame = downlink_rx.recv() => Event::Downlink(frame),
            };

            match event {
                Event::Stop => break Ok(SessionEnd::Shutdown),

                Event::HeartbeatTick => {
                    let beat = ControlMessage::Heartbeat {
                        session_id: session_id.to_string(),
                        timestamp_ms: now_ms(),
                        stats: self.counters.snapshot(),
                    };
                    let exchange = async {
                        heartbeat.send_message(&beat).await?;
                        heartbeat.recv_message().await
                    };
                    match tokio::time::timeout(heartbeat_limit, exchange).await {
                        Ok(Ok(Some(ControlMessage::HeartbeatAck { .. }))) => {
                            debug!(agent_id = %self.agent_id, "Heartbeat acknowledged");
                        }
                        Ok(Ok(Some(ControlMessage::Disconnect { reason }))) => {
                            info!(%reason, "Coordinator ended heartbeat stream");
                            break Ok(SessionEnd::Rebuild);
                        }
                        Ok(Ok(Some(other))) => {
                            warn!(message = ?other, "Unexpected heartbeat response");
                        }
                        Ok(Ok(None)) => break Ok(SessionEnd::Rebuild),
                        Ok(Err(e)) => {
                            warn!(error = %e, "Heartbeat failed");
                            break Ok(SessionEnd::Rebuild);
                        }
                        Err(_) => {
                            warn!("Heartbeat timed out");
                            break Ok(SessionEnd::Rebuild);
                        }
                    }
                }

                Event::Uplink(Ok(0)) => continue,
                Event::Uplink(Ok(n)) => {
                    let frame = ControlMessage::Packet {
                        session_id: session_id.to_string(),
                        source_agent_id: self.agent_id.clone(),
                        destination_agent_id: None,
                        payload: buf[..n].to_vec(),
                    };
                    if uplink_tx.send(frame).await.is_err() {
                        break Ok(SessionEnd::Rebuild);
                    }
                    self.counters.record_sent(n as u64);
                }
                Event::Uplink(Err(e)) => {
                    error!(error = %e, "Virtual interface read failed");
                    self.counters.record_error();
                    break Err(AgentError::Netdev(e));
                }

                Event::Downlink(Some(ControlMessage::Packet { payload, .. })) => {
                    match iface.write_packet(&payload).await {
                        Ok(_) => self.counters.record_received(payload.len() as u64),
                        Err(e) => {
                            // Keep relaying; the datagram is lost, not the session
                            warn!(error = %e, "Interface write failed, dropping packet");
                            self.counters.record_drop();
                        }
                    }
                }
                Event::Downlink(Some(ControlMessage::Disconnect { reason })) => {
                    info!(%reason, "Coordinator ended relay stream");
                    break Ok(SessionEnd::Rebuild);
                }
                Event::Downlink(Some(other)) => {
                    warn!(message = ?other, "Unexpected message on relay stream");
                }
                Event::Downlink(None) => break Ok(SessionEnd::Rebuild),
            }
        };

        pump_cancel.cancel();
        let _ = pump.await;

        end
    }

    /// Final cleanup: routes out in reverse order, interface down and
    /// closed.
    async fn teardown(&mut self) {
        if self.routes_installed {
            if let Err(e) = self.routes.cleanup_all().await {
                warn!(error = %e, "Route cleanup failed");
            }
            self.routes_installed = false;
        }

        if let Some(iface) = self.interface.take() {
            if let Err(e) = iface.down().await {
                warn!(error = %e, "Failed to bring interface down");
            }
            if let Err(e) = iface.close().await {
                warn!(error = %e, "Failed to close interface");
            }
        }
    }
}

/// Owns the relay stream: forwards queued uplink frames to the
/// coordinator and inbound frames to the main loop. Dropping the downlink
/// sender is how the pump reports a dead stream.
async fn relay_pump<S: TransportStream>(
    mut stream: S,
    mut uplink: mpsc::Receiver<ControlMessage>,
    downlink: mpsc::Sender<ControlMessage>,
    cancel: CancellationToken,
) {
    enum Step {
        Stop,
        Outbound(Option<ControlMessage>),
        Inbound(TransportResult<Option<ControlMessage>>),
    }

    loop {
        let step = tokio::select! {
            _ = cancel.cancelled() => Step::Stop,
            frame = uplink.recv() => Step::Outbound(frame),
            msg = stream.recv_message() => Step::Inbound(msg),
        };

        match step {
            Step::Stop | Step::Outbound(None) => {
                let _ = stream.finish().await;
                return;
            }
            Step::Outbound(Some(frame)) => {
                if stream.send_message(&frame).await.is_err() {
                    return;
                }
            }
            Step::Inbound(Ok(Some(msg))) => {
                if downlink.send(msg).await.is_err() {
                    return;
                }
            }
            Step::Inbound(Ok(None)) => return,
            Step::Inbound(Err(e)) => {
                debug!(error = %e, "Relay stream error");
                return;
            }
        }
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
