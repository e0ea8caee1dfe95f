//! Session router
//!
//! One router instance per coordinator process. Every accepted transport
//! stream carries exactly one call, identified by its first message:
//! unary `Register`/`GetRoutes`/`UpdateStatus`, or the long-lived
//! `Heartbeat` and relay streams. Faults are isolated to the offending
//! session; the router itself never aborts.

use crate::pool::{AddressPool, PoolError};
use crate::session::{SessionEntry, SessionTable};
use overlink_db::entities::agent::{AgentRole, AgentState};
use overlink_db::{AuditEvent, NewAgent, NewSession, Repository};
use overlink_proto::{
    AgentKind, AgentMetadata, AgentStatus, ControlMessage, RejectReason, RouteAction, RouteRule,
    ServerSettings, TrafficStats, PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
};
use overlink_transport::{TransportConnection, TransportResult, TransportStream};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Hard ceiling on a single registration.
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

/// Slack over MTU tolerated on relay payloads.
const PAYLOAD_MARGIN: usize = 64;

/// How long session replacement waits for the displaced relay stream to
/// tear down before acknowledging the new registration.
const REPLACEMENT_CLOSE_LIMIT: Duration = Duration::from_secs(1);

/// Network parameters the router hands out and enforces.
#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub gateway_ip: Ipv4Addr,
    pub overlay_prefix: u8,
    pub mtu: u16,
    pub keepalive_interval_secs: u16,
    pub keepalive_timeout_secs: u16,
}

impl RouterSettings {
    fn to_server_settings(&self) -> ServerSettings {
        ServerSettings {
            gateway_ip: self.gateway_ip.to_string(),
            overlay_prefix: self.overlay_prefix,
            mtu: self.mtu,
            keepalive_interval_secs: self.keepalive_interval_secs,
            keepalive_timeout_secs: self.keepalive_timeout_secs,
        }
    }
}

/// Coordinator-side session router.
pub struct SessionRouter {
    repo: Repository,
    pool: Arc<AddressPool>,
    sessions: Arc<SessionTable>,
    settings: RouterSettings,
}

impl SessionRouter {
    pub fn new(repo: Repository, pool: Arc<AddressPool>, settings: RouterSettings) -> Self {
        Self {
            repo,
            pool,
            sessions: Arc::new(SessionTable::new()),
            settings,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.sessions
    }

    pub fn pool(&self) -> &Arc<AddressPool> {
        &self.pool
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.keepalive_timeout_secs as u64)
    }

    /// Re-adopt persisted allocations after a restart so stickiness
    /// survives coordinator downtime.
    pub async fn rebuild_pool(&self) -> Result<(), sea_orm::DbErr> {
        let agents = self.repo.agents_with_address().await?;
        let mut adopted = 0usize;

        for agent in agents {
            let ip: Ipv4Addr = match agent.ip_address.parse() {
                Ok(ip) => ip,
                Err(_) => {
                    warn!(
                        agent_id = %agent.id,
                        address = %agent.ip_address,
                        "Skipping unparseable persisted overlay address"
                    );
                    continue;
                }
            };
            match self.pool.allocate_specific(&agent.id, ip) {
                Ok(()) => adopted += 1,
                Err(e) => warn!(
                    agent_id = %agent.id,
                    address = %ip,
                    error = %e,
                    "Could not re-adopt persisted overlay address"
                ),
            }
        }

        info!(adopted, "Rebuilt address pool from persisted agents");
        Ok(())
    }

    /// Drive one transport connection: accept streams until the peer goes
    /// away, one task per stream.
    pub async fn handle_connection<C>(self: Arc<Self>, connection: Arc<C>, peer: SocketAddr)
    where
        C: TransportConnection + 'static,
        C::Stream: 'static,
    {
        info!(%peer, connection_id = %connection.connection_id(), "Agent connection established");

        loop {
            match connection.accept_stream().await {
                Ok(Some(stream)) => {
                    let router = self.clone();
                    let connection_id = connection.connection_id();
                    tokio::spawn(async move {
                        router.handle_stream(stream, connection_id, peer).await;
                    });
                }
                Ok(None) => {
                    debug!(%peer, "Connection closed");
                    break;
                }
                Err(e) => {
                    warn!(%peer, error = %e, "Failed to accept stream");
                    break;
                }
            }
        }
    }

    async fn handle_stream<S: TransportStream + 'static>(
        self: Arc<Self>,
        mut stream: S,
        connection_id: String,
        peer: SocketAddr,
    ) {
        let first = match stream.recv_message().await {
            Ok(Some(msg)) => msg,
            Ok(None) => return,
            Err(e) => {
                debug!(%peer, error = %e, "Stream failed before first message");
                return;
            }
        };

        match first {
            ControlMessage::Register {
                agent_id,
                api_key,
                kind,
                protocol_version,
                bandwidth_kbps,
                metadata,
            } => {
                let ack = match tokio::time::timeout(
                    REGISTER_TIMEOUT,
                    self.register(
                        agent_id,
                        api_key,
                        kind,
                        protocol_version,
                        bandwidth_kbps,
                        metadata,
                        &connection_id,
                        peer,
                    ),
                )
                .await
                {
                    Ok(ack) => ack,
                    Err(_) => Self::reject_ack(RejectReason::Internal, "registration timed out"),
                };

                if let Err(e) = stream.send_message(&ack).await {
                    warn!(%peer, error = %e, "Failed to send registration response");
                }
                let _ = stream.finish().await;
            }

            ControlMessage::Heartbeat {
                session_id,
                timestamp_ms,
                stats,
            } => {
                self.handle_heartbeat(stream, session_id, timestamp_ms, stats)
                    .await;
            }

            ControlMessage::Packet {
                session_id,
                source_agent_id,
                destination_agent_id,
                payload,
            } => {
                self.handle_relay(
                    stream,
                    session_id,
                    source_agent_id,
                    destination_agent_id,
                    payload,
                )
                .await;
            }

            ControlMessage::GetRoutes { agent_id } => {
                self.handle_get_routes(stream, agent_id).await;
            }

            ControlMessage::UpdateStatus { agent_id, status } => {
                self.handle_update_status(stream, agent_id, status).await;
            }

            other => {
                warn!(%peer, message = ?other, "Unexpected first message on stream");
                let _ = stream
                    .send_message(&ControlMessage::Disconnect {
                        reason: "unexpected message".to_string(),
                    })
                    .await;
                let _ = stream.finish().await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Register
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn register(
        &self,
        agent_id: String,
        api_key: String,
        kind: AgentKind,
        protocol_version: String,
        bandwidth_kbps: u32,
        metadata: AgentMetadata,
        connection_id: &str,
        peer: SocketAddr,
    ) -> ControlMessage {
        info!(%agent_id, %kind, %peer, "Registration request");

        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&protocol_version.as_str()) {
            return Self::reject_ack(RejectReason::IncompatibleProtocol, "incompatible");
        }

        let user = match self.repo.user_by_api_key(&api_key).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                self.audit_register(None, &agent_id, peer, false, "unauthenticated")
                    .await;
                return Self::reject_ack(RejectReason::Unauthenticated, "authentication failed");
            }
            Err(e) => {
                error!(%agent_id, error = %e, "User lookup failed");
                return Self::reject_ack(RejectReason::Internal, "storage failure");
            }
        };

        // Resolve the sticky overlay address, creating the agent row on
        // first contact.
        let overlay_ip = match self.repo.agent_by_id(&agent_id).await {
            Ok(Some(existing)) => {
                if existing.user_id != user.id {
                    self.audit_register(
                        Some(user.id),
                        &agent_id,
                        peer,
                        false,
                        "agent id owned by another user",
                    )
                    .await;
                    return Self::reject_ack(
                        RejectReason::PermissionDenied,
                        "agent id is owned by another user",
                    );
                }
                match self.adopt_address(&agent_id, &existing.ip_address).await {
                    Ok(ip) => ip,
                    Err(reject) => return reject,
                }
            }
            Ok(None) => {
                let ip = match self.pool.allocate(&agent_id) {
                    Ok(ip) => ip,
                    Err(PoolError::Exhausted) => {
                        self.audit_register(Some(user.id), &agent_id, peer, false, "pool exhausted")
                            .await;
                        return Self::reject_ack(
                            RejectReason::AddressPoolExhausted,
                            "address pool exhausted",
                        );
                    }
                    Err(e) => {
                        error!(%agent_id, error = %e, "Allocation failed");
                        return Self::reject_ack(RejectReason::Internal, "allocation failed");
                    }
                };

                let name = if metadata.hostname.is_empty() {
                    let prefix: String = agent_id.chars().take(8).collect();
                    format!("agent-{}", prefix)
                } else {
                    metadata.hostname.clone()
                };
                let new_agent = NewAgent {
                    id: agent_id.clone(),
                    user_id: user.id,
                    name,
                    role: role_for(kind),
                    ip_address: ip.to_string(),
                    bandwidth_limit: (bandwidth_kbps > 0).then_some(bandwidth_kbps as i32),
                    metadata: serde_json::to_string(&metadata)
                        .unwrap_or_else(|_| "{}".to_string()),
                };

                if let Err(e) = self.repo.create_agent(new_agent).await {
                    error!(%agent_id, error = %e, "Failed to persist agent");
                    let _ = self.pool.release(&agent_id);
                    return Self::reject_ack(RejectReason::Internal, "failed to persist agent");
                }

                ip
            }
            Err(e) => {
                error!(%agent_id, error = %e, "Agent lookup failed");
                return Self::reject_ack(RejectReason::Internal, "storage failure");
            }
        };

        // A new registration invalidates any live session for this agent,
        // and the old relay stream must be gone before we acknowledge.
        if let Some(displaced) = self.sessions.get_by_agent(&agent_id) {
            info!(
                %agent_id,
                old_session = %displaced.session_id,
                "Replacing live session"
            );
            self.retire_session(&displaced, "replaced by new registration")
                .await;
            displaced.wait_closed(REPLACEMENT_CLOSE_LIMIT).await;
        }

        if let Err(e) = self.repo.update_agent_status(&agent_id, AgentState::Online).await {
            warn!(%agent_id, error = %e, "Failed to mark agent online");
        }

        let session_id = Uuid::new_v4().to_string();
        let session_connection_id = format!("{}-{}", connection_id, Uuid::new_v4().simple());

        if let Err(e) = self
            .repo
            .create_session(NewSession {
                id: session_id.clone(),
                agent_id: agent_id.clone(),
                connection_id: session_connection_id.clone(),
            })
            .await
        {
            error!(%agent_id, error = %e, "Failed to persist session");
            return Self::reject_ack(RejectReason::Internal, "failed to persist session");
        }

        let entry = Arc::new(SessionEntry::new(
            session_id.clone(),
            agent_id.clone(),
            user.id,
            kind,
            overlay_ip,
            session_connection_id,
            peer,
        ));
        if let Some(raced) = self.sessions.insert(entry) {
            // Lost a race with a concurrent registration for the same agent
            self.retire_session(&raced, "replaced by new registration").await;
        }

        self.audit_register(Some(user.id), &agent_id, peer, true, "registered")
            .await;

        info!(%agent_id, %session_id, ip = %overlay_ip, "Agent registered");

        ControlMessage::RegisterAck {
            accepted: true,
            session_id,
            assigned_ip: overlay_ip.to_string(),
            server_version: PROTOCOL_VERSION.to_string(),
            minimum_supported_version: PROTOCOL_VERSION.to_string(),
            settings: Some(self.settings.to_server_settings()),
            reject: None,
            error_message: None,
        }
    }

    /// Reuse a returning agent's persisted address, falling back to a
    /// fresh allocation if the stored one is unusable.
    async fn adopt_address(
        &self,
        agent_id: &str,
        stored: &str,
    ) -> Result<Ipv4Addr, ControlMessage> {
        if let Some(current) = self.pool.get(agent_id) {
            return Ok(current);
        }

        if let Ok(ip) = stored.parse::<Ipv4Addr>() {
            match self.pool.allocate_specific(agent_id, ip) {
                Ok(()) => return Ok(ip),
                Err(e) => warn!(
                    %agent_id,
                    address = %ip,
                    error = %e,
                    "Persisted address unusable, allocating a fresh one"
                ),
            }
        }

        let ip = match self.pool.allocate(agent_id) {
            Ok(ip) => ip,
            Err(PoolError::Exhausted) => {
                return Err(Self::reject_ack(
                    RejectReason::AddressPoolExhausted,
                    "address pool exhausted",
                ))
            }
            Err(e) => {
                error!(%agent_id, error = %e, "Allocation failed");
                return Err(Self::reject_ack(RejectReason::Internal, "allocation failed"));
            }
        };

        if let Err(e) = self.repo.update_agent_address(agent_id, &ip.to_string()).await {
            warn!(%agent_id, error = %e, "Failed to persist renumbered address");
        }

        Ok(ip)
    }

    fn reject_ack(reason: RejectReason, message: &str) -> ControlMessage {
        ControlMessage::RegisterAck {
            accepted: false,
            session_id: String::new(),
            assigned_ip: String::new(),
            server_version: PROTOCOL_VERSION.to_string(),
            minimum_supported_version: PROTOCOL_VERSION.to_string(),
            settings: None,
            reject: Some(reason),
            error_message: Some(message.to_string()),
        }
    }

    // ------------------------------------------------------------------
    // Heartbeat
    // ------------------------------------------------------------------

    async fn handle_heartbeat<S: TransportStream>(
        &self,
        mut stream: S,
        session_id: String,
        timestamp_ms: u64,
        stats: TrafficStats,
    ) {
        let mut current = (session_id, timestamp_ms, stats);

        loop {
            let (session_id, timestamp_ms, stats) = current;

            let entry = match self.sessions.get(&session_id) {
                Some(entry) => entry,
                None => {
                    let _ = stream
                        .send_message(&ControlMessage::Disconnect {
                            reason: "session not found".to_string(),
                        })
                        .await;
                    let _ = stream.finish().await;
                    return;
                }
            };

            entry.touch();
            entry.record_reported_stats(stats);
            if let Err(e) = self
                .repo
                .update_session_stats(&session_id, stats.bytes_sent, stats.bytes_received)
                .await
            {
                debug!(%session_id, error = %e, "Failed to persist session stats");
            }

            if stream
                .send_message(&ControlMessage::HeartbeatAck {
                    alive: true,
                    timestamp_ms,
                })
                .await
                .is_err()
            {
                return;
            }

            current = match stream.recv_message().await {
                Ok(Some(ControlMessage::Heartbeat {
                    session_id,
                    timestamp_ms,
                    stats,
                })) => (session_id, timestamp_ms, stats),
                Ok(Some(other)) => {
                    warn!(message = ?other, "Unexpected message on heartbeat stream");
                    return;
                }
                Ok(None) => return,
                Err(e) => {
                    debug!(error = %e, "Heartbeat stream ended");
                    return;
                }
            };
        }
    }

    // ------------------------------------------------------------------
    // Relay
    // ------------------------------------------------------------------

    async fn handle_relay<S: TransportStream + 'static>(
        self: Arc<Self>,
        mut stream: S,
        session_id: String,
        source_agent_id: String,
        destination_agent_id: Option<String>,
        payload: Vec<u8>,
    ) {
        let entry = match self.sessions.get(&session_id) {
            Some(entry) if entry.agent_id == source_agent_id => entry,
            _ => {
                let _ = stream
                    .send_message(&ControlMessage::Disconnect {
                        reason: "session not found".to_string(),
                    })
                    .await;
                let _ = stream.finish().await;
                return;
            }
        };

        if entry.relay_bound() {
            warn!(%session_id, "Relay stream already active for session");
            let _ = stream
                .send_message(&ControlMessage::Disconnect {
                    reason: "relay stream already active".to_string(),
                })
                .await;
            let _ = stream.finish().await;
            return;
        }

        info!(%session_id, agent_id = %entry.agent_id, "Relay stream bound");

        // The bind frame normally has an empty payload; anything beyond
        // that is a regular packet.
        if !payload.is_empty() {
            self.route_packet(&entry, &session_id, &source_agent_id, destination_agent_id, payload);
        }

        // The pump runs in its own task so session replacement can abort
        // it, which drops the stream and ends it for the agent.
        let router = self.clone();
        let pump_entry = entry.clone();
        let pump = tokio::spawn(async move { router.relay_pump(stream, pump_entry).await });
        entry.bind_relay(pump.abort_handle());

        let _ = pump.await;

        self.retire_session(&entry, "relay stream closed").await;
        entry.mark_closed();
    }

    async fn relay_pump<S: TransportStream>(&self, mut stream: S, entry: Arc<SessionEntry>) {
        enum Step {
            Outbound(Option<ControlMessage>),
            Inbound(TransportResult<Option<ControlMessage>>),
        }

        loop {
            let step = tokio::select! {
                frame = entry.mailbox().pop() => Step::Outbound(frame),
                msg = stream.recv_message() => Step::Inbound(msg),
            };

            match step {
                Step::Outbound(Some(frame)) => {
                    if stream.send_message(&frame).await.is_err() {
                        return;
                    }
                }
                // Mailbox closed: the session was replaced or timed out
                Step::Outbound(None) => {
                    let _ = stream.finish().await;
                    return;
                }
                Step::Inbound(Ok(Some(ControlMessage::Packet {
                    session_id,
                    source_agent_id,
                    destination_agent_id,
                    payload,
                }))) => {
                    self.route_packet(
                        &entry,
                        &session_id,
                        &source_agent_id,
                        destination_agent_id,
                        payload,
                    );
                }
                Step::Inbound(Ok(Some(other))) => {
                    warn!(
                        session_id = %entry.session_id,
                        message = ?other,
                        "Unexpected message on relay stream"
                    );
                }
                Step::Inbound(Ok(None)) => return,
                Step::Inbound(Err(e)) => {
                    debug!(session_id = %entry.session_id, error = %e, "Relay stream ended");
                    return;
                }
            }
        }
    }

    /// Dispatch one packet. Never blocks and never tears anything down:
    /// undeliverable packets are counted and dropped.
    fn route_packet(
        &self,
        source: &Arc<SessionEntry>,
        session_id: &str,
        source_agent_id: &str,
        destination_agent_id: Option<String>,
        payload: Vec<u8>,
    ) {
        source.touch();

        if session_id != source.session_id || source_agent_id != source.agent_id {
            warn!(
                session_id = %source.session_id,
                claimed = %source_agent_id,
                "Packet identity does not match bound session"
            );
            source.record_drop();
            return;
        }

        if payload.len() > self.settings.mtu as usize + PAYLOAD_MARGIN {
            warn!(
                session_id = %source.session_id,
                len = payload.len(),
                "Oversized payload"
            );
            source.record_drop();
            return;
        }

        source.add_bytes_in(payload.len() as u64);

        let destination = match &destination_agent_id {
            Some(agent_id) => self.sessions.get_by_agent(agent_id),
            None => self.sessions.gateway_for_user(source.user_id),
        };

        let destination = match destination {
            Some(dest) if dest.agent_id != source.agent_id => dest,
            _ => {
                debug!(
                    session_id = %source.session_id,
                    destination = ?destination_agent_id,
                    "No route to destination"
                );
                source.record_drop();
                return;
            }
        };

        let len = payload.len();
        destination.enqueue(
            ControlMessage::Packet {
                session_id: session_id.to_string(),
                source_agent_id: source_agent_id.to_string(),
                destination_agent_id,
                payload,
            },
            len,
        );
    }

    // ------------------------------------------------------------------
    // GetRoutes / UpdateStatus
    // ------------------------------------------------------------------

    async fn handle_get_routes<S: TransportStream>(&self, mut stream: S, agent_id: String) {
        let rules = match self.repo.rules_for_agent(&agent_id).await {
            Ok(rows) => rows
                .into_iter()
                .filter_map(|row| {
                    let action = match RouteAction::from_str(&row.action) {
                        Some(action) => action,
                        None => {
                            warn!(rule_id = row.id, action = %row.action, "Unknown rule action");
                            return None;
                        }
                    };
                    Some(RouteRule {
                        rule_id: row.id,
                        action,
                        destination: row.destination,
                        gateway_id: row.gateway_id,
                        priority: row.priority,
                        enabled: row.enabled,
                    })
                })
                .collect(),
            Err(e) => {
                error!(%agent_id, error = %e, "Failed to load routing rules");
                let _ = stream
                    .send_message(&ControlMessage::Disconnect {
                        reason: "storage failure".to_string(),
                    })
                    .await;
                let _ = stream.finish().await;
                return;
            }
        };

        let _ = stream.send_message(&ControlMessage::Routes { rules }).await;
        let _ = stream.finish().await;
    }

    async fn handle_update_status<S: TransportStream>(
        &self,
        mut stream: S,
        agent_id: String,
        status: AgentStatus,
    ) {
        let result = self.repo.update_agent_status(&agent_id, state_for(status)).await;

        let ack = match result {
            Ok(()) => ControlMessage::StatusAck {
                acknowledged: true,
                message: "status updated".to_string(),
            },
            Err(e) => {
                error!(%agent_id, error = %e, "Failed to update agent status");
                ControlMessage::StatusAck {
                    acknowledged: false,
                    message: "storage failure".to_string(),
                }
            }
        };

        let _ = stream.send_message(&ack).await;
        let _ = stream.finish().await;
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Remove a session from the table and persist the transition. Safe to
    /// call from multiple paths; only the one that actually removes the
    /// entry touches the store.
    pub async fn retire_session(&self, entry: &Arc<SessionEntry>, reason: &str) {
        entry.shutdown();

        if !self.sessions.remove_if_current(entry) {
            return;
        }

        info!(
            session_id = %entry.session_id,
            agent_id = %entry.agent_id,
            reason,
            "Session terminated"
        );

        if let Err(e) = self.repo.delete_session(&entry.session_id).await {
            warn!(session_id = %entry.session_id, error = %e, "Failed to delete session row");
        }
        // The overlay address stays allocated: stickiness across reconnects
        if let Err(e) = self
            .repo
            .update_agent_status(&entry.agent_id, AgentState::Offline)
            .await
        {
            warn!(agent_id = %entry.agent_id, error = %e, "Failed to mark agent offline");
        }

        let event = AuditEvent {
            user_id: Some(entry.user_id),
            agent_id: Some(entry.agent_id.clone()),
            action: "session.terminate".to_string(),
            resource_type: "session".to_string(),
            resource_id: entry.session_id.clone(),
            ip_address: entry.peer_addr.to_string(),
            success: true,
            details: Some(
                serde_json::json!({
                    "reason": reason,
                    "bytes_in": entry.bytes_in(),
                    "bytes_out": entry.bytes_out(),
                    "drops": entry.drops(),
                })
                .to_string(),
            ),
        };
        if let Err(e) = self.repo.record_audit(event).await {
            warn!(error = %e, "Failed to record audit entry");
        }
    }

    async fn audit_register(
        &self,
        user_id: Option<Uuid>,
        agent_id: &str,
        peer: SocketAddr,
        success: bool,
        detail: &str,
    ) {
        let event = AuditEvent {
            user_id,
            agent_id: Some(agent_id.to_string()),
            action: "agent.register".to_string(),
            resource_type: "agent".to_string(),
            resource_id: agent_id.to_string(),
            ip_address: peer.to_string(),
            success,
            details: Some(serde_json::json!({ "reason": detail }).to_string()),
        };
        if let Err(e) = self.repo.record_audit(event).await {
            warn!(error = %e, "Failed to record audit entry");
        }
    }
}

fn role_for(kind: AgentKind) -> AgentRole {
    match kind {
        AgentKind::Client => AgentRole::Client,
        AgentKind::Gateway => AgentRole::Gateway,
    }
}

fn state_for(status: AgentStatus) -> AgentState {
    match status {
        AgentStatus::Online => AgentState::Online,
        AgentStatus::Offline => AgentState::Offline,
        AgentStatus::Error => AgentState::Error,
    }
}
