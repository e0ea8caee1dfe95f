//! Protocol message types

use serde::{Deserialize, Serialize};

/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Protocol versions the coordinator accepts.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["1.0.0"];

/// Role an agent plays in the overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentKind {
    /// Presents a virtual interface to its host and funnels traffic into the overlay
    Client,
    /// Takes packets off the overlay and emits them onto a physical network
    Gateway,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Client => "client",
            AgentKind::Gateway => "gateway",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "client" => Some(AgentKind::Client),
            "gateway" => Some(AgentKind::Gateway),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reported agent status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentStatus {
    Online,
    Offline,
    Error,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Online => "online",
            AgentStatus::Offline => "offline",
            AgentStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Action a routing rule applies to its destination block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteAction {
    /// Route through the overlay via a gateway
    Forward,
    /// Leave to the host's existing default route
    Direct,
    /// Block (enforcement is host-dependent)
    Deny,
}

impl RouteAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteAction::Forward => "forward",
            RouteAction::Direct => "direct",
            RouteAction::Deny => "deny",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "forward" => Some(RouteAction::Forward),
            "direct" => Some(RouteAction::Direct),
            "deny" => Some(RouteAction::Deny),
            _ => None,
        }
    }
}

/// Why a registration was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// Agent speaks a protocol version outside the supported set
    IncompatibleProtocol,
    /// Unknown api key or inactive user
    Unauthenticated,
    /// Agent id is owned by a different user
    PermissionDenied,
    /// Overlay address pool has no free addresses
    AddressPoolExhausted,
    /// Coordinator-side failure (database, etc.)
    Internal,
}

impl RejectReason {
    /// Whether the agent should give up instead of retrying with backoff.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RejectReason::IncompatibleProtocol | RejectReason::PermissionDenied
        )
    }
}

/// Descriptive information an agent reports about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMetadata {
    pub os: String,
    pub arch: String,
    pub version: String,
    pub hostname: String,
}

impl Default for AgentMetadata {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            hostname: String::new(),
        }
    }
}

/// Traffic counters reported in heartbeats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub errors: u64,
    pub drops: u64,
}

/// Network parameters the coordinator hands to an accepted agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Coordinator-side gateway address inside the overlay
    pub gateway_ip: String,
    /// Prefix length of the overlay block, used to mask the virtual interface
    pub overlay_prefix: u8,
    pub mtu: u16,
    pub keepalive_interval_secs: u16,
    pub keepalive_timeout_secs: u16,
}

/// A routing rule as returned by `GetRoutes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    pub rule_id: i64,
    pub action: RouteAction,
    /// Destination block in CIDR notation
    pub destination: String,
    /// Gateway agent id, only meaningful for `Forward`
    pub gateway_id: Option<String>,
    pub priority: i32,
    pub enabled: bool,
}

/// Control-plane protocol messages.
///
/// Every RPC occupies one transport stream; the first message on a stream
/// identifies the call. `Packet` doubles as the relay-stream frame: a frame
/// with an empty payload binds the stream to its session, subsequent frames
/// carry raw IP datagrams.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ControlMessage {
    Register {
        agent_id: String,
        api_key: String,
        kind: AgentKind,
        protocol_version: String,
        /// Declared bandwidth cap in KB/s, 0 for unlimited
        bandwidth_kbps: u32,
        metadata: AgentMetadata,
    },
    RegisterAck {
        accepted: bool,
        session_id: String,
        assigned_ip: String,
        server_version: String,
        minimum_supported_version: String,
        settings: Option<ServerSettings>,
        reject: Option<RejectReason>,
        error_message: Option<String>,
    },

    Heartbeat {
        session_id: String,
        timestamp_ms: u64,
        stats: TrafficStats,
    },
    HeartbeatAck {
        alive: bool,
        /// Echo of the request timestamp
        timestamp_ms: u64,
    },

    /// Relay frame. An empty payload binds the stream to `session_id`.
    Packet {
        session_id: String,
        source_agent_id: String,
        destination_agent_id: Option<String>,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },

    GetRoutes {
        agent_id: String,
    },
    Routes {
        rules: Vec<RouteRule>,
    },

    UpdateStatus {
        agent_id: String,
        status: AgentStatus,
    },
    StatusAck {
        acknowledged: bool,
        message: String,
    },

    /// Sent by the coordinator before it closes a stream
    Disconnect {
        reason: String,
    },
}
