//! Overlink protocol: message types and wire codec
//!
//! Everything that crosses the wire between an agent and the coordinator is
//! a [`ControlMessage`], framed by [`ControlCodec`] as a u32 length prefix
//! followed by a bincode body.

pub mod codec;
pub mod messages;

pub use codec::{CodecError, ControlCodec};
pub use messages::{
    AgentKind, AgentMetadata, AgentStatus, ControlMessage, RejectReason, RouteAction, RouteRule,
    ServerSettings, TrafficStats, PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
};
