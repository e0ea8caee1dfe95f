//! Overlink agent
//!
//! Attaches a host to the overlay as either a client (virtual interface +
//! host routes funneling traffic to the coordinator) or a gateway
//! (emitting overlay packets onto a local network).

pub mod config;
pub mod netdev;
pub mod reconnect;
pub mod runtime;
pub mod stats;

#[cfg(target_os = "linux")]
pub mod tun_linux;

pub use config::{AgentConfig, AgentMode, ConfigError, RuleConfig};
pub use netdev::{InterfaceProvider, IpRouteInstaller, NetdevError, RouteInstaller, VirtualInterface};
pub use reconnect::{ReconnectConfig, ReconnectManager};
pub use runtime::{AgentError, AgentRuntime};
pub use stats::TrafficCounters;
