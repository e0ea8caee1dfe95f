//! Agent configuration
//!
//! Loaded from a JSON document passed via `--config`. Clients authenticate
//! with `user_key` and may carry routing rules; gateways must pin their
//! `id` so the coordinator keeps handing them the same overlay address.

use ipnet::Ipv4Net;
use overlink_proto::{AgentKind, RouteAction};
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    Client,
    Gateway,
}

impl AgentMode {
    pub fn kind(&self) -> AgentKind {
        match self {
            AgentMode::Client => AgentKind::Client,
            AgentMode::Gateway => AgentKind::Gateway,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub mode: AgentMode,

    /// Coordinator address, "host:port"
    pub server: String,

    /// Api key presented at registration (required for clients)
    #[serde(default)]
    pub user_key: String,

    /// Stable agent identity (required for gateways, generated otherwise)
    #[serde(default, rename = "id")]
    pub agent_id: String,

    /// Declared bandwidth cap in KB/s, 0 for unlimited
    #[serde(default)]
    pub bandwidth: u32,

    /// Skip coordinator certificate verification (debug only)
    #[serde(default)]
    pub insecure_skip_verify: bool,

    /// Client-side routing policy
    #[serde(default)]
    pub rules: Vec<RuleConfig>,

    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleConfig {
    /// "forward", "direct" or "deny"
    pub action: String,

    /// Destination block in CIDR notation
    pub destination: String,

    /// Gateway agent id, only meaningful for "forward"
    #[serde(default)]
    pub gateway: Option<String>,

    #[serde(default = "default_rule_priority")]
    pub priority: i32,
}

impl RuleConfig {
    pub fn action(&self) -> Option<RouteAction> {
        RouteAction::from_str(&self.action)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub file: String,
    /// "json" or "text"
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: String::new(),
            format: "text".to_string(),
        }
    }
}

fn default_rule_priority() -> i32 {
    100
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.is_empty() {
            return Err(ConfigError::Invalid("server address is required".into()));
        }
        if !self.server.contains(':') {
            return Err(ConfigError::Invalid(format!(
                "server address '{}' must be host:port",
                self.server
            )));
        }

        match self.mode {
            AgentMode::Client => {
                if self.user_key.is_empty() {
                    return Err(ConfigError::Invalid(
                        "user_key is required for client mode".into(),
                    ));
                }
            }
            AgentMode::Gateway => {
                if self.agent_id.is_empty() {
                    return Err(ConfigError::Invalid("id is required for gateway mode".into()));
                }
                if !self.rules.is_empty() {
                    return Err(ConfigError::Invalid(
                        "rules are only valid in client mode".into(),
                    ));
                }
            }
        }

        for rule in &self.rules {
            let action = rule.action().ok_or_else(|| {
                ConfigError::Invalid(format!("unknown rule action '{}'", rule.action))
            })?;

            rule.destination.parse::<Ipv4Net>().map_err(|_| {
                ConfigError::Invalid(format!(
                    "invalid rule destination '{}'",
                    rule.destination
                ))
            })?;

            if action != RouteAction::Forward && rule.gateway.is_some() {
                return Err(ConfigError::Invalid(format!(
                    "rule for '{}': gateway is only valid with the forward action",
                    rule.destination
                )));
            }
        }

        Ok(())
    }

    /// The identity presented to the coordinator; generated for clients
    /// that did not pin one.
    pub fn effective_agent_id(&self) -> String {
        if self.agent_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            self.agent_id.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_json() -> serde_json::Value {
        serde_json::json!({
            "mode": "client",
            "server": "coordinator.example.com:4433",
            "user_key": "secret-key",
            "rules": [
                { "action": "forward", "destination": "10.0.0.0/8", "priority": 10 },
                { "action": "direct", "destination": "192.168.0.0/16" }
            ]
        })
    }

    #[test]
    fn test_client_config_valid() {
        let config: AgentConfig = serde_json::from_value(client_json()).unwrap();
        config.validate().unwrap();

        assert_eq!(config.mode, AgentMode::Client);
        assert_eq!(config.rules.len(), 2);
        assert_eq!(config.rules[0].priority, 10);
        assert_eq!(config.rules[1].priority, 100);
    }

    #[test]
    fn test_client_requires_user_key() {
        let mut json = client_json();
        json["user_key"] = serde_json::json!("");
        let config: AgentConfig = serde_json::from_value(json).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_gateway_requires_id() {
        let config: AgentConfig = serde_json::from_value(serde_json::json!({
            "mode": "gateway",
            "server": "coordinator.example.com:4433",
            "user_key": "secret-key"
        }))
        .unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config: AgentConfig = serde_json::from_value(serde_json::json!({
            "mode": "gateway",
            "server": "coordinator.example.com:4433",
            "user_key": "secret-key",
            "id": "gw-1"
        }))
        .unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn test_invalid_rule_destination() {
        let mut json = client_json();
        json["rules"][0]["destination"] = serde_json::json!("not-a-cidr");
        let config: AgentConfig = serde_json::from_value(json).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_gateway_only_valid_on_forward() {
        let mut json = client_json();
        json["rules"][1]["gateway"] = serde_json::json!("gw-1");
        let config: AgentConfig = serde_json::from_value(json).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_effective_agent_id_generated_when_unset() {
        let config: AgentConfig = serde_json::from_value(client_json()).unwrap();
        let generated = config.effective_agent_id();
        assert!(!generated.is_empty());
        // A fresh id every time for unpinned clients
        assert_ne!(generated, config.effective_agent_id());
    }
}
