//! Connector configuration. Loading this from YAML/environment files is
//! out of scope per spec §1 — what lives here is the `Deserialize` shape
//! itself plus enough validation that the binary and tests can build a
//! `Config` without a bespoke external loader, mirroring `ilp-node`'s
//! typed config struct.

use std::collections::HashSet;

use ilp_packet::Address;
use serde::{Deserialize, Serialize};

use crate::errors::NodeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerConfig {
    pub id: String,
    pub url: String,
    pub auth_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteConfig {
    pub prefix: String,
    pub next_hop: String,
    #[serde(default)]
    pub priority: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditLimitConfig {
    pub peer_id: String,
    #[serde(default)]
    pub token_id: Option<String>,
    pub limit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdConfig {
    pub peer_id: String,
    #[serde(default)]
    pub token_id: Option<String>,
    pub threshold: u64,
    #[serde(default)]
    pub settle_to: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementConfig {
    #[serde(default)]
    pub connector_fee_percentage: f64,
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub default_credit_limit: Option<u64>,
    #[serde(default)]
    pub global_credit_ceiling: Option<u64>,
    #[serde(default)]
    pub credit_limits: Vec<CreditLimitConfig>,
    #[serde(default)]
    pub thresholds: Vec<ThresholdConfig>,
    /// Whether `commit` persists balances before returning the Fulfill to
    /// the source peer (`true`) or updates in-memory and persists
    /// asynchronously (`false`). See spec §9 "Per-packet persistence".
    #[serde(default = "default_true")]
    pub durable: bool,
}

fn default_true() -> bool {
    true
}

impl SettlementConfig {
    /// `connectorFeePercentage` rounded to integer basis points at config
    /// time, per spec §4.6.
    pub fn fee_basis_points(&self) -> u32 {
        (self.connector_fee_percentage * 100.0).round() as u32
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub node_id: String,
    pub btp_server_port: u16,
    #[serde(default)]
    pub health_check_port: Option<u16>,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default)]
    pub settlement: Option<SettlementConfig>,
    /// Minimum outgoing timeout (`ε` in spec §4.5), in milliseconds.
    #[serde(default = "default_min_expiry_margin_ms")]
    pub min_expiry_margin_ms: u64,
    /// Maximum forwarding hop count before a loop is assumed (spec §4.5).
    #[serde(default = "default_max_hops")]
    pub max_hops: u32,
    /// How often the threshold monitor polls balances, in seconds.
    #[serde(default = "default_settlement_poll_seconds")]
    pub settlement_poll_interval_seconds: u64,
}

fn default_min_expiry_margin_ms() -> u64 {
    1_000
}

fn default_max_hops() -> u32 {
    30
}

fn default_settlement_poll_seconds() -> u64 {
    30
}

impl Config {
    pub fn from_str(yaml: &str) -> Result<Self, NodeError> {
        let config: Config =
            serde_yaml::from_str(yaml).map_err(|e| NodeError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), NodeError> {
        if self.btp_server_port == 0 {
            return Err(NodeError::InvalidConfig(
                "btpServerPort must be in 1..=65535".into(),
            ));
        }
        if let Some(port) = self.health_check_port {
            if port == 0 {
                return Err(NodeError::InvalidConfig(
                    "healthCheckPort must be in 1..=65535".into(),
                ));
            }
        }

        let mut seen_peer_ids = HashSet::new();
        for peer in &self.peers {
            if !seen_peer_ids.insert(peer.id.as_str()) {
                return Err(NodeError::InvalidConfig(format!(
                    "duplicate peer id: {}",
                    peer.id
                )));
            }
            url::Url::parse(&peer.url).map_err(|e| {
                NodeError::InvalidConfig(format!("peer `{}` has invalid url: {}", peer.id, e))
            })?;
        }

        for route in &self.routes {
            Address::new(&route.prefix).map_err(|e| {
                NodeError::InvalidConfig(format!(
                    "route prefix `{}` is not a well-formed ILP address: {}",
                    route.prefix, e
                ))
            })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_YAML: &str = r#"
nodeId: test-node
btpServerPort: 7768
peers:
  - id: peer-a
    url: "ws://localhost:7770"
    authToken: secret
routes:
  - prefix: g.acme
    nextHop: peer-a
    priority: 10
"#;

    #[test]
    fn parses_minimal_config() {
        let config = Config::from_str(MINIMAL_YAML).unwrap();
        assert_eq!(config.node_id, "test-node");
        assert_eq!(config.btp_server_port, 7768);
        assert_eq!(config.peers.len(), 1);
        assert_eq!(config.routes[0].priority, Some(10));
        assert_eq!(config.max_hops, 30);
        assert_eq!(config.min_expiry_margin_ms, 1_000);
    }

    #[test]
    fn rejects_duplicate_peer_ids() {
        let yaml = r#"
nodeId: test-node
btpServerPort: 7768
peers:
  - id: peer-a
    url: "ws://localhost:7770"
    authToken: secret
  - id: peer-a
    url: "ws://localhost:7771"
    authToken: secret2
"#;
        assert!(Config::from_str(yaml).is_err());
    }

    #[test]
    fn rejects_malformed_route_prefix() {
        let yaml = r#"
nodeId: test-node
btpServerPort: 7768
routes:
  - prefix: "not a valid address"
    nextHop: peer-a
"#;
        assert!(Config::from_str(yaml).is_err());
    }

    #[test]
    fn rejects_zero_port() {
        let yaml = r#"
nodeId: test-node
btpServerPort: 0
"#;
        assert!(Config::from_str(yaml).is_err());
    }

    #[test]
    fn fee_basis_points_rounds_to_nearest_integer() {
        let settlement = SettlementConfig {
            connector_fee_percentage: 0.1,
            ..Default::default()
        };
        assert_eq!(settlement.fee_basis_points(), 10);
    }
}
