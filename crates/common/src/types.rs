//! Core domain types for wgpeer

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use uuid::Uuid;

// ============================================================================
// Peer
// ============================================================================

/// A peer as persisted in the record store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub public_key: String,
    pub private_key: String,
    pub ipv4_address: Ipv4Addr,
    pub ipv6_address: Ipv6Addr,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Peer {
    /// Build a peer valid for `days_valid` days starting at `created_at`
    pub fn new(
        public_key: String,
        private_key: String,
        ipv4_address: Ipv4Addr,
        ipv6_address: Ipv6Addr,
        created_at: DateTime<Utc>,
        days_valid: u32,
    ) -> Self {
        Self {
            public_key,
            private_key,
            ipv4_address,
            ipv6_address,
            created_at,
            expires_at: created_at + Duration::days(i64::from(days_valid)),
        }
    }

    /// Whether the peer is past its expiry at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    /// AllowedIPs value used both in the config document and on the interface
    pub fn allowed_ips(&self) -> String {
        format!("{}/32, {}/128", self.ipv4_address, self.ipv6_address)
    }
}

/// Peer view handed to API callers.
///
/// `private_key` is only populated in the response to a create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    pub ipv4_address: String,
    pub ipv6_address: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PeerRecord {
    /// Record returned exactly once, right after creation
    pub fn created(peer: &Peer) -> Self {
        Self {
            private_key: Some(peer.private_key.clone()),
            ..Self::from(peer)
        }
    }
}

impl From<&Peer> for PeerRecord {
    fn from(peer: &Peer) -> Self {
        Self {
            public_key: peer.public_key.clone(),
            private_key: None,
            ipv4_address: peer.ipv4_address.to_string(),
            ipv6_address: peer.ipv6_address.to_string(),
            created_at: peer.created_at,
            expires_at: peer.expires_at,
        }
    }
}

// ============================================================================
// Runtime telemetry
// ============================================================================

/// Live per-peer counters read from the running interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeStat {
    pub public_key: String,
    pub endpoint: Option<String>,
    pub allowed_ips: Vec<String>,
    pub last_handshake: Option<DateTime<Utc>>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub persistent_keepalive: Option<u16>,
}

// ============================================================================
// Inconsistency events
// ============================================================================

/// Lifecycle operation that produced an inconsistency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// Store that fell out of agreement with the record store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Config,
    Interface,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config => write!(f, "config"),
            Self::Interface => write!(f, "interface"),
        }
    }
}

/// A partial failure left the tri-store invariant broken for one peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InconsistencyEvent {
    pub id: Uuid,
    pub public_key: String,
    pub operation: Operation,
    pub stage: Stage,
    pub detail: String,
    pub recorded_at: DateTime<Utc>,
}

impl InconsistencyEvent {
    pub fn new(public_key: &str, operation: Operation, stage: Stage, detail: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            public_key: public_key.to_string(),
            operation,
            stage,
            detail: detail.into(),
            recorded_at: Utc::now(),
        }
    }
}

// ============================================================================
// Consistency, repair and health reports
// ============================================================================

/// Kind of membership drift between the stores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftType {
    MissingFromConfig,
    MissingFromInterface,
    OrphanInConfig,
    OrphanInInterface,
}

/// One drifted peer key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftReport {
    pub public_key: String,
    pub drift_type: DriftType,
}

/// Result of comparing store, config document and live interface
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub store_peers: usize,
    pub config_peers: usize,
    pub interface_peers: usize,
    pub drift: Vec<DriftReport>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.drift.is_empty()
    }
}

/// Outcome of a Store-driven rebuild and reload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairReport {
    pub peers: usize,
    pub cleared_events: usize,
    pub repaired_at: DateTime<Utc>,
}

/// Daemon health as seen by the API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub store_ok: bool,
    pub store_error: Option<String>,
    pub pending_inconsistencies: usize,
}

// ============================================================================
// Server config and info
// ============================================================================

/// What a client needs to build its own tunnel config
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub public_key: String,
    pub endpoint: Option<String>,
    pub allowed_ips: String,
    pub dns_server: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub uptime: String,
    pub load: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_peer() -> Peer {
        Peer::new(
            "pub".to_string(),
            "priv".to_string(),
            Ipv4Addr::new(10, 8, 0, 2),
            "fd86:ea04:1111::100".parse().unwrap(),
            Utc::now(),
            7,
        )
    }

    #[test]
    fn test_expiry_is_days_after_creation() {
        let peer = sample_peer();
        assert_eq!(peer.expires_at - peer.created_at, Duration::days(7));
        assert!(peer.expires_at > peer.created_at);
        assert!(!peer.is_expired(peer.created_at));
        assert!(peer.is_expired(peer.expires_at + Duration::seconds(1)));
    }

    #[test]
    fn test_record_hides_private_key_unless_created() {
        let peer = sample_peer();
        let listed = PeerRecord::from(&peer);
        assert!(listed.private_key.is_none());
        let json = serde_json::to_value(&listed).unwrap();
        assert!(json.get("private_key").is_none());

        let created = PeerRecord::created(&peer);
        assert_eq!(created.private_key.as_deref(), Some("priv"));
        assert_eq!(created.ipv4_address, "10.8.0.2");
    }

    #[test]
    fn test_allowed_ips() {
        assert_eq!(sample_peer().allowed_ips(), "10.8.0.2/32, fd86:ea04:1111::100/128");
    }
}
