//! Peer Commands

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use clap::Subcommand;
use serde::Serialize;

use crate::client::DaemonClient;
use crate::output::{format_bytes, print_item, print_list, print_success, print_warning, OutputFormat, TableDisplay};
use wgpeer_common::{PeerRecord, RuntimeStat};

#[derive(Subcommand)]
pub enum PeerCommands {
    /// Register a new peer and print its private key
    Create {
        /// Days the peer stays valid (daemon default when omitted)
        #[arg(short, long)]
        days: Option<u32>,
    },

    /// Remove a peer
    Delete {
        /// Peer public key
        public_key: String,
    },

    /// List registered peers
    List,

    /// Show live interface counters
    Stats,
}

/// Peer display wrapper for serialization
#[derive(Serialize)]
pub struct PeerDisplay {
    pub public_key: String,
    pub ipv4_address: String,
    pub ipv6_address: String,
    pub created_at: String,
    pub expires_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
}

impl From<PeerRecord> for PeerDisplay {
    fn from(peer: PeerRecord) -> Self {
        Self {
            public_key: peer.public_key,
            ipv4_address: peer.ipv4_address,
            ipv6_address: peer.ipv6_address,
            created_at: peer.created_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            expires_at: peer.expires_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            private_key: peer.private_key,
        }
    }
}

impl TableDisplay for PeerDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Public Key", "IPv4", "IPv6", "Created", "Expires"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.public_key.clone(),
            self.ipv4_address.clone(),
            self.ipv6_address.clone(),
            self.created_at.clone(),
            self.expires_at.clone(),
        ]
    }
}

/// Runtime counters display wrapper
#[derive(Serialize)]
pub struct StatDisplay {
    pub public_key: String,
    pub endpoint: String,
    pub allowed_ips: String,
    pub last_handshake: String,
    pub rx: String,
    pub tx: String,
}

impl StatDisplay {
    fn from_stat(stat: RuntimeStat, now: DateTime<Utc>) -> Self {
        Self {
            public_key: stat.public_key,
            endpoint: stat.endpoint.unwrap_or_else(|| "-".to_string()),
            allowed_ips: stat.allowed_ips.join(", "),
            last_handshake: stat
                .last_handshake
                .map(|at| handshake_age(at, now))
                .unwrap_or_else(|| "never".to_string()),
            rx: format_bytes(stat.rx_bytes),
            tx: format_bytes(stat.tx_bytes),
        }
    }
}

impl TableDisplay for StatDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Public Key", "Endpoint", "Allowed IPs", "Handshake", "RX", "TX"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.public_key.clone(),
            self.endpoint.clone(),
            self.allowed_ips.clone(),
            self.last_handshake.clone(),
            self.rx.clone(),
            self.tx.clone(),
        ]
    }
}

fn handshake_age(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - at).num_seconds().max(0);
    match secs {
        0..=59 => format!("{}s ago", secs),
        60..=3599 => format!("{}m ago", secs / 60),
        3600..=86_399 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86_400),
    }
}

pub async fn execute(cmd: PeerCommands, client: DaemonClient, format: OutputFormat) -> Result<()> {
    match cmd {
        PeerCommands::Create { days } => {
            let peer = client.create_peer(days).await?;
            let display = PeerDisplay::from(peer);
            match format {
                OutputFormat::Json => print_item(&display, format),
                _ => {
                    print_success(&format!("Peer created at {}", display.ipv4_address));
                    print_item(&display, format);
                    if let Some(key) = &display.private_key {
                        println!("Private key: {}", key);
                        print_warning("The daemon will not show this key again");
                    }
                }
            }
        }

        PeerCommands::Delete { public_key } => {
            if client.delete_peer(&public_key).await? {
                print_success(&format!("Peer {} deleted", public_key));
            } else {
                bail!("peer {} not found", public_key);
            }
        }

        PeerCommands::List => {
            let peers = client.list_peers().await?;
            let displays: Vec<PeerDisplay> = peers.into_iter().map(PeerDisplay::from).collect();
            print_list(&displays, format);
        }

        PeerCommands::Stats => {
            let now = Utc::now();
            let stats = client.peer_stats().await?;
            let displays: Vec<StatDisplay> = stats
                .into_iter()
                .map(|s| StatDisplay::from_stat(s, now))
                .collect();
            print_list(&displays, format);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_handshake_age() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        assert_eq!(handshake_age(now - Duration::seconds(5), now), "5s ago");
        assert_eq!(handshake_age(now - Duration::minutes(3), now), "3m ago");
        assert_eq!(handshake_age(now - Duration::hours(2), now), "2h ago");
        assert_eq!(handshake_age(now - Duration::days(4), now), "4d ago");
    }

    #[test]
    fn test_stat_display_defaults() {
        let stat = RuntimeStat {
            public_key: "alpha".to_string(),
            endpoint: None,
            allowed_ips: vec!["10.8.0.2/32".to_string(), "fd86:ea04:1111::100/128".to_string()],
            last_handshake: None,
            rx_bytes: 2048,
            tx_bytes: 10,
            persistent_keepalive: None,
        };
        let display = StatDisplay::from_stat(stat, Utc::now());
        assert_eq!(display.endpoint, "-");
        assert_eq!(display.last_handshake, "never");
        assert_eq!(display.allowed_ips, "10.8.0.2/32, fd86:ea04:1111::100/128");
        assert_eq!(display.rx, "2.0 KiB");
    }

    #[test]
    fn test_listing_hides_private_key() {
        let record = PeerRecord {
            public_key: "alpha".to_string(),
            private_key: None,
            ipv4_address: "10.8.0.2".to_string(),
            ipv6_address: "fd86:ea04:1111::100".to_string(),
            created_at: Utc::now(),
            expires_at: Utc::now(),
        };
        let json = serde_json::to_value(PeerDisplay::from(record)).unwrap();
        assert!(json.get("private_key").is_none());
    }
}
