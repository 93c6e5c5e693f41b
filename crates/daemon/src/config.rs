//! Daemon configuration

use ipnetwork::{Ipv4Network, Ipv6Network};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use wgpeer_common::{Error, Result};

/// Daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Peer store configuration
    pub store: StoreConfig,

    /// WireGuard interface configuration
    pub wireguard: WireGuardConfig,

    /// Address pools
    pub pool: PoolConfig,

    /// Create/delete behavior
    pub lifecycle: LifecycleConfig,

    /// Expiry sweeper
    pub sweeper: SweeperConfig,

    /// HTTP API
    pub api: ApiConfig,
}

/// Peer store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database path
    pub db_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: wgpeer_common::default_db_path(),
        }
    }
}

/// WireGuard interface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WireGuardConfig {
    /// Interface name
    pub interface: String,

    /// Interface config document
    pub config_path: PathBuf,

    /// Interface private key file
    pub private_key_path: PathBuf,

    /// Path to the `wg` binary
    pub wg_binary: PathBuf,

    /// Deadline for every `wg` invocation
    pub command_timeout_secs: u64,

    /// UDP listen port written into a fresh config document
    pub listen_port: u16,

    /// Public endpoint advertised to clients (host:port)
    pub endpoint: Option<String>,

    /// AllowedIPs advertised to clients
    pub client_allowed_ips: String,

    /// DNS server advertised to clients
    pub dns_server: Option<String>,

    /// Push the whole config document to the interface at startup
    pub reload_on_start: bool,
}

impl Default for WireGuardConfig {
    fn default() -> Self {
        Self {
            interface: "wg0".to_string(),
            config_path: wgpeer_common::default_wg_config_path(),
            private_key_path: wgpeer_common::default_private_key_path(),
            wg_binary: PathBuf::from("wg"),
            command_timeout_secs: 5,
            listen_port: 51820,
            endpoint: None,
            client_allowed_ips: "0.0.0.0/0, ::/0".to_string(),
            dns_server: None,
            reload_on_start: true,
        }
    }
}

/// Address pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// IPv4 pool
    pub ipv4_cidr: Ipv4Network,

    /// First host offset handed out in the IPv4 pool
    pub ipv4_first_offset: u32,

    /// IPv6 pool
    pub ipv6_cidr: Ipv6Network,

    /// First host offset handed out in the IPv6 pool
    pub ipv6_first_offset: u64,

    /// Last host offset handed out in the IPv6 pool
    pub ipv6_last_offset: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            ipv4_cidr: Ipv4Network::new([10, 8, 0, 0].into(), 24).expect("valid default IPv4 pool"),
            ipv4_first_offset: 2,
            ipv6_cidr: Ipv6Network::new([0xfd86, 0xea04, 0x1111, 0, 0, 0, 0, 0].into(), 64)
                .expect("valid default IPv6 pool"),
            ipv6_first_offset: 0x100,
            ipv6_last_offset: 0xffff,
        }
    }
}

/// Create/delete behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Validity used when the caller does not specify one
    pub default_days_valid: u32,

    /// Upper bound on requested validity
    pub max_days_valid: u32,

    /// Allocation attempts before a create gives up on `DuplicateKey`
    pub max_allocation_attempts: u32,

    /// Undo store and config when the live interface rejects a new peer
    pub rollback_on_interface_failure: bool,

    /// Inconsistency events kept in memory
    pub max_recorded_events: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            default_days_valid: 7,
            max_days_valid: 3650,
            max_allocation_attempts: 5,
            rollback_on_interface_failure: false,
            max_recorded_events: 1024,
        }
    }
}

/// Expiry sweeper
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    /// Seconds between expiry sweeps
    pub interval_secs: u64,

    /// Seconds between scheduled repairs; disabled when unset
    pub repair_interval_secs: Option<u64>,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            repair_interval_secs: None,
        }
    }
}

/// HTTP API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Listen address
    pub listen: String,

    /// Static bearer token; the API is open when unset
    pub token: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:51819".to_string(),
            token: None,
        }
    }
}

/// Host offset the interface itself holds in each pool
pub const GATEWAY_OFFSET: u64 = 1;

impl DaemonConfig {
    /// Load configuration from file
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        let pool = &self.pool;
        let v4_size = pool.ipv4_cidr.size();
        // The last address of the prefix is broadcast
        if u64::from(pool.ipv4_first_offset) <= GATEWAY_OFFSET
            || u64::from(pool.ipv4_first_offset) + 1 >= u64::from(v4_size)
        {
            return Err(Error::InvalidConfig(format!(
                "ipv4_first_offset {} outside {}",
                pool.ipv4_first_offset, pool.ipv4_cidr
            )));
        }

        let v6_host_bits = 128 - u32::from(pool.ipv6_cidr.prefix());
        let v6_max_offset = if v6_host_bits >= 64 {
            u64::MAX
        } else {
            (1u64 << v6_host_bits) - 1
        };
        if pool.ipv6_first_offset <= GATEWAY_OFFSET
            || pool.ipv6_first_offset > pool.ipv6_last_offset
            || pool.ipv6_last_offset > v6_max_offset
        {
            return Err(Error::InvalidConfig(format!(
                "ipv6 offsets {:#x}..={:#x} outside {}",
                pool.ipv6_first_offset, pool.ipv6_last_offset, pool.ipv6_cidr
            )));
        }

        let lifecycle = &self.lifecycle;
        if lifecycle.default_days_valid == 0 || lifecycle.default_days_valid > lifecycle.max_days_valid {
            return Err(Error::InvalidConfig(format!(
                "default_days_valid {} must be within 1..={}",
                lifecycle.default_days_valid, lifecycle.max_days_valid
            )));
        }
        if lifecycle.max_allocation_attempts == 0 {
            return Err(Error::InvalidConfig("max_allocation_attempts must be at least 1".to_string()));
        }
        if self.sweeper.interval_secs == 0 {
            return Err(Error::InvalidConfig("sweeper interval must be non-zero".to_string()));
        }

        Ok(())
    }

    /// Deadline applied to `wg` invocations
    pub fn command_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.wireguard.command_timeout_secs)
    }
}
