//! Live WireGuard interface control
//!
//! Everything goes through the `wg` binary. Each invocation runs under a
//! deadline; a command that does not finish in time is killed.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};
use wgpeer_common::{Error, Peer, Result, RuntimeStat};

use crate::wgconf::WgConfig;

/// Operations on the running tunnel
#[async_trait]
pub trait TunnelControl: Send + Sync {
    /// Add (or update) one peer on the interface
    async fn apply_add(&self, peer: &Peer) -> Result<()>;

    /// Remove one peer from the interface
    async fn apply_remove(&self, public_key: &str) -> Result<()>;

    /// Per-peer runtime counters
    async fn dump(&self) -> Result<Vec<RuntimeStat>>;

    /// Replace the interface's peer set with the document's
    async fn full_reload(&self, doc: &WgConfig) -> Result<()>;
}

/// `wg`-backed tunnel control
#[derive(Debug, Clone)]
pub struct WgCommand {
    binary: PathBuf,
    interface: String,
    deadline: Duration,
}

impl WgCommand {
    pub fn new(binary: impl Into<PathBuf>, interface: impl Into<String>, deadline: Duration) -> Self {
        Self {
            binary: binary.into(),
            interface: interface.into(),
            deadline,
        }
    }

    /// Run `wg <args>` and return stdout
    async fn run(&self, args: &[&str]) -> Result<String> {
        debug!("Running {:?} {}", self.binary, args.join(" "));

        let child = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output();

        let output = match timeout(self.deadline, child).await {
            Ok(result) => result.map_err(|e| {
                Error::InterfaceApplyFailed(format!("failed to run {:?}: {}", self.binary, e))
            })?,
            Err(_) => {
                warn!("wg {} timed out", args.first().unwrap_or(&""));
                return Err(Error::Timeout {
                    seconds: self.deadline.as_secs(),
                });
            }
        };

        if !output.status.success() {
            return Err(Error::InterfaceApplyFailed(format!(
                "wg {} exited with {}: {}",
                args.first().unwrap_or(&""),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl TunnelControl for WgCommand {
    async fn apply_add(&self, peer: &Peer) -> Result<()> {
        let allowed = format!("{}/32,{}/128", peer.ipv4_address, peer.ipv6_address);
        self.run(&[
            "set",
            &self.interface,
            "peer",
            &peer.public_key,
            "allowed-ips",
            &allowed,
        ])
        .await?;
        Ok(())
    }

    async fn apply_remove(&self, public_key: &str) -> Result<()> {
        self.run(&["set", &self.interface, "peer", public_key, "remove"])
            .await?;
        Ok(())
    }

    async fn dump(&self) -> Result<Vec<RuntimeStat>> {
        let out = self.run(&["show", &self.interface, "dump"]).await?;
        parse_dump(&out)
    }

    async fn full_reload(&self, doc: &WgConfig) -> Result<()> {
        let contents = doc.strip();
        let file = tokio::task::spawn_blocking(move || -> Result<tempfile::NamedTempFile> {
            use std::io::Write;
            let mut file = tempfile::NamedTempFile::new()?;
            file.write_all(contents.as_bytes())?;
            file.flush()?;
            Ok(file)
        })
        .await
        .map_err(|e| Error::Internal(format!("syncconf writer task failed: {}", e)))??;

        let path = file.path().to_string_lossy().into_owned();
        self.run(&["syncconf", &self.interface, &path]).await?;
        Ok(())
    }
}

/// Parse `wg show <iface> dump` output.
///
/// The first line describes the interface itself; every further line is one
/// peer with eight tab-separated fields.
pub fn parse_dump(output: &str) -> Result<Vec<RuntimeStat>> {
    let mut stats = Vec::new();

    for (idx, line) in output.lines().enumerate().skip(1) {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 8 {
            return Err(Error::InterfaceApplyFailed(format!(
                "dump line {}: expected 8 fields, got {}",
                idx + 1,
                fields.len()
            )));
        }

        let number = |i: usize| -> Result<u64> {
            fields[i].parse().map_err(|_| {
                Error::InterfaceApplyFailed(format!(
                    "dump line {}: bad number {:?}",
                    idx + 1,
                    fields[i]
                ))
            })
        };

        let handshake = number(4)?;
        let last_handshake = if handshake == 0 {
            None
        } else {
            i64::try_from(handshake)
                .ok()
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        };

        let endpoint = match fields[2] {
            "(none)" => None,
            ep => Some(ep.to_string()),
        };
        let allowed_ips = match fields[3] {
            "(none)" => Vec::new(),
            ips => ips.split(',').map(|s| s.trim().to_string()).collect(),
        };
        let persistent_keepalive = match fields[7] {
            "off" => None,
            secs => secs.parse().ok(),
        };

        stats.push(RuntimeStat {
            public_key: fields[0].to_string(),
            endpoint,
            allowed_ips,
            last_handshake,
            rx_bytes: number(5)?,
            tx_bytes: number(6)?,
            persistent_keepalive,
        });
    }

    Ok(stats)
}

/// In-memory tunnel used by tests
#[cfg(test)]
pub mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    pub struct FakeTunnel {
        peers: Mutex<BTreeMap<String, RuntimeStat>>,
        pub fail_add: AtomicBool,
        pub fail_remove: AtomicBool,
        pub fail_reload: AtomicBool,
        pub reloads: AtomicUsize,
    }

    impl FakeTunnel {
        pub fn keys(&self) -> Vec<String> {
            self.peers.lock().keys().cloned().collect()
        }

        pub fn insert_raw(&self, public_key: &str) {
            self.peers.lock().insert(public_key.to_string(), stat(public_key, Vec::new()));
        }

        pub fn set_fail_add(&self, fail: bool) {
            self.fail_add.store(fail, Ordering::SeqCst);
        }

        pub fn set_fail_remove(&self, fail: bool) {
            self.fail_remove.store(fail, Ordering::SeqCst);
        }
    }

    fn stat(public_key: &str, allowed_ips: Vec<String>) -> RuntimeStat {
        RuntimeStat {
            public_key: public_key.to_string(),
            endpoint: None,
            allowed_ips,
            last_handshake: None,
            rx_bytes: 0,
            tx_bytes: 0,
            persistent_keepalive: None,
        }
    }

    #[async_trait]
    impl TunnelControl for FakeTunnel {
        async fn apply_add(&self, peer: &Peer) -> Result<()> {
            if self.fail_add.load(Ordering::SeqCst) {
                return Err(Error::InterfaceApplyFailed("injected add failure".to_string()));
            }
            let ips = vec![
                format!("{}/32", peer.ipv4_address),
                format!("{}/128", peer.ipv6_address),
            ];
            self.peers
                .lock()
                .insert(peer.public_key.clone(), stat(&peer.public_key, ips));
            Ok(())
        }

        async fn apply_remove(&self, public_key: &str) -> Result<()> {
            if self.fail_remove.load(Ordering::SeqCst) {
                return Err(Error::InterfaceApplyFailed("injected remove failure".to_string()));
            }
            self.peers.lock().remove(public_key);
            Ok(())
        }

        async fn dump(&self) -> Result<Vec<RuntimeStat>> {
            Ok(self.peers.lock().values().cloned().collect())
        }

        async fn full_reload(&self, doc: &WgConfig) -> Result<()> {
            if self.fail_reload.load(Ordering::SeqCst) {
                return Err(Error::Timeout { seconds: 5 });
            }
            self.reloads.fetch_add(1, Ordering::SeqCst);
            let mut peers = self.peers.lock();
            peers.clear();
            for section in doc.peers() {
                if let Some(key) = section.public_key() {
                    let ips = section
                        .get("AllowedIPs")
                        .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                        .unwrap_or_default();
                    peers.insert(key.clone(), stat(&key, ips));
                }
            }
            Ok(())
        }
    }
}
