//! wgpeer Common Library
//!
//! Shared types, the peer record store and key primitives used by the
//! daemon and the CLI.

pub mod db;
pub mod error;
pub mod keys;
pub mod types;

// Re-export commonly used types
pub use db::{Database, PeerStore};
pub use error::{Error, Result};
pub use keys::WgKeyPair;
pub use types::*;

/// wgpeer version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default state directory
pub fn default_store_path() -> std::path::PathBuf {
    std::path::PathBuf::from("/data")
}

/// Default database path
pub fn default_db_path() -> std::path::PathBuf {
    default_store_path().join("peers.db")
}

/// Default WireGuard interface config document
pub fn default_wg_config_path() -> std::path::PathBuf {
    std::path::PathBuf::from("/etc/wireguard/wg0.conf")
}

/// Default interface private key file
pub fn default_private_key_path() -> std::path::PathBuf {
    std::path::PathBuf::from("/etc/wireguard/privatekey")
}
