//! WireGuard key primitives
//!
//! Keys are Curve25519 scalars/points encoded as standard base64, the same
//! representation `wg genkey` / `wg pubkey` produce.

use crate::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::rngs::OsRng;
use rand::RngCore;
use std::path::Path;
use tokio::fs;
use x25519_dalek::{PublicKey, StaticSecret};

/// WireGuard key pair, base64 encoded
#[derive(Clone)]
pub struct WgKeyPair {
    pub private_key: String,
    pub public_key: String,
}

impl std::fmt::Debug for WgKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgKeyPair")
            .field("public_key", &self.public_key)
            .finish()
    }
}

/// Generate a fresh keypair
pub fn generate_keypair() -> WgKeyPair {
    let mut private_key_bytes = [0u8; 32];
    OsRng.fill_bytes(&mut private_key_bytes);

    // Curve25519 clamping, as `wg genkey` does
    private_key_bytes[0] &= 248;
    private_key_bytes[31] &= 127;
    private_key_bytes[31] |= 64;

    let secret = StaticSecret::from(private_key_bytes);
    let public = PublicKey::from(&secret);

    WgKeyPair {
        private_key: STANDARD.encode(private_key_bytes),
        public_key: STANDARD.encode(public.as_bytes()),
    }
}

/// Derive the base64 public key for a base64 private key
pub fn public_key_from_private(private_key: &str) -> Result<String> {
    let bytes = decode_key(private_key)?;
    let secret = StaticSecret::from(bytes);
    Ok(STANDARD.encode(PublicKey::from(&secret).as_bytes()))
}

/// Read the interface private key file and derive its public key
pub async fn derive_local_public_key(private_key_file: impl AsRef<Path>) -> Result<String> {
    let content = fs::read_to_string(private_key_file.as_ref()).await?;
    public_key_from_private(content.trim())
}

/// Check that a string is a well-formed base64 WireGuard key
pub fn validate_key(key: &str) -> Result<()> {
    decode_key(key).map(|_| ())
}

fn decode_key(key: &str) -> Result<[u8; 32]> {
    let bytes = STANDARD
        .decode(key.trim())
        .map_err(|e| Error::Crypto(format!("Invalid base64 key: {}", e)))?;
    bytes
        .try_into()
        .map_err(|_| Error::Crypto("Invalid key length".to_string()))
}
