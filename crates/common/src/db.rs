//! SQLite peer record store
//!
//! The `peers` table is the source of truth for membership. Uniqueness of the
//! key and of both addresses is enforced by the schema, not by callers.

use crate::{types::Peer, Error, Result};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Durable peer table operations the lifecycle engine relies on
pub trait PeerStore: Send + Sync {
    /// Insert a peer; `DuplicateKey` on key or address collision
    fn insert(&self, peer: &Peer) -> Result<()>;

    /// Delete a peer; `false` when it was not present
    fn delete(&self, public_key: &str) -> Result<bool>;

    /// All peers, ordered by IPv4 address
    fn list_all(&self) -> Result<Vec<Peer>>;

    /// Look up one peer
    fn get(&self, public_key: &str) -> Result<Option<Peer>>;

    /// Peers whose `expires_at` is strictly before `now`
    fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<Peer>>;

    /// Liveness check
    fn ping(&self) -> Result<()>;
}

/// Database wrapper for peer persistence
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path.as_ref())?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        info!("Opened peer store at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS peers (
                public_key TEXT PRIMARY KEY,
                private_key TEXT NOT NULL,
                ipv4_address TEXT NOT NULL UNIQUE,
                ipv6_address TEXT NOT NULL UNIQUE,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                CHECK (expires_at > created_at)
            );
            CREATE INDEX IF NOT EXISTS idx_peers_expires ON peers(expires_at);
            "#,
        )?;

        debug!("Peer schema ready");
        Ok(())
    }
}

const PEER_COLUMNS: &str =
    "public_key, private_key, ipv4_address, ipv6_address, created_at, expires_at";

fn row_to_peer(row: &Row<'_>) -> rusqlite::Result<Peer> {
    Ok(Peer {
        public_key: row.get(0)?,
        private_key: row.get(1)?,
        ipv4_address: parse_column(row, 2)?,
        ipv6_address: parse_column(row, 3)?,
        created_at: timestamp_column(row, 4)?,
        expires_at: timestamp_column(row, 5)?,
    })
}

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let secs: i64 = row.get(idx)?;
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, secs))
}

impl PeerStore for Database {
    fn insert(&self, peer: &Peer) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO peers (public_key, private_key, ipv4_address, ipv6_address, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                peer.public_key,
                peer.private_key,
                peer.ipv4_address.to_string(),
                peer.ipv6_address.to_string(),
                peer.created_at.timestamp(),
                peer.expires_at.timestamp(),
            ],
        )?;
        debug!(public_key = %peer.public_key, ipv4 = %peer.ipv4_address, "Inserted peer row");
        Ok(())
    }

    fn delete(&self, public_key: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM peers WHERE public_key = ?1", params![public_key])?;
        Ok(rows > 0)
    }

    fn list_all(&self) -> Result<Vec<Peer>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {} FROM peers", PEER_COLUMNS))?;
        let rows = stmt.query_map([], row_to_peer)?;

        let mut peers = Vec::new();
        for row in rows {
            peers.push(row?);
        }
        // Text ordering of addresses is not numeric
        peers.sort_by_key(|p| p.ipv4_address);
        Ok(peers)
    }

    fn get(&self, public_key: &str) -> Result<Option<Peer>> {
        let conn = self.conn.lock();
        let peer = conn
            .query_row(
                &format!("SELECT {} FROM peers WHERE public_key = ?1", PEER_COLUMNS),
                params![public_key],
                row_to_peer,
            )
            .optional()?;
        Ok(peer)
    }

    fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<Peer>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM peers WHERE expires_at < ?1 ORDER BY expires_at",
            PEER_COLUMNS
        ))?;
        let rows = stmt.query_map(params![now.timestamp()], row_to_peer)?;

        let mut peers = Vec::new();
        for row in rows {
            peers.push(row?);
        }
        Ok(peers)
    }

    fn ping(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map(|_| ())
            .map_err(|e| Error::StoreUnavailable(e.to_string()))
    }
}
