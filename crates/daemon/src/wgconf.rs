//! WireGuard interface config document
//!
//! The document is parsed once into an optional preamble, one `[Interface]`
//! section and any number of `[Peer]` sections. Every section keeps its raw
//! text, so sections that are not touched render back byte-for-byte.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use wgpeer_common::{Error, Peer, Result};

/// Keys `wg setconf` accepts in the interface section
const WG_INTERFACE_KEYS: &[&str] = &["PrivateKey", "ListenPort", "FwMark"];

/// Keys `wg setconf` accepts in a peer section
const WG_PEER_KEYS: &[&str] = &[
    "PublicKey",
    "PresharedKey",
    "AllowedIPs",
    "Endpoint",
    "PersistentKeepalive",
];

// ============================================================================
// Document model
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    Interface,
    Peer,
}

impl SectionKind {
    fn header(self) -> &'static str {
        match self {
            Self::Interface => "[Interface]",
            Self::Peer => "[Peer]",
        }
    }
}

/// One section with the exact text it was parsed from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    kind: SectionKind,
    raw: String,
}

impl Section {
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// `Key = Value` pairs of the body, in document order.
    ///
    /// Also accepts the space-separated `Key Value` form BoringTun writes.
    pub fn fields(&self) -> Vec<(String, String)> {
        self.raw
            .lines()
            .filter_map(|line| {
                let line = strip_comment(line);
                if line.is_empty() || is_header(line) {
                    return None;
                }
                let (key, value) = match line.split_once('=') {
                    Some((k, v)) => (k.trim(), v.trim()),
                    None => {
                        let (k, v) = line.split_once(char::is_whitespace)?;
                        (k.trim(), v.trim())
                    }
                };
                Some((key.to_string(), value.to_string()))
            })
            .collect()
    }

    /// First value for a key, compared case-insensitively
    pub fn get(&self, key: &str) -> Option<String> {
        self.fields()
            .into_iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    }

    /// Identity of a peer section, wherever the field sits in the body
    pub fn public_key(&self) -> Option<String> {
        match self.kind {
            SectionKind::Peer => self.get("PublicKey"),
            SectionKind::Interface => None,
        }
    }

    fn stripped(&self) -> String {
        let allowed = match self.kind {
            SectionKind::Interface => WG_INTERFACE_KEYS,
            SectionKind::Peer => WG_PEER_KEYS,
        };
        let mut out = format!("{}\n", self.kind.header());
        for (key, value) in self.fields() {
            if let Some(canonical) = allowed.iter().find(|k| k.eq_ignore_ascii_case(&key)) {
                out.push_str(&format!("{} = {}\n", canonical, value));
            }
        }
        out
    }
}

fn is_header(line: &str) -> bool {
    line.starts_with('[') && line.ends_with(']')
}

/// Line content with any `#` comment and surrounding whitespace removed
fn strip_comment(line: &str) -> &str {
    line.split('#').next().unwrap_or("").trim()
}

/// Blank-line separator needed before appending a section after `tail`
fn separator_after(tail: &str) -> &'static str {
    if tail.is_empty() || tail.ends_with("\n\n") {
        ""
    } else if tail.ends_with('\n') {
        "\n"
    } else {
        "\n\n"
    }
}

/// Text of a new peer section
pub fn render_peer_stanza(peer: &Peer) -> String {
    format!(
        "[Peer]\nPublicKey = {}\nAllowedIPs = {}\n",
        peer.public_key,
        peer.allowed_ips()
    )
}

/// Parsed interface config document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WgConfig {
    preamble: String,
    sections: Vec<Section>,
}

impl WgConfig {
    /// Fresh document with only an interface section
    pub fn with_interface(private_key: &str, addresses: &[String], listen_port: u16) -> Self {
        let mut raw = String::from("[Interface]\n");
        raw.push_str(&format!("PrivateKey = {}\n", private_key));
        for address in addresses {
            raw.push_str(&format!("Address = {}\n", address));
        }
        raw.push_str(&format!("ListenPort = {}\n", listen_port));

        Self {
            preamble: String::new(),
            sections: vec![Section {
                kind: SectionKind::Interface,
                raw,
            }],
        }
    }

    pub fn interface(&self) -> Option<&Section> {
        self.sections.iter().find(|s| s.kind == SectionKind::Interface)
    }

    pub fn peers(&self) -> impl Iterator<Item = &Section> {
        self.sections.iter().filter(|s| s.kind == SectionKind::Peer)
    }

    /// Identity keys of every peer section, in document order
    pub fn peer_keys(&self) -> Vec<String> {
        self.peers().filter_map(Section::public_key).collect()
    }

    pub fn contains_peer(&self, public_key: &str) -> bool {
        self.peers()
            .any(|s| s.public_key().as_deref() == Some(public_key))
    }

    /// Append a peer section at the end of the document
    pub fn push_peer(&mut self, peer: &Peer) {
        let rendered = self.to_string();
        let raw = format!("{}{}", separator_after(&rendered), render_peer_stanza(peer));
        self.sections.push(Section {
            kind: SectionKind::Peer,
            raw,
        });
    }

    /// Drop every peer section carrying `public_key`; returns how many went
    pub fn remove_peer(&mut self, public_key: &str) -> usize {
        let before = self.sections.len();
        self.sections
            .retain(|s| s.public_key().as_deref() != Some(public_key));
        before - self.sections.len()
    }

    /// Replace every peer section with sections derived from `peers`
    pub fn replace_peers(&mut self, peers: &[Peer]) {
        self.sections.retain(|s| s.kind != SectionKind::Peer);
        for peer in peers {
            self.push_peer(peer);
        }
    }

    /// Render with only the keys `wg setconf`/`wg syncconf` understand
    pub fn strip(&self) -> String {
        self.sections
            .iter()
            .map(Section::stripped)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl FromStr for WgConfig {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        let mut preamble = String::new();
        let mut sections: Vec<Section> = Vec::new();

        for (idx, line) in text.split_inclusive('\n').enumerate() {
            let trimmed = strip_comment(line);
            if is_header(trimmed) {
                let kind = match &trimmed[1..trimmed.len() - 1] {
                    name if name.eq_ignore_ascii_case("Interface") => SectionKind::Interface,
                    name if name.eq_ignore_ascii_case("Peer") => SectionKind::Peer,
                    other => {
                        return Err(Error::ConfigParse(format!(
                            "line {}: unknown section [{}]",
                            idx + 1,
                            other
                        )))
                    }
                };
                sections.push(Section {
                    kind,
                    raw: line.to_string(),
                });
            } else if let Some(current) = sections.last_mut() {
                current.raw.push_str(line);
            } else {
                preamble.push_str(line);
            }
        }

        let interfaces = sections
            .iter()
            .filter(|s| s.kind == SectionKind::Interface)
            .count();
        if interfaces != 1 {
            return Err(Error::ConfigParse(format!(
                "expected exactly one [Interface] section, found {}",
                interfaces
            )));
        }

        Ok(Self { preamble, sections })
    }
}

impl fmt::Display for WgConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.preamble)?;
        for section in &self.sections {
            f.write_str(&section.raw)?;
        }
        Ok(())
    }
}

// ============================================================================
// Materializer
// ============================================================================

/// Keeps the on-disk document in line with the peer store
#[derive(Debug, Clone)]
pub struct ConfigMaterializer {
    path: PathBuf,
}

impl ConfigMaterializer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Read and parse the document
    pub async fn load(&self) -> Result<WgConfig> {
        let text = fs::read_to_string(&self.path).await?;
        text.parse()
    }

    /// Write `initial` when no document exists yet; returns whether it wrote
    pub async fn ensure_exists(&self, initial: &WgConfig) -> Result<bool> {
        if fs::try_exists(&self.path).await? {
            // Parse now so a broken document fails startup, not the first create
            let doc = self.load().await?;
            if let Some(port) = doc.interface().and_then(|i| i.get("ListenPort")) {
                debug!("Existing interface config listens on {}", port);
            }
            return Ok(false);
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        self.write_atomic(&initial.to_string()).await?;
        info!("Wrote initial interface config to {:?}", self.path);
        Ok(true)
    }

    /// Append a peer section at end of file.
    ///
    /// A section already carrying the key is left alone.
    pub async fn append_peer_stanza(&self, peer: &Peer) -> Result<()> {
        let text = fs::read_to_string(&self.path)
            .await
            .map_err(|e| self.write_failed("read", e))?;
        let doc: WgConfig = text.parse()?;
        if doc.contains_peer(&peer.public_key) {
            debug!(public_key = %peer.public_key, "Peer section already present");
            return Ok(());
        }

        let chunk = format!("{}{}", separator_after(&text), render_peer_stanza(peer));
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| self.write_failed("open", e))?;
        file.write_all(chunk.as_bytes())
            .await
            .map_err(|e| self.write_failed("append", e))?;
        file.flush().await.map_err(|e| self.write_failed("flush", e))?;

        debug!(public_key = %peer.public_key, "Appended peer section");
        Ok(())
    }

    /// Remove the section(s) carrying `public_key`; `false` if none matched
    pub async fn remove_peer_stanza(&self, public_key: &str) -> Result<bool> {
        let mut doc = self.load().await.map_err(|e| match e {
            Error::Io(io) => self.write_failed("read", io),
            other => other,
        })?;

        let removed = doc.remove_peer(public_key);
        if removed == 0 {
            return Ok(false);
        }
        if removed > 1 {
            warn!(public_key, removed, "Removed duplicate peer sections");
        }

        self.write_atomic(&doc.to_string()).await?;
        debug!(public_key, "Removed peer section");
        Ok(true)
    }

    /// Regenerate every peer section from `peers`, keeping the interface section
    pub async fn rebuild(&self, peers: &[Peer]) -> Result<WgConfig> {
        let mut doc = self.load().await.map_err(|e| match e {
            Error::Io(io) => self.write_failed("read", io),
            other => other,
        })?;
        doc.replace_peers(peers);
        self.write_atomic(&doc.to_string()).await?;
        info!("Rebuilt {:?} with {} peers", self.path, peers.len());
        Ok(doc)
    }

    /// Replace the document via a temp file in the same directory and a rename
    async fn write_atomic(&self, contents: &str) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "wg.conf".to_string());
        let tmp = dir.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4().simple()));

        fs::write(&tmp, contents)
            .await
            .map_err(|e| self.write_failed("write temp", e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(|e| self.write_failed("chmod", e))?;
        }

        if let Err(e) = fs::rename(&tmp, &self.path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(self.write_failed("rename", e));
        }
        Ok(())
    }

    fn write_failed(&self, step: &str, e: std::io::Error) -> Error {
        Error::ConfigWriteFailed(format!("{} {:?}: {}", step, self.path, e))
    }
}
