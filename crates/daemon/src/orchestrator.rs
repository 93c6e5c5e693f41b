//! Peer lifecycle orchestrator
//!
//! Drives creates and deletes across the three membership holders: the record
//! store, the interface config document and the live interface. The store is
//! the commit point. Config and interface mutations are serialized by one
//! document lock, which repair holds for its whole run.

use crate::allocator::AddressAllocator;
use crate::config::{LifecycleConfig, PoolConfig};
use crate::interface::TunnelControl;
use crate::wgconf::ConfigMaterializer;
use chrono::{DateTime, SubsecRound, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use wgpeer_common::keys::generate_keypair;
use wgpeer_common::{
    ConsistencyReport, DriftReport, DriftType, Error, HealthStatus, InconsistencyEvent, Operation,
    Peer, PeerRecord, PeerStore, RepairReport, Result, RuntimeStat, Stage,
};

/// Where a single create or delete currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleState {
    Requested,
    Allocated,
    Recorded,
    Materialized,
    Synchronized,
    Committed,
    Failed(Stage),
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => write!(f, "requested"),
            Self::Allocated => write!(f, "allocated"),
            Self::Recorded => write!(f, "recorded"),
            Self::Materialized => write!(f, "materialized"),
            Self::Synchronized => write!(f, "synchronized"),
            Self::Committed => write!(f, "committed"),
            Self::Failed(stage) => write!(f, "failed({})", stage),
        }
    }
}

fn transition(public_key: &str, operation: Operation, state: LifecycleState) {
    debug!(public_key, %operation, %state, "Peer state transition");
}

// ============================================================================
// Inconsistency log
// ============================================================================

/// Bounded in-memory record of partial failures
#[derive(Debug)]
pub struct InconsistencyLog {
    events: Mutex<VecDeque<InconsistencyEvent>>,
    capacity: usize,
}

impl InconsistencyLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, event: InconsistencyEvent) {
        warn!(
            event_id = %event.id,
            public_key = %event.public_key,
            operation = %event.operation,
            stage = %event.stage,
            detail = %event.detail,
            "Tri-store inconsistency recorded"
        );
        let mut events = self.events.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    pub fn snapshot(&self) -> Vec<InconsistencyEvent> {
        self.events.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Drop every event; returns how many there were
    pub fn clear(&self) -> usize {
        let mut events = self.events.lock();
        let n = events.len();
        events.clear();
        n
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

pub struct PeerOrchestrator {
    store: Arc<dyn PeerStore>,
    tunnel: Arc<dyn TunnelControl>,
    materializer: ConfigMaterializer,
    allocator: AddressAllocator,
    lifecycle: LifecycleConfig,
    doc_lock: tokio::sync::Mutex<()>,
    events: InconsistencyLog,
}

impl PeerOrchestrator {
    pub fn new(
        store: Arc<dyn PeerStore>,
        tunnel: Arc<dyn TunnelControl>,
        materializer: ConfigMaterializer,
        pool: &PoolConfig,
        lifecycle: LifecycleConfig,
    ) -> Self {
        let allocator = AddressAllocator::new(pool);
        let (v4, v6) = allocator.capacity();
        debug!("Address pools hold {} IPv4 and {} IPv6 addresses", v4, v6);

        Self {
            store,
            tunnel,
            materializer,
            allocator,
            events: InconsistencyLog::new(lifecycle.max_recorded_events),
            lifecycle,
            doc_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn lifecycle(&self) -> &LifecycleConfig {
        &self.lifecycle
    }

    pub fn materializer(&self) -> &ConfigMaterializer {
        &self.materializer
    }

    /// Create a peer valid for `days_valid` days.
    ///
    /// The returned record carries the private key; nothing else ever does.
    #[instrument(skip(self))]
    pub async fn create_peer(&self, days_valid: u32) -> Result<PeerRecord> {
        if days_valid == 0 || days_valid > self.lifecycle.max_days_valid {
            return Err(Error::InvalidArgument(format!(
                "days_valid must be within 1..={}, got {}",
                days_valid, self.lifecycle.max_days_valid
            )));
        }

        let keypair = generate_keypair();
        transition(&keypair.public_key, Operation::Create, LifecycleState::Requested);

        let peer = self.record_new_peer(keypair.public_key, keypair.private_key, days_valid)?;
        let key = peer.public_key.as_str();

        let _doc = self.doc_lock.lock().await;

        if let Err(e) = self.materializer.append_peer_stanza(&peer).await {
            transition(key, Operation::Create, LifecycleState::Failed(Stage::Config));
            error!(public_key = key, "Failed to write peer section: {}", e);
            if let Err(undo) = self.store.delete(key) {
                self.events.record(InconsistencyEvent::new(
                    key,
                    Operation::Create,
                    Stage::Config,
                    format!("config write failed ({}); store rollback failed ({})", e, undo),
                ));
            }
            return Err(match e {
                Error::ConfigWriteFailed(msg) => Error::ConfigWriteFailed(msg),
                other => Error::ConfigWriteFailed(other.to_string()),
            });
        }
        transition(key, Operation::Create, LifecycleState::Materialized);

        match self.tunnel.apply_add(&peer).await {
            Ok(()) => transition(key, Operation::Create, LifecycleState::Synchronized),
            Err(e) if self.lifecycle.rollback_on_interface_failure => {
                transition(key, Operation::Create, LifecycleState::Failed(Stage::Interface));
                let mut detail = format!("interface apply failed: {}", e);
                if let Err(undo) = self.store.delete(key) {
                    detail.push_str(&format!("; store rollback failed: {}", undo));
                }
                if let Err(undo) = self.materializer.remove_peer_stanza(key).await {
                    detail.push_str(&format!("; config rollback failed: {}", undo));
                }
                self.events.record(InconsistencyEvent::new(
                    key,
                    Operation::Create,
                    Stage::Interface,
                    detail,
                ));
                return Err(match e {
                    Error::InterfaceApplyFailed(msg) => Error::InterfaceApplyFailed(msg),
                    other => Error::InterfaceApplyFailed(other.to_string()),
                });
            }
            Err(e) => {
                self.events.record(InconsistencyEvent::new(
                    key,
                    Operation::Create,
                    Stage::Interface,
                    e.to_string(),
                ));
            }
        }

        transition(key, Operation::Create, LifecycleState::Committed);
        info!(
            public_key = key,
            ipv4 = %peer.ipv4_address,
            ipv6 = %peer.ipv6_address,
            expires_at = %peer.expires_at,
            "Created peer"
        );
        Ok(PeerRecord::created(&peer))
    }

    /// Allocate and insert, retrying allocation when the insert loses a race
    fn record_new_peer(&self, public_key: String, private_key: String, days_valid: u32) -> Result<Peer> {
        let max_attempts = self.lifecycle.max_allocation_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let (ipv4, ipv6) = self.allocator.allocate_from(self.store.as_ref())?;
            let peer = Peer::new(
                public_key.clone(),
                private_key.clone(),
                ipv4,
                ipv6,
                Utc::now().trunc_subsecs(0),
                days_valid,
            );
            transition(&peer.public_key, Operation::Create, LifecycleState::Allocated);

            match self.store.insert(&peer) {
                Ok(()) => {
                    transition(&peer.public_key, Operation::Create, LifecycleState::Recorded);
                    return Ok(peer);
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    debug!(attempt, %ipv4, %ipv6, "Address taken concurrently, reallocating: {}", e);
                }
                Err(e) => {
                    warn!(attempt, "Giving up on peer insert: {}", e);
                    return Err(e);
                }
            }
        }
    }

    /// Delete a peer. `false` when the store did not know it.
    ///
    /// Config and interface failures after the store delete still report
    /// success and leave an inconsistency event behind.
    #[instrument(skip(self))]
    pub async fn delete_peer(&self, public_key: &str) -> Result<bool> {
        if public_key.trim().is_empty() {
            return Err(Error::InvalidArgument("public_key must not be empty".to_string()));
        }
        transition(public_key, Operation::Delete, LifecycleState::Requested);

        if !self.store.delete(public_key)? {
            debug!(public_key, "Peer not in store");
            return Ok(false);
        }
        transition(public_key, Operation::Delete, LifecycleState::Recorded);

        let _doc = self.doc_lock.lock().await;

        match self.materializer.remove_peer_stanza(public_key).await {
            Ok(true) => transition(public_key, Operation::Delete, LifecycleState::Materialized),
            Ok(false) => warn!(public_key, "Peer had no section in the config document"),
            Err(e) => self.events.record(InconsistencyEvent::new(
                public_key,
                Operation::Delete,
                Stage::Config,
                e.to_string(),
            )),
        }

        match self.tunnel.apply_remove(public_key).await {
            Ok(()) => transition(public_key, Operation::Delete, LifecycleState::Synchronized),
            Err(e) => self.events.record(InconsistencyEvent::new(
                public_key,
                Operation::Delete,
                Stage::Interface,
                e.to_string(),
            )),
        }

        transition(public_key, Operation::Delete, LifecycleState::Committed);
        info!(public_key, "Deleted peer");
        Ok(true)
    }

    /// Registered peers, from the store only
    pub fn list_peers(&self) -> Result<Vec<PeerRecord>> {
        Ok(self.store.list_all()?.iter().map(PeerRecord::from).collect())
    }

    /// Live counters, from the interface only
    pub async fn peer_stats(&self) -> Result<Vec<RuntimeStat>> {
        self.tunnel.dump().await
    }

    /// Peers past their expiry at `now`
    pub fn expired_peers(&self, now: DateTime<Utc>) -> Result<Vec<Peer>> {
        self.store.list_expired(now)
    }

    /// Regenerate the config document from the store and push it to the interface
    pub async fn repair(&self) -> Result<RepairReport> {
        let _doc = self.doc_lock.lock().await;

        let peers = self.store.list_all()?;
        let doc = self.materializer.rebuild(&peers).await?;
        self.tunnel.full_reload(&doc).await?;
        let cleared_events = self.events.clear();

        info!(peers = peers.len(), cleared_events, "Repaired config and interface from store");
        Ok(RepairReport {
            peers: peers.len(),
            cleared_events,
            repaired_at: Utc::now(),
        })
    }

    /// Compare membership of the three holders
    pub async fn check_consistency(&self) -> Result<ConsistencyReport> {
        let _doc = self.doc_lock.lock().await;

        let store: BTreeSet<String> = self
            .store
            .list_all()?
            .into_iter()
            .map(|p| p.public_key)
            .collect();
        let config: BTreeSet<String> = self.materializer.load().await?.peer_keys().into_iter().collect();
        let interface: BTreeSet<String> = self
            .tunnel
            .dump()
            .await?
            .into_iter()
            .map(|s| s.public_key)
            .collect();

        let mut drift = Vec::new();
        let mut push = |keys: Vec<&String>, drift_type: DriftType| {
            drift.extend(keys.into_iter().map(|k| DriftReport {
                public_key: k.clone(),
                drift_type,
            }));
        };
        push(store.difference(&config).collect(), DriftType::MissingFromConfig);
        push(store.difference(&interface).collect(), DriftType::MissingFromInterface);
        push(config.difference(&store).collect(), DriftType::OrphanInConfig);
        push(interface.difference(&store).collect(), DriftType::OrphanInInterface);

        if !drift.is_empty() {
            warn!(drift = drift.len(), "Membership drift detected");
        }

        Ok(ConsistencyReport {
            store_peers: store.len(),
            config_peers: config.len(),
            interface_peers: interface.len(),
            drift,
        })
    }

    pub fn health(&self) -> HealthStatus {
        let (store_ok, store_error) = match self.store.ping() {
            Ok(()) => (true, None),
            Err(e) => (false, Some(e.to_string())),
        };
        HealthStatus {
            healthy: store_ok,
            store_ok,
            store_error,
            pending_inconsistencies: self.events.len(),
        }
    }

    pub fn inconsistencies(&self) -> Vec<InconsistencyEvent> {
        self.events.snapshot()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::interface::testing::FakeTunnel;
    use crate::wgconf::WgConfig;
    use chrono::Duration;
    use std::collections::HashSet;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::TempDir;
    use wgpeer_common::Database;

    /// Store wrapper that can hide existing rows from the allocator
    pub(crate) struct StaleStore {
        inner: Database,
        stale_reads: AtomicUsize,
        down: AtomicBool,
    }

    impl StaleStore {
        fn new(inner: Database) -> Self {
            Self {
                inner,
                stale_reads: AtomicUsize::new(0),
                down: AtomicBool::new(false),
            }
        }
    }

    impl PeerStore for StaleStore {
        fn insert(&self, peer: &Peer) -> Result<()> {
            self.inner.insert(peer)
        }
        fn delete(&self, public_key: &str) -> Result<bool> {
            self.inner.delete(public_key)
        }
        fn list_all(&self) -> Result<Vec<Peer>> {
            let stale = self
                .stale_reads
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if stale {
                return Ok(Vec::new());
            }
            self.inner.list_all()
        }
        fn get(&self, public_key: &str) -> Result<Option<Peer>> {
            self.inner.get(public_key)
        }
        fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<Peer>> {
            self.inner.list_expired(now)
        }
        fn ping(&self) -> Result<()> {
            if self.down.load(Ordering::SeqCst) {
                return Err(Error::StoreUnavailable("database is locked".to_string()));
            }
            self.inner.ping()
        }
    }

    pub(crate) struct Harness {
        pub orchestrator: Arc<PeerOrchestrator>,
        pub db: Database,
        pub tunnel: Arc<FakeTunnel>,
        pub config_path: std::path::PathBuf,
        _tmp: TempDir,
    }

    pub(crate) async fn harness_with(lifecycle: LifecycleConfig) -> Harness {
        let tmp = TempDir::new().unwrap();
        let config_path = tmp.path().join("wg0.conf");
        let materializer = ConfigMaterializer::new(&config_path);
        let initial = WgConfig::with_interface(
            "c2VydmVy",
            &["10.8.0.1/24".to_string(), "fd86:ea04:1111::1/64".to_string()],
            51820,
        );
        materializer.ensure_exists(&initial).await.unwrap();

        let db = Database::open_memory().unwrap();
        let tunnel = Arc::new(FakeTunnel::default());
        let orchestrator = Arc::new(PeerOrchestrator::new(
            Arc::new(db.clone()),
            tunnel.clone(),
            materializer,
            &PoolConfig::default(),
            lifecycle,
        ));

        Harness {
            orchestrator,
            db,
            tunnel,
            config_path,
            _tmp: tmp,
        }
    }

    pub(crate) async fn harness() -> Harness {
        harness_with(LifecycleConfig::default()).await
    }

    async fn config_keys(h: &Harness) -> Vec<String> {
        h.orchestrator.materializer().load().await.unwrap().peer_keys()
    }

    #[tokio::test]
    async fn test_create_reaches_all_three_stores() {
        let h = harness().await;
        let record = h.orchestrator.create_peer(7).await.unwrap();

        assert!(record.private_key.is_some());
        assert_eq!(record.ipv4_address, "10.8.0.2");
        assert_eq!(record.ipv6_address, "fd86:ea04:1111::100");
        assert_eq!(record.expires_at, record.created_at + Duration::days(7));
        assert!(record.expires_at > record.created_at);

        assert_eq!(h.db.get(&record.public_key).unwrap().unwrap().public_key, record.public_key);
        assert_eq!(config_keys(&h).await, vec![record.public_key.clone()]);
        assert_eq!(h.tunnel.keys(), vec![record.public_key.clone()]);
        assert!(h.orchestrator.inconsistencies().is_empty());

        // Listing never exposes the private key
        let listed = h.orchestrator.list_peers().unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].private_key.is_none());
    }

    #[tokio::test]
    async fn test_rejects_out_of_range_validity() {
        let h = harness().await;
        assert!(matches!(h.orchestrator.create_peer(0).await, Err(Error::InvalidArgument(_))));
        assert!(matches!(h.orchestrator.create_peer(3651).await, Err(Error::InvalidArgument(_))));
        assert!(h.db.list_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_creates_get_distinct_addresses() {
        let h = harness().await;
        let mut handles = Vec::new();
        for _ in 0..12 {
            let orchestrator = h.orchestrator.clone();
            handles.push(tokio::spawn(async move { orchestrator.create_peer(7).await }));
        }

        let mut v4 = HashSet::new();
        let mut v6 = HashSet::new();
        for handle in handles {
            let record = handle.await.unwrap().unwrap();
            assert!(v4.insert(record.ipv4_address));
            assert!(v6.insert(record.ipv6_address));
        }
        assert_eq!(h.db.list_all().unwrap().len(), 12);
        assert_eq!(config_keys(&h).await.len(), 12);
    }

    #[tokio::test]
    async fn test_lost_allocation_race_retries() {
        let h = harness().await;
        let winner = h.orchestrator.create_peer(7).await.unwrap();

        let store = Arc::new(StaleStore::new(h.db.clone()));
        // The loser sees the snapshot taken before the winner's insert
        store.stale_reads.store(1, Ordering::SeqCst);
        let loser = PeerOrchestrator::new(
            store,
            h.tunnel.clone(),
            ConfigMaterializer::new(&h.config_path),
            &PoolConfig::default(),
            LifecycleConfig::default(),
        );

        let record = loser.create_peer(7).await.unwrap();
        assert_eq!(winner.ipv4_address, "10.8.0.2");
        assert_eq!(record.ipv4_address, "10.8.0.3");
        assert_eq!(record.ipv6_address, "fd86:ea04:1111::101");
        assert_eq!(h.db.list_all().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_allocation_retries_are_bounded() {
        let h = harness().await;
        h.orchestrator.create_peer(7).await.unwrap();

        let store = Arc::new(StaleStore::new(h.db.clone()));
        store.stale_reads.store(usize::MAX, Ordering::SeqCst);
        let lifecycle = LifecycleConfig {
            max_allocation_attempts: 3,
            ..LifecycleConfig::default()
        };
        let orchestrator = PeerOrchestrator::new(
            store,
            h.tunnel.clone(),
            ConfigMaterializer::new(&h.config_path),
            &PoolConfig::default(),
            lifecycle,
        );

        assert!(matches!(orchestrator.create_peer(7).await, Err(Error::DuplicateKey(_))));
        assert_eq!(h.db.list_all().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_config_failure_rolls_back_store() {
        let h = harness().await;
        std::fs::remove_file(&h.config_path).unwrap();

        let err = h.orchestrator.create_peer(7).await.unwrap_err();
        assert!(matches!(err, Error::ConfigWriteFailed(_)));
        assert!(h.db.list_all().unwrap().is_empty());
        assert!(h.tunnel.keys().is_empty());
    }

    #[tokio::test]
    async fn test_interface_failure_keeps_peer_by_default() {
        let h = harness().await;
        h.tunnel.set_fail_add(true);

        let record = h.orchestrator.create_peer(7).await.unwrap();
        assert!(record.private_key.is_some());

        let listed = h.orchestrator.list_peers().unwrap();
        assert_eq!(listed[0].public_key, record.public_key);
        assert_eq!(config_keys(&h).await, vec![record.public_key.clone()]);

        let events = h.orchestrator.inconsistencies();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].public_key, record.public_key);
        assert_eq!(events[0].operation, Operation::Create);
        assert_eq!(events[0].stage, Stage::Interface);
    }

    #[tokio::test]
    async fn test_interface_failure_rollback_policy() {
        let h = harness_with(LifecycleConfig {
            rollback_on_interface_failure: true,
            ..LifecycleConfig::default()
        })
        .await;
        h.tunnel.set_fail_add(true);

        let err = h.orchestrator.create_peer(7).await.unwrap_err();
        assert!(matches!(err, Error::InterfaceApplyFailed(_)));
        assert!(h.db.list_all().unwrap().is_empty());
        assert!(config_keys(&h).await.is_empty());
        assert_eq!(h.orchestrator.inconsistencies().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let h = harness().await;
        let record = h.orchestrator.create_peer(7).await.unwrap();

        assert!(h.orchestrator.delete_peer(&record.public_key).await.unwrap());
        assert!(!h.orchestrator.delete_peer(&record.public_key).await.unwrap());

        assert!(h.db.list_all().unwrap().is_empty());
        assert!(config_keys(&h).await.is_empty());
        assert!(h.tunnel.keys().is_empty());
    }

    #[tokio::test]
    async fn test_delete_interface_failure_still_succeeds() {
        let h = harness().await;
        let record = h.orchestrator.create_peer(7).await.unwrap();
        h.tunnel.set_fail_remove(true);

        assert!(h.orchestrator.delete_peer(&record.public_key).await.unwrap());
        assert!(h.db.get(&record.public_key).unwrap().is_none());
        assert!(config_keys(&h).await.is_empty());

        let events = h.orchestrator.inconsistencies();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].operation, Operation::Delete);
        assert_eq!(events[0].stage, Stage::Interface);
    }

    #[tokio::test]
    async fn test_delete_config_failure_still_succeeds() {
        let h = harness().await;
        let record = h.orchestrator.create_peer(7).await.unwrap();
        std::fs::write(&h.config_path, "[Interface]\nPrivateKey = k\n\n[Bogus]\n").unwrap();

        assert!(h.orchestrator.delete_peer(&record.public_key).await.unwrap());
        assert!(h.db.get(&record.public_key).unwrap().is_none());
        assert!(!h.tunnel.keys().contains(&record.public_key));

        let events = h.orchestrator.inconsistencies();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].public_key, record.public_key);
        assert_eq!(events[0].operation, Operation::Delete);
        assert_eq!(events[0].stage, Stage::Config);
    }

    #[tokio::test]
    async fn test_released_address_is_reused() {
        let h = harness().await;
        let first = h.orchestrator.create_peer(7).await.unwrap();
        h.orchestrator.create_peer(7).await.unwrap();
        h.orchestrator.delete_peer(&first.public_key).await.unwrap();

        let third = h.orchestrator.create_peer(7).await.unwrap();
        assert_eq!(third.ipv4_address.parse::<Ipv4Addr>().unwrap(), Ipv4Addr::new(10, 8, 0, 2));
    }

    #[tokio::test]
    async fn test_check_and_repair_drift() {
        let h = harness().await;
        h.tunnel.set_fail_add(true);
        let kept = h.orchestrator.create_peer(7).await.unwrap();
        h.tunnel.set_fail_add(false);
        h.tunnel.insert_raw("stray");

        let report = h.orchestrator.check_consistency().await.unwrap();
        assert!(!report.is_consistent());
        assert_eq!(report.store_peers, 1);
        assert!(report.drift.contains(&DriftReport {
            public_key: kept.public_key.clone(),
            drift_type: DriftType::MissingFromInterface,
        }));
        assert!(report.drift.contains(&DriftReport {
            public_key: "stray".to_string(),
            drift_type: DriftType::OrphanInInterface,
        }));

        let repaired = h.orchestrator.repair().await.unwrap();
        assert_eq!(repaired.peers, 1);
        assert_eq!(repaired.cleared_events, 1);
        assert!(h.orchestrator.inconsistencies().is_empty());
        assert_eq!(h.tunnel.keys(), vec![kept.public_key.clone()]);
        assert!(h.orchestrator.check_consistency().await.unwrap().is_consistent());
    }

    #[tokio::test]
    async fn test_repair_config_matches_store() {
        let h = harness().await;
        for _ in 0..3 {
            h.orchestrator.create_peer(7).await.unwrap();
        }
        // Hand-edited document with a stale extra section
        let mut text = std::fs::read_to_string(&h.config_path).unwrap();
        text.push_str("\n[Peer]\nPublicKey = leftover\nAllowedIPs = 10.8.0.99/32\n");
        std::fs::write(&h.config_path, text).unwrap();

        h.orchestrator.repair().await.unwrap();

        let mut config: Vec<String> = config_keys(&h).await;
        config.sort();
        let mut store: Vec<String> = h.db.list_all().unwrap().into_iter().map(|p| p.public_key).collect();
        store.sort();
        assert_eq!(config, store);
        assert_eq!(h.tunnel.reloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_health_reports_store_outage() {
        let h = harness().await;
        assert!(h.orchestrator.health().healthy);

        let store = Arc::new(StaleStore::new(h.db.clone()));
        store.down.store(true, Ordering::SeqCst);
        let orchestrator = PeerOrchestrator::new(
            store,
            h.tunnel.clone(),
            ConfigMaterializer::new(&h.config_path),
            &PoolConfig::default(),
            LifecycleConfig::default(),
        );
        let health = orchestrator.health();
        assert!(!health.healthy);
        assert!(health.store_error.unwrap().contains("locked"));
    }

    #[test]
    fn test_inconsistency_log_is_bounded() {
        let log = InconsistencyLog::new(2);
        for key in ["a", "b", "c"] {
            log.record(InconsistencyEvent::new(key, Operation::Delete, Stage::Config, "x"));
        }
        let keys: Vec<String> = log.snapshot().into_iter().map(|e| e.public_key).collect();
        assert_eq!(keys, vec!["b", "c"]);
        assert_eq!(log.clear(), 2);
        assert_eq!(log.len(), 0);
    }
}
