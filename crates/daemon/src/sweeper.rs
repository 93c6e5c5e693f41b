//! Expiry sweeper
//!
//! Periodically removes peers whose validity has run out, and optionally
//! repairs the config document and interface from the store.

use crate::config::SweeperConfig;
use crate::orchestrator::PeerOrchestrator;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use wgpeer_common::Result;

pub struct Sweeper {
    orchestrator: Arc<PeerOrchestrator>,
    interval: Duration,
    repair_interval: Option<Duration>,
}

impl Sweeper {
    pub fn new(orchestrator: Arc<PeerOrchestrator>, config: &SweeperConfig) -> Self {
        Self {
            orchestrator,
            interval: Duration::from_secs(config.interval_secs),
            repair_interval: config.repair_interval_secs.map(Duration::from_secs),
        }
    }

    /// Run the sweep loop forever
    pub async fn run(&self) {
        info!(
            "Sweeper started (every {:?}, repair {:?})",
            self.interval, self.repair_interval
        );

        let mut sweep_tick = interval(self.interval);
        sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut repair_tick = self.repair_interval.map(|period| {
            let mut tick = interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tick
        });

        loop {
            tokio::select! {
                _ = sweep_tick.tick() => {
                    match self.sweep_once(Utc::now()).await {
                        Ok(0) => debug!("No expired peers"),
                        Ok(removed) => info!("Removed {} expired peers", removed),
                        Err(e) => error!("Expiry sweep failed: {}", e),
                    }
                }
                _ = async {
                    match repair_tick.as_mut() {
                        Some(tick) => { tick.tick().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    if let Err(e) = self.orchestrator.repair().await {
                        error!("Scheduled repair failed: {}", e);
                    }
                }
            }
        }
    }

    /// Delete every peer expired at `now`; returns how many were removed.
    ///
    /// A failure on one peer does not stop the others.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<usize> {
        let expired = self.orchestrator.expired_peers(now)?;
        let mut removed = 0;

        for peer in expired {
            match self.orchestrator.delete_peer(&peer.public_key).await {
                Ok(true) => {
                    info!(
                        public_key = %peer.public_key,
                        expired_at = %peer.expires_at,
                        "Expired peer removed"
                    );
                    removed += 1;
                }
                Ok(false) => debug!(public_key = %peer.public_key, "Expired peer already gone"),
                Err(e) => warn!(public_key = %peer.public_key, "Failed to remove expired peer: {}", e),
            }
        }

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::tests::harness;
    use chrono::Duration as ChronoDuration;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use wgpeer_common::{Peer, PeerStore};

    #[tokio::test]
    async fn test_sweep_removes_only_expired() {
        let h = harness().await;
        let fresh = h.orchestrator.create_peer(7).await.unwrap();

        // Expired a day ago, registered the normal way except for its dates
        let old = Peer::new(
            "expired-peer".to_string(),
            "private".to_string(),
            Ipv4Addr::new(10, 8, 0, 50),
            Ipv6Addr::new(0xfd86, 0xea04, 0x1111, 0, 0, 0, 0, 0x150),
            Utc::now() - ChronoDuration::days(8),
            7,
        );
        h.db.insert(&old).unwrap();
        h.orchestrator.materializer().append_peer_stanza(&old).await.unwrap();

        let sweeper = Sweeper::new(h.orchestrator.clone(), &SweeperConfig::default());
        assert_eq!(sweeper.sweep_once(Utc::now()).await.unwrap(), 1);

        let remaining: Vec<String> = h.db.list_all().unwrap().into_iter().map(|p| p.public_key).collect();
        assert_eq!(remaining, vec![fresh.public_key.clone()]);
        let config = h.orchestrator.materializer().load().await.unwrap().peer_keys();
        assert_eq!(config, vec![fresh.public_key]);

        assert_eq!(sweeper.sweep_once(Utc::now()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sweep_keeps_going_past_side_failures() {
        let h = harness().await;
        let a = h.orchestrator.create_peer(1).await.unwrap();
        let b = h.orchestrator.create_peer(1).await.unwrap();
        h.tunnel.set_fail_remove(true);

        let sweeper = Sweeper::new(h.orchestrator.clone(), &SweeperConfig::default());
        let later = Utc::now() + ChronoDuration::days(2);
        assert_eq!(sweeper.sweep_once(later).await.unwrap(), 2);

        assert!(h.db.list_all().unwrap().is_empty());
        let events = h.orchestrator.inconsistencies();
        assert_eq!(events.len(), 2);
        assert!(events.iter().any(|e| e.public_key == a.public_key));
        assert!(events.iter().any(|e| e.public_key == b.public_key));
    }

    #[tokio::test]
    async fn test_exact_expiry_instant_is_not_expired() {
        let h = harness().await;
        let record = h.orchestrator.create_peer(1).await.unwrap();

        let sweeper = Sweeper::new(h.orchestrator.clone(), &SweeperConfig::default());
        assert_eq!(sweeper.sweep_once(record.expires_at).await.unwrap(), 0);
        assert_eq!(h.db.list_all().unwrap().len(), 1);
    }
}
