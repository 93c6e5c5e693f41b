//! Address allocation for new peers
//!
//! Picks the lowest unused address in each pool by scanning the current store
//! snapshot. The scan is advisory: two concurrent creates can pick the same
//! address and the store's uniqueness constraint decides the winner.

use crate::config::PoolConfig;
use ipnetwork::{Ipv4Network, Ipv6Network};
use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr};
use tracing::{debug, instrument};
use wgpeer_common::{Error, Peer, PeerStore, Result};

/// Deterministic first-free allocator over one IPv4 and one IPv6 pool
#[derive(Debug, Clone)]
pub struct AddressAllocator {
    ipv4_network: Ipv4Network,
    ipv4_first: u32,
    ipv4_last: u32,
    ipv6_network: Ipv6Network,
    ipv6_first: u64,
    ipv6_last: u64,
}

impl AddressAllocator {
    /// Build from validated pool configuration
    pub fn new(pool: &PoolConfig) -> Self {
        // Skip the broadcast address at the top of the prefix
        let ipv4_last = pool.ipv4_cidr.size().saturating_sub(2);
        Self {
            ipv4_network: pool.ipv4_cidr,
            ipv4_first: pool.ipv4_first_offset,
            ipv4_last,
            ipv6_network: pool.ipv6_cidr,
            ipv6_first: pool.ipv6_first_offset,
            ipv6_last: pool.ipv6_last_offset,
        }
    }

    /// Allocate against the store's current membership
    pub fn allocate_from(&self, store: &dyn PeerStore) -> Result<(Ipv4Addr, Ipv6Addr)> {
        let peers = store.list_all()?;
        self.allocate(&peers)
    }

    /// First unused address in each family given a membership snapshot
    #[instrument(skip_all, fields(peers = peers.len()))]
    pub fn allocate(&self, peers: &[Peer]) -> Result<(Ipv4Addr, Ipv6Addr)> {
        let used_v4: HashSet<Ipv4Addr> = peers.iter().map(|p| p.ipv4_address).collect();
        let used_v6: HashSet<Ipv6Addr> = peers.iter().map(|p| p.ipv6_address).collect();

        let ipv4 = self.next_ipv4(&used_v4).ok_or_else(|| Error::PoolExhausted {
            family: format!("IPv4 in {}", self.ipv4_network),
        })?;
        let ipv6 = self.next_ipv6(&used_v6).ok_or_else(|| Error::PoolExhausted {
            family: format!("IPv6 in {}", self.ipv6_network),
        })?;

        debug!(%ipv4, %ipv6, "Allocated addresses");
        Ok((ipv4, ipv6))
    }

    /// Number of assignable addresses per family
    pub fn capacity(&self) -> (u64, u64) {
        let v4 = u64::from(self.ipv4_last.saturating_sub(self.ipv4_first)) + 1;
        let v6 = self.ipv6_last.saturating_sub(self.ipv6_first).saturating_add(1);
        (v4, v6)
    }

    fn next_ipv4(&self, used: &HashSet<Ipv4Addr>) -> Option<Ipv4Addr> {
        let base = u32::from(self.ipv4_network.network());
        (self.ipv4_first..=self.ipv4_last)
            .map(|offset| Ipv4Addr::from(base + offset))
            .find(|candidate| !used.contains(candidate))
    }

    fn next_ipv6(&self, used: &HashSet<Ipv6Addr>) -> Option<Ipv6Addr> {
        let base = u128::from(self.ipv6_network.network());
        (self.ipv6_first..=self.ipv6_last)
            .map(|offset| Ipv6Addr::from(base + u128::from(offset)))
            .find(|candidate| !used.contains(candidate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use wgpeer_common::Database;

    fn peer(host: u8, v6_offset: u16) -> Peer {
        Peer::new(
            format!("peer-{}", host),
            "private".to_string(),
            Ipv4Addr::new(10, 8, 0, host),
            Ipv6Addr::new(0xfd86, 0xea04, 0x1111, 0, 0, 0, 0, v6_offset),
            Utc::now(),
            7,
        )
    }

    fn allocator() -> AddressAllocator {
        AddressAllocator::new(&PoolConfig::default())
    }

    #[test]
    fn test_empty_pool_starts_at_offsets() {
        let (v4, v6) = allocator().allocate(&[]).unwrap();
        assert_eq!(v4, Ipv4Addr::new(10, 8, 0, 2));
        assert_eq!(v6, "fd86:ea04:1111::100".parse::<Ipv6Addr>().unwrap());
    }

    #[test]
    fn test_next_after_contiguous_block() {
        let peers: Vec<Peer> = (2..=5).map(|h| peer(h, 0x100 + u16::from(h))).collect();
        let (v4, _) = allocator().allocate(&peers).unwrap();
        assert_eq!(v4, Ipv4Addr::new(10, 8, 0, 6));
    }

    #[test]
    fn test_gap_is_reused() {
        let peers = vec![peer(2, 0x100), peer(4, 0x102)];
        let (v4, v6) = allocator().allocate(&peers).unwrap();
        assert_eq!(v4, Ipv4Addr::new(10, 8, 0, 3));
        assert_eq!(v6, "fd86:ea04:1111::101".parse::<Ipv6Addr>().unwrap());
    }

    #[test]
    fn test_ipv4_exhaustion() {
        let peers: Vec<Peer> = (2..=254).map(|h| peer(h, 0x100 + u16::from(h))).collect();
        let err = allocator().allocate(&peers).unwrap_err();
        assert!(matches!(err, Error::PoolExhausted { ref family } if family.contains("IPv4")));
    }

    #[test]
    fn test_ipv6_exhaustion() {
        let pool = PoolConfig {
            ipv6_last_offset: 0x100,
            ..PoolConfig::default()
        };
        let alloc = AddressAllocator::new(&pool);
        assert_eq!(alloc.capacity(), (253, 1));

        let err = alloc.allocate(&[peer(2, 0x100)]).unwrap_err();
        assert!(matches!(err, Error::PoolExhausted { ref family } if family.contains("IPv6")));
    }

    #[test]
    fn test_full_pools_leave_store_untouched() {
        use wgpeer_common::PeerStore;

        let pool = PoolConfig {
            ipv4_cidr: "10.8.0.0/30".parse().unwrap(),
            ipv6_last_offset: 0x100,
            ..PoolConfig::default()
        };
        let alloc = AddressAllocator::new(&pool);
        let db = Database::open_memory().unwrap();
        db.insert(&peer(2, 0x100)).unwrap();

        assert!(matches!(alloc.allocate_from(&db), Err(Error::PoolExhausted { .. })));
        assert_eq!(db.list_all().unwrap().len(), 1);
    }
}
