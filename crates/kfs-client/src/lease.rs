//! Chunk allocation and lease contract.
//!
//! Allocate hands back a chunk id, a version that grows on every
//! reallocation of the same chunk, and the replica list with the master
//! first. The first phase of a replicated write goes to `servers[0]`.
//!
//! A read lease is scoped to one chunk. Renewal can be refused by the
//! metaserver when the lease is stale or unknown; that comes back as a
//! status value the caller handles by re-acquiring, not as a codec error.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::request::Request;
use crate::response::{Reply, Response};
use crate::types::*;

/// Default lease duration granted by the metaserver.
pub const LEASE_INTERVAL_SECS: u64 = 60;

/// Kind of lease being renewed.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaseType {
    /// Read lease on a chunk.
    #[default]
    Read,
}

impl LeaseType {
    /// Wire form of the lease type.
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseType::Read => "READ_LEASE",
        }
    }

    /// Parses the wire form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "READ_LEASE" => Some(LeaseType::Read),
            _ => None,
        }
    }
}

/// Chunk identity, version and replica placement from Allocate or GetAlloc.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkAlloc {
    /// Chunk handle; -1 when absent.
    pub chunk_id: ChunkId,
    /// Chunk version; -1 when absent.
    pub chunk_version: i64,
    /// Master replica, when the response named one.
    pub master: Option<ServerLocation>,
    /// Replicas; the master, if any, is at index 0 and appears once.
    pub servers: Vec<ServerLocation>,
}

impl ChunkAlloc {
    /// The replica that receives the first phase of a write.
    pub fn write_target(&self) -> Option<&ServerLocation> {
        self.servers.first()
    }

    /// True when this allocation replaces `prev` for the same chunk.
    pub fn supersedes(&self, prev: &ChunkAlloc) -> bool {
        self.chunk_id == prev.chunk_id && self.chunk_version > prev.chunk_version
    }

    /// Write-sync legs in replica order, pairing each replica with the write
    /// id it returned. Returns None unless there is one id per replica.
    pub fn write_legs(&self, write_ids: &[i64]) -> Option<Vec<WriteInfo>> {
        if write_ids.len() != self.servers.len() {
            return None;
        }
        Some(
            self.servers
                .iter()
                .zip(write_ids)
                .map(|(loc, id)| WriteInfo::new(loc.clone(), *id))
                .collect(),
        )
    }
}

/// Outcome of a lease renewal.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LeaseRenewal {
    /// The metaserver extended the lease.
    Renewed,
    /// The lease is stale or unknown; re-acquire it.
    Stale(i32),
}

/// A read lease held by this client.
#[derive(Clone, Debug)]
pub struct ChunkLease {
    /// Leased chunk.
    pub chunk_id: ChunkId,
    /// Lease id issued by the metaserver.
    pub lease_id: i64,
    /// Kind of lease.
    pub lease_type: LeaseType,
    /// When the lease was acquired.
    pub acquired_at: Instant,
    /// When the lease was last acquired or renewed.
    pub last_renewed: Instant,
    /// Lease duration.
    pub duration: Duration,
}

impl ChunkLease {
    /// Builds a lease from a LeaseAcquire reply. Returns None if the
    /// metaserver refused or sent no lease id.
    pub fn from_acquire(chunk_id: ChunkId, reply: &Reply) -> Option<Self> {
        if !reply.header.is_ok() {
            return None;
        }
        match reply.body {
            Response::LeaseAcquire { lease_id } if lease_id >= 0 => {
                let now = Instant::now();
                Some(Self {
                    chunk_id,
                    lease_id,
                    lease_type: LeaseType::Read,
                    acquired_at: now,
                    last_renewed: now,
                    duration: Duration::from_secs(LEASE_INTERVAL_SECS),
                })
            }
            _ => None,
        }
    }

    /// The renewal request for this lease.
    pub fn renew_request(&self) -> Request {
        Request::LeaseRenew {
            chunk_id: self.chunk_id,
            lease_id: self.lease_id,
            lease_type: self.lease_type,
        }
    }

    /// When the lease lapses unless renewed.
    pub fn expires_at(&self) -> Instant {
        self.last_renewed + self.duration
    }

    /// Whether `threshold` (0.0-1.0) of the lease duration has elapsed at `now`.
    pub fn needs_renewal(&self, now: Instant, threshold: f64) -> bool {
        let elapsed = now.saturating_duration_since(self.last_renewed);
        elapsed.as_secs_f64() >= self.duration.as_secs_f64() * threshold
    }

    /// Applies a LeaseRenew reply.
    pub fn apply_renew(&mut self, reply: &Reply) -> LeaseRenewal {
        if reply.header.is_ok() {
            self.last_renewed = Instant::now();
            debug!(chunk = %self.chunk_id, lease_id = self.lease_id, "lease renewed");
            LeaseRenewal::Renewed
        } else {
            debug!(
                chunk = %self.chunk_id,
                lease_id = self.lease_id,
                status = reply.header.status,
                "lease renewal refused"
            );
            LeaseRenewal::Stale(reply.header.status)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::OpKind;
    use crate::response::ResponseHeader;

    fn alloc(version: i64, servers: &[(&str, i32)]) -> ChunkAlloc {
        ChunkAlloc {
            chunk_id: ChunkId::new(1001),
            chunk_version: version,
            master: servers.first().map(|(h, p)| ServerLocation::new(*h, *p)),
            servers: servers
                .iter()
                .map(|(h, p)| ServerLocation::new(*h, *p))
                .collect(),
        }
    }

    #[test]
    fn test_write_target_is_master() {
        let a = alloc(1, &[("h1", 100), ("h2", 200)]);
        assert_eq!(a.write_target(), Some(&ServerLocation::new("h1", 100)));
    }

    #[test]
    fn test_supersedes_requires_greater_version() {
        let old = alloc(1, &[("h1", 100)]);
        let new = alloc(2, &[("h2", 200)]);
        assert!(new.supersedes(&old));
        assert!(!old.supersedes(&new));
        assert!(!old.supersedes(&old));

        let mut other = alloc(5, &[("h1", 100)]);
        other.chunk_id = ChunkId::new(1002);
        assert!(!other.supersedes(&old));
    }

    #[test]
    fn test_write_legs_follow_replica_order() {
        let a = alloc(1, &[("h1", 100), ("h2", 200)]);
        let legs = a.write_legs(&[10, 20]).unwrap();
        assert_eq!(legs[0], WriteInfo::new(ServerLocation::new("h1", 100), 10));
        assert_eq!(legs[1], WriteInfo::new(ServerLocation::new("h2", 200), 20));
        assert!(a.write_legs(&[10]).is_none());
    }

    #[test]
    fn test_lease_from_acquire() {
        let reply = Reply::decode(OpKind::LeaseAcquire, "Status: 0\r\nLease-id: 77\r\n").unwrap();
        let lease = ChunkLease::from_acquire(ChunkId::new(8), &reply).unwrap();
        assert_eq!(lease.lease_id, 77);
        assert_eq!(
            lease.renew_request(),
            Request::LeaseRenew {
                chunk_id: ChunkId::new(8),
                lease_id: 77,
                lease_type: LeaseType::Read,
            }
        );

        let missing = Reply::decode(OpKind::LeaseAcquire, "Status: 0\r\n").unwrap();
        assert!(ChunkLease::from_acquire(ChunkId::new(8), &missing).is_none());

        let refused = Reply::decode(OpKind::LeaseAcquire, "Status: -13\r\nLease-id: 5\r\n").unwrap();
        assert!(ChunkLease::from_acquire(ChunkId::new(8), &refused).is_none());
    }

    #[test]
    fn test_stale_renewal_is_status_not_error() {
        let reply = Reply::new(
            ResponseHeader::ok(1),
            Response::LeaseAcquire { lease_id: 3 },
        );
        let mut lease = ChunkLease::from_acquire(ChunkId::new(8), &reply).unwrap();

        let refused = Reply::decode(OpKind::LeaseRenew, "Cseq: 2\r\nStatus: -22\r\n").unwrap();
        assert_eq!(lease.apply_renew(&refused), LeaseRenewal::Stale(-22));

        let ok = Reply::decode(OpKind::LeaseRenew, "Cseq: 3\r\nStatus: 0\r\n").unwrap();
        assert_eq!(lease.apply_renew(&ok), LeaseRenewal::Renewed);
    }

    #[test]
    fn test_needs_renewal() {
        let reply = Reply::new(
            ResponseHeader::ok(1),
            Response::LeaseAcquire { lease_id: 3 },
        );
        let lease = ChunkLease::from_acquire(ChunkId::new(8), &reply).unwrap();
        let now = lease.last_renewed;
        assert!(!lease.needs_renewal(now, 0.8));
        assert!(lease.needs_renewal(now + Duration::from_secs(50), 0.8));
        assert!(lease.expires_at() > now);
    }

    #[test]
    fn test_lease_type_wire_form() {
        assert_eq!(LeaseType::Read.as_str(), "READ_LEASE");
        assert_eq!(LeaseType::parse("READ_LEASE"), Some(LeaseType::Read));
        assert_eq!(LeaseType::parse("WRITE_LEASE"), None);
    }
}
