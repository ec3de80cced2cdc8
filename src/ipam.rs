use std::collections::HashMap;
use std::net::Ipv4Addr;

use chrono::DateTime;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::net::Cidr;

/// Who is behind a lease, recorded on activation.
#[derive(Clone, Debug)]
pub struct Identity {
    pub username: String,
    pub hostname: String,
    pub session_start: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LeaseStatus {
    /// Allocated but not yet confirmed active; invisible to the tunnel
    /// reader.
    Requested,
    InUse,
}

struct LeaseEntry<C> {
    status: LeaseStatus,
    /// `None` marks a reserved sentinel (network, broadcast, gateway) that
    /// can never be selected as an egress.
    carrier: Option<C>,
    identity: Option<Identity>,
}

/// IP address manager: the single source of truth for which address belongs
/// to which connection. One coarse mutex guards the whole map; every
/// critical section is a handful of map operations.
pub struct Ipam<C> {
    cidr: Cidr,
    allocations: Mutex<HashMap<Ipv4Addr, LeaseEntry<C>>>,
}

impl<C: Clone> Ipam<C> {
    /// Parse the prefix and permanently reserve its network and broadcast
    /// addresses.
    pub fn new(prefix: &str) -> anyhow::Result<Self> {
        let cidr = Cidr::parse(prefix)?;
        let mut allocations = HashMap::new();
        for sentinel in [cidr.network(), cidr.broadcast()] {
            allocations.insert(
                sentinel,
                LeaseEntry {
                    status: LeaseStatus::InUse,
                    carrier: None,
                    identity: None,
                },
            );
        }
        Ok(Self {
            cidr,
            allocations: Mutex::new(allocations),
        })
    }

    /// Lease the first free address, ascending from the bottom of the
    /// prefix. The new lease starts as `Requested`.
    pub async fn acquire(&self, carrier: C) -> anyhow::Result<Ipv4Addr> {
        let mut allocations = self.allocations.lock().await;
        for raw in u32::from(self.cidr.network())..=u32::from(self.cidr.broadcast()) {
            let ip = Ipv4Addr::from(raw);
            if allocations.contains_key(&ip) {
                continue;
            }
            allocations.insert(
                ip,
                LeaseEntry {
                    status: LeaseStatus::Requested,
                    carrier: Some(carrier),
                    identity: None,
                },
            );
            return Ok(ip);
        }
        anyhow::bail!("address pool exhausted in {}", self.cidr)
    }

    /// Reserve a specific address (used for the gateway at startup). The
    /// entry is immediately `InUse`; pass `None` for a sentinel with no
    /// deliverable connection behind it.
    pub async fn acquire_specific(&self, ip: Ipv4Addr, carrier: Option<C>) -> anyhow::Result<()> {
        anyhow::ensure!(self.cidr.contains(ip), "{} is outside {}", ip, self.cidr);
        let mut allocations = self.allocations.lock().await;
        anyhow::ensure!(!allocations.contains_key(&ip), "{} already allocated", ip);
        allocations.insert(
            ip,
            LeaseEntry {
                status: LeaseStatus::InUse,
                carrier,
                identity: None,
            },
        );
        Ok(())
    }

    /// Promote a `Requested` lease to `InUse`. Until this is called the
    /// tunnel reader treats the address as a miss.
    pub async fn activate(&self, ip: Ipv4Addr) -> anyhow::Result<()> {
        let mut allocations = self.allocations.lock().await;
        let entry = allocations
            .get_mut(&ip)
            .ok_or_else(|| anyhow::format_err!("{} not allocated", ip))?;
        entry.status = LeaseStatus::InUse;
        Ok(())
    }

    /// Promote a lease to `InUse` and record who is behind it. Reserved
    /// for a control channel; the data path activates anonymously.
    #[allow(dead_code)]
    pub async fn activate_with_identity(
        &self,
        ip: Ipv4Addr,
        username: &str,
        hostname: &str,
    ) -> anyhow::Result<()> {
        let mut allocations = self.allocations.lock().await;
        let entry = allocations
            .get_mut(&ip)
            .ok_or_else(|| anyhow::format_err!("{} not allocated", ip))?;
        entry.status = LeaseStatus::InUse;
        entry.identity = Some(Identity {
            username: username.to_string(),
            hostname: hostname.to_string(),
            session_start: Utc::now(),
        });
        Ok(())
    }

    /// Carrier handle for an active lease. `Requested` leases and reserved
    /// sentinels are misses: the tunnel reader must not deliver to them.
    pub async fn get_carrier(&self, ip: Ipv4Addr) -> anyhow::Result<C> {
        let allocations = self.allocations.lock().await;
        let entry = allocations
            .get(&ip)
            .ok_or_else(|| anyhow::format_err!("{} not allocated", ip))?;
        anyhow::ensure!(entry.status == LeaseStatus::InUse, "{} not marked in use", ip);
        entry
            .carrier
            .clone()
            .ok_or_else(|| anyhow::format_err!("{} is a reserved address", ip))
    }

    /// Copy of the identity attached to an active lease, if any.
    pub async fn identity(&self, ip: Ipv4Addr) -> anyhow::Result<Option<Identity>> {
        let allocations = self.allocations.lock().await;
        let entry = allocations
            .get(&ip)
            .ok_or_else(|| anyhow::format_err!("{} not allocated", ip))?;
        anyhow::ensure!(entry.status == LeaseStatus::InUse, "{} not marked in use", ip);
        Ok(entry.identity.clone())
    }

    /// Return an address to the pool. The network and broadcast sentinels
    /// are never releasable.
    pub async fn release(&self, ip: Ipv4Addr) -> anyhow::Result<()> {
        anyhow::ensure!(
            ip != self.cidr.network() && ip != self.cidr.broadcast(),
            "cannot release network or broadcast address"
        );
        let mut allocations = self.allocations.lock().await;
        allocations
            .remove(&ip)
            .ok_or_else(|| anyhow::format_err!("{} not allocated", ip))?;
        Ok(())
    }

    /// Snapshot of leases that carry an identity.
    pub async fn dump_active(&self) -> HashMap<Ipv4Addr, Identity> {
        let allocations = self.allocations.lock().await;
        allocations
            .iter()
            .filter_map(|(ip, entry)| entry.identity.clone().map(|id| (*ip, id)))
            .collect()
    }

    pub async fn allocated_count(&self) -> usize {
        self.allocations.lock().await.len()
    }

    /// Leasable addresses in the prefix (hosts minus the gateway).
    pub fn capacity(&self) -> u32 {
        self.cidr.host_capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn allocation_order_and_exhaustion() {
        // /29: .0 network, .7 broadcast, .1 reserved for the gateway.
        let ipam: Ipam<u32> = Ipam::new("192.168.0.0/29").unwrap();
        ipam.acquire_specific(ip("192.168.0.1"), None).await.unwrap();

        for expect in ["192.168.0.2", "192.168.0.3", "192.168.0.4", "192.168.0.5", "192.168.0.6"] {
            assert_eq!(ipam.acquire(7).await.unwrap(), ip(expect));
        }
        let err = ipam.acquire(7).await.unwrap_err();
        assert!(err.to_string().contains("exhausted"), "{err}");
    }

    #[tokio::test]
    async fn active_ips_are_unique() {
        let ipam: Ipam<u32> = Ipam::new("10.0.0.0/28").unwrap();
        let mut seen = std::collections::HashSet::new();
        for n in 0..14 {
            assert!(seen.insert(ipam.acquire(n).await.unwrap()));
        }
    }

    #[tokio::test]
    async fn release_rules() {
        let ipam: Ipam<u32> = Ipam::new("10.0.0.0/24").unwrap();
        assert!(ipam.release(ip("10.0.0.0")).await.is_err());
        assert!(ipam.release(ip("10.0.0.255")).await.is_err());
        assert!(ipam.release(ip("10.0.0.9")).await.is_err(), "not allocated");

        let got = ipam.acquire(1).await.unwrap();
        assert_eq!(got, ip("10.0.0.1"));
        ipam.release(got).await.unwrap();
        // The freed address is the lowest again and may be re-acquired.
        assert_eq!(ipam.acquire(2).await.unwrap(), got);
    }

    #[tokio::test]
    async fn carrier_requires_activation() {
        let ipam: Ipam<u32> = Ipam::new("10.0.0.0/24").unwrap();
        let leased = ipam.acquire(42).await.unwrap();
        // Requested leases are misses for the tunnel reader.
        assert!(ipam.get_carrier(leased).await.is_err());

        ipam.activate(leased).await.unwrap();
        assert_eq!(ipam.get_carrier(leased).await.unwrap(), 42);
        // Active but anonymous until an identity is recorded.
        assert!(ipam.identity(leased).await.unwrap().is_none());

        ipam.activate_with_identity(leased, "alice", "workstation")
            .await
            .unwrap();
        let identity = ipam.identity(leased).await.unwrap().unwrap();
        assert_eq!(identity.username, "alice");
        assert_eq!(identity.hostname, "workstation");
    }

    #[tokio::test]
    async fn reserved_gateway_is_never_an_egress() {
        let ipam: Ipam<u32> = Ipam::new("10.0.0.0/24").unwrap();
        ipam.acquire_specific(ip("10.0.0.1"), None).await.unwrap();
        let err = ipam.get_carrier(ip("10.0.0.1")).await.unwrap_err();
        assert!(err.to_string().contains("reserved"), "{err}");
        // Double reservation fails.
        assert!(ipam.acquire_specific(ip("10.0.0.1"), None).await.is_err());
        // Out-of-prefix reservation fails.
        assert!(ipam.acquire_specific(ip("172.16.0.1"), None).await.is_err());
    }

    #[tokio::test]
    async fn dump_active_skips_unidentified() {
        let ipam: Ipam<u32> = Ipam::new("10.0.0.0/24").unwrap();
        let a = ipam.acquire(1).await.unwrap();
        let b = ipam.acquire(2).await.unwrap();
        ipam.activate(a).await.unwrap();
        ipam.activate_with_identity(b, "bob", "laptop").await.unwrap();

        let active = ipam.dump_active().await;
        assert!(!active.contains_key(&a));
        assert_eq!(active.get(&b).unwrap().username, "bob");
    }

    #[tokio::test]
    async fn counts() {
        let ipam: Ipam<u32> = Ipam::new("10.0.0.0/29").unwrap();
        assert_eq!(ipam.capacity(), 5);
        assert_eq!(ipam.allocated_count().await, 2); // network + broadcast
        ipam.acquire(1).await.unwrap();
        assert_eq!(ipam.allocated_count().await, 3);
    }
}
