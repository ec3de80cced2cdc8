use std::fmt;
use std::net::Ipv4Addr;

use anyhow::Context;
use ipnetwork::Ipv4Network;

/// An IPv4 prefix in CIDR notation.
///
/// Thin wrapper around `Ipv4Network` exposing just what the allocator and
/// the DHCP route option need.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cidr(Ipv4Network);

impl Cidr {
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let net: Ipv4Network = s
            .parse()
            .with_context(|| format!("invalid CIDR prefix {:?}", s))?;
        Ok(Cidr(net))
    }

    pub fn network(&self) -> Ipv4Addr {
        self.0.network()
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        self.0.broadcast()
    }

    pub fn prefix_len(&self) -> u8 {
        self.0.prefix()
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.0.contains(ip)
    }

    /// Number of leasable addresses: total size minus the network and
    /// broadcast sentinels and the reserved gateway.
    pub fn host_capacity(&self) -> u32 {
        self.0.size().saturating_sub(3)
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Prefix length of a dotted-quad netmask (e.g. 255.255.255.0 -> 24).
pub fn netmask_prefix_len(mask: Ipv4Addr) -> u8 {
    u32::from(mask).count_ones() as u8
}
