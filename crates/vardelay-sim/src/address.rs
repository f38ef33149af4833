//! Point-to-point address allocation for the dumbbell.
//!
//! Every link (host ↔ router, and the central router ↔ router link) gets its
//! own /30 carved out of one supernet, so each subnet is shared only by the
//! two ends of a single link.

use std::fmt;
use std::net::Ipv4Addr;

use crate::error::{Result, SimError};

/// Default supernet the dumbbell addresses come from.
pub const DEFAULT_SUPERNET: Ipv4Addr = Ipv4Addr::new(11, 0, 0, 0);
/// Default supernet prefix length (a /16 leaves room for 8191 flows).
pub const DEFAULT_SUPERNET_PREFIX: u8 = 16;
/// Prefix length of every point-to-point subnet.
pub const LINK_PREFIX: u8 = 30;

/// A /30 with its two usable host addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkSubnet {
    network: Ipv4Addr,
}

impl LinkSubnet {
    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    /// First usable address; given to the host (or the left router).
    pub fn first(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) + 1)
    }

    /// Second usable address; given to the router (or the right router).
    pub fn second(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) + 2)
    }

    /// `first` in CIDR notation, as `ip addr add` expects it.
    pub fn first_cidr(&self) -> String {
        format!("{}/{}", self.first(), LINK_PREFIX)
    }

    pub fn second_cidr(&self) -> String {
        format!("{}/{}", self.second(), LINK_PREFIX)
    }
}

impl fmt::Display for LinkSubnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, LINK_PREFIX)
    }
}

/// Hands out consecutive /30 subnets of a supernet, never the same one twice.
#[derive(Debug, Clone)]
pub struct AddressAllocator {
    supernet: Ipv4Addr,
    prefix: u8,
    next: u32,
}

impl AddressAllocator {
    /// `prefix` must be in `1..=30`; the network address is masked to it.
    pub fn new(supernet: Ipv4Addr, prefix: u8) -> Result<Self> {
        if !(1..=LINK_PREFIX).contains(&prefix) {
            return Err(SimError::InvalidSupernet { supernet, prefix });
        }
        Ok(Self::masked(supernet, prefix))
    }

    fn masked(supernet: Ipv4Addr, prefix: u8) -> Self {
        let mask = u32::MAX << (32 - prefix);
        Self {
            supernet: Ipv4Addr::from(u32::from(supernet) & mask),
            prefix,
            next: 0,
        }
    }

    /// Number of /30 subnets in the supernet.
    pub fn subnet_count(&self) -> u32 {
        1u32 << (LINK_PREFIX - self.prefix)
    }

    /// Subnets not yet handed out.
    pub fn remaining(&self) -> u32 {
        self.subnet_count() - self.next
    }

    /// Largest flow count a fresh allocator of this size can serve: two
    /// subnets per flow plus one for the central link.
    pub fn capacity(&self) -> usize {
        (self.subnet_count() as usize - 1) / 2
    }

    /// Fails with `AddressSpaceExhausted` if `flows` cannot be addressed.
    pub fn check_capacity(&self, flows: usize) -> Result<()> {
        let needed = flows.saturating_mul(2).saturating_add(1);
        if needed > self.remaining() as usize {
            return Err(self.exhausted(flows));
        }
        Ok(())
    }

    pub fn next_subnet(&mut self) -> Result<LinkSubnet> {
        if self.next >= self.subnet_count() {
            return Err(self.exhausted(self.capacity() + 1));
        }
        let offset = self.next << (32 - LINK_PREFIX);
        self.next += 1;
        Ok(LinkSubnet {
            network: Ipv4Addr::from(u32::from(self.supernet) + offset),
        })
    }

    fn exhausted(&self, requested: usize) -> SimError {
        SimError::AddressSpaceExhausted {
            supernet: self.supernet,
            prefix: self.prefix,
            requested,
            capacity: self.capacity(),
        }
    }
}

impl Default for AddressAllocator {
    fn default() -> Self {
        Self::masked(DEFAULT_SUPERNET, DEFAULT_SUPERNET_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn subnets_are_consecutive_slash30s() {
        let mut alloc = AddressAllocator::default();
        let a = alloc.next_subnet().unwrap();
        let b = alloc.next_subnet().unwrap();

        assert_eq!(a.to_string(), "11.0.0.0/30");
        assert_eq!(a.first_cidr(), "11.0.0.1/30");
        assert_eq!(a.second_cidr(), "11.0.0.2/30");
        assert_eq!(b.network(), Ipv4Addr::new(11, 0, 0, 4));
    }

    #[test]
    fn default_capacity_matches_slash16() {
        let alloc = AddressAllocator::default();
        assert_eq!(alloc.subnet_count(), 16384);
        assert_eq!(alloc.capacity(), 8191);
        assert!(alloc.check_capacity(8191).is_ok());
        assert!(alloc.check_capacity(8192).is_err());
    }

    #[test]
    fn network_address_is_masked() {
        let mut alloc = AddressAllocator::new(Ipv4Addr::new(10, 9, 8, 77), 24).unwrap();
        assert_eq!(alloc.next_subnet().unwrap().network(), Ipv4Addr::new(10, 9, 8, 0));
    }

    #[test]
    fn no_subnet_reused_up_to_capacity() {
        let mut alloc = AddressAllocator::new(Ipv4Addr::new(10, 1, 0, 0), 22).unwrap();
        let flows = alloc.capacity();
        alloc.check_capacity(flows).unwrap();

        let mut seen = HashSet::new();
        for _ in 0..(flows * 2 + 1) {
            let subnet = alloc.next_subnet().unwrap();
            assert!(seen.insert(subnet), "subnet {subnet} handed out twice");
        }
    }

    #[test]
    fn one_flow_above_capacity_fails_cleanly() {
        let alloc = AddressAllocator::new(Ipv4Addr::new(192, 168, 0, 0), 24).unwrap();
        // 64 subnets -> 31 flows (62 host links + 1 central link).
        assert_eq!(alloc.capacity(), 31);
        match alloc.check_capacity(32) {
            Err(SimError::AddressSpaceExhausted {
                requested,
                capacity,
                ..
            }) => {
                assert_eq!(requested, 32);
                assert_eq!(capacity, 31);
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[test]
    fn supernet_prefix_out_of_range_is_rejected() {
        for prefix in [0, 31, 32] {
            match AddressAllocator::new(Ipv4Addr::new(10, 0, 0, 0), prefix) {
                Err(SimError::InvalidSupernet { prefix: got, .. }) => assert_eq!(got, prefix),
                other => panic!("expected invalid supernet, got {other:?}"),
            }
        }
        assert!(AddressAllocator::new(Ipv4Addr::new(10, 0, 0, 0), 30).is_ok());
    }

    #[test]
    fn next_subnet_errors_when_exhausted() {
        let mut alloc = AddressAllocator::new(Ipv4Addr::new(10, 0, 0, 0), 29).unwrap();
        assert!(alloc.next_subnet().is_ok());
        assert!(alloc.next_subnet().is_ok());
        assert!(matches!(
            alloc.next_subnet(),
            Err(SimError::AddressSpaceExhausted { .. })
        ));
    }
}
