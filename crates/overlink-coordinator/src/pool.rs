//! Overlay address pool
//!
//! Allocates overlay IPs for agents within the configured CIDR. Three
//! addresses are never handed out: the network address, the first host
//! (reserved as the coordinator-side gateway) and the IPv4 broadcast.
//! Allocations are sticky: the same agent id gets the same address until it
//! is explicitly released, and released addresses go to the tail of the
//! free list so transient reconnects tend to see their old address again.

use ipnet::Ipv4Net;
use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Invalid CIDR '{0}'")]
    InvalidCidr(String),

    #[error("No allocatable addresses in CIDR range")]
    EmptyRange,

    #[error("Address pool exhausted")]
    Exhausted,

    #[error("Address {0} is outside the overlay range")]
    OutOfRange(Ipv4Addr),

    #[error("Address {0} is reserved")]
    Reserved(Ipv4Addr),

    #[error("Address {0} is already allocated")]
    AlreadyAllocated(Ipv4Addr),

    #[error("Agent {0} has no allocation")]
    NotAllocated(String),
}

#[derive(Debug)]
struct PoolInner {
    available: VecDeque<Ipv4Addr>,
    allocated: HashMap<String, Ipv4Addr>,
}

/// Overlay address pool over an IPv4 block
#[derive(Debug)]
pub struct AddressPool {
    net: Ipv4Net,
    inner: Mutex<PoolInner>,
}

impl AddressPool {
    /// Build a pool from CIDR notation, e.g. `"10.200.0.0/16"`.
    pub fn new(cidr: &str) -> Result<Self, PoolError> {
        let net: Ipv4Net = cidr
            .parse()
            .map_err(|_| PoolError::InvalidCidr(cidr.to_string()))?;
        let net = net.trunc();

        let network = u32::from(net.network());
        let broadcast = u32::from(net.broadcast());
        let gateway = network.wrapping_add(1);

        let mut available = VecDeque::new();
        for raw in network..=broadcast {
            if raw == network || raw == gateway || raw == broadcast {
                continue;
            }
            available.push_back(Ipv4Addr::from(raw));
        }

        if available.is_empty() {
            return Err(PoolError::EmptyRange);
        }

        Ok(Self {
            net,
            inner: Mutex::new(PoolInner {
                available,
                allocated: HashMap::new(),
            }),
        })
    }

    /// The coordinator-side gateway address (first host of the block).
    pub fn gateway(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.net.network()).wrapping_add(1))
    }

    pub fn prefix_len(&self) -> u8 {
        self.net.prefix_len()
    }

    fn is_reserved(&self, ip: Ipv4Addr) -> bool {
        ip == self.net.network() || ip == self.gateway() || ip == self.net.broadcast()
    }

    /// Assign an address to an agent. Idempotent: an agent that already
    /// holds an allocation gets the same address back.
    pub fn allocate(&self, agent_id: &str) -> Result<Ipv4Addr, PoolError> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(ip) = inner.allocated.get(agent_id) {
            return Ok(*ip);
        }

        let ip = inner.available.pop_front().ok_or(PoolError::Exhausted)?;
        inner.allocated.insert(agent_id.to_string(), ip);

        Ok(ip)
    }

    /// Assign a specific address to an agent, e.g. when re-adopting a
    /// persisted allocation after a coordinator restart.
    pub fn allocate_specific(&self, agent_id: &str, ip: Ipv4Addr) -> Result<(), PoolError> {
        if !self.net.contains(&ip) {
            return Err(PoolError::OutOfRange(ip));
        }
        if self.is_reserved(ip) {
            return Err(PoolError::Reserved(ip));
        }

        let mut inner = self.inner.lock().unwrap();

        if let Some(existing) = inner.allocated.get(agent_id) {
            if *existing == ip {
                return Ok(());
            }
            return Err(PoolError::AlreadyAllocated(*existing));
        }
        if inner.allocated.values().any(|allocated| *allocated == ip) {
            return Err(PoolError::AlreadyAllocated(ip));
        }

        if let Some(pos) = inner.available.iter().position(|a| *a == ip) {
            inner.available.remove(pos);
        }
        inner.allocated.insert(agent_id.to_string(), ip);

        Ok(())
    }

    /// Return an agent's address to the tail of the free list.
    pub fn release(&self, agent_id: &str) -> Result<Ipv4Addr, PoolError> {
        let mut inner = self.inner.lock().unwrap();

        let ip = inner
            .allocated
            .remove(agent_id)
            .ok_or_else(|| PoolError::NotAllocated(agent_id.to_string()))?;
        inner.available.push_back(ip);

        Ok(ip)
    }

    pub fn get(&self, agent_id: &str) -> Option<Ipv4Addr> {
        self.inner.lock().unwrap().allocated.get(agent_id).copied()
    }

    pub fn is_allocated(&self, ip: Ipv4Addr) -> bool {
        self.inner
            .lock()
            .unwrap()
            .allocated
            .values()
            .any(|allocated| *allocated == ip)
    }

    pub fn available_count(&self) -> usize {
        self.inner.lock().unwrap().available.len()
    }

    pub fn allocated_count(&self) -> usize {
        self.inner.lock().unwrap().allocated.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_skips_reserved() {
        let pool = AddressPool::new("10.200.0.0/16").unwrap();

        let ip = pool.allocate("agent-1").unwrap();
        assert_eq!(ip, Ipv4Addr::new(10, 200, 0, 2));
        assert_eq!(pool.gateway(), Ipv4Addr::new(10, 200, 0, 1));
    }

    #[test]
    fn test_allocate_is_sticky() {
        let pool = AddressPool::new("10.200.0.0/24").unwrap();

        let first = pool.allocate("agent-1").unwrap();
        let second = pool.allocate("agent-1").unwrap();
        assert_eq!(first, second);
        assert_eq!(pool.allocated_count(), 1);
    }

    #[test]
    fn test_release_returns_address_to_tail() {
        let pool = AddressPool::new("10.0.0.0/29").unwrap();

        let a = pool.allocate("agent-a").unwrap();
        pool.allocate("agent-b").unwrap();

        pool.release("agent-a").unwrap();

        // The released address is reused only after the untouched tail
        // (/29 holds five allocatable addresses, two already taken)
        for name in ["agent-c", "agent-d", "agent-e"] {
            assert_ne!(pool.allocate(name).unwrap(), a);
        }

        let f = pool.allocate("agent-f").unwrap();
        assert_eq!(f, a);
    }

    #[test]
    fn test_release_unknown_agent() {
        let pool = AddressPool::new("10.0.0.0/24").unwrap();
        assert!(matches!(
            pool.release("nobody"),
            Err(PoolError::NotAllocated(_))
        ));
    }

    #[test]
    fn test_exhaustion_and_recovery() {
        // /30 leaves exactly one allocatable address
        let pool = AddressPool::new("10.0.0.0/30").unwrap();
        assert_eq!(pool.available_count(), 1);

        let a = pool.allocate("agent-a").unwrap();
        assert_eq!(a, Ipv4Addr::new(10, 0, 0, 2));

        assert!(matches!(pool.allocate("agent-b"), Err(PoolError::Exhausted)));

        pool.release("agent-a").unwrap();
        let b = pool.allocate("agent-b").unwrap();
        assert_eq!(b, Ipv4Addr::new(10, 0, 0, 2));
    }

    #[test]
    fn test_host_only_blocks_are_empty() {
        assert!(matches!(
            AddressPool::new("10.0.0.0/32"),
            Err(PoolError::EmptyRange)
        ));
        assert!(matches!(
            AddressPool::new("10.0.0.0/31"),
            Err(PoolError::EmptyRange)
        ));
    }

    #[test]
    fn test_slash_16_capacity() {
        let pool = AddressPool::new("10.200.0.0/16").unwrap();
        assert_eq!(pool.available_count(), (1usize << 16) - 3);
    }

    #[test]
    fn test_invalid_cidr() {
        assert!(matches!(
            AddressPool::new("not-a-cidr"),
            Err(PoolError::InvalidCidr(_))
        ));
    }

    #[test]
    fn test_allocate_specific() {
        let pool = AddressPool::new("10.200.0.0/24").unwrap();

        pool.allocate_specific("agent-1", Ipv4Addr::new(10, 200, 0, 50))
            .unwrap();
        assert_eq!(pool.get("agent-1"), Some(Ipv4Addr::new(10, 200, 0, 50)));
        assert!(pool.is_allocated(Ipv4Addr::new(10, 200, 0, 50)));

        // Re-adopting the same address is idempotent
        pool.allocate_specific("agent-1", Ipv4Addr::new(10, 200, 0, 50))
            .unwrap();

        // The fresh allocator never hands it out again
        for i in 0..200 {
            let ip = pool.allocate(&format!("other-{}", i)).unwrap();
            assert_ne!(ip, Ipv4Addr::new(10, 200, 0, 50));
        }
    }

    #[test]
    fn test_allocate_specific_rejections() {
        let pool = AddressPool::new("10.200.0.0/24").unwrap();

        assert!(matches!(
            pool.allocate_specific("a", Ipv4Addr::new(192, 168, 0, 5)),
            Err(PoolError::OutOfRange(_))
        ));
        assert!(matches!(
            pool.allocate_specific("a", Ipv4Addr::new(10, 200, 0, 0)),
            Err(PoolError::Reserved(_))
        ));
        assert!(matches!(
            pool.allocate_specific("a", Ipv4Addr::new(10, 200, 0, 1)),
            Err(PoolError::Reserved(_))
        ));
        assert!(matches!(
            pool.allocate_specific("a", Ipv4Addr::new(10, 200, 0, 255)),
            Err(PoolError::Reserved(_))
        ));

        pool.allocate_specific("a", Ipv4Addr::new(10, 200, 0, 7))
            .unwrap();
        assert!(matches!(
            pool.allocate_specific("b", Ipv4Addr::new(10, 200, 0, 7)),
            Err(PoolError::AlreadyAllocated(_))
        ));
    }
}
