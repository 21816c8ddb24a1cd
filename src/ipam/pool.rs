//! Node-local IP pool
//!
//! Tracks allocated and reserved addresses inside one pod CIDR and picks
//! the next free address under a configurable strategy.

use ipnet::Ipv4Net;
use rand::Rng;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Mutex;
use thiserror::Error;
use tracing::warn;

/// First host number the allocator may hand out. Host numbers 0 (network),
/// 1 (gateway), 2 and 3 (forward-reserved) are never allocated.
pub const FIRST_ALLOCATABLE_HOST: u32 = 4;

/// Attempts before the random strategy reports exhaustion.
const RANDOM_MAX_ATTEMPTS: u32 = 100;

/// How the pool picks the next address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocationStrategy {
    /// Advance a cursor by one per allocation, wrapping at the slice end.
    #[default]
    Sequential,
    /// Sample host numbers uniformly; give up after a fixed attempt budget.
    Random,
    /// Scan upward from the first allocatable host, return the first free.
    DensePack,
}

impl AllocationStrategy {
    /// Parse the config spelling ("sequential", "random", "dense").
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sequential" => Some(Self::Sequential),
            "random" => Some(Self::Random),
            "dense" => Some(Self::DensePack),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("IP pool {cidr} is exhausted")]
    Exhausted { cidr: Ipv4Net },

    #[error("address {ip} is outside pool {cidr}")]
    OutOfRange { ip: Ipv4Addr, cidr: Ipv4Net },

    #[error("address {ip} is reserved")]
    Reserved { ip: Ipv4Addr },

    #[error("pool invariant violated: {reason}")]
    Corrupt { reason: String },
}

struct PoolState {
    next_ip: Ipv4Addr,
    allocated: HashSet<Ipv4Addr>,
}

/// Allocator over one node-local CIDR slice.
///
/// All operations serialize under a single internal mutex; allocations are
/// infrequent relative to pod churn, so simple locking beats sharding.
pub struct LocalPool {
    cidr: Ipv4Net,
    reserved: HashSet<Ipv4Addr>,
    state: Mutex<PoolState>,
}

impl LocalPool {
    pub fn new(cidr: Ipv4Net) -> Self {
        let network = u32::from(cidr.network());
        let total = total_addresses(&cidr);

        let mut reserved = HashSet::new();
        // Network, gateway, and the two forward-reserved hosts.
        for host in 0..FIRST_ALLOCATABLE_HOST.min(total) {
            reserved.insert(Ipv4Addr::from(network + host));
        }
        if total > 0 {
            reserved.insert(Ipv4Addr::from(network + total - 1)); // broadcast
        }

        Self {
            cidr,
            reserved,
            state: Mutex::new(PoolState {
                next_ip: Ipv4Addr::from(network + FIRST_ALLOCATABLE_HOST.min(total - 1)),
                allocated: HashSet::new(),
            }),
        }
    }

    pub fn cidr(&self) -> Ipv4Net {
        self.cidr
    }

    /// The mesh-facing gateway address (first host in the slice).
    pub fn gateway(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.cidr.network()) + 1)
    }

    /// Allocate the next free address under `strategy`.
    pub fn allocate_next(&self, strategy: AllocationStrategy) -> Result<Ipv4Addr, PoolError> {
        let mut state = self.state.lock().unwrap();
        match strategy {
            AllocationStrategy::Sequential => self.allocate_sequential(&mut state),
            AllocationStrategy::Random => self.allocate_random(&mut state),
            AllocationStrategy::DensePack => self.allocate_dense(&mut state),
        }
    }

    fn allocate_sequential(&self, state: &mut PoolState) -> Result<Ipv4Addr, PoolError> {
        let network = u32::from(self.cidr.network());
        let total = total_addresses(&self.cidr);

        let mut cursor = u32::from(state.next_ip);
        if cursor < network || cursor >= network + total {
            cursor = network + 1;
        }

        // One full wrap without a free slot means exhaustion.
        for _ in 0..total {
            let candidate = Ipv4Addr::from(cursor);
            cursor += 1;
            if cursor >= network + total {
                cursor = network + 1;
            }
            if self.reserved.contains(&candidate) || state.allocated.contains(&candidate) {
                continue;
            }
            state.allocated.insert(candidate);
            state.next_ip = Ipv4Addr::from(cursor);
            return Ok(candidate);
        }
        Err(PoolError::Exhausted { cidr: self.cidr })
    }

    fn allocate_random(&self, state: &mut PoolState) -> Result<Ipv4Addr, PoolError> {
        let network = u32::from(self.cidr.network());
        let total = total_addresses(&self.cidr);
        if total <= FIRST_ALLOCATABLE_HOST + 1 {
            return Err(PoolError::Exhausted { cidr: self.cidr });
        }

        let mut rng = rand::thread_rng();
        for _ in 0..RANDOM_MAX_ATTEMPTS {
            let host = rng.gen_range(FIRST_ALLOCATABLE_HOST..=total - 2);
            let candidate = Ipv4Addr::from(network + host);
            if self.reserved.contains(&candidate) || state.allocated.contains(&candidate) {
                continue;
            }
            state.allocated.insert(candidate);
            return Ok(candidate);
        }
        Err(PoolError::Exhausted { cidr: self.cidr })
    }

    fn allocate_dense(&self, state: &mut PoolState) -> Result<Ipv4Addr, PoolError> {
        let network = u32::from(self.cidr.network());
        let total = total_addresses(&self.cidr);

        for host in FIRST_ALLOCATABLE_HOST..total {
            let candidate = Ipv4Addr::from(network + host);
            if self.reserved.contains(&candidate) || state.allocated.contains(&candidate) {
                continue;
            }
            state.allocated.insert(candidate);
            return Ok(candidate);
        }
        Err(PoolError::Exhausted { cidr: self.cidr })
    }

    /// Release one address back to the pool. Releasing an address that was
    /// never allocated is a no-op.
    pub fn release(&self, ip: Ipv4Addr) {
        let mut state = self.state.lock().unwrap();
        state.allocated.remove(&ip);
    }

    /// Mark an address as allocated without going through a strategy.
    /// Used when rehydrating persisted allocations at startup.
    pub fn mark_allocated(&self, ip: Ipv4Addr) -> Result<(), PoolError> {
        if !self.cidr.contains(&ip) {
            return Err(PoolError::OutOfRange { ip, cidr: self.cidr });
        }
        if self.reserved.contains(&ip) {
            return Err(PoolError::Reserved { ip });
        }
        let mut state = self.state.lock().unwrap();
        state.allocated.insert(ip);
        Ok(())
    }

    pub fn is_available(&self, ip: Ipv4Addr) -> bool {
        if !self.cidr.contains(&ip) || self.reserved.contains(&ip) {
            return false;
        }
        let state = self.state.lock().unwrap();
        !state.allocated.contains(&ip)
    }

    pub fn is_reserved(&self, ip: Ipv4Addr) -> bool {
        self.reserved.contains(&ip)
    }

    /// Enforce pool invariants, repairing the cursor if it wandered out of
    /// the slice.
    pub fn validate(&self) -> Result<(), PoolError> {
        let total = total_addresses(&self.cidr) as usize;
        let mut state = self.state.lock().unwrap();

        if state.allocated.len() + self.reserved.len() > total {
            return Err(PoolError::Corrupt {
                reason: format!(
                    "{} allocated + {} reserved exceeds {} total addresses",
                    state.allocated.len(),
                    self.reserved.len(),
                    total
                ),
            });
        }

        if !self.cidr.contains(&state.next_ip) {
            let repaired = Ipv4Addr::from(u32::from(self.cidr.network()) + 1);
            warn!(
                "pool cursor {} outside {}, resetting to {}",
                state.next_ip, self.cidr, repaired
            );
            state.next_ip = repaired;
        }
        Ok(())
    }

    /// Reset the cursor to the start of the slice. Used by force-resync.
    pub fn reset_cursor(&self) {
        let mut state = self.state.lock().unwrap();
        state.next_ip = Ipv4Addr::from(u32::from(self.cidr.network()) + 1);
    }

    /// Drop every allocation. Used by force-resync before rehydration.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.allocated.clear();
        state.next_ip = Ipv4Addr::from(u32::from(self.cidr.network()) + 1);
    }

    /// Force the cursor to an arbitrary address; only tests use this to
    /// simulate corruption.
    #[cfg(test)]
    pub fn set_cursor(&self, ip: Ipv4Addr) {
        self.state.lock().unwrap().next_ip = ip;
    }

    #[cfg(test)]
    pub fn cursor(&self) -> Ipv4Addr {
        self.state.lock().unwrap().next_ip
    }

    pub fn allocated_count(&self) -> usize {
        self.state.lock().unwrap().allocated.len()
    }

    pub fn reserved_count(&self) -> usize {
        self.reserved.len()
    }

    /// Addresses that can still be handed out.
    pub fn available_count(&self) -> usize {
        let total = total_addresses(&self.cidr) as usize;
        let state = self.state.lock().unwrap();
        total
            .saturating_sub(self.reserved.len())
            .saturating_sub(state.allocated.len())
    }

    /// Usable capacity of the slice (total minus reserved).
    pub fn usable_count(&self) -> usize {
        (total_addresses(&self.cidr) as usize).saturating_sub(self.reserved.len())
    }
}

fn total_addresses(cidr: &Ipv4Net) -> u32 {
    let host_bits = 32 - cidr.prefix_len() as u32;
    if host_bits >= 32 {
        u32::MAX
    } else {
        1u32 << host_bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(cidr: &str) -> LocalPool {
        LocalPool::new(cidr.parse().unwrap())
    }

    #[test]
    fn test_first_allocation_skips_reserved() {
        let p = pool("10.244.1.0/24");
        let ip = p.allocate_next(AllocationStrategy::Sequential).unwrap();
        assert_eq!(ip, Ipv4Addr::new(10, 244, 1, 4));
    }

    #[test]
    fn test_sequential_advances() {
        let p = pool("10.244.1.0/24");
        let a = p.allocate_next(AllocationStrategy::Sequential).unwrap();
        let b = p.allocate_next(AllocationStrategy::Sequential).unwrap();
        assert_eq!(a, Ipv4Addr::new(10, 244, 1, 4));
        assert_eq!(b, Ipv4Addr::new(10, 244, 1, 5));
    }

    #[test]
    fn test_gateway_is_first_host() {
        let p = pool("10.244.1.0/24");
        assert_eq!(p.gateway(), Ipv4Addr::new(10, 244, 1, 1));
    }

    #[test]
    fn test_slash_30_is_exhausted_from_the_start() {
        // network .0, gateway .1, forward-reserved .2, broadcast .3
        let p = pool("10.0.0.0/30");
        assert_eq!(p.usable_count(), 0);
        assert!(matches!(
            p.allocate_next(AllocationStrategy::Sequential),
            Err(PoolError::Exhausted { .. })
        ));
        assert!(matches!(
            p.allocate_next(AllocationStrategy::DensePack),
            Err(PoolError::Exhausted { .. })
        ));
        assert!(matches!(
            p.allocate_next(AllocationStrategy::Random),
            Err(PoolError::Exhausted { .. })
        ));
    }

    #[test]
    fn test_slash_29_has_three_usable() {
        let p = pool("10.0.0.0/29");
        assert_eq!(p.usable_count(), 3);
        for expected in [4u8, 5, 6] {
            let ip = p.allocate_next(AllocationStrategy::DensePack).unwrap();
            assert_eq!(ip, Ipv4Addr::new(10, 0, 0, expected));
        }
        assert!(matches!(
            p.allocate_next(AllocationStrategy::DensePack),
            Err(PoolError::Exhausted { .. })
        ));
    }

    #[test]
    fn test_release_then_dense_reuses_lowest() {
        let p = pool("10.244.1.0/24");
        let a = p.allocate_next(AllocationStrategy::DensePack).unwrap();
        let _b = p.allocate_next(AllocationStrategy::DensePack).unwrap();
        p.release(a);
        let c = p.allocate_next(AllocationStrategy::DensePack).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn test_sequential_advances_past_freed_slot() {
        let p = pool("10.244.1.0/24");
        let a = p.allocate_next(AllocationStrategy::Sequential).unwrap();
        p.release(a);
        // The cursor moved on; the freed slot is only revisited after a wrap.
        let b = p.allocate_next(AllocationStrategy::Sequential).unwrap();
        assert_eq!(b, Ipv4Addr::new(10, 244, 1, 5));
    }

    #[test]
    fn test_random_stays_in_range() {
        let p = pool("10.244.1.0/24");
        for _ in 0..50 {
            let ip = p.allocate_next(AllocationStrategy::Random).unwrap();
            let host = u32::from(ip) - u32::from(Ipv4Addr::new(10, 244, 1, 0));
            assert!((4..=254).contains(&host), "host {} out of range", host);
            assert!(!p.is_reserved(ip));
        }
    }

    #[test]
    fn test_reserved_never_available() {
        let p = pool("10.244.1.0/24");
        for host in [0u8, 1, 2, 3, 255] {
            assert!(!p.is_available(Ipv4Addr::new(10, 244, 1, host)));
        }
        assert!(p.is_available(Ipv4Addr::new(10, 244, 1, 4)));
    }

    #[test]
    fn test_validate_repairs_wandering_cursor() {
        let p = pool("10.244.1.0/24");
        p.set_cursor(Ipv4Addr::new(192, 168, 9, 9));
        p.validate().unwrap();
        assert_eq!(p.cursor(), Ipv4Addr::new(10, 244, 1, 1));
        // Allocation still works after repair.
        let ip = p.allocate_next(AllocationStrategy::Sequential).unwrap();
        assert_eq!(ip, Ipv4Addr::new(10, 244, 1, 4));
    }

    #[test]
    fn test_mark_allocated_rejects_reserved_and_foreign() {
        let p = pool("10.244.1.0/24");
        assert!(matches!(
            p.mark_allocated(Ipv4Addr::new(10, 244, 1, 1)),
            Err(PoolError::Reserved { .. })
        ));
        assert!(matches!(
            p.mark_allocated(Ipv4Addr::new(10, 9, 9, 9)),
            Err(PoolError::OutOfRange { .. })
        ));
        p.mark_allocated(Ipv4Addr::new(10, 244, 1, 40)).unwrap();
        assert!(!p.is_available(Ipv4Addr::new(10, 244, 1, 40)));
    }

    #[test]
    fn test_counts() {
        let p = pool("10.244.1.0/24");
        assert_eq!(p.reserved_count(), 5);
        assert_eq!(p.usable_count(), 251);
        p.allocate_next(AllocationStrategy::Sequential).unwrap();
        assert_eq!(p.allocated_count(), 1);
        assert_eq!(p.available_count(), 250);
    }

    #[test]
    fn test_sequential_wraps_to_find_freed_slot() {
        let p = pool("10.0.0.0/29");
        let ips: Vec<_> = (0..3)
            .map(|_| p.allocate_next(AllocationStrategy::Sequential).unwrap())
            .collect();
        p.release(ips[0]);
        // Cursor sits past the end of the usable range; the next allocation
        // wraps and finds the freed slot.
        let again = p.allocate_next(AllocationStrategy::Sequential).unwrap();
        assert_eq!(again, ips[0]);
    }
}
