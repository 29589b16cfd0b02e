use std::collections::BTreeSet;
use std::ops::RangeInclusive;

use crate::error::PortsExhausted;

/// Lease bookkeeping for a fixed local port range. Each port is free,
/// leased, or dead; dead is terminal.
#[derive(Debug)]
pub struct PortAllocator {
    range: RangeInclusive<u16>,
    leased: BTreeSet<u16>,
    dead: BTreeSet<u16>,
}

impl PortAllocator {
    pub fn new(range: RangeInclusive<u16>) -> Self {
        Self {
            range,
            leased: BTreeSet::new(),
            dead: BTreeSet::new(),
        }
    }

    pub fn range(&self) -> &RangeInclusive<u16> {
        &self.range
    }

    /// Lease the lowest port that is neither leased nor dead.
    pub fn allocate(&mut self) -> Result<u16, PortsExhausted> {
        let port = self
            .range
            .clone()
            .find(|p| !self.leased.contains(p) && !self.dead.contains(p))
            .ok_or(PortsExhausted {
                start: *self.range.start(),
                end: *self.range.end(),
            })?;
        self.leased.insert(port);
        Ok(port)
    }

    /// Return a leased port to the free pool.
    pub fn release(&mut self, port: u16) {
        if self.range.contains(&port) {
            self.leased.remove(&port);
        }
    }

    /// Retire a port permanently, usually after a confirmed bind collision.
    pub fn mark_dead(&mut self, port: u16) {
        if self.range.contains(&port) {
            self.leased.remove(&port);
            self.dead.insert(port);
        }
    }

    /// Lease one specific port, as when adopting a process that already
    /// listens on it.
    pub fn claim(&mut self, port: u16) -> bool {
        if !self.range.contains(&port) || self.dead.contains(&port) {
            return false;
        }
        self.leased.insert(port)
    }

    pub fn is_leased(&self, port: u16) -> bool {
        self.leased.contains(&port)
    }

    pub fn is_dead(&self, port: u16) -> bool {
        self.dead.contains(&port)
    }

    /// Ports still available for allocation.
    pub fn available(&self) -> usize {
        let total = self.range.clone().count();
        total - self.leased.len() - self.dead.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn allocates_lowest_free_port() {
        let mut ports = PortAllocator::new(50_000..=50_002);
        assert_eq!(ports.allocate().unwrap(), 50_000);
        assert_eq!(ports.allocate().unwrap(), 50_001);
        ports.release(50_000);
        assert_eq!(ports.allocate().unwrap(), 50_000);
    }

    #[test]
    fn never_hands_out_a_port_twice() {
        let mut ports = PortAllocator::new(50_000..=50_099);
        let mut seen = HashSet::new();
        for _ in 0..100 {
            assert!(seen.insert(ports.allocate().unwrap()));
        }
        assert!(ports.allocate().is_err());
    }

    #[test]
    fn dead_ports_are_terminal() {
        let mut ports = PortAllocator::new(50_000..=50_001);
        let p = ports.allocate().unwrap();
        ports.mark_dead(p);
        assert!(ports.is_dead(p));
        assert!(!ports.is_leased(p));

        ports.release(p);
        assert!(!ports.claim(p));
        assert_eq!(ports.allocate().unwrap(), 50_001);
        assert_eq!(
            ports.allocate().unwrap_err(),
            PortsExhausted { start: 50_000, end: 50_001 }
        );
    }

    #[test]
    fn out_of_range_operations_are_noops() {
        let mut ports = PortAllocator::new(50_000..=50_001);
        ports.mark_dead(80);
        ports.release(80);
        assert!(!ports.is_dead(80));
        assert!(!ports.claim(80));
        assert_eq!(ports.available(), 2);
    }

    #[test]
    fn claim_leases_specific_port_once() {
        let mut ports = PortAllocator::new(50_000..=50_010);
        assert!(ports.claim(50_005));
        assert!(ports.is_leased(50_005));
        assert!(!ports.claim(50_005));
        assert_eq!(ports.available(), 10);
        assert_eq!(ports.allocate().unwrap(), 50_000);
    }

    #[test]
    fn available_counts_free_ports() {
        let mut ports = PortAllocator::new(50_000..=50_004);
        let a = ports.allocate().unwrap();
        let b = ports.allocate().unwrap();
        ports.mark_dead(b);
        assert_eq!(ports.available(), 3);
        ports.release(a);
        assert_eq!(ports.available(), 4);
    }
}
