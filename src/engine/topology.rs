//! HDMI input topology
//!
//! One entry per physical input port. Each port owns a three-level chain of
//! downstream logical addresses keyed by physical-address nibble, mirroring
//! how CEC physical addresses encode the port tree: nibble 0 names the port,
//! nibbles 1..3 walk through cascaded switches.

use crate::message::{LogicalAddress, PhysicalAddress, BROADCAST};
use tracing::debug;

/// Chain slot value for "nobody registered here"
const UNREGISTERED: u8 = BROADCAST;

/// Downstream logical addresses at one chain depth, indexed by nibble - 1
#[derive(Debug, Clone)]
struct ChainLevel {
    children: [u8; 15],
}

impl Default for ChainLevel {
    fn default() -> Self {
        ChainLevel {
            children: [UNREGISTERED; 15],
        }
    }
}

/// One physical HDMI input port and its downstream device chain
#[derive(Debug)]
pub struct HdmiPort {
    /// 0-based port index; the port's physical address is (id+1).0.0.0
    pub id: u8,
    pub connected: bool,
    /// Logical address of the device plugged directly into this port
    own_logical: u8,
    physical: PhysicalAddress,
    chain: [ChainLevel; 3],
}

impl HdmiPort {
    pub fn new(id: u8) -> Self {
        HdmiPort {
            id,
            connected: false,
            own_logical: UNREGISTERED,
            physical: PhysicalAddress::new(id + 1, 0, 0, 0),
            chain: Default::default(),
        }
    }

    pub fn physical_address(&self) -> PhysicalAddress {
        self.physical
    }

    pub fn own_logical_address(&self) -> Option<u8> {
        (self.own_logical != UNREGISTERED).then_some(self.own_logical)
    }

    /// Whether `addr` sits under this port
    fn matches(&self, addr: PhysicalAddress) -> bool {
        addr.nibble(0) == self.physical.nibble(0)
    }

    /// Deepest non-zero nibble below the port level, if any
    ///
    /// Returns (chain depth 0..3, child index). Depth 0 is the device
    /// directly behind a switch on this port.
    fn chain_slot(addr: PhysicalAddress) -> Option<(usize, usize)> {
        if addr.nibble(1) == 0 {
            return None;
        }
        for depth in (1..4).rev() {
            let nibble = addr.nibble(depth);
            if nibble != 0 {
                return Some((depth - 1, nibble as usize - 1));
            }
        }
        None
    }

    /// Record a device below this port
    ///
    /// A device whose physical address equals the port's own becomes the
    /// direct child; deeper addresses land in the chain, provided the nibble
    /// path stays under this port's prefix.
    pub fn add_device(&mut self, logical: LogicalAddress, addr: PhysicalAddress) {
        if addr == self.physical {
            debug!("port {}: direct device {} at {}", self.id, logical, addr);
            self.own_logical = logical.value();
            return;
        }
        if self.own_logical == UNREGISTERED || self.own_logical == logical.value() {
            return;
        }
        if self.matches(addr) {
            if let Some((depth, index)) = Self::chain_slot(addr) {
                debug!(
                    "port {}: chained device {} at {} (depth {})",
                    self.id, logical, addr, depth
                );
                self.chain[depth].children[index] = logical.value();
            }
        }
    }

    /// Drop whatever was registered at `addr`
    pub fn remove_device(&mut self, addr: PhysicalAddress) {
        if addr == self.physical {
            self.own_logical = UNREGISTERED;
            return;
        }
        if self.own_logical == UNREGISTERED {
            return;
        }
        if self.matches(addr) {
            if let Some((depth, index)) = Self::chain_slot(addr) {
                self.chain[depth].children[index] = UNREGISTERED;
            }
        }
    }

    /// Logical addresses along the path to `addr`, deepest hop first,
    /// finishing with the device directly on this port. Unknown hops are
    /// skipped.
    pub fn route_to(&self, addr: PhysicalAddress, route: &mut Vec<u8>) {
        if self.own_logical == UNREGISTERED {
            return;
        }
        if self.matches(addr) && addr.nibble(1) != 0 {
            for depth in (1..4).rev() {
                let nibble = addr.nibble(depth);
                if nibble != 0 {
                    let hop = self.chain[depth - 1].children[nibble as usize - 1];
                    if hop != UNREGISTERED {
                        route.push(hop);
                    }
                }
            }
        }
        route.push(self.own_logical);
    }
}

/// All input ports of the sink
#[derive(Debug)]
pub struct Topology {
    ports: Vec<HdmiPort>,
}

impl Topology {
    pub fn new(port_count: u8) -> Self {
        Topology {
            ports: (0..port_count).map(HdmiPort::new).collect(),
        }
    }

    pub fn port_count(&self) -> u8 {
        self.ports.len() as u8
    }

    pub fn set_connected(&mut self, port_id: u8, connected: bool) {
        if let Some(port) = self.ports.get_mut(port_id as usize) {
            port.connected = connected;
        }
    }

    pub fn is_connected(&self, port_id: u8) -> bool {
        self.ports
            .get(port_id as usize)
            .map(|p| p.connected)
            .unwrap_or(false)
    }

    /// 1-based port id an address belongs to, when it names one of our ports
    pub fn port_for(&self, addr: PhysicalAddress) -> Option<u8> {
        let nibble = addr.nibble(0);
        (nibble >= 1 && nibble as usize <= self.ports.len()).then_some(nibble)
    }

    /// Register `logical` at `addr` on whichever port it belongs to
    pub fn add_device(&mut self, logical: LogicalAddress, addr: PhysicalAddress) {
        if !addr.is_valid() {
            return;
        }
        for port in &mut self.ports {
            port.add_device(logical, addr);
        }
    }

    pub fn remove_device(&mut self, addr: PhysicalAddress) {
        if !addr.is_valid() {
            return;
        }
        for port in &mut self.ports {
            port.remove_device(addr);
        }
    }

    /// Route from the device at `addr` back to this sink, deepest hop first
    pub fn route_for(&self, addr: PhysicalAddress) -> Vec<u8> {
        let mut route = Vec::new();
        if let Some(port_nibble) = self.port_for(addr) {
            self.ports[port_nibble as usize - 1].route_to(addr, &mut route);
        }
        route
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn la(v: u8) -> LogicalAddress {
        LogicalAddress::new(v).unwrap()
    }

    #[test]
    fn direct_device_becomes_port_child() {
        let mut topo = Topology::new(3);
        topo.add_device(la(4), PhysicalAddress::new(1, 0, 0, 0));

        assert_eq!(topo.port_for(PhysicalAddress::new(1, 0, 0, 0)), Some(1));
        assert_eq!(topo.route_for(PhysicalAddress::new(1, 0, 0, 0)), vec![4]);
    }

    #[test]
    fn chained_device_routes_through_direct_child() {
        let mut topo = Topology::new(3);
        // AVR directly on port 2, player behind it
        topo.add_device(la(5), PhysicalAddress::new(2, 0, 0, 0));
        topo.add_device(la(4), PhysicalAddress::new(2, 1, 0, 0));

        assert_eq!(topo.route_for(PhysicalAddress::new(2, 1, 0, 0)), vec![4, 5]);
    }

    #[test]
    fn chain_entry_requires_matching_port_prefix() {
        let mut topo = Topology::new(3);
        topo.add_device(la(5), PhysicalAddress::new(2, 0, 0, 0));
        // Address under port 1 must not land in port 2's chain
        topo.add_device(la(4), PhysicalAddress::new(1, 1, 0, 0));

        assert_eq!(topo.route_for(PhysicalAddress::new(2, 1, 0, 0)), vec![5]);
    }

    #[test]
    fn removal_resets_chain_slot_to_unregistered() {
        let mut topo = Topology::new(3);
        topo.add_device(la(5), PhysicalAddress::new(1, 0, 0, 0));
        topo.add_device(la(4), PhysicalAddress::new(1, 2, 0, 0));
        assert_eq!(topo.route_for(PhysicalAddress::new(1, 2, 0, 0)), vec![4, 5]);

        topo.remove_device(PhysicalAddress::new(1, 2, 0, 0));
        assert_eq!(topo.route_for(PhysicalAddress::new(1, 2, 0, 0)), vec![5]);
    }

    #[test]
    fn three_level_chain() {
        let mut topo = Topology::new(3);
        topo.add_device(la(5), PhysicalAddress::new(1, 0, 0, 0));
        topo.add_device(la(3), PhysicalAddress::new(1, 1, 0, 0));
        topo.add_device(la(8), PhysicalAddress::new(1, 1, 2, 0));
        topo.add_device(la(4), PhysicalAddress::new(1, 1, 2, 3));

        assert_eq!(
            topo.route_for(PhysicalAddress::new(1, 1, 2, 3)),
            vec![4, 8, 3, 5]
        );
    }

    #[test]
    fn addresses_off_our_ports_have_no_route() {
        let topo = Topology::new(2);
        assert!(topo.route_for(PhysicalAddress::new(3, 0, 0, 0)).is_empty());
        assert_eq!(topo.port_for(PhysicalAddress::new(3, 0, 0, 0)), None);
    }
}
