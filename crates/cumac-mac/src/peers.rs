//! Last known positions of neighbours, learned from control frames.

use std::collections::BTreeMap;

use cumac_common::{max_propagation_delay, Address, Position, SimTime};

#[derive(Debug, Clone, Default)]
pub struct PeerTable {
    positions: BTreeMap<Address, Position>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, address: Address, position: Position) {
        if !address.is_broadcast() {
            self.positions.insert(address, position);
        }
    }

    pub fn position(&self, address: Address) -> Option<Position> {
        self.positions.get(&address).copied()
    }

    /// Propagation delay from `from` to `address`. Unknown peers are assumed
    /// to be at the edge of the interference range.
    pub fn delay_to(&self, address: Address, from: &Position) -> SimTime {
        self.position(address)
            .map(|position| from.propagation_delay_to(&position))
            .unwrap_or_else(max_propagation_delay)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}
