//! Geometry and propagation delay.
//!
//! Positions are Cartesian coordinates in meters. Signals travel at
//! [`SIGNAL_SPEED`] and can interfere with each other up to
//! [`INTERFERENCE_RANGE`] away from their source.

use crate::SimTime;
use cumac_packet::WirePosition;
use serde::{Deserialize, Serialize};

/// Signal speed in meters per second (sound in water).
pub const SIGNAL_SPEED: f64 = 1500.0;

/// Maximum distance at which two transmissions can collide, in meters.
pub const INTERFERENCE_RANGE: f64 = 550.0;

/// Propagation delay across the full interference range.
pub fn max_propagation_delay() -> SimTime {
    SimTime::from_secs(INTERFERENCE_RANGE / SIGNAL_SPEED)
}

/// A 3-D position in meters.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Euclidean distance to another position.
    pub fn distance_to(&self, other: &Position) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    /// One-way propagation delay to another position.
    pub fn propagation_delay_to(&self, other: &Position) -> SimTime {
        SimTime::from_secs(self.distance_to(other) / SIGNAL_SPEED)
    }

    /// Quantize for the wire: each axis rounded and clamped to `u16`.
    pub fn to_wire(&self) -> WirePosition {
        fn axis(v: f64) -> u16 {
            v.round().clamp(0.0, u16::MAX as f64) as u16
        }
        WirePosition::new(axis(self.x), axis(self.y), axis(self.z))
    }

    pub fn from_wire(wire: WirePosition) -> Self {
        Self::new(wire.x as f64, wire.y as f64, wire.z as f64)
    }
}

impl From<WirePosition> for Position {
    fn from(wire: WirePosition) -> Self {
        Position::from_wire(wire)
    }
}

/// Euclidean distance between two positions.
pub fn distance(a: &Position, b: &Position) -> f64 {
    a.distance_to(b)
}

/// One-way propagation delay between two positions.
pub fn propagation_delay(a: &Position, b: &Position) -> SimTime {
    a.propagation_delay_to(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance() {
        let a = Position::new(0.0, 0.0, 0.0);
        let b = Position::new(0.0, 300.0, 400.0);
        assert!((distance(&a, &b) - 500.0).abs() < 1e-9);
        assert_eq!(distance(&a, &b), distance(&b, &a));
    }

    #[test]
    fn test_propagation_delay() {
        let a = Position::new(0.0, 0.0, 0.0);
        let b = Position::new(0.0, 0.0, 300.0);
        assert_eq!(propagation_delay(&a, &b), SimTime::from_millis(200));
        assert_eq!(propagation_delay(&a, &a), SimTime::ZERO);
    }

    #[test]
    fn test_max_propagation_delay() {
        assert_eq!(max_propagation_delay().as_micros(), 366_667);
    }

    #[test]
    fn test_wire_quantization() {
        let p = Position::new(10.4, 10.6, -5.0);
        assert_eq!(p.to_wire(), WirePosition::new(10, 11, 0));
        let far = Position::new(1e9, 0.0, 0.0);
        assert_eq!(far.to_wire().x, u16::MAX);
        assert_eq!(Position::from_wire(WirePosition::new(1, 2, 3)), Position::new(1.0, 2.0, 3.0));
    }
}
