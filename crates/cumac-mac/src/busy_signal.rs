//! Busy-signal table.
//!
//! A marker records that some node within [`INTERFERENCE_RANGE`] objected to
//! a beaconed channel for one signal interval. Markers expire after twice
//! the maximum propagation delay plus the tone interval for their index.

use std::collections::BTreeMap;

use cumac_common::{max_propagation_delay, ChannelId, Position, SimTime, INTERFERENCE_RANGE};

/// Tone spacing as a function of the signal interval index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToneTiming {
    pub base: SimTime,
    pub step: SimTime,
}

impl ToneTiming {
    pub const DEFAULT: ToneTiming = ToneTiming {
        base: SimTime::from_micros(200_000),
        step: SimTime::from_micros(10_000),
    };

    /// Interval between tone polls for signal interval `index`.
    pub fn interval(&self, index: u8) -> SimTime {
        self.base + self.step.mul(index as u64)
    }

    /// How long a marker for `index` stays valid.
    pub fn marker_lifetime(&self, index: u8) -> SimTime {
        max_propagation_delay().mul(2) + self.interval(index)
    }
}

impl Default for ToneTiming {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BusyMarker {
    pub channel: ChannelId,
    pub signal_interval: u8,
    pub position: Position,
    pub created: SimTime,
    pub expires: SimTime,
}

impl BusyMarker {
    fn is_live(&self, now: SimTime) -> bool {
        now < self.expires
    }
}

#[derive(Debug, Clone, Default)]
pub struct BusySignalTable {
    markers: BTreeMap<u64, BusyMarker>,
    next_id: u64,
    timing: ToneTiming,
}

impl BusySignalTable {
    pub fn new(timing: ToneTiming) -> Self {
        Self {
            markers: BTreeMap::new(),
            next_id: 0,
            timing,
        }
    }

    pub fn timing(&self) -> ToneTiming {
        self.timing
    }

    /// Record a marker. Returns its id and lifetime; the caller is expected
    /// to call [`remove`](Self::remove) with the id once the lifetime ends.
    pub fn notify_busy(
        &mut self,
        now: SimTime,
        channel: ChannelId,
        signal_interval: u8,
        position: Position,
    ) -> (u64, SimTime) {
        let lifetime = self.timing.marker_lifetime(signal_interval);
        let id = self.next_id;
        self.next_id += 1;
        self.markers.insert(
            id,
            BusyMarker {
                channel,
                signal_interval,
                position,
                created: now,
                expires: now + lifetime,
            },
        );
        (id, lifetime)
    }

    /// Whether a live marker exists for `(channel, signal_interval)` within
    /// range of `position`.
    pub fn is_busy(
        &self,
        now: SimTime,
        channel: ChannelId,
        signal_interval: u8,
        position: &Position,
    ) -> bool {
        self.markers.values().any(|marker| {
            marker.is_live(now)
                && marker.channel == channel
                && marker.signal_interval == signal_interval
                && marker.position.distance_to(position) <= INTERFERENCE_RANGE
        })
    }

    pub fn remove(&mut self, id: u64) -> Option<BusyMarker> {
        self.markers.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tone_interval() {
        let timing = ToneTiming::default();
        assert_eq!(timing.interval(0), SimTime::from_millis(200));
        assert_eq!(timing.interval(11), SimTime::from_millis(310));
    }

    #[test]
    fn test_marker_expiry_index_zero() {
        let mut table = BusySignalTable::default();
        let here = Position::new(0.0, 0.0, 0.0);
        let now = SimTime::from_secs(10.0);
        let (_, lifetime) = table.notify_busy(now, 2, 0, here);
        assert_eq!(lifetime.as_micros(), 2 * 366_667 + 200_000);

        assert!(table.is_busy(now, 2, 0, &here));
        assert!(table.is_busy(now + lifetime - SimTime::from_micros(1), 2, 0, &here));
        assert!(!table.is_busy(now + lifetime, 2, 0, &here));
    }

    #[test]
    fn test_marker_expiry_index_seven() {
        let mut table = BusySignalTable::default();
        let here = Position::new(0.0, 0.0, 0.0);
        let (id, lifetime) = table.notify_busy(SimTime::ZERO, 5, 7, here);
        assert_eq!(lifetime.as_micros(), 2 * 366_667 + 270_000);
        assert!(table.is_busy(SimTime::from_millis(1000), 5, 7, &here));
        assert!(!table.is_busy(SimTime::from_millis(1004), 5, 7, &here));

        assert!(table.remove(id).is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn test_match_requires_channel_interval_and_range() {
        let mut table = BusySignalTable::default();
        let marker_pos = Position::new(0.0, 0.0, 0.0);
        table.notify_busy(SimTime::ZERO, 3, 4, marker_pos);

        assert!(!table.is_busy(SimTime::ZERO, 4, 4, &marker_pos));
        assert!(!table.is_busy(SimTime::ZERO, 3, 5, &marker_pos));
        assert!(table.is_busy(SimTime::ZERO, 3, 4, &Position::new(0.0, 0.0, 550.0)));
        assert!(!table.is_busy(SimTime::ZERO, 3, 4, &Position::new(0.0, 0.0, 551.0)));
    }
}
