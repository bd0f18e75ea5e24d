//! Channel reservation manager.
//!
//! Each node keeps its own table of known and predicted transmissions,
//! learned from the control frames it sends and overhears. A proposed
//! transmission collides with a recorded one when, on the same channel, the
//! two arrival windows overlap at a receiver within [`INTERFERENCE_RANGE`]
//! of the other transmission's endpoint.

use cumac_common::{ChannelId, Position, SimTime, INTERFERENCE_RANGE};
use thiserror::Error;

/// Default grace period after a reservation's finish before it is pruned.
pub const DEFAULT_PRUNE_MARGIN: SimTime = SimTime::from_micros(5_000_000);

/// A window was built with its finish before its start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("time window finishes at {finish} before it starts at {start}")]
pub struct InvalidWindow {
    pub start: SimTime,
    pub finish: SimTime,
}

/// Closed time interval `[start, finish]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    start: SimTime,
    finish: SimTime,
}

impl TimeWindow {
    pub fn new(start: SimTime, finish: SimTime) -> Result<Self, InvalidWindow> {
        if start > finish {
            return Err(InvalidWindow { start, finish });
        }
        Ok(Self { start, finish })
    }

    /// Window of `duration` beginning at `start`.
    pub fn starting_at(start: SimTime, duration: SimTime) -> Self {
        Self {
            start,
            finish: start + duration,
        }
    }

    pub fn start(&self) -> SimTime {
        self.start
    }

    pub fn finish(&self) -> SimTime {
        self.finish
    }

    pub fn duration(&self) -> SimTime {
        self.finish - self.start
    }

    /// The same window moved later by `delay`.
    pub fn shifted(&self, delay: SimTime) -> Self {
        Self {
            start: self.start + delay,
            finish: self.finish + delay,
        }
    }

    /// Inclusive overlap test.
    pub fn overlaps(&self, other: &TimeWindow) -> bool {
        self.start <= other.finish && other.start <= self.finish
    }
}

/// One known or predicted transmission.
#[derive(Debug, Clone, PartialEq)]
pub struct ReservationEntry {
    pub channel: ChannelId,
    pub src: Position,
    pub dst: Position,
    /// Transmission window at the sender.
    pub window: TimeWindow,
}

impl ReservationEntry {
    /// When this transmission is heard at `at`.
    pub fn arrival_at(&self, at: &Position) -> TimeWindow {
        self.window.shifted(self.src.propagation_delay_to(at))
    }

    fn is_expired(&self, now: SimTime, margin: SimTime) -> bool {
        now > self.window.finish() + margin
    }
}

/// Per-node table of channel reservations.
#[derive(Debug, Clone)]
pub struct ChannelManager {
    entries: Vec<ReservationEntry>,
    prune_margin: SimTime,
}

impl ChannelManager {
    pub fn new(prune_margin: SimTime) -> Self {
        Self {
            entries: Vec::new(),
            prune_margin,
        }
    }

    /// Record a transmission. No deduplication.
    pub fn register_transmission(
        &mut self,
        channel: ChannelId,
        window: TimeWindow,
        src: Position,
        dst: Position,
    ) {
        self.entries.push(ReservationEntry {
            channel,
            src,
            dst,
            window,
        });
    }

    /// Drop entries that expired as of `now`.
    pub fn prune(&mut self, now: SimTime) {
        let margin = self.prune_margin;
        self.entries.retain(|entry| !entry.is_expired(now, margin));
    }

    /// Whether `src` can send to `dst` on `channel` during `window` (at the
    /// sender) without colliding with any recorded transmission at either
    /// end. Prunes as of `window.start()` first.
    pub fn can_transmit(
        &mut self,
        channel: ChannelId,
        window: TimeWindow,
        src: &Position,
        dst: &Position,
    ) -> bool {
        self.prune(window.start());
        let arrival_at_dst = window.shifted(src.propagation_delay_to(dst));
        self.can_transmit_from_src(channel, window, src)
            && self.can_transmit_to_dst(channel, arrival_at_dst, dst)
    }

    /// Sender half: would a transmission from `src` during `window` reach
    /// any recorded receiver near `src` while that receiver is busy?
    pub fn can_transmit_from_src(
        &self,
        channel: ChannelId,
        window: TimeWindow,
        src: &Position,
    ) -> bool {
        !self
            .entries
            .iter()
            .filter(|entry| entry.channel == channel)
            .filter(|entry| src.distance_to(&entry.dst) <= INTERFERENCE_RANGE)
            .any(|entry| {
                let ours = window.shifted(src.propagation_delay_to(&entry.dst));
                ours.overlaps(&entry.arrival_at(&entry.dst))
            })
    }

    /// Receiver half: would any recorded sender near `dst` be heard at `dst`
    /// while our frame arrives there during `arrival`?
    pub fn can_transmit_to_dst(
        &self,
        channel: ChannelId,
        arrival: TimeWindow,
        dst: &Position,
    ) -> bool {
        !self
            .entries
            .iter()
            .filter(|entry| entry.channel == channel)
            .filter(|entry| entry.src.distance_to(dst) <= INTERFERENCE_RANGE)
            .any(|entry| entry.arrival_at(dst).overlaps(&arrival))
    }

    /// Whether any entry unexpired at `now` uses `channel`. The position is
    /// not consulted.
    pub fn is_registered(&self, channel: ChannelId, _position: &Position, now: SimTime) -> bool {
        let margin = self.prune_margin;
        self.entries
            .iter()
            .any(|entry| entry.channel == channel && !entry.is_expired(now, margin))
    }

    pub fn entries(&self) -> &[ReservationEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ChannelManager {
    fn default() -> Self {
        Self::new(DEFAULT_PRUNE_MARGIN)
    }
}
