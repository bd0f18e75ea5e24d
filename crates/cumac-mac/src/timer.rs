//! MAC timers.
//!
//! Timer events carry a single `u64`. The top bits select the timer kind and
//! the low 48 bits carry a generation token, so a timer event posted before
//! a cancel or re-arm is recognised as stale and ignored.

use cumac_common::{EntityId, EventPayload, SimContext, SimTime};
use thiserror::Error;

const KIND_SHIFT: u32 = 48;
const TOKEN_MASK: u64 = (1 << KIND_SHIFT) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Backoff = 1,
    CtsWait = 2,
    DataWait = 3,
    BeaconPoll = 4,
    BusyExpire = 5,
}

impl TimerKind {
    fn from_tag(tag: u64) -> Option<Self> {
        match tag {
            1 => Some(TimerKind::Backoff),
            2 => Some(TimerKind::CtsWait),
            3 => Some(TimerKind::DataWait),
            4 => Some(TimerKind::BeaconPoll),
            5 => Some(TimerKind::BusyExpire),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimerKind::Backoff => "backoff",
            TimerKind::CtsWait => "cts_wait",
            TimerKind::DataWait => "data_wait",
            TimerKind::BeaconPoll => "beacon_poll",
            TimerKind::BusyExpire => "busy_expire",
        }
    }
}

impl std::fmt::Display for TimerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pack a timer kind and token into a timer id.
pub fn timer_id(kind: TimerKind, token: u64) -> u64 {
    ((kind as u64) << KIND_SHIFT) | (token & TOKEN_MASK)
}

/// Split a timer id back into kind and token.
pub fn decode_timer_id(id: u64) -> Option<(TimerKind, u64)> {
    TimerKind::from_tag(id >> KIND_SHIFT).map(|kind| (kind, id & TOKEN_MASK))
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimerError {
    #[error("{0} timer is already armed")]
    AlreadyArmed(TimerKind),
}

/// A single re-armable timer.
#[derive(Debug, Clone)]
pub struct TimerSlot {
    kind: TimerKind,
    generation: u64,
    armed: bool,
    deadline: SimTime,
}

impl TimerSlot {
    pub fn new(kind: TimerKind) -> Self {
        Self {
            kind,
            generation: 0,
            armed: false,
            deadline: SimTime::ZERO,
        }
    }

    pub fn kind(&self) -> TimerKind {
        self.kind
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Expiry time while armed.
    pub fn deadline(&self) -> Option<SimTime> {
        self.armed.then_some(self.deadline)
    }

    /// Post a timer event to `owner` after `delay`.
    pub fn arm(
        &mut self,
        ctx: &mut SimContext,
        owner: EntityId,
        delay: SimTime,
    ) -> Result<(), TimerError> {
        if self.armed {
            return Err(TimerError::AlreadyArmed(self.kind));
        }
        self.generation = (self.generation + 1) & TOKEN_MASK;
        self.armed = true;
        self.deadline = ctx.time() + delay;
        ctx.post_event(
            delay,
            vec![owner],
            EventPayload::Timer {
                timer_id: timer_id(self.kind, self.generation),
            },
        );
        Ok(())
    }

    /// Disarm. Any event already posted becomes stale.
    pub fn cancel(&mut self) {
        self.armed = false;
    }

    /// Consume a timer event. Returns true only for the live generation.
    pub fn fire(&mut self, token: u64) -> bool {
        if self.armed && token == self.generation {
            self.armed = false;
            true
        } else {
            false
        }
    }
}

/// Contention timer that can be paused while the medium is busy and resumed
/// later with its remaining time.
#[derive(Debug, Clone)]
pub struct BackoffTimer {
    slot: TimerSlot,
    remaining: Option<SimTime>,
    armed_at: SimTime,
}

impl BackoffTimer {
    pub fn new() -> Self {
        Self {
            slot: TimerSlot::new(TimerKind::Backoff),
            remaining: None,
            armed_at: SimTime::ZERO,
        }
    }

    /// Set a new countdown without arming it.
    pub fn start(&mut self, delay: SimTime) {
        self.slot.cancel();
        self.remaining = Some(delay);
    }

    /// True while a countdown is outstanding, running or paused.
    pub fn is_pending(&self) -> bool {
        self.remaining.is_some()
    }

    pub fn remaining(&self) -> Option<SimTime> {
        self.remaining
    }

    pub fn deadline(&self) -> Option<SimTime> {
        self.slot.deadline()
    }

    /// Arm the outstanding countdown if it is paused. No-op otherwise.
    pub fn resume(&mut self, ctx: &mut SimContext, owner: EntityId) -> Result<(), TimerError> {
        match self.remaining {
            Some(remaining) if !self.slot.is_armed() => {
                self.armed_at = ctx.time();
                self.slot.arm(ctx, owner, remaining)
            }
            _ => Ok(()),
        }
    }

    /// Stop the countdown, keeping the unelapsed part.
    pub fn pause(&mut self, now: SimTime) {
        if !self.slot.is_armed() {
            return;
        }
        self.slot.cancel();
        if let Some(remaining) = self.remaining {
            self.remaining = Some(remaining - (now - self.armed_at));
        }
    }

    /// Add `extra` to a pending countdown. The caller pauses first if the
    /// countdown is running.
    pub fn extend(&mut self, extra: SimTime) {
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining += extra;
        }
    }

    /// Consume a timer event. Returns true when the countdown completed.
    pub fn fire(&mut self, token: u64) -> bool {
        if self.slot.fire(token) {
            self.remaining = None;
            true
        } else {
            false
        }
    }

    pub fn clear(&mut self) {
        self.slot.cancel();
        self.remaining = None;
    }
}

impl Default for BackoffTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OWNER: EntityId = EntityId(7);

    fn fired_token(ctx: &mut SimContext) -> (SimTime, u64) {
        let events = ctx.take_pending_events();
        assert_eq!(events.len(), 1);
        match &events[0].payload {
            EventPayload::Timer { timer_id } => {
                let (_, token) = decode_timer_id(*timer_id).unwrap();
                (events[0].time, token)
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_timer_id_roundtrip() {
        let id = timer_id(TimerKind::BeaconPoll, 42);
        assert_eq!(decode_timer_id(id), Some((TimerKind::BeaconPoll, 42)));
        assert_eq!(decode_timer_id(42), None);
    }

    #[test]
    fn test_double_arm_rejected() {
        let mut ctx = SimContext::new(1);
        let mut slot = TimerSlot::new(TimerKind::CtsWait);
        slot.arm(&mut ctx, OWNER, SimTime::from_millis(10)).unwrap();
        assert_eq!(
            slot.arm(&mut ctx, OWNER, SimTime::from_millis(10)),
            Err(TimerError::AlreadyArmed(TimerKind::CtsWait))
        );
    }

    #[test]
    fn test_stale_generation_ignored() {
        let mut ctx = SimContext::new(1);
        let mut slot = TimerSlot::new(TimerKind::DataWait);
        slot.arm(&mut ctx, OWNER, SimTime::from_millis(10)).unwrap();
        let (_, stale) = fired_token(&mut ctx);
        slot.cancel();
        slot.cancel();
        slot.arm(&mut ctx, OWNER, SimTime::from_millis(20)).unwrap();
        let (_, live) = fired_token(&mut ctx);

        assert!(!slot.fire(stale));
        assert!(slot.is_armed());
        assert!(slot.fire(live));
        assert!(!slot.fire(live));
    }

    #[test]
    fn test_backoff_pause_resume_totals_delay() {
        let mut ctx = SimContext::new(1);
        let mut backoff = BackoffTimer::new();
        backoff.start(SimTime::from_millis(1000));
        backoff.resume(&mut ctx, OWNER).unwrap();
        let (_, stale) = fired_token(&mut ctx);

        backoff.pause(SimTime::from_millis(400));
        assert_eq!(backoff.remaining(), Some(SimTime::from_millis(600)));
        assert!(!backoff.fire(stale));

        ctx.set_time(SimTime::from_millis(2000));
        backoff.resume(&mut ctx, OWNER).unwrap();
        let (when, token) = fired_token(&mut ctx);
        assert_eq!(when, SimTime::from_millis(2600));
        assert!(backoff.fire(token));
        assert!(!backoff.is_pending());
    }

    #[test]
    fn test_backoff_extend_while_paused() {
        let mut ctx = SimContext::new(1);
        let mut backoff = BackoffTimer::new();
        backoff.start(SimTime::from_millis(500));
        backoff.extend(SimTime::from_millis(250));
        backoff.resume(&mut ctx, OWNER).unwrap();
        backoff.resume(&mut ctx, OWNER).unwrap();
        let (when, _) = fired_token(&mut ctx);
        assert_eq!(when, SimTime::from_millis(750));
    }

    #[test]
    fn test_backoff_clear() {
        let mut ctx = SimContext::new(1);
        let mut backoff = BackoffTimer::new();
        backoff.start(SimTime::from_millis(500));
        backoff.resume(&mut ctx, OWNER).unwrap();
        let (_, token) = fired_token(&mut ctx);
        backoff.clear();
        assert!(!backoff.fire(token));
        assert!(!backoff.is_pending());
    }
}
