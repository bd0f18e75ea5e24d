//! # cumac-common
//!
//! Common types and traits for the CUMAC simulator.
//!
//! This crate provides core simulation primitives including:
//! - Time representation ([`SimTime`])
//! - Positions and propagation delay ([`geometry`])
//! - Entity identification ([`EntityId`])
//! - Event system ([`Event`], [`EventPayload`])
//! - Simulation context ([`SimContext`])
//! - Entity traits ([`Entity`])

pub mod geometry;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::error;

// Re-export cumac-packet types
pub use cumac_packet::{Address, ChannelId, CumacPacket, FrameType, CONTROL_CHANNEL};
pub use geometry::{
    distance, max_propagation_delay, propagation_delay, Position, INTERFERENCE_RANGE,
    SIGNAL_SPEED,
};

// ============================================================================
// Error Types
// ============================================================================

/// Simulation errors.
#[derive(Debug, Error)]
pub enum SimError {
    /// Entity not found.
    #[error("Entity not found: {0:?}")]
    EntityNotFound(EntityId),

    /// Invalid event target.
    #[error("Invalid event target: {0:?}")]
    InvalidTarget(EntityId),

    /// Simulation time overflow.
    #[error("Simulation time overflow")]
    TimeOverflow,

    /// Event handler error.
    #[error("Event handler error in entity {entity:?}: {message}")]
    HandlerError {
        /// Entity that had the error.
        entity: EntityId,
        /// Error message.
        message: String,
    },
}

// ============================================================================
// Time Types
// ============================================================================

/// Simulation time in microseconds since simulation start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SimTime(u64);

impl SimTime {
    /// Zero time.
    pub const ZERO: SimTime = SimTime(0);

    /// Create from microseconds.
    pub const fn from_micros(us: u64) -> Self {
        SimTime(us)
    }

    /// Create from milliseconds.
    pub fn from_millis(ms: u64) -> Self {
        SimTime(ms * 1000)
    }

    /// Create from seconds (float), rounded to the nearest microsecond.
    /// Negative values clamp to zero.
    pub fn from_secs(s: f64) -> Self {
        SimTime((s * 1_000_000.0).round() as u64)
    }

    /// Get as microseconds.
    pub fn as_micros(&self) -> u64 {
        self.0
    }

    /// Get as milliseconds.
    pub fn as_millis(&self) -> u64 {
        self.0 / 1000
    }

    /// Get as seconds (float).
    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    /// Subtract duration from time.
    pub fn sub(&self, duration: SimTime) -> Option<SimTime> {
        self.0.checked_sub(duration.0).map(SimTime)
    }

    /// Multiply a duration by an integer factor.
    pub fn mul(&self, factor: u64) -> SimTime {
        SimTime(self.0.saturating_mul(factor))
    }
}

impl std::ops::Add for SimTime {
    type Output = SimTime;

    fn add(self, rhs: Self) -> Self::Output {
        SimTime(self.0 + rhs.0)
    }
}

impl std::ops::AddAssign for SimTime {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl std::ops::Sub for SimTime {
    type Output = SimTime;

    fn sub(self, rhs: Self) -> Self::Output {
        SimTime(self.0.saturating_sub(rhs.0))
    }
}

impl std::fmt::Display for SimTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.6}s", self.as_secs_f64())
    }
}

// ============================================================================
// Entity Types
// ============================================================================

/// Unique identifier for an entity in the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl EntityId {
    /// Create a new entity ID.
    pub fn new(id: u64) -> Self {
        EntityId(id)
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub u64);

/// A simulation event.
#[derive(Debug, Clone)]
pub struct Event {
    /// Unique event ID.
    pub id: EventId,
    /// Time when the event occurs.
    pub time: SimTime,
    /// Entity that created the event.
    pub source: EntityId,
    /// Target entities for the event.
    pub targets: Vec<EntityId>,
    /// Event payload.
    pub payload: EventPayload,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse ordering for min-heap (earliest time first)
        other.time.cmp(&self.time).then_with(|| other.id.0.cmp(&self.id.0))
    }
}

/// Raw frame bytes with the decoded CUMAC frame alongside.
///
/// Decoding happens once at construction so metrics and traces can label
/// frames without decoding them again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcousticPacket {
    /// Raw frame bytes.
    pub bytes: Vec<u8>,
    #[serde(skip)]
    decoded: Option<CumacPacket>,
}

impl AcousticPacket {
    /// Wrap raw bytes, decoding them eagerly.
    pub fn new(bytes: Vec<u8>) -> Self {
        let decoded = CumacPacket::decode(&bytes).ok();
        Self { bytes, decoded }
    }

    /// Encode a frame, keeping the structured form.
    pub fn from_packet(packet: CumacPacket) -> Self {
        Self {
            bytes: packet.encode(),
            decoded: Some(packet),
        }
    }

    /// The decoded frame, if the bytes were well formed.
    pub fn decoded(&self) -> Option<&CumacPacket> {
        self.decoded.as_ref()
    }

    /// Frame size in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Frame type label for metrics; "unknown" if decoding failed.
    pub fn frame_type_label(&self) -> &'static str {
        self.decoded
            .as_ref()
            .map(|p| p.frame_type().as_label())
            .unwrap_or("unknown")
    }
}

/// A modem started transmitting. Directed to the medium.
#[derive(Debug, Clone)]
pub struct TransmitAirEvent {
    /// Modem that is transmitting.
    pub modem_id: EntityId,
    pub packet: AcousticPacket,
    pub channel: ChannelId,
    /// When the transmission ends at the sender.
    pub end_time: SimTime,
}

/// A frame starts arriving at a modem. Sent by the medium after the
/// propagation delay.
#[derive(Debug, Clone)]
pub struct ReceiveAirEvent {
    /// Modem that transmitted.
    pub source_modem_id: EntityId,
    pub packet: AcousticPacket,
    pub channel: ChannelId,
    /// When the last bit arrives at the receiver.
    pub end_time: SimTime,
}

/// A modem emits a tone pulse. Directed to the medium.
#[derive(Debug, Clone)]
pub struct TransmitToneEvent {
    pub modem_id: EntityId,
    pub channel: ChannelId,
    pub signal_interval: u8,
}

/// A tone pulse reaches a modem.
#[derive(Debug, Clone)]
pub struct ReceiveToneEvent {
    pub source_modem_id: EntityId,
    pub channel: ChannelId,
    pub signal_interval: u8,
    /// Where the pulse was emitted.
    pub source_position: Position,
}

/// Carrier state visible to the MAC via [`ModemStateChangedEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModemState {
    /// Tuned channel is quiet.
    Idle,
    /// A signal is arriving on the tuned channel.
    Busy,
    /// Transmitting, cannot receive.
    Transmitting,
}

/// Modem has a frame for the MAC (including collided receptions).
/// Modem → MAC event.
#[derive(Debug, Clone)]
pub struct ModemRxFrameEvent {
    pub packet: AcousticPacket,
    pub channel: ChannelId,
    /// Modem entity ID of the sender.
    pub source_modem_id: EntityId,
    /// Whether the frame overlapped another one on the same channel.
    pub was_collided: bool,
    /// When the first bit arrived.
    pub start_time: SimTime,
    /// When the last bit arrived.
    pub end_time: SimTime,
}

/// Modem carrier or transmit state changed.
/// Modem → MAC event.
#[derive(Debug, Clone)]
pub struct ModemStateChangedEvent {
    pub new_state: ModemState,
    /// Incremented on each state change for ordering.
    pub state_version: u32,
}

/// A tone pulse was detected.
/// Modem → MAC event.
#[derive(Debug, Clone)]
pub struct ModemToneDetectedEvent {
    pub channel: ChannelId,
    pub signal_interval: u8,
    pub source_position: Position,
}

/// MAC requests transmission of a frame on a channel.
/// MAC → Modem event.
#[derive(Debug, Clone)]
pub struct ModemTxRequestEvent {
    pub packet: AcousticPacket,
    pub channel: ChannelId,
}

/// MAC requests a tone pulse.
/// MAC → Modem event.
#[derive(Debug, Clone)]
pub struct ModemToneRequestEvent {
    pub channel: ChannelId,
    pub signal_interval: u8,
}

/// Upper layer hands a frame to the MAC.
#[derive(Debug, Clone)]
pub struct MacEnqueueEvent {
    pub destination: Address,
    pub payload: Vec<u8>,
}

/// MAC answer to a [`MacEnqueueEvent`].
#[derive(Debug, Clone)]
pub struct MacEnqueueResultEvent {
    /// False if a frame was already outstanding.
    pub accepted: bool,
    pub destination: Address,
}

/// MAC delivers a received data frame to the upper layer.
#[derive(Debug, Clone)]
pub struct MacDeliverEvent {
    pub source: Address,
    pub frame_no: u8,
    pub payload: Vec<u8>,
}

/// Event payload variants.
#[derive(Debug, Clone)]
pub enum EventPayload {
    // =========== Medium Events ===========
    /// A modem started transmitting (directed to the medium).
    TransmitAir(TransmitAirEvent),
    /// A frame starts arriving (from the medium to a modem).
    ReceiveAir(ReceiveAirEvent),
    /// A modem emits a tone pulse (directed to the medium).
    TransmitTone(TransmitToneEvent),
    /// A tone pulse arrives (from the medium to a modem).
    ReceiveTone(ReceiveToneEvent),

    // =========== Modem → MAC Events ===========
    /// Modem has a frame for the MAC.
    ModemRxFrame(ModemRxFrameEvent),
    /// Modem state changed (TX start, TX end, carrier sensed, carrier lost).
    ModemStateChanged(ModemStateChangedEvent),
    /// Modem detected a tone pulse.
    ModemToneDetected(ModemToneDetectedEvent),

    // =========== MAC → Modem Events ===========
    /// MAC requests transmission.
    ModemTxRequest(ModemTxRequestEvent),
    /// MAC tunes the receiver to a channel.
    ModemListen {
        channel: ChannelId,
    },
    /// MAC requests a tone pulse.
    ModemToneRequest(ModemToneRequestEvent),

    // =========== Upper Layer Events ===========
    /// Request to send a frame.
    MacEnqueue(MacEnqueueEvent),
    /// Whether the MAC accepted the frame.
    MacEnqueueResult(MacEnqueueResultEvent),
    /// A data frame was received.
    MacDeliver(MacDeliverEvent),

    // =========== Scheduling ===========
    /// A delayed callback.
    Timer {
        /// User-defined timer ID.
        timer_id: u64,
    },

    // =========== Simulation Control ===========
    /// End the simulation.
    SimulationEnd,
}

// ============================================================================
// Simulation Context
// ============================================================================

/// Context passed to entities during event handling.
pub struct SimContext {
    time: SimTime,
    rng: ChaCha8Rng,
    pending_events: Vec<Event>,
    next_event_id: u64,
    source_entity: EntityId,
}

impl SimContext {
    /// Create a new simulation context.
    pub fn new(seed: u64) -> Self {
        SimContext {
            time: SimTime::ZERO,
            rng: ChaCha8Rng::seed_from_u64(seed),
            pending_events: Vec::new(),
            next_event_id: 0,
            source_entity: EntityId(0),
        }
    }

    /// Get the current simulation time.
    pub fn time(&self) -> SimTime {
        self.time
    }

    /// Get mutable access to the random number generator.
    pub fn rng(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }

    /// Set the current time (used by event loop).
    pub fn set_time(&mut self, time: SimTime) {
        self.time = time;
    }

    /// Set the source entity (used by event loop).
    pub fn set_source(&mut self, entity: EntityId) {
        self.source_entity = entity;
    }

    /// Post an event to occur after a delay.
    pub fn post_event(&mut self, delay: SimTime, targets: Vec<EntityId>, payload: EventPayload) {
        let event = Event {
            id: EventId(self.next_event_id),
            time: self.time + delay,
            source: self.source_entity,
            targets,
            payload,
        };
        self.next_event_id += 1;
        self.pending_events.push(event);
    }

    /// Post an event to occur immediately (at current time).
    pub fn post_immediate(&mut self, targets: Vec<EntityId>, payload: EventPayload) {
        self.post_event(SimTime::ZERO, targets, payload);
    }

    /// Take all pending events (used by event loop).
    pub fn take_pending_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.pending_events)
    }

    /// Get the next event ID (used by event loop for external event creation).
    pub fn next_event_id(&mut self) -> u64 {
        let id = self.next_event_id;
        self.next_event_id += 1;
        id
    }
}

// ============================================================================
// Entity Trait
// ============================================================================

/// Base trait for all simulation entities.
pub trait Entity: Send {
    /// Get the entity's unique ID.
    fn entity_id(&self) -> EntityId;

    /// Handle an event.
    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError>;
}

// ============================================================================
// Entity Registry
// ============================================================================

/// Registry for managing simulation entities.
pub struct EntityRegistry {
    entities: HashMap<EntityId, Box<dyn Entity>>,
}

impl EntityRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        EntityRegistry {
            entities: HashMap::new(),
        }
    }

    /// Register an entity.
    pub fn register(&mut self, entity: Box<dyn Entity>) {
        let id = entity.entity_id();
        self.entities.insert(id, entity);
    }

    /// Get an entity by ID.
    pub fn get(&self, id: EntityId) -> Option<&dyn Entity> {
        self.entities.get(&id).map(|e| e.as_ref())
    }

    /// Get a mutable reference to an entity by ID.
    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Box<dyn Entity>> {
        self.entities.get_mut(&id)
    }

    /// Dispatch an event to its target entities.
    pub fn dispatch_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        for target in &event.targets {
            if let Some(entity) = self.entities.get_mut(target) {
                ctx.set_source(*target);
                entity.handle_event(event, ctx)?;
            } else {
                error!("EntityNotFound {:?} when dispatching {:?}", target, event.payload);
                return Err(SimError::EntityNotFound(*target));
            }
        }
        Ok(())
    }

    /// Get the number of registered entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_time_conversions() {
        let time = SimTime::from_secs(1.5);
        assert_eq!(time.as_millis(), 1500);
        assert_eq!(time.as_micros(), 1_500_000);
        assert!((time.as_secs_f64() - 1.5).abs() < 0.0001);
        assert_eq!(SimTime::from_secs(0.29).as_micros(), 290_000);
        assert_eq!(SimTime::from_secs(-1.0), SimTime::ZERO);
    }

    #[test]
    fn test_sim_time_arithmetic() {
        let t1 = SimTime::from_millis(100);
        let t2 = SimTime::from_millis(50);
        assert_eq!((t1 + t2).as_millis(), 150);
        assert_eq!((t1 - t2).as_millis(), 50);
        assert_eq!(t2 - t1, SimTime::ZERO);
        assert_eq!(t2.mul(3).as_millis(), 150);
        assert_eq!(t2.sub(t1), None);
    }

    #[test]
    fn test_event_ordering_is_min_heap() {
        let event = |id: u64, ms: u64| Event {
            id: EventId(id),
            time: SimTime::from_millis(ms),
            source: EntityId(0),
            targets: vec![],
            payload: EventPayload::SimulationEnd,
        };
        let mut heap = std::collections::BinaryHeap::new();
        heap.push(event(2, 10));
        heap.push(event(1, 10));
        heap.push(event(0, 20));
        assert_eq!(heap.pop().map(|e| e.id), Some(EventId(1)));
        assert_eq!(heap.pop().map(|e| e.id), Some(EventId(2)));
        assert_eq!(heap.pop().map(|e| e.id), Some(EventId(0)));
    }

    #[test]
    fn test_acoustic_packet_labels() {
        let packet = CumacPacket::data(Address(1), Address(2), 1, vec![0xAB]);
        let acoustic = AcousticPacket::from_packet(packet.clone());
        assert_eq!(acoustic.frame_type_label(), "data");
        assert_eq!(acoustic.len(), packet.size());
        assert_eq!(AcousticPacket::new(acoustic.bytes.clone()).decoded(), Some(&packet));
        assert_eq!(AcousticPacket::new(vec![1]).frame_type_label(), "unknown");
    }

    #[test]
    fn test_post_event_uses_source_and_time() {
        let mut ctx = SimContext::new(1);
        ctx.set_time(SimTime::from_millis(5));
        ctx.set_source(EntityId(7));
        ctx.post_event(SimTime::from_millis(3), vec![EntityId(8)], EventPayload::SimulationEnd);
        let events = ctx.take_pending_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].time, SimTime::from_millis(8));
        assert_eq!(events[0].source, EntityId(7));
        assert!(ctx.take_pending_events().is_empty());
    }
}
