//! # cumac-modem
//!
//! Acoustic modem simulation for the CUMAC simulator.
//!
//! This crate provides:
//! - Channel modes and transmission time ([`ModemMode`], [`load_modes`], [`calculate_tx_time`])
//! - Modem entity simulation ([`Modem`])
//! - Geometric link model ([`LinkModel`])
//! - Same-channel collision detection ([`check_collision`])
//! - The [`Medium`] entity that routes frames and tone pulses between modems

use cumac_common::{
    AcousticPacket, ChannelId, Entity, EntityId, Event, EventPayload, ModemState, Position,
    SimContext, SimError, SimTime, INTERFERENCE_RANGE,
};
use cumac_metrics::{metric_defs, metrics, MetricLabels};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, trace, warn};

// ============================================================================
// Channel Modes
// ============================================================================

/// Default number of channels, including the control channel.
pub const DEFAULT_NUM_CHANNELS: u8 = 9;

/// Default FSK data rate in bits per second.
pub const DEFAULT_DATA_RATE_BPS: u32 = 1000;

/// Center frequency of channel 0 in Hz.
pub const BASE_CENTER_FREQ_HZ: u32 = 10_000;

/// One FSK transmission mode. Channel `i` uses mode `i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModemMode {
    pub data_rate_bps: u32,
    pub center_freq_hz: u32,
    pub bandwidth_hz: u32,
}

impl ModemMode {
    /// Transmission time for a frame of `bytes` bytes.
    pub fn tx_time(&self, bytes: usize) -> SimTime {
        calculate_tx_time(self.data_rate_bps, bytes)
    }
}

/// Build `num_channels` adjacent FSK modes at `data_rate_bps`.
///
/// Mode `i` is centered at `10 kHz + i * rate / 2` with a bandwidth equal to
/// the data rate.
pub fn load_modes(num_channels: u8, data_rate_bps: u32) -> Vec<ModemMode> {
    (0..num_channels as u32)
        .map(|i| ModemMode {
            data_rate_bps,
            center_freq_hz: BASE_CENTER_FREQ_HZ + i * data_rate_bps / 2,
            bandwidth_hz: data_rate_bps,
        })
        .collect()
}

/// Transmission time of `bytes` bytes at `data_rate_bps`.
pub fn calculate_tx_time(data_rate_bps: u32, bytes: usize) -> SimTime {
    if data_rate_bps == 0 {
        return SimTime::ZERO;
    }
    SimTime::from_secs((bytes * 8) as f64 / data_rate_bps as f64)
}

// ============================================================================
// Collision Detection
// ============================================================================

/// Context for collision detection.
#[derive(Debug, Clone)]
pub struct CollisionContext {
    /// First bit arrival.
    pub start_time: SimTime,
    /// Last bit arrival.
    pub end_time: SimTime,
    pub channel: ChannelId,
    /// Unique reception ID.
    pub reception_id: u64,
}

/// Result of collision check.
#[derive(Debug, Clone, PartialEq)]
pub enum CollisionResult {
    /// No collision detected.
    NoCollision,
    /// The incoming frame and every listed reception are destroyed.
    Collided(Vec<u64>),
}

/// Check an incoming reception against the ones already in progress.
///
/// Only same-channel overlaps collide; there is no capture effect.
pub fn check_collision(
    incoming: &CollisionContext,
    existing: &[CollisionContext],
) -> CollisionResult {
    let hit: Vec<u64> = existing
        .iter()
        .filter(|other| other.channel == incoming.channel)
        .filter(|other| {
            incoming.start_time < other.end_time && incoming.end_time > other.start_time
        })
        .map(|other| other.reception_id)
        .collect();

    if hit.is_empty() {
        CollisionResult::NoCollision
    } else {
        CollisionResult::Collided(hit)
    }
}

// ============================================================================
// Link Model
// ============================================================================

/// Geometric link model: modems hear each other within a communication range
/// after the propagation delay between their positions.
///
/// Uses BTreeMap for deterministic iteration order, which keeps the order of
/// ReceiveAir events (and so collision outcomes) reproducible.
#[derive(Debug, Clone)]
pub struct LinkModel {
    positions: BTreeMap<EntityId, Position>,
    communication_range: f64,
}

impl LinkModel {
    /// Create an empty link model.
    pub fn new(communication_range: f64) -> Self {
        LinkModel {
            positions: BTreeMap::new(),
            communication_range,
        }
    }

    /// Place a modem.
    pub fn add_modem(&mut self, modem: EntityId, position: Position) {
        self.positions.insert(modem, position);
    }

    pub fn position(&self, modem: EntityId) -> Option<Position> {
        self.positions.get(&modem).copied()
    }

    pub fn communication_range(&self) -> f64 {
        self.communication_range
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Modems within `range` of `from`, excluding `from`, with the one-way
    /// delay to each, in EntityId order.
    fn neighbors(&self, from: EntityId, range: f64) -> Vec<(EntityId, SimTime)> {
        let Some(origin) = self.positions.get(&from) else {
            return Vec::new();
        };
        self.positions
            .iter()
            .filter(|(id, _)| **id != from)
            .filter(|(_, pos)| origin.distance_to(pos) <= range)
            .map(|(id, pos)| (*id, origin.propagation_delay_to(pos)))
            .collect()
    }

    /// Modems that receive frames transmitted by `from`.
    pub fn get_receivers(&self, from: EntityId) -> Vec<(EntityId, SimTime)> {
        self.neighbors(from, self.communication_range)
    }

    /// Modems that detect tone pulses emitted by `from`.
    pub fn get_tone_receivers(&self, from: EntityId) -> Vec<(EntityId, SimTime)> {
        self.neighbors(from, INTERFERENCE_RANGE)
    }
}

impl Default for LinkModel {
    fn default() -> Self {
        Self::new(INTERFERENCE_RANGE)
    }
}

// ============================================================================
// Modem Entity
// ============================================================================

/// Timer ID constants for the Modem entity.
const TIMER_TX_COMPLETE: u64 = 1;
const TIMER_RX_COMPLETE_BASE: u64 = 0x1000; // reception_id is added to this

/// State of an active reception.
#[derive(Debug, Clone)]
struct ActiveReception {
    packet: AcousticPacket,
    source_modem_id: EntityId,
    channel: ChannelId,
    start_time: SimTime,
    end_time: SimTime,
    /// Damaged by an overlapping same-channel signal or our own transmission.
    collided: bool,
    /// Receiver stayed on this channel for the whole reception.
    tuned_throughout: bool,
    reception_id: u64,
}

impl ActiveReception {
    fn collision_context(&self) -> CollisionContext {
        CollisionContext {
            start_time: self.start_time,
            end_time: self.end_time,
            channel: self.channel,
            reception_id: self.reception_id,
        }
    }
}

/// Modem configuration.
#[derive(Debug, Clone)]
pub struct ModemConfig {
    /// Available modes; the index is the channel number.
    pub modes: Vec<ModemMode>,
    /// Entity ID of the Medium entity (for routing transmissions).
    pub medium_entity: EntityId,
}

impl ModemConfig {
    /// Mode of a channel, if it exists.
    pub fn mode(&self, channel: ChannelId) -> Option<&ModemMode> {
        self.modes.get(channel as usize)
    }

    pub fn num_channels(&self) -> usize {
        self.modes.len()
    }
}

impl Default for ModemConfig {
    fn default() -> Self {
        ModemConfig {
            modes: load_modes(DEFAULT_NUM_CHANNELS, DEFAULT_DATA_RATE_BPS),
            medium_entity: EntityId::new(0),
        }
    }
}

/// Half-duplex multi-channel acoustic modem.
///
/// The Modem entity is responsible for:
/// 1. Transmission - sends TransmitAir events to the Medium on the requested channel
/// 2. Reception - tracks ReceiveAir events from the Medium on every channel
/// 3. Collision detection - same-channel overlaps destroy both frames
/// 4. Carrier sense - reports Idle/Busy/Transmitting for the tuned channel
/// 5. Tone pulses - forwards tone requests to the Medium and detections to the MAC
pub struct Modem {
    id: EntityId,
    name: String,
    config: ModemConfig,
    position: Position,
    attached_mac: EntityId,

    /// Channel the receiver is tuned to.
    tuned_channel: ChannelId,
    /// Current transmission: packet, channel, end time.
    current_tx: Option<(AcousticPacket, ChannelId, SimTime)>,
    /// Last state reported to the MAC.
    reported_state: ModemState,
    /// State version - incremented on any state change visible to the MAC.
    state_version: u32,

    active_receptions: Vec<ActiveReception>,
    next_reception_id: u64,

    metric_labels: MetricLabels,
}

impl Modem {
    /// Create a new modem entity tuned to the control channel.
    pub fn new(
        id: EntityId,
        name: impl Into<String>,
        config: ModemConfig,
        position: Position,
        attached_mac: EntityId,
    ) -> Self {
        let name = name.into();
        let metric_labels = MetricLabels::new(name.clone(), "modem");
        Modem {
            id,
            name,
            config,
            position,
            attached_mac,
            tuned_channel: cumac_common::CONTROL_CHANNEL,
            current_tx: None,
            reported_state: ModemState::Idle,
            state_version: 0,
            active_receptions: Vec::new(),
            next_reception_id: 0,
            metric_labels,
        }
    }

    pub fn config(&self) -> &ModemConfig {
        &self.config
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn attached_mac(&self) -> EntityId {
        self.attached_mac
    }

    pub fn tuned_channel(&self) -> ChannelId {
        self.tuned_channel
    }

    pub fn state_version(&self) -> u32 {
        self.state_version
    }

    /// Carrier state of the tuned channel.
    pub fn state(&self) -> ModemState {
        if self.current_tx.is_some() {
            ModemState::Transmitting
        } else if self
            .active_receptions
            .iter()
            .any(|r| r.channel == self.tuned_channel)
        {
            ModemState::Busy
        } else {
            ModemState::Idle
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state() == ModemState::Idle
    }

    pub fn is_busy(&self) -> bool {
        self.state() == ModemState::Busy
    }

    pub fn is_transmitting(&self) -> bool {
        self.current_tx.is_some()
    }

    /// Notify the MAC if the carrier state changed since the last report.
    fn refresh_state(&mut self, ctx: &mut SimContext) {
        let new_state = self.state();
        if new_state == self.reported_state {
            return;
        }
        self.reported_state = new_state;
        self.state_version += 1;
        trace!("Modem[{}]: state -> {:?}", self.name, new_state);
        ctx.post_immediate(
            vec![self.attached_mac],
            EventPayload::ModemStateChanged(cumac_common::ModemStateChangedEvent {
                new_state,
                state_version: self.state_version,
            }),
        );
    }

    fn frame_labels(&self, packet: &AcousticPacket, channel: ChannelId) -> Vec<(&'static str, String)> {
        let mut labels = self.metric_labels.to_labels();
        labels.push(("frame_type", packet.frame_type_label().to_string()));
        labels.push(("channel", channel.to_string()));
        labels
    }

    /// Handle TX request from the MAC.
    fn handle_tx_request(&mut self, packet: AcousticPacket, channel: ChannelId, ctx: &mut SimContext) {
        if self.current_tx.is_some() {
            warn!("Modem[{}]: TX request while transmitting, dropping {}", self.name, packet.frame_type_label());
            return;
        }
        let Some(mode) = self.config.mode(channel).copied() else {
            warn!("Modem[{}]: TX request on unknown channel {}", self.name, channel);
            return;
        };

        // Half duplex: everything being received is lost.
        for reception in &mut self.active_receptions {
            reception.collided = true;
        }

        let airtime = mode.tx_time(packet.len());
        let end_time = ctx.time() + airtime;

        let labels = self.frame_labels(&packet, channel);
        metrics::counter!(metric_defs::MODEM_TX_FRAMES.name, &labels).increment(1);
        metrics::counter!(metric_defs::MODEM_TX_AIRTIME.name, &labels).increment(airtime.as_micros());

        debug!(
            "Modem[{}]: TX {} on channel {} for {}",
            self.name,
            packet.frame_type_label(),
            channel,
            airtime
        );

        self.current_tx = Some((packet.clone(), channel, end_time));
        self.refresh_state(ctx);

        ctx.post_immediate(
            vec![self.config.medium_entity],
            EventPayload::TransmitAir(cumac_common::TransmitAirEvent {
                modem_id: self.id,
                packet,
                channel,
                end_time,
            }),
        );
        ctx.post_event(
            airtime,
            vec![self.id],
            EventPayload::Timer {
                timer_id: TIMER_TX_COMPLETE,
            },
        );
    }

    fn handle_tx_complete(&mut self, ctx: &mut SimContext) {
        self.current_tx = None;
        self.refresh_state(ctx);
    }

    /// Retune the receiver. Receptions in progress cannot be completed.
    fn handle_listen(&mut self, channel: ChannelId, ctx: &mut SimContext) {
        if channel == self.tuned_channel {
            return;
        }
        trace!("Modem[{}]: tuning {} -> {}", self.name, self.tuned_channel, channel);
        self.tuned_channel = channel;
        for reception in &mut self.active_receptions {
            reception.tuned_throughout = false;
        }
        self.refresh_state(ctx);
    }

    /// Handle a frame starting to arrive (from the Medium via ReceiveAir).
    fn handle_receive_air(&mut self, rx_event: &cumac_common::ReceiveAirEvent, ctx: &mut SimContext) {
        let reception_id = self.next_reception_id;
        self.next_reception_id += 1;

        let mut reception = ActiveReception {
            packet: rx_event.packet.clone(),
            source_modem_id: rx_event.source_modem_id,
            channel: rx_event.channel,
            start_time: ctx.time(),
            end_time: rx_event.end_time,
            collided: self.current_tx.is_some(),
            tuned_throughout: rx_event.channel == self.tuned_channel,
            reception_id,
        };

        let existing: Vec<CollisionContext> = self
            .active_receptions
            .iter()
            .map(ActiveReception::collision_context)
            .collect();
        if let CollisionResult::Collided(ids) = check_collision(&reception.collision_context(), &existing) {
            reception.collided = true;
            for other in self
                .active_receptions
                .iter_mut()
                .filter(|r| ids.contains(&r.reception_id))
            {
                other.collided = true;
            }
        }

        self.active_receptions.push(reception);

        let delay = rx_event.end_time - ctx.time();
        ctx.post_event(
            delay,
            vec![self.id],
            EventPayload::Timer {
                timer_id: TIMER_RX_COMPLETE_BASE + reception_id,
            },
        );
        self.refresh_state(ctx);
    }

    /// Handle reception completion timer.
    fn handle_rx_complete(&mut self, reception_id: u64, ctx: &mut SimContext) {
        let Some(idx) = self
            .active_receptions
            .iter()
            .position(|r| r.reception_id == reception_id)
        else {
            return;
        };
        let reception = self.active_receptions.remove(idx);
        let labels = self.frame_labels(&reception.packet, reception.channel);

        if !reception.tuned_throughout || reception.channel != self.tuned_channel {
            metrics::counter!(metric_defs::MODEM_RX_MISSED.name, &labels).increment(1);
        } else {
            if reception.collided {
                metrics::counter!(metric_defs::MODEM_RX_COLLIDED.name, &labels).increment(1);
            } else {
                metrics::counter!(metric_defs::MODEM_RX_FRAMES.name, &labels).increment(1);
            }
            ctx.post_immediate(
                vec![self.attached_mac],
                EventPayload::ModemRxFrame(cumac_common::ModemRxFrameEvent {
                    packet: reception.packet,
                    channel: reception.channel,
                    source_modem_id: reception.source_modem_id,
                    was_collided: reception.collided,
                    start_time: reception.start_time,
                    end_time: reception.end_time,
                }),
            );
        }
        self.refresh_state(ctx);
    }

    fn handle_tone_request(&mut self, request: &cumac_common::ModemToneRequestEvent, ctx: &mut SimContext) {
        debug!(
            "Modem[{}]: tone on channel {} interval {}",
            self.name, request.channel, request.signal_interval
        );
        ctx.post_immediate(
            vec![self.config.medium_entity],
            EventPayload::TransmitTone(cumac_common::TransmitToneEvent {
                modem_id: self.id,
                channel: request.channel,
                signal_interval: request.signal_interval,
            }),
        );
    }

    fn handle_receive_tone(&mut self, tone: &cumac_common::ReceiveToneEvent, ctx: &mut SimContext) {
        let labels = self.metric_labels.with("channel", tone.channel.to_string());
        metrics::counter!(metric_defs::MODEM_TONES.name, &labels).increment(1);
        ctx.post_immediate(
            vec![self.attached_mac],
            EventPayload::ModemToneDetected(cumac_common::ModemToneDetectedEvent {
                channel: tone.channel,
                signal_interval: tone.signal_interval,
                source_position: tone.source_position,
            }),
        );
    }
}

impl Entity for Modem {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::ModemTxRequest(tx_request) => {
                self.handle_tx_request(tx_request.packet.clone(), tx_request.channel, ctx);
            }
            EventPayload::ModemListen { channel } => {
                self.handle_listen(*channel, ctx);
            }
            EventPayload::ModemToneRequest(request) => {
                self.handle_tone_request(request, ctx);
            }
            EventPayload::ReceiveAir(rx_air_event) => {
                self.handle_receive_air(rx_air_event, ctx);
            }
            EventPayload::ReceiveTone(tone) => {
                self.handle_receive_tone(tone, ctx);
            }
            EventPayload::Timer { timer_id } => {
                if *timer_id == TIMER_TX_COMPLETE {
                    self.handle_tx_complete(ctx);
                } else if *timer_id >= TIMER_RX_COMPLETE_BASE {
                    self.handle_rx_complete(*timer_id - TIMER_RX_COMPLETE_BASE, ctx);
                }
            }
            _ => {}
        }
        Ok(())
    }
}

// ============================================================================
// Medium Entity - Routes transmissions between modems
// ============================================================================

/// The Medium entity routes acoustic transmissions to receivers.
///
/// It receives TransmitAir and TransmitTone events from Modem entities and
/// delivers ReceiveAir / ReceiveTone events to every modem in range after
/// the propagation delay.
pub struct Medium {
    id: EntityId,
    link_model: LinkModel,
}

impl Medium {
    /// Create a new Medium entity with the given link model.
    pub fn new(id: EntityId, link_model: LinkModel) -> Self {
        Medium { id, link_model }
    }

    pub fn link_model(&self) -> &LinkModel {
        &self.link_model
    }
}

impl Entity for Medium {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::TransmitAir(tx_event) => {
                for (receiver_id, delay) in self.link_model.get_receivers(tx_event.modem_id) {
                    ctx.post_event(
                        delay,
                        vec![receiver_id],
                        EventPayload::ReceiveAir(cumac_common::ReceiveAirEvent {
                            source_modem_id: tx_event.modem_id,
                            packet: tx_event.packet.clone(),
                            channel: tx_event.channel,
                            end_time: tx_event.end_time + delay,
                        }),
                    );
                }
            }
            EventPayload::TransmitTone(tone) => {
                let Some(source_position) = self.link_model.position(tone.modem_id) else {
                    return Err(SimError::InvalidTarget(tone.modem_id));
                };
                for (receiver_id, delay) in self.link_model.get_tone_receivers(tone.modem_id) {
                    ctx.post_event(
                        delay,
                        vec![receiver_id],
                        EventPayload::ReceiveTone(cumac_common::ReceiveToneEvent {
                            source_modem_id: tone.modem_id,
                            channel: tone.channel,
                            signal_interval: tone.signal_interval,
                            source_position,
                        }),
                    );
                }
            }
            _ => {}
        }
        Ok(())
    }
}
