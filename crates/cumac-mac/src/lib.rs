//! # cumac-mac
//!
//! CUMAC medium access control for multi-channel acoustic networks.
//!
//! A transfer is negotiated with a four-way handshake:
//!
//! 1. The initiator contends on the control channel with a binary
//!    exponential backoff, then sends an RTS proposing a few data channels.
//! 2. The responder beacons its first candidate channel and polls for busy
//!    tones. A neighbour that predicts a collision on that channel answers
//!    with a tone, and the responder moves on to the next candidate.
//! 3. After a quiet poll window the responder sends a CTS naming the channel
//!    and tunes its receiver there.
//! 4. The initiator sends the data frame on the confirmed channel.
//!
//! Every node keeps its own [`ChannelManager`] and [`BusySignalTable`], fed
//! by the control frames and tones it hears.

pub mod busy_signal;
pub mod candidates;
pub mod channel_manager;
pub mod config;
pub mod peers;
pub mod timer;

pub use busy_signal::{BusyMarker, BusySignalTable, ToneTiming};
pub use candidates::{pad_channels, ChannelCandidates};
pub use channel_manager::{ChannelManager, InvalidWindow, ReservationEntry, TimeWindow};
pub use config::MacConfig;
pub use peers::PeerTable;
pub use timer::{decode_timer_id, timer_id, BackoffTimer, TimerError, TimerKind, TimerSlot};

use std::collections::BTreeMap;

use cumac_common::{
    max_propagation_delay, AcousticPacket, Address, ChannelId, CumacPacket, Entity, EntityId,
    Event, EventPayload, FrameType, MacDeliverEvent, MacEnqueueResultEvent, ModemRxFrameEvent,
    ModemState, ModemToneDetectedEvent, ModemToneRequestEvent, ModemTxRequestEvent, Position,
    SimContext, SimError, SimTime, CONTROL_CHANNEL,
};
use cumac_metrics::{metric_defs, metrics, MetricLabels};
use cumac_packet::{BeaconExtension, BeaconHeader, CtsHeader, CumacHeader, DataHeader, RtsHeader};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

// ============================================================================
// State
// ============================================================================

/// Handshake state of a MAC instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MacState {
    Idle,
    // =========== Initiator ===========
    SendingRts,
    WaitingCts,
    SendingData,
    // =========== Responder ===========
    SendingBeacon,
    WaitingBeaconResponse,
    SendingCts,
    WaitingData,
}

impl MacState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MacState::Idle => "idle",
            MacState::SendingRts => "sending_rts",
            MacState::WaitingCts => "waiting_cts",
            MacState::SendingData => "sending_data",
            MacState::SendingBeacon => "sending_beacon",
            MacState::WaitingBeaconResponse => "waiting_beacon_response",
            MacState::SendingCts => "sending_cts",
            MacState::WaitingData => "waiting_data",
        }
    }
}

impl std::fmt::Display for MacState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The one frame a node may have in flight as initiator.
#[derive(Debug, Clone)]
struct OutboundFrame {
    destination: Address,
    payload: Vec<u8>,
    frame_no: u8,
    retries: u32,
    enqueued_at: SimTime,
}

/// Responder side of a handshake.
#[derive(Debug, Clone)]
struct ResponderSession {
    initiator: Address,
    frame_no: u8,
    length: u16,
    initiator_position: Position,
    candidates: ChannelCandidates,
    signal_interval: u8,
    polls: u32,
}

// ============================================================================
// MAC Entity
// ============================================================================

/// CUMAC MAC entity. Sits between one modem and one upper-layer entity.
pub struct CumacMac {
    id: EntityId,
    name: String,
    address: Address,
    position: Position,
    modem: EntityId,
    upper: Option<EntityId>,
    config: MacConfig,

    state: MacState,
    /// Last state reported by the modem.
    modem_state: ModemState,
    /// Channel the modem was last asked to listen on.
    listening: ChannelId,

    outbound: Option<OutboundFrame>,
    frame_no: u8,
    cw: u32,
    backoff: BackoffTimer,
    cts_wait: TimerSlot,

    responder: Option<ResponderSession>,
    data_wait: TimerSlot,
    beacon_poll: TimerSlot,
    /// Last frame number delivered per source.
    delivered: BTreeMap<Address, u8>,

    channel_manager: ChannelManager,
    busy_signals: BusySignalTable,
    peers: PeerTable,

    metric_labels: MetricLabels,
}

impl CumacMac {
    pub fn new(
        id: EntityId,
        name: impl Into<String>,
        address: Address,
        position: Position,
        modem: EntityId,
        upper: Option<EntityId>,
        config: MacConfig,
    ) -> Self {
        let name = name.into();
        let metric_labels = MetricLabels::new(name.clone(), "mac");
        CumacMac {
            id,
            name,
            address,
            position,
            modem,
            upper,
            state: MacState::Idle,
            modem_state: ModemState::Idle,
            listening: CONTROL_CHANNEL,
            outbound: None,
            frame_no: 0,
            cw: config.cw_min,
            backoff: BackoffTimer::new(),
            cts_wait: TimerSlot::new(TimerKind::CtsWait),
            responder: None,
            data_wait: TimerSlot::new(TimerKind::DataWait),
            beacon_poll: TimerSlot::new(TimerKind::BeaconPoll),
            delivered: BTreeMap::new(),
            channel_manager: ChannelManager::new(config.prune_margin),
            busy_signals: BusySignalTable::new(config.tone_timing),
            peers: PeerTable::new(),
            config,
            metric_labels,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn config(&self) -> &MacConfig {
        &self.config
    }

    pub fn state(&self) -> MacState {
        self.state
    }

    /// True while an accepted frame has not yet been sent or dropped.
    pub fn has_outstanding(&self) -> bool {
        self.outbound.is_some()
    }

    /// Current contention window exponent.
    pub fn contention_window(&self) -> u32 {
        self.cw
    }

    pub fn channel_manager(&self) -> &ChannelManager {
        &self.channel_manager
    }

    pub fn channel_manager_mut(&mut self) -> &mut ChannelManager {
        &mut self.channel_manager
    }

    pub fn busy_signals(&self) -> &BusySignalTable {
        &self.busy_signals
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    pub fn peers_mut(&mut self) -> &mut PeerTable {
        &mut self.peers
    }

    // ========================================================================
    // Upper layer
    // ========================================================================

    /// Accept a frame for `destination` and start contending for the medium.
    ///
    /// Returns false without side effects if a frame is already outstanding
    /// or the payload does not fit the RTS length field.
    pub fn enqueue(
        &mut self,
        destination: Address,
        payload: Vec<u8>,
        ctx: &mut SimContext,
    ) -> Result<bool, SimError> {
        if self.outbound.is_some() {
            debug!("MAC[{}]: frame already outstanding, rejecting frame for {}", self.name, destination);
            self.count(metric_defs::MAC_ENQUEUE_REJECTED.name);
            return Ok(false);
        }
        if payload.len() > u16::MAX as usize {
            warn!("MAC[{}]: {} byte payload does not fit an RTS", self.name, payload.len());
            self.count(metric_defs::MAC_ENQUEUE_REJECTED.name);
            return Ok(false);
        }

        self.frame_no = self.frame_no.wrapping_add(1);
        self.outbound = Some(OutboundFrame {
            destination,
            payload,
            frame_no: self.frame_no,
            retries: 0,
            enqueued_at: ctx.time(),
        });
        self.cw = self.config.cw_min;
        self.count(metric_defs::MAC_ENQUEUED.name);
        debug!("MAC[{}]: accepted frame {} for {}", self.name, self.frame_no, destination);
        self.start_contention(ctx)?;
        Ok(true)
    }

    fn deliver(&mut self, source: Address, frame_no: u8, payload: Vec<u8>, ctx: &mut SimContext) {
        info!(
            "MAC[{}]: delivered frame {} from {} ({} bytes)",
            self.name,
            frame_no,
            source,
            payload.len()
        );
        self.count(metric_defs::MAC_DATA_DELIVERED.name);
        if let Some(upper) = self.upper {
            ctx.post_immediate(
                vec![upper],
                EventPayload::MacDeliver(MacDeliverEvent {
                    source,
                    frame_no,
                    payload,
                }),
            );
        }
    }

    // ========================================================================
    // Modem interaction
    // ========================================================================

    fn transmit(&mut self, packet: CumacPacket, channel: ChannelId, ctx: &mut SimContext) {
        trace!("MAC[{}]: TX {} on channel {}", self.name, packet.display(), channel);
        ctx.post_immediate(
            vec![self.modem],
            EventPayload::ModemTxRequest(ModemTxRequestEvent {
                packet: AcousticPacket::from_packet(packet),
                channel,
            }),
        );
    }

    fn listen(&mut self, channel: ChannelId, ctx: &mut SimContext) {
        if self.listening != channel {
            self.listening = channel;
            ctx.post_immediate(vec![self.modem], EventPayload::ModemListen { channel });
        }
    }

    fn handle_modem_state(&mut self, new_state: ModemState, ctx: &mut SimContext) -> Result<(), SimError> {
        let tx_ended =
            self.modem_state == ModemState::Transmitting && new_state != ModemState::Transmitting;
        self.modem_state = new_state;
        if new_state != ModemState::Idle {
            self.backoff.pause(ctx.time());
        }
        if tx_ended {
            self.handle_tx_end(ctx)?;
        }
        self.resume_backoff(ctx)
    }

    fn handle_tx_end(&mut self, ctx: &mut SimContext) -> Result<(), SimError> {
        match self.state {
            MacState::SendingRts => {
                self.state = MacState::WaitingCts;
                let timeout = self.cts_timeout();
                self.arm(TimerKind::CtsWait, timeout, ctx)
            }
            MacState::SendingData => {
                self.finish_outbound(ctx);
                Ok(())
            }
            MacState::SendingBeacon => {
                self.state = MacState::WaitingBeaconResponse;
                self.poll_busy(ctx)
            }
            MacState::SendingCts => self.await_data(ctx),
            other => {
                trace!("MAC[{}]: transmission ended in state {}", self.name, other);
                Ok(())
            }
        }
    }

    // ========================================================================
    // Timers
    // ========================================================================

    fn arm(&mut self, kind: TimerKind, delay: SimTime, ctx: &mut SimContext) -> Result<(), SimError> {
        let slot = match kind {
            TimerKind::CtsWait => &mut self.cts_wait,
            TimerKind::DataWait => &mut self.data_wait,
            TimerKind::BeaconPoll => &mut self.beacon_poll,
            TimerKind::Backoff | TimerKind::BusyExpire => return Ok(()),
        };
        slot.arm(ctx, self.id, delay).map_err(|e| self.timer_error(e))
    }

    fn timer_error(&self, err: TimerError) -> SimError {
        SimError::HandlerError {
            entity: self.id,
            message: err.to_string(),
        }
    }

    fn handle_timer(&mut self, id: u64, ctx: &mut SimContext) -> Result<(), SimError> {
        let Some((kind, token)) = decode_timer_id(id) else {
            warn!("MAC[{}]: unknown timer id {:#x}", self.name, id);
            return Ok(());
        };
        let live = match kind {
            TimerKind::Backoff => self.backoff.fire(token),
            TimerKind::CtsWait => self.cts_wait.fire(token),
            TimerKind::DataWait => self.data_wait.fire(token),
            TimerKind::BeaconPoll => self.beacon_poll.fire(token),
            TimerKind::BusyExpire => {
                self.busy_signals.remove(token);
                return Ok(());
            }
        };
        if !live {
            trace!("MAC[{}]: stale {} timer", self.name, kind);
            return Ok(());
        }
        match kind {
            TimerKind::Backoff => self.send_rts(ctx),
            TimerKind::CtsWait => self.handle_cts_timeout(ctx),
            TimerKind::DataWait => self.handle_data_timeout(ctx),
            TimerKind::BeaconPoll => self.poll_busy(ctx),
            TimerKind::BusyExpire => Ok(()),
        }
    }

    // ========================================================================
    // Initiator
    // ========================================================================

    fn start_contention(&mut self, ctx: &mut SimContext) -> Result<(), SimError> {
        let slots = ctx.rng().gen_range(0..=(1u64 << self.cw.min(32)));
        let delay = max_propagation_delay() + self.config.slot_time.mul(slots);
        trace!("MAC[{}]: backoff {} slots (cw {})", self.name, slots, self.cw);
        self.backoff.start(delay);
        self.resume_backoff(ctx)
    }

    /// Let a pending backoff run while both the MAC and the modem are idle.
    fn resume_backoff(&mut self, ctx: &mut SimContext) -> Result<(), SimError> {
        if self.state != MacState::Idle || self.modem_state != ModemState::Idle {
            return Ok(());
        }
        self.backoff.resume(ctx, self.id).map_err(|e| self.timer_error(e))
    }

    /// Worst case from the end of our RTS until the CTS has arrived: one
    /// beacon and poll window per proposed channel plus the round trips.
    fn cts_timeout(&self) -> SimTime {
        let config = &self.config;
        let round_trip = match &self.outbound {
            Some(frame) => self.peers.delay_to(frame.destination, &self.position).mul(2),
            None => max_propagation_delay().mul(2),
        };
        let attempts = config.rts_channel_count as u64;
        round_trip
            + max_propagation_delay().mul(2 * attempts)
            + (config.beacon_tx() + config.max_poll_window()).mul(attempts)
            + config.cts_tx()
    }

    /// Data channels to propose: those predicted free for the whole
    /// handshake, lowest first, padded with the lowest remaining channels.
    fn select_rts_channels(
        &mut self,
        now: SimTime,
        destination: Address,
        payload_len: usize,
    ) -> Vec<ChannelId> {
        let config = &self.config;
        let span = config.rts_tx()
            + self.peers.delay_to(destination, &self.position).mul(2)
            + config.beacon_tx()
            + config.max_poll_window()
            + config.cts_tx()
            + config.data_tx(payload_len);
        let window = TimeWindow::starting_at(now, span);
        let target = config.rts_channel_count;
        let destination_position = self.peers.position(destination);

        self.channel_manager.prune(now);
        let mut channels = Vec::with_capacity(target);
        for channel in self.config.data_channels() {
            if channels.len() >= target {
                break;
            }
            let free = match &destination_position {
                Some(dst) => self
                    .channel_manager
                    .can_transmit(channel, window, &self.position, dst),
                None => self
                    .channel_manager
                    .can_transmit_from_src(channel, window, &self.position),
            };
            if free {
                channels.push(channel);
            }
        }
        pad_channels(&mut channels, self.config.data_channels(), target);
        channels
    }

    fn send_rts(&mut self, ctx: &mut SimContext) -> Result<(), SimError> {
        if self.state != MacState::Idle {
            debug!("MAC[{}]: backoff expired in state {}", self.name, self.state);
            return Ok(());
        }
        let Some(frame) = self.outbound.as_ref() else {
            return Ok(());
        };
        let (destination, frame_no, length) = (frame.destination, frame.frame_no, frame.payload.len());
        let channels = self.select_rts_channels(ctx.time(), destination, length);
        let rts = RtsHeader::new(frame_no, length as u16, self.position.to_wire(), channels)
            .map_err(|e| SimError::HandlerError {
                entity: self.id,
                message: e.to_string(),
            })?;

        debug!(
            "MAC[{}]: RTS for frame {} to {} proposing {:?}",
            self.name, frame_no, destination, rts.channels
        );
        self.state = MacState::SendingRts;
        self.count(metric_defs::MAC_RTS_SENT.name);
        self.transmit(CumacPacket::rts(self.address, destination, rts), CONTROL_CHANNEL, ctx);
        Ok(())
    }

    fn handle_cts_timeout(&mut self, ctx: &mut SimContext) -> Result<(), SimError> {
        if self.state != MacState::WaitingCts {
            return Ok(());
        }
        self.state = MacState::Idle;
        self.count(metric_defs::MAC_CTS_TIMEOUTS.name);

        let Some(frame) = self.outbound.as_mut() else {
            return self.resume_backoff(ctx);
        };
        if frame.retries >= self.config.max_retries {
            info!(
                "MAC[{}]: no CTS for frame {} to {} after {} retries, dropping",
                self.name, frame.frame_no, frame.destination, frame.retries
            );
            self.outbound = None;
            self.backoff.clear();
            self.count(metric_defs::MAC_FRAMES_DROPPED.name);
            return Ok(());
        }
        frame.retries += 1;
        debug!(
            "MAC[{}]: no CTS for frame {}, retry {}",
            self.name, frame.frame_no, frame.retries
        );
        self.cw = (self.cw + 1).min(self.config.cw_max);
        self.start_contention(ctx)
    }

    fn handle_cts(&mut self, src: Address, cts: &CtsHeader, ctx: &mut SimContext) -> Result<(), SimError> {
        let matches = self
            .outbound
            .as_ref()
            .is_some_and(|frame| frame.destination == src && frame.frame_no == cts.frame_no);
        if self.state != MacState::WaitingCts {
            debug!("MAC[{}]: CTS from {} in state {}, ignoring", self.name, src, self.state);
            return Ok(());
        }
        if !matches {
            self.violation(FrameType::Cts, src, "CTS does not match the outstanding frame");
            return Ok(());
        }
        if !self.config.is_data_channel(cts.channel) {
            self.violation(FrameType::Cts, src, "CTS names an invalid data channel");
            return Ok(());
        }
        let Some(frame) = self.outbound.as_ref() else {
            return Ok(());
        };
        let (frame_no, payload) = (frame.frame_no, frame.payload.clone());

        self.cts_wait.cancel();
        let window = TimeWindow::starting_at(ctx.time(), self.config.data_tx(payload.len()));
        self.channel_manager.register_transmission(
            cts.channel,
            window,
            self.position,
            Position::from_wire(cts.dst_position),
        );

        debug!("MAC[{}]: CTS from {}, data on channel {}", self.name, src, cts.channel);
        self.state = MacState::SendingData;
        self.transmit(CumacPacket::data(self.address, src, frame_no, payload), cts.channel, ctx);
        Ok(())
    }

    fn finish_outbound(&mut self, ctx: &mut SimContext) {
        self.state = MacState::Idle;
        if let Some(frame) = self.outbound.take() {
            let latency = ctx.time() - frame.enqueued_at;
            info!(
                "MAC[{}]: sent frame {} to {} in {}",
                self.name, frame.frame_no, frame.destination, latency
            );
            let labels = self.metric_labels.to_labels();
            metrics::counter!(metric_defs::MAC_DATA_SENT.name, &labels).increment(1);
            metrics::histogram!(metric_defs::MAC_HANDSHAKE_LATENCY.name, &labels)
                .record(latency.as_micros() as f64);
        }
    }

    // ========================================================================
    // Responder
    // ========================================================================

    fn handle_rts(&mut self, src: Address, rts: &RtsHeader, ctx: &mut SimContext) -> Result<(), SimError> {
        if let Some(session) = &self.responder {
            if session.initiator == src && session.frame_no == rts.frame_no {
                debug!("MAC[{}]: duplicate RTS from {}", self.name, src);
                return Ok(());
            }
        }
        if self.delivered.get(&src) == Some(&rts.frame_no) {
            debug!("MAC[{}]: RTS for frame {} from {} already delivered", self.name, rts.frame_no, src);
            return Ok(());
        }
        if self.state != MacState::Idle {
            debug!("MAC[{}]: RTS from {} in state {}, ignoring", self.name, src, self.state);
            return Ok(());
        }

        let now = ctx.time();
        let initiator_position = Position::from_wire(rts.position);
        let channels = self.select_responder_channels(now, rts, &initiator_position);
        if channels.is_empty() {
            self.violation(FrameType::Rts, src, "RTS proposes no usable data channel");
            return Ok(());
        }

        debug!("MAC[{}]: RTS from {}, candidates {:?}", self.name, src, channels);
        self.backoff.pause(now);
        self.responder = Some(ResponderSession {
            initiator: src,
            frame_no: rts.frame_no,
            length: rts.length,
            initiator_position,
            candidates: ChannelCandidates::new(channels),
            signal_interval: 0,
            polls: 0,
        });
        self.send_beacon(ctx)
    }

    /// Proposed channels predicted free for the data frame, padded with the
    /// remaining proposals.
    fn select_responder_channels(
        &mut self,
        now: SimTime,
        rts: &RtsHeader,
        initiator_position: &Position,
    ) -> Vec<ChannelId> {
        let config = &self.config;
        let start = now
            + config.beacon_tx()
            + config.max_poll_window()
            + config.cts_tx()
            + initiator_position.propagation_delay_to(&self.position);
        let window = TimeWindow::starting_at(start, config.data_tx(rts.length as usize));

        let mut proposed: Vec<ChannelId> = Vec::with_capacity(rts.channels.len());
        for &channel in &rts.channels {
            if config.is_data_channel(channel) && !proposed.contains(&channel) {
                proposed.push(channel);
            }
        }
        let target = config.rts_channel_count.min(proposed.len());

        let mut channels = Vec::with_capacity(target);
        for &channel in &proposed {
            if channels.len() >= target {
                break;
            }
            if self
                .channel_manager
                .can_transmit(channel, window, initiator_position, &self.position)
            {
                channels.push(channel);
            }
        }
        pad_channels(&mut channels, proposed, target);
        channels
    }

    fn send_beacon(&mut self, ctx: &mut SimContext) -> Result<(), SimError> {
        let max_interval = self.config.max_signal_interval;
        let Some(session) = self.responder.as_mut() else {
            return Ok(());
        };
        let Some(channel) = session.candidates.current() else {
            info!(
                "MAC[{}]: no free data channel for frame {} from {}",
                self.name, session.frame_no, session.initiator
            );
            self.count(metric_defs::MAC_CANDIDATES_EXHAUSTED.name);
            return self.end_session(ctx);
        };

        let signal_interval = ctx.rng().gen_range(0..=max_interval);
        session.signal_interval = signal_interval;
        session.polls = 0;
        let beacon = BeaconHeader {
            channel,
            signal_interval,
            dst_position: self.position.to_wire(),
            extension: Some(BeaconExtension {
                length: session.length,
                src_position: session.initiator_position.to_wire(),
            }),
        };

        debug!(
            "MAC[{}]: beacon for channel {} (interval {})",
            self.name, channel, signal_interval
        );
        self.state = MacState::SendingBeacon;
        self.count(metric_defs::MAC_BEACONS_SENT.name);
        self.transmit(CumacPacket::beacon(self.address, beacon), CONTROL_CHANNEL, ctx);
        Ok(())
    }

    /// One busy-tone check. Reschedules itself until the poll window is over,
    /// then confirms the channel.
    fn poll_busy(&mut self, ctx: &mut SimContext) -> Result<(), SimError> {
        if self.state != MacState::WaitingBeaconResponse {
            return Ok(());
        }
        let now = ctx.time();
        let poll_count = self.config.poll_count;
        let Some(session) = self.responder.as_mut() else {
            return Ok(());
        };
        let Some(channel) = session.candidates.current() else {
            return Ok(());
        };
        let signal_interval = session.signal_interval;

        if self
            .busy_signals
            .is_busy(now, channel, signal_interval, &self.position)
        {
            session.candidates.advance();
            debug!("MAC[{}]: channel {} is busy, trying next", self.name, channel);
            let labels = self.metric_labels.with("channel", channel.to_string());
            metrics::counter!(metric_defs::MAC_CHANNEL_BUSY.name, &labels).increment(1);
            return self.send_beacon(ctx);
        }
        if session.polls + 1 < poll_count {
            session.polls += 1;
            let delay = self.config.tone_interval(signal_interval);
            return self.arm(TimerKind::BeaconPoll, delay, ctx);
        }
        self.send_cts(ctx)
    }

    fn send_cts(&mut self, ctx: &mut SimContext) -> Result<(), SimError> {
        let Some(session) = self.responder.as_ref() else {
            return Ok(());
        };
        let Some(channel) = session.candidates.current() else {
            return Ok(());
        };
        let initiator = session.initiator;
        let cts = CtsHeader {
            channel,
            frame_no: session.frame_no,
            packet_size: session.length,
            src_position: session.initiator_position.to_wire(),
            dst_position: self.position.to_wire(),
        };

        debug!("MAC[{}]: CTS to {} for channel {}", self.name, initiator, channel);
        self.state = MacState::SendingCts;
        self.transmit(CumacPacket::cts(self.address, initiator, cts), CONTROL_CHANNEL, ctx);
        Ok(())
    }

    /// CTS is out: reserve the data window and listen on the data channel.
    fn await_data(&mut self, ctx: &mut SimContext) -> Result<(), SimError> {
        let Some(session) = self.responder.as_ref() else {
            self.state = MacState::Idle;
            return Ok(());
        };
        let Some(channel) = session.candidates.current() else {
            return self.end_session(ctx);
        };
        let delay = session.initiator_position.propagation_delay_to(&self.position);
        let data_tx = self.config.data_tx(session.length as usize);
        let initiator_position = session.initiator_position;

        let window = TimeWindow::starting_at(ctx.time() + delay, data_tx);
        self.channel_manager
            .register_transmission(channel, window, initiator_position, self.position);

        self.state = MacState::WaitingData;
        self.listen(channel, ctx);
        let timeout = delay.mul(2) + data_tx + self.config.data_guard;
        self.arm(TimerKind::DataWait, timeout, ctx)
    }

    fn handle_data(
        &mut self,
        src: Address,
        data: &DataHeader,
        payload: &[u8],
        channel: ChannelId,
        ctx: &mut SimContext,
    ) -> Result<(), SimError> {
        if self.delivered.get(&src) == Some(&data.frame_no) {
            debug!("MAC[{}]: duplicate data frame {} from {}", self.name, data.frame_no, src);
            return Ok(());
        }
        let expected = self.state == MacState::WaitingData
            && self.responder.as_ref().is_some_and(|session| {
                session.initiator == src
                    && session.frame_no == data.frame_no
                    && session.candidates.current() == Some(channel)
            });
        if !expected {
            self.violation(FrameType::Data, src, "data frame outside a handshake");
            return Ok(());
        }

        self.data_wait.cancel();
        self.delivered.insert(src, data.frame_no);
        self.deliver(src, data.frame_no, payload.to_vec(), ctx);
        self.end_session(ctx)
    }

    fn handle_data_timeout(&mut self, ctx: &mut SimContext) -> Result<(), SimError> {
        if self.state != MacState::WaitingData {
            return Ok(());
        }
        if let Some(session) = &self.responder {
            info!(
                "MAC[{}]: data frame {} from {} did not arrive",
                self.name, session.frame_no, session.initiator
            );
        }
        self.count(metric_defs::MAC_DATA_WAIT_TIMEOUTS.name);
        self.end_session(ctx)
    }

    fn end_session(&mut self, ctx: &mut SimContext) -> Result<(), SimError> {
        self.responder = None;
        self.beacon_poll.cancel();
        self.data_wait.cancel();
        self.state = MacState::Idle;
        self.listen(CONTROL_CHANNEL, ctx);
        self.resume_backoff(ctx)
    }

    // ========================================================================
    // Overheard traffic
    // ========================================================================

    fn learn_positions(&mut self, src: Address, dst: Address, header: &CumacHeader) {
        match header {
            CumacHeader::Rts(rts) => self.peers.update(src, Position::from_wire(rts.position)),
            CumacHeader::Beacon(beacon) => {
                self.peers.update(src, Position::from_wire(beacon.dst_position))
            }
            CumacHeader::Cts(cts) => {
                self.peers.update(src, Position::from_wire(cts.dst_position));
                if dst != self.address {
                    self.peers.update(dst, Position::from_wire(cts.src_position));
                }
            }
            CumacHeader::Data(_) => {}
        }
    }

    /// Another pair is negotiating: hold off our own RTS until their
    /// handshake can have completed.
    fn handle_overheard_rts(
        &mut self,
        dst: Address,
        rts: &RtsHeader,
        ctx: &mut SimContext,
    ) -> Result<(), SimError> {
        if self.state != MacState::Idle || !self.backoff.is_pending() {
            return Ok(());
        }
        let now = ctx.time();
        let config = &self.config;
        let src_position = Position::from_wire(rts.position);
        let rts_tx = config.rts_tx();
        let rts_start = now - src_position.propagation_delay_to(&self.position) - rts_tx;
        let pair_delay = match self.peers.position(dst) {
            Some(position) => src_position.propagation_delay_to(&position),
            None => max_propagation_delay(),
        };
        let busy_until = rts_start
            + rts_tx
            + pair_delay.mul(2)
            + config.beacon_tx()
            + config.max_poll_window()
            + config.cts_tx()
            + max_propagation_delay();
        if busy_until <= now {
            return Ok(());
        }

        let deferral = busy_until - now;
        self.backoff.pause(now);
        self.backoff.extend(deferral);
        debug!("MAC[{}]: overheard RTS to {}, deferring {}", self.name, dst, deferral);
        self.count(metric_defs::MAC_BACKOFF_DEFERRALS.name);
        self.resume_backoff(ctx)
    }

    /// A CTS for another pair fixes their data window.
    fn handle_overheard_cts(&mut self, src: Address, cts: &CtsHeader, now: SimTime) {
        if !self.config.is_data_channel(cts.channel) {
            self.violation(FrameType::Cts, src, "CTS names an invalid data channel");
            return;
        }
        let initiator = Position::from_wire(cts.src_position);
        let responder = Position::from_wire(cts.dst_position);
        let start = now - responder.propagation_delay_to(&self.position)
            + responder.propagation_delay_to(&initiator);
        let window = TimeWindow::starting_at(start, self.config.data_tx(cts.packet_size as usize));
        trace!(
            "MAC[{}]: reservation on channel {} from {} to {}",
            self.name,
            cts.channel,
            window.start(),
            window.finish()
        );
        self.channel_manager
            .register_transmission(cts.channel, window, initiator, responder);
    }

    /// A neighbour is about to claim a channel. Object with a busy tone if
    /// its data frame would collide with a known transmission, otherwise
    /// remember the prediction.
    fn handle_overheard_beacon(
        &mut self,
        src: Address,
        beacon: &BeaconHeader,
        ctx: &mut SimContext,
    ) -> Result<(), SimError> {
        if !self.config.is_data_channel(beacon.channel) {
            self.violation(FrameType::Beacon, src, "beacon names an invalid data channel");
            return Ok(());
        }
        let now = ctx.time();
        let beaconer = Position::from_wire(beacon.dst_position);
        let beacon_end = now - beaconer.propagation_delay_to(&self.position);
        let cts_end = beacon_end
            + self.config.poll_window(beacon.signal_interval)
            + self.config.cts_tx();

        let (sender, window, free) = match beacon.extension {
            Some(extension) => {
                let sender = Position::from_wire(extension.src_position);
                let window = TimeWindow::starting_at(
                    cts_end + beaconer.propagation_delay_to(&sender),
                    self.config.data_tx(extension.length as usize),
                );
                let free = self
                    .channel_manager
                    .can_transmit(beacon.channel, window, &sender, &beaconer);
                (sender, window, free)
            }
            None => {
                // Only the receiving end is known.
                let window = TimeWindow::starting_at(cts_end, max_propagation_delay().mul(2));
                self.channel_manager.prune(now);
                let free = self
                    .channel_manager
                    .can_transmit_to_dst(beacon.channel, window, &beaconer);
                (beaconer, window, free)
            }
        };

        if free {
            self.channel_manager
                .register_transmission(beacon.channel, window, sender, beaconer);
            return Ok(());
        }

        debug!(
            "MAC[{}]: beacon from {} for channel {} collides, sending busy tone",
            self.name, src, beacon.channel
        );
        self.mark_busy(beacon.channel, beacon.signal_interval, self.position, ctx);
        ctx.post_immediate(
            vec![self.modem],
            EventPayload::ModemToneRequest(ModemToneRequestEvent {
                channel: beacon.channel,
                signal_interval: beacon.signal_interval,
            }),
        );
        let labels = self.metric_labels.with("channel", beacon.channel.to_string());
        metrics::counter!(metric_defs::MAC_TONES_SENT.name, &labels).increment(1);
        Ok(())
    }

    fn handle_tone(&mut self, tone: &ModemToneDetectedEvent, ctx: &mut SimContext) {
        trace!(
            "MAC[{}]: busy tone on channel {} (interval {})",
            self.name,
            tone.channel,
            tone.signal_interval
        );
        self.mark_busy(tone.channel, tone.signal_interval, tone.source_position, ctx);
    }

    fn mark_busy(
        &mut self,
        channel: ChannelId,
        signal_interval: u8,
        position: Position,
        ctx: &mut SimContext,
    ) {
        let (marker, lifetime) =
            self.busy_signals
                .notify_busy(ctx.time(), channel, signal_interval, position);
        ctx.post_event(
            lifetime,
            vec![self.id],
            EventPayload::Timer {
                timer_id: timer_id(TimerKind::BusyExpire, marker),
            },
        );
    }

    // ========================================================================
    // Reception
    // ========================================================================

    fn handle_rx_frame(&mut self, rx: &ModemRxFrameEvent, ctx: &mut SimContext) -> Result<(), SimError> {
        if rx.was_collided {
            debug!(
                "MAC[{}]: collided {} on channel {}, ignoring",
                self.name,
                rx.packet.frame_type_label(),
                rx.channel
            );
            return Ok(());
        }
        let Some(packet) = rx.packet.decoded() else {
            debug!("MAC[{}]: undecodable frame on channel {}", self.name, rx.channel);
            return Ok(());
        };
        let (src, dst) = (packet.common.src, packet.common.dst);
        if src == self.address {
            return Ok(());
        }
        self.learn_positions(src, dst, &packet.header);

        let to_me = dst == self.address;
        match &packet.header {
            CumacHeader::Rts(rts) if to_me => self.handle_rts(src, rts, ctx),
            CumacHeader::Rts(rts) => self.handle_overheard_rts(dst, rts, ctx),
            CumacHeader::Beacon(beacon) => self.handle_overheard_beacon(src, beacon, ctx),
            CumacHeader::Cts(cts) if to_me => self.handle_cts(src, cts, ctx),
            CumacHeader::Cts(cts) => {
                self.handle_overheard_cts(src, cts, ctx.time());
                Ok(())
            }
            CumacHeader::Data(data) if to_me => {
                self.handle_data(src, data, &packet.payload, rx.channel, ctx)
            }
            CumacHeader::Data(_) => Ok(()),
        }
    }

    fn violation(&self, frame_type: FrameType, src: Address, reason: &str) {
        warn!("MAC[{}]: {} from {}: {}", self.name, frame_type, src, reason);
        let labels = self.metric_labels.with("frame_type", frame_type.as_label());
        metrics::counter!(metric_defs::MAC_PROTOCOL_VIOLATIONS.name, &labels).increment(1);
    }

    fn count(&self, metric: &'static str) {
        let labels = self.metric_labels.to_labels();
        metrics::counter!(metric, &labels).increment(1);
    }
}

impl Entity for CumacMac {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::MacEnqueue(request) => {
                let accepted = self.enqueue(request.destination, request.payload.clone(), ctx)?;
                ctx.post_immediate(
                    vec![event.source],
                    EventPayload::MacEnqueueResult(MacEnqueueResultEvent {
                        accepted,
                        destination: request.destination,
                    }),
                );
            }
            EventPayload::ModemStateChanged(change) => {
                self.handle_modem_state(change.new_state, ctx)?;
            }
            EventPayload::ModemRxFrame(rx) => {
                self.handle_rx_frame(rx, ctx)?;
            }
            EventPayload::ModemToneDetected(tone) => {
                self.handle_tone(tone, ctx);
            }
            EventPayload::Timer { timer_id } => {
                self.handle_timer(*timer_id, ctx)?;
            }
            _ => {}
        }
        Ok(())
    }
}
