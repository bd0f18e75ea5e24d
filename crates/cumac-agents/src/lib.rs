//! # cumac-agents
//!
//! Upper-layer traffic for the CUMAC simulator.
//!
//! A [`TrafficAgent`] sits on top of one MAC. After a startup delay it offers
//! a frame to its destination, waits for the MAC to accept or reject it, and
//! offers the next one after an interval. Frames the MAC delivers to it are
//! counted.

use cumac_common::{
    Address, Entity, EntityId, Event, EventPayload, MacDeliverEvent, MacEnqueueEvent,
    MacEnqueueResultEvent, SimContext, SimError, SimTime,
};
use cumac_metrics::{metric_defs, metrics, MetricLabels};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

// ============================================================================
// Configuration Types
// ============================================================================

/// Configuration for periodic traffic towards one destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficConfig {
    /// Agent name used in payloads, logs and metric labels.
    pub name: String,
    /// Address of the receiving node.
    pub destination: Address,
    /// Payload size in bytes.
    pub payload_size: usize,
    /// Wait time before the first frame.
    pub startup_s: f64,
    /// Standard deviation of the startup delay.
    pub startup_jitter_s: f64,
    /// Time between the MAC's answer and the next frame.
    pub interval_s: f64,
    /// Standard deviation of the interval.
    pub interval_jitter_s: f64,
    /// Stop after offering this many frames.
    /// If None, the agent offers frames until the simulation ends.
    pub message_count: Option<u32>,
}

impl TrafficConfig {
    pub fn new(name: impl Into<String>, destination: Address) -> Self {
        TrafficConfig {
            name: name.into(),
            destination,
            payload_size: 32,
            startup_s: 1.0,
            startup_jitter_s: 0.0,
            interval_s: 30.0,
            interval_jitter_s: 0.0,
            message_count: None,
        }
    }
}

/// Sending state of a traffic agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficState {
    /// Waiting for the startup timer.
    WaitingStartup,
    /// A frame was offered, waiting for the MAC's answer.
    WaitingResult,
    /// Waiting for the interval timer.
    WaitingInterval,
    /// Message count reached.
    Shutdown,
}

// ============================================================================
// Timer IDs
// ============================================================================

/// Posted once at time zero by the scenario builder.
pub const TIMER_STARTUP: u64 = 0;
const TIMER_SEND: u64 = 1;

// ============================================================================
// Agent Entity
// ============================================================================

/// Offers frames to a MAC and counts what comes back.
pub struct TrafficAgent {
    id: EntityId,
    mac: EntityId,
    /// None for agents that only receive.
    config: Option<TrafficConfig>,
    name: String,
    state: TrafficState,

    seq: u32,
    offered: u32,
    accepted: u32,
    rejected: u32,
    received: u32,
    received_bytes: u64,

    metrics_labels: MetricLabels,
}

impl TrafficAgent {
    /// Create an agent. Without a config the agent only counts deliveries.
    pub fn new(
        id: EntityId,
        name: impl Into<String>,
        mac: EntityId,
        config: Option<TrafficConfig>,
    ) -> Self {
        let name = name.into();
        let state = if config.is_some() {
            TrafficState::WaitingStartup
        } else {
            TrafficState::Shutdown
        };
        TrafficAgent {
            id,
            mac,
            config,
            metrics_labels: MetricLabels::new(name.clone(), "agent"),
            name,
            state,
            seq: 0,
            offered: 0,
            accepted: 0,
            rejected: 0,
            received: 0,
            received_bytes: 0,
        }
    }

    pub fn config(&self) -> Option<&TrafficConfig> {
        self.config.as_ref()
    }

    pub fn state(&self) -> TrafficState {
        self.state
    }

    pub fn offered(&self) -> u32 {
        self.offered
    }

    pub fn accepted(&self) -> u32 {
        self.accepted
    }

    pub fn rejected(&self) -> u32 {
        self.rejected
    }

    pub fn received(&self) -> u32 {
        self.received
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    // ========================================================================
    // Sending
    // ========================================================================

    fn jittered_delay<R: Rng + ?Sized>(rng: &mut R, base_s: f64, jitter_s: f64) -> SimTime {
        let delay = match Normal::new(base_s, jitter_s) {
            Ok(normal) if jitter_s > 0.0 => normal.sample(rng).max(0.0),
            _ => base_s.max(0.0),
        };
        SimTime::from_secs(delay)
    }

    fn schedule_send(&mut self, base_s: f64, jitter_s: f64, ctx: &mut SimContext) {
        let delay = Self::jittered_delay(ctx.rng(), base_s, jitter_s);
        ctx.post_event(delay, vec![self.id], EventPayload::Timer { timer_id: TIMER_SEND });
    }

    fn send_next(&mut self, ctx: &mut SimContext) {
        let Some(config) = &self.config else {
            return;
        };
        if let Some(limit) = config.message_count {
            if self.offered >= limit {
                debug!("Agent[{}]: message count limit reached ({})", self.name, limit);
                self.state = TrafficState::Shutdown;
                return;
            }
        }

        self.seq += 1;
        let payload = make_payload(&self.name, self.seq, config.payload_size);
        let destination = config.destination;
        debug!(
            "Agent[{}]: offering frame {} ({} bytes) to {}",
            self.name,
            self.seq,
            payload.len(),
            destination
        );
        metrics::counter!(metric_defs::AGENT_OFFERED.name, &self.metrics_labels.to_labels())
            .increment(1);

        ctx.post_immediate(
            vec![self.mac],
            EventPayload::MacEnqueue(MacEnqueueEvent {
                destination,
                payload,
            }),
        );
        self.offered += 1;
        self.state = TrafficState::WaitingResult;
    }

    fn handle_enqueue_result(&mut self, result: &MacEnqueueResultEvent, ctx: &mut SimContext) {
        if result.accepted {
            self.accepted += 1;
        } else {
            self.rejected += 1;
            debug!("Agent[{}]: MAC busy, frame {} rejected", self.name, self.seq);
        }
        if self.state != TrafficState::WaitingResult {
            return;
        }
        if let Some((interval_s, jitter_s)) = self
            .config
            .as_ref()
            .map(|c| (c.interval_s, c.interval_jitter_s))
        {
            self.state = TrafficState::WaitingInterval;
            self.schedule_send(interval_s, jitter_s, ctx);
        }
    }

    fn handle_delivery(&mut self, delivery: &MacDeliverEvent) {
        self.received += 1;
        self.received_bytes += delivery.payload.len() as u64;
        debug!(
            "Agent[{}]: received frame {} from {}: {}",
            self.name,
            delivery.frame_no,
            delivery.source,
            String::from_utf8_lossy(&delivery.payload)
        );
        let labels = self.metrics_labels.to_labels();
        metrics::counter!(metric_defs::AGENT_RECEIVED.name, &labels).increment(1);
        metrics::histogram!(metric_defs::AGENT_PAYLOAD_SIZE.name, &labels)
            .record(delivery.payload.len() as f64);
    }
}

/// Deterministic ASCII payload `<name>#<seq>`, padded with `.` or truncated
/// to `size` bytes.
pub fn make_payload(name: &str, seq: u32, size: usize) -> Vec<u8> {
    let mut payload = format!("{}#{}", name, seq).into_bytes();
    payload.resize(size, b'.');
    payload
}

impl Entity for TrafficAgent {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::Timer { timer_id } => match *timer_id {
                TIMER_STARTUP => {
                    if self.state == TrafficState::WaitingStartup {
                        if let Some((startup_s, jitter_s)) = self
                            .config
                            .as_ref()
                            .map(|c| (c.startup_s, c.startup_jitter_s))
                        {
                            self.schedule_send(startup_s, jitter_s, ctx);
                        }
                    }
                }
                TIMER_SEND => {
                    if matches!(
                        self.state,
                        TrafficState::WaitingStartup | TrafficState::WaitingInterval
                    ) {
                        self.send_next(ctx);
                    }
                }
                other => trace!("Agent[{}]: unknown timer {}", self.name, other),
            },
            EventPayload::MacEnqueueResult(result) => self.handle_enqueue_result(result, ctx),
            EventPayload::MacDeliver(delivery) => self.handle_delivery(delivery),
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cumac_common::EventId;

    const AGENT: EntityId = EntityId(3);
    const MAC: EntityId = EntityId(2);

    fn event(ctx: &SimContext, payload: EventPayload) -> Event {
        Event {
            id: EventId(0),
            time: ctx.time(),
            source: MAC,
            targets: vec![AGENT],
            payload,
        }
    }

    fn fire(agent: &mut TrafficAgent, ctx: &mut SimContext, timer_id: u64) {
        agent
            .handle_event(&event(ctx, EventPayload::Timer { timer_id }), ctx)
            .unwrap();
    }

    fn answer(agent: &mut TrafficAgent, ctx: &mut SimContext, accepted: bool) {
        let result = MacEnqueueResultEvent {
            accepted,
            destination: Address(2),
        };
        agent
            .handle_event(&event(ctx, EventPayload::MacEnqueueResult(result)), ctx)
            .unwrap();
    }

    fn config() -> TrafficConfig {
        TrafficConfig {
            payload_size: 12,
            startup_s: 2.0,
            interval_s: 10.0,
            message_count: Some(2),
            ..TrafficConfig::new("alpha", Address(2))
        }
    }

    #[test]
    fn test_make_payload() {
        assert_eq!(make_payload("alpha", 3, 10), b"alpha#3...".to_vec());
        assert_eq!(make_payload("alpha", 12, 4), b"alph".to_vec());
        assert!(make_payload("alpha", 1, 0).is_empty());
    }

    #[test]
    fn test_jitter_never_negative() {
        let mut ctx = SimContext::new(5);
        for _ in 0..100 {
            let delay = TrafficAgent::jittered_delay(ctx.rng(), 0.1, 5.0);
            assert!(delay.as_secs_f64() >= 0.0);
        }
        assert_eq!(
            TrafficAgent::jittered_delay(ctx.rng(), 2.5, 0.0),
            SimTime::from_millis(2500)
        );
    }

    #[test]
    fn test_offers_until_message_count() {
        let mut ctx = SimContext::new(1);
        let mut agent = TrafficAgent::new(AGENT, "alpha", MAC, Some(config()));

        fire(&mut agent, &mut ctx, TIMER_STARTUP);
        let startup = ctx.take_pending_events();
        assert_eq!(startup.len(), 1);
        assert_eq!(startup[0].time, SimTime::from_secs(2.0));

        ctx.set_time(startup[0].time);
        fire(&mut agent, &mut ctx, TIMER_SEND);
        let offered = ctx.take_pending_events();
        match &offered[0].payload {
            EventPayload::MacEnqueue(request) => {
                assert_eq!(request.destination, Address(2));
                assert_eq!(request.payload, b"alpha#1.....".to_vec());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(offered[0].targets, vec![MAC]);

        answer(&mut agent, &mut ctx, true);
        let interval = ctx.take_pending_events();
        assert_eq!(interval[0].time, SimTime::from_secs(12.0));

        ctx.set_time(interval[0].time);
        fire(&mut agent, &mut ctx, TIMER_SEND);
        ctx.take_pending_events();
        answer(&mut agent, &mut ctx, false);
        fire(&mut agent, &mut ctx, TIMER_SEND);

        assert_eq!(agent.offered(), 2);
        assert_eq!(agent.accepted(), 1);
        assert_eq!(agent.rejected(), 1);
        assert_eq!(agent.state(), TrafficState::Shutdown);
    }

    #[test]
    fn test_receive_only_agent_counts_deliveries() {
        let mut ctx = SimContext::new(1);
        let mut agent = TrafficAgent::new(AGENT, "beta", MAC, None);
        fire(&mut agent, &mut ctx, TIMER_STARTUP);
        assert!(ctx.take_pending_events().is_empty());

        let delivery = MacDeliverEvent {
            source: Address(1),
            frame_no: 4,
            payload: b"alpha#1".to_vec(),
        };
        agent
            .handle_event(&event(&ctx, EventPayload::MacDeliver(delivery)), &mut ctx)
            .unwrap();
        assert_eq!(agent.received(), 1);
        assert_eq!(agent.received_bytes(), 7);
    }
}
