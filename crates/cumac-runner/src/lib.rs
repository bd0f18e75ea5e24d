//! # cumac-runner library
//!
//! Library interface for the CUMAC simulation runner.
//!
//! This module provides the event loop, run statistics and the JSON trace
//! recorder, and re-exports what is needed to run scenarios programmatically
//! and from integration tests.

pub mod metrics_export;

use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::io::Write;
use std::time::{Duration, Instant};

use cumac_common::{EntityId, Event, EventId, EventPayload, SimContext};
pub use cumac_common::SimTime;
use cumac_mac::decode_timer_id;
use cumac_model::{BuiltSimulation, NodeInfo};
use serde::Serialize;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during simulation.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Model error.
    #[error("Model error: {0}")]
    Model(#[from] cumac_model::ModelError),

    /// Simulation error.
    #[error("Simulation error: {0}")]
    Simulation(#[from] cumac_common::SimError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

// ============================================================================
// Simulation Statistics
// ============================================================================

/// Per-node statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NodeStats {
    /// Frames transmitted by this node's modem.
    pub tx: u64,
    /// Frames its modem handed to the MAC intact.
    pub rx: u64,
    /// Frames its modem received collided.
    pub collisions: u64,
    /// Data frames its MAC delivered upwards.
    pub delivered: u64,
    /// Frames its MAC accepted from the agent.
    pub accepted: u64,
    /// Frames its MAC refused because one was outstanding.
    pub rejected: u64,
}

/// Statistics collected during simulation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SimulationStats {
    /// Total events processed.
    pub total_events: u64,
    /// Frames transmitted.
    pub frames_transmitted: u64,
    /// Frames transmitted, by frame type.
    pub frames_by_type: BTreeMap<String, u64>,
    /// Frames received intact.
    pub frames_received: u64,
    /// Frames received collided.
    pub frames_collided: u64,
    /// Tone pulses emitted.
    pub tones_emitted: u64,
    /// Data frames delivered to an upper layer.
    pub deliveries: u64,
    /// Payload bytes delivered to an upper layer.
    pub delivered_bytes: u64,
    /// Enqueue requests accepted by a MAC.
    pub enqueue_accepted: u64,
    /// Enqueue requests rejected by a MAC.
    pub enqueue_rejected: u64,
    /// Per-node breakdown, keyed by node name.
    pub nodes: BTreeMap<String, NodeStats>,
    /// Final simulation time.
    pub simulation_time_us: u64,
    /// Wall clock time in milliseconds.
    #[serde(skip)]
    pub wall_time_ms: u64,
}

// ============================================================================
// Progress Reporting
// ============================================================================

/// Progress information passed to the progress callback during simulation.
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    /// Current simulation time.
    pub sim_time: SimTime,
    /// Target simulation time (end time).
    pub target_time: SimTime,
    /// Elapsed wall clock time since start.
    pub wall_elapsed: Duration,
    /// Total events processed so far.
    pub events_processed: u64,
    /// Progress as a percentage (0.0 to 100.0).
    pub progress_percent: f64,
}

// ============================================================================
// Trace Recording
// ============================================================================

/// Unix time of the trace's time origin, 2025-01-01T00:00:00Z.
const TRACE_EPOCH_S: i64 = 1_735_689_600;

/// Payload for a transmitted frame.
#[derive(Debug, Clone, Serialize)]
pub struct TxPacketPayload {
    /// Always "TX".
    pub direction: String,
    pub frame_type: String,
    pub channel: u8,
    /// Raw frame (hex-encoded).
    pub packet_hex: String,
    /// Decoded frame.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packet: Option<serde_json::Value>,
    pub packet_start_time_s: f64,
    pub packet_end_time_s: f64,
}

/// Payload for a frame handed from a modem to its MAC.
#[derive(Debug, Clone, Serialize)]
pub struct RxPacketPayload {
    /// Always "RX".
    pub direction: String,
    pub frame_type: String,
    pub channel: u8,
    /// Raw frame (hex-encoded).
    pub packet_hex: String,
    /// Decoded frame.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packet: Option<serde_json::Value>,
    /// "ok" or "collided".
    pub reception_status: String,
    pub packet_start_time_s: f64,
    pub packet_end_time_s: f64,
}

/// Payload for a timer event.
#[derive(Debug, Clone, Serialize)]
pub struct TimerPayload {
    pub timer_id: u64,
    /// MAC timer kind, if the id encodes one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timer_kind: Option<String>,
}

/// Payload for a data frame delivered to an upper layer.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryPayload {
    /// Address of the sending node.
    pub source: u8,
    pub frame_no: u8,
    pub payload_len: usize,
}

/// Payload types for different trace events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum TracePayload {
    /// Transmitted frame.
    #[serde(rename = "PACKET")]
    TxPacket(TxPacketPayload),
    /// Received frame.
    #[serde(rename = "PACKET")]
    RxPacket(RxPacketPayload),
    /// Timer fired.
    #[serde(rename = "TIMER")]
    Timer(TimerPayload),
    /// Data delivered.
    #[serde(rename = "DELIVERY")]
    Delivery(DeliveryPayload),
}

/// A trace entry for output.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEntry {
    /// Origin node name.
    pub origin: String,
    /// Origin entity ID.
    pub origin_id: String,
    /// Timestamp (RFC 3339).
    pub timestamp: String,
    /// Event-specific payload (flattened into this object).
    #[serde(flatten)]
    pub payload: TracePayload,
}

/// Trace recorder for outputting simulation events.
pub struct TraceRecorder {
    output: Option<Box<dyn Write>>,
    entries: Vec<TraceEntry>,
}

impl TraceRecorder {
    /// Create a new trace recorder. Nothing is recorded without an output.
    pub fn new(output: Option<Box<dyn Write>>) -> Self {
        TraceRecorder {
            output,
            entries: Vec::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.output.is_some()
    }

    /// Record an event.
    pub fn record(&mut self, entry: TraceEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    /// Flush all entries to output.
    pub fn flush(&mut self) -> Result<(), RunnerError> {
        if let Some(ref mut output) = self.output {
            let json = serde_json::to_string_pretty(&self.entries)?;
            writeln!(output, "{}", json)?;
            output.flush()?;
        }
        Ok(())
    }
}

/// Format a simulation time as an RFC 3339 timestamp.
fn trace_timestamp(time: SimTime) -> String {
    let micros = time.as_micros();
    let secs = TRACE_EPOCH_S + (micros / 1_000_000) as i64;
    let nanos = (micros % 1_000_000) as u32 * 1_000;
    chrono::DateTime::from_timestamp(secs, nanos)
        .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Micros, true))
        .unwrap_or_else(|| format!("{:.6}", time.as_secs_f64()))
}

// ============================================================================
// Event Loop
// ============================================================================

/// Node an entity belongs to, and its role.
#[derive(Debug, Clone)]
struct EntityLabel {
    node: String,
    role: &'static str,
}

/// The main simulation event loop.
pub struct EventLoop {
    event_queue: BinaryHeap<Event>,
    simulation: BuiltSimulation,
    context: SimContext,
    trace: TraceRecorder,
    stats: SimulationStats,
    /// Mapping from entity ID to node name and role.
    entity_labels: HashMap<u64, EntityLabel>,
}

impl EventLoop {
    /// Create a new event loop.
    pub fn new(
        simulation: BuiltSimulation,
        seed: u64,
        trace_output: Option<Box<dyn Write>>,
    ) -> Self {
        let mut context = SimContext::new(seed);

        // Initial events get ids from the context so they never collide with
        // events posted later.
        let mut event_queue = BinaryHeap::new();
        for mut event in simulation.initial_events.iter().cloned() {
            event.id = EventId(context.next_event_id());
            event_queue.push(event);
        }

        let mut stats = SimulationStats::default();
        let mut entity_labels = HashMap::new();
        for node_info in &simulation.node_infos {
            stats
                .nodes
                .insert(node_info.name.clone(), NodeStats::default());
            for (id, role) in [
                (node_info.modem_entity_id, "modem"),
                (node_info.mac_entity_id, "mac"),
                (node_info.agent_entity_id, "agent"),
            ] {
                entity_labels.insert(
                    id,
                    EntityLabel {
                        node: node_info.name.clone(),
                        role,
                    },
                );
            }
        }

        EventLoop {
            event_queue,
            simulation,
            context,
            trace: TraceRecorder::new(trace_output),
            stats,
            entity_labels,
        }
    }

    /// Run the simulation for the specified duration.
    pub fn run(&mut self, duration: SimTime) -> Result<SimulationStats, RunnerError> {
        self.run_with_progress(duration, |_, _| {})
    }

    /// Run the simulation, invoking `on_progress` about every five seconds
    /// of wall time.
    pub fn run_with_progress<F>(
        &mut self,
        duration: SimTime,
        mut on_progress: F,
    ) -> Result<SimulationStats, RunnerError>
    where
        F: FnMut(&Self, ProgressInfo),
    {
        let start_time = Instant::now();
        let end_time = duration;
        let progress_interval = Duration::from_secs(5);
        let mut last_progress = Instant::now();

        // Add end-of-simulation event
        self.event_queue.push(Event {
            id: EventId(u64::MAX),
            time: end_time,
            source: EntityId::new(0),
            targets: vec![],
            payload: EventPayload::SimulationEnd,
        });

        while let Some(event) = self.event_queue.pop() {
            if matches!(event.payload, EventPayload::SimulationEnd) {
                break;
            }

            self.context.set_time(event.time);
            self.simulation
                .entities
                .dispatch_event(&event, &mut self.context)?;

            for new_event in self.context.take_pending_events() {
                self.event_queue.push(new_event);
            }

            self.stats.total_events += 1;
            self.update_stats(&event);
            if self.trace.is_enabled() {
                self.record_trace(&event);
            }

            if last_progress.elapsed() >= progress_interval {
                let sim_time = self.context.time();
                let progress = ProgressInfo {
                    sim_time,
                    target_time: end_time,
                    wall_elapsed: start_time.elapsed(),
                    events_processed: self.stats.total_events,
                    progress_percent: (sim_time.as_secs_f64() / end_time.as_secs_f64()) * 100.0,
                };
                on_progress(self, progress);
                last_progress = Instant::now();
            }
        }

        self.context.set_time(end_time);
        self.stats.simulation_time_us = end_time.as_micros();
        self.stats.wall_time_ms = start_time.elapsed().as_millis() as u64;

        self.trace.flush()?;

        Ok(self.stats.clone())
    }

    /// Per-node statistics of the node `entity` belongs to.
    fn node_stats_mut(&mut self, entity: EntityId) -> Option<&mut NodeStats> {
        let label = self.entity_labels.get(&entity.0)?;
        self.stats.nodes.get_mut(&label.node)
    }

    /// Update statistics based on event type.
    fn update_stats(&mut self, event: &Event) {
        match &event.payload {
            EventPayload::TransmitAir(tx) => {
                self.stats.frames_transmitted += 1;
                *self
                    .stats
                    .frames_by_type
                    .entry(tx.packet.frame_type_label().to_string())
                    .or_insert(0) += 1;
                if let Some(stats) = self.node_stats_mut(tx.modem_id) {
                    stats.tx += 1;
                }
            }
            EventPayload::ModemRxFrame(rx) => {
                if rx.was_collided {
                    self.stats.frames_collided += 1;
                } else {
                    self.stats.frames_received += 1;
                }
                if let Some(stats) = self.node_stats_mut(event.source) {
                    if rx.was_collided {
                        stats.collisions += 1;
                    } else {
                        stats.rx += 1;
                    }
                }
            }
            EventPayload::TransmitTone(_) => {
                self.stats.tones_emitted += 1;
            }
            EventPayload::MacDeliver(delivery) => {
                self.stats.deliveries += 1;
                self.stats.delivered_bytes += delivery.payload.len() as u64;
                if let Some(stats) = self.node_stats_mut(event.source) {
                    stats.delivered += 1;
                }
            }
            EventPayload::MacEnqueueResult(result) => {
                if result.accepted {
                    self.stats.enqueue_accepted += 1;
                } else {
                    self.stats.enqueue_rejected += 1;
                }
                if let Some(stats) = self.node_stats_mut(event.source) {
                    if result.accepted {
                        stats.accepted += 1;
                    } else {
                        stats.rejected += 1;
                    }
                }
            }
            _ => {}
        }
    }

    /// Record a trace entry for an event.
    fn record_trace(&mut self, event: &Event) {
        let origin = self
            .entity_labels
            .get(&event.source.0)
            .map(|label| label.node.clone())
            .unwrap_or_else(|| format!("Entity_{}", event.source.0));

        let payload = match &event.payload {
            EventPayload::TransmitAir(tx) => TracePayload::TxPacket(TxPacketPayload {
                direction: "TX".to_string(),
                frame_type: tx.packet.frame_type_label().to_string(),
                channel: tx.channel,
                packet_hex: hex::encode(&tx.packet.bytes),
                packet: tx
                    .packet
                    .decoded()
                    .and_then(|p| serde_json::to_value(p).ok()),
                packet_start_time_s: event.time.as_secs_f64(),
                packet_end_time_s: tx.end_time.as_secs_f64(),
            }),
            EventPayload::ModemRxFrame(rx) => TracePayload::RxPacket(RxPacketPayload {
                direction: "RX".to_string(),
                frame_type: rx.packet.frame_type_label().to_string(),
                channel: rx.channel,
                packet_hex: hex::encode(&rx.packet.bytes),
                packet: rx
                    .packet
                    .decoded()
                    .and_then(|p| serde_json::to_value(p).ok()),
                reception_status: if rx.was_collided { "collided" } else { "ok" }.to_string(),
                packet_start_time_s: rx.start_time.as_secs_f64(),
                packet_end_time_s: rx.end_time.as_secs_f64(),
            }),
            EventPayload::Timer { timer_id } => TracePayload::Timer(TimerPayload {
                timer_id: *timer_id,
                timer_kind: decode_timer_id(*timer_id).map(|(kind, _)| kind.to_string()),
            }),
            EventPayload::MacDeliver(delivery) => TracePayload::Delivery(DeliveryPayload {
                source: delivery.source.0,
                frame_no: delivery.frame_no,
                payload_len: delivery.payload.len(),
            }),
            _ => return,
        };

        self.trace.record(TraceEntry {
            origin,
            origin_id: event.source.0.to_string(),
            timestamp: trace_timestamp(event.time),
            payload,
        });
    }

    /// Node information of the simulation.
    pub fn node_infos(&self) -> &[NodeInfo] {
        &self.simulation.node_infos
    }

    /// Get current statistics.
    pub fn stats(&self) -> &SimulationStats {
        &self.stats
    }

    /// Get current simulation time.
    pub fn current_time(&self) -> SimTime {
        self.context.time()
    }

    /// Role of an entity ("modem", "mac" or "agent"), if it belongs to a node.
    pub fn entity_role(&self, entity: EntityId) -> Option<&'static str> {
        self.entity_labels.get(&entity.0).map(|label| label.role)
    }
}

/// Create a new event loop from a built simulation, without tracing.
pub fn create_event_loop(simulation: BuiltSimulation, seed: u64) -> EventLoop {
    EventLoop::new(simulation, seed, None)
}

// Re-export key types for convenience
pub use cumac_model::{
    build_simulation, load_model, load_model_from_str, load_models, BuiltSimulation as SimulationBuild,
};

#[cfg(test)]
mod tests {
    use super::*;

    const PAIR: &str = r#"
nodes:
  - name: alpha
    address: 1
    position: { x: 0.0, y: 0.0, z: 0.0 }
    traffic:
      destination: beta
      payload_size: 24
      startup_s: 1.0
      interval_s: 20.0
      message_count: 3
  - name: beta
    address: 2
    position: { x: 0.0, y: 0.0, z: 300.0 }
"#;

    fn run_pair(seed: u64, trace: Option<Box<dyn Write>>) -> SimulationStats {
        let model = load_model_from_str(PAIR).unwrap();
        let simulation = build_simulation(&model).unwrap();
        let mut event_loop = EventLoop::new(simulation, seed, trace);
        event_loop.run(SimTime::from_secs(120.0)).unwrap()
    }

    #[test]
    fn test_pair_delivers_every_frame() {
        let stats = run_pair(42, None);

        assert_eq!(stats.enqueue_accepted, 3);
        assert_eq!(stats.enqueue_rejected, 0);
        assert_eq!(stats.deliveries, 3);
        assert_eq!(stats.delivered_bytes, 72);
        assert_eq!(stats.nodes["beta"].delivered, 3);
        assert_eq!(stats.nodes["alpha"].accepted, 3);
        assert_eq!(stats.frames_by_type.get("data"), Some(&3));
        assert_eq!(stats.frames_collided, 0);
        assert_eq!(stats.simulation_time_us, 120_000_000);
    }

    #[test]
    fn test_same_seed_same_run() {
        let first = run_pair(7, None);
        let second = run_pair(7, None);
        assert_eq!(first.total_events, second.total_events);
        assert_eq!(first.nodes, second.nodes);
        assert_eq!(first.frames_by_type, second.frames_by_type);
    }

    #[test]
    fn test_events_after_duration_not_processed() {
        let model = load_model_from_str(PAIR).unwrap();
        let simulation = build_simulation(&model).unwrap();
        let mut event_loop = create_event_loop(simulation, 1);
        // The first frame is offered at one second.
        let stats = event_loop.run(SimTime::from_millis(500)).unwrap();
        assert_eq!(stats.enqueue_accepted, 0);
        assert_eq!(stats.frames_transmitted, 0);
        assert_eq!(event_loop.current_time(), SimTime::from_millis(500));
    }

    #[test]
    fn test_entity_roles() {
        let model = load_model_from_str(PAIR).unwrap();
        let simulation = build_simulation(&model).unwrap();
        let event_loop = create_event_loop(simulation, 1);
        assert_eq!(event_loop.entity_role(EntityId(1)), Some("modem"));
        assert_eq!(event_loop.entity_role(EntityId(2)), Some("mac"));
        assert_eq!(event_loop.entity_role(EntityId(3)), Some("agent"));
        assert_eq!(event_loop.entity_role(EntityId(0)), None);
    }

    #[test]
    fn test_trace_timestamp() {
        assert_eq!(
            trace_timestamp(SimTime::from_millis(61_500)),
            "2025-01-01T00:01:01.500000Z"
        );
    }
}
