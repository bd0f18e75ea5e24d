//! # cumac-metrics
//!
//! Metric definitions for the CUMAC simulator.
//!
//! Entities record through the [`metrics`] facade using the names in
//! [`metric_defs`] and the per-node labels from [`MetricLabels`]. The runner
//! installs a recorder and exports the collected values.

use std::fmt;

pub use metrics;

// ============================================================================
// Metric Definitions
// ============================================================================

/// Kind of metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricKind::Counter => write!(f, "counter"),
            MetricKind::Gauge => write!(f, "gauge"),
            MetricKind::Histogram => write!(f, "histogram"),
        }
    }
}

/// Unit of a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricUnit {
    Count,
    Bytes,
    Microseconds,
}

/// Static description of one metric.
#[derive(Debug, Clone, Copy)]
pub struct MetricDef {
    pub name: &'static str,
    pub kind: MetricKind,
    pub unit: Option<MetricUnit>,
    pub description: &'static str,
    /// Labels recorded in addition to `node` and `node_type`.
    pub labels: &'static [&'static str],
}

impl MetricDef {
    /// Unit as printed in listings; empty if none.
    pub fn unit_str(&self) -> &'static str {
        match self.unit {
            Some(MetricUnit::Count) => "count",
            Some(MetricUnit::Bytes) => "bytes",
            Some(MetricUnit::Microseconds) => "us",
            None => "",
        }
    }

    fn metrics_unit(&self) -> Option<metrics::Unit> {
        match self.unit {
            Some(MetricUnit::Count) => Some(metrics::Unit::Count),
            Some(MetricUnit::Bytes) => Some(metrics::Unit::Bytes),
            Some(MetricUnit::Microseconds) => Some(metrics::Unit::Microseconds),
            None => None,
        }
    }
}

pub mod metric_defs {
    use super::{MetricDef, MetricKind, MetricUnit};

    const fn def(
        name: &'static str,
        kind: MetricKind,
        unit: Option<MetricUnit>,
        description: &'static str,
        labels: &'static [&'static str],
    ) -> MetricDef {
        MetricDef {
            name,
            kind,
            unit,
            description,
            labels,
        }
    }

    // =========== Modem ===========

    pub const MODEM_TX_FRAMES: MetricDef = def(
        "cumac.modem.tx_frames",
        MetricKind::Counter,
        Some(MetricUnit::Count),
        "Frames transmitted",
        &["frame_type", "channel"],
    );
    pub const MODEM_TX_AIRTIME: MetricDef = def(
        "cumac.modem.tx_airtime",
        MetricKind::Counter,
        Some(MetricUnit::Microseconds),
        "Time spent transmitting",
        &["frame_type", "channel"],
    );
    pub const MODEM_RX_FRAMES: MetricDef = def(
        "cumac.modem.rx_frames",
        MetricKind::Counter,
        Some(MetricUnit::Count),
        "Frames received intact on the tuned channel",
        &["frame_type", "channel"],
    );
    pub const MODEM_RX_COLLIDED: MetricDef = def(
        "cumac.modem.rx_collided",
        MetricKind::Counter,
        Some(MetricUnit::Count),
        "Frames damaged by overlapping same-channel signals or by our own transmission",
        &["frame_type", "channel"],
    );
    pub const MODEM_RX_MISSED: MetricDef = def(
        "cumac.modem.rx_missed",
        MetricKind::Counter,
        Some(MetricUnit::Count),
        "Frames that arrived on a channel the receiver was not tuned to",
        &["frame_type", "channel"],
    );
    pub const MODEM_TONES: MetricDef = def(
        "cumac.modem.tones_detected",
        MetricKind::Counter,
        Some(MetricUnit::Count),
        "Tone pulses detected",
        &["channel"],
    );

    // =========== MAC ===========

    pub const MAC_ENQUEUED: MetricDef = def(
        "cumac.mac.enqueued",
        MetricKind::Counter,
        Some(MetricUnit::Count),
        "Frames accepted from the upper layer",
        &[],
    );
    pub const MAC_ENQUEUE_REJECTED: MetricDef = def(
        "cumac.mac.enqueue_rejected",
        MetricKind::Counter,
        Some(MetricUnit::Count),
        "Frames rejected because one was already outstanding",
        &[],
    );
    pub const MAC_RTS_SENT: MetricDef = def(
        "cumac.mac.rts_sent",
        MetricKind::Counter,
        Some(MetricUnit::Count),
        "RTS attempts",
        &[],
    );
    pub const MAC_CTS_TIMEOUTS: MetricDef = def(
        "cumac.mac.cts_timeouts",
        MetricKind::Counter,
        Some(MetricUnit::Count),
        "RTS attempts that got no CTS in time",
        &[],
    );
    pub const MAC_FRAMES_DROPPED: MetricDef = def(
        "cumac.mac.frames_dropped",
        MetricKind::Counter,
        Some(MetricUnit::Count),
        "Frames abandoned after exhausting RTS retries",
        &[],
    );
    pub const MAC_DATA_SENT: MetricDef = def(
        "cumac.mac.data_sent",
        MetricKind::Counter,
        Some(MetricUnit::Count),
        "Data frames transmitted after a CTS",
        &["channel"],
    );
    pub const MAC_DATA_DELIVERED: MetricDef = def(
        "cumac.mac.data_delivered",
        MetricKind::Counter,
        Some(MetricUnit::Count),
        "Data frames delivered to the upper layer",
        &["channel"],
    );
    pub const MAC_DATA_WAIT_TIMEOUTS: MetricDef = def(
        "cumac.mac.data_wait_timeouts",
        MetricKind::Counter,
        Some(MetricUnit::Count),
        "Reservations abandoned because no data arrived",
        &[],
    );
    pub const MAC_BEACONS_SENT: MetricDef = def(
        "cumac.mac.beacons_sent",
        MetricKind::Counter,
        Some(MetricUnit::Count),
        "Beacons transmitted",
        &[],
    );
    pub const MAC_CHANNEL_BUSY: MetricDef = def(
        "cumac.mac.channel_busy",
        MetricKind::Counter,
        Some(MetricUnit::Count),
        "Beacon polls that found a busy marker",
        &[],
    );
    pub const MAC_CANDIDATES_EXHAUSTED: MetricDef = def(
        "cumac.mac.candidates_exhausted",
        MetricKind::Counter,
        Some(MetricUnit::Count),
        "Responder sessions that ran out of candidate channels",
        &[],
    );
    pub const MAC_TONES_SENT: MetricDef = def(
        "cumac.mac.tones_sent",
        MetricKind::Counter,
        Some(MetricUnit::Count),
        "Tone pulses emitted against colliding Beacons",
        &[],
    );
    pub const MAC_BACKOFF_DEFERRALS: MetricDef = def(
        "cumac.mac.backoff_deferrals",
        MetricKind::Counter,
        Some(MetricUnit::Count),
        "Backoff deferrals caused by overheard RTS frames",
        &[],
    );
    pub const MAC_PROTOCOL_VIOLATIONS: MetricDef = def(
        "cumac.mac.protocol_violations",
        MetricKind::Counter,
        Some(MetricUnit::Count),
        "Frames ignored because they did not fit the handshake state",
        &["frame_type"],
    );
    pub const MAC_HANDSHAKE_LATENCY: MetricDef = def(
        "cumac.mac.handshake_latency",
        MetricKind::Histogram,
        Some(MetricUnit::Microseconds),
        "Time from enqueue to the end of the data transmission",
        &[],
    );

    // =========== Agent ===========

    pub const AGENT_OFFERED: MetricDef = def(
        "cumac.agent.offered",
        MetricKind::Counter,
        Some(MetricUnit::Count),
        "Frames offered to the MAC",
        &[],
    );
    pub const AGENT_RECEIVED: MetricDef = def(
        "cumac.agent.received",
        MetricKind::Counter,
        Some(MetricUnit::Count),
        "Frames received from the MAC",
        &[],
    );
    pub const AGENT_PAYLOAD_SIZE: MetricDef = def(
        "cumac.agent.payload_size",
        MetricKind::Histogram,
        Some(MetricUnit::Bytes),
        "Size of received payloads",
        &[],
    );

    /// Every metric defined above.
    pub const ALL: &[MetricDef] = &[
        MODEM_TX_FRAMES,
        MODEM_TX_AIRTIME,
        MODEM_RX_FRAMES,
        MODEM_RX_COLLIDED,
        MODEM_RX_MISSED,
        MODEM_TONES,
        MAC_ENQUEUED,
        MAC_ENQUEUE_REJECTED,
        MAC_RTS_SENT,
        MAC_CTS_TIMEOUTS,
        MAC_FRAMES_DROPPED,
        MAC_DATA_SENT,
        MAC_DATA_DELIVERED,
        MAC_DATA_WAIT_TIMEOUTS,
        MAC_BEACONS_SENT,
        MAC_CHANNEL_BUSY,
        MAC_CANDIDATES_EXHAUSTED,
        MAC_TONES_SENT,
        MAC_BACKOFF_DEFERRALS,
        MAC_PROTOCOL_VIOLATIONS,
        MAC_HANDSHAKE_LATENCY,
        AGENT_OFFERED,
        AGENT_RECEIVED,
        AGENT_PAYLOAD_SIZE,
    ];
}

/// Look up a metric definition by name.
pub fn find_metric(name: &str) -> Option<&'static MetricDef> {
    metric_defs::ALL.iter().find(|m| m.name == name)
}

/// Register descriptions and units with the installed recorder.
pub fn describe_metrics() {
    for def in metric_defs::ALL {
        match (def.kind, def.metrics_unit()) {
            (MetricKind::Counter, Some(unit)) => metrics::describe_counter!(def.name, unit, def.description),
            (MetricKind::Counter, None) => metrics::describe_counter!(def.name, def.description),
            (MetricKind::Gauge, Some(unit)) => metrics::describe_gauge!(def.name, unit, def.description),
            (MetricKind::Gauge, None) => metrics::describe_gauge!(def.name, def.description),
            (MetricKind::Histogram, Some(unit)) => {
                metrics::describe_histogram!(def.name, unit, def.description)
            }
            (MetricKind::Histogram, None) => metrics::describe_histogram!(def.name, def.description),
        }
    }
}

// ============================================================================
// Labels
// ============================================================================

/// Labels attached to every metric recorded by one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricLabels {
    /// Node name.
    pub node: String,
    /// Entity role: "modem", "mac" or "agent".
    pub node_type: String,
}

impl MetricLabels {
    pub fn new(node: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            node_type: node_type.into(),
        }
    }

    /// Label pairs for the `metrics` macros.
    pub fn to_labels(&self) -> Vec<(&'static str, String)> {
        vec![("node", self.node.clone()), ("node_type", self.node_type.clone())]
    }

    /// Label pairs plus one extra pair.
    pub fn with(&self, key: &'static str, value: impl Into<String>) -> Vec<(&'static str, String)> {
        let mut labels = self.to_labels();
        labels.push((key, value.into()));
        labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_metric_names_unique() {
        let names: HashSet<_> = metric_defs::ALL.iter().map(|m| m.name).collect();
        assert_eq!(names.len(), metric_defs::ALL.len());
    }

    #[test]
    fn test_find_metric() {
        let def = find_metric("cumac.mac.rts_sent").unwrap();
        assert_eq!(def.kind, MetricKind::Counter);
        assert!(find_metric("cumac.mac.nope").is_none());
    }

    #[test]
    fn test_labels() {
        let labels = MetricLabels::new("A", "mac");
        assert_eq!(
            labels.with("channel", "3"),
            vec![
                ("node", "A".to_string()),
                ("node_type", "mac".to_string()),
                ("channel", "3".to_string())
            ]
        );
    }
}
