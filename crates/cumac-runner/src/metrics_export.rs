//! Metrics export for simulation results.
//!
//! [`InMemoryRecorder`] collects everything recorded through the `metrics`
//! facade during a run. A [`MetricsSnapshot`] holds totals per metric name
//! plus a per-node breakdown taken from the `node` label, and can be written
//! as JSON or in the Prometheus text format.

use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// ============================================================================
// Metrics Snapshot Types
// ============================================================================

/// Per-node metric values.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct NodeMetrics {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub counters: BTreeMap<String, u64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub gauges: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub histograms: BTreeMap<String, HistogramSummary>,
}

/// Collected metric data for export.
#[derive(Debug, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Wall clock time the snapshot was taken.
    pub timestamp: String,
    /// Counters summed across all label sets.
    pub counters: BTreeMap<String, u64>,
    /// Gauges; the last label set wins.
    pub gauges: BTreeMap<String, f64>,
    /// Histograms over the samples of all label sets.
    pub histograms: BTreeMap<String, HistogramSummary>,
    /// Per-node breakdown of metrics.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub nodes: BTreeMap<String, NodeMetrics>,
}

/// Summary statistics for a histogram metric.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
}

// ============================================================================
// Export Functions
// ============================================================================

/// Export metrics as JSON.
pub fn export_json<W: Write>(snapshot: &MetricsSnapshot, writer: &mut W) -> std::io::Result<()> {
    serde_json::to_writer_pretty(&mut *writer, snapshot)?;
    writeln!(writer)?;
    Ok(())
}

fn prometheus_name(name: &str) -> String {
    name.replace('.', "_")
}

/// Export metrics in Prometheus text exposition format.
pub fn export_prometheus<W: Write>(
    snapshot: &MetricsSnapshot,
    writer: &mut W,
) -> std::io::Result<()> {
    for (name, value) in &snapshot.counters {
        let prom_name = prometheus_name(name);
        writeln!(writer, "# TYPE {} counter", prom_name)?;
        writeln!(writer, "{} {}", prom_name, value)?;
    }
    for (node_name, node_metrics) in &snapshot.nodes {
        for (name, value) in &node_metrics.counters {
            writeln!(writer, "{}{{node=\"{}\"}} {}", prometheus_name(name), node_name, value)?;
        }
    }

    for (name, value) in &snapshot.gauges {
        let prom_name = prometheus_name(name);
        writeln!(writer, "# TYPE {} gauge", prom_name)?;
        writeln!(writer, "{} {}", prom_name, value)?;
    }
    for (node_name, node_metrics) in &snapshot.nodes {
        for (name, value) in &node_metrics.gauges {
            writeln!(writer, "{}{{node=\"{}\"}} {}", prometheus_name(name), node_name, value)?;
        }
    }

    // Histograms as summaries with quantiles
    for (name, summary) in &snapshot.histograms {
        let prom_name = prometheus_name(name);
        writeln!(writer, "# TYPE {} summary", prom_name)?;
        writeln!(writer, "{}_count {}", prom_name, summary.count)?;
        writeln!(writer, "{}_sum {}", prom_name, summary.sum)?;
        writeln!(writer, "{}{{quantile=\"0.5\"}} {}", prom_name, summary.p50)?;
        writeln!(writer, "{}{{quantile=\"0.9\"}} {}", prom_name, summary.p90)?;
        writeln!(writer, "{}{{quantile=\"0.99\"}} {}", prom_name, summary.p99)?;
    }
    for (node_name, node_metrics) in &snapshot.nodes {
        for (name, summary) in &node_metrics.histograms {
            let prom_name = prometheus_name(name);
            writeln!(writer, "{}_count{{node=\"{}\"}} {}", prom_name, node_name, summary.count)?;
            writeln!(writer, "{}_sum{{node=\"{}\"}} {}", prom_name, node_name, summary.sum)?;
            for (quantile, value) in [("0.5", summary.p50), ("0.9", summary.p90), ("0.99", summary.p99)] {
                writeln!(
                    writer,
                    "{}{{node=\"{}\",quantile=\"{}\"}} {}",
                    prom_name, node_name, quantile, value
                )?;
            }
        }
    }

    Ok(())
}

// ============================================================================
// In-Memory Storage
// ============================================================================

#[derive(Debug, Default)]
struct CounterState {
    value: AtomicU64,
}

impl CounterState {
    fn increment(&self, value: u64) {
        self.value.fetch_add(value, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge value stored as f64 bits.
#[derive(Debug, Default)]
struct GaugeState {
    value: AtomicU64,
}

impl GaugeState {
    fn set(&self, value: f64) {
        self.value.store(value.to_bits(), Ordering::Relaxed);
    }

    fn increment(&self, value: f64) {
        let mut current = self.value.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + value).to_bits();
            match self.value.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    fn get(&self) -> f64 {
        f64::from_bits(self.value.load(Ordering::Relaxed))
    }
}

/// Maximum number of samples kept per histogram for percentiles.
const HISTOGRAM_RESERVOIR_SIZE: usize = 10_000;

#[derive(Debug)]
struct HistogramSamples {
    /// Reservoir of samples for percentile calculation.
    reservoir: Vec<f64>,
    /// Total count of samples seen (may exceed reservoir size).
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    /// xorshift64 state for reservoir replacement.
    rng_state: u64,
}

impl Default for HistogramSamples {
    fn default() -> Self {
        Self {
            reservoir: Vec::new(),
            count: 0,
            sum: 0.0,
            min: f64::MAX,
            max: f64::MIN,
            rng_state: 0x12345678_9ABCDEF0,
        }
    }
}

/// Histogram with bounded memory, sampled with reservoir sampling
/// (Algorithm R).
#[derive(Debug, Default)]
struct HistogramState {
    samples: RwLock<HistogramSamples>,
}

impl HistogramState {
    fn record(&self, value: f64) {
        let mut s = self.samples.write();
        s.count += 1;
        s.sum += value;
        s.min = s.min.min(value);
        s.max = s.max.max(value);

        if s.reservoir.len() < HISTOGRAM_RESERVOIR_SIZE {
            s.reservoir.push(value);
        } else {
            s.rng_state ^= s.rng_state << 13;
            s.rng_state ^= s.rng_state >> 7;
            s.rng_state ^= s.rng_state << 17;
            let j = (s.rng_state % s.count) as usize;
            if j < HISTOGRAM_RESERVOIR_SIZE {
                s.reservoir[j] = value;
            }
        }
    }

    fn samples(&self) -> Vec<f64> {
        self.samples.read().reservoir.clone()
    }

    fn summary(&self) -> HistogramSummary {
        let s = self.samples.read();
        if s.count == 0 {
            return HistogramSummary::default();
        }
        HistogramSummary {
            count: s.count,
            sum: s.sum,
            min: s.min,
            max: s.max,
            mean: s.sum / s.count as f64,
            ..percentiles(&s.reservoir)
        }
    }
}

/// Several histograms under one name: exact totals from each summary,
/// percentiles over the pooled reservoirs.
#[derive(Debug, Default)]
struct PooledHistogram {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    samples: Vec<f64>,
}

impl PooledHistogram {
    fn add(&mut self, histogram: &HistogramState) {
        let summary = histogram.summary();
        if summary.count == 0 {
            return;
        }
        if self.count == 0 {
            self.min = summary.min;
            self.max = summary.max;
        } else {
            self.min = self.min.min(summary.min);
            self.max = self.max.max(summary.max);
        }
        self.count += summary.count;
        self.sum += summary.sum;
        self.samples.extend(histogram.samples());
    }

    fn finish(self) -> HistogramSummary {
        if self.count == 0 {
            return HistogramSummary::default();
        }
        HistogramSummary {
            count: self.count,
            sum: self.sum,
            min: self.min,
            max: self.max,
            mean: self.sum / self.count as f64,
            ..percentiles(&self.samples)
        }
    }
}

/// p50/p90/p99 of `samples`; the other fields are zero.
fn percentiles(samples: &[f64]) -> HistogramSummary {
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let percentile = |p: f64| -> f64 {
        if sorted.is_empty() {
            return 0.0;
        }
        let idx = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
        sorted[idx.min(sorted.len() - 1)]
    };
    HistogramSummary {
        p50: percentile(50.0),
        p90: percentile(90.0),
        p99: percentile(99.0),
        ..HistogramSummary::default()
    }
}

/// Name and labels of a registered key.
#[derive(Debug, Clone)]
struct KeyMetadata {
    name: String,
    labels: Vec<(String, String)>,
}

impl KeyMetadata {
    fn from_key(key: &Key) -> Self {
        KeyMetadata {
            name: key.name().to_string(),
            labels: key
                .labels()
                .map(|l| (l.key().to_string(), l.value().to_string()))
                .collect(),
        }
    }

    fn node(&self) -> Option<&str> {
        self.labels
            .iter()
            .find(|(k, _)| k == "node")
            .map(|(_, v)| v.as_str())
    }
}

/// Unique string for a key including its labels.
fn key_to_string(key: &Key) -> String {
    let labels: Vec<String> = key
        .labels()
        .map(|l| format!("{}={}", l.key(), l.value()))
        .collect();

    if labels.is_empty() {
        key.name().to_string()
    } else {
        format!("{}|{}", key.name(), labels.join(","))
    }
}

#[derive(Debug, Default)]
struct RecorderState {
    counters: RwLock<BTreeMap<String, Arc<CounterState>>>,
    gauges: RwLock<BTreeMap<String, Arc<GaugeState>>>,
    histograms: RwLock<BTreeMap<String, Arc<HistogramState>>>,
    key_metadata: RwLock<BTreeMap<String, KeyMetadata>>,
}

impl RecorderState {
    fn get_or_create<T: Default>(
        &self,
        store: &RwLock<BTreeMap<String, Arc<T>>>,
        key: &Key,
    ) -> Arc<T> {
        let key_str = key_to_string(key);
        if let Some(existing) = store.read().get(&key_str) {
            return existing.clone();
        }
        self.key_metadata
            .write()
            .entry(key_str.clone())
            .or_insert_with(|| KeyMetadata::from_key(key));
        store
            .write()
            .entry(key_str)
            .or_insert_with(|| Arc::new(T::default()))
            .clone()
    }

    fn get_or_create_counter(&self, key: &Key) -> Arc<CounterState> {
        self.get_or_create(&self.counters, key)
    }

    fn get_or_create_gauge(&self, key: &Key) -> Arc<GaugeState> {
        self.get_or_create(&self.gauges, key)
    }

    fn get_or_create_histogram(&self, key: &Key) -> Arc<HistogramState> {
        self.get_or_create(&self.histograms, key)
    }

    fn snapshot(&self) -> MetricsSnapshot {
        let timestamp = chrono::Utc::now().to_rfc3339();
        let metadata = self.key_metadata.read();

        let mut counters: BTreeMap<String, u64> = BTreeMap::new();
        let mut gauges: BTreeMap<String, f64> = BTreeMap::new();
        let mut pooled: BTreeMap<String, PooledHistogram> = BTreeMap::new();
        let mut nodes: BTreeMap<String, NodeMetrics> = BTreeMap::new();

        for (key_str, counter) in self.counters.read().iter() {
            let Some(meta) = metadata.get(key_str) else {
                continue;
            };
            let value = counter.get();
            *counters.entry(meta.name.clone()).or_insert(0) += value;
            if let Some(node) = meta.node() {
                let node_metrics = nodes.entry(node.to_string()).or_default();
                *node_metrics.counters.entry(meta.name.clone()).or_insert(0) += value;
            }
        }

        for (key_str, gauge) in self.gauges.read().iter() {
            let Some(meta) = metadata.get(key_str) else {
                continue;
            };
            let value = gauge.get();
            gauges.insert(meta.name.clone(), value);
            if let Some(node) = meta.node() {
                let node_metrics = nodes.entry(node.to_string()).or_default();
                node_metrics.gauges.insert(meta.name.clone(), value);
            }
        }

        // Per-node summaries come from one label set; with extra labels
        // (frame type, channel) a node has several, so pool them.
        let mut node_pooled: BTreeMap<(String, String), PooledHistogram> = BTreeMap::new();
        for (key_str, histogram) in self.histograms.read().iter() {
            let Some(meta) = metadata.get(key_str) else {
                continue;
            };
            if let Some(node) = meta.node() {
                node_pooled
                    .entry((node.to_string(), meta.name.clone()))
                    .or_default()
                    .add(histogram);
            }
            pooled.entry(meta.name.clone()).or_default().add(histogram);
        }
        for ((node, name), histogram) in node_pooled {
            nodes
                .entry(node)
                .or_default()
                .histograms
                .insert(name, histogram.finish());
        }

        let histograms = pooled
            .into_iter()
            .map(|(name, histogram)| (name, histogram.finish()))
            .collect();

        MetricsSnapshot {
            timestamp,
            counters,
            gauges,
            histograms,
            nodes,
        }
    }
}

// ============================================================================
// Recorder
// ============================================================================

/// In-memory metrics recorder that collects metrics for export at the end
/// of a simulation.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRecorder {
    state: Arc<RecorderState>,
}

impl InMemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a snapshot of all current metric values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.state.snapshot()
    }
}

struct InMemoryCounter {
    state: Arc<CounterState>,
}

impl metrics::CounterFn for InMemoryCounter {
    fn increment(&self, value: u64) {
        self.state.increment(value);
    }

    fn absolute(&self, value: u64) {
        self.state.value.store(value, Ordering::Relaxed);
    }
}

struct InMemoryGauge {
    state: Arc<GaugeState>,
}

impl metrics::GaugeFn for InMemoryGauge {
    fn increment(&self, value: f64) {
        self.state.increment(value);
    }

    fn decrement(&self, value: f64) {
        self.state.increment(-value);
    }

    fn set(&self, value: f64) {
        self.state.set(value);
    }
}

struct InMemoryHistogram {
    state: Arc<HistogramState>,
}

impl metrics::HistogramFn for InMemoryHistogram {
    fn record(&self, value: f64) {
        self.state.record(value);
    }
}

impl Recorder for InMemoryRecorder {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        let state = self.state.get_or_create_counter(key);
        Counter::from_arc(Arc::new(InMemoryCounter { state }))
    }

    fn register_gauge(&self, key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        let state = self.state.get_or_create_gauge(key);
        Gauge::from_arc(Arc::new(InMemoryGauge { state }))
    }

    fn register_histogram(&self, key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        let state = self.state.get_or_create_histogram(key);
        Histogram::from_arc(Arc::new(InMemoryHistogram { state }))
    }
}
