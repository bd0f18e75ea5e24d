//! End-to-end tests of the `cumac` binary.
//!
//! These run scenarios from this directory and check the trace file, the
//! statistics printed to stdout and the metrics export.

use std::fs;
use std::process::{Command, Output};
use tempfile::TempDir;

use serde::Deserialize;

// ============================================================================
// JSON Deserialization Types for Trace Output
// ============================================================================

/// A trace entry from the output file.
///
/// The payload is flattened into the entry, so every payload field is
/// optional here.
#[derive(Debug, Deserialize, Clone)]
struct TraceEntry {
    origin: String,
    origin_id: String,
    timestamp: String,
    /// "PACKET", "TIMER" or "DELIVERY"
    #[serde(rename = "type")]
    entry_type: String,
    #[serde(default)]
    direction: Option<String>,
    #[serde(default)]
    frame_type: Option<String>,
    #[serde(default)]
    channel: Option<u8>,
    #[serde(default)]
    packet_hex: Option<String>,
    #[serde(default)]
    packet: Option<serde_json::Value>,
    #[serde(default)]
    reception_status: Option<String>,
    #[serde(default)]
    packet_start_time_s: Option<f64>,
    #[serde(default)]
    packet_end_time_s: Option<f64>,
    #[serde(default)]
    timer_id: Option<u64>,
    #[serde(default)]
    source: Option<u8>,
    #[serde(default)]
    payload_len: Option<usize>,
}

// ============================================================================
// Test Helper Functions
// ============================================================================

/// Scenario file in this directory.
fn scenario(name: &str) -> String {
    format!("{}/tests/{}", env!("CARGO_MANIFEST_DIR"), name)
}

fn run_cumac(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_cumac"))
        .args(args)
        .output()
        .expect("Failed to execute cumac")
}

fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "Simulation failed:\nstdout: {}\nstderr: {}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Run a scenario and return the trace entries and the stdout statistics.
fn run_and_collect_trace(
    scenarios: &[&str],
    seed: u64,
    duration: &str,
) -> (Vec<TraceEntry>, serde_json::Value) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let output_path = temp_dir.path().join("trace.json");
    let output_arg = output_path.to_string_lossy().to_string();
    let seed_arg = seed.to_string();

    let paths: Vec<String> = scenarios.iter().map(|s| scenario(s)).collect();
    let mut args: Vec<&str> = vec!["run"];
    args.extend(paths.iter().map(|p| p.as_str()));
    args.extend([
        "--seed",
        seed_arg.as_str(),
        "--duration",
        duration,
        "--output",
        output_arg.as_str(),
    ]);

    let output = run_cumac(&args);
    assert_success(&output);

    let trace_json = fs::read_to_string(&output_path).expect("Failed to read trace output file");
    let trace = serde_json::from_str(&trace_json).expect("Failed to parse trace JSON");
    let stats =
        serde_json::from_slice(&output.stdout).expect("Failed to parse statistics on stdout");
    (trace, stats)
}

// ============================================================================
// Integration Tests
// ============================================================================

#[test]
fn test_trace_output_contains_packet_data() {
    let (trace, _) = run_and_collect_trace(&["two_nodes.yaml"], 42, "60s");

    let packet_events: Vec<_> = trace.iter().filter(|e| e.entry_type == "PACKET").collect();
    assert!(!packet_events.is_empty(), "Expected PACKET events in trace");

    for event in &packet_events {
        let hex = event.packet_hex.as_ref().expect("PACKET event without packet_hex");
        assert!(hex.len() % 2 == 0 && !hex.is_empty());
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(event.channel.is_some());
        assert!(event.packet.is_some(), "frame did not decode: {:?}", event);

        let start = event.packet_start_time_s.expect("missing start time");
        let end = event.packet_end_time_s.expect("missing end time");
        assert!(end > start, "frame ends before it starts: {:?}", event);
    }

    let types: std::collections::HashSet<_> = packet_events
        .iter()
        .filter_map(|e| e.frame_type.as_deref())
        .collect();
    for expected in ["rts", "cts", "data"] {
        assert!(types.contains(expected), "no {} frame in {:?}", expected, types);
    }
}

#[test]
fn test_trace_output_reception_status() {
    let (trace, _) = run_and_collect_trace(&["two_nodes.yaml"], 42, "60s");

    let rx_events: Vec<_> = trace
        .iter()
        .filter(|e| e.entry_type == "PACKET" && e.direction.as_deref() == Some("RX"))
        .collect();
    assert!(!rx_events.is_empty(), "Expected RX PACKET events in trace");
    for event in &rx_events {
        let status = event.reception_status.as_deref();
        assert!(
            status == Some("ok") || status == Some("collided"),
            "unexpected reception_status: {:?}",
            event
        );
    }

    for event in trace
        .iter()
        .filter(|e| e.entry_type == "PACKET" && e.direction.as_deref() == Some("TX"))
    {
        assert!(event.reception_status.is_none(), "TX with status: {:?}", event);
    }
}

#[test]
fn test_trace_output_timer_and_delivery_events() {
    let (trace, _) = run_and_collect_trace(&["two_nodes.yaml"], 42, "60s");

    let timers: Vec<_> = trace.iter().filter(|e| e.entry_type == "TIMER").collect();
    assert!(!timers.is_empty(), "Expected TIMER events in trace");
    for event in &timers {
        assert!(event.timer_id.is_some());
        assert!(event.packet_hex.is_none());
        assert!(event.direction.is_none());
    }

    let deliveries: Vec<_> = trace.iter().filter(|e| e.entry_type == "DELIVERY").collect();
    assert!(!deliveries.is_empty(), "Expected DELIVERY events in trace");
    for event in &deliveries {
        assert_eq!(event.origin, "beta");
        assert_eq!(event.source, Some(1));
        assert_eq!(event.payload_len, Some(16));
    }
}

#[test]
fn test_trace_output_has_node_names() {
    let (trace, _) = run_and_collect_trace(&["two_nodes.yaml"], 42, "60s");

    for event in &trace {
        assert!(
            event.origin == "alpha" || event.origin == "beta",
            "unexpected origin {} ({})",
            event.origin,
            event.origin_id
        );
        assert!(event.timestamp.starts_with("2025-01-01T"), "{}", event.timestamp);
    }
}

#[test]
fn test_stats_report_deliveries() {
    let (_, stats) = run_and_collect_trace(&["two_nodes.yaml"], 42, "60s");

    let delivered = stats["nodes"]["beta"]["delivered"].as_u64().unwrap();
    assert!(delivered >= 1, "nothing delivered: {}", stats);
    assert_eq!(stats["deliveries"].as_u64().unwrap(), delivered);
    assert_eq!(stats["delivered_bytes"].as_u64().unwrap(), delivered * 16);
    assert_eq!(stats["simulation_time_us"].as_u64().unwrap(), 60_000_000);
}

#[test]
fn test_overlay_adds_return_traffic() {
    let (trace, stats) =
        run_and_collect_trace(&["two_nodes.yaml", "quiet_overlay.yaml"], 7, "60s");

    let alpha = &stats["nodes"]["alpha"];
    let offered = alpha["accepted"].as_u64().unwrap() + alpha["rejected"].as_u64().unwrap();
    assert_eq!(offered, 2);

    let delivered_at_alpha = trace
        .iter()
        .filter(|e| e.entry_type == "DELIVERY" && e.origin == "alpha")
        .count();
    assert_eq!(
        stats["nodes"]["alpha"]["delivered"].as_u64().unwrap(),
        delivered_at_alpha as u64
    );
}

#[test]
fn test_same_seed_same_trace() {
    let (first, _) = run_and_collect_trace(&["busy_star.yaml"], 3, "2m");
    let (second, _) = run_and_collect_trace(&["busy_star.yaml"], 3, "2m");

    assert_eq!(first.len(), second.len());
    for (a, b) in first.iter().zip(second.iter()) {
        assert_eq!(a.timestamp, b.timestamp);
        assert_eq!(a.origin, b.origin);
        assert_eq!(a.packet_hex, b.packet_hex);
    }
}

#[test]
fn test_metrics_export_json() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let metrics_path = temp_dir.path().join("metrics.json");
    let metrics_arg = metrics_path.to_string_lossy().to_string();
    let model = scenario("busy_star.yaml");

    let output = run_cumac(&[
        "run",
        model.as_str(),
        "--seed",
        "11",
        "--duration",
        "2m",
        "--metrics-output",
        "json",
        "--metrics-file",
        metrics_arg.as_str(),
    ]);
    assert_success(&output);

    let metrics: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&metrics_path).unwrap()).unwrap();
    assert!(metrics["counters"]["cumac.modem.tx_frames"].as_u64().unwrap() > 0);
    assert!(metrics["counters"]["cumac.agent.offered"].as_u64().unwrap() > 0);
    assert!(metrics["nodes"]["north"]["counters"].is_object());

    // Statistics still go to stdout when metrics go to a file
    let stats: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert!(stats["frames_transmitted"].as_u64().unwrap() > 0);
}

#[test]
fn test_metrics_export_prometheus_to_stdout() {
    let model = scenario("two_nodes.yaml");
    let output = run_cumac(&[
        "run",
        model.as_str(),
        "--duration",
        "30s",
        "--metrics-output",
        "prometheus",
    ]);
    assert_success(&output);

    let text = String::from_utf8_lossy(&output.stdout);
    assert!(text.contains("# TYPE cumac_modem_tx_frames counter"), "{}", text);
    assert!(text.contains("node=\"alpha\""), "{}", text);
}

#[test]
fn test_invalid_scenario_fails() {
    let model = scenario("unknown_destination.yaml");
    let output = run_cumac(&["run", model.as_str()]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("nobody"), "{}", stderr);
}

#[test]
fn test_missing_duration_fails() {
    let model = scenario("busy_star.yaml");
    let output = run_cumac(&["run", model.as_str()]);
    assert!(!output.status.success());
}

#[test]
fn test_metrics_command_lists_definitions() {
    let output = run_cumac(&["metrics"]);
    assert_success(&output);
    let text = String::from_utf8_lossy(&output.stdout);
    assert!(text.contains("cumac.mac.frames_dropped"));
    assert!(text.contains("cumac.agent.offered"));
}
