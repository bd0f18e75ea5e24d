//! # cumac-runner
//!
//! CLI runner for the CUMAC simulator.
//!
//! This is the main entry point for running underwater multi-channel MAC
//! scenarios.

use cumac_runner::metrics_export;
use cumac_runner::{EventLoop, ProgressInfo, RunnerError, SimTime, SimulationStats};

use clap::{Parser, Subcommand, ValueEnum};
use cumac_model::{build_simulation, load_models};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ============================================================================
// Duration Parsing
// ============================================================================

/// Parse a duration string with units into seconds.
///
/// Supported formats:
/// - Plain number: `60` (interpreted as seconds)
/// - With unit suffix: `60s`, `10m`, `2h`, `1d`
/// - Combined units: `1h30m`, `2d12h`, `1d2h30m45s`
fn parse_duration(s: &str) -> Result<f64, String> {
    let s = s.trim();

    if let Ok(secs) = s.parse::<f64>() {
        return Ok(secs);
    }

    let mut total_seconds: f64 = 0.0;
    let mut current_number = String::new();

    for c in s.chars() {
        if c.is_ascii_digit() || c == '.' {
            current_number.push(c);
            continue;
        }
        if current_number.is_empty() {
            return Err(format!("Invalid duration format: unexpected '{}' in '{}'", c, s));
        }

        let value: f64 = current_number
            .parse()
            .map_err(|_| format!("Invalid number '{}' in duration '{}'", current_number, s))?;

        let multiplier = match c {
            's' => 1.0,
            'm' => 60.0,
            'h' => 3600.0,
            'd' => 86400.0,
            _ => {
                return Err(format!(
                    "Unknown duration unit '{}' in '{}'. Use s, m, h, or d.",
                    c, s
                ))
            }
        };

        total_seconds += value * multiplier;
        current_number.clear();
    }

    // Trailing number without unit counts as seconds
    if !current_number.is_empty() {
        let value: f64 = current_number
            .parse()
            .map_err(|_| format!("Invalid number '{}' in duration '{}'", current_number, s))?;
        total_seconds += value;
    }

    if total_seconds == 0.0 && !s.is_empty() {
        return Err(format!("Invalid duration format: '{}'", s));
    }

    Ok(total_seconds)
}

// ============================================================================
// CLI Configuration
// ============================================================================

/// Output format for metrics at end of simulation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum MetricsOutputFormat {
    /// JSON format for programmatic consumption.
    Json,
    /// Prometheus text exposition format.
    Prometheus,
}

/// CUMAC - multi-channel underwater MAC simulator
#[derive(Parser, Debug)]
#[command(name = "cumac")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a simulation from a YAML scenario file
    Run(RunnerConfig),
    /// List all available metrics with descriptions and labels
    Metrics,
}

/// Configuration for running a simulation
#[derive(Parser, Debug)]
pub struct RunnerConfig {
    /// Path(s) to YAML scenario file(s). Multiple files are merged in order (later overrides earlier).
    #[arg(required = true)]
    pub models: Vec<PathBuf>,

    /// Simulation duration (overrides `simulation.duration_s` of the scenario).
    /// Accepts plain seconds or units: 60, 60s, 10m, 2h, 1d, 1h30m
    #[arg(short, long, value_parser = parse_duration)]
    pub duration: Option<f64>,

    /// Random seed (default: scenario seed, otherwise random)
    #[arg(short, long)]
    pub seed: Option<u64>,

    /// Output trace file path (JSON)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Output format for metrics at end of simulation.
    #[arg(long, value_enum)]
    pub metrics_output: Option<MetricsOutputFormat>,

    /// File path to write metrics (stdout if not specified).
    #[arg(long)]
    pub metrics_file: Option<PathBuf>,
}

impl RunnerConfig {
    /// Run length: the command line wins over the scenario.
    fn resolve_duration(&self, model_duration: Option<SimTime>) -> Result<SimTime, RunnerError> {
        match (self.duration, model_duration) {
            (Some(secs), _) if secs > 0.0 => Ok(SimTime::from_secs(secs)),
            (Some(secs), _) => Err(RunnerError::ConfigError(format!(
                "Duration must be positive, got {}",
                secs
            ))),
            (None, Some(duration)) => Ok(duration),
            (None, None) => Err(RunnerError::ConfigError(
                "No duration given: pass --duration or set simulation.duration_s".to_string(),
            )),
        }
    }
}

// ============================================================================
// Terminal Output
// ============================================================================

/// Print the final summary table with per-node statistics.
fn print_summary_table(event_loop: &EventLoop) {
    let widths = [18, 9, 8, 8, 12, 11, 10, 10];
    let rule = |left: &str, mid: &str, right: &str| {
        let cells: Vec<String> = widths.iter().map(|w| "─".repeat(*w)).collect();
        format!("{}{}{}", left, cells.join(mid), right)
    };

    eprintln!();
    eprintln!("{}", rule("┌", "┬", "┐"));
    eprintln!(
        "│ {:^16} │ {:^7} │ {:^6} │ {:^6} │ {:^10} │ {:^9} │ {:^8} │ {:^8} │",
        "Node", "Address", "TX", "RX", "Collisions", "Delivered", "Accepted", "Rejected"
    );
    eprintln!("{}", rule("├", "┼", "┤"));

    let stats = event_loop.stats();
    for node_info in event_loop.node_infos() {
        let node = stats.nodes.get(&node_info.name).cloned().unwrap_or_default();
        eprintln!(
            "│ {:16} │ {:>7} │ {:>6} │ {:>6} │ {:>10} │ {:>9} │ {:>8} │ {:>8} │",
            &node_info.name,
            node_info.address.0,
            node.tx,
            node.rx,
            node.collisions,
            node.delivered,
            node.accepted,
            node.rejected
        );
    }

    eprintln!("{}", rule("└", "┴", "┘"));
    let _ = std::io::stderr().flush();
}

fn print_progress(_event_loop: &EventLoop, progress: ProgressInfo) {
    eprintln!(
        "  [{:5.1}%] sim: {:.1}s | events: {} | wall: {:.1}s",
        progress.progress_percent,
        progress.sim_time.as_secs_f64(),
        progress.events_processed,
        progress.wall_elapsed.as_secs_f64()
    );
}

// ============================================================================
// Main Entry Point
// ============================================================================

/// Run a simulation with the given configuration.
pub fn run_simulation(config: &RunnerConfig) -> Result<SimulationStats, RunnerError> {
    let metrics_recorder = if config.metrics_output.is_some() {
        let recorder = metrics_export::InMemoryRecorder::new();
        if let Err(e) = metrics::set_global_recorder(recorder.clone()) {
            eprintln!("Warning: Failed to set metrics recorder: {}", e);
            None
        } else {
            cumac_metrics::describe_metrics();
            Some(recorder)
        }
    } else {
        None
    };

    let paths: Vec<&Path> = config.models.iter().map(|p| p.as_path()).collect();
    let model = load_models(&paths)?;

    info!(
        "Loaded scenario with {} nodes from {} file(s)",
        model.nodes().len(),
        config.models.len()
    );

    let duration = config.resolve_duration(model.simulation().duration)?;

    let seed = config
        .seed
        .or(model.simulation().seed)
        .unwrap_or_else(|| {
            use rand::Rng;
            rand::thread_rng().gen()
        });

    if config.verbose {
        eprintln!("Using seed: {}", seed);
    }

    let simulation = build_simulation(&model)?;
    info!("Built simulation with {} entities", simulation.entities.len());

    let trace_output: Option<Box<dyn Write>> = match &config.output {
        Some(path) => Some(Box::new(std::io::BufWriter::new(std::fs::File::create(
            path,
        )?))),
        None => None,
    };

    let mut event_loop = EventLoop::new(simulation, seed, trace_output);

    eprintln!(
        "⏱  Running simulation for {} seconds...",
        duration.as_secs_f64()
    );
    let stats = event_loop.run_with_progress(duration, print_progress)?;
    print_summary_table(&event_loop);

    if config.verbose {
        eprintln!("Simulation complete!");
        eprintln!("  Total events: {}", stats.total_events);
        eprintln!("  Frames TX: {}", stats.frames_transmitted);
        eprintln!("  Frames RX: {}", stats.frames_received);
        eprintln!("  Collisions: {}", stats.frames_collided);
        eprintln!("  Deliveries: {}", stats.deliveries);
        eprintln!("  Wall time: {}ms", stats.wall_time_ms);
    }

    if let (Some(format), Some(recorder)) = (config.metrics_output, metrics_recorder) {
        let mut writer: Box<dyn Write> = match &config.metrics_file {
            Some(path) => Box::new(std::fs::File::create(path)?),
            None => Box::new(std::io::stdout()),
        };

        let snapshot = recorder.snapshot();
        match format {
            MetricsOutputFormat::Json => metrics_export::export_json(&snapshot, &mut writer)?,
            MetricsOutputFormat::Prometheus => {
                metrics_export::export_prometheus(&snapshot, &mut writer)?
            }
        }
        writer.flush()?;

        if let Some(ref path) = config.metrics_file {
            info!("Metrics exported to: {}", path.display());
        }
    }

    Ok(stats)
}

fn main() -> Result<(), RunnerError> {
    let cli = Cli::parse();

    // RUST_LOG wins; otherwise "warn", or "info" with --verbose
    let default_level = match &cli.command {
        Commands::Run(config) if config.verbose => "info",
        _ => "warn",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Run(config) => {
            let stats = run_simulation(&config)?;

            // Stats go to stdout unless metrics are already written there
            let metrics_on_stdout =
                config.metrics_output.is_some() && config.metrics_file.is_none();
            if !metrics_on_stdout {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            }
        }
        Commands::Metrics => {
            print_metrics_info();
        }
    }

    Ok(())
}

/// Print information about all available metrics
fn print_metrics_info() {
    use cumac_metrics::metric_defs;

    println!("CUMAC Available Metrics");
    println!("=======================\n");

    println!("All metrics carry the following labels:");
    println!("  - node: Node name");
    println!("  - node_type: Entity role (modem, mac, agent)");
    println!();

    let categories = [
        ("Modem Layer", "cumac.modem."),
        ("MAC Layer", "cumac.mac."),
        ("Traffic Agents", "cumac.agent."),
    ];

    for (category_name, prefix) in categories {
        println!("## {}\n", category_name);

        for metric in metric_defs::ALL {
            if !metric.name.starts_with(prefix) {
                continue;
            }
            println!("  {}", metric.name);
            println!("    Type: {}", metric.kind);
            let unit_str = metric.unit_str();
            if !unit_str.is_empty() {
                println!("    Unit: {}", unit_str);
            }
            if !metric.description.is_empty() {
                println!("    Description: {}", metric.description);
            }
            if !metric.labels.is_empty() {
                println!("    Extra labels: {}", metric.labels.join(", "));
            }
            println!();
        }
    }

    println!("## Usage Examples\n");
    println!("  # Run a scenario for ten minutes and export metrics as JSON:");
    println!("  cumac run scenario.yaml --duration 10m --metrics-output json\n");
    println!("  # Overlay a second file and write Prometheus text to a file:");
    println!("  cumac run base.yaml busy.yaml -d 1h --metrics-output prometheus --metrics-file out.prom\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(duration: Option<f64>) -> RunnerConfig {
        RunnerConfig {
            models: vec![PathBuf::from("test.yaml")],
            duration,
            seed: Some(12345),
            output: None,
            verbose: false,
            metrics_output: None,
            metrics_file: None,
        }
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "cumac",
            "run",
            "base.yaml",
            "overlay.yaml",
            "-d",
            "1h30m",
            "--seed",
            "7",
            "--metrics-output",
            "prometheus",
        ])
        .unwrap();
        let Commands::Run(config) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(config.models.len(), 2);
        assert_eq!(config.duration, Some(5400.0));
        assert_eq!(config.seed, Some(7));
        assert_eq!(config.metrics_output, Some(MetricsOutputFormat::Prometheus));
    }

    #[test]
    fn test_cli_requires_model() {
        assert!(Cli::try_parse_from(["cumac", "run"]).is_err());
    }

    #[test]
    fn test_resolve_duration() {
        let from_model = Some(SimTime::from_secs(30.0));
        assert_eq!(
            config(Some(60.0)).resolve_duration(from_model).unwrap(),
            SimTime::from_secs(60.0)
        );
        assert_eq!(
            config(None).resolve_duration(from_model).unwrap(),
            SimTime::from_secs(30.0)
        );
        assert!(config(None).resolve_duration(None).is_err());
        assert!(config(Some(-5.0)).resolve_duration(None).is_err());
    }

    #[test]
    fn test_parse_duration_plain_seconds() {
        assert_eq!(parse_duration("60").unwrap(), 60.0);
        assert_eq!(parse_duration("0.5").unwrap(), 0.5);
    }

    #[test]
    fn test_parse_duration_with_units() {
        assert_eq!(parse_duration("60s").unwrap(), 60.0);
        assert_eq!(parse_duration("10m").unwrap(), 600.0);
        assert_eq!(parse_duration("2h").unwrap(), 7200.0);
        assert_eq!(parse_duration("1d").unwrap(), 86400.0);
    }

    #[test]
    fn test_parse_duration_combined() {
        assert_eq!(parse_duration("1h30m").unwrap(), 5400.0);
        assert_eq!(parse_duration("1d2h30m45s").unwrap(), 95445.0);
        assert_eq!(parse_duration("1.5h").unwrap(), 5400.0);
    }

    #[test]
    fn test_parse_duration_errors() {
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("h10").is_err());
    }
}
