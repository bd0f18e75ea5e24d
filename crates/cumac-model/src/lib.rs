//! # cumac-model
//!
//! YAML scenario loading and simulation building for the CUMAC simulator.
//!
//! This crate provides:
//! - YAML schema types for scenarios
//! - Loading and merging of one or more scenario files
//! - Validation of the merged scenario
//! - Building the modem, MAC and agent entities of a scenario
//!
//! ## Layering
//!
//! Several files can be loaded on top of each other. Values are resolved in
//! order: built-in defaults, then the `defaults` sections, then the fields
//! given on a node. A later file that names an existing node overrides the
//! fields it sets; `remove: true` deletes the node.
//!
//! ```yaml
//! defaults:
//!   modem:
//!     num_channels: 9
//!   mac:
//!     cw_min: 2
//! nodes:
//!   - name: alpha
//!     address: 1
//!     position: { x: 0.0, y: 0.0, z: 0.0 }
//!     traffic:
//!       destination: beta
//!       interval_s: 20.0
//!   - name: beta
//!     address: 2
//!     position: { x: 0.0, y: 0.0, z: 300.0 }
//! simulation:
//!   duration_s: 600.0
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use cumac_agents::{TrafficAgent, TrafficConfig};
use cumac_common::{
    Address, EntityId, EntityRegistry, Event, EventId, EventPayload, Position, SimTime,
    INTERFERENCE_RANGE,
};
use cumac_mac::{CumacMac, MacConfig, ToneTiming};
use cumac_modem::{
    load_modes, LinkModel, Medium, Modem, ModemConfig, DEFAULT_DATA_RATE_BPS,
    DEFAULT_NUM_CHANNELS,
};
use cumac_packet::RTS_CHANNEL_SLOTS;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Largest contention window exponent a scenario may configure.
pub const MAX_CW_EXPONENT: u32 = 16;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during model operations.
#[derive(Debug, Error)]
pub enum ModelError {
    /// YAML parsing error.
    #[error("YAML parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Node not found.
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// Duplicate node name within one file.
    #[error("Duplicate node name: {0}")]
    DuplicateNode(String),

    /// Two nodes share an address.
    #[error("Nodes '{first}' and '{second}' share address {address}")]
    DuplicateAddress {
        address: u8,
        first: String,
        second: String,
    },

    /// A required node field was never given.
    #[error("Node '{node}' has no {field}")]
    MissingField { node: String, field: &'static str },

    /// Traffic destination is not a node of the scenario.
    #[error("Node '{node}' sends to unknown node '{destination}'")]
    UnknownDestination { node: String, destination: String },

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

// ============================================================================
// YAML Schema Types
// ============================================================================

/// MAC parameters that a scenario may override. Times are in seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MacOverrides {
    #[serde(default)]
    pub cw_min: Option<u32>,
    #[serde(default)]
    pub cw_max: Option<u32>,
    #[serde(default)]
    pub slot_time_s: Option<f64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub rts_channel_count: Option<usize>,
    #[serde(default)]
    pub prune_margin_s: Option<f64>,
    #[serde(default)]
    pub tone_interval_base_s: Option<f64>,
    #[serde(default)]
    pub tone_interval_step_s: Option<f64>,
    #[serde(default)]
    pub poll_count: Option<u32>,
    #[serde(default)]
    pub max_signal_interval: Option<u8>,
    #[serde(default)]
    pub data_guard_s: Option<f64>,
}

impl MacOverrides {
    /// Take every field that `other` sets.
    fn merge(&mut self, other: &MacOverrides) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if other.$field.is_some() { self.$field = other.$field; })*
            };
        }
        take!(
            cw_min,
            cw_max,
            slot_time_s,
            max_retries,
            rts_channel_count,
            prune_margin_s,
            tone_interval_base_s,
            tone_interval_step_s,
            poll_count,
            max_signal_interval,
            data_guard_s
        );
    }

    fn apply(&self, config: &mut MacConfig) {
        if let Some(v) = self.cw_min {
            config.cw_min = v;
        }
        if let Some(v) = self.cw_max {
            config.cw_max = v;
        }
        if let Some(v) = self.slot_time_s {
            config.slot_time = SimTime::from_secs(v);
        }
        if let Some(v) = self.max_retries {
            config.max_retries = v;
        }
        if let Some(v) = self.rts_channel_count {
            config.rts_channel_count = v;
        }
        if let Some(v) = self.prune_margin_s {
            config.prune_margin = SimTime::from_secs(v);
        }
        if let Some(v) = self.tone_interval_base_s {
            config.tone_timing = ToneTiming {
                base: SimTime::from_secs(v),
                ..config.tone_timing
            };
        }
        if let Some(v) = self.tone_interval_step_s {
            config.tone_timing = ToneTiming {
                step: SimTime::from_secs(v),
                ..config.tone_timing
            };
        }
        if let Some(v) = self.poll_count {
            config.poll_count = v;
        }
        if let Some(v) = self.max_signal_interval {
            config.max_signal_interval = v;
        }
        if let Some(v) = self.data_guard_s {
            config.data_guard = SimTime::from_secs(v);
        }
    }
}

/// Modem parameters shared by every node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModemOverrides {
    #[serde(default)]
    pub num_channels: Option<u8>,
    #[serde(default)]
    pub data_rate_bps: Option<u32>,
}

impl ModemOverrides {
    fn merge(&mut self, other: &ModemOverrides) {
        if other.num_channels.is_some() {
            self.num_channels = other.num_channels;
        }
        if other.data_rate_bps.is_some() {
            self.data_rate_bps = other.data_rate_bps;
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct DefaultsYaml {
    #[serde(default)]
    mac: MacOverrides,
    #[serde(default)]
    modem: ModemOverrides,
}

/// Traffic section of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrafficYaml {
    /// Name of the receiving node.
    pub destination: String,
    #[serde(default = "default_payload_size")]
    pub payload_size: usize,
    #[serde(default = "default_startup_s")]
    pub startup_s: f64,
    #[serde(default)]
    pub startup_jitter_s: f64,
    #[serde(default = "default_interval_s")]
    pub interval_s: f64,
    #[serde(default)]
    pub interval_jitter_s: f64,
    #[serde(default)]
    pub message_count: Option<u32>,
}

fn default_payload_size() -> usize {
    32
}

fn default_startup_s() -> f64 {
    1.0
}

fn default_interval_s() -> f64 {
    30.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct NodeYaml {
    name: String,
    /// When true, this node will be removed during model merging.
    #[serde(default)]
    remove: bool,
    #[serde(default)]
    address: Option<u8>,
    #[serde(default)]
    position: Option<Position>,
    #[serde(default)]
    mac: MacOverrides,
    #[serde(default)]
    traffic: Option<TrafficYaml>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct SimulationYaml {
    #[serde(default)]
    communication_range: Option<f64>,
    #[serde(default)]
    duration_s: Option<f64>,
    #[serde(default)]
    seed: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScenarioYaml {
    #[serde(default)]
    defaults: DefaultsYaml,
    #[serde(default)]
    nodes: Vec<NodeYaml>,
    #[serde(default)]
    simulation: SimulationYaml,
}

// ============================================================================
// Public Model API
// ============================================================================

/// A node with every value resolved.
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub address: Address,
    pub position: Position,
    pub mac: MacConfig,
    pub traffic: Option<TrafficYaml>,
}

/// Simulation-wide settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationSettings {
    /// Range within which frames and tones are heard.
    pub communication_range: f64,
    pub duration: Option<SimTime>,
    pub seed: Option<u64>,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        SimulationSettings {
            communication_range: INTERFERENCE_RANGE,
            duration: None,
            seed: None,
        }
    }
}

/// A loaded, merged and validated scenario.
#[derive(Debug, Clone)]
pub struct Model {
    nodes: BTreeMap<String, Node>,
    num_channels: u8,
    data_rate_bps: u32,
    simulation: SimulationSettings,
}

impl Model {
    /// Nodes keyed by name.
    pub fn nodes(&self) -> &BTreeMap<String, Node> {
        &self.nodes
    }

    pub fn find_node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn num_channels(&self) -> u8 {
        self.num_channels
    }

    pub fn data_rate_bps(&self) -> u32 {
        self.data_rate_bps
    }

    pub fn simulation(&self) -> &SimulationSettings {
        &self.simulation
    }
}

// ============================================================================
// Model Loading
// ============================================================================

/// Load a scenario from a file.
pub fn load_model(path: &Path) -> Result<Model, ModelError> {
    load_models(&[path])
}

/// Parse a scenario from a YAML string.
pub fn load_model_from_str(yaml_str: &str) -> Result<Model, ModelError> {
    load_models_from_str(&[yaml_str])
}

/// Load and merge several scenario files. Later files override earlier ones.
pub fn load_models(paths: &[&Path]) -> Result<Model, ModelError> {
    if paths.is_empty() {
        return Err(ModelError::InvalidConfig("No model files provided".to_string()));
    }

    let yaml_strings = paths
        .iter()
        .map(std::fs::read_to_string)
        .collect::<Result<Vec<String>, std::io::Error>>()?;
    let yaml_strs: Vec<&str> = yaml_strings.iter().map(|s| s.as_str()).collect();

    load_models_from_str(&yaml_strs)
}

/// Load and merge several scenarios given as YAML strings.
///
/// Later strings override earlier ones:
/// - `defaults` and `simulation` merge field by field
/// - A node with an existing name overrides the fields it sets
/// - `remove: true` deletes an existing node
///
/// Validation runs once on the merged result.
pub fn load_models_from_str(yaml_strs: &[&str]) -> Result<Model, ModelError> {
    if yaml_strs.is_empty() {
        return Err(ModelError::InvalidConfig(
            "No model strings provided".to_string(),
        ));
    }

    let mut mac_defaults = MacOverrides::default();
    let mut modem_defaults = ModemOverrides::default();
    let mut simulation = SimulationYaml::default();
    let mut nodes: BTreeMap<String, NodeYaml> = BTreeMap::new();

    for yaml_str in yaml_strs {
        let yaml: ScenarioYaml = serde_yaml::from_str(yaml_str)?;

        mac_defaults.merge(&yaml.defaults.mac);
        modem_defaults.merge(&yaml.defaults.modem);
        if yaml.simulation.communication_range.is_some() {
            simulation.communication_range = yaml.simulation.communication_range;
        }
        if yaml.simulation.duration_s.is_some() {
            simulation.duration_s = yaml.simulation.duration_s;
        }
        if yaml.simulation.seed.is_some() {
            simulation.seed = yaml.simulation.seed;
        }

        let mut seen = BTreeSet::new();
        for node in yaml.nodes {
            if !seen.insert(node.name.clone()) {
                return Err(ModelError::DuplicateNode(node.name));
            }
            if node.remove {
                if nodes.remove(&node.name).is_none() {
                    return Err(ModelError::NodeNotFound(node.name));
                }
            } else if let Some(existing) = nodes.get_mut(&node.name) {
                if node.address.is_some() {
                    existing.address = node.address;
                }
                if node.position.is_some() {
                    existing.position = node.position;
                }
                existing.mac.merge(&node.mac);
                if node.traffic.is_some() {
                    existing.traffic = node.traffic;
                }
            } else {
                nodes.insert(node.name.clone(), node);
            }
        }
    }

    resolve(nodes, mac_defaults, modem_defaults, simulation)
}

fn resolve(
    nodes: BTreeMap<String, NodeYaml>,
    mac_defaults: MacOverrides,
    modem_defaults: ModemOverrides,
    simulation: SimulationYaml,
) -> Result<Model, ModelError> {
    let num_channels = modem_defaults.num_channels.unwrap_or(DEFAULT_NUM_CHANNELS);
    let data_rate_bps = modem_defaults.data_rate_bps.unwrap_or(DEFAULT_DATA_RATE_BPS);
    if num_channels < 2 {
        return Err(ModelError::InvalidConfig(format!(
            "num_channels must be at least 2, got {}",
            num_channels
        )));
    }
    if data_rate_bps == 0 {
        return Err(ModelError::InvalidConfig(
            "data_rate_bps must be positive".to_string(),
        ));
    }

    let communication_range = simulation.communication_range.unwrap_or(INTERFERENCE_RANGE);
    if !(communication_range > 0.0) {
        return Err(ModelError::InvalidConfig(format!(
            "communication_range must be positive, got {}",
            communication_range
        )));
    }
    let duration = match simulation.duration_s {
        Some(d) if !(d > 0.0) => {
            return Err(ModelError::InvalidConfig(format!(
                "duration_s must be positive, got {}",
                d
            )))
        }
        d => d.map(SimTime::from_secs),
    };

    let mut resolved = BTreeMap::new();
    let mut addresses: BTreeMap<u8, String> = BTreeMap::new();
    for (name, node) in &nodes {
        let address = node.address.ok_or_else(|| ModelError::MissingField {
            node: name.clone(),
            field: "address",
        })?;
        if Address(address) == Address::BROADCAST {
            return Err(ModelError::InvalidConfig(format!(
                "node '{}' uses the broadcast address {}",
                name, address
            )));
        }
        if let Some(first) = addresses.insert(address, name.clone()) {
            return Err(ModelError::DuplicateAddress {
                address,
                first,
                second: name.clone(),
            });
        }
        let position = node.position.ok_or_else(|| ModelError::MissingField {
            node: name.clone(),
            field: "position",
        })?;

        let mut mac = MacConfig {
            num_channels,
            data_rate_bps,
            ..MacConfig::default()
        };
        mac_defaults.apply(&mut mac);
        node.mac.apply(&mut mac);
        validate_mac(name, &mac)?;

        if let Some(traffic) = &node.traffic {
            if !nodes.contains_key(&traffic.destination) {
                return Err(ModelError::UnknownDestination {
                    node: name.clone(),
                    destination: traffic.destination.clone(),
                });
            }
            if &traffic.destination == name {
                return Err(ModelError::InvalidConfig(format!(
                    "node '{}' sends traffic to itself",
                    name
                )));
            }
            if traffic.payload_size > u16::MAX as usize {
                return Err(ModelError::InvalidConfig(format!(
                    "node '{}' payload_size {} exceeds {}",
                    name,
                    traffic.payload_size,
                    u16::MAX
                )));
            }
        }

        resolved.insert(
            name.clone(),
            Node {
                name: name.clone(),
                address: Address(address),
                position,
                mac,
                traffic: node.traffic.clone(),
            },
        );
    }

    Ok(Model {
        nodes: resolved,
        num_channels,
        data_rate_bps,
        simulation: SimulationSettings {
            communication_range,
            duration,
            seed: simulation.seed,
        },
    })
}

fn validate_mac(node: &str, mac: &MacConfig) -> Result<(), ModelError> {
    let invalid = |what: String| ModelError::InvalidConfig(format!("node '{}': {}", node, what));
    if mac.cw_min > mac.cw_max {
        return Err(invalid(format!(
            "cw_min {} exceeds cw_max {}",
            mac.cw_min, mac.cw_max
        )));
    }
    if mac.cw_max > MAX_CW_EXPONENT {
        return Err(invalid(format!(
            "cw_max {} exceeds {}",
            mac.cw_max, MAX_CW_EXPONENT
        )));
    }
    if mac.rts_channel_count == 0 || mac.rts_channel_count > RTS_CHANNEL_SLOTS {
        return Err(invalid(format!(
            "rts_channel_count must be in 1..={}, got {}",
            RTS_CHANNEL_SLOTS, mac.rts_channel_count
        )));
    }
    if mac.poll_count == 0 {
        return Err(invalid("poll_count must be positive".to_string()));
    }
    if mac.tone_timing.base == SimTime::ZERO {
        return Err(invalid("tone_interval_base_s must be positive".to_string()));
    }
    Ok(())
}

// ============================================================================
// Model Building
// ============================================================================

/// Entity ids and placement of one node.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub name: String,
    pub address: Address,
    pub position: Position,
    pub modem_entity_id: u64,
    pub mac_entity_id: u64,
    pub agent_entity_id: u64,
    /// Whether the agent generates traffic.
    pub sends_traffic: bool,
}

/// Result of building a simulation from a model.
pub struct BuiltSimulation {
    /// Entity registry with all entities.
    pub entities: EntityRegistry,
    /// Positions and range the medium was built with.
    pub link_model: LinkModel,
    /// Initial events to seed the simulation.
    pub initial_events: Vec<Event>,
    /// Information about each node, in name order.
    pub node_infos: Vec<NodeInfo>,
}

/// Entity id of the medium.
pub const MEDIUM_ENTITY: EntityId = EntityId(0);

/// Build the entities of a model.
///
/// Entity 0 is the medium. Every node, in name order, gets a modem, a MAC
/// and an agent. Agents without traffic only count deliveries.
pub fn build_simulation(model: &Model) -> Result<BuiltSimulation, ModelError> {
    let mut entities = EntityRegistry::new();
    let mut link_model = LinkModel::new(model.simulation.communication_range);
    let mut initial_events = Vec::new();
    let mut node_infos = Vec::new();

    let modem_config = ModemConfig {
        modes: load_modes(model.num_channels, model.data_rate_bps),
        medium_entity: MEDIUM_ENTITY,
    };

    let addresses: BTreeMap<&str, Address> = model
        .nodes
        .values()
        .map(|node| (node.name.as_str(), node.address))
        .collect();

    let mut next_entity_id = MEDIUM_ENTITY.0 + 1;
    for node in model.nodes.values() {
        let modem_id = EntityId::new(next_entity_id);
        let mac_id = EntityId::new(next_entity_id + 1);
        let agent_id = EntityId::new(next_entity_id + 2);
        next_entity_id += 3;

        link_model.add_modem(modem_id, node.position);
        entities.register(Box::new(Modem::new(
            modem_id,
            node.name.clone(),
            modem_config.clone(),
            node.position,
            mac_id,
        )));
        entities.register(Box::new(CumacMac::new(
            mac_id,
            node.name.clone(),
            node.address,
            node.position,
            modem_id,
            Some(agent_id),
            node.mac.clone(),
        )));

        let traffic = match &node.traffic {
            Some(traffic) => {
                let destination = addresses
                    .get(traffic.destination.as_str())
                    .copied()
                    .ok_or_else(|| ModelError::NodeNotFound(traffic.destination.clone()))?;
                Some(TrafficConfig {
                    name: node.name.clone(),
                    destination,
                    payload_size: traffic.payload_size,
                    startup_s: traffic.startup_s,
                    startup_jitter_s: traffic.startup_jitter_s,
                    interval_s: traffic.interval_s,
                    interval_jitter_s: traffic.interval_jitter_s,
                    message_count: traffic.message_count,
                })
            }
            None => None,
        };
        let sends_traffic = traffic.is_some();
        entities.register(Box::new(TrafficAgent::new(
            agent_id,
            node.name.clone(),
            mac_id,
            traffic,
        )));

        if sends_traffic {
            initial_events.push(Event {
                id: EventId(initial_events.len() as u64),
                time: SimTime::ZERO,
                source: agent_id,
                targets: vec![agent_id],
                payload: EventPayload::Timer {
                    timer_id: cumac_agents::TIMER_STARTUP,
                },
            });
        }

        debug!(
            "Node '{}': address {} at ({:.1}, {:.1}, {:.1}), entities {}/{}/{}",
            node.name,
            node.address,
            node.position.x,
            node.position.y,
            node.position.z,
            modem_id.0,
            mac_id.0,
            agent_id.0
        );

        node_infos.push(NodeInfo {
            name: node.name.clone(),
            address: node.address,
            position: node.position,
            modem_entity_id: modem_id.0,
            mac_entity_id: mac_id.0,
            agent_entity_id: agent_id.0,
            sends_traffic,
        });
    }

    entities.register(Box::new(Medium::new(MEDIUM_ENTITY, link_model.clone())));

    Ok(BuiltSimulation {
        entities,
        link_model,
        initial_events,
        node_infos,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
defaults:
  modem:
    num_channels: 6
  mac:
    cw_min: 3
    cw_max: 6
nodes:
  - name: alpha
    address: 1
    position: { x: 0.0, y: 0.0, z: 0.0 }
    traffic:
      destination: beta
      payload_size: 20
      interval_s: 15.0
  - name: beta
    address: 2
    position: { x: 0.0, y: 0.0, z: 300.0 }
    mac:
      max_retries: 1
simulation:
  duration_s: 120.0
  seed: 7
"#;

    #[test]
    fn test_load_resolves_defaults() {
        let model = load_model_from_str(BASE).unwrap();
        assert_eq!(model.num_channels(), 6);
        assert_eq!(model.data_rate_bps(), DEFAULT_DATA_RATE_BPS);

        let alpha = model.find_node("alpha").unwrap();
        assert_eq!(alpha.address, Address(1));
        assert_eq!(alpha.mac.num_channels, 6);
        assert_eq!(alpha.mac.cw_min, 3);
        assert_eq!(alpha.mac.max_retries, MacConfig::default().max_retries);
        let traffic = alpha.traffic.as_ref().unwrap();
        assert_eq!(traffic.payload_size, 20);
        assert_eq!(traffic.startup_s, 1.0);

        let beta = model.find_node("beta").unwrap();
        assert_eq!(beta.mac.max_retries, 1);
        assert!(beta.traffic.is_none());

        assert_eq!(model.simulation().duration, Some(SimTime::from_secs(120.0)));
        assert_eq!(model.simulation().seed, Some(7));
        assert_eq!(model.simulation().communication_range, INTERFERENCE_RANGE);
    }

    #[test]
    fn test_overlay_merges_and_removes() {
        let overlay = r#"
defaults:
  mac:
    slot_time_s: 0.5
nodes:
  - name: beta
    position: { x: 0.0, y: 100.0, z: 300.0 }
  - name: gamma
    address: 3
    position: { x: 0.0, y: 0.0, z: 600.0 }
  - name: alpha
    remove: true
"#;
        let model = load_models_from_str(&[BASE, overlay]).unwrap();
        assert!(model.find_node("alpha").is_none());
        let beta = model.find_node("beta").unwrap();
        assert_eq!(beta.address, Address(2));
        assert_eq!(beta.position, Position::new(0.0, 100.0, 300.0));
        assert_eq!(beta.mac.max_retries, 1);
        assert_eq!(beta.mac.slot_time, SimTime::from_millis(500));
        assert_eq!(model.nodes().len(), 2);
    }

    #[test]
    fn test_remove_unknown_node() {
        let overlay = "nodes:\n  - name: delta\n    remove: true\n";
        assert!(matches!(
            load_models_from_str(&[BASE, overlay]),
            Err(ModelError::NodeNotFound(name)) if name == "delta"
        ));
    }

    #[test]
    fn test_validation_errors() {
        let dup_name = r#"
nodes:
  - { name: a, address: 1, position: { x: 0.0, y: 0.0, z: 0.0 } }
  - { name: a, address: 2, position: { x: 0.0, y: 0.0, z: 0.0 } }
"#;
        assert!(matches!(
            load_model_from_str(dup_name),
            Err(ModelError::DuplicateNode(_))
        ));

        let dup_address = r#"
nodes:
  - { name: a, address: 1, position: { x: 0.0, y: 0.0, z: 0.0 } }
  - { name: b, address: 1, position: { x: 0.0, y: 0.0, z: 0.0 } }
"#;
        assert!(matches!(
            load_model_from_str(dup_address),
            Err(ModelError::DuplicateAddress { address: 1, .. })
        ));

        let broadcast = "nodes:\n  - { name: a, address: 255, position: { x: 0.0, y: 0.0, z: 0.0 } }\n";
        assert!(matches!(
            load_model_from_str(broadcast),
            Err(ModelError::InvalidConfig(_))
        ));

        let unknown = r#"
nodes:
  - name: a
    address: 1
    position: { x: 0.0, y: 0.0, z: 0.0 }
    traffic: { destination: nobody }
"#;
        assert!(matches!(
            load_model_from_str(unknown),
            Err(ModelError::UnknownDestination { .. })
        ));

        let missing = "nodes:\n  - { name: a, address: 1 }\n";
        assert!(matches!(
            load_model_from_str(missing),
            Err(ModelError::MissingField { field: "position", .. })
        ));
    }

    #[test]
    fn test_invalid_parameters() {
        for defaults in [
            "defaults:\n  modem:\n    num_channels: 1\n",
            "defaults:\n  modem:\n    data_rate_bps: 0\n",
            "defaults:\n  mac:\n    cw_min: 6\n    cw_max: 4\n",
            "defaults:\n  mac:\n    cw_max: 20\n",
            "defaults:\n  mac:\n    rts_channel_count: 9\n",
        ] {
            let yaml = format!(
                "{}nodes:\n  - {{ name: a, address: 1, position: {{ x: 0.0, y: 0.0, z: 0.0 }} }}\n",
                defaults
            );
            assert!(
                matches!(load_model_from_str(&yaml), Err(ModelError::InvalidConfig(_))),
                "accepted {}",
                defaults
            );
        }
    }

    #[test]
    fn test_unknown_field_rejected() {
        let yaml = "nodes:\n  - { name: a, address: 1, position: { x: 0.0, y: 0.0, z: 0.0 }, colour: red }\n";
        assert!(matches!(
            load_model_from_str(yaml),
            Err(ModelError::YamlError(_))
        ));
    }

    #[test]
    fn test_build_simulation() {
        let model = load_model_from_str(BASE).unwrap();
        let built = build_simulation(&model).unwrap();

        // Medium plus three entities per node.
        assert_eq!(built.entities.len(), 7);
        assert!(built.entities.get(MEDIUM_ENTITY).is_some());
        assert_eq!(built.link_model.len(), 2);

        let alpha = &built.node_infos[0];
        assert_eq!(alpha.name, "alpha");
        assert_eq!(
            (alpha.modem_entity_id, alpha.mac_entity_id, alpha.agent_entity_id),
            (1, 2, 3)
        );
        assert!(alpha.sends_traffic);
        assert!(!built.node_infos[1].sends_traffic);

        assert_eq!(built.initial_events.len(), 1);
        let startup = &built.initial_events[0];
        assert_eq!(startup.targets, vec![EntityId(3)]);
        assert_eq!(startup.time, SimTime::ZERO);
        assert!(matches!(
            startup.payload,
            EventPayload::Timer { timer_id: cumac_agents::TIMER_STARTUP }
        ));
    }
}
