//! Run configuration.
//!
//! A config file is an arbitrary JSON (or YAML) object. Recognized keys map
//! onto the fields below; anything else lands in [`RunConfig::extra`] and is
//! carried along untouched, so older binaries accept newer files.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("json_pointer must start with '/': {0}")]
    BadPointer(String),
    #[error("json_pointer token '{token}' is not a valid array index in {pointer}")]
    BadIndex { token: String, pointer: String },
    #[error("json_pointer traversal hit non-container at '{token}' in {pointer}")]
    NotContainer { token: String, pointer: String },
    #[error("override '{name}' produced an invalid config: {source}")]
    Invalid {
        name: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("unknown backend '{0}' (expected classical, quantum or hybrid)")]
    UnknownBackend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Classical,
    Quantum,
    Hybrid,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Classical => "classical",
            BackendKind::Quantum => "quantum",
            BackendKind::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "classical" => Ok(BackendKind::Classical),
            "quantum" => Ok(BackendKind::Quantum),
            "hybrid" => Ok(BackendKind::Hybrid),
            other => Err(ConfigError::UnknownBackend(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnsembleMode {
    #[default]
    Repeat,
    Sweep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    #[default]
    LocalSequential,
    LocalParallel,
}

impl ExecutorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutorKind::LocalSequential => "local_sequential",
            ExecutorKind::LocalParallel => "local_parallel",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    pub enabled: bool,
    pub mode: EnsembleMode,
    pub n_runs: usize,
    /// Field name (or dotted path) to candidate values, in declaration order.
    pub param_grid: IndexMap<String, Vec<Value>>,
    pub description: String,
    pub dataset_id: Option<String>,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: EnsembleMode::Repeat,
            n_runs: 1,
            param_grid: IndexMap::new(),
            description: String::new(),
            dataset_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    #[serde(rename = "type")]
    pub kind: ExecutorKind,
    pub max_workers: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            kind: ExecutorKind::LocalSequential,
            max_workers: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantumConfig {
    /// `statevector` or `none`.
    pub engine: String,
    pub n_qubits: usize,
    pub circuit_depth: usize,
    pub shots: usize,
    /// Preparation angle of the state walked down the swap chain.
    pub theta: f64,
    /// Standard deviation of the phase kick applied after every swap.
    pub phase_noise: f64,
}

impl Default for QuantumConfig {
    fn default() -> Self {
        Self {
            engine: "statevector".to_string(),
            n_qubits: 3,
            circuit_depth: 1,
            shots: 512,
            theta: std::f64::consts::FRAC_PI_3,
            phase_noise: 0.05,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridConfig {
    pub probe_every: usize,
    pub feedback_gain: f64,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            probe_every: 5,
            feedback_gain: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Substrate {
    pub name: String,
    pub noise: f64,
}

fn default_substrates() -> Vec<Substrate> {
    [
        ("silicon", 0.02),
        ("photonic", 0.05),
        ("neural", 0.08),
        ("quantum", 0.12),
    ]
    .into_iter()
    .map(|(name, noise)| Substrate {
        name: name.to_string(),
        noise,
    })
    .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub internal_dim: usize,
    pub self_model_dim: usize,
    pub grid_size: usize,
    /// Size of the gridworld the pattern is transferred into.
    pub transfer_grid_size: usize,
    pub max_steps: usize,
    pub copy_horizon: usize,
    pub transfer_horizon: usize,
    /// Isotropic noise added to the snapshot before it is loaded elsewhere.
    pub transfer_noise: f64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            internal_dim: 16,
            self_model_dim: 8,
            grid_size: 10,
            transfer_grid_size: 14,
            max_steps: 50,
            copy_horizon: 30,
            transfer_horizon: 30,
            transfer_noise: 0.01,
        }
    }
}

/// Shape and dynamics of the 2D multi-agent world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    pub width: usize,
    pub height: usize,
    pub n_agents: usize,
    pub obstacle_ratio: f64,
    pub resource_ratio: f64,
    pub portal_ratio: f64,
    /// Per-cell, per-step probability that a depleted cell refills.
    pub respawn_prob: f64,
    /// Half-width of the square window each agent observes.
    pub view_radius: usize,
    /// Neighbor weight of the 5-point diffusion stencil, in `[0, 0.25]`.
    pub diffusion: f64,
    pub stress_decay: f64,
    /// Stress an agent leaves on its cell every step.
    pub stress_deposit: f64,
    /// Most resource one agent takes from its cell per step.
    pub harvest_rate: f64,
    pub policy_temperature: f64,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            width: 16,
            height: 16,
            n_agents: 6,
            obstacle_ratio: 0.1,
            resource_ratio: 0.2,
            portal_ratio: 0.02,
            respawn_prob: 0.01,
            view_radius: 1,
            diffusion: 0.05,
            stress_decay: 0.97,
            stress_deposit: 0.2,
            harvest_rate: 0.5,
            policy_temperature: 1.0,
        }
    }
}

/// Parameters of one run. Every ensemble member owns its own deep copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub backend: Option<BackendKind>,
    pub scenario: Option<String>,
    pub seed: u64,
    pub horizon: usize,
    pub dt: f64,
    pub layer_id: String,

    pub inject_step: Option<usize>,
    pub anomaly_level: f64,
    pub detection_threshold: f64,
    pub critical_value: f64,
    pub load_rate: f64,
    pub depletion_rate: f64,
    pub recovery: bool,
    pub recovery_rate: f64,
    pub substrates: Vec<Substrate>,
    pub continuity_threshold: f64,

    pub agent: AgentConfig,
    pub world: WorldConfig,
    pub quantum: QuantumConfig,
    pub hybrid: HybridConfig,
    pub ensemble: EnsembleConfig,
    pub executor: ExecutorConfig,
    pub derived_metrics: BTreeMap<String, String>,

    pub logs_dir: String,
    pub results_dir: String,
    pub datasets_dir: String,
    pub registry_path: String,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            backend: None,
            scenario: None,
            seed: 42,
            horizon: 50,
            dt: 1.0,
            layer_id: "Lk".to_string(),
            inject_step: None,
            anomaly_level: 0.8,
            detection_threshold: 0.5,
            critical_value: 0.8,
            load_rate: 0.05,
            depletion_rate: 0.04,
            recovery: true,
            recovery_rate: 0.15,
            substrates: default_substrates(),
            continuity_threshold: 0.7,
            agent: AgentConfig::default(),
            world: WorldConfig::default(),
            quantum: QuantumConfig::default(),
            hybrid: HybridConfig::default(),
            ensemble: EnsembleConfig::default(),
            executor: ExecutorConfig::default(),
            derived_metrics: BTreeMap::new(),
            logs_dir: "lab/logs".to_string(),
            results_dir: "lab/results".to_string(),
            datasets_dir: "lab/datasets".to_string(),
            registry_path: "lab/runs.jsonl".to_string(),
            extra: Map::new(),
        }
    }
}

impl RunConfig {
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }

    pub fn backend_or(&self, fallback: BackendKind) -> BackendKind {
        self.backend.unwrap_or(fallback)
    }

    /// Returns a copy with `name` set to `value`. `name` is a top-level field,
    /// a dotted path (`quantum.shots`) or a JSON pointer (`/quantum/shots`).
    pub fn with_override(&self, name: &str, value: Value) -> Result<Self, ConfigError> {
        let mut root = self.to_value();
        set_json_pointer_value(&mut root, &override_pointer(name), value)?;
        serde_json::from_value(root).map_err(|source| ConfigError::Invalid {
            name: name.to_string(),
            source,
        })
    }
}

pub fn override_pointer(name: &str) -> String {
    if name.starts_with('/') {
        return name.to_string();
    }
    let mut pointer = String::new();
    for part in name.split('.') {
        pointer.push('/');
        pointer.push_str(&part.replace('~', "~0").replace('/', "~1"));
    }
    pointer
}

fn decode_pointer_token(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

/// Writes `new_value` at `pointer`, creating intermediate objects.
pub fn set_json_pointer_value(
    root: &mut Value,
    pointer: &str,
    new_value: Value,
) -> Result<(), ConfigError> {
    if pointer.is_empty() || pointer == "/" {
        *root = new_value;
        return Ok(());
    }
    if !pointer.starts_with('/') {
        return Err(ConfigError::BadPointer(pointer.to_string()));
    }
    let mut tokens: Vec<String> = pointer
        .split('/')
        .skip(1)
        .map(decode_pointer_token)
        .collect();
    let Some(last) = tokens.pop() else {
        *root = new_value;
        return Ok(());
    };

    let mut cur = root;
    for token in &tokens {
        cur = match cur {
            Value::Object(map) => map.entry(token.clone()).or_insert_with(|| json!({})),
            Value::Array(arr) => {
                let idx = parse_index(token, pointer, arr.len())?;
                &mut arr[idx]
            }
            _ => {
                return Err(ConfigError::NotContainer {
                    token: token.clone(),
                    pointer: pointer.to_string(),
                })
            }
        };
    }

    match cur {
        Value::Object(map) => {
            map.insert(last, new_value);
            Ok(())
        }
        Value::Array(arr) => {
            let idx = parse_index(&last, pointer, arr.len())?;
            arr[idx] = new_value;
            Ok(())
        }
        _ => Err(ConfigError::NotContainer {
            token: last,
            pointer: pointer.to_string(),
        }),
    }
}

fn parse_index(token: &str, pointer: &str, len: usize) -> Result<usize, ConfigError> {
    token
        .parse::<usize>()
        .ok()
        .filter(|idx| *idx < len)
        .ok_or_else(|| ConfigError::BadIndex {
            token: token.to_string(),
            pointer: pointer.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_yields_defaults() {
        let cfg = RunConfig::from_value(json!({})).expect("empty config");
        assert_eq!(cfg, RunConfig::default());
        assert_eq!(cfg.seed, 42);
        assert_eq!(cfg.executor.max_workers, 4);
    }

    #[test]
    fn unknown_keys_are_kept_in_extra() {
        let cfg = RunConfig::from_value(json!({
            "seed": 7,
            "future_knob": {"x": 1},
            "quantum": {"shots": 64}
        }))
        .expect("config");
        assert_eq!(cfg.seed, 7);
        assert_eq!(cfg.quantum.shots, 64);
        assert_eq!(cfg.quantum.n_qubits, 3);
        assert_eq!(cfg.extra.get("future_knob"), Some(&json!({"x": 1})));
        let back = cfg.to_value();
        assert_eq!(back.pointer("/future_knob/x"), Some(&json!(1)));
    }

    #[test]
    fn executor_type_and_backend_parse_from_wire_names() {
        let cfg = RunConfig::from_value(json!({
            "backend": "hybrid",
            "executor": {"type": "local_parallel", "max_workers": 2},
            "ensemble": {"enabled": true, "mode": "sweep", "param_grid": {"b": [1], "a": [2]}}
        }))
        .expect("config");
        assert_eq!(cfg.backend, Some(BackendKind::Hybrid));
        assert_eq!(cfg.executor.kind, ExecutorKind::LocalParallel);
        assert_eq!(cfg.ensemble.mode, EnsembleMode::Sweep);
        let keys: Vec<&String> = cfg.ensemble.param_grid.keys().collect();
        assert_eq!(keys, vec!["b", "a"], "grid keeps declaration order");
    }

    #[test]
    fn with_override_supports_dotted_paths() {
        let cfg = RunConfig::default();
        let swept = cfg
            .with_override("quantum.shots", json!(128))
            .expect("override");
        assert_eq!(swept.quantum.shots, 128);
        let seeded = cfg.with_override("seed", json!(9)).expect("override");
        assert_eq!(seeded.seed, 9);
        assert_eq!(cfg.seed, 42, "template stays untouched");
        let extra = cfg.with_override("mystery", json!("v")).expect("override");
        assert_eq!(extra.extra.get("mystery"), Some(&json!("v")));
    }

    #[test]
    fn with_override_rejects_type_mismatch() {
        let err = RunConfig::default()
            .with_override("horizon", json!("long"))
            .expect_err("string horizon must fail");
        assert!(err.to_string().contains("horizon"), "{}", err);
    }

    #[test]
    fn backend_kind_round_trips_names() {
        for kind in [BackendKind::Classical, BackendKind::Quantum, BackendKind::Hybrid] {
            assert_eq!(kind.as_str().parse::<BackendKind>().expect("parse"), kind);
        }
        assert!("analog".parse::<BackendKind>().is_err());
    }
}
