//! Simulation backends.
//!
//! Every backend follows the same lifecycle: INIT seeds one generator from
//! the run config and opens the run log, STEP appends one clipped sample per
//! active channel, FINALIZE (see [`artifacts`]) writes `timeseries.json`,
//! `metrics.json` and, for classical runs, `patterns.json`. FINALIZE is
//! reached even when a scenario fails or panics.

pub mod artifacts;
mod classical;
pub mod engine;
mod hybrid;
pub mod patterns;
mod quantum;

pub use classical::ClassicalBackend;
pub use engine::{
    engine_for, Circuit, EngineError, Gate, QuantumEngine, QuantumRun, StatevectorEngine,
    UnavailableEngine, MAX_QUBITS,
};
pub use hybrid::HybridBackend;
pub use patterns::{build_population, score_population, Pattern, PatternScore};
pub use quantum::{layer_to_circuit, QuantumBackend};

use anyhow::Result;
use lab_core::{BackendKind, Metrics, RunConfig, RunResult, RunStatus, Timeseries};
use serde_json::Value;
use std::path::Path;

/// One simulation algorithm behind the dispatcher.
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Whether the backend can produce real measurements right now. A backend
    /// that reports `false` still runs, but never returns `status=ok`.
    fn is_available(&self) -> bool;

    fn default_scenario(&self) -> &'static str;

    /// Executes one run. Only failures to persist artifacts come back as
    /// `Err`; everything else is folded into the result's status.
    fn run(
        &self,
        run_id: &str,
        config: &RunConfig,
        log_path: &Path,
        result_dir: &Path,
    ) -> Result<RunResult>;
}

pub fn backend_for(kind: BackendKind, config: &RunConfig) -> Box<dyn Backend> {
    match kind {
        BackendKind::Classical => Box::new(ClassicalBackend::new()),
        BackendKind::Quantum => Box::new(QuantumBackend::new(engine_for(&config.quantum))),
        BackendKind::Hybrid => Box::new(HybridBackend::new(engine_for(&config.quantum))),
    }
}

/// What a scenario hands to FINALIZE.
#[derive(Debug, Clone)]
pub struct ScenarioOutput {
    pub status: RunStatus,
    pub reason: Option<String>,
    pub note: Option<String>,
    pub summary: Metrics,
    pub timeseries: Timeseries,
    pub patterns: Option<Vec<PatternScore>>,
}

impl ScenarioOutput {
    pub fn ok(summary: Metrics, timeseries: Timeseries) -> Self {
        Self {
            status: RunStatus::Ok,
            reason: None,
            note: None,
            summary,
            timeseries,
            patterns: None,
        }
    }

    /// No measurements: only the status and why.
    pub fn failed(status: RunStatus, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: Some(reason.into()),
            note: None,
            summary: Metrics::new(),
            timeseries: Timeseries::new(),
            patterns: None,
        }
    }

    pub fn unknown_scenario(name: &str) -> Self {
        Self::failed(RunStatus::Error, format!("unknown scenario '{name}'"))
    }
}

pub(crate) fn clip01(x: f64) -> f64 {
    x.clamp(0.0, 1.0)
}

pub(crate) fn put(summary: &mut Metrics, key: &str, value: impl Into<Value>) {
    summary.insert(key.to_string(), value.into());
}

pub(crate) fn scenario_name(config: &RunConfig, default: &str) -> String {
    config
        .scenario
        .clone()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}
