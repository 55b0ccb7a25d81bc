use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;

use crate::config::BackendKind;

/// Metric name to a number, string or nested object.
pub type Metrics = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Ok,
    Degraded,
    Stub,
    Unavailable,
    Error,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Ok => "ok",
            RunStatus::Degraded => "degraded",
            RunStatus::Stub => "stub",
            RunStatus::Unavailable => "unavailable",
            RunStatus::Error => "error",
        }
    }

    pub fn is_ok(self) -> bool {
        self == RunStatus::Ok
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one backend invocation.
///
/// Built once inside the dispatcher. The only later mutation is tagging
/// `dataset_id` when the run belongs to an ensemble.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: String,
    pub status: RunStatus,
    pub reason: Option<String>,
    pub metrics: Metrics,
    pub log_path: PathBuf,
    pub results_path: PathBuf,
    pub backend: BackendKind,
    pub scenario: String,
    pub seed: u64,
    pub git_commit: Option<String>,
    pub config_hash: String,
    pub dataset_id: Option<String>,
}

impl RunResult {
    pub fn metrics_path(&self) -> PathBuf {
        self.results_path.join("metrics.json")
    }

    pub fn timeseries_path(&self) -> PathBuf {
        self.results_path.join("timeseries.json")
    }

    pub fn metric_f64(&self, key: &str) -> Option<f64> {
        self.metrics.get(key).and_then(Value::as_f64)
    }
}
