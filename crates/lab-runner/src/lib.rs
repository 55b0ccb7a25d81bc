//! Run dispatcher, ensemble executor and run registry.
//!
//! A [`Runner`] is anchored at a lab root; every relative directory in a
//! config (`logs_dir`, `results_dir`, `datasets_dir`, `registry_path`)
//! resolves against it.

mod ensemble;
mod registry;

pub use ensemble::{expand_ensemble, expand_members, Member};
pub use registry::{RunRecord, RunRegistry};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use lab_analysis::compute_ensemble_summary;
use lab_core::{
    atomic_write_json_pretty, canonical_json_digest, ensure_dir, short_digest, BackendKind,
    EnsembleMode, ExecutorKind, Metrics, RunConfig, RunResult, RunStatus,
};
use lab_provenance::{default_provenance, git_commit, write_provenance};
use lab_sim::backend_for;
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

pub const DATASET_MANIFEST_FILE: &str = "dataset_manifest.json";
pub const ENSEMBLE_METRICS_FILE: &str = "ensemble_metrics.json";
pub const DATASET_MANIFEST_SCHEMA: &str = "dataset_manifest_v1";
const RUN_ID_LEN: usize = 12;

static RUN_SEQ: AtomicU64 = AtomicU64::new(0);

/// Reads a `.json`, `.yaml` or `.yml` run config.
pub fn try_load_config(path: &Path) -> Result<RunConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    let value: Value = if ext == "yaml" || ext == "yml" {
        let yaml_value: serde_yaml::Value = serde_yaml::from_str(&raw)?;
        serde_json::to_value(yaml_value)?
    } else {
        serde_json::from_str(&raw)?
    };
    if !value.is_object() {
        return Err(anyhow!("config root must be an object"));
    }
    Ok(RunConfig::from_value(value)?)
}

/// Like [`try_load_config`], but a missing or malformed file yields the
/// defaults. The failure is logged.
pub fn load_config(path: &Path) -> RunConfig {
    match try_load_config(path) {
        Ok(cfg) => cfg,
        Err(err) => {
            let error = format!("{err:#}");
            tracing::warn!(
                path = %path.display(),
                error = %error,
                "config unreadable, falling back to defaults"
            );
            RunConfig::default()
        }
    }
}

/// Unique per call, even for identical inputs.
pub fn new_run_id(config_path: &str, seed: u64, backend: BackendKind) -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let seq = RUN_SEQ.fetch_add(1, Ordering::Relaxed);
    short_digest(
        &format!("{config_path}-{seed}-{backend}-{nanos}-{seq}"),
        RUN_ID_LEN,
    )
}

pub fn new_dataset_id() -> String {
    format!(
        "ds_{}_{:08x}",
        Utc::now().format("%Y%m%d_%H%M%S"),
        rand::random::<u32>()
    )
}

fn mode_name(mode: EnsembleMode) -> &'static str {
    match mode {
        EnsembleMode::Repeat => "repeat",
        EnsembleMode::Sweep => "sweep",
    }
}

pub struct EnsembleOutcome {
    /// `None` when the ensemble was disabled and a single run was made.
    pub dataset_id: Option<String>,
    pub runs: Vec<RunResult>,
    pub manifest_path: Option<PathBuf>,
    pub summary_path: Option<PathBuf>,
}

impl EnsembleOutcome {
    pub fn any_error(&self) -> bool {
        self.runs.iter().any(|r| r.status == RunStatus::Error)
    }
}

#[derive(Debug, Clone)]
pub struct PlannedRun {
    pub index: usize,
    pub seed: u64,
    pub overrides: Metrics,
}

#[derive(Debug, Clone)]
pub struct EnsemblePlan {
    pub backend: BackendKind,
    pub scenario: String,
    pub ensemble_enabled: bool,
    pub mode: &'static str,
    pub executor: ExecutorKind,
    pub max_workers: usize,
    pub config_hash: String,
    pub runs: Vec<PlannedRun>,
}

pub struct Runner {
    root: PathBuf,
    git: OnceLock<Option<String>>,
}

impl Runner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            git: OnceLock::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, dir: &str) -> PathBuf {
        let p = Path::new(dir);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.root.join(p)
        }
    }

    /// Checked-out commit of the lab root, looked up once.
    pub fn git_commit(&self) -> Option<String> {
        self.git.get_or_init(|| git_commit(&self.root)).clone()
    }

    pub fn registry(&self, config: &RunConfig) -> RunRegistry {
        RunRegistry::new(self.resolve(&config.registry_path))
    }

    /// One run under `results_dir/{run_id}`.
    pub fn run_config(&self, config: &RunConfig, config_path: &str) -> Result<RunResult> {
        let results_root = self.resolve(&config.results_dir);
        self.run_member(config, config_path, &results_root, None)
    }

    fn run_member(
        &self,
        config: &RunConfig,
        config_path: &str,
        results_root: &Path,
        dataset_id: Option<&str>,
    ) -> Result<RunResult> {
        let kind = config.backend_or(BackendKind::Classical);
        let run_id = new_run_id(config_path, config.seed, kind);
        let logs_dir = self.resolve(&config.logs_dir);
        ensure_dir(&logs_dir)?;
        let log_path = logs_dir.join(format!("{run_id}.log"));
        let result_dir = results_root.join(&run_id);

        let backend = backend_for(kind, config);
        let mut result = backend
            .run(&run_id, config, &log_path, &result_dir)
            .with_context(|| format!("run {run_id} ({kind})"))?;
        result.git_commit = self.git_commit();
        result.dataset_id = dataset_id.map(str::to_string);

        write_provenance(
            &result_dir,
            &default_provenance(&run_id, &result.config_hash, result.git_commit.clone()),
        )?;
        self.registry(config)
            .add(&RunRecord::from_result(&result, config_path))?;
        Ok(result)
    }

    /// Expands and executes the ensemble, then writes the dataset manifest
    /// and ensemble metrics. A disabled ensemble is a plain single run.
    pub fn run_ensemble(&self, config: &RunConfig, config_path: &str) -> Result<EnsembleOutcome> {
        if !config.ensemble.enabled {
            let run = self.run_config(config, config_path)?;
            return Ok(EnsembleOutcome {
                dataset_id: None,
                runs: vec![run],
                manifest_path: None,
                summary_path: None,
            });
        }

        let members = expand_members(config)?;
        let dataset_id = config
            .ensemble
            .dataset_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(new_dataset_id);
        let results_root = self.resolve(&config.results_dir).join(&dataset_id);
        let dataset_dir = self.resolve(&config.datasets_dir).join(&dataset_id);
        ensure_dir(&results_root)?;
        ensure_dir(&dataset_dir)?;

        tracing::info!(
            dataset_id = %dataset_id,
            runs = members.len(),
            mode = mode_name(config.ensemble.mode),
            executor = config.executor.kind.as_str(),
            "ensemble started"
        );
        let runs = ensemble::execute(members.len(), &config.executor, |i| {
            self.run_member(
                &members[i].config,
                config_path,
                &results_root,
                Some(dataset_id.as_str()),
            )
        })?;

        let entries: Vec<Value> = runs
            .iter()
            .zip(&members)
            .map(|(r, m)| {
                json!({
                    "run_id": r.run_id,
                    "backend": r.backend,
                    "scenario": r.scenario,
                    "seed": r.seed,
                    "status": r.status,
                    "config_hash": r.config_hash,
                    "overrides": m.overrides,
                    "metrics_path": r.metrics_path().display().to_string(),
                    "timeseries_path": r.timeseries_path().display().to_string(),
                })
            })
            .collect();

        let summary_path = dataset_dir.join(ENSEMBLE_METRICS_FILE);
        let metrics: Vec<Metrics> = runs.iter().map(|r| r.metrics.clone()).collect();
        atomic_write_json_pretty(&summary_path, &compute_ensemble_summary(&metrics))?;

        let manifest_path = dataset_dir.join(DATASET_MANIFEST_FILE);
        let manifest = json!({
            "schema_version": DATASET_MANIFEST_SCHEMA,
            "dataset_id": dataset_id,
            "created_at": Utc::now().to_rfc3339(),
            "git_commit": self.git_commit(),
            "description": config.ensemble.description,
            "mode": mode_name(config.ensemble.mode),
            "executor": {
                "type": config.executor.kind.as_str(),
                "max_workers": config.executor.max_workers,
            },
            "config_template": config.to_value(),
            "ensemble_metrics_path": summary_path.display().to_string(),
            "runs": entries,
        });
        atomic_write_json_pretty(&manifest_path, &manifest)?;

        let errors = runs.iter().filter(|r| r.status == RunStatus::Error).count();
        tracing::info!(dataset_id = %dataset_id, runs = runs.len(), errors, "ensemble finished");
        Ok(EnsembleOutcome {
            dataset_id: Some(dataset_id),
            runs,
            manifest_path: Some(manifest_path),
            summary_path: Some(summary_path),
        })
    }

    /// What `run_ensemble` would execute, without running anything.
    pub fn describe(&self, config: &RunConfig) -> Result<EnsemblePlan> {
        let backend = config.backend_or(BackendKind::Classical);
        let scenario = config
            .scenario
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| backend_for(backend, config).default_scenario().to_string());
        let runs = expand_members(config)?
            .into_iter()
            .enumerate()
            .map(|(index, m)| PlannedRun {
                index,
                seed: m.config.seed,
                overrides: m.overrides,
            })
            .collect();
        Ok(EnsemblePlan {
            backend,
            scenario,
            ensemble_enabled: config.ensemble.enabled,
            mode: mode_name(config.ensemble.mode),
            executor: config.executor.kind,
            max_workers: config.executor.max_workers,
            config_hash: canonical_json_digest(&config.to_value()),
            runs,
        })
    }
}
