//! FINALIZE: the artifacts every run leaves behind.

use anyhow::{Context, Result};
use lab_analysis::{compute_run_metrics, evaluate_derived, MetricsOptions};
use lab_core::{
    append_line, atomic_write_json_pretty, canonical_json_digest, ensure_dir, BackendKind,
    RunConfig, RunResult, RunStatus,
};
use serde_json::Value;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use crate::ScenarioOutput;

pub const METRICS_FILE: &str = "metrics.json";
pub const TIMESERIES_FILE: &str = "timeseries.json";
pub const PATTERNS_FILE: &str = "patterns.json";

/// Per-run paths and identity, opened at INIT.
pub struct RunContext<'a> {
    pub run_id: &'a str,
    pub kind: BackendKind,
    pub scenario: &'a str,
    pub config: &'a RunConfig,
    log_path: PathBuf,
    result_dir: PathBuf,
}

impl<'a> RunContext<'a> {
    /// Creates the result directory and writes the log header.
    pub fn open(
        run_id: &'a str,
        kind: BackendKind,
        scenario: &'a str,
        config: &'a RunConfig,
        log_path: &Path,
        result_dir: &Path,
    ) -> Result<Self> {
        ensure_dir(result_dir)?;
        let ctx = Self {
            run_id,
            kind,
            scenario,
            config,
            log_path: log_path.to_path_buf(),
            result_dir: result_dir.to_path_buf(),
        };
        ctx.log("run_id", run_id)?;
        ctx.log("backend", kind.as_str())?;
        ctx.log("scenario", scenario)?;
        ctx.log("seed", &config.seed.to_string())?;
        ctx.log("config", &serde_json::to_string(&config.to_value())?)?;
        tracing::info!(run_id, backend = %kind, scenario, seed = config.seed, "run started");
        Ok(ctx)
    }

    pub fn log(&self, key: &str, value: &str) -> Result<()> {
        append_line(&self.log_path, &format!("{key}={value}"))
            .with_context(|| format!("writing run log {}", self.log_path.display()))
    }

    /// Merges metrics and persists everything. `metrics.json` is written
    /// before any other artifact.
    pub fn finalize(self, out: ScenarioOutput) -> Result<RunResult> {
        let opts = MetricsOptions::from(self.config);
        let mut metrics = compute_run_metrics(&out.timeseries, &opts);
        metrics.extend(out.summary);
        metrics.insert("backend".into(), Value::from(self.kind.as_str()));
        metrics.insert("scenario".into(), Value::from(self.scenario));
        metrics.insert("seed".into(), Value::from(self.config.seed));
        if !self.config.derived_metrics.is_empty() {
            let derived = evaluate_derived(&metrics, &self.config.derived_metrics);
            metrics.extend(derived);
        }
        metrics.insert("status".into(), Value::from(out.status.as_str()));
        if let Some(reason) = &out.reason {
            metrics.insert("reason".into(), Value::from(reason.as_str()));
        }
        if let Some(note) = &out.note {
            metrics.insert("note".into(), Value::from(note.as_str()));
        }

        atomic_write_json_pretty(
            &self.result_dir.join(METRICS_FILE),
            &Value::Object(metrics.clone()),
        )?;
        out.timeseries.save(&self.result_dir.join(TIMESERIES_FILE))?;
        if let Some(patterns) = &out.patterns {
            atomic_write_json_pretty(
                &self.result_dir.join(PATTERNS_FILE),
                &serde_json::to_value(patterns)?,
            )?;
        }

        self.log("status", out.status.as_str())?;
        if let Some(reason) = &out.reason {
            self.log("reason", reason)?;
        }
        self.log("summary", &serde_json::to_string(&metrics)?)?;

        match out.status {
            RunStatus::Ok => {
                tracing::info!(run_id = self.run_id, status = %out.status, "run finished")
            }
            _ => tracing::warn!(
                run_id = self.run_id,
                status = %out.status,
                reason = out.reason.as_deref().unwrap_or(""),
                "run finished without ok status"
            ),
        }

        Ok(RunResult {
            run_id: self.run_id.to_string(),
            status: out.status,
            reason: out.reason,
            metrics,
            log_path: self.log_path,
            results_path: self.result_dir,
            backend: self.kind,
            scenario: self.scenario.to_string(),
            seed: self.config.seed,
            git_commit: None,
            config_hash: canonical_json_digest(&self.config.to_value()),
            dataset_id: None,
        })
    }
}

/// Runs a scenario body, turning errors and panics into `status=error`.
pub fn guarded<F>(body: F) -> ScenarioOutput
where
    F: FnOnce() -> Result<ScenarioOutput>,
{
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(out)) => out,
        Ok(Err(err)) => ScenarioOutput::failed(RunStatus::Error, format!("{err:#}")),
        Err(payload) => ScenarioOutput::failed(
            RunStatus::Error,
            format!("scenario panicked: {}", panic_message(payload.as_ref())),
        ),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::temp_root;
    use lab_core::Timeseries;
    use serde_json::json;

    #[test]
    fn panicking_scenario_still_writes_metrics() {
        let root = temp_root("panic");
        let cfg = RunConfig::default();
        let ctx = RunContext::open(
            "r1",
            BackendKind::Classical,
            "baseline_layer",
            &cfg,
            &root.join("r1.log"),
            &root.join("r1"),
        )
        .expect("open");
        let out = guarded(|| panic!("numeric edge case"));
        let result = ctx.finalize(out).expect("finalize");
        assert_eq!(result.status, RunStatus::Error);
        assert!(result.reason.as_deref().unwrap_or("").contains("numeric edge case"));
        let text = std::fs::read_to_string(result.metrics_path()).expect("metrics.json");
        let v: Value = serde_json::from_str(&text).expect("valid json");
        assert_eq!(v["status"], json!("error"));
        assert!(result.timeseries_path().exists());
        let log = std::fs::read_to_string(root.join("r1.log")).expect("log");
        assert!(log.starts_with("run_id=r1\nbackend=classical\n"));
        assert!(log.contains("status=error"));
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn summary_overrides_channel_metrics_and_derived_are_merged() {
        let root = temp_root("merge");
        let mut cfg = RunConfig::default();
        cfg.derived_metrics
            .insert("double_max".into(), "stress_max * 2".into());
        let ctx = RunContext::open(
            "r2",
            BackendKind::Classical,
            "baseline_layer",
            &cfg,
            &root.join("r2.log"),
            &root.join("r2"),
        )
        .expect("open");
        let mut ts = Timeseries::new();
        ts.insert("stress", vec![0.1, 0.4]).expect("insert");
        let mut summary = lab_core::Metrics::new();
        summary.insert("anomaly_mean".into(), json!(0.75));
        let result = ctx
            .finalize(ScenarioOutput::ok(summary, ts))
            .expect("finalize");
        assert_eq!(result.metrics["stress_max"], json!(0.4));
        assert_eq!(result.metrics["double_max"], json!(0.8));
        assert_eq!(result.metrics["anomaly_mean"], json!(0.75));
        assert_eq!(result.metrics["status"], json!("ok"));
        assert!(result.config_hash.starts_with("sha256:"));
        let _ = std::fs::remove_dir_all(root);
    }
}
