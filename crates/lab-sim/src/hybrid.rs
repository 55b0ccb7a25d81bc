//! Classical drift with periodic quantum probes feeding back into it.

use anyhow::Result;
use lab_core::{BackendKind, Metrics, RunConfig, RunResult, RunStatus, Timeseries};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::path::Path;

use crate::artifacts::{guarded, RunContext};
use crate::engine::QuantumEngine;
use crate::quantum::{anomaly_proxy, layer_to_circuit};
use crate::{clip01, put, scenario_name, Backend, ScenarioOutput};

const DEFAULT_SCENARIO: &str = "hybrid_cycle";

pub struct HybridBackend {
    engine: Box<dyn QuantumEngine>,
}

impl HybridBackend {
    pub fn new(engine: Box<dyn QuantumEngine>) -> Self {
        Self { engine }
    }
}

impl Backend for HybridBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Hybrid
    }

    /// The classical half always runs.
    fn is_available(&self) -> bool {
        true
    }

    fn default_scenario(&self) -> &'static str {
        DEFAULT_SCENARIO
    }

    fn run(
        &self,
        run_id: &str,
        config: &RunConfig,
        log_path: &Path,
        result_dir: &Path,
    ) -> Result<RunResult> {
        let scenario = scenario_name(config, DEFAULT_SCENARIO);
        let ctx = RunContext::open(run_id, self.kind(), &scenario, config, log_path, result_dir)?;
        let out = if scenario != DEFAULT_SCENARIO {
            ScenarioOutput::unknown_scenario(&scenario)
        } else {
            guarded(|| hybrid_cycle(self.engine.as_ref(), config))
        };
        ctx.finalize(out)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Probe {
    mean_z: f64,
    entropy: f64,
    proxy: f64,
}

fn hybrid_cycle(engine: &dyn QuantumEngine, cfg: &RunConfig) -> Result<ScenarioOutput> {
    let q = &cfg.quantum;
    let every = cfg.hybrid.probe_every.max(1);
    let gain = cfg.hybrid.feedback_gain;
    let live = engine.is_available();
    let mut rng = StdRng::seed_from_u64(cfg.seed);

    let (mut stress, mut protection, mut novelty) = (0.2, 0.8, 0.1);
    let mut held = Probe::default();
    let mut n_probes = 0usize;
    let n = cfg.horizon;
    let mut ch: [Vec<f64>; 8] = Default::default();

    for step in 0..n {
        stress = clip01(stress + 0.03 * rng.sample::<f64, _>(StandardNormal));
        protection = clip01(protection + 0.02 * rng.sample::<f64, _>(StandardNormal));
        novelty = clip01(novelty + 0.05 * rng.sample::<f64, _>(StandardNormal));

        let probing = step % every == 0;
        if probing {
            n_probes += 1;
            held = if live {
                let seed = cfg.seed.wrapping_add(step as u64);
                let circuit = layer_to_circuit(
                    stress,
                    novelty,
                    1.0 - protection,
                    q.n_qubits,
                    q.circuit_depth,
                    seed,
                );
                let run = engine.run_circuit(&circuit, q.shots, seed)?;
                let mean_z = run.mean_expectation();
                let entropy = run.sampled_entropy();
                Probe {
                    mean_z,
                    entropy,
                    proxy: anomaly_proxy(mean_z, entropy, q.n_qubits),
                }
            } else {
                Probe::default()
            };
            stress = clip01(stress + gain * held.proxy);
            protection = clip01(protection - gain * held.proxy);
        }

        let row = [
            step as f64 * cfg.dt,
            stress,
            protection,
            novelty,
            held.mean_z,
            held.entropy,
            held.proxy,
            if probing { 1.0 } else { 0.0 },
        ];
        for (c, v) in ch.iter_mut().zip(row) {
            c.push(v);
        }
    }

    let mut summary = Metrics::new();
    put(&mut summary, "engine", engine.name());
    put(&mut summary, "n_probes", n_probes);
    put(&mut summary, "probe_every", every);
    put(&mut summary, "feedback_gain", gain);

    let mut ts = Timeseries::new();
    let names = [
        "t",
        "stress",
        "protection",
        "novelty",
        "expectation_mean",
        "entropy",
        "anomaly_proxy",
        "probe",
    ];
    for (name, samples) in names.into_iter().zip(ch) {
        ts.insert(name, samples)?;
    }

    let mut out = ScenarioOutput::ok(summary, ts);
    if !live {
        out.status = RunStatus::Degraded;
        out.reason = Some(
            engine
                .unavailable_reason()
                .unwrap_or("quantum engine unavailable")
                .to_string(),
        );
        out.note = Some("probe channels hold neutral values".to_string());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{engine_for, StatevectorEngine, UnavailableEngine};
    use crate::test_support::temp_root;
    use lab_analysis::mean;
    use serde_json::Value;

    fn config(gain: f64) -> RunConfig {
        let mut cfg = RunConfig {
            horizon: 30,
            ..RunConfig::default()
        };
        cfg.hybrid.feedback_gain = gain;
        cfg
    }

    #[test]
    fn probes_follow_the_configured_period() {
        let out = hybrid_cycle(&StatevectorEngine, &config(0.1)).expect("cycle");
        assert_eq!(out.status, RunStatus::Ok);
        let probe = out.timeseries.get("probe").expect("probe");
        assert_eq!(probe.iter().filter(|p| **p == 1.0).count(), 6);
        assert_eq!(out.summary["n_probes"], Value::from(6));
    }

    #[test]
    fn feedback_raises_stress() {
        let quiet = hybrid_cycle(&StatevectorEngine, &config(0.0)).expect("quiet");
        let loud = hybrid_cycle(&StatevectorEngine, &config(0.5)).expect("loud");
        let s0 = mean(quiet.timeseries.get("stress").expect("stress"));
        let s1 = mean(loud.timeseries.get("stress").expect("stress"));
        assert!(s1 > s0, "feedback should push stress up ({s1} <= {s0})");
    }

    #[test]
    fn missing_engine_degrades_with_neutral_probes() {
        let engine = UnavailableEngine {
            reason: "disabled".into(),
        };
        let out = hybrid_cycle(&engine, &config(0.1)).expect("cycle");
        assert_eq!(out.status, RunStatus::Degraded);
        assert_eq!(out.reason.as_deref(), Some("disabled"));
        for ch in ["expectation_mean", "entropy", "anomaly_proxy"] {
            assert!(out.timeseries.get(ch).expect(ch).iter().all(|v| *v == 0.0));
        }
        assert_eq!(out.timeseries.get("stress").expect("stress").len(), 30);
    }

    #[test]
    fn degraded_run_writes_metrics() {
        let root = temp_root("hybrid_degraded");
        let mut cfg = config(0.1);
        cfg.quantum.engine = "none".into();
        let backend = HybridBackend::new(engine_for(&cfg.quantum));
        let result = backend
            .run("h1", &cfg, &root.join("h1.log"), &root.join("h1"))
            .expect("run");
        assert_eq!(result.status, RunStatus::Degraded);
        assert_eq!(result.metrics["status"], Value::from("degraded"));
        assert!(result.metrics_path().exists());
        let _ = std::fs::remove_dir_all(root);
    }
}
