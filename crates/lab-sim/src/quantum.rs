//! Toy quantum probes of a layer.

use anyhow::Result;
use lab_analysis::{entanglement_entropy, mean, mutual_information, partial_trace, CMatrix};
use lab_core::{BackendKind, Metrics, QuantumConfig, RunConfig, RunResult, RunStatus, Timeseries};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::f64::consts::{FRAC_PI_2, PI};
use std::path::Path;

use crate::artifacts::{guarded, RunContext};
use crate::engine::{Circuit, Gate, QuantumEngine};
use crate::{clip01, put, scenario_name, Backend, ScenarioOutput};

const DEFAULT_SCENARIO: &str = "layer_stress_probe";
const SCENARIOS: &[&str] = &[
    "layer_stress_probe",
    "entangled_pair",
    "transfer_chain",
    "measurement_collapse",
];

pub struct QuantumBackend {
    engine: Box<dyn QuantumEngine>,
}

impl QuantumBackend {
    pub fn new(engine: Box<dyn QuantumEngine>) -> Self {
        Self { engine }
    }
}

impl Backend for QuantumBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Quantum
    }

    fn is_available(&self) -> bool {
        self.engine.is_available()
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
        let out = if !SCENARIOS.contains(&scenario.as_str()) {
            ScenarioOutput::unknown_scenario(&scenario)
        } else if !self.engine.is_available() {
            unavailable(self.engine.as_ref(), &config.quantum)
        } else {
            guarded(|| simulate(self.engine.as_ref(), &scenario, config))
        };
        ctx.finalize(out)
    }
}

fn unavailable(engine: &dyn QuantumEngine, q: &QuantumConfig) -> ScenarioOutput {
    let reason = engine
        .unavailable_reason()
        .unwrap_or("quantum engine unavailable")
        .to_string();
    let mut out = ScenarioOutput::failed(RunStatus::Unavailable, reason);
    out.note = Some("no circuits were executed; this run carries no measurements".to_string());
    put(&mut out.summary, "engine", q.engine.as_str());
    out
}

fn simulate(engine: &dyn QuantumEngine, scenario: &str, cfg: &RunConfig) -> Result<ScenarioOutput> {
    match scenario {
        "layer_stress_probe" => layer_stress_probe(engine, cfg),
        "entangled_pair" => entangled_pair(engine, cfg),
        "transfer_chain" => transfer_chain(engine, cfg),
        "measurement_collapse" => measurement_collapse(engine, cfg),
        other => Ok(ScenarioOutput::unknown_scenario(other)),
    }
}

fn normal(rng: &mut impl Rng) -> f64 {
    rng.sample(StandardNormal)
}

/// Encodes a layer state as a shallow circuit: stress drives `Ry`, anomaly
/// drives `Rz`, and each depth adds a CX ladder followed by a slightly
/// jittered novelty `Rx` on one qubit.
pub fn layer_to_circuit(
    stress: f64,
    novelty: f64,
    anomaly: f64,
    n_qubits: usize,
    depth: usize,
    seed: u64,
) -> Circuit {
    let mut rng = StdRng::seed_from_u64(seed);
    let ry = clip01(stress) * PI;
    let rz = clip01(anomaly) * FRAC_PI_2;
    let rx = clip01(novelty) * FRAC_PI_2;
    let mut circuit = Circuit::new(n_qubits);
    if n_qubits == 0 {
        return circuit;
    }
    for q in 0..n_qubits {
        circuit.push(Gate::Ry(q, ry)).push(Gate::Rz(q, rz));
    }
    for d in 0..depth {
        for q in 0..n_qubits - 1 {
            circuit.push(Gate::Cx(q, q + 1));
        }
        circuit.push(Gate::Rx(d % n_qubits, rx + 0.05 * normal(&mut rng)));
    }
    circuit
}

/// Probe-derived anomaly estimate in `[0, 1]`.
pub(crate) fn anomaly_proxy(mean_z: f64, entropy: f64, n_qubits: usize) -> f64 {
    let scale = (n_qubits.max(1) as f64).log2().max(1.0);
    clip01(0.5 * (1.0 - mean_z) + 0.5 * entropy / scale)
}

fn layer_stress_probe(engine: &dyn QuantumEngine, cfg: &RunConfig) -> Result<ScenarioOutput> {
    let q = &cfg.quantum;
    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let n = cfg.horizon;
    let (mut t_ch, mut stress_ch, mut novelty_ch) =
        (Vec::with_capacity(n), Vec::with_capacity(n), Vec::with_capacity(n));
    let (mut z_ch, mut entropy_ch, mut proxy_ch) =
        (Vec::with_capacity(n), Vec::with_capacity(n), Vec::with_capacity(n));

    for step in 0..n {
        let t = step as f64 * cfg.dt;
        let base = 0.35 + 0.25 * (0.15 * t).sin();
        let stress = clip01(base + 0.05 * normal(&mut rng));
        let novelty = clip01(0.2 + 0.3 * rng.random::<f64>());
        let anomaly = clip01(0.4 + 0.2 * normal(&mut rng));
        let probe_seed = cfg.seed.wrapping_add(step as u64);
        let circuit = layer_to_circuit(stress, novelty, anomaly, q.n_qubits, q.circuit_depth, probe_seed);
        let run = engine.run_circuit(&circuit, q.shots, probe_seed)?;
        let mean_z = run.mean_expectation();
        let entropy = run.sampled_entropy();

        t_ch.push(t);
        stress_ch.push(stress);
        novelty_ch.push(novelty);
        z_ch.push(mean_z);
        entropy_ch.push(entropy);
        proxy_ch.push(anomaly_proxy(mean_z, entropy, q.n_qubits));
    }

    let mut summary = Metrics::new();
    put(&mut summary, "engine", engine.name());
    put(&mut summary, "shots", q.shots);
    put(&mut summary, "n_qubits", q.n_qubits);
    put(&mut summary, "circuit_depth", q.circuit_depth);
    put(&mut summary, "anomaly_proxy_mean", mean(&proxy_ch));

    let mut ts = Timeseries::new();
    ts.insert("t", t_ch)?;
    ts.insert("stress", stress_ch)?;
    ts.insert("novelty", novelty_ch)?;
    ts.insert("expectation_mean", z_ch)?;
    ts.insert("entropy", entropy_ch)?;
    ts.insert("anomaly_proxy", proxy_ch)?;
    Ok(ScenarioOutput::ok(summary, ts))
}

fn entangled_pair(engine: &dyn QuantumEngine, cfg: &RunConfig) -> Result<ScenarioOutput> {
    let mut circuit = Circuit::new(2);
    circuit.push(Gate::H(0)).push(Gate::Cx(0, 1));
    let run = engine.run_circuit(&circuit, cfg.quantum.shots, cfg.seed)?;

    let mut summary = Metrics::new();
    put(&mut summary, "engine", engine.name());
    put(&mut summary, "z0", run.expectations[0]);
    put(&mut summary, "z1", run.expectations[1]);
    put(
        &mut summary,
        "entanglement_entropy",
        entanglement_entropy(&run.statevector, 2, &[0]),
    );
    put(
        &mut summary,
        "mutual_information",
        mutual_information(&run.statevector, 2, &[0], &[1]),
    );
    put(&mut summary, "counts", serde_json::to_value(&run.counts)?);

    let mut ts = Timeseries::new();
    ts.insert("t", vec![0.0])?;
    ts.insert("expectation_mean", vec![run.mean_expectation()])?;
    ts.insert("entropy", vec![run.sampled_entropy()])?;
    Ok(ScenarioOutput::ok(summary, ts))
}

/// `Tr(rho sigma)`, the fidelity when either state is pure.
fn overlap(rho: &CMatrix, sigma: &CMatrix) -> f64 {
    let mut acc = 0.0;
    for i in 0..rho.dim {
        for j in 0..rho.dim {
            acc += (rho.get(i, j) * sigma.get(j, i)).re;
        }
    }
    acc
}

fn transfer_chain(engine: &dyn QuantumEngine, cfg: &RunConfig) -> Result<ScenarioOutput> {
    let q = &cfg.quantum;
    let n = q.n_qubits.max(2);
    let mut rng = StdRng::seed_from_u64(cfg.seed);

    let mut prep = Circuit::new(n);
    prep.push(Gate::Ry(0, q.theta));
    let prepared = engine.run_circuit(&prep, 0, cfg.seed)?;
    let target = partial_trace(&prepared.statevector, n, &[0]);

    let mut circuit = prep;
    let mut fidelity_ch = Vec::with_capacity(n - 1);
    let mut entropy = 0.0;
    for hop in 0..n - 1 {
        circuit
            .push(Gate::Swap(hop, hop + 1))
            .push(Gate::Rz(hop + 1, q.phase_noise * normal(&mut rng)));
        let last = hop + 2 == n;
        let shots = if last { q.shots } else { 0 };
        let run = engine.run_circuit(&circuit, shots, cfg.seed.wrapping_add(hop as u64))?;
        let arrived = partial_trace(&run.statevector, n, &[hop + 1]);
        fidelity_ch.push(clip01(overlap(&target, &arrived)));
        if last {
            entropy = run.sampled_entropy();
        }
    }

    let mut summary = Metrics::new();
    put(&mut summary, "engine", engine.name());
    put(&mut summary, "n_hops", n - 1);
    put(&mut summary, "theta", q.theta);
    put(
        &mut summary,
        "final_fidelity",
        fidelity_ch.last().copied().unwrap_or(1.0),
    );
    put(&mut summary, "final_entropy", entropy);

    let mut ts = Timeseries::new();
    ts.insert("t", (1..n).map(|h| h as f64).collect())?;
    ts.insert("fidelity", fidelity_ch)?;
    Ok(ScenarioOutput::ok(summary, ts))
}

fn measurement_collapse(engine: &dyn QuantumEngine, cfg: &RunConfig) -> Result<ScenarioOutput> {
    let n = cfg.quantum.n_qubits.max(2);
    let mut circuit = Circuit::new(n);
    circuit.push(Gate::H(0));
    for q in 0..n - 1 {
        circuit.push(Gate::Cx(q, q + 1));
    }
    let before = engine.run_circuit(&circuit, cfg.quantum.shots, cfg.seed)?;
    circuit.push(Gate::Measure(0));
    let after = engine.run_circuit(&circuit, cfg.quantum.shots, cfg.seed)?;

    let mut summary = Metrics::new();
    put(&mut summary, "engine", engine.name());
    put(&mut summary, "entropy_before", before.entropy);
    put(&mut summary, "entropy_after", after.entropy);
    put(&mut summary, "entropy_drop", before.entropy - after.entropy);
    put(
        &mut summary,
        "entanglement_before",
        entanglement_entropy(&before.statevector, n, &[0]),
    );
    put(
        &mut summary,
        "entanglement_after",
        entanglement_entropy(&after.statevector, n, &[0]),
    );
    if let Some((_, bit)) = after.measurements.first() {
        put(&mut summary, "measured_bit", *bit);
    }

    let mut ts = Timeseries::new();
    ts.insert("t", vec![0.0, 1.0])?;
    ts.insert("entropy", vec![before.entropy, after.entropy])?;
    ts.insert(
        "expectation_mean",
        vec![before.mean_expectation(), after.mean_expectation()],
    )?;
    Ok(ScenarioOutput::ok(summary, ts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{engine_for, StatevectorEngine, UnavailableEngine};
    use crate::test_support::temp_root;
    use serde_json::Value;

    fn config(scenario: &str) -> RunConfig {
        RunConfig {
            scenario: Some(scenario.to_string()),
            horizon: 12,
            ..RunConfig::default()
        }
    }

    fn simulate_ok(cfg: &RunConfig) -> ScenarioOutput {
        let scenario = cfg.scenario.clone().unwrap_or_default();
        simulate(&StatevectorEngine, &scenario, cfg).expect("simulate")
    }

    #[test]
    fn circuit_shape_follows_depth() {
        let c = layer_to_circuit(0.5, 0.2, 0.4, 3, 2, 1);
        assert_eq!(c.gates.len(), 3 * 2 + 2 * (2 + 1));
        assert_eq!(c.gates[0], Gate::Ry(0, 0.5 * PI));
        assert!(matches!(c.gates.last(), Some(Gate::Rx(1, _))));
        assert!(layer_to_circuit(0.5, 0.2, 0.4, 0, 2, 1).gates.is_empty());
    }

    #[test]
    fn stress_probe_fills_every_channel() {
        let out = simulate_ok(&config("layer_stress_probe"));
        assert_eq!(out.status, RunStatus::Ok);
        assert_eq!(out.timeseries.len(), 12);
        let proxy = out.timeseries.get("anomaly_proxy").expect("proxy");
        assert!(proxy.iter().all(|p| (0.0..=1.0).contains(p)));
        let z = out.timeseries.get("expectation_mean").expect("z");
        assert!(z.iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn entangled_pair_shares_two_bits() {
        let out = simulate_ok(&config("entangled_pair"));
        let mi = out.summary["mutual_information"].as_f64().expect("mi");
        assert!((mi - 2.0).abs() < 1e-9);
        let e = out.summary["entanglement_entropy"].as_f64().expect("ee");
        assert!((e - 1.0).abs() < 1e-9);
    }

    #[test]
    fn noiseless_chain_transfers_perfectly() {
        let mut cfg = config("transfer_chain");
        cfg.quantum.phase_noise = 0.0;
        cfg.quantum.n_qubits = 4;
        let out = simulate_ok(&cfg);
        let fid = out.timeseries.get("fidelity").expect("fidelity");
        assert_eq!(fid.len(), 3);
        assert!(fid.iter().all(|f| (f - 1.0).abs() < 1e-9));
    }

    #[test]
    fn phase_noise_lowers_fidelity() {
        let mut cfg = config("transfer_chain");
        cfg.quantum.phase_noise = 1.0;
        cfg.quantum.theta = FRAC_PI_2;
        let out = simulate_ok(&cfg);
        let last = out.summary["final_fidelity"].as_f64().expect("fidelity");
        assert!(last < 1.0);
    }

    #[test]
    fn measurement_removes_one_bit_from_ghz() {
        let out = simulate_ok(&config("measurement_collapse"));
        let drop = out.summary["entropy_drop"].as_f64().expect("drop");
        assert!((drop - 1.0).abs() < 1e-9);
        let after = out.summary["entanglement_after"].as_f64().expect("after");
        assert!(after.abs() < 1e-9);
    }

    #[test]
    fn unavailable_engine_never_reports_ok() {
        let root = temp_root("q_unavailable");
        let mut cfg = config("layer_stress_probe");
        cfg.quantum.engine = "none".into();
        let backend = QuantumBackend::new(engine_for(&cfg.quantum));
        assert!(!backend.is_available());
        let result = backend
            .run("q1", &cfg, &root.join("q1.log"), &root.join("q1"))
            .expect("run");
        assert_eq!(result.status, RunStatus::Unavailable);
        let text = std::fs::read_to_string(result.metrics_path()).expect("metrics");
        let v: Value = serde_json::from_str(&text).expect("json");
        assert_eq!(v["status"], Value::from("unavailable"));
        assert!(v["note"].is_string());
        assert!(v.get("expectation_mean").is_none());
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn unknown_scenario_wins_over_unavailable_engine() {
        let root = temp_root("q_unknown");
        let cfg = config("teleport");
        let backend = QuantumBackend::new(Box::new(UnavailableEngine {
            reason: "off".into(),
        }));
        let result = backend
            .run("q2", &cfg, &root.join("q2.log"), &root.join("q2"))
            .expect("run");
        assert_eq!(result.status, RunStatus::Error);
        assert_eq!(result.reason.as_deref(), Some("unknown scenario 'teleport'"));
        let _ = std::fs::remove_dir_all(root);
    }
}
