//! Toy statevector engine for a handful of qubits.
//!
//! Basis indices are little-endian: bit `q` of an index is qubit `q`. Count
//! keys are bitstrings with qubit `n-1` leftmost.

use lab_analysis::shannon_entropy;
use lab_core::QuantumConfig;
use num_complex::Complex64;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::f64::consts::FRAC_1_SQRT_2;

/// Largest register the statevector engine accepts.
pub const MAX_QUBITS: usize = 12;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum EngineError {
    #[error("quantum engine unavailable: {0}")]
    Unavailable(String),
    #[error("gate {gate} addresses qubit {qubit} outside a {n_qubits}-qubit register")]
    QubitOutOfRange {
        gate: &'static str,
        qubit: usize,
        n_qubits: usize,
    },
    #[error("two-qubit gate {0} needs distinct qubits")]
    RepeatedQubit(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Gate {
    H(usize),
    X(usize),
    Rx(usize, f64),
    Ry(usize, f64),
    Rz(usize, f64),
    Phase(usize, f64),
    Cx(usize, usize),
    Swap(usize, usize),
    /// Projective Z measurement; collapses the state.
    Measure(usize),
}

impl Gate {
    fn name(&self) -> &'static str {
        match self {
            Gate::H(_) => "h",
            Gate::X(_) => "x",
            Gate::Rx(..) => "rx",
            Gate::Ry(..) => "ry",
            Gate::Rz(..) => "rz",
            Gate::Phase(..) => "p",
            Gate::Cx(..) => "cx",
            Gate::Swap(..) => "swap",
            Gate::Measure(_) => "measure",
        }
    }

    fn qubits(&self) -> (usize, Option<usize>) {
        match *self {
            Gate::H(q)
            | Gate::X(q)
            | Gate::Rx(q, _)
            | Gate::Ry(q, _)
            | Gate::Rz(q, _)
            | Gate::Phase(q, _)
            | Gate::Measure(q) => (q, None),
            Gate::Cx(a, b) | Gate::Swap(a, b) => (a, Some(b)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Circuit {
    pub n_qubits: usize,
    pub gates: Vec<Gate>,
}

impl Circuit {
    pub fn new(n_qubits: usize) -> Self {
        Self {
            n_qubits,
            gates: Vec::new(),
        }
    }

    pub fn push(&mut self, gate: Gate) -> &mut Self {
        self.gates.push(gate);
        self
    }

    fn validate(&self) -> Result<(), EngineError> {
        for gate in &self.gates {
            let (a, b) = gate.qubits();
            for q in std::iter::once(a).chain(b) {
                if q >= self.n_qubits {
                    return Err(EngineError::QubitOutOfRange {
                        gate: gate.name(),
                        qubit: q,
                        n_qubits: self.n_qubits,
                    });
                }
            }
            if b == Some(a) {
                return Err(EngineError::RepeatedQubit(gate.name()));
            }
        }
        Ok(())
    }
}

/// Outcome of one circuit execution.
#[derive(Debug, Clone)]
pub struct QuantumRun {
    /// Sampled outcome histogram.
    pub counts: BTreeMap<String, u64>,
    /// Exact `<Z_q>` per qubit.
    pub expectations: Vec<f64>,
    /// Shannon entropy (bits) of the exact outcome distribution.
    pub entropy: f64,
    pub probabilities: Vec<f64>,
    pub statevector: Vec<Complex64>,
    /// Results of `Measure` gates, in circuit order.
    pub measurements: Vec<(usize, u8)>,
}

impl QuantumRun {
    pub fn mean_expectation(&self) -> f64 {
        lab_analysis::mean(&self.expectations)
    }

    /// Entropy of the sampled counts, falling back to the exact entropy when
    /// nothing was sampled.
    pub fn sampled_entropy(&self) -> f64 {
        if self.counts.is_empty() {
            return self.entropy;
        }
        let weights: Vec<f64> = self.counts.values().map(|c| *c as f64).collect();
        shannon_entropy(&weights)
    }
}

pub trait QuantumEngine: Send + Sync {
    fn name(&self) -> &str;
    fn is_available(&self) -> bool;
    /// Why the engine cannot run, when it cannot.
    fn unavailable_reason(&self) -> Option<&str> {
        None
    }
    fn run_circuit(&self, circuit: &Circuit, shots: usize, seed: u64)
        -> Result<QuantumRun, EngineError>;
}

/// Picks the engine a quantum config asks for.
pub fn engine_for(cfg: &QuantumConfig) -> Box<dyn QuantumEngine> {
    let reason = match cfg.engine.as_str() {
        "none" => Some("quantum engine disabled in config (engine=none)".to_string()),
        "statevector" if !cfg!(feature = "statevector") => {
            Some("built without the statevector engine".to_string())
        }
        "statevector" if cfg.n_qubits == 0 => Some("n_qubits must be at least 1".to_string()),
        "statevector" if cfg.n_qubits > MAX_QUBITS => Some(format!(
            "n_qubits={} exceeds the statevector limit of {}",
            cfg.n_qubits, MAX_QUBITS
        )),
        "statevector" => None,
        other => Some(format!("unknown quantum engine '{other}'")),
    };
    match reason {
        Some(reason) => {
            tracing::warn!(%reason, "quantum engine unavailable");
            Box::new(UnavailableEngine { reason })
        }
        None => Box::new(StatevectorEngine),
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StatevectorEngine;

impl QuantumEngine for StatevectorEngine {
    fn name(&self) -> &str {
        "statevector"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn run_circuit(
        &self,
        circuit: &Circuit,
        shots: usize,
        seed: u64,
    ) -> Result<QuantumRun, EngineError> {
        if circuit.n_qubits > MAX_QUBITS {
            return Err(EngineError::Unavailable(format!(
                "{} qubits exceeds the limit of {}",
                circuit.n_qubits, MAX_QUBITS
            )));
        }
        circuit.validate()?;
        let n = circuit.n_qubits;
        let mut rng = StdRng::seed_from_u64(seed);
        let mut state = vec![Complex64::new(0.0, 0.0); 1 << n];
        state[0] = Complex64::new(1.0, 0.0);
        let mut measurements = Vec::new();

        for gate in &circuit.gates {
            match *gate {
                Gate::H(q) => {
                    let h = Complex64::new(FRAC_1_SQRT_2, 0.0);
                    apply_1q(&mut state, q, [[h, h], [h, -h]]);
                }
                Gate::X(q) => apply_1q(&mut state, q, [[c(0.0), c(1.0)], [c(1.0), c(0.0)]]),
                Gate::Rx(q, theta) => {
                    let (s, co) = (theta / 2.0).sin_cos();
                    let mis = Complex64::new(0.0, -s);
                    apply_1q(&mut state, q, [[c(co), mis], [mis, c(co)]]);
                }
                Gate::Ry(q, theta) => {
                    let (s, co) = (theta / 2.0).sin_cos();
                    apply_1q(&mut state, q, [[c(co), c(-s)], [c(s), c(co)]]);
                }
                Gate::Rz(q, theta) => {
                    let lo = Complex64::from_polar(1.0, -theta / 2.0);
                    let hi = Complex64::from_polar(1.0, theta / 2.0);
                    apply_1q(&mut state, q, [[lo, c(0.0)], [c(0.0), hi]]);
                }
                Gate::Phase(q, theta) => {
                    let p = Complex64::from_polar(1.0, theta);
                    apply_1q(&mut state, q, [[c(1.0), c(0.0)], [c(0.0), p]]);
                }
                Gate::Cx(ctrl, target) => {
                    for i in 0..state.len() {
                        if i >> ctrl & 1 == 1 && i >> target & 1 == 0 {
                            state.swap(i, i | 1 << target);
                        }
                    }
                }
                Gate::Swap(a, b) => {
                    for i in 0..state.len() {
                        if i >> a & 1 == 1 && i >> b & 1 == 0 {
                            state.swap(i, i ^ (1 << a) ^ (1 << b));
                        }
                    }
                }
                Gate::Measure(q) => {
                    let bit = measure(&mut state, q, rng.random::<f64>());
                    measurements.push((q, bit));
                }
            }
        }

        let probabilities: Vec<f64> = state.iter().map(|a| a.norm_sqr()).collect();
        let expectations = (0..n)
            .map(|q| {
                probabilities
                    .iter()
                    .enumerate()
                    .map(|(i, p)| if i >> q & 1 == 0 { *p } else { -*p })
                    .sum()
            })
            .collect();
        let counts = sample_counts(&probabilities, n, shots, &mut rng);
        Ok(QuantumRun {
            counts,
            expectations,
            entropy: shannon_entropy(&probabilities),
            probabilities,
            statevector: state,
            measurements,
        })
    }
}

/// Stands in when no engine can run; every call fails with the reason.
#[derive(Debug, Clone)]
pub struct UnavailableEngine {
    pub reason: String,
}

impl QuantumEngine for UnavailableEngine {
    fn name(&self) -> &str {
        "unavailable"
    }

    fn is_available(&self) -> bool {
        false
    }

    fn unavailable_reason(&self) -> Option<&str> {
        Some(&self.reason)
    }

    fn run_circuit(&self, _: &Circuit, _: usize, _: u64) -> Result<QuantumRun, EngineError> {
        Err(EngineError::Unavailable(self.reason.clone()))
    }
}

fn c(re: f64) -> Complex64 {
    Complex64::new(re, 0.0)
}

fn apply_1q(state: &mut [Complex64], q: usize, m: [[Complex64; 2]; 2]) {
    let mask = 1 << q;
    for i in 0..state.len() {
        if i & mask == 0 {
            let j = i | mask;
            let (a, b) = (state[i], state[j]);
            state[i] = m[0][0] * a + m[0][1] * b;
            state[j] = m[1][0] * a + m[1][1] * b;
        }
    }
}

fn measure(state: &mut [Complex64], q: usize, u: f64) -> u8 {
    let p1: f64 = state
        .iter()
        .enumerate()
        .filter(|(i, _)| i >> q & 1 == 1)
        .map(|(_, a)| a.norm_sqr())
        .sum();
    let bit = u8::from(u < p1);
    let keep_prob = if bit == 1 { p1 } else { 1.0 - p1 };
    let scale = if keep_prob > 0.0 { 1.0 / keep_prob.sqrt() } else { 0.0 };
    for (i, amp) in state.iter_mut().enumerate() {
        if (i >> q & 1) as u8 == bit {
            *amp *= scale;
        } else {
            *amp = c(0.0);
        }
    }
    bit
}

fn sample_counts(
    probabilities: &[f64],
    n_qubits: usize,
    shots: usize,
    rng: &mut StdRng,
) -> BTreeMap<String, u64> {
    let mut counts = BTreeMap::new();
    if shots == 0 {
        return counts;
    }
    let mut cdf = Vec::with_capacity(probabilities.len());
    let mut acc = 0.0;
    for p in probabilities {
        acc += p;
        cdf.push(acc);
    }
    let last = probabilities.len().saturating_sub(1);
    for _ in 0..shots {
        let u = rng.random::<f64>() * acc;
        let idx = cdf.partition_point(|c| *c <= u).min(last);
        *counts.entry(bitstring(idx, n_qubits)).or_insert(0) += 1;
    }
    counts
}

fn bitstring(index: usize, n_qubits: usize) -> String {
    (0..n_qubits)
        .rev()
        .map(|q| if index >> q & 1 == 1 { '1' } else { '0' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn run(circuit: &Circuit, shots: usize) -> QuantumRun {
        StatevectorEngine.run_circuit(circuit, shots, 7).expect("run")
    }

    #[test]
    fn bell_state_counts_and_expectations() {
        let mut c = Circuit::new(2);
        c.push(Gate::H(0)).push(Gate::Cx(0, 1));
        let r = run(&c, 1000);
        assert_eq!(r.counts.keys().cloned().collect::<Vec<_>>(), vec!["00", "11"]);
        assert_eq!(r.counts.values().sum::<u64>(), 1000);
        assert!(r.expectations.iter().all(|z| z.abs() < 1e-12));
        assert!((r.entropy - 1.0).abs() < 1e-12);
    }

    #[test]
    fn x_on_qubit_one_is_little_endian() {
        let mut c = Circuit::new(3);
        c.push(Gate::X(1));
        let r = run(&c, 10);
        assert_eq!(r.counts.get("010"), Some(&10));
        assert!((r.probabilities[2] - 1.0).abs() < 1e-12);
        assert_eq!(r.expectations, vec![1.0, -1.0, 1.0]);
    }

    #[test]
    fn ry_pi_flips_and_rz_only_changes_phase() {
        let mut c = Circuit::new(1);
        c.push(Gate::Ry(0, PI)).push(Gate::Rz(0, 0.7));
        let r = run(&c, 0);
        assert!((r.probabilities[1] - 1.0).abs() < 1e-12);
        assert!(r.counts.is_empty());
        assert_eq!(r.sampled_entropy(), r.entropy);
    }

    #[test]
    fn swap_moves_excitation() {
        let mut c = Circuit::new(3);
        c.push(Gate::X(0)).push(Gate::Swap(0, 1)).push(Gate::Swap(1, 2));
        let r = run(&c, 0);
        assert!((r.probabilities[4] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn measurement_collapses_ghz() {
        let mut c = Circuit::new(3);
        c.push(Gate::H(0))
            .push(Gate::Cx(0, 1))
            .push(Gate::Cx(1, 2))
            .push(Gate::Measure(0));
        let r = run(&c, 0);
        assert_eq!(r.measurements.len(), 1);
        assert!(r.entropy.abs() < 1e-12);
        let norm: f64 = r.probabilities.iter().sum();
        assert!((norm - 1.0).abs() < 1e-12);
    }

    #[test]
    fn invalid_circuits_are_rejected() {
        let mut c = Circuit::new(2);
        c.push(Gate::Cx(0, 2));
        assert!(matches!(
            StatevectorEngine.run_circuit(&c, 1, 0),
            Err(EngineError::QubitOutOfRange { qubit: 2, .. })
        ));
        let mut d = Circuit::new(2);
        d.push(Gate::Swap(1, 1));
        assert_eq!(
            StatevectorEngine.run_circuit(&d, 1, 0).err(),
            Some(EngineError::RepeatedQubit("swap"))
        );
    }

    #[test]
    fn engine_selection_reports_reasons() {
        let mut cfg = QuantumConfig::default();
        assert!(engine_for(&cfg).is_available());
        cfg.engine = "none".into();
        let e = engine_for(&cfg);
        assert!(!e.is_available());
        assert!(e.unavailable_reason().unwrap_or("").contains("none"));
        cfg.engine = "statevector".into();
        cfg.n_qubits = MAX_QUBITS + 1;
        assert!(!engine_for(&cfg).is_available());
        assert!(engine_for(&cfg)
            .run_circuit(&Circuit::new(1), 1, 0)
            .is_err());
    }

    #[test]
    fn sampling_is_seeded() {
        let mut c = Circuit::new(2);
        c.push(Gate::H(0)).push(Gate::H(1));
        let a = StatevectorEngine.run_circuit(&c, 256, 3).expect("run");
        let b = StatevectorEngine.run_circuit(&c, 256, 3).expect("run");
        assert_eq!(a.counts, b.counts);
    }
}
