//! Classical layer dynamics.

use anyhow::{bail, Result};
use lab_agents::{
    awareness_summary, copy_experiment, run_episode, run_world, transfer_experiment, GridWorld,
    PatternAgent,
};
use lab_analysis::{continuity_cosine, cosine, mean};
use lab_core::{BackendKind, Metrics, RunConfig, RunResult, Timeseries};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde_json::Value;
use std::path::Path;

use crate::artifacts::{guarded, RunContext};
use crate::patterns::{build_population, score_population};
use crate::{clip01, put, scenario_name, Backend, ScenarioOutput};

const DEFAULT_SCENARIO: &str = "baseline_layer";
const COLLAPSE_STRESS: f64 = 0.9;
const UNCOLLAPSE_STRESS: f64 = 0.5;
/// Offset between the seed of the home layer and the layer a pattern is
/// transferred into.
const TRANSFER_LAYER_SEED_OFFSET: u64 = 1000;

#[derive(Debug, Clone, Copy, Default)]
pub struct ClassicalBackend;

impl ClassicalBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Backend for ClassicalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Classical
    }

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
        let out = guarded(|| simulate(&scenario, config));
        ctx.finalize(out)
    }
}

fn simulate(scenario: &str, cfg: &RunConfig) -> Result<ScenarioOutput> {
    let mut rng = StdRng::seed_from_u64(cfg.seed);
    match scenario {
        "baseline_layer" | "single_anomaly_injection" | "self_aware_anomaly" => {
            layer_evolution(scenario, cfg, &mut rng)
        }
        "anomaly_injection" => anomaly_injection(cfg, &mut rng),
        "collapse_recovery" => collapse_recovery(cfg, &mut rng),
        "transfer_cycle" => transfer_cycle(cfg, &mut rng),
        "pattern_transfer" => pattern_transfer(cfg, &mut rng),
        "multi_agent_world" => multi_agent_world(cfg),
        other => Ok(ScenarioOutput::unknown_scenario(other)),
    }
}

fn noise(rng: &mut impl Rng, sd: f64) -> f64 {
    sd * rng.sample::<f64, _>(StandardNormal)
}

fn times(n: usize, dt: f64) -> Vec<f64> {
    (0..n).map(|i| i as f64 * dt).collect()
}

fn flag(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

fn layer_evolution(scenario: &str, cfg: &RunConfig, rng: &mut StdRng) -> Result<ScenarioOutput> {
    let population = build_population(&cfg.layer_id, scenario, rng);
    let scores = score_population(&population);
    let anomaly: Vec<f64> = scores.iter().map(|s| s.anomaly_score).collect();
    let anomaly_mean = mean(&anomaly);

    let (mut stress, mut protection, mut novelty) = (0.2, 0.8, 0.1);
    let mut stress_ch = vec![stress];
    let mut protection_ch = vec![protection];
    let mut novelty_ch = vec![novelty];
    let mut regime_ch = vec![0.0];
    for _ in 0..cfg.horizon {
        stress = clip01(stress + noise(rng, 0.05) + 0.1 * anomaly_mean);
        protection = clip01(protection - 0.05 * anomaly_mean + noise(rng, 0.02));
        novelty = clip01(novelty + noise(rng, 0.05) + 0.05 * anomaly_mean);
        stress_ch.push(stress);
        protection_ch.push(protection);
        novelty_ch.push(novelty);
        regime_ch.push(flag(anomaly_mean > 0.6));
    }

    let mut summary = Metrics::new();
    put(&mut summary, "stress_max", max_of(&stress_ch));
    put(&mut summary, "protection_min", min_of(&protection_ch));
    put(&mut summary, "anomaly_mean", anomaly_mean);
    put(
        &mut summary,
        "reflexivity_mean",
        mean(&scores.iter().map(|s| s.reflexivity).collect::<Vec<_>>()),
    );
    put(
        &mut summary,
        "self_operator_mean",
        mean(&scores.iter().map(|s| s.self_operator).collect::<Vec<_>>()),
    );
    put(&mut summary, "n_patterns", scores.len());

    let mut ts = Timeseries::new();
    ts.insert("t", times(stress_ch.len(), cfg.dt))?;
    ts.insert("stress", stress_ch)?;
    ts.insert("protection", protection_ch)?;
    ts.insert("novelty", novelty_ch)?;
    ts.insert("upgrade_regime", regime_ch)?;

    let mut out = ScenarioOutput::ok(summary, ts);
    out.patterns = Some(scores);
    Ok(out)
}

fn anomaly_injection(cfg: &RunConfig, rng: &mut StdRng) -> Result<ScenarioOutput> {
    let horizon = cfg.horizon;
    let inject = cfg.inject_step.unwrap_or(horizon / 3);
    let level = clip01(cfg.anomaly_level);
    let threshold = cfg.detection_threshold;
    let target_stress = 0.25 + 0.75 * level;
    let target_protection = 0.8 - 0.6 * level;

    let (mut stress, mut protection) = (0.25, 0.8);
    let mut stress_ch = Vec::with_capacity(horizon);
    let mut protection_ch = Vec::with_capacity(horizon);
    let mut proxy_ch = Vec::with_capacity(horizon);
    let mut truth_ch = Vec::with_capacity(horizon);
    for t in 0..horizon {
        let truth = t >= inject;
        if truth {
            stress = clip01(stress + 0.5 * (target_stress - stress) + noise(rng, 0.03));
            protection =
                clip01(protection + 0.5 * (target_protection - protection) + noise(rng, 0.02));
        } else {
            stress = clip01(0.25 + noise(rng, 0.03));
            protection = clip01(0.8 + noise(rng, 0.02));
        }
        let proxy = clip01(
            0.4 * stress + 0.3 * (1.0 - protection) + 0.3 * flag(truth) * level + noise(rng, 0.02),
        );
        stress_ch.push(stress);
        protection_ch.push(protection);
        proxy_ch.push(proxy);
        truth_ch.push(flag(truth));
    }

    let detected = |t: usize| proxy_ch[t] >= threshold;
    let latency = (inject..horizon).find(|t| detected(*t)).map(|t| t - inject);
    let false_positives = (0..inject.min(horizon)).filter(|t| detected(*t)).count();
    let false_negatives = (inject..horizon).filter(|t| !detected(*t)).count();

    let mut summary = Metrics::new();
    put(&mut summary, "inject_step", inject);
    put(
        &mut summary,
        "detection_latency",
        latency.map_or(Value::Null, Value::from),
    );
    put(&mut summary, "false_positives", false_positives);
    put(&mut summary, "false_negatives", false_negatives);

    let mut ts = Timeseries::new();
    ts.insert("t", times(horizon, cfg.dt))?;
    ts.insert("stress", stress_ch)?;
    ts.insert("protection", protection_ch)?;
    ts.insert("anomaly_proxy", proxy_ch)?;
    ts.insert("anomaly_truth", truth_ch)?;
    Ok(ScenarioOutput::ok(summary, ts))
}

fn collapse_recovery(cfg: &RunConfig, rng: &mut StdRng) -> Result<ScenarioOutput> {
    let (mut stress, mut capacity, mut protection) = (0.3, 1.0, 0.8);
    let mut collapsed = false;
    let mut recovered = false;
    let mut events = 0usize;
    let mut stress_ch = vec![stress];
    let mut capacity_ch = vec![capacity];
    let mut protection_ch = vec![protection];
    let mut collapsed_ch = vec![0.0];

    for _ in 0..cfg.horizon {
        if collapsed && cfg.recovery {
            let r = cfg.recovery_rate;
            stress = clip01(stress + r * (0.3 - stress) + noise(rng, 0.02));
            capacity = clip01(capacity + r * (1.0 - capacity) + noise(rng, 0.01));
            protection = clip01(protection + r * (0.8 - protection) + noise(rng, 0.01));
        } else {
            stress =
                clip01(stress + cfg.load_rate + 0.05 * (1.0 - capacity) + noise(rng, 0.02));
            capacity = clip01(capacity - cfg.depletion_rate * stress + noise(rng, 0.01));
            protection = clip01(protection - 0.02 * stress + noise(rng, 0.01));
        }
        if !collapsed && stress > COLLAPSE_STRESS {
            collapsed = true;
            events += 1;
        } else if collapsed && cfg.recovery && stress < UNCOLLAPSE_STRESS {
            collapsed = false;
            recovered = true;
        }
        stress_ch.push(stress);
        capacity_ch.push(capacity);
        protection_ch.push(protection);
        collapsed_ch.push(flag(collapsed));
    }

    let mut summary = Metrics::new();
    put(&mut summary, "collapse_fraction", mean(&collapsed_ch));
    put(&mut summary, "collapsed", collapsed);
    put(&mut summary, "recovered", recovered);
    put(&mut summary, "collapse_events", events);

    let mut ts = Timeseries::new();
    ts.insert("t", times(stress_ch.len(), cfg.dt))?;
    ts.insert("stress", stress_ch)?;
    ts.insert("capacity", capacity_ch)?;
    ts.insert("protection", protection_ch)?;
    ts.insert("collapsed", collapsed_ch)?;
    Ok(ScenarioOutput::ok(summary, ts))
}

fn transfer_cycle(cfg: &RunConfig, rng: &mut StdRng) -> Result<ScenarioOutput> {
    if cfg.substrates.is_empty() {
        bail!("transfer_cycle needs at least one substrate");
    }
    let dim = cfg.agent.internal_dim.max(1);
    let mut origin: Vec<f64> = (0..dim).map(|_| noise(rng, 1.0)).collect();
    let norm = origin.iter().map(|v| v * v).sum::<f64>().sqrt().max(1e-12);
    origin.iter_mut().for_each(|v| *v /= norm);

    let mut current = origin.clone();
    let mut fidelity_ch = Vec::with_capacity(cfg.horizon);
    let mut continuity_ch = Vec::with_capacity(cfg.horizon);
    let mut noise_ch = Vec::with_capacity(cfg.horizon);
    for step in 0..cfg.horizon {
        let substrate = &cfg.substrates[step % cfg.substrates.len()];
        for v in current.iter_mut() {
            *v += noise(rng, substrate.noise);
        }
        let continuity = cosine(&origin, &current);
        continuity_ch.push(continuity);
        fidelity_ch.push(clip01(continuity));
        noise_ch.push(substrate.noise);
    }

    let below = continuity_ch
        .iter()
        .filter(|c| **c < cfg.continuity_threshold)
        .count();
    let mut summary = Metrics::new();
    put(
        &mut summary,
        "continuity_below_threshold_prob",
        if continuity_ch.is_empty() {
            0.0
        } else {
            below as f64 / continuity_ch.len() as f64
        },
    );
    put(
        &mut summary,
        "final_fidelity",
        fidelity_ch.last().copied().unwrap_or(1.0),
    );
    put(&mut summary, "n_substrates", cfg.substrates.len());

    let mut ts = Timeseries::new();
    ts.insert("t", times(cfg.horizon, cfg.dt))?;
    ts.insert("fidelity", fidelity_ch)?;
    ts.insert("continuity", continuity_ch)?;
    ts.insert("substrate_noise", noise_ch)?;
    Ok(ScenarioOutput::ok(summary, ts))
}

fn pattern_transfer(cfg: &RunConfig, rng: &mut StdRng) -> Result<ScenarioOutput> {
    let a = &cfg.agent;
    let mut home = GridWorld::new(a.grid_size, a.max_steps, cfg.seed)?;
    let mut agent = PatternAgent::new(home.obs_dim(), a.internal_dim, a.self_model_dim, rng.random())?;
    let episode = run_episode(&mut home, &mut agent, a.max_steps)?;

    let tail = episode.observations.get(episode.mid_step..).unwrap_or(&[]);
    let copy = copy_experiment(tail, &episode.pattern_mid, a.copy_horizon, (rng.random(), rng.random()))?;

    let mut away = GridWorld::new(
        a.transfer_grid_size,
        a.max_steps,
        cfg.seed.wrapping_add(TRANSFER_LAYER_SEED_OFFSET),
    )?;
    let transfer = transfer_experiment(
        &mut away,
        &episode.pattern_mid,
        a.transfer_horizon,
        a.transfer_noise,
        rng,
    )?;

    let mut summary = Metrics::new();
    put(&mut summary, "copy_divergence", copy.copy_divergence);
    put(
        &mut summary,
        "continuity_mid_to_final",
        continuity_cosine(&episode.pattern_mid, &episode.pattern_final),
    );
    put(
        &mut summary,
        "continuity_mid_to_transferred",
        transfer.continuity_mid_to_transferred,
    );
    put(
        &mut summary,
        "behavior_divergence_transfer_vs_baseline",
        transfer.behavior_divergence_transfer_vs_baseline,
    );
    put(
        &mut summary,
        "awareness_before",
        awareness_summary(&episode.awareness),
    );
    put(&mut summary, "awareness_after", transfer.awareness_after);
    put(&mut summary, "episode_length", episode.actions.len());
    put(
        &mut summary,
        "total_reward",
        episode.rewards.iter().sum::<f64>(),
    );

    let mut ts = Timeseries::new();
    ts.insert("t", times(episode.actions.len(), cfg.dt))?;
    ts.insert("awareness", episode.awareness)?;
    ts.insert("reward", episode.rewards)?;
    ts.insert("continuity", episode.continuity)?;
    Ok(ScenarioOutput::ok(summary, ts))
}

/// Several foragers sharing a 2D layer. Besides the field averages, every
/// agent gets its own `agent_<i>_*` channels.
fn multi_agent_world(cfg: &RunConfig) -> Result<ScenarioOutput> {
    let run = run_world(&cfg.world, cfg.horizon, cfg.seed)?;

    let mut summary = Metrics::new();
    put(&mut summary, "n_agents", cfg.world.n_agents);
    put(&mut summary, "anomaly_impact", run.anomaly_impact);
    put(
        &mut summary,
        "total_reward",
        run.agent_reward.iter().flatten().sum::<f64>(),
    );
    put(
        &mut summary,
        "resource_final_mean",
        run.resource_mean.last().copied().unwrap_or(0.0),
    );
    put(&mut summary, "neighbors_mean", mean(&run.mean_neighbors));

    let mut ts = Timeseries::new();
    ts.insert("t", times(cfg.horizon, cfg.dt))?;
    ts.insert("stress", run.stress_mean)?;
    ts.insert("stress_peak", run.stress_max)?;
    ts.insert("resource_mean", run.resource_mean)?;
    ts.insert("resource_drift", run.anomaly_score)?;
    ts.insert("reward_mean", run.reward_mean)?;
    ts.insert("neighbors_mean", run.mean_neighbors)?;
    let per_agent = [
        ("energy", run.agent_energy),
        ("reward", run.agent_reward),
        ("stress", run.agent_stress),
    ];
    for (name, series) in per_agent {
        for (i, samples) in series.into_iter().enumerate() {
            ts.insert(format!("agent_{i}_{name}"), samples)?;
        }
    }
    Ok(ScenarioOutput::ok(summary, ts))
}

fn max_of(values: &[f64]) -> f64 {
    values.iter().copied().fold(f64::NEG_INFINITY, f64::max)
}

fn min_of(values: &[f64]) -> f64 {
    values.iter().copied().fold(f64::INFINITY, f64::min)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::temp_root;
    use lab_core::RunStatus;

    fn config(scenario: &str) -> RunConfig {
        RunConfig {
            scenario: Some(scenario.to_string()),
            ..RunConfig::default()
        }
    }

    fn output(cfg: &RunConfig) -> ScenarioOutput {
        simulate(cfg.scenario.as_deref().unwrap_or(DEFAULT_SCENARIO), cfg).expect("simulate")
    }

    #[test]
    fn baseline_has_horizon_plus_one_samples_and_patterns() {
        let out = output(&config("baseline_layer"));
        assert_eq!(out.status, RunStatus::Ok);
        assert_eq!(out.timeseries.len(), 51);
        assert_eq!(out.patterns.as_ref().map(Vec::len), Some(10));
        assert!(out
            .timeseries
            .get("stress")
            .expect("stress")
            .iter()
            .all(|s| (0.0..=1.0).contains(s)));
    }

    #[test]
    fn injected_outlier_joins_population() {
        let out = output(&config("self_aware_anomaly"));
        let patterns = out.patterns.expect("patterns");
        assert_eq!(patterns.len(), 11);
        assert_eq!(patterns[10].pattern_id, "anom");
    }

    #[test]
    fn anomaly_injection_truth_and_latency() {
        let mut cfg = config("anomaly_injection");
        cfg.horizon = 10;
        cfg.inject_step = Some(3);
        cfg.anomaly_level = 0.8;
        let out = output(&cfg);
        let truth = out.timeseries.get("anomaly_truth").expect("truth");
        assert_eq!(truth, &[0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0]);
        let latency = out.summary["detection_latency"].as_u64();
        assert!(latency.is_some(), "anomaly should be detected");
        assert_eq!(out.summary["inject_step"], Value::from(3));
    }

    #[test]
    fn injection_after_horizon_is_never_detected() {
        let mut cfg = config("anomaly_injection");
        cfg.horizon = 5;
        cfg.inject_step = Some(9);
        let out = output(&cfg);
        assert_eq!(out.summary["detection_latency"], Value::Null);
        assert_eq!(out.summary["false_negatives"], Value::from(0));
    }

    #[test]
    fn collapse_without_recovery_stays_collapsed() {
        let mut cfg = config("collapse_recovery");
        cfg.recovery = false;
        cfg.load_rate = 0.2;
        let out = output(&cfg);
        assert_eq!(out.summary["collapsed"], Value::Bool(true));
        assert_eq!(out.summary["recovered"], Value::Bool(false));
        assert_eq!(out.summary["collapse_events"], Value::from(1));
    }

    #[test]
    fn collapse_with_recovery_comes_back() {
        let mut cfg = config("collapse_recovery");
        cfg.load_rate = 0.2;
        cfg.recovery_rate = 0.5;
        let out = output(&cfg);
        assert_eq!(out.summary["recovered"], Value::Bool(true));
        let frac = out.summary["collapse_fraction"].as_f64().expect("fraction");
        assert!(frac > 0.0 && frac < 1.0);
    }

    #[test]
    fn transfer_cycle_walks_substrates() {
        let out = output(&config("transfer_cycle"));
        let noise = out.timeseries.get("substrate_noise").expect("noise");
        assert_eq!(&noise[..4], &[0.02, 0.05, 0.08, 0.12]);
        let prob = out.summary["continuity_below_threshold_prob"]
            .as_f64()
            .expect("prob");
        assert!((0.0..=1.0).contains(&prob));
    }

    #[test]
    fn transfer_cycle_without_substrates_errors() {
        let mut cfg = config("transfer_cycle");
        cfg.substrates.clear();
        assert!(simulate("transfer_cycle", &cfg).is_err());
    }

    #[test]
    fn pattern_transfer_reports_agent_metrics() {
        let out = output(&config("pattern_transfer"));
        for key in [
            "copy_divergence",
            "continuity_mid_to_transferred",
            "behavior_divergence_transfer_vs_baseline",
            "awareness_after",
        ] {
            assert!(out.summary.contains_key(key), "missing {key}");
        }
        assert_eq!(out.timeseries.len(), 50);
    }

    #[test]
    fn multi_agent_world_emits_equal_length_channels_per_agent() {
        let mut cfg = config("multi_agent_world");
        cfg.horizon = 30;
        cfg.world.n_agents = 3;
        let out = output(&cfg);
        assert_eq!(out.status, RunStatus::Ok);
        assert_eq!(out.timeseries.len(), 30);
        for name in ["t", "stress", "resource_mean", "resource_drift", "neighbors_mean"] {
            assert_eq!(out.timeseries.get(name).map(<[f64]>::len), Some(30), "{name}");
        }
        for i in 0..3 {
            for kind in ["energy", "reward", "stress"] {
                let name = format!("agent_{i}_{kind}");
                assert_eq!(out.timeseries.get(&name).map(<[f64]>::len), Some(30), "{name}");
            }
        }
        assert!(out.timeseries.get("agent_3_energy").is_none());
        assert!(out.summary.contains_key("anomaly_impact"));
    }

    #[test]
    fn multi_agent_world_is_deterministic_per_seed() {
        let mut cfg = config("multi_agent_world");
        cfg.horizon = 20;
        let a = output(&cfg);
        let b = output(&cfg);
        assert_eq!(a.summary, b.summary);
        assert_eq!(a.timeseries, b.timeseries);
        cfg.seed += 1;
        assert_ne!(output(&cfg).timeseries, a.timeseries);
    }

    #[test]
    fn unknown_scenario_is_an_error_result() {
        let out = output(&config("no_such_thing"));
        assert_eq!(out.status, RunStatus::Error);
        assert_eq!(out.reason.as_deref(), Some("unknown scenario 'no_such_thing'"));
    }

    #[test]
    fn runs_are_deterministic_per_seed() {
        let root = temp_root("classical_det");
        let cfg = config("baseline_layer");
        let a = ClassicalBackend
            .run("a", &cfg, &root.join("a.log"), &root.join("a"))
            .expect("run a");
        let b = ClassicalBackend
            .run("b", &cfg, &root.join("b.log"), &root.join("b"))
            .expect("run b");
        assert_eq!(a.metrics, b.metrics);
        let ta = std::fs::read_to_string(a.timeseries_path()).expect("ts a");
        let tb = std::fs::read_to_string(b.timeseries_path()).expect("ts b");
        assert_eq!(ta, tb);
        assert!(a.results_path.join("patterns.json").exists());
        let _ = std::fs::remove_dir_all(root);
    }
}
