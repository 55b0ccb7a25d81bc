use lab_core::Metrics;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Map, Value};

use crate::run_metrics::{mean, population_std};

pub const ENSEMBLE_METRICS_SCHEMA: &str = "ensemble_metrics_v1";

/// Metric keys aggregated across ensemble members.
pub const HEADLINE_KEYS: &[&str] = &[
    "stress_max",
    "stress_mean",
    "anomaly_mean",
    "anomaly_max",
    "entropy_mean",
    "expectation_mean",
    "fidelity_mean",
    "protection_min",
    "detection_latency",
    "continuity_below_threshold_prob",
    "collapse_fraction",
    "copy_divergence",
];

/// Runs whose `stress_max` exceeds this count as near breakdown.
pub const NEAR_BREAKDOWN_STRESS: f64 = 0.9;

const BOOTSTRAP_RESAMPLES: usize = 200;
const BOOTSTRAP_LEVEL: f64 = 0.95;
const BOOTSTRAP_SEED: u64 = 0;

/// Aggregates per-run metrics. Runs lacking a key are left out of that key's
/// statistics rather than counted as zero.
pub fn compute_ensemble_summary(runs: &[Metrics]) -> Value {
    let mut per_key = Map::new();
    for key in HEADLINE_KEYS {
        let values: Vec<f64> = runs
            .iter()
            .filter_map(|m| m.get(*key).and_then(Value::as_f64))
            .collect();
        if values.is_empty() {
            continue;
        }
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        per_key.insert(
            key.to_string(),
            json!({
                "mean": mean(&values),
                "std": population_std(&values),
                "min": min,
                "max": max,
                "n": values.len(),
            }),
        );
    }

    let near_breakdown = runs
        .iter()
        .filter(|m| {
            m.get("stress_max")
                .and_then(Value::as_f64)
                .is_some_and(|v| v > NEAR_BREAKDOWN_STRESS)
        })
        .count();

    let mut out = json!({
        "schema_version": ENSEMBLE_METRICS_SCHEMA,
        "runs": runs.len(),
        "near_breakdown": near_breakdown,
        "metrics": per_key,
    });

    let anomaly_means: Vec<f64> = runs
        .iter()
        .filter_map(|m| m.get("anomaly_mean").and_then(Value::as_f64))
        .collect();
    if let Some((low, high)) = bootstrap_ci(
        &anomaly_means,
        BOOTSTRAP_RESAMPLES,
        BOOTSTRAP_LEVEL,
        BOOTSTRAP_SEED,
    ) {
        out["anomaly_mean_ci95"] = json!({
            "low": low,
            "high": high,
            "resamples": BOOTSTRAP_RESAMPLES,
            "level": BOOTSTRAP_LEVEL,
        });
    }
    out
}

/// Percentile bootstrap interval of the mean.
///
/// Resamples with replacement using a generator seeded with `seed`, sorts the
/// resampled means and reads the tail positions by index. Returns `None` for
/// empty input.
pub fn bootstrap_ci(values: &[f64], resamples: usize, level: f64, seed: u64) -> Option<(f64, f64)> {
    if values.is_empty() || resamples == 0 {
        return None;
    }
    let lo_v = values.iter().copied().fold(f64::INFINITY, f64::min);
    let hi_v = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if lo_v == hi_v {
        return Some((lo_v, lo_v));
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let n = values.len();
    let mut means: Vec<f64> = (0..resamples)
        .map(|_| {
            let sum: f64 = (0..n).map(|_| values[rng.random_range(0..n)]).sum();
            sum / n as f64
        })
        .collect();
    means.sort_by(f64::total_cmp);

    let tail = (1.0 - level) / 2.0;
    let last = resamples - 1;
    let lo_idx = ((tail * resamples as f64).round() as usize).min(last);
    let hi_idx = (((1.0 - tail) * resamples as f64).round() as usize).min(last);
    Some((means[lo_idx], means[hi_idx]))
}
