use lab_core::{Metrics, RunConfig, Timeseries};
use serde_json::Value;

pub const RUN_METRICS_SCHEMA: &str = "run_metrics_v1";

/// Key prefix and the channel names it may be read from, first match wins.
const CHANNEL_GROUPS: &[(&str, &[&str])] = &[
    ("stress", &["stress", "sigma_k"]),
    ("anomaly", &["anomaly_proxy", "anomaly_index"]),
    ("entropy", &["entropy", "entropy_meas"]),
    ("expectation", &["expectation_mean", "mean_z"]),
    ("fidelity", &["fidelity", "continuity"]),
    ("protection", &["protection"]),
    ("capacity", &["capacity"]),
];

const PREDICTION_ALIASES: &[&str] = &["anomaly_proxy", "anomaly_index"];
const TRUTH_ALIASES: &[&str] = &["anomaly_truth", "ground_truth"];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsOptions {
    /// Samples strictly above this count toward `{prefix}_above_crit`.
    pub critical_value: f64,
    /// Cut used to binarize the anomaly prediction for calibration.
    pub detection_threshold: f64,
}

impl Default for MetricsOptions {
    fn default() -> Self {
        Self {
            critical_value: 0.8,
            detection_threshold: 0.5,
        }
    }
}

impl From<&RunConfig> for MetricsOptions {
    fn from(cfg: &RunConfig) -> Self {
        Self {
            critical_value: cfg.critical_value,
            detection_threshold: cfg.detection_threshold,
        }
    }
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

pub fn population_std(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

/// Summaries for every channel group present in `ts`.
///
/// Missing channels contribute no keys. `schema_version` is always set.
pub fn compute_run_metrics(ts: &Timeseries, opts: &MetricsOptions) -> Metrics {
    let mut out = Metrics::new();
    for (prefix, aliases) in CHANNEL_GROUPS {
        let Some((_, values)) = ts.first_of(aliases) else {
            continue;
        };
        if values.is_empty() {
            continue;
        }
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let above = values.iter().filter(|v| **v > opts.critical_value).count();
        out.insert(format!("{prefix}_max"), Value::from(max));
        out.insert(format!("{prefix}_min"), Value::from(min));
        out.insert(format!("{prefix}_mean"), Value::from(mean(values)));
        out.insert(format!("{prefix}_std"), Value::from(population_std(values)));
        out.insert(
            format!("{prefix}_above_crit"),
            Value::from(above as f64 / values.len() as f64),
        );
    }

    if let (Some((_, pred)), Some((_, truth))) =
        (ts.first_of(PREDICTION_ALIASES), ts.first_of(TRUTH_ALIASES))
    {
        if !pred.is_empty() && pred.len() == truth.len() {
            calibrate(pred, truth, opts.detection_threshold, &mut out);
        }
    }

    out.insert(
        "schema_version".to_string(),
        Value::from(RUN_METRICS_SCHEMA),
    );
    out
}

fn calibrate(pred: &[f64], truth: &[f64], threshold: f64, out: &mut Metrics) {
    let n = pred.len() as f64;
    let mse = pred
        .iter()
        .zip(truth)
        .map(|(p, t)| (p - t) * (p - t))
        .sum::<f64>()
        / n;
    let bias = pred.iter().zip(truth).map(|(p, t)| p - t).sum::<f64>() / n;
    let (mut tp, mut fp, mut tn, mut fn_) = (0u64, 0u64, 0u64, 0u64);
    for (p, t) in pred.iter().zip(truth) {
        match (*p >= threshold, *t >= 0.5) {
            (true, true) => tp += 1,
            (true, false) => fp += 1,
            (false, false) => tn += 1,
            (false, true) => fn_ += 1,
        }
    }
    out.insert("calib_mse".to_string(), Value::from(mse));
    out.insert("calib_bias".to_string(), Value::from(bias));
    out.insert("calib_tp".to_string(), Value::from(tp));
    out.insert("calib_fp".to_string(), Value::from(fp));
    out.insert("calib_tn".to_string(), Value::from(tn));
    out.insert("calib_fn".to_string(), Value::from(fn_));
    out.insert(
        "calib_accuracy".to_string(),
        Value::from((tp + tn) as f64 / n),
    );
    out.insert("calib_threshold".to_string(), Value::from(threshold));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entropy_only_timeseries_yields_entropy_keys() {
        let mut ts = Timeseries::new();
        ts.insert("entropy", vec![0.5, 1.0, 1.5]).expect("insert");
        let m = compute_run_metrics(&ts, &MetricsOptions::default());
        let mut keys: Vec<&str> = m.keys().map(|k| k.as_str()).collect();
        keys.sort();
        assert_eq!(
            keys,
            vec![
                "entropy_above_crit",
                "entropy_max",
                "entropy_mean",
                "entropy_min",
                "entropy_std",
                "schema_version"
            ]
        );
        assert_eq!(m["entropy_max"], Value::from(1.5));
        assert_eq!(m["entropy_mean"], Value::from(1.0));
        assert!((m["entropy_above_crit"].as_f64().unwrap() - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn alias_channel_is_used_when_primary_missing() {
        let mut ts = Timeseries::new();
        ts.insert("sigma_k", vec![0.2, 0.95]).expect("insert");
        let m = compute_run_metrics(&ts, &MetricsOptions::default());
        assert_eq!(m["stress_max"], Value::from(0.95));
        assert_eq!(m["stress_above_crit"], Value::from(0.5));
    }

    #[test]
    fn empty_timeseries_only_has_schema_version() {
        let m = compute_run_metrics(&Timeseries::new(), &MetricsOptions::default());
        assert_eq!(m.len(), 1);
        assert_eq!(m["schema_version"], Value::from(RUN_METRICS_SCHEMA));
    }

    #[test]
    fn calibration_confusion_matrix() {
        let mut ts = Timeseries::new();
        ts.insert("anomaly_proxy", vec![0.1, 0.6, 0.7, 0.2])
            .expect("insert");
        ts.insert("anomaly_truth", vec![0.0, 0.0, 1.0, 1.0])
            .expect("insert");
        let m = compute_run_metrics(&ts, &MetricsOptions::default());
        assert_eq!(m["calib_tp"], Value::from(1u64));
        assert_eq!(m["calib_fp"], Value::from(1u64));
        assert_eq!(m["calib_tn"], Value::from(1u64));
        assert_eq!(m["calib_fn"], Value::from(1u64));
        assert_eq!(m["calib_accuracy"], Value::from(0.5));
        let expected_mse = (0.01 + 0.36 + 0.09 + 0.64) / 4.0;
        assert!((m["calib_mse"].as_f64().unwrap() - expected_mse).abs() < 1e-12);
        let expected_bias = (0.1 + 0.6 - 0.3 - 0.8) / 4.0;
        assert!((m["calib_bias"].as_f64().unwrap() - expected_bias).abs() < 1e-12);
    }

    #[test]
    fn population_std_matches_definition() {
        assert_eq!(population_std(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]), 2.0);
        assert_eq!(population_std(&[]), 0.0);
    }
}
