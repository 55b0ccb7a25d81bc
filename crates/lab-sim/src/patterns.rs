//! Synthetic pattern population of a layer and its toy scores.

use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

const POPULATION: usize = 10;
const FEATURE_DIM: usize = 4;
const DEFAULT_IMPACT: f64 = 0.1;
const DEFAULT_META_CONSISTENCY: f64 = 0.2;

#[derive(Debug, Clone, PartialEq)]
pub struct Pattern {
    pub pattern_id: String,
    pub layer_id: String,
    pub features: Vec<f64>,
    pub impact: Option<f64>,
    pub meta_consistency: Option<f64>,
}

/// One row of `patterns.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternScore {
    pub pattern_id: String,
    pub layer_id: String,
    pub anomaly_score: f64,
    pub reflexivity: f64,
    pub self_operator: f64,
}

fn gaussian(rng: &mut impl Rng, mean: f64, sd: f64) -> Vec<f64> {
    (0..FEATURE_DIM)
        .map(|_| mean + sd * rng.sample::<f64, _>(StandardNormal))
        .collect()
}

/// Ten background patterns, plus one far-away outlier for the injection
/// scenarios.
pub fn build_population(layer_id: &str, scenario: &str, rng: &mut impl Rng) -> Vec<Pattern> {
    let mut out: Vec<Pattern> = (0..POPULATION)
        .map(|i| Pattern {
            pattern_id: format!("p{i}"),
            layer_id: layer_id.to_string(),
            features: gaussian(rng, 0.0, 0.5),
            impact: None,
            meta_consistency: None,
        })
        .collect();
    if matches!(scenario, "single_anomaly_injection" | "self_aware_anomaly") {
        out.push(Pattern {
            pattern_id: "anom".to_string(),
            layer_id: layer_id.to_string(),
            features: gaussian(rng, 3.0, 0.2),
            impact: Some(0.8),
            meta_consistency: (scenario == "self_aware_anomaly").then_some(0.9),
        });
    }
    out
}

fn norm(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

/// Anomaly is `0.5 rarity + 0.3 distance + 0.2 impact`, reflexivity is the
/// logistic of the feature variance, and the self-operator blends rarity,
/// anomaly, meta-consistency and reflexivity with equal weights.
pub fn score_population(patterns: &[Pattern]) -> Vec<PatternScore> {
    if patterns.is_empty() {
        return Vec::new();
    }
    let mut centroid = vec![0.0; FEATURE_DIM];
    for p in patterns {
        for (c, f) in centroid.iter_mut().zip(&p.features) {
            *c += f;
        }
    }
    for c in centroid.iter_mut() {
        *c /= patterns.len() as f64;
    }

    patterns
        .iter()
        .map(|p| {
            let rarity = 1.0 / (norm(&p.features) + 1e-6);
            let distance = norm(
                &p.features
                    .iter()
                    .zip(&centroid)
                    .map(|(f, c)| f - c)
                    .collect::<Vec<_>>(),
            );
            let impact = p.impact.unwrap_or(DEFAULT_IMPACT);
            let anomaly = 0.5 * rarity + 0.3 * distance + 0.2 * impact;

            let n = p.features.len().max(1) as f64;
            let mean = p.features.iter().sum::<f64>() / n;
            let var = p.features.iter().map(|f| (f - mean) * (f - mean)).sum::<f64>() / n;
            let reflexivity = 1.0 / (1.0 + (-var).exp());

            let q_pop = rarity.min(1.0);
            let q_self = (anomaly.abs() / 5.0).min(1.0);
            let q_meta = p.meta_consistency.unwrap_or(DEFAULT_META_CONSISTENCY).min(1.0);
            let self_operator = 0.25 * (q_pop + q_self + q_meta + reflexivity);

            PatternScore {
                pattern_id: p.pattern_id.clone(),
                layer_id: p.layer_id.clone(),
                anomaly_score: anomaly,
                reflexivity,
                self_operator,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn outlier_only_in_injection_scenarios() {
        let mut rng = StdRng::seed_from_u64(42);
        assert_eq!(build_population("Lk", "baseline_layer", &mut rng).len(), 10);
        let pop = build_population("Lk", "self_aware_anomaly", &mut rng);
        assert_eq!(pop.len(), 11);
        let anom = pop.last().expect("outlier");
        assert_eq!(anom.pattern_id, "anom");
        assert_eq!(anom.meta_consistency, Some(0.9));
        let single = build_population("Lk", "single_anomaly_injection", &mut rng);
        assert_eq!(single.last().and_then(|p| p.meta_consistency), None);
    }

    #[test]
    fn outlier_stands_out_by_distance() {
        let mut rng = StdRng::seed_from_u64(1);
        let pop = build_population("Lk", "single_anomaly_injection", &mut rng);
        let scores = score_population(&pop);
        let anom = scores.last().expect("outlier");
        let centroid_dist_bound = 0.3 * 2.0;
        assert!(anom.anomaly_score > centroid_dist_bound);
        assert!(scores
            .iter()
            .all(|s| (0.5..1.0).contains(&s.reflexivity) && s.self_operator > 0.0));
    }

    #[test]
    fn hand_computed_scores() {
        let p = Pattern {
            pattern_id: "x".into(),
            layer_id: "L".into(),
            features: vec![1.0, 1.0, 1.0, 1.0],
            impact: None,
            meta_consistency: None,
        };
        let s = &score_population(&[p])[0];
        let rarity = 1.0 / (2.0 + 1e-6);
        assert!((s.anomaly_score - (0.5 * rarity + 0.02)).abs() < 1e-12);
        assert!((s.reflexivity - 0.5).abs() < 1e-12);
        let expected = 0.25 * (rarity + s.anomaly_score / 5.0 + 0.2 + 0.5);
        assert!((s.self_operator - expected).abs() < 1e-12);
    }
}
