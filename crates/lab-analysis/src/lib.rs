//! Metrics engine: pure reductions from timeseries, run metrics, pattern
//! snapshots and statevectors to scalar summaries. Nothing in this crate
//! touches the filesystem or keeps state between calls.

mod ensemble;
mod expr;
mod quantum;
mod run_metrics;

pub use ensemble::{
    bootstrap_ci, compute_ensemble_summary, ENSEMBLE_METRICS_SCHEMA, HEADLINE_KEYS,
    NEAR_BREAKDOWN_STRESS,
};
pub use expr::{evaluate_derived, evaluate_expression};
pub use quantum::{
    density_matrix, entanglement_entropy, hermitian_eigenvalues, mutual_information,
    partial_trace, shannon_entropy, von_neumann_entropy, CMatrix, EIGEN_CUTOFF,
};
pub use run_metrics::{
    compute_run_metrics, mean, population_std, MetricsOptions, RUN_METRICS_SCHEMA,
};

use lab_core::PatternState;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AnalysisError {
    #[error("action sequences must have the same length ({left} != {right})")]
    LengthMismatch { left: usize, right: usize },
    #[error("expression error: {0}")]
    Expression(String),
}

/// Norms below this make a state count as degenerate for cosine continuity.
pub const CONTINUITY_EPS: f64 = 1e-12;

/// Cosine similarity between two flattened snapshots, `0.0` when either is
/// (numerically) all zeros.
pub fn continuity_cosine(a: &PatternState, b: &PatternState) -> f64 {
    cosine(&a.flatten(), &b.flatten())
}

pub fn cosine(a: &[f64], b: &[f64]) -> f64 {
    let n1 = a.iter().map(|v| v * v).sum::<f64>().sqrt();
    let n2 = b.iter().map(|v| v * v).sum::<f64>().sqrt();
    if n1 < CONTINUITY_EPS || n2 < CONTINUITY_EPS {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    dot / (n1 * n2)
}

/// Fraction of positions where the two action sequences differ.
pub fn behavior_divergence<T: PartialEq>(a: &[T], b: &[T]) -> Result<f64, AnalysisError> {
    if a.len() != b.len() {
        return Err(AnalysisError::LengthMismatch {
            left: a.len(),
            right: b.len(),
        });
    }
    if a.is_empty() {
        return Ok(0.0);
    }
    let diffs = a.iter().zip(b).filter(|(x, y)| x != y).count();
    Ok(diffs as f64 / a.len() as f64)
}
