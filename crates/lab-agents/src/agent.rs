use lab_core::{Matrix, PatternState};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::{AgentError, ACTIONS};

const INTERNAL_DECAY: f64 = 0.9;
const SELF_MODEL_DECAY: f64 = 0.95;

/// Small stochastic policy with an internal state and a self-model that
/// tries to predict where that state goes next.
#[derive(Debug, Clone)]
pub struct PatternAgent {
    obs_dim: usize,
    internal_state: Vec<f64>,
    self_model_state: Vec<f64>,
    /// `3 x (obs + internal + self_model)` action logits.
    w: Matrix,
    /// `internal x internal` next-state predictor.
    w_sm: Matrix,
    rng: StdRng,
    awareness: Vec<f64>,
}

impl PatternAgent {
    pub fn new(
        obs_dim: usize,
        internal_dim: usize,
        self_model_dim: usize,
        seed: u64,
    ) -> Result<Self, AgentError> {
        if obs_dim == 0 || internal_dim == 0 {
            return Err(AgentError::InvalidDimensions {
                obs: obs_dim,
                internal: internal_dim,
            });
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let scale = 0.1 / ((obs_dim + internal_dim + self_model_dim) as f64).sqrt();
        let draw = |rng: &mut StdRng| scale * rng.sample::<f64, _>(StandardNormal);
        let internal_state = (0..internal_dim).map(|_| draw(&mut rng)).collect();
        let self_model_state = (0..self_model_dim).map(|_| draw(&mut rng)).collect();
        let w = Matrix::from_fn(3, obs_dim + internal_dim + self_model_dim, |_, _| draw(&mut rng));
        let w_sm = Matrix::from_fn(internal_dim, internal_dim, |_, _| draw(&mut rng));
        Ok(Self {
            obs_dim,
            internal_state,
            self_model_state,
            w,
            w_sm,
            rng,
            awareness: Vec::new(),
        })
    }

    /// Restores a fresh agent from a snapshot. The arrays are copied, so the
    /// new agent shares nothing with the snapshot or with other restorations.
    pub fn from_pattern_state(state: &PatternState, seed: u64) -> Result<Self, AgentError> {
        let internal_dim = state.internal_state.len();
        let self_model_dim = state.self_model_state.len();
        if internal_dim == 0 {
            return Err(AgentError::MalformedSnapshot("empty internal state".into()));
        }
        if state.w.rows != ACTIONS.len() || state.w.cols <= internal_dim + self_model_dim {
            return Err(AgentError::MalformedSnapshot(format!(
                "W is {}x{}, expected 3 x (obs + {})",
                state.w.rows,
                state.w.cols,
                internal_dim + self_model_dim
            )));
        }
        if state.w_sm.rows != internal_dim || state.w_sm.cols != internal_dim {
            return Err(AgentError::MalformedSnapshot(format!(
                "W_sm is {}x{}, expected {internal_dim}x{internal_dim}",
                state.w_sm.rows, state.w_sm.cols
            )));
        }
        if state.w.data.len() != state.w.rows * state.w.cols
            || state.w_sm.data.len() != internal_dim * internal_dim
        {
            return Err(AgentError::MalformedSnapshot(
                "matrix data does not match its shape".into(),
            ));
        }
        Ok(Self {
            obs_dim: state.w.cols - internal_dim - self_model_dim,
            internal_state: state.internal_state.clone(),
            self_model_state: state.self_model_state.clone(),
            w: state.w.clone(),
            w_sm: state.w_sm.clone(),
            rng: StdRng::seed_from_u64(seed),
            awareness: Vec::new(),
        })
    }

    pub fn snapshot(&self) -> PatternState {
        PatternState {
            internal_state: self.internal_state.clone(),
            self_model_state: self.self_model_state.clone(),
            w: self.w.clone(),
            w_sm: self.w_sm.clone(),
        }
    }

    pub fn obs_dim(&self) -> usize {
        self.obs_dim
    }

    pub fn awareness_values(&self) -> &[f64] {
        &self.awareness
    }

    pub fn last_awareness(&self) -> Option<f64> {
        self.awareness.last().copied()
    }

    /// Samples an action for `obs` and advances the internal and self-model
    /// state. Observations from a layer of another size are zero-padded or
    /// truncated to the agent's own observation width.
    pub fn act(&mut self, obs: &[f64]) -> i32 {
        let mut x = Vec::with_capacity(self.w.cols);
        x.extend((0..self.obs_dim).map(|i| obs.get(i).copied().unwrap_or(0.0)));
        x.extend_from_slice(&self.internal_state);
        x.extend_from_slice(&self.self_model_state);
        let probs = softmax(&self.w.mul_vec(&x));
        let action = ACTIONS[sample_index(&probs, self.rng.random::<f64>())];

        let predicted = self.w_sm.mul_vec(&self.internal_state);
        for (i, s) in self.internal_state.iter_mut().enumerate() {
            let o = obs.get(i).copied().unwrap_or(0.0);
            *s = INTERNAL_DECAY * *s + (1.0 - INTERNAL_DECAY) * o;
        }
        let error = norm(
            &predicted
                .iter()
                .zip(&self.internal_state)
                .map(|(p, s)| p - s)
                .collect::<Vec<_>>(),
        );
        let scale = (norm(&self.internal_state) + 1e-6).max(1.0);
        self.awareness.push((1.0 - error / scale).max(0.0));

        for (i, m) in self.self_model_state.iter_mut().enumerate() {
            let p = predicted.get(i).copied().unwrap_or(0.0);
            *m = SELF_MODEL_DECAY * *m + (1.0 - SELF_MODEL_DECAY) * p;
        }
        action
    }
}

/// Adds independent `N(0, sigma^2)` noise to every scalar of the snapshot.
pub fn perturb(state: &PatternState, sigma: f64, rng: &mut impl Rng) -> PatternState {
    if sigma <= 0.0 {
        return state.clone();
    }
    state.map(|v| v + sigma * rng.sample::<f64, _>(StandardNormal))
}

pub(crate) fn softmax(logits: &[f64]) -> Vec<f64> {
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = logits.iter().map(|l| (l - max).exp()).collect();
    let total: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / total).collect()
}

pub(crate) fn sample_index(probs: &[f64], u: f64) -> usize {
    let mut acc = 0.0;
    for (i, p) in probs.iter().enumerate() {
        acc += p;
        if u < acc {
            return i;
        }
    }
    probs.len().saturating_sub(1)
}

fn norm(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lab_analysis::continuity_cosine;

    #[test]
    fn restored_agents_do_not_alias_snapshot() {
        let agent = PatternAgent::new(11, 16, 8, 42).expect("agent");
        let snap = agent.snapshot();
        let mut a = PatternAgent::from_pattern_state(&snap, 1).expect("restore");
        let b = PatternAgent::from_pattern_state(&snap, 2).expect("restore");
        let obs = vec![1.0; 11];
        for _ in 0..5 {
            a.act(&obs);
        }
        assert_eq!(b.snapshot(), snap, "untouched copy keeps the snapshot");
        assert_ne!(a.snapshot(), snap, "stepped copy evolved independently");
        assert_eq!(a.obs_dim(), 11);
    }

    #[test]
    fn snapshot_shapes_follow_dimensions() {
        let agent = PatternAgent::new(5, 4, 2, 0).expect("agent");
        let s = agent.snapshot();
        assert_eq!((s.w.rows, s.w.cols), (3, 11));
        assert_eq!((s.w_sm.rows, s.w_sm.cols), (4, 4));
        assert_eq!(s.self_model_state.len(), 2);
    }

    #[test]
    fn malformed_snapshot_is_rejected() {
        let mut s = PatternAgent::new(5, 4, 2, 0).expect("agent").snapshot();
        s.w_sm = Matrix::zeros(3, 3);
        assert!(matches!(
            PatternAgent::from_pattern_state(&s, 0),
            Err(AgentError::MalformedSnapshot(_))
        ));
        assert!(PatternAgent::new(0, 4, 2, 0).is_err());
    }

    #[test]
    fn actions_and_awareness_stay_in_range() {
        let mut agent = PatternAgent::new(6, 8, 4, 3).expect("agent");
        for step in 0..50 {
            let obs: Vec<f64> = (0..6).map(|i| if i == step % 6 { 1.0 } else { 0.0 }).collect();
            let a = agent.act(&obs);
            assert!(ACTIONS.contains(&a));
        }
        assert_eq!(agent.awareness_values().len(), 50);
        assert!(agent
            .awareness_values()
            .iter()
            .all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn same_seed_same_actions() {
        let base = PatternAgent::new(6, 8, 4, 3).expect("agent").snapshot();
        let mut a = PatternAgent::from_pattern_state(&base, 10).expect("restore");
        let mut b = PatternAgent::from_pattern_state(&base, 10).expect("restore");
        let obs = vec![0.0, 1.0, 0.0, 0.0, 0.0, 0.5];
        let xs: Vec<i32> = (0..20).map(|_| a.act(&obs)).collect();
        let ys: Vec<i32> = (0..20).map(|_| b.act(&obs)).collect();
        assert_eq!(xs, ys);
    }

    #[test]
    fn perturbation_lowers_continuity_with_sigma() {
        let snap = PatternAgent::new(11, 16, 8, 5).expect("agent").snapshot();
        let mut rng = StdRng::seed_from_u64(0);
        let same = perturb(&snap, 0.0, &mut rng);
        assert_eq!(same, snap);
        let small = perturb(&snap, 0.001, &mut rng);
        let large = perturb(&snap, 1.0, &mut rng);
        let c_small = continuity_cosine(&snap, &small);
        let c_large = continuity_cosine(&snap, &large);
        assert!(c_small > 0.9, "{c_small}");
        assert!(c_large < c_small, "{c_large} vs {c_small}");
    }
}
