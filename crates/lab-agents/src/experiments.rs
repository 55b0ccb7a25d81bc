use lab_analysis::{behavior_divergence, continuity_cosine, mean};
use lab_core::PatternState;
use rand::Rng;

use crate::agent::{perturb, PatternAgent};
use crate::gridworld::GridWorld;
use crate::AgentError;

/// Trajectory of one agent through one layer, with snapshots at the midpoint
/// and at the end.
#[derive(Debug, Clone)]
pub struct Episode {
    pub observations: Vec<Vec<f64>>,
    pub actions: Vec<i32>,
    pub rewards: Vec<f64>,
    pub awareness: Vec<f64>,
    /// Cosine continuity of the agent after each step against its state
    /// before the first step.
    pub continuity: Vec<f64>,
    pub mid_step: usize,
    pub pattern_mid: PatternState,
    pub pattern_final: PatternState,
}

#[derive(Debug, Clone)]
pub struct CopyOutcome {
    pub copy_divergence: f64,
    pub actions_a: Vec<i32>,
    pub actions_b: Vec<i32>,
}

#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub continuity_mid_to_transferred: f64,
    pub behavior_divergence_transfer_vs_baseline: f64,
    pub awareness_after: f64,
    pub actions_trans: Vec<i32>,
    pub actions_base: Vec<i32>,
}

pub fn awareness_summary(values: &[f64]) -> f64 {
    mean(values)
}

pub fn run_episode(
    env: &mut GridWorld,
    agent: &mut PatternAgent,
    max_steps: usize,
) -> Result<Episode, AgentError> {
    let initial = agent.snapshot();
    let mid_step = max_steps / 2;
    let mut obs = env.reset();
    let mut ep = Episode {
        observations: Vec::with_capacity(max_steps),
        actions: Vec::with_capacity(max_steps),
        rewards: Vec::with_capacity(max_steps),
        awareness: Vec::with_capacity(max_steps),
        continuity: Vec::with_capacity(max_steps),
        mid_step,
        pattern_mid: initial.clone(),
        pattern_final: initial.clone(),
    };
    let mut mid = None;

    for t in 0..max_steps {
        ep.observations.push(obs.clone());
        let action = agent.act(&obs);
        let step = env.step(action)?;
        ep.actions.push(action);
        ep.rewards.push(step.reward);
        ep.awareness.push(agent.last_awareness().unwrap_or(0.0));
        let now = agent.snapshot();
        ep.continuity.push(continuity_cosine(&initial, &now));
        if t == mid_step {
            mid = Some(now);
        }
        obs = step.obs;
        if step.done {
            break;
        }
    }

    ep.pattern_final = agent.snapshot();
    ep.pattern_mid = mid.unwrap_or_else(|| ep.pattern_final.clone());
    Ok(ep)
}

/// Two agents restored from the same snapshot see the same observations;
/// any difference in their actions comes from their own sampling.
pub fn copy_experiment(
    observations: &[Vec<f64>],
    state: &PatternState,
    horizon: usize,
    seeds: (u64, u64),
) -> Result<CopyOutcome, AgentError> {
    let mut a = PatternAgent::from_pattern_state(state, seeds.0)?;
    let mut b = PatternAgent::from_pattern_state(state, seeds.1)?;
    let mut actions_a = Vec::new();
    let mut actions_b = Vec::new();
    for obs in observations.iter().take(horizon) {
        actions_a.push(a.act(obs));
        actions_b.push(b.act(obs));
    }
    Ok(CopyOutcome {
        copy_divergence: behavior_divergence(&actions_a, &actions_b)?,
        actions_a,
        actions_b,
    })
}

/// Loads the snapshot (perturbed by `sigma`) into `env` and drives it there,
/// while an unperturbed copy is fed the same observations as a baseline.
pub fn transfer_experiment(
    env: &mut GridWorld,
    state: &PatternState,
    horizon: usize,
    sigma: f64,
    rng: &mut impl Rng,
) -> Result<TransferOutcome, AgentError> {
    let loaded = perturb(state, sigma, rng);
    let mut transferred = PatternAgent::from_pattern_state(&loaded, rng.random())?;
    let mut baseline = PatternAgent::from_pattern_state(state, rng.random())?;
    let mut obs = env.reset();
    let mut actions_trans = Vec::new();
    let mut actions_base = Vec::new();

    for _ in 0..horizon {
        let act_t = transferred.act(&obs);
        let act_b = baseline.act(&obs);
        actions_trans.push(act_t);
        actions_base.push(act_b);
        let step = env.step(act_t)?;
        obs = step.obs;
        if step.done {
            break;
        }
    }

    let after = transferred.snapshot();
    Ok(TransferOutcome {
        continuity_mid_to_transferred: continuity_cosine(state, &after),
        behavior_divergence_transfer_vs_baseline: behavior_divergence(
            &actions_trans,
            &actions_base,
        )?,
        awareness_after: awareness_summary(transferred.awareness_values()),
        actions_trans,
        actions_base,
    })
}
