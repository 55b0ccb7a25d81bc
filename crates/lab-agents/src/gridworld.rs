use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::{AgentError, ACTIONS};

/// A 1D layer: the agent walks cells `0..size` and is rewarded on the last one.
#[derive(Debug, Clone)]
pub struct GridWorld {
    size: usize,
    max_steps: usize,
    rng: StdRng,
    t: usize,
    pos: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub obs: Vec<f64>,
    pub reward: f64,
    pub done: bool,
    pub pos: usize,
    pub t: usize,
}

impl GridWorld {
    pub fn new(size: usize, max_steps: usize, seed: u64) -> Result<Self, AgentError> {
        if size <= 1 {
            return Err(AgentError::InvalidSize(size));
        }
        if max_steps == 0 {
            return Err(AgentError::InvalidMaxSteps);
        }
        Ok(Self {
            size,
            max_steps,
            rng: StdRng::seed_from_u64(seed),
            t: 0,
            pos: 0,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    /// One-hot position plus normalized time.
    pub fn obs_dim(&self) -> usize {
        self.size + 1
    }

    pub fn reset(&mut self) -> Vec<f64> {
        self.pos = self.rng.random_range(0..self.size);
        self.t = 0;
        self.observation()
    }

    pub fn step(&mut self, action: i32) -> Result<Step, AgentError> {
        if !ACTIONS.contains(&action) {
            return Err(AgentError::InvalidAction(action));
        }
        let last = (self.size - 1) as i64;
        self.pos = (self.pos as i64 + action as i64).clamp(0, last) as usize;
        self.t += 1;
        Ok(Step {
            obs: self.observation(),
            reward: if self.pos == self.size - 1 { 1.0 } else { 0.0 },
            done: self.t >= self.max_steps,
            pos: self.pos,
            t: self.t,
        })
    }

    fn observation(&self) -> Vec<f64> {
        let mut obs = vec![0.0; self.obs_dim()];
        obs[self.pos] = 1.0;
        obs[self.size] = self.t as f64 / self.max_steps as f64;
        obs
    }
}
