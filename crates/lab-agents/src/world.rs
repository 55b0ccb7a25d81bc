use lab_core::{Matrix, WorldConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::agent::{sample_index, softmax};
use crate::AgentError;

/// Stay, up, down, left, right as `(dy, dx)`.
pub const MOVES: [(i64, i64); 5] = [(0, 0), (-1, 0), (1, 0), (0, -1), (0, 1)];

const MAX_DIFFUSION: f64 = 0.25;
const PORTAL_REWARD: f64 = 0.5;
const NEIGHBOR_RADIUS: usize = 2;
/// Logit pull toward resource and away from stress on a move's target cell.
const FORAGE_BIAS: f64 = 2.0;
const ENERGY_DECAY: f64 = 0.95;
/// Spawn and teleport draws come from a generator offset from the layout
/// seed, so a world without agents replays the same layout and respawns.
const SPAWN_SEED_OFFSET: u64 = 7919;

/// Input width of a forager seeing a `(2r+1)^2` window of resource, stress
/// and obstacles, plus crowding, energy and a bias term.
pub fn observation_dim(view_radius: usize) -> usize {
    let side = 2 * view_radius + 1;
    3 * side * side + 3
}

#[derive(Debug, Clone)]
struct Forager {
    /// `5 x obs` move logits.
    w: Matrix,
    rng: StdRng,
    pos: (usize, usize),
    energy: f64,
}

impl Forager {
    fn new(obs_dim: usize, pos: (usize, usize), seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let scale = 0.1 / (obs_dim as f64).sqrt();
        let w = Matrix::from_fn(MOVES.len(), obs_dim, |_, _| {
            scale * rng.sample::<f64, _>(StandardNormal)
        });
        Self {
            w,
            rng,
            pos,
            energy: 0.0,
        }
    }

    fn choose(&mut self, obs: &[f64], bias: &[f64; 5], temperature: f64) -> usize {
        let logits: Vec<f64> = self
            .w
            .mul_vec(obs)
            .iter()
            .zip(bias)
            .map(|(l, b)| (l + b) / temperature)
            .collect();
        sample_index(&softmax(&logits), self.rng.random::<f64>())
    }
}

/// What one agent sees of itself after a step.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentReading {
    pub agent_id: usize,
    pub y: usize,
    pub x: usize,
    pub energy: f64,
    pub reward: f64,
    pub local_resource: f64,
    pub local_stress: f64,
    pub neighbors: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorldStep {
    pub t: usize,
    pub rewards: Vec<f64>,
    /// Net change of total resource over the step, per cell.
    pub anomaly_score: f64,
}

/// A 2D layer shared by several foragers. Resource is harvested and
/// respawns, agents leave stress behind them, and both fields diffuse.
#[derive(Debug, Clone)]
pub struct MultiAgentWorld {
    cfg: WorldConfig,
    rng: StdRng,
    spawn_rng: StdRng,
    t: usize,
    obstacles: Vec<bool>,
    portals: Vec<bool>,
    free_cells: Vec<usize>,
    resource: Vec<f64>,
    stress: Vec<f64>,
    agents: Vec<Forager>,
    last_rewards: Vec<f64>,
}

impl MultiAgentWorld {
    pub fn new(cfg: &WorldConfig, seed: u64) -> Result<Self, AgentError> {
        if cfg.width == 0 || cfg.height == 0 {
            return Err(AgentError::InvalidWorld(format!(
                "world must be at least 1x1, got {}x{}",
                cfg.width, cfg.height
            )));
        }
        if !(0.0..=MAX_DIFFUSION).contains(&cfg.diffusion) {
            return Err(AgentError::InvalidWorld(format!(
                "diffusion must be in [0, {MAX_DIFFUSION}], got {}",
                cfg.diffusion
            )));
        }
        let cells = cfg.width * cfg.height;
        let mut rng = StdRng::seed_from_u64(seed);
        let obstacles: Vec<bool> = (0..cells)
            .map(|_| rng.random::<f64>() < cfg.obstacle_ratio)
            .collect();
        let resource: Vec<f64> = (0..cells)
            .map(|_| flag(rng.random::<f64>() < cfg.resource_ratio))
            .collect();
        let portals: Vec<bool> = (0..cells)
            .map(|_| rng.random::<f64>() < cfg.portal_ratio)
            .collect();
        let free_cells: Vec<usize> = (0..cells).filter(|c| !obstacles[*c]).collect();
        if free_cells.is_empty() {
            return Err(AgentError::InvalidWorld("every cell is an obstacle".into()));
        }

        let mut spawn_rng = StdRng::seed_from_u64(seed.wrapping_add(SPAWN_SEED_OFFSET));
        let obs_dim = observation_dim(cfg.view_radius);
        let agents: Vec<Forager> = (0..cfg.n_agents)
            .map(|_| {
                let cell = free_cells[spawn_rng.random_range(0..free_cells.len())];
                let pos = (cell / cfg.width, cell % cfg.width);
                Forager::new(obs_dim, pos, spawn_rng.random())
            })
            .collect();

        Ok(Self {
            cfg: cfg.clone(),
            rng,
            spawn_rng,
            t: 0,
            obstacles,
            portals,
            free_cells,
            resource,
            stress: vec![0.0; cells],
            agents,
            last_rewards: vec![0.0; cfg.n_agents],
        })
    }

    pub fn t(&self) -> usize {
        self.t
    }

    pub fn n_agents(&self) -> usize {
        self.agents.len()
    }

    pub fn resource_field(&self) -> &[f64] {
        &self.resource
    }

    pub fn stress_field(&self) -> &[f64] {
        &self.stress
    }

    pub fn is_obstacle(&self, y: usize, x: usize) -> bool {
        self.obstacles[y * self.cfg.width + x]
    }

    pub fn resource_mean(&self) -> f64 {
        lab_analysis::mean(&self.resource)
    }

    pub fn stress_mean(&self) -> f64 {
        lab_analysis::mean(&self.stress)
    }

    pub fn stress_max(&self) -> f64 {
        self.stress.iter().copied().fold(0.0, f64::max)
    }

    /// Moves every agent once, then updates the fields.
    pub fn step(&mut self) -> WorldStep {
        let before: f64 = self.resource.iter().sum();
        let temperature = self.cfg.policy_temperature.max(1e-6);

        // Every agent decides on the same view of the fields.
        let mut moves = Vec::with_capacity(self.agents.len());
        for i in 0..self.agents.len() {
            let obs = self.observe(i);
            let bias = self.move_bias(self.agents[i].pos);
            moves.push(self.agents[i].choose(&obs, &bias, temperature));
        }

        let mut rewards = vec![0.0; self.agents.len()];
        for (i, m) in moves.into_iter().enumerate() {
            let pos = self.target(self.agents[i].pos, m);
            let c = self.index(pos);
            let take = self.resource[c].min(self.cfg.harvest_rate);
            self.resource[c] -= take;
            let mut reward = take;
            self.agents[i].pos = pos;
            if self.portals[c] {
                reward += PORTAL_REWARD;
                let k = self.spawn_rng.random_range(0..self.free_cells.len());
                self.agents[i].pos = self.position(self.free_cells[k]);
            }
            self.agents[i].energy = ENERGY_DECAY * self.agents[i].energy + reward;
            rewards[i] = reward;
        }

        for a in &self.agents {
            let c = self.index(a.pos);
            self.stress[c] += self.cfg.stress_deposit;
        }
        for s in self.stress.iter_mut() {
            *s *= self.cfg.stress_decay;
        }
        if self.cfg.diffusion > 0.0 {
            let (w, h, d) = (self.cfg.width, self.cfg.height, self.cfg.diffusion);
            self.resource = diffuse(&self.resource, w, h, d);
            self.stress = diffuse(&self.stress, w, h, d);
        }
        for c in 0..self.resource.len() {
            let refill = self.rng.random::<f64>() < self.cfg.respawn_prob;
            if refill && !self.obstacles[c] {
                self.resource[c] = 1.0;
            }
        }

        let after: f64 = self.resource.iter().sum();
        self.t += 1;
        self.last_rewards = rewards.clone();
        WorldStep {
            t: self.t,
            rewards,
            anomaly_score: (after - before).abs() / self.resource.len() as f64,
        }
    }

    pub fn readings(&self) -> Vec<AgentReading> {
        self.agents
            .iter()
            .enumerate()
            .map(|(i, a)| {
                let c = self.index(a.pos);
                AgentReading {
                    agent_id: i,
                    y: a.pos.0,
                    x: a.pos.1,
                    energy: a.energy,
                    reward: self.last_rewards.get(i).copied().unwrap_or(0.0),
                    local_resource: self.resource[c],
                    local_stress: self.stress[c],
                    neighbors: self.neighbors(i),
                }
            })
            .collect()
    }

    fn index(&self, (y, x): (usize, usize)) -> usize {
        y * self.cfg.width + x
    }

    fn position(&self, cell: usize) -> (usize, usize) {
        (cell / self.cfg.width, cell % self.cfg.width)
    }

    fn cell_at(&self, y: i64, x: i64) -> Option<usize> {
        let inside = y >= 0
            && x >= 0
            && (y as usize) < self.cfg.height
            && (x as usize) < self.cfg.width;
        inside.then(|| y as usize * self.cfg.width + x as usize)
    }

    /// Where move `m` lands from `pos`. Walls and obstacles block.
    fn target(&self, pos: (usize, usize), m: usize) -> (usize, usize) {
        let (dy, dx) = MOVES[m];
        match self.cell_at(pos.0 as i64 + dy, pos.1 as i64 + dx) {
            Some(c) if !self.obstacles[c] => self.position(c),
            _ => pos,
        }
    }

    fn move_bias(&self, pos: (usize, usize)) -> [f64; 5] {
        let mut bias = [0.0; 5];
        for (m, b) in bias.iter_mut().enumerate() {
            let c = self.index(self.target(pos, m));
            *b = FORAGE_BIAS * (self.resource[c] - self.stress[c]);
        }
        bias
    }

    fn neighbors(&self, i: usize) -> usize {
        let (y, x) = self.agents[i].pos;
        self.agents
            .iter()
            .enumerate()
            .filter(|(j, other)| {
                *j != i && other.pos.0.abs_diff(y) + other.pos.1.abs_diff(x) <= NEIGHBOR_RADIUS
            })
            .count()
    }

    fn observe(&self, i: usize) -> Vec<f64> {
        let r = self.cfg.view_radius as i64;
        let side = 2 * self.cfg.view_radius + 1;
        let window = side * side;
        let (y, x) = self.agents[i].pos;
        let mut obs = vec![0.0; observation_dim(self.cfg.view_radius)];
        for dy in -r..=r {
            for dx in -r..=r {
                let k = (dy + r) as usize * side + (dx + r) as usize;
                match self.cell_at(y as i64 + dy, x as i64 + dx) {
                    Some(c) => {
                        obs[k] = self.resource[c];
                        obs[window + k] = self.stress[c];
                        obs[2 * window + k] = flag(self.obstacles[c]);
                    }
                    None => obs[2 * window + k] = 1.0,
                }
            }
        }
        obs[3 * window] = self.neighbors(i) as f64 / self.agents.len().max(1) as f64;
        obs[3 * window + 1] = self.agents[i].energy;
        obs[3 * window + 2] = 1.0;
        obs
    }
}

/// One explicit step of the 5-point diffusion stencil. Cells past the edge
/// repeat the border value.
pub fn diffuse(field: &[f64], width: usize, height: usize, strength: f64) -> Vec<f64> {
    let at = |y: usize, x: usize| field[y * width + x];
    let mut out = vec![0.0; field.len()];
    for y in 0..height {
        for x in 0..width {
            let centre = at(y, x);
            let up = if y > 0 { at(y - 1, x) } else { centre };
            let down = if y + 1 < height { at(y + 1, x) } else { centre };
            let left = if x > 0 { at(y, x - 1) } else { centre };
            let right = if x + 1 < width { at(y, x + 1) } else { centre };
            out[y * width + x] =
                (1.0 - 4.0 * strength) * centre + strength * (up + down + left + right);
        }
    }
    out
}

/// Per-step channels of a whole multi-agent run.
#[derive(Debug, Clone, PartialEq)]
pub struct WorldRun {
    pub resource_mean: Vec<f64>,
    pub stress_mean: Vec<f64>,
    pub stress_max: Vec<f64>,
    pub anomaly_score: Vec<f64>,
    pub reward_mean: Vec<f64>,
    pub mean_neighbors: Vec<f64>,
    /// `[agent][step]`
    pub agent_energy: Vec<Vec<f64>>,
    pub agent_reward: Vec<Vec<f64>>,
    pub agent_stress: Vec<Vec<f64>>,
    /// L2 distance between the final resource field and the field of the
    /// same layout stepped without agents, divided by the cell count.
    pub anomaly_impact: f64,
}

pub fn run_world(cfg: &WorldConfig, steps: usize, seed: u64) -> Result<WorldRun, AgentError> {
    let mut world = MultiAgentWorld::new(cfg, seed)?;
    let n = world.n_agents();
    let mut run = WorldRun {
        resource_mean: Vec::with_capacity(steps),
        stress_mean: Vec::with_capacity(steps),
        stress_max: Vec::with_capacity(steps),
        anomaly_score: Vec::with_capacity(steps),
        reward_mean: Vec::with_capacity(steps),
        mean_neighbors: Vec::with_capacity(steps),
        agent_energy: vec![Vec::with_capacity(steps); n],
        agent_reward: vec![Vec::with_capacity(steps); n],
        agent_stress: vec![Vec::with_capacity(steps); n],
        anomaly_impact: 0.0,
    };
    for _ in 0..steps {
        let step = world.step();
        let readings = world.readings();
        run.resource_mean.push(world.resource_mean());
        run.stress_mean.push(world.stress_mean());
        run.stress_max.push(world.stress_max());
        run.anomaly_score.push(step.anomaly_score);
        run.reward_mean.push(lab_analysis::mean(&step.rewards));
        let crowding: Vec<f64> = readings.iter().map(|r| r.neighbors as f64).collect();
        run.mean_neighbors.push(lab_analysis::mean(&crowding));
        for r in &readings {
            run.agent_energy[r.agent_id].push(r.energy);
            run.agent_reward[r.agent_id].push(r.reward);
            run.agent_stress[r.agent_id].push(r.local_stress);
        }
    }

    let empty_cfg = WorldConfig {
        n_agents: 0,
        ..cfg.clone()
    };
    let mut empty = MultiAgentWorld::new(&empty_cfg, seed)?;
    for _ in 0..steps {
        empty.step();
    }
    let delta: f64 = world
        .resource_field()
        .iter()
        .zip(empty.resource_field())
        .map(|(a, b)| (a - b) * (a - b))
        .sum();
    run.anomaly_impact = delta.sqrt() / world.resource_field().len() as f64;
    Ok(run)
}

fn flag(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> WorldConfig {
        WorldConfig {
            width: 8,
            height: 6,
            n_agents: 4,
            ..WorldConfig::default()
        }
    }

    #[test]
    fn construction_rejects_degenerate_worlds() {
        let flat = WorldConfig {
            width: 0,
            ..small()
        };
        assert!(matches!(
            MultiAgentWorld::new(&flat, 0),
            Err(AgentError::InvalidWorld(_))
        ));
        let unstable = WorldConfig {
            diffusion: 0.3,
            ..small()
        };
        assert!(MultiAgentWorld::new(&unstable, 0).is_err());
        let walled = WorldConfig {
            obstacle_ratio: 1.0,
            ..small()
        };
        assert!(MultiAgentWorld::new(&walled, 0).is_err());
    }

    #[test]
    fn same_seed_replays_the_run() {
        let a = run_world(&small(), 40, 11).expect("run a");
        let b = run_world(&small(), 40, 11).expect("run b");
        assert_eq!(a, b);
        let c = run_world(&small(), 40, 12).expect("run c");
        assert_ne!(a.agent_energy, c.agent_energy);
    }

    #[test]
    fn every_channel_has_one_sample_per_step() {
        let run = run_world(&small(), 25, 3).expect("run");
        for series in [
            &run.resource_mean,
            &run.stress_mean,
            &run.stress_max,
            &run.anomaly_score,
            &run.reward_mean,
            &run.mean_neighbors,
        ] {
            assert_eq!(series.len(), 25);
        }
        for per_agent in [&run.agent_energy, &run.agent_reward, &run.agent_stress] {
            assert_eq!(per_agent.len(), 4);
            assert!(per_agent.iter().all(|s| s.len() == 25));
        }
    }

    #[test]
    fn agents_stay_on_free_cells() {
        let cfg = WorldConfig {
            obstacle_ratio: 0.3,
            ..small()
        };
        let mut world = MultiAgentWorld::new(&cfg, 5).expect("world");
        for _ in 0..50 {
            world.step();
            for r in world.readings() {
                assert!(r.y < cfg.height && r.x < cfg.width);
                assert!(!world.is_obstacle(r.y, r.x));
            }
        }
        assert_eq!(world.t(), 50);
    }

    #[test]
    fn stress_follows_agents_and_an_empty_world_has_no_impact() {
        let mut busy = MultiAgentWorld::new(&small(), 9).expect("world");
        busy.step();
        assert!(busy.stress_max() > 0.0);

        let empty_cfg = WorldConfig {
            n_agents: 0,
            ..small()
        };
        let run = run_world(&empty_cfg, 20, 9).expect("run");
        assert!(run.stress_max.iter().all(|s| *s == 0.0));
        assert_eq!(run.anomaly_impact, 0.0);
        assert!(run.agent_energy.is_empty());
    }

    #[test]
    fn diffusion_spreads_an_interior_spike_without_losing_mass() {
        let (w, h) = (5, 5);
        let mut field = vec![0.0; w * h];
        field[2 * w + 2] = 1.0;
        let out = diffuse(&field, w, h, 0.1);
        assert!((out[2 * w + 2] - 0.6).abs() < 1e-12);
        for c in [w + 2, 3 * w + 2, 2 * w + 1, 2 * w + 3] {
            assert!((out[c] - 0.1).abs() < 1e-12);
        }
        assert!((out.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert_eq!(diffuse(&field, w, h, 0.0), field);
    }
}
