//! Pattern agents living in one-dimensional gridworld layers, the
//! copy/transfer experiments that compare them, and a 2D world shared by
//! several foraging agents.

mod agent;
mod experiments;
mod gridworld;
mod world;

pub use agent::{perturb, PatternAgent};
pub use experiments::{
    awareness_summary, copy_experiment, run_episode, transfer_experiment, CopyOutcome, Episode,
    TransferOutcome,
};
pub use gridworld::{GridWorld, Step};
pub use world::{
    diffuse, observation_dim, run_world, AgentReading, MultiAgentWorld, WorldRun, WorldStep, MOVES,
};

/// The discrete moves every agent chooses from.
pub const ACTIONS: [i32; 3] = [-1, 0, 1];

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AgentError {
    #[error("gridworld size must be > 1, got {0}")]
    InvalidSize(usize),
    #[error("gridworld max_steps must be > 0")]
    InvalidMaxSteps,
    #[error("agent dimensions must be positive (obs={obs}, internal={internal})")]
    InvalidDimensions { obs: usize, internal: usize },
    #[error("action must be one of -1, 0, 1, got {0}")]
    InvalidAction(i32),
    #[error("invalid world: {0}")]
    InvalidWorld(String),
    #[error("malformed pattern snapshot: {0}")]
    MalformedSnapshot(String),
    #[error(transparent)]
    Analysis(#[from] lab_analysis::AnalysisError),
}
