use anyhow::{anyhow, bail, Result};
use lab_core::{EnsembleMode, ExecutorConfig, ExecutorKind, Metrics, RunConfig, RunResult};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;

/// One concrete run of an ensemble and the values that set it apart.
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub config: RunConfig,
    pub overrides: Metrics,
}

/// Concrete configs for every member, in submission order. A disabled
/// ensemble expands to the base config alone; an enabled repeat ensemble
/// needs `n_runs >= 1`.
pub fn expand_members(config: &RunConfig) -> Result<Vec<Member>> {
    let ens = &config.ensemble;
    if !ens.enabled {
        return Ok(vec![Member {
            config: config.clone(),
            overrides: Metrics::new(),
        }]);
    }
    match ens.mode {
        EnsembleMode::Repeat if ens.n_runs == 0 => bail!("ensemble.n_runs must be >= 1"),
        EnsembleMode::Repeat => Ok((0..ens.n_runs)
            .map(|i| {
                let mut member = config.clone();
                member.seed = config.seed.wrapping_add(i as u64);
                let mut overrides = Metrics::new();
                overrides.insert("seed".into(), Value::from(member.seed));
                Member {
                    config: member,
                    overrides,
                }
            })
            .collect()),
        EnsembleMode::Sweep => {
            let mut acc = vec![Member {
                config: config.clone(),
                overrides: Metrics::new(),
            }];
            for (name, values) in &ens.param_grid {
                if values.is_empty() {
                    bail!("param_grid entry '{name}' has no values");
                }
                let mut next = Vec::with_capacity(acc.len() * values.len());
                for member in &acc {
                    for value in values {
                        let config = member.config.with_override(name, value.clone())?;
                        let mut overrides = member.overrides.clone();
                        overrides.insert(name.clone(), value.clone());
                        next.push(Member { config, overrides });
                    }
                }
                acc = next;
            }
            Ok(acc)
        }
    }
}

pub fn expand_ensemble(config: &RunConfig) -> Result<Vec<RunConfig>> {
    Ok(expand_members(config)?
        .into_iter()
        .map(|m| m.config)
        .collect())
}

/// Runs `job` for every index in `0..n`. Results come back in index order
/// whatever the scheduling.
pub(crate) fn execute<F>(n: usize, executor: &ExecutorConfig, job: F) -> Result<Vec<RunResult>>
where
    F: Fn(usize) -> Result<RunResult> + Sync,
{
    let workers = executor.max_workers.clamp(1, n.max(1));
    if executor.kind == ExecutorKind::LocalSequential || n <= 1 || workers == 1 {
        return (0..n).map(&job).collect();
    }

    let cursor = AtomicUsize::new(0);
    let slots: Vec<Mutex<Option<Result<RunResult>>>> = (0..n).map(|_| Mutex::new(None)).collect();
    thread::scope(|s| {
        for _ in 0..workers {
            s.spawn(|| loop {
                let i = cursor.fetch_add(1, Ordering::SeqCst);
                if i >= n {
                    break;
                }
                let outcome = job(i);
                *slots[i].lock().unwrap_or_else(|e| e.into_inner()) = Some(outcome);
            });
        }
    });

    slots
        .into_iter()
        .enumerate()
        .map(|(i, slot)| {
            slot.into_inner()
                .unwrap_or_else(|e| e.into_inner())
                .unwrap_or_else(|| Err(anyhow!("ensemble member {i} produced no result")))
        })
        .collect()
}
