use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use lab_core::{BackendKind, ExecutorKind, RunConfig, RunResult, RunStatus};
use lab_runner::{EnsembleOutcome, EnsemblePlan, RunRecord, Runner};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// Exit code when a run (or any ensemble member) finished with `status=error`.
const EXIT_RUN_ERROR: i32 = 2;

#[derive(Parser)]
#[command(name = "lab", version, about = "Headless layer/pattern simulation lab")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BackendArg {
    #[value(name = "classical")]
    Classical,
    #[value(name = "quantum")]
    Quantum,
    #[value(name = "hybrid")]
    Hybrid,
}

impl From<BackendArg> for BackendKind {
    fn from(value: BackendArg) -> Self {
        match value {
            BackendArg::Classical => BackendKind::Classical,
            BackendArg::Quantum => BackendKind::Quantum,
            BackendArg::Hybrid => BackendKind::Hybrid,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ExecutorArg {
    #[value(name = "local_sequential")]
    LocalSequential,
    #[value(name = "local_parallel")]
    LocalParallel,
}

impl From<ExecutorArg> for ExecutorKind {
    fn from(value: ExecutorArg) -> Self {
        match value {
            ExecutorArg::LocalSequential => ExecutorKind::LocalSequential,
            ExecutorArg::LocalParallel => ExecutorKind::LocalParallel,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run one config, or its ensemble when enabled.
    Run {
        #[arg(long)]
        config: PathBuf,
        #[arg(long, value_enum)]
        backend: Option<BackendArg>,
        #[arg(long)]
        ensemble_enabled: bool,
        #[arg(long)]
        n_runs: Option<usize>,
        #[arg(long)]
        dataset_description: Option<String>,
        #[arg(long, value_enum)]
        executor: Option<ExecutorArg>,
        #[arg(long)]
        root: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Most recent registry records, newest first.
    Runs {
        #[arg(long, default_value_t = 10)]
        latest: usize,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        root: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Expanded ensemble plan, nothing is executed.
    Describe {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        root: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

struct CommandOutput {
    payload: Option<Value>,
    run_error: bool,
}

impl CommandOutput {
    fn printed(run_error: bool) -> Self {
        Self {
            payload: None,
            run_error,
        }
    }

    fn json(payload: Value, run_error: bool) -> Self {
        Self {
            payload: Some(payload),
            run_error,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(output) => {
            if let Some(payload) = &output.payload {
                emit_json(payload);
            }
            if output.run_error {
                std::process::exit(EXIT_RUN_ERROR);
            }
            Ok(())
        }
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{err:#}"), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<CommandOutput> {
    match command {
        Commands::Run {
            config,
            backend,
            ensemble_enabled,
            n_runs,
            dataset_description,
            executor,
            root,
            json,
        } => {
            let mut cfg = lab_runner::load_config(&config);
            apply_run_flags(
                &mut cfg,
                backend,
                ensemble_enabled,
                n_runs,
                dataset_description,
                executor,
            );
            let runner = Runner::new(lab_root(root)?);
            let config_path = config.display().to_string();

            if cfg.ensemble.enabled {
                let outcome = runner.run_ensemble(&cfg, &config_path)?;
                let run_error = outcome.any_error();
                if json {
                    return Ok(CommandOutput::json(
                        json!({
                            "ok": true,
                            "command": "run",
                            "ensemble": ensemble_to_json(&outcome),
                        }),
                        run_error,
                    ));
                }
                print_ensemble(&outcome);
                return Ok(CommandOutput::printed(run_error));
            }

            let result = runner.run_config(&cfg, &config_path)?;
            let run_error = result.status == RunStatus::Error;
            if json {
                return Ok(CommandOutput::json(
                    json!({
                        "ok": true,
                        "command": "run",
                        "run": run_result_to_json(&result),
                    }),
                    run_error,
                ));
            }
            print_run(&result);
            Ok(CommandOutput::printed(run_error))
        }
        Commands::Runs {
            latest,
            config,
            root,
            json,
        } => {
            let cfg = config
                .as_deref()
                .map(lab_runner::load_config)
                .unwrap_or_default();
            let runner = Runner::new(lab_root(root)?);
            let registry = runner.registry(&cfg);
            let records = registry.latest(latest)?;
            if json {
                return Ok(CommandOutput::json(
                    json!({
                        "ok": true,
                        "command": "runs",
                        "registry": registry.path().display().to_string(),
                        "runs": records.iter().map(record_to_json).collect::<Vec<_>>(),
                    }),
                    false,
                ));
            }
            println!("registry: {}", registry.path().display());
            for record in &records {
                println!(
                    "{} backend={} status={} config={}",
                    record.run_id, record.backend, record.status, record.config_path
                );
            }
            Ok(CommandOutput::printed(false))
        }
        Commands::Describe { config, root, json } => {
            let cfg = lab_runner::try_load_config(&config)?;
            let plan = Runner::new(lab_root(root)?).describe(&cfg)?;
            if json {
                return Ok(CommandOutput::json(
                    json!({
                        "ok": true,
                        "command": "describe",
                        "plan": plan_to_json(&plan),
                    }),
                    false,
                ));
            }
            print_plan(&plan);
            Ok(CommandOutput::printed(false))
        }
    }
}

fn apply_run_flags(
    cfg: &mut RunConfig,
    backend: Option<BackendArg>,
    ensemble_enabled: bool,
    n_runs: Option<usize>,
    dataset_description: Option<String>,
    executor: Option<ExecutorArg>,
) {
    if let Some(b) = backend {
        cfg.backend = Some(b.into());
    }
    if ensemble_enabled {
        cfg.ensemble.enabled = true;
    }
    if let Some(n) = n_runs {
        cfg.ensemble.n_runs = n;
    }
    if let Some(text) = dataset_description {
        cfg.ensemble.description = text;
    }
    if let Some(e) = executor {
        cfg.executor.kind = e.into();
    }
}

fn lab_root(root: Option<PathBuf>) -> Result<PathBuf> {
    match root {
        Some(p) => Ok(p),
        None => Ok(std::env::current_dir()?),
    }
}

fn print_run(result: &RunResult) {
    println!(
        "run_id={} backend={} status={}",
        result.run_id, result.backend, result.status
    );
    if result.status != RunStatus::Ok {
        if let Some(reason) = &result.reason {
            println!("reason={reason}");
        }
        if let Some(note) = result.metrics.get("note").and_then(Value::as_str) {
            println!("note={note}");
        }
    }
}

fn print_ensemble(outcome: &EnsembleOutcome) {
    match &outcome.dataset_id {
        Some(id) => println!("dataset_id={} runs={}", id, outcome.runs.len()),
        None => {
            for run in &outcome.runs {
                print_run(run);
            }
        }
    }
    if let Some(path) = &outcome.manifest_path {
        println!("manifest: {}", path.display());
    }
    for run in outcome.runs.iter().filter(|r| r.status == RunStatus::Error) {
        println!(
            "error: run_id={} reason={}",
            run.run_id,
            run.reason.as_deref().unwrap_or("unknown")
        );
    }
}

fn print_plan(plan: &EnsemblePlan) {
    println!("backend: {}", plan.backend);
    println!("scenario: {}", plan.scenario);
    println!("ensemble_enabled: {}", plan.ensemble_enabled);
    println!("mode: {}", plan.mode);
    println!("executor: {}", plan.executor.as_str());
    println!("max_workers: {}", plan.max_workers);
    println!("config_hash: {}", plan.config_hash);
    println!("runs: {}", plan.runs.len());
    for run in &plan.runs {
        println!(
            "  [{}] seed={} overrides={}",
            run.index,
            run.seed,
            Value::Object(run.overrides.clone())
        );
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Runs { json, .. }
        | Commands::Describe { json, .. } => *json,
    }
}

fn path_json(path: Option<&Path>) -> Value {
    path.map_or(Value::Null, |p| Value::from(p.display().to_string()))
}

fn run_result_to_json(result: &RunResult) -> Value {
    json!({
        "run_id": result.run_id,
        "status": result.status,
        "reason": result.reason,
        "backend": result.backend,
        "scenario": result.scenario,
        "seed": result.seed,
        "config_hash": result.config_hash,
        "git_commit": result.git_commit,
        "dataset_id": result.dataset_id,
        "log_path": result.log_path.display().to_string(),
        "results_path": result.results_path.display().to_string(),
        "metrics": result.metrics,
    })
}

fn ensemble_to_json(outcome: &EnsembleOutcome) -> Value {
    json!({
        "dataset_id": outcome.dataset_id,
        "manifest_path": path_json(outcome.manifest_path.as_deref()),
        "summary_path": path_json(outcome.summary_path.as_deref()),
        "runs": outcome.runs.iter().map(run_result_to_json).collect::<Vec<_>>(),
    })
}

fn record_to_json(record: &RunRecord) -> Value {
    serde_json::to_value(record).unwrap_or_else(|_| json!({ "run_id": record.run_id }))
}

fn plan_to_json(plan: &EnsemblePlan) -> Value {
    let runs: Vec<Value> = plan
        .runs
        .iter()
        .map(|r| {
            json!({
                "index": r.index,
                "seed": r.seed,
                "overrides": r.overrides,
            })
        })
        .collect();
    json!({
        "backend": plan.backend,
        "scenario": plan.scenario,
        "ensemble_enabled": plan.ensemble_enabled,
        "mode": plan.mode,
        "executor": plan.executor.as_str(),
        "max_workers": plan.max_workers,
        "config_hash": plan.config_hash,
        "runs": runs,
    })
}
