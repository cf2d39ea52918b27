use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use foreman_engine::{
    EngineRuntime, EngineTelemetry, FeedbackConfig, JsonlTaskStore, MemoryTaskStore,
    SimulatedExecutor, Strategy, SupervisorConfig, TaskRecord, TaskRequest, TaskStore,
    WorkerProfile,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared_event_bus::FileEventPublisher;
use shared_logging::LogLevel;
use tokio::runtime::Runtime;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "fmn", version, about = "Foreman task delegation engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Runs tasks from a JSONL file against a declared fleet.
    Run(RunArgs),
    /// Runs a self-contained simulated demo workload.
    Demo(DemoArgs),
    /// Lists recent tasks from a journal.
    List {
        /// Number of entries to display.
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[arg(long, default_value = "foreman/journal.jsonl")]
        journal: PathBuf,
    },
    /// Shows full history for a given task id.
    Status {
        task_id: Uuid,
        #[arg(long, default_value = "foreman/journal.jsonl")]
        journal: PathBuf,
    },
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// JSONL file with one task per line.
    #[arg(long)]
    tasks: PathBuf,
    /// JSON file declaring the worker fleet.
    #[arg(long)]
    fleet: PathBuf,
    #[arg(long, default_value = "foreman/journal.jsonl")]
    journal: PathBuf,
    #[arg(long)]
    event_log: Option<PathBuf>,
    #[arg(long)]
    log_path: Option<PathBuf>,
    /// Minimum level written to the log sink: debug, info, warn, or error.
    #[arg(long, default_value = "info")]
    log_level: String,
    /// Seed for the simulated execution backend.
    #[arg(long, default_value_t = 7)]
    seed: u64,
    /// Failure probability of a simulated attempt.
    #[arg(long, default_value_t = 0.1)]
    failure_rate: f64,
    /// Feedback cycles to run after the workload drains.
    #[arg(long, default_value_t = 1)]
    feedback_cycles: usize,
}

#[derive(Parser, Debug)]
struct DemoArgs {
    #[arg(long, default_value_t = 7)]
    seed: u64,
    #[arg(long, default_value_t = 4)]
    workers: usize,
    #[arg(long, default_value_t = 12)]
    tasks: usize,
    #[arg(long)]
    journal: Option<PathBuf>,
    #[arg(long)]
    event_log: Option<PathBuf>,
    #[arg(long)]
    log_path: Option<PathBuf>,
    /// Minimum level written to the log sink: debug, info, warn, or error.
    #[arg(long, default_value = "info")]
    log_level: String,
    #[arg(long, default_value_t = 2)]
    feedback_cycles: usize,
}

#[derive(Debug, Deserialize)]
struct FleetEntry {
    name: String,
    #[serde(default = "default_concurrency")]
    max_concurrency: u32,
    skills: serde_json::Map<String, Value>,
}

const fn default_concurrency() -> u32 {
    2
}

#[derive(Debug, Serialize, Deserialize)]
struct TaskSpec {
    kind: String,
    payload: Value,
    #[serde(default = "default_priority")]
    priority: u8,
    #[serde(default = "default_complexity")]
    complexity: f32,
    #[serde(default = "default_retries")]
    max_retries: u32,
}

const fn default_priority() -> u8 {
    50
}

const fn default_complexity() -> f32 {
    0.2
}

const fn default_retries() -> u32 {
    2
}

impl From<TaskSpec> for TaskRequest {
    fn from(spec: TaskSpec) -> Self {
        TaskRequest::new(spec.kind, spec.payload)
            .with_priority(spec.priority)
            .with_complexity(spec.complexity)
            .with_max_retries(spec.max_retries)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => handle_run(args),
        Commands::Demo(args) => handle_demo(args),
        Commands::List { limit, journal } => handle_list(limit, &journal),
        Commands::Status { task_id, journal } => handle_status(task_id, &journal),
    }
}

fn parse_log_level(raw: &str) -> Result<LogLevel> {
    match raw.to_ascii_lowercase().as_str() {
        "debug" => Ok(LogLevel::Debug),
        "info" => Ok(LogLevel::Info),
        "warn" => Ok(LogLevel::Warn),
        "error" => Ok(LogLevel::Error),
        other => anyhow::bail!("unknown log level {other:?}"),
    }
}

fn build_telemetry(
    log_path: Option<&Path>,
    event_log: Option<&Path>,
    log_level: &str,
) -> Result<Option<EngineTelemetry>> {
    if log_path.is_none() && event_log.is_none() {
        return Ok(None);
    }
    let mut builder = EngineTelemetry::builder("fmn").min_level(parse_log_level(log_level)?);
    if let Some(path) = log_path {
        builder = builder.log_path(path);
    }
    if let Some(path) = event_log {
        builder = builder.event_publisher(Arc::new(FileEventPublisher::new(path)?));
    }
    Ok(Some(builder.build()?))
}

fn read_fleet(path: &Path) -> Result<Vec<WorkerProfile>> {
    let file = File::open(path).with_context(|| format!("opening fleet file {path:?}"))?;
    let entries: Vec<FleetEntry> = serde_json::from_reader(BufReader::new(file))?;
    let mut profiles = Vec::with_capacity(entries.len());
    for entry in entries {
        let mut profile = WorkerProfile::new(entry.name, entry.max_concurrency);
        for (skill, proficiency) in &entry.skills {
            let proficiency = proficiency
                .as_f64()
                .with_context(|| format!("skill {skill} proficiency must be a number"))?;
            #[allow(clippy::cast_possible_truncation)]
            {
                profile = profile.with_skill(skill, proficiency as f32);
            }
        }
        profiles.push(profile);
    }
    Ok(profiles)
}

fn read_tasks(path: &Path) -> Result<Vec<TaskRequest>> {
    let file = File::open(path).with_context(|| format!("opening task file {path:?}"))?;
    let mut requests = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let spec: TaskSpec = serde_json::from_str(&line)?;
        requests.push(spec.into());
    }
    Ok(requests)
}

fn handle_run(args: RunArgs) -> Result<()> {
    let profiles = read_fleet(&args.fleet)?;
    anyhow::ensure!(!profiles.is_empty(), "fleet file declares no workers");
    let requests = read_tasks(&args.tasks)?;
    anyhow::ensure!(!requests.is_empty(), "task file declares no tasks");

    let telemetry = build_telemetry(
        args.log_path.as_deref(),
        args.event_log.as_deref(),
        &args.log_level,
    )?;
    let store: Arc<dyn TaskStore> = Arc::new(JsonlTaskStore::new(&args.journal));
    if let Some(parent) = args.journal.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut builder = EngineRuntime::builder()
        .executor(Arc::new(
            SimulatedExecutor::new(args.seed)
                .with_latency(5, 40)
                .with_failure_rate(args.failure_rate),
        ))
        .store(store)
        .default_strategy(Strategy::Parallel)
        .supervisor_config(SupervisorConfig {
            slack_factor: 5.0,
            min_timeout_ms: 500,
            cancel_grace_ms: 100,
        })
        .feedback_config(FeedbackConfig {
            deploy_margin: 0.01,
            ..FeedbackConfig::default()
        });
    if let Some(telemetry) = telemetry {
        builder = builder.telemetry(telemetry);
    }
    let runtime = builder.build();

    Runtime::new()?.block_on(drive(
        runtime,
        profiles,
        requests,
        args.feedback_cycles,
    ))
}

fn handle_demo(args: DemoArgs) -> Result<()> {
    let kinds = ["summarize", "translate", "classify"];
    let mut profiles = Vec::new();
    for idx in 0..args.workers.max(1) {
        let mut profile = WorkerProfile::new(format!("sim-worker-{}", idx + 1), 2);
        for (offset, kind) in kinds.iter().enumerate() {
            #[allow(clippy::cast_precision_loss)]
            let proficiency = 0.45 + 0.5 * (((idx + offset) % kinds.len()) as f32 / kinds.len() as f32);
            profile = profile.with_skill(*kind, proficiency);
        }
        profiles.push(profile);
    }

    let complexities = [0.2_f32, 0.5, 0.8];
    let mut requests = Vec::new();
    for idx in 0..args.tasks.max(1) {
        let kind = kinds[idx % kinds.len()];
        let request = TaskRequest::new(
            kind,
            json!({ "demo": true, "sequence": idx }),
        )
        .with_complexity(complexities[idx % complexities.len()])
        .with_max_retries(2);
        requests.push(request);
    }

    let telemetry = build_telemetry(
        args.log_path.as_deref(),
        args.event_log.as_deref(),
        &args.log_level,
    )?;
    let store: Arc<dyn TaskStore> = match &args.journal {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Arc::new(JsonlTaskStore::new(path))
        }
        None => Arc::new(MemoryTaskStore::new()),
    };

    let mut builder = EngineRuntime::builder()
        .executor(Arc::new(
            SimulatedExecutor::new(args.seed)
                .with_latency(5, 40)
                .with_failure_rate(0.15),
        ))
        .store(store)
        .default_strategy(Strategy::Parallel)
        .supervisor_config(SupervisorConfig {
            slack_factor: 5.0,
            min_timeout_ms: 500,
            cancel_grace_ms: 100,
        })
        .feedback_config(FeedbackConfig {
            min_window: 16,
            deploy_margin: 0.005,
            ..FeedbackConfig::default()
        });
    if let Some(telemetry) = telemetry {
        builder = builder.telemetry(telemetry);
    }
    let runtime = builder.build();

    Runtime::new()?.block_on(drive(
        runtime,
        profiles,
        requests,
        args.feedback_cycles,
    ))
}

async fn drive(
    runtime: EngineRuntime,
    profiles: Vec<WorkerProfile>,
    requests: Vec<TaskRequest>,
    feedback_cycles: usize,
) -> Result<()> {
    for profile in profiles {
        runtime.register_worker(profile)?;
    }

    let mut ids = Vec::with_capacity(requests.len());
    for request in requests {
        ids.push(runtime.submit(request).await?);
    }

    for id in &ids {
        let snapshot = runtime.wait_until_terminal(*id).await?;
        println!(
            "{} | {} | {} | {} subtasks",
            snapshot.record.id,
            snapshot.record.kind,
            status_label(&snapshot.record),
            snapshot.subtasks.len()
        );
    }

    for _ in 0..feedback_cycles {
        if let Some(event) = runtime.run_feedback_cycle()? {
            println!(
                "deployed parameters: utility {:.4} -> {:.4}",
                event.baseline_utility, event.candidate_utility
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let summary = json!({
        "generated_at": chrono::Utc::now(),
        "tasks": ids.len(),
        "deployments": runtime.deployments().len(),
        "parameters": *runtime.parameters(),
        "workers": runtime.workers(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn status_label(record: &TaskRecord) -> String {
    serde_json::to_value(&record.status)
        .ok()
        .and_then(|value| value.get("state").and_then(Value::as_str).map(str::to_owned))
        .unwrap_or_else(|| "unknown".into())
}

fn read_task_records(path: &Path) -> Result<Vec<TaskRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path)?;
    let mut latest: Vec<TaskRecord> = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(&line)?;
        if value.get("entry").and_then(Value::as_str) != Some("task") {
            continue;
        }
        let record: TaskRecord = serde_json::from_value(value)?;
        if let Some(existing) = latest.iter_mut().find(|r| r.id == record.id) {
            *existing = record;
        } else {
            latest.push(record);
        }
    }
    Ok(latest)
}

fn handle_list(limit: usize, journal: &Path) -> Result<()> {
    let records = read_task_records(journal)?;
    for record in records.into_iter().rev().take(limit) {
        println!(
            "{} | {} | {} | {}",
            record.id,
            record.kind,
            status_label(&record),
            record.submitted_at
        );
    }
    Ok(())
}

fn handle_status(task_id: Uuid, journal: &Path) -> Result<()> {
    let store = JsonlTaskStore::new(journal);
    let runtime = Runtime::new()?;
    let record = runtime.block_on(store.task(task_id))?;
    let Some(record) = record else {
        println!("task {task_id} not found");
        return Ok(());
    };
    println!("{}", serde_json::to_string_pretty(&record)?);
    let transitions = runtime.block_on(store.transitions(task_id))?;
    for transition in transitions {
        println!(
            "  {} {} -> {:?} (attempt {})",
            transition.at, transition.subtask_id, transition.status, transition.retry_count
        );
    }
    let outcomes = runtime.block_on(store.outcomes(task_id))?;
    for outcome in outcomes {
        println!(
            "  {} worker {} {} in {} ms{}",
            outcome.recorded_at,
            outcome.worker_id,
            if outcome.success { "succeeded" } else { "failed" },
            outcome.duration_ms,
            outcome
                .error
                .map(|category| format!(" ({category})"))
                .unwrap_or_default()
        );
    }
    Ok(())
}
