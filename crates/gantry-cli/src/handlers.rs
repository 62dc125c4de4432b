//! Command handlers.
//!
//! Handlers that start a run return whether the run succeeded; every other
//! handler returns `Ok(true)` unless it errors.

use crate::config::CliConfig;
use crate::pipeline::{find_pipeline_file, load_pipeline, source_dir_for};
use anyhow::{Context, Result, bail};
use chrono::Utc;
use console::style;
use gantry_core::events::RunEvent;
use gantry_core::ids::RunId;
use gantry_core::pipeline::{PipelineDefinition, TriggerType};
use gantry_core::run::{JobState, RunReport, RunRequest, RunStatus, StepStatus, TriggerInfo};
use gantry_runner::{JobRunner, JobRunnerConfig, RunnerConfig};
use gantry_scheduler::{
    DagBuilder, ExecutionDag, Scheduler, SchedulerConfig, TriggerEvaluator, TriggerEvent,
};
use gantry_secrets::{EnvProvider, FileProvider, SecretBinder, SecretProvider};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lines of output shown for each failed step.
const LOG_TAIL_LINES: usize = 20;

pub const TEMPLATE: &str = r#"name: python-package
description: Test across supported Python versions, then publish.

triggers:
  - type: push
    branches: [main]
    paths: ["src/**", "pyproject.toml"]
    paths_ignore: ["**/*.md"]
  - type: manual

variables:
  PACKAGE: my-package

jobs:
  - name: test
    matrix:
      axes:
        python-version: ["3.10", "3.11", "3.12"]
    runtime:
      versions:
        python: "${{ matrix.python-version }}"
    steps:
      - name: checkout
        uses: checkout@v1
      - name: setup python
        uses: setup-runtime@v1
        with:
          language: python
          version: "${{ matrix.python-version }}"
      - name: test
        run: python -m pytest

  - name: publish
    needs: [test]
    env:
      TWINE_PASSWORD:
        secret: PYPI_TOKEN
    steps:
      - name: checkout
        uses: checkout@v1
      - name: build
        run: python -m build
      - name: upload dist
        uses: upload-artifact@v1
        with:
          name: dist
          path: dist
"#;

/// Write a starter pipeline.
pub fn init(dir: &Path, force: bool) -> Result<bool> {
    let path = dir.join("gantry.yaml");

    if path.exists() && !force {
        println!("{} gantry.yaml already exists", style("!").yellow());
        return Ok(true);
    }

    std::fs::write(&path, TEMPLATE).with_context(|| format!("writing {}", path.display()))?;
    println!("{} Created {}", style("✓").green(), path.display());
    Ok(true)
}

/// Load a pipeline and build its execution DAG, validating it fully.
fn load_and_plan(path: Option<&str>) -> Result<(PathBuf, PipelineDefinition, ExecutionDag)> {
    let file = find_pipeline_file(Path::new("."), path)?;
    let definition = load_pipeline(&file)?;
    let dag = DagBuilder::new()
        .build(&definition)
        .with_context(|| format!("{} is not a valid pipeline", file.display()))?;
    Ok((file, definition, dag))
}

/// Validate a pipeline definition.
pub fn validate(path: Option<&str>) -> Result<bool> {
    let (file, definition, dag) = load_and_plan(path)?;

    println!(
        "{} Pipeline \"{}\" is valid ({})",
        style("✓").green(),
        definition.name,
        file.display()
    );
    println!(
        "  Jobs: {} ({} instances)",
        definition.jobs.len(),
        dag.len()
    );
    for job in &definition.jobs {
        let instances = dag.instances_of(&job.name).len();
        let needs = if job.needs.is_empty() {
            String::new()
        } else {
            format!(" needs [{}]", job.needs.join(", "))
        };
        println!(
            "    - {} ({} steps, {} instances){}",
            job.name,
            job.steps.len(),
            instances,
            style(needs).dim()
        );
    }

    let secrets = definition.secret_names();
    if !secrets.is_empty() {
        println!("  Secrets: {}", secrets.join(", "));
    }
    Ok(true)
}

/// Print the expanded instances in execution order.
pub fn plan(path: Option<&str>) -> Result<bool> {
    let (_, definition, dag) = load_and_plan(path)?;

    println!(
        "{} {} instances for \"{}\"",
        style("▶").cyan(),
        dag.len(),
        definition.name
    );
    for (position, index) in dag.topological_order().iter().enumerate() {
        let instance = dag.instance(*index);
        let prerequisites: Vec<String> = dag
            .prerequisites(*index)
            .into_iter()
            .map(|p| dag.instance(p).display_name())
            .collect();
        println!("  {:>3}. {}", position + 1, style(instance.display_name()).bold());
        if !prerequisites.is_empty() {
            println!("       after {}", style(prerequisites.join(", ")).dim());
        }
    }
    Ok(true)
}

/// Evaluate an event against the pipeline triggers and optionally run it.
pub async fn trigger(
    config: &CliConfig,
    path: Option<&str>,
    branch: String,
    changed_files: Vec<String>,
    manual: bool,
    execute: bool,
    json: bool,
) -> Result<bool> {
    let file = find_pipeline_file(Path::new("."), path)?;
    let definition = load_pipeline(&file)?;
    gantry_scheduler::validate(&definition)
        .with_context(|| format!("{} is not a valid pipeline", file.display()))?;

    let event = if manual {
        TriggerEvent::Manual { actor: actor() }
    } else {
        TriggerEvent::Push {
            branch,
            changed_files,
        }
    };

    let Some(request) = TriggerEvaluator::new().evaluate(&event, &definition) else {
        println!(
            "{} No trigger of \"{}\" matched; no run started",
            style("○").dim(),
            definition.name
        );
        return Ok(true);
    };

    if !json {
        println!(
            "{} Triggered {} run {}",
            style("▶").cyan(),
            request.trigger.trigger_type,
            style(request.run_id).dim()
        );
    }
    if !execute {
        if json {
            println!("{}", serde_json::to_string_pretty(&request)?);
        }
        return Ok(true);
    }

    let report = execute_run(config, &file, &definition, request, json).await?;
    Ok(report.status.is_success())
}

/// Run the pipeline locally as a manual dispatch.
pub async fn run(
    config: &CliConfig,
    path: Option<&str>,
    branch: Option<String>,
    max_parallel: Option<usize>,
    json: bool,
) -> Result<bool> {
    let file = find_pipeline_file(Path::new("."), path)?;
    let definition = load_pipeline(&file)?;

    if !TriggerEvaluator::new().matches(&TriggerEvent::Manual { actor: None }, &definition) {
        warn!(pipeline = %definition.name, "Pipeline declares no manual trigger; running anyway");
    }

    // Local runs bypass trigger evaluation.
    let request = RunRequest {
        run_id: RunId::new(),
        pipeline_name: definition.name.clone(),
        trigger: TriggerInfo {
            trigger_type: TriggerType::Manual,
            branch,
            triggered_by: actor(),
        },
        requested_at: Utc::now(),
    };

    let mut config = config.clone();
    if max_parallel.is_some() {
        config.max_parallel = max_parallel;
    }

    let report = execute_run(&config, &file, &definition, request, json).await?;
    Ok(report.status.is_success())
}

fn actor() -> Option<String> {
    std::env::var("USER").ok().filter(|user| !user.is_empty())
}

async fn secret_provider(config: &CliConfig) -> Result<Arc<dyn SecretProvider>> {
    match &config.secrets_file {
        Some(path) => {
            let provider = FileProvider::load_from_file(path)
                .await
                .with_context(|| format!("loading secrets from {}", path.display()))?;
            Ok(Arc::new(provider))
        }
        None => Ok(Arc::new(EnvProvider::new(config.env_prefix.clone()))),
    }
}

fn job_runner_config(config: &CliConfig, source_dir: PathBuf) -> JobRunnerConfig {
    let mut runner_config = JobRunnerConfig {
        source_dir,
        artifacts_dir: config.artifacts_dir.clone(),
        ..JobRunnerConfig::default()
    };
    if let Some(root) = &config.workspace_root {
        runner_config.workspace_root = root.clone();
    }
    if let Some(minutes) = config.step_timeout_minutes {
        runner_config.runner = RunnerConfig {
            timeout_seconds: Some(u64::from(minutes) * 60),
        };
    }
    runner_config
}

/// Execute an accepted run request and print its report.
pub async fn execute_run(
    config: &CliConfig,
    pipeline_path: &Path,
    definition: &PipelineDefinition,
    request: RunRequest,
    json: bool,
) -> Result<RunReport> {
    let provider = secret_provider(config).await?;
    let binder = SecretBinder::new(provider).with_variables(definition.variables.clone());
    let runner = JobRunner::new(
        job_runner_config(config, source_dir_for(pipeline_path)),
        binder,
    );

    let scheduler_config = match config.max_parallel {
        Some(max_parallel) => SchedulerConfig { max_parallel },
        None => SchedulerConfig::default(),
    };

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let scheduler = Scheduler::new(Arc::new(runner), scheduler_config).with_events(events_tx);
    let printer = tokio::spawn(print_events(events_rx, json));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl+C");
                return;
            }
            info!("Ctrl+C received, cancelling run");
            cancel.cancel();
        });
    }

    info!(run_id = %request.run_id, pipeline = %definition.name, "Executing run");
    let result = scheduler.execute(request, definition, cancel).await;
    // Dropping the scheduler closes the event channel so the printer drains.
    drop(scheduler);
    if let Err(e) = printer.await {
        debug!(error = %e, "Event printer task failed");
    }

    let report = result.context("Run could not start")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(report)
}

async fn print_events(mut rx: mpsc::UnboundedReceiver<RunEvent>, quiet: bool) {
    while let Some(event) = rx.recv().await {
        if quiet {
            continue;
        }
        match event {
            RunEvent::RunStarted(p) => println!(
                "{} Run {} of \"{}\" ({} instances)",
                style("▶").cyan(),
                style(p.run_id).dim(),
                p.pipeline_name,
                p.instance_count
            ),
            RunEvent::JobStarted(p) => println!("  {} {}", style("→").cyan(), p.display_name),
            RunEvent::JobCompleted(p) => println!(
                "  {} {} {}",
                state_marker(p.state),
                p.display_name,
                style(format_duration(p.duration_ms)).dim()
            ),
            RunEvent::JobSkipped(p) => println!(
                "  {} {} {}",
                state_marker(JobState::Skipped),
                p.display_name,
                style("skipped").dim()
            ),
            RunEvent::RunCompleted(_) => {}
        }
    }
}

fn state_marker(state: JobState) -> console::StyledObject<&'static str> {
    match state {
        JobState::Succeeded => style("✓").green(),
        JobState::Failed => style("✗").red(),
        JobState::Cancelled => style("■").yellow(),
        JobState::Skipped => style("○").dim(),
        JobState::Pending | JobState::Running => style("…").dim(),
    }
}

fn format_duration(ms: u64) -> String {
    if ms < 1000 {
        format!("{}ms", ms)
    } else {
        format!("{:.1}s", ms as f64 / 1000.0)
    }
}

fn print_report(report: &RunReport) {
    for job in &report.jobs {
        if job.outcome.state != JobState::Failed {
            continue;
        }
        println!();
        println!("{} {}", style("✗").red(), style(&job.display_name).bold());
        if let Some(error) = &job.outcome.error {
            println!("  {}", style(error).red());
        }
        for step in &job.outcome.steps {
            if !matches!(step.status, StepStatus::Failed | StepStatus::FailedIgnored) {
                continue;
            }
            let exit = step
                .exit_code
                .map(|code| format!("exit {}", code))
                .unwrap_or_else(|| "no exit code".to_string());
            println!("  step \"{}\" failed ({})", step.name, exit);
            let skip = step.log.len().saturating_sub(LOG_TAIL_LINES);
            for line in &step.log[skip..] {
                println!("    {}", style(&line.content).dim());
            }
        }
    }

    let count = |state: JobState| {
        report
            .jobs
            .iter()
            .filter(|j| j.outcome.state == state)
            .count()
    };
    let artifacts = report.artifacts().count();

    println!();
    let headline = match report.status {
        RunStatus::Succeeded => style("Run succeeded").green().bold(),
        RunStatus::Failed => style("Run failed").red().bold(),
        RunStatus::Cancelled => style("Run cancelled").yellow().bold(),
        RunStatus::Running => style("Run incomplete").dim(),
    };
    println!(
        "{} in {}: {} succeeded, {} failed, {} skipped, {} cancelled",
        headline,
        format_duration(report.duration_ms),
        count(JobState::Succeeded),
        count(JobState::Failed),
        count(JobState::Skipped),
        count(JobState::Cancelled)
    );
    if artifacts > 0 {
        println!("  Artifacts:");
        for artifact in report.artifacts() {
            println!("    - {} ({})", artifact.name, artifact.path.display());
        }
    }
}

/// Print the JSON schema of the pipeline format.
pub fn schema() -> Result<bool> {
    let schema = schemars::schema_for!(PipelineDefinition);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(true)
}

/// Show current configuration.
pub fn show_config(config: &CliConfig) -> Result<bool> {
    println!(
        "{} {}",
        style("Config file:").bold(),
        CliConfig::config_path()?.display()
    );
    println!();
    print!("{}", serde_yaml::to_string(config)?);
    Ok(true)
}

/// Set configuration value.
pub fn set_config(key: &str, value: &str) -> Result<bool> {
    let mut config = CliConfig::load()?;
    config.set(key, value)?;
    config.save()?;

    println!("{} Set {} = {}", style("✓").green(), key, value);
    Ok(true)
}

/// `--changed` only describes push events.
pub fn check_trigger_args(manual: bool, changed: &[String]) -> Result<()> {
    if manual && !changed.is_empty() {
        bail!("--changed cannot be combined with --manual");
    }
    Ok(())
}
