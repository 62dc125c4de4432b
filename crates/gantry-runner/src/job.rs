//! Executes one job instance: provision, run steps in order, tear down.

use crate::actions::ActionRunner;
use crate::environments::{Environment, EnvironmentFactory};
use crate::runner::{RunnerConfig, StepContext, StepRunner};
use crate::shell::ShellRunner;
use async_trait::async_trait;
use gantry_core::Error;
use gantry_core::ids::RunId;
use gantry_core::interpolation::InterpolationContext;
use gantry_core::pipeline::{RuntimeDescriptor, StepDefinition};
use gantry_core::ports::JobExecutor;
use gantry_core::run::{
    Artifact, JobInstance, JobOutcome, JobState, LogLine, LogStream, StepRecord, StepStatus,
};
use gantry_secrets::{EnvironmentBinding, SecretBinder};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};

const LOG_CHANNEL_CAPACITY: usize = 1024;

/// How long to wait for buffered output after a step was interrupted.
const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct JobRunnerConfig {
    /// Project tree the checkout action copies from.
    pub source_dir: PathBuf,
    /// Persistent store for artifacts; outlives every environment. Each
    /// instance writes below `<run id>/<instance index>/`.
    pub artifacts_dir: PathBuf,
    /// Parent directory for per-instance workspaces.
    pub workspace_root: PathBuf,
    pub runner: RunnerConfig,
}

impl Default for JobRunnerConfig {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::from("."),
            artifacts_dir: PathBuf::from("gantry-artifacts"),
            workspace_root: std::env::temp_dir().join("gantry"),
            runner: RunnerConfig::default(),
        }
    }
}

/// Runs job instances on the local host.
pub struct JobRunner {
    config: JobRunnerConfig,
    binder: SecretBinder,
    shell: ShellRunner,
    actions: ActionRunner,
    environments: EnvironmentFactory,
}

enum StepEnd {
    Finished(gantry_core::Result<crate::runner::StepResult>),
    Cancelled,
    JobTimedOut,
}

impl JobRunner {
    pub fn new(config: JobRunnerConfig, binder: SecretBinder) -> Self {
        Self {
            shell: ShellRunner::new(config.runner.clone()),
            actions: ActionRunner::default().with_config(config.runner.clone()),
            environments: EnvironmentFactory::new(config.workspace_root.clone()),
            config,
            binder,
        }
    }

    pub fn with_actions(mut self, actions: ActionRunner) -> Self {
        self.actions = actions.with_config(self.config.runner.clone());
        self
    }

    /// Where `instance` of `run_id` stores its artifacts.
    pub fn artifacts_dir_for(&self, run_id: RunId, instance: &JobInstance) -> PathBuf {
        self.config
            .artifacts_dir
            .join(run_id.to_string())
            .join(instance.index.get().to_string())
    }

    fn runner_for(&self, step: &StepDefinition) -> &dyn StepRunner {
        if self.shell.can_handle(step) {
            &self.shell
        } else {
            &self.actions
        }
    }

    /// Execute `instance` with an already-resolved environment binding.
    ///
    /// The environment is torn down before returning, whatever the outcome.
    pub async fn run(
        &self,
        run_id: RunId,
        instance: &JobInstance,
        binding: &EnvironmentBinding,
        cancel: CancellationToken,
    ) -> JobOutcome {
        let span = info_span!(
            "job",
            run_id = %run_id,
            job = %instance.display_name(),
            index = %instance.index
        );
        self.run_inner(run_id, instance, binding, cancel)
            .instrument(span)
            .await
    }

    async fn run_inner(
        &self,
        run_id: RunId,
        instance: &JobInstance,
        binding: &EnvironmentBinding,
        cancel: CancellationToken,
    ) -> JobOutcome {
        let start = Instant::now();
        let definition = &instance.definition;

        let mut interpolation = InterpolationContext::with_matrix(instance.matrix_strings());
        // Secrets reach steps only through the process environment.
        interpolation.variables.extend(
            binding
                .vars()
                .iter()
                .filter(|(k, _)| !binding.is_secret(k))
                .map(|(k, v)| (k.clone(), v.clone())),
        );

        let runtime = RuntimeDescriptor {
            platform: interpolation.interpolate(&definition.runtime.platform),
            versions: definition
                .runtime
                .versions
                .iter()
                .map(|(k, v)| (k.clone(), interpolation.interpolate(v)))
                .collect(),
        };

        let environment = match self.environments.create(runtime).await {
            Ok(env) => env,
            Err(e) => {
                error!(error = %e, "Failed to provision environment");
                return JobOutcome::failed_before_steps(e.to_string());
            }
        };

        let mut env = environment.env();
        env.extend(binding.vars().iter().map(|(k, v)| (k.clone(), v.clone())));
        env.insert("GANTRY_JOB".to_string(), instance.job_name.clone());
        env.insert("GANTRY_JOB_INDEX".to_string(), instance.index.get().to_string());
        for (key, value) in instance.matrix_strings() {
            let name = format!(
                "GANTRY_MATRIX_{}",
                key.to_uppercase().replace(['-', '.'], "_")
            );
            env.insert(name, value);
        }

        let deadline = definition
            .timeout_minutes
            .map(|m| tokio::time::Instant::now() + Duration::from_secs(u64::from(m) * 60));

        let mut state = JobState::Succeeded;
        let mut error_msg = None;
        let mut records = Vec::with_capacity(definition.steps.len());
        let mut artifacts: Vec<Artifact> = Vec::new();
        let artifacts_dir = self.artifacts_dir_for(run_id, instance);
        let protected_dirs = vec![
            self.config.artifacts_dir.clone(),
            self.config.workspace_root.clone(),
        ];

        info!(steps = definition.steps.len(), workspace = %environment.workspace().display(), "Starting job");

        for step in &definition.steps {
            if state != JobState::Succeeded {
                records.push(StepRecord::not_run(&step.name));
                continue;
            }

            let ctx = StepContext {
                workspace: environment.workspace().to_path_buf(),
                source_dir: self.config.source_dir.clone(),
                artifacts_dir: artifacts_dir.clone(),
                protected_dirs: protected_dirs.clone(),
                env: env.clone(),
                interpolation: interpolation.clone(),
                step: step.clone(),
            };

            info!(step = %step.name, "Executing step");
            let step_start = Instant::now();

            let (tx, mut rx) = mpsc::channel::<LogLine>(LOG_CHANNEL_CAPACITY);
            let stop_collecting = CancellationToken::new();
            let stop = stop_collecting.clone();
            let mut collector = tokio::spawn(async move {
                let mut lines = Vec::new();
                loop {
                    tokio::select! {
                        line = rx.recv() => match line {
                            Some(line) => lines.push(line),
                            None => break,
                        },
                        _ = stop.cancelled() => {
                            while let Ok(line) = rx.try_recv() {
                                lines.push(line);
                            }
                            break;
                        }
                    }
                }
                lines
            });

            let runner = self.runner_for(step);
            let end = tokio::select! {
                result = runner.execute(&ctx, tx) => StepEnd::Finished(result),
                _ = cancel.cancelled() => StepEnd::Cancelled,
                _ = wait_for(deadline) => StepEnd::JobTimedOut,
            };

            // Keep whatever arrived even if some writer still holds the pipe.
            let collected = match tokio::time::timeout(LOG_DRAIN_TIMEOUT, &mut collector).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(step = %step.name, "Step output still open, keeping collected lines");
                    stop_collecting.cancel();
                    collector.await
                }
            };
            let mut log = collected.unwrap_or_default();
            for line in &mut log {
                line.content = binding.mask(&line.content);
            }

            let duration_ms = step_start.elapsed().as_millis() as u64;
            let mut record = StepRecord {
                name: step.name.clone(),
                status: StepStatus::Succeeded,
                exit_code: None,
                duration_ms,
                log,
            };

            match end {
                StepEnd::Finished(Ok(result)) if result.success => {
                    info!(step = %step.name, duration_ms, "Step succeeded");
                    record.exit_code = Some(result.exit_code);
                    artifacts.extend(result.artifacts);
                }
                StepEnd::Finished(Ok(result)) => {
                    record.exit_code = Some(result.exit_code);
                    let message = Error::StepFailed {
                        exit_code: result.exit_code,
                        message: step.name.clone(),
                    }
                    .to_string();
                    if step.continue_on_error {
                        warn!(step = %step.name, exit_code = result.exit_code, "Step failed, continuing");
                        record.status = StepStatus::FailedIgnored;
                    } else {
                        error!(step = %step.name, exit_code = result.exit_code, "Step failed");
                        record.status = StepStatus::Failed;
                        state = JobState::Failed;
                        error_msg = Some(message);
                    }
                }
                StepEnd::Finished(Err(e)) => {
                    let message = binding.mask(&e.to_string());
                    record.log.push(LogLine {
                        stream: LogStream::Stderr,
                        line_number: record.log.len() as u32 + 1,
                        content: message.clone(),
                        timestamp: chrono::Utc::now(),
                    });
                    if step.continue_on_error {
                        warn!(step = %step.name, error = %message, "Step errored, continuing");
                        record.status = StepStatus::FailedIgnored;
                    } else {
                        error!(step = %step.name, error = %message, "Step errored");
                        record.status = StepStatus::Failed;
                        state = JobState::Failed;
                        error_msg = Some(message);
                    }
                }
                StepEnd::Cancelled => {
                    warn!(step = %step.name, "Step cancelled");
                    record.status = StepStatus::Cancelled;
                    state = JobState::Cancelled;
                }
                StepEnd::JobTimedOut => {
                    let minutes = definition.timeout_minutes.unwrap_or_default();
                    error!(step = %step.name, timeout_minutes = minutes, "Job timed out");
                    record.status = StepStatus::Failed;
                    state = JobState::Failed;
                    error_msg = Some(Error::StepTimeout { minutes }.to_string());
                }
            }

            records.push(record);
        }

        if let Err(e) = environment.teardown().await {
            warn!(error = %e, "Failed to tear down environment");
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        info!(state = %state, duration_ms, "Job finished");

        JobOutcome {
            state,
            steps: records,
            artifacts,
            error: error_msg,
            duration_ms,
        }
    }
}

async fn wait_for(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl JobExecutor for JobRunner {
    async fn execute(
        &self,
        run_id: RunId,
        instance: &JobInstance,
        cancel: CancellationToken,
    ) -> JobOutcome {
        if cancel.is_cancelled() {
            return JobOutcome::cancelled();
        }

        let binding = match self.binder.bind(instance).await {
            Ok(binding) => binding,
            Err(e) => {
                error!(job = %instance.display_name(), error = %e, "Failed to bind environment");
                return JobOutcome::failed_before_steps(e.to_string());
            }
        };

        self.run(run_id, instance, &binding, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::ids::InstanceIndex;
    use gantry_core::pipeline::{EnvValue, JobDefinition};
    use gantry_secrets::FileProvider;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        runner: JobRunner,
        workspaces: TempDir,
        artifacts: TempDir,
    }

    fn fixture() -> Fixture {
        let workspaces = tempfile::tempdir().unwrap();
        let artifacts = tempfile::tempdir().unwrap();

        let mut secrets = HashMap::new();
        secrets.insert("PYPI_TOKEN".to_string(), "pypi-s3cr3t-value".to_string());
        let binder = SecretBinder::new(Arc::new(FileProvider::from_map(secrets)));

        let config = JobRunnerConfig {
            source_dir: PathBuf::from("."),
            artifacts_dir: artifacts.path().to_path_buf(),
            workspace_root: workspaces.path().to_path_buf(),
            runner: RunnerConfig::default(),
        };

        Fixture {
            runner: JobRunner::new(config, binder),
            workspaces,
            artifacts,
        }
    }

    fn instance(job: JobDefinition) -> JobInstance {
        JobInstance {
            index: InstanceIndex::new(0),
            job_name: job.name.clone(),
            matrix: Default::default(),
            definition: Arc::new(job),
        }
    }

    fn workspace_count(dir: &TempDir) -> usize {
        std::fs::read_dir(dir.path()).unwrap().count()
    }

    #[tokio::test]
    async fn test_all_steps_succeed() {
        let f = fixture();
        let job = JobDefinition::new("build")
            .with_step(StepDefinition::run("one", "echo one"))
            .with_step(StepDefinition::run("two", "echo $GANTRY_JOB"));

        let outcome = f.runner.execute(RunId::new(), &instance(job), CancellationToken::new()).await;

        assert_eq!(outcome.state, JobState::Succeeded);
        assert_eq!(outcome.steps.len(), 2);
        assert_eq!(outcome.steps[1].log[0].content, "build");
        assert_eq!(workspace_count(&f.workspaces), 0);
    }

    #[tokio::test]
    async fn test_failing_step_stops_remaining_steps() {
        let f = fixture();
        let job = JobDefinition::new("test")
            .with_step(StepDefinition::run("ok", "true"))
            .with_step(StepDefinition::run("broken", "exit 2"))
            .with_step(StepDefinition::run("never", "echo unreachable"));

        let outcome = f.runner.execute(RunId::new(), &instance(job), CancellationToken::new()).await;

        assert_eq!(outcome.state, JobState::Failed);
        let statuses: Vec<StepStatus> = outcome.steps.iter().map(|s| s.status).collect();
        assert_eq!(
            statuses,
            vec![StepStatus::Succeeded, StepStatus::Failed, StepStatus::NotRun]
        );
        assert_eq!(outcome.steps[1].exit_code, Some(2));
        assert_eq!(workspace_count(&f.workspaces), 0);
    }

    #[tokio::test]
    async fn test_continue_on_error_keeps_going() {
        let f = fixture();
        let job = JobDefinition::new("lint")
            .with_step(StepDefinition::run("flake8", "exit 1").continue_on_error())
            .with_step(StepDefinition::run("after", "echo after"));

        let outcome = f.runner.execute(RunId::new(), &instance(job), CancellationToken::new()).await;

        assert_eq!(outcome.state, JobState::Succeeded);
        assert_eq!(outcome.steps[0].status, StepStatus::FailedIgnored);
        assert_eq!(outcome.steps[1].status, StepStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_secret_values_are_masked_in_logs() {
        let f = fixture();
        let job = JobDefinition::new("publish")
            .with_env("TWINE_PASSWORD", EnvValue::secret("PYPI_TOKEN"))
            .with_step(StepDefinition::run("leak", "echo token=$TWINE_PASSWORD"));

        let outcome = f.runner.execute(RunId::new(), &instance(job), CancellationToken::new()).await;

        assert_eq!(outcome.state, JobState::Succeeded);
        assert_eq!(outcome.steps[0].log[0].content, "token=***");
    }

    #[tokio::test]
    async fn test_missing_secret_fails_before_steps() {
        let f = fixture();
        let job = JobDefinition::new("publish")
            .with_env("TWINE_PASSWORD", EnvValue::secret("MISSING"))
            .with_step(StepDefinition::run("upload", "echo upload"));

        let outcome = f.runner.execute(RunId::new(), &instance(job), CancellationToken::new()).await;

        assert_eq!(outcome.state, JobState::Failed);
        assert!(outcome.steps.is_empty());
        assert!(outcome.error.unwrap().contains("MISSING"));
        assert_eq!(workspace_count(&f.workspaces), 0);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_running_step() {
        let f = fixture();
        let job = JobDefinition::new("slow")
            .with_step(StepDefinition::run("sleep", "sleep 30"))
            .with_step(StepDefinition::run("after", "echo after"));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let outcome = f.runner.execute(RunId::new(), &instance(job), cancel).await;

        assert_eq!(outcome.state, JobState::Cancelled);
        assert_eq!(outcome.steps[0].status, StepStatus::Cancelled);
        assert_eq!(outcome.steps[1].status, StepStatus::NotRun);
        assert!(started.elapsed() < Duration::from_secs(20));
        assert_eq!(workspace_count(&f.workspaces), 0);
    }

    #[tokio::test]
    async fn test_already_cancelled_does_not_start() {
        let f = fixture();
        let job = JobDefinition::new("build").with_step(StepDefinition::run("one", "echo one"));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = f.runner.execute(RunId::new(), &instance(job), cancel).await;

        assert_eq!(outcome.state, JobState::Cancelled);
        assert!(outcome.steps.is_empty());
    }

    #[tokio::test]
    async fn test_matrix_values_are_exported() {
        let f = fixture();
        let job = JobDefinition::new("test")
            .with_step(StepDefinition::run("show", "echo $GANTRY_MATRIX_PYTHON_VERSION"));
        let mut inst = instance(job);
        inst.matrix
            .insert("python-version".to_string(), serde_json::json!("3.11"));

        let outcome = f.runner.execute(RunId::new(), &inst, CancellationToken::new()).await;

        assert_eq!(outcome.state, JobState::Succeeded);
        assert_eq!(outcome.steps[0].log[0].content, "3.11");
    }

    fn upload_job() -> JobDefinition {
        JobDefinition::new("package")
            .with_step(StepDefinition::run("build", "mkdir -p dist && echo built > dist/out.txt"))
            .with_step(
                StepDefinition::uses("upload", "upload-artifact@v1")
                    .with_input("name", "dist")
                    .with_input("path", "dist"),
            )
    }

    #[tokio::test]
    async fn test_rerun_stores_artifacts_per_run() {
        let f = fixture();

        let first = f
            .runner
            .execute(RunId::new(), &instance(upload_job()), CancellationToken::new())
            .await;
        let second = f
            .runner
            .execute(RunId::new(), &instance(upload_job()), CancellationToken::new())
            .await;

        assert_eq!(first.state, JobState::Succeeded);
        assert_eq!(second.state, JobState::Succeeded);
        assert_ne!(first.artifacts[0].path, second.artifacts[0].path);
        for outcome in [&first, &second] {
            let path = &outcome.artifacts[0].path;
            assert!(path.starts_with(f.artifacts.path()));
            assert!(path.join("out.txt").is_file());
        }
    }

    #[tokio::test]
    async fn test_matrix_siblings_upload_the_same_name() {
        let f = fixture();
        let run_id = RunId::new();
        let left = instance(upload_job());
        let mut right = instance(upload_job());
        right.index = InstanceIndex::new(1);

        let a = f.runner.execute(run_id, &left, CancellationToken::new()).await;
        let b = f.runner.execute(run_id, &right, CancellationToken::new()).await;

        assert_eq!(a.state, JobState::Succeeded);
        assert_eq!(b.state, JobState::Succeeded);
        assert_eq!(
            a.artifacts[0].path,
            f.artifacts.path().join(run_id.to_string()).join("0").join("dist")
        );
        assert_eq!(
            b.artifacts[0].path,
            f.artifacts.path().join(run_id.to_string()).join("1").join("dist")
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancellation_kills_child_processes() {
        let f = fixture();
        let outside = tempfile::tempdir().unwrap();
        let marker = outside.path().join("marker");
        let script = format!("sh -c 'sleep 2; touch \"{}\"'\necho done", marker.display());
        let job = JobDefinition::new("slow").with_step(StepDefinition::run("nested", script));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let outcome = f.runner.execute(RunId::new(), &instance(job), cancel).await;
        let took = started.elapsed();

        assert_eq!(outcome.state, JobState::Cancelled);
        assert!(took < Duration::from_millis(1500), "cancellation took {:?}", took);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(!marker.exists());
        assert_eq!(workspace_count(&f.workspaces), 0);
    }

    #[tokio::test]
    async fn test_secret_names_are_not_interpolated() {
        let f = fixture();
        let job = JobDefinition::new("publish")
            .with_env("TWINE_PASSWORD", EnvValue::secret("PYPI_TOKEN"))
            .with_env("REPO", EnvValue::literal("pypi"))
            .with_step(StepDefinition::run(
                "show",
                "echo \"[${{ env.TWINE_PASSWORD }}] [${{ env.PYPI_TOKEN }}] [${{ env.REPO }}]\"",
            ));

        let outcome = f
            .runner
            .execute(RunId::new(), &instance(job), CancellationToken::new())
            .await;

        assert_eq!(outcome.state, JobState::Succeeded);
        assert_eq!(outcome.steps[0].log[0].content, "[] [] [pypi]");
    }
}
