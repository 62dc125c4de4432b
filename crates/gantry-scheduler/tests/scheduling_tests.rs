//! End-to-end scheduling scenarios against a fake executor.

use async_trait::async_trait;
use gantry_core::ids::RunId;
use gantry_core::pipeline::PipelineDefinition;
use gantry_core::ports::JobExecutor;
use gantry_core::run::{JobInstance, JobOutcome, JobState, RunStatus};
use gantry_core::{DefinitionError, Error};
use gantry_scheduler::{Scheduler, SchedulerConfig, TriggerEvaluator, TriggerEvent};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const PACKAGE_PIPELINE: &str = r#"
name: python-package
triggers:
  - type: push
    branches: [master]
    paths: ["pkg/constants.json"]
  - type: manual
jobs:
  - name: test
    matrix:
      axes:
        python-version: ["3.9", "3.10", "3.11", "3.12", "3.13"]
    steps:
      - name: pytest
        run: pytest
  - name: publish
    needs: [test]
    steps:
      - name: upload
        run: twine upload dist/*
"#;

/// Records what ran; fails instances whose display name is listed.
#[derive(Default)]
struct FakeExecutor {
    failing: Vec<String>,
    delay: Duration,
    started: Mutex<Vec<String>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeExecutor {
    fn failing(names: &[&str]) -> Self {
        Self {
            failing: names.iter().map(|n| n.to_string()).collect(),
            ..Default::default()
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    fn started_jobs(&self, job: &str) -> usize {
        self.started()
            .iter()
            .filter(|name| name.split(' ').next() == Some(job))
            .count()
    }
}

#[async_trait]
impl JobExecutor for FakeExecutor {
    async fn execute(
        &self,
        _run_id: RunId,
        instance: &JobInstance,
        cancel: CancellationToken,
    ) -> JobOutcome {
        let name = instance.display_name();
        self.started.lock().unwrap().push(name.clone());

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let cancelled = tokio::select! {
            _ = tokio::time::sleep(self.delay) => false,
            _ = cancel.cancelled() => true,
        };
        self.running.fetch_sub(1, Ordering::SeqCst);

        if cancelled {
            return JobOutcome::cancelled();
        }
        let state = if self.failing.contains(&name) {
            JobState::Failed
        } else {
            JobState::Succeeded
        };
        JobOutcome {
            state,
            steps: vec![],
            artifacts: vec![],
            error: None,
            duration_ms: self.delay.as_millis() as u64,
        }
    }
}

fn package_pipeline() -> PipelineDefinition {
    serde_yaml::from_str(PACKAGE_PIPELINE).unwrap()
}

fn manual() -> TriggerEvent {
    TriggerEvent::Manual { actor: None }
}

#[tokio::test]
async fn test_publish_runs_once_after_all_versions_pass() {
    let def = package_pipeline();
    let executor = Arc::new(FakeExecutor::default());
    let scheduler = Scheduler::new(executor.clone(), SchedulerConfig { max_parallel: 8 });

    let request = TriggerEvaluator::new().evaluate(&manual(), &def).unwrap();
    let report = scheduler
        .execute(request, &def, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(report.jobs.len(), 6);
    assert_eq!(executor.started_jobs("test"), 5);
    assert_eq!(executor.started_jobs("publish"), 1);
    assert_eq!(executor.started().last().map(String::as_str), Some("publish"));
}

#[tokio::test]
async fn test_one_failing_version_skips_publish() {
    let def = package_pipeline();
    let executor = Arc::new(FakeExecutor::failing(&["test (python-version=3.11)"]));
    let scheduler = Scheduler::new(executor.clone(), SchedulerConfig { max_parallel: 8 });

    let request = TriggerEvaluator::new().evaluate(&manual(), &def).unwrap();
    let report = scheduler
        .execute(request, &def, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(executor.started_jobs("publish"), 0);

    let publish: Vec<JobState> = report
        .instances_of("publish")
        .map(|j| j.outcome.state)
        .collect();
    assert_eq!(publish, vec![JobState::Skipped]);

    // Siblings are unaffected by the failing instance.
    let test_states: Vec<JobState> = report.instances_of("test").map(|j| j.outcome.state).collect();
    assert_eq!(
        test_states.iter().filter(|s| **s == JobState::Succeeded).count(),
        4
    );
}

#[tokio::test]
async fn test_unrelated_push_starts_no_run() {
    let def = package_pipeline();
    let evaluator = TriggerEvaluator::new();

    let unrelated = TriggerEvent::Push {
        branch: "master".to_string(),
        changed_files: vec!["README.md".to_string(), "pkg/core.py".to_string()],
    };
    assert!(evaluator.evaluate(&unrelated, &def).is_none());

    let version_bump = TriggerEvent::Push {
        branch: "master".to_string(),
        changed_files: vec!["pkg/constants.json".to_string()],
    };
    assert!(evaluator.evaluate(&version_bump, &def).is_some());
}

#[tokio::test]
async fn test_cycle_is_rejected_before_execution() {
    let mut def = package_pipeline();
    def.jobs[0].needs.push("publish".to_string());
    let executor = Arc::new(FakeExecutor::default());
    let scheduler = Scheduler::new(executor.clone(), SchedulerConfig::default());

    let request = TriggerEvaluator::new().evaluate(&manual(), &def).unwrap();
    let err = scheduler
        .execute(request, &def, CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Definition(DefinitionError::CycleDetected)
    ));
    assert!(executor.started().is_empty());
}

#[tokio::test]
async fn test_concurrency_is_bounded() {
    let def = package_pipeline();
    let executor = Arc::new(FakeExecutor::default().with_delay(Duration::from_millis(50)));
    let scheduler = Scheduler::new(executor.clone(), SchedulerConfig { max_parallel: 2 });

    let request = TriggerEvaluator::new().evaluate(&manual(), &def).unwrap();
    let report = scheduler
        .execute(request, &def, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Succeeded);
    assert!(executor.peak.load(Ordering::SeqCst) <= 2);
    assert!(executor.peak.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn test_cancellation_cancels_running_and_skips_dependents() {
    let def = package_pipeline();
    let executor = Arc::new(FakeExecutor::default().with_delay(Duration::from_secs(30)));
    let scheduler = Scheduler::new(executor.clone(), SchedulerConfig { max_parallel: 8 });

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let request = TriggerEvaluator::new().evaluate(&manual(), &def).unwrap();
    let report = tokio::time::timeout(
        Duration::from_secs(10),
        scheduler.execute(request, &def, cancel),
    )
    .await
    .expect("run finishes promptly after cancellation")
    .unwrap();

    assert_eq!(report.status, RunStatus::Cancelled);
    for job in report.instances_of("test") {
        assert_eq!(job.outcome.state, JobState::Cancelled);
    }
    for job in report.instances_of("publish") {
        assert_eq!(job.outcome.state, JobState::Skipped);
    }
    assert_eq!(executor.started_jobs("publish"), 0);
}
