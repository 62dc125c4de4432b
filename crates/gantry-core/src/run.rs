//! Run and execution types.

use crate::ids::{ArtifactId, InstanceIndex, RunId};
use crate::pipeline::{JobDefinition, TriggerType, value_to_string};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// A concrete (job definition, axis assignment) pair.
///
/// Created at matrix-expansion time and executed at most once. The
/// definition is shared read-only between all sibling instances.
#[derive(Debug, Clone)]
pub struct JobInstance {
    pub index: InstanceIndex,
    pub job_name: String,
    pub matrix: BTreeMap<String, serde_json::Value>,
    pub definition: Arc<JobDefinition>,
}

impl JobInstance {
    /// Human-readable name, e.g. `test (python-version=3.9)`.
    pub fn display_name(&self) -> String {
        let base = self
            .definition
            .display_name
            .as_deref()
            .unwrap_or(&self.job_name);

        if self.matrix.is_empty() {
            return base.to_string();
        }

        let parts: Vec<String> = self
            .matrix
            .iter()
            .map(|(k, v)| format!("{}={}", k, value_to_string(v)))
            .collect();

        format!("{} ({})", base, parts.join(", "))
    }

    /// Matrix values rendered as strings for interpolation.
    pub fn matrix_strings(&self) -> BTreeMap<String, String> {
        self.matrix
            .iter()
            .map(|(k, v)| (k.clone(), value_to_string(v)))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Skipped | JobState::Cancelled
        )
    }

    /// Whether dependents of an instance in this state must be skipped.
    pub fn blocks_dependents(&self) -> bool {
        matches!(
            self,
            JobState::Failed | JobState::Cancelled | JobState::Skipped
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Skipped => "skipped",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    /// Failed, but the step is marked continue-on-error.
    FailedIgnored,
    /// Never started because an earlier step failed or the job was cancelled.
    NotRun,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub stream: LogStream,
    pub line_number: u32,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    #[serde(default)]
    pub log: Vec<LogLine>,
}

impl StepRecord {
    pub fn not_run(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::NotRun,
            exit_code: None,
            duration_ms: 0,
            log: vec![],
        }
    }
}

/// A named file produced by a job instance for downstream consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: ArtifactId,
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Terminal result of executing one job instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutcome {
    pub state: JobState,
    pub steps: Vec<StepRecord>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    /// Why the instance did not succeed, when the cause is not a step.
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl JobOutcome {
    pub fn skipped() -> Self {
        Self::without_steps(JobState::Skipped, None)
    }

    pub fn cancelled() -> Self {
        Self::without_steps(JobState::Cancelled, None)
    }

    /// A failure that happened before any step could run.
    pub fn failed_before_steps(error: impl Into<String>) -> Self {
        Self::without_steps(JobState::Failed, Some(error.into()))
    }

    fn without_steps(state: JobState, error: Option<String>) -> Self {
        Self {
            state,
            steps: vec![],
            artifacts: vec![],
            error,
            duration_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, RunStatus::Succeeded)
    }

    /// Derive the overall status from every instance's terminal state.
    ///
    /// A run succeeds iff every non-skipped instance succeeded.
    pub fn from_states<'a, I>(states: I, cancelled: bool) -> Self
    where
        I: IntoIterator<Item = &'a JobState>,
    {
        if cancelled {
            return RunStatus::Cancelled;
        }
        let all_ok = states
            .into_iter()
            .filter(|s| **s != JobState::Skipped)
            .all(|s| *s == JobState::Succeeded);
        if all_ok {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerInfo {
    pub trigger_type: TriggerType,
    pub branch: Option<String>,
    pub triggered_by: Option<String>,
}

/// Decision to start one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub run_id: RunId,
    pub pipeline_name: String,
    pub trigger: TriggerInfo,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub index: InstanceIndex,
    pub job_name: String,
    pub display_name: String,
    pub matrix: BTreeMap<String, serde_json::Value>,
    pub outcome: JobOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub pipeline_name: String,
    pub status: RunStatus,
    pub trigger: TriggerInfo,
    pub jobs: Vec<JobReport>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl RunReport {
    /// All reports for instances of the named job.
    pub fn instances_of<'a>(&'a self, job_name: &'a str) -> impl Iterator<Item = &'a JobReport> {
        self.jobs.iter().filter(move |j| j.job_name == job_name)
    }

    pub fn artifacts(&self) -> impl Iterator<Item = &Artifact> {
        self.jobs.iter().flat_map(|j| j.outcome.artifacts.iter())
    }
}
