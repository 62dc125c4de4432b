//! Lifecycle events published while a run executes.

use crate::ids::{InstanceIndex, RunId};
use crate::run::{JobState, RunStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted(RunStartedPayload),
    JobStarted(JobStartedPayload),
    JobCompleted(JobCompletedPayload),
    JobSkipped(JobSkippedPayload),
    RunCompleted(RunCompletedPayload),
}

impl RunEvent {
    pub fn run_id(&self) -> RunId {
        match self {
            RunEvent::RunStarted(p) => p.run_id,
            RunEvent::JobStarted(p) => p.run_id,
            RunEvent::JobCompleted(p) => p.run_id,
            RunEvent::JobSkipped(p) => p.run_id,
            RunEvent::RunCompleted(p) => p.run_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStartedPayload {
    pub run_id: RunId,
    pub pipeline_name: String,
    pub instance_count: usize,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStartedPayload {
    pub run_id: RunId,
    pub index: InstanceIndex,
    pub display_name: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCompletedPayload {
    pub run_id: RunId,
    pub index: InstanceIndex,
    pub display_name: String,
    pub state: JobState,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSkippedPayload {
    pub run_id: RunId,
    pub index: InstanceIndex,
    pub display_name: String,
    /// The prerequisite whose terminal state caused the skip.
    pub blocked_by: Option<InstanceIndex>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCompletedPayload {
    pub run_id: RunId,
    pub pipeline_name: String,
    pub status: RunStatus,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}
