//! Core runner trait and types.

use async_trait::async_trait;
use gantry_core::Result;
use gantry_core::interpolation::InterpolationContext;
use gantry_core::pipeline::StepDefinition;
use gantry_core::run::{Artifact, LogLine};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

/// Result of step execution.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub exit_code: i32,
    pub success: bool,
    pub duration_ms: u64,
    pub artifacts: Vec<Artifact>,
}

impl StepResult {
    pub fn from_exit_code(exit_code: i32, duration_ms: u64) -> Self {
        Self {
            exit_code,
            success: exit_code == 0,
            duration_ms,
            artifacts: vec![],
        }
    }
}

/// Context for step execution.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// The instance's isolated working directory.
    pub workspace: PathBuf,
    /// Where the checkout action copies the project from.
    pub source_dir: PathBuf,
    /// Where artifact-producing actions place their files; scoped to the
    /// run and instance.
    pub artifacts_dir: PathBuf,
    /// Directories a source copy must never descend into.
    pub protected_dirs: Vec<PathBuf>,
    /// Fully bound environment (pipeline variables, job env, secrets).
    pub env: BTreeMap<String, String>,
    /// Matrix and variable values for `${{ }}` expressions.
    pub interpolation: InterpolationContext,
    pub step: StepDefinition,
}

/// Trait for step execution.
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Execute a step, streaming output to the provided channel.
    ///
    /// A non-zero exit is reported through [`StepResult`]; `Err` is reserved
    /// for failures to run the step at all (spawn errors, timeouts, unknown
    /// actions).
    async fn execute(&self, ctx: &StepContext, output_tx: mpsc::Sender<LogLine>)
    -> Result<StepResult>;

    /// Check if this runner can handle the given step.
    fn can_handle(&self, step: &StepDefinition) -> bool;
}

/// Configuration for step execution.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub timeout_seconds: Option<u64>,
}

impl RunnerConfig {
    /// Effective timeout for a step, preferring the step's own setting.
    pub fn timeout_for(&self, step: &StepDefinition) -> Duration {
        match (step.timeout_minutes, self.timeout_seconds) {
            (Some(minutes), _) => Duration::from_secs(u64::from(minutes) * 60),
            (None, Some(secs)) => Duration::from_secs(secs),
            (None, None) => Duration::MAX,
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: Some(3600), // 1 hour default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_timeout_overrides_default() {
        let config = RunnerConfig::default();
        let mut step = StepDefinition::run("build", "make");
        assert_eq!(config.timeout_for(&step), Duration::from_secs(3600));

        step.timeout_minutes = Some(2);
        assert_eq!(config.timeout_for(&step), Duration::from_secs(120));
    }
}
