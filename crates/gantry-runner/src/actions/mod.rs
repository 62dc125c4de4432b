//! Reusable actions referenced by `uses:` steps.

pub mod artifact;
pub mod checkout;
pub mod setup_runtime;

use crate::runner::{RunnerConfig, StepContext, StepResult, StepRunner};
use async_trait::async_trait;
use gantry_core::pipeline::{StepDefinition, StepKind};
use gantry_core::run::{Artifact, LogLine, LogStream};
use gantry_core::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Action reference with optional version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRef {
    pub name: String,
    pub version: Option<String>,
}

impl ActionRef {
    /// Parse an action reference (e.g., "checkout@v1").
    pub fn parse(s: &str) -> Self {
        if let Some((name, version)) = s.split_once('@') {
            Self {
                name: name.to_string(),
                version: Some(version.to_string()),
            }
        } else {
            Self {
                name: s.to_string(),
                version: None,
            }
        }
    }

    /// Get the full reference string.
    pub fn full_name(&self) -> String {
        match &self.version {
            Some(v) => format!("{}@{}", self.name, v),
            None => self.name.clone(),
        }
    }
}

/// Input passed to action execution.
#[derive(Debug, Clone)]
pub struct ActionInput {
    /// Input parameters from the step's `with:` block, already interpolated.
    pub inputs: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    pub workspace: PathBuf,
    pub source_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub protected_dirs: Vec<PathBuf>,
    pub step_name: String,
}

impl ActionInput {
    pub fn input(&self, key: &str) -> Option<&str> {
        self.inputs
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn required(&self, key: &str) -> Result<&str> {
        self.input(key)
            .ok_or_else(|| Error::ActionFailed(format!("Missing '{}' input", key)))
    }

    /// A path input that stays below whatever directory it is joined to:
    /// relative, with no `..` components.
    pub fn relative_path(&self, key: &str) -> Result<Option<&Path>> {
        let Some(value) = self.input(key) else {
            return Ok(None);
        };
        let path = Path::new(value);
        if path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(Error::ActionFailed(format!(
                "Input '{}' must be a relative path without '..', got '{}'",
                key, value
            )));
        }
        Ok(Some(path))
    }

    pub fn required_path(&self, key: &str) -> Result<&Path> {
        self.relative_path(key)?
            .ok_or_else(|| Error::ActionFailed(format!("Missing '{}' input", key)))
    }
}

/// Output from action execution.
#[derive(Debug, Clone)]
pub struct ActionOutput {
    pub success: bool,
    pub exit_code: i32,
    pub error: Option<String>,
    pub logs: Vec<String>,
    pub artifacts: Vec<Artifact>,
}

impl ActionOutput {
    pub fn success() -> Self {
        Self {
            success: true,
            exit_code: 0,
            error: None,
            logs: vec![],
            artifacts: vec![],
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code: 1,
            error: Some(error.into()),
            logs: vec![],
            artifacts: vec![],
        }
    }

    pub fn with_log(mut self, line: impl Into<String>) -> Self {
        self.logs.push(line.into());
        self
    }
}

/// A named, versioned unit of work with declared inputs.
pub trait Action: Send + Sync {
    fn name(&self) -> &str;

    fn execute(&self, input: &ActionInput) -> Result<ActionOutput>;
}

/// Lookup table of available actions.
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
}

impl ActionRegistry {
    pub fn empty() -> Self {
        Self {
            actions: HashMap::new(),
        }
    }

    /// Registry holding the built-in actions.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(checkout::CheckoutAction::new()));
        registry.register(Arc::new(setup_runtime::SetupRuntimeAction::new()));
        registry.register(Arc::new(artifact::UploadArtifactAction::new()));
        registry
    }

    pub fn register(&mut self, action: Arc<dyn Action>) {
        debug!(action = %action.name(), "Registering action");
        self.actions.insert(action.name().to_string(), action);
    }

    /// Resolve a reference; `gantry/<name>` is accepted as an alias.
    pub fn get(&self, reference: &ActionRef) -> Option<Arc<dyn Action>> {
        let name = reference
            .name
            .strip_prefix("gantry/")
            .unwrap_or(&reference.name);
        self.actions.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.actions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Step runner for `uses:` steps.
pub struct ActionRunner {
    registry: Arc<ActionRegistry>,
    config: RunnerConfig,
}

impl ActionRunner {
    pub fn new(registry: Arc<ActionRegistry>) -> Self {
        Self {
            registry,
            config: RunnerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }
}

impl Default for ActionRunner {
    fn default() -> Self {
        Self::new(Arc::new(ActionRegistry::builtin()))
    }
}

#[async_trait]
impl StepRunner for ActionRunner {
    async fn execute(
        &self,
        ctx: &StepContext,
        output_tx: mpsc::Sender<LogLine>,
    ) -> Result<StepResult> {
        let StepKind::Action { uses, with } = &ctx.step.kind else {
            return Err(Error::Internal(format!(
                "Step {} is not an action step",
                ctx.step.name
            )));
        };

        let reference = ActionRef::parse(uses);
        let action = self
            .registry
            .get(&reference)
            .ok_or_else(|| Error::ActionNotFound(reference.full_name()))?;

        info!(step = %ctx.step.name, action = %reference.full_name(), "Executing action");

        let mut env = ctx.env.clone();
        env.extend(ctx.step.env.clone());

        let input = ActionInput {
            inputs: with
                .iter()
                .map(|(k, v)| (k.clone(), ctx.interpolation.interpolate(v)))
                .collect(),
            env,
            workspace: ctx.workspace.clone(),
            source_dir: ctx.source_dir.clone(),
            artifacts_dir: ctx.artifacts_dir.clone(),
            protected_dirs: ctx.protected_dirs.clone(),
            step_name: ctx.step.name.clone(),
        };

        let start = std::time::Instant::now();
        let limit = self.config.timeout_for(&ctx.step);
        let task = tokio::task::spawn_blocking(move || action.execute(&input));
        let output = match tokio::time::timeout(limit, task).await {
            Ok(joined) => {
                joined.map_err(|e| Error::ActionFailed(format!("Action task failed: {}", e)))??
            }
            Err(_) => {
                warn!(
                    step = %ctx.step.name,
                    action = %reference.full_name(),
                    timeout_secs = limit.as_secs(),
                    "Action timed out"
                );
                return Err(Error::StepTimeout {
                    minutes: (limit.as_secs() / 60) as u32,
                });
            }
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        let mut line_number = 0u32;
        for content in &output.logs {
            line_number += 1;
            let _ = output_tx
                .send(LogLine {
                    stream: LogStream::Stdout,
                    line_number,
                    content: content.clone(),
                    timestamp: chrono::Utc::now(),
                })
                .await;
        }
        if let Some(error) = &output.error {
            warn!(step = %ctx.step.name, action = %reference.full_name(), "Action failed");
            let _ = output_tx
                .send(LogLine {
                    stream: LogStream::Stderr,
                    line_number: 1,
                    content: error.clone(),
                    timestamp: chrono::Utc::now(),
                })
                .await;
        }

        Ok(StepResult {
            exit_code: output.exit_code,
            success: output.success,
            duration_ms,
            artifacts: output.artifacts,
        })
    }

    fn can_handle(&self, step: &StepDefinition) -> bool {
        !step.is_shell()
    }
}
