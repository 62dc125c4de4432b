//! Trigger matching and evaluation.

use chrono::Utc;
use gantry_core::ids::RunId;
use gantry_core::pipeline::{PipelineDefinition, TriggerConfig, TriggerType};
use gantry_core::run::{RunRequest, TriggerInfo};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use tracing::{debug, info, warn};

/// Event that can start a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerEvent {
    Push {
        branch: String,
        changed_files: Vec<String>,
    },
    Manual {
        actor: Option<String>,
    },
}

impl TriggerEvent {
    pub fn trigger_type(&self) -> TriggerType {
        match self {
            TriggerEvent::Push { .. } => TriggerType::Push,
            TriggerEvent::Manual { .. } => TriggerType::Manual,
        }
    }

    fn info(&self) -> TriggerInfo {
        match self {
            TriggerEvent::Push { branch, .. } => TriggerInfo {
                trigger_type: TriggerType::Push,
                branch: Some(branch.clone()),
                triggered_by: None,
            },
            TriggerEvent::Manual { actor } => TriggerInfo {
                trigger_type: TriggerType::Manual,
                branch: None,
                triggered_by: actor.clone(),
            },
        }
    }
}

/// Decides whether an event starts a run of a pipeline.
///
/// The decision is a pure function of the event and the declared triggers.
pub struct TriggerEvaluator;

impl TriggerEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Start at most one run of `pipeline` for `event`.
    ///
    /// No match is not an error; it yields `None`.
    pub fn evaluate(
        &self,
        event: &TriggerEvent,
        pipeline: &PipelineDefinition,
    ) -> Option<RunRequest> {
        if !self.matches(event, pipeline) {
            debug!(pipeline = %pipeline.name, event = ?event, "No trigger matched");
            return None;
        }

        let request = RunRequest {
            run_id: RunId::new(),
            pipeline_name: pipeline.name.clone(),
            trigger: event.info(),
            requested_at: Utc::now(),
        };
        info!(
            pipeline = %pipeline.name,
            run_id = %request.run_id,
            trigger = %event.trigger_type(),
            "Trigger matched"
        );
        Some(request)
    }

    /// Check if any declared trigger matches the event.
    ///
    /// A pipeline declaring no triggers can only be started manually.
    pub fn matches(&self, event: &TriggerEvent, pipeline: &PipelineDefinition) -> bool {
        if pipeline.triggers.is_empty() {
            return matches!(event, TriggerEvent::Manual { .. });
        }

        pipeline
            .triggers
            .iter()
            .any(|trigger| self.trigger_matches(trigger, event))
    }

    fn trigger_matches(&self, trigger: &TriggerConfig, event: &TriggerEvent) -> bool {
        match (trigger, event) {
            (
                TriggerConfig::Push {
                    branches,
                    paths,
                    paths_ignore,
                },
                TriggerEvent::Push {
                    branch,
                    changed_files,
                },
            ) => {
                branch_matches(branches, branch)
                    && paths_match(paths, paths_ignore, changed_files)
            }
            (TriggerConfig::Manual, TriggerEvent::Manual { .. }) => true,
            _ => false,
        }
    }
}

impl Default for TriggerEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

fn branch_matches(patterns: &[String], branch: &str) -> bool {
    if patterns.is_empty() {
        return true;
    }
    build_globset(patterns).is_some_and(|set| set.is_match(branch))
}

/// Path filtering for push triggers.
///
/// Files matching `paths_ignore` are disregarded. The trigger then fires if
/// `paths` is empty or any remaining file matches it. When `paths_ignore` is
/// set and every changed file is ignored, the trigger does not fire.
fn paths_match(include: &[String], ignore: &[String], changed: &[String]) -> bool {
    if include.is_empty() && ignore.is_empty() {
        return true;
    }

    let ignored = if ignore.is_empty() {
        None
    } else {
        match build_globset(ignore) {
            Some(set) => Some(set),
            None => return false,
        }
    };

    let mut relevant = changed
        .iter()
        .filter(|path| !ignored.as_ref().is_some_and(|set| set.is_match(path.as_str())));

    if include.is_empty() {
        return relevant.next().is_some();
    }

    match build_globset(include) {
        Some(set) => relevant.any(|path| set.is_match(path.as_str())),
        None => false,
    }
}

/// Compile patterns where `*` stops at `/` and `**` crosses directories.
///
/// Definitions are validated before evaluation, so a pattern failing here
/// only disables the filter it belongs to.
fn build_globset(patterns: &[String]) -> Option<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        match GlobBuilder::new(pattern).literal_separator(true).build() {
            Ok(glob) => {
                builder.add(glob);
            }
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "Invalid glob pattern");
                return None;
            }
        }
    }
    builder.build().ok()
}
