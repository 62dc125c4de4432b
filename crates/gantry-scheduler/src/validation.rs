//! Structural checks on a pipeline definition.

use gantry_core::DefinitionError;
use gantry_core::pipeline::{EnvValue, PipelineDefinition, StepKind};
use globset::GlobBuilder;
use std::collections::HashSet;

/// Run every structural check against a definition.
///
/// This checks:
/// - there is at least one job, and job names are unique
/// - every `needs` entry refers to another declared job
/// - no matrix axis is empty
/// - every trigger pattern compiles
/// - every job has steps, and every step has a script or an action reference
/// - secret references name a secret
///
/// Dependency cycles are reported when the execution DAG is built.
pub fn validate(def: &PipelineDefinition) -> Result<(), DefinitionError> {
    ensure_has_jobs(def)?;
    validate_job_names(def)?;
    validate_needs(def)?;
    validate_triggers(def)?;
    for job in &def.jobs {
        validate_matrix(&job.name, job.matrix.as_ref())?;
        validate_steps(job)?;
        validate_env(job)?;
    }
    Ok(())
}

fn ensure_has_jobs(def: &PipelineDefinition) -> Result<(), DefinitionError> {
    if def.jobs.is_empty() {
        return Err(DefinitionError::EmptyPipeline);
    }
    Ok(())
}

fn validate_job_names(def: &PipelineDefinition) -> Result<(), DefinitionError> {
    let mut seen = HashSet::new();
    for job in &def.jobs {
        if !seen.insert(job.name.as_str()) {
            return Err(DefinitionError::DuplicateJob(job.name.clone()));
        }
    }
    Ok(())
}

fn validate_needs(def: &PipelineDefinition) -> Result<(), DefinitionError> {
    for job in &def.jobs {
        for dep in &job.needs {
            if dep == &job.name {
                return Err(DefinitionError::SelfDependency(job.name.clone()));
            }
            if def.job(dep).is_none() {
                return Err(DefinitionError::UnknownDependency {
                    job: job.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }
    Ok(())
}

fn validate_triggers(def: &PipelineDefinition) -> Result<(), DefinitionError> {
    for trigger in &def.triggers {
        for pattern in trigger.patterns() {
            GlobBuilder::new(pattern)
                .literal_separator(true)
                .build()
                .map_err(|e| DefinitionError::InvalidGlob {
                    pattern: pattern.to_string(),
                    message: e.kind().to_string(),
                })?;
        }
    }
    Ok(())
}

fn validate_matrix(
    job: &str,
    matrix: Option<&gantry_core::pipeline::MatrixConfig>,
) -> Result<(), DefinitionError> {
    let Some(matrix) = matrix else {
        return Ok(());
    };
    for (axis, values) in &matrix.axes {
        if values.is_empty() {
            return Err(DefinitionError::EmptyMatrixAxis {
                job: job.to_string(),
                axis: axis.clone(),
            });
        }
    }
    Ok(())
}

fn validate_steps(job: &gantry_core::pipeline::JobDefinition) -> Result<(), DefinitionError> {
    if job.steps.is_empty() {
        return Err(DefinitionError::InvalidStep {
            job: job.name.clone(),
            step: String::new(),
            message: "job declares no steps".to_string(),
        });
    }

    for step in &job.steps {
        let message = match &step.kind {
            StepKind::Shell { run, .. } if run.trim().is_empty() => "empty script",
            StepKind::Shell { shell, .. } if shell.trim().is_empty() => "empty shell",
            StepKind::Action { uses, .. } if uses.trim().is_empty() => "empty action reference",
            _ => continue,
        };
        return Err(DefinitionError::InvalidStep {
            job: job.name.clone(),
            step: step.name.clone(),
            message: message.to_string(),
        });
    }
    Ok(())
}

fn validate_env(job: &gantry_core::pipeline::JobDefinition) -> Result<(), DefinitionError> {
    for (variable, value) in &job.env {
        if let EnvValue::Secret { secret } = value
            && secret.trim().is_empty()
        {
            return Err(DefinitionError::EmptySecretName {
                job: job.name.clone(),
                variable: variable.clone(),
            });
        }
    }
    Ok(())
}
