//! Matrix expansion for parallel job generation.

use gantry_core::DefinitionError;
use gantry_core::ids::InstanceIndex;
use gantry_core::pipeline::{JobDefinition, MatrixConfig};
use gantry_core::run::JobInstance;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

type Combination = BTreeMap<String, Value>;

/// Expander for matrix configurations.
pub struct MatrixExpander;

impl MatrixExpander {
    pub fn new() -> Self {
        Self
    }

    /// Expand a job template into concrete instances.
    ///
    /// Instances are numbered from `first_index`. The template is shared
    /// read-only by every instance and never modified.
    pub fn expand(
        &self,
        job: &JobDefinition,
        first_index: usize,
    ) -> Result<Vec<JobInstance>, DefinitionError> {
        let combinations = match &job.matrix {
            None => vec![Combination::new()],
            Some(matrix) => self.combinations(&job.name, matrix)?,
        };

        let definition = Arc::new(job.clone());
        let instances: Vec<JobInstance> = combinations
            .into_iter()
            .enumerate()
            .map(|(offset, matrix)| JobInstance {
                index: InstanceIndex::new(first_index + offset),
                job_name: job.name.clone(),
                matrix,
                definition: Arc::clone(&definition),
            })
            .collect();

        debug!(job = %job.name, instances = instances.len(), "Expanded job");
        Ok(instances)
    }

    /// Cross product of all axes, then `exclude`, then `include`.
    fn combinations(
        &self,
        job: &str,
        matrix: &MatrixConfig,
    ) -> Result<Vec<Combination>, DefinitionError> {
        let mut result = vec![Combination::new()];

        for (axis, values) in &matrix.axes {
            if values.is_empty() {
                return Err(DefinitionError::EmptyMatrixAxis {
                    job: job.to_string(),
                    axis: axis.clone(),
                });
            }

            let mut next = Vec::with_capacity(result.len() * values.len());
            for combo in &result {
                for value in values {
                    let mut extended = combo.clone();
                    extended.insert(axis.clone(), value.clone());
                    next.push(extended);
                }
            }
            result = next;
        }

        result.retain(|combo| !matrix.exclude.iter().any(|ex| is_subset(ex, combo)));

        for include in &matrix.include {
            apply_include(&mut result, include, matrix);
        }

        if result.is_empty() {
            return Err(DefinitionError::EmptyMatrix(job.to_string()));
        }
        Ok(result)
    }
}

impl Default for MatrixExpander {
    fn default() -> Self {
        Self::new()
    }
}

fn is_subset(partial: &Combination, combo: &Combination) -> bool {
    partial.iter().all(|(key, value)| combo.get(key) == Some(value))
}

/// Merge one `include` entry.
///
/// Extra keys are added to every combination whose axis values agree with the
/// entry; an entry agreeing with none becomes a new combination. Original
/// axis values are never overwritten.
fn apply_include(result: &mut Vec<Combination>, include: &Combination, matrix: &MatrixConfig) {
    let (axis_part, extra_part): (Combination, Combination) = include
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .partition(|(k, _)| matrix.axes.contains_key(k));

    let mut merged = false;
    if !extra_part.is_empty() || axis_part.is_empty() {
        for combo in result.iter_mut() {
            if is_subset(&axis_part, combo) {
                for (key, value) in &extra_part {
                    combo.entry(key.clone()).or_insert_with(|| value.clone());
                }
                merged = true;
            }
        }
    }

    if !merged && !result.iter().any(|combo| combo == include) {
        result.push(include.clone());
    }
}
