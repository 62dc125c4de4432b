//! Binds declared environment variables to one job instance.

use crate::providers::SecretProvider;
use gantry_core::interpolation::InterpolationContext;
use gantry_core::pipeline::EnvValue;
use gantry_core::run::JobInstance;
use gantry_core::{Error, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

const MASK: &str = "***";

/// Resolved environment for exactly one job instance.
///
/// Owned by the instance for its lifetime and dropped when it terminates.
/// Secret values are only reachable through [`EnvironmentBinding::vars`] for
/// handing to a child process; `Debug` prints them masked.
pub struct EnvironmentBinding {
    vars: BTreeMap<String, String>,
    secret_names: BTreeSet<String>,
    /// Secret values, longest first so overlapping values mask fully.
    secret_values: Vec<String>,
}

impl EnvironmentBinding {
    pub fn empty() -> Self {
        Self {
            vars: BTreeMap::new(),
            secret_names: BTreeSet::new(),
            secret_values: Vec::new(),
        }
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn is_secret(&self, name: &str) -> bool {
        self.secret_names.contains(name)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Replace every secret value occurring in `input` with `***`.
    pub fn mask(&self, input: &str) -> String {
        let mut output = input.to_string();
        for value in &self.secret_values {
            if output.contains(value.as_str()) {
                output = output.replace(value.as_str(), MASK);
            }
        }
        output
    }

    fn insert_literal(&mut self, name: String, value: String) {
        self.secret_names.remove(&name);
        self.vars.insert(name, value);
    }

    fn insert_secret(&mut self, name: String, value: String) {
        if !value.is_empty() && !self.secret_values.contains(&value) {
            self.secret_values.push(value.clone());
            self.secret_values
                .sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        }
        self.secret_names.insert(name.clone());
        self.vars.insert(name, value);
    }
}

impl fmt::Debug for EnvironmentBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown: BTreeMap<&str, &str> = self
            .vars
            .iter()
            .map(|(k, v)| {
                let v = if self.is_secret(k) { MASK } else { v.as_str() };
                (k.as_str(), v)
            })
            .collect();
        f.debug_struct("EnvironmentBinding")
            .field("vars", &shown)
            .finish()
    }
}

/// Resolves a job instance's declared environment against a secret provider.
#[derive(Clone)]
pub struct SecretBinder {
    provider: Arc<dyn SecretProvider>,
    variables: HashMap<String, String>,
}

impl SecretBinder {
    pub fn new(provider: Arc<dyn SecretProvider>) -> Self {
        Self {
            provider,
            variables: HashMap::new(),
        }
    }

    /// Pipeline-level variables bound into every instance before job env.
    pub fn with_variables(mut self, variables: HashMap<String, String>) -> Self {
        self.variables = variables;
        self
    }

    /// Resolve every declared variable for `instance`.
    ///
    /// Literal values are interpolated against the instance's matrix values.
    /// A secret missing from the provider fails the whole binding; it is
    /// never replaced by an empty string.
    pub async fn bind(&self, instance: &JobInstance) -> Result<EnvironmentBinding> {
        let mut ctx = InterpolationContext::with_matrix(instance.matrix_strings());
        let mut binding = EnvironmentBinding::empty();

        for (name, value) in &self.variables {
            ctx.variables.insert(name.clone(), value.clone());
        }
        for (name, value) in &self.variables {
            binding.insert_literal(name.clone(), ctx.interpolate(value));
        }

        for (name, value) in &instance.definition.env {
            match value {
                EnvValue::Literal(literal) => {
                    let resolved = ctx.interpolate(literal);
                    ctx.variables.insert(name.clone(), resolved.clone());
                    binding.insert_literal(name.clone(), resolved);
                }
                EnvValue::Secret { secret } => {
                    let resolved = self.provider.get(secret).await.map_err(|e| {
                        warn!(
                            job = %instance.display_name(),
                            variable = %name,
                            secret = %secret,
                            provider = self.provider.name(),
                            "Secret resolution failed"
                        );
                        match e {
                            Error::SecretNotFound(_) => Error::SecretNotFound(secret.clone()),
                            other => other,
                        }
                    })?;
                    binding.insert_secret(name.clone(), resolved.expose().to_string());
                }
            }
        }

        debug!(
            job = %instance.display_name(),
            variables = binding.len(),
            secrets = binding.secret_names.len(),
            "Environment bound"
        );

        Ok(binding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::FileProvider;
    use gantry_core::ids::InstanceIndex;
    use gantry_core::pipeline::JobDefinition;
    use pretty_assertions::assert_eq;

    fn provider() -> Arc<dyn SecretProvider> {
        let mut secrets = HashMap::new();
        secrets.insert("PYPI_USERNAME".to_string(), "__token__".to_string());
        secrets.insert("PYPI_TOKEN".to_string(), "pypi-AgEIcHlwaS5vcmc".to_string());
        Arc::new(FileProvider::from_map(secrets))
    }

    fn instance(job: JobDefinition, matrix: &[(&str, &str)]) -> JobInstance {
        JobInstance {
            index: InstanceIndex::new(0),
            job_name: job.name.clone(),
            matrix: matrix
                .iter()
                .map(|(k, v)| (k.to_string(), serde_json::json!(v)))
                .collect(),
            definition: Arc::new(job),
        }
    }

    #[tokio::test]
    async fn test_bind_literals_and_secrets() {
        let job = JobDefinition::new("publish")
            .with_env("TWINE_USERNAME", EnvValue::secret("PYPI_USERNAME"))
            .with_env("TWINE_PASSWORD", EnvValue::secret("PYPI_TOKEN"))
            .with_env("REPOSITORY", EnvValue::literal("pypi"));

        let binding = SecretBinder::new(provider())
            .bind(&instance(job, &[]))
            .await
            .unwrap();

        assert_eq!(binding.get("TWINE_USERNAME"), Some("__token__"));
        assert_eq!(binding.get("TWINE_PASSWORD"), Some("pypi-AgEIcHlwaS5vcmc"));
        assert_eq!(binding.get("REPOSITORY"), Some("pypi"));
        assert!(binding.is_secret("TWINE_PASSWORD"));
        assert!(!binding.is_secret("REPOSITORY"));
    }

    #[tokio::test]
    async fn test_missing_secret_is_fatal() {
        let job = JobDefinition::new("publish")
            .with_env("TWINE_PASSWORD", EnvValue::secret("NOT_CONFIGURED"));

        let err = SecretBinder::new(provider())
            .bind(&instance(job, &[]))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::SecretNotFound(name) if name == "NOT_CONFIGURED"));
    }

    #[tokio::test]
    async fn test_literals_interpolate_matrix_and_variables() {
        let job = JobDefinition::new("test")
            .with_env("PY", EnvValue::literal("python${{ matrix.python-version }}"))
            .with_env("REPORT", EnvValue::literal("${{ OUT_DIR }}/coverage.xml"));

        let mut variables = HashMap::new();
        variables.insert("OUT_DIR".to_string(), "build".to_string());

        let binding = SecretBinder::new(provider())
            .with_variables(variables)
            .bind(&instance(job, &[("python-version", "3.9")]))
            .await
            .unwrap();

        assert_eq!(binding.get("PY"), Some("python3.9"));
        assert_eq!(binding.get("REPORT"), Some("build/coverage.xml"));
        assert_eq!(binding.get("OUT_DIR"), Some("build"));
    }

    #[tokio::test]
    async fn test_debug_and_mask_hide_secret_values() {
        let job = JobDefinition::new("publish")
            .with_env("TWINE_PASSWORD", EnvValue::secret("PYPI_TOKEN"));

        let binding = SecretBinder::new(provider())
            .bind(&instance(job, &[]))
            .await
            .unwrap();

        let rendered = format!("{:?}", binding);
        assert!(!rendered.contains("pypi-AgEIcHlwaS5vcmc"));
        assert!(rendered.contains("TWINE_PASSWORD"));

        assert_eq!(
            binding.mask("uploading with pypi-AgEIcHlwaS5vcmc now"),
            "uploading with *** now"
        );
    }
}
