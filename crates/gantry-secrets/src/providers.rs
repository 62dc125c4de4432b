//! Secret provider trait and implementations.

use async_trait::async_trait;
use gantry_core::secrets::SecretValue;
use gantry_core::{Error, Result};
use std::collections::HashMap;
use std::path::Path;

/// Trait for secret providers.
///
/// A provider is the external secret store: values are looked up by name at
/// run time and never appear in the pipeline definition.
#[async_trait]
pub trait SecretProvider: Send + Sync {
    /// Get a secret by name. Absence is [`Error::SecretNotFound`].
    async fn get(&self, name: &str) -> Result<SecretValue>;

    /// Check if a secret exists.
    async fn exists(&self, name: &str) -> Result<bool>;

    /// Provider name for logging.
    fn name(&self) -> &str;
}

/// Environment variable secret provider.
pub struct EnvProvider {
    prefix: Option<String>,
}

impl EnvProvider {
    pub fn new(prefix: Option<String>) -> Self {
        Self { prefix }
    }

    fn resolve_name(&self, name: &str) -> String {
        match &self.prefix {
            Some(p) => format!("{}_{}", p, name),
            None => name.to_string(),
        }
    }
}

impl Default for EnvProvider {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl SecretProvider for EnvProvider {
    async fn get(&self, name: &str) -> Result<SecretValue> {
        let env_name = self.resolve_name(name);
        std::env::var(&env_name)
            .map(SecretValue::new)
            .map_err(|_| Error::SecretNotFound(name.to_string()))
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        let env_name = self.resolve_name(name);
        Ok(std::env::var(&env_name).is_ok())
    }

    fn name(&self) -> &str {
        "env"
    }
}

/// File-based secret provider (for local runs and tests).
pub struct FileProvider {
    secrets: HashMap<String, String>,
}

impl FileProvider {
    pub fn new() -> Self {
        Self {
            secrets: HashMap::new(),
        }
    }

    pub fn from_map(secrets: HashMap<String, String>) -> Self {
        Self { secrets }
    }

    /// Load a flat name → value document; `.json` is parsed as JSON, anything
    /// else as YAML.
    pub async fn load_from_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::SecretProviderNotConfigured(format!(
                "secrets file {} does not exist",
                path.display()
            )),
            _ => Error::Internal(format!(
                "Failed to read secrets file {}: {}",
                path.display(),
                e
            )),
        })?;

        let is_json = path.extension().is_some_and(|ext| ext == "json");
        let secrets: HashMap<String, String> = if is_json {
            serde_json::from_str(&content)?
        } else {
            serde_yaml::from_str(&content)
                .map_err(|e| Error::Serialization(format!("Failed to parse secrets: {}", e)))?
        };

        Ok(Self { secrets })
    }
}

impl Default for FileProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecretProvider for FileProvider {
    async fn get(&self, name: &str) -> Result<SecretValue> {
        self.secrets
            .get(name)
            .map(SecretValue::new)
            .ok_or_else(|| Error::SecretNotFound(name.to_string()))
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.secrets.contains_key(name))
    }

    fn name(&self) -> &str {
        "file"
    }
}
