//! Execution environment management.

use async_trait::async_trait;
use gantry_core::pipeline::RuntimeDescriptor;
use gantry_core::{Error, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{info, warn};

/// An isolated, ephemeral place for one job instance to run.
///
/// Nothing in an environment outlives the instance: `teardown` removes it,
/// and dropping it without a teardown (for example when a run is cancelled)
/// removes it as well.
#[async_trait]
pub trait Environment: Send + Sync {
    /// The working directory steps execute in.
    fn workspace(&self) -> &Path;

    /// Variables describing the environment, exported to every step.
    fn env(&self) -> BTreeMap<String, String>;

    /// Destroy the environment.
    async fn teardown(self: Box<Self>) -> Result<()>;
}

/// Host environment: a fresh temporary directory on the local machine.
pub struct HostEnvironment {
    dir: TempDir,
    runtime: RuntimeDescriptor,
}

impl HostEnvironment {
    pub async fn provision(base: &Path, runtime: RuntimeDescriptor) -> Result<Self> {
        tokio::fs::create_dir_all(base).await.map_err(|e| {
            Error::Environment(format!(
                "Failed to create workspace root {}: {}",
                base.display(),
                e
            ))
        })?;

        let dir = tempfile::Builder::new()
            .prefix("gantry-job-")
            .tempdir_in(base)
            .map_err(|e| Error::Environment(format!("Failed to create workspace: {}", e)))?;

        info!(workspace = %dir.path().display(), platform = %runtime.platform, "Provisioned host environment");
        Ok(Self { dir, runtime })
    }
}

#[async_trait]
impl Environment for HostEnvironment {
    fn workspace(&self) -> &Path {
        self.dir.path()
    }

    fn env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert(
            "GANTRY_WORKSPACE".to_string(),
            self.dir.path().display().to_string(),
        );
        env.insert("GANTRY_PLATFORM".to_string(), self.runtime.platform.clone());
        for (language, version) in &self.runtime.versions {
            let key = format!(
                "GANTRY_RUNTIME_{}",
                language.to_uppercase().replace(['-', '.'], "_")
            );
            env.insert(key, version.clone());
        }
        env
    }

    async fn teardown(self: Box<Self>) -> Result<()> {
        let HostEnvironment { dir, .. } = *self;
        let path = dir.path().to_path_buf();
        info!(workspace = %path.display(), "Tearing down host environment");
        tokio::task::spawn_blocking(move || dir.close())
            .await
            .map_err(|e| Error::Internal(e.to_string()))?
            .map_err(|e| {
                Error::Environment(format!("Failed to remove {}: {}", path.display(), e))
            })
    }
}

/// Factory for creating execution environments.
pub struct EnvironmentFactory {
    base: PathBuf,
}

impl EnvironmentFactory {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Provision an environment matching the runtime descriptor.
    ///
    /// Only host execution is available; any other platform label runs on
    /// the host with its label and version bindings still exported.
    pub async fn create(&self, runtime: RuntimeDescriptor) -> Result<Box<dyn Environment>> {
        if !is_host_platform(&runtime.platform) {
            warn!(
                platform = %runtime.platform,
                "No isolated backend for platform, falling back to host"
            );
        }
        Ok(Box::new(HostEnvironment::provision(&self.base, runtime).await?))
    }
}

impl Default for EnvironmentFactory {
    fn default() -> Self {
        Self::new(std::env::temp_dir())
    }
}

fn is_host_platform(platform: &str) -> bool {
    matches!(platform, "host" | "local")
}
