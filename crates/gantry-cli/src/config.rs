//! CLI configuration management.

use crate::commands::LogFormat;
use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// CLI configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    /// JSON or YAML file of secret name -> value. Secrets come from the
    /// process environment when unset.
    #[serde(default)]
    pub secrets_file: Option<PathBuf>,
    /// Prefix for environment secrets (`PREFIX_NAME`).
    #[serde(default)]
    pub env_prefix: Option<String>,
    #[serde(default)]
    pub max_parallel: Option<usize>,
    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: PathBuf,
    /// Parent of per-instance workspaces; the system temp dir when unset.
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,
    /// Default per-step timeout.
    #[serde(default)]
    pub step_timeout_minutes: Option<u32>,
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_artifacts_dir() -> PathBuf {
    PathBuf::from("gantry-artifacts")
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            secrets_file: None,
            env_prefix: None,
            max_parallel: None,
            artifacts_dir: default_artifacts_dir(),
            workspace_root: None,
            step_timeout_minutes: None,
            log_format: LogFormat::default(),
        }
    }
}

impl CliConfig {
    /// Load configuration from file.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    /// Save configuration to file.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let content = serde_yaml::to_string(self)?;
        std::fs::write(&path, content).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    /// Get the configuration file path.
    pub fn config_path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("dev", "gantry", "gantry")
            .ok_or_else(|| anyhow!("Could not determine config directory"))?;
        Ok(dirs.config_dir().join("config.yaml"))
    }

    /// Set a configuration value. An empty value clears optional keys.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let optional = |v: &str| (!v.is_empty()).then(|| v.to_string());
        match key {
            "secrets_file" => self.secrets_file = optional(value).map(PathBuf::from),
            "env_prefix" => self.env_prefix = optional(value),
            "max_parallel" => {
                self.max_parallel = match optional(value) {
                    Some(v) => {
                        let n: usize = v
                            .parse()
                            .with_context(|| format!("Invalid max_parallel: {}", v))?;
                        if n == 0 {
                            bail!("max_parallel must be at least 1");
                        }
                        Some(n)
                    }
                    None => None,
                }
            }
            "artifacts_dir" => {
                self.artifacts_dir = optional(value)
                    .map(PathBuf::from)
                    .unwrap_or_else(default_artifacts_dir)
            }
            "workspace_root" => self.workspace_root = optional(value).map(PathBuf::from),
            "step_timeout_minutes" => {
                self.step_timeout_minutes = optional(value)
                    .map(|v| {
                        v.parse::<u32>()
                            .with_context(|| format!("Invalid step_timeout_minutes: {}", v))
                    })
                    .transpose()?
            }
            "log_format" => {
                self.log_format = match value {
                    "text" => LogFormat::Text,
                    "json" => LogFormat::Json,
                    _ => bail!("Invalid log format: {}", value),
                };
            }
            _ => bail!("Unknown config key: {}", key),
        }
        Ok(())
    }
}
