//! Pipeline definition types.
//!
//! These types represent the user-authored pipeline YAML configuration.
//! They are read-only once loaded: a run expands job definitions into
//! instances but never mutates the definitions themselves.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PipelineDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    pub jobs: Vec<JobDefinition>,
}

impl PipelineDefinition {
    /// Look up a job by name.
    pub fn job(&self, name: &str) -> Option<&JobDefinition> {
        self.jobs.iter().find(|job| job.name == name)
    }

    /// Every secret name referenced anywhere in the definition.
    pub fn secret_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .jobs
            .iter()
            .flat_map(|job| job.env.values())
            .filter_map(EnvValue::secret_name)
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerConfig {
    Push {
        #[serde(default)]
        branches: Vec<String>,
        #[serde(default)]
        paths: Vec<String>,
        #[serde(default)]
        paths_ignore: Vec<String>,
    },
    Manual,
}

impl TriggerConfig {
    pub fn trigger_type(&self) -> TriggerType {
        match self {
            TriggerConfig::Push { .. } => TriggerType::Push,
            TriggerConfig::Manual => TriggerType::Manual,
        }
    }

    /// Every glob pattern this trigger declares.
    pub fn patterns(&self) -> Vec<&str> {
        match self {
            TriggerConfig::Push {
                branches,
                paths,
                paths_ignore,
            } => branches
                .iter()
                .chain(paths)
                .chain(paths_ignore)
                .map(String::as_str)
                .collect(),
            TriggerConfig::Manual => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Push,
    Manual,
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerType::Push => write!(f, "push"),
            TriggerType::Manual => write!(f, "manual"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobDefinition {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub needs: Vec<String>,
    #[serde(default)]
    pub matrix: Option<MatrixConfig>,
    #[serde(default)]
    pub runtime: RuntimeDescriptor,
    #[serde(default)]
    pub env: BTreeMap<String, EnvValue>,
    pub steps: Vec<StepDefinition>,
    #[serde(default)]
    pub timeout_minutes: Option<u32>,
}

impl JobDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            display_name: None,
            needs: vec![],
            matrix: None,
            runtime: RuntimeDescriptor::default(),
            env: BTreeMap::new(),
            steps: vec![],
            timeout_minutes: None,
        }
    }

    pub fn with_needs<I, S>(mut self, needs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.needs = needs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_axis<I, V>(mut self, axis: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<serde_json::Value>,
    {
        let matrix = self.matrix.get_or_insert_with(MatrixConfig::default);
        matrix
            .axes
            .insert(axis.into(), values.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: EnvValue) -> Self {
        self.env.insert(name.into(), value);
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct MatrixConfig {
    #[serde(alias = "dimensions")]
    pub axes: BTreeMap<String, Vec<serde_json::Value>>,
    #[serde(default)]
    pub include: Vec<BTreeMap<String, serde_json::Value>>,
    #[serde(default)]
    pub exclude: Vec<BTreeMap<String, serde_json::Value>>,
}

/// Platform image and language/version bindings a job runs against.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RuntimeDescriptor {
    #[serde(default = "default_platform")]
    pub platform: String,
    #[serde(default)]
    pub versions: BTreeMap<String, String>,
}

fn default_platform() -> String {
    "host".to_string()
}

impl Default for RuntimeDescriptor {
    fn default() -> Self {
        Self {
            platform: default_platform(),
            versions: BTreeMap::new(),
        }
    }
}

/// Value of a declared environment variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum EnvValue {
    Secret { secret: String },
    Literal(String),
}

impl EnvValue {
    pub fn literal(value: impl Into<String>) -> Self {
        EnvValue::Literal(value.into())
    }

    pub fn secret(name: impl Into<String>) -> Self {
        EnvValue::Secret {
            secret: name.into(),
        }
    }

    pub fn secret_name(&self) -> Option<&str> {
        match self {
            EnvValue::Secret { secret } => Some(secret),
            EnvValue::Literal(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepDefinition {
    pub name: String,
    #[serde(flatten)]
    pub kind: StepKind,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout_minutes: Option<u32>,
}

impl StepDefinition {
    /// A shell step running `script` with the default shell.
    pub fn run(name: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: StepKind::Shell {
                run: script.into(),
                shell: default_shell(),
            },
            continue_on_error: false,
            env: BTreeMap::new(),
            timeout_minutes: None,
        }
    }

    /// An action step referencing `name@version`.
    pub fn uses(name: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: StepKind::Action {
                uses: reference.into(),
                with: BTreeMap::new(),
            },
            continue_on_error: false,
            env: BTreeMap::new(),
            timeout_minutes: None,
        }
    }

    pub fn with_input(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let StepKind::Action { with, .. } = &mut self.kind {
            with.insert(key.into(), value.into());
        }
        self
    }

    pub fn continue_on_error(mut self) -> Self {
        self.continue_on_error = true;
        self
    }

    pub fn is_shell(&self) -> bool {
        matches!(self.kind, StepKind::Shell { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum StepKind {
    Shell {
        run: String,
        #[serde(default = "default_shell")]
        shell: String,
    },
    Action {
        uses: String,
        #[serde(default)]
        with: BTreeMap<String, String>,
    },
}

fn default_shell() -> String {
    "bash".to_string()
}

/// Render a matrix value the way it appears in names and interpolation.
pub fn value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
