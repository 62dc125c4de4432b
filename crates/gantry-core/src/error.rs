//! Error types for Gantry.

use thiserror::Error;

/// A malformed pipeline definition.
///
/// Always detected before any job instance executes; a run that hits one of
/// these aborts with no side effects.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    #[error("Pipeline declares no jobs")]
    EmptyPipeline,

    #[error("Job declared more than once: {0}")]
    DuplicateJob(String),

    #[error("Job {job} needs undeclared job {dependency}")]
    UnknownDependency { job: String, dependency: String },

    #[error("Job {0} needs itself")]
    SelfDependency(String),

    #[error("Cycle detected in job dependencies")]
    CycleDetected,

    #[error("Matrix axis {axis} of job {job} has no values")]
    EmptyMatrixAxis { job: String, axis: String },

    #[error("Matrix of job {0} produces no combinations")]
    EmptyMatrix(String),

    #[error("Invalid glob pattern {pattern:?}: {message}")]
    InvalidGlob { pattern: String, message: String },

    #[error("Variable {variable} of job {job} references a secret with an empty name")]
    EmptySecretName { job: String, variable: String },

    #[error("Invalid step {step} in job {job}: {message}")]
    InvalidStep {
        job: String,
        step: String,
        message: String,
    },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    // Step errors
    #[error("Step failed with exit code {exit_code}: {message}")]
    StepFailed { exit_code: i32, message: String },

    #[error("Step timeout after {minutes} minutes")]
    StepTimeout { minutes: u32 },

    #[error("Action not found: {0}")]
    ActionNotFound(String),

    #[error("Action execution failed: {0}")]
    ActionFailed(String),

    // Secret errors
    #[error("Secret not found: {0}")]
    SecretNotFound(String),

    #[error("Secret provider not configured: {0}")]
    SecretProviderNotConfigured(String),

    // Environment errors
    #[error("Environment error: {0}")]
    Environment(String),

    // Infrastructure errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl Error {
    /// Whether this error stems from the pipeline definition itself.
    pub fn is_definition_error(&self) -> bool {
        matches!(self, Error::Definition(_))
    }
}
