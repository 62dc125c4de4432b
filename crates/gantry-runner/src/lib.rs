//! Job and step execution engine for Gantry.

pub mod actions;
pub mod environments;
pub mod job;
pub mod runner;
pub mod shell;

pub use actions::{Action, ActionInput, ActionOutput, ActionRef, ActionRegistry, ActionRunner};
pub use environments::{Environment, EnvironmentFactory, HostEnvironment};
pub use job::{JobRunner, JobRunnerConfig};
pub use runner::{RunnerConfig, StepContext, StepResult, StepRunner};
pub use shell::ShellRunner;
