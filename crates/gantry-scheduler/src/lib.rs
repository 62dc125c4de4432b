//! Pipeline scheduling and orchestration for Gantry.

pub mod dag;
pub mod matrix;
pub mod scheduler;
pub mod triggers;
pub mod validation;

pub use dag::{DagBuilder, ExecutionDag};
pub use matrix::MatrixExpander;
pub use scheduler::{Scheduler, SchedulerConfig};
pub use triggers::{TriggerEvaluator, TriggerEvent};
pub use validation::validate;
