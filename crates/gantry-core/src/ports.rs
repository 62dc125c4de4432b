//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the scheduling core and the
//! adapters that actually execute work.

use crate::ids::RunId;
use crate::run::{JobInstance, JobOutcome};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Executes one job instance to a terminal state.
///
/// Implementations own everything scoped to the instance (its environment
/// binding and its provisioned workspace) and release it before returning.
/// Failures are reported through [`JobOutcome::state`], never as a panic or
/// an error, so the scheduler can apply dependency propagation uniformly.
/// Anything the instance persists beyond its lifetime is scoped to `run_id`.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(
        &self,
        run_id: RunId,
        instance: &JobInstance,
        cancel: CancellationToken,
    ) -> JobOutcome;
}
