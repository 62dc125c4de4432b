//! Main scheduler orchestration.

use crate::dag::{DagBuilder, ExecutionDag};
use chrono::Utc;
use gantry_core::Result;
use gantry_core::events::{
    JobCompletedPayload, JobSkippedPayload, JobStartedPayload, RunCompletedPayload, RunEvent,
    RunStartedPayload,
};
use gantry_core::ids::InstanceIndex;
use gantry_core::pipeline::PipelineDefinition;
use gantry_core::ports::JobExecutor;
use gantry_core::run::{JobOutcome, JobReport, JobState, RunReport, RunRequest, RunStatus};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound on concurrently executing instances.
    pub max_parallel: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }
}

/// Drives one pipeline run from a validated DAG to a [`RunReport`].
pub struct Scheduler {
    executor: Arc<dyn JobExecutor>,
    config: SchedulerConfig,
    dag_builder: DagBuilder,
    events: Option<mpsc::UnboundedSender<RunEvent>>,
}

/// Mutable bookkeeping for one run.
struct RunState {
    states: Vec<JobState>,
    outcomes: Vec<Option<JobOutcome>>,
    waiting_on: Vec<usize>,
}

impl RunState {
    fn new(dag: &ExecutionDag) -> Self {
        Self {
            states: vec![JobState::Pending; dag.len()],
            outcomes: vec![None; dag.len()],
            waiting_on: dag
                .instances()
                .iter()
                .map(|i| dag.prerequisites(i.index).len())
                .collect(),
        }
    }

    fn count(&self, state: JobState) -> usize {
        self.states.iter().filter(|s| **s == state).count()
    }
}

impl Scheduler {
    pub fn new(executor: Arc<dyn JobExecutor>, config: SchedulerConfig) -> Self {
        Self {
            executor,
            config,
            dag_builder: DagBuilder::new(),
            events: None,
        }
    }

    /// Publish lifecycle events on `tx` while runs execute.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<RunEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    fn publish(&self, event: RunEvent) {
        if let Some(tx) = &self.events
            && tx.send(event).is_err()
        {
            debug!("Run event receiver dropped");
        }
    }

    /// Build the execution DAG for `definition` and run it.
    ///
    /// A malformed definition is returned as an error before anything runs.
    pub async fn execute(
        &self,
        request: RunRequest,
        definition: &PipelineDefinition,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        let dag = self.dag_builder.build(definition).inspect_err(|e| {
            error!(pipeline = %definition.name, error = %e, "Invalid pipeline definition");
        })?;
        Ok(self.execute_dag(request, dag, cancel).await)
    }

    /// Run every instance of `dag`, honouring the dependency partial order.
    ///
    /// Instances with no unresolved prerequisites run concurrently up to
    /// `max_parallel`. An instance starts only after all its prerequisites
    /// succeeded; once any prerequisite fails, is cancelled or is skipped,
    /// every transitive dependent is marked skipped without running.
    pub async fn execute_dag(
        &self,
        request: RunRequest,
        dag: ExecutionDag,
        cancel: CancellationToken,
    ) -> RunReport {
        let started_at = Utc::now();
        let start = Instant::now();
        let dag = Arc::new(dag);
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel.max(1)));
        let mut state = RunState::new(&dag);
        let mut tasks: JoinSet<(InstanceIndex, JobOutcome)> = JoinSet::new();
        let mut task_ids = HashMap::new();

        info!(
            run_id = %request.run_id,
            pipeline = %request.pipeline_name,
            instances = dag.len(),
            max_parallel = self.config.max_parallel,
            "Starting run"
        );
        self.publish(RunEvent::RunStarted(RunStartedPayload {
            run_id: request.run_id,
            pipeline_name: request.pipeline_name.clone(),
            instance_count: dag.len(),
            started_at,
        }));

        for index in dag.roots() {
            let id = self.spawn(&request, &dag, index, &semaphore, &cancel, &mut state, &mut tasks);
            task_ids.insert(id, index);
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            let (index, outcome) = match joined {
                Ok((_, result)) => result,
                Err(e) => {
                    let Some(index) = task_ids.get(&e.id()).copied() else {
                        error!(error = %e, "Lost track of a job task");
                        continue;
                    };
                    error!(index = %index, error = %e, "Job task aborted");
                    (index, JobOutcome::failed_before_steps(format!("job task aborted: {}", e)))
                }
            };

            let instance = dag.instance(index);
            let finished = outcome.state;
            info!(
                job = %instance.display_name(),
                state = %finished,
                duration_ms = outcome.duration_ms,
                "Job finished"
            );
            self.publish(RunEvent::JobCompleted(JobCompletedPayload {
                run_id: request.run_id,
                index,
                display_name: instance.display_name(),
                state: finished,
                duration_ms: outcome.duration_ms,
            }));
            state.states[index.get()] = finished;
            state.outcomes[index.get()] = Some(outcome);

            if finished.blocks_dependents() {
                self.skip_dependents(&request, &dag, index, &mut state);
                continue;
            }

            for dependent in dag.dependents(index) {
                let slot = &mut state.waiting_on[dependent.get()];
                *slot = slot.saturating_sub(1);
                if *slot > 0 || state.states[dependent.get()] != JobState::Pending {
                    continue;
                }
                if cancel.is_cancelled() {
                    self.cancel_unstarted(&request, &dag, dependent, &mut state);
                    continue;
                }
                let id =
                    self.spawn(&request, &dag, dependent, &semaphore, &cancel, &mut state, &mut tasks);
                task_ids.insert(id, dependent);
            }
        }

        for index in dag.topological_order() {
            if state.states[index.get()] != JobState::Pending {
                continue;
            }
            if cancel.is_cancelled() {
                self.cancel_unstarted(&request, &dag, *index, &mut state);
            } else {
                warn!(job = %dag.instance(*index).display_name(), "Instance never became eligible");
                self.skip(&request, &dag, *index, None, &mut state);
            }
        }

        let status = RunStatus::from_states(&state.states, cancel.is_cancelled());
        let completed_at = Utc::now();
        let duration_ms = start.elapsed().as_millis() as u64;

        info!(
            run_id = %request.run_id,
            status = %status,
            succeeded = state.count(JobState::Succeeded),
            failed = state.count(JobState::Failed),
            skipped = state.count(JobState::Skipped),
            cancelled = state.count(JobState::Cancelled),
            duration_ms,
            "Run finished"
        );
        self.publish(RunEvent::RunCompleted(RunCompletedPayload {
            run_id: request.run_id,
            pipeline_name: request.pipeline_name.clone(),
            status,
            succeeded: state.count(JobState::Succeeded),
            failed: state.count(JobState::Failed),
            skipped: state.count(JobState::Skipped),
            cancelled: state.count(JobState::Cancelled),
            duration_ms,
            completed_at,
        }));

        let jobs = dag
            .instances()
            .iter()
            .zip(state.outcomes)
            .map(|(instance, outcome)| JobReport {
                index: instance.index,
                job_name: instance.job_name.clone(),
                display_name: instance.display_name(),
                matrix: instance.matrix.clone(),
                outcome: outcome.unwrap_or_else(JobOutcome::skipped),
            })
            .collect();

        RunReport {
            run_id: request.run_id,
            pipeline_name: request.pipeline_name,
            status,
            trigger: request.trigger,
            jobs,
            started_at,
            completed_at,
            duration_ms,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn(
        &self,
        request: &RunRequest,
        dag: &Arc<ExecutionDag>,
        index: InstanceIndex,
        semaphore: &Arc<Semaphore>,
        cancel: &CancellationToken,
        state: &mut RunState,
        tasks: &mut JoinSet<(InstanceIndex, JobOutcome)>,
    ) -> tokio::task::Id {
        state.states[index.get()] = JobState::Running;

        let instance = dag.instance(index).clone();
        let executor = Arc::clone(&self.executor);
        let semaphore = Arc::clone(semaphore);
        let cancel = cancel.clone();
        let events = self.events.clone();
        let run_id = request.run_id;

        let handle = tasks.spawn(async move {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return (index, JobOutcome::cancelled()),
                permit = semaphore.acquire_owned() => permit,
            };
            let Ok(_permit) = permit else {
                return (index, JobOutcome::cancelled());
            };

            debug!(job = %instance.display_name(), "Job started");
            if let Some(tx) = &events {
                let _ = tx.send(RunEvent::JobStarted(JobStartedPayload {
                    run_id,
                    index,
                    display_name: instance.display_name(),
                    started_at: Utc::now(),
                }));
            }

            let outcome = executor.execute(run_id, &instance, cancel).await;
            (index, outcome)
        });
        handle.id()
    }

    fn skip_dependents(
        &self,
        request: &RunRequest,
        dag: &ExecutionDag,
        blocked_by: InstanceIndex,
        state: &mut RunState,
    ) {
        for dependent in dag.transitive_dependents(blocked_by) {
            if state.states[dependent.get()] == JobState::Pending {
                self.skip(request, dag, dependent, Some(blocked_by), state);
            }
        }
    }

    /// Cancel an instance that never started because the run was cancelled.
    fn cancel_unstarted(
        &self,
        request: &RunRequest,
        dag: &ExecutionDag,
        index: InstanceIndex,
        state: &mut RunState,
    ) {
        let instance = dag.instance(index);
        info!(job = %instance.display_name(), "Cancelling job before start");

        state.states[index.get()] = JobState::Cancelled;
        state.outcomes[index.get()] = Some(JobOutcome::cancelled());
        self.publish(RunEvent::JobCompleted(JobCompletedPayload {
            run_id: request.run_id,
            index,
            display_name: instance.display_name(),
            state: JobState::Cancelled,
            duration_ms: 0,
        }));
    }

    fn skip(
        &self,
        request: &RunRequest,
        dag: &ExecutionDag,
        index: InstanceIndex,
        blocked_by: Option<InstanceIndex>,
        state: &mut RunState,
    ) {
        let instance = dag.instance(index);
        info!(job = %instance.display_name(), blocked_by = ?blocked_by, "Skipping job");

        state.states[index.get()] = JobState::Skipped;
        state.outcomes[index.get()] = Some(JobOutcome::skipped());
        self.publish(RunEvent::JobSkipped(JobSkippedPayload {
            run_id: request.run_id,
            index,
            display_name: instance.display_name(),
            blocked_by,
        }));
    }
}
