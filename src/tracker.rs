//! Execution tracker
//!
//! Record-keeper for run and execution lifecycles. Each record has its own
//! lock, which makes the tracker the single serialization point for that
//! record's transitions; writes to different runs never contend. Every
//! transition is persisted through the [`RunRepository`] and published as a
//! [`RunEvent`].
//!
//! Terminal writes are idempotent: repeating one with the same status is a
//! no-op, while a conflicting one is an [`Error::InvariantViolation`].
//!
//! Finished runs stay in the working set until trimmed; the repository keeps
//! the durable copy.

use crate::error::{Error, InvocationError, Result};
use crate::events::{RunChannel, RunEvent, RunEventKind, SeqId};
use crate::orchestrator::definition::OrchestrationDefinition;
use crate::run::{
    AgentExecution, ExecutionMetadata, ExecutionOutcome, ExecutionStatus, OrchestrationRun,
    RunCompletion, RunContext, RunStatus,
};
use crate::storage::RunRepository;
use crate::types::{ExecutionId, RunId};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tracing::{debug, info, warn};

struct TrackedRun {
    record: Mutex<OrchestrationRun>,
    execution_ids: parking_lot::Mutex<Vec<ExecutionId>>,
    channel: Arc<RunChannel>,
}

/// Owns the lifecycle records of live runs
pub struct ExecutionTracker {
    repository: Arc<dyn RunRepository>,
    event_capacity: usize,
    runs: RwLock<HashMap<RunId, Arc<TrackedRun>>>,
    executions: RwLock<HashMap<ExecutionId, Arc<Mutex<AgentExecution>>>>,
    finished: parking_lot::Mutex<VecDeque<RunId>>,
}

fn elapsed_ms(since: DateTime<Utc>, until: DateTime<Utc>) -> u64 {
    (until - since).num_milliseconds().max(0) as u64
}

impl ExecutionTracker {
    /// Create a tracker writing through `repository`
    pub fn new(repository: Arc<dyn RunRepository>, event_capacity: usize) -> Self {
        Self {
            repository,
            event_capacity,
            runs: RwLock::new(HashMap::new()),
            executions: RwLock::new(HashMap::new()),
            finished: parking_lot::Mutex::new(VecDeque::new()),
        }
    }

    /// The repository records are written to
    pub fn repository(&self) -> &Arc<dyn RunRepository> {
        &self.repository
    }

    async fn tracked(&self, run_id: RunId) -> Result<Arc<TrackedRun>> {
        self.runs
            .read()
            .await
            .get(&run_id)
            .cloned()
            .ok_or(Error::RunNotFound(run_id))
    }

    async fn execution_record(&self, execution_id: ExecutionId) -> Result<Arc<Mutex<AgentExecution>>> {
        self.executions
            .read()
            .await
            .get(&execution_id)
            .cloned()
            .ok_or_else(|| Error::invariant(format!("unknown execution {}", execution_id)))
    }

    /// Create a `Pending` run record for a definition
    pub async fn begin_run(
        &self,
        definition: &OrchestrationDefinition,
        context: &RunContext,
    ) -> Result<RunId> {
        let run = OrchestrationRun {
            id: RunId::new(),
            definition_id: definition.id,
            name: definition.name.clone(),
            mode: definition.mode,
            agent_count: definition.agents.len(),
            status: RunStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            success_count: 0,
            failure_count: 0,
            error: None,
            error_kind: None,
            consensus_score: None,
            has_consensus: None,
            output: None,
            triggered_by: context.triggered_by.clone(),
            labels: context.labels.clone(),
        };
        let run_id = run.id;

        self.repository.save_run(&run).await?;

        let tracked = Arc::new(TrackedRun {
            record: Mutex::new(run),
            execution_ids: parking_lot::Mutex::new(Vec::new()),
            channel: Arc::new(RunChannel::new(run_id, self.event_capacity)),
        });
        tracked.channel.publish(RunEventKind::Created);
        self.runs.write().await.insert(run_id, tracked);

        debug!(run_id = %run_id, mode = %definition.mode, "Run created");
        Ok(run_id)
    }

    /// Record the dispatch of one agent call.
    ///
    /// The first dispatch moves the run from `Pending` to `Running`.
    pub async fn begin_execution(
        &self,
        run_id: RunId,
        agent_key: &str,
        step_index: usize,
    ) -> Result<ExecutionId> {
        let tracked = self.tracked(run_id).await?;
        let mut run = tracked.record.lock().await;

        if run.status.is_terminal() {
            return Err(Error::invariant(format!(
                "cannot dispatch '{}' into run {} which is already {}",
                agent_key, run_id, run.status
            )));
        }

        let first_dispatch = run.status == RunStatus::Pending;
        if first_dispatch {
            let mut updated = run.clone();
            updated.status = RunStatus::Running;
            self.repository.save_run(&updated).await?;
            *run = updated;
        }

        let execution = AgentExecution {
            id: ExecutionId::new(),
            run_id,
            agent_key: agent_key.to_string(),
            step_index,
            status: ExecutionStatus::Running,
            started_at: Some(Utc::now()),
            completed_at: None,
            duration_ms: None,
            result: None,
            error: None,
            error_kind: None,
            metadata: ExecutionMetadata::default(),
        };
        let execution_id = execution.id;

        self.repository.save_execution(&execution).await?;
        self.executions
            .write()
            .await
            .insert(execution_id, Arc::new(Mutex::new(execution)));
        tracked.execution_ids.lock().push(execution_id);

        // Published under the run lock so events follow transition order
        if first_dispatch {
            tracked.channel.publish(RunEventKind::Started);
        }
        tracked.channel.publish(RunEventKind::ExecutionStarted {
            execution_id,
            agent_key: agent_key.to_string(),
            step_index,
        });
        drop(run);
        debug!(run_id = %run_id, execution_id = %execution_id, agent = %agent_key, step = step_index, "Execution dispatched");

        Ok(execution_id)
    }

    /// Record the terminal outcome of one agent call
    pub async fn complete_execution(
        &self,
        execution_id: ExecutionId,
        outcome: ExecutionOutcome,
    ) -> Result<AgentExecution> {
        let record = self.execution_record(execution_id).await?;
        let run_id = record.lock().await.run_id;
        let tracked = self.tracked(run_id).await?;

        // Lock order: run, then execution
        let mut run = tracked.record.lock().await;
        let mut execution = record.lock().await;
        let status = outcome.status();

        if execution.status.is_terminal() {
            if execution.status == status {
                debug!(execution_id = %execution_id, status = %status, "Repeated execution completion ignored");
                return Ok(execution.clone());
            }
            return Err(Error::invariant(format!(
                "execution {} is already {}, cannot become {}",
                execution_id, execution.status, status
            )));
        }
        if run.status.is_terminal() {
            return Err(Error::invariant(format!(
                "execution {} completed after run {} finished",
                execution_id, run_id
            )));
        }

        let now = Utc::now();
        let mut updated = execution.clone();
        updated.status = status;
        updated.completed_at = Some(now);
        updated.duration_ms = updated.started_at.map(|started| elapsed_ms(started, now));
        match outcome {
            ExecutionOutcome::Success { result, metadata } => {
                updated.result = Some(result);
                updated.metadata = metadata;
            }
            ExecutionOutcome::Failed { error, metadata } => {
                updated.error = Some(error.message.clone());
                updated.error_kind = Some(error.kind);
                updated.metadata = metadata;
            }
        }
        self.repository.save_execution(&updated).await?;
        *execution = updated.clone();
        drop(execution);

        let mut run_updated = run.clone();
        match status {
            ExecutionStatus::Success => run_updated.success_count += 1,
            _ => run_updated.failure_count += 1,
        }
        self.repository.save_run(&run_updated).await?;
        *run = run_updated;
        tracked.channel.publish(RunEventKind::ExecutionFinished {
            execution_id,
            agent_key: updated.agent_key.clone(),
            status,
            error: updated.error.clone(),
        });
        drop(run);

        match (&updated.error_kind, &updated.error) {
            (Some(kind), Some(error)) => {
                warn!(run_id = %run_id, agent = %updated.agent_key, kind = %kind, error = %error, "Agent execution failed")
            }
            _ => debug!(run_id = %run_id, agent = %updated.agent_key, duration_ms = ?updated.duration_ms, "Agent execution succeeded"),
        }

        Ok(updated)
    }

    /// Record the terminal state of a run.
    ///
    /// Every execution of the run must already be terminal.
    pub async fn complete_run(
        &self,
        run_id: RunId,
        completion: RunCompletion,
    ) -> Result<OrchestrationRun> {
        if !completion.status.is_terminal() {
            return Err(Error::invariant(format!(
                "run {} cannot complete with non-terminal status {}",
                run_id, completion.status
            )));
        }

        let tracked = self.tracked(run_id).await?;
        let mut run = tracked.record.lock().await;

        if run.status.is_terminal() {
            if run.status == completion.status {
                debug!(run_id = %run_id, "Repeated run completion ignored");
                return Ok(run.clone());
            }
            return Err(Error::invariant(format!(
                "run {} is already {}, cannot become {}",
                run_id, run.status, completion.status
            )));
        }

        let ids = tracked.execution_ids.lock().clone();
        for id in ids {
            let record = self.execution_record(id).await?;
            let execution = record.lock().await;
            if !execution.status.is_terminal() {
                return Err(Error::invariant(format!(
                    "run {} cannot finish while execution {} is {}",
                    run_id, id, execution.status
                )));
            }
        }

        let now = Utc::now();
        let mut updated = run.clone();
        updated.status = completion.status;
        updated.completed_at = Some(now);
        updated.duration_ms = Some(elapsed_ms(updated.started_at, now));
        updated.error = completion.error;
        updated.error_kind = completion.error_kind;
        updated.consensus_score = completion.consensus_score;
        updated.has_consensus = completion.has_consensus;
        updated.output = completion.output;

        self.repository.save_run(&updated).await?;
        *run = updated.clone();
        tracked.channel.publish(RunEventKind::Finished {
            status: updated.status,
            error: updated.error.clone(),
        });
        drop(run);
        self.finished.lock().push_back(run_id);

        info!(
            run_id = %run_id,
            status = %updated.status,
            successes = updated.success_count,
            failures = updated.failure_count,
            duration_ms = ?updated.duration_ms,
            "Run finished"
        );

        Ok(updated)
    }

    /// Executions of a run that have not reached a terminal status
    pub async fn outstanding(&self, run_id: RunId) -> Result<Vec<ExecutionId>> {
        let tracked = self.tracked(run_id).await?;
        let ids = tracked.execution_ids.lock().clone();

        let mut outstanding = Vec::new();
        for id in ids {
            let record = self.execution_record(id).await?;
            if !record.lock().await.status.is_terminal() {
                outstanding.push(id);
            }
        }
        Ok(outstanding)
    }

    /// Success and failure counts over the terminal executions of a run
    pub async fn tally(&self, run_id: RunId) -> Result<(usize, usize)> {
        let executions = self.executions(run_id).await?;
        let successes = executions
            .iter()
            .filter(|e| e.status == ExecutionStatus::Success)
            .count();
        let failures = executions
            .iter()
            .filter(|e| e.status == ExecutionStatus::Failed)
            .count();
        Ok((successes, failures))
    }

    /// Force every outstanding execution of a run to `Failed`
    pub async fn fail_outstanding(&self, run_id: RunId, error: InvocationError) -> Result<usize> {
        let outstanding = self.outstanding(run_id).await?;
        for id in &outstanding {
            self.complete_execution(*id, ExecutionOutcome::failed(error.clone()))
                .await?;
        }
        if !outstanding.is_empty() {
            warn!(run_id = %run_id, count = outstanding.len(), kind = %error.kind, "Force-completed outstanding executions");
        }
        Ok(outstanding.len())
    }

    /// Current run record
    pub async fn snapshot(&self, run_id: RunId) -> Result<OrchestrationRun> {
        let tracked = self.tracked(run_id).await?;
        let run = tracked.record.lock().await;
        Ok(run.clone())
    }

    /// Current execution records of a run, in dispatch order
    pub async fn executions(&self, run_id: RunId) -> Result<Vec<AgentExecution>> {
        let tracked = self.tracked(run_id).await?;
        let ids = tracked.execution_ids.lock().clone();

        let mut executions = Vec::with_capacity(ids.len());
        for id in ids {
            let record = self.execution_record(id).await?;
            executions.push(record.lock().await.clone());
        }
        Ok(executions)
    }

    /// Subscribe to future events of a run
    pub async fn subscribe(&self, run_id: RunId) -> Result<broadcast::Receiver<RunEvent>> {
        Ok(self.tracked(run_id).await?.channel.sender().subscribe())
    }

    pub(crate) async fn channel(&self, run_id: RunId) -> Result<Arc<RunChannel>> {
        Ok(self.tracked(run_id).await?.channel.clone())
    }

    /// Watch the status of a run
    pub async fn watch_status(&self, run_id: RunId) -> Result<watch::Receiver<RunStatus>> {
        Ok(self.tracked(run_id).await?.channel.watch_status())
    }

    /// Past events of a run, optionally after a sequence ID
    pub async fn replay(&self, run_id: RunId, starting_after: Option<SeqId>) -> Result<Vec<RunEvent>> {
        Ok(self.tracked(run_id).await?.channel.replay(starting_after))
    }

    /// Whether a run is in the working set
    pub async fn is_tracked(&self, run_id: RunId) -> bool {
        self.runs.read().await.contains_key(&run_id)
    }

    /// Drop a run and its executions from the working set
    pub async fn forget(&self, run_id: RunId) -> bool {
        let Some(tracked) = self.runs.write().await.remove(&run_id) else {
            return false;
        };
        self.finished.lock().retain(|id| *id != run_id);
        let ids = tracked.execution_ids.lock().clone();
        let mut executions = self.executions.write().await;
        for id in ids {
            executions.remove(&id);
        }
        true
    }

    /// Drop every finished run from the working set; returns how many
    pub async fn evict_finished(&self) -> usize {
        let candidates: Vec<(RunId, Arc<TrackedRun>)> = self
            .runs
            .read()
            .await
            .iter()
            .map(|(id, tracked)| (*id, tracked.clone()))
            .collect();

        let mut evicted = 0;
        for (run_id, tracked) in candidates {
            if tracked.record.lock().await.status.is_terminal() && self.forget(run_id).await {
                evicted += 1;
            }
        }
        evicted
    }

    /// Keep at most `keep` finished runs, dropping the oldest first.
    ///
    /// Returns how many runs were dropped.
    pub async fn trim_finished(&self, keep: usize) -> usize {
        let excess: Vec<RunId> = {
            let mut finished = self.finished.lock();
            let over = finished.len().saturating_sub(keep);
            finished.drain(..over).collect()
        };

        let mut trimmed = 0;
        for run_id in excess {
            if self.forget(run_id).await {
                trimmed += 1;
            }
        }
        if trimmed > 0 {
            debug!(trimmed, keep, "Trimmed finished runs from working set");
        }
        trimmed
    }

    /// Number of finished runs in the working set
    pub fn finished_len(&self) -> usize {
        self.finished.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{InvocationErrorKind, RunErrorKind};
    use crate::orchestrator::definition::AgentReference;
    use crate::run::AgentResult;
    use crate::storage::InMemoryRunStore;

    fn tracker() -> (ExecutionTracker, Arc<InMemoryRunStore>) {
        let store = Arc::new(InMemoryRunStore::new());
        (ExecutionTracker::new(store.clone(), 16), store)
    }

    fn definition() -> OrchestrationDefinition {
        OrchestrationDefinition::parallel(
            "tracker-test",
            vec![
                AgentReference::new("a").with_input("x"),
                AgentReference::new("b").with_input("y"),
            ],
        )
    }

    fn success(text: &str) -> ExecutionOutcome {
        ExecutionOutcome::Success {
            result: AgentResult::text(text),
            metadata: ExecutionMetadata::default(),
        }
    }

    #[tokio::test]
    async fn test_first_dispatch_starts_run() {
        let (tracker, store) = tracker();
        let run_id = tracker.begin_run(&definition(), &RunContext::new()).await.unwrap();
        assert_eq!(tracker.snapshot(run_id).await.unwrap().status, RunStatus::Pending);

        tracker.begin_execution(run_id, "a", 0).await.unwrap();
        assert_eq!(tracker.snapshot(run_id).await.unwrap().status, RunStatus::Running);

        let persisted = store.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(persisted.status, RunStatus::Running);
        assert_eq!(store.list_executions(run_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_completion_is_idempotent() {
        let (tracker, _) = tracker();
        let run_id = tracker.begin_run(&definition(), &RunContext::new()).await.unwrap();
        let id = tracker.begin_execution(run_id, "a", 0).await.unwrap();

        tracker.complete_execution(id, success("ok")).await.unwrap();
        let again = tracker.complete_execution(id, success("ok")).await.unwrap();
        assert_eq!(again.status, ExecutionStatus::Success);

        // Counted once
        assert_eq!(tracker.snapshot(run_id).await.unwrap().success_count, 1);
    }

    #[tokio::test]
    async fn test_conflicting_completion_is_invariant_violation() {
        let (tracker, _) = tracker();
        let run_id = tracker.begin_run(&definition(), &RunContext::new()).await.unwrap();
        let id = tracker.begin_execution(run_id, "a", 0).await.unwrap();

        tracker.complete_execution(id, success("ok")).await.unwrap();
        let err = tracker
            .complete_execution(id, ExecutionOutcome::failed(InvocationError::failed("late")))
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_run_completion_rules() {
        let (tracker, _) = tracker();
        let run_id = tracker.begin_run(&definition(), &RunContext::new()).await.unwrap();
        let id = tracker.begin_execution(run_id, "a", 0).await.unwrap();

        // Outstanding execution blocks completion
        let err = tracker
            .complete_run(run_id, RunCompletion::completed())
            .await
            .unwrap_err();
        assert!(err.is_fatal());

        tracker.complete_execution(id, success("ok")).await.unwrap();
        let run = tracker.complete_run(run_id, RunCompletion::completed()).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.duration_ms.is_some());

        // Same terminal state is a no-op, a different one is a defect
        tokio_test::assert_ok!(tracker.complete_run(run_id, RunCompletion::completed()).await);
        let err = tracker
            .complete_run(run_id, RunCompletion::failed(RunErrorKind::Cancelled, "late"))
            .await
            .unwrap_err();
        assert!(err.is_fatal());

        // No dispatch into a finished run
        assert!(tracker.begin_execution(run_id, "b", 1).await.unwrap_err().is_fatal());
    }

    #[tokio::test]
    async fn test_fail_outstanding_only_touches_open_executions() {
        let (tracker, _) = tracker();
        let run_id = tracker.begin_run(&definition(), &RunContext::new()).await.unwrap();
        let done = tracker.begin_execution(run_id, "a", 0).await.unwrap();
        tracker.begin_execution(run_id, "b", 1).await.unwrap();
        tracker.complete_execution(done, success("ok")).await.unwrap();

        let forced = tracker
            .fail_outstanding(run_id, InvocationError::cancelled("run cancelled"))
            .await
            .unwrap();
        assert_eq!(forced, 1);

        let executions = tracker.executions(run_id).await.unwrap();
        assert_eq!(executions[0].status, ExecutionStatus::Success);
        assert_eq!(executions[1].status, ExecutionStatus::Failed);
        assert_eq!(executions[1].error_kind, Some(InvocationErrorKind::Cancelled));
        assert!(tracker.outstanding(run_id).await.unwrap().is_empty());

        let run = tracker.snapshot(run_id).await.unwrap();
        assert_eq!(tracker.tally(run_id).await.unwrap(), (run.success_count, run.failure_count));
        assert_eq!(tracker.tally(run_id).await.unwrap(), (1, 1));
    }

    #[tokio::test]
    async fn test_events_are_replayable() {
        let (tracker, _) = tracker();
        let run_id = tracker.begin_run(&definition(), &RunContext::new()).await.unwrap();
        let id = tracker.begin_execution(run_id, "a", 0).await.unwrap();
        tracker.complete_execution(id, success("ok")).await.unwrap();
        tracker.complete_run(run_id, RunCompletion::completed()).await.unwrap();

        let events = tracker.replay(run_id, None).await.unwrap();
        let kinds: Vec<&str> = events
            .iter()
            .map(|e| match e.kind {
                RunEventKind::Created => "created",
                RunEventKind::Started => "started",
                RunEventKind::ExecutionStarted { .. } => "execution_started",
                RunEventKind::ExecutionFinished { .. } => "execution_finished",
                RunEventKind::Finished { .. } => "finished",
            })
            .collect();
        assert_eq!(
            kinds,
            vec!["created", "started", "execution_started", "execution_finished", "finished"]
        );
    }

    #[tokio::test]
    async fn test_forget_and_evict() {
        let (tracker, _) = tracker();
        let finished = tracker.begin_run(&definition(), &RunContext::new()).await.unwrap();
        tracker.complete_run(finished, RunCompletion::completed()).await.unwrap();
        let live = tracker.begin_run(&definition(), &RunContext::new()).await.unwrap();

        assert_eq!(tracker.evict_finished().await, 1);
        assert!(!tracker.is_tracked(finished).await);
        assert!(tracker.is_tracked(live).await);

        assert!(tracker.forget(live).await);
        assert!(matches!(tracker.snapshot(live).await, Err(Error::RunNotFound(_))));
        assert_eq!(tracker.finished_len(), 0);
    }

    #[tokio::test]
    async fn test_trim_keeps_newest_finished_runs() {
        let (tracker, store) = tracker();
        let mut finished = Vec::new();
        for _ in 0..4 {
            let run_id = tracker.begin_run(&definition(), &RunContext::new()).await.unwrap();
            tracker.complete_run(run_id, RunCompletion::completed()).await.unwrap();
            finished.push(run_id);
        }
        let live = tracker.begin_run(&definition(), &RunContext::new()).await.unwrap();

        assert_eq!(tracker.trim_finished(1).await, 3);
        assert_eq!(tracker.finished_len(), 1);
        assert!(tracker.is_tracked(finished[3]).await);
        assert!(!tracker.is_tracked(finished[0]).await);
        assert!(tracker.is_tracked(live).await);

        // Durable copy is untouched
        assert!(store.get_run(finished[0]).await.unwrap().is_some());
        assert_eq!(tracker.trim_finished(1).await, 0);
    }
}
