//! Orchestration coordinator
//!
//! Public entry point of the engine. Validates a definition, creates the run
//! record, picks the executor for the definition's mode and drives it on the
//! tokio runtime. The caller gets a [`RunHandle`] to observe, cancel or await
//! the run.

use crate::config::EngineConfig;
use crate::error::{Error, InvocationError, Result};
use crate::events::{RunChannel, RunEvent};
use crate::invoker::AgentInvoker;
use crate::orchestrator::chain::ChainExecutor;
use crate::orchestrator::consensus::ConsensusExecutor;
use crate::orchestrator::definition::{OrchestrationDefinition, OrchestrationMode};
use crate::orchestrator::parallel::ParallelExecutor;
use crate::orchestrator::pattern::{ExecutionContext, RunControl, StopReason, TopologyExecutor};
use crate::run::{AgentExecution, OrchestrationRun, RunCompletion, RunContext, RunStatus};
use crate::scoring::{ConsensusScorer, Similarity};
use crate::storage::{DefinitionSource, InMemoryRunStore, RunRepository};
use crate::tracker::ExecutionTracker;
use crate::types::{DefinitionId, RunId};
use futures::Stream;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

type LiveRuns = Arc<Mutex<HashMap<RunId, RunControl>>>;

/// Runs orchestration definitions
pub struct Coordinator {
    tracker: Arc<ExecutionTracker>,
    invoker: Arc<dyn AgentInvoker>,
    definitions: Option<Arc<dyn DefinitionSource>>,
    executors: HashMap<OrchestrationMode, Arc<dyn TopologyExecutor>>,
    live: LiveRuns,
    config: EngineConfig,
}

impl Coordinator {
    /// Start building a coordinator
    pub fn builder() -> CoordinatorBuilder {
        CoordinatorBuilder::new()
    }

    /// Engine configuration in use
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Tracker holding live run state
    pub fn tracker(&self) -> &Arc<ExecutionTracker> {
        &self.tracker
    }

    /// Validate and start a run.
    ///
    /// Validation failures return before any record is created.
    #[instrument(skip_all, fields(definition = %definition.name, mode = %definition.mode))]
    pub async fn execute(
        &self,
        definition: OrchestrationDefinition,
        context: RunContext,
    ) -> Result<RunHandle> {
        definition.validate()?;

        let executor = self
            .executors
            .get(&definition.mode)
            .cloned()
            .ok_or_else(|| Error::config(format!("no executor registered for {} mode", definition.mode)))?;

        let run_id = self.tracker.begin_run(&definition, &context).await?;
        let channel = self.tracker.channel(run_id).await?;

        let control = RunControl::new();
        let mode = definition.mode;
        let ctx = ExecutionContext {
            run_id,
            definition: Arc::new(definition),
            tracker: self.tracker.clone(),
            invoker: self.invoker.clone(),
            control: control.clone(),
            call_timeout: context.call_timeout.unwrap_or_else(|| self.config.call_timeout()),
        };
        let run_timeout = context.run_timeout.unwrap_or_else(|| self.config.run_timeout());
        let retain = self.config.retain_finished_runs;

        self.live.lock().insert(run_id, control.clone());

        let live = self.live.clone();
        let tracker = self.tracker.clone();
        let span = info_span!("run", run_id = %run_id, mode = %mode);
        let task = tokio::spawn(
            async move {
                let result = drive_run(&tracker, executor, ctx, run_timeout).await;
                live.lock().remove(&run_id);
                tracker.trim_finished(retain).await;
                match &result {
                    Err(e) if e.is_fatal() => error!(error = %e, "Invariant violated while driving run"),
                    Err(e) => warn!(error = %e, "Run could not be recorded"),
                    Ok(_) => {}
                }
                result
            }
            .instrument(span),
        );

        info!(run_id = %run_id, timeout_ms = run_timeout.as_millis() as u64, "Run started");

        Ok(RunHandle {
            run_id,
            control,
            channel,
            task,
        })
    }

    /// Start a run from a stored definition
    pub async fn execute_definition(&self, id: DefinitionId, context: RunContext) -> Result<RunHandle> {
        let source = self
            .definitions
            .as_ref()
            .ok_or_else(|| Error::config("no definition source configured"))?;

        let mut definition = source
            .read_definition(id)
            .await?
            .ok_or(Error::DefinitionNotFound(id))?;
        definition.id.get_or_insert(id);

        self.execute(definition, context).await
    }

    /// Request cancellation of a live run.
    ///
    /// Returns `false` when the run already finished or was already stopped.
    pub async fn cancel_run(&self, run_id: RunId) -> Result<bool> {
        let control = self.live.lock().get(&run_id).cloned();
        if let Some(control) = control {
            return Ok(control.stop(StopReason::Cancelled));
        }
        match self.tracker.repository().get_run(run_id).await? {
            Some(_) => Ok(false),
            None => Err(Error::RunNotFound(run_id)),
        }
    }

    /// Load a run record
    pub async fn get_run(&self, run_id: RunId) -> Result<OrchestrationRun> {
        self.tracker
            .repository()
            .get_run(run_id)
            .await?
            .ok_or(Error::RunNotFound(run_id))
    }

    /// Load the executions of a run, ordered by step index
    pub async fn list_executions(&self, run_id: RunId) -> Result<Vec<AgentExecution>> {
        let repository = self.tracker.repository();
        if repository.get_run(run_id).await?.is_none() {
            return Err(Error::RunNotFound(run_id));
        }
        repository.list_executions(run_id).await
    }

    /// List runs, newest first, optionally for one definition
    pub async fn list_runs(&self, definition_id: Option<DefinitionId>) -> Result<Vec<OrchestrationRun>> {
        self.tracker.repository().list_runs(definition_id).await
    }

    /// Delete a finished run and all of its executions
    pub async fn delete_run(&self, run_id: RunId) -> Result<()> {
        let run = self.get_run(run_id).await?;
        if !run.is_finished() {
            return Err(Error::validation(format!(
                "run {} is {} and cannot be deleted until it finishes",
                run_id, run.status
            )));
        }

        self.tracker.repository().delete_run(run_id).await?;
        self.tracker.forget(run_id).await;
        debug!(run_id = %run_id, "Run deleted");
        Ok(())
    }

    /// Drop finished runs from the in-memory working set
    pub async fn evict_finished(&self) -> usize {
        self.tracker.evict_finished().await
    }
}

async fn drive_run(
    tracker: &ExecutionTracker,
    executor: Arc<dyn TopologyExecutor>,
    ctx: ExecutionContext,
    run_timeout: Duration,
) -> Result<OrchestrationRun> {
    let run_id = ctx.run_id;

    let work = executor.execute(&ctx);
    tokio::pin!(work);
    let outcome = match tokio::time::timeout(run_timeout, &mut work).await {
        Ok(outcome) => outcome,
        Err(_) => {
            if ctx.control.stop(StopReason::TimedOut(run_timeout)) {
                warn!(timeout_ms = run_timeout.as_millis() as u64, "Run timed out, draining calls");
            }
            work.await
        }
    };

    // Stops that arrive after this point leave the executor's result alone
    let completion = match (outcome, ctx.control.seal()) {
        (Err(error), _) if error.is_fatal() => return Err(error),
        (outcome, Some(reason)) => {
            if let Err(error) = outcome {
                debug!(error = %error, "Executor error superseded by stop");
            }
            tracker.fail_outstanding(run_id, reason.invocation_error()).await?;
            let error = reason.run_error();
            RunCompletion::failed(error.run_error_kind(), error.to_string())
        }
        (Ok(completion), None) => completion,
        (Err(error), None) => {
            warn!(error = %error, "Executor failed");
            tracker
                .fail_outstanding(run_id, InvocationError::failed(error.to_string()))
                .await?;
            RunCompletion::failed(error.run_error_kind(), error.to_string())
        }
    };

    tracker.complete_run(run_id, completion).await
}

/// Handle to a started run
pub struct RunHandle {
    run_id: RunId,
    control: RunControl,
    channel: Arc<RunChannel>,
    task: JoinHandle<Result<OrchestrationRun>>,
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("run_id", &self.run_id)
            .finish_non_exhaustive()
    }
}

impl RunHandle {
    /// Run identifier
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Request cancellation.
    ///
    /// Returns `false` once the run was stopped or its executor finished.
    pub fn cancel(&self) -> bool {
        self.control.stop(StopReason::Cancelled)
    }

    /// Receive events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.channel.sender().subscribe()
    }

    /// Watch the run status
    pub fn status(&self) -> watch::Receiver<RunStatus> {
        self.channel.watch_status()
    }

    /// Every event of the run, past and future, ending with the final one.
    ///
    /// Falls back to a replay if the subscriber lags behind.
    pub fn events(&self) -> impl Stream<Item = RunEvent> + Send + 'static {
        let channel = self.channel.clone();
        let mut receiver = channel.sender().subscribe();
        let run_id = self.run_id;

        async_stream::stream! {
            let mut last = None;

            for event in channel.replay(None) {
                last = Some(event.seq_id);
                let done = event.kind.is_final();
                yield event;
                if done {
                    return;
                }
            }

            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        if last.is_some_and(|seq| event.seq_id <= seq) {
                            continue;
                        }
                        last = Some(event.seq_id);
                        let done = event.kind.is_final();
                        yield event;
                        if done {
                            return;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(run_id = %run_id, skipped, "Event subscriber lagged, replaying");
                        for event in channel.replay(last) {
                            last = Some(event.seq_id);
                            let done = event.kind.is_final();
                            yield event;
                            if done {
                                return;
                            }
                        }
                    }
                    Err(RecvError::Closed) => return,
                }
            }
        }
    }

    /// Wait for the run to finish and return its final record
    pub async fn wait(self) -> Result<OrchestrationRun> {
        self.task
            .await
            .map_err(|e| Error::invariant(format!("run task for {} failed: {}", self.run_id, e)))?
    }
}

/// Builder for [`Coordinator`]
pub struct CoordinatorBuilder {
    invoker: Option<Arc<dyn AgentInvoker>>,
    repository: Option<Arc<dyn RunRepository>>,
    definitions: Option<Arc<dyn DefinitionSource>>,
    scorer: Option<Arc<ConsensusScorer>>,
    executors: Vec<Arc<dyn TopologyExecutor>>,
    config: EngineConfig,
}

impl CoordinatorBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self {
            invoker: None,
            repository: None,
            definitions: None,
            scorer: None,
            executors: Vec::new(),
            config: EngineConfig::default(),
        }
    }

    /// Set the agent invoker (required)
    pub fn invoker(mut self, invoker: Arc<dyn AgentInvoker>) -> Self {
        self.invoker = Some(invoker);
        self
    }

    /// Set the run repository; defaults to an in-memory store
    pub fn repository(mut self, repository: Arc<dyn RunRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Set the definition source used by `execute_definition`
    pub fn definitions(mut self, definitions: Arc<dyn DefinitionSource>) -> Self {
        self.definitions = Some(definitions);
        self
    }

    /// Use a custom similarity for consensus scoring
    pub fn similarity(mut self, similarity: Arc<dyn Similarity>) -> Self {
        self.scorer = Some(Arc::new(ConsensusScorer::new(similarity)));
        self
    }

    /// Replace the executor for its mode
    pub fn executor(mut self, executor: Arc<dyn TopologyExecutor>) -> Self {
        self.executors.push(executor);
        self
    }

    /// Set the engine configuration
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the coordinator
    pub fn build(self) -> Result<Coordinator> {
        self.config.validate()?;

        let invoker = self
            .invoker
            .ok_or_else(|| Error::config("an agent invoker is required"))?;
        let repository = self
            .repository
            .unwrap_or_else(|| Arc::new(InMemoryRunStore::new()));
        let scorer = self
            .scorer
            .unwrap_or_else(|| Arc::new(ConsensusScorer::from_policy(self.config.scoring)));

        let mut executors: HashMap<OrchestrationMode, Arc<dyn TopologyExecutor>> = HashMap::new();
        executors.insert(OrchestrationMode::Parallel, Arc::new(ParallelExecutor::new()));
        executors.insert(OrchestrationMode::Chain, Arc::new(ChainExecutor::new()));
        executors.insert(OrchestrationMode::Consensus, Arc::new(ConsensusExecutor::new(scorer)));
        for executor in self.executors {
            executors.insert(executor.mode(), executor);
        }

        Ok(Coordinator {
            tracker: Arc::new(ExecutionTracker::new(repository, self.config.event_capacity)),
            invoker,
            definitions: self.definitions,
            executors,
            live: Arc::new(Mutex::new(HashMap::new())),
            config: self.config,
        })
    }
}

impl Default for CoordinatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::definition::AgentReference;
    use crate::run::ExecutionStatus;
    use crate::testing::ScriptedInvoker;
    use futures::StreamExt;

    fn coordinator(invoker: ScriptedInvoker) -> Coordinator {
        Coordinator::builder()
            .invoker(Arc::new(invoker))
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_requires_invoker() {
        assert!(matches!(Coordinator::builder().build(), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_single_agent_parallel_run_keeps_output() {
        let coordinator = coordinator(ScriptedInvoker::new().reply("summarizer", "done"));
        let definition = OrchestrationDefinition::parallel(
            "one",
            vec![AgentReference::new("summarizer").with_input("text")],
        );

        let run = coordinator
            .execute(definition, RunContext::new().triggered_by("tester"))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.output.map(|o| o.as_text()), Some("done".to_string()));
        assert_eq!(run.triggered_by.as_deref(), Some("tester"));
    }

    #[tokio::test]
    async fn test_event_stream_ends_with_final_event() {
        let coordinator = coordinator(ScriptedInvoker::new());
        let definition = OrchestrationDefinition::parallel(
            "events",
            vec![
                AgentReference::new("a").with_input("1"),
                AgentReference::new("b").with_input("2"),
            ],
        );

        let handle = coordinator.execute(definition, RunContext::new()).await.unwrap();
        let events: Vec<RunEvent> = handle.events().collect().await;
        handle.wait().await.unwrap();

        assert!(events.last().unwrap().kind.is_final());
        let seqs: Vec<u64> = events.iter().map(|e| e.seq_id.value()).collect();
        assert_eq!(seqs, (0..events.len() as u64).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_cancel_after_finish_is_noop() {
        let coordinator = coordinator(ScriptedInvoker::new());
        let definition =
            OrchestrationDefinition::parallel("done", vec![AgentReference::new("a").with_input("x")]);

        let handle = coordinator.execute(definition, RunContext::new()).await.unwrap();
        let run_id = handle.run_id();
        let mut status = handle.status();
        status.wait_for(|s| s.is_terminal()).await.unwrap();
        assert!(!handle.cancel());
        let run = handle.wait().await.unwrap();

        assert!(!coordinator.cancel_run(run_id).await.unwrap());
        let after = coordinator.get_run(run_id).await.unwrap();
        assert_eq!(after.status, run.status);
        assert_eq!(
            coordinator.list_executions(run_id).await.unwrap()[0].status,
            ExecutionStatus::Success
        );
    }
}
