//! Parallel executor
//!
//! Every agent is dispatched at once with its own literal input. The run
//! fails only when no agent succeeded.

use crate::error::{Result, RunErrorKind};
use crate::orchestrator::definition::{AgentInput, OrchestrationMode};
use crate::orchestrator::dispatch::dispatch;
use crate::orchestrator::pattern::{ExecutionContext, TopologyExecutor};
use crate::run::{ExecutionStatus, RunCompletion};
use async_trait::async_trait;
use futures::future::join_all;
use tracing::debug;

/// Concurrent fan-out over independent agents
#[derive(Debug, Clone, Copy, Default)]
pub struct ParallelExecutor;

impl ParallelExecutor {
    /// Create a new parallel executor
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TopologyExecutor for ParallelExecutor {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<RunCompletion> {
        let agents = &ctx.definition.agents;

        let futures = agents.iter().enumerate().map(|(index, agent)| {
            let input = match agent.input_source() {
                AgentInput::Literal(text) => text.to_string(),
                AgentInput::Transform(_) | AgentInput::Inherit => String::new(),
            };
            dispatch(ctx, agent, index, input)
        });

        let executions = join_all(futures)
            .await
            .into_iter()
            .collect::<Result<Vec<_>>>()?;

        let succeeded = executions
            .iter()
            .filter(|e| e.status == ExecutionStatus::Success)
            .count();
        debug!(
            run_id = %ctx.run_id,
            succeeded,
            failed = executions.len() - succeeded,
            "Parallel fan-out drained"
        );

        if succeeded == 0 {
            let detail = executions
                .iter()
                .filter_map(|e| e.error.as_deref().map(|error| format!("{}: {}", e.agent_key, error)))
                .collect::<Vec<_>>()
                .join("; ");
            return Ok(RunCompletion::failed(
                RunErrorKind::Execution,
                format!("all {} agents failed ({})", executions.len(), detail),
            ));
        }

        let output = match executions.as_slice() {
            [only] => only.result.clone(),
            _ => None,
        };
        Ok(RunCompletion::completed().with_output(output))
    }

    fn mode(&self) -> OrchestrationMode {
        OrchestrationMode::Parallel
    }
}
