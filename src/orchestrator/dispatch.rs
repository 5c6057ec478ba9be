//! Single agent dispatch shared by all topologies

use crate::error::{InvocationError, Result};
use crate::invoker::{AgentReply, InvocationRequest};
use crate::orchestrator::definition::AgentReference;
use crate::orchestrator::pattern::ExecutionContext;
use crate::run::{AgentExecution, AgentResult, ExecutionOutcome};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};

/// Run one agent call to a terminal execution record.
///
/// The call is bounded by the per-call timeout. When the run is stopped the
/// call keeps being polled until it returns, so the invoker can observe the
/// signal and wind down; its outcome is then recorded with the stop's kind.
/// An `Error` payload from the agent counts as a failure.
pub(crate) async fn dispatch(
    ctx: &ExecutionContext,
    agent: &AgentReference,
    step_index: usize,
    input: String,
) -> Result<AgentExecution> {
    let execution_id = ctx
        .tracker
        .begin_execution(ctx.run_id, &agent.agent_key, step_index)
        .await?;

    let request = InvocationRequest {
        run_id: ctx.run_id,
        execution_id,
        agent_key: agent.agent_key.clone(),
        invocation: agent.invocation.clone(),
        input,
        timeout: ctx.call_timeout,
    };

    trace!(agent = %agent.agent_key, invoker = ctx.invoker.name(), "Invoking agent");
    let outcome = call_agent(ctx, agent, request).await;

    ctx.tracker.complete_execution(execution_id, outcome).await
}

async fn call_agent(
    ctx: &ExecutionContext,
    agent: &AgentReference,
    request: InvocationRequest,
) -> ExecutionOutcome {
    let deadline = Instant::now() + ctx.call_timeout;
    let run_token = ctx.control.token();
    let call_token = run_token.child_token();
    // Fires on every exit, including the per-call timeout
    let _call_guard = call_token.clone().drop_guard();

    let call = ctx.invoker.invoke(request, call_token);
    tokio::pin!(call);

    let first = tokio::select! {
        biased;
        reply = timeout_at(deadline, &mut call) => Some(reply),
        _ = run_token.cancelled() => None,
    };

    let (reply, interrupted) = match first {
        Some(reply) => (reply, false),
        None => {
            debug!(agent = %agent.agent_key, "Run stopped, draining agent call");
            (timeout_at(deadline, &mut call).await, true)
        }
    };

    match reply {
        Ok(Ok(reply)) if interrupted => ExecutionOutcome::Failed {
            error: ctx.control.interruption(),
            metadata: reply.metadata(),
        },
        Ok(Ok(reply)) => settle(reply),
        Ok(Err(error)) if interrupted || ctx.control.is_stopped() => {
            ExecutionOutcome::failed(InvocationError::new(ctx.control.interruption().kind, error.message))
        }
        Ok(Err(error)) => ExecutionOutcome::failed(error),
        Err(_) if interrupted => ExecutionOutcome::failed(ctx.control.interruption()),
        Err(_) => ExecutionOutcome::failed(InvocationError::timeout(format!(
            "agent '{}' exceeded {}ms",
            agent.agent_key,
            ctx.call_timeout.as_millis()
        ))),
    }
}

fn settle(reply: AgentReply) -> ExecutionOutcome {
    let metadata = reply.metadata();
    match reply.result {
        AgentResult::Error(message) => ExecutionOutcome::Failed {
            error: InvocationError::agent(message),
            metadata,
        },
        result => ExecutionOutcome::Success { result, metadata },
    }
}

/// Record a step that failed before its agent could be called
pub(crate) async fn reject(
    ctx: &ExecutionContext,
    agent: &AgentReference,
    step_index: usize,
    error: InvocationError,
) -> Result<AgentExecution> {
    let execution_id = ctx
        .tracker
        .begin_execution(ctx.run_id, &agent.agent_key, step_index)
        .await?;
    ctx.tracker
        .complete_execution(execution_id, ExecutionOutcome::failed(error))
        .await
}
