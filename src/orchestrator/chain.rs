//! Chain executor
//!
//! Agents run strictly one at a time. Step 0 receives the chain's initial
//! input; each later step receives a literal, a transform of the current
//! value, or the current value itself. The first failure aborts the chain
//! and later steps get no execution record.

use crate::error::{InvocationError, Result, RunErrorKind};
use crate::orchestrator::definition::{AgentInput, AgentReference, OrchestrationMode};
use crate::orchestrator::dispatch::{dispatch, reject};
use crate::orchestrator::pattern::{ExecutionContext, TopologyExecutor};
use crate::orchestrator::transform::InputTransform;
use crate::run::{AgentResult, RunCompletion};
use async_trait::async_trait;
use tracing::debug;

/// Sequential, data-dependent agent pipeline
#[derive(Debug, Clone, Copy, Default)]
pub struct ChainExecutor;

impl ChainExecutor {
    /// Create a new chain executor
    pub fn new() -> Self {
        Self
    }

    fn step_input(
        agent: &AgentReference,
        step_index: usize,
        current: &AgentResult,
        initial: &str,
    ) -> std::result::Result<String, InvocationError> {
        if step_index == 0 {
            return Ok(initial.to_string());
        }
        match agent.input_source() {
            AgentInput::Literal(text) => Ok(text.to_string()),
            AgentInput::Inherit => Ok(current.as_text()),
            AgentInput::Transform(expression) => InputTransform::parse(expression)
                .and_then(|transform| transform.render(current, initial))
                .map_err(|e| {
                    InvocationError::invalid_input(format!(
                        "step {} input transform failed: {}",
                        step_index, e
                    ))
                }),
        }
    }
}

#[async_trait]
impl TopologyExecutor for ChainExecutor {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<RunCompletion> {
        let initial = ctx.definition.initial_input.clone().unwrap_or_default();
        let mut current = AgentResult::text(initial.clone());

        for (step_index, agent) in ctx.definition.agents.iter().enumerate() {
            if ctx.control.is_stopped() {
                debug!(run_id = %ctx.run_id, step = step_index, "Chain stopped before step");
                return Ok(RunCompletion::failed(
                    RunErrorKind::Cancelled,
                    format!("chain stopped before step {}", step_index),
                ));
            }

            let execution = match Self::step_input(agent, step_index, &current, &initial) {
                Ok(input) => dispatch(ctx, agent, step_index, input).await?,
                Err(error) => reject(ctx, agent, step_index, error).await?,
            };

            match execution.result {
                Some(result) if execution.error.is_none() => current = result,
                _ => {
                    let error = execution.error.unwrap_or_else(|| "no result".to_string());
                    return Ok(RunCompletion::failed(
                        RunErrorKind::Execution,
                        format!(
                            "chain aborted at step {} ('{}'): {}",
                            step_index, execution.agent_key, error
                        ),
                    ));
                }
            }
        }

        Ok(RunCompletion::completed().with_output(Some(current)))
    }

    fn mode(&self) -> OrchestrationMode {
        OrchestrationMode::Chain
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InvocationErrorKind;
    use serde_json::json;

    #[test]
    fn test_first_step_always_gets_initial_input() {
        let agent = AgentReference::new("a").with_input("ignored");
        let input = ChainExecutor::step_input(&agent, 0, &AgentResult::text("seed"), "seed").unwrap();
        assert_eq!(input, "seed");
    }

    #[test]
    fn test_later_step_input_sources() {
        let current = AgentResult::structured(json!({"summary": "short"}));

        let literal = AgentReference::new("b").with_input("fixed");
        assert_eq!(ChainExecutor::step_input(&literal, 1, &current, "seed").unwrap(), "fixed");

        let inherit = AgentReference::new("b");
        assert_eq!(
            ChainExecutor::step_input(&inherit, 1, &current, "seed").unwrap(),
            r#"{"summary":"short"}"#
        );

        let transform = AgentReference::new("b").with_transform("Refine: {{ previous.summary }}");
        assert_eq!(
            ChainExecutor::step_input(&transform, 1, &current, "seed").unwrap(),
            "Refine: short"
        );
    }

    #[test]
    fn test_unresolvable_transform_is_invalid_input() {
        let agent = AgentReference::new("b").with_transform("{{ previous.missing }}");
        let err = ChainExecutor::step_input(&agent, 1, &AgentResult::structured(json!({})), "seed")
            .unwrap_err();
        assert_eq!(err.kind, InvocationErrorKind::InvalidInput);
    }
}
