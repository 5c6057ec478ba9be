//! Consensus executor
//!
//! The definition's question goes to every agent concurrently. Once all
//! calls are terminal the successful results are scored for agreement.

use crate::error::{Error, Result, RunErrorKind};
use crate::orchestrator::definition::OrchestrationMode;
use crate::orchestrator::dispatch::dispatch;
use crate::orchestrator::pattern::{ExecutionContext, TopologyExecutor};
use crate::run::{AgentResult, ExecutionStatus, RunCompletion};
use crate::scoring::{ConsensusScorer, MIN_CONSENSUS_RESULTS};
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info};

/// Voting topology with scored agreement
#[derive(Debug, Clone)]
pub struct ConsensusExecutor {
    scorer: Arc<ConsensusScorer>,
}

impl ConsensusExecutor {
    /// Create an executor that judges agreement with `scorer`
    pub fn new(scorer: Arc<ConsensusScorer>) -> Self {
        Self { scorer }
    }
}

impl Default for ConsensusExecutor {
    fn default() -> Self {
        Self::new(Arc::new(ConsensusScorer::default()))
    }
}

#[async_trait]
impl TopologyExecutor for ConsensusExecutor {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<RunCompletion> {
        let definition = &ctx.definition;
        let question = definition.question.clone().unwrap_or_default();

        let futures = definition
            .agents
            .iter()
            .enumerate()
            .map(|(index, agent)| dispatch(ctx, agent, index, question.clone()));

        let executions = join_all(futures)
            .await
            .into_iter()
            .collect::<Result<Vec<_>>>()?;

        let results: Vec<AgentResult> = executions
            .into_iter()
            .filter(|e| e.status == ExecutionStatus::Success)
            .filter_map(|e| e.result)
            .collect();

        if results.len() < MIN_CONSENSUS_RESULTS {
            let error = Error::InsufficientData {
                successful: results.len(),
                required: MIN_CONSENSUS_RESULTS,
            };
            debug!(run_id = %ctx.run_id, successful = results.len(), "Not enough results to judge consensus");
            return Ok(RunCompletion::failed(RunErrorKind::InsufficientData, error.to_string())
                .with_consensus(0.0, false));
        }

        let decision = self.scorer.decide(&results, definition.consensus_threshold);
        info!(
            run_id = %ctx.run_id,
            score = decision.score,
            threshold = definition.consensus_threshold,
            reached = decision.reached,
            policy = self.scorer.policy_name(),
            "Consensus scored"
        );

        Ok(RunCompletion::completed().with_consensus(decision.score, decision.reached))
    }

    fn mode(&self) -> OrchestrationMode {
        OrchestrationMode::Consensus
    }
}
