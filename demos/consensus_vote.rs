//! Consensus vote example with a local rule-based invoker
//!
//! Three "reviewers" vote on a release question, then a chain turns the
//! verdict into an announcement. No model server is needed: each agent is a
//! small closure over the input text.
//!
//! ```bash
//! CONDUCTOR_SCORING=normalized cargo run --example consensus_vote
//! ```

use agent_conductor::prelude::*;
use agent_conductor::{init_tracing, InvocationError, RunEventKind};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

type Rule = Box<dyn Fn(&str) -> String + Send + Sync>;

/// Invoker that answers from in-process rules
struct RuleInvoker {
    rules: HashMap<String, Rule>,
}

impl RuleInvoker {
    fn new() -> Self {
        Self {
            rules: HashMap::new(),
        }
    }

    fn rule(mut self, agent_key: &str, rule: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        self.rules.insert(agent_key.to_string(), Box::new(rule));
        self
    }
}

#[async_trait]
impl AgentInvoker for RuleInvoker {
    async fn invoke(
        &self,
        request: InvocationRequest,
        cancel: CancellationToken,
    ) -> std::result::Result<AgentReply, InvocationError> {
        let rule = self
            .rules
            .get(&request.agent_key)
            .ok_or_else(|| InvocationError::failed(format!("unknown agent '{}'", request.agent_key)))?;

        // Pretend to think
        tokio::select! {
            _ = cancel.cancelled() => return Err(InvocationError::cancelled("stopped")),
            _ = tokio::time::sleep(Duration::from_millis(25)) => {}
        }

        let answer = rule(&request.input);
        let tokens = request.input.split_whitespace().count() as u64;
        Ok(AgentReply::new(answer)
            .with_usage(tokens, 1)
            .with_model("rules-v1"))
    }

    fn name(&self) -> &str {
        "rules"
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = EngineConfig::from_env()?;
    init_tracing(&config.logging)?;

    println!("=== Consensus Vote Example ===\n");

    let invoker = RuleInvoker::new()
        .rule("qa", |q| if q.contains("tests") { "Yes".into() } else { "no".into() })
        .rule("security", |_| "yes".into())
        .rule("product", |_| "  YES ".into())
        .rule("writer", |verdict| format!("Release approved by review ({})", verdict.trim()))
        .rule("editor", |draft| format!("{}!", draft));

    let coordinator = Coordinator::builder()
        .invoker(Arc::new(invoker))
        .config(config)
        .build()?;

    let vote = OrchestrationDefinition::consensus(
        "release-vote",
        "All tests pass. Should we release 2.4 today?",
        0.66,
        vec![
            AgentReference::new("qa"),
            AgentReference::new("security"),
            AgentReference::new("product"),
        ],
    );

    let handle = coordinator
        .execute(vote, RunContext::new().triggered_by("demo"))
        .await?;

    let mut events = Box::pin(handle.events());
    while let Some(event) = events.next().await {
        match event.kind {
            RunEventKind::ExecutionFinished { agent_key, status, .. } => {
                println!("  [{}] {} -> {}", event.seq_id, agent_key, status)
            }
            RunEventKind::Finished { status, .. } => println!("  [{}] run {}", event.seq_id, status),
            _ => {}
        }
    }

    let run = handle.wait().await?;
    println!(
        "\nscore = {:.3}, consensus = {}",
        run.consensus_score.unwrap_or_default(),
        run.has_consensus.unwrap_or(false)
    );

    if run.has_consensus != Some(true) {
        println!("No agreement; nothing to announce.");
        return Ok(());
    }

    let announce = OrchestrationDefinition::chain(
        "announce",
        "yes",
        vec![AgentReference::new("writer"), AgentReference::new("editor")],
    );
    let run = coordinator
        .execute(announce, RunContext::new())
        .await?
        .wait()
        .await?;

    if let Some(output) = run.output {
        println!("\nAnnouncement: {}", output.as_text());
    }

    for execution in coordinator.list_executions(run.id).await? {
        println!(
            "  step {} {} ({} ms, model {:?})",
            execution.step_index,
            execution.agent_key,
            execution.duration_ms.unwrap_or_default(),
            execution.metadata.model
        );
    }

    Ok(())
}
