//! Agent invocation capability
//!
//! The engine treats calling an agent as opaque: prompt construction, model
//! selection and retries belong to the [`AgentInvoker`] implementation.

use crate::error::InvocationError;
use crate::run::{AgentResult, ExecutionMetadata};
use crate::types::{ExecutionId, RunId};
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// One agent call
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    /// Run the call belongs to
    pub run_id: RunId,
    /// Execution record tracking the call
    pub execution_id: ExecutionId,
    /// Agent identifier
    pub agent_key: String,
    /// Invocation mode tag from the definition, forwarded untouched
    pub invocation: String,
    /// Input payload
    pub input: String,
    /// Time budget for this call
    pub timeout: Duration,
}

/// Successful answer from an invoker
#[derive(Debug, Clone)]
pub struct AgentReply {
    /// The agent's result
    pub result: AgentResult,
    /// Prompt tokens consumed
    pub input_tokens: Option<u64>,
    /// Completion tokens produced
    pub output_tokens: Option<u64>,
    /// Model that served the call
    pub model: Option<String>,
    /// Total attempts made, including the first
    pub attempts: u32,
}

impl AgentReply {
    /// Create a reply carrying only a result
    pub fn new(result: impl Into<AgentResult>) -> Self {
        Self {
            result: result.into(),
            input_tokens: None,
            output_tokens: None,
            model: None,
            attempts: 1,
        }
    }

    /// Record token usage
    pub fn with_usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.input_tokens = Some(input_tokens);
        self.output_tokens = Some(output_tokens);
        self
    }

    /// Record the serving model
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Record the number of attempts
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Accounting to store on the execution record
    pub fn metadata(&self) -> ExecutionMetadata {
        ExecutionMetadata {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            model: self.model.clone(),
            retries: self.attempts.saturating_sub(1),
        }
    }
}

/// Capability to call one agent
///
/// Implementations should wind down and return when `cancel` fires. The
/// engine keeps polling a cancelled call until it returns or its per-call
/// deadline passes, and `cancel` also fires when that deadline expires.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    /// Invoke an agent
    async fn invoke(
        &self,
        request: InvocationRequest,
        cancel: CancellationToken,
    ) -> std::result::Result<AgentReply, InvocationError>;

    /// Invoker name for logging
    fn name(&self) -> &str {
        "agent-invoker"
    }
}
