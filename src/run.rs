//! Run and execution records
//!
//! An [`OrchestrationRun`] exclusively owns its [`AgentExecution`]s. Both are
//! plain data; all state transitions go through the
//! [`ExecutionTracker`](crate::tracker::ExecutionTracker).

use crate::error::{InvocationError, InvocationErrorKind, RunErrorKind};
use crate::orchestrator::definition::OrchestrationMode;
use crate::types::{DefinitionId, ExecutionId, RunId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Lifecycle status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, no agent dispatched yet
    Pending,
    /// At least one agent call dispatched
    Running,
    /// Finished; partial failures may be present
    Completed,
    /// Finished unsuccessfully
    Failed,
}

impl RunStatus {
    /// Whether the status is final
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Stable lowercase label
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of one agent execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Recorded but not yet dispatched
    Pending,
    /// Call outstanding
    Running,
    /// Agent returned a usable result
    Success,
    /// Agent call failed, timed out or was cancelled
    Failed,
}

impl ExecutionStatus {
    /// Whether the status is final
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    /// Stable lowercase label
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Loosely-typed answer from an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AgentResult {
    /// Structured JSON value
    Structured(serde_json::Value),
    /// Free text
    Text(String),
    /// Error payload reported by the agent itself
    Error(String),
}

impl AgentResult {
    /// Create a text result
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    /// Create a structured result
    pub fn structured(value: serde_json::Value) -> Self {
        Self::Structured(value)
    }

    /// Whether the agent reported an error
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Render the result as text.
    ///
    /// JSON strings render without quotes so that `Structured("yes")` and
    /// `Text("yes")` read the same.
    pub fn as_text(&self) -> String {
        match self {
            Self::Text(text) | Self::Error(text) => text.clone(),
            Self::Structured(serde_json::Value::String(s)) => s.clone(),
            Self::Structured(value) => value.to_string(),
        }
    }
}

impl From<String> for AgentResult {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for AgentResult {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<serde_json::Value> for AgentResult {
    fn from(value: serde_json::Value) -> Self {
        Self::Structured(value)
    }
}

/// Accounting recorded alongside an execution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    /// Prompt tokens consumed
    pub input_tokens: Option<u64>,
    /// Completion tokens produced
    pub output_tokens: Option<u64>,
    /// Model that served the call
    pub model: Option<String>,
    /// Attempts beyond the first, as reported by the invoker
    pub retries: u32,
}

/// One execution of an orchestration definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationRun {
    /// Run identifier
    pub id: RunId,
    /// Source definition, `None` for ad-hoc runs
    pub definition_id: Option<DefinitionId>,
    /// Definition name at execution time
    pub name: String,
    /// Topology
    pub mode: OrchestrationMode,
    /// Number of agents in the definition
    pub agent_count: usize,
    /// Current status
    pub status: RunStatus,
    /// Creation time
    pub started_at: DateTime<Utc>,
    /// Time the run reached a terminal status
    pub completed_at: Option<DateTime<Utc>>,
    /// Wall-clock duration
    pub duration_ms: Option<u64>,
    /// Executions that ended in `Success`
    pub success_count: usize,
    /// Executions that ended in `Failed`
    pub failure_count: usize,
    /// Failure description
    pub error: Option<String>,
    /// Failure classification
    pub error_kind: Option<RunErrorKind>,
    /// Mean pairwise agreement (consensus mode)
    pub consensus_score: Option<f64>,
    /// Whether agreement met the threshold (consensus mode)
    pub has_consensus: Option<bool>,
    /// Final value of a chain, or the lone result of a single-agent run
    pub output: Option<AgentResult>,
    /// Caller that started the run
    pub triggered_by: Option<String>,
    /// Free-form caller labels
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl OrchestrationRun {
    /// Whether the run has reached a terminal status
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

/// One agent's participation in a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentExecution {
    /// Execution identifier
    pub id: ExecutionId,
    /// Owning run
    pub run_id: RunId,
    /// Agent identifier
    pub agent_key: String,
    /// Position of the agent in the definition
    pub step_index: usize,
    /// Current status
    pub status: ExecutionStatus,
    /// Dispatch time
    pub started_at: Option<DateTime<Utc>>,
    /// Time the execution reached a terminal status
    pub completed_at: Option<DateTime<Utc>>,
    /// Call duration
    pub duration_ms: Option<u64>,
    /// Successful result
    pub result: Option<AgentResult>,
    /// Failure description
    pub error: Option<String>,
    /// Failure classification
    pub error_kind: Option<InvocationErrorKind>,
    /// Accounting
    #[serde(default)]
    pub metadata: ExecutionMetadata,
}

/// Terminal outcome reported for an execution
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    /// Agent returned a usable result
    Success {
        /// The result
        result: AgentResult,
        /// Accounting
        metadata: ExecutionMetadata,
    },
    /// Agent call failed
    Failed {
        /// The failure
        error: InvocationError,
        /// Accounting
        metadata: ExecutionMetadata,
    },
}

impl ExecutionOutcome {
    /// Failed outcome with empty metadata
    pub fn failed(error: InvocationError) -> Self {
        Self::Failed {
            error,
            metadata: ExecutionMetadata::default(),
        }
    }

    /// Status this outcome maps to
    pub fn status(&self) -> ExecutionStatus {
        match self {
            Self::Success { .. } => ExecutionStatus::Success,
            Self::Failed { .. } => ExecutionStatus::Failed,
        }
    }
}

/// Caller-supplied context for one execution request
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    /// Caller identity recorded on the run
    pub triggered_by: Option<String>,
    /// Free-form labels recorded on the run
    pub labels: BTreeMap<String, String>,
    /// Overrides the configured per-call timeout
    pub call_timeout: Option<Duration>,
    /// Overrides the configured run timeout
    pub run_timeout: Option<Duration>,
}

impl RunContext {
    /// Empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Record who triggered the run
    pub fn triggered_by(mut self, caller: impl Into<String>) -> Self {
        self.triggered_by = Some(caller.into());
        self
    }

    /// Add a label
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Override the per-call timeout
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Override the run timeout
    pub fn run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = Some(timeout);
        self
    }
}

/// Final state of a run, computed by its topology executor
#[derive(Debug, Clone, PartialEq)]
pub struct RunCompletion {
    /// Terminal status
    pub status: RunStatus,
    /// Failure description
    pub error: Option<String>,
    /// Failure classification
    pub error_kind: Option<RunErrorKind>,
    /// Consensus score
    pub consensus_score: Option<f64>,
    /// Consensus decision
    pub has_consensus: Option<bool>,
    /// Final output
    pub output: Option<AgentResult>,
}

impl RunCompletion {
    /// Successful completion
    pub fn completed() -> Self {
        Self {
            status: RunStatus::Completed,
            error: None,
            error_kind: None,
            consensus_score: None,
            has_consensus: None,
            output: None,
        }
    }

    /// Failed completion
    pub fn failed(kind: RunErrorKind, error: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            error: Some(error.into()),
            error_kind: Some(kind),
            ..Self::completed()
        }
    }

    /// Attach a final output
    pub fn with_output(mut self, output: Option<AgentResult>) -> Self {
        self.output = output;
        self
    }

    /// Attach a consensus decision
    pub fn with_consensus(mut self, score: f64, reached: bool) -> Self {
        self.consensus_score = Some(score);
        self.has_consensus = Some(reached);
        self
    }
}
