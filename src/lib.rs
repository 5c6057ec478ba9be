//! # Agent Conductor
//!
//! Orchestration engine that coordinates calls to independent AI agents in
//! three topologies and keeps a durable record of every run.
//!
//! ## Features
//!
//! - **Parallel fan-out**: Independent calls, partial failures tolerated
//! - **Chains**: Sequential pipelines with input transforms between steps
//! - **Consensus**: One question to many agents, with a scored agreement
//! - **Tracked lifecycles**: Idempotent run and execution records with replayable events
//! - **Cancellation and timeouts**: Per-call and per-run budgets with graceful drain
//!
//! Calling an agent is left to an [`AgentInvoker`] implementation and
//! persistence to a [`RunRepository`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use agent_conductor::prelude::*;
//! use agent_conductor::testing::ScriptedInvoker;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let invoker = ScriptedInvoker::new()
//!         .reply("analyst", "ship it")
//!         .reply("reviewer", "ship it");
//!
//!     let coordinator = Coordinator::builder()
//!         .invoker(Arc::new(invoker))
//!         .build()?;
//!
//!     let definition = OrchestrationDefinition::consensus(
//!         "release-check",
//!         "Should we release today?",
//!         0.66,
//!         vec![AgentReference::new("analyst"), AgentReference::new("reviewer")],
//!     );
//!
//!     let run = coordinator
//!         .execute(definition, RunContext::new())
//!         .await?
//!         .wait()
//!         .await?;
//!     println!("consensus: {:?}", run.has_consensus);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod events;
pub mod invoker;
pub mod orchestrator;
pub mod run;
pub mod scoring;
pub mod storage;
pub mod testing;
pub mod tracing_ext;
pub mod tracker;
pub mod types;

// Re-exports for convenience
pub use config::EngineConfig;
pub use error::{Error, InvocationError, InvocationErrorKind, Result, RunErrorKind};
pub use events::{RunEvent, RunEventKind, SeqId};
pub use invoker::{AgentInvoker, AgentReply, InvocationRequest};
pub use orchestrator::{
    AgentReference, Coordinator, CoordinatorBuilder, OrchestrationDefinition, OrchestrationMode,
    RunHandle, TopologyExecutor,
};
pub use run::{
    AgentExecution, AgentResult, ExecutionMetadata, ExecutionStatus, OrchestrationRun,
    RunCompletion, RunContext, RunStatus,
};
pub use scoring::{ConsensusDecision, ConsensusScorer, ScoringPolicy, Similarity};
#[cfg(feature = "storage")]
pub use storage::SqliteRunStore;
pub use storage::{DefinitionSource, InMemoryDefinitionStore, InMemoryRunStore, RunRepository};
pub use tracing_ext::{init_tracing, LogFormat, LoggingConfig};
pub use tracker::ExecutionTracker;
pub use types::{DefinitionId, ExecutionId, RunId};

/// Prelude module for common imports
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::invoker::{AgentInvoker, AgentReply, InvocationRequest};
    pub use crate::orchestrator::{AgentReference, Coordinator, OrchestrationDefinition};
    pub use crate::run::{AgentResult, OrchestrationRun, RunContext, RunStatus};
    pub use crate::EngineConfig;
}
