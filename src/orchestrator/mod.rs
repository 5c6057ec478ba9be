//! Orchestrator module - execution topologies for multi-agent runs
//!
//! # Topologies
//!
//! - **Parallel**: Independent agents run concurrently, each with its own input
//! - **Chain**: Agents run in order, each step fed from the previous result
//! - **Consensus**: The same question goes to every agent and agreement is scored
//!
//! # Example
//!
//! ```rust,ignore
//! use agent_conductor::orchestrator::{Coordinator, OrchestrationDefinition};
//!
//! let definition = OrchestrationDefinition::from_file("templates/review.yaml")?;
//! let coordinator = Coordinator::builder().invoker(invoker).build()?;
//! let run = coordinator.execute(definition, RunContext::new()).await?.wait().await?;
//! ```

pub mod chain;
pub mod consensus;
pub mod coordinator;
pub mod definition;
mod dispatch;
pub mod parallel;
pub mod pattern;
pub mod transform;

// Re-exports
pub use chain::ChainExecutor;
pub use consensus::ConsensusExecutor;
pub use coordinator::{Coordinator, CoordinatorBuilder, RunHandle};
pub use definition::{AgentInput, AgentReference, OrchestrationDefinition, OrchestrationMode};
pub use parallel::ParallelExecutor;
pub use pattern::{ExecutionContext, RunControl, StopReason, TopologyExecutor};
pub use transform::{InputTransform, TransformError};
