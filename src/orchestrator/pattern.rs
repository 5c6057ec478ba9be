//! Topology executor trait and the per-run execution context

use crate::error::{Error, InvocationError, Result};
use crate::invoker::AgentInvoker;
use crate::orchestrator::definition::{OrchestrationDefinition, OrchestrationMode};
use crate::run::RunCompletion;
use crate::tracker::ExecutionTracker;
use crate::types::RunId;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Why a run was stopped before its executor finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The caller cancelled the run
    Cancelled,
    /// The run-level timeout expired
    TimedOut(Duration),
}

impl StopReason {
    /// Failure recorded on executions interrupted for this reason
    pub fn invocation_error(&self) -> InvocationError {
        match self {
            Self::Cancelled => InvocationError::cancelled("run cancelled"),
            Self::TimedOut(limit) => {
                InvocationError::timeout(format!("run exceeded {}ms", limit.as_millis()))
            }
        }
    }

    /// Run-level error for this reason
    pub fn run_error(&self) -> Error {
        match self {
            Self::Cancelled => Error::Cancelled,
            Self::TimedOut(limit) => Error::RunTimeout(*limit),
        }
    }
}

/// Stop signal shared by a run, its handle and its executor.
///
/// The first reason recorded wins; later stops are ignored. Once sealed the
/// control refuses new stops, so a request that arrives after the executor
/// finished cannot rewrite the run.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    token: CancellationToken,
    state: Arc<Mutex<StopState>>,
}

#[derive(Debug, Default)]
struct StopState {
    reason: Option<StopReason>,
    sealed: bool,
}

impl RunControl {
    /// Create a fresh control
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal the run to stop. Returns `false` if it was already stopped or
    /// has finished.
    pub fn stop(&self, reason: StopReason) -> bool {
        {
            let mut state = self.state.lock();
            if state.sealed || state.reason.is_some() {
                return false;
            }
            state.reason = Some(reason);
        }
        self.token.cancel();
        true
    }

    /// Refuse further stops and return the reason recorded before sealing
    pub fn seal(&self) -> Option<StopReason> {
        let mut state = self.state.lock();
        state.sealed = true;
        state.reason
    }

    /// Whether the control was sealed
    pub fn is_sealed(&self) -> bool {
        self.state.lock().sealed
    }

    /// Reason the run was stopped, if any
    pub fn stop_reason(&self) -> Option<StopReason> {
        self.state.lock().reason
    }

    /// Whether a stop was requested
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Token fired when the run stops
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Failure to record for an execution interrupted by the stop
    pub fn interruption(&self) -> InvocationError {
        self.stop_reason()
            .unwrap_or(StopReason::Cancelled)
            .invocation_error()
    }
}

/// Everything an executor needs to drive one run
#[derive(Clone)]
pub struct ExecutionContext {
    /// Run being executed
    pub run_id: RunId,
    /// Definition snapshot taken when the run started
    pub definition: Arc<OrchestrationDefinition>,
    /// Lifecycle record-keeper
    pub tracker: Arc<ExecutionTracker>,
    /// Agent call capability
    pub invoker: Arc<dyn AgentInvoker>,
    /// Stop signal
    pub control: RunControl,
    /// Per-call time budget
    pub call_timeout: Duration,
}

/// A run topology.
///
/// Executors report every execution to the tracker and compute the run's
/// final state; the coordinator records it. When the run is stopped an
/// executor returns as soon as its in-flight calls have drained.
#[async_trait]
pub trait TopologyExecutor: Send + Sync {
    /// Drive the run to its final state
    async fn execute(&self, ctx: &ExecutionContext) -> Result<RunCompletion>;

    /// Topology handled by this executor
    fn mode(&self) -> OrchestrationMode;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InvocationErrorKind;

    #[test]
    fn test_first_stop_reason_wins() {
        let control = RunControl::new();
        assert!(!control.is_stopped());

        assert!(control.stop(StopReason::TimedOut(Duration::from_millis(20))));
        assert!(!control.stop(StopReason::Cancelled));

        assert!(control.is_stopped());
        assert_eq!(
            control.stop_reason(),
            Some(StopReason::TimedOut(Duration::from_millis(20)))
        );
        assert_eq!(control.interruption().kind, InvocationErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_clones_share_the_signal() {
        let control = RunControl::new();
        let observer = control.clone();

        let waiter = tokio::spawn(async move {
            observer.token().cancelled().await;
            observer.stop_reason()
        });
        control.stop(StopReason::Cancelled);

        assert_eq!(waiter.await.unwrap(), Some(StopReason::Cancelled));
    }

    #[test]
    fn test_sealed_control_refuses_late_stop() {
        let control = RunControl::new();
        assert_eq!(control.seal(), None);

        assert!(!control.stop(StopReason::Cancelled));
        assert!(!control.is_stopped());
        assert!(control.is_sealed());
        assert_eq!(control.stop_reason(), None);
    }

    #[test]
    fn test_seal_keeps_earlier_reason() {
        let control = RunControl::new();
        control.stop(StopReason::Cancelled);
        assert_eq!(control.seal(), Some(StopReason::Cancelled));
    }
}
