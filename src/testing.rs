//! Scripted agent invoker for tests and demos
//!
//! Each agent key gets a canned behaviour; unscripted agents echo their
//! input. Every call is recorded along with the peak number of calls that
//! were in flight at once.

use crate::error::InvocationError;
use crate::invoker::{AgentInvoker, AgentReply, InvocationRequest};
use crate::run::AgentResult;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
enum Action {
    Reply(AgentReply),
    Fail(InvocationError),
    Echo,
    Hang,
}

#[derive(Debug, Clone)]
struct Script {
    delay: Option<Duration>,
    action: Action,
}

impl Script {
    fn new(action: Action) -> Self {
        Self { delay: None, action }
    }
}

/// One call observed by a [`ScriptedInvoker`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    /// Agent identifier
    pub agent_key: String,
    /// Invocation mode tag
    pub invocation: String,
    /// Input payload
    pub input: String,
}

/// Agent invoker driven by per-agent scripts
#[derive(Debug, Default)]
pub struct ScriptedInvoker {
    scripts: HashMap<String, Script>,
    calls: Mutex<Vec<RecordedCall>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

struct InFlight<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedInvoker {
    /// Invoker where every agent echoes its input
    pub fn new() -> Self {
        Self::default()
    }

    fn script(mut self, agent_key: impl Into<String>, action: Action) -> Self {
        let entry = self
            .scripts
            .entry(agent_key.into())
            .or_insert_with(|| Script::new(Action::Echo));
        entry.action = action;
        self
    }

    /// Answer with a fixed result
    pub fn reply(self, agent_key: impl Into<String>, result: impl Into<AgentResult>) -> Self {
        self.script(agent_key, Action::Reply(AgentReply::new(result)))
    }

    /// Answer with a full reply, including accounting
    pub fn reply_with(self, agent_key: impl Into<String>, reply: AgentReply) -> Self {
        self.script(agent_key, Action::Reply(reply))
    }

    /// Answer with a structured result
    pub fn reply_json(self, agent_key: impl Into<String>, value: serde_json::Value) -> Self {
        self.reply(agent_key, AgentResult::structured(value))
    }

    /// Fail the call
    pub fn fail(self, agent_key: impl Into<String>, message: impl Into<String>) -> Self {
        self.script(agent_key, Action::Fail(InvocationError::failed(message)))
    }

    /// Answer with an agent-side error payload
    pub fn agent_error(self, agent_key: impl Into<String>, message: impl Into<String>) -> Self {
        self.reply(agent_key, AgentResult::Error(message.into()))
    }

    /// Echo the input back
    pub fn echo(self, agent_key: impl Into<String>) -> Self {
        self.script(agent_key, Action::Echo)
    }

    /// Never answer; returns only once cancelled
    pub fn hang(self, agent_key: impl Into<String>) -> Self {
        self.script(agent_key, Action::Hang)
    }

    /// Wait before acting
    pub fn delay(mut self, agent_key: impl Into<String>, delay: Duration) -> Self {
        self.scripts
            .entry(agent_key.into())
            .or_insert_with(|| Script::new(Action::Echo))
            .delay = Some(delay);
        self
    }

    /// Calls received so far, in arrival order
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Number of calls received
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Inputs received by one agent
    pub fn inputs_for(&self, agent_key: &str) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.agent_key == agent_key)
            .map(|c| c.input.clone())
            .collect()
    }

    /// Largest number of calls that were outstanding at the same time
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentInvoker for ScriptedInvoker {
    async fn invoke(
        &self,
        request: InvocationRequest,
        cancel: CancellationToken,
    ) -> Result<AgentReply, InvocationError> {
        self.calls.lock().push(RecordedCall {
            agent_key: request.agent_key.clone(),
            invocation: request.invocation.clone(),
            input: request.input.clone(),
        });
        let _guard = InFlight::enter(&self.in_flight, &self.peak);

        let script = self
            .scripts
            .get(&request.agent_key)
            .cloned()
            .unwrap_or_else(|| Script::new(Action::Echo));

        if let Some(delay) = script.delay {
            tokio::select! {
                _ = cancel.cancelled() => return Err(InvocationError::cancelled("cancelled during delay")),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        match script.action {
            Action::Reply(reply) => Ok(reply),
            Action::Fail(error) => Err(error),
            Action::Echo => Ok(AgentReply::new(request.input)),
            Action::Hang => {
                cancel.cancelled().await;
                Err(InvocationError::cancelled("cancelled while hanging"))
            }
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExecutionId, RunId};

    fn request(agent_key: &str, input: &str) -> InvocationRequest {
        InvocationRequest {
            run_id: RunId::new(),
            execution_id: ExecutionId::new(),
            agent_key: agent_key.to_string(),
            invocation: "default".to_string(),
            input: input.to_string(),
            timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_scripts_and_echo() {
        let invoker = ScriptedInvoker::new()
            .reply("yes", "approve")
            .fail("broken", "boom");

        let reply = invoker.invoke(request("yes", "q"), CancellationToken::new()).await.unwrap();
        assert_eq!(reply.result, AgentResult::text("approve"));

        let echoed = invoker.invoke(request("other", "ping"), CancellationToken::new()).await.unwrap();
        assert_eq!(echoed.result, AgentResult::text("ping"));

        let err = invoker.invoke(request("broken", "q"), CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.message, "boom");

        assert_eq!(invoker.call_count(), 3);
        assert_eq!(invoker.inputs_for("other"), vec!["ping".to_string()]);
    }

    #[tokio::test]
    async fn test_hang_returns_on_cancel() {
        let invoker = ScriptedInvoker::new().hang("slow");
        let token = CancellationToken::new();
        token.cancel();

        let err = invoker.invoke(request("slow", "q"), token).await.unwrap_err();
        assert_eq!(err.kind, crate::error::InvocationErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_delay_keeps_action() {
        let invoker = ScriptedInvoker::new()
            .reply("a", "late")
            .delay("a", Duration::from_millis(5));

        let reply = invoker.invoke(request("a", "q"), CancellationToken::new()).await.unwrap();
        assert_eq!(reply.result.as_text(), "late");
        assert_eq!(invoker.peak_concurrency(), 1);
    }
}
