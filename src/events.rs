//! Run progress events
//!
//! Every state transition recorded by the tracker is published as a
//! [`RunEvent`] with a per-run sequence id, so observers can resume from the
//! last event they saw.

use crate::run::{ExecutionStatus, RunStatus};
use crate::types::{ExecutionId, RunId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

/// Sequence ID for ordering events within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SeqId(u64);

impl SeqId {
    /// Create a new sequence ID
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the next sequence ID
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Get the underlying value
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SeqId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single progress event of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    /// Sequence ID for ordering
    pub seq_id: SeqId,
    /// Run the event belongs to
    pub run_id: RunId,
    /// Timestamp
    pub timestamp: DateTime<Utc>,
    /// What happened
    pub kind: RunEventKind,
}

/// Types of run events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEventKind {
    /// Run record created
    Created,
    /// First agent dispatched
    Started,
    /// An agent call was dispatched
    ExecutionStarted {
        /// Execution ID
        execution_id: ExecutionId,
        /// Agent identifier
        agent_key: String,
        /// Position in the definition
        step_index: usize,
    },
    /// An agent call reached a terminal status
    ExecutionFinished {
        /// Execution ID
        execution_id: ExecutionId,
        /// Agent identifier
        agent_key: String,
        /// Terminal status
        status: ExecutionStatus,
        /// Failure description
        error: Option<String>,
    },
    /// Run reached a terminal status
    Finished {
        /// Terminal status
        status: RunStatus,
        /// Failure description
        error: Option<String>,
    },
}

impl RunEventKind {
    /// Whether this event ends the run's event stream
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Finished { .. })
    }
}

/// Per-run publication point: broadcast for events, watch for status,
/// plus a replay log.
pub(crate) struct RunChannel {
    run_id: RunId,
    events: broadcast::Sender<RunEvent>,
    status: watch::Sender<RunStatus>,
    log: Mutex<EventLog>,
}

#[derive(Default)]
struct EventLog {
    next_seq: SeqId,
    events: Vec<RunEvent>,
}

impl RunChannel {
    pub(crate) fn new(run_id: RunId, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        let (status, _) = watch::channel(RunStatus::Pending);
        Self {
            run_id,
            events,
            status,
            log: Mutex::new(EventLog::default()),
        }
    }

    pub(crate) fn publish(&self, kind: RunEventKind) {
        let status = match &kind {
            RunEventKind::Created => Some(RunStatus::Pending),
            RunEventKind::Started => Some(RunStatus::Running),
            RunEventKind::Finished { status, .. } => Some(*status),
            _ => None,
        };

        let event = {
            let mut log = self.log.lock();
            let event = RunEvent {
                seq_id: log.next_seq,
                run_id: self.run_id,
                timestamp: Utc::now(),
                kind,
            };
            log.next_seq = log.next_seq.next();
            log.events.push(event.clone());
            // Sent under the lock so subscribers observe seq order
            let _ = self.events.send(event.clone());
            event
        };

        if let Some(status) = status {
            self.status.send_replace(status);
        }
        tracing::trace!(run_id = %event.run_id, seq = %event.seq_id, "Published run event");
    }

    pub(crate) fn sender(&self) -> broadcast::Sender<RunEvent> {
        self.events.clone()
    }

    pub(crate) fn watch_status(&self) -> watch::Receiver<RunStatus> {
        self.status.subscribe()
    }

    pub(crate) fn replay(&self, starting_after: Option<SeqId>) -> Vec<RunEvent> {
        let log = self.log.lock();
        match starting_after {
            Some(after) => log
                .events
                .iter()
                .filter(|e| e.seq_id > after)
                .cloned()
                .collect(),
            None => log.events.clone(),
        }
    }
}
