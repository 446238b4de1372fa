//! Execution instance state
//!
//! The engine task is the only writer of an instance's state; the registry
//! reads snapshots and performs the external transitions (pause, resume,
//! cancel). Every status change goes through [`ExecutionState::transition`],
//! so once an instance is terminal nothing can move it again.

use super::events::ExecutionEvent;
use crate::core::transport::ConnectionHandle;
use crate::core::variables::Value;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

/// Execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Created, task not started yet
    Pending,
    /// Executing steps
    Running,
    /// Waiting for resume or for an operator confirmation
    Paused,
    /// All steps succeeded
    Completed,
    /// A step failed
    Failed,
    /// Cancelled by a caller
    Cancelled,
}

impl ExecutionStatus {
    /// Completed, Failed or Cancelled
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        })
    }
}

/// Why a paused execution is not running
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum PauseReason {
    /// Pause() was called
    External,
    /// A Confirm step is waiting
    AwaitingConfirmation {
        /// Confirm step id
        step_id: String,
    },
}

/// Log entry level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Detail
    Debug,
    /// Progress
    #[default]
    Info,
    /// Recoverable problem
    Warning,
    /// Failure
    Error,
}

/// One entry of an execution's log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// When it happened
    pub timestamp: DateTime<Local>,
    /// Step that produced it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// Level
    pub level: LogLevel,
    /// Message
    pub message: String,
    /// Structured details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl LogEntry {
    /// Create new entry
    pub fn new(step_id: Option<&str>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now(),
            step_id: step_id.map(str::to_string),
            level,
            message: message.into(),
            data: None,
        }
    }

    /// Attach structured data
    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Point-in-time copy of an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    /// Execution id
    pub id: String,
    /// Workflow id
    pub workflow_id: String,
    /// Workflow name
    pub workflow_name: String,
    /// Status
    pub status: ExecutionStatus,
    /// Set while paused
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<PauseReason>,
    /// Step being executed (or the last one executed)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    /// Step that caused a failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    /// Failure or cancellation reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Variables as of the last finished step
    pub variables: BTreeMap<String, Value>,
    /// Leaf steps finished successfully
    pub steps_completed: usize,
    /// Log
    pub log: Vec<LogEntry>,
    /// Default connection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<ConnectionHandle>,
    /// Owning workstation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workstation_id: Option<String>,
    /// Operator who started it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operator_id: Option<String>,
    /// Creation time
    pub created_at: DateTime<Local>,
    /// Start time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Local>>,
    /// Terminal time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Local>>,
}

/// Mutable state behind a snapshot
pub(crate) struct ExecutionState {
    pub(crate) snapshot: ExecutionSnapshot,
    /// Monotonic terminal time for retention
    pub(crate) finished: Option<Instant>,
}

impl ExecutionState {
    pub(crate) fn new(snapshot: ExecutionSnapshot) -> Self {
        Self {
            snapshot,
            finished: None,
        }
    }

    pub(crate) fn status(&self) -> ExecutionStatus {
        self.snapshot.status
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.snapshot.status.is_terminal()
    }

    /// Move to `to` if the current status is one of `from`.
    ///
    /// Returns false (and changes nothing) otherwise.
    pub(crate) fn transition(&mut self, from: &[ExecutionStatus], to: ExecutionStatus) -> bool {
        let current = self.snapshot.status;
        if current.is_terminal() || !from.contains(&current) {
            return false;
        }
        self.snapshot.status = to;
        if to != ExecutionStatus::Paused {
            self.snapshot.pause_reason = None;
        }
        match to {
            ExecutionStatus::Running if self.snapshot.started_at.is_none() => {
                self.snapshot.started_at = Some(Local::now());
            }
            s if s.is_terminal() => {
                self.snapshot.completed_at = Some(Local::now());
                self.finished = Some(Instant::now());
            }
            _ => {}
        }
        true
    }

    /// Append a log entry unless the execution is already terminal
    pub(crate) fn push_log(&mut self, entry: LogEntry) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.snapshot.log.push(entry);
        true
    }

    /// Status event describing the current state
    pub(crate) fn status_event(&self, message: Option<String>) -> ExecutionEvent {
        ExecutionEvent::Status {
            execution_id: self.snapshot.id.clone(),
            workstation_id: self.snapshot.workstation_id.clone(),
            status: self.snapshot.status,
            current_step: self.snapshot.current_step.clone(),
            message,
        }
    }
}
