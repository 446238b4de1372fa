//! Workflow automation
//!
//! A workflow is a tree of steps (send, expect, assign, confirm, control,
//! delay, log, modbus) run against serial connections. Each run is an
//! execution instance owned by the [`ExecutionRegistry`], which supports
//! pause, resume, cancel and operator confirmations while the instance runs
//! on its own task.

pub mod confirm;
pub mod definition;
pub mod engine;
pub mod events;
pub mod execution;
pub mod recorder;
pub mod registry;

pub use confirm::{ConfirmationBroker, ConfirmationResponse};
pub use definition::{
    AssignStep, ConfirmStep, ControlKind, ControlStep, DelayStep, ExpectStep, LogStep, MatchKind,
    ModbusAction, ModbusStep, SendFormat, SendStep, Step, StepKind, ValidationError, WorkflowDefinition,
};
pub use engine::{EngineSettings, WorkflowEngine};
pub use events::{EventHub, EventSink, ExecutionEvent, Subscription};
pub use execution::{ExecutionSnapshot, ExecutionStatus, LogEntry, LogLevel, PauseReason};
pub use recorder::{ExecutionRecorder, JsonLinesRecorder};
pub use registry::{ExecutionRegistry, RegistrySettings, StartRequest};

use crate::core::protocol::ModbusError;
use crate::core::transport::{ConnectionHandle, TransportError};
use crate::core::variables::ExprError;
use thiserror::Error;

/// Errors returned by the workflow API
#[derive(Error, Debug)]
pub enum WorkflowError {
    /// Definition rejected before any I/O
    #[error("Invalid workflow: {0}")]
    Validation(#[from] ValidationError),

    /// Definition file could not be read or parsed
    #[error("Failed to load workflow: {0}")]
    Load(String),

    /// Unknown execution id
    #[error("Execution '{0}' not found")]
    NotFound(String),

    /// Operation not allowed in the current status
    #[error("Cannot {action} execution '{id}' while {status}")]
    InvalidState {
        /// Execution id
        id: String,
        /// Current status
        status: ExecutionStatus,
        /// Rejected operation
        action: &'static str,
    },

    /// Nothing is waiting for this confirmation (never registered, already
    /// answered, timed out, or cancelled)
    #[error("No pending confirmation for step '{step_id}' of execution '{execution_id}'")]
    NoPendingConfirmation {
        /// Execution id
        execution_id: String,
        /// Confirm step id
        step_id: String,
    },

    /// Recorder failure
    #[error("Recorder error: {0}")]
    Recorder(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a step failed; becomes the execution's error message
#[derive(Error, Debug)]
pub enum StepError {
    /// Expect did not see its pattern in time
    #[error("expected {kind} '{pattern}' within {timeout_ms} ms, got {received:?}")]
    ExpectationMismatch {
        /// Match kind
        kind: MatchKind,
        /// Pattern after substitution
        pattern: String,
        /// Wait budget
        timeout_ms: u64,
        /// Text collected before giving up
        received: String,
    },

    /// Nobody answered a Confirm step
    #[error("confirmation timed out after {0} ms")]
    ConfirmationTimeout(u64),

    /// Operator answered with confirmed = false
    #[error("operator rejected confirmation{}", .0.as_deref().map(|n| format!(" ({n})")).unwrap_or_default())]
    Rejected(Option<String>),

    /// Loop hit the iteration ceiling
    #[error("loop exceeded {0} iterations")]
    LoopCeiling(u32),

    /// No handle on the step and none on the execution
    #[error("no connection handle for this step")]
    NoHandle,

    /// Step data that only fails at run time (bad hex, out-of-range value)
    #[error("{0}")]
    InvalidData(String),

    /// Device I/O failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Modbus failure
    #[error("modbus error: {0}")]
    Modbus(#[from] ModbusError),

    /// Expression failure
    #[error("expression error: {0}")]
    Expression(#[from] ExprError),
}

/// A step failure tagged with the step that raised it
#[derive(Debug)]
pub struct StepFailure {
    /// Failing step id
    pub step_id: String,
    /// Cause
    pub error: StepError,
}

impl StepFailure {
    pub(crate) fn new(step_id: &str, error: impl Into<StepError>) -> Self {
        Self {
            step_id: step_id.to_string(),
            error: error.into(),
        }
    }

    /// Human-readable reason, always naming the step
    pub fn message(&self) -> String {
        format!("Step '{}' failed: {}", self.step_id, self.error)
    }
}

/// Handle used by a step: its own, else the execution default
pub(crate) fn resolve_handle(
    step: Option<ConnectionHandle>,
    default: Option<ConnectionHandle>,
) -> Result<ConnectionHandle, StepError> {
    step.or(default).ok_or(StepError::NoHandle)
}
