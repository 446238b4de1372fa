//! Operator confirmations
//!
//! A waiting Confirm step registers a one-shot channel under its
//! `(execution id, step id)` key. The first delivery for a key wins and
//! removes it; later deliveries, and deliveries after a timeout or cancel,
//! are rejected.

use super::WorkflowError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::oneshot;
use tracing::debug;

/// Operator answer to a Confirm step
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationResponse {
    /// Whether the operator confirmed
    pub confirmed: bool,
    /// Chosen option label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_option: Option<String>,
    /// Free-form input
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_input: Option<String>,
    /// Notes for the record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_notes: Option<String>,
}

impl ConfirmationResponse {
    /// Confirmed with an option
    pub fn confirm(option: &str) -> Self {
        Self {
            confirmed: true,
            selected_option: Some(option.to_string()),
            ..Self::default()
        }
    }

    /// Rejected
    pub fn reject() -> Self {
        Self::default()
    }
}

type Key = (String, String);

/// Routes confirmations to the step waiting for them
#[derive(Default)]
pub struct ConfirmationBroker {
    waiters: Mutex<HashMap<Key, oneshot::Sender<ConfirmationResponse>>>,
}

impl ConfirmationBroker {
    /// Create an empty broker
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter; replaces any stale registration for the same key
    pub fn register(&self, execution_id: &str, step_id: &str) -> oneshot::Receiver<ConfirmationResponse> {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .insert((execution_id.to_string(), step_id.to_string()), tx);
        rx
    }

    /// Hand a response to the waiting step
    pub fn deliver(
        &self,
        execution_id: &str,
        step_id: &str,
        response: ConfirmationResponse,
    ) -> Result<(), WorkflowError> {
        let key = (execution_id.to_string(), step_id.to_string());
        let delivered = self
            .waiters
            .lock()
            .remove(&key)
            .is_some_and(|tx| tx.send(response).is_ok());
        if delivered {
            debug!("Confirmation delivered to {}/{}", execution_id, step_id);
            Ok(())
        } else {
            Err(WorkflowError::NoPendingConfirmation {
                execution_id: execution_id.to_string(),
                step_id: step_id.to_string(),
            })
        }
    }

    /// Drop one registration (timeout)
    pub fn withdraw(&self, execution_id: &str, step_id: &str) {
        self.waiters
            .lock()
            .remove(&(execution_id.to_string(), step_id.to_string()));
    }

    /// Drop every registration of an execution (cancel)
    pub fn cancel_execution(&self, execution_id: &str) -> usize {
        let mut waiters = self.waiters.lock();
        let before = waiters.len();
        waiters.retain(|(exec, _), _| exec != execution_id);
        before - waiters.len()
    }

    /// Whether a step is waiting
    pub fn is_pending(&self, execution_id: &str, step_id: &str) -> bool {
        self.waiters
            .lock()
            .contains_key(&(execution_id.to_string(), step_id.to_string()))
    }
}
