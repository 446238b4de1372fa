//! Live execution events
//!
//! The engine publishes through the [`EventSink`] trait; [`EventHub`] fans
//! events out over a tokio broadcast channel to any number of subscribers,
//! each optionally filtered by execution or workstation.

use super::execution::{ExecutionStatus, LogEntry};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;

/// Event published while an execution runs
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    /// A log entry was appended
    Log {
        /// Execution id
        execution_id: String,
        /// Owning workstation
        #[serde(skip_serializing_if = "Option::is_none")]
        workstation_id: Option<String>,
        /// The entry
        entry: LogEntry,
    },
    /// Status changed
    Status {
        /// Execution id
        execution_id: String,
        /// Owning workstation
        #[serde(skip_serializing_if = "Option::is_none")]
        workstation_id: Option<String>,
        /// New status
        status: ExecutionStatus,
        /// Current step
        #[serde(skip_serializing_if = "Option::is_none")]
        current_step: Option<String>,
        /// Reason or summary
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// A Confirm step is waiting for an operator
    ConfirmationRequest {
        /// Execution id
        execution_id: String,
        /// Owning workstation
        #[serde(skip_serializing_if = "Option::is_none")]
        workstation_id: Option<String>,
        /// Confirm step id
        step_id: String,
        /// Confirm step name
        step_name: String,
        /// Resolved message
        message: String,
        /// Selectable options
        options: Vec<String>,
        /// Wait budget
        timeout_ms: u64,
    },
}

impl ExecutionEvent {
    /// Execution the event belongs to
    pub fn execution_id(&self) -> &str {
        match self {
            Self::Log { execution_id, .. }
            | Self::Status { execution_id, .. }
            | Self::ConfirmationRequest { execution_id, .. } => execution_id,
        }
    }

    /// Workstation the execution belongs to
    pub fn workstation_id(&self) -> Option<&str> {
        match self {
            Self::Log { workstation_id, .. }
            | Self::Status { workstation_id, .. }
            | Self::ConfirmationRequest { workstation_id, .. } => workstation_id.as_deref(),
        }
    }
}

/// Destination for execution events
#[cfg_attr(test, mockall::automock)]
pub trait EventSink: Send + Sync {
    /// Publish one event; must not block
    fn publish(&self, event: ExecutionEvent);
}

#[derive(Debug, Clone)]
enum Filter {
    All,
    Execution(String),
    Workstation(String),
}

/// Broadcast fan-out of execution events
pub struct EventHub {
    tx: broadcast::Sender<ExecutionEvent>,
}

impl EventHub {
    /// Create a hub; slow subscribers lose events beyond `capacity`
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Every event
    pub fn subscribe(&self) -> Subscription {
        self.subscription(Filter::All)
    }

    /// Events of one execution
    pub fn subscribe_execution(&self, execution_id: &str) -> Subscription {
        self.subscription(Filter::Execution(execution_id.to_string()))
    }

    /// Events of every execution owned by a workstation
    pub fn subscribe_workstation(&self, workstation_id: &str) -> Subscription {
        self.subscription(Filter::Workstation(workstation_id.to_string()))
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    fn subscription(&self, filter: Filter) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            filter,
        }
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventSink for EventHub {
    fn publish(&self, event: ExecutionEvent) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}

/// Filtered event stream
pub struct Subscription {
    rx: broadcast::Receiver<ExecutionEvent>,
    filter: Filter,
}

impl Subscription {
    fn accepts(&self, event: &ExecutionEvent) -> bool {
        match &self.filter {
            Filter::All => true,
            Filter::Execution(id) => event.execution_id() == id,
            Filter::Workstation(ws) => event.workstation_id() == Some(ws.as_str()),
        }
    }

    /// Next matching event; `None` once the hub is gone
    pub async fn recv(&mut self) -> Option<ExecutionEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.accepts(&event) => return Some(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event subscriber lagged, {} events dropped", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching event if one is already queued
    pub fn try_recv(&mut self) -> Option<ExecutionEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.accepts(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::workflow::execution::LogLevel;

    fn log(execution_id: &str, workstation_id: Option<&str>) -> ExecutionEvent {
        ExecutionEvent::Log {
            execution_id: execution_id.into(),
            workstation_id: workstation_id.map(str::to_string),
            entry: LogEntry::new(None, LogLevel::Info, "hello"),
        }
    }

    #[tokio::test]
    async fn test_execution_filter() {
        let hub = EventHub::new(16);
        let mut sub = hub.subscribe_execution("b");
        hub.publish(log("a", None));
        hub.publish(log("b", None));
        assert_eq!(sub.recv().await.unwrap().execution_id(), "b");
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_workstation_filter() {
        let hub = EventHub::new(16);
        let mut sub = hub.subscribe_workstation("WS-03");
        hub.publish(log("a", Some("WS-01")));
        hub.publish(log("b", Some("WS-03")));
        hub.publish(log("c", None));
        assert_eq!(sub.recv().await.unwrap().execution_id(), "b");
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn test_publish_without_subscribers() {
        let hub = EventHub::default();
        hub.publish(log("a", None));
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn test_event_json_shape() {
        let event = ExecutionEvent::Status {
            execution_id: "e1".into(),
            workstation_id: None,
            status: ExecutionStatus::Paused,
            current_step: Some("c1".into()),
            message: None,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            serde_json::json!({"event": "status", "execution_id": "e1", "status": "paused", "current_step": "c1"})
        );
    }
}
