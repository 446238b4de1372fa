//! Execution registry
//!
//! Owns every execution instance by id. Starting an execution validates the
//! definition, seeds its variables and spawns the engine on its own task;
//! pause, resume, cancel and confirmations are routed here by id.
//!
//! Finished instances are retained for inspection and purged by age (TTL)
//! and by count (capacity); running instances are never evicted.

use super::confirm::{ConfirmationBroker, ConfirmationResponse};
use super::definition::WorkflowDefinition;
use super::engine::{EngineSettings, RunContext, WorkflowEngine};
use super::events::{EventHub, EventSink, ExecutionEvent, Subscription};
use super::execution::{ExecutionSnapshot, ExecutionState, ExecutionStatus, LogEntry, LogLevel, PauseReason};
use super::recorder::ExecutionRecorder;
use super::WorkflowError;
use crate::core::transport::{ConnectionHandle, Transport};
use crate::core::variables::{Value, VariableContext};
use chrono::Local;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Retention of finished executions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    /// Finished executions kept at most
    pub capacity: usize,
    /// Seconds a finished execution is kept
    pub ttl_secs: u64,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            capacity: 256,
            ttl_secs: 3600,
        }
    }
}

/// Per-start options
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    /// Overrides applied on top of the definition's variables
    pub variables: BTreeMap<String, Value>,
    /// Owning workstation, used to route events
    pub workstation_id: Option<String>,
    /// Operator who started the run
    pub operator_id: Option<String>,
    /// Connection used by steps that name none
    pub handle: Option<ConnectionHandle>,
}

impl StartRequest {
    /// Default connection
    #[must_use]
    pub fn handle(mut self, handle: ConnectionHandle) -> Self {
        self.handle = Some(handle);
        self
    }

    /// Override one variable
    #[must_use]
    pub fn variable(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.variables.insert(name.to_string(), value.into());
        self
    }

    /// Owning workstation
    #[must_use]
    pub fn workstation(mut self, workstation_id: &str) -> Self {
        self.workstation_id = Some(workstation_id.to_string());
        self
    }

    /// Operator
    #[must_use]
    pub fn operator(mut self, operator_id: &str) -> Self {
        self.operator_id = Some(operator_id.to_string());
        self
    }
}

struct Entry {
    state: Arc<Mutex<ExecutionState>>,
    cancel: CancellationToken,
    pause_tx: watch::Sender<bool>,
    /// Flips to true once the task has finished and the recorder ran
    settled: watch::Receiver<bool>,
}

/// Registry of execution instances
pub struct ExecutionRegistry {
    engine: Arc<WorkflowEngine>,
    events: Arc<EventHub>,
    broker: Arc<ConfirmationBroker>,
    settings: RegistrySettings,
    recorder: Option<Arc<dyn ExecutionRecorder>>,
    executions: RwLock<HashMap<String, Arc<Entry>>>,
}

impl ExecutionRegistry {
    /// Create a registry whose executions run against `transport`
    pub fn new(transport: Transport, engine: EngineSettings, settings: RegistrySettings) -> Self {
        let events = Arc::new(EventHub::default());
        let broker = Arc::new(ConfirmationBroker::new());
        let engine = WorkflowEngine::new(transport, engine, events.clone(), broker.clone());
        Self {
            engine: Arc::new(engine),
            events,
            broker,
            settings,
            recorder: None,
            executions: RwLock::new(HashMap::new()),
        }
    }

    /// Record finished executions through `recorder`
    #[must_use]
    pub fn with_recorder(mut self, recorder: Arc<dyn ExecutionRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Event hub for log, status and confirmation-request events
    pub fn events(&self) -> Arc<EventHub> {
        self.events.clone()
    }

    /// Events of one execution
    pub fn subscribe(&self, execution_id: &str) -> Subscription {
        self.events.subscribe_execution(execution_id)
    }

    /// Retention settings
    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    /// Validate `definition` and start it on a new task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start_execution(
        &self,
        definition: WorkflowDefinition,
        request: StartRequest,
    ) -> Result<String, WorkflowError> {
        definition.validate()?;
        self.purge_expired();

        let id = Uuid::new_v4().to_string();
        let vars = VariableContext::seeded(&definition.variables, &request.variables);
        let state = ExecutionState::new(ExecutionSnapshot {
            id: id.clone(),
            workflow_id: definition.id.clone(),
            workflow_name: definition.name.clone(),
            status: ExecutionStatus::Pending,
            pause_reason: None,
            current_step: None,
            failed_step: None,
            error: None,
            variables: vars.snapshot(),
            steps_completed: 0,
            log: Vec::new(),
            handle: request.handle,
            workstation_id: request.workstation_id.clone(),
            operator_id: request.operator_id.clone(),
            created_at: Local::now(),
            started_at: None,
            completed_at: None,
        });
        let state = Arc::new(Mutex::new(state));
        let cancel = CancellationToken::new();
        let (pause_tx, pause) = watch::channel(false);
        let (settled_tx, settled) = watch::channel(false);

        self.executions.write().insert(
            id.clone(),
            Arc::new(Entry {
                state: state.clone(),
                cancel: cancel.clone(),
                pause_tx,
                settled,
            }),
        );
        info!(
            "Starting execution {} of '{}' ({} steps)",
            id,
            definition.id,
            definition.step_count()
        );

        let run = RunContext {
            id: id.clone(),
            workstation_id: request.workstation_id,
            handle: request.handle,
            state: state.clone(),
            cancel,
            pause,
        };
        let engine = self.engine.clone();
        let recorder = self.recorder.clone();
        let definition = Arc::new(definition);
        tokio::spawn(async move {
            engine.run(definition, run, vars).await;

            let snapshot = state.lock().snapshot.clone();
            if let Some(recorder) = recorder.filter(|_| snapshot.status.is_terminal()) {
                let id = snapshot.id.clone();
                match tokio::task::spawn_blocking(move || recorder.record(&snapshot)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("Failed to record execution {}: {}", id, e),
                    Err(e) => warn!("Recorder task for execution {} failed: {}", id, e),
                }
            }
            settled_tx.send_replace(true);
        });
        Ok(id)
    }

    fn entry(&self, id: &str) -> Result<Arc<Entry>, WorkflowError> {
        self.executions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| WorkflowError::NotFound(id.to_string()))
    }

    /// Current snapshot of an execution
    pub fn get_execution(&self, id: &str) -> Result<ExecutionSnapshot, WorkflowError> {
        Ok(self.entry(id)?.state.lock().snapshot.clone())
    }

    /// Every retained execution, oldest first
    pub fn executions(&self) -> Vec<ExecutionSnapshot> {
        let entries: Vec<Arc<Entry>> = self.executions.read().values().cloned().collect();
        let mut snapshots: Vec<ExecutionSnapshot> = entries.iter().map(|e| e.state.lock().snapshot.clone()).collect();
        snapshots.sort_by_key(|s| s.created_at);
        snapshots
    }

    /// Pause a running execution before its next step
    pub fn pause(&self, id: &str) -> Result<(), WorkflowError> {
        let entry = self.entry(id)?;
        let mut state = entry.state.lock();
        let status = state.status();
        if status != ExecutionStatus::Running {
            return Err(WorkflowError::InvalidState {
                id: id.to_string(),
                status,
                action: "pause",
            });
        }
        self.push_log(&mut state, "Execution paused");
        state.transition(&[ExecutionStatus::Running], ExecutionStatus::Paused);
        state.snapshot.pause_reason = Some(PauseReason::External);
        entry.pause_tx.send_replace(true);
        self.events.publish(state.status_event(Some("Paused by request".into())));
        info!("Execution {} paused", id);
        Ok(())
    }

    /// Resume an externally paused execution.
    ///
    /// An execution waiting for a confirmation is resumed by the confirmation,
    /// not by this call.
    pub fn resume(&self, id: &str) -> Result<(), WorkflowError> {
        let entry = self.entry(id)?;
        let mut state = entry.state.lock();
        let status = state.status();
        if status != ExecutionStatus::Paused || state.snapshot.pause_reason != Some(PauseReason::External) {
            return Err(WorkflowError::InvalidState {
                id: id.to_string(),
                status,
                action: "resume",
            });
        }
        state.transition(&[ExecutionStatus::Paused], ExecutionStatus::Running);
        self.push_log(&mut state, "Execution resumed");
        entry.pause_tx.send_replace(false);
        self.events.publish(state.status_event(Some("Resumed by request".into())));
        info!("Execution {} resumed", id);
        Ok(())
    }

    /// Cancel a non-terminal execution, releasing any pending confirmation
    pub fn cancel(&self, id: &str) -> Result<(), WorkflowError> {
        let entry = self.entry(id)?;
        {
            let mut state = entry.state.lock();
            let status = state.status();
            if status.is_terminal() {
                return Err(WorkflowError::InvalidState {
                    id: id.to_string(),
                    status,
                    action: "cancel",
                });
            }
            self.push_log(&mut state, "Execution cancelled");
            state.transition(
                &[ExecutionStatus::Pending, ExecutionStatus::Running, ExecutionStatus::Paused],
                ExecutionStatus::Cancelled,
            );
            state.snapshot.error = Some("Cancelled by request".into());
            self.events.publish(state.status_event(Some("Cancelled by request".into())));
        }
        entry.cancel.cancel();
        let released = self.broker.cancel_execution(id);
        entry.pause_tx.send_replace(false);
        info!("Execution {} cancelled ({} pending confirmations released)", id, released);
        Ok(())
    }

    /// Deliver an operator response to a waiting Confirm step
    pub fn submit_confirmation(
        &self,
        id: &str,
        step_id: &str,
        response: ConfirmationResponse,
    ) -> Result<(), WorkflowError> {
        self.entry(id)?;
        self.broker.deliver(id, step_id, response)
    }

    /// Wait until the execution is terminal and recorded; returns its final snapshot
    pub async fn wait(&self, id: &str) -> Result<ExecutionSnapshot, WorkflowError> {
        let entry = self.entry(id)?;
        let mut settled = entry.settled.clone();
        // A dropped sender means the task is gone either way
        let _ = settled.wait_for(|done| *done).await;
        let snapshot = entry.state.lock().snapshot.clone();
        Ok(snapshot)
    }

    /// [`wait`](Self::wait) with an upper bound; `None` if it ran out
    pub async fn wait_timeout(&self, id: &str, timeout: Duration) -> Result<Option<ExecutionSnapshot>, WorkflowError> {
        match tokio::time::timeout(timeout, self.wait(id)).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Drop finished executions older than the TTL, then the oldest finished
    /// ones beyond capacity. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let ttl = Duration::from_secs(self.settings.ttl_secs);
        let now = Instant::now();
        let mut executions = self.executions.write();
        let before = executions.len();

        let mut finished: Vec<(String, Instant)> = executions
            .iter()
            .filter_map(|(id, entry)| entry.state.lock().finished.map(|at| (id.clone(), at)))
            .collect();
        finished.retain(|(id, at)| {
            let expired = now.duration_since(*at) >= ttl;
            if expired {
                executions.remove(id);
            }
            !expired
        });
        if finished.len() > self.settings.capacity {
            finished.sort_by_key(|(_, at)| *at);
            let excess = finished.len() - self.settings.capacity;
            for (id, _) in finished.drain(..excess) {
                executions.remove(&id);
            }
        }

        let removed = before - executions.len();
        if removed > 0 {
            debug!("Purged {} finished executions", removed);
        }
        removed
    }

    fn push_log(&self, state: &mut ExecutionState, message: &str) {
        let step_id = state.snapshot.current_step.clone();
        if state.push_log(LogEntry::new(step_id.as_deref(), LogLevel::Info, message)) {
            if let Some(entry) = state.snapshot.log.last() {
                self.events.publish(ExecutionEvent::Log {
                    execution_id: state.snapshot.id.clone(),
                    workstation_id: state.snapshot.workstation_id.clone(),
                    entry: entry.clone(),
                });
            }
        }
    }
}
