//! Workflow engine
//!
//! Runs one execution instance: walks the step tree in definition order,
//! dispatching each [`StepKind`] to its handler. The engine never returns
//! errors to the caller; every failure ends the instance as `Failed` with
//! the failing step id and reason recorded on the snapshot.

use super::confirm::{ConfirmationBroker, ConfirmationResponse};
use super::definition::{
    ConfirmStep, ControlKind, ControlStep, ExpectStep, MatchKind, ModbusAction, ModbusStep, SendFormat,
    SendStep, Step, StepKind, WorkflowDefinition,
};
use super::events::{EventSink, ExecutionEvent};
use super::execution::{ExecutionState, ExecutionStatus, LogEntry, LogLevel, PauseReason};
use super::{resolve_handle, StepError, StepFailure};
use crate::core::protocol::{at, FunctionCode, ModbusClient};
use crate::core::transport::{ConnectionHandle, Transport};
use crate::core::variables::{parse_expression, Value, VariableContext};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Variable holding the text collected by the last Expect step
pub const LAST_RESPONSE: &str = "last_response";

/// Engine tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Maximum iterations of one Loop before it fails
    pub loop_ceiling: u32,
    /// Expect wait when the step sets none, in milliseconds
    pub expect_timeout_ms: u64,
    /// Confirm wait when the step sets none, in milliseconds
    pub confirm_timeout_ms: u64,
    /// Largest single read while collecting a response, in bytes
    pub at_max_response: usize,
    /// Per-exchange Modbus timeout, in milliseconds
    pub modbus_timeout_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            loop_ceiling: 1000,
            expect_timeout_ms: 5000,
            confirm_timeout_ms: 300_000,
            at_max_response: 4096,
            modbus_timeout_ms: 1000,
        }
    }
}

/// Everything a running execution shares with the registry
pub(crate) struct RunContext {
    pub(crate) id: String,
    pub(crate) workstation_id: Option<String>,
    pub(crate) handle: Option<ConnectionHandle>,
    pub(crate) state: Arc<Mutex<ExecutionState>>,
    pub(crate) cancel: CancellationToken,
    /// `true` while externally paused
    pub(crate) pause: watch::Receiver<bool>,
}

/// What the enclosing step list should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Next,
    Break,
    Continue,
}

/// Result of one leaf step, logged on success
struct Outcome {
    level: LogLevel,
    message: String,
    data: Option<serde_json::Value>,
}

impl Outcome {
    fn info(message: String) -> Self {
        Self {
            level: LogLevel::Info,
            message,
            data: None,
        }
    }

    fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Step interpreter shared by every execution
pub struct WorkflowEngine {
    transport: Transport,
    modbus: ModbusClient,
    settings: EngineSettings,
    sink: Arc<dyn EventSink>,
    broker: Arc<ConfirmationBroker>,
}

impl WorkflowEngine {
    /// Create an engine publishing to `sink` and taking confirmations from `broker`
    pub fn new(
        transport: Transport,
        settings: EngineSettings,
        sink: Arc<dyn EventSink>,
        broker: Arc<ConfirmationBroker>,
    ) -> Self {
        let modbus = ModbusClient::new(transport.clone(), Duration::from_millis(settings.modbus_timeout_ms));
        Self {
            transport,
            modbus,
            settings,
            sink,
            broker,
        }
    }

    /// Active settings
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Run an execution to a terminal state (or until cancelled)
    pub(crate) async fn run(&self, definition: Arc<WorkflowDefinition>, run: RunContext, mut vars: VariableContext) {
        {
            let mut state = run.state.lock();
            if !state.transition(&[ExecutionStatus::Pending], ExecutionStatus::Running) {
                debug!("Execution {} not started: {}", run.id, state.status());
                return;
            }
            self.sink.publish(state.status_event(None));
        }
        info!("Execution {} of '{}' started", run.id, definition.id);
        self.log(
            &run,
            None,
            LogLevel::Info,
            format!("Workflow '{}' started", definition.name),
            None,
        );

        let outcome = tokio::select! {
            biased;
            () = run.cancel.cancelled() => None,
            result = self.exec_steps(&definition.steps, &run, &mut vars) => Some(result),
        };

        match outcome {
            None => debug!("Execution {} cancelled", run.id),
            Some(Ok(_)) => {
                // A pause that arrived during the last step still holds completion
                tokio::select! {
                    biased;
                    () = run.cancel.cancelled() => return,
                    () = wait_unpaused(&run) => {}
                }
                self.finish_completed(&run, &vars);
            }
            Some(Err(failure)) => self.finish_failed(&run, &vars, &failure),
        }
    }

    fn finish_completed(&self, run: &RunContext, vars: &VariableContext) {
        let mut state = run.state.lock();
        let summary = format!("Workflow completed ({} steps)", state.snapshot.steps_completed);
        if state.push_log(LogEntry::new(None, LogLevel::Info, summary.clone())) {
            self.publish_log(run, &state);
        }
        state.snapshot.variables = vars.snapshot();
        if state.transition(&[ExecutionStatus::Running], ExecutionStatus::Completed) {
            info!("Execution {} completed", run.id);
            self.sink.publish(state.status_event(Some(summary)));
        }
    }

    fn finish_failed(&self, run: &RunContext, vars: &VariableContext, failure: &StepFailure) {
        let message = failure.message();
        let mut state = run.state.lock();
        if state.push_log(LogEntry::new(Some(&failure.step_id), LogLevel::Error, message.clone())) {
            self.publish_log(run, &state);
        }
        state.snapshot.variables = vars.snapshot();
        if state.transition(
            &[ExecutionStatus::Running, ExecutionStatus::Paused],
            ExecutionStatus::Failed,
        ) {
            error!("Execution {} failed: {}", run.id, message);
            state.snapshot.failed_step = Some(failure.step_id.clone());
            state.snapshot.error = Some(message.clone());
            self.sink.publish(state.status_event(Some(message)));
        }
    }

    /// Append a log entry and broadcast it; dropped once the execution is terminal
    fn log(
        &self,
        run: &RunContext,
        step_id: Option<&str>,
        level: LogLevel,
        message: String,
        data: Option<serde_json::Value>,
    ) {
        match level {
            LogLevel::Debug => debug!("[{}] {}", run.id, message),
            LogLevel::Info => info!("[{}] {}", run.id, message),
            LogLevel::Warning => warn!("[{}] {}", run.id, message),
            LogLevel::Error => error!("[{}] {}", run.id, message),
        }
        let mut entry = LogEntry::new(step_id, level, message);
        entry.data = data;

        // Publish under the lock so no event can follow a terminal status
        let mut state = run.state.lock();
        if state.push_log(entry) {
            self.publish_log(run, &state);
        }
    }

    fn publish_log(&self, run: &RunContext, state: &ExecutionState) {
        if let Some(entry) = state.snapshot.log.last() {
            self.sink.publish(ExecutionEvent::Log {
                execution_id: run.id.clone(),
                workstation_id: run.workstation_id.clone(),
                entry: entry.clone(),
            });
        }
    }

    fn exec_steps<'a>(
        &'a self,
        steps: &'a [Step],
        run: &'a RunContext,
        vars: &'a mut VariableContext,
    ) -> BoxFuture<'a, Result<Flow, StepFailure>> {
        async move {
            for step in steps {
                match self.exec_step(step, run, vars).await? {
                    Flow::Next => {}
                    flow => return Ok(flow),
                }
            }
            Ok(Flow::Next)
        }
        .boxed()
    }

    async fn exec_step(
        &self,
        step: &Step,
        run: &RunContext,
        vars: &mut VariableContext,
    ) -> Result<Flow, StepFailure> {
        wait_unpaused(run).await;
        run.state.lock().snapshot.current_step = Some(step.id.clone());
        debug!("[{}] step '{}' ({})", run.id, step.id, step.kind.name());

        if let StepKind::Control(control) = &step.kind {
            let flow = self.exec_control(step, control, run, vars).await?;
            run.state.lock().snapshot.variables = vars.snapshot();
            return Ok(flow);
        }

        let retryable = matches!(step.kind, StepKind::Send(_) | StepKind::Expect(_) | StepKind::Modbus(_));
        let mut attempt = 0;
        let result = loop {
            match self.exec_leaf(step, run, vars).await {
                Err(e) if retryable && attempt < step.retry_count => {
                    attempt += 1;
                    self.log(
                        run,
                        Some(&step.id),
                        LogLevel::Warning,
                        format!("{e}; retry {attempt}/{}", step.retry_count),
                        None,
                    );
                }
                result => break result,
            }
        };

        match result {
            Ok(outcome) => {
                self.log(run, Some(&step.id), outcome.level, outcome.message, outcome.data);
                self.step_finished(run, vars);
                Ok(Flow::Next)
            }
            Err(e) => match (&step.kind, &e) {
                (StepKind::Expect(expect), StepError::ExpectationMismatch { pattern, received, .. })
                    if !expect.on_timeout.is_empty() =>
                {
                    self.log(
                        run,
                        Some(&step.id),
                        LogLevel::Warning,
                        format!("'{pattern}' not seen, running timeout branch"),
                        Some(json!({ "received": received })),
                    );
                    self.step_finished(run, vars);
                    self.exec_steps(&expect.on_timeout, run, vars).await
                }
                _ => Err(StepFailure::new(&step.id, e)),
            },
        }
    }

    fn step_finished(&self, run: &RunContext, vars: &VariableContext) {
        let mut state = run.state.lock();
        state.snapshot.variables = vars.snapshot();
        state.snapshot.steps_completed += 1;
    }

    async fn exec_leaf(
        &self,
        step: &Step,
        run: &RunContext,
        vars: &mut VariableContext,
    ) -> Result<Outcome, StepError> {
        match &step.kind {
            StepKind::Send(send) => self.exec_send(send, run, vars).await,
            StepKind::Expect(expect) => self.exec_expect(expect, run, vars).await,
            StepKind::Assign(assign) => {
                let value = vars.evaluate(&assign.expression)?;
                let message = format!("{} = {}", assign.variable, value);
                vars.set(&assign.variable, value);
                Ok(Outcome::info(message))
            }
            StepKind::Confirm(confirm) => self.exec_confirm(step, confirm, run, vars).await,
            StepKind::Delay(delay) => {
                tokio::time::sleep(Duration::from_millis(delay.ms)).await;
                Ok(Outcome::info(format!("Waited {} ms", delay.ms)))
            }
            StepKind::Log(log) => {
                let message = vars.substitute(&log.message);
                if let Some(variable) = &log.variable {
                    vars.set(variable, message.clone());
                }
                Ok(Outcome {
                    level: log.level,
                    message,
                    data: None,
                })
            }
            StepKind::Modbus(modbus) => self.exec_modbus(modbus, run, vars).await,
            StepKind::Control(_) => Err(StepError::InvalidData("control step dispatched as a leaf".into())),
        }
    }

    async fn exec_send(&self, send: &SendStep, run: &RunContext, vars: &VariableContext) -> Result<Outcome, StepError> {
        let handle = resolve_handle(send.handle, run.handle)?;
        let command = vars.substitute(&send.command);
        let bytes = match send.format {
            SendFormat::At => at::normalize(&command).into_bytes(),
            SendFormat::Text => at::terminate_line(&command).into_bytes(),
            SendFormat::Hex => hex::decode(command.split_whitespace().collect::<String>())
                .map_err(|e| StepError::InvalidData(format!("invalid hex command '{command}': {e}")))?,
        };

        self.transport.clear_input(handle).await?;
        self.transport.write(handle, &bytes).await?;
        if let Some(ms) = send.delay_ms.filter(|ms| *ms > 0) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }

        Ok(Outcome::info(format!("Sent '{}'", command.trim()))
            .with_data(json!({ "handle": handle, "bytes": hex::encode(&bytes) })))
    }

    async fn exec_expect(
        &self,
        expect: &ExpectStep,
        run: &RunContext,
        vars: &mut VariableContext,
    ) -> Result<Outcome, StepError> {
        let handle = resolve_handle(expect.handle, run.handle)?;
        let pattern = vars.substitute(&expect.pattern);
        let timeout_ms = expect.timeout_ms.unwrap_or(self.settings.expect_timeout_ms);
        let regex = match expect.match_kind {
            MatchKind::Regex => Some(
                Regex::new(&pattern).map_err(|e| StepError::InvalidData(format!("invalid regex '{pattern}': {e}")))?,
            ),
            _ => None,
        };

        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut raw: Vec<u8> = Vec::new();
        let mut received = String::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let chunk = self
                .transport
                .read_until(handle, b"\n", self.settings.at_max_response, remaining)
                .await?;
            raw.extend_from_slice(&chunk);
            // Decode the whole buffer so characters split across reads survive
            received = String::from_utf8_lossy(&raw).into_owned();

            let matched = match (expect.match_kind, &regex) {
                (MatchKind::Exact, _) => received.contains(&pattern),
                (MatchKind::Regex, Some(re)) => {
                    if let Some(caps) = re.captures(&received) {
                        if let Some(name) = &expect.capture {
                            store_captures(vars, name, re, &caps);
                        }
                        true
                    } else {
                        false
                    }
                }
                _ => false,
            };
            if matched {
                let response = received.trim().to_string();
                if expect.match_kind == MatchKind::Exact {
                    if let Some(name) = &expect.capture {
                        vars.set(name, response.clone());
                    }
                }
                vars.set(LAST_RESPONSE, response.clone());
                return Ok(Outcome::info(format!("Matched {} '{}'", expect.match_kind, pattern))
                    .with_data(json!({ "response": response })));
            }
        }

        let response = received.trim().to_string();
        vars.set(LAST_RESPONSE, response.clone());
        if expect.match_kind == MatchKind::Timeout {
            if let Some(name) = &expect.capture {
                vars.set(name, response.clone());
            }
            return Ok(Outcome::info(format!("Collected {} bytes in {} ms", response.len(), timeout_ms))
                .with_data(json!({ "response": response })));
        }
        Err(StepError::ExpectationMismatch {
            kind: expect.match_kind,
            pattern,
            timeout_ms,
            received: response,
        })
    }

    async fn exec_confirm(
        &self,
        step: &Step,
        confirm: &ConfirmStep,
        run: &RunContext,
        vars: &mut VariableContext,
    ) -> Result<Outcome, StepError> {
        let message = vars.substitute(&confirm.message);
        let timeout_ms = confirm.timeout_ms.unwrap_or(self.settings.confirm_timeout_ms);

        // Register before announcing so an immediate answer is not lost
        let mut rx = self.broker.register(&run.id, &step.id);
        loop {
            wait_unpaused(run).await;
            if self.enter_confirmation(run, step, &message, &confirm.options, timeout_ms) {
                break;
            }
        }

        let response = match tokio::time::timeout(Duration::from_millis(timeout_ms), &mut rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(StepError::Rejected(Some("confirmation withdrawn".into()))),
            Err(_) => {
                self.broker.withdraw(&run.id, &step.id);
                // An answer may have slipped in between the deadline and the withdraw
                match rx.try_recv() {
                    Ok(response) => response,
                    Err(_) => return Err(StepError::ConfirmationTimeout(timeout_ms)),
                }
            }
        };

        {
            let mut state = run.state.lock();
            if state.transition(&[ExecutionStatus::Paused], ExecutionStatus::Running) {
                self.sink.publish(state.status_event(None));
            }
        }
        store_confirmation(vars, &step.id, confirm.variable.as_deref(), &response);

        if !response.confirmed {
            return Err(StepError::Rejected(response.operator_notes));
        }
        let choice = response
            .selected_option
            .as_deref()
            .or(response.user_input.as_deref())
            .unwrap_or("confirmed");
        Ok(Outcome {
            level: LogLevel::Info,
            message: format!("Operator answered '{choice}'"),
            data: serde_json::to_value(&response).ok(),
        })
    }

    /// Move Running → Paused(awaiting) and announce the request.
    ///
    /// Returns false if an external pause got in first; the caller waits and retries.
    fn enter_confirmation(
        &self,
        run: &RunContext,
        step: &Step,
        message: &str,
        options: &[String],
        timeout_ms: u64,
    ) -> bool {
        let mut state = run.state.lock();
        match state.status() {
            ExecutionStatus::Paused => return false,
            ExecutionStatus::Running => {}
            // Cancelled meanwhile; the run loop is about to drop this future
            _ => return true,
        }

        let entry = LogEntry::new(Some(&step.id), LogLevel::Info, format!("Waiting for confirmation: {message}"))
            .with_data(json!({ "options": options, "timeout_ms": timeout_ms }));
        if state.push_log(entry) {
            self.publish_log(run, &state);
        }
        state.transition(&[ExecutionStatus::Running], ExecutionStatus::Paused);
        state.snapshot.pause_reason = Some(PauseReason::AwaitingConfirmation {
            step_id: step.id.clone(),
        });
        self.sink.publish(state.status_event(Some(format!("Awaiting confirmation of '{}'", step.id))));
        self.sink.publish(ExecutionEvent::ConfirmationRequest {
            execution_id: run.id.clone(),
            workstation_id: run.workstation_id.clone(),
            step_id: step.id.clone(),
            step_name: step.display_name().to_string(),
            message: message.to_string(),
            options: options.to_vec(),
            timeout_ms,
        });
        true
    }

    async fn exec_control(
        &self,
        step: &Step,
        control: &ControlStep,
        run: &RunContext,
        vars: &mut VariableContext,
    ) -> Result<Flow, StepFailure> {
        let fail = |e: StepError| StepFailure::new(&step.id, e);
        match control.control {
            ControlKind::Break => Ok(Flow::Break),
            ControlKind::Continue => Ok(Flow::Continue),
            ControlKind::If => {
                let source = control.condition.as_deref().unwrap_or("false");
                let holds = parse_expression(source)
                    .and_then(|expr| expr.eval_bool(vars))
                    .map_err(|e| fail(e.into()))?;
                self.log(
                    run,
                    Some(&step.id),
                    LogLevel::Debug,
                    format!("Condition '{source}' is {holds}"),
                    None,
                );
                let branch = if holds { &control.steps } else { &control.else_steps };
                self.exec_steps(branch, run, vars).await
            }
            ControlKind::Loop => {
                let source = control.condition.as_deref().unwrap_or("false");
                let condition = parse_expression(source).map_err(|e| fail(e.into()))?;
                let ceiling = self.settings.loop_ceiling;
                let mut iterations: u32 = 0;
                loop {
                    // Keeps a loop of instant steps cancellable
                    tokio::task::yield_now().await;
                    if !condition.eval_bool(vars).map_err(|e| fail(e.into()))? {
                        break;
                    }
                    if iterations >= ceiling {
                        return Err(fail(StepError::LoopCeiling(ceiling)));
                    }
                    iterations += 1;
                    if self.exec_steps(&control.steps, run, vars).await? == Flow::Break {
                        break;
                    }
                }
                self.log(
                    run,
                    Some(&step.id),
                    LogLevel::Info,
                    format!("Loop finished after {iterations} iterations"),
                    None,
                );
                Ok(Flow::Next)
            }
        }
    }

    async fn exec_modbus(
        &self,
        modbus: &ModbusStep,
        run: &RunContext,
        vars: &mut VariableContext,
    ) -> Result<Outcome, StepError> {
        let handle = resolve_handle(modbus.handle, run.handle)?;
        let function = match modbus.action {
            ModbusAction::ReadHolding => FunctionCode::ReadHoldingRegisters,
            ModbusAction::ReadInput => FunctionCode::ReadInputRegisters,
            ModbusAction::Write => {
                let values = modbus
                    .values
                    .iter()
                    .map(|source| to_register(&vars.evaluate(source)?))
                    .collect::<Result<Vec<u16>, StepError>>()?;
                self.modbus
                    .write_registers(handle, modbus.slave_id, modbus.address, &values)
                    .await?;
                return Ok(Outcome::info(format!(
                    "Wrote {} register(s) to slave {} at {}",
                    values.len(),
                    modbus.slave_id,
                    modbus.address
                ))
                .with_data(json!({ "values": values })));
            }
        };

        let values = self
            .modbus
            .read_registers(handle, modbus.slave_id, modbus.address, modbus.count, function)
            .await?;
        if let Some(name) = &modbus.variable {
            store_registers(vars, name, &values);
        }
        Ok(Outcome::info(format!(
            "Read {} register(s) from slave {} at {}",
            values.len(),
            modbus.slave_id,
            modbus.address
        ))
        .with_data(json!({ "values": values })))
    }
}

async fn wait_unpaused(run: &RunContext) {
    let mut pause = run.pause.clone();
    // A dropped sender means nobody can pause us any more
    let _ = pause.wait_for(|paused| !*paused).await;
}

/// Group 1 (or the whole match) under `name`, every group under `name.<i>`,
/// named groups under `name.<group>`
fn store_captures(vars: &mut VariableContext, name: &str, re: &Regex, caps: &Captures<'_>) {
    let primary = caps.get(1).or_else(|| caps.get(0)).map_or("", |m| m.as_str());
    vars.set(name, primary);
    for (i, group) in caps.iter().enumerate().skip(1) {
        if let Some(m) = group {
            vars.set(&format!("{name}.{i}"), m.as_str());
        }
    }
    for group in re.capture_names().flatten() {
        if let Some(m) = caps.name(group) {
            vars.set(&format!("{name}.{group}"), m.as_str());
        }
    }
}

fn store_confirmation(vars: &mut VariableContext, step_id: &str, variable: Option<&str>, response: &ConfirmationResponse) {
    vars.set(&format!("{step_id}.confirmed"), response.confirmed);
    if let Some(option) = &response.selected_option {
        vars.set(&format!("{step_id}.option"), option.as_str());
    }
    if let Some(input) = &response.user_input {
        vars.set(&format!("{step_id}.input"), input.as_str());
    }
    if let Some(variable) = variable {
        let value = response
            .selected_option
            .as_deref()
            .or(response.user_input.as_deref())
            .map_or(Value::Bool(response.confirmed), Value::from);
        vars.set(variable, value);
    }
}

/// `name` = the value (or a comma-joined list), `name_<i>` = each register
fn store_registers(vars: &mut VariableContext, name: &str, values: &[u16]) {
    match values {
        [single] => vars.set(name, *single),
        _ => vars.set(
            name,
            values.iter().map(ToString::to_string).collect::<Vec<_>>().join(","),
        ),
    }
    for (i, value) in values.iter().enumerate() {
        vars.set(&format!("{name}_{i}"), *value);
    }
}

fn to_register(value: &Value) -> Result<u16, StepError> {
    if let Value::Bool(_) = value {
        return Err(StepError::InvalidData(format!("register value {value} is a bool, not a number")));
    }
    let number = value
        .as_number()
        .ok_or_else(|| StepError::InvalidData(format!("register value {value} is not a number")))?;
    if number.fract() != 0.0 || !(0.0..=f64::from(u16::MAX)).contains(&number) {
        return Err(StepError::InvalidData(format!("register value {value} out of range 0..=65535")));
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Ok(number as u16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::simulator::{DeviceTemplates, ResponseRule, SimulatedDevice};
    use crate::core::transport::{SerialConfig, TransportSettings};
    use crate::core::workflow::definition::{AssignStep, DelayStep, LogStep};
    use crate::core::workflow::events::EventHub;
    use crate::core::workflow::execution::ExecutionSnapshot;
    use chrono::Local;
    use std::collections::BTreeMap;

    struct Harness {
        engine: WorkflowEngine,
        state: Arc<Mutex<ExecutionState>>,
        run: RunContext,
        _pause_tx: watch::Sender<bool>,
    }

    async fn harness(device: SimulatedDevice, settings: EngineSettings) -> Harness {
        let transport = Transport::new(TransportSettings::default()).unwrap();
        let handle = transport
            .connect_link(SerialConfig::new("sim0", 115_200), Box::new(device))
            .await
            .unwrap();
        let engine = WorkflowEngine::new(
            transport,
            settings,
            Arc::new(EventHub::default()),
            Arc::new(ConfirmationBroker::new()),
        );
        let state = ExecutionState::new(ExecutionSnapshot {
            id: "e1".into(),
            workflow_id: "w".into(),
            workflow_name: "w".into(),
            status: ExecutionStatus::Pending,
            pause_reason: None,
            current_step: None,
            failed_step: None,
            error: None,
            variables: BTreeMap::new(),
            steps_completed: 0,
            log: Vec::new(),
            handle: Some(handle),
            workstation_id: None,
            operator_id: None,
            created_at: Local::now(),
            started_at: None,
            completed_at: None,
        });
        let state = Arc::new(Mutex::new(state));
        let (pause_tx, pause) = watch::channel(false);
        let run = RunContext {
            id: "e1".into(),
            workstation_id: None,
            handle: Some(handle),
            state: state.clone(),
            cancel: CancellationToken::new(),
            pause,
        };
        Harness {
            engine,
            state,
            run,
            _pause_tx: pause_tx,
        }
    }

    async fn run(h: Harness, definition: WorkflowDefinition) -> Arc<Mutex<ExecutionState>> {
        let vars = VariableContext::seeded(&definition.variables, &BTreeMap::new());
        h.engine.run(Arc::new(definition), h.run, vars).await;
        h.state
    }

    fn assign(id: &str, variable: &str, expression: &str) -> Step {
        Step::new(
            id,
            StepKind::Assign(AssignStep {
                variable: variable.into(),
                expression: expression.into(),
            }),
        )
    }

    #[tokio::test]
    async fn test_regex_capture_groups() {
        let h = harness(DeviceTemplates::at_modem(), EngineSettings::default()).await;
        let def = WorkflowDefinition::new("csq", "Signal")
            .step(Step::new("s1", StepKind::Send(SendStep::at("+CSQ"))))
            .step(Step::new(
                "e1",
                StepKind::Expect(ExpectStep::regex(r"\+CSQ: (?P<rssi>\d+),(\d+)", 500).capture("sig")),
            ));
        let state = run(h, def).await;
        let state = state.lock();
        let vars = &state.snapshot.variables;
        assert_eq!(state.status(), ExecutionStatus::Completed);
        assert_eq!(vars["sig"], Value::from("23"));
        assert_eq!(vars["sig.2"], Value::from("99"));
        assert_eq!(vars["sig.rssi"], Value::from("23"));
        assert!(vars[LAST_RESPONSE].to_string().contains("+CSQ: 23,99"));
    }

    #[tokio::test]
    async fn test_expect_timeout_branch_runs_instead_of_failing() {
        let h = harness(SimulatedDevice::new("silent"), EngineSettings::default()).await;
        let mut expect = ExpectStep::text("OK", 50);
        expect.on_timeout = vec![assign("fallback", "mode", "'offline'")];
        let def = WorkflowDefinition::new("w", "w")
            .step(Step::new("s1", StepKind::Send(SendStep::at(""))))
            .step(Step::new("e1", StepKind::Expect(expect)));
        let state = run(h, def).await;
        let state = state.lock();
        assert_eq!(state.status(), ExecutionStatus::Completed);
        assert_eq!(state.snapshot.variables["mode"], Value::from("offline"));
    }

    #[tokio::test]
    async fn test_expect_mismatch_fails_with_step_id() {
        let device = SimulatedDevice::new("d").with_rule(ResponseRule::reply("at", "AT", "ERROR\r\n"));
        let h = harness(device, EngineSettings::default()).await;
        let def = WorkflowDefinition::new("w", "w")
            .step(Step::new("s1", StepKind::Send(SendStep::at("AT"))))
            .step(Step::new("e1", StepKind::Expect(ExpectStep::text("OK", 80))).retries(1));
        let state = run(h, def).await;
        let state = state.lock();
        assert_eq!(state.status(), ExecutionStatus::Failed);
        assert_eq!(state.snapshot.failed_step.as_deref(), Some("e1"));
        assert!(state.snapshot.error.as_deref().unwrap().contains("Step 'e1' failed"));
        assert!(state
            .snapshot
            .log
            .iter()
            .any(|e| e.level == LogLevel::Warning && e.message.contains("retry 1/1")));
    }

    #[tokio::test]
    async fn test_loop_with_break_and_else_branch() {
        let h = harness(SimulatedDevice::new("idle"), EngineSettings::default()).await;
        let def = WorkflowDefinition::new("w", "w")
            .variable("i", 0i64)
            .step(Step::new(
                "loop",
                StepKind::Control(ControlStep {
                    control: ControlKind::Loop,
                    condition: Some("true".into()),
                    steps: vec![
                        assign("inc", "i", "i + 1"),
                        Step::new(
                            "check",
                            StepKind::Control(ControlStep {
                                control: ControlKind::If,
                                condition: Some("i >= 5".into()),
                                steps: vec![Step::new(
                                    "stop",
                                    StepKind::Control(ControlStep {
                                        control: ControlKind::Break,
                                        condition: None,
                                        steps: vec![],
                                        else_steps: vec![],
                                    }),
                                )],
                                else_steps: vec![assign("mark", "below", "true")],
                            }),
                        ),
                    ],
                    else_steps: vec![],
                }),
            ));
        let state = run(h, def).await;
        let state = state.lock();
        assert_eq!(state.status(), ExecutionStatus::Completed);
        assert_eq!(state.snapshot.variables["i"], Value::from(5i64));
        assert_eq!(state.snapshot.variables["below"], Value::Bool(true));
    }

    #[tokio::test]
    async fn test_loop_ceiling_fails() {
        let settings = EngineSettings {
            loop_ceiling: 25,
            ..EngineSettings::default()
        };
        let h = harness(SimulatedDevice::new("idle"), settings).await;
        let def = WorkflowDefinition::new("w", "w").variable("n", 0i64).step(Step::new(
            "spin",
            StepKind::Control(ControlStep {
                control: ControlKind::Loop,
                condition: Some("n >= 0".into()),
                steps: vec![assign("inc", "n", "n + 1")],
                else_steps: vec![],
            }),
        ));
        let state = run(h, def).await;
        let state = state.lock();
        assert_eq!(state.status(), ExecutionStatus::Failed);
        assert_eq!(state.snapshot.failed_step.as_deref(), Some("spin"));
        assert_eq!(state.snapshot.variables["n"], Value::from(25i64));
    }

    #[tokio::test]
    async fn test_modbus_read_write_steps() {
        let device = DeviceTemplates::modbus_slave(7);
        let bank = device.registers();
        bank.lock().insert(0x10, 0);
        bank.lock().insert(0x11, 0);
        let h = harness(device, EngineSettings::default()).await;
        let def = WorkflowDefinition::new("w", "w")
            .variable("mode", 3i64)
            .step(Step::new(
                "w1",
                StepKind::Modbus(ModbusStep {
                    action: ModbusAction::Write,
                    slave_id: 7,
                    address: 0x10,
                    count: 1,
                    values: vec!["mode * 2".into(), "1000".into()],
                    variable: None,
                    handle: None,
                }),
            ))
            .step(Step::new(
                "r1",
                StepKind::Modbus(ModbusStep {
                    action: ModbusAction::ReadHolding,
                    slave_id: 7,
                    address: 0x10,
                    count: 2,
                    values: vec![],
                    variable: Some("regs".into()),
                    handle: None,
                }),
            ));
        let state = run(h, def).await;
        let state = state.lock();
        assert_eq!(state.status(), ExecutionStatus::Completed);
        assert_eq!(state.snapshot.variables["regs"], Value::from("6,1000"));
        assert_eq!(state.snapshot.variables["regs_1"], Value::from(1000u16));
        assert_eq!(bank.lock().get(&0x11), Some(&1000));
    }

    #[tokio::test]
    async fn test_log_and_delay_steps() {
        let h = harness(SimulatedDevice::new("idle"), EngineSettings::default()).await;
        let def = WorkflowDefinition::new("w", "w")
            .variable("unit", "PSU-7")
            .step(Step::new("d1", StepKind::Delay(DelayStep { ms: 5 })))
            .step(Step::new(
                "l1",
                StepKind::Log(LogStep {
                    message: "Testing ${unit} ${nope}".into(),
                    level: LogLevel::Warning,
                    variable: Some("banner".into()),
                }),
            ));
        let state = run(h, def).await;
        let state = state.lock();
        assert_eq!(state.snapshot.steps_completed, 2);
        assert_eq!(state.snapshot.variables["banner"], Value::from("Testing PSU-7 ${nope}"));
        assert!(state
            .snapshot
            .log
            .iter()
            .any(|e| e.step_id.as_deref() == Some("l1") && e.level == LogLevel::Warning));
    }

    #[tokio::test]
    async fn test_expect_keeps_characters_split_across_reads() {
        let device = SimulatedDevice::new("thermo").with_rule(ResponseRule::reply("temp", "temp", "Temp: 25°C\r\n"));
        // 9 bytes ends the first read between the two bytes of the degree sign
        let settings = EngineSettings {
            at_max_response: 9,
            ..EngineSettings::default()
        };
        let h = harness(device, settings).await;
        let def = WorkflowDefinition::new("t", "Temperature")
            .step(Step::new("s1", StepKind::Send(SendStep::at("+TEMP?"))))
            .step(Step::new("e1", StepKind::Expect(ExpectStep::text("25°C", 500))));
        let state = run(h, def).await;
        let state = state.lock();
        assert_eq!(state.status(), ExecutionStatus::Completed, "{:?}", state.snapshot.error);
        assert_eq!(state.snapshot.variables[LAST_RESPONSE], Value::from("Temp: 25°C"));
    }

    #[test]
    fn test_to_register_range() {
        assert_eq!(to_register(&Value::Number(65535.0)).unwrap(), 65535);
        assert_eq!(to_register(&Value::from("12")).unwrap(), 12);
        assert!(to_register(&Value::Number(65536.0)).is_err());
        assert!(to_register(&Value::Number(-1.0)).is_err());
        assert!(to_register(&Value::Number(1.5)).is_err());
        assert!(to_register(&Value::Bool(true)).is_err());
        assert!(to_register(&Value::Bool(false)).is_err());
        assert!(to_register(&Value::from("inf")).is_err());
    }
}
