//! End-to-end workflow runs against simulated devices

use rigcon_core::core::simulator::DeviceTemplates;
use rigcon_core::core::transport::{ConnectionHandle, SerialConfig, Transport, TransportSettings};
use rigcon_core::core::variables::Value;
use rigcon_core::core::workflow::{
    AssignStep, ConfirmStep, ControlKind, ControlStep, EngineSettings, ExecutionEvent, ExecutionRegistry,
    ConfirmationResponse, ExecutionStatus, ExpectStep, JsonLinesRecorder, ModbusAction, ModbusStep, PauseReason,
    RegistrySettings, SendStep, StartRequest, Step, StepKind, WorkflowDefinition, WorkflowError,
};
use std::sync::Arc;
use std::time::Duration;

async fn bench(engine: EngineSettings) -> (ExecutionRegistry, ConnectionHandle) {
    let transport = Transport::new(TransportSettings::default()).unwrap();
    let handle = transport
        .connect_link(SerialConfig::new("sim-bench", 115_200), Box::new(DeviceTemplates::bench_device()))
        .await
        .unwrap();
    (ExecutionRegistry::new(transport, engine, RegistrySettings::default()), handle)
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

fn confirm(id: &str, timeout_ms: Option<u64>) -> Step {
    Step::new(
        id,
        StepKind::Confirm(ConfirmStep {
            message: "Fit the test probe".into(),
            options: vec!["Done".into()],
            timeout_ms,
            variable: None,
        }),
    )
}

async fn wait_for_status(registry: &ExecutionRegistry, id: &str, status: ExecutionStatus) {
    for _ in 0..400 {
        if registry.get_execution(id).unwrap().status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("execution {id} never reached {status}");
}

#[tokio::test]
async fn at_handshake_then_assign_completes() {
    let (registry, handle) = bench(EngineSettings::default()).await;
    let def = WorkflowDefinition::new("handshake", "Handshake")
        .step(Step::new("ping", StepKind::Send(SendStep::at("AT"))))
        .step(Step::new("ok", StepKind::Expect(ExpectStep::text("OK", 1000))))
        .step(assign("set", "x", "\"42\""));

    let id = registry
        .start_execution(def, StartRequest::default().handle(handle))
        .unwrap();
    let done = registry.wait(&id).await.unwrap();

    assert_eq!(done.status, ExecutionStatus::Completed, "{:?}", done.error);
    assert_eq!(done.variables["x"], Value::from("42"));
    assert_eq!(done.steps_completed, 3);
    assert!(done.started_at.is_some() && done.completed_at.is_some());
}

#[tokio::test]
async fn unanswered_confirmation_fails_naming_the_step() {
    let (registry, handle) = bench(EngineSettings::default()).await;
    let def = WorkflowDefinition::new("probe", "Probe").step(confirm("fit_probe", Some(100)));

    let id = registry
        .start_execution(def, StartRequest::default().handle(handle))
        .unwrap();
    let done = registry.wait(&id).await.unwrap();

    assert_eq!(done.status, ExecutionStatus::Failed);
    assert_eq!(done.failed_step.as_deref(), Some("fit_probe"));
    assert!(done.error.unwrap().contains("fit_probe"));
}

#[tokio::test]
async fn cancel_while_waiting_stops_all_output() {
    let (registry, handle) = bench(EngineSettings::default()).await;
    let def = WorkflowDefinition::new("probe", "Probe")
        .step(confirm("fit_probe", None))
        .step(assign("after", "x", "1"));

    let mut events = registry.events().subscribe();
    let id = registry
        .start_execution(def, StartRequest::default().handle(handle).workstation("WS-02"))
        .unwrap();
    wait_for_status(&registry, &id, ExecutionStatus::Paused).await;

    registry.cancel(&id).unwrap();
    let done = registry.wait(&id).await.unwrap();
    assert_eq!(done.status, ExecutionStatus::Cancelled);
    assert!(!done.variables.contains_key("x"));

    let mut seen_cancel = false;
    while let Some(event) = events.try_recv() {
        assert_eq!(event.workstation_id(), Some("WS-02"));
        match event {
            ExecutionEvent::Status {
                status: ExecutionStatus::Cancelled,
                ..
            } => seen_cancel = true,
            other => assert!(!seen_cancel, "event after cancellation: {other:?}"),
        }
    }
    assert!(seen_cancel);

    // Nothing is waiting any more
    assert!(registry
        .submit_confirmation(&id, "fit_probe", Default::default())
        .is_err());
}

#[tokio::test]
async fn zero_confirm_timeout_fails_immediately() {
    let (registry, handle) = bench(EngineSettings::default()).await;
    let def = WorkflowDefinition::new("quick", "Quick")
        .step(confirm("quick_check", Some(0)))
        .step(assign("after", "x", "1"));

    let id = registry
        .start_execution(def, StartRequest::default().handle(handle))
        .unwrap();
    let done = tokio::time::timeout(Duration::from_secs(2), registry.wait(&id))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(done.status, ExecutionStatus::Failed);
    assert_eq!(done.failed_step.as_deref(), Some("quick_check"));
    assert!(done.error.unwrap().contains("0 ms"));
    assert!(!done.variables.contains_key("x"));
    assert!(registry
        .submit_confirmation(&id, "quick_check", ConfirmationResponse::confirm("Done"))
        .is_err());
}

#[tokio::test]
async fn pause_is_refused_while_awaiting_confirmation() {
    let (registry, handle) = bench(EngineSettings::default()).await;
    let def = WorkflowDefinition::new("probe", "Probe")
        .step(confirm("fit_probe", None))
        .step(assign("after", "x", "1"));

    let id = registry
        .start_execution(def, StartRequest::default().handle(handle))
        .unwrap();
    wait_for_status(&registry, &id, ExecutionStatus::Paused).await;

    assert!(matches!(
        registry.pause(&id),
        Err(WorkflowError::InvalidState {
            status: ExecutionStatus::Paused,
            action: "pause",
            ..
        })
    ));
    let snapshot = registry.get_execution(&id).unwrap();
    assert!(matches!(
        snapshot.pause_reason,
        Some(PauseReason::AwaitingConfirmation { ref step_id }) if step_id == "fit_probe"
    ));

    registry
        .submit_confirmation(&id, "fit_probe", ConfirmationResponse::confirm("Done"))
        .unwrap();
    let done = registry.wait(&id).await.unwrap();
    assert_eq!(done.status, ExecutionStatus::Completed, "{:?}", done.error);
    assert_eq!(done.variables["x"], Value::Number(1.0));
}

/// Reads one register `rounds` times and counts replies that are not `expected`
fn polling_workflow(id: &str, address: u16, expected: u16, rounds: u32) -> WorkflowDefinition {
    let read = Step::new(
        &format!("{id}_read"),
        StepKind::Modbus(ModbusStep {
            action: ModbusAction::ReadHolding,
            slave_id: 1,
            address,
            count: 1,
            values: Vec::new(),
            variable: Some("reg".into()),
            handle: None,
        }),
    );
    let tally = Step::new(
        &format!("{id}_check"),
        StepKind::Control(ControlStep {
            control: ControlKind::If,
            condition: Some(format!("reg != {expected}")),
            steps: vec![assign(&format!("{id}_bad"), "bad", "bad + 1")],
            else_steps: Vec::new(),
        }),
    );
    WorkflowDefinition::new(id, id)
        .variable("i", 0i64)
        .variable("bad", 0i64)
        .step(Step::new(
            &format!("{id}_loop"),
            StepKind::Control(ControlStep {
                control: ControlKind::Loop,
                condition: Some(format!("i < {rounds}")),
                steps: vec![read, tally, assign(&format!("{id}_next"), "i", "i + 1")],
                else_steps: Vec::new(),
            }),
        ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_executions_on_one_connection_get_their_own_replies() {
    let (registry, handle) = bench(EngineSettings::default()).await;

    // bench_device holds address * 10 in each register
    let first = registry
        .start_execution(polling_workflow("north", 3, 30, 20), StartRequest::default().handle(handle))
        .unwrap();
    let second = registry
        .start_execution(polling_workflow("south", 7, 70, 20), StartRequest::default().handle(handle))
        .unwrap();

    for id in [first, second] {
        let done = registry.wait(&id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed, "{:?}", done.error);
        assert_eq!(done.variables["i"], Value::Number(20.0));
        assert_eq!(done.variables["bad"], Value::Number(0.0));
    }
}

#[tokio::test]
async fn runaway_loop_hits_the_ceiling() {
    let engine = EngineSettings {
        loop_ceiling: 25,
        ..EngineSettings::default()
    };
    let (registry, handle) = bench(engine).await;
    let def = WorkflowDefinition::new("spin", "Spin").step(Step::new(
        "forever",
        StepKind::Control(ControlStep {
            control: ControlKind::Loop,
            condition: Some("true".into()),
            steps: vec![assign("tick", "n", "1")],
            else_steps: Vec::new(),
        }),
    ));

    let id = registry
        .start_execution(def, StartRequest::default().handle(handle))
        .unwrap();
    let done = registry.wait(&id).await.unwrap();

    assert_eq!(done.status, ExecutionStatus::Failed);
    assert!(done.error.unwrap().contains("25"));
}

#[tokio::test]
async fn modbus_write_then_read_back() {
    let (registry, handle) = bench(EngineSettings::default()).await;
    let def = WorkflowDefinition::new("regs", "Registers")
        .variable("setpoint", 700i64)
        .step(Step::new(
            "write",
            StepKind::Modbus(ModbusStep {
                action: ModbusAction::Write,
                slave_id: 1,
                address: 4,
                count: 1,
                values: vec!["setpoint + 5".into()],
                variable: None,
                handle: None,
            }),
        ))
        .step(Step::new(
            "read",
            StepKind::Modbus(ModbusStep {
                action: ModbusAction::ReadHolding,
                slave_id: 1,
                address: 4,
                count: 1,
                values: Vec::new(),
                variable: Some("sp".into()),
                handle: None,
            }),
        ));

    let id = registry
        .start_execution(def, StartRequest::default().handle(handle))
        .unwrap();
    let done = registry.wait(&id).await.unwrap();

    assert_eq!(done.status, ExecutionStatus::Completed, "{:?}", done.error);
    assert_eq!(done.variables["sp"], Value::Number(705.0));
}

#[tokio::test]
async fn yaml_workflow_runs_and_is_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("modem.yaml");
    std::fs::write(
        &path,
        r#"
id: modem-check
name: Modem check
variables:
  min_rssi: 10
steps:
  - id: csq_send
    type: send
    command: AT+CSQ
  - id: csq
    type: expect
    match: regex
    pattern: '\+CSQ: (\d+),'
    capture: rssi
    timeout_ms: 1000
  - id: gate
    type: control
    control: if
    condition: "number(rssi) >= min_rssi"
    steps:
      - id: good
        type: log
        message: "signal ${rssi}"
        variable: verdict
    else_steps:
      - id: weak
        type: assign
        variable: verdict
        expression: "'weak'"
"#,
    )
    .unwrap();

    let log_path = dir.path().join("runs.jsonl");
    let (registry, handle) = bench(EngineSettings::default()).await;
    let registry = registry.with_recorder(Arc::new(JsonLinesRecorder::open(&log_path).unwrap()));

    let def = WorkflowDefinition::from_path(&path).unwrap();
    let id = registry
        .start_execution(def, StartRequest::default().handle(handle).operator("op-7"))
        .unwrap();
    let done = registry.wait(&id).await.unwrap();

    assert_eq!(done.status, ExecutionStatus::Completed, "{:?}", done.error);
    assert_eq!(done.variables["rssi"], Value::from("23"));
    assert_eq!(done.variables["verdict"], Value::from("signal 23"));

    let recorded = std::fs::read_to_string(&log_path).unwrap();
    let line: serde_json::Value = serde_json::from_str(recorded.lines().next().unwrap()).unwrap();
    assert_eq!(line["id"], id.as_str());
    assert_eq!(line["operator_id"], "op-7");
    assert_eq!(line["status"], "completed");
}
