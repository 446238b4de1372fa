//! Workflow definitions
//!
//! Definitions are plain data (JSON, YAML or TOML) and immutable once handed
//! to the registry. [`WorkflowDefinition::validate`] runs before any device
//! I/O, so a malformed definition never half-executes.

use super::WorkflowError;
use crate::core::protocol::modbus::{MAX_READ_REGISTERS, MAX_WRITE_REGISTERS};
use crate::core::transport::ConnectionHandle;
use crate::core::variables::{parse_expression, ExprError, Value};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Definition validation errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// Workflow id missing
    #[error("workflow id is empty")]
    EmptyWorkflowId,

    /// Step id missing
    #[error("step at {0} has an empty id")]
    EmptyStepId(String),

    /// Two steps share an id (including a control step reusing its own id
    /// inside its children)
    #[error("duplicate step id '{0}'")]
    DuplicateStepId(String),

    /// Required field missing or empty
    #[error("step '{step}': missing {field}")]
    MissingField {
        /// Step id
        step: String,
        /// Field name
        field: &'static str,
    },

    /// Expression does not parse
    #[error("step '{step}': {source}")]
    InvalidExpression {
        /// Step id
        step: String,
        /// Parser error
        source: ExprError,
    },

    /// Regex does not compile
    #[error("step '{step}': invalid regex: {message}")]
    InvalidRegex {
        /// Step id
        step: String,
        /// Compiler message
        message: String,
    },

    /// Break or Continue outside any Loop
    #[error("step '{0}': break/continue outside a loop")]
    OutsideLoop(String),

    /// Any other malformed step
    #[error("step '{step}': {message}")]
    InvalidStep {
        /// Step id
        step: String,
        /// What is wrong
        message: String,
    },
}

/// Workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow id
    pub id: String,
    /// Display name
    pub name: String,
    /// Description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Initial variables
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    /// Top-level steps, run in order
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// One step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Unique id within the workflow
    pub id: String,
    /// Display name (defaults to the id)
    #[serde(default)]
    pub name: String,
    /// Extra attempts for device steps (send, expect, modbus)
    #[serde(default)]
    pub retry_count: u32,
    /// Step behavior
    #[serde(flatten)]
    pub kind: StepKind,
}

impl Step {
    /// Create a step
    pub fn new(id: &str, kind: StepKind) -> Self {
        Self {
            id: id.to_string(),
            name: String::new(),
            retry_count: 0,
            kind,
        }
    }

    /// Set display name
    #[must_use]
    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Set retry count
    #[must_use]
    pub fn retries(mut self, count: u32) -> Self {
        self.retry_count = count;
        self
    }

    /// Display name, falling back to the id
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// Step variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Write a command
    Send(SendStep),
    /// Wait for a reply
    Expect(ExpectStep),
    /// Set a variable from an expression
    Assign(AssignStep),
    /// Wait for an operator
    Confirm(ConfirmStep),
    /// If / Loop / Break / Continue
    Control(ControlStep),
    /// Sleep
    Delay(DelayStep),
    /// Emit a log entry
    Log(LogStep),
    /// Modbus register read or write
    Modbus(ModbusStep),
}

impl StepKind {
    /// Tag name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Send(_) => "send",
            Self::Expect(_) => "expect",
            Self::Assign(_) => "assign",
            Self::Confirm(_) => "confirm",
            Self::Control(_) => "control",
            Self::Delay(_) => "delay",
            Self::Log(_) => "log",
            Self::Modbus(_) => "modbus",
        }
    }
}

/// How a Send command is put on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendFormat {
    /// AT normalization (prefix + CR LF)
    #[default]
    At,
    /// Text line, CR LF appended if missing
    Text,
    /// Hex string decoded to raw bytes
    Hex,
}

/// Send step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendStep {
    /// Command template, `${var}` placeholders allowed
    pub command: String,
    /// Wire format
    #[serde(default)]
    pub format: SendFormat,
    /// Target connection (execution default if absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<ConnectionHandle>,
    /// Pause after sending, in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
}

impl SendStep {
    /// AT command on the default connection
    pub fn at(command: &str) -> Self {
        Self {
            command: command.to_string(),
            format: SendFormat::At,
            handle: None,
            delay_ms: None,
        }
    }
}

/// Expect match kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    /// Response contains the pattern text
    #[default]
    Exact,
    /// Regex found in the response
    Regex,
    /// Collect for the whole timeout; never fails
    Timeout,
}

impl fmt::Display for MatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Exact => "text",
            Self::Regex => "regex",
            Self::Timeout => "timeout",
        })
    }
}

/// Expect step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpectStep {
    /// Match kind
    #[serde(rename = "match", default)]
    pub match_kind: MatchKind,
    /// Pattern template
    #[serde(default)]
    pub pattern: String,
    /// Wait budget in milliseconds (engine default if absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Variable receiving the match (regex: group 1 if any, else the match)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture: Option<String>,
    /// Steps run instead of failing when the pattern never shows up
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_timeout: Vec<Step>,
    /// Source connection (execution default if absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<ConnectionHandle>,
}

impl ExpectStep {
    /// Wait for `pattern` to appear in the response text
    pub fn text(pattern: &str, timeout_ms: u64) -> Self {
        Self {
            match_kind: MatchKind::Exact,
            pattern: pattern.to_string(),
            timeout_ms: Some(timeout_ms),
            capture: None,
            on_timeout: Vec::new(),
            handle: None,
        }
    }

    /// Wait for `pattern` as a regex
    pub fn regex(pattern: &str, timeout_ms: u64) -> Self {
        Self {
            match_kind: MatchKind::Regex,
            ..Self::text(pattern, timeout_ms)
        }
    }

    /// Store the match in `variable`
    #[must_use]
    pub fn capture(mut self, variable: &str) -> Self {
        self.capture = Some(variable.to_string());
        self
    }
}

/// Assign step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignStep {
    /// Target variable
    pub variable: String,
    /// Expression source
    pub expression: String,
}

/// Confirm step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmStep {
    /// Message template
    pub message: String,
    /// Selectable options
    #[serde(default)]
    pub options: Vec<String>,
    /// Wait budget in milliseconds (engine default if absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Variable receiving the selected option (or user input)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable: Option<String>,
}

/// Control kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlKind {
    /// Run children once if the condition holds
    If,
    /// Run children while the condition holds
    Loop,
    /// Leave the innermost loop
    Break,
    /// Start the next iteration of the innermost loop
    Continue,
}

/// Control step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlStep {
    /// Control kind
    pub control: ControlKind,
    /// Condition expression (If, Loop)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Children
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Step>,
    /// Children run when an If condition is false
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub else_steps: Vec<Step>,
}

/// Delay step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayStep {
    /// Milliseconds to sleep
    pub ms: u64,
}

/// Log step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogStep {
    /// Message template
    pub message: String,
    /// Entry level
    #[serde(default)]
    pub level: super::LogLevel,
    /// Variable receiving the resolved message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable: Option<String>,
}

/// Modbus operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModbusAction {
    /// Read holding registers
    ReadHolding,
    /// Read input registers
    ReadInput,
    /// Write registers
    Write,
}

/// Modbus step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModbusStep {
    /// Operation
    pub action: ModbusAction,
    /// Slave address
    pub slave_id: u8,
    /// First register
    pub address: u16,
    /// Register count for reads
    #[serde(default = "default_count")]
    pub count: u16,
    /// Value expressions for writes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
    /// Variable receiving read results
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable: Option<String>,
    /// Target connection (execution default if absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<ConnectionHandle>,
}

fn default_count() -> u16 {
    1
}

impl WorkflowDefinition {
    /// Create an empty definition
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: None,
            variables: BTreeMap::new(),
            steps: Vec::new(),
        }
    }

    /// Append a step
    #[must_use]
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Set an initial variable
    #[must_use]
    pub fn variable(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.variables.insert(name.to_string(), value.into());
        self
    }

    /// Load from a `.json`, `.yaml`/`.yml` or `.toml` file
    pub fn from_path(path: &Path) -> Result<Self, WorkflowError> {
        let text = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();
        let definition: Self = match ext.as_str() {
            "json" => serde_json::from_str(&text).map_err(|e| WorkflowError::Load(e.to_string()))?,
            "yaml" | "yml" => serde_yaml::from_str(&text).map_err(|e| WorkflowError::Load(e.to_string()))?,
            "toml" => toml::from_str(&text).map_err(|e| WorkflowError::Load(e.to_string()))?,
            other => {
                return Err(WorkflowError::Load(format!(
                    "unsupported workflow file extension '{other}'"
                )))
            }
        };
        definition.validate()?;
        Ok(definition)
    }

    /// Check ids, expressions, patterns and control structure
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::EmptyWorkflowId);
        }
        let mut seen = HashSet::new();
        validate_steps(&self.steps, "root", 0, &mut seen)
    }

    /// Total number of steps, nested ones included
    pub fn step_count(&self) -> usize {
        fn count(steps: &[Step]) -> usize {
            steps
                .iter()
                .map(|s| {
                    1 + match &s.kind {
                        StepKind::Control(c) => count(&c.steps) + count(&c.else_steps),
                        StepKind::Expect(e) => count(&e.on_timeout),
                        _ => 0,
                    }
                })
                .sum()
        }
        count(&self.steps)
    }
}

fn missing(step: &Step, field: &'static str) -> ValidationError {
    ValidationError::MissingField {
        step: step.id.clone(),
        field,
    }
}

/// The register block must end at or before 0xFFFF
fn check_register_span(step: &Step, address: u16, len: usize) -> Result<(), ValidationError> {
    if usize::from(address) + len > 0x1_0000 {
        return Err(ValidationError::InvalidStep {
            step: step.id.clone(),
            message: format!("{len} registers from 0x{address:04X} run past 0xFFFF"),
        });
    }
    Ok(())
}

fn check_expression(step: &Step, source: &str) -> Result<(), ValidationError> {
    parse_expression(source)
        .map(|_| ())
        .map_err(|source| ValidationError::InvalidExpression {
            step: step.id.clone(),
            source,
        })
}

fn validate_steps(
    steps: &[Step],
    parent: &str,
    loop_depth: usize,
    seen: &mut HashSet<String>,
) -> Result<(), ValidationError> {
    for (index, step) in steps.iter().enumerate() {
        if step.id.trim().is_empty() {
            return Err(ValidationError::EmptyStepId(format!("{parent}[{index}]")));
        }
        if !seen.insert(step.id.clone()) {
            return Err(ValidationError::DuplicateStepId(step.id.clone()));
        }

        match &step.kind {
            StepKind::Send(send) => {
                if send.command.trim().is_empty() {
                    return Err(missing(step, "command"));
                }
                if send.format == SendFormat::Hex && !send.command.contains("${") {
                    hex::decode(send.command.split_whitespace().collect::<String>()).map_err(|e| {
                        ValidationError::InvalidStep {
                            step: step.id.clone(),
                            message: format!("invalid hex command: {e}"),
                        }
                    })?;
                }
            }
            StepKind::Expect(expect) => {
                match expect.match_kind {
                    MatchKind::Exact if expect.pattern.is_empty() => return Err(missing(step, "pattern")),
                    MatchKind::Regex if !expect.pattern.contains("${") => {
                        Regex::new(&expect.pattern).map_err(|e| ValidationError::InvalidRegex {
                            step: step.id.clone(),
                            message: e.to_string(),
                        })?;
                    }
                    _ => {}
                }
                if expect.timeout_ms == Some(0) {
                    return Err(ValidationError::InvalidStep {
                        step: step.id.clone(),
                        message: "timeout must be positive".into(),
                    });
                }
                validate_steps(&expect.on_timeout, &step.id, loop_depth, seen)?;
            }
            StepKind::Assign(assign) => {
                if assign.variable.trim().is_empty() {
                    return Err(missing(step, "variable"));
                }
                check_expression(step, &assign.expression)?;
            }
            StepKind::Confirm(_) | StepKind::Delay(_) | StepKind::Log(_) => {}
            StepKind::Control(control) => match control.control {
                ControlKind::If | ControlKind::Loop => {
                    let condition = control.condition.as_deref().ok_or_else(|| missing(step, "condition"))?;
                    check_expression(step, condition)?;
                    if control.control == ControlKind::Loop && !control.else_steps.is_empty() {
                        return Err(ValidationError::InvalidStep {
                            step: step.id.clone(),
                            message: "loop cannot have else_steps".into(),
                        });
                    }
                    let depth = loop_depth + usize::from(control.control == ControlKind::Loop);
                    validate_steps(&control.steps, &step.id, depth, seen)?;
                    validate_steps(&control.else_steps, &step.id, loop_depth, seen)?;
                }
                ControlKind::Break | ControlKind::Continue => {
                    if loop_depth == 0 {
                        return Err(ValidationError::OutsideLoop(step.id.clone()));
                    }
                    if !control.steps.is_empty() || !control.else_steps.is_empty() {
                        return Err(ValidationError::InvalidStep {
                            step: step.id.clone(),
                            message: "break/continue cannot have children".into(),
                        });
                    }
                }
            },
            StepKind::Modbus(modbus) => match modbus.action {
                ModbusAction::ReadHolding | ModbusAction::ReadInput => {
                    if modbus.count == 0 || modbus.count > MAX_READ_REGISTERS {
                        return Err(ValidationError::InvalidStep {
                            step: step.id.clone(),
                            message: format!("register count {} out of range", modbus.count),
                        });
                    }
                    check_register_span(step, modbus.address, usize::from(modbus.count))?;
                }
                ModbusAction::Write => {
                    if modbus.values.is_empty() {
                        return Err(missing(step, "values"));
                    }
                    if modbus.values.len() > MAX_WRITE_REGISTERS {
                        return Err(ValidationError::InvalidStep {
                            step: step.id.clone(),
                            message: format!(
                                "{} values exceed the {MAX_WRITE_REGISTERS}-register write limit",
                                modbus.values.len()
                            ),
                        });
                    }
                    check_register_span(step, modbus.address, modbus.values.len())?;
                    for value in &modbus.values {
                        check_expression(step, value)?;
                    }
                }
            },
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control(kind: ControlKind, condition: Option<&str>, steps: Vec<Step>) -> StepKind {
        StepKind::Control(ControlStep {
            control: kind,
            condition: condition.map(str::to_string),
            steps,
            else_steps: Vec::new(),
        })
    }

    fn assign(variable: &str, expression: &str) -> StepKind {
        StepKind::Assign(AssignStep {
            variable: variable.into(),
            expression: expression.into(),
        })
    }

    #[test]
    fn test_parse_json_definition() {
        let json = r#"{
            "id": "modem-check",
            "name": "Modem check",
            "variables": {"apn": "internet"},
            "steps": [
                {"id": "s1", "type": "send", "command": "AT+CGDCONT=1,\"IP\",\"${apn}\""},
                {"id": "e1", "type": "expect", "match": "regex", "pattern": "OK|ERROR", "timeout_ms": 1000},
                {"id": "c1", "type": "confirm", "message": "Antenna attached?", "options": ["Yes", "No"]},
                {"id": "l1", "type": "control", "control": "loop", "condition": "i < 3", "steps": [
                    {"id": "a1", "type": "assign", "variable": "i", "expression": "i + 1"}
                ]}
            ]
        }"#;
        let def: WorkflowDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(def.steps.len(), 4);
        assert_eq!(def.step_count(), 5);
        assert!(matches!(&def.steps[1].kind, StepKind::Expect(e) if e.match_kind == MatchKind::Regex));
        def.validate().unwrap();
    }

    #[test]
    fn test_parse_yaml_definition() {
        let yaml = r"
id: flash
name: Flash registers
variables:
  mode: 3
steps:
  - id: w1
    type: modbus
    action: write
    slave_id: 1
    address: 16
    values: ['0', 'mode * 2']
  - id: r1
    type: modbus
    action: read_holding
    slave_id: 1
    address: 16
    count: 2
    variable: regs
";
        let def: WorkflowDefinition = serde_yaml::from_str(yaml).unwrap();
        def.validate().unwrap();
        assert!(matches!(&def.steps[1].kind, StepKind::Modbus(m) if m.count == 2));

        // Values are expressions, so hex literals are rejected up front
        let bad = yaml.replace("'0', 'mode * 2'", "'0x10'");
        let def: WorkflowDefinition = serde_yaml::from_str(&bad).unwrap();
        assert!(matches!(def.validate(), Err(ValidationError::InvalidExpression { .. })));
    }

    #[test]
    fn test_duplicate_and_nested_self_reference() {
        let def = WorkflowDefinition::new("w", "w")
            .step(Step::new("a", assign("x", "1")))
            .step(Step::new("a", assign("y", "2")));
        assert_eq!(def.validate(), Err(ValidationError::DuplicateStepId("a".into())));

        let def = WorkflowDefinition::new("w", "w").step(Step::new(
            "loop",
            control(ControlKind::Loop, Some("true"), vec![Step::new("loop", assign("x", "1"))]),
        ));
        assert_eq!(def.validate(), Err(ValidationError::DuplicateStepId("loop".into())));
    }

    #[test]
    fn test_break_outside_loop_rejected() {
        let def = WorkflowDefinition::new("w", "w").step(Step::new(
            "if",
            control(ControlKind::If, Some("true"), vec![Step::new("b", control(ControlKind::Break, None, vec![]))]),
        ));
        assert_eq!(def.validate(), Err(ValidationError::OutsideLoop("b".into())));

        let def = WorkflowDefinition::new("w", "w").step(Step::new(
            "l",
            control(
                ControlKind::Loop,
                Some("true"),
                vec![Step::new(
                    "if",
                    control(ControlKind::If, Some("x > 2"), vec![Step::new("b", control(ControlKind::Break, None, vec![]))]),
                )],
            ),
        ));
        assert!(def.validate().is_ok());
    }

    #[test]
    fn test_bad_expression_regex_and_missing_condition() {
        let def = WorkflowDefinition::new("w", "w").step(Step::new("a", assign("x", "1 +")));
        assert!(matches!(def.validate(), Err(ValidationError::InvalidExpression { .. })));

        let def = WorkflowDefinition::new("w", "w")
            .step(Step::new("e", StepKind::Expect(ExpectStep::regex("(unclosed", 100))));
        assert!(matches!(def.validate(), Err(ValidationError::InvalidRegex { .. })));

        let def = WorkflowDefinition::new("w", "w").step(Step::new("i", control(ControlKind::If, None, vec![])));
        assert!(matches!(def.validate(), Err(ValidationError::MissingField { field: "condition", .. })));
    }

    fn modbus(action: ModbusAction, address: u16, count: u16, values: usize) -> StepKind {
        StepKind::Modbus(ModbusStep {
            action,
            slave_id: 1,
            address,
            count,
            values: vec!["1".to_string(); values],
            variable: None,
            handle: None,
        })
    }

    #[test]
    fn test_modbus_register_limits() {
        let too_many = WorkflowDefinition::new("w", "w").step(Step::new("w1", modbus(ModbusAction::Write, 0, 1, 200)));
        assert!(matches!(too_many.validate(), Err(ValidationError::InvalidStep { ref step, .. }) if step == "w1"));

        let past_end = WorkflowDefinition::new("w", "w").step(Step::new("w2", modbus(ModbusAction::Write, 0xFFF0, 1, 17)));
        assert!(matches!(past_end.validate(), Err(ValidationError::InvalidStep { .. })));

        let read_past_end =
            WorkflowDefinition::new("w", "w").step(Step::new("r1", modbus(ModbusAction::ReadHolding, 0xFFFF, 2, 0)));
        assert!(matches!(read_past_end.validate(), Err(ValidationError::InvalidStep { .. })));

        let fits = WorkflowDefinition::new("w", "w")
            .step(Step::new("w3", modbus(ModbusAction::Write, 0xFFF0, 1, 16)))
            .step(Step::new("r2", modbus(ModbusAction::ReadInput, 0xFFFF, 1, 0)))
            .step(Step::new("w4", modbus(ModbusAction::Write, 0, 1, MAX_WRITE_REGISTERS)));
        assert!(fits.validate().is_ok());
    }

    #[test]
    fn test_unknown_step_type_fails_to_parse() {
        let json = r#"{"id": "w", "name": "w", "steps": [{"id": "x", "type": "teleport"}]}"#;
        assert!(serde_json::from_str::<WorkflowDefinition>(json).is_err());
    }

    #[test]
    fn test_from_path_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ping.toml");
        std::fs::write(
            &path,
            r#"
id = "ping"
name = "Ping"

[[steps]]
id = "s1"
type = "send"
command = "AT"

[[steps]]
id = "e1"
type = "expect"
pattern = "OK"
timeout_ms = 500
"#,
        )
        .unwrap();
        let def = WorkflowDefinition::from_path(&path).unwrap();
        assert_eq!(def.steps.len(), 2);

        let bad = dir.path().join("ping.ini");
        std::fs::write(&bad, "").unwrap();
        assert!(matches!(WorkflowDefinition::from_path(&bad), Err(WorkflowError::Load(_))));
    }
}
