//! CLI Exit Codes
//!
//! Standard exit codes for CLI operations and automation.

use crate::config::ConfigError;
use crate::core::protocol::ModbusError;
use crate::core::transport::TransportError;
use crate::core::workflow::{ExecutionSnapshot, ExecutionStatus, WorkflowError};
use std::process::ExitCode;

/// Exit code constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCodes;

impl ExitCodes {
    /// Success
    pub const SUCCESS: u8 = 0;

    /// General error
    pub const ERROR: u8 = 1;

    /// Invalid arguments
    pub const INVALID_ARGS: u8 = 2;

    /// Connection failed
    pub const CONNECTION_FAILED: u8 = 3;

    /// Device did not answer in time
    pub const TIMEOUT: u8 = 4;

    /// File not found
    pub const FILE_NOT_FOUND: u8 = 6;

    /// Permission denied
    pub const PERMISSION_DENIED: u8 = 7;

    /// Configuration error
    pub const CONFIG_ERROR: u8 = 8;

    /// Protocol error
    pub const PROTOCOL_ERROR: u8 = 9;

    /// User cancelled
    pub const CANCELLED: u8 = 11;

    /// No serial port found
    pub const DEVICE_NOT_FOUND: u8 = 12;

    /// Port held by another connection
    pub const DEVICE_BUSY: u8 = 13;

    /// Port not found
    pub const PORT_NOT_FOUND: u8 = 14;

    /// Workflow failed
    pub const WORKFLOW_FAILED: u8 = 15;

    /// Workflow definition rejected
    pub const VALIDATION_FAILED: u8 = 17;

    /// Internal error
    pub const INTERNAL_ERROR: u8 = 127;
}

/// CLI operation result
#[derive(Debug)]
pub enum CliResult {
    /// Success with optional message
    Success(Option<String>),

    /// Error with code and message
    Error(u8, String),
}

impl CliResult {
    /// Plain success
    pub fn success() -> Self {
        Self::Success(None)
    }

    /// Success with a message
    pub fn success_with_message(msg: impl Into<String>) -> Self {
        Self::Success(Some(msg.into()))
    }

    /// Failure with an explicit code
    pub fn error(code: u8, msg: impl Into<String>) -> Self {
        Self::Error(code, msg.into())
    }

    /// Outcome of a finished workflow run
    pub fn from_execution(snapshot: &ExecutionSnapshot) -> Self {
        let detail = snapshot.error.clone().unwrap_or_default();
        match snapshot.status {
            ExecutionStatus::Completed => Self::success_with_message(format!(
                "Workflow '{}' completed ({} steps)",
                snapshot.workflow_name, snapshot.steps_completed
            )),
            ExecutionStatus::Cancelled => Self::Error(ExitCodes::CANCELLED, detail),
            ExecutionStatus::Failed => Self::Error(ExitCodes::WORKFLOW_FAILED, detail),
            other => Self::Error(
                ExitCodes::INTERNAL_ERROR,
                format!("Execution {} ended while {other}", snapshot.id),
            ),
        }
    }

    /// Get exit code
    pub fn code(&self) -> u8 {
        match self {
            Self::Success(_) => ExitCodes::SUCCESS,
            Self::Error(code, _) => *code,
        }
    }

    /// Get message
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Success(Some(msg)) | Self::Error(_, msg) => Some(msg),
            Self::Success(None) => None,
        }
    }

    /// Convert to `ExitCode`
    pub fn to_exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }

    /// Is success?
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

impl From<std::io::Error> for CliResult {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let code = match err.kind() {
            ErrorKind::NotFound => ExitCodes::FILE_NOT_FOUND,
            ErrorKind::PermissionDenied => ExitCodes::PERMISSION_DENIED,
            ErrorKind::TimedOut => ExitCodes::TIMEOUT,
            _ => ExitCodes::ERROR,
        };

        Self::Error(code, err.to_string())
    }
}

impl From<TransportError> for CliResult {
    fn from(err: TransportError) -> Self {
        let code = match &err {
            TransportError::ConnectionFailed(_) | TransportError::NotConnected(_) => ExitCodes::CONNECTION_FAILED,
            TransportError::Timeout { .. } | TransportError::NoResponse => ExitCodes::TIMEOUT,
            TransportError::PortNotFound(_) => ExitCodes::PORT_NOT_FOUND,
            TransportError::PermissionDenied(_) => ExitCodes::PERMISSION_DENIED,
            TransportError::PortInUse(_) => ExitCodes::DEVICE_BUSY,
            TransportError::InvalidConfiguration(_) => ExitCodes::INVALID_ARGS,
            TransportError::IoError(_) => ExitCodes::ERROR,
            TransportError::WorkerUnavailable => ExitCodes::INTERNAL_ERROR,
        };
        Self::Error(code, err.to_string())
    }
}

impl From<ModbusError> for CliResult {
    fn from(err: ModbusError) -> Self {
        match err {
            ModbusError::Transport(inner) => inner.into(),
            ModbusError::InvalidRequest(_) => Self::Error(ExitCodes::INVALID_ARGS, err.to_string()),
            ModbusError::NoResponse(_) => Self::Error(ExitCodes::TIMEOUT, err.to_string()),
            ModbusError::Exception { .. } => Self::Error(ExitCodes::PROTOCOL_ERROR, err.to_string()),
        }
    }
}

impl From<WorkflowError> for CliResult {
    fn from(err: WorkflowError) -> Self {
        let code = match &err {
            WorkflowError::Validation(_) => ExitCodes::VALIDATION_FAILED,
            WorkflowError::Load(_) => ExitCodes::FILE_NOT_FOUND,
            WorkflowError::Io(_) => ExitCodes::ERROR,
            _ => ExitCodes::INTERNAL_ERROR,
        };
        Self::Error(code, err.to_string())
    }
}

impl From<ConfigError> for CliResult {
    fn from(err: ConfigError) -> Self {
        Self::Error(ExitCodes::CONFIG_ERROR, err.to_string())
    }
}

/// Exit code description
pub fn exit_code_description(code: u8) -> &'static str {
    match code {
        0 => "Success",
        1 => "General error",
        2 => "Invalid arguments",
        3 => "Connection failed",
        4 => "Device timeout",
        6 => "File not found",
        7 => "Permission denied",
        8 => "Configuration error",
        9 => "Protocol error",
        11 => "Operation cancelled",
        12 => "Device not found",
        13 => "Device busy",
        14 => "Port not found",
        15 => "Workflow failed",
        17 => "Validation failed",
        127 => "Internal error",
        _ => "Unknown error",
    }
}

/// Print exit code table
pub fn print_exit_codes() {
    println!("Exit Codes:");
    for code in [0, 1, 2, 3, 4, 6, 7, 8, 9, 11, 12, 13, 14, 15, 17, 127] {
        println!("  {:>3}  {}", code, exit_code_description(code));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_result() {
        let success = CliResult::success();
        assert!(success.is_success());
        assert_eq!(success.code(), 0);

        let error = CliResult::error(3, "Connection failed");
        assert!(!error.is_success());
        assert_eq!(error.code(), 3);
        assert_eq!(error.message(), Some("Connection failed"));
    }

    #[test]
    fn test_from_io_error() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let result = CliResult::from(err);
        assert_eq!(result.code(), ExitCodes::FILE_NOT_FOUND);
    }

    #[test]
    fn test_transport_errors_map_to_codes() {
        assert_eq!(
            CliResult::from(TransportError::PortNotFound("/dev/ttyUSB9".into())).code(),
            ExitCodes::PORT_NOT_FOUND
        );
        assert_eq!(CliResult::from(TransportError::NoResponse).code(), ExitCodes::TIMEOUT);
        assert_eq!(
            CliResult::from(ModbusError::Transport(TransportError::PortInUse("COM3".into()))).code(),
            ExitCodes::DEVICE_BUSY
        );
        assert_eq!(CliResult::from(ModbusError::NoResponse(1)).code(), ExitCodes::TIMEOUT);
    }

    #[test]
    fn test_every_listed_code_has_a_description() {
        for code in [0, 1, 2, 3, 4, 6, 7, 8, 9, 11, 12, 13, 14, 15, 17, 127] {
            assert_ne!(exit_code_description(code), "Unknown error");
        }
        assert_eq!(exit_code_description(200), "Unknown error");
    }
}
