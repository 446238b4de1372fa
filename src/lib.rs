//! # Rigcon Core Library
//!
//! Serial device control for bench and production-line work:
//! - Serial ports (RS-232, RS-485, USB-Serial adapters) behind a shared
//!   connection registry with a blocking I/O worker pool
//! - Modbus RTU register reads and writes
//! - AT command exchanges
//! - Workflow automation with variables, expressions, operator
//!   confirmations and pause/resume/cancel
//!
//! ## Example
//!
//! ```rust,no_run
//! use rigcon_core::core::transport::{SerialConfig, Transport, TransportSettings};
//! use rigcon_core::core::workflow::{
//!     EngineSettings, ExecutionRegistry, RegistrySettings, StartRequest, WorkflowDefinition,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let transport = Transport::new(TransportSettings::default())?;
//!     let handle = transport.connect(SerialConfig::new("/dev/ttyUSB0", 115200)).await?;
//!
//!     let registry = ExecutionRegistry::new(transport, EngineSettings::default(), RegistrySettings::default());
//!     let workflow = WorkflowDefinition::from_path(std::path::Path::new("commissioning.yaml"))?;
//!     let id = registry.start_execution(workflow, StartRequest::default().handle(handle))?;
//!
//!     let result = registry.wait(&id).await?;
//!     println!("{}: {}", result.workflow_name, result.status);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod core;

// Re-exports for convenience
pub use crate::cli::{CliResult, ExitCodes};
pub use crate::config::AppConfig;
pub use crate::core::protocol::{AtClient, ModbusClient};
pub use crate::core::transport::{ConnectionHandle, SerialConfig, Transport, TransportError};
pub use crate::core::variables::{Value, VariableContext};
pub use crate::core::workflow::{
    ExecutionRegistry, ExecutionSnapshot, ExecutionStatus, StartRequest, WorkflowDefinition, WorkflowError,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
