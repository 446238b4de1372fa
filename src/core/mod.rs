//! Core module containing the main functionality of Rigcon
//!
//! This module provides:
//! - Transport layer for serial connections
//! - Protocol codecs (Modbus RTU, AT commands)
//! - Virtual device simulation
//! - Variables and expression evaluation
//! - Workflow engine and execution registry

pub mod protocol;
pub mod simulator;
pub mod transport;
pub mod variables;
pub mod workflow;
