//! Modbus RTU codec and client
//!
//! Frames are `slave | function | big-endian fields | CRC16 (little-endian)`.
//! Decoding never raises on bad input: short frames, CRC mismatches and
//! replies from the wrong slave are logged and reported as "no response".

use super::checksum;
use crate::core::transport::{ConnectionHandle, ReadSpec, Transport, TransportError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Largest register count a single read may request
pub const MAX_READ_REGISTERS: u16 = 125;

/// Largest register count a single write may carry
pub const MAX_WRITE_REGISTERS: usize = 123;

/// Modbus function codes used by the RTU codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum FunctionCode {
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers (0x04)
    ReadInputRegisters = 0x04,
    /// Write Single Register (0x06)
    WriteSingleRegister = 0x06,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
}

impl FunctionCode {
    /// Get function code from u8
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0x03 => Some(Self::ReadHoldingRegisters),
            0x04 => Some(Self::ReadInputRegisters),
            0x06 => Some(Self::WriteSingleRegister),
            0x10 => Some(Self::WriteMultipleRegisters),
            _ => None,
        }
    }

    /// Whether this function reads registers
    pub fn is_read(self) -> bool {
        matches!(self, Self::ReadHoldingRegisters | Self::ReadInputRegisters)
    }

    /// Get name of function code
    pub fn name(self) -> &'static str {
        match self {
            Self::ReadHoldingRegisters => "Read Holding Registers",
            Self::ReadInputRegisters => "Read Input Registers",
            Self::WriteSingleRegister => "Write Single Register",
            Self::WriteMultipleRegisters => "Write Multiple Registers",
        }
    }
}

/// Modbus exception codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    SlaveDeviceFailure = 0x04,
    Acknowledge = 0x05,
    SlaveDeviceBusy = 0x06,
    MemoryParityError = 0x08,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetDeviceFailedToRespond = 0x0B,
}

impl ExceptionCode {
    /// Get exception from u8
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::IllegalFunction),
            0x02 => Some(Self::IllegalDataAddress),
            0x03 => Some(Self::IllegalDataValue),
            0x04 => Some(Self::SlaveDeviceFailure),
            0x05 => Some(Self::Acknowledge),
            0x06 => Some(Self::SlaveDeviceBusy),
            0x08 => Some(Self::MemoryParityError),
            0x0A => Some(Self::GatewayPathUnavailable),
            0x0B => Some(Self::GatewayTargetDeviceFailedToRespond),
            _ => None,
        }
    }

    /// Get name of exception
    pub fn name(self) -> &'static str {
        match self {
            Self::IllegalFunction => "Illegal Function",
            Self::IllegalDataAddress => "Illegal Data Address",
            Self::IllegalDataValue => "Illegal Data Value",
            Self::SlaveDeviceFailure => "Slave Device Failure",
            Self::Acknowledge => "Acknowledge",
            Self::SlaveDeviceBusy => "Slave Device Busy",
            Self::MemoryParityError => "Memory Parity Error",
            Self::GatewayPathUnavailable => "Gateway Path Unavailable",
            Self::GatewayTargetDeviceFailedToRespond => "Gateway Target Failed to Respond",
        }
    }
}

/// Name for a raw exception byte, including codes outside the standard set
pub fn exception_name(code: u8) -> &'static str {
    ExceptionCode::from_u8(code).map_or("Unknown Exception", ExceptionCode::name)
}

/// Decoded reply body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplyBody {
    /// Register values of a read reply
    Registers { values: Vec<u16> },
    /// Echo of a single-register write
    WroteRegister { address: u16, value: u16 },
    /// Echo of a multi-register write
    WroteRegisters { address: u16, count: u16 },
    /// Device exception reply
    Exception { code: u8 },
}

/// One validated reply frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModbusReply {
    /// Responding slave
    pub slave_id: u8,
    /// Function code with the exception bit cleared
    pub function: u8,
    /// Decoded payload
    pub body: ReplyBody,
}

impl ModbusReply {
    /// Register values, if this is a read reply
    pub fn registers(&self) -> Option<&[u16]> {
        match &self.body {
            ReplyBody::Registers { values } => Some(values),
            _ => None,
        }
    }

    /// Exception code, if the device refused the request
    pub fn exception(&self) -> Option<u8> {
        match self.body {
            ReplyBody::Exception { code } => Some(code),
            _ => None,
        }
    }
}

/// Modbus error types
#[derive(Error, Debug)]
pub enum ModbusError {
    /// Request cannot be encoded
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Reply missing, corrupt, or from another slave
    #[error("No valid response from slave {0}")]
    NoResponse(u8),

    /// Device answered with an exception
    #[error("Slave {slave_id} exception 0x{code:02X} ({name}) for function 0x{function:02X}")]
    Exception {
        /// Responding slave
        slave_id: u8,
        /// Function that failed
        function: u8,
        /// Exception code
        code: u8,
        /// Exception name
        name: &'static str,
    },

    /// Transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),
}

// ============ RTU Encoding/Decoding ============

/// Build a register read request
pub fn encode_read_request(
    slave_id: u8,
    start_address: u16,
    count: u16,
    function: FunctionCode,
) -> Result<Vec<u8>, ModbusError> {
    if !function.is_read() {
        return Err(ModbusError::InvalidRequest(format!(
            "{} is not a read function",
            function.name()
        )));
    }
    if count == 0 || count > MAX_READ_REGISTERS {
        return Err(ModbusError::InvalidRequest(format!(
            "register count {count} outside 1..={MAX_READ_REGISTERS}"
        )));
    }

    let mut frame = Vec::with_capacity(8);
    frame.push(slave_id);
    frame.push(function as u8);
    frame.extend_from_slice(&start_address.to_be_bytes());
    frame.extend_from_slice(&count.to_be_bytes());
    checksum::append_crc16(&mut frame);
    Ok(frame)
}

/// Build a write request: Write Single Register for one value, Write
/// Multiple Registers otherwise
pub fn encode_write_request(slave_id: u8, start_address: u16, values: &[u16]) -> Result<Vec<u8>, ModbusError> {
    let mut frame = match values {
        [] => return Err(ModbusError::InvalidRequest("no values to write".into())),
        [value] => {
            let mut frame = Vec::with_capacity(8);
            frame.push(slave_id);
            frame.push(FunctionCode::WriteSingleRegister as u8);
            frame.extend_from_slice(&start_address.to_be_bytes());
            frame.extend_from_slice(&value.to_be_bytes());
            frame
        }
        _ if values.len() > MAX_WRITE_REGISTERS => {
            return Err(ModbusError::InvalidRequest(format!(
                "{} values exceed the {MAX_WRITE_REGISTERS}-register write limit",
                values.len()
            )))
        }
        _ => {
            let mut frame = Vec::with_capacity(9 + values.len() * 2);
            frame.push(slave_id);
            frame.push(FunctionCode::WriteMultipleRegisters as u8);
            frame.extend_from_slice(&start_address.to_be_bytes());
            // Bounded by MAX_WRITE_REGISTERS above
            frame.extend_from_slice(&(values.len() as u16).to_be_bytes());
            frame.push((values.len() * 2) as u8);
            for value in values {
                frame.extend_from_slice(&value.to_be_bytes());
            }
            frame
        }
    };
    checksum::append_crc16(&mut frame);
    Ok(frame)
}

/// Validate and decode a reply frame.
///
/// Returns `None` for short frames, CRC mismatches, a foreign slave id, or a
/// body that does not fit its function code.
pub fn decode_response(data: &[u8], expected_slave_id: u8) -> Option<ModbusReply> {
    if data.len() < 5 {
        warn!("Modbus reply too short ({} bytes)", data.len());
        return None;
    }

    if let Err((received, calculated)) = checksum::verify_crc16(data) {
        warn!(
            "Modbus CRC mismatch: received 0x{:04X}, calculated 0x{:04X}",
            received, calculated
        );
        return None;
    }

    let slave_id = data[0];
    if slave_id != expected_slave_id {
        warn!("Modbus reply from slave {}, expected {}", slave_id, expected_slave_id);
        return None;
    }

    let function_code = data[1];
    let body = &data[2..data.len() - 2];

    // Exception response (bit 7 set)
    if function_code & 0x80 != 0 {
        return Some(ModbusReply {
            slave_id,
            function: function_code & 0x7F,
            body: ReplyBody::Exception { code: body[0] },
        });
    }

    let body = match FunctionCode::from_u8(function_code) {
        Some(FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters) => {
            let byte_count = usize::from(body[0]);
            if byte_count % 2 != 0 || body.len() != 1 + byte_count {
                warn!("Modbus read reply byte count {} does not match frame", byte_count);
                return None;
            }
            ReplyBody::Registers {
                values: body[1..]
                    .chunks_exact(2)
                    .map(|w| u16::from_be_bytes([w[0], w[1]]))
                    .collect(),
            }
        }
        Some(FunctionCode::WriteSingleRegister) if body.len() == 4 => ReplyBody::WroteRegister {
            address: u16::from_be_bytes([body[0], body[1]]),
            value: u16::from_be_bytes([body[2], body[3]]),
        },
        Some(FunctionCode::WriteMultipleRegisters) if body.len() == 4 => ReplyBody::WroteRegisters {
            address: u16::from_be_bytes([body[0], body[1]]),
            count: u16::from_be_bytes([body[2], body[3]]),
        },
        _ => {
            warn!("Unexpected Modbus reply for function 0x{:02X}", function_code);
            return None;
        }
    };

    Some(ModbusReply {
        slave_id,
        function: function_code,
        body,
    })
}

/// Expected length of the reply to `request`, from its first three bytes.
///
/// Exception replies are always 5 bytes.
fn reply_length(head: &[u8]) -> usize {
    if head.len() < 3 || head[1] & 0x80 != 0 {
        return 5;
    }
    match FunctionCode::from_u8(head[1]) {
        Some(FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters) => 5 + usize::from(head[2]),
        _ => 8,
    }
}

/// Request/response client over a [`Transport`] connection
#[derive(Clone)]
pub struct ModbusClient {
    transport: Transport,
    timeout: Duration,
}

impl ModbusClient {
    /// Create a client with a per-exchange timeout
    pub fn new(transport: Transport, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    /// Per-exchange timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Read `count` registers starting at `start_address`
    pub async fn read_registers(
        &self,
        handle: ConnectionHandle,
        slave_id: u8,
        start_address: u16,
        count: u16,
        function: FunctionCode,
    ) -> Result<Vec<u16>, ModbusError> {
        let request = encode_read_request(slave_id, start_address, count, function)?;
        let reply = self.exchange(handle, slave_id, &request).await?;
        match reply.body {
            ReplyBody::Registers { values } if values.len() == usize::from(count) => Ok(values),
            ReplyBody::Registers { values } => {
                warn!("Requested {} registers, slave {} returned {}", count, slave_id, values.len());
                Err(ModbusError::NoResponse(slave_id))
            }
            _ => Err(ModbusError::NoResponse(slave_id)),
        }
    }

    /// Write one register (function 0x06)
    pub async fn write_register(
        &self,
        handle: ConnectionHandle,
        slave_id: u8,
        address: u16,
        value: u16,
    ) -> Result<(), ModbusError> {
        self.write_registers(handle, slave_id, address, &[value]).await
    }

    /// Write registers starting at `start_address`
    pub async fn write_registers(
        &self,
        handle: ConnectionHandle,
        slave_id: u8,
        start_address: u16,
        values: &[u16],
    ) -> Result<(), ModbusError> {
        let request = encode_write_request(slave_id, start_address, values)?;
        match self.exchange(handle, slave_id, &request).await?.body {
            ReplyBody::WroteRegister { address, .. } | ReplyBody::WroteRegisters { address, .. }
                if address == start_address =>
            {
                Ok(())
            }
            _ => Err(ModbusError::NoResponse(slave_id)),
        }
    }

    async fn exchange(
        &self,
        handle: ConnectionHandle,
        slave_id: u8,
        request: &[u8],
    ) -> Result<ModbusReply, ModbusError> {
        let spec = ReadSpec::Framed {
            header: 3,
            total_len: reply_length,
        };
        let raw = match self
            .transport
            .write_then_read(handle, request, spec, self.timeout, None)
            .await
        {
            Ok(raw) => raw,
            Err(TransportError::Timeout { expected, received }) => {
                debug!("Slave {} timed out ({}/{} bytes)", slave_id, received, expected);
                return Err(ModbusError::NoResponse(slave_id));
            }
            Err(e) => return Err(e.into()),
        };

        let reply = decode_response(&raw, slave_id).ok_or(ModbusError::NoResponse(slave_id))?;
        if let Some(code) = reply.exception() {
            return Err(ModbusError::Exception {
                slave_id,
                function: reply.function,
                code,
                name: exception_name(code),
            });
        }
        Ok(reply)
    }
}
