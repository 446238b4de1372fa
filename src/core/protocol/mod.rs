//! Protocol implementations
//!
//! Stateless codecs on top of the transport layer:
//! - Modbus RTU register reads and writes with CRC-16 validation
//! - AT command line framing

pub mod at;
pub mod checksum;
pub mod modbus;

pub use at::{normalize as normalize_at, AtClient, AtExchange};
pub use checksum::{append_crc16, crc16_modbus, verify_crc16};
pub use modbus::{
    decode_response, encode_read_request, encode_write_request, ExceptionCode, FunctionCode,
    ModbusClient, ModbusError, ModbusReply, ReplyBody,
};
